//! Bit-stable record encodings for the unspent-output and UPKH indexes.
//!
//! Both indexes are keyed by the first [`UTXO_IDX_LEN`] bytes of a 32-byte
//! hash; the remaining bytes live at the front of the payload so a lookup can
//! confirm the full hash.
//!
//! UTXO payload (map form):
//!
//! ```text
//! txid[8..32] | varint(height << 1 | coinbase) | varint(out_count)
//!     { varint(vout) varint(value) varint(script_len) script }*
//! ```
//!
//! Only live outputs are listed; `out_count` keeps the original output count
//! so spent positions stay addressable as holes. The full form used in undo
//! logs carries all 32 txid bytes instead of the 24-byte tail.
//!
//! UPKH payload (map form): `pkh[8..32] | long_term_hash[20] | height:u32le`.

use crate::constants::UTXO_IDX_LEN;
use crate::encoding::{Decoder, Encoder, varint_size};
use crate::error::DecodeError;
use crate::script::is_unspendable;
use crate::types::Hash256;

/// No transaction fitting in a block can have more outputs than this.
const MAX_OUT_COUNT: usize = 1 << 20;

/// Fixed-size index key: the leading bytes of a txid or key hash.
pub type IndexKey = [u8; UTXO_IDX_LEN];

pub fn index_key(hash: &Hash256) -> IndexKey {
    let mut key = [0u8; UTXO_IDX_LEN];
    key.copy_from_slice(&hash.0[..UTXO_IDX_LEN]);
    key
}

fn join_hash(key: &IndexKey, tail: &[u8]) -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[..UTXO_IDX_LEN].copy_from_slice(key);
    bytes[UTXO_IDX_LEN..].copy_from_slice(tail);
    Hash256(bytes)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoOut {
    pub value: u64,
    pub pk_script: Vec<u8>,
}

/// All outputs of one transaction still tracked by the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoRecord {
    pub txid: Hash256,
    pub coinbase: bool,
    pub height: u32,
    /// One slot per original output; `None` marks a spent (or never tracked) output.
    pub outs: Vec<Option<UtxoOut>>,
}

/// A single unspent output resolved from the index, with the context the
/// validator needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoOutput {
    pub value: u64,
    pub pk_script: Vec<u8>,
    pub height: u32,
    pub coinbase: bool,
    /// Number of output slots in the owning record.
    pub vout_count: u32,
}

impl UtxoRecord {
    /// Empty record with `out_count` holes.
    pub fn with_holes(txid: Hash256, coinbase: bool, height: u32, out_count: usize) -> Self {
        Self { txid, coinbase, height, outs: vec![None; out_count] }
    }

    pub fn key(&self) -> IndexKey {
        index_key(&self.txid)
    }

    pub fn live_outputs(&self) -> impl Iterator<Item = (u32, &UtxoOut)> {
        self.outs
            .iter()
            .enumerate()
            .filter_map(|(vout, out)| out.as_ref().map(|o| (vout as u32, o)))
    }

    pub fn is_empty(&self) -> bool {
        self.outs.iter().all(Option::is_none)
    }

    /// Serialize the record. Returns `None` when no output is live; such a
    /// record must not be stored.
    pub fn serialize(&self, full: bool) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        let mut enc = Encoder::with_capacity(self.serialized_len(full));
        if full {
            enc.write_hash(&self.txid);
        } else {
            enc.write_bytes(&self.txid.0[UTXO_IDX_LEN..]);
        }
        enc.write_varint(packed_height(self.height, self.coinbase));
        enc.write_varint(self.outs.len() as u64);
        for (vout, out) in self.live_outputs() {
            enc.write_varint(u64::from(vout));
            enc.write_varint(out.value);
            enc.write_var_bytes(&out.pk_script);
        }
        Some(enc.into_inner())
    }

    fn serialized_len(&self, full: bool) -> usize {
        let mut len = if full { 32 } else { 32 - UTXO_IDX_LEN };
        len += varint_size(packed_height(self.height, self.coinbase));
        len += varint_size(self.outs.len() as u64);
        for (vout, out) in self.live_outputs() {
            len += varint_size(u64::from(vout)) + varint_size(out.value);
            len += varint_size(out.pk_script.len() as u64) + out.pk_script.len();
        }
        len
    }

    /// Decode a map entry.
    pub fn from_map_entry(key: &IndexKey, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(payload);
        let txid = join_hash(key, dec.read_slice(32 - UTXO_IDX_LEN)?);
        Self::decode_body(txid, &mut dec)
    }

    /// Decode the full (undo log) form.
    pub fn from_full(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let txid = dec.read_hash()?;
        Self::decode_body(txid, &mut dec)
    }

    fn decode_body(txid: Hash256, dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let (height, coinbase) = unpack_height(dec.read_varint()?)?;
        let out_count = dec.read_varint()?;
        let out_count = usize::try_from(out_count)
            .ok()
            .filter(|n| *n <= MAX_OUT_COUNT)
            .ok_or(DecodeError::SizeTooLarge)?;
        let mut outs: Vec<Option<UtxoOut>> = Vec::new();
        let mut next = 0usize;
        while !dec.is_empty() {
            let vout = usize::try_from(dec.read_varint()?).map_err(|_| DecodeError::SizeTooLarge)?;
            if vout < next || vout >= out_count {
                return Err(DecodeError::InvalidData("vout out of order"));
            }
            let value = dec.read_varint()?;
            let pk_script = dec.read_var_bytes()?;
            outs.resize(vout, None);
            outs.push(Some(UtxoOut { value, pk_script }));
            next = vout + 1;
        }
        outs.resize(out_count, None);
        Ok(Self { txid, coinbase, height, outs })
    }

    /// Resolve one output straight from a map entry. Returns `None` when the
    /// stored txid tail does not match, the vout is spent or the entry is
    /// corrupt.
    pub fn output_from_map_entry(txid: &Hash256, payload: &[u8], vout: u32) -> Option<UtxoOutput> {
        let mut dec = Decoder::new(payload);
        if dec.read_slice(32 - UTXO_IDX_LEN).ok()? != &txid.0[UTXO_IDX_LEN..] {
            return None;
        }
        let (height, coinbase) = unpack_height(dec.read_varint().ok()?).ok()?;
        let vout_count = u32::try_from(dec.read_varint().ok()?).ok()?;
        while !dec.is_empty() {
            let this = dec.read_varint().ok()?;
            let value = dec.read_varint().ok()?;
            if this == u64::from(vout) {
                let pk_script = dec.read_var_bytes().ok()?;
                return Some(UtxoOutput { value, pk_script, height, coinbase, vout_count });
            }
            let skip = dec.read_len().ok()?;
            dec.read_slice(skip).ok()?;
            if this > u64::from(vout) {
                return None;
            }
        }
        None
    }

    /// Fill holes in `self` from `other`, which must describe the same txid.
    pub fn merge_from(&mut self, other: &UtxoRecord) {
        if self.outs.len() < other.outs.len() {
            self.outs.resize(other.outs.len(), None);
        }
        for (slot, theirs) in self.outs.iter_mut().zip(&other.outs) {
            if slot.is_none() {
                slot.clone_from(theirs);
            }
        }
    }
}

fn packed_height(height: u32, coinbase: bool) -> u64 {
    (u64::from(height) << 1) | u64::from(coinbase)
}

fn unpack_height(packed: u64) -> Result<(u32, bool), DecodeError> {
    let height = u32::try_from(packed >> 1).map_err(|_| DecodeError::InvalidData("height"))?;
    Ok((height, packed & 1 == 1))
}

/// Statistics over one map payload without materialising the record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSummary {
    pub outputs: u64,
    pub value: u64,
    pub unspendable_outputs: u64,
    pub unspendable_bytes: u64,
    pub spendable_outputs: u64,
    pub coinbase: bool,
}

impl PayloadSummary {
    pub fn of(key: &IndexKey, payload: &[u8]) -> Result<Self, DecodeError> {
        let rec = UtxoRecord::from_map_entry(key, payload)?;
        let mut s = Self { coinbase: rec.coinbase, ..Self::default() };
        for (_, out) in rec.live_outputs() {
            s.outputs += 1;
            s.value = s.value.saturating_add(out.value);
            if is_unspendable(&out.pk_script) {
                s.unspendable_outputs += 1;
                s.unspendable_bytes += out.pk_script.len() as u64;
            } else {
                s.spendable_outputs += 1;
            }
        }
        Ok(s)
    }
}

/// Forward commitment of the long-term signature scheme: an advertised key
/// hash that a future spend may consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpkhRecord {
    pub pkh: Hash256,
    pub long_term_hash: [u8; 20],
    pub height: u32,
}

impl UpkhRecord {
    pub const MAP_PAYLOAD_LEN: usize = 32 - UTXO_IDX_LEN + 20 + 4;
    pub const FULL_LEN: usize = 32 + 20 + 4;

    pub fn key(&self) -> IndexKey {
        index_key(&self.pkh)
    }

    pub fn map_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::MAP_PAYLOAD_LEN);
        out.extend_from_slice(&self.pkh.0[UTXO_IDX_LEN..]);
        out.extend_from_slice(&self.long_term_hash);
        out.extend_from_slice(&self.height.to_le_bytes());
        out
    }

    pub fn to_full_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FULL_LEN);
        out.extend_from_slice(self.pkh.as_bytes());
        out.extend_from_slice(&self.long_term_hash);
        out.extend_from_slice(&self.height.to_le_bytes());
        out
    }

    pub fn from_map_entry(key: &IndexKey, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(payload);
        let pkh = join_hash(key, dec.read_slice(32 - UTXO_IDX_LEN)?);
        Self::decode_body(pkh, &mut dec)
    }

    pub fn from_full_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let pkh = dec.read_hash()?;
        Self::decode_body(pkh, &mut dec)
    }

    fn decode_body(pkh: Hash256, dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let long_term_hash = dec.read_fixed::<20>()?;
        let height = dec.read_u32_le()?;
        dec.finish()?;
        Ok(Self { pkh, long_term_hash, height })
    }
}
