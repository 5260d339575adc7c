//! Core protocol types: hashes, transactions, headers and blocks.
//!
//! Everything here serializes with the Bitcoin consensus codec from
//! [`crate::encoding`]. Transaction ids and header hashes are double
//! SHA-256 of that encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{HEADER_SIZE, LOCKTIME_THRESHOLD, SEQUENCE_FINAL, WITNESS_SCALE_FACTOR};
use crate::crypto::sha256d;
use crate::encoding::{Decoder, Encoder};
use crate::error::DecodeError;

/// A 32-byte hash value in internal (little-endian) byte order.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used for coinbase previous outpoints and the genesis parent.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse the conventional byte-reversed hex display form.
    pub fn from_display_hex(s: &str) -> Result<Self, DecodeError> {
        let bytes = hex::decode(s).map_err(|_| DecodeError::InvalidData("hash hex"))?;
        let mut out: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DecodeError::InvalidData("hash length"))?;
        out.reverse();
        Ok(Self(out))
    }
}

/// Displays in the conventional byte-reversed order, like block explorers.
impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    /// The null outpoint carried by coinbase inputs.
    pub fn null() -> Self {
        Self { txid: Hash256::ZERO, vout: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prev_out: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub pk_script: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Coinbase: exactly one input spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_out.is_null()
    }

    pub fn encode_into(&self, enc: &mut Encoder) {
        enc.write_i32_le(self.version);
        enc.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            enc.write_hash(&input.prev_out.txid);
            enc.write_u32_le(input.prev_out.vout);
            enc.write_var_bytes(&input.script_sig);
            enc.write_u32_le(input.sequence);
        }
        enc.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            enc.write_u64_le(output.value);
            enc.write_var_bytes(&output.pk_script);
        }
        enc.write_u32_le(self.lock_time);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.into_inner()
    }

    pub fn decode_from(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = dec.read_i32_le()?;
        // Each input needs at least 41 bytes, which bounds the count.
        let n_in = dec.read_len()?;
        let mut inputs = Vec::with_capacity(n_in.min(dec.remaining() / 41));
        for _ in 0..n_in {
            let txid = dec.read_hash()?;
            let vout = dec.read_u32_le()?;
            let script_sig = dec.read_var_bytes()?;
            let sequence = dec.read_u32_le()?;
            inputs.push(TxIn { prev_out: OutPoint { txid, vout }, script_sig, sequence });
        }
        let n_out = dec.read_len()?;
        let mut outputs = Vec::with_capacity(n_out.min(dec.remaining() / 9));
        for _ in 0..n_out {
            let value = dec.read_u64_le()?;
            let pk_script = dec.read_var_bytes()?;
            outputs.push(TxOut { value, pk_script });
        }
        let lock_time = dec.read_u32_le()?;
        Ok(Self { version, inputs, outputs, lock_time })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let tx = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(tx)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode())
    }

    pub fn serialized_size(&self) -> usize {
        self.encode().len()
    }

    /// Lock-time finality at the given height and block time.
    pub fn is_final(&self, height: u32, block_time: u32) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let limit = if self.lock_time < LOCKTIME_THRESHOLD { height } else { block_time };
        if self.lock_time < limit {
            return true;
        }
        self.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
    }
}

/// 80-byte block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut enc = Encoder::with_capacity(HEADER_SIZE);
        self.encode_into(&mut enc);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&enc.into_inner());
        out
    }

    pub fn encode_into(&self, enc: &mut Encoder) {
        enc.write_i32_le(self.version);
        enc.write_hash(&self.prev_hash);
        enc.write_hash(&self.merkle_root);
        enc.write_u32_le(self.time);
        enc.write_u32_le(self.bits);
        enc.write_u32_le(self.nonce);
    }

    pub fn decode_from(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: dec.read_i32_le()?,
            prev_hash: dec.read_hash()?,
            merkle_root: dec.read_hash()?,
            time: dec.read_u32_le()?,
            bits: dec.read_u32_le()?,
            nonce: dec.read_u32_le()?,
        })
    }

    /// Decode exactly [`HEADER_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let header = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(header)
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.encode())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.header.encode_into(&mut enc);
        enc.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut enc);
        }
        enc.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut dec)?;
        let count = dec.read_len()?;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::decode_from(&mut dec)?);
        }
        dec.finish()?;
        Ok(Self { header, transactions })
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    pub fn serialized_size(&self) -> usize {
        self.encode().len()
    }

    /// Block weight. Witness data is not modelled, so every byte counts fully.
    pub fn weight(&self) -> u64 {
        self.serialized_size() as u64 * WITNESS_SCALE_FACTOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prev_out: OutPoint { txid: Hash256([7; 32]), vout: 3 },
                script_sig: vec![0x51, 0x52],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut { value: 5_000, pk_script: vec![0x76, 0xa9] }],
            lock_time: 0,
        }
    }

    // --- Hash256 ---

    #[test]
    fn hash_display_is_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let h = Hash256(bytes);
        assert!(h.to_string().ends_with("ab"));
        assert_eq!(Hash256::from_display_hex(&h.to_string()).unwrap(), h);
    }

    #[test]
    fn hash_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256([1; 32]).is_zero());
    }

    // --- Transaction ---

    #[test]
    fn tx_codec_is_stable() {
        let tx = sample_tx();
        let bytes = tx.encode();
        assert_eq!(bytes.len(), 4 + 1 + 32 + 4 + 1 + 2 + 4 + 1 + 8 + 1 + 2 + 4);
        assert_eq!(Transaction::decode(&bytes).unwrap(), tx);
        assert_eq!(tx.txid(), sha256d(&bytes));
    }

    #[test]
    fn tx_decode_rejects_trailing() {
        let mut bytes = sample_tx().encode();
        bytes.push(0);
        assert_eq!(Transaction::decode(&bytes), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.inputs[0].prev_out = OutPoint::null();
        assert!(tx.is_coinbase());
    }

    #[test]
    fn finality_by_height_and_sequence() {
        let mut tx = sample_tx();
        tx.lock_time = 100;
        tx.inputs[0].sequence = 0;
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));
        tx.inputs[0].sequence = SEQUENCE_FINAL;
        assert!(tx.is_final(50, 0));
    }

    #[test]
    fn finality_by_time() {
        let mut tx = sample_tx();
        tx.lock_time = LOCKTIME_THRESHOLD + 10;
        tx.inputs[0].sequence = 0;
        assert!(!tx.is_final(1_000_000, LOCKTIME_THRESHOLD + 10));
        assert!(tx.is_final(0, LOCKTIME_THRESHOLD + 11));
    }

    // --- Header / Block ---

    #[test]
    fn header_is_80_bytes() {
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256([1; 32]),
            merkle_root: Hash256([2; 32]),
            time: 3,
            bits: 4,
            nonce: 5,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(BlockHeader::decode(&bytes).unwrap(), header);
        assert!(BlockHeader::decode(&bytes[..79]).is_err());
    }

    #[test]
    fn block_weight_scales_size() {
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![sample_tx()],
        };
        let raw = block.encode();
        assert_eq!(Block::decode(&raw).unwrap(), block);
        assert_eq!(block.weight(), raw.len() as u64 * WITNESS_SCALE_FACTOR);
        assert!(block.coinbase().is_none());
    }
}
