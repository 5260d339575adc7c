//! Per-block change sets handed from validation to the storage engine.

use std::collections::HashMap;

use crate::encoding::{Decoder, Encoder};
use crate::error::DecodeError;
use crate::records::{UpkhRecord, UtxoRecord};
use crate::types::Hash256;

/// Pre-image of one UPKH mutation made while processing an input: the
/// advertisement it consumed (if any) and the child hashes it added.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpkhUndoRecord {
    pub deleted: Option<UpkhRecord>,
    pub added: Vec<Hash256>,
}

impl UpkhUndoRecord {
    /// `varint(deleted_len) deleted_full varint(added_count) added*32`
    pub fn encode_into(&self, enc: &mut Encoder) {
        match &self.deleted {
            Some(rec) => enc.write_var_bytes(&rec.to_full_bytes()),
            None => enc.write_varint(0),
        }
        enc.write_varint(self.added.len() as u64);
        for pkh in &self.added {
            enc.write_hash(pkh);
        }
    }

    pub fn decode_from(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let deleted = match dec.read_var_slice()? {
            [] => None,
            bytes => Some(UpkhRecord::from_full_bytes(bytes)?),
        };
        let count = dec.read_varint()?;
        let count = usize::try_from(count)
            .ok()
            .filter(|n| n.saturating_mul(32) <= dec.remaining())
            .ok_or(DecodeError::SizeTooLarge)?;
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            added.push(dec.read_hash()?);
        }
        Ok(Self { deleted, added })
    }
}

/// Everything a validated block does to the indexes.
///
/// Undo pre-images are only collected when the block is within the unwind
/// window of the best known height; otherwise `undo` and `undo_upkh` are
/// `None` and no undo log is written.
#[derive(Clone, Debug, Default)]
pub struct BlockChanges {
    pub height: u32,
    pub last_known_height: u32,
    /// New records, one per transaction with at least one output left unspent
    /// inside the block.
    pub add_list: Vec<UtxoRecord>,
    /// Spent-output masks for committed records, indexed by vout.
    pub deleted: HashMap<Hash256, Vec<bool>>,
    /// Pre-images of the spent committed outputs, keyed by txid.
    pub undo: Option<HashMap<Hash256, UtxoRecord>>,
    pub add_upkh: Vec<UpkhRecord>,
    pub delete_upkh: Vec<Hash256>,
    pub undo_upkh: Option<Vec<UpkhUndoRecord>>,
}

impl BlockChanges {
    pub fn new(height: u32, last_known_height: u32, unwind_len: u32) -> Self {
        let undo = height.saturating_add(unwind_len) >= last_known_height;
        Self {
            height,
            last_known_height,
            undo: undo.then(HashMap::new),
            undo_upkh: undo.then(Vec::new),
            ..Self::default()
        }
    }

    pub fn keeps_undo(&self) -> bool {
        self.undo.is_some()
    }

    /// Number of committed outputs this block spends.
    pub fn spent_outputs(&self) -> usize {
        self.deleted.values().map(|mask| mask.iter().filter(|s| **s).count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_window() {
        assert!(BlockChanges::new(100, 300, 256).keeps_undo());
        assert!(BlockChanges::new(100, 356, 256).keeps_undo());
        assert!(!BlockChanges::new(100, 357, 256).keeps_undo());
    }

    #[test]
    fn upkh_undo_codec() {
        let rec = UpkhUndoRecord {
            deleted: Some(UpkhRecord { pkh: Hash256([1; 32]), long_term_hash: [2; 20], height: 9 }),
            added: vec![Hash256([3; 32]), Hash256([4; 32])],
        };
        let empty = UpkhUndoRecord::default();
        let mut enc = Encoder::new();
        rec.encode_into(&mut enc);
        empty.encode_into(&mut enc);
        let bytes = enc.into_inner();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(UpkhUndoRecord::decode_from(&mut dec).unwrap(), rec);
        assert_eq!(UpkhUndoRecord::decode_from(&mut dec).unwrap(), empty);
        assert!(dec.finish().is_ok());
    }

    #[test]
    fn truncated_upkh_undo_rejected() {
        let rec = UpkhUndoRecord { deleted: None, added: vec![Hash256([3; 32])] };
        let mut enc = Encoder::new();
        rec.encode_into(&mut enc);
        let bytes = enc.into_inner();
        let mut dec = Decoder::new(&bytes[..bytes.len() - 1]);
        assert!(UpkhUndoRecord::decode_from(&mut dec).is_err());
    }

    #[test]
    fn spent_outputs_counts_mask_bits() {
        let mut changes = BlockChanges::new(1, 1, 256);
        changes.deleted.insert(Hash256([1; 32]), vec![true, false, true]);
        changes.deleted.insert(Hash256([2; 32]), vec![true]);
        assert_eq!(changes.spent_outputs(), 3);
    }
}
