//! Per-height undo logs.
//!
//! Each committed block inside the unwind window leaves two files in the
//! undo directory:
//!
//! - `<height>`: `[prev_hash:32]{varint(len) full_utxo_record}*`, the
//!   pre-images of every committed output the block spent
//! - `<height>upkh`: `[prev_hash:32]{upkh_undo_record}*`, in processing order
//!
//! Files are written to a `.tmp` sibling, synced and renamed, so a crash
//! never leaves a half-written log under the final name.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use wots_core::changes::UpkhUndoRecord;
use wots_core::encoding::{Decoder, Encoder};
use wots_core::error::{DecodeError, StorageError};
use wots_core::records::UtxoRecord;
use wots_core::types::Hash256;

/// Decoded undo log for one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoLog {
    pub prev_hash: Hash256,
    pub utxo: Vec<UtxoRecord>,
    pub upkh: Vec<UpkhUndoRecord>,
}

pub fn utxo_undo_path(dir: &Path, height: u32) -> PathBuf {
    dir.join(height.to_string())
}

pub fn upkh_undo_path(dir: &Path, height: u32) -> PathBuf {
    dir.join(format!("{height}upkh"))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    drop(f);
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Write both undo files for `height`.
pub fn write_undo(
    dir: &Path,
    height: u32,
    prev_hash: &Hash256,
    utxo: &HashMap<Hash256, UtxoRecord>,
    upkh: &[UpkhUndoRecord],
) -> Result<(), StorageError> {
    fs::create_dir_all(dir)?;

    let mut records: Vec<&UtxoRecord> = utxo.values().collect();
    records.sort_unstable_by_key(|r| r.txid);
    let mut enc = Encoder::new();
    enc.write_hash(prev_hash);
    for bytes in records.iter().filter_map(|r| r.serialize(true)) {
        enc.write_var_bytes(&bytes);
    }
    write_atomic(&utxo_undo_path(dir, height), &enc.into_inner())?;

    let mut enc = Encoder::new();
    enc.write_hash(prev_hash);
    for rec in upkh {
        rec.encode_into(&mut enc);
    }
    write_atomic(&upkh_undo_path(dir, height), &enc.into_inner())?;

    debug!(height, records = records.len(), upkh = upkh.len(), "undo log written");
    Ok(())
}

fn read_file(path: &Path, height: u32) -> Result<Vec<u8>, StorageError> {
    fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => StorageError::UndoMissing(height),
        _ => StorageError::from(e),
    })
}

fn corrupt(path: &Path, e: DecodeError) -> StorageError {
    StorageError::Corrupt { file: path.display().to_string(), reason: e.to_string() }
}

/// Read and decode both undo files for `height`. Either file missing yields
/// [`StorageError::UndoMissing`].
pub fn read_undo(dir: &Path, height: u32) -> Result<UndoLog, StorageError> {
    let utxo_path = utxo_undo_path(dir, height);
    let bytes = read_file(&utxo_path, height)?;
    let mut dec = Decoder::new(&bytes);
    let prev_hash = dec.read_hash().map_err(|e| corrupt(&utxo_path, e))?;
    let mut utxo = Vec::new();
    while !dec.is_empty() {
        let rec = dec
            .read_var_slice()
            .and_then(UtxoRecord::from_full)
            .map_err(|e| corrupt(&utxo_path, e))?;
        utxo.push(rec);
    }

    let upkh_path = upkh_undo_path(dir, height);
    let bytes = read_file(&upkh_path, height)?;
    let mut dec = Decoder::new(&bytes);
    let upkh_prev = dec.read_hash().map_err(|e| corrupt(&upkh_path, e))?;
    if upkh_prev != prev_hash {
        return Err(StorageError::Corrupt {
            file: upkh_path.display().to_string(),
            reason: format!("parent {upkh_prev} differs from utxo undo parent {prev_hash}"),
        });
    }
    let mut upkh = Vec::new();
    while !dec.is_empty() {
        upkh.push(UpkhUndoRecord::decode_from(&mut dec).map_err(|e| corrupt(&upkh_path, e))?);
    }
    Ok(UndoLog { prev_hash, utxo, upkh })
}

/// Remove both undo files for `height`. Missing files are not an error.
pub fn remove_undo(dir: &Path, height: u32) {
    for path in [utxo_undo_path(dir, height), upkh_undo_path(dir, height)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove undo file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wots_core::records::{UpkhRecord, UtxoOut};

    fn record(seed: u8) -> UtxoRecord {
        let mut rec = UtxoRecord::with_holes(Hash256([seed; 32]), seed % 2 == 0, 42, 3);
        rec.outs[1] = Some(UtxoOut { value: 1_000 + seed as u64, pk_script: vec![0x51, seed] });
        rec
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let prev = Hash256([9; 32]);
        let utxo: HashMap<Hash256, UtxoRecord> = [record(1), record(2)].into_iter().map(|r| (r.txid, r)).collect();
        let upkh = vec![
            UpkhUndoRecord {
                deleted: Some(UpkhRecord { pkh: Hash256([3; 32]), long_term_hash: [4; 20], height: 7 }),
                added: vec![Hash256([5; 32])],
            },
            UpkhUndoRecord { deleted: None, added: vec![] },
        ];
        write_undo(dir.path(), 100, &prev, &utxo, &upkh).unwrap();

        let log = read_undo(dir.path(), 100).unwrap();
        assert_eq!(log.prev_hash, prev);
        assert_eq!(log.utxo, vec![record(1), record(2)]);
        assert_eq!(log.upkh, upkh);
        assert!(!dir.path().join("100.tmp").exists());
    }

    #[test]
    fn missing_log_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_undo(dir.path(), 5), Err(StorageError::UndoMissing(5)));
    }

    #[test]
    fn truncated_log_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let utxo: HashMap<Hash256, UtxoRecord> = [(Hash256([1; 32]), record(1))].into_iter().collect();
        write_undo(dir.path(), 3, &Hash256::ZERO, &utxo, &[]).unwrap();
        let path = utxo_undo_path(dir.path(), 3);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        assert!(matches!(read_undo(dir.path(), 3), Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_undo(dir.path(), 8, &Hash256::ZERO, &HashMap::new(), &[]).unwrap();
        remove_undo(dir.path(), 8);
        remove_undo(dir.path(), 8);
        assert_eq!(read_undo(dir.path(), 8), Err(StorageError::UndoMissing(8)));
    }
}
