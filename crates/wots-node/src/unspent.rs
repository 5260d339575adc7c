//! The unspent-output storage engine.
//!
//! [`UnspentDb`] keeps two in-memory maps keyed by the first eight bytes of
//! a txid or public-key hash:
//!
//! - the UTXO map, one compact record per transaction with live outputs
//! - the UPKH map, one entry per advertised long-term key commitment
//!
//! Both maps live behind `Arc`s so a background save can iterate a stable
//! copy while commits continue: a commit first cancels any save in flight,
//! which drops the save's references, and then mutates in place through
//! `Arc::make_mut`.
//!
//! Every [`apply_block`](UnspentDb::apply_block) and
//! [`undo_block`](UnspentDb::undo_block) stages its changes against the
//! current maps before touching them, so a decoding failure leaves the
//! indexes as they were.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use wots_core::changes::BlockChanges;
use wots_core::error::{DecodeError, StorageError};
use wots_core::records::{IndexKey, PayloadSummary, UpkhRecord, UtxoOut, UtxoOutput, UtxoRecord, index_key};
use wots_core::script::is_unspendable;
use wots_core::traits::UtxoView;
use wots_core::types::{Block, Hash256, OutPoint, Transaction};

use crate::snapshot::{self, RecordMap, SaveHandle, SaveOptions, SaveOutcome, SnapshotView};
use crate::undo;

/// Notification for one output entering or leaving the index.
pub type OutputCallback = Box<dyn Fn(&OutPoint, &UtxoOut) + Send + Sync>;

/// Optional hooks fired after a commit or undo has been applied.
#[derive(Default)]
pub struct IndexCallbacks {
    pub on_add: Option<OutputCallback>,
    pub on_delete: Option<OutputCallback>,
}

#[derive(Debug, Clone)]
pub struct UnspentOptions {
    /// Directory for snapshot files; undo logs go to `undo/` inside it.
    pub dir: PathBuf,
    /// Tip reported by an empty index.
    pub genesis_hash: Hash256,
    pub unwind_len: u32,
    pub volatile: bool,
    pub write_undo_files: bool,
    pub save_time_target: Duration,
}

/// How [`UnspentDb::open`] found the on-disk state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub height: u32,
    pub hash: Hash256,
    /// No snapshot could be loaded; the index starts empty at genesis.
    pub needs_rescan: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tip {
    height: u32,
    hash: Hash256,
}

#[derive(Default)]
struct SaveSlot {
    current: Option<SaveHandle>,
    /// Cancelled saves whose writer may still be cleaning up.
    retired: Vec<SaveHandle>,
}

/// Summary of both indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnspentStats {
    pub height: u32,
    pub last_block: String,
    pub records: u64,
    pub outputs: u64,
    pub total_value: u64,
    pub coinbase_value: u64,
    pub unspendable_outputs: u64,
    pub unspendable_bytes: u64,
    /// Records whose live outputs are all provably unspendable.
    pub records_without_spendable: u64,
    pub upkh_count: u64,
    pub long_term_roots: u64,
    /// Bytes of keys and payloads held in memory.
    pub data_bytes: u64,
    pub dirty: bool,
    pub writing: bool,
}

impl fmt::Display for UnspentStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UNSPENT: {} outputs in {} records, {} base units", self.outputs, self.records, self.total_value)?;
        writeln!(
            f,
            " unspendable: {} outputs / {} bytes, {} records with nothing spendable",
            self.unspendable_outputs, self.unspendable_bytes, self.records_without_spendable
        )?;
        writeln!(f, " UPKH: {} entries under {} long-term roots", self.upkh_count, self.long_term_roots)?;
        write!(
            f,
            " last block {} @ {}, {} bytes, dirty: {}, writing: {}",
            self.last_block, self.height, self.data_bytes, self.dirty, self.writing
        )
    }
}

/// Ordered copy of both maps, for comparing index states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexContent {
    pub height: u32,
    pub hash: Hash256,
    pub utxo: BTreeMap<IndexKey, Vec<u8>>,
    pub upkh: BTreeMap<IndexKey, Vec<u8>>,
}

/// Pending writes against one map.
struct Overlay<'a> {
    base: &'a RecordMap,
    changes: HashMap<IndexKey, Option<Vec<u8>>>,
}

impl<'a> Overlay<'a> {
    fn new(base: &'a RecordMap) -> Self {
        Self { base, changes: HashMap::new() }
    }

    fn get(&self, key: &IndexKey) -> Option<&[u8]> {
        match self.changes.get(key) {
            Some(staged) => staged.as_deref(),
            None => self.base.get(key).map(Vec::as_slice),
        }
    }

    fn put(&mut self, key: IndexKey, payload: Vec<u8>) {
        self.changes.insert(key, Some(payload));
    }

    fn remove(&mut self, key: IndexKey) {
        self.changes.insert(key, None);
    }

    fn into_changes(self) -> HashMap<IndexKey, Option<Vec<u8>>> {
        self.changes
    }
}

fn commit_changes(map: &mut RecordMap, changes: HashMap<IndexKey, Option<Vec<u8>>>) {
    for (key, staged) in changes {
        match staged {
            Some(payload) => map.insert(key, payload),
            None => map.remove(&key),
        };
    }
}

fn corrupt_index(what: &str, e: DecodeError) -> StorageError {
    StorageError::Corrupt { file: format!("{what} index"), reason: e.to_string() }
}

/// Decode the UTXO record stored under `txid`'s key, if it belongs to `txid`.
fn record_for(overlay: &Overlay<'_>, txid: &Hash256) -> Result<Option<UtxoRecord>, StorageError> {
    let key = index_key(txid);
    match overlay.get(&key) {
        None => Ok(None),
        Some(payload) => {
            let rec = UtxoRecord::from_map_entry(&key, payload).map_err(|e| corrupt_index("utxo", e))?;
            Ok((rec.txid == *txid).then_some(rec))
        }
    }
}

fn stage_record(overlay: &mut Overlay<'_>, rec: &UtxoRecord) {
    match rec.serialize(false) {
        Some(payload) => overlay.put(rec.key(), payload),
        None => overlay.remove(rec.key()),
    }
}

pub struct UnspentDb {
    dir: PathBuf,
    undo_dir: PathBuf,
    utxo: RwLock<Arc<RecordMap>>,
    upkh: RwLock<Arc<RecordMap>>,
    tip: RwLock<Tip>,
    /// Serialises mutations and owns the save slot.
    writer: Mutex<SaveSlot>,
    generation: AtomicU64,
    save: SaveOptions,
    unwind_len: u32,
    volatile: bool,
    write_undo_files: bool,
    callbacks: IndexCallbacks,
}

impl UnspentDb {
    /// Open the index in `options.dir`, loading the newest readable snapshot.
    pub fn open(options: UnspentOptions) -> Result<(Self, LoadOutcome), StorageError> {
        Self::open_with_callbacks(options, IndexCallbacks::default())
    }

    pub fn open_with_callbacks(
        options: UnspentOptions,
        callbacks: IndexCallbacks,
    ) -> Result<(Self, LoadOutcome), StorageError> {
        let undo_dir = options.dir.join("undo");
        std::fs::create_dir_all(&undo_dir)?;
        snapshot::remove_stale_temp_files(&options.dir)?;
        snapshot::remove_stale_temp_files(&undo_dir)?;

        let (tip, utxo, upkh, needs_rescan) = match snapshot::load_latest(&options.dir) {
            Some(snap) => (Tip { height: snap.height, hash: snap.hash }, snap.utxo, snap.upkh, false),
            None => {
                warn!(dir = %options.dir.display(), "no usable snapshot, starting from an empty index");
                (Tip { height: 0, hash: options.genesis_hash }, RecordMap::new(), RecordMap::new(), true)
            }
        };
        let outcome = LoadOutcome { height: tip.height, hash: tip.hash, needs_rescan };

        let db = Self {
            dir: options.dir,
            undo_dir,
            utxo: RwLock::new(Arc::new(utxo)),
            upkh: RwLock::new(Arc::new(upkh)),
            tip: RwLock::new(tip),
            writer: Mutex::new(SaveSlot::default()),
            generation: AtomicU64::new(0),
            save: SaveOptions {
                time_target: options.save_time_target,
                hurry: Arc::new(AtomicBool::new(false)),
                saved_generation: Arc::new(AtomicU64::new(0)),
            },
            unwind_len: options.unwind_len,
            volatile: options.volatile,
            write_undo_files: options.write_undo_files,
            callbacks,
        };
        Ok((db, outcome))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn undo_dir(&self) -> &Path {
        &self.undo_dir
    }

    pub fn height(&self) -> u32 {
        self.tip.read().height
    }

    pub fn last_block_hash(&self) -> Hash256 {
        self.tip.read().hash
    }

    pub fn unwind_len(&self) -> u32 {
        self.unwind_len
    }

    pub fn is_dirty(&self) -> bool {
        self.generation.load(Ordering::Acquire) > self.save.saved_generation.load(Ordering::Acquire)
    }

    pub fn is_writing(&self) -> bool {
        self.writer.lock().current.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Full record for `txid`, if it still has live outputs.
    pub fn get_record(&self, txid: &Hash256) -> Option<UtxoRecord> {
        let map = self.utxo.read();
        let key = index_key(txid);
        let rec = UtxoRecord::from_map_entry(&key, map.get(&key)?).ok()?;
        (rec.txid == *txid).then_some(rec)
    }

    pub fn get_output(&self, outpoint: &OutPoint) -> Option<UtxoOutput> {
        let map = self.utxo.read();
        let payload = map.get(&index_key(&outpoint.txid))?;
        UtxoRecord::output_from_map_entry(&outpoint.txid, payload, outpoint.vout)
    }

    pub fn get_upkh(&self, pkh: &Hash256) -> Option<UpkhRecord> {
        let map = self.upkh.read();
        let key = index_key(pkh);
        let rec = UpkhRecord::from_map_entry(&key, map.get(&key)?).ok()?;
        (rec.pkh == *pkh).then_some(rec)
    }

    /// Cancel the save in flight, if any, without waiting for its writer.
    fn abort_save(slot: &mut SaveSlot) {
        if let Some(mut handle) = slot.current.take() {
            if !handle.is_finished() {
                handle.abort();
                info!(generation = handle.generation, "snapshot save cancelled by commit");
            }
            slot.retired.push(handle);
        }
    }

    /// Cancel any save in flight.
    pub fn abort_writing(&self) {
        let mut slot = self.writer.lock();
        Self::abort_save(&mut slot);
    }

    /// Apply a validated block's changes. `block_hash` becomes the new tip;
    /// `prev_hash` must be the current one.
    pub fn apply_block(&self, changes: &BlockChanges, block_hash: &Hash256, prev_hash: &Hash256) -> Result<(), StorageError> {
        let mut slot = self.writer.lock();
        Self::abort_save(&mut slot);

        let tip = *self.tip.read();
        if changes.height != tip.height + 1 {
            return Err(StorageError::HeightMismatch { expected: tip.height + 1, got: changes.height });
        }
        if *prev_hash != tip.hash {
            return Err(StorageError::TipMismatch { expected: tip.hash, found: *prev_hash });
        }

        if self.write_undo_files {
            if let (Some(undo), Some(undo_upkh)) = (&changes.undo, &changes.undo_upkh) {
                undo::write_undo(&self.undo_dir, changes.height, prev_hash, undo, undo_upkh)?;
            }
        }

        let utxo_base = self.utxo.read().clone();
        let upkh_base = self.upkh.read().clone();
        let mut utxo = Overlay::new(&utxo_base);
        let mut removed: Vec<(OutPoint, UtxoOut)> = Vec::new();

        for (txid, mask) in &changes.deleted {
            let Some(mut rec) = record_for(&utxo, txid)? else {
                return Err(StorageError::Corrupt {
                    file: "utxo index".into(),
                    reason: format!("spent record {txid} missing"),
                });
            };
            for (vout, _) in mask.iter().enumerate().filter(|(_, spent)| **spent) {
                if let Some(out) = rec.outs.get_mut(vout).and_then(Option::take) {
                    removed.push((OutPoint { txid: *txid, vout: vout as u32 }, out));
                }
            }
            stage_record(&mut utxo, &rec);
        }
        for rec in &changes.add_list {
            stage_record(&mut utxo, rec);
        }

        let mut upkh = Overlay::new(&upkh_base);
        for pkh in &changes.delete_upkh {
            upkh.remove(index_key(pkh));
        }
        for rec in &changes.add_upkh {
            upkh.put(rec.key(), rec.map_payload());
        }

        let (utxo_changes, upkh_changes) = (utxo.into_changes(), upkh.into_changes());
        drop(utxo_base);
        drop(upkh_base);
        self.commit(utxo_changes, upkh_changes, Tip { height: changes.height, hash: *block_hash });

        if let Some(cb) = &self.callbacks.on_delete {
            for (outpoint, out) in &removed {
                cb(outpoint, out);
            }
        }
        if let Some(cb) = &self.callbacks.on_add {
            for rec in &changes.add_list {
                for (vout, out) in rec.live_outputs() {
                    cb(&OutPoint { txid: rec.txid, vout }, out);
                }
            }
        }

        if changes.height > self.unwind_len {
            undo::remove_undo(&self.undo_dir, changes.height - self.unwind_len);
        }
        debug!(
            height = changes.height,
            hash = %block_hash,
            added = changes.add_list.len(),
            spent = removed.len(),
            upkh_added = changes.add_upkh.len(),
            upkh_deleted = changes.delete_upkh.len(),
            "block applied to unspent index"
        );
        Ok(())
    }

    /// Revert the tip block using its undo log. `new_tip_hash` must be the
    /// block's parent.
    pub fn undo_block(&self, block: &Block, new_tip_hash: &Hash256) -> Result<(), StorageError> {
        let mut slot = self.writer.lock();
        Self::abort_save(&mut slot);

        let tip = *self.tip.read();
        let block_hash = block.hash();
        if block_hash != tip.hash {
            return Err(StorageError::TipMismatch { expected: tip.hash, found: block_hash });
        }
        let log = undo::read_undo(&self.undo_dir, tip.height)?;
        if log.prev_hash != *new_tip_hash {
            return Err(StorageError::UndoMismatch { height: tip.height, expected: *new_tip_hash, found: log.prev_hash });
        }

        let utxo_base = self.utxo.read().clone();
        let upkh_base = self.upkh.read().clone();
        let mut utxo = Overlay::new(&utxo_base);
        let mut removed: Vec<(OutPoint, UtxoOut)> = Vec::new();

        for txid in block.transactions.iter().map(Transaction::txid) {
            if let Some(rec) = record_for(&utxo, &txid)? {
                removed.extend(rec.live_outputs().map(|(vout, out)| (OutPoint { txid, vout }, out.clone())));
                utxo.remove(rec.key());
            }
        }
        let mut restored = Vec::with_capacity(log.utxo.len());
        for mut rec in log.utxo {
            if let Some(live) = record_for(&utxo, &rec.txid)? {
                rec.merge_from(&live);
            }
            stage_record(&mut utxo, &rec);
            restored.push(rec);
        }

        let mut upkh = Overlay::new(&upkh_base);
        for entry in log.upkh.iter().rev() {
            for pkh in &entry.added {
                upkh.remove(index_key(pkh));
            }
            if let Some(rec) = &entry.deleted {
                upkh.put(rec.key(), rec.map_payload());
            }
        }

        let (utxo_changes, upkh_changes) = (utxo.into_changes(), upkh.into_changes());
        drop(utxo_base);
        drop(upkh_base);
        self.commit(utxo_changes, upkh_changes, Tip { height: tip.height - 1, hash: *new_tip_hash });

        if let Some(cb) = &self.callbacks.on_delete {
            for (outpoint, out) in &removed {
                cb(outpoint, out);
            }
        }
        if let Some(cb) = &self.callbacks.on_add {
            for rec in &restored {
                for (vout, out) in rec.live_outputs() {
                    cb(&OutPoint { txid: rec.txid, vout }, out);
                }
            }
        }
        undo::remove_undo(&self.undo_dir, tip.height);
        info!(height = tip.height, hash = %block_hash, restored = restored.len(), "block undone");
        Ok(())
    }

    fn commit(
        &self,
        utxo_changes: HashMap<IndexKey, Option<Vec<u8>>>,
        upkh_changes: HashMap<IndexKey, Option<Vec<u8>>>,
        new_tip: Tip,
    ) {
        let mut utxo = self.utxo.write();
        let mut upkh = self.upkh.write();
        let mut tip = self.tip.write();
        commit_changes(Arc::make_mut(&mut utxo), utxo_changes);
        commit_changes(Arc::make_mut(&mut upkh), upkh_changes);
        *tip = new_tip;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove provably unspendable outputs. With `all` unset only records
    /// holding nothing but `OP_RETURN` outputs go; with `all` set every
    /// `OP_RETURN` output is stripped. Returns the number of outputs removed.
    pub fn purge_unspendable(&self, all: bool) -> Result<u64, StorageError> {
        let mut save_slot = self.writer.lock();
        Self::abort_save(&mut save_slot);

        let base = self.utxo.read().clone();
        let mut overlay = Overlay::new(&base);
        let mut purged = 0u64;
        for (key, payload) in base.iter() {
            let summary = PayloadSummary::of(key, payload).map_err(|e| corrupt_index("utxo", e))?;
            if summary.unspendable_outputs == 0 {
                continue;
            }
            if summary.spendable_outputs == 0 {
                overlay.remove(*key);
                purged += summary.unspendable_outputs;
            } else if all {
                let mut rec = UtxoRecord::from_map_entry(key, payload).map_err(|e| corrupt_index("utxo", e))?;
                for out in rec.outs.iter_mut() {
                    if out.as_ref().is_some_and(|o| is_unspendable(&o.pk_script)) {
                        *out = None;
                        purged += 1;
                    }
                }
                stage_record(&mut overlay, &rec);
            }
        }
        let changes = overlay.into_changes();
        drop(base);
        if !changes.is_empty() {
            let tip = *self.tip.read();
            self.commit(changes, HashMap::new(), tip);
        }
        info!(purged, all, "unspendable outputs purged");
        Ok(purged)
    }

    /// Stable view of both maps at the current tip.
    fn view(&self) -> (SnapshotView, u64) {
        let utxo = self.utxo.read();
        let upkh = self.upkh.read();
        let tip = self.tip.read();
        let view = SnapshotView { height: tip.height, hash: tip.hash, utxo: utxo.clone(), upkh: upkh.clone() };
        (view, self.generation.load(Ordering::Acquire))
    }

    fn reap(slot: &mut SaveSlot) {
        for handle in slot.retired.drain(..) {
            if let Err(e) = handle.wait() {
                warn!(error = %e, "cancelled snapshot save failed to clean up");
            }
        }
        if slot.current.as_ref().is_some_and(SaveHandle::is_finished) {
            if let Some(handle) = slot.current.take() {
                if let Err(e) = handle.wait() {
                    warn!(error = %e, "snapshot save failed");
                }
            }
        }
    }

    /// Start a background save when the index is dirty and no save is
    /// running. Returns whether a save was started.
    pub fn idle(&self) -> Result<bool, StorageError> {
        if self.volatile {
            return Ok(false);
        }
        let mut slot = self.writer.lock();
        Self::reap(&mut slot);
        if slot.current.is_some() || !self.is_dirty() {
            return Ok(false);
        }
        let (view, generation) = self.view();
        slot.current = Some(snapshot::spawn_save(&self.dir, view, generation, self.save.clone())?);
        Ok(true)
    }

    /// Stop pacing saves; they then write as fast as the disk allows.
    pub fn hurry_up(&self) {
        self.save.hurry.store(true, Ordering::Relaxed);
    }

    /// Flush the index to disk and wait for the write to finish.
    pub fn close(&self) -> Result<(), StorageError> {
        self.hurry_up();
        let mut slot = self.writer.lock();
        let generation = self.generation.load(Ordering::Acquire);
        if slot.current.as_ref().is_some_and(|h| h.generation != generation) {
            Self::abort_save(&mut slot);
        }
        Self::reap(&mut slot);
        if let Some(handle) = slot.current.take() {
            handle.wait()?;
        }
        if !self.volatile && self.is_dirty() {
            let (view, generation) = self.view();
            let outcome = snapshot::spawn_save(&self.dir, view, generation, self.save.clone())?.wait()?;
            if outcome != SaveOutcome::Written {
                return Err(StorageError::Io("final snapshot save did not complete".into()));
            }
        }
        info!(height = self.height(), "unspent index closed");
        Ok(())
    }

    pub fn stats(&self) -> UnspentStats {
        let utxo = self.utxo.read().clone();
        let upkh = self.upkh.read().clone();
        let tip = *self.tip.read();

        let utxo_map: &RecordMap = &utxo;
        let (summary, records_without_spendable, coinbase_value, bad) = utxo_map
            .par_iter()
            .map(|(key, payload)| match PayloadSummary::of(key, payload) {
                Ok(s) => (s, u64::from(s.spendable_outputs == 0), if s.coinbase { s.value } else { 0 }, 0u64),
                Err(_) => (PayloadSummary::default(), 0, 0, 1),
            })
            .reduce(
                || (PayloadSummary::default(), 0, 0, 0),
                |(a, an, ac, ab), (b, bn, bc, bb)| {
                    let sum = PayloadSummary {
                        outputs: a.outputs + b.outputs,
                        value: a.value.saturating_add(b.value),
                        unspendable_outputs: a.unspendable_outputs + b.unspendable_outputs,
                        unspendable_bytes: a.unspendable_bytes + b.unspendable_bytes,
                        spendable_outputs: a.spendable_outputs + b.spendable_outputs,
                        coinbase: false,
                    };
                    (sum, an + bn, ac.saturating_add(bc), ab + bb)
                },
            );
        if bad > 0 {
            warn!(records = bad, "undecodable records in unspent index");
        }

        let roots: HashSet<[u8; 20]> = upkh
            .iter()
            .filter_map(|(key, payload)| UpkhRecord::from_map_entry(key, payload).ok())
            .map(|r| r.long_term_hash)
            .collect();
        let data_bytes = utxo.values().chain(upkh.values()).map(|p| (p.len() + 8) as u64).sum();

        UnspentStats {
            height: tip.height,
            last_block: tip.hash.to_string(),
            records: utxo.len() as u64,
            outputs: summary.outputs,
            total_value: summary.value,
            coinbase_value,
            unspendable_outputs: summary.unspendable_outputs,
            unspendable_bytes: summary.unspendable_bytes,
            records_without_spendable,
            upkh_count: upkh.len() as u64,
            long_term_roots: roots.len() as u64,
            data_bytes,
            dirty: self.is_dirty(),
            writing: self.is_writing(),
        }
    }

    /// Ordered copy of both maps and the tip.
    pub fn content(&self) -> IndexContent {
        let utxo = self.utxo.read();
        let upkh = self.upkh.read();
        let tip = self.tip.read();
        IndexContent {
            height: tip.height,
            hash: tip.hash,
            utxo: utxo.iter().map(|(k, v)| (*k, v.clone())).collect(),
            upkh: upkh.iter().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }
}

impl UtxoView for UnspentDb {
    fn output(&self, outpoint: &OutPoint) -> Option<UtxoOutput> {
        self.get_output(outpoint)
    }

    fn upkh(&self, pkh: &Hash256) -> Option<UpkhRecord> {
        self.get_upkh(pkh)
    }
}
