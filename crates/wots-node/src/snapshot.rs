//! Snapshot files of the UTXO and UPKH maps.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! [height:8][last_block_hash:32]
//! [utxo_count:8] { varint(8 + len) key:8 payload:len }*
//! [upkh_count:8] { varint(8 + len) key:8 payload:len }*
//! ```
//!
//! Saving runs on two threads joined by a bounded channel. The iterate
//! thread walks a stable copy-on-write view of both maps, encodes records
//! into 64 KiB chunks and paces itself against the configured time budget.
//! The writer thread streams chunks into a generation-tagged temp file and,
//! once the last chunk arrives, syncs it, rotates `UTXO.db` to `UTXO.old`
//! and renames the temp file into place. Cancelling stops the iterate
//! thread at the next record; the writer then deletes its temp file on its
//! own, so the caller never waits on disk I/O.

use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, info, warn};

use wots_core::constants::UTXO_IDX_LEN;
use wots_core::encoding::{Decoder, Encoder};
use wots_core::error::{DecodeError, StorageError};
use wots_core::records::IndexKey;
use wots_core::types::Hash256;

pub const SNAPSHOT_FILE: &str = "UTXO.db";
pub const PREVIOUS_FILE: &str = "UTXO.old";

/// Map from index key to record payload.
pub type RecordMap = HashMap<IndexKey, Vec<u8>>;

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 100;
const THROTTLE_EVERY: u64 = 64;

/// Cooperative cancellation signal shared between a save and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Stable view of both maps at one committed block.
#[derive(Clone)]
pub struct SnapshotView {
    pub height: u32,
    pub hash: Hash256,
    pub utxo: Arc<RecordMap>,
    pub upkh: Arc<RecordMap>,
}

#[derive(Debug)]
pub struct LoadedSnapshot {
    pub height: u32,
    pub hash: Hash256,
    pub utxo: RecordMap,
    pub upkh: RecordMap,
    /// File the snapshot came from.
    pub source: PathBuf,
}

fn encode_record(enc: &mut Encoder, key: &IndexKey, payload: &[u8]) {
    enc.write_varint((UTXO_IDX_LEN + payload.len()) as u64);
    enc.write_bytes(key);
    enc.write_bytes(payload);
}

fn encode_header(enc: &mut Encoder, height: u32, hash: &Hash256) {
    enc.write_u64_le(u64::from(height));
    enc.write_hash(hash);
}

/// Encode a complete snapshot in memory.
pub fn encode_snapshot(view: &SnapshotView) -> Vec<u8> {
    let mut enc = Encoder::new();
    encode_header(&mut enc, view.height, &view.hash);
    for map in [&view.utxo, &view.upkh] {
        enc.write_u64_le(map.len() as u64);
        for (key, payload) in map.iter() {
            encode_record(&mut enc, key, payload);
        }
    }
    enc.into_inner()
}

fn decode_map(dec: &mut Decoder<'_>) -> Result<RecordMap, DecodeError> {
    let count = dec.read_u64_le()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    let mut map = HashMap::with_capacity(count.min(dec.remaining() / (UTXO_IDX_LEN + 1)));
    for _ in 0..count {
        let record = dec.read_var_slice()?;
        if record.len() < UTXO_IDX_LEN {
            return Err(DecodeError::InvalidData("record shorter than its key"));
        }
        let (key, payload) = record.split_at(UTXO_IDX_LEN);
        let mut k = [0u8; UTXO_IDX_LEN];
        k.copy_from_slice(key);
        map.insert(k, payload.to_vec());
    }
    Ok(map)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<(u32, Hash256, RecordMap, RecordMap), DecodeError> {
    let mut dec = Decoder::new(bytes);
    let height = u32::try_from(dec.read_u64_le()?).map_err(|_| DecodeError::InvalidData("height"))?;
    let hash = dec.read_hash()?;
    let utxo = decode_map(&mut dec)?;
    let upkh = decode_map(&mut dec)?;
    dec.finish()?;
    Ok((height, hash, utxo, upkh))
}

pub fn read_snapshot(path: &Path) -> Result<LoadedSnapshot, StorageError> {
    let bytes = fs::read(path)?;
    let (height, hash, utxo, upkh) = decode_snapshot(&bytes)
        .map_err(|e| StorageError::Corrupt { file: path.display().to_string(), reason: e.to_string() })?;
    Ok(LoadedSnapshot { height, hash, utxo, upkh, source: path.to_path_buf() })
}

/// Load the newest readable snapshot from `dir`: `UTXO.db`, else
/// `UTXO.old`. `None` when neither loads.
pub fn load_latest(dir: &Path) -> Option<LoadedSnapshot> {
    for name in [SNAPSHOT_FILE, PREVIOUS_FILE] {
        let path = dir.join(name);
        match read_snapshot(&path) {
            Ok(snap) => {
                info!(
                    file = %path.display(),
                    height = snap.height,
                    hash = %snap.hash,
                    utxo = snap.utxo.len(),
                    upkh = snap.upkh.len(),
                    "snapshot loaded"
                );
                return Some(snap);
            }
            Err(StorageError::Io(e)) if !path.exists() => {
                debug!(file = %path.display(), error = %e, "no snapshot");
            }
            Err(e) => warn!(file = %path.display(), error = %e, "snapshot unreadable, trying previous generation"),
        }
    }
    None
}

/// Delete temp files left by a save interrupted by a crash.
pub fn remove_stale_temp_files(dir: &Path) -> Result<usize, StorageError> {
    let mut removed = 0;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, "removed stale snapshot temp files");
    }
    Ok(removed)
}

/// Knobs shared between the storage engine and its saves.
#[derive(Clone)]
pub struct SaveOptions {
    /// Target duration for one complete save.
    pub time_target: Duration,
    /// When set, the save stops pacing itself.
    pub hurry: Arc<AtomicBool>,
    /// Highest generation written to disk so far.
    pub saved_generation: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    Cancelled,
}

enum WriterMsg {
    Chunk(Vec<u8>),
    Finish,
}

/// A save in flight.
pub struct SaveHandle {
    pub generation: u64,
    pub height: u32,
    cancel: CancelToken,
    iterate: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<Result<SaveOutcome, StorageError>>>,
}

impl SaveHandle {
    /// Stop the save and wait for the iterate thread only. The writer
    /// discards its temp file in the background.
    pub fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(h) = self.iterate.take() {
            if h.join().is_err() {
                warn!(generation = self.generation, "snapshot iterate thread panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.writer.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for both threads and report how the save ended.
    pub fn wait(mut self) -> Result<SaveOutcome, StorageError> {
        if let Some(h) = self.iterate.take() {
            let _ = h.join();
        }
        match self.writer.take() {
            Some(h) => h.join().map_err(|_| StorageError::Io("snapshot writer thread panicked".into()))?,
            None => Ok(SaveOutcome::Cancelled),
        }
    }
}

/// Start saving `view` into `dir` in the background.
pub fn spawn_save(dir: &Path, view: SnapshotView, generation: u64, options: SaveOptions) -> Result<SaveHandle, StorageError> {
    fs::create_dir_all(dir)?;
    let (tx, rx) = bounded::<WriterMsg>(CHANNEL_DEPTH);
    let cancel = CancelToken::new();
    let height = view.height;

    let writer = {
        let dir = dir.to_path_buf();
        let saved = options.saved_generation.clone();
        thread::Builder::new()
            .name("utxo-save-writer".into())
            .spawn(move || write_chunks(&dir, generation, height, &rx, &saved))?
    };
    let iterate = {
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("utxo-save-iterate".into())
            .spawn(move || iterate_view(view, generation, &tx, &cancel, &options))?
    };
    info!(generation, height, "snapshot save started");
    Ok(SaveHandle { generation, height, cancel, iterate: Some(iterate), writer: Some(writer) })
}

struct Pacer<'a> {
    started: Instant,
    total_bytes: u64,
    bytes_done: u64,
    records: u64,
    cancel: &'a CancelToken,
    options: &'a SaveOptions,
}

/// Bytes a record adds to the snapshot, ignoring its length prefix.
fn record_len(payload: &[u8]) -> u64 {
    (UTXO_IDX_LEN + payload.len()) as u64
}

impl<'a> Pacer<'a> {
    fn new(view: &SnapshotView, cancel: &'a CancelToken, options: &'a SaveOptions) -> Self {
        let total_bytes = view.utxo.values().chain(view.upkh.values()).map(|payload| record_len(payload)).sum();
        Self { started: Instant::now(), total_bytes, bytes_done: 0, records: 0, cancel, options }
    }

    /// Share of the snapshot's bytes encoded so far, in 1/2^20 units.
    fn data_progress(&self) -> u64 {
        (self.bytes_done << 20) / self.total_bytes.max(1)
    }

    /// Sleep while the share of bytes encoded is ahead of the share of the
    /// time budget used.
    fn record_done(&mut self, payload: &[u8]) {
        self.records += 1;
        self.bytes_done += record_len(payload);
        if self.records % THROTTLE_EVERY != 0 || self.total_bytes == 0 {
            return;
        }
        let budget = (self.options.time_target.as_millis() as u64).max(1);
        let data_progress = self.data_progress();
        loop {
            if self.options.hurry.load(Ordering::Relaxed) || self.cancel.is_cancelled() {
                return;
            }
            let time_progress = ((self.started.elapsed().as_millis() as u64) << 20) / budget;
            if data_progress <= time_progress {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Hand a chunk to the writer without blocking past a cancellation.
fn send_chunk(tx: &Sender<WriterMsg>, mut msg: WriterMsg, cancel: &CancelToken) -> bool {
    loop {
        match tx.try_send(msg) {
            Ok(()) => return true,
            Err(TrySendError::Disconnected(_)) => return false,
            Err(TrySendError::Full(back)) => {
                if cancel.is_cancelled() {
                    return false;
                }
                msg = back;
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

fn iterate_view(view: SnapshotView, generation: u64, tx: &Sender<WriterMsg>, cancel: &CancelToken, options: &SaveOptions) {
    let mut pacer = Pacer::new(&view, cancel, options);
    let mut enc = Encoder::with_capacity(CHUNK_SIZE + 1024);
    encode_header(&mut enc, view.height, &view.hash);

    for map in [&view.utxo, &view.upkh] {
        enc.write_u64_le(map.len() as u64);
        for (key, payload) in map.iter() {
            if cancel.is_cancelled() {
                info!(generation, height = view.height, "snapshot save cancelled");
                return;
            }
            encode_record(&mut enc, key, payload);
            if enc.len() >= CHUNK_SIZE {
                let chunk = std::mem::replace(&mut enc, Encoder::with_capacity(CHUNK_SIZE + 1024)).into_inner();
                if !send_chunk(tx, WriterMsg::Chunk(chunk), cancel) {
                    info!(generation, height = view.height, "snapshot save cancelled");
                    return;
                }
            }
            pacer.record_done(payload);
        }
    }
    let ok = send_chunk(tx, WriterMsg::Chunk(enc.into_inner()), cancel) && send_chunk(tx, WriterMsg::Finish, cancel);
    if ok {
        debug!(generation, records = pacer.records, bytes = pacer.bytes_done, elapsed_ms = pacer.started.elapsed().as_millis() as u64, "snapshot iteration done");
    }
}

fn write_chunks(
    dir: &Path,
    generation: u64,
    height: u32,
    rx: &Receiver<WriterMsg>,
    saved: &AtomicU64,
) -> Result<SaveOutcome, StorageError> {
    let tmp = dir.join(format!("{SNAPSHOT_FILE}.{generation}.tmp"));
    let result = (|| -> Result<SaveOutcome, StorageError> {
        let mut out = BufWriter::new(fs::File::create(&tmp)?);
        let mut written = 0usize;
        // A closed channel without `Finish` means the save was cancelled.
        while let Ok(msg) = rx.recv() {
            match msg {
                WriterMsg::Chunk(bytes) => {
                    out.write_all(&bytes)?;
                    written += bytes.len();
                }
                WriterMsg::Finish => {
                    let file = out.into_inner().map_err(|e| StorageError::Io(e.to_string()))?;
                    file.sync_all()?;
                    drop(file);
                    let current = dir.join(SNAPSHOT_FILE);
                    if current.exists() {
                        fs::rename(&current, dir.join(PREVIOUS_FILE))?;
                    }
                    fs::rename(&tmp, &current)?;
                    saved.fetch_max(generation, Ordering::AcqRel);
                    info!(generation, height, bytes = written, "snapshot saved");
                    return Ok(SaveOutcome::Written);
                }
            }
        }
        Ok(SaveOutcome::Cancelled)
    })();

    if !matches!(result, Ok(SaveOutcome::Written)) {
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != ErrorKind::NotFound {
                warn!(file = %tmp.display(), error = %e, "failed to remove snapshot temp file");
            }
        }
    }
    if let Err(e) = &result {
        warn!(generation, error = %e, "snapshot write failed");
    }
    result
}
