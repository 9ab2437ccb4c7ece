//! Memory-mapped trunk.
//!
//! A single growable file of framed records (see [`record`]) mapped into
//! memory. The file is the source of truth; a concurrent in-memory index maps
//! id to the current record's location and is rebuilt by replay on open.
//! Writers reserve file regions off an atomic cursor; the mapping doubles
//! under an exclusive lock when a reservation runs past it. Writes may be
//! batched, with a single background flusher issuing one flush-to-disk per
//! batch. Deletes are logical (a tombstone record plus index removal); space
//! is reclaimed only by [`BTreeTrunk::compact`].

mod record;

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use acorn_core::{
    AcornError, AcornResult, JsonCodec, Nut, NutCodec, Root, RootChain, RootInfo, Trunk,
    TrunkCapabilities,
};

pub use record::MAGIC;

const DEFAULT_INITIAL_CAPACITY: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct BTreeTrunkOptions {
    /// Initial mapping size. The file doubles from here on expansion.
    pub initial_capacity: u64,
    /// Batch writes and flush them in the background.
    pub batching: bool,
    /// Pending-record count that forces a batch flush.
    pub batch_threshold: usize,
    /// Longest a pending record waits before the flusher picks it up.
    pub flush_interval: Duration,
    /// On mid-file corruption, keep the valid prefix and refuse writes
    /// instead of overwriting from the last valid record.
    pub read_only_on_corruption: bool,
}

impl Default for BTreeTrunkOptions {
    fn default() -> Self {
        BTreeTrunkOptions {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            batching: true,
            batch_threshold: 64,
            flush_interval: Duration::from_millis(50),
            read_only_on_corruption: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    len: u32,
    #[allow(dead_code)]
    timestamp: i64,
    version: u32,
}

#[derive(Clone)]
struct PendingRecord {
    id: String,
    tombstone: bool,
    bytes: Vec<u8>,
}

/// Byte-level state shared with the flusher thread. Untyped on purpose: the
/// typed envelope codec lives on the trunk handle.
struct Inner {
    path: PathBuf,
    file: Mutex<File>,
    /// Guards the mapping. Writers copy under a read guard; expansion and
    /// compaction swap the mapping under the write guard.
    map: RwLock<MmapMut>,
    capacity: AtomicU64,
    cursor: AtomicU64,
    index: DashMap<String, IndexEntry>,
    loaded: AtomicBool,
    load_lock: Mutex<()>,
    chain: RootChain,
    pending: Mutex<Vec<PendingRecord>>,
    /// Serializes file-level flushes and compaction.
    flush_lock: Mutex<()>,
    stop: AtomicBool,
    read_only: AtomicBool,
    opts: BTreeTrunkOptions,
}

impl Inner {
    fn ensure_writable(&self) -> AcornResult<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(AcornError::PermanentIo(format!(
                "trunk `{}` is read-only after corruption",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Replay the file from offset zero, rebuilding the index and parking the
    /// cursor after the last valid record. Runs at most once; reads force it,
    /// so roots can still be registered beforehand.
    fn ensure_loaded(&self) -> AcornResult<()> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.load_lock.lock();
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        let map = self.map.read();
        let mut offset = 0usize;
        let mut records = 0usize;
        loop {
            if offset >= map.len() {
                break;
            }
            match record::decode(&map[offset..]) {
                record::DecodeOutcome::Record { record, consumed } => {
                    if record.is_tombstone() {
                        self.index.remove(&record.id);
                    } else {
                        self.index.insert(
                            record.id,
                            IndexEntry {
                                offset: offset as u64,
                                len: consumed as u32,
                                timestamp: record.timestamp,
                                version: record.version,
                            },
                        );
                    }
                    offset += consumed;
                    records += 1;
                }
                record::DecodeOutcome::Empty => break,
                record::DecodeOutcome::Truncated => {
                    warn!(path = %self.path.display(), offset, "truncated record at tail; cursor parked at last valid record");
                    break;
                }
                record::DecodeOutcome::Corrupt(reason) => {
                    warn!(path = %self.path.display(), offset, %reason, "corrupt record during replay");
                    if self.opts.read_only_on_corruption {
                        self.read_only.store(true, Ordering::Release);
                    }
                    break;
                }
            }
        }
        drop(map);

        self.cursor.store(offset as u64, Ordering::Release);
        self.loaded.store(true, Ordering::Release);
        debug!(path = %self.path.display(), records, next_write = offset, "index loaded");
        Ok(())
    }

    /// Reserve space off the cursor and copy `bytes` into the mapping.
    /// Reservation happens under the mapping read guard, so expansion and
    /// compaction (write guard) fully exclude in-flight writers.
    fn append_bytes(&self, bytes: &[u8]) -> AcornResult<u64> {
        let len = bytes.len() as u64;
        loop {
            {
                let map = self.map.read();
                let capacity = self.capacity.load(Ordering::Acquire);
                let cursor = self.cursor.load(Ordering::Acquire);
                if cursor + len <= capacity {
                    if self
                        .cursor
                        .compare_exchange(cursor, cursor + len, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // SAFETY: the CAS uniquely reserved
                        // [cursor, cursor + len); no other writer touches it,
                        // and the mapping cannot move while the read guard is
                        // held.
                        unsafe {
                            let dst = map.as_ptr().add(cursor as usize) as *mut u8;
                            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                        }
                        return Ok(cursor);
                    }
                    continue;
                }
            }
            self.grow_for(len)?;
        }
    }

    /// Double the file until `cursor + len` fits, remapping under the
    /// exclusive lock.
    fn grow_for(&self, len: u64) -> AcornResult<()> {
        let mut map = self.map.write();
        let capacity = self.capacity.load(Ordering::Acquire);
        let needed = self.cursor.load(Ordering::Acquire) + len;
        if needed <= capacity {
            return Ok(());
        }
        let mut new_capacity = capacity.max(1);
        while new_capacity < needed {
            new_capacity = new_capacity.saturating_mul(2);
        }
        let file = self.file.lock();
        map.flush()?;
        file.set_len(new_capacity)?;
        *map = unsafe { MmapMut::map_mut(&*file)? };
        self.capacity.store(new_capacity, Ordering::Release);
        debug!(path = %self.path.display(), new_capacity, "mapping expanded");
        Ok(())
    }

    fn read_entry(&self, entry: IndexEntry) -> Vec<u8> {
        let map = self.map.read();
        map[entry.offset as usize..(entry.offset + entry.len as u64) as usize].to_vec()
    }

    /// Drain pending records, write them, and issue one flush-to-disk for
    /// the whole batch. Syncs both the mapping view and the descriptor.
    fn flush_pending(&self) -> AcornResult<usize> {
        // Only the flusher removes pending records, and only after they are
        // indexed, so reads stay coherent throughout. The flush lock keeps
        // batches ordered.
        let _flush_guard = self.flush_lock.lock();
        let batch: Vec<PendingRecord> = self.pending.lock().clone();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        for rec in &batch {
            let offset = self.append_bytes(&rec.bytes)?;
            if rec.tombstone {
                self.index.remove(&rec.id);
            } else {
                match record::decode(&rec.bytes) {
                    record::DecodeOutcome::Record { record, consumed } => {
                        self.index.insert(
                            rec.id.clone(),
                            IndexEntry {
                                offset,
                                len: consumed as u32,
                                timestamp: record.timestamp,
                                version: record.version,
                            },
                        );
                    }
                    _ => unreachable!("pending records are framed by the writer"),
                }
            }
        }
        self.pending.lock().drain(..count);
        self.map.read().flush()?;
        self.file.lock().sync_data()?;
        Ok(count)
    }
}

/// High-throughput durable trunk over a memory-mapped record file. No
/// history; deletes are logical until compaction.
pub struct BTreeTrunk<T> {
    inner: Arc<Inner>,
    codec: JsonCodec,
    flusher: Mutex<Option<JoinHandle<()>>>,
    wake_tx: Sender<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BTreeTrunk<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn open(path: impl AsRef<Path>) -> AcornResult<Self> {
        Self::open_with(path, BTreeTrunkOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, opts: BTreeTrunkOptions) -> AcornResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let capacity = file.metadata()?.len().max(opts.initial_capacity.max(record::HEADER_LEN as u64));
        file.set_len(capacity)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        let inner = Arc::new(Inner {
            path,
            file: Mutex::new(file),
            map: RwLock::new(map),
            capacity: AtomicU64::new(capacity),
            cursor: AtomicU64::new(0),
            index: DashMap::new(),
            loaded: AtomicBool::new(false),
            load_lock: Mutex::new(()),
            chain: RootChain::new(),
            pending: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            opts,
        });

        let (wake_tx, wake_rx) = bounded::<()>(1);
        let flusher = if inner.opts.batching {
            Some(spawn_flusher(inner.clone(), wake_rx)?)
        } else {
            None
        };

        Ok(BTreeTrunk {
            inner,
            codec: JsonCodec,
            flusher: Mutex::new(flusher),
            wake_tx,
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of live ids in the index.
    pub fn entry_count(&self) -> usize {
        self.inner.index.len()
    }

    /// Current mapped capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.inner.capacity.load(Ordering::Acquire)
    }

    fn frame(&self, nut: &Nut<T>) -> AcornResult<Vec<u8>> {
        if nut.id.as_bytes().contains(&0) {
            return Err(AcornError::Serialization("id must not contain NUL bytes".into()));
        }
        let payload = self.codec.encode(nut)?;
        let processed = self.inner.chain.encode(&nut.id, payload)?;
        let timestamp = nut.timestamp.unix_timestamp_nanos().clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        let version = nut.version.min(u32::MAX as u64) as u32;
        Ok(record::encode(version, timestamp, &nut.id, &processed))
    }

    fn unframe(&self, id: &str, bytes: &[u8]) -> AcornResult<Nut<T>> {
        match record::decode(bytes) {
            record::DecodeOutcome::Record { record, .. } => {
                let raw = self.inner.chain.decode(id, record.payload)?;
                self.codec.decode(&raw)
            }
            _ => Err(AcornError::CorruptRecord(format!("unreadable record for `{id}`"))),
        }
    }

    fn enqueue(&self, rec: PendingRecord) -> AcornResult<()> {
        let should_wake = {
            let mut pending = self.inner.pending.lock();
            pending.push(rec);
            pending.len() >= self.inner.opts.batch_threshold
        };
        if should_wake {
            let _ = self.wake_tx.try_send(());
        }
        Ok(())
    }

    fn pending_nut(&self, id: &str) -> AcornResult<Option<Option<Nut<T>>>> {
        let pending = self.inner.pending.lock();
        for rec in pending.iter().rev() {
            if rec.id == id {
                if rec.tombstone {
                    return Ok(Some(None));
                }
                let nut = self.unframe(id, &rec.bytes)?;
                return Ok(Some(Some(nut)));
            }
        }
        Ok(None)
    }

    /// Rewrite live records into a fresh file, swap it in, and rebuild the
    /// index. Serialized against writers via the exclusive mapping lock.
    pub fn compact(&self) -> AcornResult<()> {
        self.inner.ensure_loaded()?;
        self.inner.ensure_writable()?;
        self.inner.flush_pending()?;

        let _flush_guard = self.inner.flush_lock.lock();
        let mut map = self.inner.map.write();

        let mut entries: Vec<(String, IndexEntry)> = self
            .inner
            .index
            .iter()
            .map(|kv| (kv.key().clone(), *kv.value()))
            .collect();
        entries.sort_by_key(|(_, entry)| entry.offset);

        let mut compacted = Vec::new();
        let mut new_entries = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            let start = compacted.len() as u64;
            compacted.extend_from_slice(
                &map[entry.offset as usize..(entry.offset + entry.len as u64) as usize],
            );
            new_entries.push((id, IndexEntry { offset: start, ..entry }));
        }

        let new_capacity = self.inner.opts.initial_capacity.max(compacted.len() as u64).max(record::HEADER_LEN as u64);
        let tmp_path = self.inner.path.with_extension("compact");
        std::fs::write(&tmp_path, &compacted)?;
        std::fs::rename(&tmp_path, &self.inner.path)?;

        let file = OpenOptions::new().read(true).write(true).open(&self.inner.path)?;
        file.set_len(new_capacity)?;
        file.sync_all()?;
        *map = unsafe { MmapMut::map_mut(&file)? };
        *self.inner.file.lock() = file;

        self.inner.index.clear();
        for (id, entry) in new_entries {
            self.inner.index.insert(id, entry);
        }
        self.inner.cursor.store(compacted.len() as u64, Ordering::Release);
        self.inner.capacity.store(new_capacity, Ordering::Release);
        debug!(path = %self.inner.path.display(), live_bytes = compacted.len(), "compaction complete");
        Ok(())
    }
}

impl<T> Trunk<T> for BTreeTrunk<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn stash(&self, id: &str, nut: Nut<T>) -> AcornResult<()> {
        self.inner.ensure_loaded()?;
        self.inner.ensure_writable()?;
        let bytes = self.frame(&nut)?;
        if self.inner.opts.batching {
            return self.enqueue(PendingRecord {
                id: id.to_string(),
                tombstone: false,
                bytes,
            });
        }
        let offset = self.inner.append_bytes(&bytes)?;
        match record::decode(&bytes) {
            record::DecodeOutcome::Record { record, consumed } => {
                self.inner.index.insert(
                    id.to_string(),
                    IndexEntry {
                        offset,
                        len: consumed as u32,
                        timestamp: record.timestamp,
                        version: record.version,
                    },
                );
                Ok(())
            }
            _ => Err(AcornError::CorruptRecord("framing produced an unreadable record".into())),
        }
    }

    fn crack(&self, id: &str) -> AcornResult<Option<Nut<T>>> {
        self.inner.ensure_loaded()?;
        if self.inner.opts.batching {
            if let Some(outcome) = self.pending_nut(id)? {
                return Ok(outcome);
            }
        }
        let Some(entry) = self.inner.index.get(id).map(|kv| *kv.value()) else {
            return Ok(None);
        };
        let bytes = self.inner.read_entry(entry);
        self.unframe(id, &bytes).map(Some)
    }

    fn toss(&self, id: &str) -> AcornResult<()> {
        self.inner.ensure_loaded()?;
        self.inner.ensure_writable()?;
        let version = self.inner.index.get(id).map(|kv| kv.value().version + 1).unwrap_or(1);
        let now = time_now_nanos();
        let bytes = record::encode(version, now, id, b"");
        if self.inner.opts.batching {
            // The tombstone is appended rather than scrubbing pending
            // records: reads scan pending newest-first, so it masks any
            // queued write, and replay order settles the index.
            self.inner.index.remove(id);
            return self.enqueue(PendingRecord {
                id: id.to_string(),
                tombstone: true,
                bytes,
            });
        }
        self.inner.append_bytes(&bytes)?;
        self.inner.index.remove(id);
        Ok(())
    }

    fn crack_all(&self) -> AcornResult<Vec<Nut<T>>> {
        self.inner.ensure_loaded()?;
        if self.inner.opts.batching {
            self.inner.flush_pending()?;
        }
        let entries: Vec<(String, IndexEntry)> = self
            .inner
            .index
            .iter()
            .map(|kv| (kv.key().clone(), *kv.value()))
            .collect();
        let mut nuts = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            let bytes = self.inner.read_entry(entry);
            nuts.push(self.unframe(&id, &bytes)?);
        }
        Ok(nuts)
    }

    fn capabilities(&self) -> TrunkCapabilities {
        TrunkCapabilities {
            history: false,
            sync: true,
            durable: true,
            async_io: false,
        }
    }

    fn add_root(&self, root: Arc<dyn Root>) -> AcornResult<()> {
        self.inner.chain.add(root);
        Ok(())
    }

    fn remove_root(&self, name: &str) -> AcornResult<bool> {
        Ok(self.inner.chain.remove(name))
    }

    fn roots(&self) -> Vec<RootInfo> {
        self.inner.chain.infos()
    }

    fn flush(&self) -> AcornResult<()> {
        self.inner.ensure_loaded()?;
        self.inner.flush_pending()?;
        self.inner.map.read().flush()?;
        self.inner.file.lock().sync_data()?;
        Ok(())
    }
}

impl<T> Drop for BTreeTrunk<T> {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        let _ = self.wake_tx.try_send(());
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        if self.inner.loaded.load(Ordering::Acquire) {
            if let Err(err) = self.inner.flush_pending() {
                warn!(path = %self.inner.path.display(), %err, "final flush failed");
            }
            let _ = self.inner.map.read().flush();
        }
    }
}

fn time_now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

fn spawn_flusher(inner: Arc<Inner>, wake_rx: Receiver<()>) -> AcornResult<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("acorn-btree-flusher".to_string())
        .spawn(move || loop {
            let woke = wake_rx.recv_timeout(inner.opts.flush_interval);
            if inner.stop.load(Ordering::Acquire) {
                break;
            }
            match woke {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {
                    if inner.loaded.load(Ordering::Acquire) {
                        if let Err(err) = inner.flush_pending() {
                            warn!(path = %inner.path.display(), %err, "background flush failed");
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use acorn_core::RootContext;
    use std::sync::Arc;

    fn small_opts() -> BTreeTrunkOptions {
        BTreeTrunkOptions {
            initial_capacity: 4096,
            batching: false,
            ..BTreeTrunkOptions::default()
        }
    }

    fn nut(id: &str, payload: &str, version: u64) -> Nut<String> {
        let mut nut = Nut::new(id, payload.to_string(), "node-a");
        nut.version = version;
        nut
    }

    #[test]
    fn stash_crack_toss_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let trunk: BTreeTrunk<String> =
            BTreeTrunk::open_with(dir.path().join("t.acorn"), small_opts()).unwrap();

        trunk.stash("k", nut("k", "v", 1)).unwrap();
        assert_eq!(trunk.crack("k").unwrap().unwrap().payload.as_deref(), Some("v"));

        trunk.toss("k").unwrap();
        assert!(trunk.crack("k").unwrap().is_none());
        assert!(matches!(trunk.history("k"), Err(AcornError::Unsupported(_))));
    }

    #[test]
    fn expansion_preserves_all_writes() {
        let dir = tempfile::tempdir().unwrap();
        let trunk: BTreeTrunk<String> =
            BTreeTrunk::open_with(dir.path().join("t.acorn"), small_opts()).unwrap();
        let initial = trunk.capacity();

        let blob = "x".repeat(512);
        for i in 0..64 {
            trunk.stash(&format!("k{i}"), nut(&format!("k{i}"), &blob, 1)).unwrap();
        }
        assert!(trunk.capacity() > initial, "mapping should have doubled");
        for i in 0..64 {
            let got = trunk.crack(&format!("k{i}")).unwrap().unwrap();
            assert_eq!(got.payload.as_deref(), Some(blob.as_str()));
        }
    }

    #[test]
    fn deletes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.acorn");
        {
            let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, small_opts()).unwrap();
            trunk.stash("keep", nut("keep", "v", 1)).unwrap();
            trunk.stash("gone", nut("gone", "v", 1)).unwrap();
            trunk.toss("gone").unwrap();
            trunk.flush().unwrap();
        }
        let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, small_opts()).unwrap();
        assert!(trunk.crack("keep").unwrap().is_some());
        assert!(trunk.crack("gone").unwrap().is_none());
    }

    #[test]
    fn corrupt_tail_is_skipped_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.acorn");
        let valid_end;
        {
            let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, small_opts()).unwrap();
            trunk.stash("a", nut("a", "1", 1)).unwrap();
            trunk.stash("b", nut("b", "2", 1)).unwrap();
            trunk.flush().unwrap();
            valid_end = trunk.inner.cursor.load(Ordering::Acquire) as usize;
        }
        // Scribble a half-written record header right after the valid data.
        {
            let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let mut map = unsafe { MmapMut::map_mut(&file).unwrap() };
            map[valid_end..valid_end + 4].copy_from_slice(&MAGIC.to_le_bytes());
            map[valid_end + 4..valid_end + 8].copy_from_slice(&1u32.to_le_bytes());
            map.flush().unwrap();
        }

        let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, small_opts()).unwrap();
        assert!(trunk.crack("a").unwrap().is_some());
        assert!(trunk.crack("b").unwrap().is_some());
        assert_eq!(trunk.entry_count(), 2);

        // Default policy: corruption beyond the valid prefix makes the trunk
        // read-only, so the damaged region is never silently overwritten.
        let err = trunk.stash("c", nut("c", "3", 1)).unwrap_err();
        assert!(matches!(err, AcornError::PermanentIo(_)));
    }

    #[test]
    fn overwrite_policy_resumes_writing_at_last_valid_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.acorn");
        let opts = BTreeTrunkOptions {
            read_only_on_corruption: false,
            ..small_opts()
        };
        let valid_end;
        {
            let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, opts.clone()).unwrap();
            trunk.stash("a", nut("a", "1", 1)).unwrap();
            trunk.flush().unwrap();
            valid_end = trunk.inner.cursor.load(Ordering::Acquire) as usize;
        }
        {
            let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let mut map = unsafe { MmapMut::map_mut(&file).unwrap() };
            map[valid_end..valid_end + 8].copy_from_slice(b"garbage!");
            map.flush().unwrap();
        }

        let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, opts.clone()).unwrap();
        trunk.stash("b", nut("b", "2", 1)).unwrap();
        trunk.flush().unwrap();
        drop(trunk);

        // The fresh record overwrote the garbage, so replay now sees both.
        let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, opts).unwrap();
        assert!(trunk.crack("a").unwrap().is_some());
        assert!(trunk.crack("b").unwrap().is_some());
    }

    #[test]
    fn root_chain_round_trips_through_mapping() {
        struct XorRoot;

        impl Root for XorRoot {
            fn name(&self) -> &str {
                "xor"
            }

            fn sequence(&self) -> u32 {
                200
            }

            fn on_stash(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
                Ok(bytes.iter().map(|b| b ^ 0x77).collect())
            }

            fn on_crack(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
                Ok(bytes.iter().map(|b| b ^ 0x77).collect())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let trunk: BTreeTrunk<String> =
            BTreeTrunk::open_with(dir.path().join("t.acorn"), small_opts()).unwrap();
        // Root registered before the deferred index load runs.
        trunk.add_root(Arc::new(XorRoot)).unwrap();
        trunk.stash("k", nut("k", "hidden", 1)).unwrap();
        assert_eq!(trunk.crack("k").unwrap().unwrap().payload.as_deref(), Some("hidden"));
        assert_eq!(trunk.roots().len(), 1);
    }

    #[test]
    fn compaction_reclaims_space_and_keeps_live_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.acorn");
        let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, small_opts()).unwrap();

        for i in 0..20 {
            trunk.stash("churn", nut("churn", &format!("v{i}"), i + 1)).unwrap();
        }
        trunk.stash("keep", nut("keep", "stable", 1)).unwrap();
        let before = trunk.inner.cursor.load(Ordering::Acquire);

        trunk.compact().unwrap();
        let after = trunk.inner.cursor.load(Ordering::Acquire);
        assert!(after < before, "compaction should shrink the live region");
        assert_eq!(trunk.crack("churn").unwrap().unwrap().payload.as_deref(), Some("v19"));
        assert_eq!(trunk.crack("keep").unwrap().unwrap().payload.as_deref(), Some("stable"));

        // And the compacted file replays cleanly.
        drop(trunk);
        let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, small_opts()).unwrap();
        assert_eq!(trunk.entry_count(), 2);
    }

    #[test]
    fn contract_checks_pass() {
        let dir = tempfile::tempdir().unwrap();
        let a: BTreeTrunk<String> =
            BTreeTrunk::open_with(dir.path().join("a.acorn"), small_opts()).unwrap();
        let b: BTreeTrunk<String> =
            BTreeTrunk::open_with(dir.path().join("b.acorn"), small_opts()).unwrap();
        acorn_test_harness::TrunkContract::round_trip(&a).unwrap();
        acorn_test_harness::TrunkContract::export_import(&a, &b).unwrap();
    }

    #[test]
    fn batched_writes_are_readable_before_flush() {
        let dir = tempfile::tempdir().unwrap();
        let opts = BTreeTrunkOptions {
            initial_capacity: 4096,
            batching: true,
            batch_threshold: 1000,
            flush_interval: Duration::from_secs(60),
            ..BTreeTrunkOptions::default()
        };
        let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(dir.path().join("t.acorn"), opts).unwrap();

        trunk.stash("k", nut("k", "pending", 1)).unwrap();
        assert_eq!(trunk.crack("k").unwrap().unwrap().payload.as_deref(), Some("pending"));

        trunk.toss("k").unwrap();
        assert!(trunk.crack("k").unwrap().is_none());
    }
}
