//! The engine facade (C7's `Set`/`Delete`/`BatchWrite`, plus the collection
//! client surface of §6) and engine lifecycle (open/close, background
//! threads).
//!
//! Grounded on `datastore.rs`'s `DataStore`/`DataStoreImpl` split -- a thin,
//! `Clone`-able handle (`Engine`) wrapping an `Arc<EngineInner>` -- and its
//! `lazy_static! DATASTORE_MAP` registry, generalized here to key by
//! canonicalized instance path so two `Engine::open` calls against the same
//! directory within one process share state instead of mapping the file
//! twice. The write path itself is grounded on `chunk_store.rs::insert_chunk`
//! (allocate, write, publish under a lock, handle the "already present"
//! case) and `original_source/engine/kv_engine.hpp`'s
//! `StringSetImpl`/`BatchWriteHint`/`StringBatchWriteImpl`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{error, info, warn};
use proxmox_sys::process_locker::{ProcessLockExclusiveGuard, ProcessLocker};

use pmemkv_types::{
    check_key_size, check_value_size, CollectionKind, EngineConfig, EngineError, RecordType,
    Result, TypeMask,
};

use crate::allocator::{Extent, PmemAllocator, PmemOffset};
use crate::batch::{BatchEntry, PendingBatch};
use crate::cleaner::{Cleaner, PendingFree};
use crate::collections::{decode_collection_id, encode_collection_id, CollectionRegistry};
use crate::dram_chunk::DramChunkAllocator;
use crate::hash_index::{HashIndex, Lookup};
use crate::layout;
use crate::record::{self, RecordView};
use crate::recovery;
use crate::thread_manager::ThreadManager;
use crate::version_controller::{Snapshot, VersionController};

/// How often the background coordinator wakes the cleaner and runs
/// allocator fragmentation merging.
const COORDINATOR_PERIOD: Duration = Duration::from_millis(200);

lazy_static! {
    static ref ENGINE_REGISTRY: Mutex<HashMap<PathBuf, Arc<EngineInner>>> = Mutex::new(HashMap::new());
}

struct EngineInner {
    instance_dir: PathBuf,
    config: EngineConfig,
    allocator: PmemAllocator,
    hash_index: HashIndex,
    thread_manager: ThreadManager,
    version_controller: VersionController,
    cleaner: Cleaner,
    dram_chunk: DramChunkAllocator,
    collections: Mutex<CollectionRegistry>,
    is_backup: bool,
    closing: AtomicBool,
    bg_cv: Condvar,
    bg_mutex: Mutex<()>,
    bg_threads: Mutex<Vec<JoinHandle<()>>>,
    _lock_guard: ProcessLockExclusiveGuard,
}

/// A handle to an open instance. Cheap to clone; clones share the same
/// underlying state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Opens (creating if absent) the instance at `path`.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Engine> {
        let path = path.as_ref();
        layout::ensure_instance_dirs(path)?;
        let canonical = path
            .canonicalize()
            .map_err(EngineError::Io)?;

        {
            let registry = ENGINE_REGISTRY.lock().unwrap();
            if let Some(inner) = registry.get(&canonical) {
                return Ok(Engine { inner: inner.clone() });
            }
        }

        let inner = Arc::new(Self::open_fresh(&canonical, config)?);
        Self::spawn_background_threads(&inner);

        let mut registry = ENGINE_REGISTRY.lock().unwrap();
        let inner = registry.entry(canonical).or_insert(inner).clone();
        Ok(Engine { inner })
    }

    fn open_fresh(instance_dir: &Path, config: EngineConfig) -> Result<EngineInner> {
        let locker = ProcessLocker::new(layout::lock_file(instance_dir))
            .map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))?;
        let lock_guard = ProcessLocker::try_exclusive_lock(locker)
            .map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))?;

        let data_path = layout::data_file(instance_dir);
        let config_path = layout::config_file(instance_dir);
        let is_fresh = !data_path.exists();

        let (config, max_recoverable_ts) = if is_fresh {
            let data = serde_json::to_vec_pretty(&config)
                .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            std::fs::write(&config_path, data)?;
            (config, u64::MAX)
        } else {
            let on_disk: EngineConfig = serde_json::from_slice(&std::fs::read(&config_path)?)
                .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            config.check_compatible(&on_disk)?;

            let backup_mark = layout::backup_mark_file(instance_dir);
            let max_recoverable_ts = if backup_mark.exists() {
                let bytes = std::fs::read(&backup_mark)?;
                u64::from_le_bytes(bytes[..8].try_into().map_err(|_| {
                    EngineError::InvalidConfiguration("truncated backup_mark file".into())
                })?)
            } else {
                u64::MAX
            };
            (on_disk, max_recoverable_ts)
        };

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)?;
        let allocator = PmemAllocator::open(
            &file,
            config.pmem_file_size,
            config.block_size,
            config.blocks_per_segment,
            config.max_blocks_per_extent,
            config.max_access_threads as usize,
        )?;

        let hash_index = HashIndex::new(config.hash_index_buckets as usize);
        let version_controller = VersionController::new(config.max_access_threads as usize);
        let thread_manager = ThreadManager::new(config.max_access_threads as usize);
        let cleaner = Cleaner::new(config.max_access_threads as usize);
        let dram_chunk = DramChunkAllocator::new(config.max_access_threads as usize);
        let mut collections = CollectionRegistry::new();

        if !is_fresh {
            let recovered = recovery::recover(
                instance_dir,
                &allocator,
                &hash_index,
                &mut collections,
                &cleaner,
                max_recoverable_ts,
            )?;
            version_controller.seed(recovered.max_ts);
            info!(
                "recovered instance at {:?}: latest timestamp {}",
                instance_dir, recovered.max_ts
            );
        }

        Ok(EngineInner {
            instance_dir: instance_dir.to_path_buf(),
            config,
            allocator,
            hash_index,
            thread_manager,
            version_controller,
            cleaner,
            dram_chunk,
            collections: Mutex::new(collections),
            is_backup: max_recoverable_ts != u64::MAX,
            closing: AtomicBool::new(false),
            bg_cv: Condvar::new(),
            bg_mutex: Mutex::new(()),
            bg_threads: Mutex::new(Vec::new()),
            _lock_guard: lock_guard,
        })
    }

    fn spawn_background_threads(inner: &Arc<EngineInner>) {
        let coordinator_inner = inner.clone();
        let coordinator = std::thread::spawn(move || {
            while !coordinator_inner.closing.load(Ordering::Relaxed) {
                let guard = coordinator_inner.bg_mutex.lock().unwrap();
                let _ = coordinator_inner.bg_cv.wait_timeout(guard, COORDINATOR_PERIOD);
                if coordinator_inner.closing.load(Ordering::Relaxed) {
                    break;
                }
                coordinator_inner
                    .cleaner
                    .tick(&coordinator_inner.version_controller, &coordinator_inner.allocator, &coordinator_inner.hash_index);
                coordinator_inner.allocator.background_work();
            }
        });
        inner.bg_threads.lock().unwrap().push(coordinator);
    }

    /// Closes the instance: stops background threads, drops the instance
    /// lock, and unmaps the persistent region. Any call in progress on
    /// another clone of this handle completes normally; subsequent calls
    /// through a clone observe state as it was at the moment of close.
    pub fn close(self) -> Result<()> {
        let canonical = self.inner.instance_dir.clone();
        let mut registry = ENGINE_REGISTRY.lock().unwrap();
        registry.remove(&canonical);
        drop(registry);

        self.inner.closing.store(true, Ordering::Relaxed);
        self.inner.bg_cv.notify_all();
        let mut threads = self.inner.bg_threads.lock().unwrap();
        for handle in threads.drain(..) {
            if let Err(e) = handle.join() {
                warn!("background thread for {:?} panicked: {:?}", canonical, e);
            }
        }
        Ok(())
    }

    fn thread_id(&self) -> Result<usize> {
        self.inner.thread_manager.maybe_initialize_access()
    }

    pub fn release_access_thread(&self) {
        self.inner.thread_manager.release();
    }

    fn reject_if_backup(&self) -> Result<()> {
        if self.inner.is_backup {
            return Err(EngineError::InvalidConfiguration(
                "instance is a read-only backup".into(),
            ));
        }
        Ok(())
    }

    // ---- snapshots ----------------------------------------------------

    pub fn get_snapshot(&self) -> Result<Snapshot> {
        let tid = self.thread_id()?;
        Ok(self.inner.version_controller.make_snapshot(tid))
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        self.inner.version_controller.release_snapshot(snapshot);
    }

    // ---- anonymous strings (§4.7) --------------------------------------

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get_versioned(key, None)
    }

    pub fn get_at(&self, key: &[u8], snapshot: &Snapshot) -> Result<Vec<u8>> {
        self.get_versioned(key, Some(snapshot.ts))
    }

    fn get_versioned(&self, key: &[u8], snapshot_ts: Option<u64>) -> Result<Vec<u8>> {
        check_key_size(key)?;
        let fp = HashIndex::fingerprint(key);
        let hint = self.inner.hash_index.acquire_fingerprint(fp);
        let (status, entry) = self.inner.hash_index.search(&hint, fp, TypeMask::String);
        let payload = match status {
            Lookup::Found(_) => entry.unwrap().payload,
            _ => return Err(EngineError::NotFound),
        };
        drop(hint);

        self.resolve_string(key, payload, snapshot_ts)
            .ok_or(EngineError::NotFound)
    }

    /// Reads back the record at `offset` and reports whether its key bytes
    /// match `expected`, guarding every hash-index hit (string or
    /// collection-header) against a fingerprint collision before the caller
    /// trusts it (`hash_index.rs`'s "the write path is responsible for
    /// reading the candidate record back and comparing its actual key
    /// bytes").
    fn key_matches(&self, offset: PmemOffset, expected: &[u8]) -> Result<bool> {
        let max_blocks = self.inner.allocator.max_blocks_per_extent();
        let window = unsafe { self.inner.allocator.read_window(offset, max_blocks) };
        let view = RecordView::parse(window)
            .ok_or_else(|| EngineError::Abort("hash-index entry failed checksum validation".into()))?;
        Ok(view.key() == expected)
    }

    /// Looks up the current string-space entry for `key` under an
    /// already-acquired bucket lock, verifying the fingerprint hit's key
    /// bytes so a collision never causes one key's write to land on
    /// another's record.
    fn find_string_entry(
        &self,
        hint: &crate::hash_index::BucketGuard<'_>,
        fp: u64,
        key: &[u8],
    ) -> Result<Option<(usize, crate::hash_index::Entry)>> {
        let (status, entry) = self.inner.hash_index.search(hint, fp, TypeMask::String);
        match status {
            Lookup::Found(pos) => {
                let entry = entry.unwrap();
                if self.key_matches(entry.payload, key)? {
                    Ok(Some((pos, entry)))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    /// Walks the `version_prev` chain from `head` until it finds the record
    /// visible to `snapshot_ts` (or the head itself, with no snapshot).
    /// Verifies the head's key bytes match `expected_key` to guard against a
    /// fingerprint collision in the hash index.
    fn resolve_string(&self, expected_key: &[u8], head: PmemOffset, snapshot_ts: Option<u64>) -> Option<Vec<u8>> {
        let max_blocks = self.inner.allocator.max_blocks_per_extent();
        let mut offset = head;
        let mut checked_key = false;
        loop {
            if offset.is_null() {
                return None;
            }
            let window = unsafe { self.inner.allocator.read_window(offset, max_blocks) };
            let view = RecordView::parse(window)?;
            if !checked_key {
                if view.key() != expected_key {
                    return None;
                }
                checked_key = true;
            }
            if let Some(ts) = snapshot_ts {
                if view.timestamp() > ts {
                    let prev = view.version_prev();
                    if prev == 0 {
                        return None;
                    }
                    offset = PmemOffset(prev);
                    continue;
                }
            }
            return if view.record_type().is_delete() {
                None
            } else {
                Some(view.value().to_vec())
            };
        }
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.reject_if_backup()?;
        check_key_size(key)?;
        check_value_size(value)?;

        let tid = self.thread_id()?;
        let ts = self.inner.version_controller.new_timestamp();
        self.write_string(tid, ts, key, Some(value))
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.reject_if_backup()?;
        check_key_size(key)?;

        let tid = self.thread_id()?;
        let fp = HashIndex::fingerprint(key);
        {
            let hint = self.inner.hash_index.acquire_fingerprint(fp);
            if self.find_string_entry(&hint, fp, key)?.is_none() {
                return Err(EngineError::NotFound);
            }
        }
        let ts = self.inner.version_controller.new_timestamp();
        self.write_string(tid, ts, key, None)
    }

    /// Shared tail of `Set`/`Delete`: allocate, persist, publish through the
    /// hash index, enqueue the superseded record for delayed free.
    fn write_string(&self, tid: usize, ts: u64, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let fp = HashIndex::fingerprint(key);
        let value_bytes = value.unwrap_or(&[]);
        let record_type = if value.is_some() { RecordType::StringRecord } else { RecordType::StringDeleteRecord };

        let mut hint = self.inner.hash_index.acquire_fingerprint(fp);
        let found = self.find_string_entry(&hint, fp, key)?;
        let version_prev = found.map_or(0, |(_, e)| e.payload.0);

        let needed = record::encoded_len(key.len(), value_bytes.len(), false);
        let extent = self.inner.allocator.allocate(tid, needed)?;
        {
            let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
            record::persist(bytes, extent.blocks, ts, record_type, version_prev, key, value_bytes, None);
        }

        match found {
            Some((pos, old)) => {
                self.inner.hash_index.replace(&mut hint, pos, record_type, extent.offset);
                drop(hint);
                self.enqueue_old_string(tid, old.payload, old.record_type, fp, ts)?;
            }
            None => {
                self.inner.hash_index.insert(&mut hint, fp, record_type, extent.offset);
                drop(hint);
            }
        }
        Ok(())
    }

    fn enqueue_old_string(&self, tid: usize, offset: PmemOffset, record_type: RecordType, fingerprint: u64, superseding_ts: u64) -> Result<()> {
        let max_blocks = self.inner.allocator.max_blocks_per_extent();
        let window = unsafe { self.inner.allocator.read_window(offset, max_blocks) };
        let view = RecordView::parse(window).ok_or_else(|| {
            EngineError::Abort("superseded record failed checksum validation before free".into())
        })?;
        let pf = PendingFree { offset, blocks: view.record_size_blocks(), fingerprint, superseding_ts };
        if record_type.is_delete() {
            self.inner.cleaner.enqueue_delete(tid, pf);
        } else {
            self.inner.cleaner.enqueue_data(tid, pf);
        }
        Ok(())
    }

    /// An old collection element has no hash-index entry to clean up (only
    /// the top-level anonymous-string space and collection descriptors are
    /// registered in the hash index), so it always goes through the plain
    /// data queue regardless of its own record type.
    fn enqueue_old_element(&self, tid: usize, offset: PmemOffset, superseding_ts: u64) -> Result<()> {
        let max_blocks = self.inner.allocator.max_blocks_per_extent();
        let window = unsafe { self.inner.allocator.read_window(offset, max_blocks) };
        let view = RecordView::parse(window).ok_or_else(|| {
            EngineError::Abort("superseded element record failed checksum validation before free".into())
        })?;
        self.inner.cleaner.enqueue_data(tid, PendingFree { offset, blocks: view.record_size_blocks(), fingerprint: 0, superseding_ts });
        Ok(())
    }

    pub fn batch_write(&self, entries: &[BatchEntry]) -> Result<()> {
        self.reject_if_backup()?;
        for e in entries {
            check_key_size(&e.key)?;
            if let Some(v) = &e.value {
                check_value_size(v)?;
            }
        }

        let tid = self.thread_id()?;

        let mut allocated = Vec::with_capacity(entries.len());
        for e in entries {
            let needed = record::encoded_len(e.key.len(), e.value.as_deref().unwrap_or(&[]).len(), false);
            match self.inner.allocator.allocate(tid, needed) {
                Ok(extent) => allocated.push(extent),
                Err(err) => {
                    for extent in allocated {
                        self.inner.allocator.free(tid, extent);
                    }
                    return Err(err);
                }
            }
        }

        let ts = self.inner.version_controller.new_timestamp();

        let journal_path = layout::pending_batch_file(&self.inner.instance_dir, tid);
        let journal = PendingBatch::new(ts, allocated.clone());
        if let Err(err) = journal.persist(&journal_path) {
            for extent in allocated {
                self.inner.allocator.free(tid, extent);
            }
            return Err(err);
        }

        for (entry, extent) in entries.iter().zip(allocated.iter()) {
            self.apply_batch_entry(tid, ts, entry, *extent)?;
        }

        PendingBatch::remove(&journal_path)?;
        Ok(())
    }

    fn apply_batch_entry(&self, tid: usize, ts: u64, entry: &BatchEntry, extent: Extent) -> Result<()> {
        let fp = HashIndex::fingerprint(&entry.key);
        let value_bytes = entry.value.as_deref().unwrap_or(&[]);
        let record_type = if entry.value.is_some() { RecordType::StringRecord } else { RecordType::StringDeleteRecord };

        let mut hint = self.inner.hash_index.acquire_fingerprint(fp);
        let found = self.find_string_entry(&hint, fp, &entry.key)?;
        let version_prev = found.map_or(0, |(_, e)| e.payload.0);

        {
            let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
            record::persist(bytes, extent.blocks, ts, record_type, version_prev, &entry.key, value_bytes, None);
        }

        match found {
            Some((pos, old)) => {
                self.inner.hash_index.replace(&mut hint, pos, record_type, extent.offset);
                drop(hint);
                self.enqueue_old_string(tid, old.payload, old.record_type, fp, ts)?;
            }
            None => {
                self.inner.hash_index.insert(&mut hint, fp, record_type, extent.offset);
                drop(hint);
            }
        }
        Ok(())
    }

    // ---- collections facade (SPEC_FULL.md §4.11) -----------------------

    fn collection_header_type(kind: CollectionKind) -> RecordType {
        match kind {
            CollectionKind::Sorted => RecordType::SortedHeaderRecord,
            CollectionKind::Hash => RecordType::HashHeaderRecord,
            CollectionKind::Queue => RecordType::QueueHeaderRecord,
        }
    }

    fn type_mask_for(kind: CollectionKind) -> TypeMask {
        match kind {
            CollectionKind::Sorted => TypeMask::Sorted,
            CollectionKind::Hash => TypeMask::Hash,
            CollectionKind::Queue => TypeMask::Queue,
        }
    }

    /// Looks up a collection descriptor under an already-acquired bucket
    /// lock, verifying the fingerprint hit's name bytes -- the same
    /// collision guard `find_string_entry` applies to the string space,
    /// generalized to collection headers.
    fn find_collection_header_locked(
        &self,
        hint: &crate::hash_index::BucketGuard<'_>,
        fp: u64,
        name: &[u8],
        kind: CollectionKind,
    ) -> Result<Option<PmemOffset>> {
        let (status, entry) = self.inner.hash_index.search(hint, fp, Self::type_mask_for(kind));
        match status {
            Lookup::Found(_) => {
                let entry = entry.unwrap();
                if self.key_matches(entry.payload, name)? {
                    Ok(Some(entry.payload))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    /// Looks up a collection descriptor by name without creating it.
    fn find_collection(&self, name: &[u8], kind: CollectionKind) -> Result<Option<(u64, PmemOffset)>> {
        let fp = HashIndex::collection_fingerprint(name, kind as u8);
        let hint = self.inner.hash_index.acquire_fingerprint(fp);
        let found = self.find_collection_header_locked(&hint, fp, name, kind)?;
        drop(hint);
        match found {
            Some(offset) => Ok(Some((self.read_header_id(offset)?, offset))),
            None => Ok(None),
        }
    }

    /// Looks up a collection descriptor by name, creating it (and a fresh
    /// collection id) on first use. Grounded on `kv_engine.hpp`'s
    /// `SearchOrInitCollection`.
    fn find_or_create_collection(&self, tid: usize, name: &[u8], kind: CollectionKind) -> Result<(u64, PmemOffset)> {
        check_key_size(name)?;
        if let Some(found) = self.find_collection(name, kind)? {
            return Ok(found);
        }

        let fp = HashIndex::collection_fingerprint(name, kind as u8);
        let header_type = Self::collection_header_type(kind);
        let ts = self.inner.version_controller.new_timestamp();
        let id = self.inner.collections.lock().unwrap().alloc_id();
        let value = id.to_le_bytes();
        let needed = record::encoded_len(name.len(), value.len(), true);
        let extent = self.inner.allocator.allocate(tid, needed)?;
        {
            let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
            record::persist(bytes, extent.blocks, ts, header_type, 0, name, &value, Some((0, 0)));
        }

        let mut hint = self.inner.hash_index.acquire_fingerprint(fp);
        if let Some(existing_offset) = self.find_collection_header_locked(&hint, fp, name, kind)? {
            // lost the race to another thread creating the same collection.
            drop(hint);
            self.inner.allocator.free(tid, extent);
            return Ok((self.read_header_id(existing_offset)?, existing_offset));
        }
        self.inner.hash_index.insert(&mut hint, fp, header_type, extent.offset);
        Ok((id, extent.offset))
    }

    fn read_header_id(&self, offset: PmemOffset) -> Result<u64> {
        let max_blocks = self.inner.allocator.max_blocks_per_extent();
        let window = unsafe { self.inner.allocator.read_window(offset, max_blocks) };
        let view = RecordView::parse(window)
            .ok_or_else(|| EngineError::Abort("collection header failed checksum validation".into()))?;
        Ok(u64::from_le_bytes(view.value()[..8].try_into().unwrap()))
    }

    pub fn sset(&self, collection: &[u8], user_key: &[u8], value: &[u8]) -> Result<()> {
        self.reject_if_backup()?;
        check_key_size(user_key)?;
        check_value_size(value)?;
        let tid = self.thread_id()?;
        let (id, _header) = self.find_or_create_collection(tid, collection, CollectionKind::Sorted)?;
        let ts = self.inner.version_controller.new_timestamp();

        let previous = self.inner.collections.lock().unwrap().sorted_mut(id).by_key.get(user_key).copied();
        let packed = encode_collection_id(id, value);
        let needed = record::encoded_len(user_key.len(), packed.len(), true);
        let extent = self.inner.allocator.allocate(tid, needed)?;
        {
            let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
            record::persist(bytes, extent.blocks, ts, RecordType::SortedDataRecord, previous.map_or(0, |o| o.0), user_key, &packed, Some((0, 0)));
        }
        self.inner.collections.lock().unwrap().sorted_mut(id).by_key.insert(user_key.to_vec(), extent.offset);
        if let Some(old) = previous {
            self.enqueue_old_element(tid, old, ts)?;
        }
        Ok(())
    }

    pub fn sget(&self, collection: &[u8], user_key: &[u8]) -> Result<Vec<u8>> {
        let (id, _header) = self.find_collection(collection, CollectionKind::Sorted)?.ok_or(EngineError::NotFound)?;

        let offset = self.inner.collections.lock().unwrap().sorted(id).and_then(|c| c.by_key.get(user_key).copied());
        let offset = offset.ok_or(EngineError::NotFound)?;
        self.read_element_value(offset)
    }

    pub fn sdelete(&self, collection: &[u8], user_key: &[u8]) -> Result<()> {
        self.reject_if_backup()?;
        let tid = self.thread_id()?;
        let (id, _) = self.find_or_create_collection(tid, collection, CollectionKind::Sorted)?;
        let existing = self.inner.collections.lock().unwrap().sorted_mut(id).by_key.remove(user_key);
        let existing = existing.ok_or(EngineError::NotFound)?;

        let ts = self.inner.version_controller.new_timestamp();
        let packed_id = id.to_le_bytes();
        let needed = record::encoded_len(user_key.len(), packed_id.len(), true);
        let extent = self.inner.allocator.allocate(tid, needed)?;
        {
            let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
            record::persist(bytes, extent.blocks, ts, RecordType::SortedDeleteRecord, existing.0, user_key, &packed_id, Some((0, 0)));
        }
        self.enqueue_old_element(tid, existing, ts)
    }

    /// All (key, value) pairs currently visible in `collection`, in key
    /// order. Scratch copies are taken through the per-thread DRAM chunk
    /// allocator (C2), matching its role as the allocator backing transient
    /// volatile collection-iteration state.
    pub fn new_sorted_iterator(&self, collection: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tid = self.thread_id()?;
        let id = match self.find_collection(collection, CollectionKind::Sorted)? {
            Some((id, _)) => id,
            None => return Ok(Vec::new()),
        };

        let offsets: Vec<(Vec<u8>, PmemOffset)> = {
            let registry = self.inner.collections.lock().unwrap();
            match registry.sorted(id) {
                Some(c) => c.by_key.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                None => Vec::new(),
            }
        };

        let mut out = Vec::with_capacity(offsets.len());
        for (key, offset) in offsets {
            let value = self.read_element_value(offset)?;
            let scratch = self.inner.dram_chunk.allocate(tid, value.len());
            let mut buf = scratch.into_vec();
            buf[..value.len()].copy_from_slice(&value);
            buf.truncate(value.len());
            out.push((key, buf));
        }
        Ok(out)
    }

    pub fn hset(&self, collection: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        self.reject_if_backup()?;
        check_key_size(key)?;
        check_value_size(value)?;
        let tid = self.thread_id()?;
        let (id, _header) = self.find_or_create_collection(tid, collection, CollectionKind::Hash)?;
        let ts = self.inner.version_controller.new_timestamp();

        let previous = self.inner.collections.lock().unwrap().hash_mut(id).by_key.get(key).copied();
        let packed = encode_collection_id(id, value);
        let needed = record::encoded_len(key.len(), packed.len(), true);
        let extent = self.inner.allocator.allocate(tid, needed)?;
        {
            let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
            record::persist(bytes, extent.blocks, ts, RecordType::HashElemRecord, previous.map_or(0, |o| o.0), key, &packed, Some((0, 0)));
        }
        self.inner.collections.lock().unwrap().hash_mut(id).by_key.insert(key.to_vec(), extent.offset);
        if let Some(old) = previous {
            self.enqueue_old_element(tid, old, ts)?;
        }
        Ok(())
    }

    pub fn hget(&self, collection: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let (id, _header) = self.find_collection(collection, CollectionKind::Hash)?.ok_or(EngineError::NotFound)?;
        let offset = self.inner.collections.lock().unwrap().hash(id).and_then(|c| c.by_key.get(key).copied());
        let offset = offset.ok_or(EngineError::NotFound)?;
        self.read_element_value(offset)
    }

    pub fn hdelete(&self, collection: &[u8], key: &[u8]) -> Result<()> {
        self.reject_if_backup()?;
        let tid = self.thread_id()?;
        let (id, _) = self.find_or_create_collection(tid, collection, CollectionKind::Hash)?;
        let existing = self.inner.collections.lock().unwrap().hash_mut(id).by_key.remove(key);
        let existing = existing.ok_or(EngineError::NotFound)?;

        let ts = self.inner.version_controller.new_timestamp();
        let packed_id = id.to_le_bytes();
        let needed = record::encoded_len(key.len(), packed_id.len(), true);
        let extent = self.inner.allocator.allocate(tid, needed)?;
        {
            let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
            record::persist(bytes, extent.blocks, ts, RecordType::HashDeleteRecord, existing.0, key, &packed_id, Some((0, 0)));
        }
        self.enqueue_old_element(tid, existing, ts)
    }

    /// No defined order, matching `spec.md` §6's `NewUnorderedIterator`.
    pub fn new_unordered_iterator(&self, collection: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tid = self.thread_id()?;
        let id = match self.find_collection(collection, CollectionKind::Hash)? {
            Some((id, _)) => id,
            None => return Ok(Vec::new()),
        };

        let offsets: Vec<(Vec<u8>, PmemOffset)> = {
            let registry = self.inner.collections.lock().unwrap();
            match registry.hash(id) {
                Some(c) => c.by_key.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                None => Vec::new(),
            }
        };

        let mut out = Vec::with_capacity(offsets.len());
        for (key, offset) in offsets {
            let value = self.read_element_value(offset)?;
            let scratch = self.inner.dram_chunk.allocate(tid, value.len());
            let mut buf = scratch.into_vec();
            buf[..value.len()].copy_from_slice(&value);
            buf.truncate(value.len());
            out.push((key, buf));
        }
        Ok(out)
    }

    fn read_element_value(&self, offset: PmemOffset) -> Result<Vec<u8>> {
        let max_blocks = self.inner.allocator.max_blocks_per_extent();
        let window = unsafe { self.inner.allocator.read_window(offset, max_blocks) };
        let view = RecordView::parse(window)
            .ok_or_else(|| EngineError::Abort("collection element failed checksum validation".into()))?;
        let (_, payload) = decode_collection_id(view.value());
        Ok(payload.to_vec())
    }

    // ---- queues ---------------------------------------------------------

    pub fn lpush(&self, collection: &[u8], value: &[u8]) -> Result<()> {
        self.push(collection, value, QueueEnd::Left)
    }

    pub fn rpush(&self, collection: &[u8], value: &[u8]) -> Result<()> {
        self.push(collection, value, QueueEnd::Right)
    }

    pub fn lpop(&self, collection: &[u8]) -> Result<Vec<u8>> {
        self.pop(collection, QueueEnd::Left)
    }

    pub fn rpop(&self, collection: &[u8]) -> Result<Vec<u8>> {
        self.pop(collection, QueueEnd::Right)
    }

    fn push(&self, collection: &[u8], value: &[u8], end: QueueEnd) -> Result<()> {
        self.reject_if_backup()?;
        check_value_size(value)?;
        let tid = self.thread_id()?;
        let (id, header_offset) = self.find_or_create_collection(tid, collection, CollectionKind::Queue)?;
        let ts = self.inner.version_controller.new_timestamp();

        let packed = encode_collection_id(id, value);
        let needed = record::encoded_len(0, packed.len(), true);
        let extent = self.inner.allocator.allocate(tid, needed)?;

        let max_blocks = self.inner.allocator.max_blocks_per_extent();
        let header_view = {
            let window = unsafe { self.inner.allocator.read_window(header_offset, max_blocks) };
            RecordView::parse(window).ok_or_else(|| EngineError::Abort("queue header failed checksum validation".into()))?
        };
        let (last, first) = (header_view.prev().unwrap(), header_view.next().unwrap());

        let (new_prev, new_next) = match end {
            QueueEnd::Left => (0u64, first),
            QueueEnd::Right => (last, 0u64),
        };

        match end {
            QueueEnd::Left => {
                // The new record's own `prev` is trivially 0 (it is the
                // leftmost element); the only real cross-record link it
                // needs is `first.prev`, which the checker tolerates
                // pending (left-only is repairable). Persist first so the
                // record exists and checksums durably before anything
                // else references it.
                {
                    let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
                    record::persist(bytes, extent.blocks, ts, RecordType::QueueElemRecord, 0, b"", &packed, Some((new_prev, new_next)));
                }
                if first != 0 {
                    self.relink_neighbor(first, Neighbor::Prev, extent.offset.0)?;
                }
                let new_last = if last == 0 { extent.offset.0 } else { last };
                self.relink_header(header_offset, new_last, extent.offset.0)?;
            }
            QueueEnd::Right => {
                // Mirror image of the left case: the new record's own
                // `next` is trivially 0, but its `prev` is a real
                // back-reference whose confirmation is `last.next`
                // pointing at it -- the one direction the checker does
                // not tolerate pending (it reads as right-only and
                // aborts). Relink the old tail/header *before* the new
                // record becomes durable, so a crash in between leaves
                // the new extent unparsable and therefore outside the
                // recovery scan entirely, rather than a checksummed
                // record with a dangling confirmation.
                if last != 0 {
                    self.relink_neighbor(last, Neighbor::Next, extent.offset.0)?;
                }
                let new_first = if first == 0 { extent.offset.0 } else { first };
                self.relink_header(header_offset, extent.offset.0, new_first)?;
                {
                    let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
                    record::persist(bytes, extent.blocks, ts, RecordType::QueueElemRecord, 0, b"", &packed, Some((new_prev, new_next)));
                }
            }
        }

        let mut registry = self.inner.collections.lock().unwrap();
        let queue = registry.queue_entry(id, header_offset);
        match end {
            QueueEnd::Left => queue.elements.push_front(extent.offset),
            QueueEnd::Right => queue.elements.push_back(extent.offset),
        }
        Ok(())
    }

    fn pop(&self, collection: &[u8], end: QueueEnd) -> Result<Vec<u8>> {
        self.reject_if_backup()?;
        let tid = self.thread_id()?;
        let (id, header_offset) = self.find_collection(collection, CollectionKind::Queue)?.ok_or(EngineError::NotFound)?;

        let popped = {
            let mut registry = self.inner.collections.lock().unwrap();
            let queue = registry.queue_entry(id, header_offset);
            match end {
                QueueEnd::Left => queue.elements.pop_front(),
                QueueEnd::Right => queue.elements.pop_back(),
            }
        };
        let popped = popped.ok_or(EngineError::NotFound)?;

        let max_blocks = self.inner.allocator.max_blocks_per_extent();
        let view = {
            let window = unsafe { self.inner.allocator.read_window(popped, max_blocks) };
            RecordView::parse(window).ok_or_else(|| EngineError::Abort("popped queue element failed checksum validation".into()))?
        };
        let (prev, next) = (view.prev().unwrap(), view.next().unwrap());
        let (_, payload) = decode_collection_id(view.value());
        let result = payload.to_vec();

        if prev != 0 {
            self.relink_neighbor(PmemOffset(prev).0, Neighbor::Next, next)?;
        } else {
            self.relink_header_field(header_offset, Neighbor::Next, next)?;
        }
        if next != 0 {
            self.relink_neighbor(next, Neighbor::Prev, prev)?;
        } else {
            self.relink_header_field(header_offset, Neighbor::Prev, prev)?;
        }

        let ts = self.inner.version_controller.new_timestamp();
        self.enqueue_old_element(tid, popped, ts)?;
        Ok(result)
    }

    fn relink_neighbor(&self, offset: u64, which: Neighbor, new_value: u64) -> Result<()> {
        self.relink_header_field(PmemOffset(offset), which, new_value)
    }

    fn relink_header_field(&self, offset: PmemOffset, which: Neighbor, new_value: u64) -> Result<()> {
        let max_blocks = self.inner.allocator.max_blocks_per_extent();
        let (key_size, value_size, prev, next) = {
            let window = unsafe { self.inner.allocator.read_window(offset, max_blocks) };
            let view = RecordView::parse(window)
                .ok_or_else(|| EngineError::Abort("linked record failed checksum validation during relink".into()))?;
            (view.key().len(), view.value().len(), view.prev().unwrap(), view.next().unwrap())
        };
        let (new_prev, new_next) = match which {
            Neighbor::Prev => (new_value, next),
            Neighbor::Next => (prev, new_value),
        };
        let extent = Extent { offset, blocks: self.extent_blocks_at(offset)? };
        let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
        record::install_links(bytes, key_size, value_size, new_prev, new_next);
        Ok(())
    }

    fn extent_blocks_at(&self, offset: PmemOffset) -> Result<u32> {
        let max_blocks = self.inner.allocator.max_blocks_per_extent();
        let window = unsafe { self.inner.allocator.read_window(offset, max_blocks) };
        let view = RecordView::parse(window)
            .ok_or_else(|| EngineError::Abort("linked record failed checksum validation".into()))?;
        Ok(view.record_size_blocks())
    }

    fn relink_header(&self, header_offset: PmemOffset, last: u64, first: u64) -> Result<()> {
        let (key_size, value_size) = {
            let max_blocks = self.inner.allocator.max_blocks_per_extent();
            let window = unsafe { self.inner.allocator.read_window(header_offset, max_blocks) };
            let view = RecordView::parse(window)
                .ok_or_else(|| EngineError::Abort("queue header failed checksum validation during relink".into()))?;
            (view.key().len(), view.value().len())
        };
        let extent = Extent { offset: header_offset, blocks: self.extent_blocks_at(header_offset)? };
        let bytes = unsafe { self.inner.allocator.extent_bytes_mut(extent) };
        record::install_links(bytes, key_size, value_size, last, first);
        Ok(())
    }

    // ---- backup -----------------------------------------------------------

    /// Writes a consistent copy of this instance to `path`, marked with
    /// `snapshot`'s timestamp (`SPEC_FULL.md` §4.10).
    pub fn backup(&self, path: impl AsRef<Path>, snapshot: &Snapshot) -> Result<()> {
        let path = path.as_ref();
        layout::ensure_instance_dirs(path)?;
        std::fs::copy(layout::data_file(&self.inner.instance_dir), layout::data_file(path))?;
        std::fs::copy(layout::config_file(&self.inner.instance_dir), layout::config_file(path))?;
        std::fs::write(layout::backup_mark_file(path), snapshot.ts.to_le_bytes())?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum QueueEnd {
    Left,
    Right,
}

#[derive(Clone, Copy)]
enum Neighbor {
    Prev,
    Next,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if !self.closing.load(Ordering::Relaxed) {
            self.closing.store(true, Ordering::Relaxed);
            self.bg_cv.notify_all();
            for handle in self.bg_threads.lock().unwrap().drain(..) {
                if let Err(e) = handle.join() {
                    error!("background thread panicked during drop: {:?}", e);
                }
            }
        }
    }
}
