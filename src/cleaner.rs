//! C8 -- the old-records cleaner.
//!
//! Grounded directly on `datastore.rs::garbage_collection()`'s two-phase
//! mark-and-sweep, generalized from atime-based chunk marking to
//! MVCC-timestamp-based old-record reclamation. The background
//! coordinator/cleaner split (`engine.rs`) is grounded on
//! `original_source/engine/kv_engine.hpp`'s `backgroundCleaner`/
//! `backgroundWorkCoordinator` plus their condition variables.

use std::collections::VecDeque;
use std::sync::Mutex;

use pmemkv_types::{CleanerStatus, TypeMask};

use crate::allocator::{Extent, PmemAllocator, PmemOffset};
use crate::hash_index::{HashIndex, Lookup};
use crate::version_controller::VersionController;

/// A record that has been superseded but must outlive any snapshot that
/// could still observe it (spec.md's "old record").
#[derive(Clone, Copy)]
pub struct PendingFree {
    pub offset: PmemOffset,
    pub blocks: u32,
    pub fingerprint: u64,
    pub superseding_ts: u64,
}

#[derive(Default)]
struct ThreadQueues {
    data: VecDeque<PendingFree>,
    delete: VecDeque<PendingFree>,
}

pub struct Cleaner {
    per_thread: Vec<Mutex<ThreadQueues>>,
    status: Mutex<CleanerStatus>,
}

impl Cleaner {
    pub fn new(max_access_threads: usize) -> Self {
        Cleaner {
            per_thread: (0..max_access_threads).map(|_| Mutex::new(ThreadQueues::default())).collect(),
            status: Mutex::new(CleanerStatus::default()),
        }
    }

    pub fn enqueue_data(&self, tid: usize, entry: PendingFree) {
        self.per_thread[tid].lock().unwrap().data.push_back(entry);
    }

    pub fn enqueue_delete(&self, tid: usize, entry: PendingFree) {
        self.per_thread[tid].lock().unwrap().delete.push_back(entry);
    }

    pub fn status(&self) -> CleanerStatus {
        self.status.lock().unwrap().clone()
    }

    /// One cleaner tick: refreshes the oldest-live-snapshot watermark and
    /// frees every queued record superseded strictly before it.
    pub fn tick(&self, vc: &VersionController, allocator: &PmemAllocator, hash_index: &HashIndex) {
        let oldest = vc.update_oldest_snapshot();
        let block_size = allocator.block_size() as u64;

        for queue in &self.per_thread {
            let mut queue = queue.lock().unwrap();

            while queue.data.front().is_some_and(|e| e.superseding_ts < oldest) {
                let entry = queue.data.pop_front().unwrap();
                allocator.free(0, Extent { offset: entry.offset, blocks: entry.blocks });
                let mut status = self.status.lock().unwrap();
                status.data_records_freed += 1;
                status.bytes_freed += entry.blocks as u64 * block_size;
            }

            while queue.delete.front().is_some_and(|e| e.superseding_ts < oldest) {
                let entry = queue.delete.pop_front().unwrap();

                let mut hint = hash_index.acquire_fingerprint(entry.fingerprint);
                if let (Lookup::Found(pos), Some(found)) = hash_index.search(&hint, entry.fingerprint, TypeMask::Any) {
                    if found.payload == entry.offset {
                        hash_index.remove(&mut hint, pos);
                    }
                }
                drop(hint);

                allocator.free(0, Extent { offset: entry.offset, blocks: entry.blocks });
                let mut status = self.status.lock().unwrap();
                status.delete_records_freed += 1;
                status.bytes_freed += entry.blocks as u64 * block_size;
            }
        }

        let mut status = self.status.lock().unwrap();
        status.ticks += 1;
        status.oldest_snapshot_ts = oldest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frees_only_entries_below_the_watermark() {
        let vc = VersionController::new(2);
        let hash_index = HashIndex::new(8);
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("data"))
            .unwrap();
        let allocator = PmemAllocator::open(&file, 4096, 64, 64, 64, 2).unwrap();
        let cleaner = Cleaner::new(2);

        vc.new_timestamp();
        let snapshot = vc.make_snapshot(0);
        vc.new_timestamp();

        cleaner.enqueue_data(
            0,
            PendingFree { offset: PmemOffset(64), blocks: 1, fingerprint: 0, superseding_ts: snapshot.ts },
        );
        cleaner.tick(&vc, &allocator, &hash_index);
        assert_eq!(cleaner.status().data_records_freed, 0, "still visible to the held snapshot");

        vc.release_snapshot(snapshot);
        cleaner.tick(&vc, &allocator, &hash_index);
        assert_eq!(cleaner.status().data_records_freed, 1);
    }
}
