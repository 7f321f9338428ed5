//! C1 -- the persistent-memory allocator.
//!
//! Owns the single memory-mapped `data` file and hands out byte-aligned
//! extents. Grounded on `chunk_store.rs`'s directory/locking discipline and
//! `fixed_index.rs`'s direct `mmap`/`munmap` use, with the thread-local /
//! global free-list-by-bucket split adapted from
//! `original_source/engine/dram_allocator.hpp`'s `ChunkBasedAllocator` (there
//! a DRAM bump allocator that never frees; here a persistent allocator that
//! must reclaim, so chunks become buckets of reusable extents instead).
//!
//! The allocator persists nothing about free space -- on open, free state is
//! reconstructed from the record scan (`recovery.rs`).

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use pmemkv_types::{EngineError, Result};

/// A stable offset into the persistent region. Zero is the null offset.
/// The allocator is the only authority converting between an offset and a
/// raw address (§9's "never expose raw addresses across the persistence
/// boundary").
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct PmemOffset(pub u64);

impl PmemOffset {
    pub const NULL: PmemOffset = PmemOffset(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A contiguous run of blocks handed out by the allocator.
#[derive(Clone, Copy, Debug)]
pub struct Extent {
    pub offset: PmemOffset,
    pub blocks: u32,
}

/// Extents above this block count skip the per-size bucket scheme and are
/// tracked in a single first-fit overflow bucket (index 0).
const OVERSIZED_BUCKET: usize = 0;

/// Once a thread-local bucket grows past this many entries, half of it is
/// migrated to the matching global-pool bucket.
const HIGH_WATER_MARK: usize = 32;

struct BucketTable {
    buckets: Vec<Mutex<Vec<Extent>>>,
}

impl BucketTable {
    fn new(max_blocks_per_extent: u32) -> Self {
        let n = max_blocks_per_extent as usize + 1;
        BucketTable {
            buckets: (0..n).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn index_for(&self, blocks: u32) -> usize {
        let b = blocks as usize;
        if b == 0 || b >= self.buckets.len() {
            OVERSIZED_BUCKET
        } else {
            b
        }
    }

    fn pop(&self, blocks: u32) -> Option<Extent> {
        let idx = self.index_for(blocks);
        let mut bucket = self.buckets[idx].lock().unwrap();
        if idx == OVERSIZED_BUCKET {
            // first-fit: any extent at least as large as requested works.
            let pos = bucket.iter().position(|e| e.blocks >= blocks)?;
            Some(bucket.swap_remove(pos))
        } else {
            bucket.pop()
        }
    }

    fn push(&self, extent: Extent) {
        let idx = self.index_for(extent.blocks);
        self.buckets[idx].lock().unwrap().push(extent);
    }

    fn len(&self, idx: usize) -> usize {
        self.buckets[idx].lock().unwrap().len()
    }

    fn drain_half(&self, idx: usize) -> Vec<Extent> {
        let mut bucket = self.buckets[idx].lock().unwrap();
        let half = bucket.len() / 2;
        bucket.split_off(bucket.len() - half)
    }

    fn all_extents(&self) -> Vec<Extent> {
        self.buckets.iter().flat_map(|b| b.lock().unwrap().clone()).collect()
    }

    fn clear(&self) {
        for b in &self.buckets {
            b.lock().unwrap().clear();
        }
    }

    fn insert_all(&self, extents: Vec<Extent>) {
        for e in extents {
            self.push(e);
        }
    }
}

pub struct PmemAllocator {
    base: *mut u8,
    len: usize,
    block_size: u32,
    max_blocks_per_extent: u32,
    blocks_per_segment: u64,
    capacity_blocks: u64,
    next_free_block: Mutex<u64>,
    thread_pools: Vec<BucketTable>,
    global_pool: BucketTable,
}

// `base` is a raw pointer into an `mmap`'d region that outlives every access
// through `offset_to_addr`/`addr_to_offset`; all mutation of the mapped
// bytes happens at disjoint, allocator-issued extents, so concurrent access
// from multiple threads is sound the same way `fixed_index.rs`'s mapped
// readers/writers are.
unsafe impl Send for PmemAllocator {}
unsafe impl Sync for PmemAllocator {}

impl PmemAllocator {
    /// Maps `file`, truncating it to `capacity_bytes` first if it is smaller.
    pub fn open(
        file: &File,
        capacity_bytes: u64,
        block_size: u32,
        blocks_per_segment: u32,
        max_blocks_per_extent: u32,
        max_access_threads: usize,
    ) -> Result<Self> {
        let metadata = file.metadata()?;
        if metadata.len() < capacity_bytes {
            file.set_len(capacity_bytes)?;
        }
        let len = capacity_bytes as usize;
        let base = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(len).ok_or_else(|| {
                    EngineError::InvalidConfiguration("pmem_file_size must be > 0".into())
                })?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
            .map_err(|e| EngineError::MapError(e.to_string()))?
        } as *mut u8;

        let capacity_blocks = len as u64 / block_size as u64;

        Ok(PmemAllocator {
            base,
            len,
            block_size,
            max_blocks_per_extent,
            blocks_per_segment: blocks_per_segment.max(1) as u64,
            capacity_blocks,
            next_free_block: Mutex::new(0),
            thread_pools: (0..max_access_threads).map(|_| BucketTable::new(max_blocks_per_extent)).collect(),
            global_pool: BucketTable::new(max_blocks_per_extent),
        })
    }

    pub fn blocks_per_segment(&self) -> u64 {
        self.blocks_per_segment
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn max_blocks_per_extent(&self) -> u32 {
        self.max_blocks_per_extent
    }

    fn blocks_for(&self, size: usize) -> u32 {
        let bs = self.block_size as usize;
        ((size + bs - 1) / bs) as u32
    }

    /// Converts a byte size (including any record header) into a fresh
    /// extent, preferring the caller's thread-local pool, then the global
    /// pool, then carving unused space.
    pub fn allocate(&self, tid: usize, size: usize) -> Result<Extent> {
        let blocks = self.blocks_for(size).max(1);

        if let Some(extent) = self.thread_pools[tid].pop(blocks) {
            return Ok(extent);
        }
        if let Some(extent) = self.global_pool.pop(blocks) {
            return Ok(extent);
        }
        self.carve(blocks)
    }

    /// Carves `blocks` fresh blocks off the bump cursor. An extent is never
    /// allowed to straddle a segment boundary: recovery's parallel scan
    /// partitions work by segment, and that is only sound if every record
    /// lives entirely inside one segment. A request that would cross the
    /// boundary instead wastes the remainder of the current segment and
    /// retries from the start of the next one.
    fn carve(&self, blocks: u32) -> Result<Extent> {
        let mut cursor = self.next_free_block.lock().unwrap();
        loop {
            let start = *cursor;
            if start >= self.capacity_blocks {
                return Err(EngineError::PmemOverflow);
            }
            let segment = start / self.blocks_per_segment;
            let segment_end = (segment + 1) * self.blocks_per_segment;
            if start + blocks as u64 <= segment_end {
                if start + blocks as u64 > self.capacity_blocks {
                    return Err(EngineError::PmemOverflow);
                }
                *cursor = start + blocks as u64;
                return Ok(Extent {
                    offset: PmemOffset(start * self.block_size as u64),
                    blocks,
                });
            }
            if segment_end >= self.capacity_blocks {
                return Err(EngineError::PmemOverflow);
            }
            *cursor = segment_end;
        }
    }

    /// Returns `extent` to the caller's thread-local pool, migrating the
    /// overflow to the global pool once the local pool passes the
    /// high-water mark.
    pub fn free(&self, tid: usize, extent: Extent) {
        let pool = &self.thread_pools[tid];
        pool.push(extent);
        let idx = pool.index_for(extent.blocks);
        if pool.len(idx) > HIGH_WATER_MARK {
            self.global_pool.insert_all(pool.drain_half(idx));
        }
    }

    /// Merges adjacent free extents in the global pool to fight
    /// fragmentation. Run periodically by the background coordinator.
    pub fn background_work(&self) {
        let mut extents = self.global_pool.all_extents();
        if extents.is_empty() {
            return;
        }
        extents.sort_by_key(|e| e.offset.0);

        let mut merged = Vec::with_capacity(extents.len());
        let mut current = extents[0];
        for next in &extents[1..] {
            let current_end = current.offset.0 + current.blocks as u64 * self.block_size as u64;
            if current_end == next.offset.0 {
                current.blocks += next.blocks;
            } else {
                merged.push(current);
                current = *next;
            }
        }
        merged.push(current);

        self.global_pool.clear();
        self.global_pool.insert_all(merged);
    }

    /// # Safety
    /// `offset` must have been produced by this allocator and must still be
    /// within a live extent (not concurrently freed and reused).
    pub unsafe fn offset_to_addr(&self, offset: PmemOffset) -> *mut u8 {
        debug_assert!((offset.0 as usize) < self.len);
        self.base.add(offset.0 as usize)
    }

    pub fn addr_to_offset(&self, addr: *const u8) -> PmemOffset {
        let off = addr as usize - self.base as usize;
        PmemOffset(off as u64)
    }

    /// Returns a mutable view of an extent's bytes for writing a record.
    ///
    /// # Safety
    /// Caller must hold exclusive logical ownership of `extent` (it was
    /// just allocated, or is being rewritten under the owning bucket lock).
    pub unsafe fn extent_bytes_mut(&self, extent: Extent) -> &mut [u8] {
        let ptr = self.offset_to_addr(extent.offset);
        std::slice::from_raw_parts_mut(ptr, extent.blocks as usize * self.block_size as usize)
    }

    /// Read-only view of an extent's bytes, used by readers and recovery.
    ///
    /// # Safety
    /// `offset`/`blocks` must describe a region within the mapping.
    pub unsafe fn bytes_at(&self, offset: PmemOffset, blocks: u32) -> &[u8] {
        let ptr = self.offset_to_addr(offset);
        std::slice::from_raw_parts(ptr, blocks as usize * self.block_size as usize)
    }

    /// Read-only view starting at `offset`, clamped to whatever remains in
    /// the mapping, capped at `max_blocks`. Used to read a record back
    /// without the reader needing to already know its exact extent size.
    ///
    /// # Safety
    /// `offset` must be a previously allocated, still-live offset.
    pub unsafe fn read_window(&self, offset: PmemOffset, max_blocks: u32) -> &[u8] {
        let start_block = offset.0 / self.block_size as u64;
        let avail = (self.capacity_blocks.saturating_sub(start_block)).min(max_blocks as u64) as u32;
        self.bytes_at(offset, avail)
    }

    pub fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }

    /// Used by recovery to seed the bump cursor and free-list state from a
    /// fresh scan rather than trusting any on-disk bookkeeping.
    pub fn reset_from_scan(&self, highest_used_block: u64, free_extents: Vec<Extent>) {
        *self.next_free_block.lock().unwrap() = highest_used_block;
        self.global_pool.clear();
        for pool in &self.thread_pools {
            pool.clear();
        }
        self.global_pool.insert_all(free_extents);
    }
}

impl Drop for PmemAllocator {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base as *mut std::ffi::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn open_test_allocator(blocks_cap: u64) -> (tempfile::TempDir, PmemAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path).unwrap();
        let alloc = PmemAllocator::open(&file, blocks_cap * 64, 64, 1024, 1024, 4).unwrap();
        (dir, alloc)
    }

    #[test]
    fn allocate_then_free_then_reuse() {
        let (_dir, alloc) = open_test_allocator(1024);
        let e1 = alloc.allocate(0, 100).unwrap();
        alloc.free(0, e1);
        let e2 = alloc.allocate(0, 100).unwrap();
        assert_eq!(e1.blocks, e2.blocks);
        assert_eq!(e1.offset, e2.offset);
    }

    #[test]
    fn overflow_when_region_exhausted() {
        let (_dir, alloc) = open_test_allocator(4);
        assert!(alloc.allocate(0, 64 * 4).is_ok());
        assert!(matches!(alloc.allocate(0, 64).unwrap_err(), EngineError::PmemOverflow));
    }

    #[test]
    fn background_work_merges_adjacent_extents() {
        let (_dir, alloc) = open_test_allocator(1024);
        let e1 = alloc.allocate(0, 64).unwrap();
        let e2 = alloc.allocate(0, 64).unwrap();
        // push straight to the global pool so background_work has something
        // to merge regardless of the thread-local high-water mark.
        alloc.global_pool.push(e1);
        alloc.global_pool.push(e2);
        alloc.background_work();
        let merged = alloc.global_pool.all_extents();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].blocks, 2);
    }
}
