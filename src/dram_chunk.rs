//! C2 -- the DRAM chunk allocator.
//!
//! A per-thread bump allocator over 1MiB chunks, used only for volatile
//! collection index nodes. Translated directly from
//! `original_source/engine/dram_allocator.hpp`'s `ChunkBasedAllocator`:
//! `allocate` bumps a pointer within the current chunk or grabs a fresh one;
//! `free` is a no-op; chunks are released together when the thread's cache
//! is dropped.

const CHUNK_SIZE: usize = 1 << 20;

struct ThreadChunkCache {
    current: Option<Box<[u8]>>,
    used: usize,
    allocated_chunks: usize,
}

impl Default for ThreadChunkCache {
    fn default() -> Self {
        ThreadChunkCache { current: None, used: 0, allocated_chunks: 0 }
    }
}

impl ThreadChunkCache {
    fn allocate(&mut self, size: usize) -> Box<[u8]> {
        if size > CHUNK_SIZE {
            // oversized requests bypass the chunk entirely.
            return vec![0u8; size].into_boxed_slice();
        }

        let needs_new_chunk = match &self.current {
            Some(chunk) => self.used + size > chunk.len(),
            None => true,
        };
        if needs_new_chunk {
            self.current = Some(vec![0u8; CHUNK_SIZE].into_boxed_slice());
            self.used = 0;
            self.allocated_chunks += 1;
        }

        // Bump-allocate a private slice by carving it out of the chunk and
        // replacing the chunk with the remainder; this keeps the cache free
        // of raw pointers while still handing the caller an owned buffer it
        // can grow a collection node into.
        let chunk = self.current.take().unwrap();
        let (head, tail) = chunk.split_at(self.used + size);
        let out = head[self.used..].to_vec().into_boxed_slice();
        self.current = Some(tail.to_vec().into_boxed_slice());
        self.used = 0;
        out
    }
}

/// A thread-indexed array of bump allocators, one per access-thread id, per
/// the "fixed-size array indexed by thread id" pattern used throughout this
/// crate instead of true TLS (§9).
pub struct DramChunkAllocator {
    per_thread: Vec<std::sync::Mutex<ThreadChunkCache>>,
}

impl DramChunkAllocator {
    pub fn new(max_access_threads: usize) -> Self {
        DramChunkAllocator {
            per_thread: (0..max_access_threads).map(|_| std::sync::Mutex::new(ThreadChunkCache::default())).collect(),
        }
    }

    pub fn allocate(&self, tid: usize, size: usize) -> Box<[u8]> {
        self.per_thread[tid].lock().unwrap().allocate(size)
    }

    /// No-op: bump allocations are never individually reclaimed.
    pub fn free(&self, _tid: usize, _buf: Box<[u8]>) {}

    pub fn allocated_chunks(&self, tid: usize) -> usize {
        self.per_thread[tid].lock().unwrap().allocated_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocates_within_a_chunk() {
        let alloc = DramChunkAllocator::new(2);
        let a = alloc.allocate(0, 128);
        let b = alloc.allocate(0, 128);
        assert_eq!(a.len(), 128);
        assert_eq!(b.len(), 128);
        assert_eq!(alloc.allocated_chunks(0), 1);
    }

    #[test]
    fn oversized_request_bypasses_chunk() {
        let alloc = DramChunkAllocator::new(1);
        let big = alloc.allocate(0, CHUNK_SIZE + 1);
        assert_eq!(big.len(), CHUNK_SIZE + 1);
        assert_eq!(alloc.allocated_chunks(0), 0);
    }
}
