//! C5 -- the volatile hash index mapping key fingerprints to persistent
//! record offsets.
//!
//! Grounded on `chunk_store.rs`'s `digest_to_prefix` (bucket selection from
//! the high bits of a digest), generalized from a directory-prefix scheme to
//! an in-memory array, and on the `lazy_static! ... Mutex<HashMap<...>>`
//! registry idiom behind `datastore.rs`'s `DATASTORE_MAP`, generalized here
//! to one mutex per bucket instead of one mutex for the whole table, per the
//! locking discipline of §5.
//!
//! The index stores only a 64-bit fingerprint per entry, never the key
//! itself (it is rebuilt from scratch on every recovery and is never
//! persisted). Two distinct keys can in principle collide on fingerprint;
//! the write path is responsible for reading the candidate record back and
//! comparing its actual key bytes before trusting a hit (see
//! `engine.rs::resolve`).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use pmemkv_types::{RecordType, TypeMask};

use crate::allocator::PmemOffset;

#[derive(Clone, Copy, Debug)]
pub struct Entry {
    pub fingerprint: u64,
    pub record_type: RecordType,
    pub payload: PmemOffset,
}

pub enum Lookup {
    Found(usize),
    /// A fingerprint match exists but its type does not satisfy the
    /// requested mask -- the caller intended to insert under a different
    /// type tag at the same bucket.
    MayExist,
    NotFound,
}

#[derive(Default)]
struct Bucket {
    entries: Vec<Entry>,
}

/// A held bucket lock, obtained from [`HashIndex::acquire`] and threaded
/// through the rest of a critical section the way `spec.md` §4.5 describes.
pub struct BucketGuard<'a> {
    index: usize,
    guard: MutexGuard<'a, Bucket>,
}

pub struct HashIndex {
    buckets: Vec<Mutex<Bucket>>,
}

impl HashIndex {
    pub fn new(n_buckets: usize) -> Self {
        HashIndex {
            buckets: (0..n_buckets.max(1)).map(|_| Mutex::new(Bucket::default())).collect(),
        }
    }

    pub fn fingerprint(key: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Fingerprint for a collection descriptor: the collection name salted
    /// with a type tag, per spec.md §4.5 ("a reserved fingerprint derived
    /// from the collection name plus a collection-type tag"), so a sorted
    /// collection and a hash collection sharing a name never collide with
    /// each other or with a plain string key of the same bytes.
    pub fn collection_fingerprint(name: &[u8], tag: u8) -> u64 {
        let mut hasher = DefaultHasher::new();
        tag.hash(&mut hasher);
        name.hash(&mut hasher);
        hasher.finish()
    }

    fn bucket_index(&self, fingerprint: u64) -> usize {
        // high bits pick the bucket, matching digest_to_prefix's use of the
        // most-significant byte(s) of a digest to fan out into directories.
        (fingerprint >> 48) as usize % self.buckets.len()
    }

    pub fn acquire(&self, key: &[u8]) -> BucketGuard<'_> {
        self.acquire_fingerprint(Self::fingerprint(key))
    }

    pub fn acquire_fingerprint(&self, fingerprint: u64) -> BucketGuard<'_> {
        let index = self.bucket_index(fingerprint);
        BucketGuard { index, guard: self.buckets[index].lock().unwrap() }
    }

    /// Looks for `fingerprint` under `hint`'s bucket lock. `status` is
    /// `Found` only when an entry both matches the fingerprint and passes
    /// `mask`; a fingerprint match of the wrong type reports `MayExist` so
    /// the caller (typically a collection creating its header record) knows
    /// a slot exists but is taken by something else.
    pub fn search(&self, hint: &BucketGuard<'_>, fingerprint: u64, mask: TypeMask) -> (Lookup, Option<Entry>) {
        let mut collided = false;
        for (pos, entry) in hint.guard.entries.iter().enumerate() {
            if entry.fingerprint == fingerprint {
                if mask.matches(entry.record_type) {
                    return (Lookup::Found(pos), Some(*entry));
                }
                collided = true;
            }
        }
        if collided {
            (Lookup::MayExist, None)
        } else {
            (Lookup::NotFound, None)
        }
    }

    pub fn insert(&self, hint: &mut BucketGuard<'_>, fingerprint: u64, record_type: RecordType, payload: PmemOffset) {
        hint.guard.entries.push(Entry { fingerprint, record_type, payload });
    }

    /// Single in-place update of an existing slot's type/payload. Readers
    /// that bypass the bucket lock (none, in this implementation -- see the
    /// module docs) would see either the pre- or post-image, never a torn
    /// value, because the whole entry is replaced as one assignment.
    pub fn replace(&self, hint: &mut BucketGuard<'_>, pos: usize, record_type: RecordType, payload: PmemOffset) {
        let entry = &mut hint.guard.entries[pos];
        entry.record_type = record_type;
        entry.payload = payload;
    }

    pub fn remove(&self, hint: &mut BucketGuard<'_>, pos: usize) {
        hint.guard.entries.swap_remove(pos);
    }

    pub fn bucket_len(&self, hint: &BucketGuard<'_>) -> usize {
        hint.guard.entries.len()
    }
}

impl BucketGuard<'_> {
    pub fn bucket_index(&self) -> usize {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_find() {
        let idx = HashIndex::new(16);
        let fp = HashIndex::fingerprint(b"hello");
        let mut hint = idx.acquire_fingerprint(fp);
        let (status, _) = idx.search(&hint, fp, TypeMask::String);
        assert!(matches!(status, Lookup::NotFound));
        idx.insert(&mut hint, fp, RecordType::StringRecord, PmemOffset(64));

        let (status, entry) = idx.search(&hint, fp, TypeMask::String);
        assert!(matches!(status, Lookup::Found(_)));
        assert_eq!(entry.unwrap().payload, PmemOffset(64));
    }

    #[test]
    fn replace_updates_payload_in_place() {
        let idx = HashIndex::new(16);
        let fp = HashIndex::fingerprint(b"k");
        let mut hint = idx.acquire_fingerprint(fp);
        idx.insert(&mut hint, fp, RecordType::StringRecord, PmemOffset(8));
        if let (Lookup::Found(pos), _) = idx.search(&hint, fp, TypeMask::String) {
            idx.replace(&mut hint, pos, RecordType::StringRecord, PmemOffset(256));
        } else {
            panic!("expected Found");
        }
        let (_, entry) = idx.search(&hint, fp, TypeMask::String);
        assert_eq!(entry.unwrap().payload, PmemOffset(256));
    }

    #[test]
    fn type_mismatch_reports_may_exist() {
        let idx = HashIndex::new(16);
        let fp = HashIndex::fingerprint(b"k");
        let mut hint = idx.acquire_fingerprint(fp);
        idx.insert(&mut hint, fp, RecordType::HashHeaderRecord, PmemOffset(8));
        let (status, _) = idx.search(&hint, fp, TypeMask::String);
        assert!(matches!(status, Lookup::MayExist));
    }
}
