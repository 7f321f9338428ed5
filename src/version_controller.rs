//! C4 -- the MVCC version controller.
//!
//! Grounded on `original_source/engine/kv_engine.hpp`'s `VersionController`
//! and `ThreadCache.newest_restored_ts`, with `update_oldest_snapshot`'s
//! "scan live holders, take the minimum" shape grounded on
//! `datastore.rs::oldest_writer()` (there: the oldest of several
//! `ProcessLocker` shared-lock holders; here: the oldest of several
//! per-thread snapshot slots).

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel value for a thread's `holding_snapshot` slot when it is not
/// currently holding a snapshot.
const NO_SNAPSHOT: u64 = u64::MAX;

/// A point-in-time read view. Dropping it without calling
/// [`VersionController::release_snapshot`] leaks the slot until the owning
/// thread takes or releases another snapshot or exits.
#[derive(Clone, Copy, Debug)]
pub struct Snapshot {
    pub ts: u64,
    tid: usize,
}

pub struct VersionController {
    latest_ts: AtomicU64,
    holding_snapshot: Vec<AtomicU64>,
    oldest_snapshot_ts: AtomicU64,
}

impl VersionController {
    pub fn new(max_access_threads: usize) -> Self {
        VersionController {
            latest_ts: AtomicU64::new(0),
            holding_snapshot: (0..max_access_threads).map(|_| AtomicU64::new(NO_SNAPSHOT)).collect(),
            oldest_snapshot_ts: AtomicU64::new(0),
        }
    }

    /// Strictly monotonic; never repeats across restarts because recovery
    /// seeds `latest_ts` to one greater than any timestamp in the scan
    /// (`recovery.rs::seed_version_controller`).
    pub fn new_timestamp(&self) -> u64 {
        self.latest_ts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn make_snapshot(&self, tid: usize) -> Snapshot {
        let ts = self.latest_ts.load(Ordering::SeqCst);
        self.holding_snapshot[tid].store(ts, Ordering::SeqCst);
        Snapshot { ts, tid }
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        self.holding_snapshot[snapshot.tid].store(NO_SNAPSHOT, Ordering::SeqCst);
    }

    /// Scans every thread's slot and caches the minimum non-sentinel value
    /// (or `latest_ts` if no thread currently holds a snapshot). Called by
    /// the background coordinator once per cleaner tick.
    pub fn update_oldest_snapshot(&self) -> u64 {
        let oldest = self
            .holding_snapshot
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|&ts| ts != NO_SNAPSHOT)
            .min()
            .unwrap_or_else(|| self.latest_ts.load(Ordering::SeqCst));
        self.oldest_snapshot_ts.store(oldest, Ordering::SeqCst);
        oldest
    }

    pub fn oldest_snapshot_ts(&self) -> u64 {
        self.oldest_snapshot_ts.load(Ordering::SeqCst)
    }

    pub fn latest_ts(&self) -> u64 {
        self.latest_ts.load(Ordering::SeqCst)
    }

    /// Recovery seeds the counter from the maximum timestamp observed in the
    /// persistent scan.
    pub fn seed(&self, max_ts_seen: u64) {
        self.latest_ts.store(max_ts_seen, Ordering::SeqCst);
        self.oldest_snapshot_ts.store(max_ts_seen, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_strictly_increasing() {
        let vc = VersionController::new(4);
        let a = vc.new_timestamp();
        let b = vc.new_timestamp();
        assert!(b > a);
    }

    #[test]
    fn oldest_snapshot_tracks_the_minimum_held() {
        let vc = VersionController::new(4);
        vc.new_timestamp();
        let s1 = vc.make_snapshot(0);
        vc.new_timestamp();
        let _s2 = vc.make_snapshot(1);

        assert_eq!(vc.update_oldest_snapshot(), s1.ts);
        vc.release_snapshot(s1);
        assert_eq!(vc.update_oldest_snapshot(), _s2.ts);
    }

    #[test]
    fn no_live_snapshot_means_oldest_is_latest() {
        let vc = VersionController::new(2);
        vc.new_timestamp();
        vc.new_timestamp();
        assert_eq!(vc.update_oldest_snapshot(), vc.latest_ts());
    }

    #[test]
    fn seeding_from_recovery_is_monotonic_afterwards() {
        let vc = VersionController::new(2);
        vc.seed(100);
        assert!(vc.new_timestamp() > 100);
    }
}
