//! Transfer id allocation.
//!
//! Ids come from one `AtomicU64` per session, seeded from the wall clock in
//! microseconds. The live set holds every id currently owned by a send
//! table or by an accepted file offer; an id is skipped while it is still
//! in that set, so a wrapped or colliding counter can never hand out an id
//! twice, nor one the peer is already sending under.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashSet;

#[derive(Debug)]
pub struct TransferIds {
    next: AtomicU64,
    live: DashSet<u64>,
}

impl TransferIds {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(1);
        Self::starting_at(seed)
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
            live: DashSet::new(),
        }
    }

    /// Claim a fresh id. It stays reserved until `release`.
    pub fn allocate(&self) -> u64 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if self.live.insert(id) {
                return id;
            }
        }
    }

    /// Claim an id chosen by the peer. False if it is already live here.
    pub fn reserve(&self, id: u64) -> bool {
        self.live.insert(id)
    }

    pub fn release(&self, id: u64) {
        self.live.remove(&id);
    }

    pub fn is_live(&self, id: u64) -> bool {
        self.live.contains(&id)
    }
}

impl Default for TransferIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let ids = TransferIds::starting_at(10);
        assert_eq!(ids.allocate(), 10);
        assert_eq!(ids.allocate(), 11);
        assert!(ids.is_live(10));
        ids.release(10);
        assert!(!ids.is_live(10));
    }

    #[test]
    fn live_ids_are_skipped_after_wrap() {
        let ids = TransferIds::starting_at(u64::MAX);
        assert_eq!(ids.allocate(), u64::MAX);
        assert_eq!(ids.allocate(), 0);
        // Force the counter back onto a live id.
        ids.next.store(u64::MAX, Ordering::Relaxed);
        assert_eq!(ids.allocate(), 1, "u64::MAX and 0 are still live");
    }

    #[test]
    fn reserved_ids_are_not_allocated() {
        let ids = TransferIds::starting_at(100);
        assert!(ids.reserve(100));
        assert!(!ids.reserve(100), "already held");
        assert_eq!(ids.allocate(), 101);
        assert!(!ids.reserve(101), "held by a local send");
        ids.release(100);
        assert!(ids.reserve(100));
    }

    #[test]
    fn clock_seed_is_nonzero() {
        assert!(TransferIds::new().allocate() > 0);
    }
}
