//! Per-fingerprint hash locks.
//!
//! A hash lock serializes every dedup decision for one fingerprint. The
//! first data-VIO to arrive becomes the agent and drives the decision;
//! later arrivals wait FIFO and inherit the outcome. The lock may hold a
//! read lock on a candidate duplicate PBN from verification until the
//! last holder leaves.

use karst_types::{ChunkName, DataLocation, Pbn, VioId};
use std::collections::{HashMap, VecDeque};

/// Decision progress of a hash lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashLockState {
    /// Created, agent not yet dispatched.
    Initializing,
    /// Agent is querying the advice index.
    Querying,
    /// Agent is locking the candidate PBN.
    Locking,
    /// Agent is reading and comparing the candidate.
    Verifying,
    /// Agent is writing fresh data.
    Writing,
    /// A shareable location is decided; holders adopt it.
    Updating,
    /// Dedup abandoned; holders write independently.
    Bypassing,
    /// Holders are draining.
    Unlocking,
}

/// One per-fingerprint serializer.
#[derive(Debug)]
pub struct HashLock {
    pub name: ChunkName,
    pub state: HashLockState,
    pub agent: Option<VioId>,
    pub waiters: VecDeque<VioId>,
    /// The decided shareable location, once known.
    pub duplicate: Option<DataLocation>,
    /// Read lock held on the candidate PBN, if any.
    pub duplicate_lock: Option<Pbn>,
    /// Whether the index returned advice for this fingerprint (stale or
    /// not); a fresh write then updates rather than posts.
    pub had_advice: bool,
    pub verified: bool,
    /// Data-VIOs attached to this lock (agent, waiters, sharers).
    pub reference_count: u32,
}

impl HashLock {
    #[must_use]
    pub fn new(name: ChunkName, agent: VioId) -> Self {
        Self {
            name,
            state: HashLockState::Initializing,
            agent: Some(agent),
            waiters: VecDeque::new(),
            duplicate: None,
            duplicate_lock: None,
            had_advice: false,
            verified: false,
            reference_count: 1,
        }
    }

    /// Detach the waiters for launching after a decision.
    pub fn take_waiters(&mut self) -> Vec<VioId> {
        self.waiters.drain(..).collect()
    }
}

/// One hash zone's lock table.
#[derive(Debug, Default)]
pub struct HashZoneState {
    pub locks: HashMap<ChunkName, HashLock>,
    /// Monotonic counters.
    pub dedup_shares: u64,
    pub verifies: u64,
    pub verify_mismatches: u64,
}

impl HashZoneState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_lock_starts_with_one_reference() {
        let lock = HashLock::new(ChunkName([1; 16]), VioId(3));
        assert_eq!(lock.state, HashLockState::Initializing);
        assert_eq!(lock.agent, Some(VioId(3)));
        assert_eq!(lock.reference_count, 1);
        assert!(!lock.verified);
    }

    #[test]
    fn waiters_drain_in_order() {
        let mut lock = HashLock::new(ChunkName([1; 16]), VioId(0));
        lock.waiters.push_back(VioId(1));
        lock.waiters.push_back(VioId(2));
        assert_eq!(lock.take_waiters(), vec![VioId(1), VioId(2)]);
        assert!(lock.waiters.is_empty());
    }
}
