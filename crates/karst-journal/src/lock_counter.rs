//! Lock counter for the recovery journal's in-flight blocks.
//!
//! Keeps all of the locks for the journal's ring blocks in one structure.
//! The per-zone counters are kept in zone-major arrays (zone 0's lock 0 at
//! index 0, zone 1's lock 0 at index `locks`) so counters from different
//! zones do not share cache lines. Per-zone counters are plain integers
//! touched only by their owning zone; the cross-zone state is limited to
//! one atomic zone count per lock and zone type, the atomic journal
//! decrement counts, and the single-slot `notifying` flag.

use karst_types::ZoneType;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::error;

/// Per-journal-block lock counts across every zone type.
#[derive(Debug)]
pub struct LockCounter {
    locks: usize,
    /// Per-lock counts held by the journal zone itself.
    journal_counters: Vec<u16>,
    /// Cross-zone releases of journal counts; the effective journal count
    /// is `journal_counters[i] - journal_decrements[i]`.
    journal_decrements: Vec<AtomicU32>,
    /// Zone-major `[zone][lock]` reference counts for logical zones.
    logical_counters: Vec<u16>,
    /// How many logical zones hold each lock (not how many references).
    logical_zone_counts: Vec<AtomicU32>,
    /// Zone-major `[zone][lock]` reference counts for physical zones.
    physical_counters: Vec<u16>,
    /// How many physical zones hold each lock.
    physical_zone_counts: Vec<AtomicU32>,
    /// Whether a release notification is in flight.
    notifying: AtomicBool,
}

impl LockCounter {
    #[must_use]
    pub fn new(locks: usize, logical_zones: usize, physical_zones: usize) -> Self {
        Self {
            locks,
            journal_counters: vec![0; locks],
            journal_decrements: (0..locks).map(|_| AtomicU32::new(0)).collect(),
            logical_counters: vec![0; locks * logical_zones],
            logical_zone_counts: (0..locks).map(|_| AtomicU32::new(0)).collect(),
            physical_counters: vec![0; locks * physical_zones],
            physical_zone_counts: (0..locks).map(|_| AtomicU32::new(0)).collect(),
            notifying: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks
    }

    fn zone_count(&self, lock: usize, zone_type: ZoneType) -> &AtomicU32 {
        match zone_type {
            ZoneType::Logical => &self.logical_zone_counts[lock],
            ZoneType::Physical => &self.physical_zone_counts[lock],
            ZoneType::Journal => unreachable!("journal zone has no zone count"),
        }
    }

    fn counter_index(&self, lock: usize, zone_id: usize) -> usize {
        zone_id * self.locks + lock
    }

    fn is_journal_locked(&self, lock: usize) -> bool {
        let journal_value = u32::from(self.journal_counters[lock]);
        let decrements = self.journal_decrements[lock].load(Ordering::Acquire);
        debug_assert!(
            decrements <= journal_value,
            "journal zone lock counter must not underflow"
        );
        journal_value != decrements
    }

    /// Whether `lock` is held by the journal zone or any zone of
    /// `zone_type`. Not meaningful for `ZoneType::Journal`.
    #[must_use]
    pub fn is_locked(&self, lock: usize, zone_type: ZoneType) -> bool {
        self.is_journal_locked(lock)
            || self.zone_count(lock, zone_type).load(Ordering::Acquire) != 0
    }

    /// Whether `lock` is free in every zone type.
    #[must_use]
    pub fn is_unlocked(&self, lock: usize) -> bool {
        !self.is_locked(lock, ZoneType::Logical) && !self.is_locked(lock, ZoneType::Physical)
    }

    /// Prepare `lock` for reuse with `value` journal-zone references.
    ///
    /// Journal zone only. The lock must not currently be in use.
    pub fn initialize(&mut self, lock: usize, value: u16) {
        let decrements = self.journal_decrements[lock].load(Ordering::Acquire);
        debug_assert_eq!(
            u32::from(self.journal_counters[lock]),
            decrements,
            "count to be initialized must not be in use"
        );
        self.journal_counters[lock] = value;
        self.journal_decrements[lock].store(0, Ordering::Release);
    }

    /// Add a journal-zone reference to `lock`. Journal zone only.
    pub fn acquire_journal(&mut self, lock: usize) {
        debug_assert!(
            self.journal_counters[lock] < u16::MAX,
            "journal lock counter must not overflow"
        );
        self.journal_counters[lock] = self.journal_counters[lock].saturating_add(1);
    }

    /// Add a reference to `lock` from a logical or physical zone.
    ///
    /// When this zone acquires the lock for the first time, the zone count
    /// for its type is raised so cross-zone readers observe the hold.
    pub fn acquire(&mut self, lock: usize, zone_type: ZoneType, zone_id: usize) {
        debug_assert!(
            !matches!(zone_type, ZoneType::Journal),
            "journal zone uses acquire_journal"
        );
        let index = self.counter_index(lock, zone_id);
        let current = match zone_type {
            ZoneType::Logical => &mut self.logical_counters[index],
            ZoneType::Physical => &mut self.physical_counters[index],
            ZoneType::Journal => return,
        };
        debug_assert!(*current < u16::MAX, "lock counter must not overflow");
        if *current == 0 {
            // This zone is acquiring this lock for the first time.
            let zone_count = match zone_type {
                ZoneType::Logical => &self.logical_zone_counts[lock],
                ZoneType::Physical => &self.physical_zone_counts[lock],
                ZoneType::Journal => unreachable!("journal zone has no zone count"),
            };
            zone_count.fetch_add(1, Ordering::AcqRel);
        }
        *current += 1;
    }

    /// Release a reference from a logical or physical zone.
    ///
    /// Returns `true` when this release was a notification edge: the zone
    /// was its type's last holder and the caller won the single-slot
    /// notification. The journal owner should run its reap callback and
    /// then call [`acknowledge_unlock`](Self::acknowledge_unlock).
    pub fn release(&mut self, lock: usize, zone_type: ZoneType, zone_id: usize) -> bool {
        debug_assert!(
            !matches!(zone_type, ZoneType::Journal),
            "journal zone uses release_journal"
        );
        let index = self.counter_index(lock, zone_id);
        let current = match zone_type {
            ZoneType::Logical => &mut self.logical_counters[index],
            ZoneType::Physical => &mut self.physical_counters[index],
            ZoneType::Journal => return false,
        };
        if *current == 0 {
            error!(
                target: "karst::journal::locks",
                event = "lock_underflow",
                lock,
                zone_id,
                "lock counter release without matching acquire"
            );
            debug_assert!(false, "decrement of lock counter must not underflow");
            return false;
        }
        *current -= 1;
        if *current != 0 {
            return false;
        }

        // Release edge precedes the notification the owner observes.
        if self.zone_count(lock, zone_type).fetch_sub(1, Ordering::Release) == 1 {
            return self.attempt_notification();
        }
        false
    }

    /// Release a journal-zone reference from the journal zone itself.
    ///
    /// Returns `true` on a notification edge, as [`release`](Self::release).
    pub fn release_journal(&mut self, lock: usize) -> bool {
        if self.is_journal_locked(lock) {
            let decrements = self.journal_decrements[lock].load(Ordering::Acquire) as u16;
            debug_assert!(self.journal_counters[lock] > decrements);
        } else {
            error!(
                target: "karst::journal::locks",
                event = "journal_lock_underflow",
                lock,
                "journal lock release without matching reference"
            );
            debug_assert!(false, "journal lock release must not underflow");
            return false;
        }
        self.journal_decrements[lock].fetch_add(1, Ordering::Release);
        if !self.is_journal_locked(lock) {
            return self.attempt_notification();
        }
        false
    }

    /// Release a journal-zone reference from some other zone. Purely
    /// atomic; the journal zone observes the decrement on its next check.
    pub fn release_journal_from_other_zone(&self, lock: usize) {
        self.journal_decrements[lock].fetch_add(1, Ordering::Release);
    }

    /// Try to claim the single in-flight notification slot.
    fn attempt_notification(&self) -> bool {
        self.notifying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the notification flag so the next release edge may notify.
    pub fn acknowledge_unlock(&self) {
        self.notifying.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_counts_track_first_and_last_reference() {
        let mut counter = LockCounter::new(4, 2, 2);
        counter.acquire(1, ZoneType::Logical, 0);
        counter.acquire(1, ZoneType::Logical, 0);
        assert!(counter.is_locked(1, ZoneType::Logical));
        assert!(!counter.is_locked(1, ZoneType::Physical));

        assert!(!counter.release(1, ZoneType::Logical, 0));
        assert!(counter.is_locked(1, ZoneType::Logical));
        // Last reference of the only holding zone: notification edge.
        assert!(counter.release(1, ZoneType::Logical, 0));
        assert!(!counter.is_locked(1, ZoneType::Logical));
    }

    #[test]
    fn notification_fires_at_most_once_per_edge() {
        let mut counter = LockCounter::new(2, 1, 2);
        counter.acquire(0, ZoneType::Physical, 0);
        counter.acquire(0, ZoneType::Physical, 1);

        assert!(!counter.release(0, ZoneType::Physical, 0));
        // Second zone's release wins the notification slot.
        assert!(counter.release(0, ZoneType::Physical, 1));

        // Until acknowledged, further edges cannot notify.
        counter.acquire(1, ZoneType::Physical, 0);
        assert!(!counter.release(1, ZoneType::Physical, 0));
        counter.acknowledge_unlock();
        counter.acquire(1, ZoneType::Physical, 0);
        assert!(counter.release(1, ZoneType::Physical, 0));
    }

    #[test]
    fn journal_count_is_value_minus_decrements() {
        let mut counter = LockCounter::new(2, 1, 1);
        counter.initialize(0, 0);
        counter.acquire_journal(0);
        counter.acquire_journal(0);
        counter.acquire_journal(0);
        assert!(counter.is_locked(0, ZoneType::Logical));

        counter.release_journal_from_other_zone(0);
        assert!(counter.is_locked(0, ZoneType::Logical));
        assert!(!counter.release_journal(0));
        // Third release drains the journal count: notification edge.
        assert!(counter.release_journal(0));
        assert!(counter.is_unlocked(0));
    }

    #[test]
    fn reinitialize_after_drain() {
        let mut counter = LockCounter::new(1, 1, 1);
        counter.initialize(0, 2);
        counter.release_journal_from_other_zone(0);
        counter.release_journal_from_other_zone(0);
        assert!(counter.is_unlocked(0));
        counter.initialize(0, 0);
        assert!(counter.is_unlocked(0));
    }

    #[test]
    fn zones_are_independent() {
        let mut counter = LockCounter::new(1, 2, 1);
        counter.acquire(0, ZoneType::Logical, 0);
        counter.acquire(0, ZoneType::Logical, 1);
        assert_eq!(counter.logical_zone_counts[0].load(Ordering::Acquire), 2);
        assert!(!counter.release(0, ZoneType::Logical, 0));
        assert!(counter.release(0, ZoneType::Logical, 1));
    }
}
