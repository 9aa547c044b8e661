//! Slabs: the unit of physical allocation.
//!
//! A slab owns a contiguous PBN range split into a data area, a refcount
//! area, and a slab-journal tail. The thin slab journal records every
//! reference delta and pins the recovery-journal block that motivated it
//! until the delta is durable.

use crate::ref_counts::{RefCounts, ShareOutcome};
use crate::pbn_lock::PbnLock;
use karst_error::{KarstError, Result};
use karst_ondisk::layout::{SlabConfig, SlabSummaryEntry};
use karst_types::{JournalPoint, Pbn, PhysicalZone};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Rebuild status of a slab after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabStatus {
    Rebuilt,
    RequiresScrubbing,
    RequiresHighPriorityScrubbing,
    Rebuilding,
    Replaying,
}

/// Direction of a reference delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOp {
    Increment,
    Decrement,
}

/// One recorded reference delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub sbn: u32,
    pub op: RefOp,
    pub point: JournalPoint,
}

/// Thin slab journal: records deltas and tracks which recovery-journal
/// blocks they pin. The body format is an external collaborator; what the
/// data path needs is the pinning contract.
#[derive(Debug, Default)]
pub struct SlabJournal {
    entries: Vec<SlabJournalEntry>,
    /// Recovery-journal pins: sequence number -> outstanding entry count.
    recovery_locks: BTreeMap<u64, u32>,
}

impl SlabJournal {
    /// Record a delta and pin its recovery-journal block.
    pub fn add_entry(&mut self, sbn: u32, op: RefOp, point: JournalPoint) {
        self.entries.push(SlabJournalEntry { sbn, op, point });
        *self.recovery_locks.entry(point.sequence).or_insert(0) += 1;
        trace!(
            target: "karst::depot::slab_journal",
            event = "entry_added",
            sbn,
            op = ?op,
            sequence = point.sequence
        );
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Drain all recovery pins at tail commit; the caller releases the
    /// physical-zone lock-counter references.
    pub fn drain_recovery_locks(&mut self) -> Vec<(u64, u32)> {
        let locks: Vec<(u64, u32)> = self
            .recovery_locks
            .iter()
            .map(|(sequence, count)| (*sequence, *count))
            .collect();
        self.recovery_locks.clear();
        self.entries.clear();
        locks
    }
}

/// One slab.
#[derive(Debug)]
pub struct Slab {
    pub slab_number: u32,
    pub zone: PhysicalZone,
    /// First PBN of the data area.
    start: Pbn,
    /// One past the last data PBN.
    end: Pbn,
    /// First PBN of the refcount area.
    ref_counts_origin: Pbn,
    pub status: SlabStatus,
    pub priority: u8,
    ref_counts: RefCounts,
    pub journal: SlabJournal,
}

impl Slab {
    #[must_use]
    pub fn new(
        slab_number: u32,
        zone: PhysicalZone,
        slab_origin: Pbn,
        config: &SlabConfig,
    ) -> Self {
        let start = slab_origin;
        let end = Pbn(start.0 + config.data_blocks);
        Self {
            slab_number,
            zone,
            start,
            end,
            ref_counts_origin: end,
            status: SlabStatus::Rebuilt,
            priority: 0,
            ref_counts: RefCounts::new(config.data_blocks as usize),
            journal: SlabJournal::default(),
        }
    }

    #[must_use]
    pub fn data_start(&self) -> Pbn {
        self.start
    }

    #[must_use]
    pub fn ref_counts_origin(&self) -> Pbn {
        self.ref_counts_origin
    }

    /// Whether this slab's in-memory refcounts are authoritative.
    #[must_use]
    pub fn is_recovered(&self) -> bool {
        self.status == SlabStatus::Rebuilt
    }

    #[must_use]
    pub fn contains_data_pbn(&self, pbn: Pbn) -> bool {
        pbn.0 >= self.start.0 && pbn.0 < self.end.0
    }

    /// Translate a data PBN into this slab's block index.
    pub fn slab_block_number(&self, pbn: Pbn) -> Result<usize> {
        if !self.contains_data_pbn(pbn) {
            return Err(KarstError::OutOfRange {
                kind: "pbn",
                value: pbn.0,
                limit: self.end.0,
            });
        }
        Ok((pbn.0 - self.start.0) as usize)
    }

    /// Absolute PBN of a slab block index.
    #[must_use]
    pub fn pbn_of(&self, sbn: usize) -> Pbn {
        Pbn(self.start.0 + sbn as u64)
    }

    #[must_use]
    pub fn free_block_count(&self) -> u64 {
        self.ref_counts.free_count()
    }

    #[must_use]
    pub fn ref_counts(&self) -> &RefCounts {
        &self.ref_counts
    }

    pub fn ref_counts_mut(&mut self) -> &mut RefCounts {
        &mut self.ref_counts
    }

    /// Reset the search cursor when this slab becomes the open slab.
    pub fn open(&mut self) {
        self.ref_counts.reset_search_cursor();
        debug!(
            target: "karst::depot::slab",
            event = "slab_opened",
            slab = self.slab_number,
            free = self.free_block_count()
        );
    }

    pub fn mark_replaying(&mut self) {
        if self.status == SlabStatus::Rebuilt {
            self.status = SlabStatus::Replaying;
        }
    }

    pub fn mark_unrecovered(&mut self) {
        self.status = SlabStatus::RequiresScrubbing;
    }

    pub fn finish_scrubbing(&mut self) {
        self.status = SlabStatus::Rebuilt;
    }

    /// Allocate one free block, leaving it provisionally referenced and
    /// recording the hold on the caller's fresh PBN write lock.
    pub fn allocate(&mut self, lock: &mut PbnLock) -> Option<Pbn> {
        if !self.is_recovered() {
            return None;
        }
        let sbn = self.ref_counts.allocate_provisional()?;
        lock.set_provisional_reference(true);
        Some(self.pbn_of(sbn))
    }

    /// Take a provisional reference on a specific PBN if the lock does not
    /// already hold one.
    pub fn acquire_provisional_reference(
        &mut self,
        pbn: Pbn,
        lock: &mut PbnLock,
    ) -> Result<()> {
        if lock.has_provisional_reference() {
            return Ok(());
        }
        let sbn = self.slab_block_number(pbn)?;
        if self.ref_counts.count(sbn) != crate::ref_counts::EMPTY_REFERENCE {
            return Err(KarstError::Protocol(format!(
                "provisional reference on referenced block {pbn}"
            )));
        }
        let taken = self.ref_counts.allocate_at(sbn)?;
        debug_assert!(taken);
        lock.set_provisional_reference(true);
        Ok(())
    }

    /// Add a dedup share, journaling the delta first.
    ///
    /// Unrecovered slabs keep their refcount state untouched and let
    /// scrubbing correct it; the delta stays captured in the slab journal
    /// and `None` is returned.
    pub fn share_reference(
        &mut self,
        pbn: Pbn,
        point: JournalPoint,
    ) -> Result<Option<ShareOutcome>> {
        let sbn = self.slab_block_number(pbn)?;
        if !self.is_recovered() {
            // Scrubbing will replay the journal, so the delta is captured
            // there and the in-memory count stays untouched. The recovery
            // pin holds until the tail commits, like any other entry.
            self.journal.add_entry(sbn as u32, RefOp::Increment, point);
            return Ok(None);
        }
        // Refused shares never reach the slab journal: peek first.
        match self.ref_counts.count(sbn) {
            crate::ref_counts::EMPTY_REFERENCE | crate::ref_counts::PROVISIONAL_REFERENCE => {
                return Ok(Some(ShareOutcome::Free));
            }
            crate::ref_counts::SATURATED_REFERENCE => {
                return Ok(Some(ShareOutcome::Saturated));
            }
            _ => {}
        }
        self.journal.add_entry(sbn as u32, RefOp::Increment, point);
        Ok(Some(self.ref_counts.share(sbn)?))
    }

    /// Remove one reference, journaling the delta first. Returns the new
    /// count, or `None` when the slab is unrecovered and the delta was
    /// deferred to scrubbing.
    pub fn decrement_reference(
        &mut self,
        pbn: Pbn,
        point: JournalPoint,
    ) -> Result<Option<u8>> {
        let sbn = self.slab_block_number(pbn)?;
        if !self.is_recovered() {
            self.journal.add_entry(sbn as u32, RefOp::Decrement, point);
            return Ok(None);
        }
        // Sticky-saturated decrements are no-ops and stay out of the
        // slab journal; invalid decrements must not reach it either.
        if self.ref_counts.count(sbn) == crate::ref_counts::SATURATED_REFERENCE {
            return Ok(Some(crate::ref_counts::SATURATED_REFERENCE));
        }
        let next = self.ref_counts.decrement(sbn)?;
        self.journal.add_entry(sbn as u32, RefOp::Decrement, point);
        Ok(Some(next))
    }

    /// Commit a provisional reference at journal commit of its mapping.
    pub fn commit_provisional(&mut self, pbn: Pbn, point: JournalPoint) -> Result<()> {
        let sbn = self.slab_block_number(pbn)?;
        self.journal.add_entry(sbn as u32, RefOp::Increment, point);
        if self.is_recovered() {
            self.ref_counts.commit_provisional(sbn)?;
        }
        Ok(())
    }

    /// Release a provisional reference without committing.
    pub fn release_provisional(&mut self, pbn: Pbn) -> Result<()> {
        let sbn = self.slab_block_number(pbn)?;
        self.ref_counts.release_provisional(sbn)
    }

    /// Summary descriptor for the slab-summary partition.
    #[must_use]
    pub fn summary_entry(&self) -> SlabSummaryEntry {
        let data_blocks = self.ref_counts.data_blocks() as u64;
        let used = data_blocks - self.free_block_count();
        let free_hint = if data_blocks == 0 {
            u8::MAX
        } else {
            ((used * 255) / data_blocks) as u8
        };
        SlabSummaryEntry {
            free_hint,
            is_clean: !self.ref_counts.is_dirty() && self.journal.is_blank(),
            load_ref_counts: used != 0,
        }
    }
}
