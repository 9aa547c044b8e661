#![forbid(unsafe_code)]
//! Recovery journal tail for karst.
//!
//! The journal is a ring of sequence-numbered blocks in its own partition.
//! The data path appends intent records `(lbn, old, new)` to the open tail
//! block; `commit` makes the tail durable. Every journal block stays
//! pinned through the [`LockCounter`] until the metadata changes recorded
//! in it (block-map pages, reference counts) are themselves durable, at
//! which point the head may advance over it.

mod lock_counter;

pub use lock_counter::LockCounter;

use asupersync::Cx;
use karst_block::BlockDevice;
use karst_error::{KarstError, Result};
use karst_ondisk::journal::{JournalBlock, JournalEntry, entries_per_block};
use karst_ondisk::layout::Partition;
use karst_types::JournalPoint;
use tracing::{debug, trace};

/// Monotonic journal counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub entries_appended: u64,
    pub blocks_committed: u64,
    pub blocks_reaped: u64,
}

/// The recovery journal's write side.
#[derive(Debug)]
pub struct RecoveryJournal {
    partition: Partition,
    block_size: usize,
    entries_per_block: usize,
    /// The open block being assembled.
    tail: JournalBlock,
    /// Entries of the open block already durably committed.
    committed_entries: usize,
    /// Oldest sequence not yet reaped.
    head_sequence: u64,
    lock_counter: LockCounter,
    stats: JournalStats,
}

impl RecoveryJournal {
    /// Create a journal over `partition` with one lock per ring block.
    pub fn new(
        partition: Partition,
        block_size: usize,
        logical_zones: usize,
        physical_zones: usize,
    ) -> Result<Self> {
        if partition.count < 2 {
            return Err(KarstError::Format(
                "recovery journal needs at least two blocks".to_owned(),
            ));
        }
        let locks = usize::try_from(partition.count)
            .map_err(|_| KarstError::Format("journal ring too large".to_owned()))?;
        Ok(Self {
            partition,
            block_size,
            entries_per_block: entries_per_block(block_size),
            tail: JournalBlock::new(1),
            committed_entries: 0,
            head_sequence: 1,
            lock_counter: LockCounter::new(locks, logical_zones, physical_zones),
            stats: JournalStats::default(),
        })
    }

    /// Ring slot index (and lock index) for a sequence number.
    #[must_use]
    pub fn lock_index(&self, sequence: u64) -> usize {
        (sequence % self.partition.count) as usize
    }

    #[must_use]
    pub fn tail_sequence(&self) -> u64 {
        self.tail.sequence
    }

    #[must_use]
    pub fn head_sequence(&self) -> u64 {
        self.head_sequence
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        self.stats
    }

    #[must_use]
    pub fn lock_counter(&self) -> &LockCounter {
        &self.lock_counter
    }

    pub fn lock_counter_mut(&mut self) -> &mut LockCounter {
        &mut self.lock_counter
    }

    /// Whether the open tail block has entries not yet committed.
    #[must_use]
    pub fn has_uncommitted_entries(&self) -> bool {
        self.tail.entries.len() > self.committed_entries
    }

    /// Append one intent record, sealing the tail block first if it is
    /// full. Takes a journal-zone lock reference for the entry, released
    /// when the entry's block commits.
    pub fn append(
        &mut self,
        cx: &Cx,
        dev: &dyn BlockDevice,
        entry: JournalEntry,
    ) -> Result<JournalPoint> {
        if self.tail.entries.len() >= self.entries_per_block {
            self.seal_tail(cx, dev)?;
        }

        let point = JournalPoint {
            sequence: self.tail.sequence,
            entry: self.tail.entries.len() as u16,
        };
        let lock = self.lock_index(point.sequence);
        self.lock_counter.acquire_journal(lock);
        self.tail.entries.push(entry);
        self.stats.entries_appended += 1;
        trace!(
            target: "karst::journal",
            event = "entry_appended",
            sequence = point.sequence,
            entry = point.entry,
            lbn = entry.lbn.0
        );
        Ok(point)
    }

    /// Write the open tail block to its ring slot, releasing the
    /// journal-zone references for the newly durable entries.
    ///
    /// Returns `true` when a lock-release notification edge fired (the
    /// caller should reap and acknowledge).
    pub fn commit(&mut self, cx: &Cx, dev: &dyn BlockDevice) -> Result<bool> {
        if !self.has_uncommitted_entries() {
            return Ok(false);
        }
        let slot = self.lock_index(self.tail.sequence);
        let pbn = self.partition.pbn_at(slot as u64)?;
        let image = self.tail.pack(self.block_size)?;
        dev.write_block(cx, pbn, &image)?;
        self.stats.blocks_committed += 1;

        let lock = slot;
        let newly_committed = self.tail.entries.len() - self.committed_entries;
        self.committed_entries = self.tail.entries.len();
        let mut notified = false;
        for _ in 0..newly_committed {
            notified |= self.lock_counter.release_journal(lock);
        }
        debug!(
            target: "karst::journal",
            event = "tail_committed",
            sequence = self.tail.sequence,
            entries = self.committed_entries,
            notified
        );
        Ok(notified)
    }

    /// Seal the current tail: commit it and open the next sequence.
    fn seal_tail(&mut self, cx: &Cx, dev: &dyn BlockDevice) -> Result<()> {
        let notified = self.commit(cx, dev)?;
        let next_sequence = self.tail.sequence + 1;

        // The next ring slot must have been reaped before reuse.
        self.reap();
        if notified {
            self.lock_counter.acknowledge_unlock();
        }
        if next_sequence - self.head_sequence >= self.partition.count {
            return Err(KarstError::Protocol(format!(
                "journal ring full: head {} tail {next_sequence}",
                self.head_sequence
            )));
        }

        let lock = self.lock_index(next_sequence);
        self.lock_counter.initialize(lock, 0);
        self.tail = JournalBlock::new(next_sequence);
        self.committed_entries = 0;
        Ok(())
    }

    /// Advance the head over blocks whose locks are free in every zone.
    pub fn reap(&mut self) {
        while self.head_sequence < self.tail.sequence {
            let lock = self.lock_index(self.head_sequence);
            if !self.lock_counter.is_unlocked(lock) {
                break;
            }
            self.head_sequence += 1;
            self.stats.blocks_reaped += 1;
        }
    }

    /// Commit the tail and flush the device: the durability point for
    /// FUA/SYNC acknowledgment.
    pub fn flush(&mut self, cx: &Cx, dev: &dyn BlockDevice) -> Result<bool> {
        let notified = self.commit(cx, dev)?;
        dev.sync(cx)?;
        Ok(notified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_block::{ByteBlockDevice, MemoryByteDevice};
    use karst_ondisk::layout::Partition;
    use karst_types::{DataLocation, Lbn, MappingState, Pbn, ZoneType};

    const BLOCK_SIZE: usize = 512;

    fn device(blocks: u64) -> ByteBlockDevice<MemoryByteDevice> {
        ByteBlockDevice::new(
            MemoryByteDevice::new(blocks as usize * BLOCK_SIZE),
            BLOCK_SIZE as u32,
        )
        .expect("device")
    }

    fn journal(blocks: u64) -> RecoveryJournal {
        RecoveryJournal::new(
            Partition {
                start: Pbn(1),
                count: blocks,
            },
            BLOCK_SIZE,
            1,
            1,
        )
        .expect("journal")
    }

    fn entry(lbn: u64, pbn: u64) -> JournalEntry {
        JournalEntry {
            lbn: Lbn(lbn),
            old: DataLocation::UNMAPPED,
            new: DataLocation::new(Pbn(pbn), MappingState::Uncompressed),
        }
    }

    #[test]
    fn append_assigns_sequential_points() {
        let cx = Cx::for_testing();
        let dev = device(16);
        let mut journal = journal(4);
        let first = journal.append(&cx, &dev, entry(0, 100)).expect("append");
        let second = journal.append(&cx, &dev, entry(1, 101)).expect("append");
        assert_eq!(first, JournalPoint { sequence: 1, entry: 0 });
        assert_eq!(second, JournalPoint { sequence: 1, entry: 1 });
    }

    #[test]
    fn commit_makes_tail_replayable() {
        let cx = Cx::for_testing();
        let dev = device(16);
        let mut journal = journal(4);
        journal.append(&cx, &dev, entry(7, 200)).expect("append");
        journal.commit(&cx, &dev).expect("commit");

        let slot = journal.lock_index(1);
        let raw = dev.read_block(&cx, Pbn(1 + slot as u64)).expect("read");
        let block = JournalBlock::unpack(raw.as_slice())
            .expect("decode")
            .expect("written");
        assert_eq!(block.sequence, 1);
        assert_eq!(block.entries, vec![entry(7, 200)]);
    }

    #[test]
    fn journal_lock_pins_block_until_commit() {
        let cx = Cx::for_testing();
        let dev = device(16);
        let mut journal = journal(4);
        let point = journal.append(&cx, &dev, entry(0, 100)).expect("append");
        let lock = journal.lock_index(point.sequence);
        assert!(journal.lock_counter().is_locked(lock, ZoneType::Logical));
        journal.commit(&cx, &dev).expect("commit");
        assert!(journal.lock_counter().is_unlocked(lock));
    }

    #[test]
    fn tail_seals_when_full_and_head_reaps() {
        let cx = Cx::for_testing();
        let dev = device(16);
        let mut journal = journal(4);
        let capacity = entries_per_block(BLOCK_SIZE);

        for i in 0..(capacity + 1) as u64 {
            journal.append(&cx, &dev, entry(i, 100 + i)).expect("append");
        }
        assert_eq!(journal.tail_sequence(), 2);
        journal.reap();
        // Block 1 was fully committed when sealed and held no zone pins.
        assert_eq!(journal.head_sequence(), 2);
    }

    #[test]
    fn zone_pins_block_reaping() {
        let cx = Cx::for_testing();
        let dev = device(16);
        let mut journal = journal(4);
        let capacity = entries_per_block(BLOCK_SIZE);

        let point = journal.append(&cx, &dev, entry(0, 100)).expect("append");
        let lock = journal.lock_index(point.sequence);
        journal.lock_counter_mut().acquire(lock, ZoneType::Logical, 0);

        for i in 1..(capacity + 1) as u64 {
            journal.append(&cx, &dev, entry(i, 100 + i)).expect("append");
        }
        journal.reap();
        assert_eq!(journal.head_sequence(), 1, "logical pin must hold the head");

        let notified = journal.lock_counter_mut().release(lock, ZoneType::Logical, 0);
        assert!(notified);
        journal.reap();
        journal.lock_counter().acknowledge_unlock();
        assert_eq!(journal.head_sequence(), 2);
    }

    #[test]
    fn ring_overflow_is_a_protocol_error() {
        let cx = Cx::for_testing();
        let dev = device(16);
        let mut journal = journal(2);
        let capacity = entries_per_block(BLOCK_SIZE);

        // Pin sequence 1 from a logical zone so its slot can never recycle.
        let point = journal.append(&cx, &dev, entry(0, 100)).expect("append");
        let lock = journal.lock_index(point.sequence);
        journal.lock_counter_mut().acquire(lock, ZoneType::Logical, 0);

        let mut result = Ok(JournalPoint { sequence: 0, entry: 0 });
        for i in 1..(2 * capacity + 2) as u64 {
            result = journal.append(&cx, &dev, entry(i, 100 + i));
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(KarstError::Protocol(_))));
    }

    #[test]
    fn flush_commits_and_syncs() {
        let cx = Cx::for_testing();
        let dev = device(16);
        let mut journal = journal(4);
        journal.append(&cx, &dev, entry(0, 100)).expect("append");
        assert!(journal.has_uncommitted_entries());
        journal.flush(&cx, &dev).expect("flush");
        assert!(!journal.has_uncommitted_entries());
        assert_eq!(journal.stats().blocks_committed, 1);
    }
}
