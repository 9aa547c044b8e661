//! Per-slab reference counting.
//!
//! One byte per data block: 0 is free, 1..=253 are ordinary reference
//! counts, 254 marks a provisional (pre-commit) reference, and 255 is the
//! saturated ceiling. Saturation is sticky: a saturated block is never
//! deduplicated against again and never decremented.

use karst_error::{KarstError, Result};
use tracing::trace;

/// A free, unreferenced block.
pub const EMPTY_REFERENCE: u8 = 0;
/// Highest ordinary reference count before saturation.
pub const MAX_NORMAL_REFERENCE: u8 = 253;
/// A pre-commit hold taken at allocation, converted to 1 at journal commit.
pub const PROVISIONAL_REFERENCE: u8 = 254;
/// Sticky saturation: the block is permanently referenced.
pub const SATURATED_REFERENCE: u8 = 255;

/// Outcome of trying to add a dedup share on a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    /// The reference count was raised; the new count is attached.
    Shared(u8),
    /// The count is saturated; the caller must write fresh data instead.
    Saturated,
    /// The block is free (stale advice); the caller must write fresh data.
    Free,
}

/// Reference counters for one slab's data area.
#[derive(Debug, Clone)]
pub struct RefCounts {
    counts: Vec<u8>,
    free_count: u64,
    /// Next slab block number the allocation search starts from.
    cursor: usize,
    dirty: bool,
}

impl RefCounts {
    #[must_use]
    pub fn new(data_blocks: usize) -> Self {
        Self {
            counts: vec![EMPTY_REFERENCE; data_blocks],
            free_count: data_blocks as u64,
            cursor: 0,
            dirty: false,
        }
    }

    #[must_use]
    pub fn data_blocks(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    #[must_use]
    pub fn count(&self, sbn: usize) -> u8 {
        self.counts[sbn]
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Restart the allocation search from the front of the slab.
    pub fn reset_search_cursor(&mut self) {
        self.cursor = 0;
    }

    fn check_range(&self, sbn: usize) -> Result<()> {
        if sbn >= self.counts.len() {
            return Err(KarstError::OutOfRange {
                kind: "slab block",
                value: sbn as u64,
                limit: self.counts.len() as u64,
            });
        }
        Ok(())
    }

    /// Find a free block starting at the cursor (wrapping) and take a
    /// provisional reference on it.
    pub fn allocate_provisional(&mut self) -> Option<usize> {
        let len = self.counts.len();
        if len == 0 || self.free_count == 0 {
            return None;
        }
        for probe in 0..len {
            let sbn = (self.cursor + probe) % len;
            if self.counts[sbn] == EMPTY_REFERENCE {
                self.counts[sbn] = PROVISIONAL_REFERENCE;
                self.free_count -= 1;
                self.cursor = (sbn + 1) % len;
                self.dirty = true;
                trace!(
                    target: "karst::depot::refs",
                    event = "provisional_taken",
                    sbn
                );
                return Some(sbn);
            }
        }
        None
    }

    /// Take a provisional reference on a specific free block.
    ///
    /// Returns `false` when the block is already referenced.
    pub fn allocate_at(&mut self, sbn: usize) -> Result<bool> {
        self.check_range(sbn)?;
        if self.counts[sbn] != EMPTY_REFERENCE {
            return Ok(false);
        }
        self.counts[sbn] = PROVISIONAL_REFERENCE;
        self.free_count -= 1;
        self.dirty = true;
        Ok(true)
    }

    /// Convert a provisional reference into a real first reference at
    /// journal commit of the mapping.
    pub fn commit_provisional(&mut self, sbn: usize) -> Result<()> {
        self.check_range(sbn)?;
        if self.counts[sbn] != PROVISIONAL_REFERENCE {
            return Err(KarstError::Protocol(format!(
                "commit of non-provisional reference {} on slab block {sbn}",
                self.counts[sbn]
            )));
        }
        self.counts[sbn] = 1;
        self.dirty = true;
        Ok(())
    }

    /// Drop a provisional reference without committing (failed data-VIO).
    /// A no-op if the block is not provisionally held.
    pub fn release_provisional(&mut self, sbn: usize) -> Result<()> {
        self.check_range(sbn)?;
        if self.counts[sbn] == PROVISIONAL_REFERENCE {
            self.counts[sbn] = EMPTY_REFERENCE;
            self.free_count += 1;
            self.dirty = true;
            trace!(
                target: "karst::depot::refs",
                event = "provisional_released",
                sbn
            );
        }
        Ok(())
    }

    /// Add a dedup share. Increments past `MAX_NORMAL_REFERENCE` latch to
    /// the sticky saturated value; saturated and free blocks refuse the
    /// share so the caller can fall back to a fresh write.
    pub fn share(&mut self, sbn: usize) -> Result<ShareOutcome> {
        self.check_range(sbn)?;
        let outcome = match self.counts[sbn] {
            EMPTY_REFERENCE | PROVISIONAL_REFERENCE => ShareOutcome::Free,
            SATURATED_REFERENCE => ShareOutcome::Saturated,
            MAX_NORMAL_REFERENCE => {
                self.counts[sbn] = SATURATED_REFERENCE;
                self.dirty = true;
                ShareOutcome::Shared(SATURATED_REFERENCE)
            }
            n => {
                self.counts[sbn] = n + 1;
                self.dirty = true;
                ShareOutcome::Shared(n + 1)
            }
        };
        Ok(outcome)
    }

    /// Remove one reference. Underflow is a protocol violation; a
    /// saturated count is sticky and never moves, so the block stays
    /// permanently referenced. A provisional hold decrements to free.
    pub fn decrement(&mut self, sbn: usize) -> Result<u8> {
        self.check_range(sbn)?;
        let next = match self.counts[sbn] {
            EMPTY_REFERENCE => {
                return Err(KarstError::Protocol(format!(
                    "reference underflow on slab block {sbn}"
                )));
            }
            SATURATED_REFERENCE => return Ok(SATURATED_REFERENCE),
            PROVISIONAL_REFERENCE => EMPTY_REFERENCE,
            n => n - 1,
        };
        self.counts[sbn] = next;
        if next == EMPTY_REFERENCE {
            self.free_count += 1;
        }
        self.dirty = true;
        Ok(next)
    }

    /// Serialize counters into refcount-area blocks of `block_size` bytes.
    #[must_use]
    pub fn pack(&self, block_size: usize) -> Vec<Vec<u8>> {
        self.counts
            .chunks(block_size)
            .map(|chunk| {
                let mut block = vec![0_u8; block_size];
                block[..chunk.len()].copy_from_slice(chunk);
                block
            })
            .collect()
    }

    /// Restore counters from refcount-area blocks.
    pub fn load(&mut self, blocks: &[Vec<u8>]) -> Result<()> {
        let mut offset = 0;
        for block in blocks {
            let take = block.len().min(self.counts.len() - offset);
            self.counts[offset..offset + take].copy_from_slice(&block[..take]);
            offset += take;
            if offset == self.counts.len() {
                break;
            }
        }
        if offset < self.counts.len() {
            return Err(KarstError::Format(format!(
                "refcount area too short: {offset} of {} counters",
                self.counts.len()
            )));
        }
        self.free_count = self
            .counts
            .iter()
            .filter(|count| **count == EMPTY_REFERENCE)
            .count() as u64;
        self.dirty = false;
        Ok(())
    }
}
