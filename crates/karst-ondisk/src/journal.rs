//! Recovery-journal block format.
//!
//! The journal is a ring of sequence-numbered blocks. Each block carries a
//! 16-byte header (magic, version, entry count, sequence) followed by
//! packed 18-byte entries: the logical block number and the old and new
//! mapping entries. Replay applies entries in sequence order; a block whose
//! recorded sequence does not match its ring position is stale.

use crate::{BLOCK_MAP_ENTRY_SIZE, pack_entry, unpack_entry_slice};
use karst_error::{KarstError, Result};
use karst_types::{DataLocation, Lbn};

const JOURNAL_BLOCK_MAGIC: u32 = 0x4B_4A_4E_4C; // "KJNL"
const JOURNAL_BLOCK_VERSION: u16 = 1;

/// Bytes of journal block header.
pub const JOURNAL_HEADER_SIZE: usize = 16;

/// Bytes per packed journal entry.
pub const JOURNAL_ENTRY_SIZE: usize = 8 + 2 * BLOCK_MAP_ENTRY_SIZE;

/// Entries that fit in one journal block of `block_size` bytes.
#[must_use]
pub fn entries_per_block(block_size: usize) -> usize {
    block_size.saturating_sub(JOURNAL_HEADER_SIZE) / JOURNAL_ENTRY_SIZE
}

/// One intent record: logical block `lbn` moves from `old` to `new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    pub lbn: Lbn,
    pub old: DataLocation,
    pub new: DataLocation,
}

impl JournalEntry {
    fn pack_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.lbn.0.to_le_bytes());
        out[8..13].copy_from_slice(&pack_entry(self.old));
        out[13..18].copy_from_slice(&pack_entry(self.new));
    }

    fn unpack_from(raw: &[u8]) -> Result<Self> {
        let lbn = Lbn(u64::from_le_bytes(raw[0..8].try_into().map_err(|_| {
            KarstError::Format("journal entry shorter than 8 bytes".to_owned())
        })?));
        Ok(Self {
            lbn,
            old: unpack_entry_slice(&raw[8..13])?,
            new: unpack_entry_slice(&raw[13..18])?,
        })
    }
}

/// In-memory image of one journal block being assembled or decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalBlock {
    pub sequence: u64,
    pub entries: Vec<JournalEntry>,
}

impl JournalBlock {
    #[must_use]
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            entries: Vec::new(),
        }
    }

    /// Serialize to exactly `block_size` bytes.
    pub fn pack(&self, block_size: usize) -> Result<Vec<u8>> {
        if self.entries.len() > entries_per_block(block_size) {
            return Err(KarstError::Format(format!(
                "journal block overflow: {} entries, capacity {}",
                self.entries.len(),
                entries_per_block(block_size)
            )));
        }
        let mut block = vec![0_u8; block_size];
        block[0..4].copy_from_slice(&JOURNAL_BLOCK_MAGIC.to_le_bytes());
        block[4..6].copy_from_slice(&JOURNAL_BLOCK_VERSION.to_le_bytes());
        block[6..8].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        block[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        for (index, entry) in self.entries.iter().enumerate() {
            let offset = JOURNAL_HEADER_SIZE + index * JOURNAL_ENTRY_SIZE;
            entry.pack_into(&mut block[offset..offset + JOURNAL_ENTRY_SIZE]);
        }
        Ok(block)
    }

    /// Decode a journal block image. Returns `None` for blocks that do not
    /// carry the journal magic (unwritten ring slots).
    pub fn unpack(raw: &[u8]) -> Result<Option<Self>> {
        if raw.len() < JOURNAL_HEADER_SIZE {
            return Err(KarstError::Format(
                "journal block shorter than header".to_owned(),
            ));
        }
        let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != JOURNAL_BLOCK_MAGIC {
            return Ok(None);
        }
        let version = u16::from_le_bytes([raw[4], raw[5]]);
        if version != JOURNAL_BLOCK_VERSION {
            return Err(KarstError::Format(format!(
                "unknown journal block version {version}"
            )));
        }
        let count = usize::from(u16::from_le_bytes([raw[6], raw[7]]));
        if count > entries_per_block(raw.len()) {
            return Err(KarstError::Format(format!(
                "journal block entry count {count} exceeds capacity"
            )));
        }
        let sequence = u64::from_le_bytes(raw[8..16].try_into().map_err(|_| {
            KarstError::Format("journal block sequence field truncated".to_owned())
        })?);

        let mut entries = Vec::with_capacity(count);
        for index in 0..count {
            let offset = JOURNAL_HEADER_SIZE + index * JOURNAL_ENTRY_SIZE;
            entries.push(JournalEntry::unpack_from(
                &raw[offset..offset + JOURNAL_ENTRY_SIZE],
            )?);
        }
        Ok(Some(Self { sequence, entries }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_types::{MappingState, Pbn};

    fn sample_entry(i: u64) -> JournalEntry {
        JournalEntry {
            lbn: Lbn(i),
            old: DataLocation::UNMAPPED,
            new: DataLocation::new(Pbn(100 + i), MappingState::Uncompressed),
        }
    }

    #[test]
    fn block_roundtrip() {
        let mut block = JournalBlock::new(42);
        for i in 0..5 {
            block.entries.push(sample_entry(i));
        }
        let raw = block.pack(4096).expect("pack");
        assert_eq!(raw.len(), 4096);
        let back = JournalBlock::unpack(&raw).expect("unpack").expect("present");
        assert_eq!(back, block);
    }

    #[test]
    fn unwritten_slot_decodes_as_none() {
        let raw = vec![0_u8; 4096];
        assert_eq!(JournalBlock::unpack(&raw).expect("unpack"), None);
    }

    #[test]
    fn oversized_entry_count_is_rejected() {
        let block = JournalBlock::new(1);
        let mut raw = block.pack(4096).expect("pack");
        raw[6..8].copy_from_slice(&u16::MAX.to_le_bytes());
        assert!(JournalBlock::unpack(&raw).is_err());
    }

    #[test]
    fn capacity_matches_layout() {
        // (4096 - 16) / 18 packed entries per block.
        assert_eq!(entries_per_block(4096), 226);
        let mut block = JournalBlock::new(0);
        for i in 0..226 {
            block.entries.push(sample_entry(i));
        }
        assert!(block.pack(4096).is_ok());
        block.entries.push(sample_entry(226));
        assert!(block.pack(4096).is_err());
    }
}
