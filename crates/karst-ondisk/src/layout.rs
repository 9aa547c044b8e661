//! Volume layout: superblock, partitions, slab geometry, slab summary.
//!
//! The physical volume is carved into fixed partitions at format time:
//!
//! ```text
//! [0: superblock][journal ring][block-map pages][slab summary][slab area…]
//! ```
//!
//! Physical block 0 doubles as the reserved zero block: data never maps
//! there because all data PBNs fall inside slab data areas.

use crate::page::entries_per_page;
use karst_error::{KarstError, Result};
use karst_types::{BlockSize, Pbn};

const SUPERBLOCK_MAGIC: u64 = 0x4B41_5253_5442_4C4B;
const SUPERBLOCK_VERSION: u32 = 1;
const SUPERBLOCK_SIZE: usize = 124;

/// Slab-journal tail blocks reserved per slab.
pub const SLAB_JOURNAL_BLOCKS: u64 = 2;

/// A contiguous block range within the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub start: Pbn,
    pub count: u64,
}

impl Partition {
    #[must_use]
    pub fn contains(&self, pbn: Pbn) -> bool {
        pbn.0 >= self.start.0 && pbn.0 < self.start.0 + self.count
    }

    /// Absolute PBN of the `index`th block of this partition.
    pub fn pbn_at(&self, index: u64) -> Result<Pbn> {
        if index >= self.count {
            return Err(KarstError::OutOfRange {
                kind: "partition index",
                value: index,
                limit: self.count,
            });
        }
        Ok(Pbn(self.start.0 + index))
    }

    /// Partition-relative index of an absolute PBN.
    #[must_use]
    pub fn index_of(&self, pbn: Pbn) -> Option<u64> {
        self.contains(pbn).then(|| pbn.0 - self.start.0)
    }

    #[must_use]
    pub fn end(&self) -> Pbn {
        Pbn(self.start.0 + self.count)
    }
}

/// Geometry of one slab: data area, refcount area, slab-journal tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabConfig {
    pub slab_blocks: u64,
    pub data_blocks: u64,
    pub ref_count_blocks: u64,
    pub slab_journal_blocks: u64,
}

impl SlabConfig {
    /// Derive the internal split for a slab of `slab_blocks` total blocks.
    ///
    /// One refcount byte per data block, padded to whole blocks, plus the
    /// fixed slab-journal tail; everything remaining is data.
    pub fn compute(slab_blocks: u64, block_size: BlockSize) -> Result<Self> {
        let bs = u64::from(block_size.get());
        if slab_blocks <= SLAB_JOURNAL_BLOCKS + 1 {
            return Err(KarstError::Format(format!(
                "slab of {slab_blocks} blocks is too small"
            )));
        }
        let available = slab_blocks - SLAB_JOURNAL_BLOCKS;
        let ref_count_blocks = available.div_ceil(bs);
        let data_blocks = available - ref_count_blocks;
        if data_blocks == 0 {
            return Err(KarstError::Format(format!(
                "slab of {slab_blocks} blocks leaves no data area"
            )));
        }
        Ok(Self {
            slab_blocks,
            data_blocks,
            ref_count_blocks,
            slab_journal_blocks: SLAB_JOURNAL_BLOCKS,
        })
    }
}

/// Compact per-slab descriptor kept in the slab-summary partition, used to
/// skip loading clean slabs on recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabSummaryEntry {
    /// Scaled fullness hint: 0 = empty, 255 = no free blocks.
    pub free_hint: u8,
    pub is_clean: bool,
    pub load_ref_counts: bool,
}

/// Bytes per packed summary entry.
pub const SLAB_SUMMARY_ENTRY_SIZE: usize = 2;

impl SlabSummaryEntry {
    #[must_use]
    pub fn pack(&self) -> [u8; SLAB_SUMMARY_ENTRY_SIZE] {
        let flags = u8::from(self.is_clean) | (u8::from(self.load_ref_counts) << 1);
        [self.free_hint, flags]
    }

    #[must_use]
    pub fn unpack(raw: [u8; SLAB_SUMMARY_ENTRY_SIZE]) -> Self {
        Self {
            free_hint: raw[0],
            is_clean: raw[1] & 1 != 0,
            load_ref_counts: raw[1] & 2 != 0,
        }
    }
}

/// Full volume layout, computed at format time and persisted in the
/// superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub journal: Partition,
    pub block_map: Partition,
    pub slab_summary: Partition,
    pub slab_area: Partition,
    pub slab_count: u64,
}

impl Layout {
    /// Carve `physical_blocks` into partitions.
    pub fn compute(
        block_size: BlockSize,
        physical_blocks: u64,
        logical_blocks: u64,
        logical_zones: u8,
        journal_blocks: u64,
        slab_blocks: u64,
    ) -> Result<Self> {
        if journal_blocks == 0 {
            return Err(KarstError::Format("journal must have blocks".to_owned()));
        }
        let epp = entries_per_page(block_size.as_usize()) as u64;
        let leaves = logical_blocks.div_ceil(epp).max(1);
        let interiors = leaves.div_ceil(epp).max(1);
        let map_pages = u64::from(logical_zones.max(1)) + interiors + leaves;

        let journal = Partition {
            start: Pbn(1),
            count: journal_blocks,
        };
        let block_map = Partition {
            start: journal.end(),
            count: map_pages,
        };

        let metadata_end = block_map.end().0;
        let remaining = physical_blocks.checked_sub(metadata_end).ok_or_else(|| {
            KarstError::Format(format!(
                "volume of {physical_blocks} blocks too small for metadata ({metadata_end})"
            ))
        })?;

        let max_slabs = remaining / slab_blocks.max(1);
        let summary_blocks = (max_slabs * SLAB_SUMMARY_ENTRY_SIZE as u64)
            .div_ceil(u64::from(block_size.get()))
            .max(1);
        let slab_summary = Partition {
            start: Pbn(metadata_end),
            count: summary_blocks,
        };

        let slab_space = remaining.checked_sub(summary_blocks).unwrap_or(0);
        let slab_count = slab_space / slab_blocks.max(1);
        if slab_count == 0 {
            return Err(KarstError::Format(format!(
                "volume of {physical_blocks} blocks holds no slabs of {slab_blocks} blocks"
            )));
        }
        let slab_area = Partition {
            start: slab_summary.end(),
            count: slab_count * slab_blocks,
        };

        Ok(Self {
            journal,
            block_map,
            slab_summary,
            slab_area,
            slab_count,
        })
    }
}

/// The formatted volume's identity and geometry, stored in block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub uuid: [u8; 16],
    pub block_size: BlockSize,
    pub logical_blocks: u64,
    pub physical_blocks: u64,
    pub logical_zones: u8,
    pub physical_zones: u8,
    pub hash_zones: u8,
    pub slab_blocks: u64,
    pub layout: Layout,
}

impl Superblock {
    /// Serialize to exactly `block_size` bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut block = vec![0_u8; self.block_size.as_usize()];
        let mut at = 0;
        put_bytes(&mut block, &mut at, &SUPERBLOCK_MAGIC.to_le_bytes());
        put_bytes(&mut block, &mut at, &SUPERBLOCK_VERSION.to_le_bytes());
        put_bytes(&mut block, &mut at, &self.block_size.get().to_le_bytes());
        put_bytes(&mut block, &mut at, &self.uuid);
        put_bytes(&mut block, &mut at, &self.logical_blocks.to_le_bytes());
        put_bytes(&mut block, &mut at, &self.physical_blocks.to_le_bytes());
        put_bytes(&mut block, &mut at, &[
            self.logical_zones,
            self.physical_zones,
            self.hash_zones,
            0,
        ]);
        put_bytes(&mut block, &mut at, &self.slab_blocks.to_le_bytes());
        for partition in [
            self.layout.journal,
            self.layout.block_map,
            self.layout.slab_summary,
            self.layout.slab_area,
        ] {
            put_bytes(&mut block, &mut at, &partition.start.0.to_le_bytes());
            put_bytes(&mut block, &mut at, &partition.count.to_le_bytes());
        }
        debug_assert_eq!(at, SUPERBLOCK_SIZE);
        block
    }

    /// Decode and validate a superblock image.
    pub fn unpack(raw: &[u8]) -> Result<Self> {
        if raw.len() < SUPERBLOCK_SIZE {
            return Err(KarstError::Format(
                "superblock image shorter than format".to_owned(),
            ));
        }
        let mut at = 0;
        let magic = read_u64(raw, &mut at);
        if magic != SUPERBLOCK_MAGIC {
            return Err(KarstError::Format(format!(
                "bad superblock magic {magic:#x}"
            )));
        }
        let version = read_u32(raw, &mut at);
        if version != SUPERBLOCK_VERSION {
            return Err(KarstError::Format(format!(
                "unknown superblock version {version}"
            )));
        }
        let block_size = BlockSize::new(read_u32(raw, &mut at))
            .map_err(|err| KarstError::Format(err.to_string()))?;
        let mut uuid = [0_u8; 16];
        uuid.copy_from_slice(&raw[at..at + 16]);
        at += 16;
        let logical_blocks = read_u64(raw, &mut at);
        let physical_blocks = read_u64(raw, &mut at);
        let (logical_zones, physical_zones, hash_zones) = (raw[at], raw[at + 1], raw[at + 2]);
        at += 4;
        if logical_zones == 0 || physical_zones == 0 || hash_zones == 0 {
            return Err(KarstError::Format("zone counts must be nonzero".to_owned()));
        }
        let slab_blocks = read_u64(raw, &mut at);

        let mut partitions = [Partition {
            start: Pbn(0),
            count: 0,
        }; 4];
        for partition in &mut partitions {
            let start = read_u64(raw, &mut at);
            let count = read_u64(raw, &mut at);
            *partition = Partition {
                start: Pbn(start),
                count,
            };
        }
        let slab_area = partitions[3];
        if slab_blocks == 0 || slab_area.count % slab_blocks != 0 {
            return Err(KarstError::Format(format!(
                "slab area of {} blocks is not a multiple of slab size {slab_blocks}",
                slab_area.count
            )));
        }

        Ok(Self {
            uuid,
            block_size,
            logical_blocks,
            physical_blocks,
            logical_zones,
            physical_zones,
            hash_zones,
            slab_blocks,
            layout: Layout {
                journal: partitions[0],
                block_map: partitions[1],
                slab_summary: partitions[2],
                slab_area,
                slab_count: slab_area.count / slab_blocks,
            },
        })
    }
}

fn put_bytes(block: &mut [u8], at: &mut usize, bytes: &[u8]) {
    block[*at..*at + bytes.len()].copy_from_slice(bytes);
    *at += bytes.len();
}

fn read_u32(raw: &[u8], at: &mut usize) -> u32 {
    let value = u32::from_le_bytes([raw[*at], raw[*at + 1], raw[*at + 2], raw[*at + 3]]);
    *at += 4;
    value
}

fn read_u64(raw: &[u8], at: &mut usize) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&raw[*at..*at + 8]);
    *at += 8;
    u64::from_le_bytes(bytes)
}
