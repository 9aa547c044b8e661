//! Block-map page format.
//!
//! Every block-map page (interior or leaf) is one block: a 16-byte header
//! followed by packed 5-byte entries. Interior pages store child page
//! locations as uncompressed entries; leaf pages store data locations.

use crate::{BLOCK_MAP_ENTRY_SIZE, pack_entry, unpack_entry_slice};
use karst_error::{KarstError, Result};
use karst_types::DataLocation;

const MAP_PAGE_MAGIC: u32 = 0x4B_4D_41_50; // "KMAP"
const MAP_PAGE_VERSION: u16 = 1;

/// Bytes of map page header.
pub const MAP_PAGE_HEADER_SIZE: usize = 16;

/// Entries that fit in one map page of `block_size` bytes.
#[must_use]
pub fn entries_per_page(block_size: usize) -> usize {
    block_size.saturating_sub(MAP_PAGE_HEADER_SIZE) / BLOCK_MAP_ENTRY_SIZE
}

/// Decoded block-map page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapPage {
    /// Position of this page within its level of the tree.
    pub page_index: u64,
    pub entries: Vec<DataLocation>,
}

impl MapPage {
    /// A fresh page with every entry unmapped.
    #[must_use]
    pub fn empty(page_index: u64, block_size: usize) -> Self {
        Self {
            page_index,
            entries: vec![DataLocation::UNMAPPED; entries_per_page(block_size)],
        }
    }

    /// Serialize to exactly `block_size` bytes.
    pub fn pack(&self, block_size: usize) -> Result<Vec<u8>> {
        if self.entries.len() != entries_per_page(block_size) {
            return Err(KarstError::Format(format!(
                "map page has {} entries, expected {}",
                self.entries.len(),
                entries_per_page(block_size)
            )));
        }
        let mut block = vec![0_u8; block_size];
        block[0..4].copy_from_slice(&MAP_PAGE_MAGIC.to_le_bytes());
        block[4..6].copy_from_slice(&MAP_PAGE_VERSION.to_le_bytes());
        block[6..8].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        block[8..16].copy_from_slice(&self.page_index.to_le_bytes());
        for (index, entry) in self.entries.iter().enumerate() {
            let offset = MAP_PAGE_HEADER_SIZE + index * BLOCK_MAP_ENTRY_SIZE;
            block[offset..offset + BLOCK_MAP_ENTRY_SIZE].copy_from_slice(&pack_entry(*entry));
        }
        Ok(block)
    }

    /// Decode a page image. An unwritten (zero) block decodes as a fresh
    /// empty page for `page_index`, which keeps never-written regions of
    /// the map partition readable without formatting every page up front.
    pub fn unpack(raw: &[u8], page_index: u64) -> Result<Self> {
        if raw.len() < MAP_PAGE_HEADER_SIZE {
            return Err(KarstError::Format("map page shorter than header".to_owned()));
        }
        let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != MAP_PAGE_MAGIC {
            if raw.iter().all(|b| *b == 0) {
                return Ok(Self::empty(page_index, raw.len()));
            }
            return Err(KarstError::Format(format!(
                "bad map page magic {magic:#x} at page {page_index}"
            )));
        }
        let version = u16::from_le_bytes([raw[4], raw[5]]);
        if version != MAP_PAGE_VERSION {
            return Err(KarstError::Format(format!(
                "unknown map page version {version}"
            )));
        }
        let count = usize::from(u16::from_le_bytes([raw[6], raw[7]]));
        if count != entries_per_page(raw.len()) {
            return Err(KarstError::Format(format!(
                "map page entry count {count} does not match geometry"
            )));
        }
        let recorded_index = u64::from_le_bytes(raw[8..16].try_into().map_err(|_| {
            KarstError::Format("map page index field truncated".to_owned())
        })?);
        if recorded_index != page_index {
            return Err(KarstError::Format(format!(
                "map page index mismatch: recorded {recorded_index}, expected {page_index}"
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for index in 0..count {
            let offset = MAP_PAGE_HEADER_SIZE + index * BLOCK_MAP_ENTRY_SIZE;
            entries.push(unpack_entry_slice(
                &raw[offset..offset + BLOCK_MAP_ENTRY_SIZE],
            )?);
        }
        Ok(Self {
            page_index,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_types::{MappingState, Pbn};

    #[test]
    fn page_roundtrip() {
        let mut page = MapPage::empty(9, 4096);
        page.entries[0] = DataLocation::new(Pbn(500), MappingState::Uncompressed);
        page.entries[815] = DataLocation::new(Pbn(501), MappingState::Compressed(7));
        let raw = page.pack(4096).expect("pack");
        let back = MapPage::unpack(&raw, 9).expect("unpack");
        assert_eq!(back, page);
    }

    #[test]
    fn entries_per_page_for_default_block() {
        assert_eq!(entries_per_page(4096), 816);
    }

    #[test]
    fn zero_block_decodes_as_empty_page() {
        let raw = vec![0_u8; 4096];
        let page = MapPage::unpack(&raw, 3).expect("unpack");
        assert_eq!(page.page_index, 3);
        assert!(page.entries.iter().all(|e| !e.is_mapped()));
    }

    #[test]
    fn index_mismatch_is_rejected() {
        let page = MapPage::empty(4, 4096);
        let raw = page.pack(4096).expect("pack");
        assert!(MapPage::unpack(&raw, 5).is_err());
    }

    #[test]
    fn garbage_magic_is_rejected() {
        let mut raw = vec![0_u8; 4096];
        raw[0] = 0xAB;
        assert!(MapPage::unpack(&raw, 0).is_err());
    }
}
