#![forbid(unsafe_code)]
//! On-disk formats for karst.
//!
//! Every format here is a hand-packed little-endian codec with explicit
//! validation; nothing on disk goes through a serializer. The formats are:
//!
//! - the 5-byte block-map entry (36-bit PBN + 4-bit mapping state)
//! - packed compressed blocks (fragment size table + concatenated bytes)
//! - recovery-journal blocks (sequenced headers + 18-byte entries)
//! - block-map pages
//! - the superblock and volume layout partitioning
//! - slab geometry and slab-summary entries

pub mod compressed;
pub mod journal;
pub mod layout;
pub mod page;

use karst_error::{KarstError, Result};
use karst_types::{DataLocation, MappingState, Pbn};

/// Size of a packed block-map entry.
pub const BLOCK_MAP_ENTRY_SIZE: usize = 5;

/// The 36-bit ceiling on representable physical block numbers.
pub const MAX_PBN: u64 = (1 << 36) - 1;

/// Pack a data location into its five-byte representation.
///
/// Byte 0 carries the four highest bits of the 36-bit PBN in its high
/// nibble and the mapping state in its low nibble; bytes 1..=4 carry the
/// low 32 bits of the PBN in little-endian order. Unrepresentable high
/// bits of the PBN are silently truncated.
#[must_use]
pub fn pack_entry(location: DataLocation) -> [u8; BLOCK_MAP_ENTRY_SIZE] {
    let pbn = location.pbn.0;
    let high_nibble = ((pbn >> 32) & 0x0F) as u8;
    let low_word = (pbn & u64::from(u32::MAX)) as u32;
    let mut raw = [0_u8; BLOCK_MAP_ENTRY_SIZE];
    raw[0] = (high_nibble << 4) | location.state.to_nibble();
    raw[1..5].copy_from_slice(&low_word.to_le_bytes());
    raw
}

/// Unpack a five-byte block-map entry. Exact inverse of [`pack_entry`]
/// for PBNs that fit in 36 bits.
#[must_use]
pub fn unpack_entry(raw: &[u8; BLOCK_MAP_ENTRY_SIZE]) -> DataLocation {
    let high_nibble = u64::from(raw[0] >> 4);
    let state = MappingState::from_nibble(raw[0] & 0x0F);
    let low_word = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
    DataLocation {
        pbn: Pbn((high_nibble << 32) | u64::from(low_word)),
        state,
    }
}

/// Unpack an entry from an unsized slice, validating the length.
pub fn unpack_entry_slice(raw: &[u8]) -> Result<DataLocation> {
    let raw: &[u8; BLOCK_MAP_ENTRY_SIZE] = raw
        .try_into()
        .map_err(|_| KarstError::Format(format!("block-map entry must be 5 bytes, got {}", raw.len())))?;
    Ok(unpack_entry(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_types::ZERO_BLOCK;
    use proptest::prelude::*;

    #[test]
    fn pack_layout_matches_wire_format() {
        let loc = DataLocation::new(Pbn(0x9_1234_5678), MappingState::Compressed(3));
        let raw = pack_entry(loc);
        // High nibble 0x9, state nibble 2 + 3 = 5.
        assert_eq!(raw[0], 0x95);
        assert_eq!(&raw[1..5], &0x1234_5678_u32.to_le_bytes());
    }

    #[test]
    fn pbn_is_truncated_to_36_bits() {
        let loc = DataLocation::new(Pbn(0xFFF_0000_0001), MappingState::Uncompressed);
        let back = unpack_entry(&pack_entry(loc));
        assert_eq!(back.pbn.0, 0xFFF_0000_0001 & MAX_PBN);
        assert_eq!(back.state, MappingState::Uncompressed);
    }

    #[test]
    fn unmapped_entry_is_all_zero() {
        let raw = pack_entry(DataLocation::UNMAPPED);
        assert_eq!(raw, [0; 5]);
        let back = unpack_entry(&raw);
        assert_eq!(back, DataLocation::UNMAPPED);
        assert_eq!(back.pbn, ZERO_BLOCK);
    }

    #[test]
    fn short_slice_is_rejected() {
        assert!(unpack_entry_slice(&[0; 4]).is_err());
        assert!(unpack_entry_slice(&[0; 6]).is_err());
        assert!(unpack_entry_slice(&[0; 5]).is_ok());
    }

    proptest! {
        #[test]
        fn entry_roundtrip(pbn in 0_u64..=MAX_PBN, nibble in 0_u8..=15) {
            let loc = DataLocation::new(Pbn(pbn), MappingState::from_nibble(nibble));
            let back = unpack_entry(&pack_entry(loc));
            prop_assert_eq!(back, loc);
        }

        #[test]
        fn truncation_law(pbn in any::<u64>(), nibble in 0_u8..=15) {
            let loc = DataLocation::new(Pbn(pbn), MappingState::from_nibble(nibble));
            let back = unpack_entry(&pack_entry(loc));
            prop_assert_eq!(back.pbn.0, pbn & MAX_PBN);
            prop_assert_eq!(back.state, loc.state);
        }
    }
}
