//! Packed compressed block format.
//!
//! A packed block holds up to fourteen compressed fragments. The header is
//! a u16 format version followed by fourteen u16 fragment sizes, all
//! little-endian; fragment bytes are concatenated immediately after the
//! header in slot order, and the remainder of the block is padding.

use karst_error::{KarstError, Result};
use karst_types::MAX_COMPRESSION_SLOTS;

/// Current packed-block format version.
pub const COMPRESSED_BLOCK_VERSION: u16 = 1;

/// Bytes of header before the first fragment.
pub const COMPRESSED_BLOCK_HEADER_SIZE: usize = 2 + 2 * MAX_COMPRESSION_SLOTS as usize;

/// Payload capacity of a packed block of `block_size` bytes.
#[must_use]
pub fn fragment_capacity(block_size: usize) -> usize {
    block_size.saturating_sub(COMPRESSED_BLOCK_HEADER_SIZE)
}

/// Assemble fragments into one packed block of exactly `block_size` bytes.
///
/// Fragments are laid out in slot order; slot `i` of the result corresponds
/// to `fragments[i]`.
pub fn pack_fragments(fragments: &[&[u8]], block_size: usize) -> Result<Vec<u8>> {
    if fragments.len() > MAX_COMPRESSION_SLOTS as usize {
        return Err(KarstError::Format(format!(
            "too many fragments for one packed block: {}",
            fragments.len()
        )));
    }
    let total: usize = fragments.iter().map(|f| f.len()).sum();
    if total > fragment_capacity(block_size) {
        return Err(KarstError::Format(format!(
            "fragments overflow packed block: {total} > {}",
            fragment_capacity(block_size)
        )));
    }

    let mut block = vec![0_u8; block_size];
    block[0..2].copy_from_slice(&COMPRESSED_BLOCK_VERSION.to_le_bytes());
    let mut offset = COMPRESSED_BLOCK_HEADER_SIZE;
    for (slot, fragment) in fragments.iter().enumerate() {
        let size = fragment.len() as u16;
        let field = 2 + slot * 2;
        block[field..field + 2].copy_from_slice(&size.to_le_bytes());
        block[offset..offset + fragment.len()].copy_from_slice(fragment);
        offset += fragment.len();
    }
    Ok(block)
}

/// Locate fragment `slot` within a packed block.
///
/// The offset is the header size plus the sum of the preceding slots'
/// sizes. Any header inconsistency reports `InvalidFragment` against the
/// carrying PBN.
pub fn fragment<'a>(block: &'a [u8], slot: u8, pbn: u64) -> Result<&'a [u8]> {
    if slot >= MAX_COMPRESSION_SLOTS {
        return Err(KarstError::InvalidFragment {
            pbn,
            detail: format!("slot {slot} out of range"),
        });
    }
    if block.len() < COMPRESSED_BLOCK_HEADER_SIZE {
        return Err(KarstError::InvalidFragment {
            pbn,
            detail: "block shorter than packed header".to_owned(),
        });
    }
    let version = u16::from_le_bytes([block[0], block[1]]);
    if version != COMPRESSED_BLOCK_VERSION {
        return Err(KarstError::InvalidFragment {
            pbn,
            detail: format!("unknown packed block version {version}"),
        });
    }

    let mut offset = COMPRESSED_BLOCK_HEADER_SIZE;
    for preceding in 0..slot {
        let field = 2 + usize::from(preceding) * 2;
        offset += usize::from(u16::from_le_bytes([block[field], block[field + 1]]));
    }
    let field = 2 + usize::from(slot) * 2;
    let size = usize::from(u16::from_le_bytes([block[field], block[field + 1]]));
    if size == 0 {
        return Err(KarstError::InvalidFragment {
            pbn,
            detail: format!("slot {slot} is empty"),
        });
    }
    let end = offset.checked_add(size).filter(|end| *end <= block.len());
    match end {
        Some(end) => Ok(&block[offset..end]),
        None => Err(KarstError::InvalidFragment {
            pbn,
            detail: format!("slot {slot} extends past block end (offset {offset}, size {size})"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_and_locate_three_fragments() {
        let frags: [&[u8]; 3] = [&[1_u8; 100], &[2_u8; 57], &[3_u8; 900]];
        let block = pack_fragments(&frags, 4096).expect("pack");
        assert_eq!(block.len(), 4096);
        assert_eq!(fragment(&block, 0, 7).expect("slot 0"), &[1_u8; 100][..]);
        assert_eq!(fragment(&block, 1, 7).expect("slot 1"), &[2_u8; 57][..]);
        assert_eq!(fragment(&block, 2, 7).expect("slot 2"), &[3_u8; 900][..]);
    }

    #[test]
    fn empty_slot_is_invalid_fragment() {
        let frags: [&[u8]; 1] = [&[9_u8; 10]];
        let block = pack_fragments(&frags, 4096).expect("pack");
        let err = fragment(&block, 1, 42).unwrap_err();
        assert!(matches!(err, KarstError::InvalidFragment { pbn: 42, .. }));
    }

    #[test]
    fn corrupt_size_table_is_rejected() {
        let frags: [&[u8]; 1] = [&[9_u8; 10]];
        let mut block = pack_fragments(&frags, 4096).expect("pack");
        // Inflate slot 0's recorded size beyond the block.
        block[2..4].copy_from_slice(&u16::MAX.to_le_bytes());
        assert!(fragment(&block, 0, 1).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let frags: [&[u8]; 1] = [&[9_u8; 10]];
        let mut block = pack_fragments(&frags, 4096).expect("pack");
        block[0] = 0xFF;
        assert!(fragment(&block, 0, 1).is_err());
    }

    #[test]
    fn capacity_is_block_minus_header() {
        assert_eq!(fragment_capacity(4096), 4096 - 30);
        let too_big = vec![0_u8; 4096 - 29];
        let frags: [&[u8]; 1] = [&too_big];
        assert!(pack_fragments(&frags, 4096).is_err());
    }

    #[test]
    fn fourteen_fragments_fit() {
        let frag = [5_u8; 64];
        let frags: Vec<&[u8]> = (0..14).map(|_| &frag[..]).collect();
        let block = pack_fragments(&frags, 4096).expect("pack");
        for slot in 0..14 {
            assert_eq!(fragment(&block, slot, 0).expect("slot"), &frag[..]);
        }
        let frags: Vec<&[u8]> = (0..15).map(|_| &frag[..]).collect();
        assert!(pack_fragments(&frags, 4096).is_err());
    }
}
