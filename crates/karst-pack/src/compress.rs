//! Block compression.
//!
//! Best effort: the output bound is the block size itself, and any block
//! that does not shrink reports the `block_size + 1` sentinel so the write
//! path falls through to the uncompressed route. Failures never propagate.

use karst_error::{KarstError, Result};

/// The "incompressible" sentinel for a block of `block_size` bytes.
#[must_use]
pub const fn incompressible(block_size: usize) -> usize {
    block_size + 1
}

/// Compress one block into `scratch`, returning the compressed size or
/// the incompressible sentinel.
#[must_use]
pub fn compress_block(data: &[u8], scratch: &mut [u8]) -> usize {
    match lz4_flex::block::compress_into(data, scratch) {
        Ok(size) if size < data.len() => size,
        // Did not shrink, or the bounded scratch overflowed: either way
        // the block is not worth packing.
        _ => incompressible(data.len()),
    }
}

/// Decompress one fragment into `out`, which must be exactly the block
/// size. Any decoder failure or size mismatch is an invalid fragment.
pub fn decompress_fragment(fragment: &[u8], out: &mut [u8], pbn: u64) -> Result<()> {
    match lz4_flex::block::decompress_into(fragment, out) {
        Ok(size) if size == out.len() => Ok(()),
        Ok(size) => Err(KarstError::InvalidFragment {
            pbn,
            detail: format!("fragment expanded to {size} bytes, expected {}", out.len()),
        }),
        Err(err) => Err(KarstError::InvalidFragment {
            pbn,
            detail: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_block_roundtrips() {
        let data = vec![0xAB_u8; 4096];
        let mut scratch = vec![0_u8; 4096];
        let size = compress_block(&data, &mut scratch);
        assert!(size < 4096, "constant block must compress");

        let mut out = vec![0_u8; 4096];
        decompress_fragment(&scratch[..size], &mut out, 1).expect("decompress");
        assert_eq!(out, data);
    }

    #[test]
    fn incompressible_block_reports_sentinel() {
        // A pseudo-random block does not shrink.
        let mut data = vec![0_u8; 4096];
        let mut state = 0x9E37_79B9_7F4A_7C15_u64;
        for byte in &mut data {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            *byte = (state >> 56) as u8;
        }
        let mut scratch = vec![0_u8; 4096];
        assert_eq!(compress_block(&data, &mut scratch), incompressible(4096));
    }

    #[test]
    fn garbage_fragment_is_invalid() {
        let mut out = vec![0_u8; 4096];
        let err = decompress_fragment(&[0xFF, 0x00, 0x12], &mut out, 9).unwrap_err();
        assert!(matches!(err, KarstError::InvalidFragment { pbn: 9, .. }));
    }
}
