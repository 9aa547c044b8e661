//! Compression-path position of a data-VIO, packed into one atomic word.
//!
//! The status advances `PreCompressor → Compressing → Packing →
//! PostPacker`; the sticky `may_not_compress` flag can be raised from any
//! zone. Cancellation races are resolved by compare-and-swap: exactly one
//! canceler observes a packed VIO without the flag set and takes
//! responsibility for pulling it out of its bin.

use std::sync::atomic::{AtomicU32, Ordering};

/// Where a data-VIO is on the compression path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VioCompressionStatus {
    /// Not yet entered the compression path.
    PreCompressor = 0,
    /// In the compressor.
    Compressing = 1,
    /// Blocked in the packer.
    Packing = 2,
    /// Off the compression path for good.
    PostPacker = 3,
}

impl VioCompressionStatus {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => VioCompressionStatus::PreCompressor,
            1 => VioCompressionStatus::Compressing,
            2 => VioCompressionStatus::Packing,
            _ => VioCompressionStatus::PostPacker,
        }
    }
}

/// Decoded snapshot of the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionState {
    pub status: VioCompressionStatus,
    pub may_not_compress: bool,
}

impl CompressionState {
    fn encode(self) -> u32 {
        (self.status as u32) | (u32::from(self.may_not_compress) << 2)
    }

    fn decode(bits: u32) -> Self {
        Self {
            status: VioCompressionStatus::from_bits(bits),
            may_not_compress: bits & 0b100 != 0,
        }
    }
}

/// The atomic status word carried by each data-VIO.
#[derive(Debug, Default)]
pub struct CompressionStatusWord(AtomicU32);

impl CompressionStatusWord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self) -> CompressionState {
        CompressionState::decode(self.0.load(Ordering::Acquire))
    }

    /// Reset for a recycled data-VIO.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    fn try_swap(&self, from: CompressionState, to: CompressionState) -> bool {
        self.0
            .compare_exchange(
                from.encode(),
                to.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Whether this VIO may enter the compressor; advances to
    /// `Compressing` when allowed.
    pub fn may_compress(&self) -> bool {
        self.try_swap(
            CompressionState {
                status: VioCompressionStatus::PreCompressor,
                may_not_compress: false,
            },
            CompressionState {
                status: VioCompressionStatus::Compressing,
                may_not_compress: false,
            },
        )
    }

    /// Whether this VIO may block in the packer; advances to `Packing`
    /// when allowed.
    pub fn may_pack(&self) -> bool {
        self.try_swap(
            CompressionState {
                status: VioCompressionStatus::Compressing,
                may_not_compress: false,
            },
            CompressionState {
                status: VioCompressionStatus::Packing,
                may_not_compress: false,
            },
        )
    }

    /// Whether the packer may still write this VIO out as part of a
    /// compressed block (nobody canceled it while it waited).
    #[must_use]
    pub fn may_write_compressed(&self) -> bool {
        let state = self.get();
        state.status == VioCompressionStatus::Packing && !state.may_not_compress
    }

    /// Leave the compression path, preserving the cancel flag.
    pub fn set_done(&self) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = CompressionState::decode(current);
            let next = CompressionState {
                status: VioCompressionStatus::PostPacker,
                may_not_compress: state.may_not_compress,
            };
            match self.0.compare_exchange(
                current,
                next.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Prevent this VIO from being compressed or packed.
    ///
    /// Returns `true` when the VIO is sitting in the packer and this
    /// caller was the first to cancel it; that caller must remove the
    /// fragment from its bin.
    pub fn cancel(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = CompressionState::decode(current);
            if state.may_not_compress {
                return false;
            }
            let next = CompressionState {
                status: state.status,
                may_not_compress: true,
            };
            match self.0.compare_exchange(
                current,
                next.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return state.status == VioCompressionStatus::Packing,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_advances_in_order() {
        let word = CompressionStatusWord::new();
        assert!(word.may_compress());
        assert!(!word.may_compress());
        assert!(word.may_pack());
        assert!(word.may_write_compressed());
        word.set_done();
        assert_eq!(word.get().status, VioCompressionStatus::PostPacker);
        assert!(!word.may_write_compressed());
    }

    #[test]
    fn cancel_before_packer_blocks_entry() {
        let word = CompressionStatusWord::new();
        assert!(!word.cancel(), "not in packer yet");
        assert!(!word.may_compress(), "flag blocks the compressor");
    }

    #[test]
    fn first_canceler_of_packed_vio_takes_responsibility() {
        let word = CompressionStatusWord::new();
        assert!(word.may_compress());
        assert!(word.may_pack());
        assert!(word.cancel(), "first canceler owns removal");
        assert!(!word.cancel(), "second canceler does not");
        assert!(!word.may_write_compressed());
    }

    #[test]
    fn reset_clears_everything() {
        let word = CompressionStatusWord::new();
        word.may_compress();
        word.cancel();
        word.reset();
        assert_eq!(
            word.get(),
            CompressionState {
                status: VioCompressionStatus::PreCompressor,
                may_not_compress: false
            }
        );
    }
}
