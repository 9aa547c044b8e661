#![forbid(unsafe_code)]
//! Error types for karst.
//!
//! Defines `KarstError` and a `Result<T>` alias used throughout the
//! workspace, plus the single errno translation table the upstream
//! block-I/O boundary reports through.

use thiserror::Error;

/// Unified error type for all karst operations.
#[derive(Debug, Error)]
pub enum KarstError {
    /// The backing device reported a failure.
    #[error("backing I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An address fell outside the configured geometry.
    #[error("{kind} {value} out of range (limit {limit})")]
    OutOfRange {
        kind: &'static str,
        value: u64,
        limit: u64,
    },

    /// The slab depot has no free blocks left.
    #[error("no physical space available")]
    OutOfSpace,

    /// A packed compressed block failed to yield a fragment.
    #[error("invalid compressed fragment in block {pbn}: {detail}")]
    InvalidFragment { pbn: u64, detail: String },

    /// The engine has latched read-only after an unrecoverable error.
    #[error("device is read-only")]
    ReadOnly,

    /// Metadata corruption the engine cannot repair in-line.
    #[error("unrecoverable metadata error: {0}")]
    Unrecoverable(String),

    /// A dedup-advice query exceeded its deadline.
    #[error("dedup advice query timed out")]
    AdviceTimeout,

    /// An internal state-machine invariant was violated.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// On-disk or configured format problem.
    #[error("invalid format: {0}")]
    Format(String),

    /// The operation was cancelled by an admin drain.
    #[error("operation cancelled")]
    Cancelled,
}

impl KarstError {
    /// Convert this error into a POSIX errno for the bio completion.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::OutOfRange { .. } => libc::ERANGE,
            Self::OutOfSpace => libc::ENOSPC,
            Self::InvalidFragment { .. } | Self::Unrecoverable(_) => libc::EIO,
            Self::ReadOnly => libc::EROFS,
            Self::AdviceTimeout => libc::ETIMEDOUT,
            Self::Protocol(_) | Self::Format(_) => libc::EINVAL,
            Self::Cancelled => libc::ECANCELED,
        }
    }

    /// Whether the write path may fall back to a fresh uncompressed write
    /// instead of failing the bio.
    #[must_use]
    pub fn is_dedup_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OutOfSpace | Self::AdviceTimeout | Self::InvalidFragment { .. }
        )
    }

    /// Whether this error must latch the engine read-only when it occurs on
    /// a metadata path.
    #[must_use]
    pub fn latches_read_only(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Unrecoverable(_))
    }
}

/// Result alias using `KarstError`.
pub type Result<T> = std::result::Result<T, KarstError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_translation_table() {
        assert_eq!(
            KarstError::OutOfRange {
                kind: "pbn",
                value: 10,
                limit: 5
            }
            .to_errno(),
            libc::ERANGE
        );
        assert_eq!(KarstError::OutOfSpace.to_errno(), libc::ENOSPC);
        assert_eq!(KarstError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(KarstError::AdviceTimeout.to_errno(), libc::ETIMEDOUT);
        assert_eq!(KarstError::Cancelled.to_errno(), libc::ECANCELED);
        assert_eq!(
            KarstError::InvalidFragment {
                pbn: 3,
                detail: "short".to_owned()
            }
            .to_errno(),
            libc::EIO
        );
    }

    #[test]
    fn dedup_recoverable_kinds() {
        assert!(KarstError::OutOfSpace.is_dedup_recoverable());
        assert!(KarstError::AdviceTimeout.is_dedup_recoverable());
        assert!(!KarstError::ReadOnly.is_dedup_recoverable());
        assert!(!KarstError::Protocol("x".to_owned()).is_dedup_recoverable());
    }

    #[test]
    fn read_only_latching_kinds() {
        assert!(KarstError::Unrecoverable("bad root".to_owned()).latches_read_only());
        assert!(KarstError::Io(std::io::Error::other("disk fell over")).latches_read_only());
        assert!(!KarstError::OutOfSpace.latches_read_only());
    }
}
