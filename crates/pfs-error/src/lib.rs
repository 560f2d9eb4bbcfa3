#![forbid(unsafe_code)]
//! Error types for ProbeFS.
//!
//! # Error Taxonomy
//!
//! ProbeFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `pfs-types` | Violations detected while decoding a byte slice |
//! | Runtime | `PfsError` | `pfs-error` (this crate) | Errors returned by device, partition, tree and filesystem APIs |
//!
//! ## Mapping Policy: ParseError → PfsError
//!
//! [`PfsError::from_parse`] is the single conversion point. The caller
//! supplies the block (or sector) the bytes came from so corruption reports
//! stay actionable.
//!
//! | ParseError Variant | PfsError Variant |
//! |--------------------|------------------|
//! | `OutOfRange` | `OutOfRange` |
//! | `InvalidMagic` | `Corruption { block, detail }` |
//! | `InvalidField` | `Corruption { block, detail }` |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! Device failures (`Io`) propagate unchanged; nothing in the engine retries.
//!
//! ## Distinct "not mine" vs. "broken"
//!
//! `UnsupportedFormat` means no registered reader claimed the device. It is
//! never used for a device that a reader claimed but then failed to decode;
//! that is `Corruption`. `AmbiguousFormat` is a registry configuration error:
//! two readers claimed the same probe bytes.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`PfsError::to_errno`]
//! for hosts that surface the engine through a POSIX-style interface.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `OutOfRange` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `UnsupportedFormat` | `ENODEV` |
//! | `AmbiguousFormat` | `EINVAL` |
//! | `Config` | `EINVAL` |
//! | `InvalidPartition` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `ReadOnly` | `EROFS` |

use pfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all ProbeFS operations.
#[derive(Debug, Error)]
pub enum PfsError {
    /// Device-layer I/O failure (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A decoder read past the end of its buffer.
    ///
    /// Always a decoding bug or a truncated structure; never recovered.
    #[error("read out of range: {0}")]
    OutOfRange(String),

    /// A structural invariant of the on-disk format was violated at a known
    /// block (bad magic, cyclic sibling chain, extent outside the device).
    #[error("corrupt filesystem at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Caller-supplied request is malformed (bad sector size, buffer length).
    #[error("invalid format: {0}")]
    Format(String),

    /// No registered filesystem or partition reader claimed the device.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// More than one registered reader claimed the same probe bytes.
    #[error("ambiguous format: claimed by {}", candidates.join(", "))]
    AmbiguousFormat { candidates: Vec<String> },

    /// Registry or mount configuration is invalid (duplicate names, zero
    /// cache capacity).
    #[error("configuration error: {0}")]
    Config(String),

    /// A partition entry cannot be used (empty, out of device range).
    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    /// Named entry not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// The device or filesystem is read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl PfsError {
    /// Convert a decoding failure into a runtime error attributed to `block`.
    #[must_use]
    pub fn from_parse(block: u64, err: &ParseError) -> Self {
        match err {
            ParseError::OutOfRange { .. } => Self::OutOfRange(format!("block {block}: {err}")),
            ParseError::InvalidMagic { .. }
            | ParseError::InvalidField { .. }
            | ParseError::IntegerConversion { .. } => Self::Corruption {
                block,
                detail: err.to_string(),
            },
        }
    }

    /// Shorthand for a [`PfsError::Corruption`].
    #[must_use]
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }

    /// Whether the error describes damaged on-disk structures rather than an
    /// environmental or caller problem.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::OutOfRange(_))
    }

    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::OutOfRange(_) | Self::Corruption { .. } => libc::EIO,
            Self::Format(_)
            | Self::AmbiguousFormat { .. }
            | Self::Config(_)
            | Self::InvalidPartition(_) => libc::EINVAL,
            Self::UnsupportedFormat(_) => libc::ENODEV,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(PfsError, libc::c_int)> = vec![
            (PfsError::Io(std::io::Error::other("test")), libc::EIO),
            (PfsError::OutOfRange("test".into()), libc::EIO),
            (PfsError::corruption(0, "test"), libc::EIO),
            (PfsError::Format("test".into()), libc::EINVAL),
            (PfsError::UnsupportedFormat("test".into()), libc::ENODEV),
            (
                PfsError::AmbiguousFormat {
                    candidates: vec!["a".into(), "b".into()],
                },
                libc::EINVAL,
            ),
            (PfsError::Config("dup".into()), libc::EINVAL),
            (PfsError::InvalidPartition("p1".into()), libc::EINVAL),
            (PfsError::NotFound("x".into()), libc::ENOENT),
            (PfsError::NotDirectory, libc::ENOTDIR),
            (PfsError::IsDirectory, libc::EISDIR),
            (PfsError::ReadOnly, libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let pfs = PfsError::Io(raw);
        assert_eq!(pfs.to_errno(), libc::EPERM);
    }

    #[test]
    fn parse_errors_keep_out_of_range_distinct() {
        let oor = ParseError::OutOfRange {
            needed: 4,
            offset: 510,
            actual: 2,
        };
        let mapped = PfsError::from_parse(7, &oor);
        assert!(matches!(mapped, PfsError::OutOfRange(_)));
        assert!(mapped.to_string().contains("block 7"));

        let magic = ParseError::InvalidMagic {
            expected: 0x482B,
            actual: 0,
        };
        match PfsError::from_parse(2, &magic) {
            PfsError::Corruption { block, detail } => {
                assert_eq!(block, 2);
                assert!(detail.contains("invalid magic"));
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn display_formatting() {
        let err = PfsError::corruption(42, "sibling cycle");
        assert_eq!(
            err.to_string(),
            "corrupt filesystem at block 42: sibling cycle"
        );

        let amb = PfsError::AmbiguousFormat {
            candidates: vec!["hfsplus".into(), "fat".into()],
        };
        assert_eq!(amb.to_string(), "ambiguous format: claimed by hfsplus, fat");

        assert_eq!(PfsError::ReadOnly.to_string(), "read-only filesystem");
        assert!(PfsError::corruption(0, "x").is_corruption());
        assert!(!PfsError::UnsupportedFormat("x".into()).is_corruption());
    }
}
