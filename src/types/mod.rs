#![forbid(unsafe_code)]
//! Identifier aliases and the crate-wide error type.

use std::path::PathBuf;

/// CRC32-tracking writer.
pub mod checksum;

pub use checksum::ChecksumWriter;

/// Dense node identifier in `1..=N`; `0` is the sentinel.
pub type NodeId = u32;

/// Dense relation identifier in `1..=R` as stored per edge; `0` is reserved.
pub type RelId = u16;

/// Sentinel for "no node".
pub const INVALID_NODE: NodeId = 0;

/// Errors surfaced by graph loading, training, and checkpoint handling.
#[derive(thiserror::Error, Debug)]
pub enum KgError {
    /// Underlying filesystem failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A required array or checkpoint file does not exist.
    #[error("missing file: {}", path.display())]
    MissingFile {
        /// Path that was looked up.
        path: PathBuf,
    },
    /// A file exists but its size or content breaks a structural invariant.
    #[error("malformed {}: {reason}", path.display())]
    Format {
        /// Offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
    /// Checkpoint header does not carry the expected magic number.
    #[error("bad checkpoint magic {found:#010x}")]
    BadMagic {
        /// Magic value read from disk.
        found: u32,
    },
    /// Checkpoint version newer than this build understands.
    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),
    /// A checkpoint field could not be read in full.
    #[error("checkpoint truncated while reading {field}")]
    Truncated {
        /// Field being decoded when the stream ended.
        field: &'static str,
    },
    /// Model or training configuration rejected during validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Externally supplied state does not line up with the live parameter set.
    #[error("state mismatch: expected {expected}, found {found}")]
    StateMismatch {
        /// Count or length the live model requires.
        expected: usize,
        /// Count or length that was supplied.
        found: usize,
    },
    /// Option file could not be read or parsed.
    #[error(transparent)]
    Config(#[from] crate::train::ConfigError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KgError>;

impl KgError {
    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        KgError::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
