//! Shared error type for the FrankenRedis storage core.
//!
//! One structured enum for the whole workspace, split the same way the
//! runtime is: dictionary errors are recoverable codes the caller can
//! branch on, snapshot-save errors are I/O shaped, and snapshot-load
//! errors are integrity failures the embedding server treats as fatal.

use std::io;

use thiserror::Error;

/// Primary error type for FrankenRedis operations.
#[derive(Error, Debug)]
pub enum FredisError {
    // === Dictionary errors ===
    /// Insert of a key that is already present.
    #[error("key already exists")]
    KeyExists,

    /// Delete or unlink of a key that is not present.
    #[error("no such key")]
    KeyNotFound,

    /// Resize requested while an incremental rehash is still running.
    #[error("dictionary is rehashing")]
    RehashInProgress,

    /// Shrink-to-fit requested while the global resize switch is off.
    #[error("dictionary resizing is disabled")]
    ResizeDisabled,

    /// Resize target smaller than the live entry count, or equal to the
    /// current table size (rehashing to the same size is pointless).
    #[error("invalid resize target {target} for {used} live entries")]
    InvalidResize { target: usize, used: usize },

    // === Snapshot I/O errors ===
    /// File or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Fewer bytes available than the record header promised.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Every sink of a fan-out write target has failed.
    #[error("all {targets} fan-out targets are in error state")]
    AllTargetsFailed { targets: usize },

    /// A background save child is already running.
    #[error("a background save is already in progress")]
    SaveInProgress,

    // === Snapshot integrity errors ===
    /// The file does not start with the expected magic bytes.
    #[error("wrong signature in snapshot header")]
    WrongSignature,

    /// The file declares a format version this build cannot read.
    #[error("cannot handle snapshot format version {version}")]
    UnsupportedVersion { version: u32 },

    /// The CRC-64 trailer does not match the bytes that precede it.
    #[error("snapshot checksum mismatch: recorded {recorded:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { recorded: u64, computed: u64 },

    /// Malformed record, unknown opcode in a required position, or any
    /// other structural damage. `detail` carries the source location of
    /// the failing check.
    #[error("corrupt snapshot: {detail}")]
    Corrupt { detail: String },

    /// A serialized extension-module value whose type id no registered
    /// module claims. The payload cannot be interpreted without it.
    #[error("snapshot contains data for unknown module type {id:#018x}")]
    UnknownModule { id: u64 },
}

impl FredisError {
    /// True for the recoverable dictionary codes; false for everything
    /// that ends the current save or load.
    #[must_use]
    pub const fn is_dictionary_code(&self) -> bool {
        matches!(
            self,
            Self::KeyExists
                | Self::KeyNotFound
                | Self::RehashInProgress
                | Self::ResizeDisabled
                | Self::InvalidResize { .. }
        )
    }

    /// True when a load must not serve the partially loaded database.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::WrongSignature
                | Self::UnsupportedVersion { .. }
                | Self::ChecksumMismatch { .. }
                | Self::Corrupt { .. }
                | Self::UnknownModule { .. }
        )
    }
}

/// Construct a [`FredisError::Corrupt`] whose detail string embeds the
/// Rust source location of the failing check, so a load abort can be
/// traced to the exact decoder that rejected the stream.
#[macro_export]
macro_rules! corrupt {
    ($($arg:tt)*) => {
        $crate::FredisError::Corrupt {
            detail: format!("{}:{}: {}", file!(), line!(), format_args!($($arg)*)),
        }
    };
}

/// A FrankenRedis result returning [`FredisError`].
pub type Result<T> = std::result::Result<T, FredisError>;
