//! Error types for the zoned storage backend.

use thiserror::Error;

use crate::extent::FileId;
use crate::zone::ZoneId;

/// Result type alias for zoned-device operations.
pub type ZbdResult<T> = Result<T, ZbdError>;

/// Error variants for zoned-device operations.
#[derive(Debug, Error)]
pub enum ZbdError {
    /// Wraps standard I/O errors from the device backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device could not be opened or is not usable as configured.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The device exists but cannot back this engine.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// A zone-level device command failed.
    #[error("Zone {zone} {op} failed: {reason}")]
    ZoneIo {
        /// The zone the command targeted.
        zone: ZoneId,
        /// The command that failed ("reset", "finish", "close", "append").
        op: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// An append was issued with more bytes than the zone has left.
    #[error("No space in zone {zone}: requested {requested} bytes, {capacity} left")]
    NoSpace {
        /// The zone the append targeted.
        zone: ZoneId,
        /// Bytes requested.
        requested: u64,
        /// Bytes remaining until the zone is full.
        capacity: u64,
    },

    /// An offset or size is not a multiple of the device block size.
    #[error("Not aligned: {value} is not a multiple of block size {block_size}")]
    NotAligned {
        /// The offending offset or size.
        value: u64,
        /// The device block size.
        block_size: u64,
    },

    /// Zone cleaning needed a reserved zone but the pool was empty.
    ///
    /// This signals an accounting bug in the caller's pool management; the
    /// cleaning pass cannot make progress without a relocation target.
    #[error("Reserved zone pool exhausted during zone cleaning")]
    ReservedPoolExhausted,

    /// A file id was not found in the device's file table.
    #[error("File {file} not registered")]
    FileNotFound {
        /// The missing file id.
        file: FileId,
    },
}
