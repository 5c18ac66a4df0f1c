//! File and extent identifiers and the per-zone extent records.
//!
//! A file is stored as one or more extents, each a contiguous byte range
//! inside a single zone. The zone keeps an [`ExtentInfo`] record per extent
//! it hosts; the owning file keeps a matching [`Extent`] in its own list.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::lifetime::WriteLifetimeHint;
use crate::zone::ZoneId;

/// Newtype wrapper around the upper engine's SST file number.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FileId(u64);

impl FileId {
    /// Creates a new FileId from a u64 value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the inner u64 value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sst:{}", self.0)
    }
}

impl From<u64> for FileId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Stable identity of one extent, unique for the device lifetime.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExtentId(u64);

impl ExtentId {
    /// Returns the inner u64 value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ExtentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ext:{}", self.0)
    }
}

/// Atomic generator for unique extent ids.
#[derive(Debug)]
pub struct ExtentIdGen {
    next: AtomicU64,
}

impl ExtentIdGen {
    /// Create a new generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Generate the next unique extent id.
    pub fn next_id(&self) -> ExtentId {
        ExtentId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ExtentIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// A contiguous byte range inside one zone storing part of one file, as seen
/// from the file's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Extent identity, shared with the zone's [`ExtentInfo`].
    pub id: ExtentId,
    /// Zone holding the bytes.
    pub zone: ZoneId,
    /// Device byte offset of the first payload byte.
    pub start: u64,
    /// Payload length in bytes (padding excluded).
    pub length: u64,
}

/// A zone's record of one extent it hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtentInfo {
    /// Extent identity, shared with the owning file's [`Extent`].
    pub extent: ExtentId,
    /// The file owning the payload.
    pub file: FileId,
    /// False once the upper engine has deleted the owning SST. Transitions
    /// true to false exactly once.
    pub valid: bool,
    /// Payload length in bytes (padding excluded).
    pub length: u64,
    /// Device byte offset of the first payload byte.
    pub start: u64,
    /// Lifetime hint of the owning file at append time.
    pub lifetime: WriteLifetimeHint,
    /// LSM level of the owning file at append time.
    pub level: u32,
}

impl ExtentInfo {
    /// Marks this extent logically deleted.
    pub fn invalidate(&mut self) {
        debug_assert!(self.valid);
        self.valid = false;
    }

    /// Length rounded up to the device block size; the footprint the extent
    /// occupies on the medium.
    pub fn padded_length(&self, block_size: u64) -> u64 {
        padded_len(self.length, block_size)
    }
}

/// Rounds `len` up to a multiple of `block_size`.
pub fn padded_len(len: u64, block_size: u64) -> u64 {
    debug_assert!(block_size > 0);
    let rem = len % block_size;
    if rem == 0 {
        len
    } else {
        len + (block_size - rem)
    }
}
