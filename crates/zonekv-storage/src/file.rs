//! Per-file records registered by the upper engine.
//!
//! The device keeps one [`SstFile`] per live file. The record carries the
//! placement inputs (level, key range, lifetime hint) and the file's extent
//! list; the extent list is mutated by appends and by the cleaner, each
//! under the file's write lock.

use parking_lot::RwLock;

use crate::extent::{Extent, FileId};
use crate::key::InternalKey;
use crate::lifetime::WriteLifetimeHint;

/// A file (SST, WAL, manifest) living on the zoned device.
pub struct SstFile {
    id: FileId,
    level: u32,
    smallest: InternalKey,
    largest: InternalKey,
    lifetime: WriteLifetimeHint,
    extents: RwLock<Vec<Extent>>,
}

impl SstFile {
    /// Creates a file record with an empty extent list.
    pub fn new(
        id: FileId,
        level: u32,
        smallest: InternalKey,
        largest: InternalKey,
        lifetime: WriteLifetimeHint,
    ) -> Self {
        Self {
            id,
            level,
            smallest,
            largest,
            lifetime,
            extents: RwLock::new(Vec::new()),
        }
    }

    /// File identity.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// LSM level; [`crate::config::NON_LSM_LEVEL`] for non-SST files.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Smallest internal key in the file.
    pub fn smallest(&self) -> &InternalKey {
        &self.smallest
    }

    /// Largest internal key in the file.
    pub fn largest(&self) -> &InternalKey {
        &self.largest
    }

    /// Lifetime hint supplied at registration.
    pub fn lifetime(&self) -> WriteLifetimeHint {
        self.lifetime
    }

    /// Snapshot of the file's extents, in file order.
    pub fn extents(&self) -> Vec<Extent> {
        self.extents.read().clone()
    }

    /// Total payload bytes across all extents.
    pub fn size(&self) -> u64 {
        self.extents.read().iter().map(|e| e.length).sum()
    }

    pub(crate) fn extents_lock(&self) -> &RwLock<Vec<Extent>> {
        &self.extents
    }
}
