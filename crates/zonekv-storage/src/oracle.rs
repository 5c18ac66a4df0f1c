//! Read-only queries against the upper LSM engine.
//!
//! The allocator consults the engine for file neighbourhoods: files at a
//! level, files overlapping a key range, files at the next level down.
//! Results are only meaningful while the caller holds the inventory lock;
//! the engine may reshape its version state the moment it is released.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::extent::FileId;
use crate::key::InternalKey;

/// Queries the upper engine answers for the zone allocator.
pub trait LsmOracle: Send + Sync {
    /// Number of LSM levels.
    fn levels(&self) -> u32;

    /// File numbers at `level`, ordered by smallest key.
    fn same_level_files(&self, level: u32) -> Vec<FileId>;

    /// Files at `level + 1` whose key range overlaps `[smallest, largest]`.
    fn adjacent_files(
        &self,
        smallest: &InternalKey,
        largest: &InternalKey,
        level: u32,
    ) -> Vec<FileId>;

    /// Files at any level whose key range overlaps `[smallest, largest]`.
    fn overlapping_files(&self, smallest: &InternalKey, largest: &InternalKey) -> Vec<FileId>;
}

#[derive(Clone)]
struct OracleEntry {
    level: u32,
    smallest: InternalKey,
    largest: InternalKey,
}

fn ranges_overlap(entry: &OracleEntry, smallest: &InternalKey, largest: &InternalKey) -> bool {
    !(entry.largest < *smallest || *largest < entry.smallest)
}

/// Table-driven oracle fed explicitly with the engine's file metadata.
///
/// Production embeds the engine's version set behind [`LsmOracle`]; this
/// implementation backs the tests and any single-process setup where the
/// engine pushes file metadata instead of being queried.
#[derive(Default)]
pub struct FixedOracle {
    files: RwLock<HashMap<FileId, OracleEntry>>,
    levels: RwLock<u32>,
}

impl FixedOracle {
    /// Creates an empty oracle with `levels` LSM levels.
    pub fn new(levels: u32) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            levels: RwLock::new(levels),
        }
    }

    /// Registers or replaces a file's metadata.
    pub fn insert(
        &self,
        file: FileId,
        level: u32,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.files.write().insert(
            file,
            OracleEntry {
                level,
                smallest,
                largest,
            },
        );
    }

    /// Removes a file's metadata.
    pub fn remove(&self, file: FileId) {
        self.files.write().remove(&file);
    }
}

impl LsmOracle for FixedOracle {
    fn levels(&self) -> u32 {
        *self.levels.read()
    }

    fn same_level_files(&self, level: u32) -> Vec<FileId> {
        let files = self.files.read();
        let mut out: Vec<(&FileId, &OracleEntry)> =
            files.iter().filter(|(_, e)| e.level == level).collect();
        out.sort_by(|a, b| a.1.smallest.cmp(&b.1.smallest));
        out.into_iter().map(|(id, _)| *id).collect()
    }

    fn adjacent_files(
        &self,
        smallest: &InternalKey,
        largest: &InternalKey,
        level: u32,
    ) -> Vec<FileId> {
        let files = self.files.read();
        let mut out: Vec<(&FileId, &OracleEntry)> = files
            .iter()
            .filter(|(_, e)| e.level == level + 1 && ranges_overlap(e, smallest, largest))
            .collect();
        out.sort_by(|a, b| a.1.smallest.cmp(&b.1.smallest));
        out.into_iter().map(|(id, _)| *id).collect()
    }

    fn overlapping_files(&self, smallest: &InternalKey, largest: &InternalKey) -> Vec<FileId> {
        let files = self.files.read();
        let mut out: Vec<(&FileId, &OracleEntry)> = files
            .iter()
            .filter(|(_, e)| ranges_overlap(e, smallest, largest))
            .collect();
        out.sort_by(|a, b| (a.1.level, &a.1.smallest).cmp(&(b.1.level, &b.1.smallest)));
        out.into_iter().map(|(id, _)| *id).collect()
    }
}
