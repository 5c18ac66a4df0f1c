//! A single physical zone: write pointer, capacity, and its extent index.
//!
//! Zones are created once at device open and live in the device's arena.
//! The write pointer and remaining capacity are guarded by the per-zone df
//! lock; `used_capacity`, the writer gate and the append-in-flight flag are
//! atomics published to the allocator and the cleaner.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{ZbdBackend, ZoneCondition, ZoneReport};
use crate::error::{ZbdError, ZbdResult};
use crate::extent::{ExtentId, ExtentInfo, FileId};
use crate::lifetime::{weighted_secondary_lifetime, WriteLifetimeHint};

/// Stable zone identity, dense for the device lifetime.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ZoneId(u32);

impl ZoneId {
    /// Creates a new ZoneId from a u32 value.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the inner u32 value.
    pub fn into_inner(self) -> u32 {
        self.0
    }

    /// Index into the device's zone arena.
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "zone:{}", self.0)
    }
}

/// Write-pointer state guarded by the per-zone df lock.
struct ZoneDf {
    wp: u64,
    capacity: u64,
    max_capacity: u64,
}

/// One physical zone.
pub struct Zone {
    id: ZoneId,
    start: u64,
    zone_size: u64,
    block_size: u64,
    backend: Arc<dyn ZbdBackend>,
    df: Mutex<ZoneDf>,
    used_capacity: AtomicU64,
    open_for_write: AtomicBool,
    append_in_flight: AtomicBool,
    lifetime: Mutex<WriteLifetimeHint>,
    secondary_lifetime: Mutex<f64>,
    extents: Mutex<Vec<ExtentInfo>>,
}

impl Zone {
    /// Builds a zone from a device report entry.
    pub(crate) fn from_report(
        id: ZoneId,
        report: &ZoneReport,
        block_size: u64,
        backend: Arc<dyn ZbdBackend>,
    ) -> Self {
        let capacity = if report.is_full()
            || report.is_offline()
            || report.cond == ZoneCondition::ReadOnly
        {
            0
        } else {
            report.capacity - (report.wp - report.start)
        };
        Self {
            id,
            start: report.start,
            zone_size: report.len,
            block_size,
            backend,
            df: Mutex::new(ZoneDf {
                wp: report.wp,
                capacity,
                max_capacity: report.capacity,
            }),
            used_capacity: AtomicU64::new(0),
            open_for_write: AtomicBool::new(false),
            append_in_flight: AtomicBool::new(false),
            lifetime: Mutex::new(WriteLifetimeHint::NotSet),
            secondary_lifetime: Mutex::new(WriteLifetimeHint::NotSet.ordinal() as f64),
            extents: Mutex::new(Vec::new()),
        }
    }

    /// Zone identity.
    pub fn id(&self) -> ZoneId {
        self.id
    }

    /// Device byte offset of the zone start.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Zone size in bytes.
    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    /// Current write pointer.
    pub fn wp(&self) -> u64 {
        self.df.lock().wp
    }

    /// Bytes remaining until the zone is full.
    pub fn capacity_left(&self) -> u64 {
        self.df.lock().capacity
    }

    /// Writable capacity when the zone is empty.
    pub fn max_capacity(&self) -> u64 {
        self.df.lock().max_capacity
    }

    /// Bytes of live payload accounted to this zone.
    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::SeqCst)
    }

    pub(crate) fn add_used(&self, bytes: u64) {
        self.used_capacity.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn sub_used(&self, bytes: u64) {
        let prev = self.used_capacity.fetch_sub(bytes, Ordering::SeqCst);
        debug_assert!(prev >= bytes);
    }

    pub(crate) fn clear_used(&self) {
        self.used_capacity.store(0, Ordering::SeqCst);
    }

    /// True while a writer holds this zone.
    pub fn open_for_write(&self) -> bool {
        self.open_for_write.load(Ordering::SeqCst)
    }

    pub(crate) fn set_open_for_write(&self, open: bool) {
        self.open_for_write.store(open, Ordering::SeqCst);
    }

    /// True while an append is outstanding.
    pub fn append_in_flight(&self) -> bool {
        self.append_in_flight.load(Ordering::SeqCst)
    }

    /// Lifetime hint assigned on first allocation.
    pub fn lifetime(&self) -> WriteLifetimeHint {
        *self.lifetime.lock()
    }

    pub(crate) fn set_lifetime(&self, hint: WriteLifetimeHint) {
        *self.lifetime.lock() = hint;
    }

    /// Length-weighted lifetime of the extents living in the zone.
    pub fn secondary_lifetime(&self) -> f64 {
        *self.secondary_lifetime.lock()
    }

    /// The write pointer has not moved.
    pub fn is_empty(&self) -> bool {
        let df = self.df.lock();
        df.wp == self.start
    }

    /// No capacity left.
    pub fn is_full(&self) -> bool {
        self.df.lock().capacity == 0
    }

    /// Holds live data or a writer.
    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0 || self.open_for_write()
    }

    /// Appends `data` at the write pointer and returns the device offset the
    /// payload landed at.
    ///
    /// `data.len()` must be a multiple of the block size and fit in the
    /// remaining capacity. Short device writes are retried with an advanced
    /// pointer. The writer gate is left unchanged.
    pub fn append(&self, data: &[u8]) -> ZbdResult<u64> {
        let size = data.len() as u64;
        debug_assert_eq!(size % self.block_size, 0);

        {
            let df = self.df.lock();
            if df.capacity < size {
                return Err(ZbdError::NoSpace {
                    zone: self.id,
                    requested: size,
                    capacity: df.capacity,
                });
            }
        }

        self.append_in_flight.store(true, Ordering::SeqCst);
        let result = self.append_inner(data);
        self.append_in_flight.store(false, Ordering::SeqCst);
        result
    }

    fn append_inner(&self, data: &[u8]) -> ZbdResult<u64> {
        let extent_start = self.df.lock().wp;
        let mut written = 0usize;

        while written < data.len() {
            let wp = self.df.lock().wp;
            let n = self
                .backend
                .pwrite(&data[written..], wp)
                .map_err(|e| ZbdError::ZoneIo {
                    zone: self.id,
                    op: "append",
                    reason: e.to_string(),
                })?;
            let mut df = self.df.lock();
            df.wp += n as u64;
            df.capacity -= n as u64;
            drop(df);
            written += n;
        }
        Ok(extent_start)
    }

    /// Resets the zone on the device and restores it to empty.
    ///
    /// Requires `!is_used()`. Re-reads the zone descriptor afterwards; an
    /// offline zone keeps zero capacity.
    pub fn reset(&self) -> ZbdResult<()> {
        debug_assert!(!self.is_used());

        self.backend
            .reset_zone(self.start, self.zone_size)
            .map_err(|e| ZbdError::ZoneIo {
                zone: self.id,
                op: "reset",
                reason: e.to_string(),
            })?;

        let reports = self
            .backend
            .report_zones(self.start, self.zone_size)
            .map_err(|e| ZbdError::ZoneIo {
                zone: self.id,
                op: "report",
                reason: e.to_string(),
            })?;
        let report = reports.first().ok_or_else(|| ZbdError::ZoneIo {
            zone: self.id,
            op: "report",
            reason: "empty zone report after reset".to_string(),
        })?;

        let mut df = self.df.lock();
        if report.is_offline() {
            df.capacity = 0;
        } else {
            df.max_capacity = report.capacity;
            df.capacity = report.capacity;
        }
        df.wp = self.start;
        drop(df);

        *self.lifetime.lock() = WriteLifetimeHint::NotSet;
        *self.secondary_lifetime.lock() = WriteLifetimeHint::NotSet.ordinal() as f64;
        self.extents.lock().clear();
        Ok(())
    }

    /// Marks the zone full on the device.
    ///
    /// Requires the writer gate to be released.
    pub fn finish(&self) -> ZbdResult<()> {
        debug_assert!(!self.open_for_write());

        self.backend
            .finish_zone(self.start, self.zone_size)
            .map_err(|e| ZbdError::ZoneIo {
                zone: self.id,
                op: "finish",
                reason: e.to_string(),
            })?;

        let mut df = self.df.lock();
        df.capacity = 0;
        df.wp = self.start + self.zone_size;
        Ok(())
    }

    /// Releases the zone's open resources on the device. A no-op for empty
    /// and full zones.
    pub fn close(&self) -> ZbdResult<()> {
        debug_assert!(!self.open_for_write());

        if !(self.is_empty() || self.is_full()) {
            self.backend
                .close_zone(self.start, self.zone_size)
                .map_err(|e| ZbdError::ZoneIo {
                    zone: self.id,
                    op: "close",
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Flips the matching extent record to invalid. Logs a diagnostic when
    /// the extent is missing or recorded twice.
    pub fn invalidate(&self, extent: ExtentId) {
        let mut found = false;
        let mut extents = self.extents.lock();
        for info in extents.iter_mut() {
            if info.valid && info.extent == extent {
                if found {
                    warn!(zone = %self.id, extent = %extent, "duplicate extent in invalidate");
                }
                info.invalidate();
                found = true;
            }
        }
        if !found {
            warn!(zone = %self.id, extent = %extent, "extent to invalidate not found in zone");
        }
    }

    /// Records a new extent hosted by this zone.
    pub(crate) fn push_extent(&self, info: ExtentInfo) {
        self.extents.lock().push(info);
    }

    /// Removes and returns an extent record, relinquishing ownership of its
    /// bytes (relocation).
    pub(crate) fn take_extent(&self, extent: ExtentId) -> Option<ExtentInfo> {
        let mut extents = self.extents.lock();
        let idx = extents.iter().position(|info| info.extent == extent)?;
        Some(extents.remove(idx))
    }

    /// Snapshot of the zone's extent records.
    pub fn extents_snapshot(&self) -> Vec<ExtentInfo> {
        self.extents.lock().clone()
    }

    /// True if any extent record (valid or not) belongs to `file`.
    pub(crate) fn hosts_file(&self, file: FileId) -> bool {
        self.extents.lock().iter().any(|info| info.file == file)
    }

    /// Block-padded byte totals of (valid, invalid) extents.
    pub(crate) fn padded_extent_bytes(&self) -> (u64, u64) {
        let extents = self.extents.lock();
        let mut valid = 0;
        let mut invalid = 0;
        for info in extents.iter() {
            if info.valid {
                valid += info.padded_length(self.block_size);
            } else {
                invalid += info.padded_length(self.block_size);
            }
        }
        (valid, invalid)
    }

    /// Unpadded byte total of invalid extents.
    pub(crate) fn invalid_payload_bytes(&self) -> u64 {
        self.extents
            .lock()
            .iter()
            .filter(|info| !info.valid)
            .map(|info| info.length)
            .sum()
    }

    /// Recomputes the secondary lifetime after appending `new_len` bytes
    /// with hint `new_hint`.
    pub(crate) fn update_secondary_lifetime(&self, new_hint: WriteLifetimeHint, new_len: u64) {
        let pairs: Vec<(u64, WriteLifetimeHint)> = self
            .extents
            .lock()
            .iter()
            .map(|info| (info.length, info.lifetime))
            .collect();
        *self.secondary_lifetime.lock() = weighted_secondary_lifetime(&pairs, new_len, new_hint);
    }

    /// One-line status dump used when pool accounting goes wrong.
    pub fn status_line(&self) -> String {
        let df = self.df.lock();
        format!(
            "{} start={} wp={} capacity={} used={} open={} full={} empty={}",
            self.id,
            self.start,
            df.wp,
            df.capacity,
            self.used_capacity(),
            self.open_for_write(),
            df.capacity == 0,
            df.wp == self.start,
        )
    }
}
