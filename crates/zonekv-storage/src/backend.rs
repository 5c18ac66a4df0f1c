//! Device backend abstraction for host-managed zoned block devices.
//!
//! This module provides a trait-based seam ([`ZbdBackend`]) between the zone
//! manager and the physical device, with an in-memory implementation
//! ([`MemoryZbd`]) used throughout the test suite. The real libzbd-backed
//! implementation lives in `libzbd.rs` behind the `libzbd` feature.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ZbdResult;

/// Zone model reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneModel {
    /// Host software must write sequentially and manage zone state.
    HostManaged,
    /// Device tolerates random writes but prefers sequential.
    HostAware,
}

/// Zone type from the device zone report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneType {
    /// Randomly writable region.
    Conventional,
    /// Sequential-write-required zone. The only type the engine uses.
    SequentialWriteRequired,
    /// Sequential-write-preferred zone. Ignored.
    SequentialWritePreferred,
}

/// Zone condition from the device zone report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ZoneCondition {
    /// Write pointer at zone start.
    #[default]
    Empty,
    /// Opened by a write without an explicit open command.
    ImplicitOpen,
    /// Opened by an explicit open command.
    ExplicitOpen,
    /// Open resources released but write pointer retained.
    Closed,
    /// Zone is read-only.
    ReadOnly,
    /// Write pointer reached the zone capacity.
    Full,
    /// Zone is unusable.
    Offline,
}

/// Static device geometry and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZbdInfo {
    /// Zone model; only host-managed devices are accepted.
    pub model: ZoneModel,
    /// Number of zones on the device.
    pub nr_zones: u32,
    /// Zone size in bytes.
    pub zone_size: u64,
    /// Physical block size in bytes; the write granule.
    pub block_size: u64,
    /// Hardware cap on simultaneously open zones; 0 means unlimited.
    pub max_nr_open_zones: u32,
    /// Hardware cap on simultaneously active zones; 0 means unlimited.
    pub max_nr_active_zones: u32,
}

/// One entry of a device zone report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneReport {
    /// Zone start offset in bytes.
    pub start: u64,
    /// Zone size in bytes.
    pub len: u64,
    /// Writable capacity in bytes (may be less than `len`).
    pub capacity: u64,
    /// Current write pointer (absolute device offset).
    pub wp: u64,
    /// Zone type.
    pub zone_type: ZoneType,
    /// Zone condition.
    pub cond: ZoneCondition,
}

impl ZoneReport {
    /// Returns true if the zone is unusable.
    pub fn is_offline(&self) -> bool {
        self.cond == ZoneCondition::Offline
    }

    /// Returns true if the zone cannot take further writes.
    pub fn is_full(&self) -> bool {
        self.cond == ZoneCondition::Full
    }

    /// Returns true if the device counts the zone as open.
    pub fn is_open(&self) -> bool {
        matches!(
            self.cond,
            ZoneCondition::ImplicitOpen | ZoneCondition::ExplicitOpen
        )
    }
}

/// Operation counters for a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendStats {
    /// Total bytes read (buffered and direct).
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Zone reset commands issued.
    pub zone_resets: u64,
    /// Zone finish commands issued.
    pub zone_finishes: u64,
    /// Zone close commands issued.
    pub zone_closes: u64,
    /// Buffered reads that failed (injected or real).
    pub buffered_read_errors: u64,
}

/// Trait for the zoned-device seam.
/// Implementations are the real libzbd device or an in-memory mock.
pub trait ZbdBackend: Send + Sync {
    /// Device geometry and limits.
    fn info(&self) -> ZbdResult<ZbdInfo>;

    /// Reports every zone whose start falls in `[start, start + len)`.
    fn report_zones(&self, start: u64, len: u64) -> ZbdResult<Vec<ZoneReport>>;

    /// Buffered positional read.
    fn pread(&self, buf: &mut [u8], offset: u64) -> ZbdResult<usize>;

    /// Direct positional read; the fallback path during zone cleaning.
    fn pread_direct(&self, buf: &mut [u8], offset: u64) -> ZbdResult<usize>;

    /// Positional write. Must land exactly at the target zone's write
    /// pointer; may write fewer bytes than requested.
    fn pwrite(&self, buf: &[u8], offset: u64) -> ZbdResult<usize>;

    /// Resets the zones in `[start, start + len)` to empty.
    fn reset_zone(&self, start: u64, len: u64) -> ZbdResult<()>;

    /// Transitions the zones in `[start, start + len)` to full.
    fn finish_zone(&self, start: u64, len: u64) -> ZbdResult<()>;

    /// Releases open resources of the zones in `[start, start + len)`.
    fn close_zone(&self, start: u64, len: u64) -> ZbdResult<()>;

    /// Operation counters.
    fn stats(&self) -> BackendStats;

    /// Human-readable device identity for logs.
    fn describe(&self) -> String;
}

/// Configuration for the in-memory mock device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemZbdConfig {
    /// Number of zones (default: 64).
    pub nr_zones: u32,
    /// Zone size in bytes (default: 1 MiB).
    pub zone_size: u64,
    /// Block size in bytes (default: 4096).
    pub block_size: u64,
    /// Reported open-zone cap (default: 12; 0 means unlimited).
    pub max_nr_open_zones: u32,
    /// Reported active-zone cap (default: 14; 0 means unlimited).
    pub max_nr_active_zones: u32,
    /// Reported zone model (default: host-managed).
    pub model: ZoneModel,
}

impl Default for MemZbdConfig {
    fn default() -> Self {
        Self {
            nr_zones: 64,
            zone_size: 1 << 20,
            block_size: 4096,
            max_nr_open_zones: 12,
            max_nr_active_zones: 14,
            model: ZoneModel::HostManaged,
        }
    }
}

struct MemZone {
    cond: ZoneCondition,
    zone_type: ZoneType,
    data: Vec<u8>,
}

impl MemZone {
    fn written(&self) -> u64 {
        self.data.len() as u64
    }
}

/// In-memory mock zoned device.
///
/// Zones hold append-only buffers; writes are validated against the zone
/// write pointer so sequential-write violations surface as I/O errors.
/// Buffered-read failures can be injected to exercise the direct-read
/// fallback in the cleaner.
pub struct MemoryZbd {
    config: MemZbdConfig,
    zones: Mutex<Vec<MemZone>>,
    stats: Mutex<BackendStats>,
    fail_buffered_reads: AtomicUsize,
}

impl MemoryZbd {
    /// Creates a mock device with every zone empty.
    pub fn new(config: MemZbdConfig) -> Self {
        let zones = (0..config.nr_zones)
            .map(|_| MemZone {
                cond: ZoneCondition::Empty,
                zone_type: ZoneType::SequentialWriteRequired,
                data: Vec::new(),
            })
            .collect();
        Self {
            config,
            zones: Mutex::new(zones),
            stats: Mutex::new(BackendStats::default()),
            fail_buffered_reads: AtomicUsize::new(0),
        }
    }

    /// The next `n` buffered reads fail with EIO; direct reads still work.
    pub fn fail_next_buffered_reads(&self, n: usize) {
        self.fail_buffered_reads.store(n, Ordering::SeqCst);
    }

    /// Marks a zone offline.
    pub fn set_zone_offline(&self, zone_idx: u32) {
        self.zones.lock()[zone_idx as usize].cond = ZoneCondition::Offline;
    }

    /// Overrides a zone's reported type.
    pub fn set_zone_type(&self, zone_idx: u32, zone_type: ZoneType) {
        self.zones.lock()[zone_idx as usize].zone_type = zone_type;
    }

    /// Forces a zone condition, for startup-state tests.
    pub fn force_zone_cond(&self, zone_idx: u32, cond: ZoneCondition) {
        self.zones.lock()[zone_idx as usize].cond = cond;
    }

    fn zone_index(&self, offset: u64) -> ZbdResult<usize> {
        let idx = (offset / self.config.zone_size) as usize;
        if idx >= self.config.nr_zones as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset} beyond device end"),
            )
            .into());
        }
        Ok(idx)
    }

    fn zone_range(&self, start: u64, len: u64) -> ZbdResult<std::ops::Range<usize>> {
        if start % self.config.zone_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range start {start} not zone aligned"),
            )
            .into());
        }
        let first = self.zone_index(start)?;
        let count = (len / self.config.zone_size).max(1) as usize;
        let last = (first + count).min(self.config.nr_zones as usize);
        Ok(first..last)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> ZbdResult<usize> {
        let idx = self.zone_index(offset)?;
        let zones = self.zones.lock();
        let zone = &zones[idx];
        let rel = (offset - idx as u64 * self.config.zone_size) as usize;

        // Bytes past the write pointer read back as zeroes.
        buf.fill(0);
        if rel < zone.data.len() {
            let n = buf.len().min(zone.data.len() - rel);
            buf[..n].copy_from_slice(&zone.data[rel..rel + n]);
        }
        Ok(buf.len())
    }
}

impl ZbdBackend for MemoryZbd {
    fn info(&self) -> ZbdResult<ZbdInfo> {
        Ok(ZbdInfo {
            model: self.config.model,
            nr_zones: self.config.nr_zones,
            zone_size: self.config.zone_size,
            block_size: self.config.block_size,
            max_nr_open_zones: self.config.max_nr_open_zones,
            max_nr_active_zones: self.config.max_nr_active_zones,
        })
    }

    fn report_zones(&self, start: u64, len: u64) -> ZbdResult<Vec<ZoneReport>> {
        let range = self.zone_range(start, len)?;
        let zones = self.zones.lock();
        Ok(range
            .map(|idx| {
                let zone = &zones[idx];
                let zstart = idx as u64 * self.config.zone_size;
                let wp = if zone.cond == ZoneCondition::Full {
                    zstart + self.config.zone_size
                } else {
                    zstart + zone.written()
                };
                ZoneReport {
                    start: zstart,
                    len: self.config.zone_size,
                    capacity: if zone.cond == ZoneCondition::Offline {
                        0
                    } else {
                        self.config.zone_size
                    },
                    wp,
                    zone_type: zone.zone_type,
                    cond: zone.cond,
                }
            })
            .collect())
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> ZbdResult<usize> {
        if self
            .fail_buffered_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.stats.lock().buffered_read_errors += 1;
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure").into());
        }
        let n = self.read_at(buf, offset)?;
        self.stats.lock().bytes_read += n as u64;
        Ok(n)
    }

    fn pread_direct(&self, buf: &mut [u8], offset: u64) -> ZbdResult<usize> {
        let n = self.read_at(buf, offset)?;
        self.stats.lock().bytes_read += n as u64;
        Ok(n)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> ZbdResult<usize> {
        let idx = self.zone_index(offset)?;
        let mut zones = self.zones.lock();
        let zone = &mut zones[idx];
        let zstart = idx as u64 * self.config.zone_size;

        match zone.cond {
            ZoneCondition::Offline | ZoneCondition::ReadOnly | ZoneCondition::Full => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("zone at {zstart} not writable ({:?})", zone.cond),
                )
                .into());
            }
            _ => {}
        }

        let wp = zstart + zone.written();
        if offset != wp {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write at {offset} but zone write pointer is {wp}"),
            )
            .into());
        }
        if zone.written() + buf.len() as u64 > self.config.zone_size {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "write crosses zone boundary",
            )
            .into());
        }

        zone.data.extend_from_slice(buf);
        zone.cond = if zone.written() == self.config.zone_size {
            ZoneCondition::Full
        } else {
            ZoneCondition::ImplicitOpen
        };

        self.stats.lock().bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn reset_zone(&self, start: u64, len: u64) -> ZbdResult<()> {
        let range = self.zone_range(start, len)?;
        let mut zones = self.zones.lock();
        for idx in range {
            let zone = &mut zones[idx];
            if zone.cond == ZoneCondition::Offline {
                return Err(
                    io::Error::new(io::ErrorKind::Other, "reset of offline zone").into(),
                );
            }
            zone.data.clear();
            zone.cond = ZoneCondition::Empty;
            self.stats.lock().zone_resets += 1;
        }
        Ok(())
    }

    fn finish_zone(&self, start: u64, len: u64) -> ZbdResult<()> {
        let range = self.zone_range(start, len)?;
        let mut zones = self.zones.lock();
        for idx in range {
            let zone = &mut zones[idx];
            if zone.cond == ZoneCondition::Offline {
                return Err(
                    io::Error::new(io::ErrorKind::Other, "finish of offline zone").into(),
                );
            }
            zone.cond = ZoneCondition::Full;
            self.stats.lock().zone_finishes += 1;
        }
        Ok(())
    }

    fn close_zone(&self, start: u64, len: u64) -> ZbdResult<()> {
        let range = self.zone_range(start, len)?;
        let mut zones = self.zones.lock();
        for idx in range {
            let zone = &mut zones[idx];
            if zone.cond == ZoneCondition::Offline {
                return Err(
                    io::Error::new(io::ErrorKind::Other, "close of offline zone").into(),
                );
            }
            if matches!(
                zone.cond,
                ZoneCondition::ImplicitOpen | ZoneCondition::ExplicitOpen
            ) {
                zone.cond = ZoneCondition::Closed;
            }
            self.stats.lock().zone_closes += 1;
        }
        debug!(start, len, "mock zone close");
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.stats.lock().clone()
    }

    fn describe(&self) -> String {
        format!(
            "memzbd:{}x{}",
            self.config.nr_zones, self.config.zone_size
        )
    }
}
