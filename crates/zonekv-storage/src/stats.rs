//! Counter snapshots for monitoring.

use serde::{Deserialize, Serialize};

/// Point-in-time counters of a managed device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Seconds since the device was opened.
    pub elapsed_secs: u64,
    /// Live payload bytes across I/O zones.
    pub used_bytes: u64,
    /// Bytes in full zones no longer referenced by live data.
    pub reclaimable_bytes: u64,
    /// Unwritten capacity across I/O zones.
    pub free_bytes: u64,
    /// I/O zones that are neither empty nor full.
    pub active_zone_count: u64,
    /// Active-zone counter as tracked by the allocator.
    pub active_io_zones: i64,
    /// Open-zone counter as tracked by the allocator.
    pub open_io_zones: i64,
    /// Zones currently in the I/O pool.
    pub io_zone_count: usize,
    /// Zones currently in the reserved pool.
    pub reserved_zone_count: usize,
    /// Zones in the meta pool.
    pub meta_zone_count: usize,
    /// Zone-cleaning passes run.
    pub cleaning_runs: u64,
    /// Zones reset over the device lifetime.
    pub zones_reset: u64,
}
