//! The managed zoned block device: zone arena, pools, counters and the
//! hooks exported to the upper engine.
//!
//! One [`ZonedDevice`] exists per physical device. It owns every [`Zone`]
//! in an arena addressed by [`ZoneId`], the meta/reserved/I-O pool
//! membership lists, the file-to-zone index, and the open/active resource
//! counters the hardware caps apply to. The allocator (`allocator.rs`) and
//! the cleaner (`cleaner.rs`) are implemented as further impl blocks on
//! this type.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{ZbdBackend, ZoneModel, ZoneType};
use crate::config::{DeviceConfig, META_ZONES, MIN_ZONES, RESERVED_ZONES};
use crate::error::{ZbdError, ZbdResult};
use crate::extent::{padded_len, Extent, ExtentIdGen, ExtentInfo, FileId};
use crate::file::SstFile;
use crate::oracle::LsmOracle;
use crate::stats::DeviceStats;
use crate::zone::{Zone, ZoneId};

const MB: u64 = 1024 * 1024;

/// A cleaning victim, ordered by invalid bytes so the heap pops the zone
/// with the most reclaimable data first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GcVictim {
    pub invalid_bytes: u64,
    pub zone: ZoneId,
}

impl Ord for GcVictim {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.invalid_bytes
            .cmp(&other.invalid_bytes)
            .then_with(|| other.zone.cmp(&self.zone))
    }
}

impl PartialOrd for GcVictim {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Pool membership and the victim queue, all guarded by the inventory lock.
pub(crate) struct Pools {
    pub io: Vec<ZoneId>,
    pub reserved: Vec<ZoneId>,
    pub gc_queue: BinaryHeap<GcVictim>,
}

/// Open/active zone counters and the condition variable writers block on.
///
/// The counters are atomics so observers can read them lock-free, but every
/// transition happens under the mutex so the condvar predicate is stable.
pub(crate) struct ZoneResources {
    max_open: i64,
    max_active: i64,
    open: AtomicI64,
    active: AtomicI64,
    lock: Mutex<()>,
    cv: Condvar,
}

impl ZoneResources {
    fn new(max_open: i64, max_active: i64, adopted_active: i64) -> Self {
        Self {
            max_open,
            max_active,
            open: AtomicI64::new(0),
            active: AtomicI64::new(adopted_active),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn open(&self) -> i64 {
        self.open.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> i64 {
        self.max_open
    }

    pub fn max_active(&self) -> i64 {
        self.max_active
    }

    /// Blocks until an open-zone slot is free.
    pub fn wait_open_slot(&self) {
        let mut guard = self.lock.lock();
        while self.open.load(Ordering::SeqCst) >= self.max_open {
            self.cv.wait(&mut guard);
        }
    }

    pub fn inc_open(&self) {
        let _guard = self.lock.lock();
        self.open.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_open(&self) {
        let _guard = self.lock.lock();
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.cv.notify_one();
    }

    pub fn inc_active(&self) {
        let _guard = self.lock.lock();
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_active(&self) {
        let _guard = self.lock.lock();
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.cv.notify_one();
    }
}

impl std::fmt::Debug for ZonedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZonedDevice")
            .field("block_size", &self.block_size)
            .field("zone_size", &self.zone_size)
            .field("nr_zones", &self.nr_zones)
            .finish()
    }
}

/// A host-managed zoned block device under management.
pub struct ZonedDevice {
    backend: Arc<dyn ZbdBackend>,
    config: DeviceConfig,
    block_size: u64,
    zone_size: u64,
    nr_zones: u32,
    zones: Vec<Arc<Zone>>,
    meta_zones: Vec<ZoneId>,
    pub(crate) pools: Mutex<Pools>,
    pub(crate) cleaning_lock: Mutex<()>,
    pub(crate) resources: ZoneResources,
    pub(crate) sst_to_zones: Mutex<HashMap<FileId, Vec<ZoneId>>>,
    files: RwLock<HashMap<FileId, Arc<SstFile>>>,
    oracle: RwLock<Option<Arc<dyn LsmOracle>>>,
    extent_ids: ExtentIdGen,
    start_time: Instant,
    pub(crate) cleaning_runs: AtomicU64,
    pub(crate) zones_reset: AtomicU64,
}

impl ZonedDevice {
    /// Opens the device behind `backend`, classifies its zones and builds
    /// the management state.
    ///
    /// Fails with `NotSupported` unless the device is host-managed with at
    /// least [`MIN_ZONES`] zones. Zones already open on the device are
    /// adopted into the active count and closed unless `config.readonly`.
    pub fn open(backend: Arc<dyn ZbdBackend>, config: DeviceConfig) -> ZbdResult<Self> {
        let zbd_info = backend
            .info()
            .map_err(|e| ZbdError::InvalidArgument(format!("failed to query device: {e}")))?;

        if zbd_info.model != ZoneModel::HostManaged {
            return Err(ZbdError::NotSupported(
                "not a host-managed block device".to_string(),
            ));
        }
        if zbd_info.nr_zones < MIN_ZONES {
            return Err(ZbdError::NotSupported(format!(
                "too few zones on device ({} required, {} reported)",
                MIN_ZONES, zbd_info.nr_zones
            )));
        }

        // One slot of each hardware cap is kept back for the metadata log.
        let max_active = if zbd_info.max_nr_active_zones == 0 {
            zbd_info.nr_zones as i64
        } else {
            zbd_info.max_nr_active_zones as i64 - 1
        };
        let max_open = if zbd_info.max_nr_open_zones == 0 {
            zbd_info.nr_zones as i64
        } else {
            zbd_info.max_nr_open_zones as i64 - 1
        };

        info!(
            device = %backend.describe(),
            nr_zones = zbd_info.nr_zones,
            max_active = zbd_info.max_nr_active_zones,
            max_open = zbd_info.max_nr_open_zones,
            "opening zoned block device"
        );

        let addr_space = zbd_info.nr_zones as u64 * zbd_info.zone_size;
        let reports = backend.report_zones(0, addr_space)?;
        if reports.len() != zbd_info.nr_zones as usize {
            return Err(ZbdError::InvalidArgument(format!(
                "zone report returned {} of {} zones",
                reports.len(),
                zbd_info.nr_zones
            )));
        }

        let mut zones: Vec<Arc<Zone>> = Vec::new();
        let mut meta_zones = Vec::new();
        let mut reserved = Vec::new();
        let mut io = Vec::new();
        let mut adopted_active: i64 = 0;

        let mut i = 0;

        // First three usable sequential-write-required zones hold the
        // metadata log; offline ones count toward the quota but join no pool.
        let mut seen_meta = 0;
        while seen_meta < META_ZONES && i < reports.len() {
            let report = &reports[i];
            i += 1;
            if report.zone_type != ZoneType::SequentialWriteRequired {
                continue;
            }
            if !report.is_offline() {
                let id = ZoneId::new(zones.len() as u32);
                zones.push(Arc::new(Zone::from_report(
                    id,
                    report,
                    zbd_info.block_size,
                    backend.clone(),
                )));
                meta_zones.push(id);
            }
            seen_meta += 1;
        }

        // The next RESERVED_ZONES + 1 feed the cleaner.
        let mut seen_reserved = 0;
        while seen_reserved <= RESERVED_ZONES && i < reports.len() {
            let report = &reports[i];
            i += 1;
            if report.zone_type != ZoneType::SequentialWriteRequired {
                continue;
            }
            if !report.is_offline() {
                let id = ZoneId::new(zones.len() as u32);
                zones.push(Arc::new(Zone::from_report(
                    id,
                    report,
                    zbd_info.block_size,
                    backend.clone(),
                )));
                reserved.push(id);
            }
            seen_reserved += 1;
        }

        // Everything else is the I/O pool.
        for report in &reports[i..] {
            if report.zone_type != ZoneType::SequentialWriteRequired || report.is_offline() {
                continue;
            }
            let id = ZoneId::new(zones.len() as u32);
            let zone = Arc::new(Zone::from_report(
                id,
                report,
                zbd_info.block_size,
                backend.clone(),
            ));

            if report.is_open() || report.cond == crate::backend::ZoneCondition::Closed {
                adopted_active += 1;
                if report.is_open() && !config.readonly {
                    if let Err(e) = zone.close() {
                        warn!(zone = %id, error = %e, "failed closing zone adopted at open");
                    }
                }
            }

            zones.push(zone);
            io.push(id);
        }

        Ok(Self {
            backend,
            config,
            block_size: zbd_info.block_size,
            zone_size: zbd_info.zone_size,
            nr_zones: zbd_info.nr_zones,
            zones,
            meta_zones,
            pools: Mutex::new(Pools {
                io,
                reserved,
                gc_queue: BinaryHeap::new(),
            }),
            cleaning_lock: Mutex::new(()),
            resources: ZoneResources::new(max_open, max_active, adopted_active),
            sst_to_zones: Mutex::new(HashMap::new()),
            files: RwLock::new(HashMap::new()),
            oracle: RwLock::new(None),
            extent_ids: ExtentIdGen::new(),
            start_time: Instant::now(),
            cleaning_runs: AtomicU64::new(0),
            zones_reset: AtomicU64::new(0),
        })
    }

    /// Wires in the upper engine's query surface.
    pub fn set_oracle(&self, oracle: Arc<dyn LsmOracle>) {
        *self.oracle.write() = Some(oracle);
    }

    pub(crate) fn oracle(&self) -> Option<Arc<dyn LsmOracle>> {
        self.oracle.read().clone()
    }

    /// Device block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Zone size in bytes.
    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    /// Number of zones reported by the device.
    pub fn nr_zones(&self) -> u32 {
        self.nr_zones
    }

    /// Device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &Arc<dyn ZbdBackend> {
        &self.backend
    }

    pub(crate) fn next_extent_id(&self) -> crate::extent::ExtentId {
        self.extent_ids.next_id()
    }

    /// Looks up a zone by id.
    pub fn zone(&self, id: ZoneId) -> Option<Arc<Zone>> {
        self.zones.get(id.index()).cloned()
    }

    pub(crate) fn zone_ref(&self, id: ZoneId) -> &Arc<Zone> {
        &self.zones[id.index()]
    }

    /// Maps a device byte offset to the I/O zone containing it.
    pub fn io_zone_at(&self, offset: u64) -> Option<Arc<Zone>> {
        let pools = self.pools.lock();
        pools
            .io
            .iter()
            .map(|id| self.zone_ref(*id))
            .find(|z| z.start() <= offset && offset < z.start() + self.zone_size)
            .cloned()
    }

    /// Number of zones currently in the I/O pool.
    pub fn io_zone_count(&self) -> usize {
        self.pools.lock().io.len()
    }

    /// Number of zones currently in the reserved pool.
    pub fn reserved_zone_count(&self) -> usize {
        self.pools.lock().reserved.len()
    }

    /// Number of zones in the meta pool.
    pub fn meta_zone_count(&self) -> usize {
        self.meta_zones.len()
    }

    /// Open I/O zone count.
    pub fn open_io_zones(&self) -> i64 {
        self.resources.open()
    }

    /// Active I/O zone count.
    pub fn active_io_zones(&self) -> i64 {
        self.resources.active()
    }

    /// Total bytes ever appended to I/O zones since their last reset.
    pub fn total_written(&self) -> u64 {
        let pools = self.pools.lock();
        pools
            .io
            .iter()
            .map(|id| {
                let z = self.zone_ref(*id);
                z.wp() - z.start()
            })
            .sum()
    }

    /// Bytes in full zones no longer referenced by live data.
    pub fn reclaimable_space(&self) -> u64 {
        let pools = self.pools.lock();
        pools
            .io
            .iter()
            .map(|id| {
                let z = self.zone_ref(*id);
                if z.is_full() {
                    z.max_capacity() - z.used_capacity()
                } else {
                    0
                }
            })
            .sum()
    }

    /// Live payload bytes across I/O zones.
    pub fn used_space(&self) -> u64 {
        let pools = self.pools.lock();
        pools
            .io
            .iter()
            .map(|id| self.zone_ref(*id).used_capacity())
            .sum()
    }

    /// Unwritten capacity across I/O zones.
    pub fn free_space(&self) -> u64 {
        let pools = self.pools.lock();
        pools
            .io
            .iter()
            .map(|id| self.zone_ref(*id).capacity_left())
            .sum()
    }

    /// Hands out a metadata zone, resetting a used-up one if needed.
    /// Returns `None` when every meta zone is in use.
    pub fn allocate_meta_zone(&self) -> Option<Arc<Zone>> {
        for id in &self.meta_zones {
            let zone = self.zone_ref(*id);
            if !zone.is_used() {
                if !zone.is_empty() {
                    if let Err(e) = zone.reset() {
                        warn!(zone = %id, error = %e, "failed resetting meta zone");
                        continue;
                    }
                }
                return Some(zone.clone());
            }
        }
        None
    }

    /// Resets every unused, non-empty I/O zone.
    pub fn reset_unused_io_zones(&self) {
        let pools = self.pools.lock();
        for id in &pools.io {
            let zone = self.zone_ref(*id);
            if !zone.is_used() && !zone.is_empty() {
                let was_full = zone.is_full();
                match zone.reset() {
                    Ok(()) => {
                        self.zones_reset.fetch_add(1, Ordering::Relaxed);
                        if !was_full {
                            self.resources.dec_active();
                        }
                    }
                    Err(e) => warn!(zone = %id, error = %e, "failed resetting zone"),
                }
            }
        }
    }

    /// Registers a file record so extents can be appended for it.
    pub fn register_file(&self, file: Arc<SstFile>) {
        self.files.write().insert(file.id(), file);
    }

    /// Looks up a registered file.
    pub fn file(&self, id: FileId) -> Option<Arc<SstFile>> {
        self.files.read().get(&id).cloned()
    }

    /// Appends `payload` for `file` into `zone` and publishes the extent.
    ///
    /// The payload is zero-padded to the block size on the device; the
    /// recorded extent length is the unpadded payload length. The zone must
    /// be held open by the caller.
    pub fn append_file_extent(
        &self,
        file_id: FileId,
        zone: &Arc<Zone>,
        payload: &[u8],
    ) -> ZbdResult<Extent> {
        debug_assert!(zone.open_for_write());
        debug_assert!(!payload.is_empty());

        let file = self
            .file(file_id)
            .ok_or(ZbdError::FileNotFound { file: file_id })?;

        let padded = padded_len(payload.len() as u64, self.block_size) as usize;
        let mut buf = Vec::with_capacity(padded);
        buf.extend_from_slice(payload);
        buf.resize(padded, 0);

        let mut file_extents = file.extents_lock().write();

        let start = zone.append(&buf)?;
        let extent = Extent {
            id: self.extent_ids.next_id(),
            zone: zone.id(),
            start,
            length: payload.len() as u64,
        };

        zone.update_secondary_lifetime(file.lifetime(), extent.length);
        zone.push_extent(ExtentInfo {
            extent: extent.id,
            file: file_id,
            valid: true,
            length: extent.length,
            start,
            lifetime: file.lifetime(),
            level: file.level(),
        });
        zone.add_used(extent.length);

        {
            let mut sst_to_zones = self.sst_to_zones.lock();
            let entry = sst_to_zones.entry(file_id).or_default();
            if !entry.contains(&zone.id()) {
                entry.push(zone.id());
            }
        }

        file_extents.push(extent);
        Ok(extent)
    }

    /// Deletes a file: invalidates its extents, releases their accounting
    /// and drops it from the file-to-zone index. The bytes stay on the
    /// medium until the hosting zones are reset.
    pub fn delete_file(&self, file_id: FileId) -> ZbdResult<()> {
        let file = self
            .files
            .write()
            .remove(&file_id)
            .ok_or(ZbdError::FileNotFound { file: file_id })?;

        let mut file_extents = file.extents_lock().write();
        for extent in file_extents.iter() {
            let zone = self.zone_ref(extent.zone);
            zone.invalidate(extent.id);
            zone.sub_used(extent.length);
        }
        file_extents.clear();

        self.sst_to_zones.lock().remove(&file_id);
        Ok(())
    }

    /// Releases a zone handed out by the allocator. Closes the zone on the
    /// device when it is neither empty nor full, then returns the open slot
    /// (and the active slot too when the writer filled the zone).
    pub fn release_zone(&self, zone: &Arc<Zone>) -> ZbdResult<()> {
        debug_assert!(zone.open_for_write());
        zone.set_open_for_write(false);
        zone.close()?;
        self.resources.dec_open();
        if zone.capacity_left() == 0 {
            self.resources.dec_active();
        }
        Ok(())
    }

    /// Current counter snapshot.
    pub fn device_stats(&self) -> DeviceStats {
        let (used, reclaimable, free, active_zone_count) = {
            let pools = self.pools.lock();
            let mut used = 0;
            let mut reclaimable = 0;
            let mut free = 0;
            let mut active = 0;
            for id in &pools.io {
                let z = self.zone_ref(*id);
                used += z.used_capacity();
                if z.is_full() {
                    reclaimable += z.max_capacity() - z.used_capacity();
                }
                free += z.capacity_left();
                if !(z.is_full() || z.is_empty()) {
                    active += 1;
                }
            }
            (used, reclaimable, free, active)
        };

        DeviceStats {
            elapsed_secs: self.start_time.elapsed().as_secs(),
            used_bytes: used,
            reclaimable_bytes: reclaimable,
            free_bytes: free,
            active_zone_count,
            active_io_zones: self.resources.active(),
            open_io_zones: self.resources.open(),
            io_zone_count: self.io_zone_count(),
            reserved_zone_count: self.reserved_zone_count(),
            meta_zone_count: self.meta_zone_count(),
            cleaning_runs: self.cleaning_runs.load(Ordering::Relaxed),
            zones_reset: self.zones_reset.load(Ordering::Relaxed),
        }
    }

    /// Logs the zone stat counters.
    pub fn log_zone_stats(&self) {
        let (used, reclaimable, reclaimables_max, active) = {
            let pools = self.pools.lock();
            let mut used = 0u64;
            let mut reclaimable = 0u64;
            let mut reclaimables_max = 0u64;
            let mut active = 0u64;
            for id in &pools.io {
                let z = self.zone_ref(*id);
                let zone_used = z.used_capacity();
                used += zone_used;
                if zone_used > 0 {
                    reclaimable += z.max_capacity() - zone_used;
                    reclaimables_max += z.max_capacity();
                }
                if !(z.is_full() || z.is_empty()) {
                    active += 1;
                }
            }
            (used, reclaimable, reclaimables_max.max(1), active)
        };

        info!(
            elapsed_s = self.start_time.elapsed().as_secs(),
            used_mb = used / MB,
            reclaimable_mb = reclaimable / MB,
            avg_reclaimable_pct = 100 * reclaimable / reclaimables_max,
            active_zone_count = active,
            active_io_zones = self.resources.active(),
            open_io_zones = self.resources.open(),
            "zone stats"
        );
    }

    /// Logs per-zone used capacity for zones holding live data.
    pub fn log_zone_usage(&self) {
        let pools = self.pools.lock();
        for id in &pools.io {
            let z = self.zone_ref(*id);
            let used = z.used_capacity();
            if used > 0 {
                debug!(zone = %id, start = z.start(), used_bytes = used, used_mb = used / MB, "zone usage");
            }
        }
    }

    /// Dumps one status line per reserved-pool zone, used when the pool
    /// unexpectedly runs dry.
    pub(crate) fn dump_reserved_pool(&self, pools: &Pools) {
        for id in &pools.reserved {
            warn!("{}", self.zone_ref(*id).status_line());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemZbdConfig, MemoryZbd, ZoneCondition};
    use crate::key::InternalKey;
    use crate::lifetime::WriteLifetimeHint;

    fn small_backend() -> Arc<MemoryZbd> {
        Arc::new(MemoryZbd::new(MemZbdConfig {
            nr_zones: 32,
            zone_size: 65536,
            block_size: 4096,
            max_nr_open_zones: 6,
            max_nr_active_zones: 8,
            ..MemZbdConfig::default()
        }))
    }

    fn open_device(backend: Arc<MemoryZbd>) -> ZonedDevice {
        ZonedDevice::open(backend, DeviceConfig::default()).unwrap()
    }

    #[test]
    fn test_open_classifies_pools() {
        let dev = open_device(small_backend());
        assert_eq!(dev.meta_zone_count(), 3);
        assert_eq!(dev.reserved_zone_count(), RESERVED_ZONES + 1);
        assert_eq!(dev.io_zone_count(), 32 - 3 - (RESERVED_ZONES + 1));
        assert_eq!(dev.open_io_zones(), 0);
        assert_eq!(dev.active_io_zones(), 0);
    }

    #[test]
    fn test_open_rejects_small_device() {
        let backend = Arc::new(MemoryZbd::new(MemZbdConfig {
            nr_zones: 16,
            ..MemZbdConfig::default()
        }));
        let err = ZonedDevice::open(backend, DeviceConfig::default()).unwrap_err();
        assert!(matches!(err, ZbdError::NotSupported(_)));
    }

    #[test]
    fn test_open_rejects_host_aware() {
        let backend = Arc::new(MemoryZbd::new(MemZbdConfig {
            model: ZoneModel::HostAware,
            ..MemZbdConfig::default()
        }));
        let err = ZonedDevice::open(backend, DeviceConfig::default()).unwrap_err();
        assert!(matches!(err, ZbdError::NotSupported(_)));
    }

    #[test]
    fn test_caps_reduced_by_one_for_meta() {
        let dev = open_device(small_backend());
        assert_eq!(dev.resources.max_open(), 5);
        assert_eq!(dev.resources.max_active(), 7);
    }

    #[test]
    fn test_zero_caps_mean_unlimited() {
        let backend = Arc::new(MemoryZbd::new(MemZbdConfig {
            max_nr_open_zones: 0,
            max_nr_active_zones: 0,
            ..MemZbdConfig::default()
        }));
        let dev = open_device(backend);
        assert_eq!(dev.resources.max_open(), 64);
        assert_eq!(dev.resources.max_active(), 64);
    }

    #[test]
    fn test_offline_zone_skipped_in_classification() {
        let backend = small_backend();
        // An offline zone past the meta and reserved ranges.
        backend.set_zone_offline(20);
        let dev = open_device(backend);
        assert_eq!(dev.io_zone_count(), 32 - 3 - (RESERVED_ZONES + 1) - 1);
    }

    #[test]
    fn test_open_adopts_active_zones() {
        let backend = small_backend();
        // Pre-write an I/O zone (beyond the 14 meta+reserved) so it reports
        // implicit-open, and force another closed.
        backend.pwrite(&[1u8; 4096], 20 * 65536).unwrap();
        backend.force_zone_cond(21, ZoneCondition::Closed);
        let dev = open_device(backend.clone());
        assert_eq!(dev.active_io_zones(), 2);
        // The open zone was closed on the device during adoption.
        let report = &backend.report_zones(20 * 65536, 65536).unwrap()[0];
        assert_eq!(report.cond, ZoneCondition::Closed);
    }

    #[test]
    fn test_allocate_meta_zone() {
        let dev = open_device(small_backend());
        let zone = dev.allocate_meta_zone().unwrap();
        assert!(dev.meta_zones.contains(&zone.id()));
        assert!(zone.is_empty());
    }

    #[test]
    fn test_append_file_extent_updates_indexes() {
        let dev = open_device(small_backend());
        let file = Arc::new(SstFile::new(
            FileId::new(1),
            0,
            InternalKey::from_u64(0, 0),
            InternalKey::from_u64(10, 0),
            WriteLifetimeHint::Medium,
        ));
        dev.register_file(file.clone());

        let zone = dev
            .allocate_zone(
                WriteLifetimeHint::Medium,
                &InternalKey::from_u64(0, 0),
                &InternalKey::from_u64(10, 0),
                0,
            )
            .unwrap()
            .unwrap();

        let extent = dev
            .append_file_extent(FileId::new(1), &zone, &[42u8; 5000])
            .unwrap();
        assert_eq!(extent.length, 5000);
        assert_eq!(zone.used_capacity(), 5000);
        // Padded to the block size on the medium.
        assert_eq!(zone.wp() - zone.start(), 8192);
        assert_eq!(
            dev.sst_to_zones.lock().get(&FileId::new(1)).unwrap(),
            &vec![zone.id()]
        );
        assert_eq!(file.extents().len(), 1);

        dev.release_zone(&zone).unwrap();
        assert_eq!(dev.open_io_zones(), 0);
        assert_eq!(dev.active_io_zones(), 1);
    }

    #[test]
    fn test_delete_file_invalidates_extents() {
        let dev = open_device(small_backend());
        let file = Arc::new(SstFile::new(
            FileId::new(1),
            0,
            InternalKey::from_u64(0, 0),
            InternalKey::from_u64(10, 0),
            WriteLifetimeHint::Medium,
        ));
        dev.register_file(file.clone());

        let zone = dev
            .allocate_zone(
                WriteLifetimeHint::Medium,
                &InternalKey::from_u64(0, 0),
                &InternalKey::from_u64(10, 0),
                0,
            )
            .unwrap()
            .unwrap();
        dev.append_file_extent(FileId::new(1), &zone, &[1u8; 4096])
            .unwrap();
        dev.release_zone(&zone).unwrap();

        dev.delete_file(FileId::new(1)).unwrap();
        assert_eq!(zone.used_capacity(), 0);
        assert!(!zone.is_used());
        assert!(zone.extents_snapshot().iter().all(|i| !i.valid));
        assert!(dev.sst_to_zones.lock().get(&FileId::new(1)).is_none());
        assert!(dev.file(FileId::new(1)).is_none());
    }

    #[test]
    fn test_space_accounting() {
        let dev = open_device(small_backend());
        let io_zones = dev.io_zone_count() as u64;
        assert_eq!(dev.free_space(), io_zones * 65536);
        assert_eq!(dev.used_space(), 0);
        assert_eq!(dev.total_written(), 0);

        let file = Arc::new(SstFile::new(
            FileId::new(1),
            0,
            InternalKey::from_u64(0, 0),
            InternalKey::from_u64(10, 0),
            WriteLifetimeHint::Medium,
        ));
        dev.register_file(file);
        let zone = dev
            .allocate_zone(
                WriteLifetimeHint::Medium,
                &InternalKey::from_u64(0, 0),
                &InternalKey::from_u64(10, 0),
                0,
            )
            .unwrap()
            .unwrap();
        dev.append_file_extent(FileId::new(1), &zone, &[1u8; 8192])
            .unwrap();

        assert_eq!(dev.total_written(), 8192);
        assert_eq!(dev.used_space(), 8192);
        assert_eq!(dev.free_space(), io_zones * 65536 - 8192);

        let stats = dev.device_stats();
        assert_eq!(stats.used_bytes, 8192);
        assert_eq!(stats.open_io_zones, 1);
        dev.log_zone_stats();
        dev.log_zone_usage();
        dev.release_zone(&zone).unwrap();
    }

    #[test]
    fn test_reset_unused_io_zones() {
        let dev = open_device(small_backend());
        let file = Arc::new(SstFile::new(
            FileId::new(1),
            0,
            InternalKey::from_u64(0, 0),
            InternalKey::from_u64(10, 0),
            WriteLifetimeHint::Medium,
        ));
        dev.register_file(file);

        let zone = dev
            .allocate_zone(
                WriteLifetimeHint::Medium,
                &InternalKey::from_u64(0, 0),
                &InternalKey::from_u64(10, 0),
                0,
            )
            .unwrap()
            .unwrap();
        dev.append_file_extent(FileId::new(1), &zone, &[1u8; 4096])
            .unwrap();
        dev.release_zone(&zone).unwrap();
        dev.delete_file(FileId::new(1)).unwrap();
        assert!(!zone.is_empty());
        assert!(!zone.is_used());

        dev.reset_unused_io_zones();
        assert!(zone.is_empty());
        assert_eq!(dev.active_io_zones(), 0);
    }

    #[test]
    fn test_reclaimable_space_counts_full_zones() {
        let dev = open_device(small_backend());
        for id in [1u64, 2] {
            dev.register_file(Arc::new(SstFile::new(
                FileId::new(id),
                0,
                InternalKey::from_u64(id * 100, 0),
                InternalKey::from_u64(id * 100 + 10, 0),
                WriteLifetimeHint::Medium,
            )));
        }

        let zone = dev
            .allocate_zone(
                WriteLifetimeHint::Medium,
                &InternalKey::from_u64(100, 0),
                &InternalKey::from_u64(110, 0),
                0,
            )
            .unwrap()
            .unwrap();
        dev.append_file_extent(FileId::new(1), &zone, &[1u8; 32768])
            .unwrap();
        dev.append_file_extent(FileId::new(2), &zone, &[2u8; 32768])
            .unwrap();
        dev.release_zone(&zone).unwrap();
        assert!(zone.is_full());

        // Nothing reclaimable while everything is live.
        assert_eq!(dev.reclaimable_space(), 0);
        dev.delete_file(FileId::new(2)).unwrap();
        assert_eq!(dev.reclaimable_space(), 32768);
    }

    #[test]
    fn test_allocate_zone_for_cleaning_draws_reserved_head() {
        let dev = open_device(small_backend());
        let zone = dev.allocate_zone_for_cleaning().unwrap();
        assert!(zone.open_for_write());
        assert_eq!(dev.open_io_zones(), 1);
        // The zone stays in the reserved pool while the cleaner holds it.
        assert_eq!(dev.reserved_zone_count(), RESERVED_ZONES + 1);
        dev.release_zone(&zone).unwrap();
        assert_eq!(dev.open_io_zones(), 0);
    }

    #[test]
    fn test_io_zone_at() {
        let dev = open_device(small_backend());
        let first_io = {
            let pools = dev.pools.lock();
            dev.zone_ref(pools.io[0]).clone()
        };
        let found = dev.io_zone_at(first_io.start() + 100).unwrap();
        assert_eq!(found.id(), first_io.id());
        // Meta zone offsets are not in the I/O pool.
        assert!(dev.io_zone_at(0).is_none());
    }
}
