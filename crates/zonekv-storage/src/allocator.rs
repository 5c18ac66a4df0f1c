//! Zone allocation: admission control, housekeeping and the placement
//! cascade.
//!
//! `allocate_zone` is called for every new file/extent the upper engine
//! writes. It runs entirely under the inventory lock: housekeeping over the
//! I/O pool, an optional proactive cleaning pass under free-space pressure,
//! then the placement cascade. The cascade itself is a pure search
//! (`try_place`) invoked once before and once after reactive cleaning.

use std::collections::HashSet;
use std::hint::spin_loop;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::config::{NON_LSM_LEVEL, RESERVED_ZONES};
use crate::device::{GcVictim, Pools, ZonedDevice};
use crate::error::ZbdResult;
use crate::extent::FileId;
use crate::key::{overlap_ratio, InternalKey};
use crate::lifetime::{lifetime_diff, WriteLifetimeHint, LIFETIME_DIFF_NOT_GOOD};
use crate::zone::Zone;

/// Free-space ratio (percent) at or below which the allocator runs a
/// cleaning pass before placement.
const CLEANING_TRIGGER_PCT: f64 = 25.0;

impl ZonedDevice {
    /// Allocates a zone for a new file with the given lifetime hint, key
    /// range and LSM level.
    ///
    /// On success the returned zone is owned exclusively by the caller: its
    /// writer gate is set and `open_io_zones` incremented; the caller
    /// releases it with [`ZonedDevice::release_zone`]. Returns `Ok(None)`
    /// when no zone can be produced even after reactive cleaning.
    pub fn allocate_zone(
        &self,
        hint: WriteLifetimeHint,
        smallest: &InternalKey,
        largest: &InternalKey,
        level: u32,
    ) -> ZbdResult<Option<Arc<Zone>>> {
        let mut pools = self.pools.lock();

        // Admission control: stay below the open-zone cap. Only the
        // resources lock is released while waiting; the inventory stays
        // ours.
        self.resources.wait_open_slot();

        self.housekeeping(&pools);

        if self.config().proactive_cleaning {
            self.maybe_proactive_clean(&mut pools)?;
        }

        if let Some(zone) = self.try_place(&pools, hint, smallest, largest, level) {
            return Ok(Some(self.grant(zone)));
        }

        // Nothing placeable: reclaim space, then retry the cascade once.
        let total_invalid = self.build_gc_queue(&mut pools);
        let max_capacity = pools
            .io
            .first()
            .map(|id| self.zone_ref(*id).max_capacity())
            .unwrap_or(0);
        let num_to_reset = if total_invalid < max_capacity {
            0
        } else {
            RESERVED_ZONES
        };
        self.zone_cleaning_locked(&mut pools, num_to_reset)?;

        if let Some(zone) = self.try_place(&pools, hint, smallest, largest, level) {
            return Ok(Some(self.grant(zone)));
        }

        drop(pools);
        self.log_zone_stats();
        Ok(None)
    }

    /// Takes exclusive ownership of a placed zone for the caller.
    fn grant(&self, zone: Arc<Zone>) -> Arc<Zone> {
        debug_assert!(!zone.open_for_write());
        zone.set_open_for_write(true);
        self.resources.inc_open();
        zone
    }

    /// Resets unused zones and finishes zones under the capacity threshold.
    /// Reset/finish failures are logged and the zone left for a later pass.
    fn housekeeping(&self, pools: &Pools) {
        for id in &pools.io {
            let zone = self.zone_ref(*id);
            if zone.open_for_write() || zone.is_empty() || (zone.is_full() && zone.is_used()) {
                continue;
            }

            if !zone.is_used() {
                debug_assert!(zone.extents_snapshot().iter().all(|info| !info.valid));
                let was_full = zone.is_full();
                match zone.reset() {
                    Ok(()) => {
                        self.zones_reset.fetch_add(1, Ordering::Relaxed);
                        if !was_full {
                            self.resources.dec_active();
                        }
                    }
                    Err(e) => debug!(zone = %id, error = %e, "failed resetting zone"),
                }
                continue;
            }

            let threshold = zone.max_capacity() * self.config().finish_threshold_pct / 100;
            if zone.capacity_left() < threshold {
                match zone.finish() {
                    Ok(()) => self.resources.dec_active(),
                    Err(e) => debug!(zone = %id, error = %e, "failed finishing zone"),
                }
            }
        }
    }

    /// Runs a cleaning pass when free space is at or below the trigger
    /// ratio. The batch grows as free space shrinks.
    fn maybe_proactive_clean(&self, pools: &mut Pools) -> ZbdResult<()> {
        let nr_zones = pools.io.len();
        if nr_zones == 0 {
            return Ok(());
        }

        let free: u64 = pools
            .io
            .iter()
            .map(|id| self.zone_ref(*id).capacity_left())
            .sum();
        let total = nr_zones as u64 * self.zone_ref(pools.io[0]).max_capacity();
        if total == 0 {
            return Ok(());
        }

        let free_ratio = free as f64 / total as f64 * 100.0;
        if free_ratio > CLEANING_TRIGGER_PCT {
            return Ok(());
        }

        let num_to_reset = if free_ratio > 20.0 {
            nr_zones / 10
        } else {
            nr_zones / 5
        };
        debug!(
            free_ratio,
            num_to_reset, "free space low, running proactive cleaning"
        );
        self.build_gc_queue(pools);
        self.zone_cleaning_locked(pools, num_to_reset)?;
        Ok(())
    }

    /// Rebuilds the victim queue from scratch and returns the device-wide
    /// total of invalid (block-padded) bytes.
    pub(crate) fn build_gc_queue(&self, pools: &mut Pools) -> u64 {
        pools.gc_queue.clear();
        let mut total_invalid = 0;

        for id in &pools.io {
            let zone = self.zone_ref(*id);
            // Appends publish their extent before clearing the flag; wait
            // for outstanding ones so the byte counts are stable.
            while zone.append_in_flight() {
                spin_loop();
            }

            let (_valid, invalid) = zone.padded_extent_bytes();
            if invalid > 0 && !zone.open_for_write() {
                pools.gc_queue.push(GcVictim {
                    invalid_bytes: invalid,
                    zone: *id,
                });
            }
            total_invalid += invalid;
        }
        total_invalid
    }

    /// The placement cascade. Returns a zone not yet granted to the caller,
    /// or `None` if every step comes up empty.
    fn try_place(
        &self,
        pools: &Pools,
        hint: WriteLifetimeHint,
        smallest: &InternalKey,
        largest: &InternalKey,
        level: u32,
    ) -> Option<Arc<Zone>> {
        // Bootstrap: no file holds any zone yet, hand out an empty one.
        if self.sst_to_zones.lock().is_empty() {
            if let Some(zone) = self.empty_zone(pools, hint) {
                return Some(zone);
            }
        }

        let oracle = self.oracle();

        // Overlap-weighted match: place next to the files this key range
        // will be compacted with.
        let overlapping = oracle
            .as_ref()
            .map(|o| o.overlapping_files(smallest, largest))
            .unwrap_or_default();
        let ranked = self.rank_by_overlap(&overlapping, smallest, largest);

        if !ranked.is_empty() {
            if let Some(zone) = self.pick_overlap_zone(pools, &ranked) {
                return Some(zone);
            }
        } else if level == 0 || level == NON_LSM_LEVEL {
            // L0 files are compacted together; co-locate with the bulk of L0.
            if let Some(oracle) = &oracle {
                let l0_zones = self.zones_of_files(&oracle.same_level_files(0));
                if let Some(zone) = self.pick_most_l0_zone(pools, &l0_zones) {
                    return Some(zone);
                }
            }
        }

        if let Some(zone) = self.empty_zone(pools, hint) {
            return Some(zone);
        }

        if level != NON_LSM_LEVEL {
            if let Some(oracle) = &oracle {
                let same_level = oracle.same_level_files(level);
                if let Some(zone) =
                    self.place_with_same_level_files(&same_level, smallest, largest)
                {
                    return Some(zone);
                }
            }
        }

        self.best_lifetime_fit(pools, hint)
    }

    /// Grabs an empty, unheld I/O zone if an active-zone slot is free,
    /// assigning the caller's lifetime hint.
    fn empty_zone(&self, pools: &Pools, hint: WriteLifetimeHint) -> Option<Arc<Zone>> {
        if self.resources.active() >= self.resources.max_active() {
            return None;
        }
        for id in &pools.io {
            let zone = self.zone_ref(*id);
            if !zone.open_for_write() && zone.is_empty() {
                zone.set_lifetime(hint);
                self.resources.inc_active();
                return Some(zone.clone());
            }
        }
        None
    }

    /// Files sorted by key-range overlap with `[smallest, largest]`,
    /// descending. Candidates with a degenerate (zero-width) union or no
    /// registered record are skipped.
    fn rank_by_overlap(
        &self,
        files: &[FileId],
        smallest: &InternalKey,
        largest: &InternalKey,
    ) -> Vec<FileId> {
        let mut ranked: Vec<(FileId, f64)> = Vec::new();
        for fno in files {
            let Some(file) = self.file(*fno) else {
                continue;
            };
            let Some(ratio) =
                overlap_ratio((file.smallest(), file.largest()), (smallest, largest))
            else {
                continue;
            };
            ranked.push((*fno, ratio));
        }
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.into_iter().map(|(fno, _)| fno).collect()
    }

    /// Zone ids holding any extent of the given files.
    fn zones_of_files(&self, files: &[FileId]) -> HashSet<crate::zone::ZoneId> {
        let sst_to_zones = self.sst_to_zones.lock();
        let mut zones = HashSet::new();
        for fno in files {
            if let Some(ids) = sst_to_zones.get(fno) {
                zones.extend(ids.iter().copied());
            }
        }
        zones
    }

    /// Among the zones holding overlapping files, picks a writable one with
    /// the least invalid data.
    fn pick_overlap_zone(&self, pools: &Pools, ranked: &[FileId]) -> Option<Arc<Zone>> {
        let zone_list = self.zones_of_files(ranked);
        let mut best: Option<(u64, Arc<Zone>)> = None;

        for id in &pools.io {
            if !zone_list.contains(id) {
                continue;
            }
            let zone = self.zone_ref(*id);
            if zone.is_full() || zone.open_for_write() {
                continue;
            }
            let invalid = zone.invalid_payload_bytes();
            match &best {
                Some((best_invalid, _)) if invalid >= *best_invalid => {}
                _ => best = Some((invalid, zone.clone())),
            }
        }
        best.map(|(_, zone)| zone)
    }

    /// Picks the writable zone holding the most valid L0 bytes.
    fn pick_most_l0_zone(
        &self,
        pools: &Pools,
        zone_list: &HashSet<crate::zone::ZoneId>,
    ) -> Option<Arc<Zone>> {
        if zone_list.is_empty() {
            return None;
        }

        let mut max = 0u64;
        let mut best: Option<Arc<Zone>> = None;
        for id in &pools.io {
            if !zone_list.contains(id) {
                continue;
            }
            let zone = self.zone_ref(*id);
            if zone.open_for_write() || zone.is_full() {
                continue;
            }
            let l0_bytes: u64 = zone
                .extents_snapshot()
                .iter()
                .filter(|info| info.level == 0 && info.valid)
                .map(|info| info.length)
                .sum();
            if l0_bytes >= max {
                max = l0_bytes;
                best = Some(zone.clone());
            }
        }
        best
    }

    /// Places among zones holding same-level files whose key ranges bracket
    /// the caller's range: nearest neighbours first, walking outward.
    fn place_with_same_level_files(
        &self,
        fno_list: &[FileId],
        smallest: &InternalKey,
        largest: &InternalKey,
    ) -> Option<Arc<Zone>> {
        if fno_list.is_empty() {
            return None;
        }

        if fno_list.len() == 1 {
            return self.writable_zone_of(fno_list[0]);
        }

        // Insertion index of `largest` in the level's sorted file list.
        let mut idx = fno_list.len();
        for (i, fno) in fno_list.iter().enumerate() {
            let Some(file) = self.file(*fno) else {
                continue;
            };
            if largest <= file.smallest() {
                debug_assert!(smallest <= file.largest());
                idx = i;
                break;
            }
        }

        if idx == 0 {
            // The caller holds the smallest keys of the level.
            return fno_list
                .iter()
                .find_map(|fno| self.writable_zone_of(*fno));
        }
        if idx == fno_list.len() {
            // The caller holds the largest keys of the level.
            return fno_list
                .iter()
                .rev()
                .find_map(|fno| self.writable_zone_of(*fno));
        }

        // Middle: alternate left/right neighbours, walking outward.
        let mut l_idx = idx as i64 - 1;
        let mut r_idx = idx;
        while l_idx >= 0 || r_idx < fno_list.len() {
            if l_idx >= 0 {
                if let Some(zone) = self.writable_zone_of(fno_list[l_idx as usize]) {
                    return Some(zone);
                }
                l_idx -= 1;
            }
            if r_idx < fno_list.len() {
                if let Some(zone) = self.writable_zone_of(fno_list[r_idx]) {
                    return Some(zone);
                }
                r_idx += 1;
            }
        }
        None
    }

    /// First writable (not full, not held) zone hosting `fno`.
    fn writable_zone_of(&self, fno: FileId) -> Option<Arc<Zone>> {
        let sst_to_zones = self.sst_to_zones.lock();
        let ids = sst_to_zones.get(&fno)?;
        for id in ids {
            let zone = self.zone_ref(*id);
            if !zone.open_for_write() && !zone.is_full() {
                return Some(zone.clone());
            }
        }
        None
    }

    /// Last-resort fit: the non-empty, non-full zone whose lifetime hint is
    /// closest to the caller's.
    fn best_lifetime_fit(&self, pools: &Pools, hint: WriteLifetimeHint) -> Option<Arc<Zone>> {
        let mut best_diff = LIFETIME_DIFF_NOT_GOOD;
        let mut best: Option<Arc<Zone>> = None;

        for id in &pools.io {
            let zone = self.zone_ref(*id);
            if !zone.open_for_write() && zone.used_capacity() > 0 && !zone.is_full() {
                let diff = lifetime_diff(zone.lifetime(), hint);
                if diff <= best_diff {
                    best_diff = diff;
                    best = Some(zone.clone());
                }
            }
        }
        best
    }
}
