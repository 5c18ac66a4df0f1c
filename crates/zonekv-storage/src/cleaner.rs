//! Zone cleaning: victim selection, live-extent relocation and reserved
//! pool upkeep.
//!
//! Victims come off the max-heap the allocator builds (most invalid bytes
//! first). Every valid extent of a victim is read back and re-appended into
//! zones drawn from the reserved pool, splitting across destinations when
//! one fills up, then republished in the owning file's extent list and the
//! file-to-zone index. The emptied victim is reset and recycled into the
//! reserved pool, which is rebalanced back to its target size on exit.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::RESERVED_ZONES;
use crate::device::{Pools, ZonedDevice};
use crate::error::{ZbdError, ZbdResult};
use crate::extent::{padded_len, Extent, ExtentInfo};
use crate::zone::Zone;

impl ZonedDevice {
    /// Runs a cleaning pass, resetting up to `num_to_reset` victim zones.
    ///
    /// With `num_to_reset == 0` the pass only tops up the working set by
    /// moving one reserved zone into the I/O pool. Returns the number of
    /// victims reset.
    pub fn zone_cleaning(&self, num_to_reset: usize) -> ZbdResult<usize> {
        let mut pools = self.pools.lock();
        self.build_gc_queue(&mut pools);
        self.zone_cleaning_locked(&mut pools, num_to_reset)
    }

    /// Draws the relocation target for a cleaning pass: the head of the
    /// reserved pool, held open for the cleaner.
    ///
    /// Fails with [`ZbdError::ReservedPoolExhausted`] when the pool is dry,
    /// which signals a pool-accounting bug rather than legitimate space
    /// pressure.
    pub fn allocate_zone_for_cleaning(&self) -> ZbdResult<Arc<Zone>> {
        let mut pools = self.pools.lock();
        self.allocate_zone_for_cleaning_locked(&mut pools)
    }

    pub(crate) fn allocate_zone_for_cleaning_locked(
        &self,
        pools: &mut Pools,
    ) -> ZbdResult<Arc<Zone>> {
        self.resources.wait_open_slot();

        let Some(id) = pools.reserved.first().copied() else {
            self.dump_reserved_pool(pools);
            error!("reserved pool dry while running zone cleaning");
            return Err(ZbdError::ReservedPoolExhausted);
        };

        let zone = self.zone_ref(id).clone();
        debug_assert!(!zone.open_for_write());
        zone.set_open_for_write(true);
        self.resources.inc_open();
        Ok(zone)
    }

    pub(crate) fn zone_cleaning_locked(
        &self,
        pools: &mut Pools,
        num_to_reset: usize,
    ) -> ZbdResult<usize> {
        let _cleaning = self.cleaning_lock.lock();
        self.cleaning_runs.fetch_add(1, Ordering::Relaxed);

        if num_to_reset == 0 {
            // Keep the working set topped up without reclaiming anything.
            if !pools.reserved.is_empty() {
                let id = pools.reserved.remove(0);
                pools.io.push(id);
            }
            return Ok(0);
        }

        let mut reset_count = 0;
        while let Some(victim) = pools.gc_queue.pop() {
            let victim_zone = self.zone_ref(victim.zone).clone();
            debug_assert!(!victim_zone.open_for_write());

            let valid_extents: Vec<ExtentInfo> = victim_zone
                .extents_snapshot()
                .into_iter()
                .filter(|info| info.valid)
                .collect();

            for info in &valid_extents {
                self.relocate_extent(pools, &victim_zone, info)?;
            }

            victim_zone.clear_used();
            let was_active = !victim_zone.is_full();
            match victim_zone.reset() {
                Ok(()) => {
                    self.zones_reset.fetch_add(1, Ordering::Relaxed);
                    if was_active {
                        self.resources.dec_active();
                    }
                    reset_count += 1;
                    if pools.reserved.len() < RESERVED_ZONES {
                        pools.io.retain(|id| *id != victim.zone);
                        pools.reserved.push(victim.zone);
                    }
                }
                Err(e) => {
                    // The zone keeps only invalid extents; housekeeping
                    // retries the reset on a later allocation.
                    warn!(zone = %victim.zone, error = %e, "failed resetting victim zone");
                }
            }

            if reset_count >= num_to_reset {
                break;
            }
        }

        self.rebalance_pools(pools);
        Ok(reset_count)
    }

    /// Moves one valid extent out of `victim` into reserved-pool zones,
    /// splitting across destinations when one fills up.
    fn relocate_extent(
        &self,
        pools: &mut Pools,
        victim: &Arc<Zone>,
        info: &ExtentInfo,
    ) -> ZbdResult<()> {
        let Some(file) = self.file(info.file) else {
            // Owner deleted after the snapshot; its extents are invalid now.
            return Ok(());
        };
        let mut file_extents = file.extents_lock().write();

        // Revalidate under the file lock: a concurrent delete may have
        // invalidated the extent after the snapshot was taken.
        let still_valid = victim
            .extents_snapshot()
            .iter()
            .any(|i| i.extent == info.extent && i.valid);
        if !still_valid {
            return Ok(());
        }

        let valid_size = info.length as usize;
        let data_size = padded_len(info.length, self.block_size()) as usize;
        let pad = (data_size - valid_size) as u64;
        let mut buf = vec![0u8; data_size];

        if let Err(e) = self.backend().pread(&mut buf[..valid_size], info.start) {
            debug!(
                zone = %victim.id(),
                extent = %info.extent,
                error = %e,
                "buffered read failed during cleaning, falling back to direct read"
            );
            self.backend().pread_direct(&mut buf[..valid_size], info.start)?;
        }

        let mut dest = self.allocate_zone_for_cleaning_locked(pools)?;
        let mut left = data_size as u64;
        let mut offset = 0usize;
        let mut moved_payload = 0u64;
        let mut new_extents: Vec<Extent> = Vec::new();

        loop {
            let capacity = dest.capacity_left();
            if capacity == 0 {
                // A previous relocation filled this zone to the byte.
                dest.set_open_for_write(false);
                self.resources.dec_open();
                dest.finish()?;

                let dest_id = dest.id();
                pools.reserved.retain(|id| *id != dest_id);
                pools.io.push(dest_id);

                dest = self.allocate_zone_for_cleaning_locked(pools)?;
                continue;
            }
            if left <= capacity {
                let start = dest.append(&buf[offset..offset + left as usize])?;
                let payload = left - pad;
                new_extents.push(self.publish_relocated(&dest, info, start, payload));
                moved_payload += payload;

                dest.set_open_for_write(false);
                self.resources.dec_open();
                break;
            }

            // Fill the destination, finish it, promote it out of the
            // reserved pool and draw the next one.
            let chunk = capacity;
            let start = dest.append(&buf[offset..offset + chunk as usize])?;
            new_extents.push(self.publish_relocated(&dest, info, start, chunk));
            moved_payload += chunk;
            left -= chunk;
            offset += chunk as usize;
            debug_assert!(dest.is_full());

            dest.set_open_for_write(false);
            self.resources.dec_open();
            dest.finish()?;

            let dest_id = dest.id();
            pools.reserved.retain(|id| *id != dest_id);
            pools.io.push(dest_id);

            dest = self.allocate_zone_for_cleaning_locked(pools)?;
        }

        debug_assert_eq!(moved_payload, info.length);

        // The victim relinquishes the extent; the copies own the bytes now.
        victim.take_extent(info.extent);
        victim.sub_used(info.length);

        {
            let mut sst_to_zones = self.sst_to_zones.lock();
            let entry = sst_to_zones.entry(info.file).or_default();
            if !victim.hosts_file(info.file) {
                entry.retain(|id| *id != victim.id());
            }
            for extent in &new_extents {
                if !entry.contains(&extent.zone) {
                    entry.push(extent.zone);
                }
            }
        }

        // Replace the old extent with the ordered copies in the file's list.
        match file_extents.iter().position(|e| e.id == info.extent) {
            Some(pos) => {
                file_extents.splice(pos..=pos, new_extents.iter().copied());
            }
            None => {
                warn!(
                    file = %info.file,
                    extent = %info.extent,
                    "relocated extent missing from file extent list"
                );
                file_extents.extend(new_extents.iter().copied());
            }
        }
        Ok(())
    }

    /// Records one relocated chunk on its destination zone and returns the
    /// file-side extent.
    fn publish_relocated(
        &self,
        dest: &Arc<Zone>,
        source: &ExtentInfo,
        start: u64,
        payload: u64,
    ) -> Extent {
        let extent = Extent {
            id: self.next_extent_id(),
            zone: dest.id(),
            start,
            length: payload,
        };
        dest.push_extent(ExtentInfo {
            extent: extent.id,
            file: source.file,
            valid: true,
            length: payload,
            start,
            lifetime: source.lifetime,
            level: source.level,
        });
        dest.add_used(payload);
        extent
    }

    /// Restores the reserved pool to its target size: non-empty or in-use
    /// reserved zones migrate to the I/O pool, empty unheld I/O zones
    /// refill the reserve, surplus drains back.
    fn rebalance_pools(&self, pools: &mut Pools) {
        let mut i = 0;
        while i < pools.reserved.len() {
            let id = pools.reserved[i];
            let zone = self.zone_ref(id);
            if !zone.is_empty() || zone.is_used() {
                pools.reserved.remove(i);
                pools.io.push(id);
                // A written zone joins the allocator's active accounting.
                if !zone.is_empty() && !zone.is_full() {
                    self.resources.inc_active();
                }
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while pools.reserved.len() < RESERVED_ZONES && i < pools.io.len() {
            let id = pools.io[i];
            let zone = self.zone_ref(id);
            if zone.is_empty() && !zone.open_for_write() {
                pools.io.remove(i);
                pools.reserved.push(id);
            } else {
                i += 1;
            }
        }

        while pools.reserved.len() > RESERVED_ZONES {
            let Some(id) = pools.reserved.pop() else { break };
            let zone = self.zone_ref(id);
            debug_assert!(zone.is_empty() && !zone.open_for_write());
            pools.io.push(id);
        }

        for id in &pools.reserved {
            self.zone_ref(*id).clear_used();
        }
    }
}
