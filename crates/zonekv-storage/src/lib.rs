#![warn(missing_docs)]

//! ZoneKV storage subsystem: host-managed zoned block device management,
//! SST placement and zone cleaning.
//!
//! This crate manages a host-managed zoned block device (ZBD) as the raw
//! medium for a log-structured key-value engine. It enumerates zones into
//! meta/reserved/I-O pools, hands out zones to writers through a placement
//! policy aware of LSM levels and key-range overlap, and reclaims space by
//! relocating live extents out of victim zones before resetting them.

pub mod allocator;
pub mod backend;
pub mod cleaner;
pub mod config;
pub mod device;
pub mod error;
pub mod extent;
pub mod file;
pub mod key;
pub mod lifetime;
pub mod oracle;
pub mod stats;
pub mod zone;

#[cfg(feature = "libzbd")]
pub mod libzbd;

pub use backend::{
    BackendStats, MemZbdConfig, MemoryZbd, ZbdBackend, ZbdInfo, ZoneCondition, ZoneModel,
    ZoneReport, ZoneType,
};
pub use config::{DeviceConfig, META_ZONES, MIN_ZONES, NON_LSM_LEVEL, RESERVED_ZONES};
pub use device::ZonedDevice;
pub use error::{ZbdError, ZbdResult};
pub use extent::{Extent, ExtentId, ExtentInfo, FileId};
pub use file::SstFile;
pub use key::{overlap_ratio, InternalKey};
pub use lifetime::{
    lifetime_diff, secondary_lifetime_diff, WriteLifetimeHint, LIFETIME_DIFF_NOT_GOOD,
};
pub use oracle::{FixedOracle, LsmOracle};
pub use stats::DeviceStats;
pub use zone::{Zone, ZoneId};

#[cfg(feature = "libzbd")]
pub use libzbd::LibzbdDevice;
