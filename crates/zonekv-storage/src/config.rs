//! Device configuration and on-device layout constants.

use serde::{Deserialize, Serialize};

/// Number of zones reserved for the metadata log. Two are needed to roll the
/// log safely, one extra covers a zone going offline.
pub const META_ZONES: usize = 3;

/// Minimum number of zones on a device that makes sense to manage.
pub const MIN_ZONES: u32 = 32;

/// Target size of the reserved pool feeding zone cleaning.
pub const RESERVED_ZONES: usize = 10;

/// Level value used for files outside the LSM tree (WAL, manifests).
pub const NON_LSM_LEVEL: u32 = 100;

/// Configuration for a managed zoned block device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Finish a non-open zone once its remaining capacity drops below this
    /// percentage of its maximum capacity (default: 25).
    pub finish_threshold_pct: u64,
    /// Run a cleaning pass from the allocator when the device free ratio
    /// drops to 25% or below (default: true).
    pub proactive_cleaning: bool,
    /// Open the device without a write path (default: false).
    pub readonly: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            finish_threshold_pct: 25,
            proactive_cleaning: true,
            readonly: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DeviceConfig::default();
        assert_eq!(config.finish_threshold_pct, 25);
        assert!(config.proactive_cleaning);
        assert!(!config.readonly);
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(META_ZONES, 3);
        assert!(MIN_ZONES as usize > META_ZONES + RESERVED_ZONES + 1);
    }
}
