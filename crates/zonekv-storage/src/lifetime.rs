//! Write-lifetime hints and the lifetime distance used for zone placement.
//!
//! Zones inherit a coarse lifetime hint from the first file placed in them;
//! the allocator's last-resort step pairs files with zones whose hint is
//! close. A zone also carries a length-weighted *secondary* lifetime that
//! tracks the mix of extents actually living in it.

use serde::{Deserialize, Serialize};

/// Score meaning "these lifetimes do not pair"; candidates scoring this are
/// only taken when nothing better exists.
pub const LIFETIME_DIFF_NOT_GOOD: u64 = 100;

/// Expected rewrite cadence of a file, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum WriteLifetimeHint {
    /// No hint assigned yet.
    #[default]
    NotSet,
    /// Explicitly no expectation.
    None,
    /// Rewritten soon (L0 flushes, WAL).
    Short,
    /// Medium rewrite cadence.
    Medium,
    /// Long-lived data (deep LSM levels).
    Long,
    /// Effectively write-once.
    Extreme,
}

impl WriteLifetimeHint {
    /// Ordinal value used for arithmetic scoring.
    pub fn ordinal(self) -> u64 {
        match self {
            WriteLifetimeHint::NotSet => 0,
            WriteLifetimeHint::None => 1,
            WriteLifetimeHint::Short => 2,
            WriteLifetimeHint::Medium => 3,
            WriteLifetimeHint::Long => 4,
            WriteLifetimeHint::Extreme => 5,
        }
    }
}

/// Distance between a zone's lifetime hint and a file's.
///
/// `NotSet` and `None` only pair with themselves. Otherwise a zone may host
/// files that die no later than it does: the score is `zone - file` when the
/// zone outlives the file, and [`LIFETIME_DIFF_NOT_GOOD`] when it does not.
pub fn lifetime_diff(zone_lifetime: WriteLifetimeHint, file_lifetime: WriteLifetimeHint) -> u64 {
    debug_assert!(file_lifetime <= WriteLifetimeHint::Extreme);

    if matches!(
        file_lifetime,
        WriteLifetimeHint::NotSet | WriteLifetimeHint::None
    ) {
        if file_lifetime == zone_lifetime {
            return 0;
        }
        return LIFETIME_DIFF_NOT_GOOD;
    }

    if zone_lifetime.ordinal() > file_lifetime.ordinal() {
        return zone_lifetime.ordinal() - file_lifetime.ordinal();
    }

    LIFETIME_DIFF_NOT_GOOD
}

/// Length-weighted lifetime of a zone's extent mix after appending an extent
/// of `new_len` bytes with hint `new_hint`.
///
/// With no prior extents the new extent defines the value outright.
pub fn weighted_secondary_lifetime(
    extents: &[(u64, WriteLifetimeHint)],
    new_len: u64,
    new_hint: WriteLifetimeHint,
) -> f64 {
    let total: u64 = extents.iter().map(|(len, _)| *len).sum();
    if total == 0 {
        return new_hint.ordinal() as f64;
    }

    let mut slt = 0.0;
    for (len, hint) in extents {
        let weight = *len as f64 / total as f64;
        slt += weight * hint.ordinal() as f64;
    }
    slt += (new_len as f64 / total as f64) * new_hint.ordinal() as f64;
    slt
}

/// Distance between a zone's secondary lifetime and the mix it would have
/// after taking an average-sized extent of `file_lifetime`.
///
/// A zone with no extents (or only zero-length ones) cannot be scored and
/// returns [`LIFETIME_DIFF_NOT_GOOD`].
pub fn secondary_lifetime_diff(
    extents: &[(u64, WriteLifetimeHint)],
    zone_secondary_lifetime: f64,
    file_lifetime: WriteLifetimeHint,
) -> f64 {
    debug_assert!(file_lifetime <= WriteLifetimeHint::Extreme);

    let mut total: u64 = extents.iter().map(|(len, _)| *len).sum();
    if extents.is_empty() || total == 0 {
        return LIFETIME_DIFF_NOT_GOOD as f64;
    }

    let expected_len = total / extents.len() as u64;
    total += expected_len;

    let mut slt = 0.0;
    for (len, hint) in extents {
        let weight = *len as f64 / total as f64;
        slt += weight * hint.ordinal() as f64;
    }
    slt += (expected_len as f64 / total as f64) * file_lifetime.ordinal() as f64;

    (zone_secondary_lifetime - slt).abs()
}
