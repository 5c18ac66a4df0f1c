//! Internal keys and the integer projection used for overlap scoring.
//!
//! The upper engine hands the allocator the smallest and largest internal
//! key of the SST being placed. Comparisons follow the usual LSM internal
//! ordering (user key ascending, sequence number descending); overlap
//! *ratios* are computed on a 64-bit projection of the user key, which is
//! order-preserving for user keys up to eight bytes and a monotone
//! truncation beyond that.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// An internal key: user key plus sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    /// The user-visible key bytes.
    pub user_key: Vec<u8>,
    /// Sequence number; newer entries carry larger values.
    pub sequence: u64,
}

impl InternalKey {
    /// Creates an internal key from raw user-key bytes.
    pub fn new(user_key: impl Into<Vec<u8>>, sequence: u64) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
        }
    }

    /// Creates an internal key whose user key is the big-endian encoding of
    /// `value`. Mostly useful in tests.
    pub fn from_u64(value: u64, sequence: u64) -> Self {
        Self::new(value.to_be_bytes().to_vec(), sequence)
    }

    /// Projects the user key onto a u64: the first eight bytes, big-endian,
    /// zero-padded on the right.
    pub fn user_key_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        let n = self.user_key.len().min(8);
        buf[..n].copy_from_slice(&self.user_key[..n]);
        u64::from_be_bytes(buf)
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // User key ascending, then sequence descending.
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Ratio of the intersection of two key ranges to their union, on the u64
/// projection. Returns `None` when the union has zero width (equal bounds),
/// which callers treat as an unusable candidate.
pub fn overlap_ratio(a: (&InternalKey, &InternalKey), b: (&InternalKey, &InternalKey)) -> Option<f64> {
    let (a_s, a_l) = (a.0.user_key_u64(), a.1.user_key_u64());
    let (b_s, b_l) = (b.0.user_key_u64(), b.1.user_key_u64());

    let union = a_l.max(b_l).checked_sub(a_s.min(b_s))?;
    if union == 0 {
        return None;
    }

    let inter = a_l.min(b_l).saturating_sub(a_s.max(b_s));
    Some(inter as f64 / union as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_by_user_key() {
        let a = InternalKey::from_u64(10, 1);
        let b = InternalKey::from_u64(20, 1);
        assert!(a < b);
    }

    #[test]
    fn test_ordering_sequence_descending() {
        let newer = InternalKey::from_u64(10, 9);
        let older = InternalKey::from_u64(10, 3);
        assert!(newer < older);
    }

    #[test]
    fn test_u64_projection_short_key() {
        let k = InternalKey::new(vec![0x01], 0);
        assert_eq!(k.user_key_u64(), 0x0100_0000_0000_0000);
    }

    #[test]
    fn test_u64_projection_preserves_order() {
        let a = InternalKey::new(b"apple".to_vec(), 0);
        let b = InternalKey::new(b"banana".to_vec(), 0);
        assert!(a < b);
        assert!(a.user_key_u64() < b.user_key_u64());
    }

    #[test]
    fn test_overlap_ratio_contained() {
        let s1 = InternalKey::from_u64(10, 0);
        let l1 = InternalKey::from_u64(20, 0);
        let s2 = InternalKey::from_u64(12, 0);
        let l2 = InternalKey::from_u64(18, 0);
        let ratio = overlap_ratio((&s1, &l1), (&s2, &l2)).unwrap();
        assert!((ratio - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_overlap_ratio_identical_ranges() {
        let s = InternalKey::from_u64(10, 0);
        let l = InternalKey::from_u64(20, 0);
        let ratio = overlap_ratio((&s, &l), (&s, &l)).unwrap();
        assert!((ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_overlap_ratio_disjoint() {
        let s1 = InternalKey::from_u64(10, 0);
        let l1 = InternalKey::from_u64(20, 0);
        let s2 = InternalKey::from_u64(30, 0);
        let l2 = InternalKey::from_u64(40, 0);
        let ratio = overlap_ratio((&s1, &l1), (&s2, &l2)).unwrap();
        assert_eq!(ratio, 0.0);
    }

    #[test]
    fn test_overlap_ratio_zero_width() {
        let k = InternalKey::from_u64(10, 0);
        assert!(overlap_ratio((&k, &k), (&k, &k)).is_none());
    }
}
