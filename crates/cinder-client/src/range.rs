//! Byte ranges over the key space.
//!
//! A range is half-open, `[start, end)`. An end of [`ZERO_KEY`] means "no
//! upper bound", which is how the store encodes "every key from `start`
//! onwards".

use std::cmp::Ordering;

/// Range end meaning "no upper bound".
pub const ZERO_KEY: &[u8] = &[0];

/// Returns the smallest key greater than every key starting with `prefix`.
///
/// Increments the last byte below `0xff` and drops everything after it.
/// A prefix made only of `0xff` bytes (or an empty prefix) has no such key
/// and yields [`ZERO_KEY`].
pub fn end_range_for_prefix(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    for i in (0..end.len()).rev() {
        if end[i] < 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return end;
        }
    }
    ZERO_KEY.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl Range {
    pub fn new(start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Self {
        Self {
            start: start.as_ref().to_vec(),
            end: end.as_ref().to_vec(),
        }
    }

    /// Every key starting with `prefix`. The empty prefix covers all keys.
    pub fn prefix(prefix: impl AsRef<[u8]>) -> Self {
        let prefix = prefix.as_ref();
        if prefix.is_empty() {
            return Self::new(ZERO_KEY, ZERO_KEY);
        }
        Self {
            start: prefix.to_vec(),
            end: end_range_for_prefix(prefix),
        }
    }

    /// Whether `key` lies inside `[start, end)`.
    pub fn includes(&self, key: &[u8]) -> bool {
        if self.end.as_slice() == ZERO_KEY {
            return key >= self.start.as_slice();
        }
        key >= self.start.as_slice() && key < self.end.as_slice()
    }

    /// Orders two ranges. Overlapping ranges compare equal; otherwise the
    /// range lying entirely before the other is `Less`.
    pub fn compare(&self, other: &Range) -> Ordering {
        if self.end.as_slice() <= other.start.as_slice() && self.end.as_slice() != ZERO_KEY {
            Ordering::Less
        } else if other.end.as_slice() <= self.start.as_slice() && other.end.as_slice() != ZERO_KEY {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_prefix_of_nothing_is_everything() {
        let range = Range::prefix(b"");
        assert_eq!(range.start, vec![0]);
        assert_eq!(range.end, vec![0]);
    }

    #[test]
    fn test_prefix_increments_last_byte() {
        let range = Range::prefix([1u8, 2]);
        assert_eq!(range.start, vec![1, 2]);
        assert_eq!(range.end, vec![1, 3]);
    }

    #[test]
    fn test_prefix_rolls_over_high_bytes() {
        let range = Range::prefix([1u8, 255]);
        assert_eq!(range.start, vec![1, 255]);
        assert_eq!(range.end, vec![2]);
    }

    #[test]
    fn test_prefix_of_all_high_bytes_is_unbounded() {
        let range = Range::prefix([255u8, 255]);
        assert_eq!(range.start, vec![255, 255]);
        assert_eq!(range.end, vec![0]);
        assert_eq!(end_range_for_prefix(&[]), vec![0]);
    }

    #[test]
    fn test_compares_ranges() {
        let k = |i: u8| vec![i];
        let r = Range::new(k(2), k(5));
        assert_eq!(r.compare(&Range::new(k(2), k(5))), Ordering::Equal);
        assert_eq!(r.compare(&Range::new(k(3), k(6))), Ordering::Equal);
        assert_eq!(r.compare(&Range::new(k(0), k(4))), Ordering::Equal);
        assert_eq!(r.compare(&Range::new(k(0), k(9))), Ordering::Equal);
        assert_eq!(r.compare(&Range::new(k(3), k(4))), Ordering::Equal);
        assert_eq!(r.compare(&Range::new(k(5), k(7))), Ordering::Less);
        assert_eq!(r.compare(&Range::new(k(0), k(1))), Ordering::Greater);
    }

    #[test]
    fn test_includes_is_half_open() {
        let r = Range::new([2u8], [5u8]);
        assert!(!r.includes(&[1]));
        assert!(r.includes(&[2]));
        assert!(r.includes(&[4, 255]));
        assert!(!r.includes(&[5]));
        assert!(Range::new([2u8], ZERO_KEY).includes(&[255, 255, 255]));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_prefix_end_bounds_every_extension(
            prefix in proptest::collection::vec(any::<u8>(), 1..8),
            suffix in proptest::collection::vec(any::<u8>(), 0..8),
        ) {
            let end = end_range_for_prefix(&prefix);
            let mut key = prefix.clone();
            key.extend_from_slice(&suffix);
            if end.as_slice() != ZERO_KEY {
                prop_assert!(key.as_slice() < end.as_slice());
                prop_assert!(prefix.as_slice() < end.as_slice());
            }
            prop_assert!(Range::prefix(&prefix).includes(&key));
        }
    }
}
