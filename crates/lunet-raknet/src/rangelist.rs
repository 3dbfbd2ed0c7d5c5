//! Compact set of u32 values stored as sorted inclusive ranges.
//!
//! This is the ACK carrier of the wire protocol: acknowledged message
//! numbers compress to `[min, max]` intervals, and the integers "between"
//! the intervals (the holes) are what loss inference looks at.

use crate::error::{RakNetError, Result};
use lunet_binary::{BinaryError, BitReader, BitWriter};

/// Inclusive interval with `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: u32,
    pub max: u32,
}

/// Sorted list of non-empty, non-overlapping, non-adjacent inclusive
/// ranges. Insertion extends or merges ranges where possible; duplicates
/// are no-ops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeList {
    ranges: Vec<Range>,
}

impl RangeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of contained integers.
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|r| (r.max - r.min + 1) as usize)
            .sum()
    }

    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn contains(&self, item: u32) -> bool {
        self.ranges.iter().any(|r| r.min <= item && item <= r.max)
    }

    /// The contained integers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|r| r.min..=r.max)
    }

    /// The integers strictly between consecutive ranges, ascending.
    pub fn holes(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges
            .windows(2)
            .flat_map(|pair| pair[0].max + 1..pair[1].min)
    }

    pub fn num_holes(&self) -> usize {
        self.ranges
            .windows(2)
            .map(|pair| (pair[1].min - pair[0].max - 1) as usize)
            .sum()
    }

    pub fn insert(&mut self, item: u32) {
        for i in 0..self.ranges.len() {
            let range = self.ranges[i];
            if item < u32::MAX && range.min == item + 1 {
                // The item extends the range downward.
                self.ranges[i].min = item;
                return;
            }
            if range.min <= item {
                if range.max < u32::MAX && range.max + 1 == item {
                    // The item extends the range upward; merge with the next
                    // range if that closed the gap.
                    self.ranges[i].max = item;
                    if i + 1 < self.ranges.len() && self.ranges[i + 1].min == item + 1 {
                        self.ranges[i].max = self.ranges[i + 1].max;
                        self.ranges.remove(i + 1);
                    }
                    return;
                }
                if range.max >= item {
                    // Already contained.
                    return;
                }
            } else {
                // The list is sorted, so this is the insertion point.
                self.ranges.insert(i, Range { min: item, max: item });
                return;
            }
        }
        self.ranges.push(Range { min: item, max: item });
    }

    /// Serializes in the RakNet ACK format: compressed-u16 range count,
    /// then per range one `min == max` bit, the u32 min, and the u32 max
    /// only when distinct.
    pub fn serialize(&self, out: &mut BitWriter) {
        debug_assert!(self.ranges.len() <= u16::MAX as usize);
        out.write_compressed_u16(self.ranges.len() as u16);
        for range in &self.ranges {
            out.write_bit(range.min == range.max);
            out.write_u32_le(range.min);
            if range.min != range.max {
                out.write_u32_le(range.max);
            }
        }
    }

    /// Inverse of [`RangeList::serialize`]. Range bounds are trusted, but a
    /// count that cannot fit in the remaining bits is rejected up front.
    pub fn deserialize(stream: &mut BitReader) -> Result<Self> {
        let count = stream.read_compressed_u16()? as usize;
        // Minimal encoding of one range is the singleton bit plus a u32.
        if count * 33 > stream.remaining_bits() {
            return Err(RakNetError::Binary(BinaryError::ShortRead {
                needed: count * 33,
                remaining: stream.remaining_bits(),
            }));
        }
        let mut list = RangeList::new();
        for _ in 0..count {
            let singleton = stream.read_bit()?;
            let min = stream.read_u32_le()?;
            let max = if singleton { min } else { stream.read_u32_le()? };
            list.ranges.push(Range { min, max });
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn collect(list: &RangeList) -> Vec<u32> {
        list.iter().collect()
    }

    /// The invariants every populated list must satisfy.
    fn check_invariants(list: &RangeList) {
        assert_eq!(collect(list).len(), list.len());
        for item in list.iter() {
            assert!(list.contains(item));
        }
        for hole in list.holes() {
            assert!(!list.contains(hole));
        }
        assert_eq!(list.holes().count(), list.num_holes());

        let mut out = BitWriter::new();
        list.serialize(&mut out);
        let data = out.as_bytes().to_vec();
        let mut reader = BitReader::new(&data);
        let restored = RangeList::deserialize(&mut reader).unwrap();
        assert_eq!(collect(&restored), collect(list));
    }

    #[test]
    fn test_insert_duplicates() {
        let mut list = RangeList::new();
        for value in [1, 1, 2, 2, 3, 3] {
            list.insert(value);
        }
        assert_eq!(collect(&list), vec![1, 2, 3]);
        assert_eq!(list.num_ranges(), 1);
        check_invariants(&list);
    }

    #[test]
    fn test_insert_within() {
        let mut list = RangeList::new();
        for value in [1, 5, 2, 4, 3] {
            list.insert(value);
        }
        assert_eq!(collect(&list), vec![1, 2, 3, 4, 5]);
        assert_eq!(list.num_ranges(), 1);
        check_invariants(&list);
    }

    #[test]
    fn test_insert_reversed() {
        let mut list = RangeList::new();
        for value in [4, 3, 2, 1] {
            list.insert(value);
        }
        assert_eq!(collect(&list), vec![1, 2, 3, 4]);
        assert_eq!(list.num_ranges(), 1);
    }

    #[test]
    fn test_insert_merges_ranges() {
        let mut list = RangeList::new();
        list.insert(1);
        list.insert(3);
        assert_eq!(list.num_ranges(), 2);
        list.insert(2);
        assert_eq!(collect(&list), vec![1, 2, 3]);
        assert_eq!(list.num_ranges(), 1);
        check_invariants(&list);
    }

    #[test]
    fn test_insert_extends_both_ends() {
        let mut list = RangeList::new();
        list.insert(5);
        list.insert(4);
        list.insert(6);
        assert_eq!(collect(&list), vec![4, 5, 6]);
        assert_eq!(list.num_ranges(), 1);
    }

    #[test]
    fn test_insert_outlier() {
        let mut list = RangeList::new();
        for value in [1, 2, 3] {
            list.insert(value);
        }
        list.insert(20);
        assert_eq!(collect(&list), vec![1, 2, 3, 20]);
        assert_eq!(list.num_ranges(), 2);
        check_invariants(&list);
    }

    #[test]
    fn test_insert_random() {
        let mut rng = rand::rng();
        for _ in 0..100 {
            let mut list = RangeList::new();
            let mut values = Vec::new();
            for _ in 0..100 {
                values.push(rng.random_range(0u32..100));
            }
            for &value in &values {
                list.insert(value);
            }
            values.sort_unstable();
            values.dedup();
            assert_eq!(collect(&list), values);
            check_invariants(&list);
        }
    }

    #[test]
    fn test_holes() {
        let mut list = RangeList::new();
        for value in [1, 2, 4, 5, 8, 9, 15, 19] {
            list.insert(value);
        }
        assert_eq!(list.num_holes(), 11);
        assert_eq!(
            list.holes().collect::<Vec<_>>(),
            vec![3, 6, 7, 10, 11, 12, 13, 14, 16, 17, 18]
        );
        check_invariants(&list);
    }

    #[test]
    fn test_clear() {
        let mut list = RangeList::new();
        list.insert(1);
        assert!(!list.is_empty());
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_deserialize_then_insert() {
        let mut list = RangeList::new();
        for value in [1, 2, 4, 5] {
            list.insert(value);
        }
        let mut out = BitWriter::new();
        list.serialize(&mut out);
        let data = out.as_bytes().to_vec();
        let mut reader = BitReader::new(&data);
        let mut restored = RangeList::deserialize(&mut reader).unwrap();
        restored.insert(3);
        assert_eq!(collect(&restored), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_deserialize_rejects_oversized_count() {
        let mut out = BitWriter::new();
        out.write_compressed_u16(1000);
        out.write_u32_le(7);
        let data = out.as_bytes().to_vec();
        let mut reader = BitReader::new(&data);
        assert!(matches!(
            RangeList::deserialize(&mut reader),
            Err(RakNetError::Binary(BinaryError::ShortRead { .. }))
        ));
    }
}
