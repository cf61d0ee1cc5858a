//! Weighted distribution of new connections across available VPN paths.
//!
//! The decision space is the integer range `[0, 99]`. Each available path
//! gets a contiguous bucket sized by its share of the total weight; the
//! classifier draws a uniform number per new connection and looks it up.
//!
//! - **Reject**: no path is available
//! - **Single**: one path, no lookup needed
//! - **Weighted**: two or more paths, one bucket each
//!
//! The calculation is pure and integer-only, so the same input always yields
//! the same table.

use crate::nft::Mark;

/// Size of the decision range.
pub const RANGE: u32 = 100;

/// Last value of the decision range.
pub const RANGE_END: u8 = (RANGE - 1) as u8;

/// An available path as seen by the calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightedPath {
    pub mark: Mark,
    /// Effective weight, always at least 1
    pub weight: u32,
}

impl WeightedPath {
    /// Weights below 1 are floored to 1.
    pub fn new(mark: Mark, weight: i64) -> Self {
        let weight = u32::try_from(weight.max(1)).unwrap_or(u32::MAX);
        Self { mark, weight }
    }
}

/// Inclusive sub-range of `[0, 99]` assigned to one mark.
///
/// `start > end` denotes a zero-width bucket: the path is available but its
/// share rounded down to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub start: u8,
    pub end: u8,
    pub mark: Mark,
}

impl Bucket {
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, n: u8) -> bool {
        self.start <= n && n <= self.end
    }
}

/// Ordered, contiguous buckets covering `[0, 99]` exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionTable {
    buckets: Vec<Bucket>,
}

impl DistributionTable {
    /// Bucket boundaries follow the cumulative weight, with the last bucket
    /// stretched to 99 to absorb rounding.
    fn compute(paths: &[WeightedPath]) -> Self {
        let total: u64 = paths.iter().map(|p| u64::from(p.weight)).sum();
        let mut buckets = Vec::with_capacity(paths.len());
        let mut cumulative: u64 = 0;
        let mut next_start: u32 = 0;

        for (i, path) in paths.iter().enumerate() {
            cumulative += u64::from(path.weight);
            let end = if i + 1 == paths.len() {
                u32::from(RANGE_END)
            } else {
                (cumulative * u64::from(RANGE) / total) as u32
            };
            // A zero-width bucket after 99 still starts at 100.
            let start = next_start.min(RANGE);
            buckets.push(Bucket {
                start: start as u8,
                end: end as u8,
                mark: path.mark,
            });
            next_start = next_start.max(end + 1);
        }

        Self { buckets }
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Mark selected by draw `n`, or `None` when `n` is outside the range.
    pub fn lookup(&self, n: u8) -> Option<Mark> {
        self.buckets.iter().find(|b| b.contains(n)).map(|b| b.mark)
    }
}

/// Outcome of one distribution pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Distribution {
    Reject,
    Single(Mark),
    Weighted(DistributionTable),
}

impl Distribution {
    /// Compute the distribution for the available paths, in the order given.
    pub fn compute(paths: &[WeightedPath]) -> Self {
        match paths {
            [] => Self::Reject,
            [only] => Self::Single(only.mark),
            _ => Self::Weighted(DistributionTable::compute(paths)),
        }
    }

    /// Mark a new connection would receive for draw `n`.
    pub fn assign(&self, n: u8) -> Option<Mark> {
        match self {
            Self::Reject => None,
            Self::Single(mark) => Some(*mark),
            Self::Weighted(table) => table.lookup(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(v: u32) -> Mark {
        Mark::new(v).unwrap()
    }

    fn paths(weights: &[i64]) -> Vec<WeightedPath> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| WeightedPath::new(mark(i as u32 + 1), *w))
            .collect()
    }

    fn table(weights: &[i64]) -> DistributionTable {
        match Distribution::compute(&paths(weights)) {
            Distribution::Weighted(t) => t,
            other => panic!("expected weighted distribution, got {other:?}"),
        }
    }

    fn assert_covers_range(t: &DistributionTable) {
        let mut expected_start = 0u32;
        for b in t.buckets() {
            assert_eq!(u32::from(b.start), expected_start, "buckets must be contiguous");
            if !b.is_empty() {
                expected_start = u32::from(b.end) + 1;
            }
        }
        assert_eq!(expected_start, RANGE, "buckets must end at 99");

        for n in 0..=RANGE_END {
            let hits = t.buckets().iter().filter(|b| b.contains(n)).count();
            assert_eq!(hits, 1, "value {n} must be covered exactly once");
        }
    }

    #[test]
    fn test_no_paths_rejects() {
        assert_eq!(Distribution::compute(&[]), Distribution::Reject);
        assert_eq!(Distribution::Reject.assign(10), None);
    }

    #[test]
    fn test_single_path_marks_unconditionally() {
        let dist = Distribution::compute(&paths(&[7]));
        assert_eq!(dist, Distribution::Single(mark(1)));
        assert_eq!(dist.assign(0), Some(mark(1)));
        assert_eq!(dist.assign(99), Some(mark(1)));
    }

    #[test]
    fn test_two_equal_weights() {
        let t = table(&[1, 1]);
        assert_eq!(
            t.buckets(),
            &[
                Bucket { start: 0, end: 50, mark: mark(1) },
                Bucket { start: 51, end: 99, mark: mark(2) },
            ]
        );
        assert_covers_range(&t);
    }

    #[test]
    fn test_three_equal_weights() {
        let t = table(&[1, 1, 1]);
        let ranges: Vec<(u8, u8)> = t.buckets().iter().map(|b| (b.start, b.end)).collect();
        assert_eq!(ranges, vec![(0, 33), (34, 66), (67, 99)]);
        assert_covers_range(&t);
    }

    #[test]
    fn test_weights_are_proportional() {
        let t = table(&[3, 1]);
        let ranges: Vec<(u8, u8)> = t.buckets().iter().map(|b| (b.start, b.end)).collect();
        assert_eq!(ranges, vec![(0, 75), (76, 99)]);
        assert_covers_range(&t);
    }

    #[test]
    fn test_non_positive_weight_floors_to_one() {
        assert_eq!(table(&[0, -5]), table(&[1, 1]));
        assert_eq!(WeightedPath::new(mark(1), i64::MIN).weight, 1);
    }

    #[test]
    fn test_zero_width_bucket_keeps_contiguity() {
        let t = table(&[1, 1, 1000]);
        let b = t.buckets();
        assert_eq!((b[0].start, b[0].end), (0, 0));
        assert!(b[1].is_empty());
        assert_eq!(b[1].start, 1);
        assert_eq!((b[2].start, b[2].end), (1, 99));
        assert_covers_range(&t);
    }

    #[test]
    fn test_heavy_first_path_leaves_last_zero_width() {
        let t = table(&[1000, 1]);
        let b = t.buckets();
        assert_eq!((b[0].start, b[0].end), (0, 99));
        assert!(b[1].is_empty());
        assert_covers_range(&t);
        assert_eq!(t.lookup(99), Some(mark(1)));
    }

    #[test]
    fn test_coverage_over_many_weight_sets() {
        let sets: &[&[i64]] = &[
            &[1, 2],
            &[5, 5, 5, 5],
            &[1, 2, 3, 4, 5, 6, 7],
            &[99, 1, 1],
            &[1; 150],
            &[10, 0, 3, 7],
        ];
        for weights in sets {
            assert_covers_range(&table(weights));
        }
    }

    #[test]
    fn test_deterministic() {
        let weights = [4, 9, 2, 2];
        assert_eq!(table(&weights), table(&weights));
    }
}
