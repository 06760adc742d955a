use crate::numbers::Amount;

pub type BucketIndex = usize;

/// Partitions the balance space into 63 logarithmic bands used for election
/// prioritization: one bucket for dust below 2^79, log-spaced bands up to
/// 2^120, and a final bucket for everything above.
pub struct Bucketing {
    minimums: Vec<u128>,
    indices: Vec<BucketIndex>,
}

impl Bucketing {
    pub fn new() -> Self {
        let mut minimums = Vec::new();
        minimums.push(0);

        let mut build_region = |begin: u128, end: u128, count: usize| {
            let width = (end - begin) / count as u128;
            for i in 0..count {
                minimums.push(begin + i as u128 * width);
            }
        };

        build_region(1u128 << 79, 1 << 88, 1);
        build_region(1u128 << 88, 1 << 92, 2);
        build_region(1u128 << 92, 1 << 96, 4);
        build_region(1u128 << 96, 1 << 100, 8);
        build_region(1u128 << 100, 1 << 104, 16);
        build_region(1u128 << 104, 1 << 108, 16);
        build_region(1u128 << 108, 1 << 112, 8);
        build_region(1u128 << 112, 1 << 116, 4);
        build_region(1u128 << 116, 1 << 120, 2);
        minimums.push(1u128 << 120);

        let indices = (0..minimums.len()).collect();
        Self { minimums, indices }
    }

    /// Largest index whose minimum does not exceed `balance`.
    pub fn bucket_index(&self, balance: Amount) -> BucketIndex {
        debug_assert!(!self.minimums.is_empty());
        let value = balance.number();
        // There is always a bucket with a zero minimum
        self.minimums.partition_point(|minimum| *minimum <= value) - 1
    }

    pub fn bucket_indices(&self) -> &[BucketIndex] {
        &self.indices
    }

    pub fn size(&self) -> usize {
        self.minimums.len()
    }
}

impl Default for Bucketing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numbers::{KNANO_RATIO, NANO_RATIO, RAW_RATIO};

    #[test]
    fn construction() {
        let bucketing = Bucketing::new();
        assert_eq!(bucketing.size(), 63);
    }

    #[test]
    fn zero_index() {
        assert_eq!(Bucketing::new().bucket_index(Amount::ZERO), 0);
    }

    #[test]
    fn raw_index() {
        assert_eq!(Bucketing::new().bucket_index(Amount::raw(RAW_RATIO)), 0);
    }

    #[test]
    fn nano_index() {
        assert_eq!(Bucketing::new().bucket_index(Amount::raw(NANO_RATIO)), 14);
    }

    #[test]
    fn knano_index() {
        assert_eq!(Bucketing::new().bucket_index(Amount::raw(KNANO_RATIO)), 49);
    }

    #[test]
    fn max_index() {
        assert_eq!(Bucketing::new().bucket_index(Amount::MAX), 62);
    }

    #[test]
    fn indices_strictly_ascending() {
        let bucketing = Bucketing::new();
        let indices = bucketing.bucket_indices();
        assert_eq!(indices.len(), 63);
        assert_eq!(indices.len(), bucketing.size());
        assert!(indices.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn minimums_monotone() {
        let bucketing = Bucketing::new();
        // Every bucket boundary maps back to its own bucket
        for index in bucketing.bucket_indices() {
            let minimum = bucketing.minimums[*index];
            assert_eq!(bucketing.bucket_index(Amount::raw(minimum)), *index);
        }
    }
}
