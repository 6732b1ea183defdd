//! Cumulative-weight tables for weighted random selection.

use rand::Rng;

/// Weighted selection over a fixed list of weights.
///
/// Holds the running sum of the weights so a draw is one uniform sample plus
/// a binary search. Zero-weight entries occupy an empty interval and are never
/// returned while the total is positive.
#[derive(Debug, Clone, Default)]
pub struct CumulativeWeights {
    cumulative: Vec<f64>,
    total: f64,
}

impl CumulativeWeights {
    /// Build the table. Callers validate weights (finite, >= 0) beforehand.
    pub fn new(weights: impl IntoIterator<Item = f64>) -> Self {
        let mut cumulative = Vec::new();
        let mut sum = 0.0;
        for w in weights {
            sum += w;
            cumulative.push(sum);
        }

        Self {
            cumulative,
            total: sum,
        }
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.cumulative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cumulative.is_empty()
    }

    /// Draw an index proportionally to its weight. `None` when the table is
    /// empty or every weight is zero.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        if self.cumulative.is_empty() || self.total <= 0.0 {
            return None;
        }

        let r = rng.gen::<f64>() * self.total;
        Some(self.index_for(r))
    }

    /// First index whose cumulative weight is strictly greater than `r`.
    /// Using a strict bound skips zero-weight entries, whose cumulative value
    /// equals their predecessor's.
    fn index_for(&self, r: f64) -> usize {
        let idx = self.cumulative.partition_point(|&cum| cum <= r);
        // r == total can only come from float rounding; clamp to the last
        // positive entry.
        if idx >= self.cumulative.len() {
            self.last_positive()
        } else {
            idx
        }
    }

    fn last_positive(&self) -> usize {
        let mut prev = 0.0;
        let mut last = 0;
        for (i, &cum) in self.cumulative.iter().enumerate() {
            if cum > prev {
                last = i;
            }
            prev = cum;
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_index_for_boundaries() {
        let table = CumulativeWeights::new([1.0, 0.0, 3.0]);
        assert_eq!(table.total(), 4.0);
        assert_eq!(table.index_for(0.0), 0);
        assert_eq!(table.index_for(0.999), 0);
        // The zero-weight entry shares the boundary at 1.0 and is skipped.
        assert_eq!(table.index_for(1.0), 2);
        assert_eq!(table.index_for(3.999), 2);
        assert_eq!(table.index_for(4.0), 2);
    }

    #[test]
    fn test_empty_and_zero_tables() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(CumulativeWeights::new([]).sample(&mut rng), None);
        assert_eq!(CumulativeWeights::new([0.0, 0.0]).sample(&mut rng), None);
    }

    #[test]
    fn test_sample_proportions() {
        let table = CumulativeWeights::new([10.0, 3.0, 2.0]);
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0usize; 3];
        let draws = 60_000;
        for _ in 0..draws {
            counts[table.sample(&mut rng).unwrap()] += 1;
        }

        let expected = [10.0 / 15.0, 3.0 / 15.0, 2.0 / 15.0];
        for (count, p) in counts.iter().zip(expected) {
            let observed = *count as f64 / draws as f64;
            assert!((observed - p).abs() < 0.01, "observed {observed}, expected {p}");
        }
    }
}
