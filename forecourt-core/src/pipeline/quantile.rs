//! Streaming quantile estimation for the statistics rollups.
//!
//! Daily statistics ask for four percentile points per group. Holding
//! every reported price of a day in memory per group is wasteful at
//! fleet scale, so groups accumulate into a bounded sketch instead:
//! values buffer until the buffer fills, then collapse into at most
//! `capacity` weight-balanced centroids. Queries interpolate on the
//! centroid midpoints, which keeps results exact while the value count
//! stays within capacity and monotone in `q` always.

/// Default number of retained centroids.
pub const DEFAULT_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
pub struct QuantileSketch {
    capacity: usize,
    /// Compressed (value, weight) pairs, sorted by value.
    centroids: Vec<(f64, u64)>,
    pending: Vec<f64>,
    count: u64,
}

impl Default for QuantileSketch {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl QuantileSketch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        QuantileSketch {
            capacity: capacity.max(8),
            centroids: Vec::new(),
            pending: Vec::new(),
            count: 0,
        }
    }

    /// Adds one observation. Non-finite values are ignored.
    pub fn insert(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.pending.push(value);
        self.count += 1;
        if self.pending.len() >= self.capacity {
            self.compress();
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Estimates the `q`-quantile (`0.0 ..= 1.0`), or `None` when no
    /// values have been observed.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        let merged = self.merged_view();
        if merged.is_empty() {
            return None;
        }
        let total: u64 = merged.iter().map(|&(_, w)| w).sum();
        let target = q.clamp(0.0, 1.0) * (total - 1) as f64;

        // Each centroid sits at the midpoint of the rank range its
        // weight covers; interpolate between neighbouring midpoints.
        let mut before: Option<(f64, f64)> = None;
        let mut cumulative = 0u64;
        for &(value, weight) in &merged {
            let midpoint = cumulative as f64 + (weight - 1) as f64 / 2.0;
            if target <= midpoint {
                return Some(match before {
                    None => value,
                    Some((prev_mid, prev_value)) => {
                        let span = midpoint - prev_mid;
                        if span <= 0.0 {
                            value
                        } else {
                            prev_value + (value - prev_value) * (target - prev_mid) / span
                        }
                    }
                });
            }
            before = Some((midpoint, value));
            cumulative += weight;
        }
        merged.last().map(|&(value, _)| value)
    }

    /// Folds the pending buffer into the centroid list and rebalances
    /// down to at most `capacity` centroids.
    fn compress(&mut self) {
        let mut merged = self.merged_view();
        self.pending.clear();
        if merged.len() <= self.capacity {
            self.centroids = merged;
            return;
        }

        let total: u64 = merged.iter().map(|&(_, w)| w).sum();
        let per_bucket = total.div_ceil(self.capacity as u64);
        let mut compressed: Vec<(f64, u64)> = Vec::with_capacity(self.capacity);
        let mut bucket_sum = 0.0;
        let mut bucket_weight = 0u64;
        for (value, weight) in merged.drain(..) {
            bucket_sum += value * weight as f64;
            bucket_weight += weight;
            if bucket_weight >= per_bucket {
                compressed.push((bucket_sum / bucket_weight as f64, bucket_weight));
                bucket_sum = 0.0;
                bucket_weight = 0;
            }
        }
        if bucket_weight > 0 {
            compressed.push((bucket_sum / bucket_weight as f64, bucket_weight));
        }
        self.centroids = compressed;
    }

    fn merged_view(&self) -> Vec<(f64, u64)> {
        let mut merged = self.centroids.clone();
        merged.extend(self.pending.iter().map(|&v| (v, 1)));
        merged.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn empty_sketch_has_no_quantiles() {
        let sketch = QuantileSketch::new();
        assert!(sketch.is_empty());
        assert_eq!(sketch.quantile(0.5), None);
    }

    #[test]
    fn small_inputs_are_exact_order_statistics() {
        let mut sketch = QuantileSketch::new();
        for v in [3.0, 1.0, 5.0, 2.0, 4.0] {
            sketch.insert(v);
        }
        assert_eq!(sketch.quantile(0.0), Some(1.0));
        assert_eq!(sketch.quantile(0.5), Some(3.0));
        assert_eq!(sketch.quantile(1.0), Some(5.0));
    }

    #[test]
    fn interpolates_between_order_statistics() {
        let mut sketch = QuantileSketch::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            sketch.insert(v);
        }
        assert_eq!(sketch.quantile(0.5), Some(2.5));
    }

    #[test]
    fn single_value_answers_every_quantile() {
        let mut sketch = QuantileSketch::new();
        sketch.insert(1.569);
        for q in [0.0, 0.5, 0.9, 0.95, 0.99, 1.0] {
            assert_eq!(sketch.quantile(q), Some(1.569));
        }
    }

    #[test]
    fn compressed_sketch_stays_bounded_and_accurate() {
        let mut values: Vec<f64> = (0..10_000).map(|i| i as f64).collect();
        values.shuffle(&mut StdRng::seed_from_u64(7));

        let mut sketch = QuantileSketch::with_capacity(128);
        for v in values {
            sketch.insert(v);
        }
        assert_eq!(sketch.count(), 10_000);
        assert!(sketch.merged_view().len() <= 256);

        for (q, expected) in [(0.5, 4999.5), (0.9, 8999.1), (0.99, 9899.01)] {
            let got = sketch.quantile(q).unwrap();
            assert!(
                (got - expected).abs() < 100.0,
                "q{q}: got {got}, expected near {expected}"
            );
        }
    }

    #[test]
    fn quantiles_are_monotone_in_q() {
        let mut sketch = QuantileSketch::with_capacity(64);
        let mut rng = StdRng::seed_from_u64(42);
        let mut values: Vec<f64> = (0..5_000).map(|i| 1.0 + (i % 997) as f64 / 997.0).collect();
        values.shuffle(&mut rng);
        for v in values {
            sketch.insert(v);
        }
        let mut last = f64::NEG_INFINITY;
        for step in 0..=100 {
            let q = step as f64 / 100.0;
            let value = sketch.quantile(q).unwrap();
            assert!(value >= last, "quantile regressed at q={q}");
            last = value;
        }
    }
}
