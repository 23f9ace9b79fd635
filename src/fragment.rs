//! Online fragment-length model for paired-end mapping.
//!
//! Ring buffers of recent fragment lengths, mate orientations, and mate
//! directions feed periodic re-estimates of the mean, deviation, and
//! majority configuration. Until the first estimate lands, a hard cap
//! bounds what counts as a plausible pair.

use std::collections::VecDeque;
use std::f64::consts::PI;

use log::debug;

/// Running estimate of the fragment-length distribution.
#[derive(Clone, Debug)]
pub struct FragmentModel {
    lengths: VecDeque<i64>,
    orientations: VecDeque<bool>,
    directions: VecDeque<bool>,
    cache_size: usize,
    estimate_interval: usize,
    sigma: f64,
    since_last_estimate: usize,
    /// Cached statistics, refreshed every `estimate_interval` records.
    pub cached_mean: f64,
    pub cached_stdev: f64,
    /// Majority vote: mates on the same strand.
    pub cached_orientation: bool,
    /// Majority vote: mate lies downstream of the anchor.
    pub cached_direction: bool,
    /// `mean + sigma * stdev`; zero until the model has been estimated.
    pub fragment_size: i64,
}

impl FragmentModel {
    pub fn new(cache_size: usize, estimate_interval: usize, sigma: f64) -> FragmentModel {
        FragmentModel {
            lengths: VecDeque::with_capacity(cache_size),
            orientations: VecDeque::with_capacity(cache_size),
            directions: VecDeque::with_capacity(cache_size),
            cache_size: cache_size.max(1),
            estimate_interval: estimate_interval.max(1),
            sigma,
            since_last_estimate: 0,
            cached_mean: 0.0,
            cached_stdev: 0.0,
            cached_orientation: true,
            cached_direction: true,
            fragment_size: 0,
        }
    }

    pub fn is_learned(&self) -> bool {
        self.fragment_size > 0
    }

    pub fn sample_count(&self) -> usize {
        self.lengths.len()
    }

    /// Record one high-confidence pair observation.
    pub fn record(&mut self, length: i64, aln1_is_rev: bool, aln2_is_rev: bool) {
        let same_orientation = aln1_is_rev == aln2_is_rev;
        self.orientations.push_front(same_orientation);
        if self.orientations.len() > self.cache_size {
            self.orientations.pop_back();
        }
        // which way along the linear coordinate do we look for the mate,
        // relative to the anchor's strand
        let same_direction = if aln1_is_rev { length <= 0 } else { length >= 0 };
        self.directions.push_front(same_direction);
        if self.directions.len() > self.cache_size {
            self.directions.pop_back();
        }
        self.lengths.push_front(length.abs());
        if self.lengths.len() > self.cache_size {
            self.lengths.pop_back();
        }
        self.since_last_estimate += 1;
        if self.since_last_estimate > self.estimate_interval {
            self.reestimate();
            self.since_last_estimate = 1;
        }
    }

    /// Recompute the cached statistics from the buffers.
    pub fn reestimate(&mut self) {
        if self.lengths.is_empty() {
            return;
        }
        self.cached_mean = self.mean();
        self.cached_stdev = self.stdev();
        self.cached_orientation = majority(&self.orientations);
        self.cached_direction = majority(&self.directions);
        self.fragment_size = (self.cached_mean + self.sigma * self.cached_stdev).round() as i64;
        debug!(
            "fragment model: mean {:.2}, stdev {:.2}, same-orientation {}, forward {}, cap {}",
            self.cached_mean,
            self.cached_stdev,
            self.cached_orientation,
            self.cached_direction,
            self.fragment_size
        );
    }

    pub fn mean(&self) -> f64 {
        let sum: i64 = self.lengths.iter().sum();
        sum as f64 / self.lengths.len() as f64
    }

    pub fn stdev(&self) -> f64 {
        if self.lengths.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var: f64 =
            self.lengths.iter().map(|&l| (l as f64 - mean).powi(2)).sum::<f64>() / self.lengths.len() as f64;
        var.sqrt()
    }

    /// Density of the learned distribution at `length`.
    pub fn pdf(&self, length: f64) -> f64 {
        normal_pdf(length, self.cached_mean, self.cached_stdev.max(0.1))
    }
}

fn majority(values: &VecDeque<bool>) -> bool {
    let yes = values.iter().filter(|&&v| v).count();
    yes * 2 > values.len()
}

pub fn normal_pdf(x: f64, mean: f64, stdev: f64) -> f64 {
    let z = (x - mean) / stdev;
    (-0.5 * z * z).exp() / (stdev * (2.0 * PI).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlearned_until_first_estimate() {
        let mut model = FragmentModel::new(1000, 10, 10.0);
        assert!(!model.is_learned());
        for _ in 0..10 {
            model.record(100, false, true);
            assert!(!model.is_learned());
        }
        model.record(100, false, true);
        assert!(model.is_learned());
        assert_eq!(model.fragment_size, 100);
        assert!((model.cached_mean - 100.0).abs() < 1e-9);
    }

    #[test]
    fn fragment_size_is_mean_plus_sigma_stdev() {
        let mut model = FragmentModel::new(1000, 2, 2.0);
        for &len in &[90i64, 110, 90, 110, 90, 110] {
            model.record(len, false, true);
        }
        model.reestimate();
        let expect = model.cached_mean + 2.0 * model.cached_stdev;
        assert_eq!(model.fragment_size, expect.round() as i64);
        assert!((model.cached_mean - 100.0).abs() < 1e-9);
        assert!((model.cached_stdev - 10.0).abs() < 1e-9);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut model = FragmentModel::new(4, 1, 10.0);
        for i in 0..100 {
            model.record(i, false, true);
        }
        assert_eq!(model.sample_count(), 4);
    }

    #[test]
    fn orientation_and_direction_majorities() {
        let mut model = FragmentModel::new(100, 1, 10.0);
        // opposite strands, mate downstream of a forward anchor
        for _ in 0..5 {
            model.record(150, false, true);
        }
        model.record(-150, true, false);
        model.reestimate();
        assert!(!model.cached_orientation);
        assert!(model.cached_direction);
    }

    #[test]
    fn pdf_peaks_at_the_mean() {
        let mut model = FragmentModel::new(100, 1, 10.0);
        for &len in &[95i64, 100, 105, 100] {
            model.record(len, false, true);
        }
        model.reestimate();
        assert!(model.pdf(model.cached_mean) > model.pdf(model.cached_mean + 50.0));
    }
}
