use std::time::Duration;

use super::ewma::Ewma;
use crate::config::AbrConfig;

/// Download throughput estimator fed with segment responses.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    fast: Ewma,
    slow: Ewma,
    min_sample_bytes: u64,
    bytes_sampled: u64,
}

impl BandwidthEstimator {
    const MIN_DURATION_SECS: f64 = 0.0005;

    pub fn new(config: &AbrConfig) -> Self {
        Self {
            fast: Ewma::new(config.fast_bandwidth_half_life),
            slow: Ewma::new(config.slow_bandwidth_half_life),
            min_sample_bytes: config.min_bandwidth_sample_bytes,
            bytes_sampled: 0,
        }
    }

    /// Records a response of `bytes` that took `duration` to download.
    /// Responses too small to be meaningful are ignored.
    pub fn add_sample(&mut self, bytes: u64, duration: Duration) {
        if bytes < self.min_sample_bytes {
            return;
        }
        let secs = duration.as_secs_f64().max(Self::MIN_DURATION_SECS);
        let bps = bytes as f64 * 8.0 / secs;
        self.fast.add_sample(secs, bps);
        self.slow.add_sample(secs, bps);
        self.bytes_sampled = self.bytes_sampled.saturating_add(bytes);
    }

    /// Conservative estimate in bits per second.
    pub fn estimate_bps(&self) -> Option<u64> {
        let fast = self.fast.estimate()?;
        let slow = self.slow.estimate()?;
        let estimate = fast.min(slow);
        (estimate > 0.0).then(|| estimate.round() as u64)
    }

    pub fn bytes_sampled(&self) -> u64 {
        self.bytes_sampled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_responses_are_ignored() {
        let mut estimator = BandwidthEstimator::new(&AbrConfig::default());
        estimator.add_sample(1_000, Duration::from_millis(10));
        assert_eq!(estimator.estimate_bps(), None);
        assert_eq!(estimator.bytes_sampled(), 0);
    }

    #[test]
    fn steady_throughput_is_estimated() {
        let mut estimator = BandwidthEstimator::new(&AbrConfig::default());
        for _ in 0..10 {
            // 500 kB in 1 s => 4 Mbit/s
            estimator.add_sample(500_000, Duration::from_secs(1));
        }
        let estimate = estimator.estimate_bps().unwrap();
        assert!((3_990_000..=4_010_000).contains(&estimate), "{estimate}");
    }

    #[test]
    fn sudden_drop_is_followed_by_the_fast_average() {
        let mut estimator = BandwidthEstimator::new(&AbrConfig::default());
        for _ in 0..10 {
            estimator.add_sample(1_000_000, Duration::from_secs(1));
        }
        estimator.add_sample(100_000, Duration::from_secs(1));
        // min(fast, slow) reacts to the drop right away.
        assert!(estimator.estimate_bps().unwrap() < 7_000_000);
    }
}
