// Playback quality estimation: how well each representation actually plays.
//
// Every clock tick, frame drops since the previous tick are attributed to the
// representation that was playing between the two positions and folded into
// a fast and a slow moving average. Representations not playing recover
// towards full quality so a bad sample does not ban them forever.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::time::Instant;
use tracing::trace;

use super::ewma::Ewma;
use crate::bookkeeper::SegmentBookkeeper;
use crate::config::AbrConfig;
use crate::manifest::RepresentationKey;
use crate::surface::PlaybackSnapshot;

/// Effective quality in [0, 1] per representation, rounded to two decimals.
pub type QualityMap = BTreeMap<RepresentationKey, f64>;

/// Positions moving faster than this multiple of wall-clock time are treated as seeks.
const MAX_PLAYBACK_SPEED: f64 = 8.0;

#[derive(Debug, Clone)]
struct QualityAverages {
    fast: Ewma,
    slow: Ewma,
}

impl QualityAverages {
    fn new(fast_half_life: f64, slow_half_life: f64) -> Self {
        Self {
            fast: Ewma::new(fast_half_life),
            slow: Ewma::new(slow_half_life),
        }
    }

    fn add_sample(&mut self, weight: f64, quality: f64) {
        self.fast.add_sample(weight, quality);
        self.slow.add_sample(weight, quality);
    }

    fn effective(&self) -> f64 {
        match (self.fast.estimate(), self.slow.estimate()) {
            (Some(fast), Some(slow)) => round_quality(fast.min(slow)),
            _ => 1.0,
        }
    }
}

fn round_quality(value: f64) -> f64 {
    ((value * 100.0).round() / 100.0).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy)]
struct TickSample {
    at: Instant,
    position: f64,
    decoded: u64,
    dropped: u64,
}

#[derive(Debug)]
pub struct PlaybackQualityEstimator {
    fast_half_life: f64,
    slow_half_life: f64,
    known: BTreeSet<RepresentationKey>,
    averages: HashMap<RepresentationKey, QualityAverages>,
    previous: Option<TickSample>,
    recorded_weight_sum: f64,
    recorded_weight_count: u32,
    emitted: Option<QualityMap>,
}

impl PlaybackQualityEstimator {
    pub fn new(config: &AbrConfig) -> Self {
        Self {
            fast_half_life: config.fast_quality_half_life,
            slow_half_life: config.slow_quality_half_life,
            known: BTreeSet::new(),
            averages: HashMap::new(),
            previous: None,
            recorded_weight_sum: 0.0,
            recorded_weight_count: 0,
            emitted: None,
        }
    }

    /// Registers representations whose quality should be reported.
    pub fn track(&mut self, keys: impl IntoIterator<Item = RepresentationKey>) {
        self.known.extend(keys);
    }

    /// Drops every representation of periods no longer in the manifest.
    pub fn retain_periods(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.known.retain(|k| keep(&k.period_id));
        self.averages.retain(|k, _| keep(&k.period_id));
    }

    /// Effective quality of a representation; 1.0 when it was never sampled.
    pub fn quality(&self, key: &RepresentationKey) -> f64 {
        self.averages
            .get(key)
            .map(QualityAverages::effective)
            .unwrap_or(1.0)
    }

    pub fn qualities(&self) -> QualityMap {
        self.known
            .iter()
            .chain(self.averages.keys())
            .map(|k| (k.clone(), self.quality(k)))
            .collect()
    }

    /// Feeds one clock tick. Returns the quality map when it differs from the
    /// last one returned.
    pub fn on_tick(
        &mut self,
        now: Instant,
        snapshot: &PlaybackSnapshot,
        video: Option<&SegmentBookkeeper>,
    ) -> Option<QualityMap> {
        if let Some(frames) = snapshot.frames {
            let current = TickSample {
                at: now,
                position: snapshot.position,
                decoded: frames.decoded,
                dropped: frames.dropped,
            };
            if let Some(previous) = self.previous.replace(current) {
                self.record(previous, current, video);
            }
        }

        let map = self.qualities();
        if self.emitted.as_ref() == Some(&map) {
            return None;
        }
        self.emitted = Some(map.clone());
        Some(map)
    }

    fn record(&mut self, previous: TickSample, current: TickSample, video: Option<&SegmentBookkeeper>) {
        let elapsed = current.at.saturating_duration_since(previous.at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let (Some(decoded), Some(dropped)) = (
            current.decoded.checked_sub(previous.decoded),
            current.dropped.checked_sub(previous.dropped),
        ) else {
            trace!("Frame counters went backwards, skipping quality sample");
            return;
        };
        if decoded == 0 {
            return;
        }
        let moved = current.position - previous.position;
        if moved < 0.0 || moved > elapsed * MAX_PLAYBACK_SPEED {
            trace!(moved, elapsed, "Position jumped, skipping quality sample");
            return;
        }

        let Some(bookkeeper) = video else {
            return;
        };
        let playing = match bookkeeper.representations_between(previous.position, current.position)[..] {
            [only] => only.clone(),
            [] => return,
            _ => {
                trace!("Several representations played since last tick, sample is inconclusive");
                return;
            }
        };

        let quality = 1.0 - (dropped as f64 / decoded as f64).min(1.0);

        if self.recorded_weight_count > 0 {
            let mean_weight = self.recorded_weight_sum / f64::from(self.recorded_weight_count);
            let others: Vec<RepresentationKey> = self
                .known
                .iter()
                .chain(self.averages.keys())
                .filter(|k| **k != playing)
                .cloned()
                .collect();
            for key in others {
                self.averages
                    .entry(key)
                    .or_insert_with(|| QualityAverages::new(self.fast_half_life, self.slow_half_life))
                    .add_sample(mean_weight, 1.0);
            }
        }

        self.averages
            .entry(playing.clone())
            .or_insert_with(|| QualityAverages::new(self.fast_half_life, self.slow_half_life))
            .add_sample(elapsed, quality);
        self.recorded_weight_sum += elapsed;
        self.recorded_weight_count = self.recorded_weight_count.saturating_add(1);
        self.known.insert(playing.clone());

        trace!(representation = %playing, quality, elapsed, "Recorded playback quality sample");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookkeeper::TimeRange;
    use crate::surface::{FrameCounters, ReadyState};
    use std::time::Duration;

    fn key(rep: &str) -> RepresentationKey {
        RepresentationKey::new("p0", "video", rep)
    }

    fn snapshot(position: f64, decoded: u64, dropped: u64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            position,
            ready_state: ReadyState::EnoughData,
            paused: false,
            frames: Some(FrameCounters { decoded, dropped }),
        }
    }

    struct Driver {
        estimator: PlaybackQualityEstimator,
        now: Instant,
        position: f64,
        decoded: u64,
        dropped: u64,
    }

    impl Driver {
        fn new() -> Self {
            let mut estimator = PlaybackQualityEstimator::new(&AbrConfig::default());
            estimator.track([key("lo"), key("hi")]);
            Self {
                estimator,
                now: Instant::now(),
                position: 0.0,
                decoded: 0,
                dropped: 0,
            }
        }

        /// One second of playback with `dropped` out of 25 frames lost.
        fn tick(&mut self, bookkeeper: &SegmentBookkeeper, dropped: u64) -> Option<QualityMap> {
            self.now += Duration::from_secs(1);
            self.position += 1.0;
            self.decoded += 25;
            self.dropped += dropped;
            self.estimator.on_tick(
                self.now,
                &snapshot(self.position, self.decoded, self.dropped),
                Some(bookkeeper),
            )
        }
    }

    fn single_rep_buffer(rep: &str) -> SegmentBookkeeper {
        let mut bk = SegmentBookkeeper::new();
        bk.insert(TimeRange::new(0.0, 1_000.0), key(rep), 1_000_000);
        bk
    }

    #[test]
    fn never_sampled_representations_are_perfect() {
        let mut driver = Driver::new();
        let map = driver
            .estimator
            .on_tick(driver.now, &snapshot(0.0, 0, 0), None)
            .unwrap();
        assert_eq!(map.get(&key("lo")), Some(&1.0));
        assert_eq!(map.get(&key("hi")), Some(&1.0));
    }

    #[test]
    fn constant_quality_converges() {
        let mut driver = Driver::new();
        let bk = single_rep_buffer("hi");
        driver.estimator.on_tick(driver.now, &snapshot(0.0, 0, 0), Some(&bk));
        for _ in 0..150 {
            // 5 of 25 frames dropped => quality 0.8
            driver.tick(&bk, 5);
        }
        assert!((driver.estimator.quality(&key("hi")) - 0.8).abs() <= 0.01);
        assert_eq!(driver.estimator.quality(&key("lo")), 1.0);
    }

    #[test]
    fn unobserved_representation_recovers_monotonically() {
        let mut driver = Driver::new();
        let hi = single_rep_buffer("hi");
        driver.estimator.on_tick(driver.now, &snapshot(0.0, 0, 0), Some(&hi));
        for _ in 0..30 {
            driver.tick(&hi, 20);
        }
        let degraded = driver.estimator.quality(&key("hi"));
        assert!(degraded < 0.5);

        let lo = single_rep_buffer("lo");
        let mut last = degraded;
        for _ in 0..200 {
            driver.tick(&lo, 0);
            let current = driver.estimator.quality(&key("hi"));
            assert!(current >= last, "{current} < {last}");
            last = current;
        }
        assert!(last > degraded);
    }

    #[test]
    fn mixed_representations_make_an_inconclusive_sample() {
        let mut driver = Driver::new();
        let mut bk = SegmentBookkeeper::new();
        bk.insert(TimeRange::new(0.0, 0.5), key("lo"), 500_000);
        bk.insert(TimeRange::new(0.5, 1.5), key("hi"), 1_000_000);
        bk.insert(TimeRange::new(1.5, 10.0), key("lo"), 500_000);
        driver.estimator.on_tick(driver.now, &snapshot(0.0, 0, 0), Some(&bk));

        driver.tick(&bk, 25);
        driver.tick(&bk, 25);
        assert_eq!(driver.estimator.quality(&key("lo")), 1.0);
        assert_eq!(driver.estimator.quality(&key("hi")), 1.0);
    }

    #[test]
    fn unchanged_map_is_not_reemitted() {
        let mut driver = Driver::new();
        let bk = single_rep_buffer("hi");
        assert!(driver.estimator.on_tick(driver.now, &snapshot(0.0, 0, 0), Some(&bk)).is_some());
        assert!(driver.tick(&bk, 0).is_none());
        assert!(driver.tick(&bk, 25).is_some());
    }
}
