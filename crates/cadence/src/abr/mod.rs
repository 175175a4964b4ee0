// Bitrate estimation and representation choice.

mod bandwidth;
mod ewma;
mod playback_quality;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::bookkeeper::SegmentBookkeeper;
use crate::config::AbrConfig;
use crate::manifest::{Adaptation, MediaType, Representation, RepresentationKey};
use crate::surface::PlaybackSnapshot;

pub use bandwidth::BandwidthEstimator;
pub use playback_quality::{PlaybackQualityEstimator, QualityMap};

/// Combines playback quality, bandwidth and manual locks into one choice per adaptation.
#[derive(Debug)]
pub struct AbrManager {
    config: AbrConfig,
    quality: PlaybackQualityEstimator,
    bandwidth: BandwidthEstimator,
    manual: HashMap<MediaType, u64>,
    /// Last quality map returned by `on_tick`; choices only see published values.
    published: QualityMap,
}

impl AbrManager {
    pub fn new(config: AbrConfig) -> Self {
        Self {
            quality: PlaybackQualityEstimator::new(&config),
            bandwidth: BandwidthEstimator::new(&config),
            manual: HashMap::new(),
            published: QualityMap::new(),
            config,
        }
    }

    /// Starts reporting quality for every representation of `adaptation`.
    pub fn track(&mut self, period_id: &str, adaptation: &Adaptation) {
        self.quality.track(
            adaptation
                .representations()
                .iter()
                .map(|r| RepresentationKey::new(period_id, adaptation.id(), r.id())),
        );
    }

    pub fn retain_periods(&mut self, keep: impl FnMut(&str) -> bool) {
        self.quality.retain_periods(keep);
    }

    /// Feeds one clock tick to the playback quality estimator. Returns the
    /// new quality map when it changed, which is also when choices may change.
    pub fn on_tick(
        &mut self,
        now: Instant,
        snapshot: &PlaybackSnapshot,
        video: Option<&SegmentBookkeeper>,
    ) -> Option<QualityMap> {
        let map = self.quality.on_tick(now, snapshot, video)?;
        self.published.clone_from(&map);
        Some(map)
    }

    pub fn add_bandwidth_sample(&mut self, bytes: u64, duration: Duration) {
        self.bandwidth.add_sample(bytes, duration);
    }

    pub fn bandwidth_estimate(&self) -> Option<u64> {
        self.bandwidth.estimate_bps()
    }

    /// Published quality of a representation; 1.0 until it was sampled.
    pub fn quality(&self, key: &RepresentationKey) -> f64 {
        self.published.get(key).copied().unwrap_or(1.0)
    }

    /// Locks (or with `None` unlocks) the bitrate of a media type. Returns
    /// whether the lock changed.
    pub fn set_manual_bitrate(&mut self, media_type: MediaType, bitrate: Option<u64>) -> bool {
        let previous = match bitrate {
            Some(b) => self.manual.insert(media_type, b),
            None => self.manual.remove(&media_type),
        };
        previous != bitrate
    }

    pub fn manual_bitrate(&self, media_type: MediaType) -> Option<u64> {
        self.manual.get(&media_type).copied()
    }

    /// Picks the representation to load for `adaptation`.
    ///
    /// A manual lock selects the highest representation at or below it. Otherwise
    /// representations playing below `min_playback_quality` are avoided and the
    /// highest one fitting the bandwidth budget wins, falling back to the lowest.
    /// `max_bitrate` caps every choice.
    pub fn choose(&self, period_id: &str, adaptation: &Adaptation) -> Option<Arc<Representation>> {
        let representations = adaptation.representations();
        let lowest = representations.first()?;

        let mut capped: Vec<&Arc<Representation>> = representations
            .iter()
            .filter(|r| self.config.max_bitrate.is_none_or(|max| r.bitrate() <= max))
            .collect();
        if capped.is_empty() {
            capped.push(lowest);
        }

        if let Some(lock) = self.manual_bitrate(adaptation.media_type()) {
            let chosen = capped
                .iter()
                .rev()
                .find(|r| r.bitrate() <= lock)
                .copied()
                .unwrap_or(capped[0]);
            return Some(Arc::clone(chosen));
        }

        let mut candidates: Vec<&Arc<Representation>> = capped
            .iter()
            .copied()
            .filter(|r| {
                let key = RepresentationKey::new(period_id, adaptation.id(), r.id());
                self.quality(&key) >= self.config.min_playback_quality
            })
            .collect();
        if candidates.is_empty() {
            candidates = capped;
        }

        let ceiling = match self.bandwidth.estimate_bps() {
            Some(bps) => bps as f64 * self.config.bandwidth_safety_factor,
            None => self.config.initial_bitrate as f64,
        };
        let chosen = candidates
            .iter()
            .rev()
            .find(|r| r.bitrate() as f64 <= ceiling)
            .copied()
            .unwrap_or(candidates[0]);

        debug!(
            period_id,
            adaptation_id = adaptation.id(),
            representation_id = chosen.id(),
            bitrate = chosen.bitrate(),
            ceiling,
            "Representation chosen"
        );
        Some(Arc::clone(chosen))
    }
}
