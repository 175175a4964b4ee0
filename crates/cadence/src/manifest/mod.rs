// Manifest Model: Period -> Adaptation -> Representation tree, lookups and
// merge-on-refresh.
//
// A manifest is immutable once built. Refreshes build a complete new tree,
// reusing the `Arc`s of untouched periods, and publish it in one swap.

mod adaptation;
pub mod parsed;
mod period;
mod representation;
mod segment_index;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::EngineError;

pub use adaptation::{Adaptation, normalize_language};
pub use parsed::ParsedManifest;
pub use period::Period;
pub use representation::Representation;
pub use segment_index::{Segment, SegmentIndex};

/// Tolerance used when comparing media times, in seconds.
pub(crate) const TIME_EPSILON: f64 = 1e-3;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Text,
    Image,
}

impl MediaType {
    pub const ALL: [MediaType; 4] = [
        MediaType::Video,
        MediaType::Audio,
        MediaType::Text,
        MediaType::Image,
    ];

    /// Video and audio are decoded by the playback surface itself and need
    /// their sinks before playback starts.
    pub fn is_native(self) -> bool {
        matches!(self, MediaType::Video | MediaType::Audio)
    }
}

/// Identity of a representation across the whole manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepresentationKey {
    pub period_id: String,
    pub adaptation_id: String,
    pub representation_id: String,
}

impl RepresentationKey {
    pub fn new(
        period_id: impl Into<String>,
        adaptation_id: impl Into<String>,
        representation_id: impl Into<String>,
    ) -> Self {
        Self {
            period_id: period_id.into(),
            adaptation_id: adaptation_id.into(),
            representation_id: representation_id.into(),
        }
    }
}

impl fmt::Display for RepresentationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.period_id, self.adaptation_id, self.representation_id
        )
    }
}

/// Tells which codecs the playback surface can decode.
#[cfg_attr(test, mockall::automock)]
pub trait CodecSupport: Send + Sync {
    fn is_supported(&self, mime_type: &str, codec: &str) -> bool;
}

/// Accepts every codec. Useful when the surface filters on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyCodec;

impl CodecSupport for AnyCodec {
    fn is_supported(&self, _mime_type: &str, _codec: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct Manifest {
    url: Url,
    periods: Vec<Arc<Period>>,
    is_dynamic: bool,
    minimum_update_period: Option<Duration>,
    fetched_at: DateTime<Utc>,
}

impl Manifest {
    /// Builds and validates a manifest. Recoverable problems (dropped
    /// adaptations) are returned alongside it.
    pub fn from_parsed(
        parsed: ParsedManifest,
        codecs: &dyn CodecSupport,
    ) -> Result<(Self, Vec<EngineError>), EngineError> {
        let url = Url::parse(&parsed.url).map_err(|e| {
            EngineError::manifest_parse(format!("invalid manifest URL `{}`: {e}", parsed.url))
        })?;
        if parsed.periods.is_empty() {
            return Err(EngineError::manifest_parse("manifest declares no period"));
        }

        let mut warnings = Vec::new();
        let mut periods = parsed
            .periods
            .into_iter()
            .map(|p| Period::from_parsed(p, codecs, &mut warnings))
            .collect::<Result<Vec<_>, _>>()?;
        periods.sort_by(|a, b| a.start().total_cmp(&b.start()));

        {
            let mut ids = HashSet::with_capacity(periods.len());
            if let Some(duplicate) = periods.iter().find(|p| !ids.insert(p.id())) {
                return Err(EngineError::manifest_parse(format!(
                    "period id `{}` is declared twice",
                    duplicate.id()
                )));
            }
        }

        for i in 1..periods.len() {
            let (before, after) = periods.split_at_mut(i);
            let previous = &mut before[i - 1];
            let current = &after[0];
            match previous.end() {
                None => previous.set_duration(current.start() - previous.start()),
                Some(end) if end > current.start() + TIME_EPSILON => {
                    return Err(EngineError::manifest_parse(format!(
                        "period `{}` overlaps period `{}`",
                        previous.id(),
                        current.id()
                    )));
                }
                Some(_) => {}
            }
        }

        if !parsed.is_dynamic
            && let Some(last) = periods.last_mut()
            && last.end().is_none()
            && let Some(end) = last.indexed_end()
        {
            let duration = end - last.start();
            last.set_duration(duration);
        }

        let minimum_update_period = parsed
            .minimum_update_period
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|e| {
                    EngineError::manifest_parse(format!("invalid minimum update period {secs}: {e}"))
                })
            })
            .transpose()?;

        let manifest = Self {
            url,
            periods: periods.into_iter().map(Arc::new).collect(),
            is_dynamic: parsed.is_dynamic,
            minimum_update_period,
            fetched_at: Utc::now(),
        };
        Ok((manifest, warnings))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn periods(&self) -> &[Arc<Period>] {
        &self.periods
    }

    pub fn period(&self, id: &str) -> Option<&Arc<Period>> {
        self.periods.iter().find(|p| p.id() == id)
    }

    /// The period with `start <= time < end`; open periods match any later time.
    pub fn period_for_time(&self, time: f64) -> Option<&Arc<Period>> {
        self.periods.iter().find(|p| p.contains(time))
    }

    /// First period starting after `time`.
    pub fn period_after(&self, time: f64) -> Option<&Arc<Period>> {
        self.periods.iter().find(|p| p.start() > time)
    }

    pub fn next_period(&self, period: &Period) -> Option<&Arc<Period>> {
        self.periods
            .iter()
            .find(|p| p.start() > period.start() && period.ends_before(p))
    }

    pub fn first_period(&self) -> Option<&Arc<Period>> {
        self.periods.first()
    }

    pub fn is_last_period(&self, period: &Period) -> bool {
        self.periods.last().is_some_and(|p| p.id() == period.id())
    }

    pub fn is_live(&self) -> bool {
        self.is_dynamic
    }

    pub fn minimum_update_period(&self) -> Option<Duration> {
        self.minimum_update_period
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// End of the last period, `None` when the presentation is unbounded.
    pub fn duration(&self) -> Option<f64> {
        if self.is_dynamic {
            return None;
        }
        self.periods.last().and_then(|p| p.end())
    }

    pub fn representation(&self, key: &RepresentationKey) -> Option<Arc<Representation>> {
        self.period(&key.period_id)?
            .adaptation(&key.adaptation_id)?
            .representation(&key.representation_id)
            .cloned()
    }

    /// Merges a refreshed manifest into this one.
    ///
    /// Periods are matched by id. Structurally unchanged periods keep their
    /// `Arc`, changed ones are rebuilt with merged segment indexes, new ones are
    /// taken as-is and periods missing from `newer` are dropped.
    pub fn merged_with(&self, newer: Manifest) -> Manifest {
        let periods = newer
            .periods
            .iter()
            .map(|fresh| match self.period(fresh.id()) {
                Some(old) if old == fresh => Arc::clone(old),
                Some(old) => {
                    let merged = old.merged_with(fresh);
                    if merged == **old {
                        Arc::clone(old)
                    } else {
                        Arc::new(merged)
                    }
                }
                None => Arc::clone(fresh),
            })
            .collect();
        Manifest { periods, ..newer }
    }
}

/// The manifest shared between the refresh cycle and its readers.
///
/// Readers take cheap snapshots; the refresh cycle publishes complete trees.
#[derive(Debug, Clone)]
pub struct SharedManifest {
    inner: Arc<RwLock<Arc<Manifest>>>,
}

impl SharedManifest {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(manifest))),
        }
    }

    pub fn snapshot(&self) -> Arc<Manifest> {
        Arc::clone(&self.inner.read())
    }

    /// Merges `newer` into the current manifest and publishes the result.
    pub fn update(&self, newer: Manifest) -> Arc<Manifest> {
        let mut guard = self.inner.write();
        let merged = Arc::new(guard.merged_with(newer));
        debug!(
            periods = merged.periods().len(),
            fetched_at = %merged.fetched_at(),
            "Publishing merged manifest"
        );
        *guard = Arc::clone(&merged);
        merged
    }
}
