use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use super::adaptation::Adaptation;
use super::parsed::ParsedPeriod;
use super::{CodecSupport, MediaType, TIME_EPSILON};
use crate::error::EngineError;

/// A contiguous time slice of the presentation with its own set of tracks.
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    id: String,
    start: f64,
    duration: Option<f64>,
    adaptations: BTreeMap<MediaType, Vec<Arc<Adaptation>>>,
}

impl Period {
    /// Builds a period, collecting recoverable problems into `warnings`.
    ///
    /// Fails when no video or audio adaptation survives codec filtering.
    pub(crate) fn from_parsed(
        parsed: ParsedPeriod,
        codecs: &dyn CodecSupport,
        warnings: &mut Vec<EngineError>,
    ) -> Result<Self, EngineError> {
        if !parsed.start.is_finite() || parsed.start < 0.0 {
            return Err(EngineError::manifest_parse(format!(
                "period `{}` has an invalid start {}",
                parsed.id, parsed.start
            )));
        }

        let mut adaptations: BTreeMap<MediaType, Vec<Arc<Adaptation>>> = BTreeMap::new();
        for parsed_adaptation in parsed.adaptations {
            match Adaptation::from_parsed(parsed_adaptation, &parsed.id, codecs) {
                Ok(Some(adaptation)) => adaptations
                    .entry(adaptation.media_type())
                    .or_default()
                    .push(Arc::new(adaptation)),
                Ok(None) => {}
                Err(err) => {
                    warn!(period_id = %parsed.id, error = %err, "Dropping adaptation");
                    warnings.push(err);
                }
            }
        }

        let playable = adaptations.contains_key(&MediaType::Video)
            || adaptations.contains_key(&MediaType::Audio);
        if !playable {
            return Err(EngineError::NoPlayableAdaptation {
                period_id: parsed.id,
            });
        }

        Ok(Self {
            id: parsed.id,
            start: parsed.start,
            duration: parsed.duration.filter(|d| d.is_finite() && *d >= 0.0),
            adaptations,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// `None` for an open period.
    pub fn end(&self) -> Option<f64> {
        self.duration.map(|d| self.start + d)
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && self.end().is_none_or(|end| time < end)
    }

    pub fn adaptations_for_type(&self, media_type: MediaType) -> &[Arc<Adaptation>] {
        self.adaptations
            .get(&media_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn adaptation(&self, id: &str) -> Option<&Arc<Adaptation>> {
        self.adaptations.values().flatten().find(|a| a.id() == id)
    }

    /// Media types with at least one adaptation.
    pub fn media_types(&self) -> impl Iterator<Item = MediaType> + '_ {
        self.adaptations.keys().copied()
    }

    /// Largest end of any segment index, used to close a static period without duration.
    pub(crate) fn indexed_end(&self) -> Option<f64> {
        self.adaptations
            .values()
            .flatten()
            .flat_map(|a| a.representations())
            .filter_map(|r| r.index().last_position())
            .reduce(f64::max)
    }

    pub(crate) fn set_duration(&mut self, duration: f64) {
        self.duration = Some(duration.max(0.0));
    }

    pub(crate) fn ends_before(&self, other: &Period) -> bool {
        self.end()
            .is_some_and(|end| end <= other.start + TIME_EPSILON)
    }

    /// Rebuilds this period from a refreshed one with the same id.
    pub(crate) fn merged_with(&self, newer: &Period) -> Period {
        let adaptations = newer
            .adaptations
            .iter()
            .map(|(media_type, fresh_list)| {
                let merged = fresh_list
                    .iter()
                    .map(|fresh| match self.adaptation(fresh.id()) {
                        Some(old) if old == fresh => Arc::clone(old),
                        Some(old) => Arc::new(old.merged_with(fresh)),
                        None => Arc::clone(fresh),
                    })
                    .collect();
                (*media_type, merged)
            })
            .collect();
        Period {
            adaptations,
            ..newer.clone()
        }
    }
}
