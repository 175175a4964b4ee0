use url::Url;

use super::TIME_EPSILON;
use super::parsed::{ParsedSegment, ParsedSegmentIndex};
use crate::error::EngineError;

/// One addressable piece of media.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Start time in seconds.
    pub time: f64,
    /// Duration in seconds; zero for initialization segments.
    pub duration: f64,
    /// URL as written in the manifest, possibly relative to it.
    pub url: String,
    /// Inclusive byte range within `url`.
    pub byte_range: Option<(u64, u64)>,
    pub is_init: bool,
}

impl Segment {
    fn from_parsed(parsed: ParsedSegment, is_init: bool) -> Self {
        Self {
            time: parsed.time,
            duration: if is_init { 0.0 } else { parsed.duration },
            url: parsed.url,
            byte_range: parsed.byte_range,
            is_init,
        }
    }

    pub fn end(&self) -> f64 {
        self.time + self.duration
    }

    /// Resolves the segment URL against the manifest URL.
    pub fn resolve_url(&self, base: &Url) -> Result<Url, EngineError> {
        base.join(&self.url)
            .map_err(|e| EngineError::invalid_url(&self.url, e.to_string()))
    }
}

/// Ordered list of the media segments of a representation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentIndex {
    init: Option<Segment>,
    segments: Vec<Segment>,
    is_finished: bool,
}

impl SegmentIndex {
    pub fn new(init: Option<Segment>, mut segments: Vec<Segment>, is_finished: bool) -> Self {
        segments.retain(|s| s.duration > 0.0 && s.time.is_finite());
        segments.sort_by(|a, b| a.time.total_cmp(&b.time));
        // A repeated start time keeps the last declaration.
        segments.dedup_by(|later, earlier| {
            if (later.time - earlier.time).abs() < TIME_EPSILON {
                std::mem::swap(later, earlier);
                true
            } else {
                false
            }
        });
        Self {
            init,
            segments,
            is_finished,
        }
    }

    pub(crate) fn from_parsed(parsed: ParsedSegmentIndex) -> Self {
        let init = parsed.init.map(|s| Segment::from_parsed(s, true));
        let segments = parsed
            .segments
            .into_iter()
            .map(|s| Segment::from_parsed(s, false))
            .collect();
        Self::new(init, segments, parsed.is_finished)
    }

    pub fn init_segment(&self) -> Option<&Segment> {
        self.init.as_ref()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// False while the index may still grow on a manifest refresh.
    pub fn is_finished(&self) -> bool {
        self.is_finished
    }

    pub fn first_position(&self) -> Option<f64> {
        self.segments.first().map(|s| s.time)
    }

    /// End of the last available segment.
    pub fn last_position(&self) -> Option<f64> {
        self.segments.last().map(Segment::end)
    }

    /// Segments intersecting `[start, end)`, in time order.
    pub fn segments_between(&self, start: f64, end: f64) -> impl Iterator<Item = &Segment> + '_ {
        let first = self
            .segments
            .partition_point(|s| s.end() <= start + TIME_EPSILON);
        self.segments[first..]
            .iter()
            .take_while(move |s| s.time < end - TIME_EPSILON)
    }

    /// The segment containing `time`, if any.
    pub fn segment_at(&self, time: f64) -> Option<&Segment> {
        self.segments_between(time, time + 2.0 * TIME_EPSILON)
            .find(|s| s.time <= time + TIME_EPSILON)
    }

    /// When `time` falls in a hole of the index, the start of the next available segment.
    ///
    /// Positions past the last segment are not holes: the index may simply not
    /// have been refreshed yet.
    pub fn hole_at(&self, time: f64) -> Option<f64> {
        if self.segment_at(time).is_some() {
            return None;
        }
        self.segments
            .iter()
            .find(|s| s.time > time)
            .map(|s| s.time)
    }

    /// Builds the index resulting from a refresh: `newer` wins, and older segments
    /// that end before its first segment are kept so already-known history survives.
    pub fn merged_with(&self, newer: &SegmentIndex) -> SegmentIndex {
        let mut segments: Vec<Segment> = match newer.first_position() {
            Some(cut) => self
                .segments
                .iter()
                .filter(|s| s.end() <= cut + TIME_EPSILON)
                .cloned()
                .collect(),
            None => self.segments.clone(),
        };
        segments.extend(newer.segments.iter().cloned());
        SegmentIndex {
            init: newer.init.clone().or_else(|| self.init.clone()),
            segments,
            is_finished: newer.is_finished,
        }
    }
}
