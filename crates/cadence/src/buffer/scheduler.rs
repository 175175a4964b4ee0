// Segment Scheduler: decides the next segment to load for one (period, media type).
//
// Keeps at most one request in flight, fetches the initialization segment of
// a representation before its media, evicts content outside the buffer goals
// and reports gaps, exhausted live indexes and completion.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{BufferEvent, SegmentRequest};
use crate::bookkeeper::{SegmentBookkeeper, TimeRange};
use crate::config::{BitrateSwitchingMode, BufferGoals};
use crate::manifest::{
    Adaptation, MediaType, Period, Representation, RepresentationKey, Segment, TIME_EPSILON,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// A request is in flight or was just issued.
    Filling,
    /// Everything wanted is buffered.
    Full,
    /// A live index ran out; waiting for a manifest refresh.
    AwaitingManifest,
    /// The period is buffered up to its end.
    Complete,
}

#[derive(Debug)]
pub struct Evaluation {
    pub request: Option<SegmentRequest>,
    pub events: Vec<BufferEvent>,
    /// Ranges already removed from the bookkeeper that must leave the sink too.
    pub evictions: Vec<TimeRange>,
    pub status: BufferStatus,
}

impl Evaluation {
    fn new() -> Self {
        Self {
            request: None,
            events: Vec::new(),
            evictions: Vec::new(),
            status: BufferStatus::Full,
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    id: u64,
    range: TimeRange,
    is_init: bool,
    representation_id: String,
    token: CancellationToken,
}

#[derive(Debug)]
pub struct SegmentScheduler {
    period: Arc<Period>,
    media_type: MediaType,
    adaptation: Arc<Adaptation>,
    representation: Option<Arc<Representation>>,
    bookkeeper: SegmentBookkeeper,
    /// Representation whose initialization segment was pushed last.
    init_loaded: Option<String>,
    in_flight: Option<InFlight>,
    abandoned: Vec<TimeRange>,
    refresh_requested: bool,
    last_discontinuity: Option<f64>,
    next_request_id: u64,
    token: CancellationToken,
}

impl SegmentScheduler {
    pub fn new(
        period: Arc<Period>,
        media_type: MediaType,
        adaptation: Arc<Adaptation>,
        token: CancellationToken,
    ) -> Self {
        Self {
            period,
            media_type,
            adaptation,
            representation: None,
            bookkeeper: SegmentBookkeeper::new(),
            init_loaded: None,
            in_flight: None,
            abandoned: Vec::new(),
            refresh_requested: false,
            last_discontinuity: None,
            next_request_id: 0,
            token,
        }
    }

    pub fn period(&self) -> &Arc<Period> {
        &self.period
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn adaptation(&self) -> &Arc<Adaptation> {
        &self.adaptation
    }

    pub fn representation(&self) -> Option<&Arc<Representation>> {
        self.representation.as_ref()
    }

    pub fn bookkeeper(&self) -> &SegmentBookkeeper {
        &self.bookkeeper
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether `request_id` is the request this scheduler still waits for.
    pub fn is_current(&self, request_id: u64) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.id == request_id)
    }

    fn key_for(&self, representation: &Representation) -> RepresentationKey {
        RepresentationKey::new(self.period.id(), self.adaptation.id(), representation.id())
    }

    /// Switches the representation to load.
    ///
    /// In [`BitrateSwitchingMode::Direct`] mode, content of other representations
    /// from `position` onward is evicted (the removed ranges are returned) and a
    /// request for another representation is aborted.
    pub fn set_representation(
        &mut self,
        representation: Arc<Representation>,
        mode: BitrateSwitchingMode,
        position: f64,
    ) -> (Option<BufferEvent>, Vec<TimeRange>) {
        if self
            .representation
            .as_ref()
            .is_some_and(|current| current.id() == representation.id())
        {
            return (None, Vec::new());
        }

        let key = self.key_for(&representation);
        debug!(
            media_type = %self.media_type,
            representation = %key,
            bitrate = representation.bitrate(),
            ?mode,
            "Switching representation"
        );

        let mut evicted = Vec::new();
        if mode == BitrateSwitchingMode::Direct {
            evicted = self.bookkeeper.ranges_not_matching(position, &key);
            for range in &evicted {
                self.bookkeeper.remove(*range);
            }
            if let Some(in_flight) = &self.in_flight
                && in_flight.representation_id != representation.id()
            {
                trace!(request_id = in_flight.id, "Aborting superseded request");
                in_flight.token.cancel();
                self.in_flight = None;
            }
        }

        let event = BufferEvent::RepresentationChanged {
            media_type: self.media_type,
            representation: key,
            bitrate: representation.bitrate(),
        };
        self.representation = Some(representation);
        (Some(event), evicted)
    }

    /// Re-resolves the adaptation and representation after a manifest update.
    /// Returns false when the adaptation disappeared from the period.
    pub fn update_period(&mut self, period: Arc<Period>) -> bool {
        let adaptation = period
            .adaptation(self.adaptation.id())
            .filter(|a| a.media_type() == self.media_type)
            .cloned();
        let Some(adaptation) = adaptation else {
            return false;
        };
        self.representation = self
            .representation
            .as_ref()
            .and_then(|r| adaptation.representation(r.id()).cloned());
        self.adaptation = adaptation;
        self.period = period;
        self.refresh_requested = false;
        true
    }

    /// Called after a seek; drops a request that no longer helps.
    pub fn on_seek(&mut self, position: f64, goals: &BufferGoals) {
        self.last_discontinuity = None;
        let window = TimeRange::new(position, position + goals.wanted_buffer_ahead);
        if let Some(in_flight) = &self.in_flight
            && !in_flight.is_init
            && !in_flight.range.intersects(&window)
        {
            trace!(request_id = in_flight.id, "Aborting request outside the new window");
            in_flight.token.cancel();
            self.in_flight = None;
        }
    }

    /// Cancels the in-flight request, if any.
    pub fn abort(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.token.cancel();
        }
    }

    /// Applies the buffer goals and decides the next request.
    pub fn evaluate(&mut self, position: f64, goals: &BufferGoals) -> Evaluation {
        let mut evaluation = Evaluation::new();
        self.evict(position, goals, &mut evaluation.evictions);

        let Some(representation) = self.representation.clone() else {
            return evaluation;
        };

        if let Some(next_time) = self.gap_at(position, &representation)
            && self.last_discontinuity != Some(next_time)
        {
            debug!(media_type = %self.media_type, position, next_time, "Discontinuity encountered");
            self.last_discontinuity = Some(next_time);
            evaluation.events.push(BufferEvent::DiscontinuityEncountered {
                media_type: self.media_type,
                next_time,
            });
        }

        if self.in_flight.is_some() {
            evaluation.status = BufferStatus::Filling;
            return evaluation;
        }

        let index = representation.index();
        let window_start = position.max(self.period.start());
        let mut window_end = position + goals.wanted_buffer_ahead;
        if let Some(end) = self.period.end() {
            window_end = window_end.min(end);
        }

        if window_end - window_start > TIME_EPSILON {
            let window = TimeRange::new(window_start, window_end);
            let missing = index
                .segments_between(window_start, window_end)
                .find(|segment| self.is_missing(segment, &window))
                .cloned();
            if let Some(segment) = missing {
                let request = match index.init_segment() {
                    Some(init) if self.init_loaded.as_deref() != Some(representation.id()) => {
                        self.issue(&representation, init.clone())
                    }
                    _ => self.issue(&representation, segment),
                };
                evaluation.request = Some(request);
                evaluation.status = BufferStatus::Filling;
                return evaluation;
            }
        }

        if !index.is_finished()
            && index
                .last_position()
                .is_none_or(|last| last < window_end - TIME_EPSILON)
        {
            if !self.refresh_requested {
                debug!(media_type = %self.media_type, period_id = self.period.id(), "Segment index exhausted");
                self.refresh_requested = true;
                evaluation.events.push(BufferEvent::NeedsManifestRefresh {
                    media_type: self.media_type,
                });
            }
            evaluation.status = BufferStatus::AwaitingManifest;
            return evaluation;
        }

        let content_end = self
            .period
            .end()
            .or_else(|| index.is_finished().then(|| index.last_position()).flatten());
        evaluation.status = match content_end {
            Some(end) if position + goals.wanted_buffer_ahead >= end - TIME_EPSILON => {
                BufferStatus::Complete
            }
            _ => BufferStatus::Full,
        };
        evaluation
    }

    /// Takes the in-flight request matching `request_id`. Stale results return `None`.
    fn settle(&mut self, request_id: u64) -> bool {
        match &self.in_flight {
            Some(in_flight) if in_flight.id == request_id => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Records a pushed segment. Returns false for results of superseded requests.
    pub fn on_pushed(&mut self, request: &SegmentRequest) -> bool {
        if !self.settle(request.id) {
            return false;
        }
        if request.is_init() {
            self.init_loaded = Some(request.representation.id().to_string());
        } else {
            self.bookkeeper.insert(
                request.range,
                request.key.clone(),
                request.representation.bitrate(),
            );
        }
        true
    }

    /// Gives up on a segment whose retries are exhausted. Returns false for
    /// results of superseded requests.
    pub fn on_failed(&mut self, request: &SegmentRequest) -> bool {
        if !self.settle(request.id) {
            return false;
        }
        if request.is_init() {
            warn!(representation = %request.key, "Initialization segment failed, will retry");
        } else {
            warn!(
                representation = %request.key,
                start = request.range.start,
                end = request.range.end,
                "Abandoning segment"
            );
            self.abandoned.push(request.range);
        }
        true
    }

    fn issue(&mut self, representation: &Arc<Representation>, segment: Segment) -> SegmentRequest {
        let id = self.next_request_id;
        self.next_request_id += 1;
        let range = if segment.is_init {
            TimeRange::new(segment.time, segment.time)
        } else {
            self.clip_to_period(&segment)
        };
        let token = self.token.child_token();
        self.in_flight = Some(InFlight {
            id,
            range,
            is_init: segment.is_init,
            representation_id: representation.id().to_string(),
            token: token.clone(),
        });
        let request = SegmentRequest {
            id,
            media_type: self.media_type,
            key: self.key_for(representation),
            representation: Arc::clone(representation),
            segment,
            range,
            token,
        };
        trace!(
            media_type = %self.media_type,
            representation = %request.key,
            start = range.start,
            end = range.end,
            init = request.is_init(),
            "Issuing segment request"
        );
        request
    }

    fn clip_to_period(&self, segment: &Segment) -> TimeRange {
        let start = segment.time.max(self.period.start());
        let end = match self.period.end() {
            Some(period_end) => segment.end().min(period_end),
            None => segment.end(),
        };
        TimeRange::new(start, end)
    }

    /// Whether the part of `segment` inside `window` still has to be loaded.
    fn is_missing(&self, segment: &Segment, window: &TimeRange) -> bool {
        let range = self.clip_to_period(segment);
        if range.is_empty() || self.abandoned.iter().any(|a| a.intersects(&range)) {
            return false;
        }
        let needed = TimeRange::new(range.start.max(window.start), range.end.min(window.end));
        if needed.is_empty() {
            return false;
        }
        // Content of any representation counts; direct switches evict what must be replaced.
        !self.bookkeeper.is_covered(needed, |_| true)
    }

    /// Where playback should jump when `position` sits in a gap of this buffer.
    fn gap_at(&self, position: f64, representation: &Representation) -> Option<f64> {
        if !self.period.contains(position) || self.bookkeeper.buffered_end(position).is_some() {
            return None;
        }
        if let Some(abandoned) = self.abandoned.iter().find(|a| a.contains(position)) {
            return Some(abandoned.end);
        }
        let index = representation.index();
        if let Some(next) = index.hole_at(position) {
            return Some(next);
        }
        // Past the last segment of a finished index but before the period end.
        match (index.is_finished(), index.last_position(), self.period.end()) {
            (true, Some(last), Some(end)) if position >= last - TIME_EPSILON && end > position => {
                Some(end)
            }
            _ => None,
        }
    }

    /// Applies eviction only, for buffers not being filled.
    pub fn evict_only(&mut self, position: f64, goals: &BufferGoals) -> Vec<TimeRange> {
        let mut evictions = Vec::new();
        self.evict(position, goals, &mut evictions);
        evictions
    }

    fn evict(&mut self, position: f64, goals: &BufferGoals, evictions: &mut Vec<TimeRange>) {
        if let Some(behind) = goals.max_buffer_behind {
            let horizon = position - behind;
            if let Some(range) = self.bookkeeper.range_before(horizon) {
                self.bookkeeper.remove(range);
                evictions.push(range);
            }
            // Forgotten failures are retried if playback comes back to them.
            self.abandoned.retain(|a| a.end > horizon);
        }
        if let Some(ahead) = goals.max_buffer_ahead
            && let Some(range) = self.bookkeeper.range_after(position + ahead)
        {
            self.bookkeeper.remove(range);
            evictions.push(range);
        }
        if !evictions.is_empty() {
            trace!(media_type = %self.media_type, ?evictions, "Evicted buffered content");
        }
    }
}
