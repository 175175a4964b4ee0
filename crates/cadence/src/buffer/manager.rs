// Buffer Manager: chains per-period schedulers for every media type, routes
// fetch results to them and owns the buffer sinks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::scheduler::{BufferStatus, SegmentScheduler};
use super::{BufferEvent, SegmentRequest};
use crate::abr::AbrManager;
use crate::bookkeeper::{SegmentBookkeeper, TimeRange};
use crate::config::{BitrateSwitchingMode, BufferGoals};
use crate::error::EngineError;
use crate::fetch::SegmentResponse;
use crate::manifest::{Manifest, MediaType, Period, TIME_EPSILON};
use crate::sink::{BufferSinkFactory, SinkSet};

/// Upper bound on the periods walked when measuring contiguous buffer.
const MAX_PERIOD_HOPS: usize = 64;

#[derive(Debug, Default)]
pub struct ManagerOutput {
    pub requests: Vec<SegmentRequest>,
    pub events: Vec<BufferEvent>,
    pub warnings: Vec<EngineError>,
}

impl ManagerOutput {
    fn extend(&mut self, other: ManagerOutput) {
        self.requests.extend(other.requests);
        self.events.extend(other.events);
        self.warnings.extend(other.warnings);
    }
}

pub struct BufferManager {
    manifest: Arc<Manifest>,
    sinks: SinkSet,
    /// Per media type, sorted by period start.
    schedulers: BTreeMap<MediaType, Vec<SegmentScheduler>>,
    native_types: Vec<MediaType>,
    missing_sink_reported: BTreeSet<MediaType>,
    manual_switching_mode: BitrateSwitchingMode,
    ended: bool,
    last_period_gap: Option<f64>,
    token: CancellationToken,
}

impl BufferManager {
    pub fn new(
        manifest: Arc<Manifest>,
        sink_factory: Arc<dyn BufferSinkFactory>,
        text_track_options: Option<serde_json::Value>,
        manual_switching_mode: BitrateSwitchingMode,
        token: CancellationToken,
    ) -> Self {
        Self {
            manifest,
            sinks: SinkSet::new(sink_factory, text_track_options),
            schedulers: BTreeMap::new(),
            native_types: Vec::new(),
            missing_sink_reported: BTreeSet::new(),
            manual_switching_mode,
            ended: false,
            last_period_gap: None,
            token,
        }
    }

    /// Resolves the starting period and creates the video and audio sinks it needs.
    pub fn initialize(&mut self, position: f64) -> Result<Arc<Period>, EngineError> {
        let period = self
            .manifest
            .period_for_time(position)
            .cloned()
            .ok_or(EngineError::StartingPosition { position })?;

        for media_type in period.media_types().filter(|t| t.is_native()) {
            let codec = period
                .adaptations_for_type(media_type)
                .first()
                .and_then(|a| a.representations().first())
                .map(|r| r.codec().to_string())
                .unwrap_or_default();
            self.sinks.ensure(media_type, &codec)?;
            self.native_types.push(media_type);
        }
        info!(
            period_id = period.id(),
            position,
            types = ?self.native_types,
            "Buffers initialized"
        );
        Ok(period)
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// True between an `EndOfStream` and the next `ResumeStream`.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn schedulers(&self, media_type: MediaType) -> &[SegmentScheduler] {
        self.schedulers
            .get(&media_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Bookkeeper of the `media_type` buffer whose period contains `position`.
    pub fn bookkeeper_at(&self, media_type: MediaType, position: f64) -> Option<&SegmentBookkeeper> {
        self.schedulers(media_type)
            .iter()
            .find(|s| s.period().contains(position))
            .map(SegmentScheduler::bookkeeper)
    }

    /// Seconds of contiguous media buffered ahead of `position`, the minimum
    /// over video and audio. Holes between periods are skipped by playback and
    /// count as buffered.
    pub fn buffer_gap(&self, position: f64) -> Option<f64> {
        self.native_types
            .iter()
            .map(|media_type| self.buffered_end(*media_type, position) - position)
            .reduce(f64::min)
    }

    fn buffered_end(&self, media_type: MediaType, position: f64) -> f64 {
        let schedulers = self.schedulers(media_type);
        let mut end = position;
        for _ in 0..MAX_PERIOD_HOPS {
            let from = if self.manifest.period_for_time(end + TIME_EPSILON).is_some() {
                end
            } else if let Some(next) = self.manifest.period_after(end) {
                next.start()
            } else {
                break;
            };
            let next_end = schedulers
                .iter()
                .find(|s| s.period().contains(from + TIME_EPSILON))
                .and_then(|s| s.bookkeeper().buffered_end(from));
            match next_end {
                Some(e) if e > end + TIME_EPSILON => end = e,
                _ => break,
            }
        }
        end
    }

    /// Advances every buffer for the current position.
    pub fn evaluate(&mut self, position: f64, goals: &BufferGoals, abr: &mut AbrManager) -> ManagerOutput {
        let mut output = ManagerOutput::default();
        let manifest = Arc::clone(&self.manifest);

        let start = manifest
            .period_for_time(position)
            .or_else(|| manifest.period_after(position))
            .cloned();

        self.detect_period_gap(position, &mut output);

        let mut visited: BTreeSet<(MediaType, String)> = BTreeSet::new();
        let mut all_complete = true;

        if let Some(start) = start {
            for media_type in MediaType::ALL {
                if !self.can_buffer(media_type, &manifest, &mut output) {
                    continue;
                }
                let mut period = Arc::clone(&start);
                loop {
                    let status = if period.adaptations_for_type(media_type).is_empty() {
                        BufferStatus::Complete
                    } else {
                        visited.insert((media_type, period.id().to_string()));
                        let step = self.step(&period, media_type, position, goals, abr);
                        let status = step.1;
                        output.extend(step.0);
                        status
                    };
                    if status != BufferStatus::Complete {
                        all_complete = false;
                        break;
                    }
                    match manifest.next_period(&period) {
                        Some(next) if next.start() < position + goals.wanted_buffer_ahead => {
                            period = Arc::clone(next);
                        }
                        Some(_) => {
                            all_complete = false;
                            break;
                        }
                        None => {
                            if manifest.is_live() && period.end().is_none() {
                                all_complete = false;
                            }
                            break;
                        }
                    }
                }
            }
        } else {
            trace!(position, "Position is past the last period");
        }

        // Buffers outside the chain only evict.
        for (media_type, schedulers) in &mut self.schedulers {
            for scheduler in schedulers.iter_mut() {
                if visited.contains(&(*media_type, scheduler.period().id().to_string())) {
                    continue;
                }
                for range in scheduler.evict_only(position, goals) {
                    self.sinks.remove(*media_type, range);
                }
            }
            schedulers.retain(|s| {
                let finished = s.period().end().is_some_and(|end| end <= position)
                    && s.bookkeeper().is_empty()
                    && !s.has_in_flight();
                !finished
            });
        }

        if all_complete && !self.ended {
            info!(position, "All buffers complete, signalling end of stream");
            self.ended = true;
            output.events.push(BufferEvent::EndOfStream);
        } else if !all_complete && self.ended {
            info!(position, "Content needed again, resuming stream");
            self.ended = false;
            output.events.push(BufferEvent::ResumeStream);
        }
        output
    }

    fn can_buffer(&mut self, media_type: MediaType, manifest: &Manifest, output: &mut ManagerOutput) -> bool {
        if !media_type.is_native() || self.native_types.contains(&media_type) {
            return true;
        }
        let appears = manifest
            .periods()
            .iter()
            .any(|p| !p.adaptations_for_type(media_type).is_empty());
        if appears && self.missing_sink_reported.insert(media_type) {
            warn!(%media_type, "Media type appears after playback started and cannot be buffered");
            output.warnings.push(EngineError::buffer_sink(
                media_type,
                "no sink was created for this type when playback started",
            ));
        }
        false
    }

    fn step(
        &mut self,
        period: &Arc<Period>,
        media_type: MediaType,
        position: f64,
        goals: &BufferGoals,
        abr: &mut AbrManager,
    ) -> (ManagerOutput, BufferStatus) {
        let mut output = ManagerOutput::default();
        let scheduler = self.scheduler_mut(period, media_type, abr);

        if let Some(representation) = abr.choose(period.id(), scheduler.adaptation()) {
            let (event, _) =
                scheduler.set_representation(representation, BitrateSwitchingMode::Seamless, position);
            output.events.extend(event);
        }

        let evaluation = scheduler.evaluate(position, goals);
        output.events.extend(evaluation.events);
        output.requests.extend(evaluation.request);
        for range in evaluation.evictions {
            self.sinks.remove(media_type, range);
        }
        (output, evaluation.status)
    }

    fn scheduler_mut(
        &mut self,
        period: &Arc<Period>,
        media_type: MediaType,
        abr: &mut AbrManager,
    ) -> &mut SegmentScheduler {
        let schedulers = self.schedulers.entry(media_type).or_default();
        let index = match schedulers.iter().position(|s| s.period().id() == period.id()) {
            Some(index) => index,
            None => {
                // Checked non-empty by the caller.
                let adaptation = Arc::clone(&period.adaptations_for_type(media_type)[0]);
                abr.track(period.id(), &adaptation);
                debug!(%media_type, period_id = period.id(), adaptation_id = adaptation.id(), "Creating period buffer");
                let at = schedulers.partition_point(|s| s.period().start() < period.start());
                schedulers.insert(
                    at,
                    SegmentScheduler::new(
                        Arc::clone(period),
                        media_type,
                        adaptation,
                        self.token.child_token(),
                    ),
                );
                at
            }
        };
        &mut schedulers[index]
    }

    fn detect_period_gap(&mut self, position: f64, output: &mut ManagerOutput) {
        if self.manifest.period_for_time(position).is_some() {
            return;
        }
        let Some(next) = self.manifest.period_after(position) else {
            return;
        };
        let next_time = next.start();
        if self.last_period_gap == Some(next_time) {
            return;
        }
        let Some(media_type) = self.native_types.first().copied() else {
            return;
        };
        debug!(position, next_time, "Position is between periods");
        self.last_period_gap = Some(next_time);
        output.events.push(BufferEvent::DiscontinuityEncountered {
            media_type,
            next_time,
        });
    }

    /// Applies a changed manual bitrate lock to the buffers of `media_type`
    /// using the configured switching mode.
    pub fn apply_manual_switch(&mut self, media_type: MediaType, position: f64, abr: &AbrManager) -> ManagerOutput {
        let mut output = ManagerOutput::default();
        let mode = self.manual_switching_mode;
        let Some(schedulers) = self.schedulers.get_mut(&media_type) else {
            return output;
        };
        for scheduler in schedulers.iter_mut() {
            let period_id = scheduler.period().id().to_string();
            let Some(representation) = abr.choose(&period_id, scheduler.adaptation()) else {
                continue;
            };
            let (event, evicted) = scheduler.set_representation(representation, mode, position);
            output.events.extend(event);
            for range in evicted {
                self.sinks.remove(media_type, range);
            }
        }
        output
    }

    /// Routes a finished fetch to its scheduler and sink.
    pub fn on_fetch_result(
        &mut self,
        request: SegmentRequest,
        result: Result<SegmentResponse, EngineError>,
        abr: &mut AbrManager,
    ) -> ManagerOutput {
        let mut output = ManagerOutput::default();
        let media_type = request.media_type;
        let Some(scheduler) = self
            .schedulers
            .get_mut(&media_type)
            .and_then(|list| list.iter_mut().find(|s| s.period().id() == request.period_id()))
        else {
            trace!(request_id = request.id, "Dropping result for a removed buffer");
            return output;
        };
        if !scheduler.is_current(request.id) {
            trace!(request_id = request.id, "Dropping result of a superseded request");
            return output;
        }

        let response = match result {
            Ok(response) => response,
            Err(EngineError::Cancelled) => {
                scheduler.abort();
                return output;
            }
            Err(source) => {
                scheduler.on_failed(&request);
                output.warnings.push(EngineError::SegmentUnavailable {
                    representation: request.key.clone(),
                    time: request.segment.time,
                    source: Box::new(source),
                });
                return output;
            }
        };

        let pushed = self
            .sinks
            .ensure(media_type, request.representation.codec())
            .and_then(|()| self.sinks.push(media_type, response.data.clone(), request.range));
        if let Err(e) = pushed {
            scheduler.on_failed(&request);
            output.warnings.push(e);
            return output;
        }

        scheduler.on_pushed(&request);
        abr.add_bandwidth_sample(response.size, response.duration);
        if !request.is_init() {
            output.events.push(BufferEvent::SegmentPushed {
                media_type,
                representation: request.key.clone(),
                range: request.range,
                size: response.size,
            });
        }
        output
    }

    /// Switches to a refreshed manifest.
    pub fn on_manifest_updated(&mut self, manifest: Arc<Manifest>, abr: &mut AbrManager) {
        for schedulers in self.schedulers.values_mut() {
            schedulers.retain_mut(|scheduler| {
                let alive = manifest
                    .period(scheduler.period().id())
                    .is_some_and(|p| scheduler.update_period(Arc::clone(p)));
                if !alive {
                    debug!(period_id = scheduler.period().id(), "Dropping buffer of a removed period");
                    scheduler.abort();
                }
                alive
            });
        }
        abr.retain_periods(|id| manifest.period(id).is_some());
        self.manifest = manifest;
    }

    pub fn on_seek(&mut self, position: f64, goals: &BufferGoals) {
        self.last_period_gap = None;
        for scheduler in self.schedulers.values_mut().flatten() {
            scheduler.on_seek(position, goals);
        }
    }

    /// Aborts every request and releases the sinks.
    pub fn dispose(&mut self) {
        for scheduler in self.schedulers.values_mut().flatten() {
            scheduler.abort();
        }
        self.schedulers.clear();
        self.sinks.dispose_all();
    }

    /// Buffered ranges of `media_type` across every period buffer.
    pub fn buffered_ranges(&self, media_type: MediaType) -> Vec<TimeRange> {
        self.schedulers(media_type)
            .iter()
            .flat_map(|s| s.bookkeeper().chunks().iter().map(|c| c.range))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AbrConfig;
    use crate::manifest::test_support::{adaptation, build, manifest, period, representation, segments};
    use crate::sink::BufferSink;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Journal {
        created: Vec<MediaType>,
        pushed: Vec<(MediaType, TimeRange)>,
        removed: Vec<(MediaType, TimeRange)>,
        disposed: Vec<MediaType>,
    }

    struct RecordingSink {
        media_type: MediaType,
        journal: Arc<Mutex<Journal>>,
    }

    impl BufferSink for RecordingSink {
        fn push(&mut self, _data: Bytes, range: TimeRange) -> Result<(), EngineError> {
            self.journal.lock().pushed.push((self.media_type, range));
            Ok(())
        }

        fn remove(&mut self, range: TimeRange) -> Result<(), EngineError> {
            self.journal.lock().removed.push((self.media_type, range));
            Ok(())
        }

        fn dispose(&mut self) {
            self.journal.lock().disposed.push(self.media_type);
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        journal: Arc<Mutex<Journal>>,
    }

    impl BufferSinkFactory for RecordingFactory {
        fn create(
            &self,
            media_type: MediaType,
            _codec: &str,
            _text_track_options: Option<&serde_json::Value>,
        ) -> Result<Box<dyn BufferSink>, EngineError> {
            self.journal.lock().created.push(media_type);
            Ok(Box::new(RecordingSink {
                media_type,
                journal: Arc::clone(&self.journal),
            }))
        }
    }

    fn manager_for(manifest: Manifest) -> (BufferManager, Arc<Mutex<Journal>>) {
        let factory = RecordingFactory::default();
        let journal = Arc::clone(&factory.journal);
        let manager = BufferManager::new(
            Arc::new(manifest),
            Arc::new(factory),
            None,
            BitrateSwitchingMode::Seamless,
            CancellationToken::new(),
        );
        (manager, journal)
    }

    fn goals(wanted: f64) -> BufferGoals {
        BufferGoals {
            wanted_buffer_ahead: wanted,
            ..BufferGoals::default()
        }
    }

    fn respond(manager: &mut BufferManager, abr: &mut AbrManager, requests: Vec<SegmentRequest>) -> Vec<BufferEvent> {
        let mut events = Vec::new();
        for request in requests {
            let response = SegmentResponse::new(Bytes::from_static(&[0u8; 64]), Duration::from_millis(10));
            events.extend(manager.on_fetch_result(request, Ok(response), abr).events);
        }
        events
    }

    /// Evaluates and answers requests until no buffer asks for more.
    fn settle(manager: &mut BufferManager, abr: &mut AbrManager, position: f64, goals: &BufferGoals) -> Vec<BufferEvent> {
        let mut events = Vec::new();
        for _ in 0..200 {
            let output = manager.evaluate(position, goals, abr);
            events.extend(output.events);
            if output.requests.is_empty() {
                break;
            }
            events.extend(respond(manager, abr, output.requests));
        }
        events
    }

    #[test]
    fn starting_outside_every_period_fails() {
        let (mut manager, journal) = manager_for(build(manifest(vec![period("p0", 0.0, 20.0)])));
        let result = manager.initialize(25.0);
        assert!(matches!(result, Err(EngineError::StartingPosition { position }) if position == 25.0));
        assert!(journal.lock().created.is_empty());
    }

    #[test]
    fn native_sinks_created_up_front_text_lazily() {
        let mut p = period("p0", 0.0, 8.0);
        let mut audio = representation("a1", 128_000, segments(2, 4.0, 0.0, "a1"));
        audio.mime_type = "audio/mp4".to_string();
        p.adaptations.push(adaptation("audio", MediaType::Audio, vec![audio]));
        let mut text = representation("t1", 1_000, segments(1, 8.0, 0.0, "t1"));
        text.index.init = None;
        p.adaptations.push(adaptation("subs", MediaType::Text, vec![text]));

        let (mut manager, journal) = manager_for(build(manifest(vec![p])));
        manager.initialize(0.0).unwrap();
        assert_eq!(journal.lock().created, vec![MediaType::Video, MediaType::Audio]);

        let mut abr = AbrManager::new(AbrConfig::default());
        settle(&mut manager, &mut abr, 0.0, &goals(30.0));
        assert_eq!(
            journal.lock().created,
            vec![MediaType::Video, MediaType::Audio, MediaType::Text]
        );
    }

    #[test]
    fn consecutive_periods_end_the_stream() {
        let (mut manager, _journal) = manager_for(build(manifest(vec![
            period("p1", 0.0, 8.0),
            period("p2", 8.0, 8.0),
        ])));
        manager.initialize(0.0).unwrap();
        let mut abr = AbrManager::new(AbrConfig::default());

        let events = settle(&mut manager, &mut abr, 0.0, &goals(30.0));
        assert_eq!(
            events.iter().filter(|e| **e == BufferEvent::EndOfStream).count(),
            1
        );
        assert!(manager.is_ended());
        assert_eq!(manager.schedulers(MediaType::Video).len(), 2);
        assert_eq!(manager.buffer_gap(0.0), Some(16.0));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, BufferEvent::DiscontinuityEncountered { .. }))
        );
    }

    #[test]
    fn backward_seek_after_eviction_resumes_the_stream() {
        let (mut manager, journal) = manager_for(build(manifest(vec![period("p0", 0.0, 16.0)])));
        manager.initialize(0.0).unwrap();
        let mut abr = AbrManager::new(AbrConfig::default());
        let limited = BufferGoals {
            wanted_buffer_ahead: 8.0,
            max_buffer_ahead: Some(8.0),
            max_buffer_behind: Some(1.0),
        };

        settle(&mut manager, &mut abr, 0.0, &limited);
        let events = settle(&mut manager, &mut abr, 12.0, &limited);
        assert!(events.contains(&BufferEvent::EndOfStream));
        assert!(!journal.lock().removed.is_empty());

        manager.on_seek(0.0, &limited);
        let events = settle(&mut manager, &mut abr, 0.0, &limited);
        assert_eq!(events.first(), Some(&BufferEvent::ResumeStream));
        assert!(!manager.is_ended());
    }

    #[test]
    fn gap_between_periods_is_reported_once() {
        let (mut manager, _journal) = manager_for(build(manifest(vec![
            period("p1", 0.0, 50.0),
            period("p2", 60.0, 20.0),
        ])));
        manager.initialize(40.0).unwrap();
        let mut abr = AbrManager::new(AbrConfig::default());

        let events = settle(&mut manager, &mut abr, 40.0, &goals(30.0));
        let requested_p2 = manager.schedulers(MediaType::Video).len() == 2;
        assert!(requested_p2, "next period buffered across the gap");
        assert_eq!(manager.buffer_gap(40.0), Some(32.0));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, BufferEvent::DiscontinuityEncountered { .. }))
        );

        let events = settle(&mut manager, &mut abr, 50.0, &goals(30.0));
        let discontinuities: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BufferEvent::DiscontinuityEncountered { next_time, .. } => Some(*next_time),
                _ => None,
            })
            .collect();
        assert_eq!(discontinuities, vec![60.0]);
        assert!(settle(&mut manager, &mut abr, 50.5, &goals(30.0)).is_empty());
    }

    #[test]
    fn failed_segment_becomes_a_warning() {
        let (mut manager, _journal) = manager_for(build(manifest(vec![period("p0", 0.0, 16.0)])));
        manager.initialize(0.0).unwrap();
        let mut abr = AbrManager::new(AbrConfig::default());

        let init = manager.evaluate(0.0, &goals(8.0), &mut abr).requests;
        respond(&mut manager, &mut abr, init);
        let mut requests = manager.evaluate(0.0, &goals(8.0), &mut abr).requests;
        let request = requests.remove(0);
        let output = manager.on_fetch_result(
            request,
            Err(EngineError::http_status(404, "https://cdn.example/p0/0.m4s")),
            &mut abr,
        );
        assert!(matches!(
            output.warnings.as_slice(),
            [EngineError::SegmentUnavailable { time, .. }] if *time == 0.0
        ));
    }

    #[test]
    fn removed_period_drops_its_buffer() {
        let original = build(manifest(vec![period("p1", 0.0, 8.0), period("p2", 8.0, 8.0)]));
        let (mut manager, _journal) = manager_for(original.clone());
        manager.initialize(0.0).unwrap();
        let mut abr = AbrManager::new(AbrConfig::default());
        settle(&mut manager, &mut abr, 0.0, &goals(30.0));
        assert_eq!(manager.schedulers(MediaType::Video).len(), 2);

        let refreshed = original.merged_with(build(manifest(vec![period("p2", 8.0, 8.0)])));
        manager.on_manifest_updated(Arc::new(refreshed), &mut abr);
        assert_eq!(manager.schedulers(MediaType::Video).len(), 1);
        assert_eq!(manager.schedulers(MediaType::Video)[0].period().id(), "p2");
    }

    #[test]
    fn dispose_releases_sinks() {
        let (mut manager, journal) = manager_for(build(manifest(vec![period("p0", 0.0, 16.0)])));
        manager.initialize(0.0).unwrap();
        manager.dispose();
        assert_eq!(journal.lock().disposed, vec![MediaType::Video]);
    }

    #[test]
    fn late_native_type_is_reported() {
        let first = period("p1", 0.0, 8.0);
        let mut second = period("p2", 8.0, 8.0);
        let mut audio = representation("a1", 128_000, segments(2, 4.0, 8.0, "a1"));
        audio.mime_type = "audio/mp4".to_string();
        second.adaptations.push(adaptation("audio", MediaType::Audio, vec![audio]));

        let (mut manager, _journal) = manager_for(build(manifest(vec![first, second])));
        manager.initialize(0.0).unwrap();
        let mut abr = AbrManager::new(AbrConfig::default());
        let output = manager.evaluate(0.0, &goals(30.0), &mut abr);
        assert!(matches!(
            output.warnings.as_slice(),
            [EngineError::BufferSink { media_type: MediaType::Audio, .. }]
        ));
        assert!(manager.evaluate(0.0, &goals(30.0), &mut abr).warnings.is_empty());
    }
}
