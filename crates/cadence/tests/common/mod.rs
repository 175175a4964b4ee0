//! In-memory collaborators for driving a stream end to end.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cadence_engine::manifest::parsed::{
    ParsedAdaptation, ParsedManifest, ParsedPeriod, ParsedRepresentation, ParsedSegment,
    ParsedSegmentIndex,
};
use cadence_engine::{
    BufferSink, BufferSinkFactory, EngineError, ManifestFetcher, MediaType, PlaybackSnapshot,
    PlaybackSurface, ReadyState, Representation, Segment, SegmentPipeline, SegmentResponse,
    StreamEvent, TimeRange,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const MANIFEST_URL: &str = "https://cdn.example/content/manifest.json";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Manifest documents

pub fn representation(id: &str, bitrate: u64, start: f64, end: f64, segment: f64) -> ParsedRepresentation {
    let count = ((end - start) / segment).ceil() as usize;
    ParsedRepresentation {
        id: id.to_string(),
        bitrate,
        codec: "avc1.64001f".to_string(),
        mime_type: "video/mp4".to_string(),
        width: None,
        height: None,
        index: ParsedSegmentIndex {
            init: Some(ParsedSegment {
                time: 0.0,
                duration: 0.0,
                url: format!("{id}/init.mp4"),
                byte_range: None,
            }),
            segments: (0..count)
                .map(|i| ParsedSegment {
                    time: start + i as f64 * segment,
                    duration: segment,
                    url: format!("{id}/{i}.m4s"),
                    byte_range: None,
                })
                .collect(),
            is_finished: true,
        },
    }
}

pub fn video(representations: Vec<ParsedRepresentation>) -> ParsedAdaptation {
    ParsedAdaptation {
        id: "video".to_string(),
        media_type: MediaType::Video,
        language: None,
        closed_caption: false,
        audio_description: false,
        manually_added: false,
        representations,
    }
}

/// A video period with a single 1 Mbit/s representation of 4 s segments.
pub fn period(id: &str, start: f64, duration: f64) -> ParsedPeriod {
    ParsedPeriod {
        id: id.to_string(),
        start,
        duration: Some(duration),
        adaptations: vec![video(vec![representation(
            &format!("{id}-v1"),
            1_000_000,
            start,
            start + duration,
            4.0,
        )])],
    }
}

pub fn document(periods: Vec<ParsedPeriod>) -> ParsedManifest {
    ParsedManifest {
        url: MANIFEST_URL.to_string(),
        is_dynamic: false,
        minimum_update_period: None,
        periods,
    }
}

// Playback surface

#[derive(Debug)]
struct SurfaceState {
    base_position: f64,
    base_instant: Instant,
    rate: f64,
    paused: bool,
    ready_state: ReadyState,
    play_result: Result<(), EngineError>,
    positions_set: Vec<f64>,
    rates: Vec<f64>,
    end_of_stream_calls: usize,
    resume_calls: usize,
    play_calls: usize,
}

/// A media element whose position advances with the (paused) tokio clock.
#[derive(Debug)]
pub struct FakeSurface {
    state: Mutex<SurfaceState>,
}

impl FakeSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SurfaceState {
                base_position: 0.0,
                base_instant: Instant::now(),
                rate: 1.0,
                paused: false,
                ready_state: ReadyState::EnoughData,
                play_result: Ok(()),
                positions_set: Vec::new(),
                rates: Vec::new(),
                end_of_stream_calls: 0,
                resume_calls: 0,
                play_calls: 0,
            }),
        })
    }

    pub fn paused() -> Arc<Self> {
        let surface = Self::new();
        surface.state.lock().paused = true;
        surface
    }

    pub fn block_autoplay(&self) {
        self.state.lock().play_result = Err(EngineError::AutoplayBlocked);
    }

    pub fn positions_set(&self) -> Vec<f64> {
        self.state.lock().positions_set.clone()
    }

    pub fn rates(&self) -> Vec<f64> {
        self.state.lock().rates.clone()
    }

    pub fn end_of_stream_calls(&self) -> usize {
        self.state.lock().end_of_stream_calls
    }

    pub fn play_calls(&self) -> usize {
        self.state.lock().play_calls
    }

    fn rebase(state: &mut SurfaceState) {
        let now = Instant::now();
        state.base_position = Self::position_of(state, now);
        state.base_instant = now;
    }

    fn position_of(state: &SurfaceState, now: Instant) -> f64 {
        if state.paused {
            return state.base_position;
        }
        state.base_position + (now - state.base_instant).as_secs_f64() * state.rate
    }
}

impl PlaybackSurface for FakeSurface {
    fn snapshot(&self) -> PlaybackSnapshot {
        let state = self.state.lock();
        PlaybackSnapshot {
            position: Self::position_of(&state, Instant::now()),
            ready_state: state.ready_state,
            paused: state.paused,
            frames: None,
        }
    }

    fn set_position(&self, position: f64) {
        let mut state = self.state.lock();
        state.base_position = position;
        state.base_instant = Instant::now();
        state.positions_set.push(position);
    }

    fn set_playback_rate(&self, rate: f64) {
        let mut state = self.state.lock();
        Self::rebase(&mut state);
        state.rate = rate;
        state.rates.push(rate);
    }

    fn end_of_stream(&self) {
        self.state.lock().end_of_stream_calls += 1;
    }

    fn resume_stream(&self) {
        self.state.lock().resume_calls += 1;
    }

    fn play(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.play_calls += 1;
        state.play_result.clone()
    }
}

// Segment pipeline

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub representation: String,
    pub time: f64,
    pub is_init: bool,
}

pub struct FakePipeline {
    latency: Duration,
    fetched: Mutex<Vec<Fetched>>,
    tokens: Mutex<Vec<CancellationToken>>,
}

impl FakePipeline {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            fetched: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        })
    }

    pub fn fetched(&self) -> Vec<Fetched> {
        self.fetched.lock().clone()
    }

    pub fn media_times(&self, representation: &str) -> Vec<f64> {
        self.fetched
            .lock()
            .iter()
            .filter(|f| !f.is_init && f.representation == representation)
            .map(|f| f.time)
            .collect()
    }

    pub fn tokens(&self) -> Vec<CancellationToken> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl SegmentPipeline for FakePipeline {
    async fn fetch_segment(
        &self,
        representation: &Representation,
        segment: &Segment,
        token: &CancellationToken,
    ) -> Result<SegmentResponse, EngineError> {
        self.tokens.lock().push(token.clone());
        let started = Instant::now();
        tokio::select! {
            _ = token.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(self.latency) => {}
        }
        self.fetched.lock().push(Fetched {
            representation: representation.id().to_string(),
            time: segment.time,
            is_init: segment.is_init,
        });
        let size = (representation.bitrate() as f64 * segment.duration / 8.0).max(512.0) as usize;
        Ok(SegmentResponse::new(Bytes::from(vec![0u8; size]), started.elapsed()))
    }
}

// Buffer sinks

#[derive(Debug, Default)]
pub struct SinkJournal {
    pub created: Vec<MediaType>,
    pub pushed: Vec<(MediaType, TimeRange)>,
    pub removed: Vec<(MediaType, TimeRange)>,
    pub disposed: Vec<MediaType>,
}

struct JournalSink {
    media_type: MediaType,
    journal: Arc<Mutex<SinkJournal>>,
}

impl BufferSink for JournalSink {
    fn push(&mut self, _data: Bytes, range: TimeRange) -> Result<(), EngineError> {
        if !range.is_empty() {
            self.journal.lock().pushed.push((self.media_type, range));
        }
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
pub struct FakeSinkFactory {
    pub journal: Arc<Mutex<SinkJournal>>,
}

impl FakeSinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pushed(&self, media_type: MediaType) -> Vec<TimeRange> {
        self.journal
            .lock()
            .pushed
            .iter()
            .filter(|(t, _)| *t == media_type)
            .map(|(_, r)| *r)
            .collect()
    }

    pub fn disposed(&self) -> Vec<MediaType> {
        self.journal.lock().disposed.clone()
    }
}

impl BufferSinkFactory for FakeSinkFactory {
    fn create(
        &self,
        media_type: MediaType,
        _codec: &str,
        _text_track_options: Option<&serde_json::Value>,
    ) -> Result<Box<dyn BufferSink>, EngineError> {
        self.journal.lock().created.push(media_type);
        Ok(Box::new(JournalSink {
            media_type,
            journal: Arc::clone(&self.journal),
        }))
    }
}

// Manifest fetcher

pub struct FakeFetcher {
    latency: Duration,
    documents: Mutex<VecDeque<ParsedManifest>>,
    fallback: ParsedManifest,
    calls: Mutex<Vec<Instant>>,
}

impl FakeFetcher {
    /// Serves `documents` in order, then `fallback` forever.
    pub fn new(latency: Duration, documents: Vec<ParsedManifest>, fallback: ParsedManifest) -> Arc<Self> {
        Arc::new(Self {
            latency,
            documents: Mutex::new(documents.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ManifestFetcher for FakeFetcher {
    async fn fetch_manifest(&self, _url: &str) -> Result<ParsedManifest, EngineError> {
        self.calls.lock().push(Instant::now());
        tokio::time::sleep(self.latency).await;
        let next = self.documents.lock().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

// Event helpers

/// Receives events until `stop` matches one or `limit` of (paused) time passes.
pub async fn events_until(
    rx: &mut mpsc::Receiver<Result<StreamEvent, EngineError>>,
    limit: Duration,
    stop: impl Fn(&StreamEvent) -> bool,
) -> Vec<StreamEvent> {
    let deadline = Instant::now() + limit;
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(Ok(event))) => {
                let done = stop(&event);
                events.push(event);
                if done {
                    return events;
                }
            }
            Ok(Some(Err(e))) => panic!("unexpected fatal error: {e}"),
            Ok(None) | Err(_) => return events,
        }
    }
}
