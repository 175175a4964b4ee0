// Stream Orchestrator: one task driving buffers, bitrate choice, manifest
// refresh and the playback surface, merged into a single event channel.

mod events;
mod loaded;
mod speed;
mod stall;

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, OptionFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::abr::AbrManager;
use crate::buffer::{BufferEvent, BufferManager, ManagerOutput, SegmentRequest};
use crate::config::{BufferGoals, EngineConfig};
use crate::error::EngineError;
use crate::fetch::{ManifestFetcher, SegmentPipeline, SegmentResponse};
use crate::manifest::{AnyCodec, CodecSupport, MediaType, SharedManifest, TIME_EPSILON};
use crate::refresh::{ManifestRefreshed, RefreshScheduler, RefreshTrigger, refresh_manifest};
use crate::retry::{RetryAction, retry_with_backoff};
use crate::sink::BufferSinkFactory;
use crate::surface::PlaybackSurface;

pub use events::StreamEvent;
pub use loaded::LoadedDetector;
pub use speed::SpeedManager;
pub use stall::{StallDetector, StallTransition};

type FetchOutcome = (SegmentRequest, Result<SegmentResponse, EngineError>);
type RefreshOutcome = Result<ManifestRefreshed, EngineError>;

#[derive(Debug)]
enum Command {
    Seek(f64),
    SetPlaybackRate(f64),
    SetManualBitrate {
        media_type: MediaType,
        bitrate: Option<u64>,
    },
}

/// Builds and starts a stream.
pub struct StreamOrchestrator {
    config: EngineConfig,
    manifest: SharedManifest,
    manifest_fetcher: Arc<dyn ManifestFetcher>,
    pipeline: Arc<dyn SegmentPipeline>,
    surface: Arc<dyn PlaybackSurface>,
    sink_factory: Arc<dyn BufferSinkFactory>,
    codecs: Arc<dyn CodecSupport>,
    initial_fetch_duration: Duration,
    token: CancellationToken,
}

impl StreamOrchestrator {
    pub fn new(
        manifest: SharedManifest,
        manifest_fetcher: Arc<dyn ManifestFetcher>,
        pipeline: Arc<dyn SegmentPipeline>,
        surface: Arc<dyn PlaybackSurface>,
        sink_factory: Arc<dyn BufferSinkFactory>,
    ) -> Self {
        Self {
            config: EngineConfig::default(),
            manifest,
            manifest_fetcher,
            pipeline,
            surface,
            sink_factory,
            codecs: Arc::new(AnyCodec),
            initial_fetch_duration: Duration::ZERO,
            token: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Codec filter applied to refreshed manifests.
    pub fn with_codec_support(mut self, codecs: Arc<dyn CodecSupport>) -> Self {
        self.codecs = codecs;
        self
    }

    /// Latency of the request that produced the initial manifest, used to
    /// schedule the first live refresh.
    pub fn with_initial_fetch_duration(mut self, duration: Duration) -> Self {
        self.initial_fetch_duration = duration;
        self
    }

    /// Stops the stream when `token` is cancelled.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Spawns the stream task on the current runtime.
    ///
    /// The receiver yields events until the stream stops; a fatal error is
    /// delivered as the last item. Dropping the receiver stops the stream.
    pub fn spawn(self) -> (mpsc::Receiver<Result<StreamEvent, EngineError>>, StreamHandle) {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_channel_capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (goals_tx, goals_rx) = watch::channel(self.config.buffer_goals);
        let token = self.token.clone();

        let task = tokio::spawn(async move {
            self.run(events_tx, commands_rx, goals_rx).await;
            debug!("Stream task finished");
        });

        let handle = StreamHandle {
            commands: commands_tx,
            goals: goals_tx,
            token,
            task: Some(task),
        };
        (events_rx, handle)
    }

    async fn run(
        self,
        events: mpsc::Sender<Result<StreamEvent, EngineError>>,
        commands: mpsc::Receiver<Command>,
        goals: watch::Receiver<BufferGoals>,
    ) {
        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid engine configuration");
            let _ = events.send(Err(e)).await;
            return;
        }

        let mut driver = match Driver::start(self, events.clone()) {
            Ok(driver) => driver,
            Err(e) => {
                error!(error = %e, "Stream initialization failed");
                let _ = events.send(Err(e)).await;
                return;
            }
        };
        driver.run(commands, goals).await;
        driver.shutdown();
    }
}

/// Host-side controls of a running stream.
pub struct StreamHandle {
    commands: mpsc::Sender<Command>,
    goals: watch::Sender<BufferGoals>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Cancelled)
    }

    /// Moves playback to `position` seconds.
    pub async fn seek(&self, position: f64) -> Result<(), EngineError> {
        if !position.is_finite() || position < 0.0 {
            return Err(EngineError::configuration(format!("invalid seek position {position}")));
        }
        self.send(Command::Seek(position)).await
    }

    /// Sets the rate requested by the host. The applied rate drops to zero while stalled.
    pub async fn set_playback_rate(&self, rate: f64) -> Result<(), EngineError> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(EngineError::configuration(format!("invalid playback rate {rate}")));
        }
        self.send(Command::SetPlaybackRate(rate)).await
    }

    /// Locks `media_type` to the highest representation at or below `bitrate`;
    /// `None` returns to adaptive choice.
    pub async fn set_manual_bitrate(&self, media_type: MediaType, bitrate: Option<u64>) -> Result<(), EngineError> {
        self.send(Command::SetManualBitrate { media_type, bitrate }).await
    }

    pub fn set_buffer_goals(&self, goals: BufferGoals) -> Result<(), EngineError> {
        goals.validate()?;
        self.goals.send_replace(goals);
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancels every in-flight request, disposes the sinks and waits for the
    /// stream task to end. Pushed data is left in the sinks.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Stream task ended abnormally");
        }
    }
}

/// Loop state of a running stream.
struct Driver {
    config: EngineConfig,
    manifest: SharedManifest,
    manifest_fetcher: Arc<dyn ManifestFetcher>,
    pipeline: Arc<dyn SegmentPipeline>,
    surface: Arc<dyn PlaybackSurface>,
    codecs: Arc<dyn CodecSupport>,
    token: CancellationToken,
    events: mpsc::Sender<Result<StreamEvent, EngineError>>,

    buffers: BufferManager,
    abr: AbrManager,
    refresh: RefreshScheduler,
    speed: SpeedManager,
    stall: StallDetector,
    loaded: LoadedDetector,
    goals: BufferGoals,

    fetches: FuturesUnordered<BoxFuture<'static, FetchOutcome>>,
    refresh_task: Option<BoxFuture<'static, RefreshOutcome>>,
    /// Set when the host stopped listening.
    closed: bool,
}

impl Driver {
    fn start(
        orchestrator: StreamOrchestrator,
        events: mpsc::Sender<Result<StreamEvent, EngineError>>,
    ) -> Result<Self, EngineError> {
        let StreamOrchestrator {
            config,
            manifest,
            manifest_fetcher,
            pipeline,
            surface,
            sink_factory,
            codecs,
            initial_fetch_duration,
            token,
        } = orchestrator;

        let snapshot = manifest.snapshot();
        let start = match config.start_position {
            Some(position) => position,
            None => snapshot
                .first_period()
                .map(|p| p.start())
                .ok_or_else(|| EngineError::manifest_parse("manifest has no period"))?,
        };

        let mut buffers = BufferManager::new(
            Arc::clone(&snapshot),
            sink_factory,
            config.text_track_options.clone(),
            config.manual_bitrate_switching_mode,
            token.child_token(),
        );
        let period = buffers.initialize(start)?;
        info!(
            url = %snapshot.url(),
            live = snapshot.is_live(),
            period_id = period.id(),
            start,
            "Starting stream"
        );

        if (surface.snapshot().position - start).abs() > TIME_EPSILON {
            surface.set_position(start);
        }

        let mut refresh = RefreshScheduler::new();
        if snapshot.is_live() {
            refresh.schedule_after(
                Instant::now(),
                snapshot.minimum_update_period(),
                initial_fetch_duration,
            );
        }

        Ok(Self {
            abr: AbrManager::new(config.abr.clone()),
            stall: StallDetector::new(config.stall),
            loaded: LoadedDetector::new(config.autoplay),
            goals: config.buffer_goals,
            speed: SpeedManager::new(),
            config,
            manifest,
            manifest_fetcher,
            pipeline,
            surface,
            codecs,
            token,
            events,
            buffers,
            refresh,
            fetches: FuturesUnordered::new(),
            refresh_task: None,
            closed: false,
        })
    }

    async fn run(&mut self, mut commands: mpsc::Receiver<Command>, mut goals: watch::Receiver<BufferGoals>) {
        let mut ticker = tokio::time::interval(self.config.clock_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let events = self.events.clone();
        let mut commands_open = true;
        let mut goals_open = true;

        while !self.closed {
            let next_due = self.refresh.next_due();

            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    info!("Stream cancelled");
                    break;
                }

                _ = events.closed() => {
                    info!("Event receiver dropped, stopping stream");
                    break;
                }

                command = commands.recv(), if commands_open => {
                    match command {
                        Some(command) => self.on_command(command).await,
                        None => commands_open = false,
                    }
                }

                changed = goals.changed(), if goals_open => {
                    if changed.is_err() {
                        goals_open = false;
                        continue;
                    }
                    self.goals = *goals.borrow_and_update();
                    debug!(goals = ?self.goals, "Buffer goals updated");
                    self.update().await;
                }

                Some((request, result)) = self.fetches.next(), if !self.fetches.is_empty() => {
                    let output = self.buffers.on_fetch_result(request, result, &mut self.abr);
                    self.apply(output).await;
                    self.update().await;
                }

                Some(result) = OptionFuture::from(self.refresh_task.as_mut()), if self.refresh_task.is_some() => {
                    self.refresh_task = None;
                    self.on_refreshed(result).await;
                }

                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.trigger_refresh(RefreshTrigger::Periodic);
                }

                _ = ticker.tick() => {
                    self.on_tick().await;
                }
            }
        }
    }

    fn shutdown(&mut self) {
        // Dropping the futures drops every outstanding fetch.
        self.fetches.clear();
        self.refresh_task = None;
        self.buffers.dispose();
        info!("Stream stopped");
    }

    async fn emit(&mut self, event: StreamEvent) {
        if self.closed {
            return;
        }
        if self.events.send(Ok(event)).await.is_err() {
            self.closed = true;
        }
    }

    async fn on_command(&mut self, command: Command) {
        debug!(?command, "Handling command");
        match command {
            Command::Seek(position) => {
                self.surface.set_position(position);
                self.buffers.on_seek(position, &self.goals);
                self.update().await;
            }
            Command::SetPlaybackRate(rate) => {
                if let Some(rate) = self.speed.set_requested(rate) {
                    self.apply_rate(rate).await;
                }
            }
            Command::SetManualBitrate { media_type, bitrate } => {
                if self.abr.set_manual_bitrate(media_type, bitrate) {
                    let position = self.surface.snapshot().position;
                    let output = self.buffers.apply_manual_switch(media_type, position, &self.abr);
                    self.apply(output).await;
                    self.update().await;
                }
            }
        }
    }

    async fn apply_rate(&mut self, rate: f64) {
        self.surface.set_playback_rate(rate);
        self.emit(StreamEvent::SpeedChanged { rate }).await;
    }

    /// Clock tick: playback quality, buffering, stall and loaded detection.
    async fn on_tick(&mut self) {
        let snapshot = self.surface.snapshot();
        trace!(position = snapshot.position, ready_state = ?snapshot.ready_state, "Tick");

        let qualities = self.abr.on_tick(
            Instant::now(),
            &snapshot,
            self.buffers.bookkeeper_at(MediaType::Video, snapshot.position),
        );
        if let Some(qualities) = qualities.filter(|q| !q.is_empty()) {
            debug!(?qualities, "Playback quality changed");
            self.emit(StreamEvent::PlaybackQualityChanged { qualities }).await;
        }
        self.evaluate(snapshot.position).await;

        let gap = self.buffers.buffer_gap(snapshot.position);
        let ended = self.buffers.is_ended();
        if let Some(transition) = self.stall.on_tick(&snapshot, gap, ended, &self.goals) {
            let (event, buffering) = match transition {
                StallTransition::Stalled => (StreamEvent::Stalled, true),
                StallTransition::Unstalled => (StreamEvent::Unstalled, false),
            };
            self.emit(event).await;
            if let Some(rate) = self.speed.set_buffering(buffering) {
                self.apply_rate(rate).await;
            }
        }

        for event in self.loaded.on_tick(&snapshot, self.surface.as_ref()) {
            self.emit(event).await;
        }
    }

    /// Re-evaluates the buffers at the current position.
    async fn update(&mut self) {
        let position = self.surface.snapshot().position;
        self.evaluate(position).await;
    }

    async fn evaluate(&mut self, position: f64) {
        let output = self.buffers.evaluate(position, &self.goals, &mut self.abr);
        self.apply(output).await;
    }

    async fn apply(&mut self, output: ManagerOutput) {
        for request in output.requests {
            self.start_fetch(request);
        }
        for warning in output.warnings {
            self.emit(StreamEvent::Warning(warning)).await;
        }
        for event in output.events {
            self.on_buffer_event(&event);
            self.emit(StreamEvent::Buffer(event)).await;
        }
    }

    fn on_buffer_event(&mut self, event: &BufferEvent) {
        match event {
            BufferEvent::EndOfStream => self.surface.end_of_stream(),
            BufferEvent::ResumeStream => self.surface.resume_stream(),
            BufferEvent::DiscontinuityEncountered { media_type, next_time } if media_type.is_native() => {
                let position = self.surface.snapshot().position;
                if position < *next_time {
                    info!(%media_type, position, next_time, "Skipping discontinuity");
                    self.surface.set_position(*next_time);
                    self.buffers.on_seek(*next_time, &self.goals);
                }
            }
            BufferEvent::NeedsManifestRefresh { media_type } => {
                debug!(%media_type, "Buffer needs a manifest refresh");
                self.trigger_refresh(RefreshTrigger::OnDemand);
            }
            _ => {}
        }
    }

    fn start_fetch(&mut self, request: SegmentRequest) {
        let pipeline = Arc::clone(&self.pipeline);
        let policy = self.config.segment_retry_policy();
        let fetch = async move {
            let token = request.token.clone();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(EngineError::Cancelled),
                result = retry_with_backoff(&policy, &token, |_attempt| {
                    let pipeline = &pipeline;
                    let request = &request;
                    let token = &token;
                    async move {
                        RetryAction::classify(
                            pipeline
                                .fetch_segment(&request.representation, &request.segment, token)
                                .await,
                        )
                    }
                }) => result,
            };
            (request, result)
        };
        self.fetches.push(fetch.boxed());
    }

    fn trigger_refresh(&mut self, trigger: RefreshTrigger) {
        if self.refresh.request(trigger) {
            self.start_refresh();
        }
    }

    fn start_refresh(&mut self) {
        let shared = self.manifest.clone();
        let fetcher = Arc::clone(&self.manifest_fetcher);
        let codecs = Arc::clone(&self.codecs);
        let policy = self.config.refresh_retry_policy();
        let token = self.token.child_token();
        self.refresh_task = Some(
            async move {
                refresh_manifest(&shared, fetcher.as_ref(), codecs.as_ref(), &policy, &token).await
            }
            .boxed(),
        );
    }

    async fn on_refreshed(&mut self, result: RefreshOutcome) {
        let follow_up = self.refresh.finish();
        let mut fetch_duration = Duration::ZERO;
        match result {
            Ok(refreshed) => {
                fetch_duration = refreshed.fetch_duration;
                let manifest = Arc::clone(&refreshed.manifest);
                self.buffers.on_manifest_updated(Arc::clone(&manifest), &mut self.abr);
                for warning in refreshed.warnings {
                    self.emit(StreamEvent::Warning(warning)).await;
                }
                self.emit(StreamEvent::ManifestUpdated { fetch_duration }).await;
            }
            Err(EngineError::Cancelled) => return,
            Err(e) => {
                warn!(error = %e, "Manifest refresh failed");
                self.emit(StreamEvent::Warning(e)).await;
            }
        }

        let manifest = self.manifest.snapshot();
        if follow_up {
            self.start_refresh();
        } else if manifest.is_live() {
            self.refresh
                .schedule_after(Instant::now(), manifest.minimum_update_period(), fetch_duration);
        } else {
            self.refresh.cancel_due();
        }
        self.update().await;
    }
}
