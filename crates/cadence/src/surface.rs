use crate::error::EngineError;

/// Readiness of the playback surface, ordered from least to most data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ReadyState {
    #[default]
    Nothing,
    Metadata,
    CurrentData,
    FutureData,
    EnoughData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounters {
    pub decoded: u64,
    pub dropped: u64,
}

/// What the surface reports on each clock tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSnapshot {
    /// Current playback position in seconds.
    pub position: f64,
    pub ready_state: ReadyState,
    pub paused: bool,
    /// `None` when the surface does not expose frame statistics.
    pub frames: Option<FrameCounters>,
}

/// The host's media element.
///
/// Calls come from the orchestrator task and must not block.
#[cfg_attr(test, mockall::automock)]
pub trait PlaybackSurface: Send + Sync {
    fn snapshot(&self) -> PlaybackSnapshot;

    fn set_position(&self, position: f64);

    fn set_playback_rate(&self, rate: f64);

    /// Every buffer of the last period is complete.
    fn end_of_stream(&self);

    /// Content is needed again after [`PlaybackSurface::end_of_stream`].
    fn resume_stream(&self);

    /// Starts playback. Hosts report an autoplay restriction with
    /// [`EngineError::AutoplayBlocked`].
    fn play(&self) -> Result<(), EngineError>;
}
