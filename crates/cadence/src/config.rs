use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// How a manual quality change affects content that is already buffered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitrateSwitchingMode {
    /// Keep buffered content and only replace forward of it.
    #[default]
    Seamless,
    /// Evict content of other representations from the playback position onward
    /// and abort the superseded request.
    Direct,
}

/// Buffering targets, expressed in seconds of media. Adjustable while playing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferGoals {
    /// Amount of media to keep loaded ahead of the playback position.
    pub wanted_buffer_ahead: f64,
    /// Content further ahead than this is evicted. `None` keeps everything.
    pub max_buffer_ahead: Option<f64>,
    /// Content further behind than this is evicted. `None` keeps everything.
    pub max_buffer_behind: Option<f64>,
}

impl Default for BufferGoals {
    fn default() -> Self {
        Self {
            wanted_buffer_ahead: 30.0,
            max_buffer_ahead: None,
            max_buffer_behind: None,
        }
    }
}

impl BufferGoals {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.wanted_buffer_ahead.is_finite() || self.wanted_buffer_ahead <= 0.0 {
            return Err(EngineError::configuration(format!(
                "wanted_buffer_ahead must be a positive number of seconds, got {}",
                self.wanted_buffer_ahead
            )));
        }
        if let Some(max_ahead) = self.max_buffer_ahead
            && max_ahead < self.wanted_buffer_ahead
        {
            return Err(EngineError::configuration(format!(
                "max_buffer_ahead ({max_ahead}) is below wanted_buffer_ahead ({})",
                self.wanted_buffer_ahead
            )));
        }
        if let Some(max_behind) = self.max_buffer_behind
            && max_behind < 0.0
        {
            return Err(EngineError::configuration(format!(
                "max_buffer_behind must not be negative, got {max_behind}"
            )));
        }
        Ok(())
    }
}

/// Representation selection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    /// Bitrate ceiling used until a bandwidth estimate exists (bits per second).
    pub initial_bitrate: u64,
    /// Hard cap applied to every automatic choice.
    pub max_bitrate: Option<u64>,
    /// Representations whose playback quality falls below this are avoided.
    pub min_playback_quality: f64,
    /// Fraction of the estimated bandwidth a representation may consume.
    pub bandwidth_safety_factor: f64,
    /// Half-life of the fast playback quality average, in seconds of playback.
    pub fast_quality_half_life: f64,
    /// Half-life of the slow playback quality average, in seconds of playback.
    pub slow_quality_half_life: f64,
    /// Half-life of the fast bandwidth average, in seconds of download.
    pub fast_bandwidth_half_life: f64,
    /// Half-life of the slow bandwidth average, in seconds of download.
    pub slow_bandwidth_half_life: f64,
    /// Responses smaller than this do not contribute to the bandwidth estimate.
    pub min_bandwidth_sample_bytes: u64,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            initial_bitrate: 0, // lowest representation until measured
            max_bitrate: None,
            min_playback_quality: 0.9,
            bandwidth_safety_factor: 0.8,
            fast_quality_half_life: 10.0,
            slow_quality_half_life: 120.0,
            fast_bandwidth_half_life: 2.0,
            slow_bandwidth_half_life: 10.0,
            min_bandwidth_sample_bytes: 16_000,
        }
    }
}

/// Thresholds of the stall detector, in seconds of buffered media.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StallConfig {
    /// Playback is considered stalled when less than this is buffered ahead.
    pub stall_gap: f64,
    /// A stalled playback resumes once this much is buffered ahead.
    pub resume_gap: f64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            stall_gap: 0.5,
            resume_gap: 5.0,
        }
    }
}

/// Configurable options for a streaming session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Initial buffer goals; later changes go through the stream handle.
    pub buffer_goals: BufferGoals,

    /// Retries of a failed manifest refresh before it is reported as a warning.
    pub offline_retry: u32,

    /// Retries of a failed segment request before the segment is abandoned.
    pub segment_retry: u32,

    /// Base delay of the exponential retry backoff.
    pub retry_base_delay: Duration,

    /// Upper bound of a single retry delay.
    pub retry_max_delay: Duration,

    /// Randomize retry delays.
    pub retry_jitter: bool,

    /// Behaviour of manual quality switches. Automatic switches are always seamless.
    pub manual_bitrate_switching_mode: BitrateSwitchingMode,

    /// Opaque options handed to the text sink when it is created.
    pub text_track_options: Option<serde_json::Value>,

    pub abr: AbrConfig,

    pub stall: StallConfig,

    /// Period of the playback clock driving every decision.
    pub clock_interval: Duration,

    /// Issue a play attempt as soon as the content is playable.
    pub autoplay: bool,

    /// Starting position in seconds. Defaults to the start of the first period.
    pub start_position: Option<f64>,

    /// Capacity of the output event channel.
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_goals: BufferGoals::default(),
            offline_retry: 3,
            segment_retry: 4,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(3),
            retry_jitter: true,
            manual_bitrate_switching_mode: BitrateSwitchingMode::Seamless,
            text_track_options: None,
            abr: AbrConfig::default(),
            stall: StallConfig::default(),
            clock_interval: Duration::from_secs(1),
            autoplay: false,
            start_position: None,
            event_channel_capacity: 32,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn segment_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.segment_retry,
            self.retry_base_delay,
            self.retry_max_delay,
            self.retry_jitter,
        )
    }

    pub fn refresh_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.offline_retry,
            self.retry_base_delay,
            self.retry_max_delay,
            self.retry_jitter,
        )
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.buffer_goals.validate()?;
        if !(0.0..=1.0).contains(&self.abr.min_playback_quality) {
            return Err(EngineError::configuration(format!(
                "min_playback_quality must be within [0, 1], got {}",
                self.abr.min_playback_quality
            )));
        }
        if self.abr.bandwidth_safety_factor <= 0.0 {
            return Err(EngineError::configuration(
                "bandwidth_safety_factor must be positive",
            ));
        }
        if self.stall.resume_gap < self.stall.stall_gap {
            return Err(EngineError::configuration(format!(
                "resume_gap ({}) is below stall_gap ({})",
                self.stall.resume_gap, self.stall.stall_gap
            )));
        }
        if self.clock_interval.is_zero() {
            return Err(EngineError::configuration("clock_interval must not be zero"));
        }
        if self.event_channel_capacity == 0 {
            return Err(EngineError::configuration(
                "event_channel_capacity must not be zero",
            ));
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`]; `build` validates the result.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_goals(mut self, goals: BufferGoals) -> Self {
        self.config.buffer_goals = goals;
        self
    }

    pub fn with_wanted_buffer_ahead(mut self, seconds: f64) -> Self {
        self.config.buffer_goals.wanted_buffer_ahead = seconds;
        self
    }

    pub fn with_max_buffer_ahead(mut self, seconds: Option<f64>) -> Self {
        self.config.buffer_goals.max_buffer_ahead = seconds;
        self
    }

    pub fn with_max_buffer_behind(mut self, seconds: Option<f64>) -> Self {
        self.config.buffer_goals.max_buffer_behind = seconds;
        self
    }

    pub fn with_offline_retry(mut self, retries: u32) -> Self {
        self.config.offline_retry = retries;
        self
    }

    pub fn with_segment_retry(mut self, retries: u32) -> Self {
        self.config.segment_retry = retries;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration, jitter: bool) -> Self {
        self.config.retry_base_delay = base;
        self.config.retry_max_delay = max;
        self.config.retry_jitter = jitter;
        self
    }

    pub fn with_manual_bitrate_switching_mode(mut self, mode: BitrateSwitchingMode) -> Self {
        self.config.manual_bitrate_switching_mode = mode;
        self
    }

    pub fn with_text_track_options(mut self, options: serde_json::Value) -> Self {
        self.config.text_track_options = Some(options);
        self
    }

    pub fn with_abr(mut self, abr: AbrConfig) -> Self {
        self.config.abr = abr;
        self
    }

    pub fn with_stall(mut self, stall: StallConfig) -> Self {
        self.config.stall = stall;
        self
    }

    pub fn with_clock_interval(mut self, interval: Duration) -> Self {
        self.config.clock_interval = interval;
        self
    }

    pub fn with_autoplay(mut self, autoplay: bool) -> Self {
        self.config.autoplay = autoplay;
        self
    }

    pub fn with_start_position(mut self, position: f64) -> Self {
        self.config.start_position = Some(position);
        self
    }

    pub fn build(self) -> Result<EngineConfig, EngineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
