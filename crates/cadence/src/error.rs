use crate::manifest::{MediaType, RepresentationKey};

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("manifest parse error: {reason}")]
    ManifestParse { reason: String },

    #[error("period `{period_id}` has no playable audio or video adaptation")]
    NoPlayableAdaptation { period_id: String },

    #[error(
        "adaptation `{adaptation_id}` in period `{period_id}` has no decodable representation"
    )]
    IncompatibleAdaptation {
        period_id: String,
        adaptation_id: String,
    },

    #[error("no period covers the starting position {position}s")]
    StartingPosition { position: f64 },

    #[error("network request failed for {url}: {reason}")]
    Network {
        url: String,
        reason: String,
        retryable: bool,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("manifest refresh of {url} failed: {source}")]
    ManifestRefresh {
        url: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("segment at {time}s of {representation} abandoned: {source}")]
    SegmentUnavailable {
        representation: RepresentationKey,
        time: f64,
        #[source]
        source: Box<EngineError>,
    },

    #[error("{media_type} buffer sink error: {reason}")]
    BufferSink {
        media_type: MediaType,
        reason: String,
    },

    #[error("autoplay was blocked by the playback surface")]
    AutoplayBlocked,

    #[error("playback surface error: {reason}")]
    Surface { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl EngineError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn manifest_parse(reason: impl Into<String>) -> Self {
        Self::ManifestParse {
            reason: reason.into(),
        }
    }

    pub fn network(url: impl Into<String>, reason: impl Into<String>, retryable: bool) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.into(),
            retryable,
        }
    }

    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn buffer_sink(media_type: MediaType, reason: impl Into<String>) -> Self {
        Self::BufferSink {
            media_type,
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether a collaborator failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::ManifestParse { .. }
            | Self::NoPlayableAdaptation { .. }
            | Self::IncompatibleAdaptation { .. }
            | Self::StartingPosition { .. }
            | Self::ManifestRefresh { .. }
            | Self::SegmentUnavailable { .. }
            | Self::BufferSink { .. }
            | Self::AutoplayBlocked
            | Self::Surface { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Whether the error terminates the stream. Everything else surfaces as a warning.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ManifestParse { .. }
                | Self::NoPlayableAdaptation { .. }
                | Self::StartingPosition { .. }
                | Self::Configuration { .. }
                | Self::Internal { .. }
        )
    }
}
