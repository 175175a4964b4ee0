//! Adaptive segment streaming engine.
//!
//! Given a parsed manifest (periods of adaptations of representations, each
//! with a segment index), the engine decides which segments to fetch for every
//! media type, feeds them to host-provided buffer sinks, picks bitrates from
//! measured bandwidth and playback quality, keeps live manifests fresh and
//! drives a host playback surface. Everything runs in one tokio task started
//! by [`StreamOrchestrator::spawn`].
//!
//! Hosts provide the collaborators: a [`SegmentPipeline`], a
//! [`ManifestFetcher`], a [`PlaybackSurface`] and a [`BufferSinkFactory`].
//! With the `http` feature, [`http`] provides reqwest-backed fetchers.

pub mod abr;
pub mod bookkeeper;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fetch;
#[cfg(feature = "http")]
pub mod http;
pub mod manifest;
pub mod orchestrator;
pub mod refresh;
pub mod retry;
pub mod sink;
pub mod surface;

pub use abr::{AbrManager, QualityMap};
pub use bookkeeper::{SegmentBookkeeper, TimeRange};
pub use buffer::{BufferEvent, BufferManager, BufferStatus, SegmentScheduler};
pub use config::{AbrConfig, BitrateSwitchingMode, BufferGoals, EngineConfig, StallConfig};
pub use error::EngineError;
pub use fetch::{ManifestFetcher, SegmentPipeline, SegmentResponse};
pub use manifest::{
    Adaptation, AnyCodec, CodecSupport, Manifest, MediaType, ParsedManifest, Period,
    Representation, RepresentationKey, Segment, SegmentIndex, SharedManifest,
};
pub use orchestrator::{StreamEvent, StreamHandle, StreamOrchestrator};
pub use refresh::{ManifestRefreshed, RefreshScheduler, RefreshTrigger, refresh_manifest};
pub use retry::RetryPolicy;
pub use sink::{BufferSink, BufferSinkFactory};
pub use surface::{FrameCounters, PlaybackSnapshot, PlaybackSurface, ReadyState};
