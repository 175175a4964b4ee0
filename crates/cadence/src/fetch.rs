// Collaborators producing data: segment pipeline and manifest fetcher.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::manifest::{ParsedManifest, Representation, Segment};

#[derive(Debug, Clone)]
pub struct SegmentResponse {
    pub data: Bytes,
    /// Time spent downloading, used for bandwidth estimation.
    pub duration: Duration,
    pub size: u64,
}

impl SegmentResponse {
    pub fn new(data: Bytes, duration: Duration) -> Self {
        let size = data.len() as u64;
        Self {
            data,
            duration,
            size,
        }
    }
}

/// Loads (and, for hosts that need it, transforms) one segment.
#[async_trait]
pub trait SegmentPipeline: Send + Sync {
    async fn fetch_segment(
        &self,
        representation: &Representation,
        segment: &Segment,
        token: &CancellationToken,
    ) -> Result<SegmentResponse, EngineError>;
}

/// Loads and parses the manifest document at `url`.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch_manifest(&self, url: &str) -> Result<ParsedManifest, EngineError>;
}
