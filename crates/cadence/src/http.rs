// reqwest-backed collaborators: segment pipeline and JSON manifest fetcher.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::error::EngineError;
use crate::fetch::{ManifestFetcher, SegmentPipeline, SegmentResponse};
use crate::manifest::{ParsedManifest, Representation, Segment};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn range_header((start, end): (u64, u64)) -> String {
    format!("bytes={start}-{end}")
}

/// Connection failures and timeouts are worth another attempt, anything
/// else reqwest reports is not.
fn network_error(url: &Url, error: &reqwest::Error) -> EngineError {
    let retryable = error.is_connect() || error.is_timeout() || error.is_request();
    EngineError::network(url.as_str(), error.to_string(), retryable)
}

fn parse_manifest(url: &str, body: &[u8]) -> Result<ParsedManifest, EngineError> {
    let mut parsed: ParsedManifest = serde_json::from_slice(body)
        .map_err(|e| EngineError::manifest_parse(format!("{url}: {e}")))?;
    if parsed.url.is_empty() {
        parsed.url = url.to_string();
    }
    Ok(parsed)
}

/// Loads segments over HTTP, resolving their URLs against the manifest URL.
#[derive(Debug, Clone)]
pub struct HttpSegmentPipeline {
    client: Client,
    base: Url,
    timeout: Duration,
}

impl HttpSegmentPipeline {
    pub fn new(client: Client, manifest_url: Url) -> Self {
        Self {
            client,
            base: manifest_url,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn get(&self, url: &Url, segment: &Segment) -> Result<SegmentResponse, EngineError> {
        let mut request = self.client.get(url.clone()).timeout(self.timeout);
        if let Some(range) = segment.byte_range {
            request = request.header(reqwest::header::RANGE, range_header(range));
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| network_error(url, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::http_status(status.as_u16(), url.as_str()));
        }
        let data = response.bytes().await.map_err(|e| network_error(url, &e))?;
        let response = SegmentResponse::new(data, started.elapsed());
        trace!(
            %url,
            size = response.size,
            latency_ms = response.duration.as_millis() as u64,
            "Segment downloaded"
        );
        Ok(response)
    }
}

#[async_trait]
impl SegmentPipeline for HttpSegmentPipeline {
    async fn fetch_segment(
        &self,
        representation: &Representation,
        segment: &Segment,
        token: &CancellationToken,
    ) -> Result<SegmentResponse, EngineError> {
        let url = segment.resolve_url(&self.base)?;
        debug!(representation_id = representation.id(), %url, "Fetching segment");
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(EngineError::Cancelled),
            result = self.get(&url, segment) => result,
        }
    }
}

/// Loads manifests serialized as JSON [`ParsedManifest`] documents.
#[derive(Debug, Clone)]
pub struct HttpManifestFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpManifestFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch_manifest(&self, url: &str) -> Result<ParsedManifest, EngineError> {
        let parsed_url = Url::parse(url).map_err(|e| EngineError::invalid_url(url, e.to_string()))?;
        let response = self
            .client
            .get(parsed_url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| network_error(&parsed_url, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::http_status(status.as_u16(), url));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| network_error(&parsed_url, &e))?;
        debug!(url, size = body.len(), "Manifest downloaded");
        parse_manifest(url, &body)
    }
}
