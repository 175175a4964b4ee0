// Manifest refresh cycle: re-fetch, merge and publish the manifest, and decide
// when the next refresh is due.

use std::sync::Arc;
use std::time::Duration;

use strum::Display;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::fetch::ManifestFetcher;
use crate::manifest::{CodecSupport, Manifest, SharedManifest};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RefreshTrigger {
    /// The minimum update period elapsed.
    Periodic,
    /// A buffer ran out of segments.
    OnDemand,
}

#[derive(Debug, Clone)]
pub struct ManifestRefreshed {
    /// Time spent on the successful request.
    pub fetch_duration: Duration,
    pub manifest: Arc<Manifest>,
    /// Non-fatal problems found while building the refreshed tree.
    pub warnings: Vec<EngineError>,
}

/// Fetches the manifest at its own URL, merges it into `shared` and
/// publishes the result.
///
/// Transient failures are retried according to `policy`. Any failure is
/// returned as [`EngineError::ManifestRefresh`] and leaves `shared` untouched.
pub async fn refresh_manifest(
    shared: &SharedManifest,
    fetcher: &dyn ManifestFetcher,
    codecs: &dyn CodecSupport,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<ManifestRefreshed, EngineError> {
    let url = shared.snapshot().url().to_string();
    debug!(%url, "Refreshing manifest");

    let fetched = retry_with_backoff(policy, token, |_attempt| {
        let url = url.as_str();
        async move {
            let started = Instant::now();
            let result = fetcher.fetch_manifest(url).await;
            RetryAction::classify(result.map(|parsed| (parsed, started.elapsed())))
        }
    })
    .await;

    let wrap = |source: EngineError| EngineError::ManifestRefresh {
        url: url.clone(),
        source: Box::new(source),
    };
    let (parsed, fetch_duration) = match fetched {
        Ok(fetched) => fetched,
        Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
        Err(e) => return Err(wrap(e)),
    };
    let (fresh, warnings) = Manifest::from_parsed(parsed, codecs).map_err(wrap)?;

    let manifest = shared.update(fresh);
    info!(
        %url,
        fetch_ms = fetch_duration.as_millis() as u64,
        periods = manifest.periods().len(),
        "Manifest refreshed"
    );
    Ok(ManifestRefreshed {
        fetch_duration,
        manifest,
        warnings,
    })
}

/// Keeps at most one refresh in flight and tracks when the next periodic
/// refresh is due.
#[derive(Debug, Default)]
pub struct RefreshScheduler {
    in_flight: Option<RefreshTrigger>,
    queued: bool,
    next_due: Option<Instant>,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<RefreshTrigger> {
        self.in_flight
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    /// Registers a trigger. Returns true when a fetch should start now.
    ///
    /// A periodic trigger during any fetch is dropped. An on-demand trigger
    /// during a periodic fetch is queued (several collapse into one); during
    /// an on-demand fetch it is dropped.
    pub fn request(&mut self, trigger: RefreshTrigger) -> bool {
        match (self.in_flight, trigger) {
            (None, _) => {
                debug!(%trigger, "Starting manifest refresh");
                self.in_flight = Some(trigger);
                self.next_due = None;
                true
            }
            (Some(RefreshTrigger::Periodic), RefreshTrigger::OnDemand) => {
                debug!("Queueing on-demand refresh behind periodic refresh");
                self.queued = true;
                false
            }
            (Some(current), _) => {
                debug!(%trigger, %current, "Dropping refresh trigger, fetch in flight");
                if trigger == RefreshTrigger::Periodic {
                    self.next_due = None;
                }
                false
            }
        }
    }

    /// Marks the in-flight fetch as done. Returns true when a queued
    /// on-demand refresh should start now.
    pub fn finish(&mut self) -> bool {
        self.in_flight = None;
        if std::mem::take(&mut self.queued) {
            self.in_flight = Some(RefreshTrigger::OnDemand);
            self.next_due = None;
            return true;
        }
        false
    }

    /// Schedules the next periodic refresh `minimum_update_period -
    /// fetch_duration` after `now`, clamped at zero. Static manifests
    /// (no update period) are never refreshed periodically.
    pub fn schedule_after(
        &mut self,
        now: Instant,
        minimum_update_period: Option<Duration>,
        fetch_duration: Duration,
    ) {
        let Some(period) = minimum_update_period else {
            self.next_due = None;
            warn!("Live manifest without update period, periodic refresh disabled");
            return;
        };
        let delay = period.saturating_sub(fetch_duration);
        self.next_due = now.checked_add(delay);
        match self.next_due {
            Some(_) => debug!(
                delay_ms = delay.as_millis() as u64,
                fetch_ms = fetch_duration.as_millis() as u64,
                "Next manifest refresh scheduled"
            ),
            None => warn!(
                delay_secs = delay.as_secs(),
                "Manifest update period out of range, periodic refresh disabled"
            ),
        }
    }

    pub fn cancel_due(&mut self) {
        self.next_due = None;
    }
}
