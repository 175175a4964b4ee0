// Buffer scheduling: what to fetch next for each (period, media type) pair.

mod manager;
mod scheduler;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bookkeeper::TimeRange;
use crate::manifest::{MediaType, Representation, RepresentationKey, Segment};

pub use manager::{BufferManager, ManagerOutput};
pub use scheduler::{BufferStatus, Evaluation, SegmentScheduler};

/// Control events produced while scheduling buffers.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    /// The playback position sits in a gap of the content; playback should
    /// jump to `next_time`.
    DiscontinuityEncountered { media_type: MediaType, next_time: f64 },
    /// The segment index of a live representation ran out before the wanted
    /// buffer could be filled.
    NeedsManifestRefresh { media_type: MediaType },
    /// Every buffer of the last period is complete.
    EndOfStream,
    /// Content is needed again after an end of stream.
    ResumeStream,
    /// A buffer now loads another representation.
    RepresentationChanged {
        media_type: MediaType,
        representation: RepresentationKey,
        bitrate: u64,
    },
    /// A media segment reached its sink.
    SegmentPushed {
        media_type: MediaType,
        representation: RepresentationKey,
        range: TimeRange,
        size: u64,
    },
}

/// A segment fetch decided by a scheduler.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    /// Unique within the scheduler that issued it.
    pub id: u64,
    pub media_type: MediaType,
    pub key: RepresentationKey,
    pub representation: Arc<Representation>,
    pub segment: Segment,
    /// Part of the segment inside its period; empty for initialization segments.
    pub range: TimeRange,
    /// Cancelled when the request is superseded or the stream stops.
    pub token: CancellationToken,
}

impl SegmentRequest {
    pub fn period_id(&self) -> &str {
        &self.key.period_id
    }

    pub fn is_init(&self) -> bool {
        self.segment.is_init
    }
}
