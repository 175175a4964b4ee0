use std::time::Duration;

use crate::abr::QualityMap;
use crate::buffer::BufferEvent;
use crate::error::EngineError;

/// Events delivered to the host on the stream's output channel.
///
/// Fatal conditions are not events: they arrive as the final `Err` item.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A refresh was fetched, merged and published.
    ManifestUpdated {
        /// Latency of the manifest request.
        fetch_duration: Duration,
    },
    /// Playback cannot continue until more media is buffered.
    Stalled,
    Unstalled,
    /// The rate applied to the surface changed.
    SpeedChanged { rate: f64 },
    /// A recoverable problem: playback goes on.
    Warning(EngineError),
    /// Rounded playback quality per representation, emitted only when it
    /// differs from the previous map. Bitrate choices follow these values.
    PlaybackQualityChanged { qualities: QualityMap },
    /// The surface can play; emitted once.
    Loaded,
    Buffer(BufferEvent),
}
