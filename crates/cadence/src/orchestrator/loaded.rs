use tracing::{info, warn};

use super::events::StreamEvent;
use crate::error::EngineError;
use crate::surface::{PlaybackSnapshot, PlaybackSurface, ReadyState};

/// Emits `Loaded` once the surface can play, attempting autoplay first when
/// the host asked for it.
#[derive(Debug)]
pub struct LoadedDetector {
    autoplay: bool,
    loaded: bool,
}

impl LoadedDetector {
    pub fn new(autoplay: bool) -> Self {
        Self {
            autoplay,
            loaded: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn on_tick(&mut self, snapshot: &PlaybackSnapshot, surface: &dyn PlaybackSurface) -> Vec<StreamEvent> {
        if self.loaded || snapshot.ready_state < ReadyState::FutureData {
            return Vec::new();
        }
        self.loaded = true;

        let mut events = Vec::with_capacity(2);
        if self.autoplay {
            match surface.play() {
                Ok(()) => info!("Autoplay started"),
                Err(e) => {
                    warn!(error = %e, "Autoplay failed");
                    let warning = match e {
                        EngineError::AutoplayBlocked => e,
                        other => EngineError::Surface {
                            reason: format!("play failed: {other}"),
                        },
                    };
                    events.push(StreamEvent::Warning(warning));
                }
            }
        }
        info!(position = snapshot.position, "Content loaded");
        events.push(StreamEvent::Loaded);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::MockPlaybackSurface;

    fn ready(ready_state: ReadyState) -> PlaybackSnapshot {
        PlaybackSnapshot {
            position: 0.0,
            ready_state,
            paused: true,
            frames: None,
        }
    }

    #[test]
    fn waits_for_playable_state_and_fires_once() {
        let surface = MockPlaybackSurface::new();
        let mut detector = LoadedDetector::new(false);
        assert!(detector.on_tick(&ready(ReadyState::Metadata), &surface).is_empty());

        let events = detector.on_tick(&ready(ReadyState::FutureData), &surface);
        assert!(matches!(events.as_slice(), [StreamEvent::Loaded]));
        assert!(detector.on_tick(&ready(ReadyState::EnoughData), &surface).is_empty());
    }

    #[test]
    fn autoplay_is_attempted() {
        let mut surface = MockPlaybackSurface::new();
        surface.expect_play().times(1).returning(|| Ok(()));
        let mut detector = LoadedDetector::new(true);

        let events = detector.on_tick(&ready(ReadyState::EnoughData), &surface);
        assert!(matches!(events.as_slice(), [StreamEvent::Loaded]));
    }

    #[test]
    fn blocked_autoplay_is_a_warning() {
        let mut surface = MockPlaybackSurface::new();
        surface
            .expect_play()
            .times(1)
            .returning(|| Err(EngineError::AutoplayBlocked));
        let mut detector = LoadedDetector::new(true);

        let events = detector.on_tick(&ready(ReadyState::EnoughData), &surface);
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Warning(EngineError::AutoplayBlocked), StreamEvent::Loaded]
        ));
        assert!(detector.is_loaded());
    }
}
