// Stall detection from buffer gap, readiness and position progress.

use tracing::info;

use crate::config::{BufferGoals, StallConfig};
use crate::manifest::TIME_EPSILON;
use crate::surface::{PlaybackSnapshot, ReadyState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallTransition {
    Stalled,
    Unstalled,
}

#[derive(Debug)]
pub struct StallDetector {
    config: StallConfig,
    stalled: bool,
    last_position: Option<f64>,
}

impl StallDetector {
    pub fn new(config: StallConfig) -> Self {
        Self {
            config,
            stalled: false,
            last_position: None,
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Gap needed to leave a stall. Buffers never fill past
    /// `wanted_buffer_ahead`, so the configured resume gap is capped by it and
    /// the stall gap kept below that.
    fn thresholds(&self, goals: &BufferGoals) -> (f64, f64) {
        let resume = self.config.resume_gap.min(goals.wanted_buffer_ahead);
        let stall = self.config.stall_gap.min(resume / 2.0);
        (stall, resume)
    }

    /// Feeds one clock tick. `gap` is the contiguous buffer ahead of the
    /// position and `ended` whether the end of stream was signalled.
    pub fn on_tick(
        &mut self,
        snapshot: &PlaybackSnapshot,
        gap: Option<f64>,
        ended: bool,
        goals: &BufferGoals,
    ) -> Option<StallTransition> {
        let gap = gap.unwrap_or(0.0);
        let (stall_gap, resume_gap) = self.thresholds(goals);
        let progressed = self
            .last_position
            .replace(snapshot.position)
            .is_none_or(|last| (snapshot.position - last).abs() > TIME_EPSILON);

        if self.stalled {
            let refilled = gap + TIME_EPSILON >= resume_gap && snapshot.ready_state >= ReadyState::FutureData;
            if ended || refilled {
                info!(position = snapshot.position, gap, ended, "Playback resumed");
                self.stalled = false;
                return Some(StallTransition::Unstalled);
            }
            return None;
        }

        if ended {
            return None;
        }
        let starving = gap < stall_gap;
        let frozen = !snapshot.paused
            && !progressed
            && snapshot.ready_state < ReadyState::FutureData
            && gap < resume_gap;
        if starving || frozen {
            info!(position = snapshot.position, gap, starving, frozen, "Playback stalled");
            self.stalled = true;
            return Some(StallTransition::Stalled);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const GOALS: BufferGoals = BufferGoals {
        wanted_buffer_ahead: 30.0,
        max_buffer_ahead: None,
        max_buffer_behind: None,
    };

    fn snapshot(position: f64, ready_state: ReadyState) -> PlaybackSnapshot {
        PlaybackSnapshot {
            position,
            ready_state,
            paused: false,
            frames: None,
        }
    }

    #[test]
    fn stalls_on_empty_buffer_and_resumes_after_refill() {
        let mut detector = StallDetector::new(StallConfig::default());
        assert_eq!(
            detector.on_tick(&snapshot(0.0, ReadyState::Metadata), None, false, &GOALS),
            Some(StallTransition::Stalled)
        );
        // Some media, not enough to resume.
        assert_eq!(detector.on_tick(&snapshot(0.0, ReadyState::FutureData), Some(2.0), false, &GOALS), None);
        assert_eq!(
            detector.on_tick(&snapshot(0.0, ReadyState::EnoughData), Some(6.0), false, &GOALS),
            Some(StallTransition::Unstalled)
        );
        assert_eq!(detector.on_tick(&snapshot(1.0, ReadyState::EnoughData), Some(5.0), false, &GOALS), None);
    }

    #[test]
    fn end_of_stream_releases_a_stall() {
        let mut detector = StallDetector::new(StallConfig::default());
        detector.on_tick(&snapshot(29.8, ReadyState::CurrentData), Some(0.2), false, &GOALS);
        assert!(detector.is_stalled());
        assert_eq!(
            detector.on_tick(&snapshot(29.8, ReadyState::CurrentData), Some(0.2), true, &GOALS),
            Some(StallTransition::Unstalled)
        );
        assert_eq!(detector.on_tick(&snapshot(29.9, ReadyState::CurrentData), Some(0.1), true, &GOALS), None);
    }

    #[rstest]
    #[case::frozen_without_data(ReadyState::CurrentData, false, Some(StallTransition::Stalled))]
    #[case::frozen_with_data(ReadyState::FutureData, false, None)]
    #[case::paused(ReadyState::CurrentData, true, None)]
    fn frozen_position_with_thin_buffer(
        #[case] ready_state: ReadyState,
        #[case] paused: bool,
        #[case] expected: Option<StallTransition>,
    ) {
        let mut detector = StallDetector::new(StallConfig::default());
        let mut snap = snapshot(10.0, ready_state);
        snap.paused = paused;
        assert_eq!(detector.on_tick(&snap, Some(2.0), false, &GOALS), None);
        assert_eq!(detector.on_tick(&snap, Some(2.0), false, &GOALS), expected);
    }

    #[test]
    fn short_buffer_goal_lowers_the_resume_gap() {
        let goals = BufferGoals {
            wanted_buffer_ahead: 4.0,
            ..GOALS
        };
        let mut detector = StallDetector::new(StallConfig::default());
        assert_eq!(
            detector.on_tick(&snapshot(0.0, ReadyState::Metadata), None, false, &goals),
            Some(StallTransition::Stalled)
        );
        // A full 4 s buffer is all the scheduler will ever load.
        assert_eq!(
            detector.on_tick(&snapshot(0.0, ReadyState::EnoughData), Some(4.0), false, &goals),
            Some(StallTransition::Unstalled)
        );
        // Stall threshold stays below the resume one.
        assert_eq!(detector.on_tick(&snapshot(2.5, ReadyState::EnoughData), Some(1.5), false, &goals), None);
        assert_eq!(
            detector.on_tick(&snapshot(3.0, ReadyState::EnoughData), Some(0.4), false, &goals),
            Some(StallTransition::Stalled)
        );
    }
}
