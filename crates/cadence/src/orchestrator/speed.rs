// Playback rate: the host's requested rate, forced to zero while stalled.

use tracing::debug;

#[derive(Debug)]
pub struct SpeedManager {
    requested: f64,
    buffering: bool,
    effective: f64,
}

impl Default for SpeedManager {
    fn default() -> Self {
        Self {
            requested: 1.0,
            buffering: false,
            effective: 1.0,
        }
    }
}

impl SpeedManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effective(&self) -> f64 {
        self.effective
    }

    pub fn requested(&self) -> f64 {
        self.requested
    }

    /// Returns the new effective rate when it changed.
    pub fn set_requested(&mut self, rate: f64) -> Option<f64> {
        self.requested = rate;
        self.recompute()
    }

    /// Returns the new effective rate when it changed.
    pub fn set_buffering(&mut self, buffering: bool) -> Option<f64> {
        self.buffering = buffering;
        self.recompute()
    }

    fn recompute(&mut self) -> Option<f64> {
        let rate = if self.buffering { 0.0 } else { self.requested };
        if rate == self.effective {
            return None;
        }
        debug!(
            from = self.effective,
            to = rate,
            buffering = self.buffering,
            "Playback rate changed"
        );
        self.effective = rate;
        Some(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffering_forces_zero_and_restores_requested_rate() {
        let mut speed = SpeedManager::new();
        assert_eq!(speed.set_buffering(true), Some(0.0));
        assert_eq!(speed.set_requested(2.0), None);
        assert_eq!(speed.effective(), 0.0);
        assert_eq!(speed.set_buffering(false), Some(2.0));
    }

    #[test]
    fn unchanged_rate_is_not_reported() {
        let mut speed = SpeedManager::new();
        assert_eq!(speed.set_requested(1.0), None);
        assert_eq!(speed.set_buffering(false), None);
        assert_eq!(speed.set_requested(1.5), Some(1.5));
        assert_eq!(speed.requested(), 1.5);
    }
}
