/// Exponentially weighted moving average with bias correction.
///
/// The half-life is expressed in the same unit as sample weights.
#[derive(Debug, Clone)]
pub(crate) struct Ewma {
    alpha: f64,
    last_estimate: f64,
    total_weight: f64,
}

impl Ewma {
    pub(crate) fn new(half_life: f64) -> Self {
        Self {
            alpha: f64::exp(0.5f64.ln() / half_life.max(f64::MIN_POSITIVE)),
            last_estimate: 0.0,
            total_weight: 0.0,
        }
    }

    pub(crate) fn add_sample(&mut self, weight: f64, value: f64) {
        if weight.is_nan() || weight <= 0.0 || !value.is_finite() {
            return;
        }
        let adj_alpha = self.alpha.powf(weight);
        self.last_estimate = value * (1.0 - adj_alpha) + adj_alpha * self.last_estimate;
        self.total_weight += weight;
    }

    /// `None` until a sample has been recorded.
    pub(crate) fn estimate(&self) -> Option<f64> {
        if self.total_weight <= 0.0 {
            return None;
        }
        let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
        Some(self.last_estimate / zero_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_average_has_no_estimate() {
        assert_eq!(Ewma::new(10.0).estimate(), None);
    }

    #[test]
    fn single_sample_is_unbiased() {
        let mut ewma = Ewma::new(10.0);
        ewma.add_sample(1.0, 0.75);
        assert!((ewma.estimate().unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn half_life_halves_the_influence() {
        let mut ewma = Ewma::new(2.0);
        ewma.add_sample(100.0, 0.0);
        ewma.add_sample(2.0, 1.0);
        // After one half-life the new value carries half the weight.
        assert!((ewma.estimate().unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn ignores_non_positive_weights() {
        let mut ewma = Ewma::new(10.0);
        ewma.add_sample(0.0, 0.2);
        ewma.add_sample(-1.0, 0.2);
        assert_eq!(ewma.estimate(), None);
    }
}
