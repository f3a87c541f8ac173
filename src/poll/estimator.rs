use std::collections::VecDeque;
use std::time::Duration;

/// Robust estimate of a feed's update period.
///
/// Keeps the last `W` change-to-change deltas and an exponential moving
/// average. The estimate blends the window median, which shrugs off single
/// outliers, with the EMA, which follows genuine drift. Every output is
/// clamped to `[min_period, max_period]`.
#[derive(Debug, Clone)]
pub struct PeriodEstimator {
    window: VecDeque<u64>,
    capacity: usize,
    alpha: f64,
    ema: Option<f64>,
    fallback_ms: u64,
    min_ms: u64,
    max_ms: u64,
}

impl PeriodEstimator {
    /// `fallback` is reported until the first delta arrives.
    pub fn new(capacity: usize, alpha: f64, fallback: Duration, min: Duration, max: Duration) -> Self {
        let min_ms = millis(min).max(1);
        let max_ms = millis(max).max(min_ms);
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            ema: None,
            fallback_ms: millis(fallback),
            min_ms,
            max_ms,
        }
    }

    /// Records one observed delta. Non-positive deltas are ignored.
    pub fn observe_delta_millis(&mut self, delta_ms: i64) {
        let Ok(delta) = u64::try_from(delta_ms) else {
            return;
        };
        if delta == 0 {
            return;
        }
        let delta = delta.clamp(self.min_ms, self.max_ms);

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(delta);

        let d = delta as f64;
        self.ema = Some(match self.ema {
            Some(ema) => self.alpha * d + (1.0 - self.alpha) * ema,
            None => d,
        });
    }

    pub fn observe_delta(&mut self, delta: Duration) {
        self.observe_delta_millis(i64::try_from(delta.as_millis()).unwrap_or(i64::MAX));
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    /// Current period estimate in milliseconds.
    ///
    /// With no samples this is the fallback, unclamped.
    pub fn estimate_millis(&self) -> u64 {
        let Some(ema) = self.ema else {
            return self.fallback_ms;
        };
        let median = median(&self.window);
        let blended = ((median + ema) / 2.0).round();
        self.clamp(blended)
    }

    pub fn estimate(&self) -> Duration {
        Duration::from_millis(self.estimate_millis())
    }

    /// Median absolute deviation of the window, or 0 with fewer than three
    /// samples.
    pub fn jitter_mad_millis(&self) -> u64 {
        if self.window.len() < 3 {
            return 0;
        }
        let center = median(&self.window);
        let deviations: Vec<u64> = self
            .window
            .iter()
            .map(|&d| (d as f64 - center).abs().round() as u64)
            .collect();
        // Deviations are already bounded by max - min
        median(&deviations).round() as u64
    }

    pub fn jitter_mad(&self) -> Duration {
        Duration::from_millis(self.jitter_mad_millis())
    }

    fn clamp(&self, value: f64) -> u64 {
        (value.max(0.0) as u64).clamp(self.min_ms, self.max_ms)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn median<'a>(values: impl IntoIterator<Item = &'a u64>) -> f64 {
    let mut sorted: Vec<u64> = values.into_iter().copied().collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    } else {
        sorted[mid] as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wide(alpha: f64, window: usize) -> PeriodEstimator {
        PeriodEstimator::new(
            window,
            alpha,
            Duration::from_secs(60),
            Duration::from_millis(1),
            Duration::from_secs(1_000),
        )
    }

    #[test]
    fn test_no_samples_returns_fallback() {
        let estimator = wide(0.3, 8);
        assert_eq!(estimator.estimate_millis(), 60_000);
        assert_eq!(estimator.sample_count(), 0);
    }

    #[test]
    fn test_non_positive_deltas_ignored() {
        let mut estimator = wide(0.3, 8);
        estimator.observe_delta_millis(0);
        estimator.observe_delta_millis(-500);
        assert_eq!(estimator.sample_count(), 0);
        assert_eq!(estimator.estimate_millis(), 60_000);
    }

    #[test]
    fn test_steady_deltas_converge() {
        let mut estimator = wide(0.3, 8);
        for _ in 0..5 {
            estimator.observe_delta_millis(10_000);
        }
        assert_eq!(estimator.estimate_millis(), 10_000);
        assert_eq!(estimator.jitter_mad_millis(), 0);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut estimator = wide(1.0, 3);
        for d in [1_000, 2_000, 3_000, 4_000] {
            estimator.observe_delta_millis(d);
        }
        assert_eq!(estimator.sample_count(), 3);
        // median(2000, 3000, 4000) = 3000, ema with alpha 1 = 4000
        assert_eq!(estimator.estimate_millis(), 3_500);
    }

    #[test]
    fn test_deltas_clamped_into_bounds() {
        let mut estimator = PeriodEstimator::new(
            4,
            0.5,
            Duration::from_secs(10),
            Duration::from_secs(5),
            Duration::from_secs(20),
        );
        estimator.observe_delta_millis(1);
        assert_eq!(estimator.estimate_millis(), 5_000);
        estimator.observe_delta_millis(1_000_000);
        assert!(estimator.estimate_millis() <= 20_000);
    }

    #[test]
    fn test_outlier_moves_estimate_less_than_mean() {
        let mut estimator = wide(0.2, 8);
        let deltas = [1_000, 1_000, 1_000, 1_000, 1_000, 1_000, 1_000];
        for d in deltas {
            estimator.observe_delta_millis(d);
        }
        let before = estimator.estimate_millis() as f64;
        estimator.observe_delta_millis(20_000);
        let after = estimator.estimate_millis() as f64;

        let mean_before = 1_000.0;
        let mean_after = (7.0 * 1_000.0 + 20_000.0) / 8.0;

        assert!(
            after - before < mean_after - mean_before,
            "estimate moved {} but mean moved {}",
            after - before,
            mean_after - mean_before
        );
    }

    #[test]
    fn test_jitter_zero_below_three_samples() {
        let mut estimator = wide(0.3, 8);
        estimator.observe_delta_millis(1_000);
        estimator.observe_delta_millis(9_000);
        assert_eq!(estimator.jitter_mad_millis(), 0);
    }

    #[test]
    fn test_jitter_larger_for_volatile_deltas() {
        let mut volatile = wide(0.3, 8);
        for d in [1_000, 5_000, 1_000, 5_000] {
            volatile.observe_delta_millis(d);
        }
        let mut calm = wide(0.3, 8);
        for d in [1_000, 1_010, 990, 1_005] {
            calm.observe_delta_millis(d);
        }

        assert_eq!(volatile.jitter_mad_millis(), 2_000);
        assert!(calm.jitter_mad_millis() <= 10);
        assert!(volatile.jitter_mad_millis() > calm.jitter_mad_millis());
    }

    proptest! {
        #[test]
        fn prop_estimate_stays_in_bounds(
            deltas in proptest::collection::vec(-10_000i64..10_000_000, 0..64),
            alpha in 0.01f64..=1.0,
            window in 1usize..32,
        ) {
            let min = Duration::from_secs(5);
            let max = Duration::from_secs(600);
            let mut estimator = PeriodEstimator::new(window, alpha, Duration::from_secs(60), min, max);
            for d in deltas {
                estimator.observe_delta_millis(d);
            }
            let estimate = estimator.estimate();
            prop_assert!(estimate >= min && estimate <= max);
            prop_assert!(estimator.jitter_mad() <= max - min);
        }
    }
}
