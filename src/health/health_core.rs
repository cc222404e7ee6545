use crate::frame::health_record::HealthSummary;

/// Running statistics over a stream of scalar samples, using Welford's numerically stable
///  single-pass algorithm for mean and (population) variance.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCore {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub variance: f64,
    pub sum_of_squared_diffs: f64,
}

impl Default for HealthCore {
    fn default() -> Self {
        HealthCore {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            variance: 0.0,
            sum_of_squared_diffs: 0.0,
        }
    }
}

impl HealthCore {
    pub fn update(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.sum_of_squared_diffs += delta * delta2;
        self.variance = self.sum_of_squared_diffs / self.count as f64;

        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    pub fn reset(&mut self) {
        *self = HealthCore::default();
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            count: self.count.try_into().unwrap_or(u32::MAX),
            min: self.min,
            max: self.max,
            mean: self.mean,
            variance: self.variance,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_no_samples() {
        let core = HealthCore::default();
        assert_eq!(core.count, 0);
        assert_eq!(core.mean, 0.0);
        assert_eq!(core.variance, 0.0);
        assert_eq!(core.min, f64::INFINITY);
        assert_eq!(core.max, f64::NEG_INFINITY);
    }

    #[rstest]
    #[case::single(&[4.0], 4.0, 0.0)]
    #[case::textbook(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 5.0, 4.0)]
    #[case::constant(&[3.5, 3.5, 3.5], 3.5, 0.0)]
    #[case::two(&[1.0, 3.0], 2.0, 1.0)]
    #[case::large_offset(&[1e9 + 4.0, 1e9 + 7.0, 1e9 + 13.0, 1e9 + 16.0], 1e9 + 10.0, 22.5)]
    fn test_mean_and_variance(#[case] samples: &[f64], #[case] expected_mean: f64, #[case] expected_variance: f64) {
        let mut core = HealthCore::default();
        for &x in samples {
            core.update(x);
        }

        assert_eq!(core.count, samples.len() as u64);
        assert!((core.mean - expected_mean).abs() < 1e-9 * expected_mean.abs().max(1.0), "mean {} != {}", core.mean, expected_mean);
        assert!((core.variance - expected_variance).abs() < 1e-6, "variance {} != {}", core.variance, expected_variance);
    }

    #[test]
    fn test_min_max() {
        let mut core = HealthCore::default();
        for x in [3.0, -1.0, 8.0, 2.0] {
            core.update(x);
        }
        assert_eq!(core.min, -1.0);
        assert_eq!(core.max, 8.0);
    }

    #[test]
    fn test_reset() {
        let mut core = HealthCore::default();
        core.update(1.0);
        core.update(2.0);
        core.reset();
        assert_eq!(core, HealthCore::default());
    }

    #[test]
    fn test_summary() {
        let mut core = HealthCore::default();
        core.update(1.0);
        core.update(3.0);

        let summary = core.summary();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 3.0);
        assert_eq!(summary.mean, 2.0);
        assert_eq!(summary.variance, 1.0);
    }
}
