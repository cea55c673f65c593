//! Geometric delay compensation for station beams.
//!
//! A wavefront from the observed direction reaches each station at a
//! slightly different time; steering the tied-array beam means shifting each
//! station's sample stream by that geometric delay before it enters the
//! transpose. The whole-sample part of the shift is applied cheaply by
//! moving the read window inside the [`StationBuffer`](crate::station::StationBuffer);
//! the sub-sample residual cannot be expressed as a window shift and is
//! passed through as metadata for the downstream phase-rotation stage.
//!
//! The actual astronomy — direction to ITRF geometry — lives behind
//! [`DelaySource`]; this module only turns seconds into samples.

/// Supplies the geometric delay toward a beam at a given epoch.
///
/// Implementations wrap the observatory's ephemeris machinery; the pipeline
/// only ever asks for "seconds of delay for beam `b` at time `t`".
pub trait DelaySource: Send + Sync {
    /// Delay in seconds for `beam` at `epoch_s` (seconds since the
    /// observation origin). Positive means the wavefront arrives late.
    fn delay_at(&self, beam: usize, epoch_s: f64) -> f64;
}

/// Fixed delay per beam. Fixed pointings, calibration runs, tests.
#[derive(Debug, Clone)]
pub struct ConstantDelay {
    delays_s: Vec<f64>,
}

impl ConstantDelay {
    pub fn new(delays_s: Vec<f64>) -> Self {
        Self { delays_s }
    }
}

impl DelaySource for ConstantDelay {
    fn delay_at(&self, beam: usize, _epoch_s: f64) -> f64 {
        self.delays_s[beam]
    }
}

/// Delay drifting linearly with time, one slope per beam. A first-order
/// model of sidereal motion, good over a processing interval.
#[derive(Debug, Clone)]
pub struct LinearDelay {
    base_s: Vec<f64>,
    rate_s_per_s: Vec<f64>,
}

impl LinearDelay {
    pub fn new(base_s: Vec<f64>, rate_s_per_s: Vec<f64>) -> Self {
        assert!(
            base_s.len() == rate_s_per_s.len(),
            "{} base delays but {} rates",
            base_s.len(),
            rate_s_per_s.len()
        );
        Self { base_s, rate_s_per_s }
    }
}

impl DelaySource for LinearDelay {
    fn delay_at(&self, beam: usize, epoch_s: f64) -> f64 {
        self.base_s[beam] + self.rate_s_per_s[beam] * epoch_s
    }
}

/// Whole-sample and sub-sample parts of one beam's delay for one interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelaySplit {
    /// Whole-sample shift, applied by moving the read window.
    pub coarse_samples: i64,
    /// Residual in samples, in `[-0.5, 0.5)`; passed through as metadata.
    pub fine_samples: f64,
}

/// Converts delays in seconds to window shifts at a fixed sample rate.
#[derive(Debug, Clone, Copy)]
pub struct DelayCompensation {
    sample_rate_hz: f64,
}

impl DelayCompensation {
    pub fn new(sample_rate_hz: f64) -> Self {
        assert!(
            sample_rate_hz > 0.0,
            "sample rate must be positive, got {}",
            sample_rate_hz
        );
        Self { sample_rate_hz }
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    /// Split a delay in seconds into coarse and fine sample parts.
    pub fn split(&self, delay_s: f64) -> DelaySplit {
        let samples = delay_s * self.sample_rate_hz;
        let coarse = samples.round();
        DelaySplit {
            coarse_samples: coarse as i64,
            fine_samples: samples - coarse,
        }
    }

    /// The split for `beam` at the midpoint of the interval starting at
    /// `epoch_s`, which halves the drift error across the interval.
    pub fn for_interval(
        &self,
        source: &dyn DelaySource,
        beam: usize,
        epoch_s: f64,
        length_samples: usize,
    ) -> DelaySplit {
        let mid_s = epoch_s + 0.5 * length_samples as f64 / self.sample_rate_hz;
        self.split(source.delay_at(beam, mid_s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_exact_samples() {
        let comp = DelayCompensation::new(1000.0);
        let split = comp.split(0.005);
        assert_eq!(split.coarse_samples, 5);
        assert_eq!(split.fine_samples, 0.0);
    }

    #[test]
    fn test_split_rounds_to_nearest() {
        let comp = DelayCompensation::new(1000.0);
        let split = comp.split(0.0053);
        assert_eq!(split.coarse_samples, 5);
        assert!((split.fine_samples - 0.3).abs() < 1e-9);

        let split = comp.split(0.0058);
        assert_eq!(split.coarse_samples, 6);
        assert!((split.fine_samples + 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_split_negative_delay() {
        let comp = DelayCompensation::new(1000.0);
        let split = comp.split(-0.0042);
        assert_eq!(split.coarse_samples, -4);
        assert!((split.fine_samples + 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_fine_bounded_by_half_sample() {
        let comp = DelayCompensation::new(195_312.5);
        for i in 0..100 {
            let split = comp.split(i as f64 * 1.37e-5);
            assert!(split.fine_samples >= -0.5 && split.fine_samples <= 0.5);
        }
    }

    #[test]
    fn test_constant_source() {
        let source = ConstantDelay::new(vec![1e-3, 2e-3]);
        assert_eq!(source.delay_at(1, 123.0), 2e-3);
    }

    #[test]
    fn test_linear_source_drifts() {
        let source = LinearDelay::new(vec![1e-3], vec![1e-6]);
        let comp = DelayCompensation::new(1000.0);

        let early = comp.for_interval(&source, 0, 0.0, 100);
        let late = comp.for_interval(&source, 0, 10_000.0, 100);
        assert_eq!(early.coarse_samples, 1);
        // After 10 ks at 1 us/s the delay grew by 10 ms = 10 samples
        assert_eq!(late.coarse_samples, 11);
    }

    #[test]
    #[should_panic(expected = "sample rate must be positive")]
    fn test_zero_sample_rate_is_fatal() {
        DelayCompensation::new(0.0);
    }
}
