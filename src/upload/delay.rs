//! Adaptive interval between upload ticks

use crate::performance::PerformancePreset;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct UploadDelay {
    current: Duration,
    min: Duration,
    max: Duration,
    change_rate: f64,
}

impl UploadDelay {
    pub fn new(preset: &PerformancePreset) -> Self {
        Self {
            current: preset.initial_upload_delay,
            min: preset.min_upload_delay,
            max: preset.max_upload_delay,
            change_rate: preset.upload_delay_change_rate,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Shortens the delay after a successful tick.
    pub fn decrease(&mut self) {
        self.current = self.current.mul_f64(1.0 - self.change_rate).max(self.min);
    }

    /// Lengthens the delay after a failed or idle tick.
    pub fn increase(&mut self) {
        self.current = self.current.mul_f64(1.0 + self.change_rate).min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delay() -> UploadDelay {
        UploadDelay::new(&PerformancePreset {
            initial_upload_delay: Duration::from_secs(10),
            min_upload_delay: Duration::from_secs(2),
            max_upload_delay: Duration::from_secs(20),
            upload_delay_change_rate: 0.5,
            ..PerformancePreset::default()
        })
    }

    #[test]
    fn test_starts_at_initial_delay() {
        assert_eq!(delay().current(), Duration::from_secs(10));
    }

    #[test]
    fn test_decrease_is_floored() {
        let mut delay = delay();
        delay.decrease();
        assert_eq!(delay.current(), Duration::from_secs(5));
        for _ in 0..10 {
            delay.decrease();
        }
        assert_eq!(delay.current(), Duration::from_secs(2));
    }

    #[test]
    fn test_increase_is_capped() {
        let mut delay = delay();
        delay.increase();
        assert_eq!(delay.current(), Duration::from_secs(15));
        delay.increase();
        assert_eq!(delay.current(), Duration::from_secs(20));
    }
}
