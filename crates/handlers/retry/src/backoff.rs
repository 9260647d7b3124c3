use std::time::Duration;

use mender_core::RetryConfig;

/// Hard ceiling on any single retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Exponential backoff: `base * multiplier^(attempt - 1)`, clamped to `max`.
///
/// Attempts are 1-based. With `multiplier >= 1` the delay never decreases
/// from one attempt to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, multiplier: f64) -> Self {
        Self {
            base,
            multiplier,
            max: MAX_RETRY_DELAY,
        }
    }

    /// Backoff described by a retry action's configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_secs(config.delay_seconds),
            config.backoff_multiplier,
        )
    }

    /// Delay to wait after the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.base.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let max = self.max.min(MAX_RETRY_DELAY).as_secs_f64();
        if raw.is_finite() && raw < max {
            Duration::from_secs_f64(raw)
        } else {
            Duration::from_secs_f64(max)
        }
    }

    /// [`delay_for`](Self::delay_for) in whole milliseconds.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        u64::try_from(self.delay_for(attempt).as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for ExponentialBackoff {
    /// 30 s doubling per attempt, capped at one hour.
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_example_schedule() {
        let backoff = ExponentialBackoff::from_config(&RetryConfig {
            max_attempts: 3,
            delay_seconds: 10,
            backoff_multiplier: 2.0,
            ..RetryConfig::default()
        });
        assert_eq!(backoff.delay_for(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(20));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(40));
    }

    #[test]
    fn capped_at_one_hour() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(600), 3.0);
        assert_eq!(backoff.delay_for(1), Duration::from_secs(600));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(1800));
        assert_eq!(backoff.delay_ms(3), 3_600_000);
        assert_eq!(backoff.delay_ms(u32::MAX), 3_600_000);
    }

    #[test]
    fn monotonic_and_bounded_for_any_multiplier() {
        for multiplier in [1.0, 1.1, 1.5, 2.0, 3.7, 10.0, 1e9, f64::INFINITY] {
            for base_secs in [1, 7, 60, 3600, 86_400] {
                let backoff = ExponentialBackoff::new(Duration::from_secs(base_secs), multiplier);
                let mut previous = 0;
                for attempt in 1..=40 {
                    let delay = backoff.delay_ms(attempt);
                    assert!(delay >= previous, "m={multiplier} b={base_secs} a={attempt}");
                    assert!(delay <= 3_600_000);
                    previous = delay;
                }
            }
        }
    }

    #[test]
    fn multiplier_one_is_constant() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(5), 1.0);
        assert_eq!(backoff.delay_for(1), backoff.delay_for(9));
    }
}
