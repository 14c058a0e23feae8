use std::time::Duration;

use waypoint_core::config::RetryConfig;
use waypoint_core::error::StepError;

/// Exponential backoff schedule for recoverable step failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether a failure on attempt `attempt` (1-based) should be retried.
    pub fn should_retry(&self, error: &StepError, attempt: u32) -> bool {
        error.is_recoverable() && attempt < self.max_attempts
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let initial = self.initial_backoff.as_millis() as u64;
        let cap = self.max_backoff.as_millis() as u64;
        let ms = initial
            .saturating_mul(2u64.saturating_pow(retry))
            .min(cap);
        if !self.jitter {
            return Duration::from_millis(ms);
        }
        // Add jitter: 0.8x to 1.2x, never above the cap
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis(((ms as f64 * jitter) as u64).min(cap))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
        .with_jitter(config.jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(350))
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy().with_jitter(true);
        for _ in 0..100 {
            let d = p.backoff(0).as_millis();
            assert!((80..=120).contains(&d), "jittered delay {d} out of range");
            assert!(p.backoff(5).as_millis() <= 350);
        }
    }

    #[test]
    fn test_should_retry_only_recoverable() {
        let p = policy();
        let shape = StepError::shape_mismatch("x");
        let fatal = StepError::failed("x");

        assert!(p.should_retry(&shape, 1));
        assert!(p.should_retry(&shape, 2));
        assert!(!p.should_retry(&shape, 3));
        assert!(!p.should_retry(&fatal, 1));
    }

    #[test]
    fn test_from_config() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts(), 3);
        assert!(p.jitter);
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(
            RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts(),
            1
        );
    }
}
