//! Retry gate and backoff delays for failed deliveries.

use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffStrategy, QueueConfig};

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

impl BackoffConfig {
    /// Delay for a 1-based attempt number, capped and jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        // Apply jitter only if jitter_factor > 0
        let final_ms = if self.jitter_factor > 0.0 {
            let jitter_range = capped_ms * self.jitter_factor;
            let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
            (capped_ms + jitter).max(1.0)
        } else {
            capped_ms.max(1.0)
        };

        Duration::from_millis(final_ms as u64)
    }
}

/// Delay inserted before a failed message is requeued.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Requeue immediately
    None,
    /// `attempt * step`
    Linear { step: Duration },
    Exponential(BackoffConfig),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { step } => step.saturating_mul(attempt),
            Backoff::Exponential(config) => config.delay_for(attempt),
        }
    }
}

/// How often and how patiently a failing message is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total deliveries before the message is discarded
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// In-process default: 3 attempts, 1s, 2s, ... between them.
    pub fn linear() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Linear {
                step: Duration::from_secs(1),
            },
        }
    }

    /// Redis default: 3 attempts, requeued without waiting.
    pub fn immediate() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::None,
        }
    }

    /// Build from settings, falling back to `default` when no strategy is configured.
    pub fn from_config(config: &QueueConfig, default: RetryPolicy) -> Self {
        let step = Duration::from_millis(config.retry_delay_ms);
        let backoff = match config.retry_backoff {
            None => default.backoff,
            Some(BackoffStrategy::None) => Backoff::None,
            Some(BackoffStrategy::Linear) => Backoff::Linear { step },
            Some(BackoffStrategy::Exponential) => Backoff::Exponential(BackoffConfig {
                initial_delay: step,
                ..Default::default()
            }),
        };

        Self {
            max_attempts: config.max_attempts.max(1),
            backoff,
        }
    }

    /// Whether a message that has failed `failures` times gets another delivery.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// Wait before the delivery following failure number `failures`.
    pub fn delay(&self, failures: u32) -> Duration {
        self.backoff.delay(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff_grows_by_step() {
        let policy = RetryPolicy::linear();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(3));
    }

    #[test]
    fn test_immediate_has_no_delay() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.delay(1), Duration::ZERO);
        assert_eq!(policy.delay(2), Duration::ZERO);
    }

    #[test]
    fn test_retry_gate_allows_three_deliveries() {
        let policy = RetryPolicy::linear();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_exponential_backoff_increases() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0, // No jitter for predictable testing
        };

        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_exponential_backoff_caps_at_max() {
        let config = BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 10.0,
            jitter_factor: 0.0,
        };

        assert_eq!(config.delay_for(6), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = BackoffConfig::default();
        for _ in 0..50 {
            let delay = config.delay_for(1);
            assert!(delay >= Duration::from_millis(90));
            assert!(delay <= Duration::from_millis(110));
        }
    }

    #[test]
    fn test_from_config_overrides_backoff() {
        let config = QueueConfig {
            retry_backoff: Some(BackoffStrategy::Linear),
            retry_delay_ms: 250,
            max_attempts: 5,
            ..Default::default()
        };

        let policy = RetryPolicy::from_config(&config, RetryPolicy::immediate());
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay(2), Duration::from_millis(500));
    }

    #[test]
    fn test_from_config_keeps_backend_default() {
        let config = QueueConfig::default();

        let policy = RetryPolicy::from_config(&config, RetryPolicy::immediate());
        assert_eq!(policy.backoff, Backoff::None);

        let policy = RetryPolicy::from_config(&config, RetryPolicy::linear());
        assert_eq!(policy.delay(1), Duration::from_secs(1));
    }
}
