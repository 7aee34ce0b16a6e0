use std::time::Duration;

use mplp_core::config::EngineConfig;

/// Backoff settings for retried steps.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }

    /// Delay before retry number `attempt` (0-based): exponential, capped,
    /// with 0.8x to 1.2x jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        // Add jitter: 0.8x to 1.2x
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        let first = policy.backoff(0).as_millis() as u64;
        assert!((80..=120).contains(&first), "{first}");

        let third = policy.backoff(2).as_millis() as u64;
        assert!((320..=480).contains(&third), "{third}");

        let capped = policy.backoff(20).as_millis() as u64;
        assert!((800..=1200).contains(&capped), "{capped}");
    }

    #[test]
    fn test_zero_backoff() {
        let policy = RetryPolicy {
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        };
        assert_eq!(policy.backoff(3), Duration::ZERO);
    }
}
