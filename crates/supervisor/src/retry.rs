//! Retry policy with exponential backoff and jitter

use std::time::Duration;

use rand::Rng;

use orbit_config::FaultToleranceConfig;

/// Per-call retry policy: `base * 2^attempt`, capped, with ±25% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(config: &FaultToleranceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_backoff);

        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        capped.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(&FaultToleranceConfig {
            max_retries: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            ..Default::default()
        })
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        // With ±25% jitter, attempt 1 lies in [75, 125] ms
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));

        // Attempt 5 would be 1600ms uncapped; cap is 1000ms +25%
        let late = policy.backoff(5);
        assert!(late <= Duration::from_millis(1_250));
    }

    #[test]
    fn test_jitter_varies() {
        let policy = policy();
        let samples: Vec<Duration> = (0..16).map(|_| policy.backoff(2)).collect();
        let all_equal = samples.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_equal);
    }
}
