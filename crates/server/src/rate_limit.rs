//! Per-key token-bucket rate limiter for chat ingress

use std::time::Instant;

use dashmap::DashMap;

use orbit_config::RateLimitConfig;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per API key. Refills continuously at
/// `requests_per_minute / 60` per second up to `burst`.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, buckets: DashMap::new() }
    }

    /// Try to take one token for `key`. Always allows when disabled.
    pub fn check(&self, key: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        let rate_per_sec = f64::from(self.config.requests_per_minute) / 60.0;
        let burst = f64::from(self.config.burst.max(1));

        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: burst,
            last_refill: Instant::now(),
        });

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_always_allows() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..1000 {
            assert!(limiter.check("key"));
        }
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests_per_minute: 60,
            burst: 3,
        });

        assert!(limiter.check("key"));
        assert!(limiter.check("key"));
        assert!(limiter.check("key"));
        assert!(!limiter.check("key"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests_per_minute: 60,
            burst: 1,
        });

        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }
}
