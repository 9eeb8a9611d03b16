//! Fault-tolerance supervisor
//!
//! Wraps every outbound retriever and inference call in a per-target
//! circuit breaker with retry. Breakers are created lazily per
//! `(target_kind, target_name)` key, e.g. `retriever:qa-chroma` or
//! `inference:ollama`. No lock is held across I/O.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;

use orbit_config::FaultToleranceConfig;
use orbit_core::{Error, Result};

use crate::breaker::{Admission, CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::retry::RetryPolicy;

/// Supervisor over all outbound targets.
pub struct Supervisor {
    config: FaultToleranceConfig,
    retry: RetryPolicy,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Supervisor {
    pub fn new(config: FaultToleranceConfig) -> Self {
        let retry = RetryPolicy::new(&config);
        Self { config, retry, breakers: DashMap::new() }
    }

    fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, &self.config)))
            .clone()
    }

    /// Run `op` against `target` with retry and circuit protection.
    ///
    /// Only transient errors are retried; retries count toward the
    /// circuit-failure counter only after the final attempt. While the
    /// circuit is open this returns `upstream_unavailable` without
    /// calling out.
    pub async fn call<T, F, Fut>(&self, target: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(target);

        let admission = breaker.admit();
        if admission == Admission::Rejected {
            metrics::counter!("orbit_supervisor_rejected_total", "target" => target.to_string())
                .increment(1);
            return Err(Error::UpstreamUnavailable { target: target.to_string() });
        }

        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    breaker.record_success(admission);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let backoff = self.retry.backoff(attempt);
                    tracing::warn!(
                        target,
                        attempt,
                        max = self.retry.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient upstream failure, retrying"
                    );
                    metrics::counter!("orbit_supervisor_retries_total", "target" => target.to_string())
                        .increment(1);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        breaker.record_failure(admission, e.class());
                    } else if admission == Admission::Probe {
                        // A permanent error still resolves the probe:
                        // the target answered, so the circuit closes.
                        breaker.record_success(admission);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Record a failure observed outside `call` (e.g. mid-stream).
    pub fn record_external_failure(&self, target: &str, error: &Error) {
        if error.is_transient() {
            self.breaker(target).record_failure(Admission::Allowed, error.class());
        }
    }

    /// Current state for one target, if it has been exercised.
    pub fn state(&self, target: &str) -> Option<CircuitState> {
        self.breakers.get(target).map(|b| b.state())
    }

    /// Snapshots of every known target, sorted by target key.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snaps: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.target.cmp(&b.target));
        snaps
    }

    /// Readiness: no exercised target may be open.
    pub fn all_closed(&self) -> bool {
        self.breakers.iter().all(|b| b.state() != CircuitState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn supervisor(max_retries: u32, failure_threshold: u32) -> Supervisor {
        Supervisor::new(FaultToleranceConfig {
            failure_threshold,
            window_secs: 60,
            cooldown_secs: 3600,
            max_retries,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        })
    }

    fn transient() -> Error {
        Error::UpstreamTransient { target: "t".into(), message: "503".into() }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let supervisor = supervisor(3, 5);
        let calls = AtomicU32::new(0);

        let result = supervisor
            .call("inference:ollama", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok("response")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "response");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Intermediate retries never reach the breaker
        assert_eq!(supervisor.state("inference:ollama"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let supervisor = supervisor(3, 5);
        let calls = AtomicU32::new(0);

        let result: Result<()> = supervisor
            .call("inference:openai", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::UpstreamPermanent {
                        target: "inference:openai".into(),
                        message: "quota".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.state("inference:openai"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_circuit_opens_and_fails_fast() {
        let supervisor = supervisor(0, 3);

        for _ in 0..3 {
            let _: Result<()> =
                supervisor.call("retriever:qa", || async { Err(transient()) }).await;
        }
        assert_eq!(supervisor.state("retriever:qa"), Some(CircuitState::Open));
        assert!(!supervisor.all_closed());

        // Open circuit: no outbound call happens
        let calls = AtomicU32::new(0);
        let result: Result<()> = supervisor
            .call("retriever:qa", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(Error::UpstreamUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_targets_are_isolated() {
        let supervisor = supervisor(0, 1);
        let _: Result<()> = supervisor.call("retriever:bad", || async { Err(transient()) }).await;

        assert_eq!(supervisor.state("retriever:bad"), Some(CircuitState::Open));
        let ok = supervisor.call("retriever:good", || async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_snapshots_sorted() {
        let supervisor = supervisor(0, 5);
        let _ = supervisor.call("b:target", || async { Ok(()) }).await;
        let _ = supervisor.call("a:target", || async { Ok(()) }).await;

        let snaps = supervisor.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].target, "a:target");
    }
}
