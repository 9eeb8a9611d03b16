//! Per-target circuit breaker
//!
//! State transitions:
//! - closed: record outcomes; `failure_threshold` consecutive failures
//!   inside the window opens the circuit
//! - open: fail fast; after `cooldown` one probe is admitted
//! - half_open: exactly one in-flight probe; success closes the
//!   circuit and resets counters, failure reopens it
//!
//! State is mutated only under the per-target mutex, and the mutex is
//! never held across I/O.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use orbit_config::FaultToleranceConfig;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission decision for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call proceeds
    Allowed,
    /// Circuit half-open; this call is the single probe
    Probe,
    /// Circuit open; fail fast without an outbound call
    Rejected,
}

/// Point-in-time view for the health surface
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub seconds_since_transition: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_class: Option<String>,
    /// Success rate over the rolling window, absent with no samples
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_success_rate: Option<f32>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_transition: Instant,
    last_error_class: Option<String>,
    /// (when, success) samples inside the sliding window
    outcomes: VecDeque<(Instant, bool)>,
    probe_in_flight: bool,
}

/// Circuit breaker for one `(target_kind, target_name)` pair.
pub struct CircuitBreaker {
    target: String,
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: &FaultToleranceConfig) -> Self {
        Self {
            target: target.into(),
            failure_threshold: config.failure_threshold.max(1),
            window: Duration::from_secs(config.window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_transition: Instant::now(),
                last_error_class: None,
                outcomes: VecDeque::new(),
                probe_in_flight: false,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Decide whether a call may go out now.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_transition = Instant::now();
                    inner.probe_in_flight = true;
                    tracing::info!(target = %self.target, "circuit half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        self.push_outcome(&mut inner, true);
        inner.consecutive_failures = 0;

        if admission == Admission::Probe || inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            if inner.state != CircuitState::Closed {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.last_transition = Instant::now();
                tracing::info!(target = %self.target, "circuit closed");
                metrics::counter!("orbit_circuit_transitions_total", "target" => self.target.clone(), "to" => "closed").increment(1);
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, _admission: Admission, error_class: &str) {
        let mut inner = self.inner.lock();
        self.push_outcome(&mut inner, false);
        inner.last_error_class = Some(error_class.to_string());

        match inner.state {
            CircuitState::HalfOpen => {
                // Probe failed: back to open, restart the cooldown
                inner.probe_in_flight = false;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.last_transition = Instant::now();
                tracing::warn!(target = %self.target, "probe failed, circuit reopened");
                metrics::counter!("orbit_circuit_transitions_total", "target" => self.target.clone(), "to" => "open").increment(1);
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                let in_window = inner
                    .outcomes
                    .iter()
                    .filter(|(when, ok)| !ok && when.elapsed() <= self.window)
                    .count() as u32;
                if inner.consecutive_failures >= self.failure_threshold
                    && in_window >= self.failure_threshold
                {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.last_transition = Instant::now();
                    tracing::warn!(
                        target = %self.target,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                    metrics::counter!("orbit_circuit_transitions_total", "target" => self.target.clone(), "to" => "open").increment(1);
                }
            }
            CircuitState::Open => {
                // Late failure from a call admitted before opening
                inner.consecutive_failures += 1;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        let window = self.window;
        let samples: Vec<bool> = inner
            .outcomes
            .iter()
            .filter(|(when, _)| when.elapsed() <= window)
            .map(|(_, ok)| *ok)
            .collect();
        let rolling_success_rate = if samples.is_empty() {
            None
        } else {
            Some(samples.iter().filter(|ok| **ok).count() as f32 / samples.len() as f32)
        };

        CircuitSnapshot {
            target: self.target.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            seconds_since_transition: inner.last_transition.elapsed().as_secs(),
            last_error_class: inner.last_error_class.clone(),
            rolling_success_rate,
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, success: bool) {
        let now = Instant::now();
        inner.outcomes.push_back((now, success));
        while let Some((when, _)) = inner.outcomes.front() {
            if now.duration_since(*when) > self.window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FaultToleranceConfig {
        FaultToleranceConfig {
            failure_threshold: 3,
            window_secs: 60,
            cooldown_secs: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("inference:ollama", &config());
        for _ in 0..3 {
            assert_eq!(breaker.admit(), Admission::Allowed);
            breaker.record_failure(Admission::Allowed, "upstream_transient");
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("inference:ollama", &config());
        breaker.record_failure(Admission::Allowed, "upstream_transient");
        breaker.record_failure(Admission::Allowed, "upstream_transient");
        breaker.record_success(Admission::Allowed);
        breaker.record_failure(Admission::Allowed, "upstream_transient");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_probe_success_closes() {
        let breaker = CircuitBreaker::new("retriever:qa", &config());
        for _ in 0..3 {
            breaker.record_failure(Admission::Allowed, "upstream_transient");
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // cooldown_secs = 0, so the next admit is the probe
        let admission = breaker.admit();
        assert_eq!(admission, Admission::Probe);
        // A second caller is rejected while the probe is in flight
        assert_eq!(breaker.admit(), Admission::Rejected);

        breaker.record_success(admission);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("retriever:qa", &config());
        for _ in 0..3 {
            breaker.record_failure(Admission::Allowed, "upstream_transient");
        }
        let admission = breaker.admit();
        assert_eq!(admission, Admission::Probe);
        breaker.record_failure(admission, "upstream_transient");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_rejects_without_cooldown() {
        let cfg = FaultToleranceConfig {
            failure_threshold: 1,
            cooldown_secs: 3600,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new("inference:openai", &cfg);
        breaker.record_failure(Admission::Allowed, "upstream_transient");
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[test]
    fn test_snapshot_fields() {
        let breaker = CircuitBreaker::new("inference:ollama", &config());
        breaker.record_success(Admission::Allowed);
        breaker.record_failure(Admission::Allowed, "upstream_transient");

        let snap = breaker.snapshot();
        assert_eq!(snap.target, "inference:ollama");
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.rolling_success_rate, Some(0.5));
        assert_eq!(snap.last_error_class.as_deref(), Some("upstream_transient"));
    }
}
