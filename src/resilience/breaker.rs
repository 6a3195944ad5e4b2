//! Per-operation circuit breakers.
//!
//! Closed (normal) → Open after `error_threshold` consecutive errors.
//! Open → Half-Open once `recovery_timeout` has passed since the last failure;
//! exactly `half_open_max_calls` probes are then admitted. That many
//! consecutive successes close the circuit, a single failure reopens it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Consecutive errors further apart than this start a fresh count.
    #[serde(default = "default_time_window", with = "humantime_serde")]
    pub time_window: Duration,
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_error_threshold() -> u32 {
    5
}

fn default_time_window() -> Duration {
    Duration::from_secs(300)
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            time_window: default_time_window(),
            recovery_timeout: default_recovery_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_errors: u32,
    last_failure: Option<Instant>,
    half_open_calls: u32,
    half_open_successes: u32,
}

/// Snapshot of a breaker for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub operation: String,
    pub state: CircuitState,
    pub consecutive_errors: u32,
    pub half_open_calls: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    operation: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(operation: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let operation = operation.into();
        debug!(
            operation = %operation,
            error_threshold = config.error_threshold,
            recovery_timeout_secs = config.recovery_timeout.as_secs(),
            "circuit breaker created"
        );
        Self {
            operation,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_errors: 0,
                last_failure: None,
                half_open_calls: 0,
                half_open_successes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        BreakerStatus {
            operation: self.operation.clone(),
            state: inner.state,
            consecutive_errors: inner.consecutive_errors,
            half_open_calls: inner.half_open_calls,
        }
    }

    /// Whether the guarded operation may run now. Admitting a half-open probe
    /// consumes one of the probe slots.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
                if !cooled_down {
                    return false;
                }
                info!(operation = %self.operation, "circuit half-open, admitting probes");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_calls = 1;
                inner.half_open_successes = 0;
                true
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_errors = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_calls {
                    info!(operation = %self.operation, "circuit closed after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_errors = 0;
                    inner.half_open_calls = 0;
                    inner.half_open_successes = 0;
                }
            }
            CircuitState::Open => {
                warn!(operation = %self.operation, "success recorded while circuit is open");
            }
        }
    }

    pub fn record_error(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                let stale = inner
                    .last_failure
                    .is_some_and(|at| now.duration_since(at) > self.config.time_window);
                if stale {
                    inner.consecutive_errors = 0;
                }
                inner.consecutive_errors += 1;
                inner.last_failure = Some(now);
                if inner.consecutive_errors >= self.config.error_threshold {
                    warn!(
                        operation = %self.operation,
                        errors = inner.consecutive_errors,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(operation = %self.operation, "probe failed, circuit reopened");
                inner.state = CircuitState::Open;
                inner.last_failure = Some(now);
                inner.half_open_calls = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {
                inner.consecutive_errors += 1;
                inner.last_failure = Some(now);
            }
        }
    }
}

/// Breakers keyed by operation name, created lazily on first use.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub async fn get(&self, operation: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(operation) {
            return Arc::clone(existing);
        }
        let mut breakers = self.breakers.write().await;
        Arc::clone(
            breakers
                .entry(operation.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, self.config.clone()))),
        )
    }

    pub async fn status(&self) -> Vec<BreakerStatus> {
        let breakers = self.breakers.read().await;
        let mut statuses: Vec<_> = breakers.values().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.operation.cmp(&b.operation));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "upload:s3",
            CircuitBreakerConfig {
                error_threshold: threshold,
                time_window: Duration::from_secs(600),
                recovery_timeout: recovery,
                half_open_max_calls: probes,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_exactly_threshold_errors() {
        let cb = breaker(3, Duration::from_secs(120), 1);
        cb.record_error();
        cb.record_error();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
        cb.record_error();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_count() {
        let cb = breaker(3, Duration::from_secs(120), 1);
        cb.record_error();
        cb.record_error();
        cb.record_success();
        cb.record_error();
        cb.record_error();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_until_recovery_timeout_elapses() {
        let cb = breaker(3, Duration::from_secs(120), 1);
        for _ in 0..3 {
            cb.record_error();
        }
        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(!cb.allow_request());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_only_probe_budget() {
        let cb = breaker(1, Duration::from_secs(10), 2);
        cb.record_error();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(!cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_successes_close_the_circuit() {
        let cb = breaker(1, Duration::from_secs(10), 2);
        cb.record_error();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.allow_request());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens() {
        let cb = breaker(1, Duration::from_secs(10), 3);
        cb.record_error();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.allow_request());
        cb.record_error();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_errors_do_not_accumulate() {
        let cb = CircuitBreaker::new(
            "download",
            CircuitBreakerConfig {
                error_threshold: 2,
                time_window: Duration::from_secs(60),
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
        );
        cb.record_error();
        tokio::time::advance(Duration::from_secs(61)).await;
        cb.record_error();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_error();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn registry_reuses_breakers_per_operation() {
        let breakers = CircuitBreakers::new(CircuitBreakerConfig::default());
        let a = breakers.get("upload").await;
        let b = breakers.get("upload").await;
        let c = breakers.get("download").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(breakers.status().await.len(), 2);
    }
}
