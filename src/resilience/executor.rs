use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::breaker::{CircuitBreakerConfig, CircuitBreakers};
use super::classifier::{ErrorCategory, ErrorClassifier};
use super::strategy::{GiveUpReason, RetryDecision, RetryPolicy, suggestions_for};
use crate::cancel::CancelHandle;
use crate::error::FerrymanError;

/// Timestamped outcome of one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
    pub category: Option<ErrorCategory>,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Something the recovery loop did, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry {
        attempt: u32,
        category: ErrorCategory,
        delay_ms: u64,
    },
    GiveUp {
        attempt: u32,
        category: ErrorCategory,
        reason: GiveUpReason,
    },
    CircuitRejected {
        attempts: u32,
    },
    Cancelled {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AttemptsExhausted,
    NotRetryable,
    CircuitOpen,
    Cancelled,
}

/// A successful run, possibly after retries.
#[derive(Debug)]
pub struct Recovered<T> {
    pub value: T,
    pub attempts: Vec<AttemptRecord>,
    pub actions: Vec<RecoveryAction>,
}

impl<T> Recovered<T> {
    pub fn retries(&self) -> u32 {
        (self.attempts.len() as u32).saturating_sub(1)
    }
}

/// Final failure of a resilient operation.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{operation} failed after {attempts} attempt(s): {message}")]
pub struct RecoveryFailure {
    pub operation: String,
    pub message: String,
    pub kind: FailureKind,
    pub category: Option<ErrorCategory>,
    pub attempts: u32,
    pub attempt_log: Vec<AttemptRecord>,
    pub actions: Vec<RecoveryAction>,
    pub suggestions: Vec<String>,
    /// Breaker settings the category's strategy recommends.
    pub recommended_breaker: Option<CircuitBreakerConfig>,
}

impl RecoveryFailure {
    pub fn is_circuit_open(&self) -> bool {
        self.kind == FailureKind::CircuitOpen
    }
}

/// Passed to a [`RetryObserver`] before each back-off sleep.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub operation: String,
    pub attempt: u32,
    pub category: ErrorCategory,
    pub delay: Duration,
    pub error: String,
}

#[async_trait]
pub trait RetryObserver: Send + Sync {
    async fn on_retry(&self, notice: &RetryNotice);
}

pub struct NoopObserver;

#[async_trait]
impl RetryObserver for NoopObserver {
    async fn on_retry(&self, _notice: &RetryNotice) {}
}

/// Runs fallible operations under a [`RetryPolicy`] and per-operation breakers.
#[derive(Debug, Clone)]
pub struct ResilienceExecutor {
    policy: RetryPolicy,
    breakers: Arc<CircuitBreakers>,
}

impl ResilienceExecutor {
    pub fn new(policy: RetryPolicy, breakers: Arc<CircuitBreakers>) -> Self {
        Self { policy, breakers }
    }

    /// Same breakers, different policy.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            policy,
            breakers: Arc::clone(&self.breakers),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancelHandle,
        op: F,
    ) -> Result<Recovered<T>, RecoveryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_observed(operation, cancel, &NoopObserver, op)
            .await
    }

    /// Runs `op` (called with the 1-based attempt number) until it succeeds,
    /// the policy gives up, the breaker rejects it, or `cancel` fires during
    /// a back-off sleep.
    pub async fn execute_observed<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancelHandle,
        observer: &dyn RetryObserver,
        mut op: F,
    ) -> Result<Recovered<T>, RecoveryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let breaker = self.breakers.get(operation).await;
        let mut attempt_log = Vec::new();
        let mut actions = Vec::new();
        let mut last: Option<(String, ErrorCategory)> = None;
        let mut attempt = 0u32;

        loop {
            if !breaker.allow_request() {
                debug!(operation, attempts = attempt, "rejected by open circuit");
                actions.push(RecoveryAction::CircuitRejected { attempts: attempt });
                let category = last.as_ref().map(|(_, c)| *c);
                return Err(self.failure(
                    operation,
                    format!("Circuit breaker is open for {operation}"),
                    FailureKind::CircuitOpen,
                    category,
                    attempt_log,
                    actions,
                ));
            }

            attempt += 1;
            let started_at = Utc::now();
            let result = op(attempt).await;
            let finished_at = Utc::now();

            let err = match result {
                Ok(value) => {
                    breaker.record_success();
                    attempt_log.push(AttemptRecord {
                        attempt,
                        started_at,
                        finished_at,
                        error: None,
                        category: None,
                    });
                    return Ok(Recovered {
                        value,
                        attempts: attempt_log,
                        actions,
                    });
                }
                Err(err) => err,
            };

            breaker.record_error();
            let message = format!("{err:#}");
            let decision = match err.downcast_ref::<FerrymanError>() {
                Some(e) if !e.is_retryable() => RetryDecision::GiveUp {
                    category: ErrorClassifier::classify(&message),
                    reason: GiveUpReason::NotRetryable,
                },
                _ => self.policy.decide(attempt, &message),
            };
            let category = match &decision {
                RetryDecision::Retry { category, .. } | RetryDecision::GiveUp { category, .. } => {
                    *category
                }
            };
            attempt_log.push(AttemptRecord {
                attempt,
                started_at,
                finished_at,
                error: Some(message.clone()),
                category: Some(category),
            });

            match decision {
                RetryDecision::Retry { category, delay } => {
                    warn!(
                        operation,
                        attempt,
                        %category,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "attempt failed, retrying"
                    );
                    actions.push(RecoveryAction::Retry {
                        attempt,
                        category,
                        delay_ms: delay.as_millis() as u64,
                    });
                    observer
                        .on_retry(&RetryNotice {
                            operation: operation.to_string(),
                            attempt,
                            category,
                            delay,
                            error: message.clone(),
                        })
                        .await;
                    if !cancel.sleep(delay).await {
                        actions.push(RecoveryAction::Cancelled { attempts: attempt });
                        return Err(self.failure(
                            operation,
                            message,
                            FailureKind::Cancelled,
                            Some(category),
                            attempt_log,
                            actions,
                        ));
                    }
                    last = Some((message, category));
                }
                RetryDecision::GiveUp { category, reason } => {
                    debug!(operation, attempt, %category, ?reason, "giving up");
                    actions.push(RecoveryAction::GiveUp {
                        attempt,
                        category,
                        reason,
                    });
                    let kind = match reason {
                        GiveUpReason::AttemptsExhausted => FailureKind::AttemptsExhausted,
                        GiveUpReason::NotRetryable => FailureKind::NotRetryable,
                    };
                    return Err(self.failure(
                        operation,
                        message,
                        kind,
                        Some(category),
                        attempt_log,
                        actions,
                    ));
                }
            }
        }
    }

    fn failure(
        &self,
        operation: &str,
        message: String,
        kind: FailureKind,
        category: Option<ErrorCategory>,
        attempt_log: Vec<AttemptRecord>,
        actions: Vec<RecoveryAction>,
    ) -> RecoveryFailure {
        let category = category.or_else(|| Some(ErrorClassifier::classify(&message)));
        let (suggestions, recommended_breaker) = match category {
            Some(c) => (suggestions_for(c), self.policy.strategy(c).circuit_breaker),
            None => (Vec::new(), None),
        };
        RecoveryFailure {
            operation: operation.to_string(),
            message,
            kind,
            category,
            attempts: attempt_log.len() as u32,
            attempt_log,
            actions,
            suggestions,
            recommended_breaker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitState, RecoveryStrategy};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(breaker: CircuitBreakerConfig) -> ResilienceExecutor {
        ResilienceExecutor::new(
            RetryPolicy::default(),
            Arc::new(CircuitBreakers::new(breaker)),
        )
    }

    fn lenient_breaker() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            error_threshold: 100,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let exec = executor(lenient_breaker());
        let calls = AtomicU32::new(0);
        let result = exec
            .execute("transfer", &CancelHandle::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        anyhow::bail!("connection timeout")
                    }
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.retries(), 2);
        assert_eq!(result.actions.len(), 2);
        assert!(result.attempts[2].succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_errors_fail_fast() {
        let exec = executor(lenient_breaker());
        let calls = AtomicU32::new(0);
        let failure = exec
            .execute("analyze", &CancelHandle::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("invalid configuration: no destination")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.category, Some(ErrorCategory::Configuration));
        assert_eq!(failure.kind, FailureKind::AttemptsExhausted);
        assert!(!failure.suggestions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spent_pipeline_is_not_retried_even_when_text_looks_transient() {
        let exec = executor(lenient_breaker());
        let calls = AtomicU32::new(0);
        let failure = exec
            .execute("nightly.transfer", &CancelHandle::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(
                        FerrymanError::PipelineFailed {
                            pipeline: "nightly-transfer".into(),
                            status: "failed".into(),
                            errors: vec!["upload bundle-0001: connection timeout".into()],
                        }
                        .into(),
                    )
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.kind, FailureKind::NotRetryable);
        assert_eq!(failure.category, Some(ErrorCategory::Network));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_ordered_actions() {
        let exec = executor(lenient_breaker());
        let failure = exec
            .execute("upload", &CancelHandle::new(), |_| async {
                Err::<(), _>(anyhow::anyhow!("connection reset by peer"))
            })
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 5);
        assert_eq!(failure.actions.len(), 5);
        assert!(matches!(failure.actions[0], RecoveryAction::Retry { attempt: 1, .. }));
        assert!(matches!(
            failure.actions[4],
            RecoveryAction::GiveUp {
                attempt: 5,
                reason: GiveUpReason::AttemptsExhausted,
                ..
            }
        ));
        assert!(failure.recommended_breaker.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn delays_grow_between_attempts() {
        let exec = executor(lenient_breaker());
        let failure = exec
            .execute("upload", &CancelHandle::new(), |_| async {
                Err::<(), _>(anyhow::anyhow!("network unreachable"))
            })
            .await
            .unwrap_err();

        let delays: Vec<u64> = failure
            .actions
            .iter()
            .filter_map(|a| match a {
                RecoveryAction::Retry { delay_ms, .. } => Some(*delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000]);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_consuming_an_attempt() {
        let exec = executor(CircuitBreakerConfig {
            error_threshold: 2,
            time_window: Duration::from_secs(600),
            recovery_timeout: Duration::from_secs(120),
            half_open_max_calls: 1,
        });
        let calls = AtomicU32::new(0);
        let failure = exec
            .execute("sync", &CancelHandle::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("connection refused")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(failure.is_circuit_open());
        assert_eq!(failure.attempts, 2);
        assert_eq!(
            exec.breakers().get("sync").await.state(),
            CircuitState::Open
        );

        let again = exec
            .execute("sync", &CancelHandle::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(again.is_circuit_open());
        assert_eq!(again.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff() {
        let exec = executor(lenient_breaker());
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        let failure = exec
            .execute("upload", &cancel, |_| {
                trigger.cancel();
                async { Err::<(), _>(anyhow::anyhow!("connection timeout")) }
            })
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.attempts, 1);
    }

    struct Recording(Mutex<Vec<u32>>);

    #[async_trait]
    impl RetryObserver for Recording {
        async fn on_retry(&self, notice: &RetryNotice) {
            self.0.lock().unwrap().push(notice.attempt);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_each_retry() {
        let policy = RetryPolicy::default().with_strategy(RecoveryStrategy {
            max_retry_attempts: 3,
            ..crate::resilience::default_strategy(ErrorCategory::Temporary)
        });
        let exec = ResilienceExecutor::new(
            policy,
            Arc::new(CircuitBreakers::new(lenient_breaker())),
        );
        let observer = Recording(Mutex::new(Vec::new()));
        let _ = exec
            .execute_observed("bundle", &CancelHandle::new(), &observer, |_| async {
                Err::<(), _>(anyhow::anyhow!("resource busy, try again"))
            })
            .await;
        assert_eq!(*observer.0.lock().unwrap(), vec![1, 2]);
    }
}
