//! Error classification, recovery strategies and circuit breakers.

mod breaker;
mod classifier;
mod executor;
mod strategy;

pub use breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitState};
pub use classifier::{ErrorCategory, ErrorClassifier};
pub use executor::{
    AttemptRecord, FailureKind, NoopObserver, Recovered, RecoveryAction, RecoveryFailure,
    ResilienceExecutor, RetryNotice, RetryObserver,
};
pub use strategy::{
    GiveUpReason, MAX_TOTAL_ATTEMPTS, RecoveryStrategy, RetryDecision, RetryPolicy,
    default_strategy, suggestions_for,
};
