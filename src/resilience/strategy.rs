use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::breaker::CircuitBreakerConfig;
use super::classifier::{ErrorCategory, ErrorClassifier};

/// Absolute cap on attempts, whatever a strategy asks for.
pub const MAX_TOTAL_ATTEMPTS: u32 = 10;

/// Retry policy for one [`ErrorCategory`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub category: ErrorCategory,
    /// Total attempts allowed, the first one included.
    pub max_retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    pub exponential_backoff: bool,
    pub backoff_multiplier: f64,
    /// Substrings an error must contain to be retried at all.
    pub retryable_errors: Vec<String>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl RecoveryStrategy {
    /// Delay before retry number `retry` (zero-based), capped at `max_retry_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if !self.exponential_backoff {
            return self.base_retry_delay.min(self.max_retry_delay);
        }
        let factor = self.backoff_multiplier.max(1.0).powi(retry.min(64) as i32);
        let secs = self.base_retry_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_retry_delay.as_secs_f64() {
            self.max_retry_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn is_retryable(&self, message: &str) -> bool {
        if self.base_retry_delay.is_zero() {
            return false;
        }
        let lower = message.to_lowercase();
        self.retryable_errors
            .iter()
            .any(|needle| lower.contains(&needle.to_lowercase()))
    }

    fn fail_fast(category: ErrorCategory) -> Self {
        Self {
            category,
            max_retry_attempts: 1,
            base_retry_delay: Duration::ZERO,
            max_retry_delay: Duration::ZERO,
            exponential_backoff: false,
            backoff_multiplier: 1.0,
            retryable_errors: Vec::new(),
            circuit_breaker: None,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Built-in strategy for each category.
pub fn default_strategy(category: ErrorCategory) -> RecoveryStrategy {
    match category {
        ErrorCategory::Network => RecoveryStrategy {
            category,
            max_retry_attempts: 5,
            base_retry_delay: secs(2),
            max_retry_delay: secs(60),
            exponential_backoff: true,
            backoff_multiplier: 2.0,
            retryable_errors: strings(&[
                "timeout",
                "timed out",
                "connection",
                "network",
                "reset by peer",
                "broken pipe",
                "unreachable",
                "unexpected eof",
            ]),
            circuit_breaker: Some(CircuitBreakerConfig {
                error_threshold: 5,
                time_window: secs(300),
                recovery_timeout: secs(120),
                half_open_max_calls: 3,
            }),
        },
        ErrorCategory::RateLimit => RecoveryStrategy {
            category,
            max_retry_attempts: 8,
            base_retry_delay: secs(5),
            max_retry_delay: secs(300),
            exponential_backoff: true,
            backoff_multiplier: 2.0,
            retryable_errors: strings(&[
                "rate limit",
                "rate exceeded",
                "throttl",
                "slowdown",
                "slow down",
                "too many requests",
                "requestlimitexceeded",
            ]),
            circuit_breaker: Some(CircuitBreakerConfig {
                error_threshold: 10,
                time_window: secs(600),
                recovery_timeout: secs(300),
                half_open_max_calls: 2,
            }),
        },
        ErrorCategory::Authentication => RecoveryStrategy {
            category,
            max_retry_attempts: 2,
            base_retry_delay: secs(1),
            max_retry_delay: secs(5),
            exponential_backoff: false,
            backoff_multiplier: 1.0,
            retryable_errors: strings(&["token expired", "expired token", "expiredtoken"]),
            circuit_breaker: Some(CircuitBreakerConfig {
                error_threshold: 3,
                time_window: secs(300),
                recovery_timeout: secs(600),
                half_open_max_calls: 1,
            }),
        },
        ErrorCategory::Storage => RecoveryStrategy {
            category,
            max_retry_attempts: 3,
            base_retry_delay: secs(5),
            max_retry_delay: secs(60),
            exponential_backoff: true,
            backoff_multiplier: 1.5,
            retryable_errors: strings(&[
                "internal error",
                "service unavailable",
                "status 500",
                "status 503",
                "insufficient storage",
            ]),
            circuit_breaker: Some(CircuitBreakerConfig {
                error_threshold: 5,
                time_window: secs(300),
                recovery_timeout: secs(180),
                half_open_max_calls: 2,
            }),
        },
        ErrorCategory::Temporary => RecoveryStrategy {
            category,
            max_retry_attempts: 5,
            base_retry_delay: secs(1),
            max_retry_delay: secs(30),
            exponential_backoff: true,
            backoff_multiplier: 2.0,
            retryable_errors: strings(&[
                "temporary",
                "temporarily",
                "try again",
                "unavailable",
                "busy",
                "interrupted",
            ]),
            circuit_breaker: None,
        },
        ErrorCategory::Unknown => RecoveryStrategy {
            category,
            max_retry_attempts: 3,
            base_retry_delay: secs(2),
            max_retry_delay: secs(30),
            exponential_backoff: true,
            backoff_multiplier: 2.0,
            retryable_errors: strings(&["timeout", "connection", "temporary", "unavailable"]),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
        },
        ErrorCategory::Configuration | ErrorCategory::Permanent => {
            RecoveryStrategy::fail_fast(category)
        }
    }
}

/// Remediation hints surfaced when recovery gives up.
pub fn suggestions_for(category: ErrorCategory) -> Vec<String> {
    let hints: &[&str] = match category {
        ErrorCategory::Network => &[
            "Check connectivity to the storage endpoint",
            "Reduce transfer concurrency on unstable links",
            "Verify proxy and firewall settings",
        ],
        ErrorCategory::RateLimit => &[
            "Lower the number of concurrent transfers",
            "Spread uploads across more key prefixes",
            "Request a higher request-rate quota from the provider",
        ],
        ErrorCategory::Authentication => &[
            "Refresh credentials for the selected profile",
            "Verify the IAM policy grants access to the bucket",
            "Check the system clock for skew",
        ],
        ErrorCategory::Storage => &[
            "Verify the bucket exists in the expected region",
            "Check the storage quota of the destination",
            "Retry with a smaller part size",
        ],
        ErrorCategory::Configuration => &[
            "Review the workflow definition for missing or invalid fields",
            "Run `ferryman validate` on the project file",
        ],
        ErrorCategory::Temporary => &["Retry later, the service reported a transient condition"],
        ErrorCategory::Permanent => &[
            "Fix the input: the operation cannot succeed as requested",
            "Check that source paths exist and are readable",
        ],
        ErrorCategory::Unknown => &[
            "Inspect the execution event log for the full error",
            "Re-run with RUST_LOG=debug for more detail",
        ],
    };
    hints.iter().map(|s| s.to_string()).collect()
}

/// What the policy says to do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry {
        category: ErrorCategory,
        delay: Duration,
    },
    GiveUp {
        category: ErrorCategory,
        reason: GiveUpReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    /// The strategy's attempt budget (or the global cap) is spent.
    AttemptsExhausted,
    /// The error text isn't on the strategy's retry allowlist.
    NotRetryable,
}

/// The one retry abstraction shared by step and job execution.
///
/// Maps each [`ErrorCategory`] to a [`RecoveryStrategy`] and decides, for a
/// failed attempt, whether and when to try again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    strategies: HashMap<ErrorCategory, RecoveryStrategy>,
    attempt_ceiling: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategies: ErrorCategory::ALL
                .into_iter()
                .map(|c| (c, default_strategy(c)))
                .collect(),
            attempt_ceiling: MAX_TOTAL_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn with_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategies.insert(strategy.category, strategy);
        self
    }

    /// Turns every retryable strategy into a fixed-delay one with
    /// `retry_attempts` extra tries. Fail-fast categories stay fail-fast.
    pub fn with_fixed_limits(mut self, retry_attempts: u32, retry_delay: Duration) -> Self {
        for strategy in self.strategies.values_mut() {
            if strategy.base_retry_delay.is_zero() {
                continue;
            }
            strategy.max_retry_attempts = retry_attempts.saturating_add(1);
            strategy.base_retry_delay = retry_delay;
            strategy.max_retry_delay = retry_delay;
            strategy.exponential_backoff = false;
            strategy.backoff_multiplier = 1.0;
            if retry_delay.is_zero() {
                // keep the strategy retryable with an immediate retry
                strategy.base_retry_delay = Duration::from_millis(1);
                strategy.max_retry_delay = Duration::from_millis(1);
            }
        }
        self
    }

    pub fn strategy(&self, category: ErrorCategory) -> RecoveryStrategy {
        self.strategies
            .get(&category)
            .cloned()
            .unwrap_or_else(|| default_strategy(category))
    }

    pub fn attempt_ceiling(&self) -> u32 {
        self.attempt_ceiling
    }

    /// Decides what follows failed attempt number `attempt` (1-based).
    pub fn decide(&self, attempt: u32, message: &str) -> RetryDecision {
        let category = ErrorClassifier::classify(message);
        let strategy = self.strategy(category);

        if attempt >= strategy.max_retry_attempts || attempt >= self.attempt_ceiling {
            return RetryDecision::GiveUp {
                category,
                reason: GiveUpReason::AttemptsExhausted,
            };
        }
        if !strategy.is_retryable(message) {
            return RetryDecision::GiveUp {
                category,
                reason: GiveUpReason::NotRetryable,
            };
        }
        RetryDecision::Retry {
            category,
            delay: strategy.delay_for(attempt - 1),
        }
    }
}
