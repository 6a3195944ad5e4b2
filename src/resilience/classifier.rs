use std::fmt;

use serde::{Deserialize, Serialize};

/// Category a failure falls into. Selects the recovery strategy applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Authentication,
    Storage,
    Configuration,
    Temporary,
    Permanent,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Network,
        ErrorCategory::RateLimit,
        ErrorCategory::Authentication,
        ErrorCategory::Storage,
        ErrorCategory::Configuration,
        ErrorCategory::Temporary,
        ErrorCategory::Permanent,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Temporary => "temporary",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pattern groups in precedence order. The first group with a match wins.
const PATTERNS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Configuration,
        &[
            "invalid configuration",
            "configuration error",
            "config error",
            "missing required",
            "not configured",
            "invalid region",
            "invalid bucket name",
            "invalid argument",
            "unknown engine",
            "not registered",
            "no transform handler",
            "malformed",
        ],
    ),
    (
        ErrorCategory::Authentication,
        &[
            "access denied",
            "accessdenied",
            "unauthorized",
            "forbidden",
            "invalid credentials",
            "no credentials",
            "expired token",
            "token expired",
            "expiredtoken",
            "signaturedoesnotmatch",
            "invalidaccesskeyid",
            "authentication",
            "status 401",
            "status 403",
        ],
    ),
    (
        ErrorCategory::RateLimit,
        &[
            "rate limit",
            "ratelimit",
            "rate exceeded",
            "throttl",
            "slowdown",
            "slow down",
            "too many requests",
            "requestlimitexceeded",
            "status 429",
        ],
    ),
    (
        ErrorCategory::Network,
        &[
            "timeout",
            "timed out",
            "connection",
            "network",
            "dns",
            "unreachable",
            "reset by peer",
            "broken pipe",
            "unexpected eof",
        ],
    ),
    (
        ErrorCategory::Storage,
        &[
            "no space left",
            "disk full",
            "quota exceeded",
            "insufficient storage",
            "nosuchbucket",
            "bucket",
            "storage",
            "internal error",
            "entitytoolarge",
            "status 500",
            "status 503",
        ],
    ),
    (
        ErrorCategory::Permanent,
        &[
            "not found",
            "no such file",
            "does not exist",
            "permission denied",
            "unsupported",
            "invalid",
        ],
    ),
    (
        ErrorCategory::Temporary,
        &[
            "temporary",
            "temporarily",
            "try again",
            "unavailable",
            "busy",
            "interrupted",
        ],
    ),
];

/// Maps raw failure text to an [`ErrorCategory`] by ordered substring matching.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(message: &str) -> ErrorCategory {
        let lower = message.to_lowercase();
        PATTERNS
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::Unknown)
    }

    /// Classifies an `anyhow` error using its whole context chain.
    pub fn classify_error(err: &anyhow::Error) -> ErrorCategory {
        Self::classify(&format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_each_category() {
        let cases = [
            ("connection refused", ErrorCategory::Network),
            ("operation timed out", ErrorCategory::Network),
            ("SlowDown: please reduce your request rate", ErrorCategory::RateLimit),
            ("AccessDenied: not allowed", ErrorCategory::Authentication),
            ("NoSuchBucket: the bucket does not exist", ErrorCategory::Storage),
            ("missing required field 'destination'", ErrorCategory::Configuration),
            ("resource temporarily unavailable", ErrorCategory::Temporary),
            ("no such file or directory", ErrorCategory::Permanent),
            ("something odd happened", ErrorCategory::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(ErrorClassifier::classify(message), expected, "{message}");
        }
    }

    #[test]
    fn configuration_wins_over_network() {
        let message = "invalid configuration: connection endpoint timeout must be positive";
        assert_eq!(
            ErrorClassifier::classify(message),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn authentication_wins_over_rate_limit() {
        let message = "token expired while throttled";
        assert_eq!(
            ErrorClassifier::classify(message),
            ErrorCategory::Authentication
        );
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(
            ErrorClassifier::classify("CONNECTION RESET BY PEER"),
            ErrorCategory::Network
        );
    }

    #[test]
    fn classify_error_reads_context_chain() {
        let err = anyhow::anyhow!("socket closed").context("upload of part 3 failed");
        assert_eq!(ErrorClassifier::classify_error(&err), ErrorCategory::Unknown);

        let err = anyhow::anyhow!("connection reset").context("upload of part 3 failed");
        assert_eq!(ErrorClassifier::classify_error(&err), ErrorCategory::Network);
    }

    #[test]
    fn display_matches_serde_name() {
        assert_eq!(ErrorCategory::RateLimit.to_string(), "rate_limit");
        let json = serde_json::to_string(&ErrorCategory::RateLimit).unwrap();
        assert_eq!(json, "\"rate_limit\"");
    }
}
