#![warn(missing_docs)]

//! Typed error types for the docq collaborator traits.
//!
//! [`StoreError`] is returned by `DocumentStore` implementations and
//! [`CompletionError`] by `CompletionService` implementations.

use thiserror::Error;

/// Canonical error type for document store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The command, filter, or update document was malformed.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// An insert collided with an existing `_id`.
    #[error("duplicate key in collection '{collection}': {id}")]
    DuplicateKey {
        /// The collection the insert targeted.
        collection: String,
        /// The colliding identifier.
        id: String,
    },

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation timed out.
    #[error("store operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// A per-execution call limit was exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCommand(_) => "INVALID_COMMAND",
            Self::DuplicateKey { .. } => "DUPLICATE_KEY",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::RateLimit(_) => "RATE_LIMIT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Timeout { .. } => true,
            Self::RateLimit(_) => true,
            Self::InvalidCommand(_) => false,
            Self::DuplicateKey { .. } => false,
            Self::Internal(_) => false,
        }
    }
}

/// Canonical error type for completion service calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompletionError {
    /// The service could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The credential was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The account is out of quota or rate limited.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// The service answered with a non-success status.
    #[error("upstream error (HTTP {status}): {message}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body or error message from the service.
        message: String,
    },

    /// The response body did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The service answered without any candidate.
    #[error("completion service returned no candidates")]
    EmptyResponse,

    /// The call exceeded its deadline.
    #[error("completion timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CompletionError {
    /// Classify a non-success HTTP status and its body.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Auth(body),
            429 => Self::Quota(body),
            _ => Self::Upstream {
                status,
                message: body,
            },
        }
    }

    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "NETWORK",
            Self::Auth(_) => "AUTH",
            Self::Quota(_) => "QUOTA",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::MalformedResponse(_) => "MALFORMED_RESPONSE",
            Self::EmptyResponse => "EMPTY_RESPONSE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the call may succeed if the caller retries it.
    ///
    /// The pipeline itself never retries; this is advice for callers.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Quota(_) => true,
            Self::Timeout { .. } => true,
            Self::Upstream { status, .. } => *status >= 500,
            Self::Auth(_) => false,
            Self::MalformedResponse(_) => false,
            Self::EmptyResponse => false,
            Self::Internal(_) => false,
        }
    }
}

// Compile-time assertion: both error types must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<StoreError>();
    assert_bounds::<CompletionError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_command() {
        let err = StoreError::InvalidCommand("unknown operator $foo".into());
        assert_eq!(err.to_string(), "invalid command: unknown operator $foo");
    }

    #[test]
    fn display_duplicate_key() {
        let err = StoreError::DuplicateKey {
            collection: "users".into(),
            id: "abc".into(),
        };
        assert_eq!(err.to_string(), "duplicate key in collection 'users': abc");
    }

    #[test]
    fn display_store_timeout() {
        let err = StoreError::Timeout { timeout_ms: 250 };
        assert_eq!(err.to_string(), "store operation timed out after 250ms");
    }

    #[test]
    fn store_internal_is_display_transparent() {
        let err = StoreError::Internal(anyhow::anyhow!("root cause"));
        assert_eq!(err.to_string(), "root cause");
    }

    #[test]
    fn store_code_exhaustive() {
        let cases: Vec<(StoreError, &str)> = vec![
            (StoreError::InvalidCommand("x".into()), "INVALID_COMMAND"),
            (
                StoreError::DuplicateKey {
                    collection: "c".into(),
                    id: "i".into(),
                },
                "DUPLICATE_KEY",
            ),
            (StoreError::Unavailable("x".into()), "UNAVAILABLE"),
            (StoreError::Timeout { timeout_ms: 1 }, "TIMEOUT"),
            (StoreError::RateLimit("x".into()), "RATE_LIMIT"),
            (StoreError::Internal(anyhow::anyhow!("x")), "INTERNAL"),
        ];
        for (err, expected) in &cases {
            assert_eq!(err.code(), *expected, "wrong code for {err}");
        }
    }

    #[test]
    fn store_retryable_cases() {
        assert!(StoreError::Unavailable("down".into()).retryable());
        assert!(StoreError::Timeout { timeout_ms: 5 }.retryable());
        assert!(!StoreError::InvalidCommand("bad".into()).retryable());
        assert!(!StoreError::DuplicateKey {
            collection: "c".into(),
            id: "1".into()
        }
        .retryable());
    }

    #[test]
    fn from_status_classifies_auth_and_quota() {
        assert!(matches!(
            CompletionError::from_status(401, "bad key"),
            CompletionError::Auth(_)
        ));
        assert!(matches!(
            CompletionError::from_status(403, "forbidden"),
            CompletionError::Auth(_)
        ));
        assert!(matches!(
            CompletionError::from_status(429, "slow down"),
            CompletionError::Quota(_)
        ));
        let err = CompletionError::from_status(502, "bad gateway");
        assert!(matches!(err, CompletionError::Upstream { status: 502, .. }));
        assert!(err.retryable());
        assert!(!CompletionError::from_status(400, "bad request").retryable());
    }

    #[test]
    fn completion_code_exhaustive() {
        let cases: Vec<(CompletionError, &str)> = vec![
            (CompletionError::Network("x".into()), "NETWORK"),
            (CompletionError::Auth("x".into()), "AUTH"),
            (CompletionError::Quota("x".into()), "QUOTA"),
            (
                CompletionError::Upstream {
                    status: 500,
                    message: "m".into(),
                },
                "UPSTREAM_ERROR",
            ),
            (
                CompletionError::MalformedResponse("x".into()),
                "MALFORMED_RESPONSE",
            ),
            (CompletionError::EmptyResponse, "EMPTY_RESPONSE"),
            (CompletionError::Timeout { timeout_ms: 1 }, "TIMEOUT"),
            (CompletionError::Internal(anyhow::anyhow!("x")), "INTERNAL"),
        ];
        for (err, expected) in &cases {
            assert_eq!(err.code(), *expected, "wrong code for {err}");
        }
    }

    #[test]
    fn display_completion_timeout() {
        let err = CompletionError::Timeout { timeout_ms: 30000 };
        assert_eq!(err.to_string(), "completion timed out after 30000ms");
    }

    #[test]
    fn from_anyhow_error() {
        let err: CompletionError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, CompletionError::Internal(_)));
        let err: StoreError = anyhow::anyhow!("boom").into();
        assert_eq!(err.code(), "INTERNAL");
    }
}
