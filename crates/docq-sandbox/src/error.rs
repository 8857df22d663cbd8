//! Error types for the docq sandbox.

use std::fmt;

use thiserror::Error;

/// Which half of a sandbox run a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    /// The source never started running: it failed to parse or was refused
    /// before reaching V8.
    Compile,
    /// The source started running and then threw, timed out, or hit a limit.
    Run,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile => f.write_str("compile"),
            Self::Run => f.write_str("run"),
        }
    }
}

/// Errors that can occur during sandbox execution.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Code failed validation checks.
    #[error("code validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned code pattern was detected during validation.
    #[error("banned pattern detected: `{pattern}`. The sandbox only exposes docdb, client, schemas and role.")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// A `require()` specifier could not be resolved under the module policy.
    #[error("module '{specifier}' cannot be loaded: {reason}")]
    ModuleResolution {
        /// The specifier as written in the source.
        specifier: String,
        /// Why it was refused.
        reason: String,
    },

    /// The source failed to parse.
    #[error("syntax error: {message}")]
    Compile {
        /// The error message from V8.
        message: String,
    },

    /// The source threw (or rejected) while running.
    #[error("javascript error: {message}")]
    Runtime {
        /// The error message from JavaScript.
        message: String,
    },

    /// Execution result exceeds the configured maximum size.
    #[error("output exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// Execution timed out (async event loop or CPU-bound watchdog).
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Too many concurrent sandbox executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// Result serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic host-side failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

impl SandboxError {
    /// The phase this failure belongs to.
    pub fn phase(&self) -> ExecutionPhase {
        match self {
            Self::ValidationFailed { .. }
            | Self::CodeTooLarge { .. }
            | Self::BannedPattern { .. }
            | Self::ModuleResolution { .. }
            | Self::Compile { .. } => ExecutionPhase::Compile,
            _ => ExecutionPhase::Run,
        }
    }

    /// Whether this failure was a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The bare message without the variant prefix, for `Compile` and
    /// `Runtime` errors. Other variants render their full display string.
    pub fn message(&self) -> String {
        match self {
            Self::Compile { message } | Self::Runtime { message } => message.clone(),
            other => other.to_string(),
        }
    }
}
