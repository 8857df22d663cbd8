//! Errors surfaced by the query pipeline.

use docq_error::CompletionError;
use docq_sandbox::{ExecutionPhase, SandboxError};
use thiserror::Error;

/// Why a query produced no result.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The completion service failed or returned nothing usable.
    #[error("snippet generation failed: {0}")]
    Generation(#[from] CompletionError),

    /// The acceptance policy refused the generated snippet. It never ran.
    #[error("generated snippet rejected: {reason}")]
    InvalidSnippet {
        /// The candidate text as received.
        snippet: String,
        /// Why it was refused.
        reason: String,
    },

    /// The snippet failed to parse or failed while running.
    #[error("snippet {phase} error: {message}")]
    Execution {
        /// Whether the failure happened before or after the snippet started.
        phase: ExecutionPhase,
        /// Human-readable failure message.
        message: String,
        /// The underlying sandbox error.
        source: SandboxError,
    },
}

impl From<SandboxError> for QueryError {
    fn from(source: SandboxError) -> Self {
        Self::Execution {
            phase: source.phase(),
            message: source.message(),
            source,
        }
    }
}

impl QueryError {
    /// Whether the completion call or the sandbox run hit its deadline.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Generation(e) => matches!(e, CompletionError::Timeout { .. }),
            Self::Execution { source, .. } => source.is_timeout(),
            Self::InvalidSnippet { .. } => false,
        }
    }

    /// The execution phase, for execution failures.
    pub fn phase(&self) -> Option<ExecutionPhase> {
        match self {
            Self::Execution { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Generation(_) => "GENERATION_FAILED",
            Self::InvalidSnippet { .. } => "INVALID_SNIPPET",
            Self::Execution {
                phase: ExecutionPhase::Compile,
                ..
            } => "COMPILE_ERROR",
            Self::Execution { .. } if self.is_timeout() => "TIMEOUT",
            Self::Execution { .. } => "RUNTIME_ERROR",
        }
    }
}
