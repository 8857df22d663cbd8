#![warn(missing_docs)]

//! # docq-completion
//!
//! The text-completion side of docq: a request type, the
//! [`CompletionService`] trait the query engine calls, an HTTP client for
//! OpenAI-compatible APIs, and a deadline wrapper.

pub mod openai;
pub mod timeout;

use serde::{Deserialize, Serialize};

pub use docq_error::CompletionError;
pub use openai::{Endpoint, OpenAiCompletionClient, OpenAiConfig};
pub use timeout::TimeoutCompletion;

/// Default model id.
pub const DEFAULT_MODEL: &str = "text-davinci-003";

/// Default completion length in tokens.
pub const DEFAULT_MAX_TOKENS: u32 = 500;

/// One request for completions of a single prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model id understood by the service.
    pub model: String,
    /// The full prompt text.
    pub prompt: String,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// How many candidates to ask for.
    pub candidate_count: u32,
    /// Stop sequences, if any.
    pub stop: Option<Vec<String>>,
    /// Sampling temperature; `0.0` asks for the most likely completion.
    pub temperature: f32,
}

impl CompletionRequest {
    /// A deterministic single-candidate request with no stop sequences.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            candidate_count: 1,
            stop: None,
            temperature: 0.0,
        }
    }
}

/// A service that turns a prompt into candidate completions.
///
/// Implementations must be shareable across concurrent queries.
#[async_trait::async_trait]
pub trait CompletionService: Send + Sync {
    /// Request completions. Candidates are returned in service order; an
    /// empty vector is a valid (if useless) answer.
    async fn complete(&self, request: &CompletionRequest) -> Result<Vec<String>, CompletionError>;
}
