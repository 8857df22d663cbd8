#![warn(missing_docs)]

//! # docq-query
//!
//! Natural-language queries against a document store.
//!
//! A [`QueryEngine`] turns `(query, role)` into a prompt, asks a
//! [`CompletionService`](docq_completion::CompletionService) for one
//! JavaScript snippet, passes it through an
//! [`AcceptancePolicy`](docq_sandbox::AcceptancePolicy), and runs it in a
//! sandbox whose only live resources are `docdb`, `client`, `schemas` and
//! `role`.
//!
//! ## Security caveats
//!
//! - The role allow-list is text in the prompt. The generated snippet decides
//!   whether a role may act; nothing in this crate enforces it.
//! - The default acceptance policy accepts everything. The sandbox, not the
//!   policy, is what keeps snippets away from the filesystem, the network and
//!   the process environment.

pub mod engine;
pub mod error;
pub mod prompt;

use docq_completion::{DEFAULT_MAX_TOKENS, DEFAULT_MODEL};
use docq_sandbox::SchemaRegistry;

pub use engine::{FailureKind, QueryEngine, QueryEngineBuilder, QueryReport, QueryState};
pub use error::QueryError;
pub use prompt::compose;

/// Default database name.
pub const DEFAULT_DATABASE: &str = "default";

/// Domain notes used when none are configured.
pub const DEFAULT_DOMAIN_NOTES: &str = "None";

/// Everything the prompt and the pipeline need besides the collaborators.
/// Fixed once the engine is built.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryConfig {
    /// Model id sent with every completion request.
    pub model: String,
    /// Database the `client` binding defaults to.
    pub database: String,
    /// Roles the model is told may act, in prompt order.
    pub roles: Vec<String>,
    /// Schema registry exposed as `schemas`.
    pub schemas: SchemaRegistry,
    /// Free-form notes passed to the model verbatim.
    pub domain_notes: String,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            roles: Vec::new(),
            schemas: SchemaRegistry::new(),
            domain_notes: DEFAULT_DOMAIN_NOTES.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}
