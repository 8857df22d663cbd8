#![warn(missing_docs)]

//! # docq-sandbox
//!
//! V8 sandbox for model-generated database snippets.
//!
//! Executes JavaScript in a deno_core isolate with no filesystem, network, or
//! environment access. The only bridge to the host is a small set of ops that
//! route `client` calls to a [`DocumentStore`].
//!
//! ## Security model
//!
//! - **V8 isolate**: same process-level isolation as Chrome tabs
//! - **Explicit bindings**: `docdb`, `client`, `schemas`, `role`, plus a
//!   host-forwarded `console` and a policy-restricted `require`
//! - **Fresh runtime per run**: no state leakage between executions
//! - **Optional acceptance gate**: banned patterns (or, with the
//!   `ast-validator` feature, banned AST constructs) caught before reaching V8
//! - **Timeout and heap enforcement**: the isolate is terminated at the limit
//! - **Redacted store errors**: connection strings and paths never reach
//!   snippet code
//!
//! Role strings are data, not permissions: the sandbox enforces none of them.

pub mod acceptance;
#[cfg(feature = "ast-validator")]
pub mod ast;
pub mod audit;
pub mod bindings;
pub mod command;
pub mod error;
pub mod executor;
pub mod modules;
pub mod ops;
pub mod redact;

use serde_json::Value;

pub use acceptance::{AcceptancePolicy, PatternAcceptance, PermissiveAcceptance};
#[cfg(feature = "ast-validator")]
pub use ast::AstAcceptance;
pub use bindings::{BindingSet, DatabaseHandle, DatabaseModule, SchemaRegistry};
pub use command::{FindOptions, StoreCommand, UpdateOptions};
pub use error::{ExecutionPhase, SandboxError};
pub use executor::{SandboxConfig, SandboxExecutor};
pub use modules::ModulePolicy;

/// A live document database reachable through the `client` binding.
///
/// Implementations own connections and credentials; the sandbox never sees
/// them. They must tolerate concurrent calls from several runs.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Execute one command against `database.collection`.
    async fn execute(
        &self,
        database: &str,
        collection: &str,
        command: StoreCommand,
    ) -> Result<Value, docq_error::StoreError>;
}

/// Something that can evaluate source text against a [`BindingSet`].
///
/// `source` is a JavaScript expression; the host awaits it and returns the
/// resolved value. The bindings are the only externally visible identifiers
/// besides `console` and `require`.
#[async_trait::async_trait]
pub trait ExecutionHost: Send + Sync {
    /// Evaluate `source` and return what it resolves to.
    async fn run(&self, source: &str, bindings: BindingSet) -> Result<Value, SandboxError>;
}
