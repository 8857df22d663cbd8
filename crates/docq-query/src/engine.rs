//! The generation-and-execution pipeline.
//!
//! One call to [`QueryEngine::process_query`] makes exactly one completion
//! request and at most one sandbox run:
//!
//! ```text
//! Idle → Generating → Accepting → Executing → Completed
//!            │            │            │
//!            └────────────┴────────────┴──→ Failed(kind)
//! ```
//!
//! Nothing is retried and nothing is cached between calls. Snippets may write
//! to the store; there is no rollback when a later step fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use docq_completion::{
    CompletionError, CompletionRequest, CompletionService, OpenAiCompletionClient,
    TimeoutCompletion,
};
use docq_sandbox::{
    AcceptancePolicy, BindingSet, DatabaseHandle, DocumentStore, ExecutionHost, ExecutionPhase,
    PermissiveAcceptance, SandboxConfig, SandboxExecutor, SchemaRegistry,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::QueryError;
use crate::prompt::compose;
use crate::QueryConfig;

/// Where a call is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Not started.
    Idle,
    /// Waiting for the completion service.
    Generating,
    /// Running the acceptance policy.
    Accepting,
    /// Running the snippet in the sandbox.
    Executing,
    /// A value was produced.
    Completed,
    /// The call ended with an error of this kind.
    Failed(FailureKind),
}

/// Which step a failed call stopped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Completion service failure.
    Generation,
    /// Acceptance policy refusal.
    InvalidSnippet,
    /// The snippet did not parse or was refused before running.
    Compile,
    /// The snippet threw, timed out, or hit a limit.
    Run,
}

impl FailureKind {
    fn of(error: &QueryError) -> Self {
        match error {
            QueryError::Generation(_) => Self::Generation,
            QueryError::InvalidSnippet { .. } => Self::InvalidSnippet,
            QueryError::Execution {
                phase: ExecutionPhase::Compile,
                ..
            } => Self::Compile,
            QueryError::Execution { .. } => Self::Run,
        }
    }
}

/// Everything one call produced, for callers that want more than the value.
#[derive(Debug)]
pub struct QueryReport {
    /// The prompt sent to the completion service.
    pub prompt: String,
    /// The trimmed candidate, once one was received.
    pub snippet: Option<String>,
    /// States visited, starting at [`QueryState::Idle`].
    pub states: Vec<QueryState>,
    /// Wall time of the whole call.
    pub elapsed: Duration,
    /// The final value or error.
    pub outcome: Result<Value, QueryError>,
}

/// Wrap a snippet so it can be evaluated as one awaited expression.
pub fn wrap_snippet(snippet: &str) -> String {
    format!("(async () => {{\n{snippet}\n}})()")
}

/// Natural-language queries against a document store.
///
/// Shareable across tasks: the completion client, the store and the
/// execution host are all `Send + Sync`, and per-call state lives on the
/// stack of [`process_query`](Self::process_query).
pub struct QueryEngine {
    completion: Arc<dyn CompletionService>,
    store: Arc<dyn DocumentStore>,
    host: Arc<dyn ExecutionHost>,
    acceptance: Arc<dyn AcceptancePolicy>,
    config: QueryConfig,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("config", &self.config)
            .field("acceptance", &self.acceptance.name())
            .finish_non_exhaustive()
    }
}

impl QueryEngine {
    /// Start building an engine from its collaborators.
    pub fn builder(
        completion: Arc<dyn CompletionService>,
        store: Arc<dyn DocumentStore>,
        schemas: SchemaRegistry,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> QueryEngineBuilder {
        QueryEngineBuilder {
            completion,
            store,
            config: QueryConfig {
                schemas,
                roles: roles.into_iter().map(Into::into).collect(),
                ..QueryConfig::default()
            },
            host: None,
            sandbox: None,
            acceptance: None,
            generation_timeout: None,
        }
    }

    /// Start building an engine that talks to the OpenAI API with `api_key`.
    pub fn with_api_key(
        api_key: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        schemas: SchemaRegistry,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<QueryEngineBuilder, CompletionError> {
        let client = OpenAiCompletionClient::new(api_key)?;
        Ok(Self::builder(Arc::new(client), store, schemas, roles))
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Answer `query` on behalf of `role`.
    pub async fn process_query(&self, query: &str, role: &str) -> Result<Value, QueryError> {
        self.process_query_detailed(query, role).await.outcome
    }

    /// [`process_query`](Self::process_query), also returning the prompt, the
    /// snippet and the states the call went through.
    pub async fn process_query_detailed(&self, query: &str, role: &str) -> QueryReport {
        let started = Instant::now();
        let prompt = compose(query, role, &self.config);
        let mut states = vec![QueryState::Idle];
        let mut snippet = None;

        let outcome = self
            .run_pipeline(&prompt, role, &mut states, &mut snippet)
            .await;

        match &outcome {
            Ok(_) => {
                states.push(QueryState::Completed);
                info!(role, elapsed_ms = started.elapsed().as_millis() as u64, "query: complete");
            }
            Err(e) => {
                states.push(QueryState::Failed(FailureKind::of(e)));
                warn!(role, code = e.code(), error = %e, "query: failed");
            }
        }

        QueryReport {
            prompt,
            snippet,
            states,
            elapsed: started.elapsed(),
            outcome,
        }
    }

    async fn run_pipeline(
        &self,
        prompt: &str,
        role: &str,
        states: &mut Vec<QueryState>,
        snippet_out: &mut Option<String>,
    ) -> Result<Value, QueryError> {
        states.push(QueryState::Generating);
        info!(role, model = %self.config.model, prompt_len = prompt.len(), "query: generating");
        let request = CompletionRequest {
            model: self.config.model.clone(),
            prompt: prompt.to_string(),
            max_tokens: self.config.max_tokens,
            candidate_count: 1,
            stop: None,
            temperature: 0.0,
        };
        let candidates = self.completion.complete(&request).await?;
        let snippet = candidates
            .into_iter()
            .next()
            .ok_or(CompletionError::EmptyResponse)?
            .trim()
            .to_string();
        *snippet_out = Some(snippet.clone());

        states.push(QueryState::Accepting);
        info!(
            code_len = snippet.len(),
            policy = self.acceptance.name(),
            "query: accepting"
        );
        if let Err(e) = self.acceptance.check(&snippet) {
            return Err(QueryError::InvalidSnippet {
                snippet,
                reason: e.to_string(),
            });
        }

        states.push(QueryState::Executing);
        info!(role, database = %self.config.database, "query: executing");
        let bindings = BindingSet::new(
            DatabaseHandle::new(self.store.clone(), self.config.database.clone()),
            self.config.schemas.clone(),
            role,
        );
        Ok(self.host.run(&wrap_snippet(&snippet), bindings).await?)
    }
}

/// Builder for [`QueryEngine`].
pub struct QueryEngineBuilder {
    completion: Arc<dyn CompletionService>,
    store: Arc<dyn DocumentStore>,
    config: QueryConfig,
    host: Option<Arc<dyn ExecutionHost>>,
    sandbox: Option<SandboxConfig>,
    acceptance: Option<Arc<dyn AcceptancePolicy>>,
    generation_timeout: Option<Duration>,
}

impl QueryEngineBuilder {
    /// Model id sent with every completion request.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    /// Database the `client` binding defaults to.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    /// Free-form notes passed to the model verbatim.
    pub fn domain_notes(mut self, notes: impl Into<String>) -> Self {
        self.config.domain_notes = notes.into();
        self
    }

    /// Upper bound on generated tokens.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = max_tokens;
        self
    }

    /// Gate applied to each snippet before it runs.
    pub fn acceptance(mut self, policy: Arc<dyn AcceptancePolicy>) -> Self {
        self.acceptance = Some(policy);
        self
    }

    /// Use a custom execution host instead of a [`SandboxExecutor`].
    pub fn execution_host(mut self, host: Arc<dyn ExecutionHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Settings for the default [`SandboxExecutor`]. Ignored when a custom
    /// host is supplied.
    pub fn sandbox_config(mut self, config: SandboxConfig) -> Self {
        self.sandbox = Some(config);
        self
    }

    /// Deadline for the completion call.
    pub fn generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = Some(timeout);
        self
    }

    /// Finish building.
    pub fn build(self) -> QueryEngine {
        let completion: Arc<dyn CompletionService> = match self.generation_timeout {
            Some(timeout) => Arc::new(TimeoutCompletion::new(self.completion, timeout)),
            None => self.completion,
        };
        let host: Arc<dyn ExecutionHost> = match self.host {
            Some(host) => host,
            None => Arc::new(SandboxExecutor::new(self.sandbox.unwrap_or_default())),
        };
        let acceptance: Arc<dyn AcceptancePolicy> = match self.acceptance {
            Some(policy) => policy,
            None => Arc::new(PermissiveAcceptance),
        };
        QueryEngine {
            completion,
            store: self.store,
            host,
            acceptance,
            config: self.config,
        }
    }
}
