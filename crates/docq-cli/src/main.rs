//! `docq` binary: answer one natural-language query against a seeded
//! in-memory document store.
//!
//! ```text
//! docq --role admin "Find all users with age greater than 20"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use docq_completion::{CompletionService, Endpoint, OpenAiCompletionClient, OpenAiConfig};
use docq_config::{resolve_config_path, CompletionSection, DocqConfig, SandboxOverrides};
use docq_query::{QueryEngine, DEFAULT_DATABASE};
use docq_sandbox::audit::TracingAuditLogger;
use docq_sandbox::{
    AcceptancePolicy, ModulePolicy, PatternAcceptance, PermissiveAcceptance, SandboxConfig,
    SandboxExecutor, SchemaRegistry,
};
use docq_store::MemoryStore;
use tracing_subscriber::EnvFilter;

/// Ask a document store questions in plain language.
#[derive(Parser, Debug)]
#[command(name = "docq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file. Defaults to $DOCQ_CONFIG, then ./docq.toml.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Seed file for the in-memory store; overrides database.seed_file.
    #[arg(long, value_name = "PATH")]
    seed: Option<PathBuf>,

    /// Role the query is asked on behalf of.
    #[arg(short, long)]
    role: String,

    /// Print the generated snippet to stderr.
    #[arg(long)]
    show_snippet: bool,

    /// Print the result on one line.
    #[arg(long)]
    compact: bool,

    /// The question, in plain language.
    #[arg(required = true, num_args = 1.., value_name = "QUERY")]
    query: Vec<String>,
}

impl Cli {
    fn query_text(&self) -> String {
        self.query.join(" ")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref())?;
    let config = DocqConfig::from_file_with_env(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    tracing::debug!(path = %config_path.display(), "config loaded");

    let database = config
        .database
        .name
        .clone()
        .unwrap_or_else(|| DEFAULT_DATABASE.to_string());
    let store = Arc::new(load_store(&database, cli.seed.as_deref(), &config).await?);

    let completion = build_completion(&config)?;
    let sandbox_config = build_sandbox_config(&config.sandbox);
    let executor = SandboxExecutor::with_audit_logger(sandbox_config, Arc::new(TracingAuditLogger));

    let mut builder = QueryEngine::builder(
        completion,
        store,
        build_schemas(&config),
        config.roles.iter().cloned(),
    )
    .database(database)
    .acceptance(build_acceptance(config.sandbox.acceptance.as_deref())?)
    .execution_host(Arc::new(executor));
    if let Some(model) = &config.completion.model {
        builder = builder.model(model.clone());
    }
    if let Some(notes) = &config.domain_notes {
        builder = builder.domain_notes(notes.clone());
    }
    if let Some(max_tokens) = config.completion.max_tokens {
        builder = builder.max_tokens(max_tokens);
    }
    if let Some(secs) = config.completion.timeout_secs {
        builder = builder.generation_timeout(Duration::from_secs(secs));
    }
    let engine = builder.build();

    let report = engine
        .process_query_detailed(&cli.query_text(), &cli.role)
        .await;
    if cli.show_snippet {
        match &report.snippet {
            Some(snippet) => eprintln!("{snippet}"),
            None => eprintln!("(no snippet generated)"),
        }
    }
    tracing::debug!(elapsed_ms = report.elapsed.as_millis() as u64, "query finished");

    let value = report
        .outcome
        .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code()))?;
    let rendered = if cli.compact {
        serde_json::to_string(&value)?
    } else {
        serde_json::to_string_pretty(&value)?
    };
    println!("{rendered}");
    Ok(())
}

async fn load_store(database: &str, seed: Option<&Path>, config: &DocqConfig) -> Result<MemoryStore> {
    match seed.or(config.database.seed_file.as_deref()) {
        Some(path) => MemoryStore::from_seed_file(database, path)
            .await
            .with_context(|| format!("failed to seed store from {}", path.display())),
        None => {
            tracing::warn!("no seed file configured; the store starts empty");
            Ok(MemoryStore::new())
        }
    }
}

fn build_completion(config: &DocqConfig) -> Result<Arc<dyn CompletionService>> {
    let api_key = config
        .api_key()
        .context("completion.api_key is not set")?
        .to_string();
    let client = OpenAiCompletionClient::with_config(api_key, build_openai_config(&config.completion))?;
    Ok(Arc::new(client))
}

fn build_openai_config(section: &CompletionSection) -> OpenAiConfig {
    let mut config = OpenAiConfig::default();
    if let Some(base_url) = &section.base_url {
        config.base_url = base_url.clone();
    }
    if section.endpoint.as_deref() == Some("chat") {
        config.endpoint = Endpoint::Chat;
    }
    if let Some(secs) = section.timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }
    config
}

fn build_schemas(config: &DocqConfig) -> SchemaRegistry {
    let mut schemas = SchemaRegistry::new();
    for (name, definition) in &config.schemas {
        schemas.insert(name.clone(), definition.clone());
    }
    schemas
}

fn build_acceptance(name: Option<&str>) -> Result<Arc<dyn AcceptancePolicy>> {
    Ok(match name {
        Some("strict") => Arc::new(PatternAcceptance::default()),
        #[cfg(feature = "ast-validator")]
        Some("ast") => Arc::new(docq_sandbox::AstAcceptance::default()),
        #[cfg(not(feature = "ast-validator"))]
        Some("ast") => anyhow::bail!("sandbox.acceptance = \"ast\" needs the ast-validator feature"),
        _ => Arc::new(PermissiveAcceptance),
    })
}

/// Map config overrides onto the sandbox defaults.
fn build_sandbox_config(overrides: &SandboxOverrides) -> SandboxConfig {
    let mut config = SandboxConfig::default();

    if let Some(secs) = overrides.timeout_secs {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(mb) = overrides.max_heap_mb {
        config.max_heap_size = mb * 1024 * 1024;
    }
    if let Some(n) = overrides.max_concurrent {
        config.max_concurrent = n;
    }
    if let Some(n) = overrides.max_db_calls {
        config.max_db_calls = n;
    }
    if let Some(kb) = overrides.max_output_kb {
        config.max_output_size = kb * 1024;
    }

    let mut modules = ModulePolicy::default();
    if let Some(allowed) = &overrides.allowed_modules {
        modules.allowed_builtins = allowed.iter().cloned().collect();
    }
    modules.external_root = overrides.external_module_root.clone();
    config.modules = modules;

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_multi_word_query() {
        let cli = Cli::try_parse_from([
            "docq",
            "--role",
            "admin",
            "--show-snippet",
            "Find",
            "all",
            "users",
        ])
        .unwrap();
        assert_eq!(cli.role, "admin");
        assert!(cli.show_snippet);
        assert!(cli.config.is_none());
        assert_eq!(cli.query_text(), "Find all users");
    }

    #[test]
    fn role_and_query_are_required() {
        assert!(Cli::try_parse_from(["docq", "count users"]).is_err());
        assert!(Cli::try_parse_from(["docq", "--role", "admin"]).is_err());
    }

    #[test]
    fn sandbox_overrides_apply_units() {
        let overrides = SandboxOverrides {
            timeout_secs: Some(2),
            max_heap_mb: Some(32),
            max_output_kb: Some(4),
            max_db_calls: Some(7),
            allowed_modules: Some(vec!["path".into(), "util".into()]),
            external_module_root: Some(PathBuf::from("/srv/modules")),
            ..Default::default()
        };
        let config = build_sandbox_config(&overrides);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.max_heap_size, 32 * 1024 * 1024);
        assert_eq!(config.max_output_size, 4096);
        assert_eq!(config.max_db_calls, 7);
        assert_eq!(config.max_concurrent, SandboxConfig::default().max_concurrent);
        assert!(config.modules.allowed_builtins.contains("util"));
        assert_eq!(config.modules.external_root, Some(PathBuf::from("/srv/modules")));
    }

    #[test]
    fn empty_overrides_keep_defaults() {
        let config = build_sandbox_config(&SandboxOverrides::default());
        let defaults = SandboxConfig::default();
        assert_eq!(config.timeout, defaults.timeout);
        assert_eq!(config.max_heap_size, defaults.max_heap_size);
        assert_eq!(config.modules.allowed_builtins, defaults.modules.allowed_builtins);
    }

    #[test]
    fn acceptance_names() {
        assert_eq!(build_acceptance(Some("strict")).unwrap().name(), "strict");
        assert_eq!(build_acceptance(None).unwrap().name(), "permissive");
    }

    #[cfg(feature = "ast-validator")]
    #[test]
    fn ast_acceptance_rejects_computed_global_access() {
        let policy = build_acceptance(Some("ast")).unwrap();
        assert_eq!(policy.name(), "ast");
        assert!(policy.check(r#"return globalThis ["eval"]("1");"#).is_err());
        assert!(policy.check("return {;").is_err());
        assert!(policy.check("return 1;").is_ok());
    }

    #[test]
    fn chat_endpoint_and_timeout() {
        let section = CompletionSection {
            endpoint: Some("chat".into()),
            timeout_secs: Some(9),
            base_url: Some("http://localhost:8080/v1".into()),
            ..Default::default()
        };
        let config = build_openai_config(&section);
        assert_eq!(config.endpoint, Endpoint::Chat);
        assert_eq!(config.request_timeout, Duration::from_secs(9));
        assert_eq!(config.base_url, "http://localhost:8080/v1");
    }

    #[tokio::test]
    async fn seed_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("seed.json");
        std::fs::write(&seed, r#"{"users": [{"_id": 1, "name": "Ada"}]}"#).unwrap();

        let config = DocqConfig::from_toml(
            r#"
roles = ["admin"]
[completion]
api_key = "sk-test"
[database]
seed_file = "/does/not/exist.json"
"#,
        )
        .unwrap();
        let store = load_store("default", Some(&seed), &config).await.unwrap();
        assert_eq!(store.documents("default", "users").await.len(), 1);
    }
}
