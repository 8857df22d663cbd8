#![warn(missing_docs)]

//! # docq-config
//!
//! Configuration loading for docq.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! roles = ["admin", "user"]
//! domain_notes = "Users younger than 18 are minors."
//!
//! [completion]
//! api_key = "${OPENAI_API_KEY}"
//! model = "gpt-3.5-turbo-instruct"
//! endpoint = "completions"
//! timeout_secs = 30
//!
//! [database]
//! name = "default"
//! seed_file = "seed.json"
//!
//! [schemas.users]
//! name = { type = "String", required = true }
//! age = "Number"
//!
//! [sandbox]
//! timeout_secs = 5
//! max_heap_mb = 64
//! acceptance = "permissive"
//! allowed_modules = ["path"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "DOCQ_CONFIG";

/// File looked up in the working directory when nothing else names one.
pub const DEFAULT_CONFIG_FILE: &str = "docq.toml";

/// Supported `completion.endpoint` values.
pub const ENDPOINTS: &[&str] = &["completions", "chat"];

/// Supported `sandbox.acceptance` values.
pub const ACCEPTANCE_POLICIES: &[&str] = &["permissive", "strict", "ast"];

/// Errors from config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// The file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// No config file was given and none was found.
    #[error("no config file found (pass --config, set DOCQ_CONFIG, or create ./docq.toml)")]
    NotFound,

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "CONFIG_IO",
            Self::Parse(_) => "CONFIG_PARSE",
            Self::NotFound => "CONFIG_NOT_FOUND",
            Self::Invalid(_) => "CONFIG_INVALID",
        }
    }
}

/// Top-level docq configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocqConfig {
    /// Roles the model is told may run queries, in prompt order.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Free-form notes about the data, passed to the model verbatim.
    #[serde(default)]
    pub domain_notes: Option<String>,

    /// Completion service settings.
    #[serde(default)]
    pub completion: CompletionSection,

    /// Database selection and seeding.
    #[serde(default)]
    pub database: DatabaseSection,

    /// Schema registry: collection name to definition.
    #[serde(default)]
    pub schemas: BTreeMap<String, Value>,

    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,
}

/// The `[completion]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionSection {
    /// API credential. Usually `"${OPENAI_API_KEY}"`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model id.
    #[serde(default)]
    pub model: Option<String>,

    /// API root URL.
    #[serde(default)]
    pub base_url: Option<String>,

    /// `"completions"` or `"chat"`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Upper bound on generated tokens.
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Deadline for one completion call, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// The `[database]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    /// Name of the default database.
    #[serde(default)]
    pub name: Option<String>,

    /// JSON file of `{ collection: [documents] }` for the in-memory store.
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Execution timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent sandbox executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum database calls per execution.
    #[serde(default)]
    pub max_db_calls: Option<usize>,

    /// Maximum serialized result size in kilobytes.
    #[serde(default)]
    pub max_output_kb: Option<usize>,

    /// `"permissive"` (default), `"strict"`, or `"ast"`.
    #[serde(default)]
    pub acceptance: Option<String>,

    /// Built-in modules `require` may load.
    #[serde(default)]
    pub allowed_modules: Option<Vec<String>>,

    /// Directory external modules are loaded from. Unset disables them.
    #[serde(default)]
    pub external_module_root: Option<PathBuf>,
}

impl DocqConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: DocqConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        Self::from_toml(&expand_env_vars(toml_str))
    }

    /// Load a config file, expanding environment variables.
    ///
    /// Relative `seed_file` and `external_module_root` paths are resolved
    /// against the file's directory.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_with_env(&content)?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(seed) = self.database.seed_file.as_mut() {
            rebase(seed);
        }
        if let Some(root) = self.sandbox.external_module_root.as_mut() {
            rebase(root);
        }
    }

    /// The configured API key, if it is set and not an unexpanded
    /// `${VAR}` placeholder.
    pub fn api_key(&self) -> Option<&str> {
        self.completion
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && !ENV_REF.is_match(k))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.roles.is_empty() {
            return Err(ConfigError::Invalid(
                "'roles' must list at least one role".into(),
            ));
        }
        if let Some(blank) = self.roles.iter().position(|r| r.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("roles[{blank}] is empty")));
        }

        if self.api_key().is_none() {
            return Err(ConfigError::Invalid(
                "completion.api_key is missing or refers to an unset environment variable".into(),
            ));
        }

        if let Some(endpoint) = &self.completion.endpoint {
            if !ENDPOINTS.contains(&endpoint.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unsupported completion.endpoint '{endpoint}', supported: {}",
                    ENDPOINTS.join(", ")
                )));
            }
        }

        if let Some(acceptance) = &self.sandbox.acceptance {
            if !ACCEPTANCE_POLICIES.contains(&acceptance.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unsupported sandbox.acceptance '{acceptance}', supported: {}",
                    ACCEPTANCE_POLICIES.join(", ")
                )));
            }
        }

        for (key, value) in [
            ("completion.timeout_secs", self.completion.timeout_secs),
            ("sandbox.timeout_secs", self.sandbox.timeout_secs),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{key} must be greater than 0")));
            }
        }
        for (key, value) in [
            ("sandbox.max_heap_mb", self.sandbox.max_heap_mb),
            ("sandbox.max_concurrent", self.sandbox.max_concurrent),
            ("sandbox.max_output_kb", self.sandbox.max_output_kb),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{key} must be greater than 0")));
            }
        }

        if let Some(name) = &self.database.name {
            if name.is_empty() || name.contains(['/', '\\', '.', ' ', '$', '\0']) {
                return Err(ConfigError::Invalid(format!(
                    "database.name '{name}' is not a valid database name"
                )));
            }
        }

        Ok(())
    }
}

/// Pick the config file: an explicit path, then `$DOCQ_CONFIG`, then
/// `./docq.toml` if it exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
    if fallback.is_file() {
        return Ok(fallback);
    }
    Err(ConfigError::NotFound)
}

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static regex is valid")
});

/// Expand `${VAR}` and `${VAR:-fallback}` using the process environment.
///
/// Unset variables without a fallback are left in place so validation can
/// name them.
fn expand_env_vars(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &Captures<'_>| {
            match (std::env::var(&caps[1]), caps.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(fallback)) => fallback.as_str().to_string(),
                (Err(_), None) => caps[0].to_string(),
            }
        })
        .into_owned()
}
