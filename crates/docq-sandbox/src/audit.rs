//! Audit logging for sandbox executions.
//!
//! Every sandbox run emits an [`AuditEntry`] containing:
//! - Execution ID (UUID)
//! - SHA-256 hash of the snippet (never raw code in logs)
//! - A redacted preview of the first 500 bytes of the snippet
//! - The caller's role and the default database
//! - Store calls made (with hashed arguments, not raw)
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use docq_error::StoreError;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::command::StoreCommand;
use crate::error::SandboxError;
use crate::DocumentStore;

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single sandbox run.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// When the run started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted source.
    pub code_hash: String,
    /// Redacted prefix of the source, for human review.
    pub code_preview: String,
    /// Role bound into the run.
    pub role: String,
    /// Default database of the run's handle.
    pub database: String,
    /// Store calls made during the run.
    pub db_calls: Vec<DbCallAudit>,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the serialized result in bytes.
    pub result_size_bytes: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// Audit record for one store call.
#[derive(Debug, Clone, Serialize)]
pub struct DbCallAudit {
    /// Target database.
    pub database: String,
    /// Target collection.
    pub collection: String,
    /// Operation name (`find`, `insertOne`, ...).
    pub op: String,
    /// SHA-256 hash of the serialized command (never stored raw).
    pub args_hash: String,
    /// Duration of the call in milliseconds.
    pub duration_ms: u64,
    /// Whether the call succeeded.
    pub success: bool,
}

/// The outcome of a sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The run resolved to a value.
    Success,
    /// The run failed.
    Error {
        /// The error message.
        message: String,
    },
    /// The run was terminated at its deadline.
    Timeout,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// A no-op audit logger.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// Emits audit entries as `tracing` events at `INFO` with `audit = true`.
///
/// Store calls are summarised as counts to keep log lines short.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let outcome = match &entry.outcome {
            AuditOutcome::Success => "success",
            AuditOutcome::Error { .. } => "error",
            AuditOutcome::Timeout => "timeout",
        };
        let writes = entry
            .db_calls
            .iter()
            .filter(|c| !matches!(c.op.as_str(), "find" | "findOne" | "countDocuments" | "distinct"))
            .count();
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            code_hash = %entry.code_hash,
            role = %entry.role,
            database = %entry.database,
            duration_ms = entry.duration_ms,
            result_size_bytes = entry.result_size_bytes,
            db_calls = entry.db_calls.len(),
            db_writes = writes,
            outcome = outcome,
            "audit"
        );
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// First [`CODE_PREVIEW_MAX`] bytes of `code`, with an ellipsis when cut.
///
/// Truncates at a char boundary.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        return code.to_string();
    }
    let mut end = CODE_PREVIEW_MAX;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &code[..end])
}

/// Builder for an [`AuditEntry`] accumulated during a run.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    role: String,
    database: String,
    db_calls: Vec<DbCallAudit>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry.
    pub fn new(code: &str, role: &str, database: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: crate::redact::redact_error_message(&code_preview(code)),
            role: role.to_string(),
            database: database.to_string(),
            db_calls: Vec::new(),
            start: Instant::now(),
        }
    }

    /// The execution id this entry will carry.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Record a store call.
    pub fn record_db_call(&mut self, audit: DbCallAudit) {
        self.db_calls.push(audit);
    }

    /// Finalize the entry with the run's result.
    pub fn finish(self, result: &Result<Value, SandboxError>) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (result_size_bytes, outcome) = match result {
            Ok(value) => {
                let size = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
                (size, AuditOutcome::Success)
            }
            Err(SandboxError::Timeout { .. }) => (0, AuditOutcome::Timeout),
            Err(e) => (
                0,
                AuditOutcome::Error {
                    message: crate::redact::redact_error_message(&e.to_string()),
                },
            ),
        };

        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            role: self.role,
            database: self.database,
            db_calls: self.db_calls,
            duration_ms,
            result_size_bytes,
            outcome,
        }
    }
}

/// A [`DocumentStore`] wrapper that reports every call on a channel.
pub struct AuditingStore {
    inner: Arc<dyn DocumentStore>,
    audit_tx: UnboundedSender<DbCallAudit>,
}

impl AuditingStore {
    /// Wrap a store with audit recording.
    pub fn new(inner: Arc<dyn DocumentStore>, audit_tx: UnboundedSender<DbCallAudit>) -> Self {
        Self { inner, audit_tx }
    }
}

#[async_trait::async_trait]
impl DocumentStore for AuditingStore {
    async fn execute(
        &self,
        database: &str,
        collection: &str,
        command: StoreCommand,
    ) -> Result<Value, StoreError> {
        let args_hash = sha256_hex(&serde_json::to_string(&command).unwrap_or_default());
        let op = command.op_name();
        let start = Instant::now();

        let result = self.inner.execute(database, collection, command).await;

        let audit = DbCallAudit {
            database: database.to_string(),
            collection: collection.to_string(),
            op: op.to_string(),
            args_hash,
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
        };
        let _ = self.audit_tx.send(audit);

        result
    }
}
