//! Sandbox executor: creates a fresh V8 isolate per run and evaluates
//! generated code against a [`BindingSet`].
//!
//! V8 isolates are `!Send`, so all JsRuntime operations run on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is
//! fully async and `Send`-safe.
//!
//! A run executes three scripts in order:
//!
//! 1. `[docq:modules]` installs the module table resolved on the host;
//! 2. `[docq:bootstrap]` installs `docdb`, `client`, `schemas`, `role`,
//!    `console` and `require`, then removes `Deno`, `eval` and the function
//!    constructors;
//! 3. `[docq:run]` awaits the source expression and reports the result.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::audit::{AuditEntryBuilder, AuditLogger, AuditingStore, DbCallAudit, NoopAuditLogger};
use crate::bindings::{BindingSet, DatabaseHandle};
use crate::error::SandboxError;
use crate::modules::{module_table_script, ModulePolicy, ResolvedModule};
use crate::ops::{docq_ext, DbCallLimits, ExecutionResult};
use crate::{DocumentStore, ExecutionHost};

const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum run time before the isolate is terminated.
    pub timeout: Duration,
    /// Maximum size of the source text in bytes.
    pub max_code_size: usize,
    /// Maximum size of the JSON result in bytes.
    pub max_output_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent isolates.
    pub max_concurrent: usize,
    /// Maximum store calls per run.
    pub max_db_calls: usize,
    /// Maximum size of one serialized store command in bytes.
    pub max_db_args_size: usize,
    /// What `require()` may load.
    pub modules: ModulePolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_code_size: 64 * 1024,        // 64 KB
            max_output_size: 1024 * 1024,    // 1 MB
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_concurrent: 8,
            max_db_calls: 100,
            max_db_args_size: 1024 * 1024, // 1 MB
            modules: ModulePolicy::default(),
        }
    }
}

/// The sandbox executor. Creates a fresh V8 isolate for each run.
///
/// This is `Send + Sync`; all V8 work is dispatched to a dedicated thread.
/// A semaphore limits the number of simultaneous isolates.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Create a new sandbox executor with an audit logger.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: logger,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Evaluate `source` (a JavaScript expression, typically an async IIFE)
    /// with `bindings` as the only live resources, and return the value it
    /// resolves to.
    pub async fn execute(&self, source: &str, bindings: BindingSet) -> Result<Value, SandboxError> {
        tracing::info!(
            code_len = source.len(),
            role = %bindings.role,
            database = %bindings.handle.database,
            "sandbox run: starting"
        );

        let mut audit_builder =
            AuditEntryBuilder::new(source, &bindings.role, &bindings.handle.database);
        let (audit_tx, mut audit_rx) = tokio::sync::mpsc::unbounded_channel::<DbCallAudit>();

        let result = self.execute_audited(source, bindings, audit_tx).await;

        while let Ok(call) = audit_rx.try_recv() {
            audit_builder.record_db_call(call);
        }
        let entry = audit_builder.finish(&result);
        self.audit_logger.log(&entry).await;

        match &result {
            Ok(_) => tracing::info!(execution_id = %entry.execution_id, "sandbox run: complete"),
            Err(e) => tracing::warn!(
                execution_id = %entry.execution_id,
                phase = %e.phase(),
                error = %e,
                "sandbox run: failed"
            ),
        }

        result
    }

    async fn execute_audited(
        &self,
        source: &str,
        bindings: BindingSet,
        audit_tx: tokio::sync::mpsc::UnboundedSender<DbCallAudit>,
    ) -> Result<Value, SandboxError> {
        if source.len() > self.config.max_code_size {
            return Err(SandboxError::CodeTooLarge {
                max: self.config.max_code_size,
                actual: source.len(),
            });
        }

        let resolved = self.config.modules.resolve_all(source);

        let _permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;

        let auditing: Arc<dyn DocumentStore> =
            Arc::new(AuditingStore::new(bindings.handle.store.clone(), audit_tx));
        let bindings = BindingSet {
            handle: DatabaseHandle::new(auditing, bindings.handle.database.clone()),
            ..bindings
        };

        self.execute_in_thread(source, bindings, resolved).await
    }

    /// Spawn a dedicated thread with its own V8 isolate.
    async fn execute_in_thread(
        &self,
        source: &str,
        bindings: BindingSet,
        resolved: BTreeMap<String, ResolvedModule>,
    ) -> Result<Value, SandboxError> {
        let source = source.to_string();
        let config = self.config.clone();

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                        tracing::warn!("sandbox result receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_source(&config, &source, bindings, &resolved));
            if tx.send(result).is_err() {
                tracing::warn!("sandbox result receiver dropped before result was sent");
            }
        });

        rx.await
            .map_err(|_| SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked")))?
    }
}

#[async_trait::async_trait]
impl ExecutionHost for SandboxExecutor {
    async fn run(&self, source: &str, bindings: BindingSet) -> Result<Value, SandboxError> {
        self.execute(source, bindings).await
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the Box<HeapLimitState> owned by `run_source`,
    // which outlives every event-loop turn of the isolate.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Create a fresh JsRuntime with the docq extension loaded and V8 heap
/// limits set.
fn create_runtime(
    store: Arc<dyn DocumentStore>,
    max_heap_size: usize,
    limits: DbCallLimits,
) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);

    let runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![docq_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let op_state = runtime.op_state();
        let mut st = op_state.borrow_mut();
        st.put(store);
        st.put(limits);
    }

    runtime
}

/// Build the call that runs [`BOOTSTRAP_JS`] with this run's bindings.
fn bootstrap_script(bindings: &BindingSet) -> Result<String, SandboxError> {
    let schemas = bindings.schemas.to_json_string();
    let role = serde_json::to_string(&bindings.role)?;
    let database = serde_json::to_string(&bindings.handle.database)?;
    Ok(format!(
        "({BOOTSTRAP_JS})(Deno.core.ops, {schemas}, {role}, {database});"
    ))
}

/// Wrap the source expression so its resolved value (or thrown error) is
/// reported through the settle channel installed by the bootstrap.
fn wrap_source(source: &str) -> String {
    let expr = source.trim_end().trim_end_matches(';');
    format!(
        r#"((__docqSettle) => {{
    (async () => {{
        try {{
            const __docqResult = await (
{expr}
            );
            __docqSettle.ok(__docqResult);
        }} catch (e) {{
            __docqSettle.fail(e);
        }}
    }})();
}})((() => {{
    const settle = globalThis.__docqSettle;
    delete globalThis.__docqSettle;
    return settle;
}})());
"#
    )
}

/// Run one source text on the current thread (must be called from a
/// dedicated thread, not the main tokio runtime).
async fn run_source(
    config: &SandboxConfig,
    source: &str,
    bindings: BindingSet,
    resolved: &BTreeMap<String, ResolvedModule>,
) -> Result<Value, SandboxError> {
    let modules = module_table_script(&config.modules, resolved)?;
    let bootstrap = bootstrap_script(&bindings)?;

    let limits = DbCallLimits {
        max_calls: config.max_db_calls,
        max_args_size: config.max_db_args_size,
        calls_made: 0,
    };
    let mut runtime = create_runtime(bindings.handle.store.clone(), config.max_heap_size, limits);

    // External module bodies are compiled here, so a syntax error in one is
    // a compile failure of the run.
    runtime
        .execute_script("[docq:modules]", modules)
        .map_err(|e| SandboxError::Compile {
            message: e.to_string(),
        })?;
    runtime
        .execute_script("[docq:bootstrap]", bootstrap)
        .map_err(|e| SandboxError::Execution(anyhow::anyhow!("bootstrap failed: {e}")))?;

    run_user_code(&mut runtime, source, config).await
}

/// Execute the wrapped source and extract the result.
///
/// Sets up a CPU watchdog thread and near-heap-limit callback before running
/// user code. The watchdog terminates V8 execution if the timeout elapses
/// (CPU-bound loops); the heap callback terminates it if V8 approaches the
/// heap limit.
async fn run_user_code(
    runtime: &mut JsRuntime,
    source: &str,
    config: &SandboxConfig,
) -> Result<Value, SandboxError> {
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = config.timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let outcome = match runtime.execute_script("[docq:run]", wrap_source(source)) {
        Ok(_) => match tokio::time::timeout(
            config.timeout,
            runtime.run_event_loop(PollEventLoopOptions::default()),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SandboxError::Runtime {
                message: e.to_string(),
            }),
            Err(_) => {
                timed_out.store(true, Ordering::SeqCst);
                Ok(())
            }
        },
        Err(e) => {
            let message = e.to_string();
            // The wrapper catches everything the source throws, so the only
            // script-level failure left is a parse error.
            if message.contains("SyntaxError") {
                Err(SandboxError::Compile { message })
            } else {
                Err(SandboxError::Runtime { message })
            }
        }
    };

    // Join the watchdog before the runtime (and its IsolateHandle) drops.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(SandboxError::HeapLimitExceeded);
    }
    if timed_out.load(Ordering::SeqCst) {
        return Err(SandboxError::Timeout {
            timeout_ms: config.timeout.as_millis() as u64,
        });
    }
    outcome?;

    let result_str = {
        let state = runtime.op_state();
        let state = state.borrow();
        state
            .try_borrow::<ExecutionResult>()
            .map(|r| r.0.clone())
            .ok_or_else(|| SandboxError::Runtime {
                message: "no result returned from sandbox execution".into(),
            })?
    };

    if result_str.len() > config.max_output_size {
        return Err(SandboxError::OutputTooLarge {
            max: config.max_output_size,
        });
    }

    let envelope: Value = serde_json::from_str(&result_str)?;

    if let Some(error) = envelope.get("error") {
        return Err(SandboxError::Runtime {
            message: error.as_str().unwrap_or("unknown error").to_string(),
        });
    }

    Ok(envelope.get("ok").cloned().unwrap_or(Value::Null))
}
