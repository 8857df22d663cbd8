//! deno_core op definitions for the docq sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; all actual functions and types are documented below.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use serde_json::json;

use crate::command::StoreCommand;
use crate::DocumentStore;

/// Per-run limits on store calls.
pub struct DbCallLimits {
    /// Maximum number of store calls allowed.
    pub max_calls: usize,
    /// Maximum size of a serialized command.
    pub max_args_size: usize,
    /// Number of store calls made so far.
    pub calls_made: usize,
}

/// Wrapper for the run result stored in OpState.
pub struct ExecutionResult(pub String);

/// Maximum collection or database name length.
const MAX_NAME_LEN: usize = 120;

/// Validate a database or collection name before it reaches the store.
///
/// Rejects empty names, names over 120 bytes, `$`, null bytes and control
/// characters, and the reserved `system.` namespace.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{kind} name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "{kind} name too long ({} bytes, max {MAX_NAME_LEN} bytes)",
            name.len()
        ));
    }
    if name.contains('$') {
        return Err(format!("{kind} name must not contain '$'"));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(format!("{kind} name must not contain control characters"));
    }
    if name.starts_with("system.") {
        return Err(format!("{kind} name '{name}' is reserved"));
    }
    Ok(())
}

/// Forward a `console.*` call from snippet code to `tracing`.
#[op2(fast)]
pub fn op_docq_log(#[string] level: &str, #[string] msg: &str) {
    match level {
        "error" => tracing::error!(target: "docq::sandbox::js", "{}", msg),
        "warn" => tracing::warn!(target: "docq::sandbox::js", "{}", msg),
        "debug" => tracing::debug!(target: "docq::sandbox::js", "{}", msg),
        _ => tracing::info!(target: "docq::sandbox::js", "{}", msg),
    }
}

/// Store the run's result envelope in OpState.
#[op2(fast)]
pub fn op_docq_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(ExecutionResult(json.to_string()));
}

/// Generate a fresh document identifier for `docdb.ObjectId()`.
#[op2]
#[string]
pub fn op_docq_object_id() -> String {
    crate::command::new_object_id()
}

/// Execute one store command on behalf of the `client` binding.
///
/// Limit violations and malformed commands throw. Store failures resolve to
/// `{"error": {code, message, retryable}}` with a redacted message so the JS
/// side can raise a typed error; successes resolve to `{"ok": value}`.
#[op2(async)]
#[string]
pub async fn op_docq_db_call(
    op_state: Rc<RefCell<OpState>>,
    #[string] database: String,
    #[string] collection: String,
    #[string] command_json: String,
) -> Result<String, JsErrorBox> {
    tracing::debug!(
        database = %database,
        collection = %collection,
        args_len = command_json.len(),
        "store call dispatched"
    );

    {
        let mut st = op_state.borrow_mut();
        let limits = st.borrow_mut::<DbCallLimits>();
        if limits.calls_made >= limits.max_calls {
            return Err(JsErrorBox::generic(format!(
                "database call limit exceeded (max {} calls per execution)",
                limits.max_calls
            )));
        }
        if command_json.len() > limits.max_args_size {
            return Err(JsErrorBox::generic(format!(
                "database command too large ({} bytes, max {} bytes)",
                command_json.len(),
                limits.max_args_size
            )));
        }
        limits.calls_made += 1;
    }

    validate_name("database", &database).map_err(JsErrorBox::type_error)?;
    validate_name("collection", &collection).map_err(JsErrorBox::type_error)?;

    let command: StoreCommand = serde_json::from_str(&command_json)
        .map_err(|e| JsErrorBox::type_error(format!("invalid database command: {e}")))?;
    let op = command.op_name();

    let store = {
        let st = op_state.borrow();
        st.borrow::<Arc<dyn DocumentStore>>().clone()
    };

    let envelope = match store.execute(&database, &collection, command).await {
        Ok(value) => json!({ "ok": value }),
        Err(e) => {
            tracing::debug!(collection = %collection, op, code = e.code(), "store call failed");
            json!({
                "error": {
                    "code": e.code(),
                    "message": crate::redact::redact_store_error(&collection, op, &e.to_string()),
                    "retryable": e.retryable(),
                }
            })
        }
    };

    serde_json::to_string(&envelope)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

deno_core::extension!(
    docq_ext,
    ops = [
        op_docq_log,
        op_docq_set_result,
        op_docq_object_id,
        op_docq_db_call
    ],
);
