//! Error redaction for store failures surfaced to snippet code.
//!
//! Snippet code is model-generated and its output may be echoed back to
//! users or other models, so store errors are stripped of connection strings,
//! addresses, file paths, credentials and stack traces before they cross into
//! the isolate. Actionable parts (collection, operation, validation messages)
//! are preserved.

use std::sync::LazyLock;

use regex::Regex;

/// Any `scheme://...` URL, including database connection strings.
static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b[a-zA-Z][a-zA-Z0-9+.\-]*://[^\s'")\]}>]+"#).expect("static regex is valid")
});

static IP_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?").expect("static regex is valid")
});

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(home|Users|etc|var|tmp|opt|usr|root|mnt|srv|proc|sys|dev|run|data)(/[\w.\-]+)+")
        .expect("static regex is valid")
});

static WINDOWS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z]:\\[\w.\\\-]+").expect("static regex is valid"));

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Bearer\s+\S+|api_key\s*=\s*\S+|token\s*=\s*\S+|password\s*=\s*\S+|secret\s*=\s*\S+)",
    )
    .expect("static regex is valid")
});

/// OpenAI-style secret keys.
static API_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bsk-[A-Za-z0-9_\-]{16,}").expect("static regex is valid"));

static AWS_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:AKIA|ABIA|ACCA|ASIA)[0-9A-Z]{16}").expect("static regex is valid")
});

static JWT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+")
        .expect("static regex is valid")
});

static STACK_TRACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(at\s+.+|Caused by:.*|[\w.$]+Exception.*|\.{3}\s*\d+\s*more)$")
        .expect("static regex is valid")
});

/// Redact a store error for a specific database call before it reaches
/// snippet code.
pub fn redact_store_error(collection: &str, op: &str, error: &str) -> String {
    let redacted = redact_error_message(error);
    format!("{op} on collection '{collection}' failed: {redacted}")
}

/// Redact sensitive patterns from an error message.
///
/// - URLs and connection strings → `[url]`
/// - IP:port addresses → `[addr]`
/// - Unix/Windows file paths → `[path]`
/// - Credentials and API keys → `[REDACTED]`
/// - Stack trace lines → removed entirely
pub fn redact_error_message(error: &str) -> String {
    let mut msg = error.to_string();

    // Credentials first: they may contain URLs.
    msg = JWT_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = AWS_KEY_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = API_KEY_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = CREDENTIAL_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = URL_RE.replace_all(&msg, "[url]").to_string();
    msg = IP_PORT_RE.replace_all(&msg, "[addr]").to_string();
    msg = WINDOWS_PATH_RE.replace_all(&msg, "[path]").to_string();
    msg = UNIX_PATH_RE.replace_all(&msg, "[path]").to_string();
    msg = STACK_TRACE_RE.replace_all(&msg, "").to_string();

    let lines: Vec<&str> = msg.lines().filter(|l| !l.trim().is_empty()).collect();
    lines.join("\n")
}
