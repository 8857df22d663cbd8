//! Pre-execution acceptance checks for generated snippets.
//!
//! The V8 isolate is the security boundary. An [`AcceptancePolicy`] is a gate
//! in front of it: it sees the raw candidate text and decides whether it is
//! worth running at all. The default [`PermissiveAcceptance`] accepts
//! everything; [`PatternAcceptance`] is the opt-in strict policy.

use crate::error::SandboxError;

/// Maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Patterns that are banned from snippet code.
///
/// The isolate does not expose these APIs anyway; catching them here gives a
/// readable rejection instead of a runtime `ReferenceError`.
const BANNED_PATTERNS: &[&str] = &[
    "eval(",
    "Function(",
    "import(",                 // Dynamic imports
    "Deno.",                   // Runtime escape
    "__proto__",               // Prototype pollution
    "constructor[",            // Prototype chain access via bracket notation
    "constructor.constructor", // Function constructor bypass
    "Reflect.",
    "globalThis[",
    "String.fromCharCode",
    "String.raw",
    "WebAssembly",
    "fetch(",
    "XMLHttpRequest",
    "child_process",
    // Specific process.* patterns (not bare "process." to avoid false positives
    // on e.g. order.process.status)
    "process.env",
    "process.exit",
    "process.argv",
    "process.stdin",
    "process.stdout",
    "process.stderr",
    "process.kill",
    "process.binding",
];

/// A pre-execution gate over candidate snippet text.
pub trait AcceptancePolicy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Accept the snippet, or explain why it must not run.
    fn check(&self, snippet: &str) -> Result<(), SandboxError>;
}

/// Accepts every snippet. This is the baseline policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveAcceptance;

impl AcceptancePolicy for PermissiveAcceptance {
    fn name(&self) -> &'static str {
        "permissive"
    }

    fn check(&self, _snippet: &str) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// Rejects empty, oversized, module-syntax, fenced, or banned-pattern snippets.
#[derive(Debug, Clone, Copy)]
pub struct PatternAcceptance {
    /// Maximum snippet size in bytes.
    pub max_code_size: usize,
}

impl Default for PatternAcceptance {
    fn default() -> Self {
        Self {
            max_code_size: DEFAULT_MAX_CODE_SIZE,
        }
    }
}

impl AcceptancePolicy for PatternAcceptance {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn check(&self, snippet: &str) -> Result<(), SandboxError> {
        validate_code(snippet, Some(self.max_code_size))
    }
}

/// Validates generated code before sandbox execution.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }

    if code.trim().is_empty() {
        return Err(SandboxError::ValidationFailed {
            reason: "code is empty".into(),
        });
    }

    if code.contains("```") {
        return Err(SandboxError::ValidationFailed {
            reason: "code contains a markdown fence".into(),
        });
    }

    // The snippet is spliced into a function body, where module syntax is a
    // syntax error.
    if let Some(line) = code.lines().map(str::trim_start).find(|l| {
        l.starts_with("import ") || l.starts_with("export ")
    }) {
        return Err(SandboxError::ValidationFailed {
            reason: format!("module syntax is not allowed: `{}`", line.trim_end()),
        });
    }

    for pattern in BANNED_PATTERNS {
        if code.contains(pattern) {
            return Err(SandboxError::BannedPattern {
                pattern: (*pattern).to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS_QUERY: &str = r#"
        const users = await client.db().collection("users").find({ age: { $gt: 20 } }).toArray();
        return users;
    "#;

    #[test]
    fn permissive_accepts_anything() {
        let policy = PermissiveAcceptance;
        assert!(policy.check("").is_ok());
        assert!(policy.check("eval('1')").is_ok());
        assert_eq!(policy.name(), "permissive");
    }

    #[test]
    fn accepts_collection_query() {
        assert!(validate_code(USERS_QUERY, None).is_ok());
    }

    #[test]
    fn accepts_require_of_path() {
        let code = r#"const path = require("path"); return path.join("a", "b");"#;
        assert!(validate_code(code, None).is_ok());
    }

    #[test]
    fn rejects_empty_code() {
        assert!(validate_code("", None).is_err());
        assert!(validate_code("   \n", None).is_err());
    }

    #[test]
    fn rejects_oversized_code() {
        let big = "x".repeat(100_000);
        let err = validate_code(&big, None).unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { .. }));
    }

    #[test]
    fn custom_size_limit_applies() {
        let err = PatternAcceptance { max_code_size: 16 }
            .check(USERS_QUERY)
            .unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { max: 16, .. }));
    }

    #[test]
    fn rejects_markdown_fences() {
        let code = "```js\nreturn 1;\n```";
        let err = validate_code(code, None).unwrap_err();
        assert!(matches!(err, SandboxError::ValidationFailed { .. }));
    }

    #[test]
    fn rejects_module_syntax() {
        let code = "import fs from 'fs';\nreturn fs;";
        let err = validate_code(code, None).unwrap_err();
        assert!(err.to_string().contains("module syntax"), "{err}");

        let code = "export const x = 1;";
        assert!(validate_code(code, None).is_err());
    }

    #[test]
    fn rejects_eval_and_function_constructor() {
        for code in [
            r#"return eval("1+1");"#,
            r#"return new Function("return this")();"#,
            r#"return ""["constructor"]["constructor"]("return this")();"#,
        ] {
            let err = validate_code(code, None).unwrap_err();
            assert!(
                matches!(err, SandboxError::BannedPattern { .. }),
                "{code} -> {err}"
            );
        }
    }

    #[test]
    fn rejects_network_and_process_access() {
        for code in [
            r#"return await fetch("http://evil.example");"#,
            "return process.env.OPENAI_API_KEY;",
            r#"const cp = require("child_process");"#,
            "return Deno.readTextFileSync('/etc/passwd');",
        ] {
            assert!(validate_code(code, None).is_err(), "should reject {code}");
        }
    }

    #[test]
    fn accepts_data_process_status() {
        let code = "const o = await orders.findOne({}); return o.process.status;";
        assert!(validate_code(code, None).is_ok());
    }

    #[test]
    fn policy_names() {
        assert_eq!(PatternAcceptance::default().name(), "strict");
    }
}
