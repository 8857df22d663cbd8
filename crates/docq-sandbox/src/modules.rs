//! Module resolution policy for `require()` inside the sandbox.
//!
//! Snippets get a CommonJS-style `require`, but it can only return modules
//! that were resolved on the host before the isolate started:
//!
//! - built-in modules from an explicit allow-list (only side-effect-free
//!   helpers ship: `path`);
//! - external `.js` files, only when an external module root is configured,
//!   and only if the file resolves inside that root.
//!
//! Specifiers are collected from literal `require("...")` text in the source.
//! The scan does not parse, so text inside comments and strings is collected
//! too. A refused specifier never fails the run by itself: it is recorded
//! with its reason and `require` throws only if the snippet actually calls it.
//! Anything else `require`d at run time throws as well.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::SandboxError;

/// Maximum size of one external module file.
const MAX_EXTERNAL_MODULE_SIZE: u64 = 256 * 1024;

static REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\s*\(\s*(?:"([^"\\]+)"|'([^'\\]+)'|`([^`\\$]+)`)\s*\)"#)
        .expect("static regex is valid")
});

/// Pure-JS posix implementation of the `path` built-in.
const PATH_MODULE: &str = r#"
  const sep = "/";
  function normalizeSegments(parts, absolute) {
    const out = [];
    for (const p of parts) {
      if (p === "" || p === ".") continue;
      if (p === "..") {
        if (out.length > 0 && out[out.length - 1] !== "..") out.pop();
        else if (!absolute) out.push("..");
        continue;
      }
      out.push(p);
    }
    return out;
  }
  function normalize(p) {
    if (p === "") return ".";
    const absolute = p.startsWith("/");
    const trailing = p.endsWith("/");
    let out = normalizeSegments(p.split("/"), absolute).join("/");
    if (out === "" && !absolute) out = ".";
    if (out !== "" && trailing) out += "/";
    return (absolute ? "/" : "") + out;
  }
  function join(...parts) {
    const joined = parts.filter((x) => x !== "").join("/");
    return joined === "" ? "." : normalize(joined);
  }
  function resolve(...parts) {
    let acc = "";
    for (let i = parts.length - 1; i >= 0 && !acc.startsWith("/"); i--) {
      acc = parts[i] + (acc === "" ? "" : "/" + acc);
    }
    if (!acc.startsWith("/")) acc = "/" + acc;
    const out = normalize(acc);
    return out.length > 1 && out.endsWith("/") ? out.slice(0, -1) : out;
  }
  function basename(p, ext) {
    const trimmed = p.replace(/\/+$/, "");
    let base = trimmed.slice(trimmed.lastIndexOf("/") + 1);
    if (ext && base.endsWith(ext) && base !== ext) base = base.slice(0, -ext.length);
    return base;
  }
  function dirname(p) {
    const trimmed = p.replace(/\/+$/, "");
    const idx = trimmed.lastIndexOf("/");
    if (idx < 0) return ".";
    if (idx === 0) return "/";
    return trimmed.slice(0, idx);
  }
  function extname(p) {
    const base = basename(p);
    const idx = base.lastIndexOf(".");
    return idx <= 0 ? "" : base.slice(idx);
  }
  function isAbsolute(p) {
    return p.startsWith("/");
  }
  return Object.freeze({ sep, normalize, join, resolve, basename, dirname, extname, isAbsolute });
"#;

/// Which modules `require()` may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePolicy {
    /// Built-in module names snippets may load.
    pub allowed_builtins: BTreeSet<String>,
    /// Root directory for external modules; `None` disables them.
    pub external_root: Option<PathBuf>,
}

impl Default for ModulePolicy {
    fn default() -> Self {
        Self {
            allowed_builtins: BTreeSet::from(["path".to_string()]),
            external_root: None,
        }
    }
}

/// A module resolved on the host, ready to be embedded in the isolate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedModule {
    /// A shipped built-in, by name.
    Builtin(&'static str),
    /// An external file's source.
    External {
        /// Canonical path of the file.
        path: PathBuf,
        /// File contents.
        source: String,
    },
    /// Refused by the policy; `require` throws with this reason.
    Refused {
        /// Why the specifier was refused.
        reason: String,
    },
}

/// Built-ins this crate can provide.
fn builtin_source(name: &str) -> Option<(&'static str, &'static str)> {
    match name {
        "path" => Some(("path", PATH_MODULE)),
        _ => None,
    }
}

/// Literal specifiers passed to `require(...)` in `source`, deduplicated.
pub fn collect_requires(source: &str) -> BTreeSet<String> {
    REQUIRE_RE
        .captures_iter(source)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)).or_else(|| c.get(3)))
        .map(|m| m.as_str().to_string())
        .collect()
}

impl ModulePolicy {
    /// Resolve one specifier under this policy.
    pub fn resolve(&self, specifier: &str) -> Result<ResolvedModule, SandboxError> {
        let refuse = |reason: &str| SandboxError::ModuleResolution {
            specifier: specifier.to_string(),
            reason: reason.to_string(),
        };

        let is_relative = specifier.starts_with("./") || specifier.starts_with("../");
        if !is_relative {
            let name = specifier.strip_prefix("node:").unwrap_or(specifier);
            if Path::new(name).is_absolute() || name.contains('\\') {
                return Err(refuse("absolute paths are not allowed"));
            }
            if !self.allowed_builtins.contains(name) {
                return Err(refuse("module is not in the allowed built-in list"));
            }
            return match builtin_source(name) {
                Some((builtin, _)) => Ok(ResolvedModule::Builtin(builtin)),
                None => Err(refuse("no such built-in module")),
            };
        }

        let root = self
            .external_root
            .as_ref()
            .ok_or_else(|| refuse("external modules are disabled"))?;
        let root = root
            .canonicalize()
            .map_err(|e| refuse(&format!("external module root is unavailable: {e}")))?;

        let mut relative = PathBuf::from(specifier);
        if relative.extension().is_none() {
            relative.set_extension("js");
        }
        if relative
            .components()
            .any(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
        {
            return Err(refuse("absolute paths are not allowed"));
        }

        let path = root
            .join(&relative)
            .canonicalize()
            .map_err(|_| refuse("module not found"))?;
        if !path.starts_with(&root) {
            return Err(refuse("module resolves outside the external module root"));
        }

        let meta = std::fs::metadata(&path).map_err(|_| refuse("module not found"))?;
        if !meta.is_file() {
            return Err(refuse("module is not a file"));
        }
        if meta.len() > MAX_EXTERNAL_MODULE_SIZE {
            return Err(refuse("module file is too large"));
        }
        let source = std::fs::read_to_string(&path).map_err(|_| refuse("module is unreadable"))?;

        Ok(ResolvedModule::External { path, source })
    }

    /// Resolve every literal `require` in `source`, and transitively in the
    /// external modules it pulls in.
    ///
    /// Refused specifiers come back as [`ResolvedModule::Refused`] instead of
    /// failing, since the text may sit in a comment or a string. External
    /// specifiers always resolve against the root, not against the requiring
    /// file.
    pub fn resolve_all(&self, source: &str) -> BTreeMap<String, ResolvedModule> {
        let mut resolved = BTreeMap::new();
        let mut pending: Vec<String> = collect_requires(source).into_iter().collect();

        while let Some(spec) = pending.pop() {
            if resolved.contains_key(&spec) {
                continue;
            }
            let module = match self.resolve(&spec) {
                Ok(module) => module,
                Err(e) => {
                    tracing::debug!(specifier = %spec, error = %e, "module refused");
                    ResolvedModule::Refused {
                        reason: match e {
                            SandboxError::ModuleResolution { reason, .. } => reason,
                            other => other.to_string(),
                        },
                    }
                }
            };
            if let ResolvedModule::External { source, .. } = &module {
                pending.extend(collect_requires(source));
            }
            resolved.insert(spec, module);
        }

        resolved
    }
}

/// Build the script that installs the module table for one run.
///
/// Every allowed built-in is always present so run-time `require` of a
/// computed name works for them; external modules only appear when resolved,
/// and refused specifiers carry their reason for the thrown error.
pub fn module_table_script(
    policy: &ModulePolicy,
    resolved: &BTreeMap<String, ResolvedModule>,
) -> Result<String, SandboxError> {
    let mut script = String::from("globalThis.__docqModules = {\n");

    for name in &policy.allowed_builtins {
        if let Some((builtin, body)) = builtin_source(name) {
            let key = serde_json::to_string(builtin)?;
            script.push_str(&format!(
                "  {key}: {{ kind: \"builtin\", load: function () {{{body}}} }},\n"
            ));
        }
    }

    for (spec, module) in resolved {
        let key = serde_json::to_string(spec)?;
        match module {
            ResolvedModule::External { source, .. } => script.push_str(&format!(
                "  {key}: {{ kind: \"external\", load: function (module, exports, require) {{\n{source}\n}} }},\n"
            )),
            ResolvedModule::Refused { reason } => {
                let reason = serde_json::to_string(reason)?;
                script.push_str(&format!("  {key}: {{ kind: \"refused\", reason: {reason} }},\n"));
            }
            ResolvedModule::Builtin(_) => {}
        }
    }

    script.push_str("};\n");
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_literal_specifiers() {
        let src = r#"
            const path = require("path");
            const p2 = require('node:path');
            const fmt = require( `./fmt` );
            const dynamic = require(name);
        "#;
        let specs = collect_requires(src);
        assert_eq!(
            specs.into_iter().collect::<Vec<_>>(),
            vec!["./fmt", "node:path", "path"]
        );
    }

    #[test]
    fn ignores_identifiers_ending_in_require() {
        assert!(collect_requires(r#"myrequire("fs")"#).is_empty());
    }

    #[test]
    fn resolves_allowed_builtin() {
        let policy = ModulePolicy::default();
        assert_eq!(policy.resolve("path").unwrap(), ResolvedModule::Builtin("path"));
        assert_eq!(
            policy.resolve("node:path").unwrap(),
            ResolvedModule::Builtin("path")
        );
    }

    #[test]
    fn refuses_unlisted_builtins() {
        let policy = ModulePolicy::default();
        for spec in ["fs", "child_process", "node:net", "http"] {
            let err = policy.resolve(spec).unwrap_err();
            assert!(matches!(err, SandboxError::ModuleResolution { .. }), "{spec}");
        }
    }

    #[test]
    fn refuses_allow_listed_name_without_implementation() {
        let policy = ModulePolicy {
            allowed_builtins: BTreeSet::from(["fs".to_string()]),
            external_root: None,
        };
        let err = policy.resolve("fs").unwrap_err();
        assert!(err.to_string().contains("no such built-in"), "{err}");
    }

    #[test]
    fn refuses_external_without_root() {
        let err = ModulePolicy::default().resolve("./helpers").unwrap_err();
        assert!(err.to_string().contains("disabled"), "{err}");
    }

    #[test]
    fn resolves_external_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("helpers.js"), "exports.twice = (x) => x * 2;").unwrap();
        let policy = ModulePolicy {
            external_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        match policy.resolve("./helpers").unwrap() {
            ResolvedModule::External { source, path } => {
                assert!(source.contains("twice"));
                assert!(path.ends_with("helpers.js"));
            }
            other => panic!("unexpected module: {other:?}"),
        }
    }

    #[test]
    fn refuses_escape_from_root() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("modules");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("secret.js"), "module.exports = 42;").unwrap();

        let policy = ModulePolicy {
            external_root: Some(root),
            ..Default::default()
        };
        let err = policy.resolve("../secret.js").unwrap_err();
        assert!(err.to_string().contains("outside"), "{err}");
    }

    #[test]
    fn refuses_missing_external() {
        let dir = tempfile::tempdir().unwrap();
        let policy = ModulePolicy {
            external_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let err = policy.resolve("./nope").unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
    }

    #[test]
    fn resolve_all_records_refusals_without_failing() {
        let src = r#"const p = require("path"); const fs = require("fs");"#;
        let resolved = ModulePolicy::default().resolve_all(src);
        assert_eq!(resolved["path"], ResolvedModule::Builtin("path"));
        match &resolved["fs"] {
            ResolvedModule::Refused { reason } => {
                assert!(reason.contains("allowed built-in"), "{reason}")
            }
            other => panic!("unexpected module: {other:?}"),
        }
    }

    #[test]
    fn commented_require_is_only_recorded() {
        let src = "(async () => {\n// never require(\"fs\") here\nreturn 1;\n})()";
        let resolved = ModulePolicy::default().resolve_all(src);
        assert!(matches!(resolved["fs"], ResolvedModule::Refused { .. }));
    }

    #[test]
    fn resolve_all_follows_external_requires() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("report.js"),
            r#"const fmt = require("./fmt"); module.exports = (x) => fmt(x);"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("fmt.js"), "module.exports = (x) => `#${x}`;").unwrap();
        let policy = ModulePolicy {
            external_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let resolved = policy.resolve_all(r#"const report = require("./report");"#);
        assert_eq!(
            resolved.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["./fmt", "./report"]
        );
    }

    #[test]
    fn table_script_lists_builtins_and_externals() {
        let mut resolved = BTreeMap::new();
        resolved.insert(
            "./fmt".to_string(),
            ResolvedModule::External {
                path: PathBuf::from("/m/fmt.js"),
                source: "module.exports = 1;".into(),
            },
        );
        resolved.insert(
            "fs".to_string(),
            ResolvedModule::Refused {
                reason: "module is not in the allowed built-in list".into(),
            },
        );
        let script = module_table_script(&ModulePolicy::default(), &resolved).unwrap();
        assert!(script.starts_with("globalThis.__docqModules = {"));
        assert!(script.contains(r#""fs": { kind: "refused", reason: "module is not in the allowed built-in list" }"#));
        assert!(script.contains(r#""path": { kind: "builtin""#));
        assert!(script.contains(r#""./fmt": { kind: "external""#));
        assert!(script.contains("module.exports = 1;"));
    }
}
