//! AST-based acceptance policy.
//!
//! Parses the candidate with `oxc_parser`, wrapped in an async function the
//! same way the pipeline wraps it for execution, and walks the tree for
//! escape constructs. Unlike [`PatternAcceptance`](crate::PatternAcceptance)
//! it is not fooled by whitespace or computed access (`globalThis ["eval"]`)
//! and it rejects text that does not parse.
//!
//! Only compiled with the `ast-validator` feature.

use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_ast::visit::walk;
use oxc_ast::Visit;
use oxc_parser::Parser;
use oxc_span::SourceType;

use crate::acceptance::{AcceptancePolicy, DEFAULT_MAX_CODE_SIZE};
use crate::error::SandboxError;

/// Maximum bracket nesting depth checked before parsing.
const MAX_NESTING_DEPTH: usize = 256;

/// Parses each snippet and rejects unparseable text and banned constructs.
#[derive(Debug, Clone, Copy)]
pub struct AstAcceptance {
    /// Maximum snippet size in bytes.
    pub max_code_size: usize,
}

impl Default for AstAcceptance {
    fn default() -> Self {
        Self {
            max_code_size: DEFAULT_MAX_CODE_SIZE,
        }
    }
}

impl AcceptancePolicy for AstAcceptance {
    fn name(&self) -> &'static str {
        "ast"
    }

    fn check(&self, snippet: &str) -> Result<(), SandboxError> {
        validate_ast(snippet, self.max_code_size)
    }
}

/// Reject deeply nested input before it reaches the parser.
fn check_nesting_depth(code: &str) -> Result<(), SandboxError> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for ch in code.chars() {
        match ch {
            '{' | '[' | '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' | ']' | ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if max_depth > MAX_NESTING_DEPTH {
        return Err(SandboxError::ValidationFailed {
            reason: format!("nesting depth {max_depth} exceeds maximum {MAX_NESTING_DEPTH}"),
        });
    }
    Ok(())
}

/// Parse `snippet` as an async function body and walk it.
pub fn validate_ast(snippet: &str, max_size: usize) -> Result<(), SandboxError> {
    if snippet.len() > max_size {
        return Err(SandboxError::CodeTooLarge {
            max: max_size,
            actual: snippet.len(),
        });
    }
    if snippet.trim().is_empty() {
        return Err(SandboxError::ValidationFailed {
            reason: "code is empty".into(),
        });
    }
    // A fenced block still parses as chained tagged templates.
    if snippet.contains("```") {
        return Err(SandboxError::ValidationFailed {
            reason: "code contains a markdown fence".into(),
        });
    }
    check_nesting_depth(snippet)?;

    let wrapped = format!("(async () => {{\n{snippet}\n}})();");
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, &wrapped, SourceType::cjs()).parse();

    if ret.panicked || !ret.errors.is_empty() {
        let detail = ret
            .errors
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "parser gave up on malformed input".into());
        return Err(SandboxError::ValidationFailed {
            reason: format!("snippet does not parse: {detail}"),
        });
    }

    let mut walker = EscapeFinder { violation: None };
    walker.visit_program(&ret.program);
    match walker.violation {
        Some(description) => Err(SandboxError::BannedPattern {
            pattern: description,
        }),
        None => Ok(()),
    }
}

/// Records the first banned construct it meets.
struct EscapeFinder {
    violation: Option<String>,
}

impl EscapeFinder {
    fn report(&mut self, description: impl Into<String>) {
        if self.violation.is_none() {
            self.violation = Some(description.into());
        }
    }

    fn done(&self) -> bool {
        self.violation.is_some()
    }

    fn check_callee(&mut self, callee: &Expression<'_>, construct: bool) {
        match callee {
            Expression::Identifier(ident) => match ident.name.as_str() {
                name @ ("eval" | "Function" | "AsyncFunction" | "GeneratorFunction") => {
                    self.report(format!("{name}() builds code at run time"))
                }
                "fetch" => self.report("fetch() has no network in the sandbox"),
                "Proxy" if construct => self.report("new Proxy()"),
                _ => {}
            },
            Expression::StaticMemberExpression(member) => {
                if let Expression::Identifier(obj) = &member.object {
                    match (obj.name.as_str(), member.property.name.as_str()) {
                        ("String", "fromCharCode") => {
                            self.report("String.fromCharCode() can assemble code")
                        }
                        ("WebAssembly", prop) => self.report(format!("WebAssembly.{prop}")),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
}

/// The text of a computed key written as a literal, if any.
fn literal_key<'b>(key: &'b Expression<'_>) -> Option<&'b str> {
    match key {
        Expression::StringLiteral(lit) => Some(lit.value.as_str()),
        Expression::TemplateLiteral(tpl) if tpl.expressions.is_empty() => tpl
            .quasis
            .first()
            .and_then(|q| q.value.cooked.as_ref())
            .map(|c| c.as_str()),
        _ => None,
    }
}

impl<'a> Visit<'a> for EscapeFinder {
    fn visit_identifier_reference(&mut self, it: &IdentifierReference<'a>) {
        match it.name.as_str() {
            name @ ("Deno" | "Reflect" | "Proxy" | "WebAssembly" | "XMLHttpRequest") => {
                self.report(format!("{name} is not available in the sandbox"))
            }
            _ => {}
        }
    }

    fn visit_call_expression(&mut self, it: &CallExpression<'a>) {
        self.check_callee(&it.callee, false);
        if !self.done() {
            walk::walk_call_expression(self, it);
        }
    }

    fn visit_new_expression(&mut self, it: &NewExpression<'a>) {
        self.check_callee(&it.callee, true);
        if !self.done() {
            walk::walk_new_expression(self, it);
        }
    }

    fn visit_static_member_expression(&mut self, it: &StaticMemberExpression<'a>) {
        let prop = it.property.name.as_str();
        if prop == "__proto__" {
            self.report("__proto__ access");
        } else if prop == "constructor" {
            if let Expression::StaticMemberExpression(inner) = &it.object {
                if inner.property.name.as_str() == "constructor" {
                    self.report("constructor.constructor chain");
                }
            }
        } else if let Expression::Identifier(obj) = &it.object {
            match (obj.name.as_str(), prop) {
                (
                    "process",
                    "env" | "exit" | "argv" | "stdin" | "stdout" | "stderr" | "kill" | "binding",
                ) => self.report(format!("process.{prop}")),
                ("Symbol", "toPrimitive" | "hasInstance") => {
                    self.report(format!("Symbol.{prop}"))
                }
                _ => {}
            }
        }
        if !self.done() {
            walk::walk_static_member_expression(self, it);
        }
    }

    fn visit_computed_member_expression(&mut self, it: &ComputedMemberExpression<'a>) {
        if let Expression::Identifier(obj) = &it.object {
            if obj.name.as_str() == "globalThis" {
                self.report("globalThis[...] computed access");
            }
        }
        if let Some(key) = literal_key(&it.expression) {
            if matches!(key, "constructor" | "__proto__" | "eval") {
                self.report(format!("computed [\"{key}\"] access"));
            }
        }
        if !self.done() {
            walk::walk_computed_member_expression(self, it);
        }
    }

    fn visit_tagged_template_expression(&mut self, it: &TaggedTemplateExpression<'a>) {
        if let Expression::StaticMemberExpression(member) = &it.tag {
            if let Expression::Identifier(obj) = &member.object {
                if obj.name.as_str() == "String" && member.property.name.as_str() == "raw" {
                    self.report("String.raw tagged template");
                }
            }
        }
        if !self.done() {
            walk::walk_tagged_template_expression(self, it);
        }
    }

    fn visit_import_expression(&mut self, _it: &ImportExpression<'a>) {
        self.report("dynamic import()");
    }

    fn visit_meta_property(&mut self, it: &MetaProperty<'a>) {
        if it.meta.name.as_str() == "import" {
            self.report("import.meta");
        }
    }

    fn visit_with_statement(&mut self, _it: &WithStatement<'a>) {
        self.report("with statement");
    }
}
