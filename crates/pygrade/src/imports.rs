//! Import allow-list enforcement.
//!
//! Two layers share one notion of "allowed":
//! - [`check_allowed_imports`] parses the source and walks every statement
//!   (including function, class and block bodies) before anything is compiled
//!   or executed. Offenders abort the submission with
//!   [`GradingError::SecurityViolation`].
//! - [`is_module_allowed`] is consulted by the runtime `__import__` guard the
//!   VM installs, for imports computed at run time.
//!
//! Only the top-level package name is compared: `import a.b` and
//! `from a.b import c` both reference `a`. `__future__` is always allowed.

use std::collections::{BTreeSet, HashSet};

use rustpython_parser::{ast, Parse};

use crate::error::GradingError;

/// Module that is allowed regardless of the task's list.
pub const ALWAYS_ALLOWED: &str = "__future__";

/// Builds the lookup set for an allow-list, with `__future__` added.
pub fn build_allowed_set(allowed: &[String]) -> HashSet<String> {
    allowed
        .iter()
        .map(|m| top_level(m).to_string())
        .chain(std::iter::once(ALWAYS_ALLOWED.to_string()))
        .collect()
}

/// Checks a (possibly dotted) module name against `allowed_set` by its
/// top-level component.
pub fn is_module_allowed(module_name: &str, allowed_set: &HashSet<String>) -> bool {
    allowed_set.contains(top_level(module_name))
}

/// Collects the sorted, de-duplicated top-level names of every absolute
/// import in `source`. Relative imports (`from . import x`) name no external
/// module and are skipped.
pub fn collect_imports(source: &str) -> Result<BTreeSet<String>, GradingError> {
    let suite = ast::Suite::parse(source, "<solution>").map_err(|err| {
        let (line, col) = line_col(source, u32::from(err.offset) as usize);
        GradingError::Load {
            message: format!("SyntaxError: {} (line {line}, column {col})", err.error),
        }
    })?;
    let mut names = BTreeSet::new();
    visit_body(&suite, &mut names);
    Ok(names)
}

/// Fails with [`GradingError::SecurityViolation`] when `source` imports any
/// module outside `allowed`. Parse failures surface as
/// [`GradingError::Load`].
pub fn check_allowed_imports(source: &str, allowed: &[String]) -> Result<(), GradingError> {
    let allowed_set = build_allowed_set(allowed);
    let disallowed: Vec<String> = collect_imports(source)?
        .into_iter()
        .filter(|name| !allowed_set.contains(name))
        .collect();
    if disallowed.is_empty() {
        return Ok(());
    }
    let allowed: BTreeSet<String> = allowed_set.into_iter().collect();
    Err(GradingError::SecurityViolation {
        disallowed,
        allowed: allowed.into_iter().collect(),
    })
}

fn top_level(module_name: &str) -> &str {
    module_name.split('.').next().unwrap_or(module_name)
}

fn visit_body(body: &[ast::Stmt], names: &mut BTreeSet<String>) {
    for stmt in body {
        visit_stmt(stmt, names);
    }
}

fn visit_stmt(stmt: &ast::Stmt, names: &mut BTreeSet<String>) {
    match stmt {
        ast::Stmt::Import(node) => {
            for alias in &node.names {
                names.insert(top_level(alias.name.as_str()).to_string());
            }
        }
        ast::Stmt::ImportFrom(node) => {
            let relative = node.level.as_ref().map_or(false, |l| l.to_u32() > 0);
            if let (false, Some(module)) = (relative, node.module.as_ref()) {
                names.insert(top_level(module.as_str()).to_string());
            }
        }
        ast::Stmt::FunctionDef(node) => visit_body(&node.body, names),
        ast::Stmt::AsyncFunctionDef(node) => visit_body(&node.body, names),
        ast::Stmt::ClassDef(node) => visit_body(&node.body, names),
        ast::Stmt::For(node) => {
            visit_body(&node.body, names);
            visit_body(&node.orelse, names);
        }
        ast::Stmt::AsyncFor(node) => {
            visit_body(&node.body, names);
            visit_body(&node.orelse, names);
        }
        ast::Stmt::While(node) => {
            visit_body(&node.body, names);
            visit_body(&node.orelse, names);
        }
        ast::Stmt::If(node) => {
            visit_body(&node.body, names);
            visit_body(&node.orelse, names);
        }
        ast::Stmt::With(node) => visit_body(&node.body, names),
        ast::Stmt::AsyncWith(node) => visit_body(&node.body, names),
        ast::Stmt::Match(node) => {
            for case in &node.cases {
                visit_body(&case.body, names);
            }
        }
        ast::Stmt::Try(node) => {
            visit_body(&node.body, names);
            visit_handlers(&node.handlers, names);
            visit_body(&node.orelse, names);
            visit_body(&node.finalbody, names);
        }
        ast::Stmt::TryStar(node) => {
            visit_body(&node.body, names);
            visit_handlers(&node.handlers, names);
            visit_body(&node.orelse, names);
            visit_body(&node.finalbody, names);
        }
        _ => {}
    }
}

fn visit_handlers(handlers: &[ast::ExceptHandler], names: &mut BTreeSet<String>) {
    for handler in handlers {
        let ast::ExceptHandler::ExceptHandler(handler) = handler;
        visit_body(&handler.body, names);
    }
}

/// 1-based line and column of a byte offset.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let col = before
        .rsplit('\n')
        .next()
        .map_or(0, |tail| tail.chars().count())
        + 1;
    (line, col)
}
