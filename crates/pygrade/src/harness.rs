//! The grading harness: runs one submission against a [`TaskSpec`] and
//! produces a [`HarnessReport`].
//!
//! Pipeline, every stage fatal unless noted:
//! 1. plan the spec (entry normalization, test selection),
//! 2. static import allow-list check, before anything is compiled,
//! 3. load the solution module in a fresh interpreter,
//! 4. resolve every entry (all of them, before the first test runs),
//! 5. run the test cases; exceptions here are per-case, never fatal,
//! 6. number the cases globally and summarize.
//!
//! Stages 3 to 6 run on a dedicated VM thread with a large native stack (deep
//! Python recursion ends in a per-case `RecursionError`), bounded by
//! [`HarnessSettings::timeout_ns`].

use std::sync::Arc;
use std::time::Instant;

use rustpython_vm::{PyObjectRef, PyResult, VirtualMachine};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{HarnessSettings, RECURSION_LIMIT};
use crate::error::GradingError;
use crate::imports::{build_allowed_set, check_allowed_imports};
use crate::output::OutputBuffer;
use crate::payload::HarnessPayload;
use crate::serialize::{to_json, to_python};
use crate::spec::{EntryTarget, PlannedEntry, TaskSpec, TestCase};
use crate::timeout::{run_with_timeout, WorkerFailure};
use crate::types::{CaseResult, CaseStatus, HarnessReport};
use crate::vm;

/// Grades `source` against `spec`. Never panics on bad input: every failure
/// is encoded in the returned report.
pub fn grade(
    submission_id: &str,
    source: &str,
    spec: &TaskSpec,
    settings: &HarnessSettings,
) -> HarnessReport {
    let start = Instant::now();
    let report = HarnessReport::from_outcome(submission_id, run_pipeline(source, spec, settings));
    match &report {
        HarnessReport::Graded { summary, .. } => info!(
            submission_id,
            passed = summary.passed,
            total = summary.total,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "submission graded"
        ),
        HarnessReport::Failed { kind, error, .. } => info!(
            submission_id,
            ?kind,
            %error,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "submission failed"
        ),
    }
    report
}

/// Grades a decoded launcher payload.
pub fn grade_payload(payload: &HarnessPayload, settings: &HarnessSettings) -> HarnessReport {
    grade(&payload.submission_id, &payload.source, &payload.spec, settings)
}

fn run_pipeline(
    source: &str,
    spec: &TaskSpec,
    settings: &HarnessSettings,
) -> Result<Vec<CaseResult>, GradingError> {
    let plan = spec.plan()?;
    debug!(entries = plan.len(), "task spec planned");

    let allowed = spec.allowed_imports().map(<[String]>::to_vec);
    if let Some(allowed) = &allowed {
        check_allowed_imports(source, allowed)?;
        debug!(allowed = ?allowed, "import allow-list satisfied");
    }

    if let Some(path) = &settings.solution_path {
        std::fs::write(path, source).map_err(|e| {
            GradingError::Internal(format!("Cannot write solution source to {}: {e}", path.display()))
        })?;
    }

    let output = OutputBuffer::new(settings.max_output_bytes);
    let vm_output = output.clone();
    let source = source.to_owned();
    let file = settings.module_file();

    let result = run_with_timeout("pygrade-vm", settings.timeout(), move || {
        grade_in_vm(&source, &file, &plan, allowed, vm_output)
    });

    let limit_exceeded = output.is_limit_exceeded();
    let (stdout, stderr) = output.into_strings();
    debug!(
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        limit_exceeded,
        "captured solution output"
    );

    match result {
        Ok(outcome) => outcome,
        Err(WorkerFailure::TimedOut(limit)) => Err(GradingError::HarnessTimeout {
            limit_ms: limit.as_millis() as u64,
        }),
        Err(failure) => Err(GradingError::Internal(failure.to_string())),
    }
}

/// Runs stages 3 to 6 inside a fresh interpreter on the calling thread.
fn grade_in_vm(
    source: &str,
    file: &str,
    plan: &[PlannedEntry],
    allowed: Option<Vec<String>>,
    output: OutputBuffer,
) -> Result<Vec<CaseResult>, GradingError> {
    let interp = vm::build_interpreter();
    interp.enter(|vm| {
        vm::install_output_capture(vm, output).map_err(|exc| internal(vm, exc))?;
        vm::set_recursion_limit(vm, RECURSION_LIMIT).map_err(|exc| internal(vm, exc))?;

        let scope = vm::solution_scope(vm, file)?;
        if let Some(allowed) = allowed {
            vm::install_import_guard(vm, Arc::new(build_allowed_set(&allowed)), scope.globals.clone())
                .map_err(|exc| internal(vm, exc))?;
        }
        vm::exec_in_scope(vm, source, file, &scope)?;
        debug!("solution module loaded");

        let resolved = plan
            .iter()
            .map(|entry| resolve(vm, &scope, &entry.target))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(entries = resolved.len(), "entries resolved");

        let mut cases = Vec::new();
        for (entry, target) in plan.iter().zip(&resolved) {
            for test in &entry.tests {
                let index = cases.len() + 1;
                cases.push(run_case(vm, index, entry, target, test));
            }
        }
        Ok(cases)
    })
}

fn internal(vm: &VirtualMachine, exc: rustpython_vm::builtins::PyBaseExceptionRef) -> GradingError {
    GradingError::Internal(vm::describe_exception(vm, &exc))
}

// ── Entry resolution ──────────────────────────────────────────────────────────

/// An entry bound to live objects in the solution namespace.
enum Resolved {
    Function(PyObjectRef),
    Method { class: PyObjectRef, method_name: String },
    Attribute { class: PyObjectRef, attribute_name: String },
}

fn resolve(
    vm: &VirtualMachine,
    scope: &rustpython_vm::scope::Scope,
    target: &EntryTarget,
) -> Result<Resolved, GradingError> {
    match target {
        EntryTarget::Function { name, params } => {
            let function = global(vm, scope, name)?.ok_or_else(|| GradingError::EntityNotFound {
                kind: "Function",
                name: name.clone(),
            })?;
            if let Some(expected) = params {
                let actual = vm::parameter_names(vm, &function).map_err(|exc| internal(vm, exc))?;
                if actual.as_ref() != Some(expected) {
                    return Err(GradingError::SignatureMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            Ok(Resolved::Function(function))
        }
        EntryTarget::ClassMethod {
            class_name,
            method_name,
        } => {
            // Checked on the class, before any instance exists: callables bound
            // per instance in `__init__` or served by `__getattr__` do not count.
            let class = class(vm, scope, class_name)?;
            let defined = vm::get_attr_opt(vm, &class, method_name)
                .map_err(|exc| internal(vm, exc))?
                .is_some();
            if !defined {
                return Err(GradingError::EntityNotFound {
                    kind: "Method",
                    name: format!("{class_name}.{method_name}"),
                });
            }
            Ok(Resolved::Method {
                class,
                method_name: method_name.clone(),
            })
        }
        EntryTarget::ClassAttribute {
            class_name,
            attribute_name,
        } => Ok(Resolved::Attribute {
            class: class(vm, scope, class_name)?,
            attribute_name: attribute_name.clone(),
        }),
    }
}

/// A module-level binding; a name bound to `None` counts as missing.
fn global(
    vm: &VirtualMachine,
    scope: &rustpython_vm::scope::Scope,
    name: &str,
) -> Result<Option<PyObjectRef>, GradingError> {
    let value = vm::lookup_global(vm, scope, name).map_err(|exc| internal(vm, exc))?;
    Ok(value.filter(|v| !vm.is_none(v)))
}

fn class(
    vm: &VirtualMachine,
    scope: &rustpython_vm::scope::Scope,
    class_name: &str,
) -> Result<PyObjectRef, GradingError> {
    global(vm, scope, class_name)?
        .filter(vm::is_class)
        .ok_or_else(|| GradingError::EntityNotFound {
            kind: "Class",
            name: class_name.to_string(),
        })
}

// ── Test execution ────────────────────────────────────────────────────────────

fn run_case(
    vm: &VirtualMachine,
    index: usize,
    entry: &PlannedEntry,
    target: &Resolved,
    test: &TestCase,
) -> CaseResult {
    let (status, actual, error) = match evaluate(vm, entry, target, test) {
        Ok((actual, true)) => (CaseStatus::Passed, Some(actual), None),
        Ok((actual, false)) => (CaseStatus::Failed, Some(actual), None),
        Err(exc) => (CaseStatus::Error, None, Some(vm::describe_exception(vm, &exc))),
    };
    debug!(index, entry = %entry.label, ?status, "case finished");
    CaseResult {
        index,
        entry: entry.label.clone(),
        input: test.call_args().to_vec(),
        status,
        expected: test.expected.clone(),
        actual,
        error,
    }
}

/// Produces the serialized actual value and whether it equals `expected`.
fn evaluate(
    vm: &VirtualMachine,
    entry: &PlannedEntry,
    target: &Resolved,
    test: &TestCase,
) -> PyResult<(Value, bool)> {
    let actual = match target {
        Resolved::Function(function) => invoke(vm, function, test)?,
        Resolved::Method { class, method_name } => {
            let instance = construct(vm, class, entry, test)?;
            let method = vm::get_attr(vm, &instance, method_name)?;
            invoke(vm, &method, test)?
        }
        Resolved::Attribute {
            class,
            attribute_name,
        } => {
            let instance = construct(vm, class, entry, test)?;
            vm::get_attr_opt(vm, &instance, attribute_name)?.ok_or_else(|| {
                vm.new_attribute_error(format!("Attribute '{attribute_name}' not found"))
            })?
        }
    };
    let expected = to_python(vm, &test.expected)?;
    let passed = vm::py_equal(vm, &actual, &expected)?;
    Ok((to_json(vm, &actual), passed))
}

fn construct(
    vm: &VirtualMachine,
    class: &PyObjectRef,
    entry: &PlannedEntry,
    test: &TestCase,
) -> PyResult {
    let (args, kwargs) = entry.constructor_for(test);
    let args = python_args(vm, args)?;
    let kwargs = python_kwargs(vm, kwargs)?;
    vm::call_with(vm, class, args, kwargs)
}

fn invoke(vm: &VirtualMachine, callable: &PyObjectRef, test: &TestCase) -> PyResult {
    let args = python_args(vm, test.call_args())?;
    let kwargs = python_kwargs(vm, &test.kwargs)?;
    vm::call_with(vm, callable, args, kwargs)
}

fn python_args(vm: &VirtualMachine, values: &[Value]) -> PyResult<Vec<PyObjectRef>> {
    values.iter().map(|v| to_python(vm, v)).collect()
}

fn python_kwargs(
    vm: &VirtualMachine,
    values: &serde_json::Map<String, Value>,
) -> PyResult<Vec<(String, PyObjectRef)>> {
    values
        .iter()
        .map(|(k, v)| Ok((k.clone(), to_python(vm, v)?)))
        .collect()
}
