//! Embedded RustPython interpreter for the grading harness.
//!
//! This module owns the RustPython API surface the harness needs:
//! - building an interpreter with the native stdlib registered,
//! - redirecting `sys.stdout` / `sys.stderr` into an [`OutputBuffer`],
//! - wrapping `builtins.__import__` so run-time imports issued by the solution
//!   module are held to the same allow-list as the static scan,
//! - loading the solution module into a fresh namespace,
//! - the reflection helpers used to resolve and invoke entries.
//!
//! ## Import guard
//!
//! RustPython 0.3 resolves `import` statements through `builtins.__import__`.
//! The init closure of `Interpreter::with_init` runs before `builtins` is
//! populated, so the guard is installed from inside `enter()`. Only imports
//! executed by solution code are checked, identified by the frame's globals
//! being the solution namespace itself; stdlib modules import their own
//! dependencies freely. The execution unit, not this guard, is the isolation
//! boundary.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rustpython_vm::{
    builtins::{PyBaseExceptionRef, PyDictRef, PyList, PyType},
    compiler::Mode,
    function::FuncArgs,
    scope::Scope,
    AsObject, Interpreter, PyObjectRef, PyResult, TryFromObject, VirtualMachine,
};

use crate::config::SOLUTION_MODULE;
use crate::error::GradingError;
use crate::imports::is_module_allowed;
use crate::output::{OutputBuffer, Stream};

// ── Interpreter setup ─────────────────────────────────────────────────────────

/// Creates a fresh interpreter with the native stdlib registered and the
/// pure-Python stdlib frozen in. Nothing is read from a host Python install:
/// its `re`/`sre_*` sources do not match RustPython's native `_sre`.
pub(crate) fn build_interpreter() -> Interpreter {
    Interpreter::with_init(rustpython_vm::Settings::default(), |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        vm.add_frozen(rustpython_pylib::FROZEN_STDLIB);
    })
}

/// Pins `sys.getrecursionlimit()`.
pub(crate) fn set_recursion_limit(vm: &VirtualMachine, limit: usize) -> PyResult<()> {
    vm.sys_module
        .get_attr("setrecursionlimit", vm)?
        .call((vm.ctx.new_int(limit),), vm)?;
    Ok(())
}

/// Replaces `sys.stdout` and `sys.stderr` with writers backed by `output`.
pub(crate) fn install_output_capture(vm: &VirtualMachine, output: OutputBuffer) -> PyResult<()> {
    let stdout = build_writer_object(vm, output.clone(), Stream::Stdout);
    let stderr = build_writer_object(vm, output, Stream::Stderr);
    vm.sys_module.set_attr("stdout", stdout, vm)?;
    vm.sys_module.set_attr("stderr", stderr, vm)?;
    Ok(())
}

/// A module used as a plain namespace with `write`, `flush`, `closed` and
/// `encoding`, which is all `print` needs.
fn build_writer_object(vm: &VirtualMachine, output: OutputBuffer, stream: Stream) -> PyObjectRef {
    let output = Arc::new(Mutex::new(output));

    let write_fn = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let data: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            let buf = output.lock().expect("OutputBuffer mutex poisoned");
            match buf.write(stream, data.as_bytes()) {
                Ok(()) => Ok(vm.ctx.new_int(data.chars().count()).into()),
                Err(limit) => Err(vm.new_runtime_error(limit.to_string())),
            }
        },
    );
    let flush_fn = vm.new_function(
        "flush",
        |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
    );

    let ns = vm.new_module("<writer>", vm.ctx.new_dict(), None);
    let _ = ns.set_attr("write", write_fn, vm);
    let _ = ns.set_attr("flush", flush_fn, vm);
    let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    ns.into()
}

/// Wraps `builtins.__import__` so that absolute imports issued from
/// `solution_globals` must name an allowed top-level module.
pub(crate) fn install_import_guard(
    vm: &VirtualMachine,
    allowed_set: Arc<HashSet<String>>,
    solution_globals: PyDictRef,
) -> PyResult<()> {
    let original_import = vm.builtins.get_attr("__import__", vm)?;

    let guard = vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            // __import__(name, globals=None, locals=None, fromlist=(), level=0)
            let module_name: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();
            let level = args
                .args
                .get(4)
                .or_else(|| args.kwargs.get("level"))
                .and_then(|o| i64::try_from_object(vm, o.clone()).ok())
                .unwrap_or(0);

            if level == 0
                && is_solution_import(vm, &solution_globals)
                && !is_module_allowed(&module_name, &allowed_set)
            {
                return Err(vm.new_import_error(
                    format!("Import of '{module_name}' is not allowed"),
                    vm.ctx.new_str(module_name),
                ));
            }
            original_import.call(args, vm)
        },
    );

    vm.builtins.set_attr("__import__", guard, vm)?;
    Ok(())
}

/// Decides from the executing frame, never from the `globals` argument,
/// which the caller controls. Exempt are frames running in the namespace of a
/// module registered in `sys.modules` under its own `__name__`, other than the
/// solution. Namespaces made up by `exec`/`eval` are checked.
fn is_solution_import(vm: &VirtualMachine, solution_globals: &PyDictRef) -> bool {
    let globals = match vm.current_frame() {
        Some(frame) => frame.globals.clone(),
        None => return true,
    };
    globals.is(solution_globals) || !is_registered_module_namespace(vm, &globals)
}

fn is_registered_module_namespace(vm: &VirtualMachine, globals: &PyDictRef) -> bool {
    let Ok(Some(name)) = globals.get_item_opt("__name__", vm) else {
        return false;
    };
    let Ok(modules) = vm.sys_module.get_attr("modules", vm) else {
        return false;
    };
    let Ok(module) = modules.get_item(&*name, vm) else {
        return false;
    };
    matches!(get_attr_opt(vm, &module, "__dict__"), Ok(Some(dict)) if dict.is(globals))
}

// ── Module loading ────────────────────────────────────────────────────────────

/// A fresh module namespace named [`SOLUTION_MODULE`] with `__file__` set.
pub(crate) fn solution_scope(vm: &VirtualMachine, file: &str) -> Result<Scope, GradingError> {
    let scope = vm.new_scope_with_builtins();
    scope
        .globals
        .set_item("__name__", vm.ctx.new_str(SOLUTION_MODULE).into(), vm)
        .and_then(|_| scope.globals.set_item("__file__", vm.ctx.new_str(file).into(), vm))
        .map_err(|exc| GradingError::Internal(describe_exception(vm, &exc)))?;
    Ok(scope)
}

/// Compiles and executes `source` in `scope`. Compile errors and top-level
/// exceptions both become [`GradingError::Load`].
pub(crate) fn exec_in_scope(
    vm: &VirtualMachine,
    source: &str,
    file: &str,
    scope: &Scope,
) -> Result<(), GradingError> {
    let code = vm
        .compile(source, Mode::Exec, file.to_owned())
        .map_err(|err| {
            let (line, col) = err.python_location();
            GradingError::Load {
                message: format!("SyntaxError: {err} (line {line}, column {col})"),
            }
        })?;

    vm.run_code_obj(code, scope.clone())
        .map_err(|exc| GradingError::Load {
            message: describe_exception(vm, &exc),
        })?;
    Ok(())
}

/// [`solution_scope`] followed by [`exec_in_scope`].
pub(crate) fn load_module(
    vm: &VirtualMachine,
    source: &str,
    file: &str,
) -> Result<Scope, GradingError> {
    let scope = solution_scope(vm, file)?;
    exec_in_scope(vm, source, file, &scope)?;
    Ok(scope)
}

// ── Reflection helpers ────────────────────────────────────────────────────────

/// Looks `name` up in the module namespace.
pub(crate) fn lookup_global(
    vm: &VirtualMachine,
    scope: &Scope,
    name: &str,
) -> PyResult<Option<PyObjectRef>> {
    scope.globals.get_item_opt(name, vm)
}

/// `getattr(obj, name)`.
pub(crate) fn get_attr(vm: &VirtualMachine, obj: &PyObjectRef, name: &str) -> PyResult {
    vm.builtins
        .get_attr("getattr", vm)?
        .call((obj.clone(), vm.ctx.new_str(name)), vm)
}

/// [`get_attr`] with `AttributeError` mapped to `None`.
pub(crate) fn get_attr_opt(
    vm: &VirtualMachine,
    obj: &PyObjectRef,
    name: &str,
) -> PyResult<Option<PyObjectRef>> {
    match get_attr(vm, obj, name) {
        Ok(value) => Ok(Some(value)),
        Err(exc)
            if exc
                .as_object()
                .fast_isinstance(vm.ctx.exceptions.attribute_error) =>
        {
            Ok(None)
        }
        Err(exc) => Err(exc),
    }
}

pub(crate) fn is_class(obj: &PyObjectRef) -> bool {
    obj.payload_is::<PyType>()
}

/// Parameter names of a Python-level callable, read from its code object:
/// positional then keyword-only, without `*args` / `**kwargs` collectors and
/// without the receiver of a bound method. Decorators that record the
/// decorated function in `__wrapped__` (`functools.wraps`, `lru_cache`) are
/// looked through. `None` when there is no code object to inspect (builtins,
/// classes, callable instances).
pub(crate) fn parameter_names(
    vm: &VirtualMachine,
    callable: &PyObjectRef,
) -> PyResult<Option<Vec<String>>> {
    let (function, receiver) = match get_attr_opt(vm, callable, "__func__")? {
        Some(func) => (func, 1),
        None => (callable.clone(), 0),
    };
    let function = unwrap_decorated(vm, function)?;
    let Some(code) = get_attr_opt(vm, &function, "__code__")? else {
        return Ok(None);
    };
    let Some(positional) = int_attr(vm, &code, "co_argcount")? else {
        return Ok(None);
    };
    let keyword_only = int_attr(vm, &code, "co_kwonlyargcount")?.unwrap_or(0);
    let Some(varnames) = get_attr_opt(vm, &code, "co_varnames")? else {
        return Ok(None);
    };

    let names = to_vec(vm, &varnames)?
        .iter()
        .take(positional + keyword_only)
        .skip(receiver)
        .map(|name| name.str(vm).map(|s| s.as_str().to_owned()))
        .collect::<PyResult<Vec<_>>>()?;
    Ok(Some(names))
}

/// Chains of `__wrapped__` longer than this are treated as cyclic.
const MAX_UNWRAP: usize = 100;

/// Follows `__wrapped__` to the innermost function.
fn unwrap_decorated(vm: &VirtualMachine, mut function: PyObjectRef) -> PyResult<PyObjectRef> {
    let mut seen: Vec<PyObjectRef> = Vec::new();
    while let Some(inner) = get_attr_opt(vm, &function, "__wrapped__")? {
        if seen.iter().any(|f| f.is(&inner)) || seen.len() >= MAX_UNWRAP {
            return Err(vm.new_value_error(format!(
                "wrapper loop when unwrapping {}",
                function.repr(vm)?.as_str()
            )));
        }
        seen.push(function);
        function = inner;
    }
    Ok(function)
}

fn int_attr(vm: &VirtualMachine, obj: &PyObjectRef, name: &str) -> PyResult<Option<usize>> {
    get_attr_opt(vm, obj, name)?
        .map(|value| i64::try_from_object(vm, value).map(|n| n.max(0) as usize))
        .transpose()
}

/// Calls `callable(*args, **kwargs)`.
pub(crate) fn call_with(
    vm: &VirtualMachine,
    callable: &PyObjectRef,
    args: Vec<PyObjectRef>,
    kwargs: Vec<(String, PyObjectRef)>,
) -> PyResult {
    let (names, values): (Vec<String>, Vec<PyObjectRef>) = kwargs.into_iter().unzip();
    let mut positional = args;
    positional.extend(values);
    // Keyword values trail the positional ones, matched to `names` from the end.
    let func_args = FuncArgs::with_kwargs_names(positional.into_iter(), names.into_iter());
    callable.call(func_args, vm)
}

/// `bool(actual == expected)`.
pub(crate) fn py_equal(vm: &VirtualMachine, actual: &PyObjectRef, expected: &PyObjectRef) -> PyResult<bool> {
    actual.rich_compare_bool(expected, rustpython_vm::types::PyComparisonOp::Eq, vm)
}

/// `list(obj)` as a Rust vector.
pub(crate) fn to_vec(vm: &VirtualMachine, obj: &PyObjectRef) -> PyResult<Vec<PyObjectRef>> {
    let list = call_builtin(vm, "list", obj)?;
    let list = list
        .downcast::<PyList>()
        .map_err(|_| vm.new_type_error("list() did not return a list".to_owned()))?;
    let items = list.borrow_vec().to_vec();
    Ok(items)
}

/// Calls a one-argument builtin such as `list`, `sorted` or `repr`.
pub(crate) fn call_builtin(vm: &VirtualMachine, name: &'static str, arg: &PyObjectRef) -> PyResult {
    vm.builtins.get_attr(name, vm)?.call((arg.clone(),), vm)
}

/// `"<ExceptionType>: <message>"`.
pub(crate) fn describe_exception(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    let type_name = exc.as_object().class().name().to_string();
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| "<unprintable exception>".to_owned());
    format!("{type_name}: {message}")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
