//! Conversion between Python values and JSON values.
//!
//! [`to_json`] is total: every Python value maps to some JSON value and the
//! conversion never raises. [`to_python`] turns test arguments and expected
//! values from the task spec into Python objects.

use rustpython_vm::{
    builtins::{PyDict, PyFloat, PyFrozenSet, PyInt, PyList, PySet, PyStr, PyTuple},
    AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine,
};
use serde_json::{Map, Number, Value};

use crate::vm::{call_builtin, to_vec};

/// Containers nested deeper than this are rendered with `repr`.
pub const MAX_DEPTH: usize = 64;

/// Last-resort text for an object whose `str` and `repr` both raise.
pub const UNPRINTABLE: &str = "<unserializable object>";

/// Serializes an arbitrary Python value.
pub fn to_json(vm: &VirtualMachine, obj: &PyObjectRef) -> Value {
    convert(vm, obj, 0)
}

fn convert(vm: &VirtualMachine, obj: &PyObjectRef, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return Value::String(repr_text(vm, obj));
    }
    if vm.is_none(obj) {
        return Value::Null;
    }
    // bool is an int subclass and shares its payload; check it first.
    if obj.fast_isinstance(vm.ctx.types.bool_type) {
        return obj
            .clone()
            .try_to_bool(vm)
            .map(Value::Bool)
            .unwrap_or_else(|_| Value::String(str_text(vm, obj)));
    }
    if let Some(s) = obj.payload::<PyStr>() {
        return Value::String(s.as_str().to_owned());
    }
    if obj.payload_is::<PyInt>() {
        return int_value(vm, obj);
    }
    if let Some(f) = obj.payload::<PyFloat>() {
        return Number::from_f64(f.to_f64())
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(str_text(vm, obj)));
    }
    if obj.payload_is::<PyDict>() {
        return dict_value(vm, obj, depth).unwrap_or_else(|_| Value::String(str_text(vm, obj)));
    }
    if obj.payload_is::<PyList>() || obj.payload_is::<PyTuple>() {
        return sequence_value(vm, obj, depth).unwrap_or_else(|_| Value::String(str_text(vm, obj)));
    }
    if obj.payload_is::<PySet>() || obj.payload_is::<PyFrozenSet>() {
        let items = call_builtin(vm, "sorted", obj).or_else(|_| call_builtin(vm, "list", obj));
        return items
            .and_then(|items| sequence_value(vm, &items, depth))
            .unwrap_or_else(|_| Value::String(str_text(vm, obj)));
    }
    Value::String(str_text(vm, obj))
}

fn int_value(vm: &VirtualMachine, obj: &PyObjectRef) -> Value {
    if let Ok(n) = i64::try_from_object(vm, obj.clone()) {
        return Value::from(n);
    }
    if let Ok(n) = u64::try_from_object(vm, obj.clone()) {
        return Value::from(n);
    }
    Value::String(str_text(vm, obj))
}

fn dict_value(vm: &VirtualMachine, obj: &PyObjectRef, depth: usize) -> PyResult<Value> {
    let items = vm.call_method(obj, "items", ())?;
    let mut out = Map::new();
    for pair in to_vec(vm, &items)? {
        let pair = to_vec(vm, &pair)?;
        if let [key, value] = pair.as_slice() {
            let key = match key.payload::<PyStr>() {
                Some(s) => s.as_str().to_owned(),
                None => str_text(vm, key),
            };
            out.insert(key, convert(vm, value, depth + 1));
        }
    }
    Ok(Value::Object(out))
}

fn sequence_value(vm: &VirtualMachine, obj: &PyObjectRef, depth: usize) -> PyResult<Value> {
    Ok(Value::Array(
        to_vec(vm, obj)?
            .iter()
            .map(|item| convert(vm, item, depth + 1))
            .collect(),
    ))
}

/// `str(obj)`, else `repr(obj)`, else [`UNPRINTABLE`].
fn str_text(vm: &VirtualMachine, obj: &PyObjectRef) -> String {
    obj.str(vm)
        .or_else(|_| obj.repr(vm))
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| UNPRINTABLE.to_owned())
}

fn repr_text(vm: &VirtualMachine, obj: &PyObjectRef) -> String {
    obj.repr(vm)
        .or_else(|_| obj.str(vm))
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| UNPRINTABLE.to_owned())
}

/// Builds the Python equivalent of a JSON value: null, bool, int, float, str,
/// list and dict.
pub fn to_python(vm: &VirtualMachine, value: &Value) -> PyResult<PyObjectRef> {
    Ok(match value {
        Value::Null => vm.ctx.none(),
        Value::Bool(b) => vm.ctx.new_bool(*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                vm.ctx.new_int(i).into()
            } else if let Some(u) = n.as_u64() {
                vm.ctx.new_int(u).into()
            } else {
                vm.ctx.new_float(n.as_f64().unwrap_or(f64::NAN)).into()
            }
        }
        Value::String(s) => vm.ctx.new_str(s.as_str()).into(),
        Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| to_python(vm, item))
                .collect::<PyResult<Vec<_>>>()?;
            vm.ctx.new_list(items).into()
        }
        Value::Object(map) => {
            let dict = vm.ctx.new_dict();
            for (key, item) in map {
                dict.set_item(key.as_str(), to_python(vm, item)?, vm)?;
            }
            dict.into()
        }
    })
}
