//! Task specifications: parsing, entry normalization and test planning.
//!
//! A [`TaskSpec`] is read-only input owned by the caller. [`TaskSpec::plan`]
//! turns it into the ordered list of [`PlannedEntry`] values the harness
//! executes; every structural problem with the spec surfaces there as
//! [`GradingError::Spec`], before any submitted code is touched.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GradingError;

/// Declarative test specification for one assessment item.
///
/// `entry` may be a single object or an ordered list of objects on the wire;
/// it is always held as a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTaskSpec", into = "RawTaskSpec")]
pub struct TaskSpec {
    pub entries: Vec<EntryDescriptor>,
    /// Tests shared by every entry that does not declare its own.
    pub tests: Option<Vec<TestCase>>,
    /// Top-level module names the source may import. `None` or empty disables
    /// the check.
    pub allowed_imports: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
struct RawTaskSpec {
    entry: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tests: Option<Vec<TestCase>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_imports: Option<Vec<String>>,
}

impl TryFrom<RawTaskSpec> for TaskSpec {
    type Error = GradingError;

    fn try_from(raw: RawTaskSpec) -> Result<Self, Self::Error> {
        let entries = match raw.entry {
            Value::Object(_) => vec![entry_from_value(raw.entry)?],
            Value::Array(items) => items
                .into_iter()
                .map(entry_from_value)
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(entry_shape_error()),
        };
        Ok(TaskSpec {
            entries,
            tests: raw.tests,
            allowed_imports: raw.allowed_imports,
        })
    }
}

impl From<TaskSpec> for RawTaskSpec {
    fn from(spec: TaskSpec) -> Self {
        let entry = serde_json::to_value(spec.entries).unwrap_or(Value::Array(Vec::new()));
        RawTaskSpec {
            entry,
            tests: spec.tests,
            allowed_imports: spec.allowed_imports,
        }
    }
}

fn entry_shape_error() -> GradingError {
    GradingError::Spec("Task spec 'entry' must be an object or a list of objects".to_string())
}

fn entry_from_value(value: Value) -> Result<EntryDescriptor, GradingError> {
    if !value.is_object() {
        return Err(entry_shape_error());
    }
    serde_json::from_value(value).map_err(|e| GradingError::Spec(format!("Invalid entry: {e}")))
}

impl TaskSpec {
    /// Parses a spec from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, GradingError> {
        serde_json::from_str(text).map_err(|e| GradingError::Spec(format!("Invalid task spec: {e}")))
    }

    /// The effective allow-list, or `None` when the check is disabled.
    pub fn allowed_imports(&self) -> Option<&[String]> {
        self.allowed_imports
            .as_deref()
            .filter(|modules| !modules.is_empty())
    }

    /// Validates every entry and pairs it with the tests it runs.
    pub fn plan(&self) -> Result<Vec<PlannedEntry>, GradingError> {
        self.entries
            .iter()
            .map(|entry| {
                let target = entry.target()?;
                let tests = match entry.tests.as_deref() {
                    Some(own) if !own.is_empty() => own.to_vec(),
                    _ => match &self.tests {
                        Some(shared) => shared.clone(),
                        None => {
                            return Err(GradingError::Spec(format!(
                                "{} tests must be a list of test objects",
                                target.kind_label()
                            )))
                        }
                    },
                };
                Ok(PlannedEntry {
                    label: target.label(),
                    target,
                    constructor_args: entry.constructor_args.clone(),
                    constructor_kwargs: entry.constructor_kwargs.clone(),
                    tests,
                })
            })
            .collect()
    }
}

/// Loads `<tasks_dir>/<task_id>/task.json`.
pub fn load_task_spec(tasks_dir: &Path, task_id: &str) -> Result<TaskSpec, GradingError> {
    let path = tasks_dir.join(task_id).join("task.json");
    let text = std::fs::read_to_string(&path).map_err(|_| {
        GradingError::Spec(format!("Task spec not found for task_id='{task_id}'"))
    })?;
    TaskSpec::from_json_str(&text)
}

/// Identifies the code surface under test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    /// `function` (default), `class_method` or `class_attribute`;
    /// case-insensitive.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    /// Expected parameter names, in order. Only checked for functions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constructor_args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub constructor_kwargs: Map<String, Value>,
    /// Entry-specific tests; when non-empty they replace the shared tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<TestCase>>,
}

impl EntryDescriptor {
    /// Resolves the descriptor's type and required name fields.
    pub fn target(&self) -> Result<EntryTarget, GradingError> {
        let kind = self
            .kind
            .as_deref()
            .unwrap_or("function")
            .to_ascii_lowercase();
        match kind.as_str() {
            "function" => Ok(EntryTarget::Function {
                name: required(&self.name, "name", &kind)?,
                params: self.params.clone(),
            }),
            "class_method" => Ok(EntryTarget::ClassMethod {
                class_name: required(&self.class_name, "class_name", &kind)?,
                method_name: required(&self.method_name, "method_name", &kind)?,
            }),
            "class_attribute" => Ok(EntryTarget::ClassAttribute {
                class_name: required(&self.class_name, "class_name", &kind)?,
                attribute_name: required(&self.attribute_name, "attribute_name", &kind)?,
            }),
            other => Err(GradingError::Spec(format!("Unsupported entry type: {other}"))),
        }
    }
}

fn required(field: &Option<String>, field_name: &str, kind: &str) -> Result<String, GradingError> {
    field
        .as_deref()
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GradingError::Spec(format!("Entry of type '{kind}' requires '{field_name}'")))
}

/// A validated entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryTarget {
    Function {
        name: String,
        params: Option<Vec<String>>,
    },
    ClassMethod {
        class_name: String,
        method_name: String,
    },
    ClassAttribute {
        class_name: String,
        attribute_name: String,
    },
}

impl EntryTarget {
    /// The label attached to every case of this entry.
    pub fn label(&self) -> String {
        match self {
            EntryTarget::Function { name, .. } => name.clone(),
            EntryTarget::ClassMethod {
                class_name,
                method_name,
            } => format!("{class_name}.{method_name}"),
            EntryTarget::ClassAttribute {
                class_name,
                attribute_name,
            } => format!("{class_name}.{attribute_name}"),
        }
    }

    fn kind_label(&self) -> &'static str {
        match self {
            EntryTarget::Function { .. } => "Function",
            EntryTarget::ClassMethod { .. } => "Method",
            EntryTarget::ClassAttribute { .. } => "Attribute",
        }
    }
}

/// One parameterized test case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    /// Legacy alias for `args`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub expected: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constructor_args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constructor_kwargs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestCase {
    /// `args` when non-empty, otherwise `input`, otherwise nothing.
    pub fn call_args(&self) -> &[Value] {
        match (self.args.as_deref(), self.input.as_deref()) {
            (Some(args), _) if !args.is_empty() => args,
            (_, Some(input)) => input,
            _ => &[],
        }
    }
}

/// An entry paired with the tests it runs, ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEntry {
    pub label: String,
    pub target: EntryTarget,
    pub constructor_args: Vec<Value>,
    pub constructor_kwargs: Map<String, Value>,
    pub tests: Vec<TestCase>,
}

impl PlannedEntry {
    /// Constructor arguments for `test`: the per-test override when present,
    /// else the entry default.
    pub fn constructor_for<'a>(&'a self, test: &'a TestCase) -> (&'a [Value], &'a Map<String, Value>) {
        (
            test.constructor_args
                .as_deref()
                .unwrap_or(&self.constructor_args),
            test.constructor_kwargs
                .as_ref()
                .unwrap_or(&self.constructor_kwargs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: Value) -> Result<TaskSpec, GradingError> {
        TaskSpec::from_json_str(&value.to_string())
    }

    #[test]
    fn test_single_entry_is_normalized_to_list() {
        let spec = spec(json!({
            "entry": {"type": "function", "name": "add", "params": ["a", "b"]},
            "tests": [{"args": [1, 2], "expected": 3}]
        }))
        .expect("valid spec");
        assert_eq!(spec.entries.len(), 1);
        let plan = spec.plan().expect("plan");
        assert_eq!(plan[0].label, "add");
        assert_eq!(
            plan[0].target,
            EntryTarget::Function {
                name: "add".to_string(),
                params: Some(vec!["a".to_string(), "b".to_string()]),
            }
        );
    }

    #[test]
    fn test_entry_must_be_object_or_list() {
        let err = spec(json!({"entry": "add", "tests": []})).expect_err("string entry");
        assert!(err.to_string().contains("must be an object or a list"), "{err}");

        let err = spec(json!({"entry": [{"name": "f"}, 3], "tests": []})).expect_err("mixed list");
        assert!(matches!(err, GradingError::Spec(_)));
    }

    #[test]
    fn test_missing_type_defaults_to_function_and_is_case_insensitive() {
        let spec = spec(json!({
            "entry": [{"name": "f"}, {"type": "Class_Method", "class_name": "C", "method_name": "m"}],
            "tests": []
        }))
        .expect("valid spec");
        let plan = spec.plan().expect("plan");
        assert_eq!(plan[0].label, "f");
        assert_eq!(plan[1].label, "C.m");
    }

    #[test]
    fn test_unsupported_type_is_spec_error() {
        let spec = spec(json!({"entry": {"type": "module", "name": "x"}, "tests": []}))
            .expect("parses");
        assert_eq!(
            spec.plan(),
            Err(GradingError::Spec("Unsupported entry type: module".to_string()))
        );
    }

    #[test]
    fn test_missing_name_field_is_spec_error() {
        let spec = spec(json!({"entry": {"type": "class_attribute", "class_name": "C"}, "tests": []}))
            .expect("parses");
        let err = spec.plan().expect_err("attribute_name missing");
        assert!(err.to_string().contains("attribute_name"), "{err}");
    }

    #[test]
    fn test_entry_tests_take_precedence_over_shared_tests() {
        let spec = spec(json!({
            "entry": [
                {"name": "f", "tests": [{"args": [1], "expected": 1}, {"args": [2], "expected": 2}]},
                {"name": "g", "tests": []}
            ],
            "tests": [{"args": [0], "expected": 0}]
        }))
        .expect("valid spec");
        let plan = spec.plan().expect("plan");
        assert_eq!(plan[0].tests.len(), 2);
        assert_eq!(plan[1].tests.len(), 1, "empty entry tests fall back to shared tests");
    }

    #[test]
    fn test_absent_tests_everywhere_is_spec_error() {
        let spec = spec(json!({"entry": {"name": "f"}})).expect("parses");
        let err = spec.plan().expect_err("no tests anywhere");
        assert_eq!(err.to_string(), "Function tests must be a list of test objects");
    }

    #[test]
    fn test_empty_shared_tests_plan_zero_cases() {
        let spec = spec(json!({"entry": {"name": "f"}, "tests": []})).expect("valid spec");
        let plan = spec.plan().expect("plan");
        assert!(plan[0].tests.is_empty());
    }

    #[test]
    fn test_legacy_input_alias() {
        let with_input: TestCase =
            serde_json::from_value(json!({"input": [1, 2], "expected": 3})).expect("test case");
        assert_eq!(with_input.call_args(), &[json!(1), json!(2)]);

        let empty_args: TestCase =
            serde_json::from_value(json!({"args": [], "input": [5], "expected": 5})).expect("test case");
        assert_eq!(empty_args.call_args(), &[json!(5)]);

        let neither: TestCase = serde_json::from_value(json!({"expected": null})).expect("test case");
        assert!(neither.call_args().is_empty());
        assert_eq!(neither.expected, Value::Null);
    }

    #[test]
    fn test_constructor_override_per_test() {
        let spec = spec(json!({
            "entry": {
                "type": "class_method", "class_name": "Counter", "method_name": "inc",
                "constructor_args": [10]
            },
            "tests": [
                {"args": [], "expected": 11},
                {"args": [], "expected": 1, "constructor_args": [0], "constructor_kwargs": {"step": 1}}
            ]
        }))
        .expect("valid spec");
        let plan = spec.plan().expect("plan");
        let entry = &plan[0];
        let (args, kwargs) = entry.constructor_for(&entry.tests[0]);
        assert_eq!(args, &[json!(10)]);
        assert!(kwargs.is_empty());
        let (args, kwargs) = entry.constructor_for(&entry.tests[1]);
        assert_eq!(args, &[json!(0)]);
        assert_eq!(kwargs.get("step"), Some(&json!(1)));
    }

    #[test]
    fn test_allowed_imports_empty_disables_check() {
        let spec = spec(json!({"entry": {"name": "f"}, "tests": [], "allowed_imports": []}))
            .expect("valid spec");
        assert!(spec.allowed_imports().is_none());
    }

    #[test]
    fn test_spec_survives_wire_encoding() {
        let original = spec(json!({
            "entry": {"name": "f", "params": ["x"]},
            "tests": [{"args": [1], "kwargs": {"y": 2}, "expected": [1, 2]}],
            "allowed_imports": ["math"]
        }))
        .expect("valid spec");
        let text = serde_json::to_string(&original).expect("serialize spec");
        assert!(text.contains(r#""entry":[{"#), "entry is sent as a list: {text}");
        assert_eq!(TaskSpec::from_json_str(&text).expect("reparse"), original);
    }

    #[test]
    fn test_load_task_spec_from_task_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task_dir = dir.path().join("sum");
        std::fs::create_dir_all(&task_dir).expect("mkdir");
        std::fs::write(
            task_dir.join("task.json"),
            r#"{"entry": {"name": "add"}, "tests": [{"args": [1, 1], "expected": 2}]}"#,
        )
        .expect("write task.json");

        let spec = load_task_spec(dir.path(), "sum").expect("load spec");
        assert_eq!(spec.entries[0].name.as_deref(), Some("add"));

        let err = load_task_spec(dir.path(), "missing").expect_err("no such task");
        assert_eq!(err.to_string(), "Task spec not found for task_id='missing'");
    }
}
