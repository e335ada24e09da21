// End-to-end flow across the unit boundary without a container: the launcher
// side encodes, the harness side decodes and grades, the report line goes back
// through stdout parsing and becomes the caller's result.

use pygrade::{
    grade_payload, parse_report_line, EncodedPayload, ExecutionResult, ExecutionStatus,
    HarnessPayload, HarnessReport, HarnessSettings, TaskSpec,
};
use serde_json::json;

fn roundtrip(submission_id: &str, source: &str, spec: serde_json::Value) -> ExecutionResult {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = HarnessSettings {
        solution_path: Some(dir.path().join("solution.py")),
        ..HarnessSettings::default()
    };

    let encoded = HarnessPayload {
        submission_id: submission_id.to_string(),
        source: source.to_string(),
        spec: TaskSpec::from_json_str(&spec.to_string()).expect("valid spec"),
    }
    .encode()
    .expect("encode");

    // What the harness would receive on its command line.
    let received = EncodedPayload {
        submission_id: encoded.submission_id.clone(),
        source: encoded.source.clone(),
        spec: encoded.spec.clone(),
    };
    let report = grade_payload(&received.decode().expect("decode"), &settings);

    // Module-level prints land in the capture buffer, so the line is the
    // only thing on stdout; prepend noise anyway to exercise last-line parsing.
    let stdout = format!(
        "warming up\n{}\n\n",
        serde_json::to_string(&report).expect("serialize report")
    );
    let parsed = parse_report_line(&stdout).expect("report line parses");
    assert_eq!(parsed, report);
    assert_eq!(parsed.submission_id(), submission_id);
    ExecutionResult::from_report(parsed)
}

#[test]
fn test_all_cases_pass_end_to_end() {
    let result = roundtrip(
        "e2e-1",
        "import math\n\ndef hyp(a, b):\n    print('computing')\n    return math.sqrt(a * a + b * b)\n",
        json!({
            "entry": {"type": "function", "name": "hyp", "params": ["a", "b"]},
            "tests": [
                {"args": [3, 4], "expected": 5.0},
                {"args": [5, 12], "expected": 13.0, "description": "bigger triple"}
            ],
            "allowed_imports": ["math"]
        }),
    );
    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(result.error_message.is_none());
    assert_eq!(result.cases.len(), 2);
    assert_eq!(result.cases[0].actual, Some(json!(5.0)));
    assert_eq!(result.summary.map(|s| (s.passed, s.total)), Some((2, 2)));
}

#[test]
fn test_mixed_entries_end_to_end() {
    let source = r#"
class Stack:
    def __init__(self, *items):
        self.items = list(items)
        self.kind = "lifo"

    def push(self, x):
        self.items.append(x)
        return len(self.items)

    def pop(self):
        return self.items.pop()

def reverse(s):
    return s[::-1]
"#;
    let result = roundtrip(
        "e2e-2",
        source,
        json!({
            "entry": [
                {"name": "reverse", "params": ["s"], "tests": [{"args": ["abc"], "expected": "cba"}]},
                {
                    "type": "class_method",
                    "class_name": "Stack",
                    "method_name": "pop",
                    "constructor_args": [1, 2],
                    "tests": [
                        {"expected": 2},
                        {"constructor_args": [], "expected": null}
                    ]
                },
                {
                    "type": "class_attribute",
                    "class_name": "Stack",
                    "attribute_name": "kind",
                    "tests": [{"expected": "lifo"}]
                }
            ]
        }),
    );

    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.error_message.is_none(), "per-case errors are not fatal");
    let indices: Vec<usize> = result.cases.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    assert_eq!(result.cases[1].entry, "Stack.pop");
    assert_eq!(result.cases[1].actual, Some(json!(2)));
    assert!(result.cases[2]
        .error
        .as_deref()
        .unwrap_or_default()
        .starts_with("IndexError"));
    assert_eq!(result.cases[3].actual, Some(json!("lifo")));
    assert_eq!(result.summary.map(|s| (s.passed, s.total)), Some((3, 4)));
}

#[test]
fn test_fatal_failure_end_to_end() {
    let result = roundtrip(
        "e2e-3",
        "import subprocess\n\ndef run(cmd):\n    return subprocess.run(cmd)\n",
        json!({
            "entry": {"name": "run"},
            "tests": [{"args": [["ls"]], "expected": 0}],
            "allowed_imports": ["math", "collections"]
        }),
    );
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.cases.is_empty());
    assert!(result.summary.is_none());
    assert_eq!(
        result.error_message.as_deref(),
        Some(r#"Disallowed imports: subprocess. Allowed: ["__future__", "collections", "math"]"#)
    );
}

#[test]
fn test_undecodable_payload_reports_failure_line() {
    let encoded = EncodedPayload {
        submission_id: "e2e-4".to_string(),
        source: "not base64!!".to_string(),
        spec: String::new(),
    };
    let err = encoded.decode().expect_err("invalid base64");
    let report = HarnessReport::failed(&encoded.submission_id, &err);
    let line = serde_json::to_string(&report).expect("serialize");
    let result = ExecutionResult::from_report(parse_report_line(&line).expect("parse"));
    assert!(result
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("Invalid base64 source"));
    assert!(result.cases.is_empty());
}
