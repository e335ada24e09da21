// Criterion benchmark groups:
//   import_scan   : static allow-list check, no VM
//   payload_encode: base64 transport encoding of a typical submission
//   grade         : full in-process grading run (VM init + load + cases)

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pygrade::imports::check_allowed_imports;
use pygrade::{grade, HarnessPayload, HarnessSettings, TaskSpec};
use serde_json::json;
use std::time::Duration;

const SOLUTION: &str = concat!(
    "import math\n",
    "from collections import Counter\n",
    "\n",
    "def top_words(text, k):\n",
    "    counts = Counter(text.lower().split())\n",
    "    return [w for w, _ in counts.most_common(k)]\n",
    "\n",
    "def hyp(a, b):\n",
    "    return math.sqrt(a * a + b * b)\n",
);

fn task_spec() -> TaskSpec {
    TaskSpec::from_json_str(
        &json!({
            "entry": [
                {"name": "top_words", "params": ["text", "k"], "tests": [
                    {"args": ["a b a c a b", 2], "expected": ["a", "b"]},
                    {"args": ["", 1], "expected": []}
                ]},
                {"name": "hyp", "params": ["a", "b"], "tests": [
                    {"args": [3, 4], "expected": 5.0}
                ]}
            ],
            "allowed_imports": ["math", "collections"]
        })
        .to_string(),
    )
    .expect("bench spec is valid")
}

fn import_scan(c: &mut Criterion) {
    let allowed = vec!["math".to_string(), "collections".to_string()];
    c.bench_function("import_scan", |b| {
        b.iter(|| check_allowed_imports(black_box(SOLUTION), black_box(&allowed)))
    });
}

fn payload_encode(c: &mut Criterion) {
    let payload = HarnessPayload {
        submission_id: "bench".to_string(),
        source: SOLUTION.to_string(),
        spec: task_spec(),
    };
    c.bench_function("payload_encode", |b| b.iter(|| black_box(&payload).encode()));
}

fn grade_in_process(c: &mut Criterion) {
    let spec = task_spec();
    let settings = HarnessSettings::default();
    let mut group = c.benchmark_group("grade");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));
    group.bench_function("two_entries_three_cases", |b| {
        b.iter(|| grade("bench", black_box(SOLUTION), &spec, &settings))
    });
    group.finish();
}

criterion_group!(benches, import_scan, payload_encode, grade_in_process);
criterion_main!(benches);
