//! Result types shared by the harness, the launcher and callers.
//!
//! - [`CaseResult`] / [`CaseStatus`]: outcome of one test case
//! - [`Summary`]: passed/total counts and the success rule
//! - [`HarnessReport`]: the single JSON line the harness prints inside the unit
//! - [`ExecutionResult`]: the caller-facing result of grading one submission

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GradingError;

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Failed,
    Error,
}

/// One graded test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    /// 1-based, unique and contiguous across every entry of the task.
    pub index: usize,
    /// Label of the entry the case belongs to (`add`, `Counter.inc`, ...).
    pub entry: String,
    /// The positional arguments the case was invoked with.
    pub input: Vec<Value>,
    pub status: CaseStatus,
    pub expected: Value,
    /// Serialized return value (or attribute value). Absent on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    /// `"<ExceptionType>: <message>"` when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate counts for a graded submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Summary {
    pub passed: usize,
    pub total: usize,
}

impl Summary {
    /// Computes the summary of an ordered case list.
    pub fn of(cases: &[CaseResult]) -> Self {
        Self {
            passed: cases
                .iter()
                .filter(|c| c.status == CaseStatus::Passed)
                .count(),
            total: cases.len(),
        }
    }

    /// A submission succeeds only when every case passed and there was at
    /// least one case.
    pub fn is_success(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }
}

/// Category of a fatal harness failure, as published on the result line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    SpecError,
    SecurityViolation,
    LoadError,
    EntityNotFound,
    SignatureMismatch,
    Timeout,
    Internal,
}

/// The harness's entire return channel: exactly one JSON line.
///
/// # Examples (JSON)
/// ```json
/// {"outcome":"graded","submission_id":"s1","summary":{"passed":1,"total":2},"cases":[...]}
/// {"outcome":"failed","submission_id":"s1","kind":"LoadError","error":"Error executing solution module: ..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HarnessReport {
    Graded {
        submission_id: String,
        summary: Summary,
        cases: Vec<CaseResult>,
    },
    Failed {
        submission_id: String,
        kind: FailureKind,
        error: String,
    },
}

impl HarnessReport {
    /// Builds a report from the outcome of the grading pipeline.
    pub fn from_outcome(submission_id: &str, outcome: Result<Vec<CaseResult>, GradingError>) -> Self {
        match outcome {
            Ok(cases) => HarnessReport::Graded {
                submission_id: submission_id.to_string(),
                summary: Summary::of(&cases),
                cases,
            },
            Err(err) => HarnessReport::failed(submission_id, &err),
        }
    }

    pub fn failed(submission_id: &str, err: &GradingError) -> Self {
        HarnessReport::Failed {
            submission_id: submission_id.to_string(),
            kind: err.kind(),
            error: err.to_string(),
        }
    }

    pub fn submission_id(&self) -> &str {
        match self {
            HarnessReport::Graded { submission_id, .. }
            | HarnessReport::Failed { submission_id, .. } => submission_id,
        }
    }
}

/// Overall status of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// The caller-facing result of grading one submission.
///
/// Either a complete case list with a summary, or an `error_message` with no
/// cases. Never a mixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub cases: Vec<CaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Wall-clock seconds spent grading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl ExecutionResult {
    /// A fatal failure: status `error`, no cases.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            cases: Vec::new(),
            error_message: Some(message.into()),
            execution_time: None,
            summary: None,
        }
    }

    /// Maps a harness report onto the caller contract.
    pub fn from_report(report: HarnessReport) -> Self {
        match report {
            HarnessReport::Graded { summary, cases, .. } => Self {
                status: if summary.is_success() {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Error
                },
                error_message: (summary.total == 0)
                    .then(|| "no test cases were executed".to_string()),
                cases,
                execution_time: None,
                summary: Some(summary),
            },
            HarnessReport::Failed { error, .. } => Self::failure(error),
        }
    }

    pub fn with_execution_time(mut self, seconds: f64) -> Self {
        self.execution_time = Some(seconds);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
