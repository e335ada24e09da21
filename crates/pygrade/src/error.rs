//! Error taxonomy for grading a submission.
//!
//! Every variant is fatal for the submission it belongs to: it short-circuits
//! to a single top-level message and an empty case list. Exceptions raised by
//! one test case are not errors at this level; they are recorded inline as a
//! [`CaseResult`](crate::types::CaseResult) with `status = "error"`.

use thiserror::Error;

use crate::types::FailureKind;

/// A fatal grading failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradingError {
    /// The task specification is malformed.
    #[error("{0}")]
    Spec(String),

    /// The source imports modules outside the allow-list. Raised before any
    /// submitted code is compiled or executed.
    #[error("Disallowed imports: {}. Allowed: {:?}", .disallowed.join(", "), .allowed)]
    SecurityViolation {
        /// Offending top-level module names, sorted.
        disallowed: Vec<String>,
        /// The effective allow-list, sorted.
        allowed: Vec<String>,
    },

    /// The submitted module failed to compile or raised while executing its
    /// top level.
    #[error("Error executing solution module: {message}")]
    Load { message: String },

    /// A declared function, class or method does not exist.
    #[error("{kind} '{name}' not found")]
    EntityNotFound { kind: &'static str, name: String },

    /// The declared parameter names differ from the callable's signature.
    /// `actual` is `None` when the callable exposes no inspectable signature.
    #[error("{}", signature_message(.expected, .actual.as_deref()))]
    SignatureMismatch {
        expected: Vec<String>,
        actual: Option<Vec<String>>,
    },

    /// The harness did not finish within its wall-clock budget.
    #[error("Grading timed out after {limit_ms} ms")]
    HarnessTimeout { limit_ms: u64 },

    /// Unexpected failure inside the harness itself.
    #[error("Grader failed: {0}")]
    Internal(String),

    /// The execution unit failed to start, crashed, timed out, or produced
    /// no parseable result line.
    #[error("{0}")]
    Isolation(String),

    /// The isolation backend could not be reached; no unit was started.
    #[error("Isolation backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl GradingError {
    /// The report category this error is published under when it crosses the
    /// unit boundary.
    pub fn kind(&self) -> FailureKind {
        match self {
            GradingError::Spec(_) => FailureKind::SpecError,
            GradingError::SecurityViolation { .. } => FailureKind::SecurityViolation,
            GradingError::Load { .. } => FailureKind::LoadError,
            GradingError::EntityNotFound { .. } => FailureKind::EntityNotFound,
            GradingError::SignatureMismatch { .. } => FailureKind::SignatureMismatch,
            GradingError::HarnessTimeout { .. } => FailureKind::Timeout,
            GradingError::Internal(_)
            | GradingError::Isolation(_)
            | GradingError::BackendUnavailable(_) => FailureKind::Internal,
        }
    }
}

fn signature_message(expected: &[String], actual: Option<&[String]>) -> String {
    match actual {
        Some(actual) => format!("Parameter names mismatch: expected {expected:?}, got {actual:?}"),
        None => format!("Parameter names mismatch: expected {expected:?}, but the signature cannot be inspected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_violation_message_lists_names() {
        let err = GradingError::SecurityViolation {
            disallowed: vec!["os".to_string(), "socket".to_string()],
            allowed: vec!["__future__".to_string(), "math".to_string()],
        };
        assert_eq!(
            err.to_string(),
            r#"Disallowed imports: os, socket. Allowed: ["__future__", "math"]"#
        );
        assert_eq!(err.kind(), FailureKind::SecurityViolation);
    }

    #[test]
    fn test_entity_not_found_message() {
        let err = GradingError::EntityNotFound {
            kind: "Function",
            name: "add".to_string(),
        };
        assert_eq!(err.to_string(), "Function 'add' not found");
    }

    #[test]
    fn test_signature_mismatch_messages() {
        let mismatch = GradingError::SignatureMismatch {
            expected: vec!["a".to_string(), "b".to_string()],
            actual: Some(vec!["x".to_string()]),
        };
        assert_eq!(
            mismatch.to_string(),
            r#"Parameter names mismatch: expected ["a", "b"], got ["x"]"#
        );

        let opaque = GradingError::SignatureMismatch {
            expected: vec!["a".to_string()],
            actual: None,
        };
        assert!(opaque.to_string().contains("cannot be inspected"));
    }

    #[test]
    fn test_launcher_errors_map_to_internal_kind() {
        assert_eq!(GradingError::Isolation("x".into()).kind(), FailureKind::Internal);
        assert_eq!(
            GradingError::BackendUnavailable("x".into()).kind(),
            FailureKind::Internal
        );
        assert_eq!(
            GradingError::HarnessTimeout { limit_ms: 10 }.kind(),
            FailureKind::Timeout
        );
    }
}
