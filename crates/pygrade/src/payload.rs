//! What crosses the execution-unit boundary in each direction.
//!
//! Inbound, the launcher passes the source and the task spec as two base64
//! command-line arguments. Outbound, the harness prints exactly one JSON line,
//! a [`HarnessReport`]; the launcher reads the last non-empty line of stdout.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::GradingError;
use crate::spec::TaskSpec;
use crate::types::HarnessReport;

/// Everything the harness needs to grade one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessPayload {
    pub submission_id: String,
    pub source: String,
    pub spec: TaskSpec,
}

/// A [`HarnessPayload`] in its transport form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub submission_id: String,
    /// Base64 (standard alphabet) of the UTF-8 source.
    pub source: String,
    /// Base64 (standard alphabet) of the task spec JSON.
    pub spec: String,
}

impl HarnessPayload {
    pub fn encode(&self) -> Result<EncodedPayload, GradingError> {
        let spec_json = serde_json::to_string(&self.spec)
            .map_err(|e| GradingError::Internal(format!("Cannot encode task spec: {e}")))?;
        Ok(EncodedPayload {
            submission_id: self.submission_id.clone(),
            source: general_purpose::STANDARD.encode(self.source.as_bytes()),
            spec: general_purpose::STANDARD.encode(spec_json.as_bytes()),
        })
    }
}

impl EncodedPayload {
    pub fn decode(&self) -> Result<HarnessPayload, GradingError> {
        let source = decode_text(&self.source, "source")?;
        let spec_json = decode_text(&self.spec, "spec")?;
        Ok(HarnessPayload {
            submission_id: self.submission_id.clone(),
            source,
            spec: TaskSpec::from_json_str(&spec_json)?,
        })
    }

    /// Size of the encoded arguments, checked against the launcher's limit.
    pub fn encoded_len(&self) -> usize {
        self.submission_id.len() + self.source.len() + self.spec.len()
    }

    /// The harness command line: `harness --submission-id … --source …
    /// --spec … --timeout-ms …`.
    pub fn harness_args(&self, timeout_ms: u64) -> Vec<String> {
        vec![
            "harness".to_string(),
            "--submission-id".to_string(),
            self.submission_id.clone(),
            "--source".to_string(),
            self.source.clone(),
            "--spec".to_string(),
            self.spec.clone(),
            "--timeout-ms".to_string(),
            timeout_ms.to_string(),
        ]
    }
}

fn decode_text(encoded: &str, what: &str) -> Result<String, GradingError> {
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| GradingError::Internal(format!("Invalid base64 {what}: {e}")))?;
    String::from_utf8(bytes).map_err(|e| GradingError::Internal(format!("Invalid UTF-8 {what}: {e}")))
}

/// Parses the harness's result from a unit's captured stdout.
pub fn parse_report_line(stdout: &str) -> Result<HarnessReport, GradingError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .ok_or_else(|| GradingError::Isolation("No output from grader".to_string()))?;
    serde_json::from_str(line)
        .map_err(|e| GradingError::Isolation(format!("Invalid JSON output from grader: {e}")))
}
