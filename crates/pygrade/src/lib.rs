// pygrade: sandboxed grading of untrusted Python submissions against declarative task specs.

pub mod config;
pub mod error;
pub mod harness;
pub mod imports;
pub mod launcher;
pub mod output;
pub mod payload;
pub mod serialize;
pub mod spec;
pub mod timeout;
pub mod types;
pub(crate) mod vm;

pub use config::{HarnessSettings, LauncherSettings};
pub use error::GradingError;
pub use harness::{grade, grade_payload};
pub use launcher::{DockerBackend, IsolationBackend, Launcher, PendingGrade, UnitExit, UnitSpec};
pub use payload::{parse_report_line, EncodedPayload, HarnessPayload};
pub use spec::{load_task_spec, EntryDescriptor, TaskSpec, TestCase};
pub use types::{
    CaseResult, CaseStatus, ExecutionResult, ExecutionStatus, FailureKind, HarnessReport, Summary,
};
