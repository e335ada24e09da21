//! The isolation launcher: one disposable execution unit per submission.
//!
//! [`Launcher::grade`] encodes the payload, starts a unit through an
//! [`IsolationBackend`], and turns whatever comes back (a report line, a
//! crash, silence, a timeout) into an [`ExecutionResult`]. Every failure is
//! terminal for its submission; nothing is retried.
//!
//! ```text
//! spawn(unit) ──► Completed { stdout, stderr, code } ──► parse last line ──► result
//!            └──► TimedOut                          ──► error, no cases
//! ```

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::config::LauncherSettings;
use crate::error::GradingError;
use crate::payload::{parse_report_line, HarnessPayload};
use crate::spec::TaskSpec;
use crate::types::{ExecutionResult, HarnessReport};

/// Exit code of a unit killed by SIGKILL, typically the memory ceiling.
pub const EXIT_KILLED: i32 = 137;

/// Exit code docker uses when the container could not be started at all.
pub const EXIT_START_FAILED: i32 = 125;

/// How a unit should be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    /// Unique, so a timed-out unit can be force-removed by name.
    pub name: String,
    pub image: String,
    pub memory_limit: String,
    pub user: String,
    pub pids_limit: u32,
    pub tmpfs_size: String,
    pub timeout: Duration,
    /// Command run inside the unit.
    pub command: Vec<String>,
}

/// How a unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// The unit exited on its own. `code` is `None` when it was ended by a
    /// signal.
    Completed {
        stdout: String,
        stderr: String,
        code: Option<i32>,
    },
    /// The wall-clock limit passed; the unit has been torn down.
    TimedOut,
}

/// A mechanism able to run a [`UnitSpec`] in isolation.
pub trait IsolationBackend: Send + Sync {
    /// Fails with [`GradingError::BackendUnavailable`] when units cannot be
    /// started right now.
    fn ensure_available(&self) -> Result<(), GradingError>;

    /// Starts the unit and blocks until it exits or times out.
    fn run(&self, unit: &UnitSpec) -> Result<UnitExit, GradingError>;
}

// ── Docker backend ────────────────────────────────────────────────────────────

/// Runs units as containers through the docker CLI.
///
/// Every container is started with:
/// - `--rm` so it is removed on exit
/// - `--network=none`
/// - `--memory` and `--memory-swap` set to the same ceiling
/// - `--user` set to an unprivileged account
/// - `--cap-drop=ALL` and `--security-opt=no-new-privileges`
/// - `--pids-limit`
/// - `--read-only` with a size-limited tmpfs on `/tmp`
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker_bin: String,
}

impl DockerBackend {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    /// Arguments passed to the docker binary for `unit`.
    pub fn run_args(unit: &UnitSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            unit.name.clone(),
            "--network=none".to_string(),
            format!("--memory={}", unit.memory_limit),
            format!("--memory-swap={}", unit.memory_limit),
            format!("--user={}", unit.user),
            "--cap-drop=ALL".to_string(),
            "--security-opt=no-new-privileges".to_string(),
            format!("--pids-limit={}", unit.pids_limit),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            format!("/tmp:rw,size={}", unit.tmpfs_size),
            unit.image.clone(),
            "pygrade".to_string(),
        ];
        args.extend(unit.command.iter().cloned());
        args
    }

    fn force_remove(&self, name: &str) {
        let removed = Command::new(&self.docker_bin)
            .args(["rm", "-f", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = removed {
            warn!(unit = name, error = %e, "failed to force-remove unit");
        }
    }
}

impl IsolationBackend for DockerBackend {
    fn ensure_available(&self) -> Result<(), GradingError> {
        let output = Command::new(&self.docker_bin)
            .args(["info", "--format", "{{.ServerVersion}}"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| GradingError::BackendUnavailable(format!("cannot run '{}': {e}", self.docker_bin)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GradingError::BackendUnavailable(tail(stderr.trim()).to_string()));
        }
        debug!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "isolation backend available"
        );
        Ok(())
    }

    fn run(&self, unit: &UnitSpec) -> Result<UnitExit, GradingError> {
        let mut child = Command::new(&self.docker_bin)
            .args(Self::run_args(unit))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GradingError::Isolation(format!("Failed to start execution unit: {e}")))?;

        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let waited = child
            .wait_timeout(unit.timeout)
            .map_err(|e| GradingError::Isolation(format!("Failed to wait for execution unit: {e}")))?;

        match waited {
            Some(status) => Ok(UnitExit::Completed {
                stdout: join_reader(stdout),
                stderr: join_reader(stderr),
                code: status.code(),
            }),
            None => {
                warn!(unit = %unit.name, timeout = ?unit.timeout, "execution unit timed out");
                let _ = child.kill();
                let _ = child.wait();
                self.force_remove(&unit.name);
                join_reader(stdout);
                join_reader(stderr);
                Ok(UnitExit::TimedOut)
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).ok();
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(reader: Option<thread::JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// The last line of diagnostic output, which is where docker and Python put
/// the useful part.
fn tail(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or(text)
}

// ── Launcher ──────────────────────────────────────────────────────────────────

static UNIT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A unique unit name: `pygrade-` plus 12 hex digits of a SHA-256 over the
/// submission id, the source and a per-call nonce.
pub fn unit_name(submission_id: &str, source: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let counter = UNIT_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(submission_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(counter.to_le_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("pygrade-{hex}")
}

/// Grades submissions in isolated units.
#[derive(Clone)]
pub struct Launcher {
    settings: LauncherSettings,
    backend: Arc<dyn IsolationBackend>,
}

impl Launcher {
    pub fn new(settings: LauncherSettings, backend: Arc<dyn IsolationBackend>) -> Self {
        Self { settings, backend }
    }

    /// A launcher backed by the docker CLI named in `settings`.
    pub fn docker(settings: LauncherSettings) -> Self {
        let backend = Arc::new(DockerBackend::new(settings.docker_bin.clone()));
        Self::new(settings, backend)
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    /// Grades one submission, blocking until its unit finishes.
    pub fn grade(&self, submission_id: &str, source: &str, spec: &TaskSpec) -> ExecutionResult {
        let start = Instant::now();
        let result = match self.run_unit(submission_id, source, spec) {
            Ok(report) => ExecutionResult::from_report(report),
            Err(err) => {
                warn!(submission_id, error = %err, "grading failed outside the harness");
                ExecutionResult::failure(err.to_string())
            }
        };
        let elapsed = start.elapsed().as_secs_f64();
        info!(
            submission_id,
            status = ?result.status,
            cases = result.cases.len(),
            elapsed_s = elapsed,
            "submission finished"
        );
        result.with_execution_time(elapsed)
    }

    /// Grades one submission on its own worker thread.
    pub fn submit(&self, submission_id: String, source: String, spec: TaskSpec) -> PendingGrade {
        let launcher = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("pygrade-submit-{submission_id}"))
            .spawn(move || launcher.grade(&submission_id, &source, &spec));
        match spawned {
            Ok(handle) => PendingGrade(Pending::Running(handle)),
            Err(e) => PendingGrade(Pending::Ready(ExecutionResult::failure(
                GradingError::Isolation(format!("Failed to start submission worker: {e}")).to_string(),
            ))),
        }
    }

    fn run_unit(
        &self,
        submission_id: &str,
        source: &str,
        spec: &TaskSpec,
    ) -> Result<HarnessReport, GradingError> {
        let encoded = HarnessPayload {
            submission_id: submission_id.to_string(),
            source: source.to_string(),
            spec: spec.clone(),
        }
        .encode()?;
        if encoded.encoded_len() > self.settings.max_payload_bytes {
            return Err(GradingError::Isolation(format!(
                "Submission too large: {} encoded bytes exceeds the limit of {}",
                encoded.encoded_len(),
                self.settings.max_payload_bytes
            )));
        }

        self.backend.ensure_available()?;

        let unit = UnitSpec {
            name: unit_name(submission_id, source),
            image: self.settings.image.clone(),
            memory_limit: self.settings.memory_limit.clone(),
            user: self.settings.user.clone(),
            pids_limit: self.settings.pids_limit,
            tmpfs_size: self.settings.tmpfs_size.clone(),
            timeout: self.settings.timeout,
            command: encoded.harness_args(self.settings.harness_timeout_ms),
        };
        debug!(submission_id, unit = %unit.name, image = %unit.image, "starting execution unit");

        match self.backend.run(&unit)? {
            UnitExit::TimedOut => Err(GradingError::Isolation(format!(
                "Execution timed out after {} seconds",
                self.settings.timeout.as_secs_f64()
            ))),
            UnitExit::Completed {
                stdout,
                stderr,
                code,
            } => {
                let report = classify_exit(&stdout, &stderr, code)?;
                if report.submission_id() != submission_id {
                    return Err(GradingError::Isolation(format!(
                        "Grader reported submission '{}' instead of '{submission_id}'",
                        report.submission_id()
                    )));
                }
                Ok(report)
            }
        }
    }
}

fn classify_exit(stdout: &str, stderr: &str, code: Option<i32>) -> Result<HarnessReport, GradingError> {
    match code {
        Some(0) => parse_report_line(stdout),
        Some(EXIT_KILLED) => Err(GradingError::Isolation(
            "Execution unit was killed (memory limit exceeded or out of resources)".to_string(),
        )),
        Some(EXIT_START_FAILED) => Err(GradingError::Isolation(format!(
            "Execution unit failed to start: {}",
            tail(stderr.trim())
        ))),
        Some(code) => Err(GradingError::Isolation(format!(
            "Execution unit crashed with exit code {code}: {}",
            tail(stderr.trim())
        ))),
        None => Err(GradingError::Isolation(
            "Execution unit was terminated by a signal".to_string(),
        )),
    }
}

/// Handle to a submission being graded on a worker thread.
pub struct PendingGrade(Pending);

enum Pending {
    Running(thread::JoinHandle<ExecutionResult>),
    Ready(ExecutionResult),
}

impl PendingGrade {
    /// Blocks until the result is available.
    pub fn wait(self) -> ExecutionResult {
        match self.0 {
            Pending::Ready(result) => result,
            Pending::Running(handle) => handle.join().unwrap_or_else(|_| {
                ExecutionResult::failure(
                    GradingError::Isolation("Submission worker panicked".to_string()).to_string(),
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_run_args_carry_isolation_flags() {
        let unit = UnitSpec {
            name: "pygrade-abc".to_string(),
            image: "pygrade-worker".to_string(),
            memory_limit: "128m".to_string(),
            user: "runner".to_string(),
            pids_limit: 64,
            tmpfs_size: "16m".to_string(),
            timeout: Duration::from_secs(10),
            command: vec!["harness".to_string(), "--submission-id".to_string(), "s1".to_string()],
        };
        let args = DockerBackend::run_args(&unit);
        for flag in [
            "--rm",
            "--network=none",
            "--memory=128m",
            "--memory-swap=128m",
            "--user=runner",
            "--cap-drop=ALL",
            "--security-opt=no-new-privileges",
            "--pids-limit=64",
            "--read-only",
        ] {
            assert!(args.iter().any(|a| a == flag), "missing {flag} in {args:?}");
        }
        let image_at = args.iter().position(|a| a == "pygrade-worker").expect("image present");
        assert_eq!(&args[image_at + 1..], &["pygrade", "harness", "--submission-id", "s1"]);
    }

    #[test]
    fn test_unit_names_are_unique() {
        let names: HashSet<String> = (0..100).map(|_| unit_name("s1", "print(1)")).collect();
        assert_eq!(names.len(), 100);
        assert!(names.iter().all(|n| n.starts_with("pygrade-") && n.len() == "pygrade-".len() + 12));
    }

    #[test]
    fn test_classify_exit_codes() {
        assert!(classify_exit("", "", Some(EXIT_KILLED))
            .expect_err("killed")
            .to_string()
            .contains("killed"));
        assert!(classify_exit("", "Unable to find image\n", Some(EXIT_START_FAILED))
            .expect_err("start failure")
            .to_string()
            .contains("Unable to find image"));
        assert!(classify_exit("", "boom\n", Some(1))
            .expect_err("crash")
            .to_string()
            .contains("exit code 1: boom"));
        assert_eq!(
            classify_exit("", "", Some(0)),
            Err(GradingError::Isolation("No output from grader".to_string()))
        );
    }

    #[test]
    fn test_missing_docker_binary_is_backend_unavailable() {
        let backend = DockerBackend::new("/nonexistent/pygrade-docker");
        match backend.ensure_available() {
            Err(GradingError::BackendUnavailable(msg)) => assert!(msg.contains("cannot run"), "{msg}"),
            other => panic!("expected BackendUnavailable, got {other:?}"),
        }
    }
}
