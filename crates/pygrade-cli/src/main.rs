//! pygrade CLI.
//!
//! - `pygrade harness` runs inside an execution unit and prints exactly one
//!   JSON report line on stdout. It always exits 0.
//! - `pygrade grade` grades a submission in a fresh execution unit.
//! - `pygrade check` grades in-process, without isolation, for local task
//!   authoring.
//!
//! Logs go to stderr so stdout carries nothing but results.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use pygrade::{
    grade, grade_payload, load_task_spec, EncodedPayload, ExecutionResult, GradingError,
    HarnessReport, HarnessSettings, Launcher, LauncherSettings, TaskSpec,
};

#[derive(Parser, Debug)]
#[command(name = "pygrade", version, about = "Grade Python submissions in isolated execution units")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Grade a base64-encoded payload and print one report line (runs inside the unit)
    Harness {
        #[arg(long)]
        submission_id: String,

        /// Base64 of the solution source
        #[arg(long)]
        source: String,

        /// Base64 of the task spec JSON
        #[arg(long)]
        spec: String,

        /// Wall-clock budget for the whole grading run
        #[arg(long, default_value_t = pygrade::config::DEFAULT_HARNESS_TIMEOUT_MS)]
        timeout_ms: u64,
    },

    /// Grade a submission in an isolated execution unit
    Grade {
        #[command(flatten)]
        submission: SubmissionArgs,

        /// Worker image (overrides PYGRADE_IMAGE)
        #[arg(long)]
        image: Option<String>,

        /// Memory ceiling such as 128m (overrides PYGRADE_MEMORY_LIMIT)
        #[arg(long)]
        memory: Option<String>,

        /// Unit timeout in seconds (overrides PYGRADE_TIMEOUT_SECS)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Grade a submission in-process, without isolation
    Check {
        #[command(flatten)]
        submission: SubmissionArgs,

        #[arg(long, default_value_t = pygrade::config::DEFAULT_HARNESS_TIMEOUT_MS)]
        timeout_ms: u64,
    },
}

#[derive(Args, Debug)]
struct SubmissionArgs {
    /// Solution source file
    #[arg(long)]
    source: PathBuf,

    /// Task spec JSON file
    #[arg(long, conflicts_with_all = ["tasks_dir", "task_id"])]
    spec: Option<PathBuf>,

    /// Directory holding <task_id>/task.json
    #[arg(long, requires = "task_id")]
    tasks_dir: Option<PathBuf>,

    #[arg(long, requires = "tasks_dir")]
    task_id: Option<String>,

    #[arg(long, default_value = "local")]
    submission_id: String,
}

impl SubmissionArgs {
    fn load(&self) -> Result<(String, TaskSpec), GradingError> {
        let source = read_file(&self.source)?;
        let spec = match (&self.spec, &self.tasks_dir, &self.task_id) {
            (Some(path), _, _) => TaskSpec::from_json_str(&read_file(path)?)?,
            (None, Some(dir), Some(task_id)) => load_task_spec(dir, task_id)?,
            _ => {
                return Err(GradingError::Spec(
                    "Either --spec or --tasks-dir with --task-id is required".to_string(),
                ))
            }
        };
        Ok((source, spec))
    }
}

fn read_file(path: &Path) -> Result<String, GradingError> {
    std::fs::read_to_string(path)
        .map_err(|e| GradingError::Spec(format!("Cannot read {}: {e}", path.display())))
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pygrade=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Harness {
            submission_id,
            source,
            spec,
            timeout_ms,
        } => {
            let encoded = EncodedPayload {
                submission_id: submission_id.clone(),
                source,
                spec,
            };
            let settings = HarnessSettings::in_unit(timeout_ms);
            let report = match encoded.decode() {
                Ok(payload) => grade_payload(&payload, &settings),
                Err(err) => {
                    tracing::warn!(submission_id = %submission_id, error = %err, "cannot decode payload");
                    HarnessReport::failed(&submission_id, &err)
                }
            };
            print_json(&report);
        }

        Commands::Grade {
            submission,
            image,
            memory,
            timeout_secs,
        } => {
            let result = match submission.load() {
                Ok((source, spec)) => {
                    let mut settings = LauncherSettings::from_env();
                    if let Some(image) = image {
                        settings.image = image;
                    }
                    if let Some(memory) = memory {
                        settings.memory_limit = memory;
                    }
                    if let Some(secs) = timeout_secs {
                        settings.timeout = Duration::from_secs(secs);
                    }
                    Launcher::docker(settings).grade(&submission.submission_id, &source, &spec)
                }
                Err(err) => ExecutionResult::failure(err.to_string()),
            };
            print_json(&result);
        }

        Commands::Check {
            submission,
            timeout_ms,
        } => {
            let start = Instant::now();
            let result = match submission.load() {
                Ok((source, spec)) => {
                    let settings = HarnessSettings {
                        timeout_ns: timeout_ms.saturating_mul(1_000_000),
                        ..HarnessSettings::default()
                    };
                    ExecutionResult::from_report(grade(&submission.submission_id, &source, &spec, &settings))
                }
                Err(err) => ExecutionResult::failure(err.to_string()),
            };
            print_json(&result.with_execution_time(start.elapsed().as_secs_f64()));
        }
    }
}

/// Prints `value` as a single JSON line on stdout.
fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error serializing result: {e}");
            std::process::exit(1);
        }
    }
}
