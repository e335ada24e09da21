//! Settings for the two halves of the engine.
//!
//! - [`HarnessSettings`] governs one in-unit grading run.
//! - [`LauncherSettings`] governs how execution units are started. Every field
//!   can be overridden from `PYGRADE_*` environment variables via
//!   [`LauncherSettings::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the harness writes the submitted source inside the unit.
pub const SOLUTION_PATH: &str = "/tmp/solution.py";

/// Module name the submitted source executes under.
pub const SOLUTION_MODULE: &str = "solution";

/// Default combined stdout + stderr budget for submitted code: 1 MiB.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1_048_576;

/// `sys.getrecursionlimit()` inside the grading VM. Deeper recursion is a
/// per-case `RecursionError`, not a crash.
pub const RECURSION_LIMIT: usize = 1_000;

/// Default harness wall-clock budget in milliseconds.
pub const DEFAULT_HARNESS_TIMEOUT_MS: u64 = 5_000;

/// Configuration for a single grading run inside the unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    /// Maximum wall-clock time in nanoseconds for the whole pipeline.
    /// Default: 5,000,000,000 ns (5 seconds).
    pub timeout_ns: u64,

    /// Maximum number of bytes the submitted code may print, stdout and
    /// stderr combined. Default: 1 MiB.
    pub max_output_bytes: usize,

    /// When set, the source is written to this path before loading and the
    /// module's `__file__` points at it. Left unset for in-process grading.
    pub solution_path: Option<PathBuf>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            timeout_ns: DEFAULT_HARNESS_TIMEOUT_MS * 1_000_000,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            solution_path: None,
        }
    }
}

impl HarnessSettings {
    /// Settings used inside the unit: the given budget plus the fixed
    /// solution path.
    pub fn in_unit(timeout_ms: u64) -> Self {
        Self {
            timeout_ns: timeout_ms.saturating_mul(1_000_000),
            solution_path: Some(PathBuf::from(SOLUTION_PATH)),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout_ns)
    }

    /// The value bound to `__file__` in the solution namespace.
    pub fn module_file(&self) -> String {
        self.solution_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| SOLUTION_PATH.to_string())
    }
}

/// Configuration for starting execution units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherSettings {
    /// Container CLI binary. `PYGRADE_DOCKER_BIN`, default `docker`.
    pub docker_bin: String,
    /// Worker image with the `pygrade` binary installed. `PYGRADE_IMAGE`.
    pub image: String,
    /// Hard memory ceiling, also used as the swap ceiling.
    /// `PYGRADE_MEMORY_LIMIT`, default `128m`.
    pub memory_limit: String,
    /// Launcher-side wall-clock limit per unit. `PYGRADE_TIMEOUT_SECS`.
    pub timeout: Duration,
    /// Unprivileged identity inside the unit. `PYGRADE_USER`.
    pub user: String,
    /// `PYGRADE_PIDS_LIMIT`, default 64.
    pub pids_limit: u32,
    /// Size of the writable `/tmp` tmpfs.
    pub tmpfs_size: String,
    /// Budget passed to the harness as `--timeout-ms`.
    /// `PYGRADE_HARNESS_TIMEOUT_MS`.
    pub harness_timeout_ms: u64,
    /// Largest accepted encoded payload (source + spec), in bytes.
    pub max_payload_bytes: usize,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            image: "pygrade-worker".to_string(),
            memory_limit: "128m".to_string(),
            timeout: Duration::from_secs(10),
            user: "runner".to_string(),
            pids_limit: 64,
            tmpfs_size: "16m".to_string(),
            harness_timeout_ms: DEFAULT_HARNESS_TIMEOUT_MS,
            max_payload_bytes: 96 * 1024,
        }
    }
}

impl LauncherSettings {
    /// Defaults overridden by `PYGRADE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns. Values that are empty
    /// or fail to parse keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Self::default();

        if let Some(bin) = get("PYGRADE_DOCKER_BIN") {
            settings.docker_bin = bin;
        }
        if let Some(image) = get("PYGRADE_IMAGE") {
            settings.image = image;
        }
        if let Some(memory) = get("PYGRADE_MEMORY_LIMIT") {
            settings.memory_limit = memory;
        }
        if let Some(secs) = get("PYGRADE_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok()) {
            settings.timeout = Duration::from_secs(secs);
        }
        if let Some(user) = get("PYGRADE_USER") {
            settings.user = user;
        }
        if let Some(pids) = get("PYGRADE_PIDS_LIMIT").and_then(|v| v.trim().parse().ok()) {
            settings.pids_limit = pids;
        }
        if let Some(ms) = get("PYGRADE_HARNESS_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()) {
            settings.harness_timeout_ms = ms;
        }
        settings
    }
}
