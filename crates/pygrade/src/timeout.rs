//! Wall-clock guard for work that cannot be interrupted cooperatively.
//!
//! A tight Python loop never yields back to Rust, so the only portable way to
//! bound it is to run it on its own thread and stop waiting. The thread is
//! abandoned, not joined; the process exits shortly after the harness prints
//! its report.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Native stack reserved for the worker thread. RustPython frames live on the
/// Rust stack, so this must hold `sys.getrecursionlimit()` Python frames in
/// unoptimized builds; pages are only committed when touched.
pub const WORKER_STACK_SIZE: usize = 256 * 1024 * 1024;

/// Why [`run_with_timeout`] produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerFailure {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("worker thread panicked")]
    Panicked,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Runs `f` on a named thread with a [`WORKER_STACK_SIZE`] stack and waits at most `timeout` for its result.
pub fn run_with_timeout<F, T>(name: &str, timeout: Duration, f: F) -> Result<T, WorkerFailure>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel::<T>();

    thread::Builder::new()
        .name(name.to_string())
        .stack_size(WORKER_STACK_SIZE)
        .spawn(move || {
            // The receiver is gone after a timeout.
            let _ = tx.send(f());
        })
        .map_err(|e| WorkerFailure::Spawn(e.to_string()))?;

    match rx.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(WorkerFailure::TimedOut(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(WorkerFailure::Panicked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_fast_closure_returns_value() {
        let result = run_with_timeout("t-fast", Duration::from_secs(1), || {
            std::thread::sleep(Duration::from_millis(1));
            42u32
        });
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn test_slow_closure_times_out_promptly() {
        let limit = Duration::from_millis(50);
        let start = Instant::now();
        let result = run_with_timeout("t-slow", limit, || {
            std::thread::sleep(Duration::from_millis(500));
            0u32
        });
        assert_eq!(result, Err(WorkerFailure::TimedOut(limit)));
        assert!(
            start.elapsed() < Duration::from_millis(250),
            "took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn test_worker_has_room_for_deep_recursion() {
        fn descend(n: u64) -> u64 {
            let pad = std::hint::black_box([0u8; 512]);
            if n == 0 {
                u64::from(pad[0])
            } else {
                1 + descend(n - 1)
            }
        }
        // ~5 MiB of frames: overflows a default 2 MiB thread stack.
        let result = run_with_timeout("t-deep", Duration::from_secs(10), || descend(10_000));
        assert_eq!(result, Ok(10_000));
    }

    #[test]
    fn test_panicking_closure_is_reported() {
        let result = run_with_timeout("t-panic", Duration::from_secs(1), || -> u32 {
            panic!("intentional panic in worker");
        });
        assert_eq!(result, Err(WorkerFailure::Panicked));
    }
}
