//! Bounded capture of the submitted code's stdout and stderr.
//!
//! The harness owns the process's real stdout for its single result line, so
//! anything the submitted code prints lands in an [`OutputBuffer`] instead.
//! The buffer is shared between the harness thread and the VM thread via
//! `Arc<Mutex<_>>`; a timed-out VM thread may still hold a clone, which
//! [`OutputBuffer::into_strings`] tolerates.

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// A write was rejected because it would exceed the combined byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Output limit exceeded: {limit_bytes} bytes")]
pub struct OutputLimitExceeded {
    pub limit_bytes: usize,
}

struct Streams {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    max_bytes: usize,
    limit_exceeded: bool,
}

impl Streams {
    fn total_len(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }
}

/// Which captured stream a write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Thread-safe capture buffer. Clones share the same data.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Streams>>,
}

impl OutputBuffer {
    /// A buffer accepting up to `max_bytes` across both streams.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Streams {
                stdout: Vec::new(),
                stderr: Vec::new(),
                max_bytes,
                limit_exceeded: false,
            })),
        }
    }

    /// Appends `data` to `stream`. A write that would cross the budget is
    /// rejected whole and leaves the buffer unchanged.
    pub fn write(&self, stream: Stream, data: &[u8]) -> Result<(), OutputLimitExceeded> {
        let mut inner = self.inner.lock().expect("OutputBuffer mutex poisoned");
        if inner.total_len() + data.len() > inner.max_bytes {
            inner.limit_exceeded = true;
            return Err(OutputLimitExceeded {
                limit_bytes: inner.max_bytes,
            });
        }
        match stream {
            Stream::Stdout => inner.stdout.extend_from_slice(data),
            Stream::Stderr => inner.stderr.extend_from_slice(data),
        }
        Ok(())
    }

    pub fn is_limit_exceeded(&self) -> bool {
        self.inner
            .lock()
            .expect("OutputBuffer mutex poisoned")
            .limit_exceeded
    }

    /// Returns `(stdout, stderr)`, lossily decoded as UTF-8.
    pub fn into_strings(self) -> (String, String) {
        let decode = |s: &Streams| {
            (
                String::from_utf8_lossy(&s.stdout).into_owned(),
                String::from_utf8_lossy(&s.stderr).into_owned(),
            )
        };
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => decode(&mutex.into_inner().expect("OutputBuffer mutex poisoned")),
            Err(shared) => decode(&shared.lock().expect("OutputBuffer mutex poisoned")),
        }
    }
}
