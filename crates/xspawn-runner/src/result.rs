//! Final values of a run.

use crate::capture::CaptureBuffer;
use crate::types::{ProcessIdentifier, TerminationStatus};
use serde::{Deserialize, Serialize};

/// Outcome of a run with a work body: how the child ended plus the body's value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionResult<T> {
    pub termination_status: TerminationStatus,
    pub value: T,
}

impl<T> ExecutionResult<T> {
    #[must_use]
    pub const fn new(termination_status: TerminationStatus, value: T) -> Self {
        Self {
            termination_status,
            value,
        }
    }

    /// Transform the value, keeping the termination status.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExecutionResult<U> {
        ExecutionResult {
            termination_status: self.termination_status,
            value: f(self.value),
        }
    }
}

/// Outcome of a collected run.
///
/// `standard_output` / `standard_error` are present only for streams that
/// were collected, and hold at most the configured limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectedResult {
    pub process_identifier: ProcessIdentifier,
    pub termination_status: TerminationStatus,
    pub standard_output: Option<Vec<u8>>,
    pub standard_error: Option<Vec<u8>>,
    /// The child wrote more to standard output than the limit allowed.
    #[serde(default)]
    pub stdout_truncated: bool,
    /// The child wrote more to standard error than the limit allowed.
    #[serde(default)]
    pub stderr_truncated: bool,
}

impl CollectedResult {
    pub(crate) fn new(
        process_identifier: ProcessIdentifier,
        termination_status: TerminationStatus,
        standard_output: Option<CaptureBuffer>,
        standard_error: Option<CaptureBuffer>,
    ) -> Self {
        Self {
            process_identifier,
            termination_status,
            stdout_truncated: standard_output
                .as_ref()
                .is_some_and(CaptureBuffer::was_truncated),
            stderr_truncated: standard_error
                .as_ref()
                .is_some_and(CaptureBuffer::was_truncated),
            standard_output: standard_output.map(CaptureBuffer::into_bytes),
            standard_error: standard_error.map(CaptureBuffer::into_bytes),
        }
    }

    /// Get stdout as a UTF-8 string, lossy conversion; empty when not collected.
    #[must_use]
    pub fn stdout_string(&self) -> String {
        lossy(self.standard_output.as_deref())
    }

    /// Get stderr as a UTF-8 string, lossy conversion; empty when not collected.
    #[must_use]
    pub fn stderr_string(&self) -> String {
        lossy(self.standard_error.as_deref())
    }

    /// Check if the process exited successfully (exit code 0).
    #[must_use]
    pub const fn success(&self) -> bool {
        self.termination_status.is_success()
    }
}

fn lossy(bytes: Option<&[u8]>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}
