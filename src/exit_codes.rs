//! Process exit codes for the `xspawn` binary
//!
//! A finished child's own status is passed through: its exit code as-is, or
//! `128 + signal` when a signal killed it. Failures of xspawn itself map onto
//! the conventional shell codes below.

use xspawn_runner::{RunnerError, TerminationStatus};

/// Exit code returned by the `xspawn` binary.
///
/// | Constant | Code | Meaning |
/// |----------|------|---------|
/// | [`SUCCESS`](Self::SUCCESS) | 0 | Child exited with 0 |
/// | [`FAILURE`](Self::FAILURE) | 1 | Any other xspawn failure |
/// | [`CLI_ARGS`](Self::CLI_ARGS) | 2 | Invalid flags or configuration |
/// | [`SPAWN_FAILURE`](Self::SPAWN_FAILURE) | 126 | Child could not be started |
/// | [`NOT_FOUND`](Self::NOT_FOUND) | 127 | Executable not found |
/// | [`INTERRUPTED`](Self::INTERRUPTED) | 130 | Run cancelled by Ctrl-C |
///
/// ```rust
/// use xspawn::ExitCode;
/// use xspawn_runner::TerminationStatus;
///
/// assert_eq!(ExitCode::from(TerminationStatus::Exited(3)).as_i32(), 3);
/// assert_eq!(ExitCode::from(TerminationStatus::UnhandledException(15)).as_i32(), 143);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);

    pub const FAILURE: ExitCode = ExitCode(1);

    /// Invalid or missing command-line arguments, or an invalid config file
    pub const CLI_ARGS: ExitCode = ExitCode(2);

    /// The executable was found but could not be started
    pub const SPAWN_FAILURE: ExitCode = ExitCode(126);

    pub const NOT_FOUND: ExitCode = ExitCode(127);

    /// Interrupted by SIGINT
    pub const INTERRUPTED: ExitCode = ExitCode(130);

    /// Get the numeric exit code value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn from_i32(code: i32) -> Self {
        ExitCode(code)
    }
}

impl From<TerminationStatus> for ExitCode {
    fn from(status: TerminationStatus) -> Self {
        match status {
            TerminationStatus::Exited(code) => ExitCode(code),
            TerminationStatus::UnhandledException(signal) => ExitCode(128 + signal),
        }
    }
}

impl From<&RunnerError> for ExitCode {
    fn from(error: &RunnerError) -> Self {
        match error.primary() {
            RunnerError::ExecutableNotFound { .. } => Self::NOT_FOUND,
            RunnerError::Spawn { .. } | RunnerError::WorkingDirectoryNotFound { .. } => {
                Self::SPAWN_FAILURE
            }
            RunnerError::InvalidArgument { .. } => Self::CLI_ARGS,
            RunnerError::Cancelled => Self::INTERRUPTED,
            _ => Self::FAILURE,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_termination_status_passthrough() {
        assert_eq!(ExitCode::from(TerminationStatus::Exited(0)), ExitCode::SUCCESS);
        assert_eq!(ExitCode::from(TerminationStatus::Exited(42)).as_i32(), 42);
        assert_eq!(
            ExitCode::from(TerminationStatus::UnhandledException(9)).as_i32(),
            137
        );
    }

    #[test]
    fn test_runner_error_mapping() {
        let not_found = RunnerError::ExecutableNotFound {
            executable: "nope".to_string(),
        };
        assert_eq!(ExitCode::from(&not_found), ExitCode::NOT_FOUND);

        let missing_dir = RunnerError::WorkingDirectoryNotFound {
            path: PathBuf::from("/does/not/exist"),
        };
        assert_eq!(ExitCode::from(&missing_dir), ExitCode::SPAWN_FAILURE);

        let invalid = RunnerError::InvalidArgument {
            reason: "nul byte".to_string(),
        };
        assert_eq!(ExitCode::from(&invalid), ExitCode::CLI_ARGS);

        assert_eq!(ExitCode::from(&RunnerError::Cancelled), ExitCode::INTERRUPTED);
        assert_eq!(
            ExitCode::from(&RunnerError::WriterFinished),
            ExitCode::FAILURE
        );
    }
}
