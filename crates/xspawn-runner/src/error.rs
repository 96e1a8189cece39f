//! Error types for the subprocess engine

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::platform::Signal;
use crate::types::ProcessIdentifier;

/// One of the three standard streams wired to a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdioStream {
    StandardInput,
    StandardOutput,
    StandardError,
}

impl fmt::Display for StdioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StandardInput => write!(f, "standard input"),
            Self::StandardOutput => write!(f, "standard output"),
            Self::StandardError => write!(f, "standard error"),
        }
    }
}

/// Subprocess execution errors, one variant family per failing stage.
///
/// | Stage | Variants |
/// |-------|----------|
/// | Resource creation | `ResourceCreation` |
/// | Process creation | `ExecutableNotFound`, `WorkingDirectoryNotFound`, `InvalidArgument`, `Spawn` |
/// | Descriptor I/O | `Read`, `Write`, `WriterFinished`, `Cancelled` |
/// | Work body | `Body` |
/// | Cleanup | `Cleanup`, `Signal`, `Wait` |
///
/// When the work body fails and the follow-up process-group termination fails
/// too, the body error is kept as the primary error inside `Unwinding`.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to create {resource}: {source}")]
    ResourceCreation {
        resource: &'static str,
        source: io::Error,
    },

    #[error("Executable not found: {executable}")]
    ExecutableNotFound { executable: String },

    #[error("Working directory does not exist: {}", .path.display())]
    WorkingDirectoryNotFound { path: PathBuf },

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Failed to spawn process '{executable}': {source}")]
    Spawn { executable: String, source: io::Error },

    #[error("Failed to wait for process {pid}: {source}")]
    Wait {
        pid: ProcessIdentifier,
        source: io::Error,
    },

    #[error("Failed to read {stream}: {source}")]
    Read {
        stream: StdioStream,
        source: io::Error,
    },

    #[error("Failed to write to standard input: {source}")]
    Write { source: io::Error },

    #[error("Standard input writer already finished")]
    WriterFinished,

    #[error("Failed to close {stream}: {source}")]
    Cleanup {
        stream: StdioStream,
        source: io::Error,
    },

    #[error("Failed to send {signal} to {}{pid}: {source}", signal_target(.process_group))]
    Signal {
        pid: ProcessIdentifier,
        signal: Signal,
        process_group: bool,
        source: nix::errno::Errno,
    },

    #[error("Read cancelled: the run is shutting down")]
    Cancelled,

    #[error(transparent)]
    Body(#[from] anyhow::Error),

    #[error("{error} (process termination also failed: {termination})")]
    Unwinding {
        #[source]
        error: Box<RunnerError>,
        termination: Box<RunnerError>,
    },
}

fn signal_target(process_group: &bool) -> &'static str {
    if *process_group {
        "process group "
    } else {
        "process "
    }
}

impl RunnerError {
    /// Wrap an arbitrary work-body error.
    pub fn body<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Body(error.into())
    }

    /// True when a signal could not be delivered because the target no longer exists.
    #[must_use]
    pub fn is_no_such_process(&self) -> bool {
        matches!(
            self,
            Self::Signal {
                source: nix::errno::Errno::ESRCH,
                ..
            }
        )
    }

    /// True for `BrokenPipe` write failures (the child closed its standard input).
    #[must_use]
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, Self::Write { source } if source.kind() == io::ErrorKind::BrokenPipe)
    }

    /// The error the caller should see first when unwinding attached a secondary failure.
    #[must_use]
    pub fn primary(&self) -> &Self {
        match self {
            Self::Unwinding { error, .. } => error.primary(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_stream_display() {
        assert_eq!(StdioStream::StandardInput.to_string(), "standard input");
        assert_eq!(StdioStream::StandardOutput.to_string(), "standard output");
        assert_eq!(StdioStream::StandardError.to_string(), "standard error");
    }

    #[test]
    fn test_signal_error_message_names_target() {
        let err = RunnerError::Signal {
            pid: ProcessIdentifier::new(42),
            signal: Signal::KILL,
            process_group: true,
            source: nix::errno::Errno::EPERM,
        };
        let message = err.to_string();
        assert!(message.contains("process group 42"), "got: {message}");
        assert!(message.contains("SIGKILL"), "got: {message}");
        assert!(!err.is_no_such_process());
    }

    #[test]
    fn test_no_such_process_detection() {
        let err = RunnerError::Signal {
            pid: ProcessIdentifier::new(7),
            signal: Signal::TERMINATE,
            process_group: false,
            source: nix::errno::Errno::ESRCH,
        };
        assert!(err.is_no_such_process());
    }

    #[test]
    fn test_unwinding_keeps_body_error_primary() {
        let err = RunnerError::Unwinding {
            error: Box::new(RunnerError::body(anyhow::anyhow!("body exploded"))),
            termination: Box::new(RunnerError::Signal {
                pid: ProcessIdentifier::new(7),
                signal: Signal::KILL,
                process_group: true,
                source: nix::errno::Errno::EPERM,
            }),
        };
        assert!(matches!(err.primary(), RunnerError::Body(_)));
        assert!(err.to_string().starts_with("body exploded"));
    }

    #[test]
    fn test_broken_pipe_detection() {
        let err = RunnerError::Write {
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        assert!(err.is_broken_pipe());
        assert!(!RunnerError::WriterFinished.is_broken_pipe());
    }
}
