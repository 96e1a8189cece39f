//! I/O wiring for the three standard streams.
//!
//! Callers choose a policy ([`InputMethod`], [`OutputMethod`]); a run turns
//! each policy into an [`ExecutionInput`] / [`ExecutionOutput`] that owns the
//! concrete descriptors for the lifetime of the run.
//!
//! # Descriptor ownership
//!
//! | Value | Child side | Parent side |
//! |-------|------------|-------------|
//! | no input / discarded | null device | none |
//! | external descriptor | the caller's descriptor, or its duplicate | none |
//! | input pipe | read end | write end, handed to `StandardInputWriter` |
//! | collected output | write end | read end, drained by capture or `AsyncBytes` |
//!
//! Each slot is an `Option<OwnedFd>` and is `take()`n before closing, so a
//! descriptor can never be closed twice. A borrowed external descriptor is
//! duplicated when the method is built; the engine closes only its duplicate,
//! never the caller's descriptor.

use crate::error::{RunnerError, StdioStream};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, IntoRawFd, OwnedFd};

/// Default byte limit for collected output (128 KiB).
pub const DEFAULT_COLLECT_LIMIT: usize = 128 * 1024;

const NULL_DEVICE: &str = "/dev/null";

/// A descriptor supplied by the caller.
#[derive(Debug)]
pub enum ExternalDescriptor {
    /// The engine takes ownership and closes it once the child holds its copy.
    Owned(OwnedFd),
    /// A duplicate of a descriptor the caller keeps; the caller's descriptor
    /// is never closed and may be dropped before the run.
    Borrowed(OwnedFd),
}

impl ExternalDescriptor {
    #[must_use]
    pub fn owned(fd: impl Into<OwnedFd>) -> Self {
        Self::Owned(fd.into())
    }

    /// Duplicate `fd` now, so the run never depends on the caller's descriptor.
    pub fn borrowed(fd: &impl AsFd) -> Result<Self, RunnerError> {
        fd.as_fd()
            .try_clone_to_owned()
            .map(Self::Borrowed)
            .map_err(|source| RunnerError::ResourceCreation {
                resource: "duplicate of borrowed descriptor",
                source,
            })
    }

    /// Whether the engine closes the caller's own descriptor when it is done.
    #[must_use]
    pub const fn close_when_done(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    fn duplicate(&self) -> io::Result<OwnedFd> {
        match self {
            Self::Owned(fd) | Self::Borrowed(fd) => fd.try_clone(),
        }
    }
}

/// Where the child's standard input comes from.
#[derive(Debug, Default)]
pub enum InputMethod {
    /// The child reads from the null device.
    #[default]
    NoInput,
    /// The child reads from a caller-supplied descriptor.
    ReadFrom(ExternalDescriptor),
}

impl InputMethod {
    #[must_use]
    pub const fn no_input() -> Self {
        Self::NoInput
    }

    /// Read from `fd`; the engine closes it after spawning.
    #[must_use]
    pub fn read_from(fd: impl Into<OwnedFd>) -> Self {
        Self::ReadFrom(ExternalDescriptor::owned(fd))
    }

    /// Read from a duplicate of `fd`; the caller keeps ownership.
    pub fn read_from_borrowed(fd: &impl AsFd) -> Result<Self, RunnerError> {
        ExternalDescriptor::borrowed(fd).map(Self::ReadFrom)
    }

    pub(crate) fn create_execution_input(self) -> Result<ExecutionInput, RunnerError> {
        match self {
            Self::NoInput => Ok(ExecutionInput::NoInput {
                device: Some(open_null_device(false)?),
            }),
            Self::ReadFrom(descriptor) => Ok(ExecutionInput::ExternalDescriptor {
                descriptor: Some(descriptor),
            }),
        }
    }
}

/// Where the child's standard output or standard error goes.
#[derive(Debug)]
pub enum OutputMethod {
    /// The child writes to the null device.
    Discard,
    /// The child writes to a pipe the parent drains; capture keeps at most `limit` bytes.
    Collect { limit: usize },
    /// The child writes to a caller-supplied descriptor.
    WriteTo(ExternalDescriptor),
}

impl Default for OutputMethod {
    fn default() -> Self {
        Self::collect()
    }
}

impl OutputMethod {
    #[must_use]
    pub const fn discard() -> Self {
        Self::Discard
    }

    #[must_use]
    pub const fn collect() -> Self {
        Self::Collect {
            limit: DEFAULT_COLLECT_LIMIT,
        }
    }

    #[must_use]
    pub const fn collect_with_limit(limit: usize) -> Self {
        Self::Collect { limit }
    }

    /// Pipe the stream to the parent for incremental reading through
    /// [`Subprocess::standard_output`](crate::Subprocess::standard_output).
    #[must_use]
    pub const fn redirect_to_sequence() -> Self {
        Self::collect()
    }

    /// Write to `fd`; the engine closes it after spawning.
    #[must_use]
    pub fn write_to(fd: impl Into<OwnedFd>) -> Self {
        Self::WriteTo(ExternalDescriptor::owned(fd))
    }

    /// Write to a duplicate of `fd`; the caller keeps ownership.
    pub fn write_to_borrowed(fd: &impl AsFd) -> Result<Self, RunnerError> {
        ExternalDescriptor::borrowed(fd).map(Self::WriteTo)
    }

    pub(crate) fn create_execution_output(
        self,
        stream: StdioStream,
    ) -> Result<ExecutionOutput, RunnerError> {
        match self {
            Self::Discard => Ok(ExecutionOutput::Discarded {
                device: Some(open_null_device(true)?),
            }),
            Self::WriteTo(descriptor) => Ok(ExecutionOutput::ExternalDescriptor {
                descriptor: Some(descriptor),
            }),
            Self::Collect { limit } => {
                let (read_end, write_end) = create_pipe()?;
                tracing::debug!(%stream, limit, "created output pipe");
                Ok(ExecutionOutput::Collected {
                    limit,
                    read_end: Some(read_end),
                    write_end: Some(write_end),
                })
            }
        }
    }
}

/// Concrete standard-input resources of a run.
#[derive(Debug)]
pub enum ExecutionInput {
    NoInput {
        device: Option<OwnedFd>,
    },
    Pipe {
        read_end: Option<OwnedFd>,
        write_end: Option<OwnedFd>,
    },
    ExternalDescriptor {
        descriptor: Option<ExternalDescriptor>,
    },
}

impl ExecutionInput {
    pub(crate) fn create_pipe() -> Result<Self, RunnerError> {
        let (read_end, write_end) = create_pipe()?;
        Ok(Self::Pipe {
            read_end: Some(read_end),
            write_end: Some(write_end),
        })
    }

    /// Duplicate of the child side, handed to the spawn call.
    pub(crate) fn child_descriptor(&self) -> Result<OwnedFd, RunnerError> {
        let duplicated = match self {
            Self::NoInput { device: Some(fd) }
            | Self::Pipe {
                read_end: Some(fd), ..
            } => fd.try_clone(),
            Self::ExternalDescriptor {
                descriptor: Some(descriptor),
            } => descriptor.duplicate(),
            _ => Err(already_closed()),
        };
        duplicated.map_err(|source| RunnerError::ResourceCreation {
            resource: "standard input descriptor",
            source,
        })
    }

    /// Transfer the parent's write end to a `StandardInputWriter`.
    pub(crate) fn take_write_end(&mut self) -> Option<OwnedFd> {
        match self {
            Self::Pipe { write_end, .. } => write_end.take(),
            _ => None,
        }
    }

    /// Close the descriptor the child was given.
    pub fn close_child_side(&mut self) -> Result<(), RunnerError> {
        let stream = StdioStream::StandardInput;
        match self {
            Self::NoInput { device } => close_slot(device, stream),
            Self::Pipe { read_end, .. } => close_slot(read_end, stream),
            Self::ExternalDescriptor { descriptor } => close_external(descriptor, stream),
        }
    }

    /// No-op for every input kind: the pipe's write end belongs to the
    /// `StandardInputWriter` once the run starts.
    pub fn close_parent_side(&mut self) -> Result<(), RunnerError> {
        Ok(())
    }

    /// Close every descriptor this value still owns.
    pub fn close_all(&mut self) -> Result<(), RunnerError> {
        let stream = StdioStream::StandardInput;
        match self {
            Self::NoInput { device } => close_slot(device, stream),
            Self::Pipe {
                read_end,
                write_end,
            } => first_error(close_slot(read_end, stream), close_slot(write_end, stream)),
            Self::ExternalDescriptor { descriptor } => close_external(descriptor, stream),
        }
    }
}

/// Concrete standard-output or standard-error resources of a run.
#[derive(Debug)]
pub enum ExecutionOutput {
    Discarded {
        device: Option<OwnedFd>,
    },
    ExternalDescriptor {
        descriptor: Option<ExternalDescriptor>,
    },
    Collected {
        limit: usize,
        read_end: Option<OwnedFd>,
        write_end: Option<OwnedFd>,
    },
}

impl ExecutionOutput {
    pub(crate) fn child_descriptor(&self) -> Result<OwnedFd, RunnerError> {
        let duplicated = match self {
            Self::Discarded { device: Some(fd) }
            | Self::Collected {
                write_end: Some(fd),
                ..
            } => fd.try_clone(),
            Self::ExternalDescriptor {
                descriptor: Some(descriptor),
            } => descriptor.duplicate(),
            _ => Err(already_closed()),
        };
        duplicated.map_err(|source| RunnerError::ResourceCreation {
            resource: "output descriptor",
            source,
        })
    }

    /// Capture limit, for collected outputs.
    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        match self {
            Self::Collected { limit, .. } => Some(*limit),
            _ => None,
        }
    }

    /// Hand the read end to a single consumer; later calls get `None`.
    pub(crate) fn take_read_end(&mut self) -> Option<OwnedFd> {
        match self {
            Self::Collected { read_end, .. } => read_end.take(),
            _ => None,
        }
    }

    pub fn close_child_side(&mut self, stream: StdioStream) -> Result<(), RunnerError> {
        match self {
            Self::Discarded { device } => close_slot(device, stream),
            Self::ExternalDescriptor { descriptor } => close_external(descriptor, stream),
            Self::Collected { write_end, .. } => close_slot(write_end, stream),
        }
    }

    /// Close the read end unless a consumer has taken it; a taken read end
    /// is closed when its consumer is dropped.
    pub fn close_parent_side(&mut self, stream: StdioStream) -> Result<(), RunnerError> {
        match self {
            Self::Discarded { .. } | Self::ExternalDescriptor { .. } => Ok(()),
            Self::Collected { read_end, .. } => close_slot(read_end, stream),
        }
    }

    pub fn close_all(&mut self, stream: StdioStream) -> Result<(), RunnerError> {
        match self {
            Self::Discarded { device } => close_slot(device, stream),
            Self::ExternalDescriptor { descriptor } => close_external(descriptor, stream),
            Self::Collected {
                read_end,
                write_end,
                ..
            } => first_error(close_slot(write_end, stream), close_slot(read_end, stream)),
        }
    }
}

/// Close `fd`, reporting the OS error instead of swallowing it as `Drop` would.
pub(crate) fn close_descriptor(fd: OwnedFd) -> io::Result<()> {
    let raw = fd.into_raw_fd();
    // SAFETY: `raw` came from an OwnedFd that was just released, so nothing
    // else owns or closes it.
    if unsafe { libc::close(raw) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn close_slot(slot: &mut Option<OwnedFd>, stream: StdioStream) -> Result<(), RunnerError> {
    match slot.take() {
        Some(fd) => {
            let raw = fd.as_raw_fd();
            close_descriptor(fd).map_err(|source| RunnerError::Cleanup { stream, source })?;
            tracing::trace!(%stream, fd = raw, "closed descriptor");
            Ok(())
        }
        None => Ok(()),
    }
}

fn close_external(
    slot: &mut Option<ExternalDescriptor>,
    stream: StdioStream,
) -> Result<(), RunnerError> {
    match slot.take() {
        Some(ExternalDescriptor::Owned(fd) | ExternalDescriptor::Borrowed(fd)) => {
            let mut owned = Some(fd);
            close_slot(&mut owned, stream)
        }
        None => Ok(()),
    }
}

fn first_error(
    first: Result<(), RunnerError>,
    second: Result<(), RunnerError>,
) -> Result<(), RunnerError> {
    match (first, second) {
        (Err(e), Err(dropped)) => {
            tracing::warn!(error = %dropped, "dropping secondary close error");
            Err(e)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn create_pipe() -> Result<(OwnedFd, OwnedFd), RunnerError> {
    let (reader, writer) = std::io::pipe().map_err(|source| RunnerError::ResourceCreation {
        resource: "pipe",
        source,
    })?;
    Ok((OwnedFd::from(reader), OwnedFd::from(writer)))
}

fn open_null_device(write: bool) -> Result<OwnedFd, RunnerError> {
    let file: io::Result<File> = if write {
        OpenOptions::new().write(true).open(NULL_DEVICE)
    } else {
        File::open(NULL_DEVICE)
    };
    file.map(OwnedFd::from)
        .map_err(|source| RunnerError::ResourceCreation {
            resource: "null device",
            source,
        })
}

fn already_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "descriptor already closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn is_open(raw: std::os::fd::RawFd) -> bool {
        // SAFETY: F_GETFD only inspects the descriptor table.
        unsafe { libc::fcntl(raw, libc::F_GETFD) != -1 }
    }

    #[test]
    fn test_default_output_method_collects_128k() {
        match OutputMethod::default() {
            OutputMethod::Collect { limit } => assert_eq!(limit, 128 * 1024),
            other => panic!("unexpected default: {other:?}"),
        }
    }

    #[test]
    fn test_discard_closes_only_on_child_side() {
        let mut output = OutputMethod::discard()
            .create_execution_output(StdioStream::StandardOutput)
            .unwrap();
        output.close_parent_side(StdioStream::StandardOutput).unwrap();
        assert!(matches!(
            output,
            ExecutionOutput::Discarded { device: Some(_) }
        ));
        output.close_child_side(StdioStream::StandardOutput).unwrap();
        assert!(matches!(output, ExecutionOutput::Discarded { device: None }));
        // A second close is a no-op, not a double close.
        output.close_all(StdioStream::StandardOutput).unwrap();
    }

    #[test]
    fn test_collected_output_pipe_carries_bytes() {
        let mut output = OutputMethod::collect_with_limit(16)
            .create_execution_output(StdioStream::StandardOutput)
            .unwrap();
        assert_eq!(output.limit(), Some(16));

        let child_side = output.child_descriptor().unwrap();
        let mut writer = File::from(child_side);
        writer.write_all(b"ping").unwrap();
        drop(writer);
        output.close_child_side(StdioStream::StandardOutput).unwrap();

        let mut reader = File::from(output.take_read_end().unwrap());
        let mut received = String::new();
        reader.read_to_string(&mut received).unwrap();
        assert_eq!(received, "ping");

        assert!(output.take_read_end().is_none());
        output.close_all(StdioStream::StandardOutput).unwrap();
    }

    #[test]
    fn test_input_pipe_parent_side_close_is_noop() {
        let mut input = ExecutionInput::create_pipe().unwrap();
        input.close_parent_side().unwrap();
        let write_end = input.take_write_end();
        assert!(write_end.is_some());
        input.close_all().unwrap();
        close_descriptor(write_end.unwrap()).unwrap();
    }

    #[test]
    fn test_borrowed_descriptor_is_never_closed() {
        let file = tempfile::tempfile().unwrap();
        let mut output = OutputMethod::write_to_borrowed(&file)
            .unwrap()
            .create_execution_output(StdioStream::StandardError)
            .unwrap();
        output.close_child_side(StdioStream::StandardError).unwrap();
        output.close_all(StdioStream::StandardError).unwrap();
        assert!(is_open(file.as_raw_fd()));
    }

    #[test]
    fn test_borrowed_descriptor_is_duplicated_up_front() {
        let file = tempfile::tempfile().unwrap();
        let caller_fd = file.as_raw_fd();
        let descriptor = ExternalDescriptor::borrowed(&file).unwrap();
        assert!(!descriptor.close_when_done());

        let duplicate_fd = match &descriptor {
            ExternalDescriptor::Borrowed(fd) => fd.as_raw_fd(),
            other => panic!("unexpected descriptor: {other:?}"),
        };
        assert_ne!(duplicate_fd, caller_fd);

        drop(file);
        assert!(is_open(duplicate_fd));
        let mut input = ExecutionInput::ExternalDescriptor {
            descriptor: Some(descriptor),
        };
        drop(input.child_descriptor().unwrap());
        input.close_all().unwrap();
        assert!(matches!(
            input,
            ExecutionInput::ExternalDescriptor { descriptor: None }
        ));
    }

    #[test]
    fn test_owned_external_descriptor_closed_once() {
        let file = tempfile::tempfile().unwrap();
        let mut input = InputMethod::read_from(file).create_execution_input().unwrap();
        match &input {
            ExecutionInput::ExternalDescriptor { descriptor: Some(d) } => {
                assert!(d.close_when_done());
            }
            other => panic!("unexpected input: {other:?}"),
        }
        input.close_child_side().unwrap();
        input.close_all().unwrap();
        assert!(matches!(
            input,
            ExecutionInput::ExternalDescriptor { descriptor: None }
        ));
    }

    #[test]
    fn test_child_descriptor_after_close_fails() {
        let mut input = InputMethod::no_input().create_execution_input().unwrap();
        input.close_child_side().unwrap();
        assert!(matches!(
            input.child_descriptor(),
            Err(RunnerError::ResourceCreation { .. })
        ));
    }
}
