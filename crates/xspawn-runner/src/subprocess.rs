//! Handle to a running child and the descriptors of its run.

use crate::async_bytes::AsyncBytes;
use crate::capture::{CaptureBuffer, OverflowCheck, capture_descriptor};
use crate::error::{RunnerError, StdioStream};
use crate::io::{ExecutionInput, ExecutionOutput};
use crate::platform::{self, Signal};
use crate::types::ProcessIdentifier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The three execution values of one run plus its cancellation and exit flags.
///
/// Locks are held only for descriptor bookkeeping, never across an await.
#[derive(Debug)]
pub(crate) struct RunIo {
    input: Mutex<ExecutionInput>,
    output: Mutex<ExecutionOutput>,
    error: Mutex<ExecutionOutput>,
    cancelled: Arc<AtomicBool>,
    reaped: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunIo {
    pub(crate) fn new(input: ExecutionInput, output: ExecutionOutput, error: ExecutionOutput) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
            error: Mutex::new(error),
            cancelled: Arc::new(AtomicBool::new(false)),
            reaped: AtomicBool::new(false),
        }
    }

    pub(crate) fn input_guard(&self) -> MutexGuard<'_, ExecutionInput> {
        lock(&self.input)
    }

    pub(crate) fn output_guard(&self) -> MutexGuard<'_, ExecutionOutput> {
        lock(&self.output)
    }

    pub(crate) fn error_guard(&self) -> MutexGuard<'_, ExecutionOutput> {
        lock(&self.error)
    }

    fn stream(&self, stream: StdioStream) -> Option<MutexGuard<'_, ExecutionOutput>> {
        match stream {
            StdioStream::StandardOutput => Some(lock(&self.output)),
            StdioStream::StandardError => Some(lock(&self.error)),
            StdioStream::StandardInput => None,
        }
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Record that the child has been waited for; its pid may now be reused.
    pub(crate) fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::Release);
    }

    pub(crate) fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }

    /// Close every child-side descriptor, in input, output, error order.
    pub(crate) fn close_child_sides(&self) -> Result<(), RunnerError> {
        let mut errors = CleanupErrors::default();
        errors.record(lock(&self.input).close_child_side());
        errors.record(lock(&self.output).close_child_side(StdioStream::StandardOutput));
        errors.record(lock(&self.error).close_child_side(StdioStream::StandardError));
        errors.into_result()
    }

    pub(crate) fn close_parent_sides(&self) -> Result<(), RunnerError> {
        let mut errors = CleanupErrors::default();
        errors.record(lock(&self.input).close_parent_side());
        errors.record(lock(&self.output).close_parent_side(StdioStream::StandardOutput));
        errors.record(lock(&self.error).close_parent_side(StdioStream::StandardError));
        errors.into_result()
    }

    pub(crate) fn close_all(&self) -> Result<(), RunnerError> {
        let mut errors = CleanupErrors::default();
        errors.record(lock(&self.input).close_all());
        errors.record(lock(&self.output).close_all(StdioStream::StandardOutput));
        errors.record(lock(&self.error).close_all(StdioStream::StandardError));
        errors.into_result()
    }
}

/// Keeps the first cleanup error; later ones are logged and dropped.
#[derive(Debug, Default)]
pub(crate) struct CleanupErrors {
    first: Option<RunnerError>,
}

impl CleanupErrors {
    pub(crate) fn record(&mut self, result: Result<(), RunnerError>) {
        if let Err(error) = result {
            if self.first.is_none() {
                self.first = Some(error);
            } else {
                tracing::warn!(%error, "dropping secondary cleanup error");
            }
        }
    }

    pub(crate) fn into_result(self) -> Result<(), RunnerError> {
        self.first.map_or(Ok(()), Err)
    }
}

/// A running child process, as seen from inside a run's work body.
///
/// Cheap to clone; every clone refers to the same descriptors. The handle is
/// meaningful only while the run that produced it is in progress.
#[derive(Debug, Clone)]
pub struct Subprocess {
    process_identifier: ProcessIdentifier,
    process_group: bool,
    io: Arc<RunIo>,
}

impl Subprocess {
    pub(crate) fn new(process_identifier: ProcessIdentifier, process_group: bool, io: Arc<RunIo>) -> Self {
        Self {
            process_identifier,
            process_group,
            io,
        }
    }

    #[must_use]
    pub const fn process_identifier(&self) -> ProcessIdentifier {
        self.process_identifier
    }

    /// Whether the child leads its own process group.
    #[must_use]
    pub const fn has_process_group(&self) -> bool {
        self.process_group
    }

    /// Stream of the child's standard output.
    ///
    /// `None` unless standard output is collected, and `None` once the read
    /// end has been handed out (to this method or to a capture).
    #[must_use]
    pub fn standard_output(&self) -> Option<AsyncBytes> {
        self.async_bytes(StdioStream::StandardOutput)
    }

    /// Stream of the child's standard error; see [`standard_output`](Self::standard_output).
    #[must_use]
    pub fn standard_error(&self) -> Option<AsyncBytes> {
        self.async_bytes(StdioStream::StandardError)
    }

    fn async_bytes(&self, stream: StdioStream) -> Option<AsyncBytes> {
        let read_end = self.io.stream(stream)?.take_read_end()?;
        Some(AsyncBytes::new(read_end, stream, Arc::clone(&self.io.cancelled)))
    }

    /// Read standard output up to its collect limit.
    pub async fn capture_standard_output(&self) -> Result<Vec<u8>, RunnerError> {
        Ok(self.capture(StdioStream::StandardOutput).await?.into_bytes())
    }

    /// Read standard error up to its collect limit.
    pub async fn capture_standard_error(&self) -> Result<Vec<u8>, RunnerError> {
        Ok(self.capture(StdioStream::StandardError).await?.into_bytes())
    }

    /// Capture a collected stream, keeping truncation information.
    ///
    /// Returns once the child closes the stream or the limit is reached, so a
    /// child that is still running can be driven further afterwards. Output
    /// past the limit counts as truncation only if it is already in the pipe.
    ///
    /// Each stream can be consumed once; a second capture, or a capture of a
    /// stream that is not collected, is an `InvalidArgument` error.
    pub async fn capture(&self, stream: StdioStream) -> Result<CaptureBuffer, RunnerError> {
        self.capture_checked(stream, OverflowCheck::Pending).await
    }

    async fn capture_checked(
        &self,
        stream: StdioStream,
        overflow: OverflowCheck,
    ) -> Result<CaptureBuffer, RunnerError> {
        let (read_end, limit) = match self.io.stream(stream) {
            Some(mut output) => (output.take_read_end(), output.limit()),
            None => (None, None),
        };
        match (read_end, limit) {
            (Some(read_end), Some(limit)) => {
                capture_descriptor(read_end, limit, stream, overflow).await
            }
            _ => Err(RunnerError::InvalidArgument {
                reason: format!("{stream} is not collected or was already consumed"),
            }),
        }
    }

    /// Capture standard output and standard error concurrently.
    ///
    /// Streams that are not collected come back as `None`.
    pub async fn capture_ios(
        &self,
    ) -> Result<(Option<CaptureBuffer>, Option<CaptureBuffer>), RunnerError> {
        self.capture_ios_checked(OverflowCheck::Pending).await
    }

    /// [`capture_ios`](Self::capture_ios) for bodies that only capture: waits
    /// past the limit for one more byte, so truncation is always reported.
    pub(crate) async fn capture_ios_to_end(
        &self,
    ) -> Result<(Option<CaptureBuffer>, Option<CaptureBuffer>), RunnerError> {
        self.capture_ios_checked(OverflowCheck::AwaitNext).await
    }

    async fn capture_ios_checked(
        &self,
        overflow: OverflowCheck,
    ) -> Result<(Option<CaptureBuffer>, Option<CaptureBuffer>), RunnerError> {
        let stdout = self.collected(StdioStream::StandardOutput);
        let stderr = self.collected(StdioStream::StandardError);
        let capture_if = |collected: bool, stream: StdioStream| async move {
            if collected {
                self.capture_checked(stream, overflow).await.map(Some)
            } else {
                Ok(None)
            }
        };
        tokio::try_join!(
            capture_if(stdout, StdioStream::StandardOutput),
            capture_if(stderr, StdioStream::StandardError),
        )
    }

    fn collected(&self, stream: StdioStream) -> bool {
        self.io
            .stream(stream)
            .is_some_and(|output| output.limit().is_some())
    }

    /// Deliver `signal` to the child, or to its process group.
    ///
    /// A child that has already exited is reported as a `Signal` error for
    /// which [`RunnerError::is_no_such_process`] holds.
    pub fn send_signal(&self, signal: Signal, to_process_group: bool) -> Result<(), RunnerError> {
        platform::send_signal(
            self.process_identifier,
            signal,
            to_process_group && self.process_group,
        )
    }
}
