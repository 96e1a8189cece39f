//! Run orchestration.
//!
//! A run goes through the same steps whatever its I/O policies:
//!
//! 1. Materialize the execution values (null device, pipes, caller descriptors).
//!    A failure here drops whatever was already opened; nothing is spawned.
//! 2. Spawn the child on duplicates of the child-side descriptors.
//! 3. Close the child sides in the parent so the child's exit produces EOF.
//! 4. Join two futures: the termination monitor and the work body. Neither
//!    cancels the other; the run completes when both have.
//!    - Body succeeded: finish the stdin writer, close the parent sides.
//!    - Body failed: close everything and kill the process group.
//! 5. Merge the termination status and the body's value.
//!
//! A [`RunGuard`] is armed between spawn and completion. If the run future is
//! dropped part-way (caller cancellation) the guard performs the failure-path
//! cleanup, ignoring errors.
//!
//! Cleanup order is fixed: stdin writer, input, output, error, then process
//! termination. Termination is skipped once the monitor has reaped the child,
//! since its pid may already belong to another process. Every step is
//! attempted; the first error wins and the rest are logged at `warn`. On the failure path the body's error always wins
//! over cleanup errors; a failed kill is attached to it as
//! [`RunnerError::Unwinding`].

use crate::error::{RunnerError, StdioStream};
use crate::io::{ExecutionInput, InputMethod, OutputMethod};
use crate::platform::{self, PlatformOptions};
use crate::result::{CollectedResult, ExecutionResult};
use crate::stdin_writer::StandardInputWriter;
use crate::subprocess::{CleanupErrors, RunIo, Subprocess};
use crate::types::{Arguments, Environment, Executable, ProcessIdentifier};
use futures::Stream;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;

/// Everything needed to start a child, fixed before the run begins.
///
/// # Example
///
/// ```rust,no_run
/// use xspawn_runner::{Configuration, Executable, InputMethod, OutputMethod};
///
/// # async fn demo() -> Result<(), xspawn_runner::RunnerError> {
/// let result = Configuration::new(Executable::named("echo"))
///     .with_arguments(["hello"])
///     .collect(InputMethod::no_input(), OutputMethod::collect(), OutputMethod::discard())
///     .await?;
/// assert_eq!(result.standard_output.as_deref(), Some(&b"hello\n"[..]));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Configuration {
    executable: Executable,
    arguments: Arguments,
    environment: Environment,
    working_directory: Option<PathBuf>,
    platform_options: PlatformOptions,
}

impl Configuration {
    #[must_use]
    pub fn new(executable: Executable) -> Self {
        Self {
            executable,
            arguments: Arguments::default(),
            environment: Environment::default(),
            working_directory: None,
            platform_options: PlatformOptions::default(),
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: impl Into<Arguments>) -> Self {
        self.arguments = arguments.into();
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_platform_options(mut self, platform_options: PlatformOptions) -> Self {
        self.platform_options = platform_options;
        self
    }

    #[must_use]
    pub const fn executable(&self) -> &Executable {
        &self.executable
    }

    #[must_use]
    pub const fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    #[must_use]
    pub const fn environment(&self) -> &Environment {
        &self.environment
    }

    #[must_use]
    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    #[must_use]
    pub const fn platform_options(&self) -> &PlatformOptions {
        &self.platform_options
    }

    // ------------------------------------------------------------------------
    // Runs with a work body
    // ------------------------------------------------------------------------

    /// Run the child with the given I/O policies while `body` works with it.
    pub async fn run<F, Fut, R>(
        &self,
        input: InputMethod,
        output: OutputMethod,
        error: OutputMethod,
        body: F,
    ) -> Result<ExecutionResult<R>, RunnerError>
    where
        F: FnOnce(Subprocess) -> Fut,
        Fut: Future<Output = Result<R, RunnerError>>,
    {
        let input = input.create_execution_input()?;
        self.execute(input, None, output, error, body).await
    }

    /// Run the child with a piped standard input that `body` writes through.
    ///
    /// The writer is finished automatically once `body` returns successfully.
    pub async fn run_with_writer<F, Fut, R>(
        &self,
        output: OutputMethod,
        error: OutputMethod,
        body: F,
    ) -> Result<ExecutionResult<R>, RunnerError>
    where
        F: FnOnce(Subprocess, StandardInputWriter) -> Fut,
        Fut: Future<Output = Result<R, RunnerError>>,
    {
        let (input, writer) = piped_input()?;
        let body_writer = writer.clone();
        self.execute(input, Some(writer), output, error, move |subprocess| {
            body(subprocess, body_writer)
        })
        .await
    }

    /// Run the child with `bytes` fed to its standard input while `body` runs.
    ///
    /// A child that exits without reading its input is not an error.
    pub async fn run_with_bytes<F, Fut, R>(
        &self,
        bytes: impl Into<Vec<u8>>,
        output: OutputMethod,
        error: OutputMethod,
        body: F,
    ) -> Result<ExecutionResult<R>, RunnerError>
    where
        F: FnOnce(Subprocess) -> Fut,
        Fut: Future<Output = Result<R, RunnerError>>,
    {
        let bytes = bytes.into();
        self.run_with_writer(output, error, move |subprocess, writer| async move {
            let feed = async {
                tolerate_broken_pipe(writer.write(&bytes).await)?;
                writer.finish().await
            };
            let (value, ()) = tokio::try_join!(body(subprocess), feed)?;
            Ok(value)
        })
        .await
    }

    /// Run the child with the bytes of `stream` fed to its standard input.
    pub async fn run_with_stream<S, F, Fut, R>(
        &self,
        stream: S,
        output: OutputMethod,
        error: OutputMethod,
        body: F,
    ) -> Result<ExecutionResult<R>, RunnerError>
    where
        S: Stream<Item = u8>,
        F: FnOnce(Subprocess) -> Fut,
        Fut: Future<Output = Result<R, RunnerError>>,
    {
        self.run_with_writer(output, error, move |subprocess, writer| async move {
            let feed = async {
                tolerate_broken_pipe(writer.write_stream(stream).await)?;
                writer.finish().await
            };
            let (value, ()) = tokio::try_join!(body(subprocess), feed)?;
            Ok(value)
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Collected runs
    // ------------------------------------------------------------------------

    /// Run the child to completion and return whatever it wrote to collected streams.
    pub async fn collect(
        &self,
        input: InputMethod,
        output: OutputMethod,
        error: OutputMethod,
    ) -> Result<CollectedResult, RunnerError> {
        let result = self.run(input, output, error, capture_all).await?;
        Ok(into_collected(result))
    }

    /// Collected run with `bytes` as the child's standard input.
    pub async fn collect_with_bytes(
        &self,
        bytes: impl Into<Vec<u8>>,
        output: OutputMethod,
        error: OutputMethod,
    ) -> Result<CollectedResult, RunnerError> {
        let result = self.run_with_bytes(bytes, output, error, capture_all).await?;
        Ok(into_collected(result))
    }

    /// Collected run with the bytes of `stream` as the child's standard input.
    pub async fn collect_with_stream<S>(
        &self,
        stream: S,
        output: OutputMethod,
        error: OutputMethod,
    ) -> Result<CollectedResult, RunnerError>
    where
        S: Stream<Item = u8>,
    {
        let result = self
            .run_with_stream(stream, output, error, capture_all)
            .await?;
        Ok(into_collected(result))
    }

    // ------------------------------------------------------------------------
    // Orchestration
    // ------------------------------------------------------------------------

    async fn execute<F, Fut, R>(
        &self,
        input: ExecutionInput,
        writer: Option<StandardInputWriter>,
        output: OutputMethod,
        error: OutputMethod,
        body: F,
    ) -> Result<ExecutionResult<R>, RunnerError>
    where
        F: FnOnce(Subprocess) -> Fut,
        Fut: Future<Output = Result<R, RunnerError>>,
    {
        let span = tracing::info_span!(
            "subprocess",
            executable = %self.executable,
            pid = tracing::field::Empty,
        );
        self.execute_inner(input, writer, output, error, body)
            .instrument(span)
            .await
    }

    async fn execute_inner<F, Fut, R>(
        &self,
        input: ExecutionInput,
        writer: Option<StandardInputWriter>,
        output: OutputMethod,
        error: OutputMethod,
        body: F,
    ) -> Result<ExecutionResult<R>, RunnerError>
    where
        F: FnOnce(Subprocess) -> Fut,
        Fut: Future<Output = Result<R, RunnerError>>,
    {
        let output = output.create_execution_output(StdioStream::StandardOutput)?;
        let error = error.create_execution_output(StdioStream::StandardError)?;
        let io = Arc::new(RunIo::new(input, output, error));

        let spawned = {
            let input = io.input_guard();
            let output = io.output_guard();
            let error = io.error_guard();
            platform::spawn(self, &input, &output, &error)
        };
        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::debug!(error = %e, "spawn failed; releasing descriptors");
                release_quietly(&io, writer.as_ref());
                return Err(e);
            }
        };
        tracing::Span::current().record("pid", spawned.pid.value());

        let pid = spawned.pid;
        let process_group = spawned.process_group;
        let mut guard = RunGuard {
            io: Arc::clone(&io),
            writer: writer.clone(),
            pid,
            process_group,
            armed: true,
        };

        if let Err(e) = io.close_child_sides() {
            guard.disarm();
            return Err(unwind(&io, writer.as_ref(), pid, process_group, e));
        }

        let subprocess = Subprocess::new(pid, process_group, Arc::clone(&io));
        let monitor = async {
            let status = platform::monitor_process_termination(spawned.child, pid).await;
            if status.is_ok() {
                io.mark_reaped();
            }
            status
        };
        let work = async {
            match body(subprocess).await {
                Ok(value) => {
                    let mut errors = CleanupErrors::default();
                    if let Some(writer) = &writer {
                        errors.record(writer.finish().await);
                    }
                    errors.record(io.close_parent_sides());
                    errors.into_result().map(|()| value)
                }
                Err(e) => Err(unwind(&io, writer.as_ref(), pid, process_group, e)),
            }
        };

        let (termination, value) = tokio::join!(monitor, work);
        guard.disarm();

        let value = value?;
        let termination_status = termination?;
        tracing::info!(pid = pid.value(), status = %termination_status, "run completed");
        Ok(ExecutionResult::new(termination_status, value))
    }
}

/// Failure-path cleanup: close every descriptor, then kill the process group.
///
/// The original error is returned; close errors are logged and dropped, a
/// failed kill is attached.
fn unwind(
    io: &RunIo,
    writer: Option<&StandardInputWriter>,
    pid: ProcessIdentifier,
    process_group: bool,
    error: RunnerError,
) -> RunnerError {
    tracing::debug!(%error, "run failed; tearing down");
    let mut closes = CleanupErrors::default();
    if let Some(writer) = writer {
        closes.record(writer.close_immediately());
    }
    closes.record(io.close_all());
    if let Err(close_error) = closes.into_result() {
        tracing::warn!(error = %close_error, "cleanup failed while unwinding");
    }

    match terminate_unless_reaped(io, pid, process_group) {
        Ok(()) => error,
        Err(termination) => RunnerError::Unwinding {
            error: Box::new(error),
            termination: Box::new(termination),
        },
    }
}

fn terminate_unless_reaped(
    io: &RunIo,
    pid: ProcessIdentifier,
    process_group: bool,
) -> Result<(), RunnerError> {
    if io.is_reaped() {
        tracing::debug!(pid = pid.value(), "child already reaped; not signalling");
        return Ok(());
    }
    platform::terminate_process_group(pid, process_group)
}

fn release_quietly(io: &RunIo, writer: Option<&StandardInputWriter>) {
    if let Some(writer) = writer {
        let _ = writer.close_immediately();
    }
    let _ = io.close_all();
}

/// Cleanup handler for a run future dropped before completion.
struct RunGuard {
    io: Arc<RunIo>,
    writer: Option<StandardInputWriter>,
    pid: ProcessIdentifier,
    process_group: bool,
    armed: bool,
}

impl RunGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(pid = self.pid.value(), "run cancelled; releasing descriptors");
        self.io.mark_cancelled();
        release_quietly(&self.io, self.writer.as_ref());
        let _ = terminate_unless_reaped(&self.io, self.pid, self.process_group);
    }
}

fn piped_input() -> Result<(ExecutionInput, StandardInputWriter), RunnerError> {
    let mut input = ExecutionInput::create_pipe()?;
    let write_end = input
        .take_write_end()
        .ok_or_else(|| RunnerError::ResourceCreation {
            resource: "standard input pipe",
            source: io::Error::other("pipe has no write end"),
        })?;
    Ok((input, StandardInputWriter::new(write_end)))
}

fn tolerate_broken_pipe(result: Result<usize, RunnerError>) -> Result<(), RunnerError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_broken_pipe() => {
            tracing::debug!("child closed standard input before reading all of it");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

type Captured = (
    ProcessIdentifier,
    Option<crate::capture::CaptureBuffer>,
    Option<crate::capture::CaptureBuffer>,
);

async fn capture_all(subprocess: Subprocess) -> Result<Captured, RunnerError> {
    let (stdout, stderr) = subprocess.capture_ios_to_end().await?;
    Ok((subprocess.process_identifier(), stdout, stderr))
}

fn into_collected(result: ExecutionResult<Captured>) -> CollectedResult {
    let (pid, stdout, stderr) = result.value;
    CollectedResult::new(pid, result.termination_status, stdout, stderr)
}
