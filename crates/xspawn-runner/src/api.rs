//! Free-function entry points.
//!
//! Thin conveniences over [`Configuration`]: build one from the pieces given
//! and run it with the matching `Configuration` method.

use crate::configuration::Configuration;
use crate::error::RunnerError;
use crate::io::{InputMethod, OutputMethod};
use crate::result::{CollectedResult, ExecutionResult};
use crate::stdin_writer::StandardInputWriter;
use crate::subprocess::Subprocess;
use crate::types::{Arguments, Executable};
use futures::Stream;
use std::future::Future;

/// Run `executable` to completion with no input, collecting both output
/// streams up to the default limit.
///
/// ```rust,no_run
/// # async fn demo() -> Result<(), xspawn_runner::RunnerError> {
/// use xspawn_runner::Executable;
///
/// let result = xspawn_runner::run(Executable::named("echo"), ["hello"]).await?;
/// assert_eq!(result.stdout_string(), "hello\n");
/// assert!(result.termination_status.is_success());
/// # Ok(())
/// # }
/// ```
pub async fn run(
    executable: Executable,
    arguments: impl Into<Arguments>,
) -> Result<CollectedResult, RunnerError> {
    Configuration::new(executable)
        .with_arguments(arguments)
        .collect(
            InputMethod::no_input(),
            OutputMethod::collect(),
            OutputMethod::collect(),
        )
        .await
}

/// Collected run of a fully built configuration.
pub async fn run_collected(
    configuration: &Configuration,
    input: InputMethod,
    output: OutputMethod,
    error: OutputMethod,
) -> Result<CollectedResult, RunnerError> {
    configuration.collect(input, output, error).await
}

/// Collected run with `bytes` as standard input.
pub async fn run_with_input_bytes(
    configuration: &Configuration,
    bytes: impl Into<Vec<u8>>,
    output: OutputMethod,
    error: OutputMethod,
) -> Result<CollectedResult, RunnerError> {
    configuration.collect_with_bytes(bytes, output, error).await
}

/// Collected run with the bytes of `stream` as standard input.
pub async fn run_with_input_stream<S>(
    configuration: &Configuration,
    stream: S,
    output: OutputMethod,
    error: OutputMethod,
) -> Result<CollectedResult, RunnerError>
where
    S: Stream<Item = u8>,
{
    configuration.collect_with_stream(stream, output, error).await
}

/// Run `executable` while `body` works with the live child.
pub async fn run_with_body<F, Fut, R>(
    executable: Executable,
    arguments: impl Into<Arguments>,
    input: InputMethod,
    output: OutputMethod,
    error: OutputMethod,
    body: F,
) -> Result<ExecutionResult<R>, RunnerError>
where
    F: FnOnce(Subprocess) -> Fut,
    Fut: Future<Output = Result<R, RunnerError>>,
{
    Configuration::new(executable)
        .with_arguments(arguments)
        .run(input, output, error, body)
        .await
}

/// Run `configuration` with a piped standard input handed to `body`.
pub async fn run_with_configuration<F, Fut, R>(
    configuration: &Configuration,
    output: OutputMethod,
    error: OutputMethod,
    body: F,
) -> Result<ExecutionResult<R>, RunnerError>
where
    F: FnOnce(Subprocess, StandardInputWriter) -> Fut,
    Fut: Future<Output = Result<R, RunnerError>>,
{
    configuration.run_with_writer(output, error, body).await
}
