//! Subprocess execution engine
//!
//! Spawns a child process, wires its standard input/output/error to pipes,
//! caller descriptors or the null device, runs caller logic concurrently with
//! monitoring the child's exit, and releases every descriptor on success,
//! failure and cancellation alike.
//!
//! # Security Model
//!
//! Executables are started argv-style: arguments and environment entries are
//! passed as discrete values and never go through a shell.
//!
//! # Entry points
//!
//! - [`run`] and the other free functions in this crate root for one-shot runs.
//! - [`Configuration`] for full control: `run*` methods take a work body that
//!   receives a [`Subprocess`] (and a [`StandardInputWriter`]); `collect*`
//!   methods return a [`CollectedResult`].

#[cfg(not(unix))]
compile_error!("xspawn-runner supports unix targets only");

pub mod api;
pub mod async_bytes;
pub mod capture;
pub mod configuration;
pub mod error;
pub mod io;
pub mod platform;
pub mod result;
pub mod stdin_writer;
pub mod subprocess;
pub mod types;

pub use api::{
    run, run_collected, run_with_body, run_with_configuration, run_with_input_bytes,
    run_with_input_stream,
};
pub use async_bytes::{ASYNC_BYTES_CHUNK_SIZE, AsyncBytes};
pub use capture::CaptureBuffer;
pub use configuration::Configuration;
pub use error::{RunnerError, StdioStream};
pub use io::{
    DEFAULT_COLLECT_LIMIT, ExecutionInput, ExecutionOutput, ExternalDescriptor, InputMethod,
    OutputMethod,
};
pub use platform::{PlatformOptions, ProcessConfigurator, Signal};
pub use result::{CollectedResult, ExecutionResult};
pub use stdin_writer::StandardInputWriter;
pub use subprocess::Subprocess;
pub use types::{
    Arguments, DEFAULT_SEARCH_PATHS, Environment, Executable, ProcessIdentifier, StringOrRawBytes,
    TerminationStatus,
};
