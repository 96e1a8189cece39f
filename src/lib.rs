//! xspawn - structured subprocess execution
//!
//! Runs programs argv-style with piped standard streams, bounded output
//! capture and deterministic cleanup of descriptors and process groups.
//!
//! xspawn can be used in two ways:
//! - **CLI**: `xspawn run -- <program> [args...]`
//! - **Library**: the engine from `xspawn-runner` is re-exported here
//!
//! # Quick Start (Library)
//!
//! ```rust,no_run
//! use xspawn::{Configuration, Executable, InputMethod, OutputMethod};
//!
//! # async fn demo() -> Result<(), xspawn::RunnerError> {
//! let result = Configuration::new(Executable::named("echo"))
//!     .with_arguments(["hello"])
//!     .collect(InputMethod::no_input(), OutputMethod::collect(), OutputMethod::discard())
//!     .await?;
//! assert_eq!(result.stdout_string(), "hello\n");
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! The binary reads `.xspawn/config.toml` (see [`xspawn_config`]) with
//! precedence CLI flags > config file > defaults.

pub mod cli;
pub mod exit_codes;
pub mod logging;

pub use exit_codes::ExitCode;
pub use xspawn_config::{Config, ConfigBuilder, ConfigError, ConfigSource};
pub use xspawn_runner::*;
