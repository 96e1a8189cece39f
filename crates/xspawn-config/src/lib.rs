//! Configuration for xspawn
//!
//! Loads `.xspawn/config.toml` (found by walking up from the working directory
//! to the repository root, or given explicitly), layers command-line overrides on
//! top, and validates the result. Precedence: CLI > config file > defaults.

mod builder;
mod discovery;
pub mod error;
mod model;
mod validation;

pub use builder::ConfigBuilder;
pub use discovery::CONFIG_DIR;
pub use error::ConfigError;
pub use model::{
    CaptureConfig, CliArgs, Config, ConfigSource, LoggingConfig, MAX_CAPTURE_LIMIT_BYTES,
    ProcessConfig,
};
