use std::path::PathBuf;

use crate::error::ConfigError;
use crate::model::{Config, ConfigSource};

impl Config {
    /// Create a builder for programmatic configuration.
    ///
    /// ```rust
    /// use xspawn_config::Config;
    ///
    /// let config = Config::builder()
    ///     .stdout_limit_bytes(4096)
    ///     .create_process_group(false)
    ///     .build()
    ///     .expect("valid config");
    /// assert_eq!(config.capture.stdout_limit_bytes, 4096);
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builds a [`Config`] without consulting the filesystem.
///
/// Every value set here is attributed to [`ConfigSource::Programmatic`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    stdout_limit_bytes: Option<usize>,
    stderr_limit_bytes: Option<usize>,
    create_process_group: Option<bool>,
    create_session: Option<bool>,
    working_directory: Option<PathBuf>,
    verbose: Option<bool>,
    log_json: Option<bool>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture limit for standard output (must be > 0 and <= 64 MiB).
    #[must_use]
    pub fn stdout_limit_bytes(mut self, bytes: usize) -> Self {
        self.stdout_limit_bytes = Some(bytes);
        self
    }

    /// Capture limit for standard error (must be > 0 and <= 64 MiB).
    #[must_use]
    pub fn stderr_limit_bytes(mut self, bytes: usize) -> Self {
        self.stderr_limit_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn create_process_group(mut self, enabled: bool) -> Self {
        self.create_process_group = Some(enabled);
        self
    }

    #[must_use]
    pub fn create_session(mut self, enabled: bool) -> Self {
        self.create_session = Some(enabled);
        self
    }

    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = Some(verbose);
        self
    }

    #[must_use]
    pub fn log_json(mut self, json: bool) -> Self {
        self.log_json = Some(json);
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a value is out of range.
    pub fn build(self) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        let mut set = |key: &str| {
            config
                .source_attribution
                .insert(key.to_string(), ConfigSource::Programmatic);
        };

        if self.stdout_limit_bytes.is_some() {
            set("stdout_limit_bytes");
        }
        if self.stderr_limit_bytes.is_some() {
            set("stderr_limit_bytes");
        }
        if self.create_process_group.is_some() {
            set("create_process_group");
        }
        if self.create_session.is_some() {
            set("create_session");
        }
        if self.working_directory.is_some() {
            set("working_directory");
        }
        if self.verbose.is_some() {
            set("verbose");
        }
        if self.log_json.is_some() {
            set("log_json");
        }

        if let Some(bytes) = self.stdout_limit_bytes {
            config.capture.stdout_limit_bytes = bytes;
        }
        if let Some(bytes) = self.stderr_limit_bytes {
            config.capture.stderr_limit_bytes = bytes;
        }
        if let Some(enabled) = self.create_process_group {
            config.process.create_process_group = enabled;
        }
        if let Some(enabled) = self.create_session {
            config.process.create_session = enabled;
        }
        if self.working_directory.is_some() {
            config.process.working_directory = self.working_directory;
        }
        if let Some(verbose) = self.verbose {
            config.logging.verbose = verbose;
        }
        if let Some(json) = self.log_json {
            config.logging.json = json;
        }

        config.validate()?;
        Ok(config)
    }
}
