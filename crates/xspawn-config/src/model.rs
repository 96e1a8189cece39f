use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use xspawn_runner::{DEFAULT_COLLECT_LIMIT, PlatformOptions};

/// Largest capture limit accepted for either stream (64 MiB).
pub const MAX_CAPTURE_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Where a configuration value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Command-line flag (highest precedence).
    Cli,
    /// Loaded from the given `config.toml`.
    ConfigFile(PathBuf),
    /// Set through [`crate::ConfigBuilder`].
    Programmatic,
    /// Built-in default (lowest precedence).
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "cli"),
            Self::ConfigFile(path) => write!(f, "config ({})", path.display()),
            Self::Programmatic => write!(f, "programmatic"),
            Self::Defaults => write!(f, "default"),
        }
    }
}

/// `[capture]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub stdout_limit_bytes: usize,
    pub stderr_limit_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            stdout_limit_bytes: DEFAULT_COLLECT_LIMIT,
            stderr_limit_bytes: DEFAULT_COLLECT_LIMIT,
        }
    }
}

/// `[process]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub create_process_group: bool,
    pub create_session: bool,
    pub working_directory: Option<PathBuf>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            create_process_group: true,
            create_session: false,
            working_directory: None,
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub json: bool,
}

/// Effective configuration after applying CLI > file > defaults.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub process: ProcessConfig,
    pub logging: LoggingConfig,
    pub source_attribution: HashMap<String, ConfigSource>,
}

impl Config {
    /// Platform options derived from the `[process]` section.
    #[must_use]
    pub fn platform_options(&self) -> PlatformOptions {
        PlatformOptions {
            create_process_group: self.process.create_process_group,
            create_session: self.process.create_session,
            ..PlatformOptions::default()
        }
    }

    /// Source of a single key, `Defaults` when never overridden.
    #[must_use]
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.source_attribution
            .get(key)
            .cloned()
            .unwrap_or(ConfigSource::Defaults)
    }

    /// Effective configuration as `key -> (value, source)`, sorted by key.
    #[must_use]
    pub fn effective_config(&self) -> Vec<(String, String, ConfigSource)> {
        let mut entries = vec![
            (
                "stdout_limit_bytes",
                self.capture.stdout_limit_bytes.to_string(),
            ),
            (
                "stderr_limit_bytes",
                self.capture.stderr_limit_bytes.to_string(),
            ),
            (
                "create_process_group",
                self.process.create_process_group.to_string(),
            ),
            ("create_session", self.process.create_session.to_string()),
            ("verbose", self.logging.verbose.to_string()),
            ("log_json", self.logging.json.to_string()),
        ];
        if let Some(dir) = &self.process.working_directory {
            entries.push(("working_directory", dir.display().to_string()));
        }
        entries.sort_by(|a, b| a.0.cmp(b.0));

        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value, self.source_of(key)))
            .collect()
    }
}

/// Flags the binary forwards into discovery. `None` leaves the file/default value in place.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub stdout_limit_bytes: Option<usize>,
    pub stderr_limit_bytes: Option<usize>,
    pub create_process_group: Option<bool>,
    pub create_session: Option<bool>,
    pub working_directory: Option<PathBuf>,
    pub verbose: Option<bool>,
    pub log_json: Option<bool>,
}
