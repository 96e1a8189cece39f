use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ConfigError;
use crate::model::{CliArgs, Config, ConfigSource};

/// Directory (relative to a project root) holding `config.toml`.
pub const CONFIG_DIR: &str = ".xspawn";

const CONFIG_FILE: &str = "config.toml";

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    capture: Option<TomlCapture>,
    process: Option<TomlProcess>,
    logging: Option<TomlLogging>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct TomlCapture {
    stdout_limit_bytes: Option<usize>,
    stderr_limit_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct TomlProcess {
    create_process_group: Option<bool>,
    create_session: Option<bool>,
    working_directory: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct TomlLogging {
    verbose: Option<bool>,
    json: Option<bool>,
}

/// Overwrites `slot` and records `source` for `key` when `value` is present.
fn apply<T>(
    slot: &mut T,
    value: Option<T>,
    key: &str,
    source: &ConfigSource,
    attribution: &mut HashMap<String, ConfigSource>,
) {
    if let Some(value) = value {
        *slot = value;
        attribution.insert(key.to_string(), source.clone());
    }
}

impl Config {
    /// Discover and load configuration with precedence: CLI > file > defaults
    pub fn discover(cli_args: &CliArgs) -> Result<Self> {
        let start_dir = std::env::current_dir().context("Failed to get current directory")?;
        Self::discover_from(&start_dir, cli_args)
    }

    /// Discover and load configuration starting from a specific directory.
    ///
    /// Path-driven variant of [`Config::discover`] that leaves process-global state alone.
    pub fn discover_from(start_dir: &Path, cli_args: &CliArgs) -> Result<Self> {
        let mut config = Self::default();

        let config_path = match &cli_args.config_path {
            Some(explicit) if !explicit.is_file() => {
                return Err(ConfigError::NotFound {
                    path: explicit.clone(),
                }
                .into());
            }
            Some(explicit) => Some(explicit.clone()),
            None => Self::discover_config_file_from(start_dir)?,
        };

        if let Some(path) = &config_path {
            debug!(path = %path.display(), "loading config file");
            let file = Self::load_config_file(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?;
            config.apply_file(file, path);
        }

        config.apply_cli(cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Walks up from `start_dir` looking for `.xspawn/config.toml`, stopping at
    /// repository root markers (.git, .hg, .svn) or the filesystem root.
    pub fn discover_config_file_from(start_dir: &Path) -> Result<Option<PathBuf>> {
        let mut current_dir = start_dir.to_path_buf();

        loop {
            let config_path = current_dir.join(CONFIG_DIR).join(CONFIG_FILE);
            if config_path.is_file() {
                return Ok(Some(config_path));
            }

            if [".git", ".hg", ".svn"]
                .iter()
                .any(|marker| current_dir.join(marker).exists())
            {
                break;
            }

            match current_dir.parent() {
                Some(parent) => current_dir = parent.to_path_buf(),
                None => break,
            }
        }

        Ok(None)
    }

    fn load_config_file(path: &Path) -> Result<TomlConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let parsed = toml::from_str(&content).map_err(|e| ConfigError::InvalidFile {
            path: path.to_path_buf(),
            reason: e.message().to_string(),
        })?;
        Ok(parsed)
    }

    fn apply_file(&mut self, file: TomlConfig, path: &Path) {
        let source = ConfigSource::ConfigFile(path.to_path_buf());
        let attribution = &mut self.source_attribution;

        if let Some(capture) = file.capture {
            apply(
                &mut self.capture.stdout_limit_bytes,
                capture.stdout_limit_bytes,
                "stdout_limit_bytes",
                &source,
                attribution,
            );
            apply(
                &mut self.capture.stderr_limit_bytes,
                capture.stderr_limit_bytes,
                "stderr_limit_bytes",
                &source,
                attribution,
            );
        }

        if let Some(process) = file.process {
            apply(
                &mut self.process.create_process_group,
                process.create_process_group,
                "create_process_group",
                &source,
                attribution,
            );
            apply(
                &mut self.process.create_session,
                process.create_session,
                "create_session",
                &source,
                attribution,
            );
            if let Some(dir) = process.working_directory {
                self.process.working_directory = Some(resolve_against_project_root(path, dir));
                attribution.insert("working_directory".to_string(), source.clone());
            }
        }

        if let Some(logging) = file.logging {
            apply(
                &mut self.logging.verbose,
                logging.verbose,
                "verbose",
                &source,
                attribution,
            );
            apply(
                &mut self.logging.json,
                logging.json,
                "log_json",
                &source,
                attribution,
            );
        }
    }

    fn apply_cli(&mut self, cli: &CliArgs) {
        let source = ConfigSource::Cli;
        let attribution = &mut self.source_attribution;

        apply(
            &mut self.capture.stdout_limit_bytes,
            cli.stdout_limit_bytes,
            "stdout_limit_bytes",
            &source,
            attribution,
        );
        apply(
            &mut self.capture.stderr_limit_bytes,
            cli.stderr_limit_bytes,
            "stderr_limit_bytes",
            &source,
            attribution,
        );
        apply(
            &mut self.process.create_process_group,
            cli.create_process_group,
            "create_process_group",
            &source,
            attribution,
        );
        apply(
            &mut self.process.create_session,
            cli.create_session,
            "create_session",
            &source,
            attribution,
        );
        if let Some(dir) = &cli.working_directory {
            self.process.working_directory = Some(dir.clone());
            attribution.insert("working_directory".to_string(), source.clone());
        }
        apply(
            &mut self.logging.verbose,
            cli.verbose,
            "verbose",
            &source,
            attribution,
        );
        apply(
            &mut self.logging.json,
            cli.log_json,
            "log_json",
            &source,
            attribution,
        );
    }
}

/// Relative `working_directory` values in a file are taken relative to the
/// project root: the parent of `.xspawn/`, or the file's own directory otherwise.
fn resolve_against_project_root(config_path: &Path, dir: PathBuf) -> PathBuf {
    if dir.is_absolute() {
        return dir;
    }
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let root = if config_dir.file_name().is_some_and(|name| name == CONFIG_DIR) {
        config_dir.parent().unwrap_or(config_dir)
    } else {
        config_dir
    };
    root.join(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(root: &Path, content: &str) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_no_config_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();

        let config = Config::discover_from(temp.path(), &CliArgs::default()).unwrap();
        assert_eq!(config.capture, Default::default());
        assert!(config.source_attribution.is_empty());
    }

    #[test]
    fn test_discovery_walks_up_to_parent() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();
        let path = write_config(temp.path(), "[capture]\nstdout_limit_bytes = 4096\n");
        let nested = temp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let found = Config::discover_config_file_from(&nested).unwrap();
        assert_eq!(found.as_deref(), Some(path.as_path()));

        let config = Config::discover_from(&nested, &CliArgs::default()).unwrap();
        assert_eq!(config.capture.stdout_limit_bytes, 4096);
        assert_eq!(
            config.source_of("stdout_limit_bytes"),
            ConfigSource::ConfigFile(path)
        );
        assert_eq!(config.source_of("stderr_limit_bytes"), ConfigSource::Defaults);
    }

    #[test]
    fn test_discovery_stops_at_repository_root() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "[logging]\nverbose = true\n");
        let repo = temp.path().join("repo");
        fs::create_dir_all(repo.join(".git")).unwrap();

        assert_eq!(Config::discover_config_file_from(&repo).unwrap(), None);
    }

    #[test]
    fn test_cli_overrides_file() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();
        write_config(
            temp.path(),
            "[capture]\nstdout_limit_bytes = 4096\n\n[process]\ncreate_process_group = false\n",
        );
        let cli = CliArgs {
            stdout_limit_bytes: Some(8192),
            ..CliArgs::default()
        };

        let config = Config::discover_from(temp.path(), &cli).unwrap();
        assert_eq!(config.capture.stdout_limit_bytes, 8192);
        assert_eq!(config.source_of("stdout_limit_bytes"), ConfigSource::Cli);
        assert!(!config.process.create_process_group);
    }

    #[test]
    fn test_explicit_config_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("custom.toml");
        fs::write(&path, "[logging]\njson = true\n").unwrap();
        let cli = CliArgs {
            config_path: Some(path.clone()),
            ..CliArgs::default()
        };

        let config = Config::discover_from(temp.path(), &cli).unwrap();
        assert!(config.logging.json);
        assert_eq!(config.source_of("log_json"), ConfigSource::ConfigFile(path));
    }

    #[test]
    fn test_missing_explicit_config_path_is_an_error() {
        let temp = TempDir::new().unwrap();
        let cli = CliArgs {
            config_path: Some(temp.path().join("absent.toml")),
            ..CliArgs::default()
        };

        let err = Config::discover_from(temp.path(), &cli).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::NotFound { .. })
        ));
    }

    #[test]
    fn test_malformed_toml_is_rejected() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();
        write_config(temp.path(), "[capture\nstdout_limit_bytes = ");

        let err = Config::discover_from(temp.path(), &CliArgs::default()).unwrap_err();
        assert!(err.to_string().contains("Failed to load config file"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();
        write_config(temp.path(), "[capture]\nstdout_limit = 10\n");

        assert!(Config::discover_from(temp.path(), &CliArgs::default()).is_err());
    }

    #[test]
    fn test_relative_working_directory_resolves_against_project_root() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();
        fs::create_dir(temp.path().join("work")).unwrap();
        write_config(temp.path(), "[process]\nworking_directory = \"work\"\n");

        let config = Config::discover_from(temp.path(), &CliArgs::default()).unwrap();
        assert_eq!(
            config.process.working_directory,
            Some(temp.path().join("work"))
        );
    }
}
