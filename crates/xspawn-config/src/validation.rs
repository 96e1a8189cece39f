use crate::error::ConfigError;
use crate::model::{Config, MAX_CAPTURE_LIMIT_BYTES};

fn validate_capture_limit(key: &str, limit: usize) -> Result<(), ConfigError> {
    if limit == 0 {
        return Err(ConfigError::invalid_value(key, "must be greater than 0"));
    }
    if limit > MAX_CAPTURE_LIMIT_BYTES {
        return Err(ConfigError::invalid_value(
            key,
            "exceeds maximum limit of 64MiB",
        ));
    }
    Ok(())
}

impl Config {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_capture_limit("stdout_limit_bytes", self.capture.stdout_limit_bytes)?;
        validate_capture_limit("stderr_limit_bytes", self.capture.stderr_limit_bytes)?;

        if let Some(dir) = &self.process.working_directory
            && dir.as_os_str().is_empty()
        {
            return Err(ConfigError::invalid_value(
                "working_directory",
                "must not be empty",
            ));
        }

        Ok(())
    }
}
