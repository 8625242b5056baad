//! Configuration loader

use std::path::Path;

use sandboxd_utils::{config_file, Result, SandboxError};

use super::ServerConfig;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<ServerConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(ServerConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<ServerConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| SandboxError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<ServerConfig> {
        toml::from_str(content).map_err(|e| SandboxError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &ServerConfig) -> Result<()> {
        if config.queue.max_concurrent == 0 {
            return Err(SandboxError::config("queue.max_concurrent must be at least 1"));
        }

        if config.circuit_breaker.failure_threshold == 0
            || config.circuit_breaker.success_threshold == 0
        {
            return Err(SandboxError::config(
                "circuit_breaker thresholds must be at least 1",
            ));
        }

        if config.pty.buffer_bytes == 0 {
            return Err(SandboxError::config("pty.buffer_bytes must be at least 1"));
        }

        if config.pty.cols == 0 || config.pty.rows == 0 {
            return Err(SandboxError::config("pty.cols and pty.rows must be non-zero"));
        }

        if config.process.shell.is_empty() {
            return Err(SandboxError::config("process.shell must not be empty"));
        }

        if config.watch.binary.is_empty() {
            return Err(SandboxError::config("watch.binary must not be empty"));
        }

        Ok(())
    }

    /// Load and validate from the default location
    pub fn load_and_validate() -> Result<ServerConfig> {
        let config = Self::load()?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load and validate from an explicit path
    pub fn load_and_validate_from(path: &Path) -> Result<ServerConfig> {
        let config = Self::load_from_path(path)?;
        Self::validate(&config)?;
        Ok(config)
    }
}
