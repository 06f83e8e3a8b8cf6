//! Hierarchical configuration loading.

use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Instance id cannot be empty")]
    EmptyId,

    #[error("Working directory cannot be empty")]
    EmptyWorkingDir,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid buffer period: min ({0}s) must not exceed max ({1}s)")]
    InvalidBuffer(u64, u64),

    #[error("Invalid event_buffer_size: {0}. Must be at least 1")]
    InvalidEventBufferSize(usize),

    #[error("Invalid once_timeout_secs: {0}. Must be at least 1")]
    InvalidOnceTimeout(u64),

    #[error("Task configuration invalid: {0}")]
    InvalidTask(String),
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. The config file, when one is given
    /// 3. Environment variables (CATSYNC_* prefix, highest priority)
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed("CATSYNC_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.id.is_empty() {
            return Err(ConfigError::EmptyId);
        }
        if config.working_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyWorkingDir);
        }
        match config.log.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
        match config.log.format.as_str() {
            "json" | "pretty" => {}
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
        if config.buffer.min > config.buffer.max {
            return Err(ConfigError::InvalidBuffer(
                config.buffer.min.as_secs(),
                config.buffer.max.as_secs(),
            ));
        }
        if config.event_buffer_size == 0 {
            return Err(ConfigError::InvalidEventBufferSize(config.event_buffer_size));
        }
        if config.once_timeout_secs == 0 {
            return Err(ConfigError::InvalidOnceTimeout(config.once_timeout_secs));
        }
        for task in &config.tasks {
            task.validate()
                .map_err(|e| ConfigError::InvalidTask(e.to_string()))?;
            if let Some(buffer) = &task.buffer {
                if buffer.min > buffer.max {
                    return Err(ConfigError::InvalidBuffer(
                        buffer.min.as_secs(),
                        buffer.max.as_secs(),
                    ));
                }
            }
        }
        Ok(())
    }
}
