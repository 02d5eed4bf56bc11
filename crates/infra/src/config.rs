//! Migration runtime configuration.
//!
//! Read from the environment with defaults; every knob also has a `with_*`
//! builder so tests never touch process state.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use portage_migration::ProcessingMode;

use crate::tasks::{RetryPolicy, TaskExecutorConfig};

pub const DELAY_DATA_PROCESSING: &str = "PORTAGE_DELAY_DATA_PROCESSING";
pub const BLOB_ROOT: &str = "PORTAGE_BLOB_ROOT";
pub const EXECUTOR_POLL_MS: &str = "PORTAGE_EXECUTOR_POLL_MS";
pub const EXECUTOR_NAME: &str = "PORTAGE_EXECUTOR_NAME";
pub const TASK_MAX_ATTEMPTS: &str = "PORTAGE_TASK_MAX_ATTEMPTS";
pub const TASK_RETRY_DELAY_MS: &str = "PORTAGE_TASK_RETRY_DELAY_MS";
pub const DATABASE_URL: &str = "DATABASE_URL";

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Hand heavy processing to the background executor.
    pub delay_data_processing: bool,
    pub blob_root: PathBuf,
    pub executor_poll_interval: Duration,
    pub executor_name: String,
    pub task_max_attempts: u32,
    /// First backoff step; later retries double it up to a minute.
    pub task_retry_delay: Duration,
    /// Durable job repository; in-memory when unset.
    pub database_url: Option<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            delay_data_processing: false,
            blob_root: PathBuf::from("./exports"),
            executor_poll_interval: Duration::from_millis(100),
            executor_name: "migration-executor".to_string(),
            task_max_attempts: 5,
            task_retry_delay: Duration::from_millis(500),
            database_url: None,
        }
    }
}

impl MigrationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(value) = get(DELAY_DATA_PROCESSING) {
            config.delay_data_processing = parse_bool(DELAY_DATA_PROCESSING, &value)?;
        }
        if let Some(value) = get(BLOB_ROOT) {
            config.blob_root = PathBuf::from(value);
        }
        if let Some(value) = get(EXECUTOR_POLL_MS) {
            let ms = parse_number::<u64>(EXECUTOR_POLL_MS, &value)?;
            config.executor_poll_interval = Duration::from_millis(ms);
        }
        if let Some(value) = get(EXECUTOR_NAME) {
            config.executor_name = value;
        }
        if let Some(value) = get(TASK_MAX_ATTEMPTS) {
            config.task_max_attempts = parse_number(TASK_MAX_ATTEMPTS, &value)?;
        }
        if let Some(value) = get(TASK_RETRY_DELAY_MS) {
            let ms = parse_number::<u64>(TASK_RETRY_DELAY_MS, &value)?;
            config.task_retry_delay = Duration::from_millis(ms);
        }
        config.database_url = get(DATABASE_URL);

        Ok(config)
    }

    pub fn with_delay_data_processing(mut self, delay: bool) -> Self {
        self.delay_data_processing = delay;
        self
    }

    pub fn with_blob_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.blob_root = root.into();
        self
    }

    pub fn with_executor_poll_interval(mut self, interval: Duration) -> Self {
        self.executor_poll_interval = interval;
        self
    }

    pub fn with_executor_name(mut self, name: impl Into<String>) -> Self {
        self.executor_name = name.into();
        self
    }

    pub fn with_task_max_attempts(mut self, attempts: u32) -> Self {
        self.task_max_attempts = attempts;
        self
    }

    pub fn with_task_retry_delay(mut self, delay: Duration) -> Self {
        self.task_retry_delay = delay;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        ProcessingMode::from_delay_flag(self.delay_data_processing)
    }

    pub fn executor_config(&self) -> TaskExecutorConfig {
        TaskExecutorConfig::default()
            .with_name(self.executor_name.clone())
            .with_poll_interval(self.executor_poll_interval)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.task_max_attempts,
            self.task_retry_delay,
            MAX_RETRY_DELAY.max(self.task_retry_delay),
        )
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
