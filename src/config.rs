//! Configuration for the api, scheduler and worker processes.
//!
//! An optional `config.toml` provides the base values (every key has a
//! default, so any subset may be specified) and `FEEDHUB_*` environment
//! variables override the file. A missing file yields the defaults.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value in {var}: {value}")]
    Env { var: &'static str, value: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database path, shared by all three processes.
    pub database_path: String,
    pub refresh: RefreshConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Minimum time a job rests in `complete` before the scheduler
    /// re-queues it.
    pub update_frequency_s: u64,
    /// Backoff minutes per consecutive failure; the list length is the
    /// retry cap.
    pub retry_delay_m: Vec<u64>,
    /// Total per-request HTTP deadline (connect + read).
    pub fetch_timeout_s: u64,
    /// Hard cap on a downloaded feed body.
    pub max_feed_size_b: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_s: u64,
    pub batch_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub interval_s: u64,
    pub batch_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "feedhub.db".to_string(),
            refresh: RefreshConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            update_frequency_s: 3600,
            retry_delay_m: vec![2, 5, 8],
            fetch_timeout_s: 30,
            max_feed_size_b: 10 * 1024 * 1024,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_s: 30,
            batch_size: 20,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_s: 5,
            batch_size: 50,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Config {
    /// Load `path` (missing file → defaults), then apply env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Config::default()
            }
            Err(err) => return Err(err.into()),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Environment variables win over the file, key by key.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_var("FEEDHUB_DATABASE_PATH") {
            self.database_path = value;
        }
        override_parsed(
            "FEEDHUB_UPDATE_FREQUENCY_S",
            &mut self.refresh.update_frequency_s,
        )?;
        if let Some(value) = env_var("FEEDHUB_RETRY_DELAY_M") {
            self.refresh.retry_delay_m = parse_delay_list("FEEDHUB_RETRY_DELAY_M", &value)?;
        }
        override_parsed("FEEDHUB_FETCH_TIMEOUT_S", &mut self.refresh.fetch_timeout_s)?;
        override_parsed("FEEDHUB_MAX_FEED_SIZE_B", &mut self.refresh.max_feed_size_b)?;
        override_parsed(
            "FEEDHUB_SCHEDULER_INTERVAL_S",
            &mut self.scheduler.interval_s,
        )?;
        override_parsed(
            "FEEDHUB_SCHEDULER_BATCH_SIZE",
            &mut self.scheduler.batch_size,
        )?;
        override_parsed("FEEDHUB_WORKER_INTERVAL_S", &mut self.worker.interval_s)?;
        override_parsed("FEEDHUB_WORKER_BATCH_SIZE", &mut self.worker.batch_size)?;
        if let Some(value) = env_var("FEEDHUB_API_LISTEN_ADDR") {
            self.api.listen_addr = value;
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn override_parsed<T: std::str::FromStr>(
    var: &'static str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = env_var(var) {
        *target = value
            .parse()
            .map_err(|_| ConfigError::Env { var, value })?;
    }
    Ok(())
}

/// Comma-separated minutes, e.g. `FEEDHUB_RETRY_DELAY_M=2,5,8`.
fn parse_delay_list(var: &'static str, value: &str) -> Result<Vec<u64>, ConfigError> {
    value
        .split(',')
        .map(|part| {
            part.trim().parse().map_err(|_| ConfigError::Env {
                var,
                value: value.to_string(),
            })
        })
        .collect()
}
