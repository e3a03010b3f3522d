//! Configuration management for jobwarden
//!
//! Configuration is loaded from environment variables or a TOML file and
//! converted into the runtime [`SchedulerSettings`] consumed by the scheduler.

use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::settings::MAX_WAIT_LIMIT;
use crate::scheduler::{SchedulerSettings, ServerIdSource};
use crate::store::sqlite::DEFAULT_POLL_INTERVAL;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Store configuration
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Heartbeat silence after which another server takes over
    pub max_wait_secs: u64,

    /// Delay before the first leadership decision, in milliseconds
    pub startup_delay_ms: u64,

    /// Fixed server id; a random id is generated per start when unset
    pub server_id: Option<String>,

    /// Offset from UTC for calendar fields in due dates, in minutes
    pub utc_offset_minutes: i32,
}

/// Store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, lost on exit
    Memory,
    #[default]
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => anyhow::bail!("unknown store backend: {other}"),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// SQLite database path
    pub sqlite_path: PathBuf,

    /// How often the SQLite store checks for writes by other processes
    pub poll_interval_ms: u64,
}

/// Where log output goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    /// No crate logging
    Off,
    /// Info and above
    #[default]
    Default,
    /// Debug and above
    Verbose,
    /// The embedding application installs its own subscriber
    Custom,
}

impl LogSink {
    /// Filter directive for the crate's own targets, if the binary installs a subscriber
    pub fn directive(&self) -> Option<&'static str> {
        match self {
            Self::Off => Some("jobwarden=off"),
            Self::Default => Some("jobwarden=info"),
            Self::Verbose => Some("jobwarden=debug"),
            Self::Custom => None,
        }
    }
}

impl std::str::FromStr for LogSink {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "default" => Ok(Self::Default),
            "verbose" => Ok(Self::Verbose),
            "custom" => Ok(Self::Custom),
            other => anyhow::bail!("unknown log sink: {other}"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub sink: LogSink,

    /// Log format (text, json)
    pub format: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let defaults = SchedulerSettings::default();
        Self {
            max_wait_secs: defaults.max_wait.as_secs(),
            startup_delay_ms: defaults.startup_delay.as_millis() as u64,
            server_id: None,
            utc_offset_minutes: 0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sqlite_path: PathBuf::from("data/jobs.db"),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            sink: LogSink::default(),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_wait_secs =
            env_parse("JOBWARDEN_MAX_WAIT_SECS").unwrap_or(defaults.scheduler.max_wait_secs);

        let startup_delay_ms = env_parse("JOBWARDEN_STARTUP_DELAY_MS")
            .unwrap_or(defaults.scheduler.startup_delay_ms);

        let server_id = std::env::var("JOBWARDEN_SERVER_ID")
            .ok()
            .filter(|id| !id.is_empty());

        let utc_offset_minutes = env_parse("JOBWARDEN_UTC_OFFSET_MINUTES").unwrap_or(0);

        let backend = match std::env::var("JOBWARDEN_STORE") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.store.backend,
        };

        let sqlite_path = std::env::var("JOBWARDEN_SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.store.sqlite_path);

        let poll_interval_ms = env_parse("JOBWARDEN_POLL_INTERVAL_MS")
            .unwrap_or(defaults.store.poll_interval_ms);

        let sink = match std::env::var("JOBWARDEN_LOG") {
            Ok(value) => value.parse()?,
            Err(_) => LogSink::default(),
        };

        let format =
            std::env::var("JOBWARDEN_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        Ok(Self {
            scheduler: SchedulerConfig {
                max_wait_secs,
                startup_delay_ms,
                server_id,
                utc_offset_minutes,
            },
            store: StoreConfig {
                backend,
                sqlite_path,
                poll_interval_ms,
            },
            logging: LoggingConfig { sink, format },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_wait_secs == 0 {
            anyhow::bail!("max_wait_secs must be greater than 0");
        }

        if self.scheduler.max_wait_secs > MAX_WAIT_LIMIT.as_secs() {
            anyhow::bail!(
                "max_wait_secs must be at most {}, got {}",
                MAX_WAIT_LIMIT.as_secs(),
                self.scheduler.max_wait_secs
            );
        }

        if self.utc_offset().is_none() {
            anyhow::bail!(
                "utc_offset_minutes must be within +/-24 hours, got {}",
                self.scheduler.utc_offset_minutes
            );
        }

        if self.store.backend == StoreBackend::Sqlite
            && self.store.sqlite_path.as_os_str().is_empty()
        {
            anyhow::bail!("sqlite_path must be set for the sqlite backend");
        }

        if self.store.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("log format must be text or json, got {}", self.logging.format);
        }

        Ok(())
    }

    fn utc_offset(&self) -> Option<FixedOffset> {
        self.scheduler
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
    }

    /// Poll interval as Duration
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.poll_interval_ms)
    }

    /// Runtime scheduler settings
    pub fn to_settings(&self) -> Result<SchedulerSettings> {
        let utc_offset = self
            .utc_offset()
            .context("utc_offset_minutes is out of range")?;

        let server_id = match &self.scheduler.server_id {
            Some(id) => ServerIdSource::Literal(id.clone()),
            None => ServerIdSource::Random,
        };

        Ok(SchedulerSettings::default()
            .with_max_wait(Duration::from_secs(self.scheduler.max_wait_secs))
            .with_startup_delay(Duration::from_millis(self.scheduler.startup_delay_ms))
            .with_server_id(server_id)
            .with_utc_offset(utc_offset))
    }
}
