//! Engine configuration.
//!
//! Everything has a default, so an empty JSON file or an empty environment
//! yields a working in-process setup. `COURIER_*` variables override values
//! loaded from `COURIER_CONFIG_FILE`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::channels::ChannelSettings;
use crate::locale::DEFAULT_LOCALE;
use crate::queue::DEFAULT_QUEUE;
use crate::{Error, Result};

fn default_database_url() -> String {
    "sqlite:courier.db?mode=rwc".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_locale() -> String {
    DEFAULT_LOCALE.to_string()
}

fn default_event_capacity() -> usize {
    256
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Overrides the default log filter when set.
    #[serde(default)]
    pub log_filter: Option<String>,
    /// Locale bound on the sender; wins over recipient preferences.
    #[serde(default)]
    pub locale: Option<String>,
    /// Ambient locale outside any dispatch.
    #[serde(default = "default_locale")]
    pub default_locale: String,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_dir: default_log_dir(),
            log_filter: None,
            locale: None,
            default_locale: default_locale(),
            event_capacity: default_event_capacity(),
            channels: BTreeMap::new(),
            worker: WorkerConfig::default(),
        }
    }
}

impl CourierConfig {
    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Load `.env`, then the optional config file, then `COURIER_*` overrides.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mut config = match var("COURIER_CONFIG_FILE") {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };

        if let Some(url) = var("COURIER_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = var("COURIER_LOG_DIR") {
            config.log_dir = dir;
        }
        if let Some(filter) = var("COURIER_LOG_FILTER") {
            config.log_filter = Some(filter);
        }
        if let Some(locale) = var("COURIER_LOCALE") {
            config.locale = Some(locale);
        }
        if let Some(locale) = var("COURIER_DEFAULT_LOCALE") {
            config.default_locale = locale;
        }
        if let Some(queue) = var("COURIER_WORKER_QUEUE") {
            config.worker.queue = queue;
        }
        if let Some(attempts) = var("COURIER_WORKER_MAX_ATTEMPTS") {
            config.worker.max_attempts = parse_number("COURIER_WORKER_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(interval) = var("COURIER_WORKER_POLL_INTERVAL_MS") {
            config.worker.poll_interval_ms =
                parse_number("COURIER_WORKER_POLL_INTERVAL_MS", &interval)?;
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{} must be a number, got '{}'", key, value)))
}

/// Configuration of one named channel.
///
/// `class` picks the channel kind (`database`, `mail`, `webhook`, or a
/// registered kind); every other key is passed to the channel as settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(flatten)]
    pub settings: ChannelSettings,
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn setting(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

fn default_dead_letter_retention_days() -> u32 {
    7
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// Queue worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Attempts before a requeued job is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_dead_letter_retention_days")]
    pub dead_letter_retention_days: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            max_attempts: default_max_attempts(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            dead_letter_retention_days: default_dead_letter_retention_days(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}
