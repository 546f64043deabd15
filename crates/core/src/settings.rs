//! Service settings
//!
//! Layered: built-in defaults, then an optional config file, then
//! `TICKER__*` environment variables.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, ConfigResult};
use crate::DEFAULT_HISTORY_CAPACITY;

/// Environment variable pointing at an alternative config file
pub const CONFIG_PATH_ENV: &str = "TICKER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/ticker";
const ENV_PREFIX: &str = "TICKER";

/// Upstream feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub url: String,
    pub reconnect_delay_ms: u64,
    /// 0 means retry forever
    pub max_reconnects: u32,
    pub batch_buffer: usize,
}

impl FeedSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: "ws://stocks.mnet.website".to_string(),
            reconnect_delay_ms: 5_000,
            max_reconnects: 10,
            batch_buffer: 1_024,
        }
    }
}

/// Consumer-facing listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound messages queued per endpoint before it is considered unresponsive
    pub endpoint_buffer: usize,
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9001,
            endpoint_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    pub capacity: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub feed: FeedSettings,
    pub server: ServerSettings,
    pub history: HistorySettings,
    pub stats_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            feed: FeedSettings::default(),
            server: ServerSettings::default(),
            history: HistorySettings::default(),
            stats_interval_secs: 60,
        }
    }
}

impl Settings {
    /// Load from `config/ticker.*` (or `$TICKER_CONFIG`) and the environment
    pub fn load() -> ConfigResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> ConfigResult<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.feed.url.trim().is_empty() {
            return Err(ConfigError::Invalid("feed.url must not be empty".to_string()));
        }
        if self.history.capacity == 0 {
            return Err(ConfigError::Invalid("history.capacity must be at least 1".to_string()));
        }
        if self.server.endpoint_buffer == 0 {
            return Err(ConfigError::Invalid(
                "server.endpoint_buffer must be at least 1".to_string(),
            ));
        }
        if self.feed.batch_buffer == 0 {
            return Err(ConfigError::Invalid("feed.batch_buffer must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}
