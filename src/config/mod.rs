use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Real-time channel WebSocket URL
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Keepalive ping interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// First reconnect delay in seconds; doubles per failed attempt
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,
    /// Consecutive failed attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    /// Enrichment API base URL
    #[serde(default = "default_api_url")]
    pub base_url: String,
    /// Poll interval in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackingConfig {
    /// Wallet address whose slips are tracked - loaded from env SLIPTRACK_USER
    #[serde(default)]
    pub user_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_ws_url() -> String {
    "wss://api.oddyssey.bet/ws".to_string()
}
fn default_api_url() -> String {
    "https://api.oddyssey.bet".to_string()
}
fn default_keepalive_secs() -> u64 {
    30
}
fn default_reconnect_base_secs() -> u64 {
    2
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_poll_interval_secs() -> u64 {
    20
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            keepalive_secs: default_keepalive_secs(),
            reconnect_base_secs: default_reconnect_base_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_url(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.overlay_env();
        Ok(config)
    }

    /// Defaults plus environment overrides (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config {
            channel: ChannelConfig::default(),
            enrichment: EnrichmentConfig::default(),
            tracking: TrackingConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.overlay_env();
        config
    }

    fn overlay_env(&mut self) {
        if let Ok(url) = std::env::var("SLIPTRACK_WS_URL") {
            self.channel.ws_url = url;
        }
        if let Ok(url) = std::env::var("SLIPTRACK_API_URL") {
            self.enrichment.base_url = url;
        }
        if let Ok(user) = std::env::var("SLIPTRACK_USER") {
            self.tracking.user_address = user;
        }
    }
}
