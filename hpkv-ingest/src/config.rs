//! Ingestion service configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via HPKV_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HPKV service the prices are written to.
    pub hpkv: HpkvConfig,
    /// Market data feed.
    pub feed: FeedConfig,
    /// Feed reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("HPKV_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from a variable lookup.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.hpkv.apply_overrides(&var);
        self.feed.apply_overrides(&var);
        self.reconnect.apply_overrides(&var);
        self.metrics.apply_overrides(&var);
    }

    /// Checks that the service can run with this configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hpkv.validate()?;
        self.feed.validate()?;
        self.reconnect.validate()?;
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// HPKV REST endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HpkvConfig {
    /// REST base URL, e.g. `https://api-eu-1.hpkv.io`.
    pub base_url: String,
    pub api_key: String,
    /// HTTP request timeout in seconds.
    pub timeout_secs: u64,
    /// Prefix of the keys prices are stored under.
    pub key_prefix: String,
}

impl Default for HpkvConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: 30,
            key_prefix: "stock:".to_string(),
        }
    }
}

impl HpkvConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("HPKV_BASE_URL") {
            self.base_url = url;
        }
        if let Some(key) = var("HPKV_API_KEY") {
            self.api_key = key;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "hpkv.base_url is not set (HPKV_BASE_URL)".to_string(),
            ));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::ValidationError(
                "hpkv.api_key is not set (HPKV_API_KEY)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Market data feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Feed WebSocket URL; the token is appended as `?token=`.
    pub url: String,
    pub token: String,
    /// Symbols to subscribe to, one connection each.
    pub symbols: Vec<String>,
    /// Keep-alive interval in seconds.
    pub ping_interval_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws.finnhub.io".to_string(),
            token: String::new(),
            symbols: vec!["AAPL".to_string(), "GOOGL".to_string()],
            ping_interval_secs: 30,
        }
    }
}

impl FeedConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(token) = var("FINNHUB_API_KEY") {
            self.token = token;
        }
        if let Some(url) = var("HPKV_FEED_URL") {
            self.url = url;
        }
        if let Some(symbols) = var("HPKV_SYMBOLS") {
            self.symbols = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(interval) = var("HPKV_PING_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse() {
                self.ping_interval_secs = secs;
            }
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.token.is_empty() {
            return Err(ConfigError::ValidationError(
                "feed.token is not set (FINNHUB_API_KEY)".to_string(),
            ));
        }
        if self.symbols.is_empty() {
            return Err(ConfigError::ValidationError(
                "feed.symbols is empty".to_string(),
            ));
        }
        if self.ping_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "feed.ping_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reconnection policy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicyKind {
    /// Constant delay.
    Fixed,
    /// Doubling delay up to a ceiling.
    #[default]
    Exponential,
}

/// Feed reconnection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub policy: ReconnectPolicyKind,
    /// Fixed delay, or the first exponential delay. Defaults to 10 s for
    /// `fixed` and 1 s for `exponential`.
    pub delay_secs: Option<u64>,
    /// Ceiling of the exponential delay.
    pub max_delay_secs: Option<u64>,
    /// Consecutive failed attempts before a feed gives up (unbounded if unset).
    pub max_attempts: Option<u32>,
}

impl ReconnectConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(policy) = var("HPKV_RECONNECT_POLICY") {
            match policy.to_lowercase().as_str() {
                "fixed" => self.policy = ReconnectPolicyKind::Fixed,
                "exponential" | "backoff" => self.policy = ReconnectPolicyKind::Exponential,
                other => tracing::warn!("Ignoring unknown HPKV_RECONNECT_POLICY {:?}", other),
            }
        }
        if let Some(delay) = var("HPKV_RECONNECT_DELAY_SECS") {
            if let Ok(secs) = delay.parse() {
                self.delay_secs = Some(secs);
            }
        }
        if let Some(max) = var("HPKV_RECONNECT_MAX_DELAY_SECS") {
            if let Ok(secs) = max.parse() {
                self.max_delay_secs = Some(secs);
            }
        }
        if let Some(attempts) = var("HPKV_RECONNECT_MAX_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                self.max_attempts = Some(n);
            }
        }
    }

    /// Returns the effective first delay.
    pub fn delay(&self) -> Duration {
        let default = match self.policy {
            ReconnectPolicyKind::Fixed => 10,
            ReconnectPolicyKind::Exponential => 1,
        };
        Duration::from_secs(self.delay_secs.unwrap_or(default))
    }

    /// Returns the effective exponential ceiling.
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs.unwrap_or(60))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.delay().is_zero() {
            return Err(ConfigError::ValidationError(
                "reconnect.delay_secs must be positive".to_string(),
            ));
        }
        if self.policy == ReconnectPolicyKind::Exponential && self.max_delay() < self.delay() {
            return Err(ConfigError::ValidationError(
                "reconnect.max_delay_secs is smaller than reconnect.delay_secs".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::ValidationError(
                "reconnect.max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9090),
        }
    }
}

impl MetricsConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = var("HPKV_METRICS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Some(addr) = var("HPKV_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes SocketAddr as a string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
