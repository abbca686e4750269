//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TRIBECAST_*, ATLAS_REDIS_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tribecast_core::{BrokerConfig, DeliveryPolicy, DEFAULT_TOPIC_PREFIX};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Redis upstream configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Broker configuration.
    #[serde(default)]
    pub broker: BrokerSection,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Redis upstream configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Redis address as `host:port`.
    #[serde(default = "default_redis_address")]
    pub address: String,

    /// Redis password, sent with `AUTH` when set.
    #[serde(default = "default_redis_password")]
    pub password: Option<String>,

    /// Redis logical database.
    #[serde(default = "default_redis_db")]
    pub db: u32,

    /// Prefix of the per-group channel name.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// First resubscribe delay in milliseconds.
    #[serde(default = "default_resubscribe_initial")]
    pub resubscribe_initial_ms: u64,

    /// Resubscribe delay cap in milliseconds.
    #[serde(default = "default_resubscribe_max")]
    pub resubscribe_max_ms: u64,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("address", &self.address)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("channel_prefix", &self.channel_prefix)
            .field("resubscribe_initial_ms", &self.resubscribe_initial_ms)
            .field("resubscribe_max_ms", &self.resubscribe_max_ms)
            .finish()
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    /// Per-listener queue capacity.
    #[serde(default = "default_listener_capacity")]
    pub listener_capacity: usize,

    /// Behavior when a listener's queue is full.
    #[serde(default)]
    pub delivery_policy: DeliveryPolicy,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the SSE endpoint.
    #[serde(default = "default_events_path")]
    pub events_path: String,

    /// Interval between SSE keep-alive comments, in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("TRIBECAST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TRIBECAST_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}

fn default_redis_address() -> String {
    std::env::var("ATLAS_REDIS_ADDRESS").unwrap_or_else(|_| "localhost:6379".to_string())
}

fn default_redis_password() -> Option<String> {
    std::env::var("ATLAS_REDIS_PASSWORD")
        .ok()
        .filter(|p| !p.is_empty())
}

fn default_redis_db() -> u32 {
    std::env::var("ATLAS_REDIS_DB")
        .ok()
        .and_then(|db| db.parse().ok())
        .unwrap_or(0)
}

fn default_channel_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_resubscribe_initial() -> u64 {
    250
}

fn default_resubscribe_max() -> u64 {
    30_000
}

fn default_listener_capacity() -> usize {
    20
}

fn default_events_path() -> String {
    "/s/events".to_string()
}

fn default_keep_alive() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream: UpstreamConfig::default(),
            broker: BrokerSection::default(),
            transport: TransportConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: default_redis_address(),
            password: default_redis_password(),
            db: default_redis_db(),
            channel_prefix: default_channel_prefix(),
            resubscribe_initial_ms: default_resubscribe_initial(),
            resubscribe_max_ms: default_resubscribe_max(),
        }
    }
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            listener_capacity: default_listener_capacity(),
            delivery_policy: DeliveryPolicy::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            events_path: default_events_path(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "tribecast.toml",
            "/etc/tribecast/tribecast.toml",
            "~/.config/tribecast/tribecast.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }

    /// Broker settings derived from this configuration.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            listener_capacity: self.broker.listener_capacity,
            delivery_policy: self.broker.delivery_policy,
            topic_prefix: self.upstream.channel_prefix.clone(),
            resubscribe_initial: Duration::from_millis(self.upstream.resubscribe_initial_ms),
            resubscribe_max: Duration::from_millis(self.upstream.resubscribe_max_ms),
        }
    }
}
