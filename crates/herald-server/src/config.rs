//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (HERALD_HOST, HERALD_PORT)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use herald_core::{HubConfig, MAX_IDENTITY_LENGTH};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Hub configuration.
    #[serde(default)]
    pub hub: HubSection,

    /// Streaming endpoint configuration.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Hub limits and delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// How long a delivery waits for the subscriber, in milliseconds.
    /// `0` waits indefinitely.
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_ms: u64,

    /// Maximum number of live subscribers.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,

    /// Maximum subscriber identity length in bytes.
    #[serde(default = "default_max_identity_length")]
    pub max_identity_length: usize,
}

/// Streaming endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Path prefix for opening a subscriber stream.
    #[serde(default = "default_handshake_path")]
    pub handshake_path: String,

    /// Path prefix for delivering a message.
    #[serde(default = "default_message_path")]
    pub message_path: String,

    /// Keep-alive comment interval in milliseconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_ms: u64,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
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

fn default_host() -> String {
    std::env::var("HERALD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("HERALD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8181)
}

fn default_true() -> bool {
    true
}

fn default_delivery_timeout() -> u64 {
    5_000
}

fn default_max_subscribers() -> usize {
    10_000
}

fn default_max_identity_length() -> usize {
    MAX_IDENTITY_LENGTH
}

fn default_handshake_path() -> String {
    "/handshake".to_string()
}

fn default_message_path() -> String {
    "/message".to_string()
}

fn default_keep_alive() -> u64 {
    15_000
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hub: HubSection::default(),
            stream: StreamConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: default_delivery_timeout(),
            max_subscribers: default_max_subscribers(),
            max_identity_length: default_max_identity_length(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            handshake_path: default_handshake_path(),
            message_path: default_message_path(),
            keep_alive_ms: default_keep_alive(),
            max_message_size: default_max_message_size(),
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

impl HubSection {
    /// Build the hub configuration.
    #[must_use]
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            delivery_timeout: (self.delivery_timeout_ms > 0)
                .then(|| Duration::from_millis(self.delivery_timeout_ms)),
            max_subscribers: self.max_subscribers,
            max_identity_length: self.max_identity_length,
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
            "herald.toml",
            "/etc/herald/herald.toml",
            "~/.config/herald/herald.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse and validate configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or a value is out of
    /// range.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the server misbehave.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.stream.keep_alive_ms == 0 {
            bail!("stream.keep_alive_ms must be greater than 0");
        }
        if self.stream.max_message_size == 0 {
            bail!("stream.max_message_size must be greater than 0");
        }
        if self.hub.max_subscribers == 0 {
            bail!("hub.max_subscribers must be greater than 0");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Keep-alive interval for open streams.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.stream.keep_alive_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stream.handshake_path, "/handshake");
        assert_eq!(config.stream.message_path, "/message");
        assert_eq!(config.hub.delivery_timeout_ms, 5_000);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 8181,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 8181);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [hub]
            delivery_timeout_ms = 250
            max_subscribers = 50

            [stream]
            keep_alive_ms = 1000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.hub.max_subscribers, 50);
        assert_eq!(config.keep_alive(), Duration::from_secs(1));

        let hub = config.hub.to_hub_config();
        assert_eq!(hub.delivery_timeout, Some(Duration::from_millis(250)));
        assert_eq!(hub.max_subscribers, 50);
    }

    #[test]
    fn test_zero_keep_alive_rejected() {
        let err = Config::from_toml(
            r#"
            [stream]
            keep_alive_ms = 0
        "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("keep_alive_ms"), "{err}");

        let config = Config::from_toml("[stream]\nkeep_alive_ms = 500\n").unwrap();
        assert_eq!(config.keep_alive(), Duration::from_millis(500));
    }

    #[test]
    fn test_from_file_validates() {
        let path = std::env::temp_dir().join(format!("herald-{}.toml", std::process::id()));
        std::fs::write(&path, "[hub]\nmax_subscribers = 0\n").unwrap();

        let result = Config::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("max_subscribers"), "{err:#}");
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let section = HubSection {
            delivery_timeout_ms: 0,
            ..HubSection::default()
        };
        assert_eq!(section.to_hub_config().delivery_timeout, None);
    }
}
