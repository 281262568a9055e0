//! ==============================================================================
//! config.rs - Relay Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `relay.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: where the http/websocket server listens.
//!     - BrokerConfig: mqtt broker address, credentials and topics.
//!     - FanoutConfig: broadcast buffer per client.
//!     - LivenessConfig: how long without telemetry before a plant is "disconnected".
//!     - CommandsConfig: how confirmed motor commands are verified.
//!     - NotificationsConfig: push notification endpoint and alert rule.
//!     - LoggingConfig: log level and reading echo.
//!
//! every section is optional; a partial file only overrides what it names.
//!
//! ==============================================================================

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// environment variable that points at an explicit config file
pub const CONFIG_ENV: &str = "RELAY_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub fanout: FanoutConfig,
    pub liveness: LivenessConfig,
    pub commands: CommandsConfig,
    pub notifications: NotificationsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// generated as `plant-relay-<uuid>` when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_seconds: u64,
    /// filter for inbound telemetry (mqtt wildcards allowed)
    pub sensor_topic: String,
    /// topic motor commands are published to
    pub command_topic: String,
    /// capacity of the request channel between client handle and event loop
    pub request_capacity: usize,
    pub reconnect_delay_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FanoutConfig {
    /// events buffered per client before it is considered lagging
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LivenessConfig {
    pub window_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CommandsConfig {
    /// reading field that reflects the motor state (e.g. "motor1_status")
    pub confirm_field: Option<String>,
    pub confirm_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationsConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub server_key: String,
    pub alert_field: Option<String>,
    pub alert_values: Vec<String>,
    pub title: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 3000 }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_seconds: 30,
            sensor_topic: "plant/sensors".to_string(),
            command_topic: "plant/motor".to_string(),
            request_capacity: 10,
            reconnect_delay_seconds: 3,
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { window_seconds: 10 }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self { confirm_field: None, confirm_timeout_seconds: 5 }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://fcm.googleapis.com/fcm/send".to_string(),
            server_key: String::new(),
            alert_field: None,
            alert_values: Vec::new(),
            title: "Plant alert".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: false }
    }
}

impl RelayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load with default fallback
    ///
    /// runs before the subscriber is installed, so the outcome is returned as
    /// a message for the caller to log once tracing is up
    pub fn load_or_default() -> (Self, String) {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("relay.toml"));
        paths.push(PathBuf::from("..").join("config").join("relay.toml"));

        let mut failures = Vec::new();
        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => return (config, format!("Loaded from {}", path.display())),
                    Err(e) => failures.push(format!("{:#}", e)),
                }
            }
        }

        let mut note = "No usable config file found - using defaults".to_string();
        if !failures.is_empty() {
            note.push_str(&format!(" ({})", failures.join("; ")));
        }
        (Self::default(), note)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!("┌─────────────────────────────────────────┐");
        tracing::info!("│          RELAY CONFIGURATION            │");
        tracing::info!("├─────────────────────────────────────────┤");
        tracing::info!("│ Listen: {}", self.server_address());
        tracing::info!("│ Broker: {}:{}", self.broker.host, self.broker.port);
        tracing::info!("│ Sensor topic: {}", self.broker.sensor_topic);
        tracing::info!("│ Command topic: {}", self.broker.command_topic);
        tracing::info!("│ Liveness window: {}s", self.liveness.window_seconds);
        tracing::info!("│ Notifications: {}", if self.notifications.enabled { "on" } else { "off" });
        tracing::info!("│ Log Level: {}", self.logging.level);
        tracing::info!("└─────────────────────────────────────────┘");
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }
}

impl LivenessConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

impl CommandsConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_seconds)
    }
}
