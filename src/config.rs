//! Configuration management for the SmartReader gateway
//!
//! Configuration can be loaded from a YAML file and is overridable from the
//! environment. The environment variable names match the deployment contract
//! (`MQTT_BROKER`, `MQTT_PORT`, `API_KEY`, ...).

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use anyhow::{Result, Context};
use tracing::{info, warn};

/// Environment variable naming an optional YAML config file
const CONFIG_PATH_VAR: &str = "GATEWAY_CONFIG";

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// MQTT broker session configuration
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// HTTP ingress configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Durable store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Background worker cadences
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Prefix applied to firmware file URLs in upgrade payloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_url_base: Option<String>,
}

/// MQTT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// MQTT broker hostname
    #[serde(default = "default_broker")]
    pub broker: String,

    /// MQTT broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Optional broker credentials
    pub username: Option<String>,
    pub password: Option<String>,

    /// TLS settings
    #[serde(default)]
    pub use_tls: bool,
    pub ca_certs: Option<String>,
    pub certfile: Option<String>,
    pub keyfile: Option<String>,
    #[serde(default = "default_true")]
    pub verify_hostname: bool,
    pub tls_version: Option<String>,
    pub ciphers: Option<String>,

    /// Publish options
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_publish_ack_timeout")]
    pub publish_ack_timeout_secs: u64,

    /// Reconnect policy
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_mqtt_port(),
            keepalive_secs: default_keepalive(),
            username: None,
            password: None,
            use_tls: false,
            ca_certs: None,
            certfile: None,
            keyfile: None,
            verify_hostname: true,
            tls_version: None,
            ciphers: None,
            qos: default_qos(),
            retain: false,
            max_message_size: default_max_message_size(),
            publish_ack_timeout_secs: default_publish_ack_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

/// HTTP ingress configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address for the HTTP listener
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Shared secret expected in the X-API-Key header
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: None,
        }
    }
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database URL
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

/// Background worker cadences, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_pump_interval")]
    pub pump_interval_secs: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Age after which a PROCESSING command is considered stuck
    #[serde(default = "default_reap_after")]
    pub reap_after_secs: u64,

    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pump_interval_secs: default_pump_interval(),
            reap_interval_secs: default_reap_interval(),
            reap_after_secs: default_reap_after(),
            scheduler_interval_secs: default_scheduler_interval(),
        }
    }
}

// Default value functions
fn default_broker() -> String { "localhost".to_string() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_keepalive() -> u64 { 60 }
fn default_true() -> bool { true }
fn default_qos() -> u8 { 1 }
fn default_max_message_size() -> usize { 10_000 }
fn default_publish_ack_timeout() -> u64 { 10 }
fn default_max_reconnect_attempts() -> u32 { 5 }
fn default_reconnect_delay() -> u64 { 5 }
fn default_bind() -> String { "0.0.0.0:8000".to_string() }
fn default_database_url() -> String { "sqlite://smartreader.db".to_string() }
fn default_pump_interval() -> u64 { 10 }
fn default_reap_interval() -> u64 { 10 }
fn default_reap_after() -> u64 { 30 }
fn default_scheduler_interval() -> u64 { 60 }

impl GatewayConfig {
    /// Load configuration: YAML file if `GATEWAY_CONFIG` points at one,
    /// then environment variable overrides on top.
    pub fn load() -> Result<Self> {
        let mut config = match env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::load_from(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load_from(path: &str) -> Result<Self> {
        let path = PathBuf::from(path);

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: GatewayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Overlay recognized environment variables onto this configuration
    pub fn apply_env(&mut self) {
        read_env("MQTT_BROKER", &mut self.mqtt.broker);
        read_env_parsed("MQTT_PORT", &mut self.mqtt.port);
        read_env_parsed("MQTT_KEEPALIVE", &mut self.mqtt.keepalive_secs);
        read_env_opt("MQTT_USERNAME", &mut self.mqtt.username);
        read_env_opt("MQTT_PASSWORD", &mut self.mqtt.password);
        read_env_bool("MQTT_USE_TLS", &mut self.mqtt.use_tls);
        read_env_opt("MQTT_CA_CERTS", &mut self.mqtt.ca_certs);
        read_env_opt("MQTT_CERTFILE", &mut self.mqtt.certfile);
        read_env_opt("MQTT_KEYFILE", &mut self.mqtt.keyfile);
        read_env_bool("MQTT_VERIFY_HOSTNAME", &mut self.mqtt.verify_hostname);
        read_env_opt("MQTT_TLS_VERSION", &mut self.mqtt.tls_version);
        read_env_opt("MQTT_CIPHERS", &mut self.mqtt.ciphers);
        read_env_parsed("MQTT_QOS", &mut self.mqtt.qos);
        read_env_bool("MQTT_RETAIN", &mut self.mqtt.retain);
        read_env_parsed("MQTT_MAX_MESSAGE_SIZE", &mut self.mqtt.max_message_size);
        read_env_parsed("MQTT_MAX_RECONNECT_ATTEMPTS", &mut self.mqtt.max_reconnect_attempts);
        read_env_parsed("MQTT_RECONNECT_DELAY", &mut self.mqtt.reconnect_delay_secs);
        read_env_opt("API_KEY", &mut self.api.api_key);
        read_env("GATEWAY_BIND", &mut self.api.bind);
        read_env("DATABASE_URL", &mut self.store.database_url);
        read_env_opt("FIRMWARE_URL_BASE", &mut self.firmware_url_base);
        read_env_parsed("COMMAND_REAP_SECONDS", &mut self.workers.reap_after_secs);

        if self.mqtt.ciphers.is_some() {
            warn!("MQTT_CIPHERS is set but not applied; rustls uses a fixed set of safe cipher suites");
        }
    }
}

fn read_env(name: &str, target: &mut String) {
    if let Ok(value) = env::var(name) {
        *target = value;
    }
}

fn read_env_opt(name: &str, target: &mut Option<String>) {
    if let Ok(value) = env::var(name) {
        if !value.is_empty() {
            *target = Some(value);
        }
    }
}

fn read_env_bool(name: &str, target: &mut bool) {
    if let Ok(value) = env::var(name) {
        *target = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
}

fn read_env_parsed<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = env::var(name) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("Ignoring unparseable value for {}: {}", name, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.qos, 1);
        assert!(!config.mqtt.retain);
        assert!(config.mqtt.verify_hostname);
        assert_eq!(config.workers.reap_after_secs, 30);
        assert_eq!(config.workers.pump_interval_secs, 10);
        assert_eq!(config.workers.scheduler_interval_secs, 60);
    }

    #[test]
    fn test_yaml_overrides_keep_other_defaults() {
        let yaml = r#"
mqtt:
  broker: broker.example.com
  port: 8883
  use_tls: true
  verify_hostname: false
api:
  api_key: secret
workers:
  reap_after_secs: 45
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mqtt.broker, "broker.example.com");
        assert_eq!(config.mqtt.port, 8883);
        assert!(config.mqtt.use_tls);
        assert!(!config.mqtt.verify_hostname);
        assert_eq!(config.api.api_key.as_deref(), Some("secret"));
        assert_eq!(config.workers.reap_after_secs, 45);
        assert_eq!(config.workers.pump_interval_secs, 10);
        assert_eq!(config.store.database_url, "sqlite://smartreader.db");
    }
}
