//! Configuration Module
//!
//! TOML-based configuration for the gateway:
//! - Logging level
//! - Backend listener (bind address, backlog, read buffer, idle timeout, framing)
//! - Upstream MQTT broker connection
//! - Topic namespaces
//! - Environment variable overrides (UNITGATE__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use mqtt::MqttConfig;

mod mqtt;


/// Prefix for environment overrides, e.g. `UNITGATE__SERVER__BIND`
pub const ENV_PREFIX: &str = "UNITGATE";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Backend listener configuration
    pub server: ServerConfig,
    /// Upstream broker configuration
    pub mqtt: MqttConfig,
    /// Topic layout
    pub topics: TopicsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// How command boundaries are found on a Backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Every read is one chunk of one or more complete JSON objects
    #[default]
    Read,
    /// Input is buffered across reads and split on `\n`
    Newline,
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Framing::Read => write!(f, "read"),
            Framing::Newline => write!(f, "newline"),
        }
    }
}

/// Backend listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Listen backlog
    pub backlog: u32,
    /// Size of the per-connection read buffer
    pub read_buffer_size: usize,
    /// Idle read timeout; expiry is logged and the read retried
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Command framing
    pub framing: Framing,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 6080)),
            backlog: 5,
            read_buffer_size: 64 * 1024,
            read_timeout: Duration::from_secs(60),
            framing: Framing::Read,
        }
    }
}

/// Topic layout configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Namespace commands are published under
    pub command_namespace: String,
    /// Namespace devices publish replies and heartbeats under
    pub device_namespace: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            command_namespace: "/service/ms500".to_string(),
            device_namespace: "/device/ms500".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults. `${VAR}` references in the file
    /// are substituted and `UNITGATE__SECTION__KEY` variables override it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "127.0.0.1:6080")?
            .set_default("server.backlog", 5)?
            .set_default("server.read_buffer_size", 64 * 1024)?
            .set_default("server.read_timeout", "60s")?
            .set_default("server.framing", "read")?
            .set_default("mqtt.address", "mqtt.leopardaws.com:1883")?
            .set_default("mqtt.client_id_prefix", "ms500_server")?
            .set_default("mqtt.keepalive", 60)?
            .set_default("mqtt.qos", 0)?
            .set_default("mqtt.connect_timeout", "10s")?
            .set_default("mqtt.startup_timeout", "5s")?
            .set_default("mqtt.reconnect_interval", "1s")?
            .set_default("mqtt.max_reconnect_interval", "120s")?
            .set_default("mqtt.max_packet_size", 1024 * 1024)?
            .set_default("topics.command_namespace", "/service/ms500")?
            .set_default("topics.device_namespace", "/device/ms500")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.qos > 1 {
            return Err(ConfigError::Validation(
                "mqtt.qos must be 0 or 1".to_string(),
            ));
        }

        if self.mqtt.address.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.address cannot be empty".to_string(),
            ));
        }

        if self.mqtt.client_id_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.client_id_prefix cannot be empty".to_string(),
            ));
        }

        if self.mqtt.reconnect_interval > self.mqtt.max_reconnect_interval {
            return Err(ConfigError::Validation(
                "mqtt.reconnect_interval cannot exceed mqtt.max_reconnect_interval".to_string(),
            ));
        }

        if self.server.read_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "server.read_buffer_size must be greater than 0".to_string(),
            ));
        }

        if self.server.read_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "server.read_timeout must be greater than 0".to_string(),
            ));
        }

        for (key, namespace) in [
            ("topics.command_namespace", &self.topics.command_namespace),
            ("topics.device_namespace", &self.topics.device_namespace),
        ] {
            if namespace.trim_end_matches('/').is_empty() {
                return Err(ConfigError::Validation(format!("{} cannot be empty", key)));
            }
            if crate::topic::validate_topic_name(namespace).is_err() {
                return Err(ConfigError::Validation(format!(
                    "{} must be a topic name without wildcards",
                    key
                )));
            }
        }

        Ok(())
    }
}
