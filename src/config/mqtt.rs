//! Broker connection configuration

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::protocol::QoS;

/// Default MQTT port when the address carries none
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Connection settings for the upstream MQTT broker
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address (host:port or just host)
    pub address: String,

    /// Client id prefix, suffixed with the start time in seconds
    pub client_id_prefix: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    pub keepalive: u16,

    /// QoS for published commands and reply subscriptions (0 or 1)
    pub qos: u8,

    /// TCP connect + CONNACK timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long startup waits for the first successful connection
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// First reconnect delay after a lost connection
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Upper bound for the exponential reconnect delay
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,

    /// Maximum size of an inbound packet
    pub max_packet_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: "mqtt.leopardaws.com:1883".to_string(),
            client_id_prefix: "ms500_server".to_string(),
            username: None,
            password: None,
            keepalive: 60,
            qos: 0,
            connect_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(120),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl MqttConfig {
    /// Parse address into host and port
    pub fn parse_address(&self) -> (String, u16) {
        if let Some((host, port_str)) = self.address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.address.clone(), DEFAULT_MQTT_PORT)
    }

    /// Client id sent in CONNECT
    pub fn client_id(&self) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        format!("{}_{}", self.client_id_prefix, secs)
    }

    /// Configured QoS; values above 1 are rejected by validation
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    /// Keep-alive as Duration (`None` when disabled)
    pub fn keepalive_duration(&self) -> Option<Duration> {
        if self.keepalive == 0 {
            None
        } else {
            Some(Duration::from_secs(self.keepalive as u64))
        }
    }
}
