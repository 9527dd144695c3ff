//! Device presence heartbeats
//!
//! Devices periodically publish a status object on
//! `<device_namespace>/<unit>/online`. The gateway only logs them.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::topic::TopicScheme;

/// Heartbeat payload
///
/// Fields are kept as raw JSON so a device that reports `null` or a
/// placeholder string in one field still gets logged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    pub device_id: Option<Value>,
    pub msg_type: Option<Value>,
    pub timestamp: Option<Value>,
    pub ip: Option<Value>,
    pub network: Option<Value>,
    pub eth_connected: Option<Value>,
    pub wifi_connected: Option<Value>,
    pub lte_connected: Option<Value>,
    pub cpu_temp: Option<Value>,
    pub sense_temp: Option<Value>,
    pub video_fps: Option<Value>,
    pub spi_fps: Option<Value>,
    pub lte_signal: Option<Value>,
}

impl Heartbeat {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Connected links, e.g. `eth+wifi`, or `none`
    pub fn links(&self) -> String {
        let links: Vec<&str> = [
            (&self.eth_connected, "eth"),
            (&self.wifi_connected, "wifi"),
            (&self.lte_connected, "lte"),
        ]
        .into_iter()
        .filter(|(up, _)| truthy(Option::as_ref(up)))
        .map(|(_, name)| name)
        .collect();

        if links.is_empty() {
            "none".to_string()
        } else {
            links.join("+")
        }
    }

    /// LTE signal, when the device reported a non-empty one
    pub fn lte_signal(&self) -> Option<&Value> {
        self.lte_signal.as_ref().filter(|v| truthy(Some(*v)))
    }
}

/// Render a field for logging, falling back to `default` when absent
fn text(value: &Option<Value>, default: &str) -> String {
    match value {
        None | Some(Value::Null) => default.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// `false`, `0`, `""`, `null`, `[]` and `{}` count as not set
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Positive numeric readings only; zero or a placeholder means not reported
fn reading(value: &Option<Value>) -> Option<f64> {
    value
        .as_ref()
        .and_then(Value::as_f64)
        .filter(|v| *v > 0.0)
}

/// Default handler for bus messages that are not replies
pub fn handle_message(topics: &TopicScheme, topic: &str, payload: &[u8]) {
    let Some(unit) = topics.presence_unit(topic) else {
        debug!(topic = %topic, bytes = payload.len(), "Unhandled bus message");
        return;
    };

    let heartbeat = match Heartbeat::parse(payload) {
        Ok(heartbeat) => heartbeat,
        Err(e) => {
            warn!(unit = %unit, error = %e, "Malformed heartbeat");
            return;
        }
    };

    info!(
        unit = %unit,
        device_id = %text(&heartbeat.device_id, "unknown"),
        msg_type = %text(&heartbeat.msg_type, "unknown"),
        timestamp = %text(&heartbeat.timestamp, "unknown"),
        ip = %text(&heartbeat.ip, "N/A"),
        network = %text(&heartbeat.network, "N/A"),
        links = %heartbeat.links(),
        cpu_temp = ?reading(&heartbeat.cpu_temp),
        sense_temp = ?reading(&heartbeat.sense_temp),
        video_fps = ?reading(&heartbeat.video_fps),
        spi_fps = ?reading(&heartbeat.spi_fps),
        lte_signal = ?heartbeat.lte_signal(),
        "Device online"
    );
}
