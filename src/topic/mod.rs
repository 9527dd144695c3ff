//! Bus topic layout
//!
//! Commands for a unit are published under the command namespace and devices
//! answer under the device namespace:
//!
//! ```text
//! <command_namespace>/<unit>/socket         gateway -> device
//! <device_namespace>/<unit>/socket_reply    device  -> gateway
//! <device_namespace>/<unit>/online          device heartbeat
//! ```

pub mod validation;

pub use validation::{topic_matches_filter, validate_topic_name, validate_unit_id};

use crate::config::TopicsConfig;

/// Suffix of the per-unit command topic
pub const COMMAND_SUFFIX: &str = "socket";

/// Suffix of the per-unit reply topic
pub const REPLY_SUFFIX: &str = "socket_reply";

/// Suffix of the per-unit presence topic
pub const PRESENCE_SUFFIX: &str = "online";

/// Derives command topics and wildcard filters, and recovers the unit id
/// from reply topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    command_namespace: String,
    device_namespace: String,
    reply_filter: String,
    presence_filter: String,
}

impl TopicScheme {
    pub fn new(command_namespace: &str, device_namespace: &str) -> Self {
        let command_namespace = command_namespace.trim_end_matches('/').to_string();
        let device_namespace = device_namespace.trim_end_matches('/').to_string();
        let reply_filter = format!("{}/+/{}", device_namespace, REPLY_SUFFIX);
        let presence_filter = format!("{}/+/{}", device_namespace, PRESENCE_SUFFIX);

        Self {
            command_namespace,
            device_namespace,
            reply_filter,
            presence_filter,
        }
    }

    pub fn from_config(config: &TopicsConfig) -> Self {
        Self::new(&config.command_namespace, &config.device_namespace)
    }

    /// `<command_namespace>/<unit>/socket`
    pub fn command_topic(&self, unit: &str) -> String {
        format!("{}/{}/{}", self.command_namespace, unit, COMMAND_SUFFIX)
    }

    /// Wildcard filter covering every unit's reply topic
    pub fn reply_filter(&self) -> &str {
        &self.reply_filter
    }

    /// Wildcard filter covering every unit's heartbeat topic
    pub fn presence_filter(&self) -> &str {
        &self.presence_filter
    }

    /// Returns the unit id if `topic` is a reply topic
    pub fn reply_unit<'a>(&self, topic: &'a str) -> Option<&'a str> {
        if !topic_matches_filter(topic, &self.reply_filter) {
            return None;
        }
        self.unit_segment(topic)
    }

    /// Returns the unit id if `topic` is a heartbeat topic
    pub fn presence_unit<'a>(&self, topic: &'a str) -> Option<&'a str> {
        if !topic_matches_filter(topic, &self.presence_filter) {
            return None;
        }
        self.unit_segment(topic)
    }

    // The unit is the level directly after the device namespace.
    fn unit_segment<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic
            .strip_prefix(self.device_namespace.as_str())?
            .strip_prefix('/')?;
        let (unit, _) = rest.split_once('/')?;
        if unit.is_empty() {
            None
        } else {
            Some(unit)
        }
    }
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::from_config(&TopicsConfig::default())
    }
}
