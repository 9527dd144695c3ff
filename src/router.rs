//! Command routing
//!
//! Turns a Backend command into a publish on the unit's command topic.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{error, info};

use crate::bus::BusError;
use crate::command::Command;
use crate::error::{GatewayError, Result};
use crate::topic::{validate_unit_id, TopicScheme};

/// Outbound side of the message bus
///
/// Implemented by [`crate::bus::BusClient`].
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic`, resolving once the transport accepted it
    async fn publish(&self, topic: &str, payload: Bytes) -> std::result::Result<(), BusError>;

    /// Whether a broker connection is currently established
    fn is_connected(&self) -> bool;
}

pub struct CommandRouter {
    topics: TopicScheme,
    publisher: Arc<dyn Publisher>,
}

impl CommandRouter {
    pub fn new(topics: TopicScheme, publisher: Arc<dyn Publisher>) -> Self {
        Self { topics, publisher }
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Publish `command` on its unit's command topic
    ///
    /// Returns the topic used. A command without a usable `unit` is
    /// rejected before anything is published. There is no retry.
    pub async fn route(&self, command: &Command) -> Result<String> {
        let unit = command
            .unit()
            .ok_or_else(|| GatewayError::Validation("command has no unit".to_string()))?;
        validate_unit_id(unit)
            .map_err(|e| GatewayError::Validation(format!("unit '{}': {}", unit, e)))?;

        let topic = self.topics.command_topic(unit);
        if !self.publisher.is_connected() {
            error!(unit = %unit, topic = %topic, "Bus not connected, command dropped");
            return Err(BusError::NotConnected.into());
        }

        let payload = Bytes::from(command.to_payload()?);
        let kind = command.type_name().unwrap_or("?");

        match self.publisher.publish(&topic, payload).await {
            Ok(()) => {
                info!(unit = %unit, kind = %kind, topic = %topic, "Command published");
                Ok(topic)
            }
            Err(e) => {
                error!(unit = %unit, kind = %kind, topic = %topic, error = %e, "Publish failed");
                Err(e.into())
            }
        }
    }
}
