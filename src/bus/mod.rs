//! Message bus connectivity
//!
//! A single MQTT client connection to the upstream broker. Inbound traffic is
//! surfaced as [`BusEvent`]s on one channel, consumed by [`BusEventLoop`].

mod client;
mod events;

pub use client::BusClient;
pub use events::{BusEventLoop, MessageCallback};

use std::fmt;

use bytes::Bytes;

/// Error type for bus operations
#[derive(Debug)]
pub enum BusError {
    /// No broker connection is currently established
    NotConnected,
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker refused the connection
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// The client task has stopped
    Stopped,
    /// Other error
    Other(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::NotConnected => write!(f, "Not connected to broker"),
            BusError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            BusError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            BusError::Timeout => write!(f, "Operation timed out"),
            BusError::Stopped => write!(f, "Bus client stopped"),
            BusError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BusError {}

/// Status of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    /// Not connected, will attempt to connect
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
    /// Client stopped; no further attempts
    Stopped,
}

/// Inbound transport notification
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// CONNACK accepted
    Connected,
    /// Connection lost or closed
    Disconnected { reason: String },
    /// PUBLISH received on a subscribed topic
    Message { topic: String, payload: Bytes },
}
