//! Gateway error taxonomy
//!
//! Every per-message failure is one of these and is contained by the caller
//! (logged, reported as failure). Only `Startup` ends the process.

use std::fmt;

use crate::bus::BusError;

/// Errors raised while moving commands and replies through the gateway
#[derive(Debug)]
pub enum GatewayError {
    /// A field required for routing is missing or unusable
    Validation(String),
    /// Bytes from a Backend are not a JSON object in UTF-8
    Protocol(String),
    /// The bus is disconnected, did not acknowledge, or a socket write failed
    Transport(String),
    /// A reply arrived for a unit with no current association
    Lookup {
        unit: String,
        known_units: Vec<String>,
    },
    /// Listener bind or initial broker connection failed
    Startup(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Validation(msg) => write!(f, "Validation error: {}", msg),
            GatewayError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            GatewayError::Transport(msg) => write!(f, "Transport error: {}", msg),
            GatewayError::Lookup { unit, known_units } => write!(
                f,
                "No connection registered for unit '{}' (known units: {:?})",
                unit, known_units
            ),
            GatewayError::Startup(msg) => write!(f, "Startup error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<BusError> for GatewayError {
    fn from(e: BusError) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Protocol(e.to_string())
    }
}

impl From<std::str::Utf8Error> for GatewayError {
    fn from(e: std::str::Utf8Error) -> Self {
        GatewayError::Protocol(format!("invalid UTF-8: {}", e))
    }
}

/// Result alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
