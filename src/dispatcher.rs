//! Reply dispatch
//!
//! Delivers a device reply to the Backend connection that currently owns the
//! unit. Undeliverable replies are logged and dropped.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{GatewayError, Result};
use crate::registry::ConnectionRegistry;

pub struct ReplyDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl ReplyDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Write `payload` verbatim to the connection owning `unit`
    pub async fn dispatch(&self, unit: &str, payload: &[u8]) -> Result<()> {
        let conn = match self.registry.lookup(unit) {
            Some(conn) => conn,
            None => {
                let err = GatewayError::Lookup {
                    unit: unit.to_string(),
                    known_units: self.registry.units(),
                };
                warn!(unit = %unit, "{}", err);
                return Err(err);
            }
        };

        if let Err(e) = conn.send(payload).await {
            error!(
                unit = %unit,
                conn = conn.id(),
                peer = %conn.peer(),
                error = %e,
                "Failed to deliver reply"
            );
            return Err(GatewayError::Transport(e.to_string()));
        }

        debug!(
            unit = %unit,
            conn = conn.id(),
            peer = %conn.peer(),
            bytes = payload.len(),
            "Reply delivered"
        );
        Ok(())
    }
}
