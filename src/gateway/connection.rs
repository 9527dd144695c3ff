//! Backend connection handler
//!
//! Reads commands from one Backend, keeps the registry up to date and hands
//! every command to the router. Malformed input is logged and skipped; only
//! peer close, an I/O error or shutdown end the loop.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::command::{Command, Retention};
use crate::config::{Framing, ServerConfig};
use crate::error::GatewayError;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::router::CommandRouter;
use crate::topic::validate_unit_id;

/// Connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, no unit associated yet
    Created,
    /// Last retaining command named `unit`
    Associated { unit: String },
    /// Terminal
    Closed,
}

pub struct Connection<R> {
    reader: R,
    handle: Arc<ConnectionHandle>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<CommandRouter>,
    config: ServerConfig,
    state: ConnectionState,
    /// Partial line carried between reads (newline framing)
    pending: BytesMut,
}

impl<R> Connection<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: R,
        handle: Arc<ConnectionHandle>,
        registry: Arc<ConnectionRegistry>,
        router: Arc<CommandRouter>,
        config: ServerConfig,
    ) -> Self {
        Self {
            reader,
            handle,
            registry,
            router,
            config,
            state: ConnectionState::Created,
            pending: BytesMut::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Run until the peer closes, a read fails or `shutdown` turns true
    ///
    /// The connection's units are released and the socket closed on return.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        let result = loop {
            if *shutdown.borrow() {
                debug!(conn = self.id(), "Shutdown requested");
                break Ok(());
            }

            let read = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                read = timeout(self.config.read_timeout, self.reader.read(&mut buf)) => read,
            };

            match read {
                Err(_) => {
                    warn!(
                        conn = self.id(),
                        peer = %self.handle.peer(),
                        timeout = ?self.config.read_timeout,
                        "No data from Backend, still waiting"
                    );
                }
                Ok(Ok(0)) => {
                    debug!(conn = self.id(), peer = %self.handle.peer(), "Peer closed connection");
                    break Ok(());
                }
                Ok(Ok(n)) => self.on_data(&buf[..n]).await,
                Ok(Err(e)) => break Err(e),
            }
        };

        self.close().await;
        result
    }

    async fn on_data(&mut self, chunk: &[u8]) {
        match self.config.framing {
            Framing::Read => {
                match Command::from_chunk(chunk) {
                    Ok(commands) => {
                        for command in commands {
                            self.handle_command(command).await;
                        }
                    }
                    Err(e) => self.log_rejected(&e, chunk.len()),
                }
            }
            Framing::Newline => {
                self.pending.extend_from_slice(chunk);
                while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                    let line = self.pending.split_to(pos + 1);
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match Command::from_slice(&line) {
                        Ok(command) => self.handle_command(command).await,
                        Err(e) => self.log_rejected(&e, line.len()),
                    }
                }

                if self.pending.len() > self.config.read_buffer_size {
                    let e = GatewayError::Protocol("line exceeds read buffer size".to_string());
                    self.log_rejected(&e, self.pending.len());
                    self.pending.clear();
                }
            }
        }
    }

    /// Apply the command to the registry, then route it
    async fn handle_command(&mut self, command: Command) {
        match command.retention() {
            Retention::Associate(unit) if validate_unit_id(unit).is_err() => {
                debug!(conn = self.id(), unit = %unit, "Invalid unit id, connection not associated");
            }
            Retention::Associate(unit) => {
                match self.registry.associate(unit, self.handle.clone()) {
                    Some(previous) => info!(
                        unit = %unit,
                        conn = self.id(),
                        previous = previous.id(),
                        "Unit taken over from another connection"
                    ),
                    None => debug!(unit = %unit, conn = self.id(), "Unit associated"),
                }
                self.state = ConnectionState::Associated {
                    unit: unit.to_string(),
                };
            }
            Retention::MissingUnit => {
                warn!(
                    conn = self.id(),
                    kind = command.type_name().unwrap_or("?"),
                    "Retaining command without unit, connection not associated"
                );
            }
            Retention::None => {}
        }

        match self.router.route(&command).await {
            Ok(_) => {}
            Err(e @ GatewayError::Validation(_)) => {
                warn!(conn = self.id(), error = %e, "Command rejected");
            }
            // Publish failures are logged by the router
            Err(e) => debug!(conn = self.id(), error = %e, "Command not forwarded"),
        }
    }

    fn log_rejected(&self, e: &GatewayError, bytes: usize) {
        warn!(
            conn = self.id(),
            peer = %self.handle.peer(),
            bytes = bytes,
            error = %e,
            "Discarding malformed input"
        );
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }

        let released = self.registry.release_connection(self.id());
        if !released.is_empty() {
            info!(conn = self.id(), units = ?released, "Released units");
        }
        self.state = ConnectionState::Closed;
        self.handle.close().await;
    }
}
