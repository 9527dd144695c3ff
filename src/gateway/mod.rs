//! Backend TCP gateway
//!
//! Accepts Backend connections and runs one handler task per connection.

mod connection;

pub use connection::{Connection, ConnectionState};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::error::{GatewayError, Result};
use crate::registry::{next_connection_id, ConnectionHandle, ConnectionRegistry};
use crate::router::CommandRouter;

pub struct GatewayServer {
    listener: TcpListener,
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<CommandRouter>,
    shutdown: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
}

impl GatewayServer {
    /// Bind the listening socket
    pub async fn bind(
        config: ServerConfig,
        registry: Arc<ConnectionRegistry>,
        router: Arc<CommandRouter>,
    ) -> Result<Self> {
        let listener = Self::listen(config.bind, config.backlog).map_err(|e| {
            GatewayError::Startup(format!("failed to bind {}: {}", config.bind, e))
        })?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            config,
            registry,
            router,
            shutdown,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(backlog)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Number of connections currently being handled
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run the accept loop until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        info!(
            addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            framing = %self.config.framing,
            "Gateway listening"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.handle_connection(stream, peer),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        info!("Gateway stopped accepting connections");
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = next_connection_id();
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let handle = Arc::new(ConnectionHandle::new(
            id,
            peer,
            self.config.framing,
            write_half,
        ));
        let mut conn = Connection::new(
            read_half,
            handle,
            self.registry.clone(),
            self.router.clone(),
            self.config.clone(),
        );

        let shutdown_rx = self.shutdown.subscribe();
        let active = self.active.clone();
        let count = active.fetch_add(1, Ordering::Relaxed) + 1;
        info!(conn = id, peer = %peer, active = count, "Backend connected");

        tokio::spawn(async move {
            if let Err(e) = conn.run(shutdown_rx).await {
                debug!(conn = id, peer = %peer, error = %e, "Connection error");
            }
            let count = active.fetch_sub(1, Ordering::Relaxed) - 1;
            info!(conn = id, peer = %peer, active = count, "Backend disconnected");
        });
    }
}
