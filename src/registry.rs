//! Connection registry
//!
//! Maps a unit id to the Backend connection that most recently sent a
//! retaining command for it. Shared by every connection task and the reply
//! dispatcher; each operation is a single critical section.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::Framing;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Write side of one Backend connection
///
/// Replies for different units may target the same connection concurrently;
/// the async mutex keeps each reply contiguous on the wire.
pub struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    framing: Framing,
    writer: tokio::sync::Mutex<BoxedWriter>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    pub fn new<W>(id: u64, peer: SocketAddr, framing: Framing, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer,
            framing,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write a reply payload verbatim
    ///
    /// With newline framing a trailing `\n` is added unless already present.
    pub async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        if self.is_closed() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await?;
        if self.framing == Framing::Newline && !payload.ends_with(b"\n") {
            writer.write_all(b"\n").await?;
        }
        writer.flush().await
    }

    /// Mark closed and shut down the write side
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("framing", &self.framing)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Unit id to connection map
#[derive(Default)]
pub struct ConnectionRegistry {
    units: Mutex<HashMap<String, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `conn` as the owner of `unit`, replacing any previous owner
    ///
    /// Returns the replaced connection when it was a different one.
    pub fn associate(
        &self,
        unit: &str,
        conn: Arc<ConnectionHandle>,
    ) -> Option<Arc<ConnectionHandle>> {
        let conn_id = conn.id();
        self.units
            .lock()
            .insert(unit.to_string(), conn)
            .filter(|prev| prev.id() != conn_id)
    }

    pub fn lookup(&self, unit: &str) -> Option<Arc<ConnectionHandle>> {
        self.units.lock().get(unit).cloned()
    }

    /// Remove `unit` only if it is still owned by connection `conn_id`
    pub fn release(&self, unit: &str, conn_id: u64) -> bool {
        let mut units = self.units.lock();
        match units.get(unit) {
            Some(owner) if owner.id() == conn_id => {
                units.remove(unit);
                true
            }
            _ => false,
        }
    }

    /// Remove every unit still owned by connection `conn_id`
    pub fn release_connection(&self, conn_id: u64) -> Vec<String> {
        let mut released = Vec::new();
        self.units.lock().retain(|unit, owner| {
            if owner.id() == conn_id {
                released.push(unit.clone());
                false
            } else {
                true
            }
        });
        released.sort();
        released
    }

    /// Currently associated unit ids, sorted
    pub fn units(&self) -> Vec<String> {
        let mut units: Vec<String> = self.units.lock().keys().cloned().collect();
        units.sort();
        units
    }

    pub fn len(&self) -> usize {
        self.units.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.lock().is_empty()
    }
}
