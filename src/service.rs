//! Service wiring
//!
//! Starts the components in order: bus client and event loop, wait for the
//! broker, then the Backend listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::{BusClient, BusEventLoop, MessageCallback};
use crate::config::Config;
use crate::dispatcher::ReplyDispatcher;
use crate::error::{GatewayError, Result};
use crate::gateway::GatewayServer;
use crate::registry::ConnectionRegistry;
use crate::router::CommandRouter;
use crate::topic::TopicScheme;

/// Capacity of the bus event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A running gateway
pub struct Service {
    bus: Arc<BusClient>,
    gateway: Arc<GatewayServer>,
    registry: Arc<ConnectionRegistry>,
    gateway_task: JoinHandle<()>,
    events_task: JoinHandle<()>,
}

impl Service {
    /// Start with the presence logger handling non-reply messages
    pub async fn start(config: &Config) -> Result<Self> {
        Self::start_with_callback(config, None).await
    }

    /// Start, optionally replacing the generic message callback
    pub async fn start_with_callback(
        config: &Config,
        on_generic_message: Option<MessageCallback>,
    ) -> Result<Self> {
        let topics = TopicScheme::from_config(&config.topics);
        let registry = Arc::new(ConnectionRegistry::new());

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let bus = BusClient::new(config.mqtt.clone(), topics.clone()).spawn(events_tx);

        let dispatcher = Arc::new(ReplyDispatcher::new(registry.clone()));
        let mut event_loop = BusEventLoop::new(topics.clone(), dispatcher);
        if let Some(callback) = on_generic_message {
            event_loop = event_loop.with_generic_callback(callback);
        }
        let events_task = event_loop.spawn(events_rx);

        info!(
            broker = %config.mqtt.address,
            client_id = %bus.client_id(),
            timeout = ?config.mqtt.startup_timeout,
            "Waiting for broker connection"
        );
        if let Err(e) = bus.wait_connected(config.mqtt.startup_timeout).await {
            bus.stop().await;
            let _ = events_task.await;
            return Err(GatewayError::Startup(format!(
                "broker {} not connected: {}",
                config.mqtt.address, e
            )));
        }

        let router = Arc::new(CommandRouter::new(topics, bus.clone()));
        let gateway =
            match GatewayServer::bind(config.server.clone(), registry.clone(), router).await {
                Ok(gateway) => Arc::new(gateway),
                Err(e) => {
                    bus.stop().await;
                    let _ = events_task.await;
                    return Err(e);
                }
            };

        let server = gateway.clone();
        let gateway_task = tokio::spawn(async move { server.run().await });

        Ok(Self {
            bus,
            gateway,
            registry,
            gateway_task,
            events_task,
        })
    }

    /// Address the Backend listener is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.gateway.local_addr()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<BusClient> {
        &self.bus
    }

    /// Close the listener and every connection, then disconnect from the broker
    pub async fn shutdown(self) {
        self.gateway.shutdown();
        let _ = self.gateway_task.await;
        debug!(
            active = self.gateway.active_connections(),
            "Listener closed, connections draining"
        );
        self.bus.stop().await;
        let _ = self.events_task.await;
        info!("Gateway shut down");
    }
}
