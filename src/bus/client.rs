//! MQTT bus client
//!
//! Maintains the connection to the upstream broker. A single task owns the
//! socket; publishers talk to it over a command channel and inbound traffic
//! leaves it as [`BusEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::config::MqttConfig;
use crate::protocol::{
    Connect, Packet, PubAck, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Subscription,
};
use crate::router::Publisher;
use crate::topic::TopicScheme;

use super::{BusError, BusEvent, BusStatus};

type Ack = oneshot::Sender<Result<(), BusError>>;

/// Message to send to the bus client task
#[derive(Debug)]
enum BusCommand {
    /// Publish a message; `ack` resolves once the broker side accepted it
    Publish {
        topic: String,
        payload: Bytes,
        ack: Ack,
    },
    /// Disconnect and end the task
    Stop,
}

/// Client for the upstream broker
///
/// Created with [`BusClient::new`] and started with [`BusClient::spawn`].
pub struct BusClient {
    config: MqttConfig,
    topics: TopicScheme,
    client_id: String,
    status: watch::Sender<BusStatus>,
    command_tx: mpsc::Sender<BusCommand>,
    command_rx: Option<mpsc::Receiver<BusCommand>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    pub fn new(config: MqttConfig, topics: TopicScheme) -> Self {
        let (command_tx, command_rx) = mpsc::channel(1000);
        let (status, _) = watch::channel(BusStatus::Disconnected);
        let client_id = config.client_id();

        Self {
            config,
            topics,
            client_id,
            status,
            command_tx,
            command_rx: Some(command_rx),
            task: Mutex::new(None),
        }
    }

    /// Spawn the connection task; inbound traffic is sent to `events`
    pub fn spawn(mut self, events: mpsc::Sender<BusEvent>) -> Arc<Self> {
        if let Some(command_rx) = self.command_rx.take() {
            let ctx = LoopContext {
                config: self.config.clone(),
                topics: self.topics.clone(),
                client_id: self.client_id.clone(),
                status: self.status.clone(),
                events,
            };
            let handle = tokio::spawn(async move {
                Self::connection_loop(ctx, command_rx).await;
            });
            *self.task.lock() = Some(handle);
        }

        Arc::new(self)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn status(&self) -> BusStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == BusStatus::Connected
    }

    /// Wait until the broker connection is established
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), BusError> {
        let mut rx = self.status.subscribe();
        let settled = async {
            rx.wait_for(|s| matches!(s, BusStatus::Connected | BusStatus::Stopped))
                .await
                .map(|status| *status)
        };
        let outcome = timeout(limit, settled).await;
        match outcome {
            Ok(Ok(BusStatus::Connected)) => Ok(()),
            Ok(_) => Err(BusError::Stopped),
            Err(_) => Err(BusError::Timeout),
        }
    }

    /// Send DISCONNECT and wait for the connection task to end
    pub async fn stop(&self) {
        let _ = self.command_tx.send(BusCommand::Stop).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.status.send_replace(BusStatus::Stopped);
        info!(client_id = %self.client_id, "Bus client stopped");
    }

    /// Run the connection loop
    async fn connection_loop(ctx: LoopContext, mut command_rx: mpsc::Receiver<BusCommand>) {
        let mut retry_interval = ctx.config.reconnect_interval;
        let max_retry = ctx.config.max_reconnect_interval;

        loop {
            if Self::fail_queued(&mut command_rx) {
                break;
            }

            ctx.status.send_replace(BusStatus::Connecting);
            debug!(address = %ctx.config.address, "Connecting to broker");

            match Self::connect_and_run(&ctx, &mut command_rx).await {
                Ok(()) => {
                    info!(address = %ctx.config.address, "Disconnected from broker");
                    break;
                }
                Err(e) => {
                    let was_connected = *ctx.status.borrow() == BusStatus::Connected;
                    ctx.status.send_replace(BusStatus::Backoff);

                    if was_connected {
                        warn!(address = %ctx.config.address, error = %e, "Broker connection lost");
                        let _ = ctx
                            .events
                            .send(BusEvent::Disconnected {
                                reason: e.to_string(),
                            })
                            .await;
                        retry_interval = ctx.config.reconnect_interval;
                    } else {
                        error!(address = %ctx.config.address, error = %e, "Broker connection failed");
                    }

                    debug!("Reconnecting in {:?}", retry_interval);
                    if Self::backoff(retry_interval, &mut command_rx).await {
                        break;
                    }
                    retry_interval = std::cmp::min(retry_interval * 2, max_retry);
                }
            }
        }

        ctx.status.send_replace(BusStatus::Stopped);
    }

    /// Reject publishes queued while no connection was up
    ///
    /// Returns true when a stop was requested.
    fn fail_queued(command_rx: &mut mpsc::Receiver<BusCommand>) -> bool {
        loop {
            match command_rx.try_recv() {
                Ok(BusCommand::Publish { ack, .. }) => {
                    let _ = ack.send(Err(BusError::NotConnected));
                }
                Ok(BusCommand::Stop) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    return true;
                }
                Err(mpsc::error::TryRecvError::Empty) => return false,
            }
        }
    }

    /// Sleep before the next attempt, failing publishes that arrive meanwhile
    ///
    /// Returns true when a stop was requested.
    async fn backoff(delay: Duration, command_rx: &mut mpsc::Receiver<BusCommand>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                cmd = command_rx.recv() => match cmd {
                    Some(BusCommand::Publish { ack, .. }) => {
                        let _ = ack.send(Err(BusError::NotConnected));
                    }
                    Some(BusCommand::Stop) | None => return true,
                },
            }
        }
    }

    /// Connect to the broker and run the message loop
    ///
    /// `Ok` means a stop was requested; any error leads to a reconnect.
    async fn connect_and_run(
        ctx: &LoopContext,
        command_rx: &mut mpsc::Receiver<BusCommand>,
    ) -> Result<(), BusError> {
        let config = &ctx.config;
        let (host, port) = config.parse_address();

        let stream = timeout(
            config.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| BusError::Timeout)?
        .map_err(|e| BusError::ConnectionLost(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        debug!(address = %config.address, "TCP connected");

        let (read_half, write_half) = stream.into_split();
        let mut reader = PacketReader::new(read_half, config.max_packet_size);
        let mut writer = PacketWriter::new(write_half);

        let connect = Packet::Connect(Box::new(Connect {
            client_id: ctx.client_id.clone(),
            clean_session: true,
            keep_alive: config.keepalive,
            username: config.username.clone(),
            password: config.password.as_ref().map(|p| Bytes::from(p.clone())),
        }));
        writer.send(&connect).await?;

        let packet = timeout(config.connect_timeout, reader.recv())
            .await
            .map_err(|_| BusError::Timeout)??;

        match packet {
            Packet::ConnAck(connack) => {
                if !connack.return_code.is_accepted() {
                    return Err(BusError::Rejected(format!(
                        "CONNACK refused: {}",
                        connack.return_code
                    )));
                }
                info!(
                    address = %config.address,
                    client_id = %ctx.client_id,
                    "Connected to broker"
                );
            }
            other => {
                return Err(BusError::Other(format!(
                    "Expected CONNACK, got packet type {}",
                    other.packet_type()
                )));
            }
        }

        ctx.status.send_replace(BusStatus::Connected);
        let _ = ctx.events.send(BusEvent::Connected).await;

        let qos = config.qos();
        let mut packet_ids = PacketIds::default();
        let mut pending: HashMap<u16, Ack> = HashMap::new();

        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: packet_ids.next(&mut pending).unwrap_or(1),
            subscriptions: vec![
                Subscription {
                    filter: ctx.topics.reply_filter().to_string(),
                    qos,
                },
                Subscription {
                    filter: ctx.topics.presence_filter().to_string(),
                    qos,
                },
            ],
        });
        writer.send(&subscribe).await?;
        debug!(
            reply = ctx.topics.reply_filter(),
            presence = ctx.topics.presence_filter(),
            "SUBSCRIBE sent"
        );

        let keepalive = config.keepalive_duration();
        let mut keepalive_timer =
            tokio::time::interval(keepalive.unwrap_or(Duration::from_secs(60)));
        keepalive_timer.reset();
        let mut awaiting_pingresp = false;

        let result = loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(BusCommand::Publish { topic, payload, ack }) => {
                            let packet_id = match qos {
                                QoS::AtMostOnce => None,
                                _ => match packet_ids.next(&mut pending) {
                                    Some(id) => Some(id),
                                    None => {
                                        warn!(in_flight = pending.len(), "No free packet identifier");
                                        let _ = ack.send(Err(BusError::Other(
                                            "no free packet identifier".to_string(),
                                        )));
                                        continue;
                                    }
                                },
                            };

                            let publish = Packet::Publish(Publish {
                                dup: false,
                                qos,
                                retain: false,
                                topic,
                                packet_id,
                                payload,
                            });

                            if let Err(e) = writer.send(&publish).await {
                                let _ = ack.send(Err(BusError::ConnectionLost(e.to_string())));
                                break Err(e);
                            }

                            match packet_id {
                                Some(id) => {
                                    pending.insert(id, ack);
                                }
                                None => {
                                    let _ = ack.send(Ok(()));
                                }
                            }
                        }
                        Some(BusCommand::Stop) | None => {
                            let _ = writer.send(&Packet::Disconnect).await;
                            break Ok(());
                        }
                    }
                }

                packet = reader.recv() => {
                    let packet = match packet {
                        Ok(packet) => packet,
                        Err(e) => break Err(e),
                    };
                    awaiting_pingresp = false;

                    match packet {
                        Packet::Publish(publish) => {
                            if publish.qos == QoS::AtLeastOnce {
                                if let Some(packet_id) = publish.packet_id {
                                    let puback = Packet::PubAck(PubAck::new(packet_id));
                                    if let Err(e) = writer.send(&puback).await {
                                        break Err(e);
                                    }
                                }
                            }
                            let _ = ctx
                                .events
                                .send(BusEvent::Message {
                                    topic: publish.topic,
                                    payload: publish.payload,
                                })
                                .await;
                        }
                        Packet::PubAck(puback) => match pending.remove(&puback.packet_id) {
                            Some(ack) => {
                                let _ = ack.send(Ok(()));
                            }
                            None => debug!(packet_id = puback.packet_id, "Unexpected PUBACK"),
                        },
                        Packet::SubAck(suback) => log_suback(&suback),
                        Packet::PingResp => {
                            debug!("PINGRESP received");
                        }
                        Packet::Disconnect => {
                            break Err(BusError::ConnectionLost("Broker sent DISCONNECT".to_string()));
                        }
                        other => {
                            debug!(packet_type = other.packet_type(), "Ignoring unexpected packet");
                        }
                    }
                }

                _ = keepalive_timer.tick(), if keepalive.is_some() => {
                    if awaiting_pingresp {
                        break Err(BusError::ConnectionLost("Keepalive timeout".to_string()));
                    }
                    if let Err(e) = writer.send(&Packet::PingReq).await {
                        break Err(e);
                    }
                    awaiting_pingresp = true;
                }
            }
        };

        for (_, ack) in pending.drain() {
            let _ = ack.send(Err(BusError::ConnectionLost(
                "Connection closed before PUBACK".to_string(),
            )));
        }

        result
    }
}

#[async_trait]
impl Publisher for BusClient {
    /// Fails immediately when disconnected; otherwise resolves on socket
    /// write (QoS 0) or PUBACK (QoS 1).
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }

        let (ack, ack_rx) = oneshot::channel();
        self.command_tx
            .send(BusCommand::Publish {
                topic: topic.to_string(),
                payload,
                ack,
            })
            .await
            .map_err(|_| BusError::Stopped)?;

        match timeout(self.config.connect_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::ConnectionLost("Publish abandoned".to_string())),
            Err(_) => Err(BusError::Timeout),
        }
    }

    fn is_connected(&self) -> bool {
        BusClient::is_connected(self)
    }
}

/// State handed to the connection task
struct LoopContext {
    config: MqttConfig,
    topics: TopicScheme,
    client_id: String,
    status: watch::Sender<BusStatus>,
    events: mpsc::Sender<BusEvent>,
}

/// Packet identifier allocator
///
/// Skips 0 and ids still awaiting PUBACK. Entries whose publisher gave up
/// waiting are reclaimed before a new id is handed out.
#[derive(Debug)]
struct PacketIds {
    next: u16,
}

impl Default for PacketIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl PacketIds {
    /// `None` when every identifier is held by a live publisher
    fn next(&mut self, in_flight: &mut HashMap<u16, Ack>) -> Option<u16> {
        in_flight.retain(|_, ack| !ack.is_closed());

        for _ in 0..u16::MAX {
            let id = self.next;
            self.next = self.next.wrapping_add(1).max(1);
            if !in_flight.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }
}

fn log_suback(suback: &SubAck) {
    for code in &suback.return_codes {
        if *code == SubscribeReturnCode::Failure {
            warn!(packet_id = suback.packet_id, "Broker refused a subscription");
            return;
        }
    }
    debug!(packet_id = suback.packet_id, "SUBACK received");
}

/// Read half with a reassembly buffer
struct PacketReader<R> {
    reader: R,
    decoder: Decoder,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    fn new(reader: R, max_packet_size: usize) -> Self {
        Self {
            reader,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Next complete packet; cancel safe
    async fn recv(&mut self) -> Result<Packet, BusError> {
        loop {
            match self.decoder.decode(&self.buf) {
                Ok(Some((packet, consumed))) => {
                    self.buf.advance(consumed);
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(e) => return Err(BusError::Other(format!("Decode error: {}", e))),
            }

            let n = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| BusError::ConnectionLost(e.to_string()))?;
            if n == 0 {
                return Err(BusError::ConnectionLost("Connection closed".to_string()));
            }
        }
    }
}

/// Write half with a reusable encode buffer
struct PacketWriter<W> {
    writer: W,
    encoder: Encoder,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            writer,
            encoder: Encoder::new(),
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), BusError> {
        self.buf.clear();
        self.encoder
            .encode(packet, &mut self.buf)
            .map_err(|e| BusError::Other(format!("Encode error: {}", e)))?;
        self.writer
            .write_all(&self.buf)
            .await
            .map_err(|e| BusError::ConnectionLost(e.to_string()))
    }
}
