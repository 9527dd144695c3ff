//! End-to-end tests for the unit gateway
//!
//! Each test runs the full service on an ephemeral port against an in-process
//! MQTT broker built on the crate's own codec, and talks to it with plain TCP
//! Backend connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use unitgate::codec::{Decoder, Encoder};
use unitgate::config::{Config, Framing};
use unitgate::protocol::{
    ConnAck, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck, SubscribeReturnCode,
};
use unitgate::{BusError, GatewayError, Publisher, Service};

const UNIT: &str = "MS500-H120-EP-zlcu-0059";

// =============================================================================
// Fake broker
// =============================================================================

enum SessionCmd {
    Send(Packet),
    Close,
}

#[derive(Default)]
struct BrokerState {
    connects: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<Publish>>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<SessionCmd>>>,
}

struct FakeBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(run_session(stream, accept_state.clone()));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    /// Deliver a QoS 0 PUBLISH to every connected client
    fn publish(&self, topic: &str, payload: &'static [u8]) {
        let packet = Packet::Publish(Publish {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload),
            ..Default::default()
        });
        for session in self.state.sessions.lock().iter() {
            let _ = session.send(SessionCmd::Send(packet.clone()));
        }
    }

    /// Close every client connection; new connections are still accepted
    fn drop_sessions(&self) {
        for session in self.state.sessions.lock().drain(..) {
            let _ = session.send(SessionCmd::Close);
        }
    }

    /// Stop listening and close every client connection
    fn stop(&self) {
        self.accept_task.abort();
        self.drop_sessions();
    }

    fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state
            .published
            .lock()
            .iter()
            .map(|p| (p.topic.clone(), p.payload.to_vec()))
            .collect()
    }

    async fn wait_until(&self, what: &str, check: impl Fn(&BrokerState) -> bool) {
        for _ in 0..300 {
            if check(&self.state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn wait_published(&self, count: usize) {
        self.wait_until("published commands", |s| s.published.lock().len() >= count)
            .await;
    }

    async fn wait_subscribed(&self) {
        self.wait_until("subscriptions", |s| s.subscriptions.lock().len() >= 2)
            .await;
    }
}

async fn run_session(stream: TcpStream, state: Arc<BrokerState>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.sessions.lock().push(tx);

    let (mut reader, mut writer) = stream.into_split();
    let decoder = Decoder::new();
    let mut buf = BytesMut::new();

    loop {
        loop {
            let packet = match decoder.decode(&buf) {
                Ok(Some((packet, consumed))) => {
                    buf.advance(consumed);
                    packet
                }
                _ => break,
            };
            if !handle_packet(packet, &state, &mut writer).await {
                return;
            }
        }

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(SessionCmd::Send(packet)) => send(&mut writer, &packet).await,
                Some(SessionCmd::Close) | None => return,
            },
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
        }
    }
}

async fn handle_packet(packet: Packet, state: &BrokerState, writer: &mut OwnedWriteHalf) -> bool {
    match packet {
        Packet::Connect(connect) => {
            state.connects.lock().push(connect.client_id.clone());
            let connack = Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::Accepted,
            });
            send(writer, &connack).await;
        }
        Packet::Subscribe(subscribe) => {
            let return_codes = subscribe
                .subscriptions
                .iter()
                .map(|s| SubscribeReturnCode::Granted(s.qos))
                .collect();
            state
                .subscriptions
                .lock()
                .extend(subscribe.subscriptions.iter().map(|s| s.filter.clone()));
            let suback = Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                return_codes,
            });
            send(writer, &suback).await;
        }
        Packet::Publish(publish) => {
            let packet_id = publish.packet_id;
            state.published.lock().push(publish);
            if let Some(packet_id) = packet_id {
                send(writer, &Packet::PubAck(PubAck::new(packet_id))).await;
            }
        }
        Packet::PingReq => send(writer, &Packet::PingResp).await,
        Packet::Disconnect => return false,
        _ => {}
    }
    true
}

async fn send(writer: &mut OwnedWriteHalf, packet: &Packet) {
    let mut buf = BytesMut::new();
    Encoder::new()
        .encode(packet, &mut buf)
        .expect("Failed to encode");
    let _ = writer.write_all(&buf).await;
}

// =============================================================================
// Helpers
// =============================================================================

fn test_config(broker: SocketAddr) -> Config {
    let mut config = Config::default();
    config.server.bind = SocketAddr::from(([127, 0, 0, 1], 0));
    config.mqtt.address = broker.to_string();
    config.mqtt.startup_timeout = Duration::from_secs(2);
    config.mqtt.connect_timeout = Duration::from_secs(2);
    config.mqtt.reconnect_interval = Duration::from_millis(50);
    config.mqtt.max_reconnect_interval = Duration::from_millis(200);
    config
}

async fn start(broker: &FakeBroker, config: Config) -> Service {
    let service = Service::start(&config).await.expect("service start");
    broker.wait_subscribed().await;
    service
}

async fn backend(service: &Service) -> TcpStream {
    TcpStream::connect(service.local_addr().unwrap())
        .await
        .expect("Failed to connect backend")
}

/// Read whatever arrives within `limit`
async fn read_reply(stream: &mut TcpStream, limit: Duration) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    match timeout(limit, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => Some(buf[..n].to_vec()),
        _ => None,
    }
}

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

// =============================================================================
// Command path
// =============================================================================

#[tokio::test]
async fn test_scs_command_published_and_unit_registered() {
    let broker = FakeBroker::start().await;
    let service = start(&broker, test_config(broker.addr)).await;

    assert_eq!(
        *broker.state.subscriptions.lock(),
        vec!["/device/ms500/+/socket_reply", "/device/ms500/+/online"]
    );
    assert!(broker.state.connects.lock()[0].starts_with("ms500_server_"));

    let mut backend = backend(&service).await;
    let raw = br#"{"type":"SCS","unit":"MS500-H120-EP-zlcu-0059","camera":"2622"}"#;
    backend.write_all(raw).await.unwrap();
    broker.wait_published(1).await;

    assert_eq!(
        broker.published(),
        vec![(
            "/service/ms500/MS500-H120-EP-zlcu-0059/socket".to_string(),
            raw.to_vec()
        )]
    );
    assert!(service.registry().lookup(UNIT).is_some());

    service.shutdown().await;
    broker.stop();
}

#[tokio::test]
async fn test_non_retaining_command_leaves_registry_untouched() {
    let broker = FakeBroker::start().await;
    let service = start(&broker, test_config(broker.addr)).await;

    let mut backend = backend(&service).await;
    backend
        .write_all(br#"{"type":"AIM","unit":"U7","extra":[1,{"k":"v"}]}"#)
        .await
        .unwrap();
    broker.wait_published(1).await;

    assert_eq!(
        broker.published(),
        vec![(
            "/service/ms500/U7/socket".to_string(),
            br#"{"type":"AIM","unit":"U7","extra":[1,{"k":"v"}]}"#.to_vec()
        )]
    );
    assert!(service.registry().is_empty());

    service.shutdown().await;
    broker.stop();
}

#[tokio::test]
async fn test_missing_unit_rejected_before_publish() {
    let broker = FakeBroker::start().await;
    let service = start(&broker, test_config(broker.addr)).await;

    let mut backend = backend(&service).await;
    backend.write_all(br#"{"type":"FMW"}"#).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    backend
        .write_all(br#"{"type":"FMW","unit":"U1"}"#)
        .await
        .unwrap();
    broker.wait_published(1).await;

    let topics: Vec<String> = broker.published().into_iter().map(|(t, _)| t).collect();
    assert_eq!(topics, vec!["/service/ms500/U1/socket"]);

    service.shutdown().await;
    broker.stop();
}

#[tokio::test]
async fn test_malformed_input_keeps_connection_open() {
    let broker = FakeBroker::start().await;
    let service = start(&broker, test_config(broker.addr)).await;

    let mut backend = backend(&service).await;
    backend.write_all(b"{broken").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    backend
        .write_all(br#"{"type":"SCS","unit":"U1"}"#)
        .await
        .unwrap();
    broker.wait_published(1).await;
    assert!(service.registry().lookup("U1").is_some());

    service.shutdown().await;
    broker.stop();
}

#[tokio::test]
async fn test_qos1_publish_waits_for_puback() {
    let broker = FakeBroker::start().await;
    let mut config = test_config(broker.addr);
    config.mqtt.qos = 1;
    let service = start(&broker, config).await;

    service
        .bus()
        .publish("/service/ms500/U1/socket", Bytes::from_static(b"{}"))
        .await
        .unwrap();

    let published = broker.state.published.lock().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].qos, QoS::AtLeastOnce);
    assert!(published[0].packet_id.is_some());

    service.shutdown().await;
    broker.stop();
}

// =============================================================================
// Reply path
// =============================================================================

#[tokio::test]
async fn test_reply_round_trip_is_byte_exact() {
    let broker = FakeBroker::start().await;
    let service = start(&broker, test_config(broker.addr)).await;

    let mut backend = backend(&service).await;
    backend
        .write_all(br#"{"type":"SCS","unit":"MS500-H120-EP-zlcu-0059","camera":"2622"}"#)
        .await
        .unwrap();
    broker.wait_published(1).await;

    broker.publish(
        "/device/ms500/MS500-H120-EP-zlcu-0059/socket_reply",
        b"{\"ok\":true}",
    );
    let reply = read_reply(&mut backend, Duration::from_secs(2)).await;
    assert_eq!(reply, Some(b"{\"ok\":true}".to_vec()));

    service.shutdown().await;
    broker.stop();
}

#[tokio::test]
async fn test_reply_for_unknown_unit_is_dropped() {
    let broker = FakeBroker::start().await;
    let service = start(&broker, test_config(broker.addr)).await;

    let mut backend = backend(&service).await;
    backend
        .write_all(br#"{"type":"SCS","unit":"U1"}"#)
        .await
        .unwrap();
    broker.wait_published(1).await;

    broker.publish("/device/ms500/UNKNOWN/socket_reply", b"{\"lost\":1}");
    assert_eq!(
        read_reply(&mut backend, Duration::from_millis(200)).await,
        None
    );

    // The gateway keeps serving afterwards
    broker.publish("/device/ms500/U1/socket_reply", b"{\"ok\":1}");
    assert_eq!(
        read_reply(&mut backend, Duration::from_secs(2)).await,
        Some(b"{\"ok\":1}".to_vec())
    );

    service.shutdown().await;
    broker.stop();
}

#[tokio::test]
async fn test_last_writer_wins() {
    let broker = FakeBroker::start().await;
    let service = start(&broker, test_config(broker.addr)).await;

    let mut first = backend(&service).await;
    let mut second = backend(&service).await;

    first
        .write_all(br#"{"type":"SCS","unit":"U1"}"#)
        .await
        .unwrap();
    broker.wait_published(1).await;
    second
        .write_all(br#"{"type":"UDS","unit":"U1"}"#)
        .await
        .unwrap();
    broker.wait_published(2).await;

    broker.publish("/device/ms500/U1/socket_reply", b"{\"to\":\"second\"}");
    assert_eq!(
        read_reply(&mut second, Duration::from_secs(2)).await,
        Some(b"{\"to\":\"second\"}".to_vec())
    );
    assert_eq!(
        read_reply(&mut first, Duration::from_millis(200)).await,
        None
    );

    service.shutdown().await;
    broker.stop();
}

#[tokio::test]
async fn test_close_releases_unit() {
    let broker = FakeBroker::start().await;
    let service = start(&broker, test_config(broker.addr)).await;

    let mut backend = backend(&service).await;
    backend
        .write_all(br#"{"type":"SCS","unit":"U1"}"#)
        .await
        .unwrap();
    broker.wait_published(1).await;
    assert!(service.registry().lookup("U1").is_some());

    drop(backend);
    let registry = service.registry().clone();
    wait_for("unit release", || registry.lookup("U1").is_none()).await;

    service.shutdown().await;
    broker.stop();
}

#[tokio::test]
async fn test_newline_framing_terminates_replies() {
    let broker = FakeBroker::start().await;
    let mut config = test_config(broker.addr);
    config.server.framing = Framing::Newline;
    let service = start(&broker, config).await;

    let mut backend = backend(&service).await;
    backend
        .write_all(b"{\"type\":\"SCS\",\"unit\":\"U1\"}\n{\"type\":\"CTS\",\"unit\":\"U2\"}\n")
        .await
        .unwrap();
    broker.wait_published(2).await;

    broker.publish("/device/ms500/U1/socket_reply", b"{\"ok\":true}");
    assert_eq!(
        read_reply(&mut backend, Duration::from_secs(2)).await,
        Some(b"{\"ok\":true}\n".to_vec())
    );

    service.shutdown().await;
    broker.stop();
}

#[tokio::test]
async fn test_presence_messages_reach_generic_callback() {
    let broker = FakeBroker::start().await;
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let service = Service::start_with_callback(
        &test_config(broker.addr),
        Some(Arc::new(move |topic: &str, _payload: &[u8]| {
            sink.lock().push(topic.to_string());
        })),
    )
    .await
    .unwrap();
    broker.wait_subscribed().await;

    broker.publish("/device/ms500/U1/online", b"{\"device_id\":\"U1\"}");
    wait_for("presence callback", || !seen.lock().is_empty()).await;
    assert_eq!(*seen.lock(), vec!["/device/ms500/U1/online"]);

    service.shutdown().await;
    broker.stop();
}

// =============================================================================
// Broker connectivity
// =============================================================================

#[tokio::test]
async fn test_startup_fails_without_broker() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = test_config(addr);
    config.mqtt.startup_timeout = Duration::from_millis(200);

    match Service::start(&config).await {
        Err(GatewayError::Startup(_)) => {}
        Err(other) => panic!("expected startup error, got {}", other),
        Ok(_) => panic!("expected startup error, got a running service"),
    }
}

#[tokio::test]
async fn test_publish_fails_while_disconnected() {
    let broker = FakeBroker::start().await;
    let service = start(&broker, test_config(broker.addr)).await;
    let mut backend = backend(&service).await;

    broker.stop();
    let bus = service.bus().clone();
    wait_for("bus disconnect", || !bus.is_connected()).await;

    let err = bus
        .publish("/service/ms500/U1/socket", Bytes::from_static(b"{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NotConnected));

    // Commands are dropped, not queued, and the Backend stays connected
    backend
        .write_all(br#"{"type":"SCS","unit":"U1"}"#)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.published().is_empty());
    assert!(service.registry().lookup("U1").is_some());

    service.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_broker_drop() {
    let broker = FakeBroker::start().await;
    let service = start(&broker, test_config(broker.addr)).await;

    broker.drop_sessions();
    broker
        .wait_until("reconnect", |s| s.connects.lock().len() >= 2)
        .await;
    broker
        .wait_until("resubscribe", |s| s.subscriptions.lock().len() >= 4)
        .await;
    let bus = service.bus().clone();
    wait_for("bus reconnect", || bus.is_connected()).await;

    let mut backend = backend(&service).await;
    backend
        .write_all(br#"{"type":"SCS","unit":"U1"}"#)
        .await
        .unwrap();
    broker.wait_published(1).await;

    broker.publish("/device/ms500/U1/socket_reply", b"{\"again\":true}");
    assert_eq!(
        read_reply(&mut backend, Duration::from_secs(2)).await,
        Some(b"{\"again\":true}".to_vec())
    );

    service.shutdown().await;
    broker.stop();
}
