//! MQTT v3.1.1 codec tests

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{read_variable_int, write_variable_int, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, Publish, QoS, SubAck,
    Subscribe, SubscribeReturnCode, Subscription,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

// ============================================================================
// Variable byte integer
// ============================================================================

#[test]
fn test_variable_int_boundaries() {
    let test_cases: [(u32, &[u8]); 4] = [
        (0, &[0x00]),
        (127, &[0x7F]),
        (128, &[0x80, 0x01]),
        (16_383, &[0xFF, 0x7F]),
    ];

    for (value, expected_bytes) in test_cases {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, value).unwrap();
        assert_eq!(&buf[..], expected_bytes);
        assert_eq!(
            read_variable_int(expected_bytes).unwrap(),
            (value, expected_bytes.len())
        );
    }
}

#[test]
fn test_variable_int_too_long() {
    assert_eq!(
        read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
}

// ============================================================================
// CONNECT / CONNACK
// ============================================================================

#[test]
fn test_connect_wire_format() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "gw".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[
            0x10, 14, // fixed header
            0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
            0x04, // level
            0x02, // clean session
            0x00, 0x3C, // keep alive
            0x00, 0x02, b'g', b'w', // client id
        ]
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_with_credentials() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "ms500_server_1700000000".to_string(),
        clean_session: true,
        keep_alive: 30,
        username: Some("user".to_string()),
        password: Some(Bytes::from_static(b"secret")),
    }));

    let encoded = encode_packet(&packet);
    // username + password flags + clean session
    assert_eq!(encoded[9], 0xC2);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_rejects_wrong_level() {
    let mut encoded = encode_packet(&Packet::Connect(Box::default()));
    encoded[8] = 5;
    assert_eq!(
        decode_packet(&encoded),
        Err(DecodeError::InvalidProtocolVersion(5))
    );
}

#[test]
fn test_connack_decode() {
    let accepted = decode_packet(&[0x20, 0x02, 0x01, 0x00]).unwrap();
    assert_eq!(
        accepted,
        Packet::ConnAck(ConnAck {
            session_present: true,
            return_code: ConnectReturnCode::Accepted,
        })
    );

    let refused = decode_packet(&[0x20, 0x02, 0x00, 0x05]).unwrap();
    match refused {
        Packet::ConnAck(ack) => {
            assert_eq!(ack.return_code, ConnectReturnCode::NotAuthorized);
            assert!(!ack.return_code.is_accepted());
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }

    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x00, 0x09]),
        Err(DecodeError::InvalidReturnCode(9))
    );
}

// ============================================================================
// PUBLISH / PUBACK
// ============================================================================

#[test]
fn test_publish_qos0_wire_format() {
    let packet = Packet::Publish(Publish {
        topic: "a/b".to_string(),
        payload: Bytes::from_static(b"{}"),
        ..Default::default()
    });

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[0x30, 7, 0x00, 0x03, b'a', b'/', b'b', b'{', b'}']
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_qos1_carries_packet_id() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: "/service/ms500/U1/socket".to_string(),
        packet_id: Some(42),
        payload: Bytes::from_static(br#"{"type":"SCS","unit":"U1"}"#),
        ..Default::default()
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x32);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_qos1_without_packet_id_fails() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: "t".to_string(),
        ..Default::default()
    });
    let mut buf = BytesMut::new();
    assert!(Encoder::new().encode(&packet, &mut buf).is_err());
}

#[test]
fn test_publish_rejects_wildcard_topic() {
    let encoded = [0x30, 0x05, 0x00, 0x03, b'a', b'/', b'+'];
    assert!(matches!(
        decode_packet(&encoded),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_puback() {
    let encoded = encode_packet(&Packet::PubAck(PubAck::new(7)));
    assert_eq!(&encoded[..], &[0x40, 0x02, 0x00, 0x07]);
    assert_eq!(decode_packet(&encoded).unwrap(), Packet::PubAck(PubAck::new(7)));
}

// ============================================================================
// SUBSCRIBE / SUBACK
// ============================================================================

#[test]
fn test_subscribe_wire_format() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![
            Subscription {
                filter: "a/+".to_string(),
                qos: QoS::AtMostOnce,
            },
            Subscription {
                filter: "b".to_string(),
                qos: QoS::AtLeastOnce,
            },
        ],
    });

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[0x82, 12, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'+', 0x00, 0x00, 0x01, b'b', 0x01]
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_suback_with_failure() {
    let decoded = decode_packet(&[0x90, 0x04, 0x00, 0x01, 0x00, 0x80]).unwrap();
    assert_eq!(
        decoded,
        Packet::SubAck(SubAck {
            packet_id: 1,
            return_codes: vec![
                SubscribeReturnCode::Granted(QoS::AtMostOnce),
                SubscribeReturnCode::Failure,
            ],
        })
    );
}

// ============================================================================
// Control packets and framing
// ============================================================================

#[test]
fn test_control_packets() {
    assert_eq!(&encode_packet(&Packet::PingReq)[..], &[0xC0, 0x00]);
    assert_eq!(&encode_packet(&Packet::PingResp)[..], &[0xD0, 0x00]);
    assert_eq!(&encode_packet(&Packet::Disconnect)[..], &[0xE0, 0x00]);
    assert_eq!(decode_packet(&[0xD0, 0x00]).unwrap(), Packet::PingResp);
    assert_eq!(decode_packet(&[0xC1, 0x00]), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_partial_packet_returns_none() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        topic: "topic".to_string(),
        payload: Bytes::from_static(b"payload"),
        ..Default::default()
    }));

    let decoder = Decoder::new();
    for cut in 0..encoded.len() {
        assert_eq!(decoder.decode(&encoded[..cut]).unwrap(), None);
    }
}

#[test]
fn test_two_packets_in_one_buffer() {
    let mut buf = encode_packet(&Packet::PingResp);
    buf.extend_from_slice(&encode_packet(&Packet::PubAck(PubAck::new(3))));

    let decoder = Decoder::new();
    let (first, used) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    let (second, _) = decoder.decode(&buf[used..]).unwrap().unwrap();
    assert_eq!(second, Packet::PubAck(PubAck::new(3)));
}

#[test]
fn test_max_packet_size() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        topic: "t".to_string(),
        payload: Bytes::from(vec![0u8; 64]),
        ..Default::default()
    }));

    let decoder = Decoder::new().with_max_packet_size(16);
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}

#[test]
fn test_unsupported_packet_type() {
    // UNSUBSCRIBE is not part of this client's protocol subset
    assert_eq!(
        decode_packet(&[0xA2, 0x02, 0x00, 0x01]),
        Err(DecodeError::InvalidPacketType(10))
    );
}
