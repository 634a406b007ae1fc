use std::rc::Rc;

use libmqtt::network::application::mqtt::packet::{Packet, Subscribe, Unsubscribe};
use libmqtt::network::application::mqtt::{
    Client, ClientState, Clock, Config, ConnectReturnCode, ControlType, Error, Handler,
    MessageState, Options, Publish, PublishOptions, QoS, SubscribeReturnCode,
};
use libmqtt::network::error::Error as NetworkError;

use crate::mock::{
    bytes, connack_accepted, manual_clock, Dialer, MockConnection, Recorder, Seen, SharedWire,
};

const FIRST_ID: u16 = 46161;
const SECOND_ID: u16 = 60968;
const THIRD_ID: u16 = 30484;

fn establish<'a, H: Handler, K: Clock>(
    client: &mut Client<'a, MockConnection, H, K>,
    wire: &SharedWire,
    options: Options<'a>,
) {
    client.connect(options).unwrap();
    client.sync().unwrap();
    wire.borrow_mut().inject(&connack_accepted());
    client.sync().unwrap();
    assert_eq!(client.state(), ClientState::Connected);
    wire.borrow_mut().take_written();
}

fn publish_bytes(topic: &str, payload: &[u8], qos: QoS, packet_id: u16, dup: bool) -> Vec<u8> {
    bytes(&Packet::Publish(Publish {
        dup,
        qos,
        retain: false,
        topic,
        packet_id,
        payload,
    }))
}

fn id_bytes(id: u16) -> [u8; 2] {
    id.to_be_bytes()
}

#[test]
fn test_connect_handshake() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    assert_eq!(client.state(), ClientState::Disconnected);

    client.connect(Options::new("t1")).unwrap();
    assert_eq!(client.state(), ClientState::Connecting);
    client.sync().unwrap();

    let written = wire.borrow_mut().take_written();
    assert_eq!(written[0], 0x10);
    assert_eq!(&written[4..8], b"MQTT");
    assert_eq!(written[8], 4, "protocol level");
    assert_eq!(written[9], 0x02, "clean session only");
    assert_eq!(&written[10..12], &[0, 60], "keep-alive");
    assert_eq!(&written[12..], &[0x00, 0x02, b't', b'1']);

    wire.borrow_mut().inject(&[0x20, 0x02, 0x00, 0x00]);
    client.sync().unwrap();
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.handler().events, [Seen::Connected(false)]);
    assert!(client.queue().is_empty());
}

#[test]
fn test_only_connect_is_sent_before_connack() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);

    client.connect(Options::new("early")).unwrap();
    client.publish("a", b"queued early", QoS::AtMostOnce.into()).unwrap();
    client.sync().unwrap();
    let connect = bytes(&Packet::Connect(Options::new("early").to_connect()));
    assert_eq!(wire.borrow_mut().take_written(), connect);

    wire.borrow_mut().inject(&connack_accepted());
    client.sync().unwrap();
    client.sync().unwrap();
    assert_eq!(
        wire.borrow_mut().take_written(),
        publish_bytes("a", b"queued early", QoS::AtMostOnce, 0, false)
    );
}

#[test]
fn test_subscribe_and_suback() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("sub"));

    let topics = [("sensors/a", QoS::AtMostOnce), ("sensors/b", QoS::AtLeastOnce)];
    let id = client.subscribe(&topics).unwrap();
    assert_eq!(id, FIRST_ID);
    client.sync().unwrap();

    let expected = bytes(&Packet::Subscribe(Subscribe::new(id, &topics).unwrap()));
    assert_eq!(wire.borrow_mut().take_written(), expected);
    assert_eq!(client.queue().get(0).unwrap().state, MessageState::AwaitingAck);

    let [hi, lo] = id_bytes(id);
    wire.borrow_mut().inject(&[0x90, 0x04, hi, lo, 0x00, 0x01]);
    client.sync().unwrap();

    assert_eq!(
        client.handler().events.last(),
        Some(&Seen::Subscribed(
            id,
            vec![
                SubscribeReturnCode::Success(QoS::AtMostOnce),
                SubscribeReturnCode::Success(QoS::AtLeastOnce),
            ]
        ))
    );
    assert!(client.queue().is_empty());
}

#[test]
fn test_unsubscribe_and_unsuback() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("unsub"));

    let id = client.unsubscribe(&["weather_branna"]).unwrap();
    client.sync().unwrap();
    let expected = bytes(&Packet::Unsubscribe(
        Unsubscribe::new(id, &["weather_branna"]).unwrap(),
    ));
    assert_eq!(wire.borrow_mut().take_written(), expected);

    wire.borrow_mut().inject(&bytes(&Packet::UnsubAck(id)));
    client.sync().unwrap();
    assert_eq!(client.handler().events.last(), Some(&Seen::Unsubscribed(id)));
    assert!(client.queue().is_empty());
}

#[test]
fn test_qos1_publish_and_unknown_ack() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("qos1"));

    let id = client
        .publish("sensors/a", b"21.5", QoS::AtLeastOnce.into())
        .unwrap();
    assert_eq!(id, FIRST_ID);
    client.sync().unwrap();
    assert_eq!(
        wire.borrow_mut().take_written(),
        publish_bytes("sensors/a", b"21.5", QoS::AtLeastOnce, id, false)
    );

    let queued = client.queue().get(0).unwrap();
    assert_eq!(queued.state, MessageState::AwaitingAck);
    assert_eq!(queued.packet_id, id);
    assert_eq!(client.queue().payload(0).unwrap()[0], 0x3A, "DUP set for resends");

    wire.borrow_mut().inject(&bytes(&Packet::PubAck(0x1234)));
    client.sync().unwrap();
    assert_eq!(client.queue().len(), 1);
    assert_eq!(client.queue().get(0).unwrap().state, MessageState::AwaitingAck);
    assert_eq!(
        client.handler().events.last(),
        Some(&Seen::UnknownAck(ControlType::PubAck, 0x1234))
    );
    assert_eq!(client.state(), ClientState::Connected);

    wire.borrow_mut().inject(&bytes(&Packet::PubAck(id)));
    client.sync().unwrap();
    assert!(client.queue().is_empty());
    assert_eq!(client.handler().events.last(), Some(&Seen::Published(id)));
}

#[test]
fn test_qos0_publish_needs_no_ack() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("qos0"));

    let options = PublishOptions {
        qos: QoS::AtMostOnce,
        retain: true,
        dup: false,
    };
    assert_eq!(client.publish("status", b"online", options), Ok(0));
    client.sync().unwrap();

    let written = wire.borrow_mut().take_written();
    assert_eq!(written[0], 0x31);
    assert!(client.queue().is_empty());
}

#[test]
fn test_half_send_resumes_at_offset() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("partial"));

    let payload = [0x5Au8; 20];
    let expected = publish_bytes("sensors/a", &payload, QoS::AtMostOnce, 0, false);
    let half = expected.len() / 2;

    wire.borrow_mut().write_budget = Some(half);
    client.publish("sensors/a", &payload, QoS::AtMostOnce.into()).unwrap();
    client.sync().unwrap();
    assert_eq!(wire.borrow().written, expected[..half]);
    assert_eq!(client.queue().get(0).unwrap().state, MessageState::Unsent);

    wire.borrow_mut().write_budget = None;
    client.sync().unwrap();
    assert_eq!(wire.borrow().written, expected);
    assert!(client.queue().is_empty());
}

#[test]
fn test_trickled_sends_keep_packet_order() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("trickle"));

    client.publish("a", b"first", QoS::AtMostOnce.into()).unwrap();
    client.publish("b", b"second", QoS::AtMostOnce.into()).unwrap();
    client.ping().unwrap();

    let mut expected = publish_bytes("a", b"first", QoS::AtMostOnce, 0, false);
    expected.extend(publish_bytes("b", b"second", QoS::AtMostOnce, 0, false));
    expected.extend([0xC0, 0x00]);

    for _ in 0..expected.len() {
        wire.borrow_mut().write_budget = Some(3);
        client.sync().unwrap();
    }
    assert_eq!(wire.borrow().written, expected);
}

#[test]
fn test_keep_alive_ping() {
    let (connection, wire) = MockConnection::new();
    let (clock, time) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    let options = Options {
        keep_alive_seconds: 10,
        ..Options::new("pinger")
    };
    establish(&mut client, &wire, options);

    time.set(10);
    client.sync().unwrap();
    assert!(wire.borrow().written.is_empty());

    time.set(11);
    client.sync().unwrap();
    assert_eq!(wire.borrow_mut().take_written(), [0xC0, 0x00]);

    time.set(12);
    client.sync().unwrap();
    assert!(wire.borrow().written.is_empty(), "one ping at a time");

    wire.borrow_mut().inject(&[0xD0, 0x00]);
    client.sync().unwrap();
    assert_eq!(client.handler().events.last(), Some(&Seen::Pong));
    assert!(client.queue().is_empty());
}

#[test]
fn test_response_timeout_resends_then_fails() {
    let (connection, wire) = MockConnection::new();
    let (clock, time) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let config = Config {
        response_timeout: 5,
        max_timeouts: 1,
    };
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock)
        .with_config(config);
    let options = Options {
        keep_alive_seconds: 0,
        ..Options::new("slow")
    };
    establish(&mut client, &wire, options);

    let id = client.publish("a", b"x", QoS::AtLeastOnce.into()).unwrap();
    client.sync().unwrap();
    assert_eq!(
        wire.borrow_mut().take_written(),
        publish_bytes("a", b"x", QoS::AtLeastOnce, id, false)
    );

    time.set(5);
    client.sync().unwrap();
    assert_eq!(client.state(), ClientState::Connected);

    time.set(6);
    client.sync().unwrap();
    assert_eq!(client.state(), ClientState::Degraded);
    assert_eq!(client.queue().get(0).unwrap().state, MessageState::Unsent);

    time.set(7);
    client.sync().unwrap();
    assert_eq!(
        wire.borrow_mut().take_written(),
        publish_bytes("a", b"x", QoS::AtLeastOnce, id, true)
    );

    time.set(13);
    assert_eq!(client.sync(), Err(Error::ResponseTimeout));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(client.error(), Some(Error::ResponseTimeout));
    assert_eq!(client.sync(), Err(Error::ResponseTimeout));
    assert_eq!(
        client.publish("a", b"y", QoS::AtMostOnce.into()),
        Err(Error::ResponseTimeout)
    );
}

#[test]
fn test_ack_recovers_degraded_session() {
    let (connection, wire) = MockConnection::new();
    let (clock, time) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let config = Config {
        response_timeout: 5,
        max_timeouts: 3,
    };
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock)
        .with_config(config);
    let options = Options {
        keep_alive_seconds: 0,
        ..Options::new("recover")
    };
    establish(&mut client, &wire, options);

    let id = client.publish("a", b"x", QoS::AtLeastOnce.into()).unwrap();
    client.sync().unwrap();
    time.set(6);
    client.sync().unwrap();
    assert_eq!(client.state(), ClientState::Degraded);

    time.set(7);
    wire.borrow_mut().inject(&bytes(&Packet::PubAck(id)));
    client.sync().unwrap();
    assert_eq!(client.state(), ClientState::Connected);
    assert!(client.queue().is_empty());
}

#[test]
fn test_qos2_outbound_handshake() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("qos2-out"));

    let id = client.publish("a", b"once", QoS::ExactlyOnce.into()).unwrap();
    client.sync().unwrap();
    wire.borrow_mut().take_written();

    wire.borrow_mut().inject(&bytes(&Packet::PubRec(id)));
    client.sync().unwrap();
    client.sync().unwrap();
    let [hi, lo] = id_bytes(id);
    assert_eq!(wire.borrow_mut().take_written(), [0x62, 0x02, hi, lo]);

    // a repeated PUBREC does not queue a second PUBREL
    wire.borrow_mut().inject(&bytes(&Packet::PubRec(id)));
    client.sync().unwrap();
    client.sync().unwrap();
    assert!(wire.borrow().written.is_empty());
    assert!(!client.handler().events.contains(&Seen::Published(id)));

    wire.borrow_mut().inject(&bytes(&Packet::PubComp(id)));
    client.sync().unwrap();
    assert_eq!(client.handler().events.last(), Some(&Seen::Published(id)));
    assert!(client.queue().is_empty());
}

#[test]
fn test_single_qos2_publish_in_flight() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("qos2-serial"));

    let first = client.publish("a", b"1", QoS::ExactlyOnce.into()).unwrap();
    let second = client.publish("b", b"2", QoS::ExactlyOnce.into()).unwrap();
    client.sync().unwrap();
    assert_eq!(
        wire.borrow_mut().take_written(),
        publish_bytes("a", b"1", QoS::ExactlyOnce, first, false)
    );

    wire.borrow_mut().inject(&bytes(&Packet::PubRec(first)));
    client.sync().unwrap();
    client.sync().unwrap();

    let mut expected = publish_bytes("b", b"2", QoS::ExactlyOnce, second, false);
    expected.extend(bytes(&Packet::PubRel(first)));
    assert_eq!(wire.borrow_mut().take_written(), expected);
}

#[test]
fn test_inbound_qos1_is_acknowledged() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("qos1-in"));

    wire.borrow_mut()
        .inject(&publish_bytes("weather_branna", b"{}", QoS::AtLeastOnce, 9, false));
    client.sync().unwrap();
    let message = &client.handler().messages[0];
    assert_eq!(message.topic, "weather_branna");
    assert_eq!(message.payload, b"{}");
    assert_eq!(message.qos, QoS::AtLeastOnce);
    assert!(!message.retain && !message.dup);

    client.sync().unwrap();
    assert_eq!(wire.borrow_mut().take_written(), [0x40, 0x02, 0x00, 0x09]);
    assert!(client.queue().is_empty());
}

#[test]
fn test_inbound_qos2_delivered_once() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("qos2-in"));

    let publish = publish_bytes("weather_ulrikashus", b"7.1", QoS::ExactlyOnce, 5, false);
    wire.borrow_mut().inject(&publish);
    client.sync().unwrap();
    client.sync().unwrap();
    assert_eq!(client.handler().messages.len(), 1);
    assert_eq!(wire.borrow_mut().take_written(), [0x50, 0x02, 0x00, 0x05]);

    let redelivery = publish_bytes("weather_ulrikashus", b"7.1", QoS::ExactlyOnce, 5, true);
    wire.borrow_mut().inject(&redelivery);
    client.sync().unwrap();
    client.sync().unwrap();
    assert_eq!(client.handler().messages.len(), 1);
    assert!(wire.borrow().written.is_empty());

    wire.borrow_mut().inject(&bytes(&Packet::PubRel(5)));
    client.sync().unwrap();
    client.sync().unwrap();
    assert_eq!(wire.borrow_mut().take_written(), [0x70, 0x02, 0x00, 0x05]);
    assert!(client.queue().is_empty());
}

#[test]
fn test_chunked_reads_and_back_to_back_packets() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 64];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("chunks"));

    {
        let mut wire = wire.borrow_mut();
        wire.read_chunk = Some(3);
        for n in 0..5u8 {
            wire.inject(&publish_bytes("t", &[n; 20], QoS::AtMostOnce, 0, false));
        }
    }
    client.sync().unwrap();

    let payloads: Vec<Vec<u8>> = client
        .handler()
        .messages
        .iter()
        .map(|m| m.payload.clone())
        .collect();
    assert_eq!(payloads, (0..5u8).map(|n| vec![n; 20]).collect::<Vec<_>>());
}

#[test]
fn test_packet_id_sequence() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 1024];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("ids"));

    assert_eq!(client.publish("a", b"", QoS::AtLeastOnce.into()), Ok(FIRST_ID));
    assert_eq!(client.publish("a", b"", QoS::AtMostOnce.into()), Ok(0));
    assert_eq!(client.subscribe(&[("a", QoS::AtMostOnce)]), Ok(SECOND_ID));
    assert_eq!(client.unsubscribe(&["a"]), Ok(THIRD_ID));
}

#[test]
fn test_typical_response_time() {
    let (connection, wire) = MockConnection::new();
    let (clock, time) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    assert_eq!(client.typical_response_time(), None);

    client.connect(Options::new("rtt")).unwrap();
    client.sync().unwrap();
    time.set(2);
    wire.borrow_mut().inject(&connack_accepted());
    client.sync().unwrap();
    assert_eq!(client.typical_response_time(), Some(2.0));

    let id = client.publish("a", b"x", QoS::AtLeastOnce.into()).unwrap();
    client.sync().unwrap();
    time.set(12);
    wire.borrow_mut().inject(&bytes(&Packet::PubAck(id)));
    client.sync().unwrap();
    assert_eq!(client.typical_response_time(), Some(3.0));
}

#[test]
fn test_connack_refusals() {
    let cases = [
        (0x02, Error::ClientIdRejected),
        (
            0x05,
            Error::ConnectionRefused(ConnectReturnCode::NotAuthorized),
        ),
        (
            0x03,
            Error::ConnectionRefused(ConnectReturnCode::ServerUnavailable),
        ),
    ];
    for (code, expected) in cases {
        let (connection, wire) = MockConnection::new();
        let (clock, _) = manual_clock();
        let mut send_buf = [0u8; 512];
        let mut recv_buf = [0u8; 256];
        let mut client =
            Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);

        client.connect(Options::new("refused")).unwrap();
        client.sync().unwrap();
        wire.borrow_mut().inject(&[0x20, 0x02, 0x00, code]);
        assert_eq!(client.sync(), Err(expected));
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.connect(Options::new("again")), Err(expected));
    }
}

#[test]
fn test_operations_before_connect() {
    let (connection, _wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);

    assert_eq!(
        client.publish("a", b"", QoS::AtMostOnce.into()),
        Err(Error::ConnectNotCalled)
    );
    assert_eq!(
        client.subscribe(&[("a", QoS::AtMostOnce)]),
        Err(Error::ConnectNotCalled)
    );
    assert_eq!(client.ping(), Err(Error::ConnectNotCalled));
    assert_eq!(client.sync(), Err(Error::ConnectNotCalled));
    assert_eq!(client.reconnect(), Err(Error::NoReconnectHandler));
    assert!(client.queue().is_empty());

    client.connect(Options::new("once")).unwrap();
    assert_eq!(
        client.connect(Options::new("twice")),
        Err(Error::AlreadyConnected)
    );
}

#[test]
fn test_invalid_requests_queue_nothing() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);

    let options = Options {
        password: Some(b"secret"),
        ..Options::new("no-user")
    };
    assert_eq!(client.connect(options), Err(Error::PasswordWithoutUsername));
    assert_eq!(client.state(), ClientState::Disconnected);

    establish(&mut client, &wire, Options::new("valid"));
    assert_eq!(
        client.publish("a/#", b"", QoS::AtMostOnce.into()),
        Err(Error::InvalidTopic)
    );
    let topics = [("t", QoS::AtMostOnce); 9];
    assert_eq!(client.subscribe(&topics), Err(Error::TooManyTopics));
    assert_eq!(client.subscribe(&[]), Err(Error::MalformedRequest));
    assert!(client.queue().is_empty());

    assert_eq!(
        client.publish("a", b"", QoS::AtLeastOnce.into()),
        Ok(FIRST_ID),
        "rejected requests do not consume packet ids"
    );
}

#[test]
fn test_queue_full_is_recoverable() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 96];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("t1"));

    let payload = [1u8; 30];
    let id = client
        .publish("t", &payload, QoS::AtLeastOnce.into())
        .unwrap();
    assert_eq!(
        client.publish("t", &payload, QoS::AtLeastOnce.into()),
        Err(Error::QueueFull)
    );
    assert_eq!(client.queue().len(), 1);
    assert_eq!(client.state(), ClientState::Connected);

    client.sync().unwrap();
    wire.borrow_mut().inject(&bytes(&Packet::PubAck(id)));
    client.sync().unwrap();
    assert!(client.publish("t", &payload, QoS::AtLeastOnce.into()).is_ok());
}

#[test]
fn test_malformed_input_is_fatal() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("fatal"));

    wire.borrow_mut().inject(&[0x00, 0x00]);
    assert_eq!(client.sync(), Err(Error::InvalidControlType));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(client.error(), Some(Error::InvalidControlType));
}

#[test]
fn test_server_side_packet_is_rejected() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("server-side"));

    let subscribe = Subscribe::new(1, &[("a", QoS::AtMostOnce)]).unwrap();
    wire.borrow_mut().inject(&bytes(&Packet::Subscribe(subscribe)));
    assert_eq!(client.sync(), Err(Error::InvalidControlType));
}

#[test]
fn test_receive_buffer_too_small() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 16];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("tiny"));

    wire.borrow_mut().inject(&[0x30, 100, 0x00, 0x01, b'a']);
    assert_eq!(client.sync(), Err(Error::RecvBufferTooSmall));
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[test]
fn test_transport_errors_are_fatal() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("broken"));

    wire.borrow_mut().write_error = Some(NetworkError::WriteError);
    client.ping().unwrap();
    assert_eq!(
        client.sync(),
        Err(Error::Transport(NetworkError::WriteError))
    );
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[test]
fn test_disconnect() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("bye"));

    client.disconnect().unwrap();
    client.sync().unwrap();
    assert_eq!(wire.borrow_mut().take_written(), [0xE0, 0x00]);
    assert_eq!(client.state(), ClientState::Disconnected);

    client.publish("a", b"late", QoS::AtMostOnce.into()).unwrap();
    client.sync().unwrap();
    assert!(wire.borrow().written.is_empty());
}

#[test]
fn test_reconnect_resends_with_dup() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    let options = Options {
        clean_session: false,
        ..Options::new("persistent")
    };
    establish(&mut client, &wire, options);

    let id = client.publish("a", b"keep", QoS::AtLeastOnce.into()).unwrap();
    client.sync().unwrap();

    let (replacement, new_wire) = MockConnection::new();
    client.reconnect_with(replacement).unwrap();
    assert!(wire.borrow().closed);
    assert_eq!(client.state(), ClientState::Connecting);

    client.sync().unwrap();
    assert_eq!(
        new_wire.borrow_mut().take_written(),
        bytes(&Packet::Connect(options.to_connect()))
    );

    new_wire.borrow_mut().inject(&[0x20, 0x02, 0x01, 0x00]);
    client.sync().unwrap();
    assert_eq!(client.handler().events.last(), Some(&Seen::Connected(true)));
    client.sync().unwrap();
    assert_eq!(
        new_wire.borrow_mut().take_written(),
        publish_bytes("a", b"keep", QoS::AtLeastOnce, id, true)
    );
}

#[test]
fn test_reconnect_clean_session_drops_queue() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("clean"));

    client.publish("a", b"drop", QoS::AtLeastOnce.into()).unwrap();
    client.sync().unwrap();

    let (replacement, new_wire) = MockConnection::new();
    client.reconnect_with(replacement).unwrap();
    assert_eq!(client.queue().len(), 1);
    assert_eq!(
        client.queue().get(0).unwrap().control_type,
        ControlType::Connect
    );

    client.sync().unwrap();
    new_wire.borrow_mut().inject(&connack_accepted());
    client.sync().unwrap();
    client.sync().unwrap();
    assert_eq!(
        new_wire.borrow_mut().take_written(),
        bytes(&Packet::Connect(Options::new("clean").to_connect()))
    );
}

#[test]
fn test_sync_reconnects_through_handler() {
    let mut dialer = Dialer::default();
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock)
        .with_reconnect(&mut dialer);
    establish(&mut client, &wire, Options::new("redial"));

    wire.borrow_mut().read_error = Some(NetworkError::ConnectionClosed);
    assert_eq!(
        client.sync(),
        Err(Error::Transport(NetworkError::ConnectionClosed))
    );
    assert_eq!(client.state(), ClientState::Disconnected);

    client.sync().unwrap();
    assert!(wire.borrow().closed);
    assert_eq!(client.state(), ClientState::Connecting);
    assert_eq!(client.error(), None);

    let new_wire = client.connection().unwrap().wire();
    assert_eq!(
        new_wire.borrow_mut().take_written(),
        bytes(&Packet::Connect(Options::new("redial").to_connect()))
    );
    new_wire.borrow_mut().inject(&connack_accepted());
    client.sync().unwrap();
    assert_eq!(client.state(), ClientState::Connected);

    drop(client);
    assert_eq!(dialer.wires.len(), 1);
}

#[test]
fn test_failed_redial_keeps_error() {
    let mut dialer = Dialer {
        refuse: true,
        ..Dialer::default()
    };
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock)
        .with_reconnect(&mut dialer);
    establish(&mut client, &wire, Options::new("refused"));

    wire.borrow_mut().read_error = Some(NetworkError::ConnectionClosed);
    assert!(client.sync().is_err());
    assert_eq!(
        client.sync(),
        Err(Error::Transport(NetworkError::ConnectionRefused))
    );
    assert_eq!(
        client.error(),
        Some(Error::Transport(NetworkError::ConnectionClosed))
    );
}

/// Leaves one byte free in a 96-byte queue once sent.
fn fill_small_queue<H: Handler, K: Clock>(client: &mut Client<'_, MockConnection, H, K>) -> u16 {
    let id = client
        .publish("t", &[7u8; 40], QoS::AtLeastOnce.into())
        .unwrap();
    client.sync().unwrap();
    assert_eq!(client.queue().free_space(), 1);
    id
}

#[test]
fn test_keep_alive_waits_for_queue_space() {
    let (connection, wire) = MockConnection::new();
    let (clock, time) = manual_clock();
    let mut send_buf = [0u8; 96];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("crowded"));
    let id = fill_small_queue(&mut client);
    wire.borrow_mut().take_written();

    time.set(61);
    wire.borrow_mut().inject(&bytes(&Packet::PubAck(id)));
    client.sync().unwrap();
    assert!(wire.borrow().inbound.is_empty());
    assert_eq!(client.handler().events.last(), Some(&Seen::Published(id)));
    assert!(client.queue().is_empty());
    assert!(wire.borrow().written.is_empty());

    client.sync().unwrap();
    assert_eq!(wire.borrow_mut().take_written(), [0xC0, 0x00]);
}

#[test]
fn test_inbound_publish_waits_for_queue_space() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 96];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("crowded"));
    let id = fill_small_queue(&mut client);
    wire.borrow_mut().take_written();

    wire.borrow_mut()
        .inject(&publish_bytes("in", b"held", QoS::AtLeastOnce, 7, false));
    client.sync().unwrap();
    assert!(client.handler().messages.is_empty());
    assert_eq!(client.state(), ClientState::Connected);

    wire.borrow_mut().inject(&bytes(&Packet::PubAck(id)));
    client.sync().unwrap();
    assert_eq!(client.handler().events.last(), Some(&Seen::Published(id)));
    assert_eq!(client.handler().messages.len(), 1);
    assert_eq!(client.handler().messages[0].payload, b"held");

    client.sync().unwrap();
    assert_eq!(wire.borrow_mut().take_written(), bytes(&Packet::PubAck(7)));
}

#[test]
fn test_acks_behind_held_publish_are_handled() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 96];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("crowded"));
    let id = fill_small_queue(&mut client);

    {
        let mut wire = wire.borrow_mut();
        wire.inject(&publish_bytes("in", b"first", QoS::AtLeastOnce, 7, false));
        wire.inject(&bytes(&Packet::PubAck(id)));
    }
    client.sync().unwrap();
    assert_eq!(client.handler().messages.len(), 1);
    assert_eq!(client.handler().events.last(), Some(&Seen::Published(id)));
    assert!(wire.borrow().inbound.is_empty());
}

#[test]
fn test_unbounded_timeouts_do_not_overflow() {
    let (connection, wire) = MockConnection::new();
    let (clock, time) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let config = Config {
        response_timeout: u64::MAX,
        ..Config::default()
    };
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock)
        .with_config(config);
    time.set(u64::MAX - 5);
    establish(&mut client, &wire, Options::new("patient"));

    client.publish("a", b"slow", QoS::AtLeastOnce.into()).unwrap();
    client.sync().unwrap();
    wire.borrow_mut().take_written();

    time.set(u64::MAX);
    client.sync().unwrap();
    client.sync().unwrap();
    assert!(wire.borrow().written.is_empty(), "no resend and no ping");
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.queue().get(0).unwrap().state, MessageState::AwaitingAck);
}

#[test]
fn test_reconnect_without_room_keeps_client_untouched() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 96];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    let options = Options {
        clean_session: false,
        ..Options::new("keep")
    };
    establish(&mut client, &wire, options);
    fill_small_queue(&mut client);

    wire.borrow_mut().read_error = Some(NetworkError::ConnectionClosed);
    let closed = Err(Error::Transport(NetworkError::ConnectionClosed));
    assert_eq!(client.sync(), closed);

    let (replacement, new_wire) = MockConnection::new();
    assert_eq!(client.reconnect_with(replacement), Err(Error::QueueFull));
    assert!(!wire.borrow().closed);
    assert!(Rc::ptr_eq(&client.connection().unwrap().wire(), &wire));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(client.error(), Some(Error::Transport(NetworkError::ConnectionClosed)));
    assert_eq!(client.queue().len(), 1);
    assert_eq!(client.queue().get(0).unwrap().state, MessageState::AwaitingAck);
    assert_eq!(client.sync(), closed);
    assert!(new_wire.borrow().written.is_empty());
}

#[test]
fn test_suback_grant_count_must_match_request() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("grants"));

    let id = client
        .subscribe(&[("sensors/a", QoS::AtMostOnce), ("sensors/b", QoS::AtLeastOnce)])
        .unwrap();
    client.sync().unwrap();

    let [hi, lo] = id_bytes(id);
    wire.borrow_mut().inject(&[0x90, 0x03, hi, lo, 0x00]);
    assert_eq!(client.sync(), Err(Error::MalformedPacket));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(
        !client
            .handler()
            .events
            .iter()
            .any(|e| matches!(e, Seen::Subscribed(..)))
    );
}

#[test]
fn test_sync_hook_runs_before_traffic() {
    let (connection, wire) = MockConnection::new();
    let (clock, _) = manual_clock();
    let mut send_buf = [0u8; 512];
    let mut recv_buf = [0u8; 256];
    let mut client = Client::new(connection, &mut send_buf, &mut recv_buf, Recorder::default(), clock);
    establish(&mut client, &wire, Options::new("hook"));
    assert_eq!(client.handler().syncs, 2);

    client.publish("a", b"later", QoS::AtMostOnce.into()).unwrap();
    client.handler_mut().halt = Some(Error::NoReconnectHandler);
    assert_eq!(client.sync(), Err(Error::NoReconnectHandler));
    assert!(wire.borrow().written.is_empty());
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.error(), None);

    client.handler_mut().halt = None;
    client.sync().unwrap();
    assert_eq!(client.handler().syncs, 4);
    assert_eq!(
        wire.borrow_mut().take_written(),
        publish_bytes("a", b"later", QoS::AtMostOnce, 0, false)
    );
}
