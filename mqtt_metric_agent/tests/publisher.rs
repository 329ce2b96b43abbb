//! MqttPublisher against a minimal in-process broker on a loopback socket.
//! Runs on the real clock; every wait is bounded so a hang fails the test.

use std::net::TcpListener as StdListener;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes::v4::read;
use rumqttc::mqttbytes::Error as WireError;
use rumqttc::{ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, Publish, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Instant};

use mqtt_metric_agent::config::BrokerConfig;
use mqtt_metric_agent::publisher::{MqttPublisher, Publisher};
use mqtt_metric_agent::PublishError;

const TOPIC: &str = "routers/r1/usage";
const MAX_PACKET: usize = 64 * 1024;

fn broker(port: u16) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".into(),
        port,
        username: "homeassistant".into(),
        password: "pw".into(),
        client_id: "mqtt-metric-agent-test".into(),
    }
}

async fn listen() -> (TcpListener, u16) {
    let l = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = l.local_addr().unwrap().port();
    (l, port)
}

/// The broker end of one client connection.
struct Session {
    stream: TcpStream,
    buf: BytesMut,
}

impl Session {
    /// Accepts a client and answers its CONNECT.
    async fn accept(listener: &TcpListener) -> Session {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut s = Session {
            stream,
            buf: BytesMut::new(),
        };
        match s.next_packet().await {
            Some(Packet::Connect(c)) => {
                assert_eq!(c.client_id, "mqtt-metric-agent-test");
                let login = c.login.expect("credentials");
                assert_eq!(login.username, "homeassistant");
                assert_eq!(login.password, "pw");
            }
            other => panic!("expected CONNECT, got {other:?}"),
        }
        let mut out = BytesMut::new();
        ConnAck::new(ConnectReturnCode::Success, false)
            .write(&mut out)
            .unwrap();
        s.send(out).await;
        s
    }

    async fn next_packet(&mut self) -> Option<Packet> {
        loop {
            match read(&mut self.buf, MAX_PACKET) {
                Ok(p) => return Some(p),
                Err(WireError::InsufficientBytes(_)) => {}
                Err(e) => panic!("malformed packet from client: {e:?}"),
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Next PUBLISH from the client, answering pings on the way.
    async fn next_publish(&mut self) -> Option<Publish> {
        loop {
            match self.next_packet().await? {
                Packet::Publish(p) => return Some(p),
                Packet::PingReq => {
                    let mut out = BytesMut::new();
                    PingResp.write(&mut out).unwrap();
                    self.send(out).await;
                }
                Packet::Disconnect => return None,
                _ => {}
            }
        }
    }

    async fn ack(&mut self, pkid: u16) {
        let mut out = BytesMut::new();
        PubAck::new(pkid).write(&mut out).unwrap();
        self.send(out).await;
    }

    async fn send(&mut self, bytes: BytesMut) {
        self.stream.write_all(&bytes).await.expect("write to client");
    }
}

async fn wait_until(what: &str, limit: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + limit;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn refused_connection_is_a_connect_error() {
    // grab a free port, then close it so the connect is refused
    let port = {
        let l = StdListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let res = MqttPublisher::connect(&broker(port), Duration::from_secs(1)).await;
    match res {
        Err(PublishError::Connect(msg)) => assert!(!msg.is_empty()),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("connected to a closed port"),
    }
}

#[tokio::test]
async fn leading_space_in_client_id_is_an_error_not_a_panic() {
    let mut cfg = broker(1883);
    cfg.client_id = " r1".into();
    let res = MqttPublisher::connect(&cfg, Duration::from_secs(1)).await;
    assert!(matches!(res, Err(PublishError::Connect(_))));
}

#[tokio::test]
async fn acknowledged_publish_succeeds() {
    let (listener, port) = listen().await;
    let broker_side = tokio::spawn(async move {
        let mut s = Session::accept(&listener).await;
        let p = s.next_publish().await.expect("publish");
        s.ack(p.pkid).await;
        p
    });

    let (publisher, _driver) = MqttPublisher::connect(&broker(port), Duration::from_secs(2))
        .await
        .expect("connect");
    assert!(publisher.is_connected());
    publisher
        .publish(TOPIC, Bytes::from_static(br#"{"CPUUsage":"7"}"#))
        .await
        .expect("acknowledged");

    let seen = timeout(Duration::from_secs(5), broker_side)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.topic, TOPIC);
    assert_eq!(seen.qos, QoS::AtLeastOnce);
    assert_eq!(&seen.payload[..], br#"{"CPUUsage":"7"}"#);
}

#[tokio::test]
async fn missing_puback_times_out() {
    let (listener, port) = listen().await;
    let (done_tx, done_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let mut s = Session::accept(&listener).await;
        let _ = s.next_publish().await;
        // hold the connection open without acking
        let _ = done_rx.await;
    });

    let (publisher, _driver) = MqttPublisher::connect(&broker(port), Duration::from_millis(200))
        .await
        .expect("connect");
    let started = Instant::now();
    let res = publisher.publish(TOPIC, Bytes::from_static(b"{}")).await;
    assert!(matches!(res, Err(PublishError::Timeout(_))), "{res:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    let _ = done_tx.send(());
}

#[tokio::test]
async fn late_ack_does_not_confirm_the_next_publish() {
    let (listener, port) = listen().await;
    let broker_side = tokio::spawn(async move {
        let mut s = Session::accept(&listener).await;
        let first = s.next_publish().await.expect("first");
        // answer the first publish only after the client gave up on it
        sleep(Duration::from_millis(300)).await;
        s.ack(first.pkid).await;
        let second = s.next_publish().await.expect("second");
        let third = s.next_publish().await.expect("third");
        s.ack(third.pkid).await;
        (first.pkid, second.pkid, third.pkid)
    });

    let (publisher, _driver) = MqttPublisher::connect(&broker(port), Duration::from_millis(200))
        .await
        .expect("connect");

    let first = publisher.publish(TOPIC, Bytes::from_static(b"one")).await;
    assert!(matches!(first, Err(PublishError::Timeout(_))), "{first:?}");

    // the broker never acks this one; the first's late PUBACK lands meanwhile
    let second = publisher.publish(TOPIC, Bytes::from_static(b"two")).await;
    assert!(matches!(second, Err(PublishError::Timeout(_))), "{second:?}");

    publisher
        .publish(TOPIC, Bytes::from_static(b"three"))
        .await
        .expect("third is acked");

    let (p1, p2, p3) = timeout(Duration::from_secs(5), broker_side)
        .await
        .unwrap()
        .unwrap();
    assert!(p1 != p2 && p2 != p3 && p1 != p3);
}

#[tokio::test]
async fn payloads_from_an_outage_are_not_replayed() {
    let (listener, port) = listen().await;
    let (resume_tx, resume_rx) = oneshot::channel::<()>();
    let broker_side = tokio::spawn(async move {
        let first = Session::accept(&listener).await;
        drop(first);
        resume_rx.await.expect("resume signal");

        let mut s = Session::accept(&listener).await;
        let mut received = Vec::new();
        while let Some(p) = s.next_publish().await {
            s.ack(p.pkid).await;
            let body = String::from_utf8(p.payload.to_vec()).unwrap();
            let fresh = body == "fresh";
            received.push(body);
            if fresh {
                break;
            }
        }
        received
    });

    let (publisher, _driver) = MqttPublisher::connect(&broker(port), Duration::from_millis(300))
        .await
        .expect("connect");
    wait_until("the dropped connection", Duration::from_secs(5), || {
        !publisher.is_connected()
    })
    .await;

    for i in 0..3 {
        let started = Instant::now();
        let res = publisher
            .publish(TOPIC, Bytes::from(format!("stale-{i}")))
            .await;
        assert!(matches!(res, Err(PublishError::Disconnected)), "{res:?}");
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    resume_tx.send(()).unwrap();
    wait_until("the reconnect", Duration::from_secs(10), || {
        publisher.is_connected()
    })
    .await;
    publisher
        .publish(TOPIC, Bytes::from_static(b"fresh"))
        .await
        .expect("fresh payload acked");

    let received = timeout(Duration::from_secs(5), broker_side)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, ["fresh"]);
}

#[tokio::test]
async fn incoming_messages_are_tolerated_and_disconnect_ends_the_driver() {
    let (listener, port) = listen().await;
    let broker_side = tokio::spawn(async move {
        let mut s = Session::accept(&listener).await;
        let mut out = BytesMut::new();
        Publish::new("routers/r1/cmd", QoS::AtMostOnce, "reboot")
            .write(&mut out)
            .unwrap();
        s.send(out).await;

        let p = s.next_publish().await.expect("publish");
        s.ack(p.pkid).await;
        // next_publish yields None on DISCONNECT or EOF; tell them apart
        loop {
            match s.next_packet().await {
                Some(Packet::Disconnect) => return true,
                Some(_) => {}
                None => return false,
            }
        }
    });

    let (publisher, driver) = MqttPublisher::connect(&broker(port), Duration::from_secs(2))
        .await
        .expect("connect");
    publisher
        .publish(TOPIC, Bytes::from_static(b"{}"))
        .await
        .expect("acked despite the incoming message");

    publisher.disconnect().await;
    timeout(Duration::from_secs(2), driver)
        .await
        .expect("driver exits after DISCONNECT")
        .unwrap();
    assert!(!publisher.is_connected());

    let saw_disconnect = timeout(Duration::from_secs(5), broker_side)
        .await
        .unwrap()
        .unwrap();
    assert!(saw_disconnect);
}
