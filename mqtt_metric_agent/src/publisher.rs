//! MQTT delivery: one QoS 1 publish per call, bounded by a PUBACK wait.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::PublishError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
// Rendezvous: a publish is handed over only while the event loop is reading
// requests, so nothing queues up inside the client.
const REQUEST_CAPACITY: usize = 0;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver one payload and wait (bounded) for the broker to confirm it.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError>;
}

/// What the event loop driver reports back about outgoing publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// A publish was written with this packet id.
    Sent(u16),
    Acked(u16),
    /// The connection dropped; unacked publishes were discarded.
    Lost,
}

struct Deliveries {
    rx: mpsc::UnboundedReceiver<Delivery>,
    // `Sent` reports still due for publishes that gave up after handing off
    owed: usize,
}

impl Deliveries {
    fn discard_stale(&mut self) {
        while let Ok(d) = self.rx.try_recv() {
            self.settle(d);
        }
    }

    fn settle(&mut self, d: Delivery) {
        match d {
            Delivery::Sent(_) => self.owed = self.owed.saturating_sub(1),
            Delivery::Lost => self.owed = 0,
            Delivery::Acked(_) => {}
        }
    }

    async fn next(&mut self) -> Result<Delivery, PublishError> {
        self.rx.recv().await.ok_or(PublishError::Closed)
    }

    /// Packet id the event loop assigned to the publish just handed off.
    async fn packet_id(&mut self) -> Result<u16, PublishError> {
        loop {
            match self.next().await? {
                Delivery::Sent(pkid) if self.owed == 0 => return Ok(pkid),
                Delivery::Lost => {
                    self.owed = 0;
                    return Err(PublishError::Disconnected);
                }
                d => self.settle(d),
            }
        }
    }

    /// Waits for the PUBACK of `pkid`; acks for anything else are late
    /// replies to publishes that already timed out.
    async fn ack_for(&mut self, pkid: u16) -> Result<(), PublishError> {
        loop {
            match self.next().await? {
                Delivery::Acked(id) if id == pkid => return Ok(()),
                Delivery::Acked(id) => debug!(pkid = id, "ignoring late acknowledgement"),
                Delivery::Lost => return Err(PublishError::Disconnected),
                Delivery::Sent(_) => {}
            }
        }
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    deliveries: Mutex<Deliveries>,
    connected: watch::Receiver<bool>,
    ack_timeout: Duration,
}

impl MqttPublisher {
    /// Connect and wait for CONNACK. Failing here is fatal to the agent, so
    /// no retry happens at this stage. On success the event loop is handed
    /// to a background driver task, returned alongside the publisher.
    pub async fn connect(
        broker: &BrokerConfig,
        ack_timeout: Duration,
    ) -> Result<(Self, JoinHandle<()>), PublishError> {
        // MqttOptions::new panics on these
        if broker.client_id.is_empty() || broker.client_id.starts_with(' ') {
            return Err(PublishError::Connect(format!(
                "invalid client id {:?}",
                broker.client_id
            )));
        }
        let mut opts = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        opts.set_credentials(&broker.username, &broker.password);
        opts.set_keep_alive(KEEP_ALIVE);
        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);

        timeout(CONNECT_TIMEOUT, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                PublishError::Connect(format!("no CONNACK within {CONNECT_TIMEOUT:?}"))
            })??;
        info!(
            host = %broker.host,
            port = broker.port,
            client_id = %broker.client_id,
            "connected to broker"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (link, connected) = watch::channel(true);
        let driver = tokio::spawn(drive(eventloop, tx, link));
        Ok((
            Self {
                client,
                deliveries: Mutex::new(Deliveries { rx, owed: 0 }),
                connected,
                ack_timeout,
            },
            driver,
        ))
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Ask the driver to send DISCONNECT; it exits once that is on the wire.
    /// Gives up after a second if the event loop is busy reconnecting.
    pub async fn disconnect(&self) {
        match timeout(DISCONNECT_TIMEOUT, self.client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "disconnect request not delivered"),
            Err(_) => debug!("event loop did not take the disconnect request"),
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        let mut deliveries = self.deliveries.lock().await;
        if !self.is_connected() {
            return Err(PublishError::Disconnected);
        }
        deliveries.discard_stale();

        let mut handed_off = false;
        let delivery = async {
            self.client
                .publish_bytes(topic, QoS::AtLeastOnce, false, payload)
                .await?;
            handed_off = true;
            let pkid = deliveries.packet_id().await?;
            handed_off = false;
            deliveries.ack_for(pkid).await?;
            Ok::<_, PublishError>(pkid)
        };
        let outcome = timeout(self.ack_timeout, delivery).await;

        match outcome {
            Ok(Ok(pkid)) => {
                debug!(pkid, topic, "publish acknowledged");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                if handed_off {
                    deliveries.owed += 1;
                }
                Err(PublishError::Timeout(self.ack_timeout))
            }
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), PublishError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(PublishError::Connect(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(PublishError::Connect(e.to_string())),
        }
    }
}

/// Polls the event loop for the life of the connection. rumqttc reconnects
/// on the next poll after an error, so connection loss only costs a pause.
/// Whatever was unacked when the link dropped is thrown away instead of
/// being replayed on the new connection.
async fn drive(
    mut eventloop: EventLoop,
    deliveries: mpsc::UnboundedSender<Delivery>,
    link: watch::Sender<bool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = deliveries.send(Delivery::Sent(pkid));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = deliveries.send(Delivery::Acked(ack.pkid));
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("reconnected to broker");
                link.send_replace(true);
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                debug!(topic = %p.topic, bytes = p.payload.len(), "received message");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("disconnected from broker");
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => break,
            Err(e) => {
                if link.send_replace(false) {
                    warn!(error = %e, "connection lost");
                } else {
                    debug!(error = %e, "reconnect failed");
                }
                let dropped = eventloop.pending.len();
                eventloop.pending.clear();
                eventloop.state.events.clear();
                eventloop.state.collision = None;
                if dropped > 0 {
                    debug!(dropped, "discarded unacknowledged publishes");
                }
                let _ = deliveries.send(Delivery::Lost);
                sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
    link.send_replace(false);
}
