//! rumqttc implementation of Connector / BrokerLink.
//!
//! connect() polls a fresh EventLoop until the broker's CONNACK, then hands
//! the loop to a driver task. The driver forwards config publishes to the
//! inbound queue, reports outgoing/ack packet ids back to the link, and
//! reports the first connection error on a oneshot. It never reconnects on
//! its own; the session manager replaces the whole link.

use super::inbound::{self, InboundMessage};
use super::{BrokerLink, Connector, PublishOutcome};
use crate::config::BrokerConfig;
use crate::error::SessionError;
use crate::token::Credential;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubAck, SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// the bridge ignores the username; the jwt goes in the password
const BRIDGE_USERNAME: &str = "unused";

pub struct MqttConnector {
    host: String,
    port: u16,
    keep_alive: Duration,
    ca: Vec<u8>,
}

impl MqttConnector {
    /// `ca` is the PEM bundle of trusted roots for the broker.
    pub fn new(broker: &BrokerConfig, ca: Vec<u8>) -> Self {
        Self {
            host: broker.host.clone(),
            port: broker.port,
            keep_alive: Duration::from_secs(broker.keep_alive_secs),
            ca,
        }
    }

    fn options(&self, credential: &Credential) -> MqttOptions {
        let mut options = MqttOptions::new(&credential.subject, &self.host, self.port);
        options.set_credentials(BRIDGE_USERNAME, &credential.token);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: self.ca.clone(),
            alpn: None,
            client_auth: None,
        }));
        options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        credential: &Credential,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Box<dyn BrokerLink>, SessionError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(credential), 16);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(refused(ack.code));
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(classify(e)),
            }
        }
        info!(host = %self.host, port = self.port, "connected to broker");

        let (acks_tx, acks) = mpsc::unbounded_channel();
        let (closed_tx, closed) = oneshot::channel();
        let driver = tokio::spawn(drive(eventloop, inbound, acks_tx, closed_tx));

        Ok(Box::new(MqttLink::new(client, acks, closed, driver)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckEvent {
    /// publish written to the socket
    Sent(u16),
    /// PUBACK received
    Acked(u16),
    Subscribed { granted: bool },
}

fn refused(code: ConnectReturnCode) -> SessionError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            SessionError::Auth(format!("broker refused credential: {:?}", code))
        }
        other => SessionError::Transport(format!("broker refused connection: {:?}", other)),
    }
}

fn granted(ack: &SubAck) -> bool {
    !ack.return_codes.is_empty()
        && ack
            .return_codes
            .iter()
            .all(|code| !matches!(code, SubscribeReasonCode::Failure))
}

fn classify(error: ConnectionError) -> SessionError {
    match error {
        ConnectionError::ConnectionRefused(code) => refused(code),
        other => SessionError::Transport(other.to_string()),
    }
}

async fn drive(
    mut eventloop: EventLoop,
    inbound: mpsc::Sender<InboundMessage>,
    acks: mpsc::UnboundedSender<AckEvent>,
    closed: oneshot::Sender<SessionError>,
) {
    let mut dropped = 0u64;
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(&publish.topic, publish.payload.to_vec());
                if !inbound::forward(&inbound, message) {
                    dropped += 1;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = acks.send(AckEvent::Acked(ack.pkid));
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let _ = acks.send(AckEvent::Subscribed { granted: granted(&ack) });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                break SessionError::Transport("broker sent DISCONNECT".to_string());
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = acks.send(AckEvent::Sent(pkid));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                break SessionError::Closed;
            }
            Ok(_) => {}
            Err(e) => break classify(e),
        }
    };

    if dropped > 0 {
        warn!(dropped, "inbound messages dropped on this connection");
    }
    debug!(reason = %reason, "connection driver stopped");
    let _ = closed.send(reason);
}

/// Publishes leave the event loop in request order, so the n-th
/// `Outgoing::Publish` belongs to the n-th accepted request. `requested` and
/// `written` count both sides; requests abandoned on timeout still consume
/// their slot.
struct MqttLink {
    client: AsyncClient,
    acks: mpsc::UnboundedReceiver<AckEvent>,
    closed: Option<oneshot::Receiver<SessionError>>,
    driver: JoinHandle<()>,
    requested: u64,
    written: u64,
}

impl MqttLink {
    fn new(
        client: AsyncClient,
        acks: mpsc::UnboundedReceiver<AckEvent>,
        closed: oneshot::Receiver<SessionError>,
        driver: JoinHandle<()>,
    ) -> Self {
        Self { client, acks, closed: Some(closed), driver, requested: 0, written: 0 }
    }

    /// forget events left over from an earlier, timed-out request, keeping
    /// the write count in step
    fn drain_stale(&mut self) {
        while let Ok(event) = self.acks.try_recv() {
            if let AckEvent::Sent(_) = event {
                self.written += 1;
            }
        }
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        self.drain_stale();
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        while let Some(event) = self.acks.recv().await {
            match event {
                AckEvent::Subscribed { granted: true } => return Ok(()),
                AckEvent::Subscribed { granted: false } => {
                    return Err(SessionError::Subscribe {
                        topic: topic.to_string(),
                        reason: "broker rejected subscription".to_string(),
                    })
                }
                AckEvent::Sent(_) => self.written += 1,
                AckEvent::Acked(_) => {}
            }
        }
        Err(SessionError::Transport("connection lost while subscribing".to_string()))
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        timeout: Duration,
    ) -> Result<PublishOutcome, SessionError> {
        self.drain_stale();
        if let Err(e) = self.client.try_publish(topic, qos, retain, payload) {
            if self.driver.is_finished() {
                return Err(SessionError::Transport(e.to_string()));
            }
            debug!(topic = %topic, "request queue full, publish not queued");
            return Ok(PublishOutcome::Timeout);
        }
        let seq = self.requested;
        self.requested += 1;

        let acks = &mut self.acks;
        let written = &mut self.written;
        let confirmed = async {
            let mut sent = None;
            while let Some(event) = acks.recv().await {
                match event {
                    AckEvent::Sent(pkid) => {
                        let index = *written;
                        *written += 1;
                        if index != seq {
                            continue;
                        }
                        if qos == QoS::AtMostOnce {
                            return true;
                        }
                        sent = Some(pkid);
                    }
                    AckEvent::Acked(pkid) if sent == Some(pkid) => return true,
                    _ => {}
                }
            }
            false
        };

        match tokio::time::timeout(timeout, confirmed).await {
            Ok(true) => Ok(PublishOutcome::Acked),
            Ok(false) => Err(SessionError::Transport("connection lost awaiting ack".to_string())),
            Err(_) => Ok(PublishOutcome::Timeout),
        }
    }

    async fn closed(&mut self) -> SessionError {
        let Some(closed) = self.closed.as_mut() else {
            return SessionError::Closed;
        };
        let reason = closed
            .await
            .unwrap_or_else(|_| SessionError::Transport("connection driver stopped".to_string()));
        self.closed = None;
        reason
    }

    async fn disconnect(&mut self, timeout: Duration) {
        if self.client.try_disconnect().is_ok() {
            let _ = tokio::time::timeout(timeout, &mut self.driver).await;
        }
        self.driver.abort();
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
