//! Config messages pushed by the broker.
//!
//! The connection driver hands messages over with `forward`, which never
//! blocks: a full queue drops the message. A separate dispatcher task drains
//! the queue into a ConfigHandler so slow handling can't stall the session.

use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: &str, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Hand a message to the dispatcher without waiting. False if it was dropped.
pub fn forward(queue: &mpsc::Sender<InboundMessage>, message: InboundMessage) -> bool {
    match queue.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(message)) => {
            warn!(topic = %message.topic, size = message.payload.len(), "inbound queue full, dropping message");
            false
        }
        Err(mpsc::error::TrySendError::Closed(message)) => {
            debug!(topic = %message.topic, "inbound dispatcher gone, dropping message");
            false
        }
    }
}

/// Receives device configuration updates.
pub trait ConfigHandler: Send {
    fn handle(&mut self, message: &InboundMessage);
}

/// Logs each config message and tracks how many distinct versions arrived.
#[derive(Default)]
pub struct LoggingConfigHandler {
    received: u64,
    versions: u64,
    last_digest: Option<u64>,
}

impl LoggingConfigHandler {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn versions(&self) -> u64 {
        self.versions
    }
}

impl ConfigHandler for LoggingConfigHandler {
    fn handle(&mut self, message: &InboundMessage) {
        self.received += 1;

        let mut hasher = DefaultHasher::new();
        message.payload.hash(&mut hasher);
        let digest = hasher.finish();
        if self.last_digest != Some(digest) {
            self.versions += 1;
            self.last_digest = Some(digest);
        }

        info!(
            topic = %message.topic,
            size = message.payload.len(),
            version = self.versions,
            payload = %String::from_utf8_lossy(&message.payload),
            "device config received"
        );
    }
}

/// Drain the inbound queue until cancelled or every sender is gone.
pub async fn run_inbound_dispatcher(
    mut queue: mpsc::Receiver<InboundMessage>,
    mut handler: Box<dyn ConfigHandler>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => handler.handle(&message),
                None => break,
            },
        }
    }
    debug!("inbound dispatcher stopped");
}
