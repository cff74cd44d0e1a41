//! One OS thread per sensor.
//!
//! The thread owns the SensorSource (and so its device handle) for its whole
//! life. The async side sends read requests over a one-slot channel and waits
//! for the reply with a deadline, so a wedged bus can never stall the
//! sampling loop. When the request sender is dropped the thread returns and
//! the source is dropped with it.

use super::SensorSource;
use crate::domain::{Reading, SensorKind};
use crate::error::SensorReadError;

use chrono::Utc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type ReadRequest = oneshot::Sender<Reading>;

pub struct SensorWorker {
    name: String,
    kind: SensorKind,
    tag: String,
    read_timeout: Duration,
    requests: Option<mpsc::Sender<ReadRequest>>,
    thread: Option<JoinHandle<()>>,
}

impl SensorWorker {
    pub fn spawn(mut source: Box<dyn SensorSource>, read_timeout: Duration) -> std::io::Result<Self> {
        let name = source.name().to_string();
        let kind = source.kind();
        let tag = source.tag().to_string();
        let (tx, mut rx) = mpsc::channel::<ReadRequest>(1);

        let thread = std::thread::Builder::new()
            .name(format!("sensor-{}", name))
            .spawn(move || {
                while let Some(reply) = rx.blocking_recv() {
                    let reading = source.read();
                    let _ = reply.send(reading);
                }
                drop(source);
            })?;

        debug!(sensor = %name, "sensor worker started");
        Ok(Self {
            name,
            kind,
            tag,
            read_timeout,
            requests: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Poll the sensor once. Never waits longer than the read timeout.
    pub async fn read(&self) -> Reading {
        match self.request().await {
            Ok(reading) => reading,
            Err(e) => {
                warn!(sensor = %self.name, error = %e, "sensor read failed");
                Reading::invalid(self.kind, &self.tag, Utc::now())
            }
        }
    }

    async fn request(&self) -> Result<Reading, SensorReadError> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| SensorReadError::Unavailable("worker stopped".to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        requests.try_send(reply_tx).map_err(|e| match e {
            // previous read is still stuck on the bus
            mpsc::error::TrySendError::Full(_) => SensorReadError::Unavailable("previous read still in progress".to_string()),
            mpsc::error::TrySendError::Closed(_) => SensorReadError::Unavailable("worker exited".to_string()),
        })?;

        match tokio::time::timeout(self.read_timeout, reply_rx).await {
            Ok(Ok(reading)) => Ok(reading),
            Ok(Err(_)) => Err(SensorReadError::Unavailable("worker exited".to_string())),
            Err(_) => Err(SensorReadError::Timeout(self.read_timeout.as_millis() as u64)),
        }
    }

    /// Stop the thread and wait (bounded) for the device to be released.
    pub async fn shutdown(mut self, wait: Duration) {
        self.requests.take();
        let Some(thread) = self.thread.take() else { return };

        let joined = tokio::time::timeout(wait, tokio::task::spawn_blocking(move || thread.join())).await;
        match joined {
            Ok(Ok(Ok(()))) => debug!(sensor = %self.name, "sensor released"),
            Ok(_) => warn!(sensor = %self.name, "sensor worker panicked"),
            Err(_) => warn!(sensor = %self.name, "sensor still busy at shutdown, abandoning thread"),
        }
    }
}
