//! ==============================================================================
//! publisher.rs - the sample / aggregate / publish cycle
//! ==============================================================================
//!
//! one batch = N sampling cycles, N = the largest polls_per_batch of any
//! sensor. a sensor with polls_per_batch = k is polled in the last k cycles,
//! so every sensor's final poll lands in the final cycle. the loop sleeps
//! sample_interval after each cycle, then serializes and publishes the batch
//! on the events topic.
//!
//! publish failures never stop the loop. the batch is reported and dropped;
//! the session manager owns recovery.
//!
//! ==============================================================================

use crate::batch::{Batch, BatchAggregator, Format};
use crate::config::GatewayConfig;
use crate::domain::{FieldValue, Reading};
use crate::error::SessionError;
use crate::sensor::SensorWorker;
use crate::session::{qos_from_level, PublishOutcome, SessionHandle};

use rumqttc::QoS;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a finished batch was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchResult {
    Published,
    TimedOut,
    /// no valid readings and empty batches are not published
    SkippedEmpty,
    /// session not connected, or the publish faulted the connection
    Failed,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub topic: String,
    pub format: Format,
    pub sample_interval: Duration,
    pub qos: QoS,
    pub retain: bool,
    pub publish_timeout: Duration,
    pub publish_empty_batches: bool,
    pub show_sensor_data: bool,
    /// how long shutdown waits for each sensor to be released
    pub release_timeout: Duration,
}

impl PublishSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            topic: config.device.events_topic(),
            format: config.telemetry.format,
            sample_interval: config.sample_interval(),
            qos: qos_from_level(config.broker.qos),
            retain: config.broker.retain,
            publish_timeout: config.broker.publish_timeout(),
            publish_empty_batches: config.telemetry.publish_empty_batches,
            show_sensor_data: config.logging.show_sensor_data,
            release_timeout: Duration::from_millis(crate::config::MAX_READ_TIMEOUT_MS * 2),
        }
    }
}

struct ScheduledSensor {
    worker: SensorWorker,
    polls_per_batch: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PublishStats {
    pub batches: u64,
    pub published: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub empty: u64,
}

pub struct PublishLoop {
    sensors: Vec<ScheduledSensor>,
    aggregator: BatchAggregator,
    session: SessionHandle,
    settings: PublishSettings,
    stats: PublishStats,
}

impl PublishLoop {
    pub fn new(aggregator: BatchAggregator, session: SessionHandle, settings: PublishSettings) -> Self {
        Self {
            sensors: Vec::new(),
            aggregator,
            session,
            settings,
            stats: PublishStats::default(),
        }
    }

    pub fn add_sensor(&mut self, worker: SensorWorker, polls_per_batch: u32) {
        self.sensors.push(ScheduledSensor { worker, polls_per_batch: polls_per_batch.max(1) });
    }

    /// cycles per batch
    pub fn cycles(&self) -> u32 {
        self.sensors.iter().map(|s| s.polls_per_batch).max().unwrap_or(1)
    }

    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    /// Run N sampling cycles. `None` if cancelled part way; the partial
    /// batch is discarded.
    pub async fn collect_batch(&mut self, cancel: &CancellationToken) -> Option<Batch> {
        let cycles = self.cycles();
        let mut batch = self.aggregator.new_batch();

        for cycle in 0..cycles {
            for sensor in &self.sensors {
                if cycle < cycles - sensor.polls_per_batch {
                    continue;
                }
                let reading = sensor.worker.read().await;
                if reading.valid && self.settings.show_sensor_data {
                    info!(sensor = %sensor.worker.name(), values = %describe(&reading), "reading");
                }
                self.aggregator.append(&mut batch, reading);
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.sample_interval) => {}
            }
        }
        Some(batch)
    }

    pub async fn publish_batch(&mut self, batch: &Batch) -> BatchResult {
        self.stats.batches += 1;

        if batch.is_empty() {
            self.stats.empty += 1;
            warn!(dropped = batch.dropped(), "no valid readings this round");
            if !self.settings.publish_empty_batches {
                return BatchResult::SkippedEmpty;
            }
        }

        let payload = self.aggregator.serialize(batch, self.settings.format);
        let size = payload.len();
        let result = self
            .session
            .publish(
                &self.settings.topic,
                payload,
                self.settings.qos,
                self.settings.retain,
                self.settings.publish_timeout,
            )
            .await;

        match result {
            Ok(PublishOutcome::Acked) => {
                self.stats.published += 1;
                info!(topic = %self.settings.topic, readings = batch.len(), size, "batch published");
                BatchResult::Published
            }
            Ok(PublishOutcome::Timeout) => {
                self.stats.timeouts += 1;
                warn!(
                    topic = %self.settings.topic,
                    timeout_ms = self.settings.publish_timeout.as_millis() as u64,
                    "publish not acknowledged in time"
                );
                BatchResult::TimedOut
            }
            Err(SessionError::NotConnected) => {
                self.stats.failures += 1;
                warn!(readings = batch.len(), state = %self.session.state(), "session not connected, batch dropped");
                BatchResult::Failed
            }
            Err(e) => {
                // the session already reported the fault
                self.stats.failures += 1;
                debug!(readings = batch.len(), error = %e, "publish failed, batch dropped");
                BatchResult::Failed
            }
        }
    }

    /// Sample and publish until cancelled, then release every sensor.
    pub async fn run(mut self, cancel: CancellationToken) -> PublishStats {
        info!(
            cycles = self.cycles(),
            sensors = self.sensors.len(),
            topic = %self.settings.topic,
            "publish loop started"
        );

        while !cancel.is_cancelled() {
            let Some(batch) = self.collect_batch(&cancel).await else { break };
            self.publish_batch(&batch).await;
        }

        let stats = self.stats;
        let wait = self.settings.release_timeout;
        for sensor in self.sensors {
            sensor.worker.shutdown(wait).await;
        }
        debug!(?stats, dropped_readings = self.aggregator.dropped_total(), "publish loop stopped");
        stats
    }
}

/// `name=value` pairs for the sensor data log
fn describe(reading: &Reading) -> String {
    reading
        .fields
        .iter()
        .map(|f| match f.value {
            FieldValue::Float(v) => format!("{}={:.2}", f.name, v),
            FieldValue::Int(v) => format!("{}={}", f.name, v),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
