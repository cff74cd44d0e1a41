//! ==============================================================================
//! main.rs - sensor gateway entry point
//! ==============================================================================
//!
//! purpose:
//!     samples i2c environmental sensors and streams the readings to a cloud
//!     mqtt bridge that authenticates devices with short-lived signed tokens.
//!
//! responsibilities:
//!     - load and validate configuration, install logging
//!     - load the device private key and broker ca roots (fatal if missing)
//!     - start one worker thread per sensor
//!     - run the session manager, inbound dispatcher and publish loop
//!     - on ctrl-c / SIGTERM: stop sampling, release sensors, disconnect gracefully
//!
//! relationships:
//!     - config.rs: settings file
//!     - token.rs: credential minting
//!     - session/: broker connection, reconnect, config messages
//!     - sensor/: drivers and worker threads
//!     - publisher.rs: sample / aggregate / publish cycle
//!
//! architecture:
//!
//!     ┌────────────────────────────────────────────────────────────┐
//!     │                      gateway (this file)                   │
//!     │  ┌──────────────┐   publish   ┌──────────────────────────┐ │
//!     │  │ publish loop │ ──────────> │ session manager (actor)  │ │
//!     │  └──────┬───────┘   handle    └────────────┬─────────────┘ │
//!     │         │ read()                           │ config msgs   │
//!     │  ┌──────┴───────┐                 ┌────────┴───────────┐   │
//!     │  │ sensor       │                 │ inbound dispatcher │   │
//!     │  │ worker(s)    │                 └────────────────────┘   │
//!     │  └──────┬───────┘                          │               │
//!     └─────────┼──────────────────────────────────┼───────────────┘
//!               │ i2c                              │ mqtt + tls
//!        ┌──────┴──────┐                   ┌───────┴───────┐
//!        │ bme280, k30 │                   │  mqtt bridge  │
//!        └─────────────┘                   └───────────────┘
//!
//! ==============================================================================

mod batch;
mod config;
mod domain;
mod error;
mod hal;
mod logging;
mod publisher;
mod sensor;
mod session;
mod token;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use batch::BatchAggregator;
use config::GatewayConfig;
use publisher::{PublishLoop, PublishSettings};
use sensor::SensorWorker;
use session::{LoggingConfigHandler, MqttConnector, SessionManager, SessionSettings};
use token::TokenIssuer;

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: configuration and logging
    let path = GatewayConfig::locate(std::env::args().nth(1).map(PathBuf::from))?;
    let config = GatewayConfig::load(&path)?;
    logging::init_logging(&config.logging)?;
    info!(path = %path.display(), "sensor gateway starting");
    config.log_summary();

    // step 2: key material. a bad key or missing ca is fatal here and
    // nowhere else.
    let key = std::fs::read(&config.auth.private_key)
        .with_context(|| format!("failed to read private key {}", config.auth.private_key.display()))?;
    let issuer = TokenIssuer::from_pem(
        &key,
        config.auth.algorithm,
        &config.device.project,
        chrono::Duration::minutes(config.auth.token_validity_mins),
    )
    .context("unusable private key")?;
    info!(
        algorithm = ?config.auth.algorithm,
        validity_mins = issuer.validity().num_minutes(),
        "signing key loaded"
    );
    let ca = std::fs::read(&config.broker.ca_certs)
        .with_context(|| format!("failed to read ca roots {}", config.broker.ca_certs.display()))?;

    let cancel = CancellationToken::new();

    // step 3: session manager and inbound config messages
    let (inbound_tx, inbound_rx) = mpsc::channel(config.broker.inbound_queue_capacity);
    let connector = Arc::new(MqttConnector::new(&config.broker, ca));
    let (manager, handle) =
        SessionManager::new(connector, issuer, SessionSettings::from_config(&config), inbound_tx);
    let session_task = tokio::spawn(manager.run(cancel.clone()));
    let dispatcher_task = tokio::spawn(session::inbound::run_inbound_dispatcher(
        inbound_rx,
        Box::new(LoggingConfigHandler::new()),
        cancel.clone(),
    ));

    // step 4: sensors
    let aggregator = BatchAggregator::new(&config.telemetry.measurement, config.telemetry.tags.clone());
    let mut publish_loop = PublishLoop::new(aggregator, handle, PublishSettings::from_config(&config));
    for sensor_config in &config.sensors {
        let source = sensor::build(sensor_config);
        let worker = SensorWorker::spawn(source, Duration::from_millis(sensor_config.read_timeout_ms))
            .with_context(|| format!("failed to start worker for sensor {}", sensor_config.name))?;
        info!(sensor = %worker.name(), kind = %worker.kind(), polls = sensor_config.polls_per_batch, "sensor ready");
        publish_loop.add_sensor(worker, sensor_config.polls_per_batch);
    }

    // step 5: run until ctrl-c or SIGTERM
    let publish_task = tokio::spawn(publish_loop.run(cancel.clone()));

    let signal = wait_for_shutdown().await;
    info!(signal, "shutdown requested");
    cancel.cancel();

    match publish_task.await {
        Ok(stats) => info!(
            batches = stats.batches,
            published = stats.published,
            timeouts = stats.timeouts,
            failures = stats.failures,
            empty = stats.empty,
            "publish loop finished"
        ),
        Err(e) => warn!(error = %e, "publish loop ended abnormally"),
    }
    if let Err(e) = session_task.await {
        warn!(error = %e, "session task ended abnormally");
    }
    let _ = dispatcher_task.await;

    info!("sensor gateway stopped");
    Ok(())
}

/// Resolves on ctrl-c or, on unix, SIGTERM. Returns which one fired.
async fn wait_for_shutdown() -> &'static str {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for ctrl-c, shutting down");
            }
            "ctrl-c"
        }
        _ = terminate => "SIGTERM",
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sigterm_requests_shutdown() {
        let waiter = tokio::spawn(wait_for_shutdown());
        // let the waiter install its handler before the signal is raised
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let fired = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(fired, "SIGTERM");
    }
}
