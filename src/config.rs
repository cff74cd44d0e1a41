//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `gateway.toml`.
//!     loaded once at startup, validated, then handed to every component
//!     as an immutable value. nothing reads configuration after that.
//!
//! structure:
//!     - DeviceConfig: project / region / registry / device identity.
//!     - BrokerConfig: bridge endpoint, ca bundle, timeouts, backoff.
//!     - AuthConfig: private key and token lifetime.
//!     - TelemetryConfig: measurement name, wire format, sampling cadence.
//!     - SensorConfig: one entry per physical sensor.
//!     - LoggingConfig: level and output style.
//!
//! ==============================================================================

use crate::batch::Format;
use crate::token::SigningAlgorithm;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// longest a single sensor read may block the sampling loop
pub const MAX_READ_TIMEOUT_MS: u64 = 2000;

/// the bridge refuses tokens that expire more than a day after issue
pub const MAX_TOKEN_VALIDITY_MINS: i64 = 24 * 60;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    pub project: String,
    pub region: String,
    pub registry: String,
    pub device: String,
}

impl DeviceConfig {
    /// mqtt client id, also the credential subject
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project, self.region, self.registry, self.device
        )
    }

    pub fn config_topic(&self) -> String {
        format!("devices/{}/config", self.device)
    }

    pub fn events_topic(&self) -> String {
        format!("devices/{}/events", self.device)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// PEM bundle of trusted roots
    pub ca_certs: PathBuf,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub qos: u8,
    pub retain: bool,
    pub shutdown_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub inbound_queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "mqtt.googleapis.com".to_string(),
            port: 8883,
            ca_certs: PathBuf::from("roots.pem"),
            keep_alive_secs: 60,
            connect_timeout_ms: 10_000,
            publish_timeout_ms: 5_000,
            qos: 1,
            retain: false,
            shutdown_timeout_ms: 250,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 60_000,
            inbound_queue_capacity: 32,
        }
    }
}

impl BrokerConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub private_key: PathBuf,
    #[serde(default)]
    pub algorithm: SigningAlgorithm,
    #[serde(default = "default_token_validity_mins")]
    pub token_validity_mins: i64,
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: i64,
}

fn default_token_validity_mins() -> i64 {
    24 * 60
}

fn default_refresh_margin_secs() -> i64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    pub measurement: String,
    pub format: Format,
    pub sample_interval_ms: u64,
    pub publish_empty_batches: bool,
    /// extra tags written on every record
    pub tags: BTreeMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            measurement: "googleCoreIOT".to_string(),
            format: Format::LineProtocol,
            sample_interval_ms: 1500,
            publish_empty_batches: false,
            tags: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SensorDriver {
    Bme280,
    K30,
    SimulatedClimate,
    SimulatedCo2,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    pub name: String,
    pub driver: SensorDriver,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,
    /// driver default when absent
    #[serde(default)]
    pub i2c_address: Option<u16>,
    /// how many sampling cycles this sensor is polled in per batch
    #[serde(default = "default_polls_per_batch")]
    pub polls_per_batch: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_i2c_bus() -> u8 {
    1
}

fn default_polls_per_batch() -> u32 {
    1
}

fn default_read_timeout_ms() -> u64 {
    MAX_READ_TIMEOUT_MS
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true, json: false }
    }
}

impl GatewayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config path: explicit argument, `GATEWAY_CONFIG`, then
    /// the usual locations relative to the working directory.
    pub fn locate(explicit: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = explicit.or_else(|| std::env::var_os("GATEWAY_CONFIG").map(PathBuf::from)) {
            return Ok(path);
        }

        let paths = [
            PathBuf::from("config").join("gateway.toml"),
            PathBuf::from("..").join("config").join("gateway.toml"),
        ];
        paths
            .into_iter()
            .find(|p| p.exists())
            .context("no config file found (pass a path, set GATEWAY_CONFIG, or create config/gateway.toml)")
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.device;
        for (field, value) in [
            ("device.project", &d.project),
            ("device.region", &d.region),
            ("device.registry", &d.registry),
            ("device.device", &d.device),
        ] {
            if value.trim().is_empty() {
                bail!("{} must not be empty", field);
            }
        }

        if self.broker.qos > 1 {
            bail!("broker.qos must be 0 or 1 (got {})", self.broker.qos);
        }
        if self.broker.publish_timeout_ms == 0 || self.broker.connect_timeout_ms == 0 {
            bail!("broker timeouts must be positive");
        }
        if self.broker.reconnect_initial_ms == 0 || self.broker.reconnect_max_ms < self.broker.reconnect_initial_ms {
            bail!("broker.reconnect_initial_ms must be positive and <= reconnect_max_ms");
        }
        if self.broker.inbound_queue_capacity == 0 {
            bail!("broker.inbound_queue_capacity must be positive");
        }
        if !(1..=MAX_TOKEN_VALIDITY_MINS).contains(&self.auth.token_validity_mins) {
            bail!("auth.token_validity_mins must be between 1 and {}", MAX_TOKEN_VALIDITY_MINS);
        }
        let validity_secs = self.auth.token_validity_mins.checked_mul(60).unwrap_or(i64::MAX);
        if self.auth.refresh_margin_secs < 0 || self.auth.refresh_margin_secs >= validity_secs {
            bail!("auth.refresh_margin_secs must be shorter than the token validity");
        }
        if self.telemetry.sample_interval_ms == 0 {
            bail!("telemetry.sample_interval_ms must be positive");
        }
        if self.telemetry.measurement.trim().is_empty() {
            bail!("telemetry.measurement must not be empty");
        }

        if self.sensors.is_empty() {
            bail!("at least one [[sensors]] entry is required");
        }
        for s in &self.sensors {
            if s.polls_per_batch == 0 {
                bail!("sensor {}: polls_per_batch must be positive", s.name);
            }
            if s.read_timeout_ms == 0 || s.read_timeout_ms > MAX_READ_TIMEOUT_MS {
                bail!("sensor {}: read_timeout_ms must be in 1..={}", s.name, MAX_READ_TIMEOUT_MS);
            }
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry.sample_interval_ms)
    }

    /// Print configuration summary
    pub fn log_summary(&self) {
        tracing::info!(
            client_id = %self.device.client_id(),
            broker = %format!("{}:{}", self.broker.host, self.broker.port),
            measurement = %self.telemetry.measurement,
            format = ?self.telemetry.format,
            interval_ms = self.telemetry.sample_interval_ms,
            sensors = self.sensors.len(),
            "gateway configuration"
        );
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const MINIMAL: &str = r#"
[device]
project = "my-project"
region = "us-central1"
registry = "my-registry"
device = "pi-01"

[auth]
private_key = "rsa_private.pem"

[[sensors]]
name = "climate"
driver = "bme280"
polls_per_batch = 4

[[sensors]]
name = "co2"
driver = "k30"
i2c_address = 0x68
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = GatewayConfig::parse(MINIMAL).unwrap();

        assert_eq!(config.broker.host, "mqtt.googleapis.com");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.publish_timeout(), Duration::from_secs(5));
        assert_eq!(config.auth.algorithm, SigningAlgorithm::Rs256);
        assert_eq!(config.auth.token_validity_mins, 1440);
        assert_eq!(config.telemetry.measurement, "googleCoreIOT");
        assert_eq!(config.telemetry.format, Format::LineProtocol);
        assert_eq!(config.sample_interval(), Duration::from_millis(1500));
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.sensors[0].driver, SensorDriver::Bme280);
        assert_eq!(config.sensors[0].polls_per_batch, 4);
        assert_eq!(config.sensors[1].i2c_address, Some(0x68));
        assert_eq!(config.sensors[1].read_timeout_ms, MAX_READ_TIMEOUT_MS);
    }

    #[test]
    fn test_identity_strings() {
        let config = GatewayConfig::parse(MINIMAL).unwrap();
        assert_eq!(
            config.device.client_id(),
            "projects/my-project/locations/us-central1/registries/my-registry/devices/pi-01"
        );
        assert_eq!(config.device.config_topic(), "devices/pi-01/config");
        assert_eq!(config.device.events_topic(), "devices/pi-01/events");
    }

    #[test]
    fn test_empty_identifier_rejected() {
        let bad = MINIMAL.replace(r#"device = "pi-01""#, r#"device = """#);
        let err = GatewayConfig::parse(&bad).unwrap_err();
        assert!(err.to_string().contains("device.device"));
    }

    #[test]
    fn test_read_timeout_bound() {
        let bad = MINIMAL.replace("polls_per_batch = 4", "polls_per_batch = 4\nread_timeout_ms = 5000");
        assert!(GatewayConfig::parse(&bad).is_err());
    }

    #[test]
    fn test_token_validity_bound() {
        let at_cap = MINIMAL.replace(
            r#"private_key = "rsa_private.pem""#,
            &format!("private_key = \"rsa_private.pem\"\ntoken_validity_mins = {}", MAX_TOKEN_VALIDITY_MINS),
        );
        assert!(GatewayConfig::parse(&at_cap).is_ok());

        for bad in [0, MAX_TOKEN_VALIDITY_MINS + 1, i64::MAX] {
            let config = MINIMAL.replace(
                r#"private_key = "rsa_private.pem""#,
                &format!("private_key = \"rsa_private.pem\"\ntoken_validity_mins = {}", bad),
            );
            let err = GatewayConfig::parse(&config).unwrap_err();
            assert!(err.to_string().contains("token_validity_mins"), "{}", err);
        }
    }

    #[test]
    fn test_qos_bound() {
        let bad = format!("{}\n[broker]\nqos = 2\n", MINIMAL);
        assert!(GatewayConfig::parse(&bad).is_err());
    }

    #[test]
    fn test_no_sensors_rejected() {
        let without = &MINIMAL[..MINIMAL.find("[[sensors]]").unwrap()];
        let bad = format!("sensors = []\n{}", without);
        let err = GatewayConfig::parse(&bad).unwrap_err();
        assert!(err.to_string().contains("sensors"));
    }

    #[test]
    fn test_json_format_and_simulated_driver() {
        let cfg = MINIMAL
            .replace(r#"driver = "bme280""#, r#"driver = "simulated-climate""#)
            .replace("[auth]", "[telemetry]\nformat = \"json\"\nmeasurement = \"env\"\n\n[auth]");
        let config = GatewayConfig::parse(&cfg).unwrap();
        assert_eq!(config.telemetry.format, Format::Structured);
        assert_eq!(config.telemetry.measurement, "env");
        assert_eq!(config.sensors[0].driver, SensorDriver::SimulatedClimate);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.device.device, "pi-01");
    }

    #[test]
    fn test_shipped_sample_is_valid() {
        let config = GatewayConfig::parse(include_str!("../config/gateway.toml")).unwrap();
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.sensors[0].i2c_address, Some(0x76));
        assert_eq!(config.broker.qos, 1);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(GatewayConfig::load("/nonexistent/gateway.toml").is_err());
    }

    #[test]
    fn test_locate_prefers_explicit_path() {
        let path = GatewayConfig::locate(Some(PathBuf::from("/tmp/x.toml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x.toml"));
    }
}
