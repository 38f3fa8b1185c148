//! Connection settings of one device, loaded from YAML.
//!
//! ```yaml
//! host: 192.168.1.50
//! transport: solarman
//! serial: "2712345678"
//! model: deye-sun-sg
//! refresh_interval: 30s
//! batching:
//!   max_gap: 10
//!   max_words: 100
//! ```

use crate::{
    batching::BatchConfig,
    queue::CommandQueue,
    retry::RetryPolicy,
    transport::{solarman, DeviceTransport, ModbusTcpTransport, SolarmanTransport},
    Error, Result,
};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct Modbus/TCP.
    #[default]
    Modbus,
    /// Modbus tunnelled through a Solarman data logger.
    Solarman,
}

impl TransportKind {
    pub const fn default_port(&self) -> u16 {
        match self {
            TransportKind::Modbus => ModbusTcpTransport::DEFAULT_PORT,
            TransportKind::Solarman => SolarmanTransport::DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> Duration {
    CommandQueue::DEFAULT_POLL_INTERVAL
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    /// Defaults to the well-known port of the transport.
    pub port: Option<u16>,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default)]
    pub transport: TransportKind,
    /// Logger serial number, required for Solarman.
    pub serial: Option<String>,
    /// Device model id, see [`crate::catalog::models`].
    pub model: String,
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub batching: BatchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_unit_id() -> u8 {
    0x01
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

impl DeviceConfig {
    /// Settings with defaults for everything but the connection target.
    pub fn new(
        host: impl Into<String>,
        transport: TransportKind,
        model: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: None,
            unit_id: default_unit_id(),
            transport,
            serial: None,
            model: model.into(),
            refresh_interval: default_refresh_interval(),
            enabled: default_enabled(),
            timeout: default_timeout(),
            batching: BatchConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading device config from {path:?}");
        let file = File::open(path)
            .map_err(|err| Error::Config(format!("Cannot open {}: {err}", path.display())))?;
        serde_yaml::from_reader(file)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.transport.default_port())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.transport == TransportKind::Solarman {
            match &self.serial {
                Some(serial) => {
                    solarman::logger_serial(serial)?;
                }
                None => {
                    return Err(Error::Config(
                        "the solarman transport requires the logger serial".into(),
                    ))
                }
            }
        }
        if !(1..=BatchConfig::MODBUS_MAX_WORDS).contains(&self.batching.max_words) {
            return Err(Error::Config(format!(
                "batching.max_words must be within 1..={}, got {}",
                BatchConfig::MODBUS_MAX_WORDS,
                self.batching.max_words
            )));
        }
        if self.retry.attempts == 0 {
            return Err(Error::Config("retry.attempts must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must not be zero".into()));
        }
        Ok(())
    }

    /// Creates the transport selected by [`DeviceConfig::transport`].
    pub fn build_transport(&self) -> Result<DeviceTransport> {
        Ok(match self.transport {
            TransportKind::Modbus => DeviceTransport::Modbus(ModbusTcpTransport::new(
                &self.host,
                self.port(),
                self.unit_id,
                self.timeout,
            )),
            TransportKind::Solarman => {
                let serial = self.serial.as_deref().ok_or_else(|| {
                    Error::Config("the solarman transport requires the logger serial".into())
                })?;
                DeviceTransport::Solarman(SolarmanTransport::new(
                    &self.host,
                    self.port(),
                    solarman::logger_serial(serial)?,
                    self.unit_id,
                    self.timeout,
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use assert_matches::assert_matches;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = DeviceConfig::from_yaml_str("host: 10.0.0.2\nmodel: sungrow-sh-rt\n").unwrap();
        assert_eq!(config.transport, TransportKind::Modbus);
        assert_eq!(config.port(), 502);
        assert_eq!(config.unit_id, 1);
        assert!(config.enabled);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.refresh_interval, Duration::from_secs(30));
        assert_eq!(config.batching, BatchConfig::default());
        assert_eq!(config.queue.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry, RetryPolicy::default());
        config.validate().unwrap();
    }

    #[test]
    fn full_solarman_config() {
        let yaml = r#"
host: 192.168.1.50
transport: solarman
serial: "2712345678"
model: deye-sun-sg
unit_id: 1
refresh_interval: 1m
enabled: false
timeout: 3s
batching:
  max_gap: 4
  max_words: 60
queue:
  poll_interval: 500ms
retry:
  attempts: 4
  backoff: 2s
"#;
        let config = DeviceConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.transport, TransportKind::Solarman);
        assert_eq!(config.port(), 8899);
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert!(!config.enabled);
        assert_eq!(config.batching.max_gap, 4);
        assert_eq!(config.batching.max_words, 60);
        assert_eq!(config.queue.poll_interval, Duration::from_millis(500));
        assert_eq!(config.retry.attempts, 4);
        assert_eq!(config.retry.backoff, Duration::from_secs(2));
        config.validate().unwrap();
        assert_matches!(config.build_transport(), Ok(DeviceTransport::Solarman(..)));
        let device = Device::from_config(&config).unwrap();
        assert_eq!(device.model().id, "deye-sun-sg");
    }

    #[test]
    fn rejects_invalid_settings() {
        let mut config = DeviceConfig::new("10.0.0.2", TransportKind::Solarman, "deye-sun-sg");
        assert_matches!(config.validate(), Err(Error::Config(..)));
        config.serial = Some("LOGGER-1".into());
        assert_matches!(config.validate(), Err(Error::Config(..)));
        config.serial = Some("2712345678".into());
        config.validate().unwrap();

        config.batching.max_words = 126;
        assert_matches!(config.validate(), Err(Error::Config(..)));
        config.batching.max_words = 0;
        assert_matches!(config.validate(), Err(Error::Config(..)));
        config.batching.max_words = 125;
        config.retry.attempts = 0;
        assert_matches!(config.validate(), Err(Error::Config(..)));
    }

    #[test]
    fn unknown_model_and_bad_yaml() {
        let config = DeviceConfig::new("10.0.0.2", TransportKind::Modbus, "sma");
        assert_matches!(Device::from_config(&config), Err(Error::Config(..)));
        assert_matches!(
            DeviceConfig::from_yaml_str("host: [unterminated"),
            Err(Error::Config(..))
        );
        assert_matches!(
            DeviceConfig::from_yaml_str("host: 10.0.0.2\nmodel: x\ntransport: rtu\n"),
            Err(Error::Config(..))
        );
    }
}
