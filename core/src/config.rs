use std::{
    boxed::Box,
    error::Error,
    path::{Path, PathBuf},
    string::{String, ToString},
    vec,
};

use crate::{AdcResolution, VoltageScale, MAX_SAMPLES};

pub const CONFIG_FILE_NAME: &str = "node-config.toml";

/// Highest accepted reference voltage. Keeps every reading printable in a
/// telemetry payload.
pub const MAX_REFERENCE_VOLTAGE: f64 = 1000.0;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub acquisition: AcquisitionConfig,
    pub clock: ClockConfig,
    pub storage: StorageConfig,
    pub delivery: DeliveryConfig,
    pub upload: UploadConfig,
    pub broker: BrokerConfig,
}

/// Credentials for the link layer. The node itself never joins a network.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub sample_count: usize,
    pub adc_resolution_bits: u8,
    pub reference_voltage: f64,
    pub settle_time_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_count: 499,
            adc_resolution_bits: 12,
            reference_voltage: 3.3,
            settle_time_ms: 1000,
        }
    }
}

impl AcquisitionConfig {
    pub fn resolution(&self) -> Result<AdcResolution, ConfigError> {
        AdcResolution::new(self.adc_resolution_bits)
            .ok_or(ConfigError::AdcResolution(self.adc_resolution_bits))
    }

    pub fn scale(&self) -> Result<VoltageScale, ConfigError> {
        Ok(VoltageScale::new(self.reference_voltage, self.resolution()?))
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub utc_offset_hours: i8,
    /// SNTP server as `host:port`. The host clock is used when absent.
    pub time_server: Option<String>,
    pub time_server_timeout_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: -7,
            time_server: None,
            time_server_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Naming {
    Timestamp,
    Counter,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub naming: Naming,
    pub extension: String,
    pub counter_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("sd"),
            naming: Naming::Timestamp,
            extension: "csv".to_string(),
            counter_prefix: "data_".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Wait for inbound commands, persist, then upload the stored artifact.
    Pull,
    /// Capture once and publish every sample over MQTT.
    Push,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub profile: Profile,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            profile: Profile::Pull,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub listen_port: u16,
    pub command_token: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub content_type: String,
    pub chunk_size: usize,
    pub chunk_pause_ms: u64,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            listen_port: 80,
            command_token: "GET_DATA".to_string(),
            host: "192.168.0.69".to_string(),
            port: 5000,
            path: "/upload".to_string(),
            content_type: "text/csv".to_string(),
            chunk_size: 64,
            chunk_pause_ms: 10,
            connect_timeout_ms: 5000,
            io_timeout_ms: 10_000,
            request_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Defaults to `<client_id>/telemetry` when empty.
    pub topic: String,
    pub reconnect_delay_ms: u64,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "test.mosquitto.org".to_string(),
            port: 1883,
            client_id: "decay-node".to_string(),
            topic: String::new(),
            reconnect_delay_ms: 5000,
            keep_alive_secs: 5,
            connect_timeout_ms: 5000,
        }
    }
}

impl BrokerConfig {
    pub fn telemetry_topic(&self) -> String {
        if !self.topic.is_empty() {
            return self.topic.clone();
        }

        match crate::topics::telemetry_topic(&self.client_id) {
            Some(topic) => topic.as_str().to_string(),
            None => std::format!("{}/telemetry", self.client_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("sample_count must be between 1 and {max}, got {got}")]
    SampleCount { got: usize, max: usize },
    #[error("adc_resolution_bits must be between 1 and 16, got {0}")]
    AdcResolution(u8),
    #[error("reference_voltage must be above 0 and at most 1000 V, got {0}")]
    ReferenceVoltage(f64),
    #[error("chunk_size must be at least 1")]
    ChunkSize,
    #[error("the {profile:?} profile requires {expected:?} artifact naming")]
    NamingMismatch { profile: Profile, expected: Naming },
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        let paths = match path {
            Some(p) => vec![p.into()],
            None => std::env::current_dir()?
                .ancestors()
                .map(|path| path.join(CONFIG_FILE_NAME))
                .collect(),
        };

        let mut last_error = None;

        for path in paths {
            match std::fs::read_to_string(path) {
                Ok(config_string) => {
                    let config: Config = toml::from_str(&config_string)?;
                    config.validate()?;
                    return Ok(config);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => e.into(),
            None => "no configuration file found".into(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let acquisition = &self.acquisition;
        if acquisition.sample_count == 0 || acquisition.sample_count > MAX_SAMPLES {
            return Err(ConfigError::SampleCount {
                got: acquisition.sample_count,
                max: MAX_SAMPLES,
            });
        }
        acquisition.resolution()?;
        let reference = acquisition.reference_voltage;
        if !(reference > 0.0 && reference <= MAX_REFERENCE_VOLTAGE) {
            return Err(ConfigError::ReferenceVoltage(acquisition.reference_voltage));
        }

        if self.upload.chunk_size == 0 {
            return Err(ConfigError::ChunkSize);
        }

        let expected = self.expected_naming();
        if self.storage.naming != expected {
            return Err(ConfigError::NamingMismatch {
                profile: self.delivery.profile,
                expected,
            });
        }

        Ok(())
    }

    pub fn expected_naming(&self) -> Naming {
        match self.delivery.profile {
            Profile::Pull => Naming::Timestamp,
            Profile::Push => Naming::Counter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.acquisition.sample_count, 499);
        assert_eq!(config.acquisition.resolution().unwrap().max_code(), 4095);
        assert_eq!(config.clock.utc_offset_hours, -7);
        assert_eq!(config.upload.command_token, "GET_DATA");
        assert_eq!(config.upload.chunk_size, 64);
        assert_eq!(config.broker.reconnect_delay_ms, 5000);
        assert_eq!(config.broker.telemetry_topic(), "decay-node/telemetry");
    }

    #[test]
    fn push_profile() {
        let config: Config = toml::from_str(
            r#"
            [delivery]
            profile = "push"

            [storage]
            naming = "counter"
            extension = "txt"

            [broker]
            host = "10.0.0.1"
            topic = "lab/decay"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.delivery.profile, Profile::Push);
        assert_eq!(config.storage.counter_prefix, "data_");
        assert_eq!(config.broker.telemetry_topic(), "lab/decay");
    }

    #[test]
    fn naming_must_match_profile() {
        let config: Config = toml::from_str(
            r#"
            [delivery]
            profile = "push"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.validate(),
            Err(ConfigError::NamingMismatch {
                profile: Profile::Push,
                expected: Naming::Counter
            })
        );
    }

    #[test]
    fn rejects_out_of_range_acquisition() {
        let mut config = Config::default();
        config.acquisition.sample_count = MAX_SAMPLES + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SampleCount { .. })
        ));

        let mut config = Config::default();
        config.acquisition.adc_resolution_bits = 0;
        assert_eq!(config.validate(), Err(ConfigError::AdcResolution(0)));

        let mut config = Config::default();
        config.acquisition.reference_voltage = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::ReferenceVoltage(0.0)));

        let mut config = Config::default();
        config.acquisition.reference_voltage = 1e30;
        assert_eq!(config.validate(), Err(ConfigError::ReferenceVoltage(1e30)));

        let mut config = Config::default();
        config.acquisition.reference_voltage = MAX_REFERENCE_VOLTAGE;
        assert_eq!(config.validate(), Ok(()));
    }
}
