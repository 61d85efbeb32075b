//! Bench configuration loaded from TOML.
//!
//! An instrument whose section is missing is simply not present on the bench.
//!
//! ```toml
//! [sequence]
//! capture_timeout = "5s"
//! master_pulse = { delay_s = 0.0, width_s = 10e-6 }
//!
//! [dg535]
//! port = "/dev/ttyUSB0"
//!
//! [bnc575]
//! port = "/dev/ttyUSB1"
//! channels.A = { delay_s = 1e-6, width_s = 2e-6, enabled = true }
//!
//! [[scopes]]
//! name = "scope1"
//! resource = "TCPIP0::192.168.1.10::5555::SOCKET"
//! channels = [1, 2]
//!
//! [[supplies]]
//! name = "wj1"
//! port = "/dev/ttyUSB2"
//! address = 1
//! ```

use crate::bench_connector::ResourceAddress;
use crate::pulse_config::{ChannelConfig, PulseChannel, PulseConfigError};
use crate::sequencer::SequenceConfig;
use crate::{arduino_io, bnc575, dg535, wj_supply};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid pulse settings: {0}")]
    Pulse(#[from] PulseConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Dg535Config {
    pub port: String,
    #[serde(default = "Dg535Config::default_baud")]
    pub baud: u32,
    #[serde(default = "Dg535Config::default_address")]
    pub gpib_address: u8,
}

impl Dg535Config {
    fn default_baud() -> u32 {
        dg535::DEFAULT_BAUD
    }

    fn default_address() -> u8 {
        dg535::DEFAULT_GPIB_ADDRESS
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Bnc575Config {
    pub port: String,
    #[serde(default = "Bnc575Config::default_baud")]
    pub baud: u32,
    /// Keyed by channel letter.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

impl Bnc575Config {
    fn default_baud() -> u32 {
        bnc575::DEFAULT_BAUD
    }

    pub fn channel_settings(&self) -> Result<Vec<(PulseChannel, ChannelConfig)>, ConfigError> {
        self.channels
            .iter()
            .map(|(key, config)| {
                let channel = key.parse::<PulseChannel>().map_err(ConfigError::Invalid)?;
                Ok((channel, *config))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScopeConfig {
    pub name: String,
    pub resource: String,
    #[serde(default = "ScopeConfig::default_channels")]
    pub channels: Vec<u8>,
    /// Only used for serial resources.
    #[serde(default = "ScopeConfig::default_baud")]
    pub baud: u32,
}

impl ScopeConfig {
    fn default_channels() -> Vec<u8> {
        vec![1, 2, 3, 4]
    }

    fn default_baud() -> u32 {
        9600
    }

    pub fn address(&self) -> Result<ResourceAddress, ConfigError> {
        self.resource
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("scope {}: {}", self.name, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SupplyConfig {
    pub name: String,
    pub port: String,
    #[serde(default = "SupplyConfig::default_baud")]
    pub baud: u32,
    #[serde(default = "SupplyConfig::default_address")]
    pub address: u8,
    #[serde(default = "SupplyConfig::default_limit")]
    pub max_voltage: u32,
    #[serde(default = "SupplyConfig::default_limit")]
    pub max_current: u32,
}

impl SupplyConfig {
    fn default_baud() -> u32 {
        wj_supply::DEFAULT_BAUD
    }

    fn default_address() -> u8 {
        1
    }

    fn default_limit() -> u32 {
        wj_supply::FIELD_MAX
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArduinoConfig {
    pub port: String,
    #[serde(default = "ArduinoConfig::default_baud")]
    pub baud: u32,
    #[serde(default = "ArduinoConfig::default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl ArduinoConfig {
    fn default_baud() -> u32 {
        arduino_io::DEFAULT_BAUD
    }

    fn default_poll_interval() -> Duration {
        Duration::from_millis(200)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub sequence: SequenceConfig,
    pub dg535: Option<Dg535Config>,
    pub bnc575: Option<Bnc575Config>,
    pub scopes: Vec<ScopeConfig>,
    pub supplies: Vec<SupplyConfig>,
    pub arduino: Option<ArduinoConfig>,
}

impl BenchConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded bench configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sequence = &self.sequence;
        sequence.external_trigger.validate()?;
        sequence.master_pulse.validate()?;
        if sequence.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("sequence.poll_interval must be non-zero".into()));
        }
        if sequence.interlock.attempts == 0 {
            return Err(ConfigError::Invalid("sequence.interlock.attempts must be at least 1".into()));
        }

        if let Some(dg) = &self.dg535 {
            if dg.gpib_address > 30 {
                return Err(ConfigError::Invalid(format!(
                    "dg535.gpib_address {} out of range (0-30)",
                    dg.gpib_address
                )));
            }
        }

        if let Some(bnc) = &self.bnc575 {
            for (_, channel) in bnc.channel_settings()? {
                channel.validate()?;
            }
        }

        let mut names = HashSet::new();
        for scope in &self.scopes {
            if !names.insert(scope.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate scope name '{}'", scope.name)));
            }
            if let Some(channel) = scope.channels.iter().find(|c| !(1..=4).contains(*c)) {
                return Err(ConfigError::Invalid(format!(
                    "scope {}: channel {} out of range (1-4)",
                    scope.name, channel
                )));
            }
            scope.address()?;
        }

        let mut labels = HashSet::new();
        for supply in &self.supplies {
            if !labels.insert(supply.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate supply name '{}'", supply.name)));
            }
            if supply.address > 99 {
                return Err(ConfigError::Invalid(format!(
                    "supply {}: address {} out of range (0-99)",
                    supply.name, supply.address
                )));
            }
        }

        if let Some(arduino) = &self.arduino {
            if arduino.poll_interval.is_zero() {
                return Err(ConfigError::Invalid("arduino.poll_interval must be non-zero".into()));
            }
        }

        Ok(())
    }
}
