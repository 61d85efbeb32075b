//! Pulse and trigger settings shared by the BNC575 and DG535 drivers.
//!
//! Times are plain `f64` seconds: both generators resolve well below a
//! nanosecond and take decimal seconds on the wire.

use serde::Deserialize;

/// Longest delay or width either generator accepts.
pub const MAX_TIME_S: f64 = 999.999;
/// Narrowest pulse the BNC575 can produce.
pub const MIN_WIDTH_S: f64 = 10e-9;
/// External trigger threshold range of the BNC575.
pub const TRIGGER_LEVEL_RANGE_V: std::ops::RangeInclusive<f64> = 0.2..=15.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PulseConfigError {
    #[error("Pulse width {width_s} s out of range ({min} s to {max} s)", min = MIN_WIDTH_S, max = MAX_TIME_S)]
    WidthOutOfRange { width_s: f64 },

    #[error("Delay {delay_s} s out of range (0 s to {max} s)", max = MAX_TIME_S)]
    DelayOutOfRange { delay_s: f64 },

    #[error("Trigger level {level_v} V out of range (0.2 V to 15 V)")]
    LevelOutOfRange { level_v: f64 },
}

/// Output channel of the BNC575, `:PULSE1` through `:PULSE4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub enum PulseChannel {
    A,
    B,
    C,
    D,
}

impl PulseChannel {
    pub const ALL: [Self; 4] = [Self::A, Self::B, Self::C, Self::D];

    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
            Self::C => 2,
            Self::D => 3,
        }
    }

    /// SCPI subsystem number; `:PULSE0` is the system timer.
    pub fn scpi_number(self) -> usize {
        self.index() + 1
    }
}

impl std::str::FromStr for PulseChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "D" => Ok(Self::D),
            other => Err(format!("unknown pulse channel '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    #[default]
    Normal,
    Inverted,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORM",
            Self::Inverted => "INV",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEdge {
    #[default]
    Rising,
    Falling,
}

impl TriggerEdge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rising => "RIS",
            Self::Falling => "FALL",
        }
    }
}

/// Render seconds the way both generators accept them.
pub fn format_seconds(seconds: f64) -> String {
    format!("{seconds:.12}")
}

fn check_delay(delay_s: f64) -> Result<(), PulseConfigError> {
    if (0.0..=MAX_TIME_S).contains(&delay_s) {
        Ok(())
    } else {
        Err(PulseConfigError::DelayOutOfRange { delay_s })
    }
}

fn check_width(width_s: f64) -> Result<(), PulseConfigError> {
    if (MIN_WIDTH_S..=MAX_TIME_S).contains(&width_s) {
        Ok(())
    } else {
        Err(PulseConfigError::WidthOutOfRange { width_s })
    }
}

/// Settings of one BNC575 output.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub delay_s: f64,
    pub width_s: f64,
    pub polarity: Polarity,
    pub enabled: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            delay_s: 0.0,
            width_s: 1e-6,
            polarity: Polarity::Normal,
            enabled: false,
        }
    }
}

impl ChannelConfig {
    /// Start building an enabled channel.
    pub fn pulse() -> ChannelConfigBuilder {
        ChannelConfigBuilder {
            config: Self {
                enabled: true,
                ..Self::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), PulseConfigError> {
        check_delay(self.delay_s)?;
        check_width(self.width_s)
    }

    /// Commands that apply this configuration to `channel`.
    pub fn scpi_commands(&self, channel: PulseChannel) -> Vec<String> {
        let n = channel.scpi_number();
        vec![
            format!(":PULSE{n}:DELAY {}", format_seconds(self.delay_s)),
            format!(":PULSE{n}:WIDTH {}", format_seconds(self.width_s)),
            format!(":PULSE{n}:POL {}", self.polarity.as_str()),
            format!(":PULSE{n}:STATE {}", if self.enabled { "ON" } else { "OFF" }),
        ]
    }
}

#[derive(Debug)]
pub struct ChannelConfigBuilder {
    config: ChannelConfig,
}

impl ChannelConfigBuilder {
    pub fn delay(mut self, delay_s: f64) -> Self {
        self.config.delay_s = delay_s;
        self
    }

    pub fn width(mut self, width_s: f64) -> Self {
        self.config.width_s = width_s;
        self
    }

    pub fn inverted(mut self) -> Self {
        self.config.polarity = Polarity::Inverted;
        self
    }

    pub fn normal(mut self) -> Self {
        self.config.polarity = Polarity::Normal;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.config.enabled = false;
        self
    }

    pub fn build(self) -> Result<ChannelConfig, PulseConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// External trigger input of the BNC575.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ExternalTrigger {
    pub level_v: f64,
    #[serde(default)]
    pub edge: TriggerEdge,
}

impl Default for ExternalTrigger {
    fn default() -> Self {
        Self {
            level_v: 2.5,
            edge: TriggerEdge::Rising,
        }
    }
}

impl ExternalTrigger {
    pub fn rising(level_v: f64) -> Self {
        Self {
            level_v,
            edge: TriggerEdge::Rising,
        }
    }

    pub fn falling(level_v: f64) -> Self {
        Self {
            level_v,
            edge: TriggerEdge::Falling,
        }
    }

    pub fn validate(&self) -> Result<(), PulseConfigError> {
        if TRIGGER_LEVEL_RANGE_V.contains(&self.level_v) {
            Ok(())
        } else {
            Err(PulseConfigError::LevelOutOfRange {
                level_v: self.level_v,
            })
        }
    }

    /// Put the system timer into single-shot, externally triggered mode and arm it.
    pub fn scpi_commands(&self) -> Vec<String> {
        vec![
            ":PULSE0:MODE SING".to_string(),
            ":PULSE0:TRIG:MODE TRIG".to_string(),
            format!(":PULSE0:TRIG:LEV {:.2}", self.level_v),
            format!(":PULSE0:TRIG:EDGE {}", self.edge.as_str()),
            ":PULSE0:STATE ON".to_string(),
        ]
    }
}

/// The single pulse the DG535 emits on its A/AB outputs when fired.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MasterPulse {
    #[serde(default)]
    pub delay_s: f64,
    pub width_s: f64,
}

impl Default for MasterPulse {
    fn default() -> Self {
        Self {
            delay_s: 0.0,
            width_s: 10e-6,
        }
    }
}

impl MasterPulse {
    pub fn new(delay_s: f64, width_s: f64) -> Result<Self, PulseConfigError> {
        let pulse = Self { delay_s, width_s };
        pulse.validate()?;
        Ok(pulse)
    }

    pub fn validate(&self) -> Result<(), PulseConfigError> {
        check_delay(self.delay_s)?;
        check_width(self.width_s)?;
        if self.delay_s + self.width_s > MAX_TIME_S {
            return Err(PulseConfigError::WidthOutOfRange {
                width_s: self.width_s,
            });
        }
        Ok(())
    }
}
