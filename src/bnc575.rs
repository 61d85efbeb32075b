use crate::instrument_link::{InstrumentLink, LinkError};
use crate::pulse_config::{
    format_seconds, ChannelConfig, ExternalTrigger, Polarity, PulseChannel, PulseConfigError,
};
use crate::sequencer::ExternalTriggerArm;
use std::time::Duration;

pub const DEFAULT_BAUD: u32 = 115_200;

/// How long to wait for the `ok` the generator sends after each command.
const ACK_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum Bnc575Error {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Invalid pulse configuration: {0}")]
    Config(#[from] PulseConfigError),
}

/// BNC Model 575 pulse/delay generator.
///
/// Readbacks from this unit are not trusted, so the driver runs it write-only:
/// acknowledgements are drained and ignored, and the channel settings below
/// are whatever was last written successfully.
pub struct Bnc575<L> {
    link: L,
    channels: [ChannelConfig; 4],
    armed: bool,
}

impl<L: InstrumentLink> Bnc575<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            channels: [ChannelConfig::default(); 4],
            armed: false,
        }
    }

    fn write(&mut self, command: &str) -> Result<(), Bnc575Error> {
        self.link.send_line(command, "\r\n")?;
        match self.link.read_until(b'\n', ACK_TIMEOUT) {
            Ok(_) | Err(LinkError::Timeout { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Last configuration written to `channel`.
    pub fn channel(&self, channel: PulseChannel) -> &ChannelConfig {
        &self.channels[channel.index()]
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn set_channel(
        &mut self,
        channel: PulseChannel,
        config: ChannelConfig,
    ) -> Result<(), Bnc575Error> {
        config.validate()?;
        for command in config.scpi_commands(channel) {
            self.write(&command)?;
        }
        self.channels[channel.index()] = config;
        log::debug!("BNC575 channel {:?} set to {:?}", channel, config);
        Ok(())
    }

    pub fn set_delay(&mut self, channel: PulseChannel, delay_s: f64) -> Result<(), Bnc575Error> {
        let updated = ChannelConfig {
            delay_s,
            ..self.channels[channel.index()]
        };
        updated.validate()?;
        self.write(&format!(
            ":PULSE{}:DELAY {}",
            channel.scpi_number(),
            format_seconds(delay_s)
        ))?;
        self.channels[channel.index()] = updated;
        Ok(())
    }

    pub fn set_width(&mut self, channel: PulseChannel, width_s: f64) -> Result<(), Bnc575Error> {
        let updated = ChannelConfig {
            width_s,
            ..self.channels[channel.index()]
        };
        updated.validate()?;
        self.write(&format!(
            ":PULSE{}:WIDTH {}",
            channel.scpi_number(),
            format_seconds(width_s)
        ))?;
        self.channels[channel.index()] = updated;
        Ok(())
    }

    pub fn set_polarity(
        &mut self,
        channel: PulseChannel,
        polarity: Polarity,
    ) -> Result<(), Bnc575Error> {
        self.write(&format!(
            ":PULSE{}:POL {}",
            channel.scpi_number(),
            polarity.as_str()
        ))?;
        self.channels[channel.index()].polarity = polarity;
        Ok(())
    }

    pub fn set_enabled(&mut self, channel: PulseChannel, enabled: bool) -> Result<(), Bnc575Error> {
        self.write(&format!(
            ":PULSE{}:STATE {}",
            channel.scpi_number(),
            if enabled { "ON" } else { "OFF" }
        ))?;
        self.channels[channel.index()].enabled = enabled;
        Ok(())
    }

    /// Wait for one edge on the external trigger input, then run the pulse train once.
    pub fn arm_external_trigger(&mut self, trigger: &ExternalTrigger) -> Result<(), Bnc575Error> {
        trigger.validate()?;
        for command in trigger.scpi_commands() {
            self.write(&command)?;
        }
        self.armed = true;
        log::info!(
            "BNC575 armed on {:?} edge at {:.2} V",
            trigger.edge,
            trigger.level_v
        );
        Ok(())
    }

    pub fn disarm(&mut self) -> Result<(), Bnc575Error> {
        self.write(":PULSE0:STATE OFF")?;
        self.armed = false;
        Ok(())
    }
}

impl<L: InstrumentLink> ExternalTriggerArm for Bnc575<L> {
    fn arm_external_trigger(&mut self, trigger: &ExternalTrigger) -> Result<(), Bnc575Error> {
        Self::arm_external_trigger(self, trigger)
    }
}
