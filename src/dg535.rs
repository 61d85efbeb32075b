//! Stanford Research DG535 behind a Prologix GPIB-USB adapter.
//!
//! Lines starting with `++` configure the adapter itself. Everything else is
//! forwarded to the instrument at the configured GPIB address, with CR, LF,
//! ESC and `+` escaped so the adapter does not interpret them.

use crate::instrument_link::{InstrumentLink, LinkError};
use crate::pulse_config::{format_seconds, MasterPulse, PulseConfigError};
use crate::sequencer::MasterTrigger;
use std::time::Duration;

pub const DEFAULT_BAUD: u32 = 9600;
pub const DEFAULT_GPIB_ADDRESS: u8 = 15;

const ESC: u8 = 0x1B;
const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Dg535Error {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Invalid pulse configuration: {0}")]
    Config(#[from] PulseConfigError),

    #[error("GPIB address {0} out of range (0-30)")]
    InvalidAddress(u8),

    #[error("Unexpected reply '{reply}' to {command}")]
    InvalidReply { command: String, reply: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Internal = 0,
    External = 1,
    SingleShot = 2,
    Burst = 3,
}

/// Channel numbering used by the `DT`, `OM` and `OP` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayChannel {
    TriggerInput = 0,
    T0 = 1,
    A = 2,
    B = 3,
    Ab = 4,
    C = 5,
    D = 6,
    Cd = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Ttl = 0,
    Nim = 1,
    Ecl = 2,
    Variable = 3,
}

/// Escape the bytes the Prologix adapter would otherwise swallow.
pub fn escape_gpib_payload(payload: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(payload.len());
    for &byte in payload {
        if matches!(byte, b'\r' | b'\n' | ESC | b'+') {
            escaped.push(ESC);
        }
        escaped.push(byte);
    }
    escaped
}

pub struct Dg535<L> {
    link: L,
    address: u8,
}

impl<L: InstrumentLink> Dg535<L> {
    /// Configure the adapter for controller mode at `address` and clear the instrument.
    pub fn new(link: L, address: u8) -> Result<Self, Dg535Error> {
        if address > 30 {
            return Err(Dg535Error::InvalidAddress(address));
        }

        let mut dg = Self { link, address };
        dg.link.clear_input()?;
        for setup in ["++mode 1", "++auto 0", "++eoi 1", "++eos 2"] {
            dg.adapter_command(setup)?;
        }
        dg.adapter_command(&format!("++addr {address}"))?;
        dg.write("CL")?;
        log::debug!("DG535 ready at GPIB address {}", address);
        Ok(dg)
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn adapter_command(&mut self, command: &str) -> Result<(), Dg535Error> {
        self.link.send_line(command, "\n")?;
        Ok(())
    }

    fn write(&mut self, command: &str) -> Result<(), Dg535Error> {
        log::trace!("DG535 <- {}", command);
        let mut framed = escape_gpib_payload(command.as_bytes());
        framed.push(b'\n');
        self.link.write_all(&framed)?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, Dg535Error> {
        self.write(command)?;
        let reply = self.link.query_line("++read eoi", "\n", QUERY_TIMEOUT)?;
        Ok(reply)
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), Dg535Error> {
        self.write(&format!("TM {}", mode as u8))
    }

    /// Set `channel` to fire `seconds` after `reference`.
    pub fn set_delay(
        &mut self,
        channel: DelayChannel,
        reference: DelayChannel,
        seconds: f64,
    ) -> Result<(), Dg535Error> {
        self.write(&format!(
            "DT {},{},{}",
            channel as u8,
            reference as u8,
            format_seconds(seconds)
        ))
    }

    pub fn set_output_mode(
        &mut self,
        channel: DelayChannel,
        mode: OutputMode,
    ) -> Result<(), Dg535Error> {
        self.write(&format!("OM {},{}", channel as u8, mode as u8))
    }

    pub fn set_output_polarity(
        &mut self,
        channel: DelayChannel,
        normal: bool,
    ) -> Result<(), Dg535Error> {
        self.write(&format!("OP {},{}", channel as u8, u8::from(normal)))
    }

    pub fn single_shot(&mut self) -> Result<(), Dg535Error> {
        self.write("SS")
    }

    /// Instrument error status byte (`ES`); zero means no errors.
    pub fn error_status(&mut self) -> Result<u8, Dg535Error> {
        let reply = self.query("ES")?;
        reply.parse().map_err(|_| Dg535Error::InvalidReply {
            command: "ES".to_string(),
            reply,
        })
    }

    /// Emit exactly one pulse: A at T0 + delay, B at A + width, on the AB output.
    pub fn fire_single(&mut self, pulse: &MasterPulse) -> Result<(), Dg535Error> {
        pulse.validate()?;
        let _span = tracing::debug_span!("dg535_fire", delay_s = pulse.delay_s, width_s = pulse.width_s)
            .entered();

        self.set_trigger_mode(TriggerMode::SingleShot)?;
        self.set_delay(DelayChannel::A, DelayChannel::T0, pulse.delay_s)?;
        self.set_delay(DelayChannel::B, DelayChannel::A, pulse.width_s)?;
        self.set_output_mode(DelayChannel::Ab, OutputMode::Ttl)?;
        self.set_output_polarity(DelayChannel::Ab, true)?;
        self.single_shot()?;
        log::info!(
            "DG535 fired: delay {} s, width {} s",
            pulse.delay_s,
            pulse.width_s
        );
        Ok(())
    }
}

impl<L: InstrumentLink> MasterTrigger for Dg535<L> {
    fn fire_single(&mut self, pulse: &MasterPulse) -> Result<(), Dg535Error> {
        Self::fire_single(self, pulse)
    }
}
