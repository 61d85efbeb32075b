//! WJ series high-voltage power supply.
//!
//! Packets are `SOH + body + checksum + CR` where the checksum is the sum of
//! the body bytes modulo 256 written as two uppercase hex digits. Command
//! bodies are nine characters: a two-digit address, a command letter and a
//! six-digit decimal field.
//!
//! | command | letter | field                  |
//! |---------|--------|------------------------|
//! | voltage | `V`    | setpoint in volts      |
//! | current | `I`    | setpoint in microamps  |
//! | HV      | `H`    | `000001` on, `000000` off |
//! | status  | `Q`    | `000000`               |
//!
//! The status reply body is the address, `q`, the HV flag, six digits of
//! output voltage, six digits of output current and a fault flag.
//!
//! The supply only honours "HV off" once both setpoints are zero, and its
//! status replies are often garbled or missing.

use crate::instrument_link::{InstrumentLink, LinkError};
use crate::interlock::HvSupply;
use std::time::Duration;

pub const SOH: u8 = 0x01;
pub const CR: u8 = b'\r';
pub const DEFAULT_BAUD: u32 = 9600;

/// Largest value the six-digit field can carry.
pub const FIELD_MAX: u32 = 999_999;
/// Highest address that fits the two-digit address field.
pub const ADDRESS_MAX: u8 = 99;

const STATUS_TIMEOUT: Duration = Duration::from_millis(200);
const STATUS_BODY_LEN: usize = 17;

#[derive(Debug, thiserror::Error)]
pub enum WjError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Supply address {0} out of range (0-{max})", max = ADDRESS_MAX)]
    InvalidAddress(u8),

    #[error("Supply {label} is not connected")]
    NotConnected { label: String },

    #[error("Checksum mismatch: computed {computed:02X}, packet says {received}")]
    Checksum { computed: u8, received: String },

    #[error("Malformed reply '{reply}'")]
    Malformed { reply: String },

    #[error("{what} {value} exceeds the limit of {max}")]
    OutOfRange {
        what: &'static str,
        value: u32,
        max: u32,
    },
}

/// Modulo-256 sum of `body`.
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

pub fn encode_packet(body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(body.len() + 4);
    packet.push(SOH);
    packet.extend_from_slice(body);
    packet.extend_from_slice(format!("{:02X}", checksum(body)).as_bytes());
    packet.push(CR);
    packet
}

/// Check framing and checksum, returning the body.
pub fn decode_packet(packet: &[u8]) -> Result<&[u8], WjError> {
    let malformed = || WjError::Malformed {
        reply: String::from_utf8_lossy(packet).to_string(),
    };

    let packet = packet.strip_suffix(&[CR]).unwrap_or(packet);
    let start = packet.iter().position(|b| *b == SOH).ok_or_else(malformed)?;
    let framed = &packet[start + 1..];
    if framed.len() < 2 {
        return Err(malformed());
    }

    let (body, sum) = framed.split_at(framed.len() - 2);
    let received = String::from_utf8_lossy(sum).to_string();
    let computed = checksum(body);
    match u8::from_str_radix(&received, 16) {
        Ok(value) if value == computed => Ok(body),
        Ok(_) => Err(WjError::Checksum { computed, received }),
        Err(_) => Err(malformed()),
    }
}

fn check_address(address: u8) -> Result<(), WjError> {
    if address > ADDRESS_MAX {
        return Err(WjError::InvalidAddress(address));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WjCommand {
    SetVoltage(u32),
    SetCurrent(u32),
    HighVoltage(bool),
    QueryStatus,
}

impl WjCommand {
    fn letter(self) -> char {
        match self {
            Self::SetVoltage(_) => 'V',
            Self::SetCurrent(_) => 'I',
            Self::HighVoltage(_) => 'H',
            Self::QueryStatus => 'Q',
        }
    }

    fn field(self) -> u32 {
        match self {
            Self::SetVoltage(volts) => volts,
            Self::SetCurrent(microamps) => microamps,
            Self::HighVoltage(on) => u32::from(on),
            Self::QueryStatus => 0,
        }
    }

    pub fn body(self, address: u8) -> Result<String, WjError> {
        check_address(address)?;
        let field = self.field();
        if field > FIELD_MAX {
            return Err(WjError::OutOfRange {
                what: "field",
                value: field,
                max: FIELD_MAX,
            });
        }
        Ok(format!("{:02}{}{:06}", address, self.letter(), field))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WjStatus {
    pub hv_on: bool,
    pub voltage: u32,
    pub current: u32,
    pub fault: bool,
}

impl WjStatus {
    pub fn parse_body(address: u8, body: &[u8]) -> Result<Self, WjError> {
        let text = String::from_utf8_lossy(body);
        let malformed = || WjError::Malformed {
            reply: text.to_string(),
        };

        if body.len() != STATUS_BODY_LEN || !text.is_ascii() {
            return Err(malformed());
        }
        if text[..2] != format!("{address:02}") || &text[2..3] != "q" {
            return Err(malformed());
        }

        let flag = |s: &str| match s {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(malformed()),
        };
        let number = |s: &str| {
            if !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            s.parse::<u32>().map_err(|_| malformed())
        };

        Ok(Self {
            hv_on: flag(&text[3..4])?,
            voltage: number(&text[4..10])?,
            current: number(&text[10..16])?,
            fault: flag(&text[16..17])?,
        })
    }
}

/// One supply on its own serial port.
///
/// A supply whose connect failed is kept with no link: every command then
/// fails with `WjError::NotConnected`.
pub struct WjSupply<L> {
    label: String,
    address: u8,
    link: Option<L>,
    max_voltage: u32,
    max_current: u32,
}

impl<L: InstrumentLink> WjSupply<L> {
    pub fn new(label: &str, link: L, address: u8) -> Result<Self, WjError> {
        Self::with_link(label, Some(link), address)
    }

    pub fn disconnected(label: &str, address: u8) -> Result<Self, WjError> {
        Self::with_link(label, None, address)
    }

    fn with_link(label: &str, link: Option<L>, address: u8) -> Result<Self, WjError> {
        check_address(address)?;
        Ok(Self {
            label: label.to_string(),
            address,
            link,
            max_voltage: FIELD_MAX,
            max_current: FIELD_MAX,
        })
    }

    /// Refuse setpoints above the given ratings.
    pub fn with_limits(mut self, max_voltage: u32, max_current: u32) -> Self {
        self.max_voltage = max_voltage.min(FIELD_MAX);
        self.max_current = max_current.min(FIELD_MAX);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn disconnect(&mut self) {
        self.link = None;
    }

    fn link(&mut self) -> Result<&mut L, WjError> {
        let label = &self.label;
        self.link.as_mut().ok_or_else(|| WjError::NotConnected {
            label: label.clone(),
        })
    }

    pub fn send(&mut self, command: WjCommand) -> Result<(), WjError> {
        let body = command.body(self.address)?;
        log::trace!("{} <- {}", self.label, body);
        self.link()?.write_all(&encode_packet(body.as_bytes()))?;
        Ok(())
    }

    pub fn set_voltage(&mut self, volts: u32) -> Result<(), WjError> {
        if volts > self.max_voltage {
            return Err(WjError::OutOfRange {
                what: "voltage",
                value: volts,
                max: self.max_voltage,
            });
        }
        self.send(WjCommand::SetVoltage(volts))
    }

    pub fn set_current(&mut self, microamps: u32) -> Result<(), WjError> {
        if microamps > self.max_current {
            return Err(WjError::OutOfRange {
                what: "current",
                value: microamps,
                max: self.max_current,
            });
        }
        self.send(WjCommand::SetCurrent(microamps))
    }

    pub fn hv_on(&mut self) -> Result<(), WjError> {
        log::info!("{}: HV on", self.label);
        self.send(WjCommand::HighVoltage(true))
    }

    /// Zero both setpoints, then switch HV off.
    pub fn hv_off(&mut self) -> Result<(), WjError> {
        log::info!("{}: HV off", self.label);
        self.send(WjCommand::SetVoltage(0))?;
        self.send(WjCommand::SetCurrent(0))?;
        self.send(WjCommand::HighVoltage(false))
    }

    pub fn status(&mut self) -> Result<WjStatus, WjError> {
        let address = self.address;
        let query = encode_packet(WjCommand::QueryStatus.body(address)?.as_bytes());
        let link = self.link()?;
        link.clear_input()?;
        link.write_all(&query)?;
        let reply = link.read_until(CR, STATUS_TIMEOUT)?;
        let status = WjStatus::parse_body(address, decode_packet(&reply)?)?;
        log::trace!("{} -> {:?}", self.label, status);
        Ok(status)
    }
}

impl<L: InstrumentLink> HvSupply for WjSupply<L> {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn force_hv_off(&mut self) -> Result<(), WjError> {
        self.hv_off()
    }

    fn hv_is_off(&mut self) -> Result<bool, WjError> {
        Ok(!self.status()?.hv_on)
    }
}
