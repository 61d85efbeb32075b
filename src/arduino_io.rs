//! Arduino I/O board switching the gas valves and reading the pressure sensors.
//!
//! The firmware speaks a line protocol: `SET <pin> <0|1>` answers `OK`,
//! `READ` answers `A:<a0>,<a1>,<a2>,<a3>,<a4>,<a5>;D:<hex mask>` with raw
//! 10-bit ADC counts and the digital input states.

use crate::instrument_link::{InstrumentLink, LinkError};
use crate::poller::Poller;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const DEFAULT_BAUD: u32 = 115_200;
pub const ANALOG_INPUTS: usize = 6;
/// Digital pins usable as valve outputs; 0 and 1 carry the serial link.
pub const VALVE_PINS: std::ops::RangeInclusive<u8> = 2..=13;

const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ArduinoError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Pin {pin} cannot drive a valve")]
    InvalidPin { pin: u8 },

    #[error("Board rejected '{command}': {reply}")]
    Rejected { command: String, reply: String },

    #[error("Malformed input report '{reply}'")]
    Malformed { reply: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoSnapshot {
    pub analog: [u16; ANALOG_INPUTS],
    pub digital: u16,
}

impl IoSnapshot {
    pub fn digital_bit(&self, bit: u8) -> bool {
        bit < 16 && (self.digital >> bit) & 1 == 1
    }
}

impl FromStr for IoSnapshot {
    type Err = ArduinoError;

    fn from_str(reply: &str) -> Result<Self, Self::Err> {
        let malformed = || ArduinoError::Malformed {
            reply: reply.to_string(),
        };

        let (analog_part, digital_part) = reply.trim().split_once(';').ok_or_else(malformed)?;
        let analog_values = analog_part.strip_prefix("A:").ok_or_else(malformed)?;
        let digital_value = digital_part.strip_prefix("D:").ok_or_else(malformed)?;

        let mut analog = [0u16; ANALOG_INPUTS];
        let mut fields = analog_values.split(',');
        for slot in &mut analog {
            *slot = fields
                .next()
                .and_then(|f| f.trim().parse().ok())
                .ok_or_else(malformed)?;
        }
        if fields.next().is_some() {
            return Err(malformed());
        }

        let digital = u16::from_str_radix(digital_value.trim().trim_start_matches("0x"), 16)
            .map_err(|_| malformed())?;

        Ok(Self { analog, digital })
    }
}

pub struct ArduinoBoard<L> {
    link: L,
    valves: BTreeMap<u8, bool>,
}

/// A board shared between control calls and the input stream.
pub type SharedBoard<L> = Arc<Mutex<ArduinoBoard<L>>>;

impl<L: InstrumentLink> ArduinoBoard<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            valves: BTreeMap::new(),
        }
    }

    pub fn shared(self) -> SharedBoard<L> {
        Arc::new(Mutex::new(self))
    }

    fn command(&mut self, command: &str) -> Result<String, ArduinoError> {
        self.link.clear_input()?;
        Ok(self.link.query_line(command, "\n", REPLY_TIMEOUT)?)
    }

    pub fn set_valve(&mut self, pin: u8, open: bool) -> Result<(), ArduinoError> {
        if !VALVE_PINS.contains(&pin) {
            return Err(ArduinoError::InvalidPin { pin });
        }

        let command = format!("SET {} {}", pin, u8::from(open));
        let reply = self.command(&command)?;
        if reply != "OK" {
            return Err(ArduinoError::Rejected { command, reply });
        }

        self.valves.insert(pin, open);
        log::info!("Valve on pin {} {}", pin, if open { "opened" } else { "closed" });
        Ok(())
    }

    /// Last state written to `pin`, if any.
    pub fn valve(&self, pin: u8) -> Option<bool> {
        self.valves.get(&pin).copied()
    }

    /// Close every valve this session opened.
    pub fn close_all_valves(&mut self) -> Result<(), ArduinoError> {
        let open: Vec<u8> = self
            .valves
            .iter()
            .filter_map(|(pin, open)| open.then_some(*pin))
            .collect();
        for pin in open {
            self.set_valve(pin, false)?;
        }
        Ok(())
    }

    pub fn read_inputs(&mut self) -> Result<IoSnapshot, ArduinoError> {
        self.command("READ")?.parse()
    }
}

/// Sample the board's inputs every `interval` on a background thread.
pub fn stream_inputs<L>(board: SharedBoard<L>, interval: Duration) -> std::io::Result<Poller<IoSnapshot>>
where
    L: InstrumentLink + Send + 'static,
{
    Poller::spawn("arduino-inputs", interval, move || {
        let mut board = board.lock().unwrap_or_else(PoisonError::into_inner);
        match board.read_inputs() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                log::warn!("Arduino input read failed: {}", e);
                None
            }
        }
    })
}
