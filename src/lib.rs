//! # marx-bench
//!
//! Instrument control and fire/capture sequencing for a Marx generator test bench.
//!
//! The bench consists of a DG535 delay generator (master trigger, reached
//! through a Prologix GPIB adapter), a BNC575 pulse generator on its external
//! trigger input, up to three Rigol oscilloscopes, WJ series HV supplies and
//! an Arduino board switching gas valves and reading pressure sensors.
//!
//! ## Features
//!
//! - **Fire sequencing**: arm scopes, arm the BNC575, run the HV interlock, fire the DG535, collect every capture
//! - **HV interlock**: every connected supply must read back HV off before anything fires
//! - **Waveform download**: raw scope data scaled to volts and converted to `polars` DataFrames
//! - **Background polling**: HV status and Arduino inputs on worker threads that stop cleanly
//! - **TOML configuration**: `serde` + `toml` with human-readable durations
//!
//! ## Examples
//!
//! ### Firing a shot
//!
//! ```rust,no_run
//! use marx_bench::{Bench, BenchConfig};
//!
//! let config = BenchConfig::load("bench.toml")?;
//! let mut bench = Bench::connect(&config)?;
//!
//! let outcome = bench.fire()?;
//! for capture in outcome.captures() {
//!     println!("{}: {}", capture.scope, capture.to_dataframe()?);
//! }
//! bench.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Pulse channel settings
//!
//! ```rust
//! use marx_bench::pulse_config::{ChannelConfig, PulseChannel};
//!
//! let channel = ChannelConfig::pulse()
//!     .delay(1e-6)
//!     .width(2e-6)
//!     .inverted()
//!     .build()
//!     .unwrap();
//!
//! for command in channel.scpi_commands(PulseChannel::B) {
//!     println!("{}", command);
//! }
//! ```
//!
//! ### HV supply packets
//!
//! ```rust
//! use marx_bench::wj_supply::{decode_packet, encode_packet};
//!
//! let packet = encode_packet(b"01V030000");
//! assert_eq!(decode_packet(&packet).unwrap(), b"01V030000");
//! ```
//!
//! ### Watching the HV supplies
//!
//! ```rust,no_run
//! use marx_bench::{Bench, BenchConfig};
//! use std::time::Duration;
//!
//! let bench = Bench::connect(&BenchConfig::load("bench.toml")?)?;
//! let poller = bench.hv_status_poller(Duration::from_millis(500))?;
//! while let Some(readings) = poller.recv_timeout(Duration::from_secs(2)) {
//!     for reading in readings {
//!         println!("{}: {:?}", reading.label, reading.status);
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod arduino_io;
pub mod bench;
pub mod bench_connector;
pub mod bnc575;
pub mod config;
pub mod dg535;
pub mod instrument_link;
pub mod interlock;
pub mod poller;
pub mod pulse_config;
pub mod rigol_scope;
pub mod sequencer;
pub mod wj_supply;

#[cfg(test)]
mod test_support;

// Re-export the main types for convenience
pub use bench::{Bench, BenchError, FireJob, SupplyReading};
pub use bench_connector::{BenchConnector, ConnectorError, PortInfo, ResourceAddress};
pub use config::{BenchConfig, ConfigError};
pub use instrument_link::{DynLink, InstrumentLink, LinkError};
pub use interlock::{ensure_hv_off, HvSupply, InterlockPolicy};
pub use poller::Poller;
pub use pulse_config::{ChannelConfig, ExternalTrigger, MasterPulse, PulseChannel};
pub use rigol_scope::{ChannelTrace, RigolScope, ScopeCapture};
pub use sequencer::{FireOutcome, FireSequencer, ScopeOutcome, SequenceConfig, SequenceError};
