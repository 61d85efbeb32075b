//! The whole bench behind one owner.
//!
//! [`Bench`] owns every instrument driver. Firing needs `&mut Bench`, so two
//! shots can never overlap; [`Bench::spawn_fire`] moves the bench onto a
//! worker thread and hands it back together with the result. HV supplies and
//! the Arduino sit behind `Arc<Mutex<_>>` so the background pollers can read
//! them between shots.

use crate::arduino_io::{stream_inputs, ArduinoBoard, ArduinoError, IoSnapshot, SharedBoard};
use crate::bench_connector::{BenchConnector, ConnectorError, ResourceAddress};
use crate::bnc575::{Bnc575, Bnc575Error};
use crate::config::{BenchConfig, ConfigError};
use crate::dg535::{Dg535, Dg535Error};
use crate::instrument_link::DynLink;
use crate::interlock::HvSupply;
use crate::poller::Poller;
use crate::rigol_scope::{RigolScope, ScopeError};
use crate::sequencer::{
    CaptureScope, ExternalTriggerArm, FireOutcome, FireSequencer, SequenceConfig, SequenceError,
};
use crate::wj_supply::{WjError, WjStatus, WjSupply};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type SharedSupply = Arc<Mutex<WjSupply<DynLink>>>;

/// The bench handed back by a [`FireJob`] together with the shot result.
pub type FinishedShot = (Bench, Result<(), BenchError>);

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("DG535 error: {0}")]
    Dg535(#[from] Dg535Error),

    #[error("BNC575 error: {0}")]
    Bnc575(#[from] Bnc575Error),

    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("HV supply error: {0}")]
    Supply(#[from] WjError),

    #[error("Arduino error: {0}")]
    Arduino(#[from] ArduinoError),

    #[error("Failed to start worker thread: {0}")]
    Worker(#[from] std::io::Error),

    #[error("Fire worker panicked")]
    WorkerPanicked,

    #[error("{0} is not connected")]
    NotConnected(&'static str),
}

/// One reading of one supply; `status` is `None` when the supply is absent
/// or did not answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplyReading {
    pub label: String,
    pub status: Option<WjStatus>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Bench {
    sequencer: FireSequencer,
    dg535: Option<Dg535<DynLink>>,
    bnc575: Option<Bnc575<DynLink>>,
    scopes: Vec<RigolScope<DynLink>>,
    supplies: Vec<SharedSupply>,
    arduino: Option<SharedBoard<DynLink>>,
    arduino_interval: Duration,
    last_capture: Option<FireOutcome>,
}

impl Bench {
    /// An empty bench; add instruments with the `with_*`/`add_*` methods or use [`Bench::connect`].
    pub fn new(sequence: SequenceConfig) -> Self {
        Self {
            sequencer: FireSequencer::new(sequence),
            dg535: None,
            bnc575: None,
            scopes: Vec::new(),
            supplies: Vec::new(),
            arduino: None,
            arduino_interval: Duration::from_millis(200),
            last_capture: None,
        }
    }

    pub fn with_dg535(mut self, dg535: Dg535<DynLink>) -> Self {
        self.dg535 = Some(dg535);
        self
    }

    pub fn with_bnc575(mut self, bnc575: Bnc575<DynLink>) -> Self {
        self.bnc575 = Some(bnc575);
        self
    }

    pub fn add_scope(mut self, scope: RigolScope<DynLink>) -> Self {
        self.scopes.push(scope);
        self
    }

    pub fn add_supply(mut self, supply: WjSupply<DynLink>) -> Self {
        self.supplies.push(Arc::new(Mutex::new(supply)));
        self
    }

    pub fn with_arduino(mut self, board: ArduinoBoard<DynLink>, poll_interval: Duration) -> Self {
        self.arduino = Some(board.shared());
        self.arduino_interval = poll_interval;
        self
    }

    /// Open every configured instrument.
    ///
    /// An instrument that fails to connect is logged and left out; a supply
    /// that fails is kept as disconnected so it still shows up in readings.
    pub fn connect(config: &BenchConfig) -> Result<Self, BenchError> {
        config.validate()?;
        let _span = tracing::info_span!("bench_connect").entered();
        let mut bench = Self::new(config.sequence.clone());

        if let Some(dg) = &config.dg535 {
            let opened = BenchConnector::open(&ResourceAddress::serial(&dg.port), dg.baud)
                .map_err(BenchError::from)
                .and_then(|link| Ok(Dg535::new(link, dg.gpib_address)?));
            match opened {
                Ok(dg535) => {
                    log::info!("DG535 connected on {}", dg.port);
                    bench.dg535 = Some(dg535);
                }
                Err(e) => log::warn!("DG535 on {} unavailable: {}", dg.port, e),
            }
        }

        if let Some(bnc) = &config.bnc575 {
            let opened = BenchConnector::open(&ResourceAddress::serial(&bnc.port), bnc.baud)
                .map_err(BenchError::from)
                .and_then(|link| {
                    let mut generator = Bnc575::new(link);
                    for (channel, settings) in bnc.channel_settings()? {
                        generator.set_channel(channel, settings)?;
                    }
                    Ok(generator)
                });
            match opened {
                Ok(generator) => {
                    log::info!("BNC575 connected on {}", bnc.port);
                    bench.bnc575 = Some(generator);
                }
                Err(e) => log::warn!("BNC575 on {} unavailable: {}", bnc.port, e),
            }
        }

        for scope in &config.scopes {
            let opened = scope
                .address()
                .map_err(BenchError::from)
                .and_then(|address| Ok(BenchConnector::open(&address, scope.baud)?))
                .and_then(|link| Ok(RigolScope::new(&scope.name, link, &scope.channels)?));
            match opened {
                Ok(driver) => {
                    log::info!("Scope {} connected: {}", scope.name, driver.identity());
                    bench.scopes.push(driver);
                }
                Err(e) => log::warn!("Scope {} at {} unavailable: {}", scope.name, scope.resource, e),
            }
        }

        for supply in &config.supplies {
            let driver = match BenchConnector::open(&ResourceAddress::serial(&supply.port), supply.baud) {
                Ok(link) => {
                    log::info!("Supply {} connected on {}", supply.name, supply.port);
                    WjSupply::new(&supply.name, link, supply.address)?
                }
                Err(e) => {
                    log::warn!("Supply {} on {} unavailable: {}", supply.name, supply.port, e);
                    WjSupply::disconnected(&supply.name, supply.address)?
                }
            };
            bench = bench.add_supply(driver.with_limits(supply.max_voltage, supply.max_current));
        }

        if let Some(arduino) = &config.arduino {
            match BenchConnector::open(&ResourceAddress::serial(&arduino.port), arduino.baud) {
                Ok(link) => {
                    log::info!("Arduino connected on {}", arduino.port);
                    bench = bench.with_arduino(ArduinoBoard::new(link), arduino.poll_interval);
                }
                Err(e) => log::warn!("Arduino on {} unavailable: {}", arduino.port, e),
            }
        }

        Ok(bench)
    }

    pub fn sequence_config(&self) -> &SequenceConfig {
        self.sequencer.config()
    }

    pub fn dg535(&mut self) -> Option<&mut Dg535<DynLink>> {
        self.dg535.as_mut()
    }

    pub fn bnc575(&mut self) -> Option<&mut Bnc575<DynLink>> {
        self.bnc575.as_mut()
    }

    pub fn scopes(&self) -> &[RigolScope<DynLink>] {
        &self.scopes
    }

    pub fn supplies(&self) -> &[SharedSupply] {
        &self.supplies
    }

    pub fn supply(&self, label: &str) -> Option<SharedSupply> {
        self.supplies
            .iter()
            .find(|s| lock(s).label() == label)
            .cloned()
    }

    pub fn arduino(&self) -> Option<SharedBoard<DynLink>> {
        self.arduino.clone()
    }

    /// Outcome of the most recent shot; replaced by every successful fire.
    pub fn last_capture(&self) -> Option<&FireOutcome> {
        self.last_capture.as_ref()
    }

    /// Run one fire/capture sequence over every connected instrument.
    ///
    /// The supplies stay locked for the whole shot so no poller can talk to
    /// them in between the interlock check and the trigger.
    pub fn fire(&mut self) -> Result<&FireOutcome, BenchError> {
        let master = self
            .dg535
            .as_mut()
            .ok_or(SequenceError::NotConnected("DG535"))?;

        let mut guards: Vec<MutexGuard<'_, WjSupply<DynLink>>> =
            self.supplies.iter().map(|s| lock(s)).collect();
        let mut supplies: Vec<&mut dyn HvSupply> = guards
            .iter_mut()
            .map(|guard| &mut **guard as &mut dyn HvSupply)
            .collect();
        let mut scopes: Vec<&mut dyn CaptureScope> = self
            .scopes
            .iter_mut()
            .map(|scope| scope as &mut dyn CaptureScope)
            .collect();
        let generator = self
            .bnc575
            .as_mut()
            .map(|generator| generator as &mut dyn ExternalTriggerArm);

        let outcome = self
            .sequencer
            .run(&mut scopes, generator, &mut supplies, master)?;
        drop(supplies);
        drop(guards);

        Ok(self.last_capture.insert(outcome))
    }

    /// Fire on a worker thread. The bench comes back through the returned job.
    pub fn spawn_fire(self) -> Result<FireJob, BenchError> {
        let handle = thread::Builder::new()
            .name("fire".to_string())
            .spawn(move || {
                let mut bench = self;
                let result = bench.fire().map(|_| ());
                (bench, result)
            })?;
        Ok(FireJob { handle })
    }

    /// Read every supply's status at `interval` on a background thread.
    pub fn hv_status_poller(&self, interval: Duration) -> Result<Poller<Vec<SupplyReading>>, BenchError> {
        let supplies = self.supplies.clone();
        let poller = Poller::spawn("hv-status", interval, move || {
            let readings = supplies
                .iter()
                .map(|supply| {
                    let mut supply = lock(supply);
                    let status = if supply.is_connected() {
                        supply
                            .status()
                            .map_err(|e| log::debug!("{}: status read failed: {}", supply.label(), e))
                            .ok()
                    } else {
                        None
                    };
                    SupplyReading {
                        label: supply.label().to_string(),
                        status,
                    }
                })
                .collect();
            Some(readings)
        })?;
        Ok(poller)
    }

    /// Stream the Arduino inputs at the configured poll interval.
    pub fn arduino_stream(&self) -> Result<Poller<IoSnapshot>, BenchError> {
        let board = self.arduino.clone().ok_or(BenchError::NotConnected("Arduino"))?;
        Ok(stream_inputs(board, self.arduino_interval)?)
    }

    /// Put the bench into a safe state: HV off on every supply, BNC575 disarmed, valves closed.
    ///
    /// Every step is attempted; the first error is returned afterwards.
    pub fn safe_shutdown(&mut self) -> Result<(), BenchError> {
        let _span = tracing::info_span!("safe_shutdown").entered();
        let mut first_error: Option<BenchError> = None;
        let mut note = |result: Result<(), BenchError>| {
            if let Err(e) = result {
                log::error!("Safe shutdown step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        for supply in &self.supplies {
            let mut supply = lock(supply);
            if supply.is_connected() {
                note(supply.hv_off().map_err(BenchError::from));
            }
        }
        if let Some(generator) = self.bnc575.as_mut() {
            note(generator.disarm().map_err(BenchError::from));
        }
        if let Some(board) = &self.arduino {
            note(lock(board).close_all_valves().map_err(BenchError::from));
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!("Bench in safe state");
                Ok(())
            }
        }
    }

    /// Safe the bench and drop every connection.
    pub fn close(mut self) -> Result<(), BenchError> {
        let result = self.safe_shutdown();
        for supply in &self.supplies {
            lock(supply).disconnect();
        }
        log::info!("Bench closed");
        result
    }
}

/// A shot running on a worker thread.
pub struct FireJob {
    handle: JoinHandle<FinishedShot>,
}

impl FireJob {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// The bench and the shot result once the worker is done, otherwise the job itself.
    pub fn try_finish(self) -> Result<Result<FinishedShot, BenchError>, Self> {
        if self.handle.is_finished() {
            Ok(self.wait())
        } else {
            Err(self)
        }
    }

    /// Block until the shot is done.
    pub fn wait(self) -> Result<FinishedShot, BenchError> {
        self.handle.join().map_err(|_| BenchError::WorkerPanicked)
    }
}
