//! Single-shot fire/capture sequence.
//!
//! One call to [`FireSequencer::run`] walks the bench through:
//!
//! 1. arm every oscilloscope for a single acquisition,
//! 2. arm the BNC575 on its external trigger input,
//! 3. run the HV interlock,
//! 4. fire the DG535 master trigger,
//! 5. poll all armed scopes until each has stopped or the capture timeout runs out,
//! 6. download the channel data from every scope that completed.
//!
//! A communication failure in steps 1-4 aborts the shot. In steps 5 and 6 a
//! scope that times out or fails only loses its own data.

use crate::bnc575::Bnc575Error;
use crate::dg535::Dg535Error;
use crate::interlock::{ensure_hv_off, HvSupply, InterlockPolicy};
use crate::pulse_config::{ExternalTrigger, MasterPulse};
use crate::rigol_scope::{ScopeCapture, ScopeError, TriggerStatus};
use serde::Deserialize;
use std::thread;
use std::time::{Duration, Instant};

pub trait CaptureScope {
    fn name(&self) -> &str;
    fn arm_single(&mut self) -> Result<(), ScopeError>;
    fn trigger_status(&mut self) -> Result<TriggerStatus, ScopeError>;
    fn fetch_capture(&mut self) -> Result<ScopeCapture, ScopeError>;
}

pub trait ExternalTriggerArm {
    fn arm_external_trigger(&mut self, trigger: &ExternalTrigger) -> Result<(), Bnc575Error>;
}

pub trait MasterTrigger {
    fn fire_single(&mut self, pulse: &MasterPulse) -> Result<(), Dg535Error>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub capture_timeout: Duration,
    pub external_trigger: ExternalTrigger,
    pub master_pulse: MasterPulse,
    pub interlock: InterlockPolicy,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            capture_timeout: Duration::from_secs(5),
            external_trigger: ExternalTrigger::default(),
            master_pulse: MasterPulse::default(),
            interlock: InterlockPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("Failed to arm scope {scope}: {source}")]
    ArmScope {
        scope: String,
        #[source]
        source: ScopeError,
    },

    #[error("Failed to arm pulse generator: {0}")]
    ArmPulseGenerator(#[from] Bnc575Error),

    #[error("HV interlock failed: not every supply could be confirmed off")]
    InterlockFailed,

    #[error("Failed to fire master trigger: {0}")]
    Fire(#[from] Dg535Error),

    #[error("{0} is not connected")]
    NotConnected(&'static str),
}

#[derive(Debug)]
pub enum ScopeOutcome {
    Captured(ScopeCapture),
    TimedOut,
    Failed(ScopeError),
}

#[derive(Debug)]
pub struct ScopeResult {
    pub scope: String,
    pub outcome: ScopeOutcome,
}

impl ScopeResult {
    pub fn capture(&self) -> Option<&ScopeCapture> {
        match &self.outcome {
            ScopeOutcome::Captured(capture) => Some(capture),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct FireOutcome {
    pub scopes: Vec<ScopeResult>,
    pub elapsed: Duration,
}

impl FireOutcome {
    pub fn captures(&self) -> impl Iterator<Item = &ScopeCapture> {
        self.scopes.iter().filter_map(ScopeResult::capture)
    }

    pub fn capture(&self, scope: &str) -> Option<&ScopeCapture> {
        self.scopes
            .iter()
            .find(|r| r.scope == scope)
            .and_then(ScopeResult::capture)
    }
}

enum Acquisition {
    Pending,
    Complete,
    Finished(ScopeOutcome),
}

pub struct FireSequencer {
    config: SequenceConfig,
}

impl FireSequencer {
    pub fn new(config: SequenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SequenceConfig {
        &self.config
    }

    pub fn run(
        &self,
        scopes: &mut [&mut dyn CaptureScope],
        pulse_generator: Option<&mut dyn ExternalTriggerArm>,
        supplies: &mut [&mut dyn HvSupply],
        master: &mut dyn MasterTrigger,
    ) -> Result<FireOutcome, SequenceError> {
        let _span = tracing::info_span!("fire_sequence", scopes = scopes.len()).entered();
        let start = Instant::now();

        for scope in scopes.iter_mut() {
            scope.arm_single().map_err(|source| SequenceError::ArmScope {
                scope: scope.name().to_string(),
                source,
            })?;
        }
        log::info!("{} scope(s) armed", scopes.len());

        match pulse_generator {
            Some(generator) => generator.arm_external_trigger(&self.config.external_trigger)?,
            None => log::warn!("BNC575 not connected, firing without it"),
        }

        if !ensure_hv_off(supplies, &self.config.interlock) {
            log::error!("Aborting shot: HV interlock failed");
            return Err(SequenceError::InterlockFailed);
        }

        master.fire_single(&self.config.master_pulse)?;

        let states = self.wait_for_acquisition(scopes);
        let results = scopes
            .iter_mut()
            .zip(states)
            .map(|(scope, state)| {
                let outcome = match state {
                    Acquisition::Finished(outcome) => outcome,
                    Acquisition::Complete => match scope.fetch_capture() {
                        Ok(capture) => ScopeOutcome::Captured(capture),
                        Err(e) => {
                            log::error!("Scope {}: download failed: {}", scope.name(), e);
                            ScopeOutcome::Failed(e)
                        }
                    },
                    Acquisition::Pending => ScopeOutcome::TimedOut,
                };
                ScopeResult {
                    scope: scope.name().to_string(),
                    outcome,
                }
            })
            .collect();

        let outcome = FireOutcome {
            scopes: results,
            elapsed: start.elapsed(),
        };
        log::info!(
            "Shot complete in {:?}: {}/{} scope(s) captured",
            outcome.elapsed,
            outcome.captures().count(),
            outcome.scopes.len()
        );
        Ok(outcome)
    }

    /// Round-robin every pending scope until it reports STOP or the shared deadline passes.
    fn wait_for_acquisition(&self, scopes: &mut [&mut dyn CaptureScope]) -> Vec<Acquisition> {
        let deadline = Instant::now() + self.config.capture_timeout;
        let mut states: Vec<Acquisition> = scopes.iter().map(|_| Acquisition::Pending).collect();

        loop {
            for (scope, state) in scopes.iter_mut().zip(states.iter_mut()) {
                if !matches!(state, Acquisition::Pending) {
                    continue;
                }
                match scope.trigger_status() {
                    Ok(TriggerStatus::Stopped) => {
                        log::debug!("Scope {} acquisition complete", scope.name());
                        *state = Acquisition::Complete;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Scope {}: status query failed: {}", scope.name(), e);
                        *state = Acquisition::Finished(ScopeOutcome::Failed(e));
                    }
                }
            }

            if !states.iter().any(|s| matches!(s, Acquisition::Pending)) {
                return states;
            }

            if Instant::now() >= deadline {
                for (scope, state) in scopes.iter().zip(states.iter_mut()) {
                    if matches!(state, Acquisition::Pending) {
                        log::warn!(
                            "Scope {} did not trigger within {:?}, skipping",
                            scope.name(),
                            self.config.capture_timeout
                        );
                        *state = Acquisition::Finished(ScopeOutcome::TimedOut);
                    }
                }
                return states;
            }

            thread::sleep(self.config.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument_link::LinkError;
    use crate::rigol_scope::ChannelTrace;
    use crate::wj_supply::WjError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    type Journal = Arc<Mutex<Vec<String>>>;

    fn record(journal: &Journal, entry: String) {
        journal.lock().unwrap().push(entry);
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Normal,
        NeverTriggers,
        ArmFails,
        StatusFails,
    }

    struct FakeScope {
        name: String,
        behaviour: Behaviour,
        fired: Arc<AtomicBool>,
        journal: Journal,
    }

    impl CaptureScope for FakeScope {
        fn name(&self) -> &str {
            &self.name
        }

        fn arm_single(&mut self) -> Result<(), ScopeError> {
            record(&self.journal, format!("arm {}", self.name));
            if self.behaviour == Behaviour::ArmFails {
                return Err(ScopeError::Link(LinkError::Closed));
            }
            Ok(())
        }

        fn trigger_status(&mut self) -> Result<TriggerStatus, ScopeError> {
            match self.behaviour {
                Behaviour::StatusFails => Err(ScopeError::Link(LinkError::Closed)),
                Behaviour::NeverTriggers => Ok(TriggerStatus::Waiting),
                _ if self.fired.load(Ordering::SeqCst) => Ok(TriggerStatus::Stopped),
                _ => Ok(TriggerStatus::Waiting),
            }
        }

        fn fetch_capture(&mut self) -> Result<ScopeCapture, ScopeError> {
            record(&self.journal, format!("fetch {}", self.name));
            Ok(ScopeCapture {
                scope: self.name.clone(),
                traces: vec![ChannelTrace {
                    channel: 1,
                    time: vec![0.0, 1e-9],
                    volts: vec![0.0, 1.0],
                }],
            })
        }
    }

    struct FakeGenerator {
        journal: Journal,
    }

    impl ExternalTriggerArm for FakeGenerator {
        fn arm_external_trigger(&mut self, trigger: &ExternalTrigger) -> Result<(), Bnc575Error> {
            record(&self.journal, format!("bnc arm {:.1}", trigger.level_v));
            Ok(())
        }
    }

    struct FakeMaster {
        fired: Arc<AtomicBool>,
        journal: Journal,
    }

    impl MasterTrigger for FakeMaster {
        fn fire_single(&mut self, _pulse: &MasterPulse) -> Result<(), Dg535Error> {
            record(&self.journal, "fire".to_string());
            self.fired.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeSupply {
        hv_on: bool,
        obeys: bool,
        journal: Journal,
    }

    impl HvSupply for FakeSupply {
        fn label(&self) -> &str {
            "wj1"
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn force_hv_off(&mut self) -> Result<(), WjError> {
            record(&self.journal, "hv off".to_string());
            if self.obeys {
                self.hv_on = false;
            }
            Ok(())
        }

        fn hv_is_off(&mut self) -> Result<bool, WjError> {
            Ok(!self.hv_on)
        }
    }

    struct Bench {
        fired: Arc<AtomicBool>,
        journal: Journal,
    }

    impl Bench {
        fn new() -> Self {
            Self {
                fired: Arc::new(AtomicBool::new(false)),
                journal: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn scope(&self, name: &str, behaviour: Behaviour) -> FakeScope {
            FakeScope {
                name: name.to_string(),
                behaviour,
                fired: self.fired.clone(),
                journal: self.journal.clone(),
            }
        }

        fn master(&self) -> FakeMaster {
            FakeMaster {
                fired: self.fired.clone(),
                journal: self.journal.clone(),
            }
        }

        fn supply(&self, obeys: bool) -> FakeSupply {
            FakeSupply {
                hv_on: true,
                obeys,
                journal: self.journal.clone(),
            }
        }

        fn journal(&self) -> Vec<String> {
            self.journal.lock().unwrap().clone()
        }
    }

    fn sequencer(capture_timeout: Duration) -> FireSequencer {
        FireSequencer::new(SequenceConfig {
            poll_interval: Duration::from_millis(1),
            capture_timeout,
            interlock: InterlockPolicy {
                attempts: 5,
                interval: Duration::ZERO,
            },
            ..SequenceConfig::default()
        })
    }

    #[test]
    fn test_steps_run_in_order() {
        let bench = Bench::new();
        let mut s1 = bench.scope("scope1", Behaviour::Normal);
        let mut s2 = bench.scope("scope2", Behaviour::Normal);
        let mut generator = FakeGenerator {
            journal: bench.journal.clone(),
        };
        let mut supply = bench.supply(true);
        let mut master = bench.master();

        let outcome = sequencer(Duration::from_secs(1))
            .run(
                &mut [&mut s1, &mut s2],
                Some(&mut generator),
                &mut [&mut supply],
                &mut master,
            )
            .unwrap();

        assert_eq!(
            bench.journal(),
            vec![
                "arm scope1",
                "arm scope2",
                "bnc arm 2.5",
                "hv off",
                "fire",
                "fetch scope1",
                "fetch scope2",
            ]
        );
        assert_eq!(outcome.captures().count(), 2);
        assert!(outcome.capture("scope2").is_some());
    }

    #[test]
    fn test_interlock_failure_aborts_before_fire() {
        let bench = Bench::new();
        let mut s1 = bench.scope("scope1", Behaviour::Normal);
        let mut supply = bench.supply(false);
        let mut master = bench.master();

        let result = sequencer(Duration::from_secs(1)).run(
            &mut [&mut s1],
            None,
            &mut [&mut supply],
            &mut master,
        );

        assert!(matches!(result, Err(SequenceError::InterlockFailed)));
        assert!(!bench.fired.load(Ordering::SeqCst));
        assert!(!bench.journal().contains(&"fire".to_string()));
    }

    #[test]
    fn test_silent_scope_times_out_without_blocking_others() {
        let bench = Bench::new();
        let mut s1 = bench.scope("scope1", Behaviour::NeverTriggers);
        let mut s2 = bench.scope("scope2", Behaviour::Normal);
        let mut s3 = bench.scope("scope3", Behaviour::Normal);
        let mut master = bench.master();

        let timeout = Duration::from_millis(30);
        let outcome = sequencer(timeout)
            .run(&mut [&mut s1, &mut s2, &mut s3], None, &mut [], &mut master)
            .unwrap();

        assert!(matches!(outcome.scopes[0].outcome, ScopeOutcome::TimedOut));
        assert!(outcome.capture("scope1").is_none());
        assert!(outcome.capture("scope2").is_some());
        assert!(outcome.capture("scope3").is_some());
        assert!(!bench.journal().contains(&"fetch scope1".to_string()));
        assert!(outcome.elapsed >= timeout);
    }

    #[test]
    fn test_status_error_only_affects_that_scope() {
        let bench = Bench::new();
        let mut s1 = bench.scope("scope1", Behaviour::StatusFails);
        let mut s2 = bench.scope("scope2", Behaviour::Normal);
        let mut master = bench.master();

        let outcome = sequencer(Duration::from_secs(1))
            .run(&mut [&mut s1, &mut s2], None, &mut [], &mut master)
            .unwrap();

        assert!(matches!(outcome.scopes[0].outcome, ScopeOutcome::Failed(_)));
        assert!(outcome.capture("scope2").is_some());
    }

    #[test]
    fn test_arm_failure_aborts_sequence() {
        let bench = Bench::new();
        let mut s1 = bench.scope("scope1", Behaviour::Normal);
        let mut s2 = bench.scope("scope2", Behaviour::ArmFails);
        let mut s3 = bench.scope("scope3", Behaviour::Normal);
        let mut supply = bench.supply(true);
        let mut master = bench.master();

        let result = sequencer(Duration::from_secs(1)).run(
            &mut [&mut s1, &mut s2, &mut s3],
            None,
            &mut [&mut supply],
            &mut master,
        );

        assert!(matches!(
            result,
            Err(SequenceError::ArmScope { ref scope, .. }) if scope == "scope2"
        ));
        assert_eq!(bench.journal(), vec!["arm scope1", "arm scope2"]);
    }

    #[test]
    fn test_scope_that_never_arms_aborts_before_fire() {
        use crate::rigol_scope::RigolScope;
        use crate::test_support::{line_responder, ScriptedLink};

        let bench = Bench::new();
        // Ignores :SING and keeps serving the previous acquisition.
        let link = ScriptedLink::new(line_responder(vec![
            ("*IDN?", "RIGOL TECHNOLOGIES,DS1104Z,DS1ZA0001,00.04.04"),
            (":TRIG:STAT?", "STOP"),
        ]));
        let mut stale = RigolScope::new("s1", link.clone(), &[1]).unwrap();
        stale.set_arm_timeout(Duration::from_millis(20));
        let mut master = bench.master();

        let result = sequencer(Duration::from_secs(1)).run(&mut [&mut stale], None, &mut [], &mut master);

        assert!(matches!(
            result,
            Err(SequenceError::ArmScope {
                source: ScopeError::NotArmed { .. },
                ..
            })
        ));
        assert!(!bench.fired.load(Ordering::SeqCst));
        assert!(!link.written_lines().iter().any(|l| l.starts_with(":WAV:DATA?")));
    }
}
