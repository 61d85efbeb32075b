//! HV safety interlock.
//!
//! Before anything on the bench is fired every connected HV supply must be
//! switched off and its own status readback must confirm it. Supplies that
//! are not connected cannot be charging anything and pass trivially.

use crate::wj_supply::WjError;
use serde::Deserialize;
use std::thread;
use std::time::Duration;

pub trait HvSupply {
    fn label(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Command the supply to drop HV. Must be safe to repeat.
    fn force_hv_off(&mut self) -> Result<(), WjError>;

    /// Live readback; never cached.
    fn hv_is_off(&mut self) -> Result<bool, WjError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InterlockPolicy {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for InterlockPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_millis(300),
        }
    }
}

fn confirm_off(supply: &mut dyn HvSupply, policy: &InterlockPolicy) -> bool {
    for attempt in 1..=policy.attempts.max(1) {
        if let Err(e) = supply.force_hv_off() {
            log::warn!("{}: HV off command failed: {}", supply.label(), e);
        }
        if !policy.interval.is_zero() {
            thread::sleep(policy.interval);
        }

        match supply.hv_is_off() {
            Ok(true) => {
                log::debug!("{}: HV confirmed off (attempt {})", supply.label(), attempt);
                return true;
            }
            Ok(false) => log::debug!("{}: HV still on (attempt {})", supply.label(), attempt),
            Err(e) => log::debug!(
                "{}: status unreadable (attempt {}): {}",
                supply.label(),
                attempt,
                e
            ),
        }
    }
    false
}

/// Switch every connected supply off and confirm it. Returns `false` if any
/// connected supply could not be confirmed off within `policy.attempts`.
///
/// Every supply is tried even after one fails.
pub fn ensure_hv_off(supplies: &mut [&mut dyn HvSupply], policy: &InterlockPolicy) -> bool {
    let _span = tracing::info_span!("hv_interlock", supplies = supplies.len()).entered();

    let mut all_off = true;
    for supply in supplies.iter_mut() {
        if !supply.is_connected() {
            log::debug!("{}: not connected, nothing to switch off", supply.label());
            continue;
        }
        if !confirm_off(&mut **supply, policy) {
            log::error!(
                "{}: HV could not be confirmed off after {} attempts",
                supply.label(),
                policy.attempts
            );
            all_off = false;
        }
    }
    all_off
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument_link::LinkError;

    /// Reports HV on for the first `stays_on` queries after an off command.
    struct FakeSupply {
        label: String,
        connected: bool,
        stays_on: u32,
        unreadable: bool,
        off_commands: u32,
        queries: u32,
    }

    impl FakeSupply {
        fn new(label: &str, stays_on: u32) -> Self {
            Self {
                label: label.to_string(),
                connected: true,
                stays_on,
                unreadable: false,
                off_commands: 0,
                queries: 0,
            }
        }
    }

    impl HvSupply for FakeSupply {
        fn label(&self) -> &str {
            &self.label
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn force_hv_off(&mut self) -> Result<(), WjError> {
            self.off_commands += 1;
            Ok(())
        }

        fn hv_is_off(&mut self) -> Result<bool, WjError> {
            self.queries += 1;
            if self.unreadable {
                return Err(WjError::Link(LinkError::Closed));
            }
            Ok(self.queries > self.stays_on)
        }
    }

    fn fast() -> InterlockPolicy {
        InterlockPolicy {
            attempts: 5,
            interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_all_supplies_confirm_off() {
        let mut a = FakeSupply::new("wj1", 0);
        let mut b = FakeSupply::new("wj2", 2);

        assert!(ensure_hv_off(&mut [&mut a, &mut b], &fast()));
        assert_eq!(a.queries, 1);
        assert_eq!(b.queries, 3);
        assert_eq!(b.off_commands, 3);
    }

    #[test]
    fn test_supply_stuck_on_fails_interlock() {
        let mut ok = FakeSupply::new("wj1", 0);
        let mut stuck = FakeSupply::new("wj2", u32::MAX);

        assert!(!ensure_hv_off(&mut [&mut stuck, &mut ok], &fast()));
        assert_eq!(stuck.queries, 5);
        // The failing supply does not stop the others from being switched off.
        assert_eq!(ok.off_commands, 1);
    }

    #[test]
    fn test_confirmation_on_last_attempt_passes() {
        let mut late = FakeSupply::new("wj1", 4);
        assert!(ensure_hv_off(&mut [&mut late], &fast()));

        let mut too_late = FakeSupply::new("wj1", 5);
        assert!(!ensure_hv_off(&mut [&mut too_late], &fast()));
    }

    #[test]
    fn test_unreadable_status_is_not_confirmation() {
        let mut silent = FakeSupply::new("wj1", 0);
        silent.unreadable = true;
        assert!(!ensure_hv_off(&mut [&mut silent], &fast()));
    }

    #[test]
    fn test_disconnected_supplies_pass() {
        let mut absent = FakeSupply::new("wj3", u32::MAX);
        absent.connected = false;

        assert!(ensure_hv_off(&mut [&mut absent], &fast()));
        assert_eq!(absent.off_commands, 0);
        assert!(ensure_hv_off(&mut [], &fast()));
    }

    #[test]
    fn test_interval_is_respected() {
        let mut b = FakeSupply::new("wj2", 2);
        let policy = InterlockPolicy {
            attempts: 5,
            interval: Duration::from_millis(5),
        };
        let start = std::time::Instant::now();
        assert!(ensure_hv_off(&mut [&mut b], &policy));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
