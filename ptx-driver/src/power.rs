//! Main power rail handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use ptx_hal::Bus;

use crate::error::Error;

/// Handle on one device's main power rail.
///
/// The owning device group and, on paired boards, the interlock both
/// drive the rail through this handle. It carries no lock of its own:
/// whoever calls already serializes transitions (the group under its
/// state mutex, the interlock under its table mutex), and keeping the
/// handle lock-free lets the interlock raise a sibling's rail without
/// touching the sibling's group.
///
/// The epoch advances on every off-to-on edge. Per-power-cycle chip
/// initialization is keyed off it, so receivers re-run their sub-bus
/// setup after the rail was down, and only then.
pub struct PowerRail {
    bus: Arc<dyn Bus>,
    powered: AtomicBool,
    epoch: AtomicU64,
}

impl PowerRail {
    pub fn new(bus: Arc<dyn Bus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            powered: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        })
    }

    /// Energize the rail. No-op when already up.
    pub fn power_on(&self) -> Result<(), Error> {
        if self.powered.load(Ordering::Acquire) {
            return Ok(());
        }
        self.bus.set_power(true).map_err(Error::power)?;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.powered.store(true, Ordering::Release);
        debug!("[power] main rail up, epoch {}", self.epoch());
        Ok(())
    }

    /// Drop the rail. Release path: failures are logged and the rail is
    /// accounted off regardless.
    pub fn power_off(&self) {
        if !self.powered.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.bus.set_power(false) {
            warn!("[power] main rail power-off failed: {}", e);
        } else {
            debug!("[power] main rail down");
        }
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    /// Current power epoch. Starts at 0; the first power-on makes it 1.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use ptx_hal::mock::{BusOp, MockBus};

    use super::*;

    #[test]
    fn test_epoch_advances_on_rising_edge_only() {
        let bus = MockBus::new();
        let rail = PowerRail::new(bus.clone());
        assert_eq!(rail.epoch(), 0);

        rail.power_on().unwrap();
        rail.power_on().unwrap();
        assert_eq!(rail.epoch(), 1);
        assert!(rail.is_powered());

        rail.power_off();
        rail.power_off();
        assert_eq!(rail.epoch(), 1);

        rail.power_on().unwrap();
        assert_eq!(rail.epoch(), 2);
        assert_eq!(
            bus.ops(),
            vec![
                BusOp::SetPower(true),
                BusOp::SetPower(false),
                BusOp::SetPower(true)
            ]
        );
    }

    #[test]
    fn test_failed_power_on_leaves_rail_off() {
        let bus = MockBus::new();
        bus.set_fail_power(true);
        let rail = PowerRail::new(bus.clone());
        assert!(rail.power_on().is_err());
        assert!(!rail.is_powered());
        assert_eq!(rail.epoch(), 0);
    }
}
