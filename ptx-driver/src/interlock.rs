//! Power-rail interlock for paired boards.
//!
//! Some products are two USB devices in one chassis whose main rails
//! back each other up: while one side is busy, the sibling's rail must
//! stay energized too or its RF amps would load the shared antenna
//! path. Sides find each other through adjacent serial numbers; the
//! configured mode decides which sibling activity counts.
//!
//! All rail transitions of registered sides go through the interlock's
//! one mutex, so the pair can never observe half-settled power.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::power::PowerRail;

/// Which sibling activity keeps a side's rail energized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterlockMode {
    /// Any active receiver on the sibling holds this side up.
    #[default]
    All,
    /// Only the sibling's satellite receivers hold this side up.
    SatelliteOnly,
    /// Only the sibling's first satellite receiver does.
    Satellite0Only,
    /// Only the sibling's second satellite receiver does.
    Satellite1Only,
}

/// One registered device side.
struct Side {
    rail: Arc<PowerRail>,
    /// Bit per receiver wire index, set while that receiver is open.
    active: u16,
    /// This side's satellite-capable receiver bits, in layout order.
    satellite_bits: Vec<u16>,
}

impl Side {
    /// Which of this side's receivers count toward the sibling.
    fn influence(&self, mode: InterlockMode) -> u16 {
        match mode {
            InterlockMode::All => u16::MAX,
            InterlockMode::SatelliteOnly => {
                self.satellite_bits.iter().fold(0, |mask, bit| mask | bit)
            }
            InterlockMode::Satellite0Only => self.satellite_bits.first().copied().unwrap_or(0),
            InterlockMode::Satellite1Only => self.satellite_bits.get(1).copied().unwrap_or(0),
        }
    }
}

/// Rail coordinator shared by the two sides of one paired board.
pub struct PowerInterlock {
    mode: InterlockMode,
    sides: Mutex<[Option<Side>; 2]>,
}

impl PowerInterlock {
    pub fn new(mode: InterlockMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            sides: Mutex::new([None, None]),
        })
    }

    pub fn mode(&self) -> InterlockMode {
        self.mode
    }

    /// True while no side is registered.
    pub fn is_empty(&self) -> bool {
        self.sides.lock().iter().all(|s| s.is_none())
    }

    /// Attach one device side. `satellite_bits` lists the side's
    /// satellite-capable receiver bits in layout order. Settles both
    /// rails immediately, since the sibling may already be active.
    pub fn register_side(
        &self,
        side: usize,
        rail: Arc<PowerRail>,
        satellite_bits: Vec<u16>,
    ) -> Result<(), Error> {
        let mut sides = self.sides.lock();
        if side >= sides.len() || sides[side].is_some() {
            return Err(Error::InvalidState {
                op: "interlock register",
                state: "side taken or out of range",
            });
        }
        sides[side] = Some(Side {
            rail,
            active: 0,
            satellite_bits,
        });
        if let Err(e) = self.settle(&mut sides) {
            sides[side] = None;
            return Err(e);
        }
        debug!("[interlock] side {} registered ({:?})", side, self.mode);
        Ok(())
    }

    /// Detach one device side. The departing side's rail is dropped and
    /// the remaining side re-settled. Returns true when no side remains,
    /// so the caller can drop the record.
    pub fn deregister_side(&self, side: usize) -> bool {
        let mut sides = self.sides.lock();
        if let Some(removed) = sides.get_mut(side).and_then(Option::take) {
            removed.rail.power_off();
            // Deactivation only; cannot raise a rail, so cannot fail.
            if let Err(e) = self.settle(&mut sides) {
                warn!("[interlock] settle after deregister failed: {}", e);
            }
            debug!("[interlock] side {} deregistered", side);
        }
        sides.iter().all(|s| s.is_none())
    }

    /// Record receiver `index` on `side` as open or closed and settle
    /// both rails against the new activity.
    ///
    /// When raising a rail fails, the bitmap change is reverted and the
    /// error propagates; the caller sees its open fail and nothing else
    /// changed. Rail drops are best effort and only logged.
    pub fn set_power(&self, side: usize, index: u8, on: bool) -> Result<(), Error> {
        let mut sides = self.sides.lock();
        let bit = 1u16 << (index & 0x0F);
        let previous = match sides.get_mut(side).and_then(Option::as_mut) {
            Some(s) => {
                let previous = s.active;
                if on {
                    s.active |= bit;
                } else {
                    s.active &= !bit;
                }
                previous
            }
            None => {
                return Err(Error::InvalidState {
                    op: "interlock set_power",
                    state: "side not registered",
                })
            }
        };
        if let Err(e) = self.settle(&mut sides) {
            if let Some(s) = sides[side].as_mut() {
                s.active = previous;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Drive both rails to match current activity. Raises first; when a
    /// raise fails, every rail raised by this call is dropped again
    /// before the error is returned. Activity-wise a settle that only
    /// lowers rails cannot fail.
    fn settle(&self, sides: &mut [Option<Side>; 2]) -> Result<(), Error> {
        let want = self.wants(sides);
        let mut raised = [false; 2];
        for i in 0..2 {
            if let Some(side) = &sides[i] {
                if want[i] && !side.rail.is_powered() {
                    if let Err(e) = side.rail.power_on() {
                        for (j, was_raised) in raised.iter().enumerate() {
                            if *was_raised {
                                if let Some(other) = &sides[j] {
                                    other.rail.power_off();
                                }
                            }
                        }
                        return Err(e);
                    }
                    raised[i] = true;
                }
            }
        }
        for i in 0..2 {
            if let Some(side) = &sides[i] {
                if !want[i] && side.rail.is_powered() {
                    side.rail.power_off();
                }
            }
        }
        Ok(())
    }

    fn wants(&self, sides: &[Option<Side>; 2]) -> [bool; 2] {
        let mut want = [false; 2];
        for i in 0..2 {
            let own = sides[i].as_ref().map_or(0, |s| s.active);
            let sibling = sides[i ^ 1]
                .as_ref()
                .map_or(0, |s| s.active & s.influence(self.mode));
            want[i] = own != 0 || sibling != 0;
        }
        want
    }
}

/// Pairing key parsed from a device serial number: adjacent serials
/// form one pair (`serial / 10`), the last digit selects the side
/// (1 or 2). Other last digits mean the device is not paired.
pub fn pair_from_serial(serial: u64) -> Option<(u64, usize)> {
    match serial % 10 {
        1 => Some((serial / 10, 0)),
        2 => Some((serial / 10, 1)),
        _ => None,
    }
}
