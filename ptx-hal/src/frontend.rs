//! Tuner/demodulator chain seams, one per broadcast system.

use crate::error::HwError;
use crate::types::{Bandwidth, System};

/// An ISDB-T tuner/demodulator chain.
///
/// Callers hold exclusive access while driving a chain, so the methods
/// take `&mut self` and implementations need no internal locking.
pub trait TerrestrialFrontend: Send {
    /// Bring the chain out of sleep.
    fn wakeup(&mut self) -> Result<(), HwError>;

    /// Put the chain to sleep.
    fn sleep(&mut self) -> Result<(), HwError>;

    /// One-time setup of the shared chip bus this chain hangs off.
    /// Runs once per power cycle, on the designated chain only.
    fn init_sub_bus(&mut self) -> Result<(), HwError>;

    /// Program the demodulator for ISDB-T reception.
    fn prepare(&mut self, bandwidth: Bandwidth) -> Result<(), HwError>;

    /// Program the RF synthesizer.
    fn set_frequency(&mut self, khz: u32) -> Result<(), HwError>;

    /// Probe the synthesizer lock flag.
    fn is_pll_locked(&mut self) -> Result<bool, HwError>;

    /// Probe the demodulator signal lock flag.
    fn is_signal_locked(&mut self) -> Result<bool, HwError>;

    /// Gate the TS output pins toward the bridge.
    fn set_ts_output(&mut self, on: bool) -> Result<(), HwError>;

    /// Raw C/N counter readout from the demodulator.
    fn read_cnr(&mut self) -> Result<u32, HwError>;
}

/// An ISDB-S tuner/demodulator chain.
pub trait SatelliteFrontend: Send {
    /// Bring the chain out of sleep.
    fn wakeup(&mut self) -> Result<(), HwError>;

    /// Put the chain to sleep.
    fn sleep(&mut self) -> Result<(), HwError>;

    /// One-time setup of the shared chip bus this chain hangs off.
    fn init_sub_bus(&mut self) -> Result<(), HwError>;

    /// Program the demodulator for ISDB-S reception.
    fn prepare(&mut self) -> Result<(), HwError>;

    /// Program the RF synthesizer with the IF frequency.
    fn set_frequency(&mut self, khz: u32) -> Result<(), HwError>;

    /// Probe the synthesizer lock flag.
    fn is_pll_locked(&mut self) -> Result<bool, HwError>;

    /// Probe the demodulator signal lock flag.
    fn is_signal_locked(&mut self) -> Result<bool, HwError>;

    /// Select one TS of the locked transponder by transport stream id.
    fn set_stream_id(&mut self, tsid: u16) -> Result<(), HwError>;

    /// Probe whether the selected TS is being output.
    fn is_stream_active(&mut self) -> Result<bool, HwError>;

    /// Gate the TS output pins toward the bridge.
    fn set_ts_output(&mut self, on: bool) -> Result<(), HwError>;

    /// Raw C/N counter readout from the demodulator.
    fn read_cnr(&mut self) -> Result<u32, HwError>;
}

/// A receiver's chain, tagged by the system it demodulates.
///
/// The tag is what makes capability checks cheap: a tuning request for
/// the wrong system is refused before any register I/O happens.
pub enum FrontendChain {
    Terrestrial(Box<dyn TerrestrialFrontend>),
    Satellite(Box<dyn SatelliteFrontend>),
}

impl FrontendChain {
    /// Broadcast system this chain demodulates.
    pub fn system(&self) -> System {
        match self {
            FrontendChain::Terrestrial(_) => System::IsdbT,
            FrontendChain::Satellite(_) => System::IsdbS,
        }
    }

    pub fn wakeup(&mut self) -> Result<(), HwError> {
        match self {
            FrontendChain::Terrestrial(fe) => fe.wakeup(),
            FrontendChain::Satellite(fe) => fe.wakeup(),
        }
    }

    pub fn sleep(&mut self) -> Result<(), HwError> {
        match self {
            FrontendChain::Terrestrial(fe) => fe.sleep(),
            FrontendChain::Satellite(fe) => fe.sleep(),
        }
    }

    pub fn init_sub_bus(&mut self) -> Result<(), HwError> {
        match self {
            FrontendChain::Terrestrial(fe) => fe.init_sub_bus(),
            FrontendChain::Satellite(fe) => fe.init_sub_bus(),
        }
    }

    pub fn set_ts_output(&mut self, on: bool) -> Result<(), HwError> {
        match self {
            FrontendChain::Terrestrial(fe) => fe.set_ts_output(on),
            FrontendChain::Satellite(fe) => fe.set_ts_output(on),
        }
    }

    pub fn read_cnr(&mut self) -> Result<u32, HwError> {
        match self {
            FrontendChain::Terrestrial(fe) => fe.read_cnr(),
            FrontendChain::Satellite(fe) => fe.read_cnr(),
        }
    }
}
