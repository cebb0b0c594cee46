//! Hardware abstraction seams for PLEX/e-Better style USB ISDB receivers.
//!
//! The driver core talks to two kinds of hardware through this crate:
//! the USB bridge controller shared by every receiver on a board
//! ([`Bus`]), and the per-receiver tuner/demodulator chains
//! ([`TerrestrialFrontend`], [`SatelliteFrontend`]). Concrete chip
//! drivers implement these traits; the `mock` feature provides
//! scriptable fakes so the core can be tested without hardware.

pub mod bus;
pub mod error;
pub mod frontend;
#[cfg(feature = "mock")]
pub mod mock;
pub mod types;

pub use bus::{Bus, StreamSink};
pub use error::HwError;
pub use frontend::{FrontendChain, SatelliteFrontend, TerrestrialFrontend};
pub use types::{Bandwidth, LnbVoltage, System, TuneParams, TS_PACKET_SIZE, TS_SYNC_BYTE};
