//! Driver core for PLEX/e-Better multi-tuner USB ISDB-T/ISDB-S receivers.
//!
//! The hardware shares one USB bulk pipe between up to four tuners: the
//! bridge tags every 188-byte TS packet with the receiver it came from,
//! and the driver splits that joint stream back apart.
//!
//! ```text
//!                      control plane
//!   Registry ──> DeviceGroup ──> Receiver ──> FrontendChain (HAL)
//!                     │
//!                     │ one bulk session per device
//!                     v
//!   USB chunks ──> StreamDemultiplexer ──> RingBuffer ──> read_stream()
//!                  (sync + route)           (per receiver)
//! ```
//!
//! * [`Registry`] owns attached devices, resolves which two devices form
//!   a paired board, and carries the driver-wide shutdown token.
//! * [`DeviceGroup`] is one USB device: power rail, bulk session and the
//!   refcounts that gate them.
//! * [`Receiver`] is one logical tuner with the open/tune/capture/close
//!   lifecycle callers drive.
//!
//! # Example
//!
//! ```rust
//! use ptx_driver::{DeviceFamilyConfig, Registry, TuneParams};
//! use ptx_hal::mock::{MockBus, MockSatellite, MockTerrestrial};
//! use ptx_hal::FrontendChain;
//!
//! let registry = Registry::new();
//! let frontends = vec![
//!     FrontendChain::Satellite(Box::new(MockSatellite::new())),
//!     FrontendChain::Satellite(Box::new(MockSatellite::new())),
//!     FrontendChain::Terrestrial(Box::new(MockTerrestrial::new())),
//!     FrontendChain::Terrestrial(Box::new(MockTerrestrial::new())),
//! ];
//! let group = registry.attach_device(
//!     "PX-W3U4",
//!     72340015,
//!     MockBus::new(),
//!     DeviceFamilyConfig::w3u4(),
//!     frontends,
//! )?;
//!
//! let receiver = &group.receivers()[2];
//! receiver.open()?;
//! receiver.tune(TuneParams::terrestrial(473_143))?;
//! receiver.set_capture(true)?;
//! // read_stream() now drains this receiver's packets, typically from
//! // a dedicated thread.
//! receiver.close()?;
//! # Ok::<(), ptx_driver::Error>(())
//! ```

pub mod buffer;
pub mod cancel;
pub mod config;
pub mod demux;
pub mod error;
pub mod group;
pub mod interlock;
pub mod power;
pub mod receiver;
pub mod registry;

pub use buffer::RingBuffer;
pub use cancel::ShutdownToken;
pub use config::{ConfigError, DeviceFamilyConfig, PollBudget, ReceiverLayout};
pub use demux::DemuxStats;
pub use error::{Error, LockStage, Result};
pub use group::DeviceGroup;
pub use interlock::{pair_from_serial, InterlockMode, PowerInterlock};
pub use power::PowerRail;
pub use receiver::{Receiver, ReceiverState};
pub use registry::Registry;

pub use ptx_hal::{Bandwidth, LnbVoltage, System, TuneParams, TS_PACKET_SIZE};
