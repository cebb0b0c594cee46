//! USB bridge controller seam.

use std::time::Duration;

use crate::error::HwError;

/// Continuation handed to `Bus::start_streaming`. The bus I/O thread
/// invokes it once per received bulk chunk, in arrival order, until the
/// session is stopped.
pub type StreamSink = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Control operations of the USB bridge shared by all receivers of one
/// physical device.
///
/// Implementations are expected to be internally synchronized; the
/// driver core calls them from several threads.
pub trait Bus: Send + Sync {
    /// Switch the main power rail feeding the tuner/demodulator chips.
    fn set_power(&self, on: bool) -> Result<(), HwError>;

    /// Switch the auxiliary antenna supply rail (LNB).
    fn set_aux_power(&self, on: bool) -> Result<(), HwError>;

    /// Begin the bulk TS transfer session. `sink` runs on the bus I/O
    /// thread for every received chunk until `stop_streaming`.
    fn start_streaming(&self, sink: StreamSink) -> Result<(), HwError>;

    /// Tear the bulk TS transfer session down. Pending chunks complete
    /// before this returns.
    fn stop_streaming(&self) -> Result<(), HwError>;

    /// Read consecutive bridge registers starting at `addr`.
    fn read_regs(&self, addr: u8, buf: &mut [u8]) -> Result<(), HwError>;

    /// Write consecutive bridge registers starting at `addr`.
    fn write_regs(&self, addr: u8, data: &[u8]) -> Result<(), HwError>;

    /// Discard whatever sits in the bridge receive FIFO, waiting at most
    /// `timeout` for in-flight transfers to drain.
    fn purge(&self, timeout: Duration) -> Result<(), HwError>;
}
