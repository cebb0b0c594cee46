//! Scriptable fake hardware for driver tests.
//!
//! `MockBus` captures the streaming sink handed to it so a test can
//! play the role of the bus I/O thread and inject raw wire bytes with
//! [`MockBus::feed`]. The mock frontends report lock after a scripted
//! number of probes. All knobs are shared atomics so a test keeps
//! control after the mock has been boxed into a
//! [`FrontendChain`](crate::frontend::FrontendChain).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bus::{Bus, StreamSink};
use crate::error::HwError;
use crate::frontend::{SatelliteFrontend, TerrestrialFrontend};
use crate::types::Bandwidth;

/// Register window size emulated by [`MockBus`].
pub const MOCK_REG_SPACE: usize = 256;

/// Control operations recorded by [`MockBus`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    SetPower(bool),
    SetAuxPower(bool),
    StartStreaming,
    StopStreaming,
    Purge,
    ReadRegs(u8, usize),
    WriteRegs(u8, Vec<u8>),
}

/// Fake USB bridge controller.
pub struct MockBus {
    ops: Mutex<Vec<BusOp>>,
    sink: Mutex<Option<StreamSink>>,
    regs: Mutex<Vec<u8>>,
    powered: AtomicBool,
    aux_powered: AtomicBool,
    streaming: AtomicBool,
    fail_power: AtomicBool,
    fail_aux_power: AtomicBool,
    fail_start: AtomicBool,
    fail_purge: AtomicBool,
    gone: AtomicBool,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            regs: Mutex::new(vec![0; MOCK_REG_SPACE]),
            powered: AtomicBool::new(false),
            aux_powered: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            fail_power: AtomicBool::new(false),
            fail_aux_power: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_purge: AtomicBool::new(false),
            gone: AtomicBool::new(false),
        })
    }

    /// Snapshot of every control call made so far.
    pub fn ops(&self) -> Vec<BusOp> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    /// Deliver one bulk chunk to the captured sink, as the bus I/O
    /// thread would. Returns false when no session is running.
    pub fn feed(&self, chunk: &[u8]) -> bool {
        let mut sink = self.sink.lock();
        match sink.as_mut() {
            Some(sink) => {
                sink(chunk);
                true
            }
            None => false,
        }
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    pub fn is_aux_powered(&self) -> bool {
        self.aux_powered.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Make `set_power` fail until cleared.
    pub fn set_fail_power(&self, fail: bool) {
        self.fail_power.store(fail, Ordering::SeqCst);
    }

    /// Make `set_aux_power` fail until cleared.
    pub fn set_fail_aux_power(&self, fail: bool) {
        self.fail_aux_power.store(fail, Ordering::SeqCst);
    }

    /// Make `start_streaming` fail until cleared.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make `purge` time out until cleared.
    pub fn set_fail_purge(&self, fail: bool) {
        self.fail_purge.store(fail, Ordering::SeqCst);
    }

    /// Simulate surprise removal: every later call reports `Gone`.
    pub fn set_gone(&self, gone: bool) {
        self.gone.store(gone, Ordering::SeqCst);
    }

    fn check_gone(&self) -> Result<(), HwError> {
        if self.gone.load(Ordering::SeqCst) {
            Err(HwError::Gone)
        } else {
            Ok(())
        }
    }
}

impl Bus for MockBus {
    fn set_power(&self, on: bool) -> Result<(), HwError> {
        self.check_gone()?;
        if self.fail_power.load(Ordering::SeqCst) {
            return Err(HwError::Register("power control nack".into()));
        }
        self.ops.lock().push(BusOp::SetPower(on));
        self.powered.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn set_aux_power(&self, on: bool) -> Result<(), HwError> {
        self.check_gone()?;
        if self.fail_aux_power.load(Ordering::SeqCst) {
            return Err(HwError::Register("aux power control nack".into()));
        }
        self.ops.lock().push(BusOp::SetAuxPower(on));
        self.aux_powered.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn start_streaming(&self, sink: StreamSink) -> Result<(), HwError> {
        self.check_gone()?;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(HwError::Register("bulk endpoint setup failed".into()));
        }
        self.ops.lock().push(BusOp::StartStreaming);
        *self.sink.lock() = Some(sink);
        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_streaming(&self) -> Result<(), HwError> {
        // The sink dies with the session no matter how the device fares.
        *self.sink.lock() = None;
        self.streaming.store(false, Ordering::SeqCst);
        self.check_gone()?;
        self.ops.lock().push(BusOp::StopStreaming);
        Ok(())
    }

    fn read_regs(&self, addr: u8, buf: &mut [u8]) -> Result<(), HwError> {
        self.check_gone()?;
        let start = usize::from(addr);
        let regs = self.regs.lock();
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= regs.len())
            .ok_or(HwError::Unsupported("register window"))?;
        buf.copy_from_slice(&regs[start..end]);
        self.ops.lock().push(BusOp::ReadRegs(addr, buf.len()));
        Ok(())
    }

    fn write_regs(&self, addr: u8, data: &[u8]) -> Result<(), HwError> {
        self.check_gone()?;
        let start = usize::from(addr);
        let mut regs = self.regs.lock();
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= regs.len())
            .ok_or(HwError::Unsupported("register window"))?;
        regs[start..end].copy_from_slice(data);
        self.ops.lock().push(BusOp::WriteRegs(addr, data.to_vec()));
        Ok(())
    }

    fn purge(&self, timeout: Duration) -> Result<(), HwError> {
        self.check_gone()?;
        if self.fail_purge.load(Ordering::SeqCst) {
            return Err(HwError::Timeout(timeout));
        }
        self.ops.lock().push(BusOp::Purge);
        Ok(())
    }
}

/// Frontend operations recorded by the mock chains, in call order.
/// Lock probes are not logged; script them through the countdowns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendOp {
    Wakeup,
    Sleep,
    InitSubBus,
    Prepare,
    SetFrequency(u32),
    SetStreamId(u16),
    SetTsOutput(bool),
    ReadCnr,
}

/// Shared op log handle kept by tests after the mock is boxed.
pub type FrontendLog = Arc<Mutex<Vec<FrontendOp>>>;

fn countdown_hit(counter: &AtomicU32) -> bool {
    if counter.load(Ordering::SeqCst) == 0 {
        return true;
    }
    counter.fetch_sub(1, Ordering::SeqCst);
    false
}

/// Fake ISDB-T chain. Locks report ready once their countdown reaches
/// zero; a fresh mock locks on the first probe.
pub struct MockTerrestrial {
    ops: FrontendLog,
    pll_countdown: Arc<AtomicU32>,
    signal_countdown: Arc<AtomicU32>,
    fail_wakeup: Arc<AtomicBool>,
    fail_prepare: Arc<AtomicBool>,
    gone: Arc<AtomicBool>,
    cnr: Arc<AtomicU32>,
}

impl MockTerrestrial {
    pub fn new() -> Self {
        Self {
            ops: Arc::new(Mutex::new(Vec::new())),
            pll_countdown: Arc::new(AtomicU32::new(0)),
            signal_countdown: Arc::new(AtomicU32::new(0)),
            fail_wakeup: Arc::new(AtomicBool::new(false)),
            fail_prepare: Arc::new(AtomicBool::new(false)),
            gone: Arc::new(AtomicBool::new(false)),
            cnr: Arc::new(AtomicU32::new(25_000)),
        }
    }

    /// Lock after the given number of unlocked probes per stage.
    pub fn lock_after(pll_polls: u32, signal_polls: u32) -> Self {
        let fe = Self::new();
        fe.pll_countdown.store(pll_polls, Ordering::SeqCst);
        fe.signal_countdown.store(signal_polls, Ordering::SeqCst);
        fe
    }

    pub fn op_log(&self) -> FrontendLog {
        Arc::clone(&self.ops)
    }

    pub fn pll_countdown(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.pll_countdown)
    }

    pub fn signal_countdown(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.signal_countdown)
    }

    pub fn fail_wakeup_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_wakeup)
    }

    pub fn fail_prepare_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_prepare)
    }

    pub fn gone_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.gone)
    }

    pub fn cnr_value(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.cnr)
    }

    fn check_gone(&self) -> Result<(), HwError> {
        if self.gone.load(Ordering::SeqCst) {
            Err(HwError::Gone)
        } else {
            Ok(())
        }
    }
}

impl Default for MockTerrestrial {
    fn default() -> Self {
        Self::new()
    }
}

impl TerrestrialFrontend for MockTerrestrial {
    fn wakeup(&mut self) -> Result<(), HwError> {
        self.check_gone()?;
        if self.fail_wakeup.load(Ordering::SeqCst) {
            return Err(HwError::Register("wakeup sequence nack".into()));
        }
        self.ops.lock().push(FrontendOp::Wakeup);
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::Sleep);
        Ok(())
    }

    fn init_sub_bus(&mut self) -> Result<(), HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::InitSubBus);
        Ok(())
    }

    fn prepare(&mut self, _bandwidth: Bandwidth) -> Result<(), HwError> {
        self.check_gone()?;
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(HwError::Register("demod setup nack".into()));
        }
        self.ops.lock().push(FrontendOp::Prepare);
        Ok(())
    }

    fn set_frequency(&mut self, khz: u32) -> Result<(), HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::SetFrequency(khz));
        Ok(())
    }

    fn is_pll_locked(&mut self) -> Result<bool, HwError> {
        self.check_gone()?;
        Ok(countdown_hit(&self.pll_countdown))
    }

    fn is_signal_locked(&mut self) -> Result<bool, HwError> {
        self.check_gone()?;
        Ok(countdown_hit(&self.signal_countdown))
    }

    fn set_ts_output(&mut self, on: bool) -> Result<(), HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::SetTsOutput(on));
        Ok(())
    }

    fn read_cnr(&mut self) -> Result<u32, HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::ReadCnr);
        Ok(self.cnr.load(Ordering::SeqCst))
    }
}

/// Fake ISDB-S chain.
pub struct MockSatellite {
    ops: FrontendLog,
    pll_countdown: Arc<AtomicU32>,
    signal_countdown: Arc<AtomicU32>,
    stream_countdown: Arc<AtomicU32>,
    fail_wakeup: Arc<AtomicBool>,
    fail_prepare: Arc<AtomicBool>,
    gone: Arc<AtomicBool>,
    cnr: Arc<AtomicU32>,
}

impl MockSatellite {
    pub fn new() -> Self {
        Self {
            ops: Arc::new(Mutex::new(Vec::new())),
            pll_countdown: Arc::new(AtomicU32::new(0)),
            signal_countdown: Arc::new(AtomicU32::new(0)),
            stream_countdown: Arc::new(AtomicU32::new(0)),
            fail_wakeup: Arc::new(AtomicBool::new(false)),
            fail_prepare: Arc::new(AtomicBool::new(false)),
            gone: Arc::new(AtomicBool::new(false)),
            cnr: Arc::new(AtomicU32::new(18_000)),
        }
    }

    /// Lock after the given number of unlocked probes per stage.
    pub fn lock_after(pll_polls: u32, signal_polls: u32, stream_polls: u32) -> Self {
        let fe = Self::new();
        fe.pll_countdown.store(pll_polls, Ordering::SeqCst);
        fe.signal_countdown.store(signal_polls, Ordering::SeqCst);
        fe.stream_countdown.store(stream_polls, Ordering::SeqCst);
        fe
    }

    pub fn op_log(&self) -> FrontendLog {
        Arc::clone(&self.ops)
    }

    pub fn pll_countdown(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.pll_countdown)
    }

    pub fn signal_countdown(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.signal_countdown)
    }

    pub fn stream_countdown(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.stream_countdown)
    }

    pub fn fail_wakeup_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_wakeup)
    }

    pub fn fail_prepare_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_prepare)
    }

    pub fn gone_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.gone)
    }

    pub fn cnr_value(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.cnr)
    }

    fn check_gone(&self) -> Result<(), HwError> {
        if self.gone.load(Ordering::SeqCst) {
            Err(HwError::Gone)
        } else {
            Ok(())
        }
    }
}

impl Default for MockSatellite {
    fn default() -> Self {
        Self::new()
    }
}

impl SatelliteFrontend for MockSatellite {
    fn wakeup(&mut self) -> Result<(), HwError> {
        self.check_gone()?;
        if self.fail_wakeup.load(Ordering::SeqCst) {
            return Err(HwError::Register("wakeup sequence nack".into()));
        }
        self.ops.lock().push(FrontendOp::Wakeup);
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::Sleep);
        Ok(())
    }

    fn init_sub_bus(&mut self) -> Result<(), HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::InitSubBus);
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), HwError> {
        self.check_gone()?;
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(HwError::Register("demod setup nack".into()));
        }
        self.ops.lock().push(FrontendOp::Prepare);
        Ok(())
    }

    fn set_frequency(&mut self, khz: u32) -> Result<(), HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::SetFrequency(khz));
        Ok(())
    }

    fn is_pll_locked(&mut self) -> Result<bool, HwError> {
        self.check_gone()?;
        Ok(countdown_hit(&self.pll_countdown))
    }

    fn is_signal_locked(&mut self) -> Result<bool, HwError> {
        self.check_gone()?;
        Ok(countdown_hit(&self.signal_countdown))
    }

    fn set_stream_id(&mut self, tsid: u16) -> Result<(), HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::SetStreamId(tsid));
        Ok(())
    }

    fn is_stream_active(&mut self) -> Result<bool, HwError> {
        self.check_gone()?;
        Ok(countdown_hit(&self.stream_countdown))
    }

    fn set_ts_output(&mut self, on: bool) -> Result<(), HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::SetTsOutput(on));
        Ok(())
    }

    fn read_cnr(&mut self) -> Result<u32, HwError> {
        self.check_gone()?;
        self.ops.lock().push(FrontendOp::ReadCnr);
        Ok(self.cnr.load(Ordering::SeqCst))
    }
}
