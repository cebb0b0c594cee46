//! Receiver lifecycle and caller surface.
//!
//! A receiver is one logical tuner as callers see it: open it, tune it,
//! start capture, read the stream, close it. The session mutex
//! serializes the control plane (open/close/tune/capture toggles);
//! stream reads deliberately stay off it so a blocked reader never
//! holds up control work.
//!
//! ```text
//!   Closed -> Initializing -> Idle <-> Tuning -> Locked(streaming off)
//!                                                  ^          |
//!                                                  +- capture -+
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use ptx_hal::{Bandwidth, FrontendChain, HwError, LnbVoltage, System, TuneParams};

use crate::buffer::RingBuffer;
use crate::cancel::ShutdownToken;
use crate::config::{PollBudget, ReceiverLayout};
use crate::error::{Error, LockStage};
use crate::group::DeviceGroup;

/// Lifecycle of a receiver session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Closed,
    Initializing,
    Idle,
    Tuning,
    Locked { streaming: bool },
}

impl ReceiverState {
    /// Short name for error messages.
    pub fn name(self) -> &'static str {
        match self {
            ReceiverState::Closed => "closed",
            ReceiverState::Initializing => "initializing",
            ReceiverState::Idle => "idle",
            ReceiverState::Tuning => "tuning",
            ReceiverState::Locked { streaming: false } => "locked",
            ReceiverState::Locked { streaming: true } => "streaming",
        }
    }
}

/// One logical tuner of a device group.
pub struct Receiver {
    index: usize,
    layout: ReceiverLayout,
    group: Weak<DeviceGroup>,
    /// Serializes the control plane. Stream reads never take it.
    session: Mutex<()>,
    /// Session flag; flipped only under the session mutex, read anywhere.
    open: AtomicBool,
    state: Mutex<ReceiverState>,
    frontend: Mutex<FrontendChain>,
    ring: Arc<RingBuffer>,
    /// Parameters of the current lock, if any.
    tuned: Mutex<Option<TuneParams>>,
    lnb: Mutex<LnbVoltage>,
    shutdown: Arc<ShutdownToken>,
}

impl Receiver {
    pub(crate) fn new(
        index: usize,
        layout: ReceiverLayout,
        frontend: FrontendChain,
        group: Weak<DeviceGroup>,
        wake_threshold: usize,
        shutdown: Arc<ShutdownToken>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            layout,
            group,
            session: Mutex::new(()),
            open: AtomicBool::new(false),
            state: Mutex::new(ReceiverState::Closed),
            frontend: Mutex::new(frontend),
            ring: Arc::new(RingBuffer::new(wake_threshold)),
            tuned: Mutex::new(None),
            lnb: Mutex::new(LnbVoltage::Low),
            shutdown,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn system(&self) -> System {
        self.layout.system
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.lock()
    }

    /// Parameters of the current lock; `None` while not locked.
    pub fn tuned_params(&self) -> Option<TuneParams> {
        *self.tuned.lock()
    }

    pub(crate) fn wire_id(&self) -> u8 {
        self.layout.wire_id
    }

    pub(crate) fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub(crate) fn ring_handle(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }

    fn group(&self) -> Result<Arc<DeviceGroup>, Error> {
        self.group.upgrade().ok_or(Error::HardwareUnavailable)
    }

    /// Funnel for hardware faults: when a fault means the device is
    /// gone, the whole group is marked so siblings fail fast too.
    fn hw_err(&self, e: Error) -> Error {
        if matches!(e, Error::HardwareUnavailable) {
            if let Some(group) = self.group.upgrade() {
                group.set_unavailable();
            }
        }
        e
    }

    /// Open a session on this receiver.
    ///
    /// The first open on the device raises the main rail; the sub-bus
    /// primary additionally runs the shared chip setup once per power
    /// epoch. Any failure rolls every acquisition back and leaves the
    /// receiver closed with the same error a fresh open would get.
    pub fn open(&self) -> Result<(), Error> {
        let _session = self.session.lock();
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.open.load(Ordering::SeqCst) {
            return Err(Error::AlreadyOpen);
        }
        match self.open_locked() {
            Ok(()) => {
                self.open.store(true, Ordering::SeqCst);
                *self.state.lock() = ReceiverState::Idle;
                info!("[recv {}] opened", self.index);
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = ReceiverState::Closed;
                Err(self.hw_err(e))
            }
        }
    }

    fn open_locked(&self) -> Result<(), Error> {
        let group = self.group()?;
        *self.state.lock() = ReceiverState::Initializing;
        group.add_receiver_reference(self.layout.wire_id)?;
        let mut chain = self.frontend.lock();
        if let Err(e) = chain.wakeup() {
            drop(chain);
            group.remove_receiver_reference(self.layout.wire_id);
            return Err(Error::chip_init(e));
        }
        if self.layout.primary {
            let init = group.ensure_sub_bus_init(self.layout.sub_bus, || chain.init_sub_bus());
            if let Err(e) = init {
                let _ = chain.sleep();
                drop(chain);
                group.remove_receiver_reference(self.layout.wire_id);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close the session. Always completes: hardware failures on the
    /// way down are logged, never propagated, and the bookkeeping is
    /// released regardless. Capture still running is stopped first.
    pub fn close(&self) -> Result<(), Error> {
        let _session = self.session.lock();
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        if let Err(e) = self.set_capture_locked(false) {
            warn!("[recv {}] capture stop during close failed: {}", self.index, e);
        }
        let group = self.group.upgrade();
        let available = group.as_ref().map_or(false, |g| g.is_available());

        // Antenna supply cannot outlive the session.
        {
            let mut lnb = self.lnb.lock();
            if *lnb != LnbVoltage::Low {
                *lnb = LnbVoltage::Low;
                if let Some(g) = &group {
                    g.remove_aux_reference();
                }
            }
        }

        self.ring.stop();
        if let Err(e) = self.ring.free() {
            warn!("[recv {}] buffer release failed: {}", self.index, e);
        }

        if available {
            let mut chain = self.frontend.lock();
            if let Err(e) = chain.sleep() {
                warn!("[recv {}] sleep on close failed: {}", self.index, e);
            }
        }
        if let Some(g) = &group {
            g.remove_receiver_reference(self.layout.wire_id);
        }

        *self.tuned.lock() = None;
        *self.state.lock() = ReceiverState::Closed;
        self.open.store(false, Ordering::SeqCst);
        info!("[recv {}] closed", self.index);
        Ok(())
    }

    /// Drive the frontend through the lock sequence for `params`.
    ///
    /// Admitted from `Idle`, or from `Locked` while capture is off (a
    /// retune; the old lock is given up first). A poll budget running
    /// out returns [`Error::NotLocked`] naming the stage and parks the
    /// receiver back in `Idle`; the caller may simply retry.
    pub fn tune(&self, params: TuneParams) -> Result<(), Error> {
        let _session = self.session.lock();
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        {
            let mut state = self.state.lock();
            match *state {
                ReceiverState::Idle | ReceiverState::Locked { streaming: false } => {}
                s => {
                    return Err(Error::InvalidState {
                        op: "tune",
                        state: s.name(),
                    })
                }
            }
            // Capability gate sits before any hardware I/O; a Locked
            // receiver keeps its lock when the request is impossible.
            if params.system != self.layout.system {
                return Err(Error::UnsupportedSystem {
                    requested: params.system,
                });
            }
            *state = ReceiverState::Tuning;
        }
        let result = self.tune_locked(&params);
        match &result {
            Ok(()) => {
                *self.state.lock() = ReceiverState::Locked { streaming: false };
                *self.tuned.lock() = Some(params);
                info!("[recv {}] locked at {} kHz", self.index, params.frequency_khz);
            }
            Err(e) => {
                *self.state.lock() = ReceiverState::Idle;
                *self.tuned.lock() = None;
                debug!("[recv {}] tune failed: {}", self.index, e);
            }
        }
        result.map_err(|e| self.hw_err(e))
    }

    fn tune_locked(&self, params: &TuneParams) -> Result<(), Error> {
        let group = self.group()?;
        if !group.is_available() {
            return Err(Error::HardwareUnavailable);
        }
        let config = group.config();
        let pll_budget = config.pll_poll;
        let signal_budget = config.signal_poll;
        let stream_budget = config.stream_id_poll;
        drop(group);

        let mut chain = self.frontend.lock();
        match &mut *chain {
            FrontendChain::Terrestrial(fe) => {
                let bandwidth = params.bandwidth.unwrap_or(Bandwidth::Mhz6);
                fe.prepare(bandwidth)
                    .map_err(|e| Error::frontend("prepare", e))?;
                fe.set_frequency(params.frequency_khz)
                    .map_err(|e| Error::frontend("set frequency", e))?;
                self.poll_until(pll_budget, LockStage::Pll, || fe.is_pll_locked())?;
                self.poll_until(signal_budget, LockStage::Signal, || fe.is_signal_locked())?;
            }
            FrontendChain::Satellite(fe) => {
                fe.prepare().map_err(|e| Error::frontend("prepare", e))?;
                fe.set_frequency(params.frequency_khz)
                    .map_err(|e| Error::frontend("set frequency", e))?;
                self.poll_until(pll_budget, LockStage::Pll, || fe.is_pll_locked())?;
                self.poll_until(signal_budget, LockStage::Signal, || fe.is_signal_locked())?;
                if let Some(tsid) = params.stream_id {
                    fe.set_stream_id(tsid)
                        .map_err(|e| Error::frontend("set stream id", e))?;
                    self.poll_until(stream_budget, LockStage::StreamId, || {
                        fe.is_stream_active()
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Bounded, cancellable poll for one lock stage. Probes first so an
    /// already-locked stage costs no sleep at all.
    fn poll_until<F>(&self, budget: PollBudget, stage: LockStage, mut probe: F) -> Result<(), Error>
    where
        F: FnMut() -> Result<bool, HwError>,
    {
        let probe_name = match stage {
            LockStage::Pll => "pll probe",
            LockStage::Signal => "signal probe",
            LockStage::StreamId => "stream id probe",
        };
        for attempt in 0..budget.attempts {
            if probe().map_err(|e| Error::frontend(probe_name, e))? {
                if attempt > 0 {
                    debug!(
                        "[recv {}] {} locked after {} polls",
                        self.index,
                        stage,
                        attempt + 1
                    );
                }
                return Ok(());
            }
            if attempt + 1 < budget.attempts && self.shutdown.wait_cancelled(budget.interval()) {
                return Err(Error::Cancelled);
            }
        }
        Err(Error::NotLocked(stage))
    }

    /// Start or stop routing this receiver's stream into its buffer.
    ///
    /// Starting is admitted from `Locked` only: the first capturer on
    /// the device also starts the shared bulk session. Stopping from
    /// any state is a lenient no-op when capture is not running.
    pub fn set_capture(&self, enable: bool) -> Result<(), Error> {
        let _session = self.session.lock();
        self.set_capture_locked(enable)
    }

    fn set_capture_locked(&self, enable: bool) -> Result<(), Error> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        let current = self.state();
        if enable {
            if self.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match current {
                ReceiverState::Locked { streaming: false } => {}
                ReceiverState::Locked { streaming: true } => return Ok(()),
                s => {
                    return Err(Error::InvalidState {
                        op: "start capture",
                        state: s.name(),
                    })
                }
            }
            let group = self.group()?;
            group.begin_streaming().map_err(|e| self.hw_err(e))?;
            {
                let mut chain = self.frontend.lock();
                if let Err(e) = chain.set_ts_output(true) {
                    drop(chain);
                    group.end_streaming();
                    return Err(self.hw_err(Error::frontend("ts output", e)));
                }
            }
            if let Err(e) = self.ring.alloc(group.config().ring_capacity) {
                let mut chain = self.frontend.lock();
                if let Err(e2) = chain.set_ts_output(false) {
                    warn!("[recv {}] ts output rollback failed: {}", self.index, e2);
                }
                drop(chain);
                group.end_streaming();
                return Err(e);
            }
            self.ring.start();
            *self.state.lock() = ReceiverState::Locked { streaming: true };
            info!("[recv {}] capture started", self.index);
            Ok(())
        } else {
            match current {
                ReceiverState::Locked { streaming: true } => {}
                _ => return Ok(()),
            }
            // Output pins go quiet before anything is torn down, so the
            // bulk stream stops carrying this receiver's packets first.
            {
                let mut chain = self.frontend.lock();
                if let Err(e) = chain.set_ts_output(false) {
                    warn!("[recv {}] ts output disable failed: {}", self.index, e);
                }
            }
            self.ring.stop();
            if let Some(group) = self.group.upgrade() {
                group.end_streaming();
            }
            if let Err(e) = self.ring.free() {
                warn!("[recv {}] buffer release failed: {}", self.index, e);
            }
            *self.state.lock() = ReceiverState::Locked { streaming: false };
            info!("[recv {}] capture stopped", self.index);
            Ok(())
        }
    }

    /// Blocking stream read. Returns 0 once capture stops, the buffer
    /// is purged while waiting, or the device goes away.
    pub fn read_stream(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        Ok(self.ring.read(buf, true))
    }

    /// Non-blocking stream read; returns 0 when nothing is buffered.
    pub fn try_read_stream(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        Ok(self.ring.read(buf, false))
    }

    /// Drop everything buffered but not yet read. A reader blocked in
    /// [`Receiver::read_stream`] wakes up with 0 bytes.
    pub fn purge_stream(&self) -> Result<(), Error> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        self.ring.purge();
        Ok(())
    }

    /// Raw C/N counter readout.
    pub fn read_cnr(&self) -> Result<u32, Error> {
        let _session = self.session.lock();
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        let mut chain = self.frontend.lock();
        chain
            .read_cnr()
            .map_err(|e| self.hw_err(Error::frontend("cnr read", e)))
    }

    /// Select the antenna supply for this satellite receiver. The group
    /// keeps the shared aux rail up while any receiver wants it.
    pub fn set_lnb_voltage(&self, voltage: LnbVoltage) -> Result<(), Error> {
        let _session = self.session.lock();
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        if self.layout.system != System::IsdbS {
            return Err(Error::InvalidState {
                op: "set lnb voltage",
                state: "terrestrial",
            });
        }
        let group = self.group()?;
        let mut lnb = self.lnb.lock();
        let wants = voltage != LnbVoltage::Low;
        let had = *lnb != LnbVoltage::Low;
        match (had, wants) {
            (false, true) => group.add_aux_reference().map_err(|e| self.hw_err(e))?,
            (true, false) => group.remove_aux_reference(),
            _ => {}
        }
        *lnb = voltage;
        debug!("[recv {}] lnb {:?}", self.index, voltage);
        Ok(())
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if self.open.load(Ordering::SeqCst) {
            warn!("[recv {}] dropped while open", self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use ptx_hal::mock::{
        BusOp, FrontendLog, FrontendOp, MockBus, MockSatellite, MockTerrestrial,
    };

    use super::*;
    use crate::config::DeviceFamilyConfig;

    struct Fixture {
        bus: Arc<MockBus>,
        group: Arc<DeviceGroup>,
        logs: Vec<FrontendLog>,
        sat_stream_countdowns: Vec<Arc<std::sync::atomic::AtomicU32>>,
        terr_signal_countdowns: Vec<Arc<std::sync::atomic::AtomicU32>>,
        terr_fail_wakeups: Vec<Arc<AtomicBool>>,
    }

    /// Quad device on mock hardware with near-instant poll budgets.
    fn fixture() -> Fixture {
        let mut config = DeviceFamilyConfig::w3u4();
        config.pll_poll = PollBudget {
            attempts: 3,
            interval_ms: 1,
        };
        config.signal_poll = PollBudget {
            attempts: 3,
            interval_ms: 1,
        };
        config.stream_id_poll = PollBudget {
            attempts: 3,
            interval_ms: 1,
        };
        config.ring_capacity = 188 * 64;
        config.wake_threshold = 188;

        let bus = MockBus::new();
        let mut logs = Vec::new();
        let mut sat_stream_countdowns = Vec::new();
        let mut terr_signal_countdowns = Vec::new();
        let mut terr_fail_wakeups = Vec::new();
        let mut frontends = Vec::new();
        for layout in &config.receivers {
            match layout.system {
                System::IsdbS => {
                    let fe = MockSatellite::new();
                    logs.push(fe.op_log());
                    sat_stream_countdowns.push(fe.stream_countdown());
                    frontends.push(FrontendChain::Satellite(Box::new(fe)));
                }
                System::IsdbT => {
                    let fe = MockTerrestrial::new();
                    logs.push(fe.op_log());
                    terr_signal_countdowns.push(fe.signal_countdown());
                    terr_fail_wakeups.push(fe.fail_wakeup_flag());
                    frontends.push(FrontendChain::Terrestrial(Box::new(fe)));
                }
            }
        }
        let group = DeviceGroup::assemble(
            "fixture".into(),
            bus.clone(),
            config,
            frontends,
            None,
            Arc::new(ShutdownToken::new()),
        )
        .unwrap();
        Fixture {
            bus,
            group,
            logs,
            sat_stream_countdowns,
            terr_signal_countdowns,
            terr_fail_wakeups,
        }
    }

    fn ops_of(log: &FrontendLog) -> Vec<FrontendOp> {
        log.lock().clone()
    }

    #[test]
    fn test_open_is_not_reentrant() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        assert!(matches!(r.open(), Err(Error::AlreadyOpen)));
        assert_eq!(fx.group.open_count(), 1);
        r.close().unwrap();
        assert!(matches!(r.close(), Err(Error::AlreadyClosed)));
        assert_eq!(fx.group.open_count(), 0);
    }

    #[test]
    fn test_close_without_open_has_no_side_effects() {
        let fx = fixture();
        let r = &fx.group.receivers()[0];
        assert!(matches!(r.close(), Err(Error::AlreadyClosed)));
        assert!(fx.bus.ops().is_empty());
        assert!(ops_of(&fx.logs[0]).is_empty());
    }

    #[test]
    fn test_open_powers_device_and_wakes_chain() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        assert!(fx.bus.is_powered());
        assert_eq!(r.state(), ReceiverState::Idle);
        // Primary of sub-bus 1 runs the shared setup on first open.
        assert_eq!(
            ops_of(&fx.logs[2]),
            vec![FrontendOp::Wakeup, FrontendOp::InitSubBus]
        );

        r.close().unwrap();
        assert!(!fx.bus.is_powered());
        assert_eq!(
            ops_of(&fx.logs[2]),
            vec![FrontendOp::Wakeup, FrontendOp::InitSubBus, FrontendOp::Sleep]
        );
    }

    #[test]
    fn test_secondary_does_not_rerun_sub_bus_setup() {
        let fx = fixture();
        let primary = &fx.group.receivers()[2];
        let secondary = &fx.group.receivers()[3];
        primary.open().unwrap();
        secondary.open().unwrap();
        assert_eq!(ops_of(&fx.logs[3]), vec![FrontendOp::Wakeup]);
        secondary.close().unwrap();
        primary.close().unwrap();
    }

    #[test]
    fn test_open_failure_rolls_back_power() {
        let fx = fixture();
        fx.terr_fail_wakeups[0].store(true, Ordering::SeqCst);
        let r = &fx.group.receivers()[2];

        assert!(matches!(r.open(), Err(Error::ChipInit(_))));
        assert_eq!(fx.group.open_count(), 0);
        assert_eq!(r.state(), ReceiverState::Closed);
        assert!(!r.is_open());
        // Rail went up for the attempt and back down on the rollback.
        assert_eq!(
            fx.bus.ops(),
            vec![BusOp::SetPower(true), BusOp::SetPower(false)]
        );

        // The same receiver can open cleanly afterwards.
        fx.terr_fail_wakeups[0].store(false, Ordering::SeqCst);
        r.open().unwrap();
        assert_eq!(fx.group.open_count(), 1);
    }

    #[test]
    fn test_power_failure_keeps_receiver_closed() {
        let fx = fixture();
        fx.bus.set_fail_power(true);
        let r = &fx.group.receivers()[0];
        assert!(matches!(r.open(), Err(Error::Power(_))));
        assert_eq!(fx.group.open_count(), 0);
        assert!(ops_of(&fx.logs[0]).is_empty());
    }

    #[test]
    fn test_concurrent_opens_power_on_once() {
        let fx = fixture();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let group = Arc::clone(&fx.group);
                thread::spawn(move || group.receivers()[i].open())
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
        assert_eq!(fx.group.open_count(), 4);
        let power_ons = fx
            .bus
            .ops()
            .iter()
            .filter(|op| **op == BusOp::SetPower(true))
            .count();
        assert_eq!(power_ons, 1);
    }

    #[test]
    fn test_tune_needs_open() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        let err = r.tune(TuneParams::terrestrial(473_143)).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState { op: "tune", state: "closed" }
        ));
        assert!(ops_of(&fx.logs[2]).is_empty());
    }

    #[test]
    fn test_tune_rejects_wrong_system_without_io() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        let before = ops_of(&fx.logs[2]);

        let err = r.tune(TuneParams::satellite(1_318_000, 0x4031)).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedSystem { requested: System::IsdbS }
        ));
        assert_eq!(r.state(), ReceiverState::Idle);
        // No frontend traffic beyond what open already did.
        assert_eq!(ops_of(&fx.logs[2]), before);
    }

    #[test]
    fn test_tune_walks_the_lock_sequence() {
        let fx = fixture();
        let r = &fx.group.receivers()[0];
        r.open().unwrap();
        assert_eq!(r.tuned_params(), None);
        r.tune(TuneParams::satellite(1_318_000, 0x4031)).unwrap();
        assert_eq!(r.state(), ReceiverState::Locked { streaming: false });
        assert_eq!(
            r.tuned_params(),
            Some(TuneParams::satellite(1_318_000, 0x4031))
        );
        assert_eq!(
            ops_of(&fx.logs[0]),
            vec![
                FrontendOp::Wakeup,
                FrontendOp::InitSubBus,
                FrontendOp::Prepare,
                FrontendOp::SetFrequency(1_318_000),
                FrontendOp::SetStreamId(0x4031),
            ]
        );
    }

    #[test]
    fn test_lock_timeout_names_stage_and_allows_retry() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();

        // Scripted to stay unlocked longer than the 3-attempt budget.
        fx.terr_signal_countdowns[0].store(100, Ordering::SeqCst);
        let err = r.tune(TuneParams::terrestrial(473_143)).unwrap_err();
        assert!(matches!(err, Error::NotLocked(LockStage::Signal)));
        assert_eq!(r.state(), ReceiverState::Idle);
        assert_eq!(r.tuned_params(), None);

        fx.terr_signal_countdowns[0].store(0, Ordering::SeqCst);
        r.tune(TuneParams::terrestrial(473_143)).unwrap();
        assert_eq!(r.state(), ReceiverState::Locked { streaming: false });
    }

    #[test]
    fn test_stream_id_poll_budget() {
        let fx = fixture();
        let r = &fx.group.receivers()[1];
        r.open().unwrap();
        fx.sat_stream_countdowns[1].store(100, Ordering::SeqCst);
        let err = r.tune(TuneParams::satellite(1_318_000, 0x4030)).unwrap_err();
        assert!(matches!(err, Error::NotLocked(LockStage::StreamId)));
    }

    #[test]
    fn test_retune_from_locked_keeps_capture_rule() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        r.tune(TuneParams::terrestrial(473_143)).unwrap();
        // Retune while merely locked is fine.
        r.tune(TuneParams::terrestrial(485_143)).unwrap();

        r.set_capture(true).unwrap();
        let err = r.tune(TuneParams::terrestrial(497_143)).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState { op: "tune", state: "streaming" }
        ));
        r.set_capture(false).unwrap();
        r.tune(TuneParams::terrestrial(497_143)).unwrap();
    }

    #[test]
    fn test_capture_requires_lock() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        assert!(matches!(
            r.set_capture(true),
            Err(Error::InvalidState { op: "start capture", state: "idle" })
        ));
        // Stop while not capturing is a lenient no-op.
        r.set_capture(false).unwrap();
    }

    #[test]
    fn test_capture_round_trip_gates_ts_output() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        r.tune(TuneParams::terrestrial(473_143)).unwrap();
        r.set_capture(true).unwrap();
        assert_eq!(r.state(), ReceiverState::Locked { streaming: true });
        assert_eq!(fx.group.streaming_count(), 1);
        assert!(fx.bus.is_streaming());
        assert!(r.ring().is_active());

        r.set_capture(true).unwrap(); // idempotent
        assert_eq!(fx.group.streaming_count(), 1);

        r.set_capture(false).unwrap();
        assert_eq!(fx.group.streaming_count(), 0);
        assert!(!fx.bus.is_streaming());
        let ops = ops_of(&fx.logs[2]);
        assert!(ops.contains(&FrontendOp::SetTsOutput(true)));
        assert!(ops.contains(&FrontendOp::SetTsOutput(false)));
    }

    #[test]
    fn test_capture_rollback_when_session_fails() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        r.tune(TuneParams::terrestrial(473_143)).unwrap();

        fx.bus.set_fail_start(true);
        assert!(matches!(r.set_capture(true), Err(Error::StreamStart(_))));
        assert_eq!(fx.group.streaming_count(), 0);
        assert_eq!(r.state(), ReceiverState::Locked { streaming: false });
        // No TS output was enabled for the failed attempt.
        assert!(!ops_of(&fx.logs[2]).contains(&FrontendOp::SetTsOutput(true)));

        fx.bus.set_fail_start(false);
        r.set_capture(true).unwrap();
    }

    #[test]
    fn test_close_stops_running_capture() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        r.tune(TuneParams::terrestrial(473_143)).unwrap();
        r.set_capture(true).unwrap();

        r.close().unwrap();
        assert_eq!(fx.group.streaming_count(), 0);
        assert_eq!(fx.group.open_count(), 0);
        assert!(!fx.bus.is_streaming());
        assert_eq!(r.state(), ReceiverState::Closed);
    }

    #[test]
    fn test_read_after_close_fails_immediately() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        r.close().unwrap();
        let mut buf = [0u8; 188];
        assert!(matches!(r.read_stream(&mut buf), Err(Error::AlreadyClosed)));
    }

    #[test]
    fn test_read_before_capture_returns_zero() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        let mut buf = [0u8; 188];
        // Ring is inactive until capture starts; even a blocking read
        // must come back empty instead of hanging.
        assert_eq!(r.read_stream(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_lnb_refcount_shared_across_receivers() {
        let fx = fixture();
        let r0 = &fx.group.receivers()[0];
        let r1 = &fx.group.receivers()[1];
        r0.open().unwrap();
        r1.open().unwrap();

        r0.set_lnb_voltage(LnbVoltage::_15v).unwrap();
        r1.set_lnb_voltage(LnbVoltage::_15v).unwrap();
        assert!(fx.bus.is_aux_powered());
        assert_eq!(fx.group.aux_count(), 2);

        r0.set_lnb_voltage(LnbVoltage::Low).unwrap();
        assert!(fx.bus.is_aux_powered());
        r1.set_lnb_voltage(LnbVoltage::Low).unwrap();
        assert!(!fx.bus.is_aux_powered());
    }

    #[test]
    fn test_lnb_released_by_close() {
        let fx = fixture();
        let r0 = &fx.group.receivers()[0];
        r0.open().unwrap();
        r0.set_lnb_voltage(LnbVoltage::_15v).unwrap();
        assert!(fx.bus.is_aux_powered());
        r0.close().unwrap();
        assert!(!fx.bus.is_aux_powered());
        assert_eq!(fx.group.aux_count(), 0);
    }

    #[test]
    fn test_lnb_rejected_on_terrestrial() {
        let fx = fixture();
        let r2 = &fx.group.receivers()[2];
        r2.open().unwrap();
        assert!(r2.set_lnb_voltage(LnbVoltage::_15v).is_err());
        assert_eq!(fx.group.aux_count(), 0);
    }

    #[test]
    fn test_cnr_readout() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        assert_eq!(r.read_cnr().unwrap(), 25_000);
        assert!(ops_of(&fx.logs[2]).contains(&FrontendOp::ReadCnr));
    }

    #[test]
    fn test_unplug_mid_session() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        r.tune(TuneParams::terrestrial(473_143)).unwrap();
        r.set_capture(true).unwrap();

        fx.bus.set_gone(true);
        fx.group.set_unavailable();

        // Reads no longer block and the close path still completes.
        let mut buf = [0u8; 188];
        assert_eq!(r.read_stream(&mut buf).unwrap(), 0);
        r.close().unwrap();
        assert_eq!(fx.group.open_count(), 0);
        // The sleeping sequence is skipped on a gone device.
        assert!(!ops_of(&fx.logs[2]).contains(&FrontendOp::Sleep));
    }

    #[test]
    fn test_shutdown_cancels_tune() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        fx.group.shutdown_token().cancel();
        assert!(matches!(
            r.tune(TuneParams::terrestrial(473_143)),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_tune_unsupported_keeps_existing_lock() {
        let fx = fixture();
        let r = &fx.group.receivers()[2];
        r.open().unwrap();
        r.tune(TuneParams::terrestrial(473_143)).unwrap();
        let err = r.tune(TuneParams::satellite(1_318_000, 1)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSystem { .. }));
        assert_eq!(r.state(), ReceiverState::Locked { streaming: false });
    }

    #[test]
    fn test_bandwidth_reaches_terrestrial_prepare() {
        let fx = fixture();
        let r = &fx.group.receivers()[3];
        r.open().unwrap();
        let mut params = TuneParams::terrestrial(473_143);
        params.bandwidth = Some(Bandwidth::Mhz8);
        r.tune(params).unwrap();
        assert!(ops_of(&fx.logs[3]).contains(&FrontendOp::Prepare));
    }
}
