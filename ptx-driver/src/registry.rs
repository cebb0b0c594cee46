//! Device registry.
//!
//! The registry is the driver's root object: devices attach to it when
//! they are probed and detach on removal. It owns the one shutdown
//! token every receiver polls, and it resolves which devices form a
//! paired board by their serial numbers, wiring both halves to one
//! shared [`PowerInterlock`].

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use ptx_hal::{Bus, FrontendChain};

use crate::cancel::ShutdownToken;
use crate::config::DeviceFamilyConfig;
use crate::error::Error;
use crate::group::{DeviceGroup, InterlockHandle};
use crate::interlock::{pair_from_serial, PowerInterlock};

/// Root handle owning every attached device.
pub struct Registry {
    groups: Mutex<Vec<Arc<DeviceGroup>>>,
    /// Live interlocks keyed by pair family (serial / 10).
    interlocks: Mutex<HashMap<u64, Arc<PowerInterlock>>>,
    shutdown: Arc<ShutdownToken>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(Vec::new()),
            interlocks: Mutex::new(HashMap::new()),
            shutdown: Arc::new(ShutdownToken::new()),
        })
    }

    /// Attach a probed device.
    ///
    /// `frontends` must line up with `config.receivers`. When the
    /// family config asks for a rail interlock, the serial number
    /// decides the pair: adjacent serials (`...1`/`...2`) share one
    /// interlock record, created by whichever side attaches first. A
    /// serial without a pair digit runs the device standalone.
    pub fn attach_device(
        &self,
        name: &str,
        serial: u64,
        bus: Arc<dyn Bus>,
        config: DeviceFamilyConfig,
        frontends: Vec<FrontendChain>,
    ) -> Result<Arc<DeviceGroup>, Error> {
        config.validate().map_err(Error::Config)?;

        let pairing = match config.interlock {
            Some(mode) => match pair_from_serial(serial) {
                Some((family, side)) => {
                    let mut interlocks = self.interlocks.lock();
                    let entry = interlocks
                        .entry(family)
                        .or_insert_with(|| PowerInterlock::new(mode));
                    if entry.mode() != mode {
                        warn!(
                            "[registry] {}: pair {} already runs mode {:?}, keeping it",
                            name,
                            family,
                            entry.mode()
                        );
                    }
                    Some((Arc::clone(entry), family, side))
                }
                None => {
                    warn!(
                        "[registry] {}: serial {} has no pair digit, interlock disabled",
                        name, serial
                    );
                    None
                }
            },
            None => None,
        };

        let satellite_bits = config.satellite_bits();
        let handle = pairing.as_ref().map(|(il, family, side)| InterlockHandle {
            interlock: Arc::clone(il),
            side: *side,
            family: *family,
        });
        let group = DeviceGroup::assemble(
            name.to_string(),
            bus,
            config,
            frontends,
            handle,
            Arc::clone(&self.shutdown),
        )?;

        if let Some((il, family, side)) = &pairing {
            if let Err(e) = il.register_side(*side, group.rail(), satellite_bits) {
                self.gc_interlock(*family, il);
                return Err(e);
            }
        }

        self.groups.lock().push(Arc::clone(&group));
        info!("[registry] {} attached (serial {})", group.name(), serial);
        Ok(group)
    }

    /// Detach a device on removal. Wakes its blocked readers, drops its
    /// interlock side and forgets the group. Detaching a group that is
    /// not attached is a no-op.
    pub fn detach_device(&self, group: &Arc<DeviceGroup>) {
        let removed = {
            let mut groups = self.groups.lock();
            let before = groups.len();
            groups.retain(|g| !Arc::ptr_eq(g, group));
            groups.len() != before
        };
        if !removed {
            return;
        }
        group.set_unavailable();
        if let Some(handle) = group.interlock_handle() {
            if handle.interlock.deregister_side(handle.side) {
                self.gc_interlock(handle.family, &handle.interlock);
            }
        }
        info!("[registry] {} detached", group.name());
    }

    /// Drop the pair record once no side uses it. The re-check under
    /// the map lock covers a sibling attaching in between.
    fn gc_interlock(&self, family: u64, interlock: &Arc<PowerInterlock>) {
        let mut interlocks = self.interlocks.lock();
        if let Some(entry) = interlocks.get(&family) {
            if Arc::ptr_eq(entry, interlock) && entry.is_empty() {
                interlocks.remove(&family);
            }
        }
    }

    /// Snapshot of the attached devices.
    pub fn groups(&self) -> Vec<Arc<DeviceGroup>> {
        self.groups.lock().clone()
    }

    /// Begin driver shutdown: every blocked reader wakes with 0 bytes,
    /// in-flight tunes stop at their next poll, and new sessions are
    /// refused with [`Error::Cancelled`]. Open receivers still close
    /// normally afterwards.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for group in self.groups.lock().iter() {
            for receiver in group.receivers() {
                receiver.ring().stop();
            }
        }
        info!("[registry] shutdown requested");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
