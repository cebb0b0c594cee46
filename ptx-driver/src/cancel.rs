//! Cooperative shutdown signalling.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A trip-once token observed by every blocking wait in the driver.
///
/// Poll loops sleep through [`ShutdownToken::wait_cancelled`] instead of
/// `thread::sleep`, so a driver shutdown interrupts them at the next
/// wakeup rather than at the end of their budget.
pub struct ShutdownToken {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            cancelled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Trip the token and wake every sleeper.
    pub fn cancel(&self) {
        let mut cancelled = self.cancelled.lock();
        *cancelled = true;
        self.condvar.notify_all();
    }

    /// Sleep for `timeout` unless cancelled first. Returns true when the
    /// token is tripped, whether it already was or happened mid-sleep.
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        let mut cancelled = self.cancelled.lock();
        if *cancelled {
            return true;
        }
        self.condvar.wait_for(&mut cancelled, timeout);
        *cancelled
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
