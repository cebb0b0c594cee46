//! Fault taxonomy reported by hardware drivers.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by bus and frontend implementations.
#[derive(Debug, Error)]
pub enum HwError {
    /// The underlying transport failed the operation.
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A register transaction was rejected or garbled.
    #[error("register transaction failed: {0}")]
    Register(String),

    /// The operation did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The device was unplugged or stopped responding entirely.
    #[error("device is gone")]
    Gone,

    /// The device cannot perform the request.
    #[error("unsupported request: {0}")]
    Unsupported(&'static str),
}

impl HwError {
    /// True when the device itself is gone rather than one operation
    /// having failed.
    pub fn is_gone(&self) -> bool {
        matches!(self, HwError::Gone)
    }
}
