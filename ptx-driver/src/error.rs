//! Driver-level error taxonomy.
//!
//! Hardware faults arrive as [`HwError`] from the HAL; everything the
//! driver hands back to callers is an [`Error`] that distinguishes
//! caller mistakes (wrong state, wrong system) from hardware trouble.
//! `HwError::Gone` collapses into [`Error::HardwareUnavailable`] at
//! this boundary no matter which operation tripped over it.

use std::fmt;

use thiserror::Error;

use ptx_hal::{HwError, System};

use crate::config::ConfigError;

/// Stage of the tune sequence that failed to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStage {
    /// RF synthesizer lock.
    Pll,
    /// Demodulator signal lock.
    Signal,
    /// Relative TS selection (ISDB-S only).
    StreamId,
}

impl fmt::Display for LockStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockStage::Pll => "pll",
            LockStage::Signal => "signal",
            LockStage::StreamId => "stream id",
        };
        f.write_str(name)
    }
}

/// Errors returned by receiver, group and registry operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The receiver already has an open session.
    #[error("receiver is already open")]
    AlreadyOpen,

    /// The receiver has no open session.
    #[error("receiver is already closed")]
    AlreadyClosed,

    /// The operation is not admitted in the current lifecycle state.
    #[error("{op} is not valid while {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    /// The device layout description is inconsistent.
    #[error("invalid device configuration")]
    Config(#[source] ConfigError),

    /// The receiver's hardware cannot demodulate the requested system.
    #[error("receiver cannot demodulate {requested:?}")]
    UnsupportedSystem { requested: System },

    /// The tune sequence exhausted its poll budget without a lock.
    /// Not fatal; the caller may retry.
    #[error("no {0} lock")]
    NotLocked(LockStage),

    /// Switching a power rail failed.
    #[error("power rail switch failed")]
    Power(#[source] HwError),

    /// Waking or initializing a tuner/demodulator chain failed.
    #[error("chip initialization failed")]
    ChipInit(#[source] HwError),

    /// A frontend register sequence failed mid-tune.
    #[error("frontend {stage} failed")]
    Frontend {
        stage: &'static str,
        #[source]
        source: HwError,
    },

    /// Starting the shared bulk transfer session failed.
    #[error("streaming session failed to start")]
    StreamStart(#[source] HwError),

    /// The device was unplugged or stopped responding.
    #[error("hardware unavailable")]
    HardwareUnavailable,

    /// The stream buffer arena could not be reserved.
    #[error("cannot reserve {requested} bytes for the stream buffer")]
    ResourceExhausted { requested: usize },

    /// The operation was interrupted by driver shutdown.
    #[error("cancelled by shutdown")]
    Cancelled,
}

impl Error {
    pub(crate) fn power(e: HwError) -> Self {
        if e.is_gone() {
            Error::HardwareUnavailable
        } else {
            Error::Power(e)
        }
    }

    pub(crate) fn chip_init(e: HwError) -> Self {
        if e.is_gone() {
            Error::HardwareUnavailable
        } else {
            Error::ChipInit(e)
        }
    }

    pub(crate) fn frontend(stage: &'static str, e: HwError) -> Self {
        if e.is_gone() {
            Error::HardwareUnavailable
        } else {
            Error::Frontend { stage, source: e }
        }
    }

    pub(crate) fn stream_start(e: HwError) -> Self {
        if e.is_gone() {
            Error::HardwareUnavailable
        } else {
            Error::StreamStart(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gone_collapses_to_unavailable() {
        assert!(matches!(
            Error::power(HwError::Gone),
            Error::HardwareUnavailable
        ));
        assert!(matches!(
            Error::frontend("prepare", HwError::Gone),
            Error::HardwareUnavailable
        ));
        assert!(matches!(
            Error::frontend("prepare", HwError::Register("nack".into())),
            Error::Frontend { stage: "prepare", .. }
        ));
    }

    #[test]
    fn test_not_locked_message_names_stage() {
        assert_eq!(
            Error::NotLocked(LockStage::StreamId).to_string(),
            "no stream id lock"
        );
    }
}
