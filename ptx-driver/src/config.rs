//! Device-family descriptions.
//!
//! Everything board-specific the core needs is data, not code: receiver
//! layout, buffer sizing, poll budgets, interlock participation. Known
//! boards ship as presets; exotic ones load from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ptx_hal::{System, TS_PACKET_SIZE};

use crate::interlock::InterlockMode;

/// Placement and capability of one receiver on the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverLayout {
    /// Broadcast system of this receiver's chain.
    pub system: System,
    /// Index carried in the high nibble of this receiver's wire markers.
    pub wire_id: u8,
    /// Which internal chip bus the chain hangs off.
    pub sub_bus: u8,
    /// Runs the shared sub-bus setup after power-up. One per sub-bus.
    #[serde(default)]
    pub primary: bool,
}

/// Bounded poll budget for one lock stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollBudget {
    /// Probe count before giving up.
    pub attempts: u32,
    /// Sleep between probes.
    pub interval_ms: u64,
}

impl PollBudget {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Errors from loading or validating a family description.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid family description: {0}")]
    Invalid(String),
}

/// Everything family-specific the driver core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFamilyConfig {
    /// Family display name.
    pub name: String,
    /// Receivers in layout order.
    pub receivers: Vec<ReceiverLayout>,
    /// Stream buffer arena per receiver, in bytes.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Unread bytes before a blocked reader is woken.
    #[serde(default = "default_wake_threshold")]
    pub wake_threshold: usize,
    #[serde(default = "default_pll_budget")]
    pub pll_poll: PollBudget,
    #[serde(default = "default_signal_budget")]
    pub signal_poll: PollBudget,
    #[serde(default = "default_stream_id_budget")]
    pub stream_id_poll: PollBudget,
    /// Bridge FIFO purge deadline at streaming start, in ms.
    #[serde(default = "default_purge_timeout_ms")]
    pub purge_timeout_ms: u64,
    /// Paired-rail interlock mode; absent on single boards.
    #[serde(default)]
    pub interlock: Option<InterlockMode>,
}

fn default_ring_capacity() -> usize {
    TS_PACKET_SIZE * 2048
}

fn default_wake_threshold() -> usize {
    TS_PACKET_SIZE * 25
}

fn default_pll_budget() -> PollBudget {
    PollBudget {
        attempts: 30,
        interval_ms: 10,
    }
}

fn default_signal_budget() -> PollBudget {
    PollBudget {
        attempts: 50,
        interval_ms: 10,
    }
}

fn default_stream_id_budget() -> PollBudget {
    PollBudget {
        attempts: 10,
        interval_ms: 10,
    }
}

fn default_purge_timeout_ms() -> u64 {
    500
}

impl DeviceFamilyConfig {
    /// Quad board in one chassis: two ISDB-S plus two ISDB-T receivers,
    /// no paired rail.
    pub fn w3u4() -> Self {
        Self {
            name: "PX-W3U4".into(),
            receivers: vec![
                ReceiverLayout {
                    system: System::IsdbS,
                    wire_id: 0,
                    sub_bus: 0,
                    primary: true,
                },
                ReceiverLayout {
                    system: System::IsdbS,
                    wire_id: 1,
                    sub_bus: 0,
                    primary: false,
                },
                ReceiverLayout {
                    system: System::IsdbT,
                    wire_id: 2,
                    sub_bus: 1,
                    primary: true,
                },
                ReceiverLayout {
                    system: System::IsdbT,
                    wire_id: 3,
                    sub_bus: 1,
                    primary: false,
                },
            ],
            ring_capacity: default_ring_capacity(),
            wake_threshold: default_wake_threshold(),
            pll_poll: default_pll_budget(),
            signal_poll: default_signal_budget(),
            stream_id_poll: default_stream_id_budget(),
            purge_timeout_ms: default_purge_timeout_ms(),
            interlock: None,
        }
    }

    /// Eight-receiver chassis built from two quad halves whose rails
    /// back each other up. Each USB device sees its own half.
    pub fn q3u4() -> Self {
        let mut cfg = Self::w3u4();
        cfg.name = "PX-Q3U4".into();
        cfg.interlock = Some(InterlockMode::All);
        cfg
    }

    /// Parse and validate a family description from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a family description from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receivers.is_empty() {
            return Err(ConfigError::Invalid("no receivers defined".into()));
        }
        if self.receivers.len() > 16 {
            return Err(ConfigError::Invalid(
                "more than 16 receivers cannot be addressed".into(),
            ));
        }
        let mut wire_seen = [false; 16];
        let mut primary_seen = [false; 256];
        for layout in &self.receivers {
            if layout.wire_id > 15 {
                return Err(ConfigError::Invalid(format!(
                    "wire id {} out of range",
                    layout.wire_id
                )));
            }
            if std::mem::replace(&mut wire_seen[usize::from(layout.wire_id)], true) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate wire id {}",
                    layout.wire_id
                )));
            }
            if layout.primary
                && std::mem::replace(&mut primary_seen[usize::from(layout.sub_bus)], true)
            {
                return Err(ConfigError::Invalid(format!(
                    "sub-bus {} has two primaries",
                    layout.sub_bus
                )));
            }
        }
        if self.ring_capacity < TS_PACKET_SIZE {
            return Err(ConfigError::Invalid(
                "ring capacity below one packet".into(),
            ));
        }
        if self.wake_threshold == 0 || self.wake_threshold > self.ring_capacity {
            return Err(ConfigError::Invalid(
                "wake threshold must fit the ring".into(),
            ));
        }
        Ok(())
    }

    /// Satellite-capable receiver bits in layout order, the shape the
    /// interlock wants them in.
    pub fn satellite_bits(&self) -> Vec<u16> {
        self.receivers
            .iter()
            .filter(|layout| layout.system == System::IsdbS)
            .map(|layout| 1u16 << (layout.wire_id & 0x0F))
            .collect()
    }

    pub fn purge_timeout(&self) -> Duration {
        Duration::from_millis(self.purge_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        DeviceFamilyConfig::w3u4().validate().unwrap();
        DeviceFamilyConfig::q3u4().validate().unwrap();
        assert_eq!(
            DeviceFamilyConfig::q3u4().interlock,
            Some(InterlockMode::All)
        );
    }

    #[test]
    fn test_satellite_bits_follow_layout_order() {
        let bits = DeviceFamilyConfig::w3u4().satellite_bits();
        assert_eq!(bits, vec![1 << 0, 1 << 1]);
    }

    #[test]
    fn test_parse_toml_with_defaults() {
        let cfg = DeviceFamilyConfig::from_toml(
            r#"
            name = "PX-MLT5PE"

            [[receivers]]
            system = "IsdbS"
            wire_id = 0
            sub_bus = 0
            primary = true

            [[receivers]]
            system = "IsdbT"
            wire_id = 1
            sub_bus = 0

            [pll_poll]
            attempts = 15
            interval_ms = 20
            "#,
        )
        .unwrap();
        assert_eq!(cfg.name, "PX-MLT5PE");
        assert_eq!(cfg.receivers.len(), 2);
        assert!(!cfg.receivers[1].primary);
        assert_eq!(cfg.pll_poll.attempts, 15);
        // Everything not spelled out falls back to defaults.
        assert_eq!(cfg.ring_capacity, TS_PACKET_SIZE * 2048);
        assert_eq!(cfg.interlock, None);
    }

    #[test]
    fn test_duplicate_wire_id_rejected() {
        let err = DeviceFamilyConfig::from_toml(
            r#"
            name = "broken"

            [[receivers]]
            system = "IsdbT"
            wire_id = 3
            sub_bus = 0

            [[receivers]]
            system = "IsdbT"
            wire_id = 3
            sub_bus = 1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_two_primaries_on_one_sub_bus_rejected() {
        let mut cfg = DeviceFamilyConfig::w3u4();
        cfg.receivers[1].primary = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_threshold_must_fit_ring() {
        let mut cfg = DeviceFamilyConfig::w3u4();
        cfg.wake_threshold = cfg.ring_capacity + 1;
        assert!(cfg.validate().is_err());
    }
}
