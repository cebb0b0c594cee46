//! Value types crossing the hardware abstraction boundary.

use serde::{Deserialize, Serialize};

/// Size of one MPEG-TS packet.
pub const TS_PACKET_SIZE: usize = 188;

/// Canonical TS sync byte.
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Broadcast system of a receiver or of a tuning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum System {
    /// ISDB-T (terrestrial).
    IsdbT,
    /// ISDB-S (satellite, BS/CS110).
    IsdbS,
}

/// Channel bandwidth for terrestrial demodulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    Mhz5,
    Mhz6,
    Mhz7,
    Mhz8,
}

/// Antenna supply voltage selectable per satellite receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum LnbVoltage {
    /// Supply off.
    Low,
    /// 15V supply.
    _15v,
}

/// One tuning request handed to a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneParams {
    /// Requested broadcast system. Must match the receiver's hardware.
    pub system: System,
    /// Carrier (terrestrial) or IF (satellite) frequency in kHz.
    pub frequency_khz: u32,
    /// Channel bandwidth; terrestrial only.
    pub bandwidth: Option<Bandwidth>,
    /// Transport stream id for relative TS selection; satellite only.
    pub stream_id: Option<u16>,
}

impl TuneParams {
    /// Terrestrial request with the common 6 MHz bandwidth.
    pub fn terrestrial(frequency_khz: u32) -> Self {
        Self {
            system: System::IsdbT,
            frequency_khz,
            bandwidth: Some(Bandwidth::Mhz6),
            stream_id: None,
        }
    }

    /// Satellite request selecting one TS of the transponder.
    pub fn satellite(frequency_khz: u32, stream_id: u16) -> Self {
        Self {
            system: System::IsdbS,
            frequency_khz,
            bandwidth: None,
            stream_id: Some(stream_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terrestrial_params() {
        let p = TuneParams::terrestrial(473_143);
        assert_eq!(p.system, System::IsdbT);
        assert_eq!(p.bandwidth, Some(Bandwidth::Mhz6));
        assert_eq!(p.stream_id, None);
    }

    #[test]
    fn test_satellite_params() {
        let p = TuneParams::satellite(1_318_000, 0x4031);
        assert_eq!(p.system, System::IsdbS);
        assert_eq!(p.stream_id, Some(0x4031));
    }
}
