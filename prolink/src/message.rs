//! Public data model for parsed network traffic.

use std::net::Ipv4Addr;

use num_derive::FromPrimitive;
use tokio::time::Instant;

/// Raw pitch value encoding 1.0x playback speed.
pub const NEUTRAL_PITCH: u32 = 0x10_0000;

/// Device classes advertised in keep-alive packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum DeviceType {
    Cdj = 0x01,
    Mixer = 0x03,
    Rekordbox = 0x04,
}

/// Commands carried by sync control packets (type 0x2a).
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum SyncCommand {
    BecomeMaster = 0x01,
    EnableSync = 0x10,
    DisableSync = 0x20,
}

/// Convert a raw pitch value into a playback-speed multiplier.
pub fn pitch_to_multiplier(pitch: u32) -> f64 {
    pitch as f64 / NEUTRAL_PITCH as f64
}

/// Convert a pitch percentage (-100..+100) into a raw pitch value.
pub fn pitch_from_percent(percent: f64) -> u32 {
    let offset = (percent * NEUTRAL_PITCH as f64 / 100.0).round() as i64;
    (offset + NEUTRAL_PITCH as i64).max(0) as u32
}

/// A device discovered through keep-alive or beat/status traffic.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    /// Device number reported on the wire; nonzero once populated.
    pub device_number: u8,
    /// Raw device type byte; see [`DeviceType`] for known values.
    pub device_type: u8,
    /// Device name field (trimmed ASCII).
    pub device_name: String,
    /// Last IPv4 address the device reported or sent from.
    pub ip_address: Option<Ipv4Addr>,
    /// MAC address from keep-alive packets.
    pub mac_address: [u8; 6],
    /// When a packet was last observed from this device.
    pub last_seen: Instant,
}

impl DeviceInfo {
    /// The device type, when it is one of the known classes.
    pub fn device_type(&self) -> Option<DeviceType> {
        num_traits::FromPrimitive::from_u8(self.device_type)
    }
}

/// Device lifecycle events emitted by discovery tracking.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    /// First observation, or reappearance after expiry.
    Seen(DeviceInfo),
    /// An attribute of an already-tracked device changed.
    Updated(DeviceInfo),
    /// No traffic within the device timeout.
    Expired(DeviceInfo),
}

impl DeviceEvent {
    pub fn device(&self) -> &DeviceInfo {
        match self {
            DeviceEvent::Seen(device) | DeviceEvent::Updated(device) | DeviceEvent::Expired(device) => {
                device
            }
        }
    }
}

/// Beat packet data from broadcast traffic on port 50001.
#[derive(Clone, Debug, PartialEq)]
pub struct BeatInfo {
    pub device_number: u8,
    pub device_name: String,
    /// Track BPM * 100 (12050 == 120.50 BPM).
    pub bpm: u32,
    /// Raw pitch value, neutral at [`NEUTRAL_PITCH`].
    pub pitch: u32,
    /// Beat within the bar (1-4) as reported by the device.
    pub beat_within_bar: u8,
    /// Time to the next beat in ms at normal speed.
    pub next_beat_ms: u32,
    /// Time to the next bar in ms at normal speed.
    pub next_bar_ms: u32,
}

impl BeatInfo {
    /// Effective BPM with the pitch multiplier applied.
    pub fn effective_bpm(&self) -> f64 {
        self.bpm as f64 * pitch_to_multiplier(self.pitch) / 100.0
    }
}

/// CDJ status packet data from traffic on port 50002.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusInfo {
    pub device_number: u8,
    pub device_name: String,
    /// Track BPM * 100; absent while no track is loaded.
    pub bpm: Option<u32>,
    /// Raw pitch value, neutral at [`NEUTRAL_PITCH`].
    pub pitch: u32,
    /// Absolute beat number within the track, if known.
    pub beat: Option<u32>,
    /// Beat within the bar (1-4) as reported by the device.
    pub beat_within_bar: u8,
    /// Device number being handed the master role, or 0xff for none.
    pub master_handoff_to: u8,
    pub is_master: bool,
    pub is_synced: bool,
    pub is_playing: bool,
}

impl StatusInfo {
    /// Effective BPM with the pitch multiplier applied, if a track is loaded.
    pub fn effective_bpm(&self) -> Option<f64> {
        self.bpm
            .map(|bpm| bpm as f64 * pitch_to_multiplier(self.pitch) / 100.0)
    }
}

/// Counters for packet flow and error reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub parse_errors: u64,
    pub send_errors: u64,
    pub callback_panics: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_effective_bpm_applies_pitch() {
        let mut info = BeatInfo {
            device_number: 1,
            device_name: "CDJ-1".to_string(),
            bpm: 12000,
            pitch: NEUTRAL_PITCH,
            beat_within_bar: 1,
            next_beat_ms: 500,
            next_bar_ms: 2000,
        };
        assert!((info.effective_bpm() - 120.0).abs() < 0.001);

        info.pitch = NEUTRAL_PITCH + NEUTRAL_PITCH / 2;
        assert!((info.effective_bpm() - 180.0).abs() < 0.001);
    }

    #[test]
    fn status_effective_bpm_handles_missing_track() {
        let mut info = StatusInfo {
            device_number: 2,
            device_name: "CDJ-2".to_string(),
            bpm: None,
            pitch: NEUTRAL_PITCH,
            beat: None,
            beat_within_bar: 1,
            master_handoff_to: 0xff,
            is_master: false,
            is_synced: false,
            is_playing: false,
        };
        assert_eq!(info.effective_bpm(), None);

        info.bpm = Some(12850);
        let bpm = info.effective_bpm().unwrap();
        assert!((bpm - 128.5).abs() < 0.001);
    }

    #[test]
    fn pitch_percent_round_trips_common_values() {
        assert_eq!(pitch_from_percent(0.0), NEUTRAL_PITCH);
        assert_eq!(pitch_from_percent(100.0), 2 * NEUTRAL_PITCH);
        assert_eq!(pitch_from_percent(-100.0), 0);
        assert!((pitch_to_multiplier(pitch_from_percent(8.0)) - 1.08).abs() < 0.0001);
    }
}
