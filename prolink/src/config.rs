use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::{ProlinkError, Result};

/// Consumer for diagnostic messages; stands in for the `log` crate when set.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Session configuration for identity, sockets, and timing behavior.
#[derive(Clone)]
pub struct Config {
    /// Device name used in announce/status/beat packets (ASCII, at most 20 bytes).
    pub device_name: String,
    /// Device number to report (0x01-0x04 for real players, 0x07 default).
    pub device_number: u8,
    /// Device type byte (0x01 CDJ, 0x03 Mixer, 0x04 Rekordbox).
    pub device_type: u8,
    /// MAC address used in keep-alive packets.
    pub mac_address: [u8; 6],
    /// IPv4 address of this host, embedded in keep-alive packets.
    /// Announcing is skipped while empty.
    pub device_ip: String,

    /// Local bind address for sockets (usually 0.0.0.0).
    pub bind_address: String,
    /// Broadcast address used for beat/status packets.
    pub broadcast_address: String,
    /// Broadcast address used for keep-alive packets.
    pub announce_address: String,

    /// Status emission interval (CDJs send roughly every 200 ms).
    pub status_interval: Duration,
    /// Keep-alive emission interval (hardware announces roughly every 1500 ms).
    pub announce_interval: Duration,
    /// Beats per bar for the local beat clock.
    pub beats_per_bar: u32,

    /// Base tempo for the local beat clock (BPM).
    pub tempo_bpm: f64,
    /// Pitch adjustment in percent (-100..+100).
    pub pitch_percent: f64,
    /// Whether local playback starts active.
    pub playing: bool,
    /// Whether to report as tempo master in status packets.
    pub master: bool,
    /// Whether to report synced in status packets.
    pub synced: bool,

    /// Enable sending beat packets.
    pub send_beats: bool,
    /// Enable sending status packets.
    pub send_status: bool,
    /// Enable sending keep-alive packets.
    pub send_announces: bool,
    /// Align the local clock and tempo to the current tempo master.
    pub follow_master: bool,

    /// Optional diagnostic sink; defaults to the `log` crate.
    pub log_callback: Option<LogCallback>,

    /// Append every received packet to this file.
    pub capture_file: Option<PathBuf>,
    /// Replay packets from this file instead of the live network.
    pub replay_file: Option<PathBuf>,

    /// Retry interval for tempo master handoff requests.
    pub master_request_retry_interval: Duration,
    /// Overall timeout for tempo master handoff requests.
    pub master_request_timeout: Duration,
    /// Handoff attempt budget, including the first request.
    pub master_request_max_retries: u32,

    /// Device timeout for discovery pruning.
    pub device_timeout: Duration,
    /// How often to check for device expiry.
    pub device_prune_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: "prolink-rs".to_string(),
            device_number: 0x07,
            device_type: 0x01,
            mac_address: [0; 6],
            device_ip: String::new(),
            bind_address: "0.0.0.0".to_string(),
            broadcast_address: "255.255.255.255".to_string(),
            announce_address: "255.255.255.255".to_string(),
            status_interval: Duration::from_millis(200),
            announce_interval: Duration::from_millis(1500),
            beats_per_bar: 4,
            tempo_bpm: 120.0,
            pitch_percent: 0.0,
            playing: false,
            master: false,
            synced: false,
            send_beats: true,
            send_status: true,
            send_announces: true,
            follow_master: false,
            log_callback: None,
            capture_file: None,
            replay_file: None,
            master_request_retry_interval: Duration::from_millis(1000),
            master_request_timeout: Duration::from_millis(5000),
            master_request_max_retries: 3,
            device_timeout: Duration::from_millis(4000),
            device_prune_interval: Duration::from_millis(1000),
        }
    }
}

fn is_valid_ipv4(address: &str) -> bool {
    address.parse::<Ipv4Addr>().is_ok()
}

impl Config {
    /// Check configuration values, reporting the first offending field.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(ProlinkError::Config(message.to_string()));

        if self.device_name.is_empty() {
            return fail("device_name must not be empty");
        }
        if self.device_number == 0 {
            return fail("device_number must be non-zero");
        }
        if self.status_interval.is_zero()
            || self.announce_interval.is_zero()
            || self.beats_per_bar == 0
        {
            return fail("intervals and beats_per_bar must be positive");
        }
        if self.device_timeout.is_zero() || self.device_prune_interval.is_zero() {
            return fail("device timeouts must be positive");
        }
        if self.master_request_retry_interval.is_zero()
            || self.master_request_timeout.is_zero()
            || self.master_request_max_retries == 0
        {
            return fail("master request policy must be positive");
        }
        if self.master_request_timeout < self.master_request_retry_interval {
            return fail("master_request_timeout must be >= master_request_retry_interval");
        }
        if !self.device_ip.is_empty() && !is_valid_ipv4(&self.device_ip) {
            return fail("device_ip must be a valid IPv4 address");
        }
        if !self.bind_address.is_empty() && !is_valid_ipv4(&self.bind_address) {
            return fail("bind_address must be a valid IPv4 address");
        }
        if !self.broadcast_address.is_empty() && !is_valid_ipv4(&self.broadcast_address) {
            return fail("broadcast_address must be a valid IPv4 address");
        }
        if !self.announce_address.is_empty() && !is_valid_ipv4(&self.announce_address) {
            return fail("announce_address must be a valid IPv4 address");
        }
        if self.capture_file.is_some() && self.replay_file.is_some() {
            return fail("capture_file and replay_file are mutually exclusive");
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("device_name", &self.device_name)
            .field("device_number", &self.device_number)
            .field("device_type", &self.device_type)
            .field("device_ip", &self.device_ip)
            .field("bind_address", &self.bind_address)
            .field("broadcast_address", &self.broadcast_address)
            .field("announce_address", &self.announce_address)
            .field("status_interval", &self.status_interval)
            .field("announce_interval", &self.announce_interval)
            .field("beats_per_bar", &self.beats_per_bar)
            .field("tempo_bpm", &self.tempo_bpm)
            .field("playing", &self.playing)
            .field("master", &self.master)
            .field("synced", &self.synced)
            .field("follow_master", &self.follow_master)
            .field("capture_file", &self.capture_file)
            .field("replay_file", &self.replay_file)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_message(config: &Config) -> String {
        match config.validate() {
            Err(ProlinkError::Config(message)) => message,
            other => panic!("expected config error, got {:?}", other.err()),
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device_number, 0x07);
        assert_eq!(config.device_type, 0x01);
        assert_eq!(config.status_interval, Duration::from_millis(200));
        assert_eq!(config.announce_interval, Duration::from_millis(1500));
        assert_eq!(config.beats_per_bar, 4);
        assert_eq!(config.device_timeout, Duration::from_millis(4000));
        assert_eq!(config.master_request_max_retries, 3);
        assert!(!config.follow_master);
    }

    #[test]
    fn rejects_empty_device_name() {
        let config = Config {
            device_name: String::new(),
            ..Config::default()
        };
        assert!(error_message(&config).contains("device_name"));
    }

    #[test]
    fn rejects_zero_device_number() {
        let config = Config {
            device_number: 0,
            ..Config::default()
        };
        assert!(error_message(&config).contains("device_number"));
    }

    #[test]
    fn rejects_invalid_device_ip() {
        let config = Config {
            device_ip: "999.999.999.999".to_string(),
            ..Config::default()
        };
        assert!(error_message(&config).contains("device_ip"));
    }

    #[test]
    fn rejects_invalid_broadcast_address() {
        let config = Config {
            broadcast_address: "not-an-ip".to_string(),
            ..Config::default()
        };
        assert!(error_message(&config).contains("broadcast_address"));
    }

    #[test]
    fn rejects_non_positive_intervals() {
        let config = Config {
            status_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(error_message(&config).contains("intervals"));
    }

    #[test]
    fn rejects_non_positive_timeouts() {
        let config = Config {
            device_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(error_message(&config).contains("device timeouts"));
    }

    #[test]
    fn rejects_capture_and_replay_together() {
        let config = Config {
            capture_file: Some("capture.bin".into()),
            replay_file: Some("replay.bin".into()),
            ..Config::default()
        };
        assert!(error_message(&config).contains("mutually exclusive"));
    }

    #[test]
    fn rejects_timeout_shorter_than_retry_interval() {
        let config = Config {
            master_request_retry_interval: Duration::from_secs(5),
            master_request_timeout: Duration::from_secs(1),
            ..Config::default()
        };
        assert!(error_message(&config).contains("master_request_timeout"));
    }

    #[test]
    fn rejects_zero_retry_budget() {
        let config = Config {
            master_request_max_retries: 0,
            ..Config::default()
        };
        assert!(error_message(&config).contains("master request"));
    }
}
