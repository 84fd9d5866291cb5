//! Pro DJ Link protocol engine.
//!
//! Joins a Pro DJ Link network as a virtual device: tracks the CD players,
//! mixers, and rekordbox hosts announcing themselves on the LAN, observes
//! their beat and status broadcasts, emits our own, and takes part in the
//! tempo-master handoff protocol.
//!
//! ```no_run
//! use prolink::{Config, Session};
//!
//! # async fn run() -> prolink::Result<()> {
//! let config = Config {
//!     device_name: "virtual-cdj".into(),
//!     ..Config::default()
//! };
//! let session = Session::new(config);
//! session.set_beat_callback(|beat| {
//!     println!("device {} on beat {}", beat.device_number, beat.beat_within_bar);
//! });
//! session.start().await?;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

mod capture;
mod clock;
mod config;
mod devices;
pub mod iface;
mod master;
pub mod message;
mod proto;
mod session;
mod tasks;

pub use config::{Config, LogCallback};
pub use message::{
    BeatInfo, DeviceEvent, DeviceInfo, DeviceType, SessionMetrics, StatusInfo, SyncCommand,
    NEUTRAL_PITCH,
};
pub use session::Session;

/// UDP port carrying keep-alive (announce) traffic.
pub const ANNOUNCE_PORT: u16 = 50000;
/// UDP port carrying beat, sync-control, and master-handoff traffic.
pub const BEAT_PORT: u16 = 50001;
/// UDP port carrying CDJ status traffic.
pub const STATUS_PORT: u16 = 50002;

#[derive(Error, Debug)]
pub enum ProlinkError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session was already stopped")]
    Stopped,

    #[error("{error_kind} error at 0x{pos:x} parsing packet:\n{dump}")]
    Parse {
        error_kind: String,
        pos: usize,
        dump: String,
    },

    #[error("replay record of {0} bytes exceeds the packet size limit")]
    ReplayRecordTooLarge(usize),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProlinkError>;
