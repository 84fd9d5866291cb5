use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use prolink::{iface, Config, DeviceEvent, Session};

/// Pro DJ Link network monitor and virtual CDJ.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Device name announced on the network.
    #[arg(long, default_value = "prolink-util")]
    name: String,

    /// Virtual device number (0x07 is safe alongside real players).
    #[arg(long, default_value_t = 7)]
    device_num: u8,

    /// Network interface to announce from (auto-detected when omitted).
    #[arg(long)]
    iface: Option<String>,

    /// Local tempo in BPM.
    #[arg(long, default_value_t = 120.0)]
    tempo: f64,

    /// Start playing immediately and emit beat packets.
    #[arg(long)]
    play: bool,

    /// Follow the network tempo master.
    #[arg(long)]
    follow_master: bool,

    /// Print every beat packet seen on the network.
    #[arg(long)]
    show_beats: bool,

    /// Capture received packets to a file.
    #[arg(long)]
    capture: Option<PathBuf>,

    /// Replay packets from a capture file instead of the live network.
    #[arg(long, conflicts_with = "capture")]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config {
        device_name: args.name,
        device_number: args.device_num,
        tempo_bpm: args.tempo,
        playing: args.play,
        synced: args.follow_master,
        follow_master: args.follow_master,
        capture_file: args.capture,
        replay_file: args.replay,
        ..Config::default()
    };

    if config.replay_file.is_none() {
        let iface = iface::find_ipv4_interface(args.iface.as_deref())?;
        info!(
            "announcing from {} ({} / broadcast {})",
            iface.name, iface.ip, iface.broadcast
        );
        config.device_ip = iface.ip.to_string();
        config.broadcast_address = iface.broadcast.to_string();
        config.announce_address = iface.broadcast.to_string();
        config.mac_address = iface.mac_address;
    }

    let session = Session::new(config);

    session.set_device_event_callback(|event| match event {
        DeviceEvent::Seen(device) => {
            println!(
                "+ device {:>3}  {:<20} {}",
                device.device_number,
                device.device_name,
                device
                    .ip_address
                    .map(|ip| ip.to_string())
                    .unwrap_or_default()
            );
        }
        DeviceEvent::Updated(device) => {
            println!(
                "~ device {:>3}  {:<20} {}",
                device.device_number,
                device.device_name,
                device
                    .ip_address
                    .map(|ip| ip.to_string())
                    .unwrap_or_default()
            );
        }
        DeviceEvent::Expired(device) => {
            println!("- device {:>3}  {}", device.device_number, device.device_name);
        }
    });

    if args.show_beats {
        session.set_beat_callback(|beat| {
            println!(
                "beat  device {}  {}/{:.2} bpm  {}",
                beat.device_number,
                beat.bpm as f64 / 100.0,
                beat.effective_bpm(),
                beat.beat_within_bar
            );
        });
    }

    session.set_status_callback(|status| {
        if status.is_master {
            log::debug!(
                "master: device {} at {:?} bpm",
                status.device_number,
                status.effective_bpm()
            );
        }
    });

    session.start().await?;
    println!("session running, ctrl-c to exit");

    tokio::signal::ctrl_c().await?;
    println!("terminating");
    let metrics = session.metrics();
    session.stop().await;
    println!(
        "received {} packets, sent {}, {} parse errors",
        metrics.packets_received, metrics.packets_sent, metrics.parse_errors
    );

    Ok(())
}
