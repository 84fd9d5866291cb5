//! The concurrent session driver.
//!
//! A session owns the UDP sockets and a small set of long-running tasks:
//! one receive multiplexer (or the replay reader), the beat-emit scheduler,
//! the status-emit loop, the keep-alive announcer, and the device pruner.
//! Setters and accessors are plain synchronous calls; everything shared sits
//! behind short-lived mutexes that are never held across an await point, and
//! user callbacks are always invoked on a stack copy taken outside any lock.

use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use log::{debug, error, warn};
use num_traits::FromPrimitive;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::capture::{CaptureWriter, ReplayReader};
use crate::clock::BeatClock;
use crate::config::Config;
use crate::devices::DeviceRegistry;
use crate::master::{MasterHandoff, RequestPolicy, RoleRequest, NO_DEVICE};
use crate::message::{
    pitch_from_percent, BeatInfo, DeviceEvent, DeviceInfo, SessionMetrics, StatusInfo, SyncCommand,
};
use crate::tasks::{
    announce::AnnounceTask,
    beat::BeatTask,
    prune::PruneTask,
    recv::{RecvTask, ReplayTask},
    status::StatusTask,
};
use crate::{proto, ProlinkError, Result, ANNOUNCE_PORT, BEAT_PORT, STATUS_PORT};

type BeatCallback = Arc<dyn Fn(&BeatInfo) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(&StatusInfo) + Send + Sync>;
type DeviceCallback = Arc<dyn Fn(&DeviceInfo) + Send + Sync>;
type DeviceEventCallback = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

#[derive(Default)]
struct CallbackSet {
    beat: Option<BeatCallback>,
    status: Option<StatusCallback>,
    device: Option<DeviceCallback>,
    device_event: Option<DeviceEventCallback>,
}

#[derive(Default)]
pub(crate) struct MetricCounters {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    parse_errors: AtomicU64,
    send_errors: AtomicU64,
    callback_panics: AtomicU64,
}

impl MetricCounters {
    fn snapshot(&self) -> SessionMetrics {
        SessionMetrics {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
        }
    }
}

/// Local playback state reported in outgoing beat/status packets.
#[derive(Clone, Debug)]
pub(crate) struct LocalState {
    pub tempo_bpm: f64,
    pub pitch: u32,
    pub playing: bool,
    pub master: bool,
    pub synced: bool,
    pub beat: u32,
    pub beat_within_bar: u8,
}

pub(crate) struct SessionState {
    pub local: LocalState,
    pub clock: BeatClock,
    pub handoff: MasterHandoff,
    pub last_sent_beat: u32,
    pub packet_counter: u32,
}

pub(crate) struct Sockets {
    pub beat: UdpSocket,
    pub status: UdpSocket,
    pub device: Option<UdpSocket>,
    pub announce: UdpSocket,
}

enum OutboundSocket {
    Beat,
    Status,
    Announce,
}

enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

pub(crate) struct Shared {
    pub config: Config,
    pub state: Mutex<SessionState>,
    pub devices: Mutex<DeviceRegistry>,
    callbacks: Mutex<CallbackSet>,
    pub metrics: MetricCounters,
    sockets: Mutex<Option<Arc<Sockets>>>,
    capture: Mutex<Option<CaptureWriter<File>>>,
    /// Flipped once, by `stop()` or by replay exhaustion.
    pub shutdown: watch::Sender<bool>,
    /// Bumped on tempo/playing/beat changes to wake the beat task.
    pub state_changed: watch::Sender<u64>,
    start_error: Mutex<String>,
}

/// A Pro DJ Link session: joins the network as a virtual device.
///
/// Construct with [`Session::new`], then [`start`](Session::start) it to
/// bind sockets and spawn the background tasks. A session runs at most once;
/// after [`stop`](Session::stop) returns no further callbacks fire.
pub struct Session {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Session {
    pub fn new(config: Config) -> Session {
        let local = LocalState {
            tempo_bpm: config.tempo_bpm,
            pitch: pitch_from_percent(config.pitch_percent),
            playing: config.playing,
            master: config.master,
            synced: config.synced,
            beat: 1,
            beat_within_bar: 1,
        };
        let mut clock = BeatClock::new(config.beats_per_bar);
        clock.set_tempo(config.tempo_bpm);
        clock.set_playing(config.playing);

        let devices = DeviceRegistry::new(config.device_timeout);
        let (shutdown, _) = watch::channel(false);
        let (state_changed, _) = watch::channel(0u64);

        Session {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(SessionState {
                    local,
                    clock,
                    handoff: MasterHandoff::new(),
                    last_sent_beat: 0,
                    packet_counter: 0,
                }),
                devices: Mutex::new(devices),
                callbacks: Mutex::new(CallbackSet::default()),
                metrics: MetricCounters::default(),
                sockets: Mutex::new(None),
                capture: Mutex::new(None),
                shutdown,
                state_changed,
                start_error: Mutex::new(String::new()),
            }),
            tasks: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Bind sockets and spawn the background tasks. Configuration and
    /// socket errors surface here; anything opened before a failure is torn
    /// down again.
    pub async fn start(&self) -> Result<()> {
        {
            let lifecycle = self.lifecycle.lock().unwrap();
            match *lifecycle {
                Lifecycle::Idle => {}
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => return Err(ProlinkError::Stopped),
            }
        }

        if let Err(e) = self.shared.config.validate() {
            self.shared.record_start_error(&e.to_string());
            return Err(e);
        }

        let config = &self.shared.config;
        let replay_mode = config.replay_file.is_some();

        let replay = match &config.replay_file {
            Some(path) => match File::open(path) {
                Ok(file) => Some(ReplayReader::new(BufReader::new(file))),
                Err(e) => {
                    let message = format!("failed to open replay file {}: {}", path.display(), e);
                    self.shared.record_start_error(&message);
                    return Err(anyhow!(message).into());
                }
            },
            None => None,
        };
        let capture = match &config.capture_file {
            Some(path) => match File::create(path) {
                Ok(file) => Some(CaptureWriter::new(file)),
                Err(e) => {
                    let message = format!("failed to open capture file {}: {}", path.display(), e);
                    self.shared.record_start_error(&message);
                    return Err(anyhow!(message).into());
                }
            },
            None => None,
        };

        // In replay mode the send sockets bind to ephemeral ports and no
        // keep-alive socket is opened at all.
        let beat = self.bind_socket(if replay_mode { 0 } else { BEAT_PORT })?;
        let status = self.bind_socket(if replay_mode { 0 } else { STATUS_PORT })?;
        let device = if replay_mode {
            None
        } else {
            Some(self.bind_socket(ANNOUNCE_PORT)?)
        };
        let announce = self.bind_socket(0)?;

        let sockets = Arc::new(Sockets {
            beat,
            status,
            device,
            announce,
        });
        *self.shared.sockets.lock().unwrap() = Some(sockets.clone());
        *self.shared.capture.lock().unwrap() = capture;

        let mut tasks = Vec::new();
        if let Some(reader) = replay {
            tasks.push(spawn_task(
                "replay",
                ReplayTask::new(self.shared.clone(), reader).run(),
            ));
        } else {
            tasks.push(spawn_task(
                "recv",
                RecvTask::new(self.shared.clone(), sockets).run(),
            ));
        }
        tasks.push(spawn_task("beat", BeatTask::new(self.shared.clone()).run()));
        tasks.push(spawn_task(
            "status",
            StatusTask::new(self.shared.clone()).run(),
        ));
        if config.send_announces {
            tasks.push(spawn_task(
                "announce",
                AnnounceTask::new(self.shared.clone()).run(),
            ));
        }
        tasks.push(spawn_task(
            "prune",
            PruneTask::new(self.shared.clone()).run(),
        ));

        *self.tasks.lock().unwrap() = tasks;
        *self.lifecycle.lock().unwrap() = Lifecycle::Running;
        Ok(())
    }

    /// Stop the background tasks, close the sockets, and flush any capture
    /// file. Returns once every task has exited; no callbacks fire after
    /// that.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            match *lifecycle {
                Lifecycle::Running => *lifecycle = Lifecycle::Stopped,
                _ => {
                    *lifecycle = Lifecycle::Stopped;
                    return;
                }
            }
        }
        let _ = self.shared.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        *self.shared.sockets.lock().unwrap() = None;
        if let Some(mut capture) = self.shared.capture.lock().unwrap().take() {
            if let Err(e) = capture.flush() {
                self.shared.log(&format!("capture flush failed: {}", e));
            }
        }
    }

    fn bind_socket(&self, port: u16) -> Result<UdpSocket> {
        let bind = make_sockaddr(&self.shared.config.bind_address, port);
        let open = || -> std::io::Result<UdpSocket> {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_broadcast(true)?;
            socket.set_nonblocking(true)?;
            socket.bind(&SocketAddr::V4(bind).into())?;
            UdpSocket::from_std(socket.into())
        };
        open().map_err(|e| {
            let message = format!("bind({}) failed: {}", bind, e);
            self.shared.record_start_error(&message);
            anyhow!(message).into()
        })
    }

    pub fn set_beat_callback(&self, callback: impl Fn(&BeatInfo) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().beat = Some(Arc::new(callback));
    }

    pub fn set_status_callback(&self, callback: impl Fn(&StatusInfo) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().status = Some(Arc::new(callback));
    }

    pub fn set_device_callback(&self, callback: impl Fn(&DeviceInfo) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().device = Some(Arc::new(callback));
    }

    pub fn set_device_event_callback(&self, callback: impl Fn(&DeviceEvent) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().device_event = Some(Arc::new(callback));
    }

    /// Update the local tempo used for beat/status emission.
    pub fn set_tempo(&self, bpm: f64) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.local.tempo_bpm = bpm;
            state.clock.set_tempo(bpm);
            state.last_sent_beat = 0;
        }
        self.shared.notify_state_changed();
    }

    /// Update the local pitch as a percentage (-100..+100).
    pub fn set_pitch_percent(&self, percent: f64) {
        let mut state = self.shared.state.lock().unwrap();
        state.local.pitch = pitch_from_percent(percent);
    }

    pub fn set_playing(&self, playing: bool) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.local.playing = playing;
            state.clock.set_playing(playing);
            state.last_sent_beat = 0;
        }
        self.shared.notify_state_changed();
    }

    pub fn set_master(&self, master: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.local.master = master;
        if !master {
            state.handoff.handoff_to = NO_DEVICE;
        }
    }

    pub fn set_synced(&self, synced: bool) {
        self.shared.state.lock().unwrap().local.synced = synced;
    }

    /// Force the local beat position (1-based beat and beat-within-bar).
    pub fn set_beat(&self, beat: u32, beat_within_bar: u8) {
        let now = Instant::now();
        {
            let mut state = self.shared.state.lock().unwrap();
            state.local.beat = beat;
            state.local.beat_within_bar = beat_within_bar;
            state.clock.align_to_beat_number(beat, now);
            state.last_sent_beat = 0;
        }
        self.shared.notify_state_changed();
    }

    /// Immediately send a beat packet based on current local state.
    pub async fn send_beat(&self) {
        self.shared.send_beat_now().await;
    }

    /// Immediately send a status packet based on current local state.
    pub async fn send_status(&self) {
        self.shared.send_status_now().await;
    }

    /// Send a sync control packet to a target device, unicast when its
    /// address is known and broadcast otherwise.
    pub async fn send_sync_control(&self, target_device: u8, command: SyncCommand) {
        self.shared
            .send_sync_control(target_device, command as u8)
            .await;
    }

    /// Request to become tempo master, triggering a handoff if needed.
    pub async fn request_master_role(&self) {
        self.shared.request_master_role().await;
    }

    /// Send a master handoff request packet to a target device.
    pub async fn send_master_handoff_request(&self, target_device: u8) {
        self.shared.send_master_handoff_request(target_device).await;
    }

    /// The last known tempo master status, if any.
    pub fn tempo_master(&self) -> Option<StatusInfo> {
        self.shared
            .state
            .lock()
            .unwrap()
            .handoff
            .master_status()
            .cloned()
    }

    /// Whether we currently hold the tempo master role.
    pub fn is_master(&self) -> bool {
        self.shared.state.lock().unwrap().local.master
    }

    /// Whether we currently report as synced.
    pub fn is_synced(&self) -> bool {
        self.shared.state.lock().unwrap().local.synced
    }

    /// Devices currently discovered via network traffic.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.shared.devices.lock().unwrap().active_devices()
    }

    /// The last `start()` error message, if any.
    pub fn last_error(&self) -> String {
        self.shared.start_error.lock().unwrap().clone()
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.shared.metrics.snapshot()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send(true);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

fn spawn_task<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = future.await {
            error!(target: "prolink", "{} task error: {}", name, e);
        }
    })
}

/// Parse an IPv4 address, falling back to INADDR_ANY.
fn make_sockaddr(address: &str, port: u16) -> SocketAddrV4 {
    let ip = if address.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        address.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
    };
    SocketAddrV4::new(ip, port)
}

impl Shared {
    pub(crate) fn log(&self, message: &str) {
        if let Some(callback) = &self.config.log_callback {
            callback(message);
        } else {
            warn!(target: "prolink", "{}", message);
        }
    }

    fn record_start_error(&self, message: &str) {
        *self.start_error.lock().unwrap() = message.to_string();
        self.log(message);
    }

    fn notify_state_changed(&self) {
        self.state_changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub(crate) fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub(crate) fn request_policy(&self) -> RequestPolicy {
        RequestPolicy {
            retry_interval: self.config.master_request_retry_interval,
            timeout: self.config.master_request_timeout,
            max_retries: self.config.master_request_max_retries,
        }
    }

    fn sockets(&self) -> Option<Arc<Sockets>> {
        self.sockets.lock().unwrap().clone()
    }

    fn record_callback_panic(&self, name: &str) {
        self.metrics.callback_panics.fetch_add(1, Ordering::Relaxed);
        self.log(&format!("{} callback panicked", name));
    }

    fn record_send(&self, packet_type: &str, result: std::io::Result<usize>, expected: usize) {
        match result {
            Ok(sent) if sent == expected => {
                self.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(sent) => {
                self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                self.log(&format!(
                    "partial send of {} packet: {} of {} bytes",
                    packet_type, sent, expected
                ));
            }
            Err(e) => {
                self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                self.log(&format!("failed to send {} packet: {}", packet_type, e));
            }
        }
    }

    async fn send_on(
        &self,
        socket: OutboundSocket,
        packet_type: &str,
        packet: &[u8],
        dest: SocketAddrV4,
    ) {
        let Some(sockets) = self.sockets() else {
            return;
        };
        let socket = match socket {
            OutboundSocket::Beat => &sockets.beat,
            OutboundSocket::Status => &sockets.status,
            OutboundSocket::Announce => &sockets.announce,
        };
        let result = socket.send_to(packet, SocketAddr::V4(dest)).await;
        self.record_send(packet_type, result, packet.len());
    }

    /// Unicast destination for a device, or the broadcast address when its
    /// IP is unknown.
    fn device_dest(&self, device_number: u8) -> SocketAddrV4 {
        match self.devices.lock().unwrap().lookup_ip(device_number) {
            Some(ip) => SocketAddrV4::new(ip, BEAT_PORT),
            None => make_sockaddr(&self.config.broadcast_address, BEAT_PORT),
        }
    }

    /// Broadcast a beat packet for the clock's current beat. Emission is
    /// suppressed while the same beat number was already sent.
    pub(crate) async fn send_beat_now(&self) {
        if !self.config.send_beats {
            return;
        }
        let info = {
            let mut state = self.state.lock().unwrap();
            if !state.local.playing {
                return;
            }
            let snapshot = state.clock.snapshot(Instant::now());
            if snapshot.beat == state.last_sent_beat {
                return;
            }
            state.last_sent_beat = snapshot.beat;
            let beat_interval = snapshot.beat_interval_ms as u32;
            let beats_left = (self.config.beats_per_bar + 1)
                .saturating_sub(snapshot.beat_within_bar as u32);
            BeatInfo {
                device_number: self.config.device_number,
                device_name: self.config.device_name.clone(),
                bpm: (snapshot.tempo_bpm * 100.0).round() as u32,
                pitch: state.local.pitch,
                beat_within_bar: snapshot.beat_within_bar,
                next_beat_ms: beat_interval,
                next_bar_ms: beat_interval.saturating_mul(beats_left),
            }
        };
        let packet = proto::build_beat(&info);
        let dest = make_sockaddr(&self.config.broadcast_address, BEAT_PORT);
        self.send_on(OutboundSocket::Beat, "beat", &packet, dest).await;
    }

    /// Broadcast a status packet reflecting current local state.
    pub(crate) async fn send_status_now(&self) {
        if !self.config.send_status {
            return;
        }
        let (info, counter) = {
            let mut state = self.state.lock().unwrap();
            let snapshot = state.clock.snapshot(Instant::now());
            state.packet_counter = state.packet_counter.wrapping_add(1);
            let local = state.local.clone();
            let handoff_to = state.handoff.handoff_to;
            (
                StatusInfo {
                    device_number: self.config.device_number,
                    device_name: self.config.device_name.clone(),
                    bpm: Some((local.tempo_bpm * 100.0).round() as u32),
                    pitch: local.pitch,
                    beat: Some(snapshot.beat),
                    beat_within_bar: snapshot.beat_within_bar,
                    master_handoff_to: if local.master { handoff_to } else { NO_DEVICE },
                    is_master: local.master,
                    is_synced: local.synced,
                    is_playing: local.playing,
                },
                state.packet_counter,
            )
        };
        let packet = proto::build_status(&info, counter);
        let dest = make_sockaddr(&self.config.broadcast_address, STATUS_PORT);
        self.send_on(OutboundSocket::Status, "status", &packet, dest)
            .await;
    }

    pub(crate) async fn send_announce_now(&self, packet: &[u8]) {
        let dest = make_sockaddr(&self.config.announce_address, ANNOUNCE_PORT);
        self.send_on(OutboundSocket::Announce, "announce", packet, dest)
            .await;
    }

    pub(crate) async fn send_sync_control(&self, target_device: u8, command: u8) {
        let packet = proto::SyncControl {
            device_name: self.config.device_name.clone(),
            device_number: self.config.device_number,
            command,
        }
        .to_bytes();
        let dest = self.device_dest(target_device);
        self.send_on(OutboundSocket::Beat, "sync_control", &packet, dest)
            .await;
    }

    pub(crate) async fn send_master_handoff_request(&self, target_device: u8) {
        let packet = proto::MasterHandoffRequest {
            device_name: self.config.device_name.clone(),
            device_number: self.config.device_number,
        }
        .to_bytes();
        let dest = self.device_dest(target_device);
        self.send_on(
            OutboundSocket::Beat,
            "master_handoff_request",
            &packet,
            dest,
        )
        .await;
    }

    async fn send_master_handoff_response(&self, target_device: u8, accepted: bool) {
        let packet = proto::MasterHandoffResponse {
            device_name: self.config.device_name.clone(),
            device_number: self.config.device_number,
            accepted,
        }
        .to_bytes();
        let dest = self.device_dest(target_device);
        self.send_on(
            OutboundSocket::Beat,
            "master_handoff_response",
            &packet,
            dest,
        )
        .await;
    }

    /// Request the master role from the observed master. With no master on
    /// the network the promotion happens immediately.
    pub(crate) async fn request_master_role(&self) {
        let now = Instant::now();
        let target = {
            let mut state = self.state.lock().unwrap();
            if state.local.master {
                return;
            }
            match state.handoff.begin_request(
                self.config.device_number,
                self.config.master_request_retry_interval,
                now,
            ) {
                RoleRequest::SelfPromote => {
                    state.local.master = true;
                    state.local.synced = true;
                    state.last_sent_beat = 0;
                    None
                }
                RoleRequest::AlreadyOurs => {
                    state.local.master = true;
                    state.local.synced = true;
                    None
                }
                RoleRequest::Send(target) => Some(target),
                RoleRequest::Throttled => None,
            }
        };
        if let Some(target) = target {
            self.send_master_handoff_request(target).await;
        }
    }

    pub(crate) async fn maybe_retry_master_request(&self) {
        let target = {
            let mut state = self.state.lock().unwrap();
            let policy = self.request_policy();
            state.handoff.maybe_retry(&policy, Instant::now())
        };
        if let Some(target) = target {
            self.send_master_handoff_request(target).await;
        }
    }

    pub(crate) fn capture_packet(&self, data: &[u8]) {
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or(0);
        let result = {
            let mut capture = self.capture.lock().unwrap();
            match capture.as_mut() {
                Some(writer) => writer.record(timestamp_us, data),
                None => return,
            }
        };
        if let Err(e) = result {
            self.log(&format!("capture write failed: {}", e));
        }
    }

    /// Dispatch one inbound datagram: registry update, typed callback, and
    /// master-handoff transitions.
    pub(crate) async fn process_packet(&self, data: &[u8], source: Option<Ipv4Addr>) {
        if !proto::has_header(data) || data.len() <= proto::PACKET_TYPE_OFFSET {
            self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.metrics.packets_received.fetch_add(1, Ordering::Relaxed);
        let packet = match proto::Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(target: "prolink", "dropping unparseable packet: {}", e);
                return;
            }
        };
        match packet {
            proto::Packet::KeepAlive(keep_alive) => {
                let event = {
                    let mut devices = self.devices.lock().unwrap();
                    devices.observe_keep_alive(&keep_alive, Instant::now())
                };
                if let Some(event) = event {
                    self.dispatch_device_event(&event);
                }
            }
            proto::Packet::Beat(info) => {
                self.note_device_traffic(info.device_number, &info.device_name, source);
                self.handle_beat(info);
            }
            proto::Packet::Status(info) => {
                self.note_device_traffic(info.device_number, &info.device_name, source);
                self.handle_status(info).await;
            }
            proto::Packet::SyncControl(control) => {
                self.note_device_traffic(control.device_number, &control.device_name, source);
                self.handle_sync_control(control.command).await;
            }
            proto::Packet::MasterHandoffRequest(request) => {
                self.note_device_traffic(request.device_number, &request.device_name, source);
                self.handle_master_handoff_request(request.device_number)
                    .await;
            }
            proto::Packet::MasterHandoffResponse(response) => {
                self.note_device_traffic(response.device_number, &response.device_name, source);
                self.handle_master_handoff_response(response.device_number, response.accepted);
            }
        }
    }

    fn note_device_traffic(&self, device_number: u8, name: &str, ip: Option<Ipv4Addr>) {
        let event = {
            let mut devices = self.devices.lock().unwrap();
            devices.observe_traffic(device_number, name, ip, Instant::now())
        };
        if let Some(event) = event {
            self.dispatch_device_event(&event);
        }
    }

    fn dispatch_device_event(&self, event: &DeviceEvent) {
        let (device_callback, event_callback) = {
            let callbacks = self.callbacks.lock().unwrap();
            (callbacks.device.clone(), callbacks.device_event.clone())
        };
        if !matches!(event, DeviceEvent::Expired(_)) {
            if let Some(callback) = device_callback {
                if catch_unwind(AssertUnwindSafe(|| callback(event.device()))).is_err() {
                    self.record_callback_panic("device");
                }
            }
        }
        if let Some(callback) = event_callback {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                self.record_callback_panic("device event");
            }
        }
    }

    fn handle_beat(&self, info: BeatInfo) {
        let callback = { self.callbacks.lock().unwrap().beat.clone() };
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(&info))).is_err() {
                self.record_callback_panic("beat");
            }
        }
        if !self.config.follow_master {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let master_device = state.handoff.master_device();
        if master_device != 0 && info.device_number == master_device {
            let now = Instant::now();
            match state.handoff.advance_master_beat() {
                Some(beat) => state.clock.align_to_beat_number(beat, now),
                None => state.clock.align_to_beat_within_bar(info.beat_within_bar, now),
            }
            state.last_sent_beat = 0;
        }
    }

    async fn handle_status(&self, info: StatusInfo) {
        let callback = { self.callbacks.lock().unwrap().status.clone() };
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(&info))).is_err() {
                self.record_callback_panic("status");
            }
        }

        let now = Instant::now();
        let mut restart_target = None;
        {
            let mut state = self.state.lock().unwrap();
            if info.is_master {
                restart_target =
                    state
                        .handoff
                        .observe_master(&info, self.config.device_number, now);
                if self.config.follow_master {
                    if let (Some(bpm), Some(beat)) = (info.bpm, info.beat) {
                        let bpm = bpm as f64 / 100.0;
                        state.local.tempo_bpm = bpm;
                        state.clock.set_tempo(bpm);
                        state.clock.align_to_beat_number(beat, now);
                        state.local.synced = true;
                        state.last_sent_beat = 0;
                    }
                }
            }
            if info.master_handoff_to == self.config.device_number {
                state.local.master = true;
                state.local.synced = true;
                state.last_sent_beat = 0;
                state.handoff.take_role();
            }
            if state.handoff.handoff_to != NO_DEVICE
                && info.device_number == state.handoff.handoff_to
                && info.is_master
            {
                state.local.master = false;
                state.handoff.complete_handoff();
            }
        }
        if let Some(target) = restart_target {
            self.log("master changed during handoff request, restarting");
            self.send_master_handoff_request(target).await;
        }
    }

    async fn handle_sync_control(&self, command: u8) {
        match SyncCommand::from_u8(command) {
            Some(SyncCommand::EnableSync) => {
                self.state.lock().unwrap().local.synced = true;
            }
            Some(SyncCommand::DisableSync) => {
                self.state.lock().unwrap().local.synced = false;
            }
            Some(SyncCommand::BecomeMaster) => self.request_master_role().await,
            None => {}
        }
    }

    /// Accept a handoff request when we hold the role; the actual
    /// relinquishment waits until the requester advertises itself as master.
    async fn handle_master_handoff_request(&self, requester: u8) {
        let respond = {
            let mut state = self.state.lock().unwrap();
            if state.local.master {
                state.handoff.handoff_to = requester;
                true
            } else {
                false
            }
        };
        if respond {
            self.send_master_handoff_response(requester, true).await;
        }
    }

    fn handle_master_handoff_response(&self, responder: u8, accepted: bool) {
        if !accepted {
            return;
        }
        let state = self.state.lock().unwrap();
        if state
            .handoff
            .request()
            .is_some_and(|request| request.target == responder)
        {
            // Acknowledged; the role flips when a status packet hands off
            // to us.
            debug!(target: "prolink", "handoff request acknowledged by device {}", responder);
        }
    }

    pub(crate) fn run_prune(&self, now: Instant) {
        let expired = {
            let mut devices = self.devices.lock().unwrap();
            devices.prune(now)
        };
        for device in expired {
            self.dispatch_device_event(&DeviceEvent::Expired(device));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            device_name: "test-cdj".to_string(),
            device_number: 0x07,
            ..Config::default()
        }
    }

    fn status_packet(info: &StatusInfo) -> Vec<u8> {
        proto::build_status(info, 0)
    }

    fn master_status(device_number: u8) -> StatusInfo {
        StatusInfo {
            device_number,
            device_name: format!("CDJ-{}", device_number),
            bpm: Some(12800),
            pitch: crate::NEUTRAL_PITCH,
            beat: Some(32),
            beat_within_bar: 1,
            master_handoff_to: NO_DEVICE,
            is_master: true,
            is_synced: true,
            is_playing: true,
        }
    }

    #[test]
    fn concurrent_setters_do_not_race() {
        let session = Arc::new(Session::new(test_config()));
        let mut threads = Vec::new();

        {
            let session = session.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    session.set_tempo(120.0 + (i % 5) as f64);
                }
            }));
        }
        {
            let session = session.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    session.set_pitch_percent((i % 3) as f64 * 1.5);
                }
            }));
        }
        {
            let session = session.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    session.set_playing(i % 2 == 0);
                }
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[tokio::test]
    async fn request_master_role_self_promotes_without_a_master() {
        let session = Session::new(test_config());
        assert!(!session.is_master());

        session.request_master_role().await;
        assert!(session.is_master());
        assert!(session.is_synced());
        assert!(session.tempo_master().is_none());
    }

    #[tokio::test]
    async fn request_master_role_tracks_an_observed_master() {
        let session = Session::new(test_config());
        session
            .shared
            .process_packet(&status_packet(&master_status(2)), None)
            .await;
        assert_eq!(session.tempo_master().unwrap().device_number, 2);

        session.request_master_role().await;
        assert!(!session.is_master());
        {
            let state = session.shared.state.lock().unwrap();
            let request = state.handoff.request().unwrap();
            assert_eq!(request.target, 2);
            assert_eq!(request.attempts, 1);
        }

        // The master points its handoff byte at us; the role is ours.
        let mut handing_off = master_status(2);
        handing_off.master_handoff_to = 0x07;
        session
            .shared
            .process_packet(&status_packet(&handing_off), None)
            .await;
        assert!(session.is_master());
        assert!(session
            .shared
            .state
            .lock()
            .unwrap()
            .handoff
            .request()
            .is_none());
    }

    #[tokio::test]
    async fn handoff_request_recorded_while_master() {
        let session = Session::new(test_config());
        session.set_master(true);

        let request = proto::MasterHandoffRequest {
            device_name: "CDJ-3".to_string(),
            device_number: 3,
        };
        session.shared.process_packet(&request.to_bytes(), None).await;
        assert_eq!(session.shared.state.lock().unwrap().handoff.handoff_to, 3);

        // Successor advertises itself as master; we relinquish.
        session
            .shared
            .process_packet(&status_packet(&master_status(3)), None)
            .await;
        assert!(!session.is_master());
        assert_eq!(
            session.shared.state.lock().unwrap().handoff.handoff_to,
            NO_DEVICE
        );
    }

    #[tokio::test]
    async fn sync_control_commands_toggle_state() {
        let session = Session::new(test_config());

        let enable = proto::SyncControl {
            device_name: "CDJ-2".to_string(),
            device_number: 2,
            command: SyncCommand::EnableSync as u8,
        };
        session.shared.process_packet(&enable.to_bytes(), None).await;
        assert!(session.is_synced());

        let disable = proto::SyncControl {
            command: SyncCommand::DisableSync as u8,
            ..enable.clone()
        };
        session.shared.process_packet(&disable.to_bytes(), None).await;
        assert!(!session.is_synced());

        let become_master = proto::SyncControl {
            command: SyncCommand::BecomeMaster as u8,
            ..enable
        };
        session
            .shared
            .process_packet(&become_master.to_bytes(), None)
            .await;
        assert!(session.is_master());
    }

    #[tokio::test]
    async fn follow_master_adopts_tempo() {
        let config = Config {
            follow_master: true,
            ..test_config()
        };
        let session = Session::new(config);
        session
            .shared
            .process_packet(&status_packet(&master_status(2)), None)
            .await;

        let state = session.shared.state.lock().unwrap();
        assert!((state.local.tempo_bpm - 128.0).abs() < 0.001);
        assert!(state.local.synced);
    }

    #[tokio::test]
    async fn beat_and_device_callbacks_fire_once_per_packet() {
        let session = Session::new(test_config());
        let beats = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let beats = beats.clone();
            session.set_beat_callback(move |_| {
                beats.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let seen = seen.clone();
            session.set_device_event_callback(move |event| {
                if matches!(event, DeviceEvent::Seen(_)) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let beat = BeatInfo {
            device_number: 2,
            device_name: "CDJ-2".to_string(),
            bpm: 12000,
            pitch: crate::NEUTRAL_PITCH,
            beat_within_bar: 1,
            next_beat_ms: 500,
            next_bar_ms: 2000,
        };
        let packet = proto::build_beat(&beat);
        session.shared.process_packet(&packet, None).await;
        session.shared.process_packet(&packet, None).await;

        assert_eq!(beats.load(Ordering::SeqCst), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(session.metrics().packets_received, 2);
    }

    #[tokio::test]
    async fn callback_panics_are_counted_and_contained() {
        let session = Session::new(test_config());
        session.set_beat_callback(|_| panic!("bad callback"));

        let beat = BeatInfo {
            device_number: 2,
            device_name: "CDJ-2".to_string(),
            bpm: 12000,
            pitch: crate::NEUTRAL_PITCH,
            beat_within_bar: 1,
            next_beat_ms: 500,
            next_bar_ms: 2000,
        };
        session
            .shared
            .process_packet(&proto::build_beat(&beat), None)
            .await;
        assert_eq!(session.metrics().callback_panics, 1);
    }

    #[tokio::test]
    async fn garbage_counts_as_parse_error() {
        let session = Session::new(test_config());
        session.shared.process_packet(&[0u8; 64], None).await;
        assert_eq!(session.metrics().parse_errors, 1);
        assert_eq!(session.metrics().packets_received, 0);

        // Valid header but truncated body counts as received and as a
        // parse error.
        let beat = proto::build_beat(&BeatInfo {
            device_number: 2,
            device_name: "CDJ-2".to_string(),
            bpm: 12000,
            pitch: crate::NEUTRAL_PITCH,
            beat_within_bar: 1,
            next_beat_ms: 500,
            next_bar_ms: 2000,
        });
        session.shared.process_packet(&beat[..0x40], None).await;
        assert_eq!(session.metrics().parse_errors, 2);
        assert_eq!(session.metrics().packets_received, 1);
    }

    #[tokio::test]
    async fn prune_expires_devices_through_the_session() {
        let config = Config {
            device_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let session = Session::new(config);
        let expired = Arc::new(AtomicUsize::new(0));
        {
            let expired = expired.clone();
            session.set_device_event_callback(move |event| {
                if matches!(event, DeviceEvent::Expired(_)) {
                    expired.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let keep_alive = proto::KeepAlive {
            device_name: "CDJ-2".to_string(),
            device_number: 2,
            device_type: 1,
            mac_address: [0; 6],
            ip_address: Ipv4Addr::new(192, 168, 0, 5),
        };
        session
            .shared
            .process_packet(&keep_alive.to_bytes(), None)
            .await;
        assert_eq!(session.devices().len(), 1);

        session
            .shared
            .run_prune(Instant::now() + Duration::from_millis(51));
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(session.devices().is_empty());
    }
}
