//! Inbound packet plumbing: the live receive multiplexer and its replay
//! stand-in.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::capture::ReplayReader;
use crate::session::{Shared, Sockets};
use crate::Result;

const RECV_BUFFER_SIZE: usize = 2048;

/// Multiplexes the three inbound sockets into packet dispatch. Each
/// datagram is fully dispatched before the next is read from the same
/// socket; sockets may interleave.
pub(crate) struct RecvTask {
    shared: Arc<Shared>,
    sockets: Arc<Sockets>,
    shutdown: watch::Receiver<bool>,
}

impl RecvTask {
    pub(crate) fn new(shared: Arc<Shared>, sockets: Arc<Sockets>) -> RecvTask {
        let shutdown = shared.shutdown.subscribe();
        RecvTask {
            shared,
            sockets,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let mut beat_buf = [0u8; RECV_BUFFER_SIZE];
        let mut status_buf = [0u8; RECV_BUFFER_SIZE];
        let mut device_buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                res = self.sockets.beat.recv_from(&mut beat_buf) => {
                    if let Ok((len, src)) = res {
                        self.ingest(&beat_buf[..len], src).await;
                    }
                }
                res = self.sockets.status.recv_from(&mut status_buf) => {
                    if let Ok((len, src)) = res {
                        self.ingest(&status_buf[..len], src).await;
                    }
                }
                res = recv_device(&self.sockets, &mut device_buf) => {
                    if let Ok((len, src)) = res {
                        self.ingest(&device_buf[..len], src).await;
                    }
                }
            }
        }
    }

    async fn ingest(&self, data: &[u8], src: SocketAddr) {
        self.shared.capture_packet(data);
        let source = match src {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            _ => None,
        };
        self.shared.process_packet(data, source).await;
    }
}

async fn recv_device(
    sockets: &Sockets,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match &sockets.device {
        Some(socket) => socket.recv_from(buf).await,
        // Replay mode has no keep-alive socket; park this branch forever.
        None => std::future::pending().await,
    }
}

/// Re-emits captured packets with their recorded inter-arrival timing in
/// place of live receive. Exhaustion or a damaged record stops the session.
pub(crate) struct ReplayTask {
    shared: Arc<Shared>,
    reader: ReplayReader<BufReader<File>>,
    shutdown: watch::Receiver<bool>,
}

impl ReplayTask {
    pub(crate) fn new(shared: Arc<Shared>, reader: ReplayReader<BufReader<File>>) -> ReplayTask {
        let shutdown = shared.shutdown.subscribe();
        ReplayTask {
            shared,
            reader,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let mut last_timestamp = 0u64;
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            let record = match self.reader.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.shared.log("replay file exhausted, stopping");
                    self.shared.signal_shutdown();
                    return Ok(());
                }
                Err(e) => {
                    self.shared.log(&format!("replay aborted: {}", e));
                    self.shared.signal_shutdown();
                    return Err(e);
                }
            };
            if last_timestamp != 0 && record.timestamp_us >= last_timestamp {
                let delta = Duration::from_micros(record.timestamp_us - last_timestamp);
                tokio::select! {
                    _ = self.shutdown.changed() => return Ok(()),
                    _ = tokio::time::sleep(delta) => {}
                }
            }
            last_timestamp = record.timestamp_us;
            self.shared.process_packet(&record.packet, None).await;
        }
    }
}
