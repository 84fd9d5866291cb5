//! Beat emission scheduling.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::session::Shared;
use crate::Result;

/// Emits one beat packet per beat while playing, waking early whenever
/// tempo, playing state, or beat alignment changes.
pub(crate) struct BeatTask {
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    state_changed: watch::Receiver<u64>,
}

impl BeatTask {
    pub(crate) fn new(shared: Arc<Shared>) -> BeatTask {
        let shutdown = shared.shutdown.subscribe();
        let state_changed = shared.state_changed.subscribe();
        BeatTask {
            shared,
            shutdown,
            state_changed,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        loop {
            let armed = {
                let state = self.shared.state.lock().unwrap();
                self.shared.config.send_beats && state.local.playing
            };
            if !armed {
                tokio::select! {
                    _ = self.shutdown.changed() => return Ok(()),
                    _ = self.state_changed.changed() => {}
                }
                continue;
            }

            let next_beat_time = {
                let state = self.shared.state.lock().unwrap();
                state.clock.snapshot(Instant::now()).next_beat_time
            };
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                // Recompute the deadline when the clock is re-anchored.
                _ = self.state_changed.changed() => {}
                _ = time::sleep_until(next_beat_time) => {
                    self.shared.send_beat_now().await;
                }
            }
        }
    }
}
