//! Device expiry sweeping.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::session::Shared;
use crate::Result;

pub(crate) struct PruneTask {
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl PruneTask {
    pub(crate) fn new(shared: Arc<Shared>) -> PruneTask {
        let shutdown = shared.shutdown.subscribe();
        PruneTask { shared, shutdown }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                _ = time::sleep(self.shared.config.device_prune_interval) => {}
            }
            self.shared.run_prune(Instant::now());
        }
    }
}
