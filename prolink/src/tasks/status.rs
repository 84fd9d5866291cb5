//! Periodic status emission and master-request retries.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time;

use crate::session::Shared;
use crate::Result;

pub(crate) struct StatusTask {
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl StatusTask {
    pub(crate) fn new(shared: Arc<Shared>) -> StatusTask {
        let shutdown = shared.shutdown.subscribe();
        StatusTask { shared, shutdown }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let interval = self.shared.config.status_interval;
        loop {
            if self.shared.config.send_status {
                self.shared.send_status_now().await;
            }
            self.shared.maybe_retry_master_request().await;
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                _ = time::sleep(interval) => {}
            }
        }
    }
}
