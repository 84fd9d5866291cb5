//! Keep-alive broadcasting on port 50000.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time;

use crate::proto::KeepAlive;
use crate::session::Shared;
use crate::Result;

/// Broadcasts our keep-alive packet at the announce interval. Without a
/// configured device IP there is nothing to announce.
pub(crate) struct AnnounceTask {
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl AnnounceTask {
    pub(crate) fn new(shared: Arc<Shared>) -> AnnounceTask {
        let shutdown = shared.shutdown.subscribe();
        AnnounceTask { shared, shutdown }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let config = &self.shared.config;
        if config.device_ip.is_empty() {
            return Ok(());
        }
        let Ok(ip_address) = config.device_ip.parse() else {
            return Ok(());
        };

        let packet = KeepAlive {
            device_name: config.device_name.clone(),
            device_number: config.device_number,
            device_type: config.device_type,
            mac_address: config.mac_address,
            ip_address,
        }
        .to_bytes();

        loop {
            self.shared.send_announce_now(&packet).await;
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                _ = time::sleep(self.shared.config.announce_interval) => {}
            }
        }
    }
}
