//! Device discovery tracking.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time::Instant;

use crate::message::{DeviceEvent, DeviceInfo};
use crate::proto::KeepAlive;

struct DeviceRecord {
    info: DeviceInfo,
    active: bool,
}

/// Registry of devices observed on the network, keyed by device number.
///
/// Records expire after `timeout` without traffic and are retained inactive
/// for ten timeouts so late packets re-seen a device instead of churning.
/// At most one event is emitted per mutating call; `Seen` wins over
/// `Updated`.
pub(crate) struct DeviceRegistry {
    devices: HashMap<u8, DeviceRecord>,
    timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(timeout: Duration) -> DeviceRegistry {
        DeviceRegistry {
            devices: HashMap::new(),
            timeout,
        }
    }

    fn record_entry(&mut self, device_number: u8, now: Instant) -> &mut DeviceRecord {
        self.devices
            .entry(device_number)
            .or_insert_with(|| DeviceRecord {
                info: DeviceInfo {
                    device_number: 0,
                    device_type: 0,
                    device_name: String::new(),
                    ip_address: None,
                    mac_address: [0; 6],
                    last_seen: now,
                },
                active: false,
            })
    }

    /// Ingest a keep-alive packet.
    pub fn observe_keep_alive(&mut self, keep_alive: &KeepAlive, now: Instant) -> Option<DeviceEvent> {
        let record = self.record_entry(keep_alive.device_number, now);
        let mut seen = false;
        let mut updated = false;

        if record.info.device_number == 0 {
            record.info.device_number = keep_alive.device_number;
            seen = true;
        }
        if record.info.device_type != keep_alive.device_type {
            record.info.device_type = keep_alive.device_type;
            updated = true;
        }
        if !keep_alive.device_name.is_empty() && record.info.device_name != keep_alive.device_name {
            record.info.device_name = keep_alive.device_name.clone();
            updated = true;
        }
        if record.info.ip_address != Some(keep_alive.ip_address) {
            record.info.ip_address = Some(keep_alive.ip_address);
            updated = true;
        }
        if record.info.mac_address != keep_alive.mac_address {
            record.info.mac_address = keep_alive.mac_address;
            updated = true;
        }
        record.info.last_seen = now;
        if !record.active {
            record.active = true;
            seen = true;
        }

        let info = record.info.clone();
        if seen {
            Some(DeviceEvent::Seen(info))
        } else if updated {
            Some(DeviceEvent::Updated(info))
        } else {
            None
        }
    }

    /// Note a beat/status/control sighting; updates last-seen and possibly
    /// the name and source address.
    pub fn observe_traffic(
        &mut self,
        device_number: u8,
        device_name: &str,
        ip_address: Option<Ipv4Addr>,
        now: Instant,
    ) -> Option<DeviceEvent> {
        if device_number == 0 {
            return None;
        }
        let record = self.record_entry(device_number, now);
        let mut seen = false;
        let mut updated = false;

        if record.info.device_number == 0 {
            record.info.device_number = device_number;
            seen = true;
        }
        if !device_name.is_empty() && record.info.device_name != device_name {
            record.info.device_name = device_name.to_string();
            updated = true;
        }
        if ip_address.is_some() && record.info.ip_address != ip_address {
            record.info.ip_address = ip_address;
            updated = true;
        }
        record.info.last_seen = now;
        if !record.active {
            record.active = true;
            seen = true;
        }

        let info = record.info.clone();
        if seen {
            Some(DeviceEvent::Seen(info))
        } else if updated {
            Some(DeviceEvent::Updated(info))
        } else {
            None
        }
    }

    /// Expire devices unseen within the timeout and erase records inactive
    /// for more than ten timeouts. Returns the newly expired devices.
    pub fn prune(&mut self, now: Instant) -> Vec<DeviceInfo> {
        let mut expired = Vec::new();
        for record in self.devices.values_mut() {
            if record.active && now.saturating_duration_since(record.info.last_seen) > self.timeout
            {
                record.active = false;
                expired.push(record.info.clone());
            }
        }

        let erase_after = self.timeout * 10;
        self.devices.retain(|_, record| {
            record.active || now.saturating_duration_since(record.info.last_seen) <= erase_after
        });
        expired
    }

    pub fn active_devices(&self) -> Vec<DeviceInfo> {
        self.devices
            .values()
            .filter(|record| record.active)
            .map(|record| record.info.clone())
            .collect()
    }

    pub fn lookup_ip(&self, device_number: u8) -> Option<Ipv4Addr> {
        self.devices
            .get(&device_number)
            .and_then(|record| record.info.ip_address)
    }

    #[cfg(test)]
    pub fn record_count(&self) -> usize {
        self.devices.len()
    }

    #[cfg(test)]
    pub fn set_last_seen(&mut self, device_number: u8, when: Instant) {
        if let Some(record) = self.devices.get_mut(&device_number) {
            record.info.last_seen = when;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keep_alive(device_number: u8, name: &str) -> KeepAlive {
        KeepAlive {
            device_name: name.to_string(),
            device_number,
            device_type: 0x01,
            mac_address: [0, 1, 2, 3, 4, 5],
            ip_address: Ipv4Addr::new(192, 168, 0, 2),
        }
    }

    #[test]
    fn seen_and_updated_events() {
        let mut registry = DeviceRegistry::new(Duration::from_millis(100));
        let now = Instant::now();

        let event = registry.observe_keep_alive(&keep_alive(1, "CDJ-1"), now);
        match event {
            Some(DeviceEvent::Seen(device)) => {
                assert_eq!(device.device_number, 1);
                assert_eq!(device.device_name, "CDJ-1");
            }
            other => panic!("expected Seen, got {:?}", other),
        }

        let event = registry.observe_keep_alive(&keep_alive(1, "CDJ-1B"), now);
        match event {
            Some(DeviceEvent::Updated(device)) => assert_eq!(device.device_name, "CDJ-1B"),
            other => panic!("expected Updated, got {:?}", other),
        }

        assert_eq!(registry.observe_keep_alive(&keep_alive(1, "CDJ-1B"), now), None);
    }

    #[test]
    fn traffic_sighting_creates_record() {
        let mut registry = DeviceRegistry::new(Duration::from_millis(100));
        let now = Instant::now();

        let event = registry.observe_traffic(3, "CDJ-3", None, now);
        assert!(matches!(event, Some(DeviceEvent::Seen(_))));
        assert_eq!(registry.active_devices().len(), 1);

        // Device number 0 means unknown and is never tracked.
        assert_eq!(registry.observe_traffic(0, "mystery", None, now), None);
    }

    #[test]
    fn expired_devices_pruned_then_erased() {
        let timeout = Duration::from_millis(100);
        let mut registry = DeviceRegistry::new(timeout);
        let now = Instant::now();

        registry.observe_keep_alive(&keep_alive(2, "CDJ-2"), now);
        assert_eq!(registry.active_devices().len(), 1);

        registry.set_last_seen(2, now - timeout - Duration::from_millis(1));
        let expired = registry.prune(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].device_number, 2);
        assert!(registry.active_devices().is_empty());
        assert_eq!(registry.record_count(), 1);

        registry.set_last_seen(2, now - timeout * 11);
        assert!(registry.prune(now).is_empty());
        assert_eq!(registry.record_count(), 0);
    }

    #[test]
    fn reappearing_device_is_seen_again() {
        let timeout = Duration::from_millis(100);
        let mut registry = DeviceRegistry::new(timeout);
        let now = Instant::now();

        registry.observe_keep_alive(&keep_alive(4, "CDJ-4"), now);
        registry.set_last_seen(4, now - timeout - Duration::from_millis(1));
        registry.prune(now);

        let event = registry.observe_keep_alive(&keep_alive(4, "CDJ-4"), now);
        assert!(matches!(event, Some(DeviceEvent::Seen(_))));
    }

    #[test]
    fn lookup_ip_uses_latest_sighting() {
        let mut registry = DeviceRegistry::new(Duration::from_millis(100));
        let now = Instant::now();

        registry.observe_keep_alive(&keep_alive(5, "CDJ-5"), now);
        assert_eq!(registry.lookup_ip(5), Some(Ipv4Addr::new(192, 168, 0, 2)));

        let moved = Ipv4Addr::new(192, 168, 0, 9);
        registry.observe_traffic(5, "CDJ-5", Some(moved), now);
        assert_eq!(registry.lookup_ip(5), Some(moved));
        assert_eq!(registry.lookup_ip(6), None);
    }
}
