//! IPv4 interface discovery for filling announce fields.

use std::net::Ipv4Addr;

use anyhow::anyhow;
use mac_address::mac_address_by_name;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig, V4IfAddr};

use crate::Result;

/// Addresses of a local IPv4 interface suitable for announcing.
#[derive(Clone, Debug)]
pub struct InterfaceInfo {
    pub name: String,
    pub ip: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub mac_address: [u8; 6],
}

fn ipv4_iface(iface: &NetworkInterface) -> Option<(String, V4IfAddr)> {
    if let Some(addr) = iface.addr {
        match addr {
            Addr::V4(a) => Some((iface.name.clone(), a)),
            _ => None,
        }
    } else {
        None
    }
}

/// Find a broadcast-capable IPv4 interface, by name when one is given.
pub fn find_ipv4_interface(name: Option<&str>) -> Result<InterfaceInfo> {
    let all_interfaces =
        NetworkInterface::show().map_err(|e| anyhow!("can't get network interfaces: {}", e))?;
    let mut candidates = all_interfaces.iter().filter_map(ipv4_iface);

    let (iface_name, addr) = candidates
        .find(|(iface_name, addr)| match name {
            Some(wanted) => iface_name.as_str() == wanted,
            None => !addr.ip.is_loopback() && addr.broadcast.is_some(),
        })
        .ok_or_else(|| anyhow!("no usable IPv4 interface found"))?;

    let broadcast = addr
        .broadcast
        .ok_or_else(|| anyhow!("interface \"{}\" has no broadcast address", iface_name))?;
    let mac = mac_address_by_name(&iface_name)
        .map_err(|e| anyhow!("failed to look up mac address: {}", e))?
        .ok_or_else(|| anyhow!("failed to look up mac address"))?;

    Ok(InterfaceInfo {
        name: iface_name,
        ip: addr.ip,
        broadcast,
        mac_address: mac.bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_name_errors() {
        assert!(find_ipv4_interface(Some("no-such-iface-0")).is_err());
    }
}
