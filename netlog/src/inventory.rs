//! Capture-interface inventory built on `pnet::datalink`.

use std::{net::IpAddr, sync::Arc};

use pnet::datalink::{self, MacAddr, NetworkInterface};

/// Facts about one capturable NIC.
#[derive(Debug, Clone)]
pub struct NicInfo {
    pub name: String,
    pub index: u32,
    pub mac: Option<MacAddr>,
    pub addrs: Vec<IpAddr>,
    /// Namespace label attached to every record from this NIC.
    pub netns: Arc<str>,
}

impl NicInfo {
    fn from_interface(iface: &NetworkInterface, netns: &Arc<str>) -> Self {
        Self {
            name: iface.name.clone(),
            index: iface.index,
            mac: iface.mac,
            addrs: iface.ips.iter().map(|net| net.ip()).collect(),
            netns: Arc::clone(netns),
        }
    }

    pub fn mac_octets(&self) -> [u8; 6] {
        match self.mac {
            Some(mac) => [mac.0, mac.1, mac.2, mac.3, mac.4, mac.5],
            None => [0; 6],
        }
    }
}

/// All host interfaces, as the capture layer sees them.
pub fn interfaces(netns: &Arc<str>) -> Vec<NicInfo> {
    datalink::interfaces()
        .iter()
        .map(|iface| NicInfo::from_interface(iface, netns))
        .collect()
}

/// The underlying pnet interface, needed to open a capture channel.
pub fn resolve(name: &str) -> Option<NetworkInterface> {
    datalink::interfaces().into_iter().find(|i| i.name == name)
}
