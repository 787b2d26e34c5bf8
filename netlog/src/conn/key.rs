use std::{net::IpAddr, sync::Arc};

use netlog_types::ip::IpProto;

/// Which way a captured packet travelled relative to the monitored NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx,
    Rx,
}

impl PacketDirection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PacketDirection::Tx => "tx",
            PacketDirection::Rx => "rx",
        }
    }
}

/// Client/server role of the local endpoint for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnDirection {
    #[default]
    Unknown,
    /// The local endpoint accepted the connection.
    Incoming,
    /// The local endpoint initiated the connection.
    Outgoing,
}

impl ConnDirection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnDirection::Unknown => "unknown",
            ConnDirection::Incoming => "incoming",
            ConnDirection::Outgoing => "outgoing",
        }
    }
}

/// Identity of one logical connection.
///
/// The 4-tuple is always oriented from the local endpoint (src = local side),
/// so tx and rx packets of the same connection map to the same key.
/// `reuse_epoch` disambiguates a 4-tuple that is reused while its previous
/// occupant is still lingering; it is 0 for a first-generation connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: IpProto,
    /// Network namespace the capture socket lives in.
    pub netns: Arc<str>,
    /// VXLAN network identifier, 0 when not encapsulated.
    pub vni: u32,
    pub vxlan: bool,
    pub reuse_epoch: u64,
}

impl FlowKey {
    /// Same key with a different generation counter.
    pub fn with_epoch(&self, epoch: u64) -> Self {
        let mut key = self.clone();
        key.reuse_epoch = epoch;
        key
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}/{}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port, self.transport
        )
    }
}

/// One captured packet as seen by the connection state machine.
/// Built once by the decoder and never mutated.
#[derive(Debug, Clone)]
pub struct PacketObservation {
    pub direction: PacketDirection,
    pub seq: u32,
    pub ack: u32,
    pub flags: netlog_types::tcp::TcpFlags,
    pub payload_len: u32,
    pub window: u16,
    pub window_scale: Option<u8>,
    pub ts_nanos: i64,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            src_port: 41000,
            dst_port: 80,
            transport: IpProto::Tcp,
            netns: Arc::from("default"),
            vni: 0,
            vxlan: false,
            reuse_epoch: 0,
        }
    }

    #[test]
    fn epoch_distinguishes_generations() {
        let a = key();
        let b = a.with_epoch(3);
        assert_ne!(a, b);
        assert_eq!(a, b.with_epoch(0));
    }
}
