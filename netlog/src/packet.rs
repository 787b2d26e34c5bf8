//! Frame decoding: link layer to TCP observation.
//!
//! Produces the oriented [`FlowKey`] and [`PacketObservation`] the tracker
//! consumes. Keys are always oriented from the local endpoint, so tx and rx
//! packets of one connection resolve to the same key. VXLAN-in-UDP frames
//! are unwrapped once and the inner TCP connection is tracked with the VNI
//! on its key; the inner frame inherits the outer frame's direction, since
//! inner MACs say nothing about this NIC.

use std::sync::Arc;

use netlog_types::{
    eth::{EthFrame, EtherType},
    ip::{IpProto, Ipv4Packet, Ipv6Packet},
    tcp::TcpSegment,
    udp::UdpDatagram,
    vxlan::{VxlanHdr, is_vxlan_port},
};

use crate::conn::key::{FlowKey, PacketDirection, PacketObservation};

/// One decoded TCP packet plus the payload slice for the L7 layer.
#[derive(Debug)]
pub struct Decoded<'a> {
    pub key: FlowKey,
    pub obs: PacketObservation,
    pub payload: &'a [u8],
    pub ipv6: bool,
}

/// Decode a captured frame down to its TCP segment, if it has one.
/// Non-TCP traffic (other than the VXLAN UDP envelope) is not tracked.
pub fn decode<'a>(
    data: &'a [u8],
    nic_mac: [u8; 6],
    netns: &Arc<str>,
    ts_nanos: i64,
) -> Option<Decoded<'a>> {
    let eth = EthFrame::parse(data)?;
    let direction = if eth.src_mac() == nic_mac {
        PacketDirection::Tx
    } else {
        PacketDirection::Rx
    };
    decode_eth(&eth, direction, netns, ts_nanos, None)
}

fn decode_eth<'a>(
    eth: &EthFrame<'a>,
    direction: PacketDirection,
    netns: &Arc<str>,
    ts_nanos: i64,
    vni: Option<u32>,
) -> Option<Decoded<'a>> {
    match eth.ether_type() {
        EtherType::Ipv4 => {
            let ip = Ipv4Packet::parse(eth.payload())?;
            decode_transport(
                ip.src_addr(),
                ip.dst_addr(),
                ip.protocol(),
                ip.payload(),
                eth,
                direction,
                netns,
                ts_nanos,
                vni,
                false,
            )
        }
        EtherType::Ipv6 => {
            let ip = Ipv6Packet::parse(eth.payload())?;
            decode_transport(
                ip.src_addr(),
                ip.dst_addr(),
                ip.next_header(),
                ip.payload(),
                eth,
                direction,
                netns,
                ts_nanos,
                vni,
                true,
            )
        }
        EtherType::Other(_) => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_transport<'a>(
    src_addr: std::net::IpAddr,
    dst_addr: std::net::IpAddr,
    proto: IpProto,
    payload: &'a [u8],
    eth: &EthFrame<'a>,
    direction: PacketDirection,
    netns: &Arc<str>,
    ts_nanos: i64,
    vni: Option<u32>,
    ipv6: bool,
) -> Option<Decoded<'a>> {
    match proto {
        IpProto::Tcp => {
            let tcp = TcpSegment::parse(payload)?;

            // Orient the key from the local endpoint.
            let (key_src, key_dst, key_sport, key_dport) = match direction {
                PacketDirection::Tx => (src_addr, dst_addr, tcp.src_port(), tcp.dst_port()),
                PacketDirection::Rx => (dst_addr, src_addr, tcp.dst_port(), tcp.src_port()),
            };

            let key = FlowKey {
                src_addr: key_src,
                dst_addr: key_dst,
                src_port: key_sport,
                dst_port: key_dport,
                transport: IpProto::Tcp,
                netns: Arc::clone(netns),
                vni: vni.unwrap_or(0),
                vxlan: vni.is_some(),
                reuse_epoch: 0,
            };
            let obs = PacketObservation {
                direction,
                seq: tcp.seq(),
                ack: tcp.ack(),
                flags: tcp.flags(),
                payload_len: tcp.payload().len() as u32,
                window: tcp.window(),
                window_scale: tcp.window_scale(),
                ts_nanos,
                src_mac: eth.src_mac(),
                dst_mac: eth.dst_mac(),
            };
            Some(Decoded {
                key,
                obs,
                payload: tcp.payload(),
                ipv6,
            })
        }
        IpProto::Udp if vni.is_none() => {
            let udp = UdpDatagram::parse(payload)?;
            if !is_vxlan_port(udp.src_port(), udp.dst_port()) {
                return None;
            }
            let vxlan = VxlanHdr::parse(udp.payload())?;
            if !vxlan.vni_present() {
                return None;
            }
            let inner = EthFrame::parse(vxlan.payload())?;
            decode_eth(&inner, direction, netns, ts_nanos, Some(vxlan.vni()))
        }
        _ => None,
    }
}
