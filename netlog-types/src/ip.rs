use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IPv6 fixed header length in bytes.
pub const IPV6_LEN: usize = 40;

/// IP protocol numbers carried in the IPv4 `protocol` / IPv6 `next header`
/// field. Only the values the capture filter lets through are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProto {
    Tcp,
    Udp,
    Other(u8),
}

impl IpProto {
    pub fn from_u8(v: u8) -> Self {
        match v {
            6 => IpProto::Tcp,
            17 => IpProto::Udp,
            other => IpProto::Other(other),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            IpProto::Tcp => "tcp",
            IpProto::Udp => "udp",
            IpProto::Other(_) => "other",
        }
    }
}

impl std::fmt::Display for IpProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Borrowed view of an IPv4 header and the bytes that follow it.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    buf: &'a [u8],
    header_len: usize,
}

impl<'a> Ipv4Packet<'a> {
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < 20 || buf[0] >> 4 != 4 {
            return None;
        }
        let header_len = ((buf[0] & 0x0F) as usize) * 4;
        if header_len < 20 || buf.len() < header_len {
            return None;
        }
        Some(Self { buf, header_len })
    }

    pub fn src_addr(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(
            self.buf[12],
            self.buf[13],
            self.buf[14],
            self.buf[15],
        ))
    }

    pub fn dst_addr(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(
            self.buf[16],
            self.buf[17],
            self.buf[18],
            self.buf[19],
        ))
    }

    pub fn protocol(&self) -> IpProto {
        IpProto::from_u8(self.buf[9])
    }

    /// Total length from the header; used instead of the capture length so
    /// that Ethernet padding on short frames is not counted as payload.
    pub fn total_len(&self) -> usize {
        u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn payload(&self) -> &'a [u8] {
        let end = self.total_len().min(self.buf.len());
        &self.buf[self.header_len..end.max(self.header_len)]
    }
}

/// Borrowed view of an IPv6 fixed header. Extension headers are not walked;
/// the capture filter only admits plain TCP and VXLAN-encapsulated TCP.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Packet<'a> {
    buf: &'a [u8],
}

impl<'a> Ipv6Packet<'a> {
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < IPV6_LEN || buf[0] >> 4 != 6 {
            return None;
        }
        Some(Self { buf })
    }

    pub fn src_addr(&self) -> IpAddr {
        let octets: [u8; 16] = self.buf[8..24].try_into().unwrap();
        IpAddr::V6(Ipv6Addr::from(octets))
    }

    pub fn dst_addr(&self) -> IpAddr {
        let octets: [u8; 16] = self.buf[24..40].try_into().unwrap();
        IpAddr::V6(Ipv6Addr::from(octets))
    }

    pub fn next_header(&self) -> IpProto {
        IpProto::from_u8(self.buf[6])
    }

    /// Payload length field (bytes after the fixed header).
    pub fn payload_len(&self) -> usize {
        u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize
    }

    pub fn payload(&self) -> &'a [u8] {
        let end = (IPV6_LEN + self.payload_len()).min(self.buf.len());
        &self.buf[IPV6_LEN..end]
    }
}
