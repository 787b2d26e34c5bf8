/// Ethernet II header length in bytes (no 802.1Q tag).
pub const ETH_LEN: usize = 14;

/// EtherType values relevant to the capture path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Ipv6,
    Other(u16),
}

impl EtherType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            0x0800 => EtherType::Ipv4,
            0x86DD => EtherType::Ipv6,
            other => EtherType::Other(other),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            EtherType::Ipv4 => "ipv4",
            EtherType::Ipv6 => "ipv6",
            EtherType::Other(_) => "other",
        }
    }
}

/// Borrowed view of an Ethernet II frame.
#[derive(Debug, Clone, Copy)]
pub struct EthFrame<'a> {
    buf: &'a [u8],
}

impl<'a> EthFrame<'a> {
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < ETH_LEN {
            return None;
        }
        Some(Self { buf })
    }

    pub fn dst_mac(&self) -> [u8; 6] {
        self.buf[0..6].try_into().unwrap()
    }

    pub fn src_mac(&self) -> [u8; 6] {
        self.buf[6..12].try_into().unwrap()
    }

    pub fn ether_type(&self) -> EtherType {
        EtherType::from_u16(u16::from_be_bytes([self.buf[12], self.buf[13]]))
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buf[ETH_LEN..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_frame() {
        let mut frame = vec![0u8; 20];
        frame[0..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        frame[6..12].copy_from_slice(&[7, 8, 9, 10, 11, 12]);
        frame[12] = 0x08;
        frame[13] = 0x00;
        let eth = EthFrame::parse(&frame).unwrap();
        assert_eq!(eth.dst_mac(), [1, 2, 3, 4, 5, 6]);
        assert_eq!(eth.src_mac(), [7, 8, 9, 10, 11, 12]);
        assert_eq!(eth.ether_type(), EtherType::Ipv4);
        assert_eq!(eth.payload().len(), 6);
    }

    #[test]
    fn rejects_truncated_frame() {
        assert!(EthFrame::parse(&[0u8; 13]).is_none());
    }
}
