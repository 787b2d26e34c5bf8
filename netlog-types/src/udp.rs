/// UDP header length in bytes.
pub const UDP_LEN: usize = 8;

/// Borrowed view of a UDP datagram. Only consulted on the VXLAN decap path.
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    buf: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < UDP_LEN {
            return None;
        }
        Some(Self { buf })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buf[UDP_LEN..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ports_and_payload() {
        let mut buf = vec![0u8; UDP_LEN];
        buf[0..2].copy_from_slice(&12345u16.to_be_bytes());
        buf[2..4].copy_from_slice(&4789u16.to_be_bytes());
        buf.extend_from_slice(&[0xAA; 3]);
        let udp = UdpDatagram::parse(&buf).unwrap();
        assert_eq!(udp.src_port(), 12345);
        assert_eq!(udp.dst_port(), 4789);
        assert_eq!(udp.payload(), &[0xAA; 3]);
    }
}
