/// TCP header length without options.
pub const TCP_LEN: usize = 20;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

/// Option kind for window scale (RFC 7323).
pub const TCP_OPT_WINDOW_SCALE: u8 = 3;

/// The flag byte of a TCP header, with named accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub fn fin(&self) -> bool {
        self.0 & TCP_FLAG_FIN != 0
    }

    pub fn syn(&self) -> bool {
        self.0 & TCP_FLAG_SYN != 0
    }

    pub fn rst(&self) -> bool {
        self.0 & TCP_FLAG_RST != 0
    }

    pub fn psh(&self) -> bool {
        self.0 & TCP_FLAG_PSH != 0
    }

    pub fn ack(&self) -> bool {
        self.0 & TCP_FLAG_ACK != 0
    }

    pub fn urg(&self) -> bool {
        self.0 & TCP_FLAG_URG != 0
    }

    /// SYN without ACK: the first packet of a client handshake.
    pub fn syn_only(&self) -> bool {
        self.syn() && !self.ack()
    }

    /// Lowercase dotted rendering used in exported records, e.g. "syn.ack".
    pub fn tags(&self) -> String {
        let mut out = Vec::new();
        for (bit, name) in [
            (TCP_FLAG_FIN, "fin"),
            (TCP_FLAG_SYN, "syn"),
            (TCP_FLAG_RST, "rst"),
            (TCP_FLAG_PSH, "psh"),
            (TCP_FLAG_ACK, "ack"),
            (TCP_FLAG_URG, "urg"),
        ] {
            if self.0 & bit != 0 {
                out.push(name);
            }
        }
        out.join(".")
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tags())
    }
}

/// Borrowed view of a TCP segment.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    buf: &'a [u8],
    header_len: usize,
}

impl<'a> TcpSegment<'a> {
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < TCP_LEN {
            return None;
        }
        let header_len = ((buf[12] >> 4) as usize) * 4;
        if header_len < TCP_LEN || buf.len() < header_len {
            return None;
        }
        Some(Self { buf, header_len })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn seq(&self) -> u32 {
        u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
    }

    pub fn ack(&self) -> u32 {
        u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]])
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags(self.buf[13])
    }

    pub fn window(&self) -> u16 {
        u16::from_be_bytes([self.buf[14], self.buf[15]])
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.header_len..]
    }

    /// Window scale shift from the options block, if advertised.
    /// Only meaningful on SYN segments.
    pub fn window_scale(&self) -> Option<u8> {
        let mut opts = &self.buf[TCP_LEN..self.header_len];
        while let Some((&kind, rest)) = opts.split_first() {
            match kind {
                0 => break,
                1 => opts = rest,
                TCP_OPT_WINDOW_SCALE => {
                    // kind, len=3, shift
                    if rest.len() >= 2 && rest[0] == 3 {
                        return Some(rest[1]);
                    }
                    return None;
                }
                _ => {
                    let len = *rest.first()? as usize;
                    if len < 2 || opts.len() < len {
                        return None;
                    }
                    opts = &opts[len..];
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(flags: u8, opts: &[u8], payload: &[u8]) -> Vec<u8> {
        let header_len = TCP_LEN + opts.len();
        assert_eq!(opts.len() % 4, 0);
        let mut buf = vec![0u8; header_len];
        buf[0..2].copy_from_slice(&443u16.to_be_bytes());
        buf[2..4].copy_from_slice(&51000u16.to_be_bytes());
        buf[4..8].copy_from_slice(&1000u32.to_be_bytes());
        buf[8..12].copy_from_slice(&2000u32.to_be_bytes());
        buf[12] = ((header_len / 4) as u8) << 4;
        buf[13] = flags;
        buf[14..16].copy_from_slice(&65535u16.to_be_bytes());
        buf[TCP_LEN..].copy_from_slice(opts);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parses_fields_and_payload() {
        let buf = segment(TCP_FLAG_PSH | TCP_FLAG_ACK, &[], b"hello");
        let tcp = TcpSegment::parse(&buf).unwrap();
        assert_eq!(tcp.src_port(), 443);
        assert_eq!(tcp.dst_port(), 51000);
        assert_eq!(tcp.seq(), 1000);
        assert_eq!(tcp.ack(), 2000);
        assert!(tcp.flags().psh() && tcp.flags().ack());
        assert_eq!(tcp.payload(), b"hello");
    }

    #[test]
    fn window_scale_from_syn_options() {
        // nop, window scale (kind 3, len 3, shift 7), end padding
        let buf = segment(TCP_FLAG_SYN, &[1, 3, 3, 7, 0, 0, 0, 0], &[]);
        let tcp = TcpSegment::parse(&buf).unwrap();
        assert_eq!(tcp.window_scale(), Some(7));
    }

    #[test]
    fn flag_tags() {
        assert_eq!(TcpFlags(TCP_FLAG_SYN | TCP_FLAG_ACK).tags(), "syn.ack");
        assert_eq!(TcpFlags(0).tags(), "");
        assert!(TcpFlags(TCP_FLAG_SYN).syn_only());
        assert!(!TcpFlags(TCP_FLAG_SYN | TCP_FLAG_ACK).syn_only());
    }

    #[test]
    fn rejects_short_header() {
        assert!(TcpSegment::parse(&[0u8; 19]).is_none());
    }
}
