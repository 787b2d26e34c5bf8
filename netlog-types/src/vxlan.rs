/// VXLAN header length in bytes (RFC 7348).
pub const VXLAN_LEN: usize = 8;

/// IANA-assigned VXLAN UDP port. The Linux default of 8472 predates the
/// assignment and is still what flannel/OVS use, so both are recognized.
pub const VXLAN_PORT: u16 = 4789;
pub const VXLAN_PORT_LINUX: u16 = 8472;

/// Mask for the I flag (VNI present) in the first header byte.
pub const VXLAN_I_FLAG_MASK: u8 = 0x08;

/// Returns true when a UDP port pair looks like VXLAN encapsulation.
pub fn is_vxlan_port(src_port: u16, dst_port: u16) -> bool {
    matches!(src_port, VXLAN_PORT | VXLAN_PORT_LINUX)
        || matches!(dst_port, VXLAN_PORT | VXLAN_PORT_LINUX)
}

/// Borrowed view of a VXLAN header.
#[derive(Debug, Clone, Copy)]
pub struct VxlanHdr<'a> {
    buf: &'a [u8],
}

impl<'a> VxlanHdr<'a> {
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < VXLAN_LEN {
            return None;
        }
        Some(Self { buf })
    }

    pub fn vni_present(&self) -> bool {
        self.buf[0] & VXLAN_I_FLAG_MASK != 0
    }

    /// The 24-bit VXLAN network identifier.
    pub fn vni(&self) -> u32 {
        u32::from_be_bytes([0, self.buf[4], self.buf[5], self.buf[6]])
    }

    /// The encapsulated Ethernet frame.
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[VXLAN_LEN..]
    }
}
