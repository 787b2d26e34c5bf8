//! Header views over raw captured frames.
//!
//! Every type in this crate borrows the capture buffer and validates lengths
//! up front, so accessors never panic on truncated input. Nothing here keeps
//! per-connection state; that lives in the `netlog` crate.

pub mod eth;
pub mod ip;
pub mod tcp;
pub mod udp;
pub mod vxlan;

/// Format a MAC address the way `ip link` prints it.
pub fn fmt_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_formatting() {
        assert_eq!(
            fmt_mac(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
            "de:ad:be:ef:00:01"
        );
    }
}
