use netlog_types::tcp::TcpFlags;

use crate::conn::{
    key::PacketDirection,
    seq::SeqClass,
};

/// Default packets per chunk before a boundary is forced.
pub const CHUNK_PACKET_CAP: u32 = 256;

/// Extra packets tolerated past the cap while a FIN close is in progress,
/// so the close handshake lands in the same chunk as the data it ends.
pub const CHUNK_FIN_GRACE: u32 = 64;

/// A bounded run of packets for one connection: the unit of raw TCP-record
/// export. Carries only counters and seq/ack ranges, never payload.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: u32,
    pub tx_packets: u32,
    pub rx_packets: u32,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_retransmits: u32,
    pub rx_retransmits: u32,
    pub syn_retransmits: u32,
    /// min/max observed per direction; None until the first packet.
    pub tx_seq: Option<(u32, u32)>,
    pub rx_seq: Option<(u32, u32)>,
    pub tx_ack: Option<(u32, u32)>,
    pub rx_ack: Option<(u32, u32)>,
    pub has_syn: bool,
    pub has_fin: bool,
    pub has_rst: bool,
    pub first_ts: i64,
    pub last_ts: i64,
}

impl Chunk {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            tx_packets: 0,
            rx_packets: 0,
            tx_bytes: 0,
            rx_bytes: 0,
            tx_retransmits: 0,
            rx_retransmits: 0,
            syn_retransmits: 0,
            tx_seq: None,
            rx_seq: None,
            tx_ack: None,
            rx_ack: None,
            has_syn: false,
            has_fin: false,
            has_rst: false,
            first_ts: 0,
            last_ts: 0,
        }
    }

    pub fn packet_count(&self) -> u32 {
        self.tx_packets + self.rx_packets
    }

    pub fn is_empty(&self) -> bool {
        self.packet_count() == 0
    }

    /// Whether the chunk must be closed before accepting another packet.
    /// The cap is deferred by a bounded grace while a FIN close is pending.
    pub fn at_capacity(&self, cap: u32, fin_pending: bool) -> bool {
        let cap = if fin_pending {
            cap + CHUNK_FIN_GRACE
        } else {
            cap
        };
        self.packet_count() >= cap
    }

    /// Fold one classified packet into the chunk counters. Retransmissions
    /// and keepalives count as packets but never as bytes, so byte totals
    /// reflect distinct data only.
    pub fn record(
        &mut self,
        direction: PacketDirection,
        seq: u32,
        ack: u32,
        payload_len: u32,
        flags: TcpFlags,
        ts_nanos: i64,
        class: SeqClass,
    ) {
        if self.first_ts == 0 {
            self.first_ts = ts_nanos;
        }
        self.last_ts = ts_nanos;

        if flags.syn() {
            self.has_syn = true;
        }
        if flags.fin() {
            self.has_fin = true;
        }
        if flags.rst() {
            self.has_rst = true;
        }

        let new_bytes = match class {
            SeqClass::NewData => payload_len as u64,
            SeqClass::Retransmit | SeqClass::Keepalive => 0,
        };
        let retransmit = class == SeqClass::Retransmit;

        match direction {
            PacketDirection::Tx => {
                self.tx_packets += 1;
                self.tx_bytes += new_bytes;
                if retransmit {
                    self.tx_retransmits += 1;
                }
                widen(&mut self.tx_seq, seq);
                widen(&mut self.tx_ack, ack);
            }
            PacketDirection::Rx => {
                self.rx_packets += 1;
                self.rx_bytes += new_bytes;
                if retransmit {
                    self.rx_retransmits += 1;
                }
                widen(&mut self.rx_seq, seq);
                widen(&mut self.rx_ack, ack);
            }
        }

        if retransmit && flags.syn() {
            self.syn_retransmits += 1;
        }
    }
}

fn widen(range: &mut Option<(u32, u32)>, v: u32) {
    *range = Some(match *range {
        None => (v, v),
        Some((lo, hi)) => (lo.min(v), hi.max(v)),
    });
}

#[cfg(test)]
mod tests {
    use netlog_types::tcp::{TCP_FLAG_ACK, TCP_FLAG_SYN};

    use super::*;

    #[test]
    fn retransmit_counts_packets_not_bytes() {
        let mut c = Chunk::new(0);
        c.record(
            PacketDirection::Tx,
            100,
            20,
            10,
            TcpFlags(TCP_FLAG_ACK),
            1,
            SeqClass::NewData,
        );
        c.record(
            PacketDirection::Tx,
            100,
            20,
            10,
            TcpFlags(TCP_FLAG_ACK),
            2,
            SeqClass::Retransmit,
        );
        assert_eq!(c.tx_packets, 2);
        assert_eq!(c.tx_bytes, 10);
        assert_eq!(c.tx_retransmits, 1);
    }

    #[test]
    fn seq_ranges_widen() {
        let mut c = Chunk::new(0);
        c.record(
            PacketDirection::Rx,
            500,
            1,
            10,
            TcpFlags(TCP_FLAG_ACK),
            1,
            SeqClass::NewData,
        );
        c.record(
            PacketDirection::Rx,
            300,
            1,
            10,
            TcpFlags(TCP_FLAG_ACK),
            2,
            SeqClass::NewData,
        );
        assert_eq!(c.rx_seq, Some((300, 500)));
    }

    #[test]
    fn fin_grace_extends_cap() {
        let mut c = Chunk::new(0);
        for i in 0..CHUNK_PACKET_CAP {
            c.record(
                PacketDirection::Tx,
                i,
                0,
                0,
                TcpFlags(TCP_FLAG_ACK),
                i as i64,
                SeqClass::NewData,
            );
        }
        assert!(c.at_capacity(CHUNK_PACKET_CAP, false));
        assert!(!c.at_capacity(CHUNK_PACKET_CAP, true));
    }

    #[test]
    fn syn_retransmit_tallied() {
        let mut c = Chunk::new(0);
        c.record(
            PacketDirection::Tx,
            0,
            0,
            0,
            TcpFlags(TCP_FLAG_SYN),
            1,
            SeqClass::NewData,
        );
        c.record(
            PacketDirection::Tx,
            0,
            0,
            0,
            TcpFlags(TCP_FLAG_SYN),
            2,
            SeqClass::Retransmit,
        );
        assert!(c.has_syn);
        assert_eq!(c.syn_retransmits, 1);
    }
}
