use netlog_types::tcp::TcpFlags;

use crate::conn::{
    chunk::{Chunk, CHUNK_PACKET_CAP},
    key::{ConnDirection, PacketDirection, PacketObservation},
    seq::{SeqClass, SequenceTracker},
};

/// TCP connection phase inferred from observed flags and acks only.
/// Based on RFC 9293 section 3.3.2, restricted to what a passive observer
/// can actually distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpPhase {
    Unknown,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    /// Peer closed first; kept for completeness of the exported vocabulary.
    CloseWait,
    LastAck,
    TimeWait,
    Closed,
}

impl TcpPhase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TcpPhase::Unknown => "unknown",
            TcpPhase::SynSent => "syn_sent",
            TcpPhase::SynRcvd => "syn_rcvd",
            TcpPhase::Established => "established",
            TcpPhase::FinWait1 => "fin_wait_1",
            TcpPhase::FinWait2 => "fin_wait_2",
            TcpPhase::CloseWait => "close_wait",
            TcpPhase::LastAck => "last_ack",
            TcpPhase::TimeWait => "time_wait",
            TcpPhase::Closed => "closed",
        }
    }

    /// Position on the open→closed axis; transitions never move backwards.
    fn rank(&self) -> u8 {
        match self {
            TcpPhase::Unknown => 0,
            TcpPhase::SynSent => 1,
            TcpPhase::SynRcvd => 2,
            TcpPhase::Established => 3,
            TcpPhase::FinWait1 => 4,
            TcpPhase::FinWait2 => 5,
            TcpPhase::CloseWait => 5,
            TcpPhase::LastAck => 6,
            TcpPhase::TimeWait => 7,
            TcpPhase::Closed => 8,
        }
    }

    pub fn closed(&self) -> bool {
        matches!(self, TcpPhase::TimeWait | TcpPhase::Closed)
    }

    fn closing(&self) -> bool {
        self.rank() >= TcpPhase::FinWait1.rank() && !self.closed()
    }
}

/// Accumulated per-connection totals fed into the aggregators.
#[derive(Debug, Clone, Default)]
pub struct TcpMetrics {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_retransmits: u64,
    pub rx_retransmits: u64,
    /// Latch: the established transition has not yet been counted.
    pub established_pending: bool,
    /// Latch: the close transition has not yet been counted.
    pub closed_pending: bool,
    pub closed_recorded: bool,
    /// The RTT sample was already folded into an aggregate.
    pub rtt_reported: bool,
}

/// Outstanding RTT probe: the ack value that confirms receipt of the first
/// unambiguous data segment, and when that segment was sent.
#[derive(Debug, Clone, Copy)]
struct RttProbe {
    expected_ack: u32,
    sent_direction: PacketDirection,
    sent_ts: i64,
    /// A retransmission of the probed segment makes the sample ambiguous.
    spoiled: bool,
}

/// What one packet did to the connection; handed to the L7 trackers.
#[derive(Debug, Clone, Copy)]
pub struct PacketState {
    pub class: SeqClass,
    pub chunk_id: u32,
}

/// Full TCP-level state of one logical connection: the phase machine, a
/// sequence tracker per direction, the chunk series, and timing probes.
#[derive(Debug)]
pub struct ConnectionState {
    pub phase: TcpPhase,
    tx_seq: SequenceTracker,
    rx_seq: SequenceTracker,
    pub chunks: Vec<Chunk>,
    next_chunk_id: u32,
    chunk_cap: u32,
    pub metrics: TcpMetrics,

    pub syn_seq: u32,
    pub syn_ack_seq: u32,
    pub syn_retransmits: u32,
    /// Direction the first SYN travelled in; basis for client/server
    /// inference when no better signal exists.
    pub syn_direction: Option<PacketDirection>,

    /// [syn ts, handshake-complete ts, first fin ts, close-complete ts]
    pub synfin_ts: [i64; 4],

    /// End sequence of the first and second FIN, +1 for the FIN itself.
    fin_expected_ack: [Option<u32>; 2],
    fin_direction: Option<PacketDirection>,

    pub rtt_nanos: i64,
    rtt_probe: Option<RttProbe>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::with_chunk_cap(CHUNK_PACKET_CAP)
    }

    pub fn with_chunk_cap(chunk_cap: u32) -> Self {
        Self {
            phase: TcpPhase::Unknown,
            tx_seq: SequenceTracker::new(),
            rx_seq: SequenceTracker::new(),
            chunks: vec![Chunk::new(0)],
            next_chunk_id: 1,
            chunk_cap,
            metrics: TcpMetrics::default(),
            syn_seq: 0,
            syn_ack_seq: 0,
            syn_retransmits: 0,
            syn_direction: None,
            synfin_ts: [0; 4],
            fin_expected_ack: [None, None],
            fin_direction: None,
            rtt_nanos: 0,
            rtt_probe: None,
        }
    }

    /// Cost of the 3-way handshake in nanoseconds, when both ends were seen.
    pub fn handshake_cost(&self) -> Option<i64> {
        let (s0, s1) = (self.synfin_ts[0], self.synfin_ts[1]);
        (s0 != 0 && s1 > s0).then(|| s1 - s0)
    }

    /// Cost of the close handshake in nanoseconds.
    pub fn close_cost(&self) -> Option<i64> {
        let (f0, f1) = (self.synfin_ts[2], self.synfin_ts[3]);
        (f0 != 0 && f1 > f0).then(|| f1 - f0)
    }

    pub fn current_chunk(&self) -> &Chunk {
        self.chunks.last().expect("chunk list never empty")
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        self.chunks.last_mut().expect("chunk list never empty")
    }

    fn rotate_chunk(&mut self) {
        let id = self.next_chunk_id;
        self.next_chunk_id += 1;
        self.chunks.push(Chunk::new(id));
    }

    /// Surrender chunks ready for export. Rotated-out chunks always go; the
    /// newest goes too when `include_last` is set or it has sat idle past
    /// `stale_nanos`. The list is left holding at least one open chunk.
    pub fn take_chunks(&mut self, include_last: bool, now: i64, stale_nanos: i64) -> Vec<Chunk> {
        let n = self.chunks.len();
        let mut take = n.saturating_sub(1);
        if include_last {
            take = n;
        } else if let Some(last) = self.chunks.last() {
            if !last.is_empty() && now.saturating_sub(last.last_ts) > stale_nanos {
                take = n;
            }
        }
        let mut out: Vec<Chunk> = self.chunks.drain(..take).collect();
        out.retain(|c| !c.is_empty());
        if self.chunks.is_empty() {
            self.rotate_chunk();
        }
        out
    }

    /// Process one captured packet: classify it against the per-direction
    /// history, advance the phase machine, maintain chunk boundaries and the
    /// RTT probe. Returns what the L7 trackers need to attribute the packet.
    pub fn observe(&mut self, obs: &PacketObservation) -> PacketState {
        let flags = obs.flags;
        let len = obs.payload_len;

        let mut class = match obs.direction {
            PacketDirection::Tx => self.tx_seq.insert(obs.seq, len, obs.ack),
            PacketDirection::Rx => self.rx_seq.insert(obs.seq, len, obs.ack),
        };

        // Repeated handshake segments never advance the phase; they only
        // bump the retransmit counter, and for chunk accounting they are
        // retransmissions even though they carry no payload.
        let repeated_syn = flags.syn()
            && matches!(self.phase, TcpPhase::SynSent | TcpPhase::SynRcvd)
            && ((flags.ack() && self.phase == TcpPhase::SynRcvd)
                || (!flags.ack() && obs.seq == self.syn_seq));
        if repeated_syn {
            self.syn_retransmits += 1;
            class = SeqClass::Retransmit;
        }

        self.advance_phase(obs, class, repeated_syn);
        self.track_rtt(obs, class);

        // SYN/FIN/RST crossing forces a boundary so the handshake and close
        // land in their own chunks.
        let boundary = flags.syn() || flags.fin() || flags.rst();
        let fin_pending = self.phase.closing();
        if !self.current_chunk().is_empty()
            && (self.current_chunk().at_capacity(self.chunk_cap, fin_pending)
                || (boundary && !repeated_syn && !self.boundary_open(flags)))
        {
            self.rotate_chunk();
        }

        self.current_chunk_mut().record(
            obs.direction,
            obs.seq,
            obs.ack,
            len,
            flags,
            obs.ts_nanos,
            class,
        );

        let retransmit = class == SeqClass::Retransmit;
        let new_bytes = if class == SeqClass::NewData { len as u64 } else { 0 };
        match obs.direction {
            PacketDirection::Tx => {
                self.metrics.tx_packets += 1;
                self.metrics.tx_bytes += new_bytes;
                if retransmit {
                    self.metrics.tx_retransmits += 1;
                }
            }
            PacketDirection::Rx => {
                self.metrics.rx_packets += 1;
                self.metrics.rx_bytes += new_bytes;
                if retransmit {
                    self.metrics.rx_retransmits += 1;
                }
            }
        }

        PacketState {
            class,
            chunk_id: self.current_chunk().id,
        }
    }

    /// True when the current chunk already carries the boundary kind this
    /// packet would open, e.g. the SYN/ACK belongs in the SYN's chunk.
    fn boundary_open(&self, flags: TcpFlags) -> bool {
        let chunk = self.current_chunk();
        (flags.syn() && chunk.has_syn) || (flags.fin() && chunk.has_fin)
    }

    fn advance_phase(&mut self, obs: &PacketObservation, class: SeqClass, repeated_syn: bool) {
        let flags = obs.flags;

        if flags.rst() {
            self.set_phase(TcpPhase::Closed);
            return;
        }
        if repeated_syn || class == SeqClass::Retransmit {
            return;
        }

        if flags.syn() && !flags.ack() {
            if self.phase == TcpPhase::Unknown {
                self.syn_seq = obs.seq;
                self.syn_direction = Some(obs.direction);
                self.synfin_ts[0] = obs.ts_nanos;
                self.set_phase(TcpPhase::SynSent);
            }
            return;
        }

        if flags.syn() && flags.ack() {
            if matches!(self.phase, TcpPhase::Unknown | TcpPhase::SynSent) {
                self.syn_ack_seq = obs.seq;
                self.set_phase(TcpPhase::SynRcvd);
            }
            return;
        }

        if flags.fin() {
            match self.fin_direction {
                None => {
                    self.fin_direction = Some(obs.direction);
                    self.fin_expected_ack[0] =
                        Some(obs.seq.wrapping_add(obs.payload_len).wrapping_add(1));
                    self.synfin_ts[2] = obs.ts_nanos;
                    self.set_phase(TcpPhase::FinWait1);
                }
                Some(first_dir) if first_dir != obs.direction => {
                    self.fin_expected_ack[1] =
                        Some(obs.seq.wrapping_add(obs.payload_len).wrapping_add(1));
                    self.set_phase(TcpPhase::LastAck);
                }
                Some(_) => {}
            }
            return;
        }

        if flags.ack() {
            if obs.payload_len > 0 {
                // Data before any observed handshake: the capture started
                // mid-connection.
                if matches!(self.phase, TcpPhase::Unknown | TcpPhase::SynRcvd) {
                    if self.phase == TcpPhase::SynRcvd {
                        self.synfin_ts[1] = obs.ts_nanos;
                    }
                    self.set_phase(TcpPhase::Established);
                }
                return;
            }

            match self.phase {
                TcpPhase::SynRcvd => {
                    self.synfin_ts[1] = obs.ts_nanos;
                    self.set_phase(TcpPhase::Established);
                }
                TcpPhase::FinWait1 => {
                    if self.fin_expected_ack[0] == Some(obs.ack) {
                        self.set_phase(TcpPhase::FinWait2);
                    }
                }
                TcpPhase::FinWait2 | TcpPhase::LastAck => {
                    if self.fin_expected_ack[1] == Some(obs.ack) {
                        self.synfin_ts[3] = obs.ts_nanos;
                        self.set_phase(TcpPhase::TimeWait);
                    }
                }
                _ => {}
            }
        }
    }

    fn set_phase(&mut self, next: TcpPhase) {
        if next.rank() < self.phase.rank() {
            return;
        }
        if next == self.phase {
            return;
        }
        if next == TcpPhase::Established && self.phase.rank() < TcpPhase::Established.rank() {
            self.metrics.established_pending = true;
        }
        if next.closed() && !self.metrics.closed_recorded {
            self.metrics.closed_pending = true;
            self.metrics.closed_recorded = true;
        }
        self.phase = next;
    }

    fn track_rtt(&mut self, obs: &PacketObservation, class: SeqClass) {
        if self.rtt_nanos != 0 {
            return;
        }

        if let Some(probe) = &mut self.rtt_probe {
            if class == SeqClass::Retransmit {
                // A retransmission of probed data makes the echo ambiguous.
                probe.spoiled = true;
                return;
            }
            if obs.direction != probe.sent_direction && obs.ack == probe.expected_ack {
                if !probe.spoiled {
                    self.rtt_nanos = obs.ts_nanos - probe.sent_ts;
                } else {
                    self.rtt_probe = None;
                }
                return;
            }
        }

        if self.rtt_probe.is_none() && obs.payload_len > 0 && class == SeqClass::NewData {
            self.rtt_probe = Some(RttProbe {
                expected_ack: obs.seq.wrapping_add(obs.payload_len),
                sent_direction: obs.direction,
                sent_ts: obs.ts_nanos,
                spoiled: false,
            });
        }
    }
}
