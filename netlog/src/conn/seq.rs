use std::collections::VecDeque;

/// Per-direction history depth. On overflow the oldest half is dropped so
/// late retransmissions of very old data stop being classifiable rather than
/// growing the history without bound.
pub const SEQ_HISTORY_CAP: usize = 128;

/// Classification of one observed segment against the direction's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqClass {
    NewData,
    Retransmit,
    Keepalive,
}

/// One remembered segment. Only bookkeeping, never payload.
#[derive(Debug, Clone, Copy)]
pub struct SeqRecord {
    pub seq: u32,
    pub len: u32,
    pub ack: u32,
    /// Set when `seq + len` overflowed u32, i.e. this record straddles the
    /// sequence-number wrap point.
    pub wrapped: bool,
}

impl SeqRecord {
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.len)
    }
}

/// True when `a` precedes `b` in wraparound-aware sequence order.
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Bounded history of recent (seq, len, ack) triples for one direction.
///
/// Classifies each observed segment as new data, a retransmission, or a
/// keepalive, from sequence numbers alone. There is no reassembly: a segment
/// that does not match any remembered record is simply new data.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    history: VecDeque<SeqRecord>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Sequence value the peer is expected to echo for the most recent data,
    /// i.e. `seq + len` of the newest record. Used for ACK-echo timing.
    pub fn last_end(&self) -> Option<u32> {
        self.history.back().map(|r| r.end())
    }

    /// Observe one segment and classify it.
    ///
    /// The history is scanned backwards (newest first): a zero-length segment
    /// sitting one byte before a record's next-expected sequence with the
    /// same ack is a keepalive probe; an identical (seq, ack, len) triple is
    /// a retransmission; a segment contiguously extending a prior record is
    /// new data inserted right after it, which keeps reordered arrivals in
    /// sequence order. Anything else lands at the tail as new data.
    pub fn insert(&mut self, seq: u32, len: u32, ack: u32) -> SeqClass {
        if len == 0 {
            // Zero-length segments are never remembered; they are either a
            // keepalive probe one byte left of next-expected, or plain acks.
            for rec in self.history.iter().rev() {
                if rec.ack == ack && rec.end() == seq.wrapping_add(1) {
                    return SeqClass::Keepalive;
                }
            }
            return SeqClass::NewData;
        }

        let wrapped = seq.wrapping_add(len) < seq;
        let elem = SeqRecord {
            seq,
            len,
            ack,
            wrapped,
        };

        let mut insert_at: Option<usize> = None;
        for idx in (0..self.history.len()).rev() {
            let rec = self.history[idx];

            if rec.seq == seq && rec.ack == ack && rec.len == len {
                return SeqClass::Retransmit;
            }

            if rec.end() == seq {
                // Contiguous extension of an older record: a reordered
                // arrival that belongs right after it.
                insert_at = Some(idx + 1);
                break;
            }

            // Stop scanning once records are clearly older than the new
            // element; the comparison differs between wrapped and unwrapped
            // regions and the asymmetry is deliberate.
            if rec.wrapped || wrapped {
                if seq_before(rec.end(), seq) {
                    break;
                }
            } else if rec.end() < seq {
                break;
            }
        }

        match insert_at {
            Some(idx) if idx < self.history.len() => self.history.insert(idx, elem),
            _ => self.history.push_back(elem),
        }

        if self.history.len() > SEQ_HISTORY_CAP {
            self.history.drain(..SEQ_HISTORY_CAP / 2);
        }

        SeqClass::NewData
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_segment_is_new_data() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.insert(100, 10, 20), SeqClass::NewData);
        assert_eq!(t.last_end(), Some(110));
    }

    #[test]
    fn identical_triple_is_retransmit() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.insert(100, 10, 20), SeqClass::NewData);
        assert_eq!(t.insert(100, 10, 20), SeqClass::Retransmit);
        // Only the original is remembered.
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn zero_length_probe_is_keepalive() {
        let mut t = SequenceTracker::new();
        t.insert(100, 10, 20);
        // next expected is 110; a zero-length probe at 109 with same ack
        assert_eq!(t.insert(109, 0, 20), SeqClass::Keepalive);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn contiguous_extension_is_new_data() {
        let mut t = SequenceTracker::new();
        t.insert(100, 10, 20);
        assert_eq!(t.insert(110, 5, 20), SeqClass::NewData);
        assert_eq!(t.last_end(), Some(115));
    }

    #[test]
    fn reordered_arrival_inserted_after_its_predecessor() {
        let mut t = SequenceTracker::new();
        t.insert(100, 10, 20);
        t.insert(120, 10, 20); // hole at 110..120
        assert_eq!(t.insert(110, 10, 20), SeqClass::NewData);
        // The middle segment must now be adjacent to its predecessor, so a
        // retransmit of it is still recognized.
        assert_eq!(t.insert(110, 10, 20), SeqClass::Retransmit);
    }

    #[test]
    fn wraparound_tagged_and_ordered() {
        let mut t = SequenceTracker::new();
        let near_wrap = u32::MAX - 4;
        assert_eq!(t.insert(near_wrap, 10, 1), SeqClass::NewData); // wraps
        // Continuation after the wrap point.
        assert_eq!(t.insert(near_wrap.wrapping_add(10), 10, 1), SeqClass::NewData);
        assert_eq!(t.last_end(), Some(15));
        // Retransmit of the wrapped segment still detected.
        assert_eq!(t.insert(near_wrap, 10, 1), SeqClass::Retransmit);
    }

    #[test]
    fn history_bounded_by_cap() {
        let mut t = SequenceTracker::new();
        for i in 0..(SEQ_HISTORY_CAP as u32 + 40) {
            t.insert(i * 10, 10, 0);
        }
        assert!(t.len() <= SEQ_HISTORY_CAP);
        // Oldest half was dropped, so an ancient retransmit reads as new.
        assert_eq!(t.insert(0, 10, 0), SeqClass::NewData);
    }
}
