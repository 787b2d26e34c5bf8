use std::collections::VecDeque;

use fxhash::FxHashMap;
use tracing::debug;

use crate::{
    conn::{key::FlowKey, state::ConnectionState},
    http::L7Tracker,
};

/// A new shard is opened once the newest one is this old, so eviction can
/// drop whole generations of maps instead of rehashing in place.
pub const SHARD_ROTATION_NANOS: i64 = 20 * 1_000_000_000;

/// A shard whose live/inserted ratio falls to this value or below gets its
/// survivors migrated into the newest shard and is dropped.
pub const SHARD_REBUILD_RATIO: f64 = 0.6;

/// A pure SYN hitting a lingering connection signals 4-tuple reuse only when
/// the old connection was not itself stuck retrying its SYN.
pub const SYN_REUSE_LIMIT: u32 = 3;

/// Idle and linger horizons applied by [`ConnectionTable::sweep`].
#[derive(Debug, Clone, Copy)]
pub struct SweepTimeouts {
    /// Active entries idle longer than this are evicted.
    pub active_nanos: i64,
    /// Lingering entries are held this long, covering 2MSL late segments.
    pub linger_nanos: i64,
}

impl Default for SweepTimeouts {
    fn default() -> Self {
        Self {
            active_nanos: 120 * 1_000_000_000,
            linger_nanos: 60 * 1_000_000_000,
        }
    }
}

/// Everything tracked for one logical connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub key: FlowKey,
    pub state: ConnectionState,
    pub l7: L7Tracker,
    /// src MAC equalled the NIC MAC on the first packet; used for direction
    /// inference when nothing better is available.
    pub mac_eq: bool,
    pub ipv6: bool,
    pub created_ns: i64,
    pub last_seen_ns: i64,
    /// Set when a fresh connection took over this entry's 4-tuple.
    pub reused_by_next: bool,
    pub conn_trace_id: u128,
}

#[derive(Debug, Default)]
struct Shard {
    created_ns: i64,
    /// Total insertions ever, including entries since removed. The
    /// live/inserted ratio drives shard rebuilds.
    inserted: u64,
    map: FxHashMap<FlowKey, ConnectionEntry>,
}

impl Shard {
    fn new(now: i64) -> Self {
        Self {
            created_ns: now,
            inserted: 0,
            map: FxHashMap::default(),
        }
    }

    fn stale(&self) -> bool {
        self.inserted > 0 && (self.map.len() as f64 / self.inserted as f64) <= SHARD_REBUILD_RATIO
    }
}

enum Found {
    Active(usize),
    Lingering(usize),
}

/// Two-tier sharded connection table.
///
/// Active connections live in time-ordered shards; closed ones move to a
/// lingering tier where they absorb late segments and 4-tuple reuse until the
/// linger timeout. All lookups use the plain (epoch 0) key; older generations
/// of a reused 4-tuple are parked under bumped epochs.
#[derive(Debug)]
pub struct ConnectionTable {
    active: VecDeque<Shard>,
    lingering: VecDeque<Shard>,
    reuse_epoch: u64,
    trace_counter: u64,
    chunk_cap: u32,
}

impl ConnectionTable {
    pub fn new(now: i64, chunk_cap: u32) -> Self {
        let mut active = VecDeque::new();
        active.push_back(Shard::new(now));
        let mut lingering = VecDeque::new();
        lingering.push_back(Shard::new(now));
        Self {
            active,
            lingering,
            reuse_epoch: 0,
            trace_counter: 0,
            chunk_cap,
        }
    }

    pub fn active_len(&self) -> usize {
        self.active.iter().map(|s| s.map.len()).sum()
    }

    pub fn lingering_len(&self) -> usize {
        self.lingering.iter().map(|s| s.map.len()).sum()
    }

    fn next_trace_id(&mut self, now: i64) -> u128 {
        self.trace_counter += 1;
        ((now as u128) << 64) | self.trace_counter as u128
    }

    fn find(&self, key: &FlowKey) -> Option<Found> {
        for (idx, shard) in self.active.iter().enumerate().rev() {
            if shard.map.contains_key(key) {
                return Some(Found::Active(idx));
            }
        }
        for (idx, shard) in self.lingering.iter().enumerate().rev() {
            if shard.map.contains_key(key) {
                return Some(Found::Lingering(idx));
            }
        }
        None
    }

    /// Resolve the entry a packet belongs to, creating one when unseen.
    ///
    /// A pure SYN arriving for a lingering connection that completed (or gave
    /// up after fewer than [`SYN_REUSE_LIMIT`] SYN tries) is treated as a new
    /// connection reusing the 4-tuple: the old entry is flagged for final
    /// export and a fresh entry takes over the plain key.
    pub fn lookup_or_create(
        &mut self,
        key: &FlowKey,
        now: i64,
        syn_only: bool,
        mac_eq: bool,
        ipv6: bool,
    ) -> &mut ConnectionEntry {
        self.rotate(now);

        match self.find(key) {
            Some(Found::Active(idx)) => {
                let entry = self.active[idx].map.get_mut(key).expect("found above");
                entry.last_seen_ns = now;
                return entry;
            }
            Some(Found::Lingering(idx)) => {
                let shard = &mut self.lingering[idx];
                let reuse = {
                    let old = shard.map.get(key).expect("found above");
                    syn_only && old.state.syn_retransmits < SYN_REUSE_LIMIT
                };
                if reuse {
                    self.reuse_epoch += 1;
                    let epoch = self.reuse_epoch;
                    let mut old = shard.map.remove(key).expect("found above");
                    old.reused_by_next = true;
                    old.key = key.with_epoch(epoch);
                    let parked = old.key.clone();
                    shard.map.insert(parked, old);
                    debug!(
                        event.name = "conn_table.tuple_reused",
                        conn = %key,
                        reuse_epoch = epoch,
                    );
                    // Fall through to create the successor.
                } else {
                    let entry = self.lingering[idx].map.get_mut(key).expect("found above");
                    entry.last_seen_ns = now;
                    return entry;
                }
            }
            None => {}
        }

        let entry = ConnectionEntry {
            key: key.clone(),
            state: ConnectionState::with_chunk_cap(self.chunk_cap),
            l7: L7Tracker::default(),
            mac_eq,
            ipv6,
            created_ns: now,
            last_seen_ns: now,
            reused_by_next: false,
            conn_trace_id: self.next_trace_id(now),
        };
        let shard = self.active.back_mut().expect("at least one shard");
        shard.inserted += 1;
        shard.map.insert(key.clone(), entry);
        self.active
            .back_mut()
            .expect("at least one shard")
            .map
            .get_mut(key)
            .expect("inserted above")
    }

    /// Move a closed connection to the lingering tier. Safe to call for a
    /// key that is not active.
    pub fn mark_closing(&mut self, key: &FlowKey) {
        let mut moved = None;
        for shard in self.active.iter_mut().rev() {
            if let Some(entry) = shard.map.remove(key) {
                moved = Some(entry);
                break;
            }
        }
        if let Some(entry) = moved {
            self.insert_lingering(entry);
        }
    }

    fn insert_lingering(&mut self, entry: ConnectionEntry) {
        // A previous generation may still hold the plain key; park it under
        // a fresh epoch so both survive until their linger timeout.
        let mut displaced = None;
        for shard in self.lingering.iter_mut().rev() {
            if let Some(old) = shard.map.remove(&entry.key) {
                displaced = Some(old);
                break;
            }
        }
        if let Some(mut old) = displaced {
            self.reuse_epoch += 1;
            old.key = entry.key.with_epoch(self.reuse_epoch);
            let parked = old.key.clone();
            self.lingering
                .back_mut()
                .expect("at least one shard")
                .map
                .insert(parked, old);
        }
        let shard = self.lingering.back_mut().expect("at least one shard");
        shard.inserted += 1;
        shard.map.insert(entry.key.clone(), entry);
    }

    fn rotate(&mut self, now: i64) {
        for tier in [&mut self.active, &mut self.lingering] {
            let open_new = tier
                .back()
                .map(|s| now.saturating_sub(s.created_ns) >= SHARD_ROTATION_NANOS)
                .unwrap_or(true);
            if open_new {
                tier.push_back(Shard::new(now));
            }
        }
    }

    /// Walk every entry, applying idle eviction and linger expiry.
    ///
    /// The visitor sees each entry exactly once with `removing` telling it
    /// whether this is the entry's final visit. Closed active entries are
    /// migrated to the lingering tier after their visit; sparse shards are
    /// rebuilt into the newest shard afterwards.
    pub fn sweep<F>(&mut self, now: i64, timeouts: &SweepTimeouts, force: bool, mut visit: F)
    where
        F: FnMut(&FlowKey, &mut ConnectionEntry, bool),
    {
        let mut to_linger: Vec<ConnectionEntry> = Vec::new();
        for shard in &mut self.active {
            let mut migrate: Vec<FlowKey> = Vec::new();
            shard.map.retain(|key, entry| {
                let removing = force
                    || entry.reused_by_next
                    || now.saturating_sub(entry.last_seen_ns) > timeouts.active_nanos;
                visit(key, entry, removing);
                if removing {
                    return false;
                }
                if entry.state.phase.closed() {
                    migrate.push(key.clone());
                }
                true
            });
            for key in migrate {
                if let Some(entry) = shard.map.remove(&key) {
                    to_linger.push(entry);
                }
            }
        }
        for shard in &mut self.lingering {
            shard.map.retain(|key, entry| {
                let removing = force
                    || entry.reused_by_next
                    || now.saturating_sub(entry.last_seen_ns) > timeouts.linger_nanos;
                visit(key, entry, removing);
                !removing
            });
        }

        // Entries that closed during this pass were already visited in the
        // active tier; inserting them after the lingering pass keeps the
        // exactly-once visiting guarantee.
        for entry in to_linger {
            self.insert_lingering(entry);
        }

        self.compact();
    }

    /// Drop or rebuild shards left sparse by the sweep. Survivors of a
    /// rebuilt shard migrate into the newest shard of their tier.
    fn compact(&mut self) {
        for tier in [&mut self.active, &mut self.lingering] {
            let mut moved: Vec<ConnectionEntry> = Vec::new();
            let last = tier.len().saturating_sub(1);
            for i in 0..last {
                if tier[i].stale() {
                    let map = std::mem::take(&mut tier[i].map);
                    moved.extend(map.into_values());
                }
            }
            // Drop emptied shards; the newest stays as the insertion target.
            let len = tier.len();
            let mut idx = 0;
            tier.retain(|shard| {
                let keep = idx + 1 == len || !shard.map.is_empty();
                idx += 1;
                keep
            });
            let back = tier.back_mut().expect("at least one shard");
            for entry in moved {
                back.inserted += 1;
                back.map.insert(entry.key.clone(), entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use netlog_types::ip::IpProto;

    use super::*;
    use crate::conn::chunk::CHUNK_PACKET_CAP;

    fn key(port: u16) -> FlowKey {
        FlowKey {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            src_port: port,
            dst_port: 80,
            transport: IpProto::Tcp,
            netns: Arc::from("default"),
            vni: 0,
            vxlan: false,
            reuse_epoch: 0,
        }
    }

    const SEC: i64 = 1_000_000_000;

    #[test]
    fn create_then_lookup_same_entry() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        let k = key(41000);
        let id = table.lookup_or_create(&k, 10, true, true, false).conn_trace_id;
        let again = table.lookup_or_create(&k, 20, false, true, false);
        assert_eq!(again.conn_trace_id, id);
        assert_eq!(table.active_len(), 1);
    }

    #[test]
    fn distinct_tuples_distinct_entries() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        table.lookup_or_create(&key(41000), 10, true, true, false);
        table.lookup_or_create(&key(41001), 10, true, true, false);
        assert_eq!(table.active_len(), 2);
    }

    #[test]
    fn closing_moves_to_lingering() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        let k = key(41000);
        table.lookup_or_create(&k, 10, true, true, false);
        table.mark_closing(&k);
        assert_eq!(table.active_len(), 0);
        assert_eq!(table.lingering_len(), 1);
        // Late segments still resolve to the lingering entry.
        let entry = table.lookup_or_create(&k, 30, false, true, false);
        assert!(!entry.reused_by_next);
        assert_eq!(table.active_len(), 0);
    }

    #[test]
    fn pure_syn_on_lingering_starts_new_generation() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        let k = key(41000);
        let first = table.lookup_or_create(&k, 10, true, true, false).conn_trace_id;
        table.mark_closing(&k);

        let second = table.lookup_or_create(&k, 30, true, true, false).conn_trace_id;
        assert_ne!(first, second);
        assert_eq!(table.active_len(), 1);
        // The old generation is parked under a bumped epoch, flagged for
        // final export.
        assert_eq!(table.lingering_len(), 1);
        let mut reused = 0;
        table.sweep(31, &SweepTimeouts::default(), false, |_, entry, removing| {
            if entry.reused_by_next {
                reused += 1;
                assert!(removing);
            }
        });
        assert_eq!(reused, 1);
    }

    #[test]
    fn syn_storm_does_not_trigger_reuse() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        let k = key(41000);
        {
            let entry = table.lookup_or_create(&k, 10, true, true, false);
            entry.state.syn_retransmits = SYN_REUSE_LIMIT;
        }
        table.mark_closing(&k);
        // Another SYN for a connection that was already stuck retrying is a
        // further retransmit, not a new connection.
        let entry = table.lookup_or_create(&k, 30, true, true, false);
        assert!(!entry.reused_by_next);
        assert_eq!(table.active_len(), 0);
        assert_eq!(table.lingering_len(), 1);
    }

    #[test]
    fn idle_entries_evicted_by_sweep() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        table.lookup_or_create(&key(41000), 0, true, true, false);
        table.lookup_or_create(&key(41001), 100 * SEC, true, true, false);

        let timeouts = SweepTimeouts::default();
        let mut removed = Vec::new();
        table.sweep(130 * SEC, &timeouts, false, |key, _, removing| {
            if removing {
                removed.push(key.src_port);
            }
        });
        assert_eq!(removed, vec![41000]);
        assert_eq!(table.active_len(), 1);
    }

    #[test]
    fn lingering_expires_after_linger_timeout() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        let k = key(41000);
        table.lookup_or_create(&k, 0, true, true, false);
        table.mark_closing(&k);

        let timeouts = SweepTimeouts::default();
        table.sweep(30 * SEC, &timeouts, false, |_, _, removing| {
            assert!(!removing);
        });
        assert_eq!(table.lingering_len(), 1);

        let mut final_visits = 0;
        table.sweep(100 * SEC, &timeouts, false, |_, _, removing| {
            assert!(removing);
            final_visits += 1;
        });
        assert_eq!(final_visits, 1);
        assert_eq!(table.lingering_len(), 0);
    }

    #[test]
    fn forced_sweep_removes_everything() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        table.lookup_or_create(&key(41000), 0, true, true, false);
        table.lookup_or_create(&key(41001), 0, true, true, false);
        table.mark_closing(&key(41001));

        let mut visits = 0;
        table.sweep(10, &SweepTimeouts::default(), true, |_, _, removing| {
            assert!(removing);
            visits += 1;
        });
        assert_eq!(visits, 2);
        assert_eq!(table.active_len(), 0);
        assert_eq!(table.lingering_len(), 0);
    }

    #[test]
    fn sparse_shard_rebuilt_with_exact_survivors() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        let mut ids = Vec::new();
        for port in 41000..41010 {
            ids.push((port, table.lookup_or_create(&key(port), 0, true, true, false).conn_trace_id));
        }
        // Open a fresh shard so the populated one is no longer the
        // insertion target and becomes a rebuild candidate.
        table.lookup_or_create(&key(50000), SHARD_ROTATION_NANOS + 1, true, true, false);
        assert_eq!(table.active.len(), 2);

        // Keep half the original entries fresh; the idle half will be
        // evicted, dropping the shard's live/inserted ratio to 0.5.
        let keep = 100 * SEC;
        for port in 41000..41005 {
            table.lookup_or_create(&key(port), keep, false, true, false);
        }

        let mut removed = Vec::new();
        table.sweep(130 * SEC, &SweepTimeouts::default(), false, |key, _, removing| {
            if removing {
                removed.push(key.src_port);
            }
        });
        removed.sort_unstable();
        assert_eq!(removed, vec![41005, 41006, 41007, 41008, 41009]);

        // The sparse shard was rebuilt: its survivors now live in the
        // newest shard, and nothing else survived with them.
        let back = table.active.back().unwrap();
        for port in 41000..41005 {
            assert!(back.map.contains_key(&key(port)));
        }
        assert_eq!(table.active_len(), 6);
        assert!(table.active.len() < 3);

        // Identity is preserved across the rebuild.
        for (port, id) in ids.into_iter().take(5) {
            let entry = table.lookup_or_create(&key(port), 131 * SEC, false, true, false);
            assert_eq!(entry.conn_trace_id, id);
        }
    }

    #[test]
    fn entry_closing_mid_sweep_visited_once() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        let k = key(41000);
        {
            use crate::conn::{key::PacketDirection, state::TcpPhase};
            use netlog_types::tcp::{TcpFlags, TCP_FLAG_RST};

            let entry = table.lookup_or_create(&k, 10, true, true, false);
            entry.state.observe(&crate::conn::key::PacketObservation {
                direction: PacketDirection::Rx,
                seq: 0,
                ack: 1,
                flags: TcpFlags(TCP_FLAG_RST),
                payload_len: 0,
                window: 0,
                window_scale: None,
                ts_nanos: 10,
                src_mac: [0; 6],
                dst_mac: [0; 6],
            });
            assert_eq!(entry.state.phase, TcpPhase::Closed);
        }

        // The closed entry migrates to lingering during this sweep; it must
        // not be handed to the visitor a second time by the lingering pass.
        let mut visits = 0;
        table.sweep(20, &SweepTimeouts::default(), false, |_, _, removing| {
            visits += 1;
            assert!(!removing);
        });
        assert_eq!(visits, 1);
        assert_eq!(table.active_len(), 0);
        assert_eq!(table.lingering_len(), 1);
    }

    #[test]
    fn shard_rotation_keeps_lookups_working() {
        let mut table = ConnectionTable::new(0, CHUNK_PACKET_CAP);
        let k = key(41000);
        let id = table.lookup_or_create(&k, 0, true, true, false).conn_trace_id;
        // Past the rotation horizon a new shard opens; the entry is still
        // found in the older shard.
        let entry = table.lookup_or_create(&k, SHARD_ROTATION_NANOS + 1, false, true, false);
        assert_eq!(entry.conn_trace_id, id);
        assert_eq!(table.active_len(), 1);
    }
}
