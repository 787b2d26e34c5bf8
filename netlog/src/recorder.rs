//! Per-interface recording engine.
//!
//! One [`FlowRecorder`] owns all state for one capture interface behind a
//! single async lock: the connection table, the window aggregator, and the
//! export feeder. Two tasks drive it, a capture task feeding frames in and a
//! gather task sweeping the table, flushing aggregates, and forcing a final
//! sweep on shutdown.

use std::{sync::Arc, time::Duration};

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    agg::{AggKey, FlowAggregator, TcpSample},
    capture::{Frame, PacketSource, now_nanos},
    conn::{
        chunk::Chunk,
        key::{ConnDirection, FlowKey, PacketDirection},
        seq::SeqClass,
        state::{ConnectionState, TcpPhase},
        table::{ConnectionEntry, ConnectionTable, SweepTimeouts, SYN_REUSE_LIMIT},
    },
    export::{HttpExchangeRecord, Record, RecordFeeder, TcpChunkRecord},
    filter::{FilterFields, FilterPredicate},
    http::HttpExchange,
    listen::ListeningPortRegistry,
    packet,
};

/// Source tag stamped on every record.
const SOURCE: &str = "netlog";

/// A chunk that has not grown for this long is exported even though it is
/// not full.
const CHUNK_STALE_NANOS: i64 = 30 * 1_000_000_000;

/// Pause after a capture read error before retrying.
const CAPTURE_BACKOFF: Duration = Duration::from_millis(300);

const FRAME_CHANNEL_DEPTH: usize = 1024;

/// Tunables for one recorder instance.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub interface: String,
    pub nic_mac: [u8; 6],
    pub netns: Arc<str>,
    pub sweep_interval: Duration,
    pub flush_interval: Duration,
    pub timeouts: SweepTimeouts,
    pub port_floor: u16,
    pub emit_tcp_records: bool,
    pub emit_metrics: bool,
    pub enable_grpc: bool,
    pub chunk_packet_cap: u32,
}

struct Inner {
    table: ConnectionTable,
    agg: FlowAggregator,
    feeder: RecordFeeder,
}

pub struct FlowRecorder {
    conf: RecorderConfig,
    inner: RwLock<Inner>,
    filter: Box<dyn FilterPredicate>,
    listen: Arc<ListeningPortRegistry>,
    cancel: CancellationToken,
}

impl FlowRecorder {
    pub fn new(
        conf: RecorderConfig,
        feeder: RecordFeeder,
        filter: Box<dyn FilterPredicate>,
        listen: Arc<ListeningPortRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let now = now_nanos();
        let inner = Inner {
            table: ConnectionTable::new(now, conf.chunk_packet_cap),
            agg: FlowAggregator::new(conf.interface.clone(), conf.port_floor, now),
            feeder,
        };
        Self {
            conf,
            inner: RwLock::new(inner),
            filter,
            listen,
            cancel,
        }
    }

    /// Feed one captured frame through decode, the TCP tracker, and the L7
    /// tracker.
    pub async fn handle_frame(&self, frame: &Frame) {
        let Some(decoded) =
            packet::decode(&frame.data, self.conf.nic_mac, &self.conf.netns, frame.ts_nanos)
        else {
            return;
        };
        if self.filter.excludes(&FilterFields {
            src_addr: decoded.key.src_addr,
            dst_addr: decoded.key.dst_addr,
            src_port: decoded.key.src_port,
            dst_port: decoded.key.dst_port,
            transport: decoded.key.transport,
        }) {
            return;
        }

        let obs = &decoded.obs;
        let mut inner = self.inner.write().await;
        let entry = inner.table.lookup_or_create(
            &decoded.key,
            obs.ts_nanos,
            obs.flags.syn_only(),
            obs.direction == PacketDirection::Tx,
            decoded.ipv6,
        );

        let state = entry.state.observe(obs);
        if obs.payload_len > 0 {
            if state.class == SeqClass::NewData {
                entry
                    .l7
                    .observe_payload(obs.direction, obs.seq, decoded.payload, obs.ts_nanos);
                if !self.conf.enable_grpc {
                    entry.l7.discard_if_grpc();
                }
            }
        } else if obs.flags.ack() {
            entry.l7.observe_ack(obs.direction, obs.ack);
        }

        // Closed connections and hopeless connects move to lingering right
        // away, so their 4-tuple frees up for reuse.
        let give_up = entry.state.syn_retransmits >= SYN_REUSE_LIMIT
            && matches!(entry.state.phase, TcpPhase::SynSent | TcpPhase::SynRcvd);
        if entry.state.phase.closed() || give_up {
            let key = entry.key.clone();
            inner.table.mark_closing(&key);
        }
    }

    /// Capture loop: a dedicated thread blocks on the source and hands
    /// frames over a bounded channel. Read errors back off and retry; the
    /// source is never considered fatal while the recorder runs.
    pub async fn run_capture(self: Arc<Self>, mut source: Box<dyn PacketSource>) {
        let (tx, mut rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_DEPTH);
        let cancel = self.cancel.clone();
        let interface = self.conf.interface.clone();
        std::thread::spawn(move || {
            while !cancel.is_cancelled() {
                match source.next_frame() {
                    Ok(frame) => {
                        if tx.blocking_send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            event.name = "capture.read_failed",
                            interface = %interface,
                            error = %e,
                        );
                        std::thread::sleep(CAPTURE_BACKOFF);
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame).await,
                    None => break,
                },
            }
        }
        debug!(event.name = "capture.stopped", interface = %self.conf.interface);
    }

    /// Gather loop: periodic sweeps and aggregate flushes, ending with one
    /// forced sweep that exports everything still tracked.
    pub async fn run_gather(self: Arc<Self>) {
        let mut sweep = tokio::time::interval(self.conf.sweep_interval);
        let mut flush = tokio::time::interval(self.conf.flush_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.sweep(true).await;
                    self.flush_metrics().await;
                    self.inner.write().await.feeder.shutdown().await;
                    info!(event.name = "gather.stopped", interface = %self.conf.interface);
                    return;
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.listen.refresh() {
                        warn!(event.name = "listen.refresh_failed", error = %e);
                    }
                    self.sweep(false).await;
                }
                _ = flush.tick() => self.flush_metrics().await,
            }
        }
    }

    /// Walk the connection table, exporting finished chunks and exchanges
    /// and folding deltas into the window aggregator.
    pub async fn sweep(&self, force: bool) {
        let now = now_nanos();
        let mut inner = self.inner.write().await;
        let Inner { table, agg, feeder } = &mut *inner;
        let conf = &self.conf;
        let listen = &self.listen;

        table.sweep(now, &conf.timeouts, force, |key, entry, removing| {
            let include_last = removing || entry.state.phase.closed();
            let chunks = entry.state.take_chunks(include_last, now, CHUNK_STALE_NANOS);
            // Keep the unfinished exchange on a live connection; surrender
            // everything when the entry is going away.
            let exchanges = entry.l7.drain(!removing);

            let direction = infer_direction(key, &entry.state, &exchanges, listen);

            let mut sample = TcpSample::default();
            for chunk in &chunks {
                sample.tx_bytes += chunk.tx_bytes;
                sample.rx_bytes += chunk.rx_bytes;
                sample.tx_packets += u64::from(chunk.tx_packets);
                sample.rx_packets += u64::from(chunk.rx_packets);
                sample.tx_retrans += u64::from(chunk.tx_retransmits);
                sample.rx_retrans += u64::from(chunk.rx_retransmits);
            }
            let metrics = &mut entry.state.metrics;
            sample.established = std::mem::take(&mut metrics.established_pending);
            sample.closed = std::mem::take(&mut metrics.closed_pending);
            if entry.state.rtt_nanos != 0 && !entry.state.metrics.rtt_reported {
                entry.state.metrics.rtt_reported = true;
                sample.rtt_nanos = Some(entry.state.rtt_nanos);
            }

            let l7_proto = entry.l7.protocol();
            if conf.emit_metrics
                && (!chunks.is_empty()
                    || sample.established
                    || sample.closed
                    || sample.rtt_nanos.is_some())
            {
                agg.record_tcp(
                    AggKey {
                        src_ip: key.src_addr,
                        dst_ip: key.dst_addr,
                        src_port: key.src_port,
                        dst_port: key.dst_port,
                        direction,
                        netns: Arc::clone(&key.netns),
                        l4_proto: key.transport,
                        l7_proto,
                    },
                    sample,
                );
            }

            if conf.emit_tcp_records {
                for chunk in chunks {
                    feeder.push(Record::TcpChunk(chunk_record(
                        conf, key, entry, &chunk, direction,
                    )));
                }
            }
            for exchange in exchanges {
                if conf.emit_metrics {
                    agg.record_http(
                        AggKey {
                            src_ip: key.src_addr,
                            dst_ip: key.dst_addr,
                            src_port: key.src_port,
                            dst_port: key.dst_port,
                            direction,
                            netns: Arc::clone(&key.netns),
                            l4_proto: key.transport,
                            l7_proto,
                        },
                        &exchange.method,
                        &exchange.path,
                        exchange.status,
                        exchange.wait_cost(),
                    );
                }
                feeder.push(Record::HttpExchange(exchange_record(
                    conf, key, entry, &exchange, direction,
                )));
            }
        });

        feeder.flush().await;
    }

    /// Close the aggregation window and export its records.
    pub async fn flush_metrics(&self) {
        if !self.conf.emit_metrics {
            return;
        }
        let now = now_nanos();
        let mut inner = self.inner.write().await;
        let records = inner.agg.flush(now);
        if records.is_empty() {
            return;
        }
        debug!(
            event.name = "agg.window_flushed",
            interface = %self.conf.interface,
            records = records.len(),
        );
        for record in records {
            inner.feeder.push(record);
        }
        inner.feeder.flush().await;
    }

    #[cfg(test)]
    pub(crate) async fn pending_records(&self) -> usize {
        self.inner.read().await.feeder.pending_len()
    }
}

/// Client/server inference chain: a local listening port is decisive, then
/// the observed SYN direction, then which side sent an HTTP request, then
/// the convention that the lower port is the server.
fn infer_direction(
    key: &FlowKey,
    state: &ConnectionState,
    exchanges: &[HttpExchange],
    listen: &ListeningPortRegistry,
) -> ConnDirection {
    if listen.is_listening(key.src_port) {
        return ConnDirection::Incoming;
    }
    if let Some(direction) = state.syn_direction {
        return match direction {
            PacketDirection::Tx => ConnDirection::Outgoing,
            PacketDirection::Rx => ConnDirection::Incoming,
        };
    }
    if let Some(direction) = exchanges.iter().find_map(|e| e.request_direction) {
        return match direction {
            PacketDirection::Tx => ConnDirection::Outgoing,
            PacketDirection::Rx => ConnDirection::Incoming,
        };
    }
    if key.src_port > key.dst_port {
        return ConnDirection::Outgoing;
    }
    ConnDirection::Unknown
}

fn trace_id(id: u128) -> String {
    format!("{id:032x}")
}

fn chunk_record(
    conf: &RecorderConfig,
    key: &FlowKey,
    entry: &ConnectionEntry,
    chunk: &Chunk,
    direction: ConnDirection,
) -> TcpChunkRecord {
    let state = &entry.state;
    TcpChunkRecord {
        source: SOURCE,
        interface: conf.interface.clone(),
        netns: key.netns.to_string(),
        src_ip: key.src_addr.to_string(),
        dst_ip: key.dst_addr.to_string(),
        src_port: key.src_port,
        dst_port: key.dst_port,
        direction: direction.as_str(),
        l4_proto: key.transport.as_str(),
        l7_proto: entry.l7.protocol().map(|p| p.as_str()),
        chunk_id: chunk.id,
        tcp_status: state.phase.as_str(),
        tx_packets: chunk.tx_packets,
        rx_packets: chunk.rx_packets,
        tx_bytes: chunk.tx_bytes,
        rx_bytes: chunk.rx_bytes,
        tx_retrans: chunk.tx_retransmits,
        rx_retrans: chunk.rx_retransmits,
        tcp_syn_retrans: chunk.syn_retransmits,
        tx_seq_min: chunk.tx_seq.map(|(lo, _)| lo),
        tx_seq_max: chunk.tx_seq.map(|(_, hi)| hi),
        rx_seq_min: chunk.rx_seq.map(|(lo, _)| lo),
        rx_seq_max: chunk.rx_seq.map(|(_, hi)| hi),
        tcp_3whs_cost: chunk.has_syn.then(|| state.handshake_cost()).flatten(),
        tcp_4whs_cost: (chunk.has_fin || chunk.has_rst)
            .then(|| state.close_cost())
            .flatten(),
        tcp_rtt: (state.rtt_nanos != 0).then_some(state.rtt_nanos),
        vxlan: key.vxlan,
        vni: key.vni,
        nic_traceid: trace_id(entry.conn_trace_id),
        inner_traceid: if key.vxlan {
            trace_id(entry.conn_trace_id)
        } else {
            String::new()
        },
        time_start: chunk.first_ts,
        time_end: chunk.last_ts,
    }
}

fn exchange_record(
    conf: &RecorderConfig,
    key: &FlowKey,
    entry: &ConnectionEntry,
    exchange: &HttpExchange,
    direction: ConnDirection,
) -> HttpExchangeRecord {
    HttpExchangeRecord {
        source: SOURCE,
        interface: conf.interface.clone(),
        netns: key.netns.to_string(),
        src_ip: key.src_addr.to_string(),
        dst_ip: key.dst_addr.to_string(),
        src_port: key.src_port,
        dst_port: key.dst_port,
        direction: direction.as_str(),
        l7_proto: entry
            .l7
            .protocol()
            .map(|p| p.as_str())
            .unwrap_or("http"),
        method: exchange.method.clone(),
        url: exchange.path.clone(),
        host: exchange.host.clone(),
        http_version: exchange.version.clone(),
        status_code: exchange.status,
        grpc_status: exchange.grpc_status,
        stream_id: exchange.stream_id,
        cost_resp_wait: exchange.wait_cost(),
        cost_req_sent: exchange.req_sent_cost(),
        cost_cnt_dl: exchange.download_cost(),
        req_bytes: exchange.req_bytes,
        resp_bytes: exchange.resp_bytes,
        finished: exchange.finished,
        trace_id: exchange.trace_id.clone(),
        parent_id: exchange.parent_id.clone(),
        nic_traceid: trace_id(entry.conn_trace_id),
        inner_traceid: if key.vxlan {
            trace_id(entry.conn_trace_id)
        } else {
            String::new()
        },
        time: exchange.req_first_ts.max(exchange.resp_first_ts),
    }
}
