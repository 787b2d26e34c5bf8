//! Windowed flow aggregation.
//!
//! Per-connection deltas are folded into per-key accumulators and flushed on
//! a fixed timer as flow metric records. Keys wildcard the ephemeral port so
//! a busy client does not explode the key space: any port at or above the
//! configured floor aggregates under port 0.

use std::{net::IpAddr, sync::Arc};

use fxhash::FxHashMap;
use netlog_types::ip::IpProto;

use crate::{
    conn::key::ConnDirection,
    export::{FlowMetricRecord, Record},
    http::L7Protocol,
};

/// Ports at or above this value are considered ephemeral by default.
pub const DEFAULT_PORT_WILDCARD_FLOOR: u16 = 10_000;

/// Wait latencies beyond this are clock artifacts and are discarded.
const MAX_WAIT_NANOS: i64 = 3_600 * 1_000_000_000;

/// Aggregation key with ephemeral ports wildcarded to 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub direction: ConnDirection,
    pub netns: Arc<str>,
    pub l4_proto: IpProto,
    pub l7_proto: Option<L7Protocol>,
}

impl AggKey {
    /// Apply the wildcard floor to both ports.
    pub fn normalized(mut self, floor: u16) -> Self {
        if self.src_port >= floor {
            self.src_port = 0;
        }
        if self.dst_port >= floor {
            self.dst_port = 0;
        }
        self
    }
}

/// HTTP accumulation key: the flow key refined by what was exchanged, so
/// distinct methods, paths, or statuses on one flow stay distinct rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HttpAggKey {
    flow: AggKey,
    method: String,
    path: String,
    status: i32,
}

/// Per-sweep delta for one connection, already deduplicated upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSample {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_retrans: u64,
    pub rx_retrans: u64,
    /// The connection reached established during this sample.
    pub established: bool,
    /// The connection closed during this sample.
    pub closed: bool,
    pub rtt_nanos: Option<i64>,
}

#[derive(Debug, Default)]
struct TcpAcc {
    tx_bytes: u64,
    rx_bytes: u64,
    tx_packets: u64,
    rx_packets: u64,
    tx_retrans: u64,
    rx_retrans: u64,
    established: u64,
    closed: u64,
    rtt_sum: i64,
    rtt_count: u64,
}

#[derive(Debug, Default)]
struct HttpAcc {
    req_count: u64,
    wait_sum: i64,
    wait_count: u64,
}

/// Accumulates one window's worth of flow metrics for one interface.
#[derive(Debug)]
pub struct FlowAggregator {
    interface: String,
    port_floor: u16,
    window_start: i64,
    tcp: FxHashMap<AggKey, TcpAcc>,
    http: FxHashMap<HttpAggKey, HttpAcc>,
}

impl FlowAggregator {
    pub fn new(interface: String, port_floor: u16, now: i64) -> Self {
        Self {
            interface,
            port_floor,
            window_start: now,
            tcp: FxHashMap::default(),
            http: FxHashMap::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.http.is_empty()
    }

    pub fn record_tcp(&mut self, key: AggKey, sample: TcpSample) {
        let acc = self.tcp.entry(key.normalized(self.port_floor)).or_default();
        acc.tx_bytes += sample.tx_bytes;
        acc.rx_bytes += sample.rx_bytes;
        acc.tx_packets += sample.tx_packets;
        acc.rx_packets += sample.rx_packets;
        acc.tx_retrans += sample.tx_retrans;
        acc.rx_retrans += sample.rx_retrans;
        if sample.established {
            acc.established += 1;
        }
        if sample.closed {
            acc.closed += 1;
        }
        if let Some(rtt) = sample.rtt_nanos {
            if rtt > 0 {
                acc.rtt_sum += rtt;
                acc.rtt_count += 1;
            }
        }
    }

    pub fn record_http(
        &mut self,
        key: AggKey,
        method: &str,
        path: &str,
        status: i32,
        wait_nanos: Option<i64>,
    ) {
        let key = HttpAggKey {
            flow: key.normalized(self.port_floor),
            method: method.to_owned(),
            path: path.to_owned(),
            status,
        };
        let acc = self.http.entry(key).or_default();
        acc.req_count += 1;
        if let Some(wait) = wait_nanos {
            if wait > 0 && wait <= MAX_WAIT_NANOS {
                acc.wait_sum += wait;
                acc.wait_count += 1;
            }
        }
    }

    /// Close the window: emit one record per key and reset.
    pub fn flush(&mut self, window_end: i64) -> Vec<Record> {
        let window_start = self.window_start;
        self.window_start = window_end;

        let mut out = Vec::with_capacity(self.tcp.len() + self.http.len());

        for (key, acc) in self.tcp.drain() {
            let mut rec = base_record(&self.interface, &key, window_start, window_end);
            rec.tx_bytes = acc.tx_bytes;
            rec.rx_bytes = acc.rx_bytes;
            rec.tx_packets = acc.tx_packets;
            rec.rx_packets = acc.rx_packets;
            rec.tx_retrans = acc.tx_retrans;
            rec.rx_retrans = acc.rx_retrans;
            rec.tcp_established = acc.established;
            rec.tcp_closed = acc.closed;
            if acc.rtt_count > 0 {
                rec.tcp_rtt_avg = Some(acc.rtt_sum / acc.rtt_count as i64);
            }
            out.push(Record::FlowMetric(rec));
        }

        // One row per (flow, method, path, status).
        for (key, acc) in self.http.drain() {
            let mut rec = base_record(&self.interface, &key.flow, window_start, window_end);
            rec.http_method = key.method;
            rec.http_path = key.path;
            rec.http_status = Some(key.status);
            rec.http_req_count = acc.req_count;
            if (200..600).contains(&key.status) {
                match key.status / 100 {
                    2 => rec.http_2xx = acc.req_count,
                    3 => rec.http_3xx = acc.req_count,
                    4 => rec.http_4xx = acc.req_count,
                    _ => rec.http_5xx = acc.req_count,
                }
            }
            if acc.wait_count > 0 {
                rec.http_wait_avg = Some(acc.wait_sum / acc.wait_count as i64);
            }
            out.push(Record::FlowMetric(rec));
        }

        out
    }
}

fn base_record(interface: &str, key: &AggKey, start: i64, end: i64) -> FlowMetricRecord {
    FlowMetricRecord {
        source: "netlog",
        interface: interface.to_owned(),
        netns: key.netns.to_string(),
        src_ip: key.src_ip.to_string(),
        dst_ip: key.dst_ip.to_string(),
        src_port: key.src_port,
        dst_port: key.dst_port,
        direction: key.direction.as_str(),
        l4_proto: key.l4_proto.as_str(),
        l7_proto: key.l7_proto.map(|p| p.as_str()),
        window_start: start,
        window_end: end,
        ..FlowMetricRecord::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(src_port: u16, dst_port: u16) -> AggKey {
        AggKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port,
            dst_port,
            direction: ConnDirection::Outgoing,
            netns: Arc::from("default"),
            l4_proto: IpProto::Tcp,
            l7_proto: Some(L7Protocol::Http1),
        }
    }

    fn metric(rec: &Record) -> &FlowMetricRecord {
        match rec {
            Record::FlowMetric(m) => m,
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn ephemeral_ports_collapse_to_one_key() {
        let mut agg = FlowAggregator::new("eth0".into(), DEFAULT_PORT_WILDCARD_FLOOR, 0);
        for port in [40_001, 40_002, 40_003] {
            agg.record_tcp(
                key(port, 80),
                TcpSample {
                    tx_bytes: 100,
                    established: true,
                    ..TcpSample::default()
                },
            );
        }
        let records = agg.flush(60);
        assert_eq!(records.len(), 1);
        let m = metric(&records[0]);
        assert_eq!(m.src_port, 0);
        assert_eq!(m.dst_port, 80);
        assert_eq!(m.tx_bytes, 300);
        assert_eq!(m.tcp_established, 3);
    }

    #[test]
    fn listening_ports_stay_distinct() {
        let mut agg = FlowAggregator::new("eth0".into(), DEFAULT_PORT_WILDCARD_FLOOR, 0);
        agg.record_tcp(key(40_001, 80), TcpSample::default());
        agg.record_tcp(key(40_001, 443), TcpSample::default());
        assert_eq!(agg.flush(60).len(), 2);
    }

    #[test]
    fn rtt_mean_is_count_weighted() {
        let mut agg = FlowAggregator::new("eth0".into(), DEFAULT_PORT_WILDCARD_FLOOR, 0);
        for rtt in [1_000, 2_000, 6_000] {
            agg.record_tcp(
                key(40_001, 80),
                TcpSample {
                    rtt_nanos: Some(rtt),
                    ..TcpSample::default()
                },
            );
        }
        let records = agg.flush(60);
        assert_eq!(metric(&records[0]).tcp_rtt_avg, Some(3_000));
    }

    #[test]
    fn same_exchange_shape_merges_across_ephemeral_ports() {
        let mut agg = FlowAggregator::new("eth0".into(), DEFAULT_PORT_WILDCARD_FLOOR, 0);
        agg.record_http(key(40_001, 80), "GET", "/items", 200, Some(1_000));
        agg.record_http(key(40_002, 80), "GET", "/items", 200, Some(3_000));

        let records = agg.flush(60);
        assert_eq!(records.len(), 1);
        let m = metric(&records[0]);
        assert_eq!(m.http_req_count, 2);
        assert_eq!(m.http_2xx, 2);
        assert_eq!(m.http_method, "GET");
        assert_eq!(m.http_path, "/items");
        assert_eq!(m.http_status, Some(200));
        assert_eq!(m.http_wait_avg, Some(2_000));
    }

    #[test]
    fn distinct_methods_paths_statuses_stay_distinct_rows() {
        let mut agg = FlowAggregator::new("eth0".into(), DEFAULT_PORT_WILDCARD_FLOOR, 0);
        agg.record_http(key(40_001, 80), "GET", "/items", 200, None);
        agg.record_http(key(40_001, 80), "POST", "/items", 200, None);
        agg.record_http(key(40_001, 80), "GET", "/orders", 200, None);
        agg.record_http(key(40_001, 80), "GET", "/items", 502, None);

        let records = agg.flush(60);
        assert_eq!(records.len(), 4);
        for r in &records {
            assert_eq!(metric(r).http_req_count, 1);
        }
        let failed = records
            .iter()
            .find(|r| metric(r).http_status == Some(502))
            .expect("5xx row");
        assert_eq!(metric(failed).http_5xx, 1);
        assert_eq!(metric(failed).http_2xx, 0);
    }

    #[test]
    fn unknown_status_row_has_no_class_bucket() {
        let mut agg = FlowAggregator::new("eth0".into(), DEFAULT_PORT_WILDCARD_FLOOR, 0);
        agg.record_http(key(40_001, 80), "GET", "/x", -1, None);
        let records = agg.flush(60);
        let m = metric(&records[0]);
        assert_eq!(m.http_req_count, 1);
        assert_eq!(m.http_2xx + m.http_3xx + m.http_4xx + m.http_5xx, 0);
    }

    #[test]
    fn absurd_wait_latency_discarded() {
        let mut agg = FlowAggregator::new("eth0".into(), DEFAULT_PORT_WILDCARD_FLOOR, 0);
        agg.record_http(key(40_001, 80), "GET", "/x", 200, Some(MAX_WAIT_NANOS + 1));
        let records = agg.flush(60);
        assert_eq!(metric(&records[0]).http_wait_avg, None);
        assert_eq!(metric(&records[0]).http_req_count, 1);
    }

    #[test]
    fn flush_resets_window() {
        let mut agg = FlowAggregator::new("eth0".into(), DEFAULT_PORT_WILDCARD_FLOOR, 0);
        agg.record_tcp(key(40_001, 80), TcpSample::default());
        let first = agg.flush(60);
        assert_eq!(metric(&first[0]).window_start, 0);
        assert!(agg.is_empty());

        agg.record_tcp(key(40_001, 80), TcpSample::default());
        let second = agg.flush(120);
        assert_eq!(metric(&second[0]).window_start, 60);
        assert_eq!(metric(&second[0]).window_end, 120);
    }
}
