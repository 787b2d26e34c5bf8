//! Record types and export sinks.
//!
//! Three record shapes leave the engine: per-chunk TCP records, per-exchange
//! HTTP records, and windowed flow aggregates. Records are buffered and
//! flushed in bounded batches; a failed flush is logged and dropped rather
//! than retried, so a stuck sink never grows memory.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, warn};

use crate::error::ExportError;

/// Records per batch handed to the sink.
pub const MAX_BATCH: usize = 128;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Record {
    TcpChunk(TcpChunkRecord),
    HttpExchange(HttpExchangeRecord),
    FlowMetric(FlowMetricRecord),
}

/// One exported TCP chunk: bounded run of packets on one connection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TcpChunkRecord {
    pub source: &'static str,
    pub interface: String,
    pub netns: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub direction: &'static str,
    pub l4_proto: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l7_proto: Option<&'static str>,
    pub chunk_id: u32,
    pub tcp_status: &'static str,
    pub tx_packets: u32,
    pub rx_packets: u32,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_retrans: u32,
    pub rx_retrans: u32,
    pub tcp_syn_retrans: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_seq_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_seq_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_seq_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_seq_max: Option<u32>,
    /// 3-way handshake cost in nanoseconds, on the SYN chunk only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_3whs_cost: Option<i64>,
    /// Close handshake cost in nanoseconds, on the FIN chunk only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_4whs_cost: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_rtt: Option<i64>,
    pub vxlan: bool,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub vni: u32,
    /// Trace id of the capture NIC's connection.
    pub nic_traceid: String,
    /// Trace id of the inner (VXLAN-decapsulated) connection, when distinct.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub inner_traceid: String,
    pub time_start: i64,
    pub time_end: i64,
}

/// One exported HTTP (or gRPC) request/response exchange.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpExchangeRecord {
    pub source: &'static str,
    pub interface: String,
    pub netns: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub direction: &'static str,
    pub l7_proto: &'static str,
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    pub http_version: String,
    /// -1 when no parseable status line or :status field was observed.
    pub status_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_status: Option<i32>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub stream_id: u32,
    /// Server think time: first response byte minus last request byte.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_resp_wait: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_req_sent: Option<i64>,
    /// Content download time: last response byte minus first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_cnt_dl: Option<i64>,
    pub req_bytes: u64,
    pub resp_bytes: u64,
    pub finished: bool,
    /// Application trace context sniffed from the request's `traceparent`
    /// header; empty when the request carried none.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    pub nic_traceid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub inner_traceid: String,
    pub time: i64,
}

/// One windowed flow aggregate over an ephemeral-port-wildcarded key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowMetricRecord {
    pub source: &'static str,
    pub interface: String,
    pub netns: String,
    pub src_ip: String,
    pub dst_ip: String,
    /// 0 when the real port was at or above the wildcard floor.
    pub src_port: u16,
    pub dst_port: u16,
    pub direction: &'static str,
    pub l4_proto: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l7_proto: Option<&'static str>,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_retrans: u64,
    pub rx_retrans: u64,
    pub tcp_established: u64,
    pub tcp_closed: u64,
    /// Count-weighted mean RTT in nanoseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_rtt_avg: Option<i64>,
    /// Set on HTTP rows only: the exchange shape this row aggregates.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub http_method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub http_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<i32>,
    pub http_req_count: u64,
    pub http_2xx: u64,
    pub http_3xx: u64,
    pub http_4xx: u64,
    pub http_5xx: u64,
    /// Count-weighted mean server wait latency in nanoseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_wait_avg: Option<i64>,
    pub window_start: i64,
    pub window_end: i64,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// Destination for finished records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn emit(&self, batch: &[Record]) -> Result<(), ExportError>;
    async fn shutdown(&self) -> Result<(), ExportError> {
        Ok(())
    }
}

/// Writes one JSON object per line to stdout.
pub struct StdoutSink;

#[async_trait]
impl RecordSink for StdoutSink {
    async fn emit(&self, batch: &[Record]) -> Result<(), ExportError> {
        for record in batch {
            let line = serde_json::to_string(record)?;
            println!("{line}");
        }
        Ok(())
    }
}

/// Buffers records and hands them to the sink in [`MAX_BATCH`] slices.
pub struct RecordFeeder {
    sink: Box<dyn RecordSink>,
    pending: Vec<Record>,
}

impl RecordFeeder {
    pub fn new(sink: Box<dyn RecordSink>) -> Self {
        Self {
            sink,
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, record: Record) {
        self.pending.push(record);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flush everything buffered. A batch that fails is dropped.
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        for batch in pending.chunks(MAX_BATCH) {
            if let Err(e) = self.sink.emit(batch).await {
                error!(event.name = "export.flush_failed", dropped = batch.len(), error = %e);
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.flush().await;
        if let Err(e) = self.sink.shutdown().await {
            warn!(event.name = "export.shutdown_failed", error = %e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct CollectSink {
        batches: Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl RecordSink for Arc<CollectSink> {
        async fn emit(&self, batch: &[Record]) -> Result<(), ExportError> {
            if self.fail {
                return Err(ExportError::Sink("refused".to_owned()));
            }
            self.batches.lock().unwrap().push(batch.len());
            Ok(())
        }
    }

    fn record() -> Record {
        Record::TcpChunk(TcpChunkRecord {
            source: "netlog",
            ..TcpChunkRecord::default()
        })
    }

    #[tokio::test]
    async fn flush_splits_into_bounded_batches() {
        let sink = Arc::new(CollectSink::default());
        let mut feeder = RecordFeeder::new(Box::new(Arc::clone(&sink)));
        for _ in 0..(MAX_BATCH * 2 + 10) {
            feeder.push(record());
        }
        feeder.flush().await;
        assert_eq!(feeder.pending_len(), 0);
        assert_eq!(
            *sink.batches.lock().unwrap(),
            vec![MAX_BATCH, MAX_BATCH, 10]
        );
    }

    #[tokio::test]
    async fn failed_flush_drops_batch() {
        let sink = Arc::new(CollectSink {
            fail: true,
            ..CollectSink::default()
        });
        let mut feeder = RecordFeeder::new(Box::new(Arc::clone(&sink)));
        feeder.push(record());
        feeder.flush().await;
        // Dropped, not retained for retry.
        assert_eq!(feeder.pending_len(), 0);
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn chunk_record_serializes_expected_fields() {
        let rec = TcpChunkRecord {
            source: "netlog",
            src_ip: "10.0.0.1".to_owned(),
            chunk_id: 3,
            tcp_status: "established",
            tx_seq_min: Some(100),
            tx_seq_max: Some(900),
            ..TcpChunkRecord::default()
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"chunk_id\":3"));
        assert!(json.contains("\"tx_seq_min\":100"));
        assert!(json.contains("\"tcp_status\":\"established\""));
        // Absent costs are omitted entirely.
        assert!(!json.contains("tcp_3whs_cost"));
    }
}
