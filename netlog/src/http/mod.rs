//! L7 transaction reconstruction over tracked TCP connections.
//!
//! The protocol for a connection is decided once, from its first payload
//! bytes, and never re-examined: an HTTP/2 client preface promotes the
//! connection to the frame decoder, a plausible HTTP/1 request or status
//! line selects the text parser, anything else marks the connection opaque.

pub mod h1;
pub mod h2;
pub mod hpack;

use tracing::debug;

use crate::conn::key::PacketDirection;

/// Value reported while no status line (or `:status` field) was parsed, and
/// kept when the response turned out to be malformed.
pub const STATUS_UNKNOWN: i32 = -1;

/// Wire protocol spoken on a connection, as exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L7Protocol {
    Http1,
    Http2,
    Grpc,
}

impl L7Protocol {
    pub const fn as_str(&self) -> &'static str {
        match self {
            L7Protocol::Http1 => "http",
            L7Protocol::Http2 => "http2",
            L7Protocol::Grpc => "grpc",
        }
    }
}

/// trace-id and parent-id halves of a W3C `traceparent` header value,
/// e.g. `00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`.
pub(crate) fn parse_traceparent(value: &str) -> Option<(String, String)> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace = parts.next()?;
    let parent = parts.next()?;
    let ok = version.len() == 2
        && trace.len() == 32
        && parent.len() == 16
        && trace.bytes().all(|b| b.is_ascii_hexdigit())
        && parent.bytes().all(|b| b.is_ascii_hexdigit())
        && trace.bytes().any(|b| b != b'0');
    ok.then(|| (trace.to_owned(), parent.to_owned()))
}

/// One reconstructed request/response pair.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    pub method: String,
    pub path: String,
    pub host: String,
    /// Application trace context carried on the request's `traceparent`
    /// header, when one was seen. Empty otherwise.
    pub trace_id: String,
    pub parent_id: String,
    /// "1.0", "1.1" or "2".
    pub version: String,
    pub status: i32,
    pub grpc_status: Option<i32>,
    /// h2 stream the exchange rode on; 0 for HTTP/1.
    pub stream_id: u32,
    /// Direction the request travelled in, when a request was seen.
    pub request_direction: Option<PacketDirection>,
    pub req_first_ts: i64,
    pub req_last_ts: i64,
    pub resp_first_ts: i64,
    pub resp_last_ts: i64,
    pub req_bytes: u64,
    pub resp_bytes: u64,
    pub finished: bool,
}

impl Default for HttpExchange {
    fn default() -> Self {
        Self {
            method: String::new(),
            path: String::new(),
            host: String::new(),
            trace_id: String::new(),
            parent_id: String::new(),
            version: String::new(),
            status: STATUS_UNKNOWN,
            grpc_status: None,
            stream_id: 0,
            request_direction: None,
            req_first_ts: 0,
            req_last_ts: 0,
            resp_first_ts: 0,
            resp_last_ts: 0,
            req_bytes: 0,
            resp_bytes: 0,
            finished: false,
        }
    }
}

impl HttpExchange {
    /// Server think time: first response byte minus last request byte.
    pub fn wait_cost(&self) -> Option<i64> {
        (self.req_last_ts != 0 && self.resp_first_ts >= self.req_last_ts)
            .then(|| self.resp_first_ts - self.req_last_ts)
    }

    /// Time spent sending the request body.
    pub fn req_sent_cost(&self) -> Option<i64> {
        (self.req_first_ts != 0 && self.req_last_ts >= self.req_first_ts)
            .then(|| self.req_last_ts - self.req_first_ts)
    }

    /// Time spent receiving the response body.
    pub fn download_cost(&self) -> Option<i64> {
        (self.resp_first_ts != 0 && self.resp_last_ts >= self.resp_first_ts)
            .then(|| self.resp_last_ts - self.resp_first_ts)
    }
}

#[derive(Debug, Default)]
enum Detection {
    #[default]
    Undecided,
    Http1(h1::Http1Tracker),
    Http2(h2::Http2Tracker),
    Opaque,
}

/// Per-connection L7 state: protocol detection plus the active parser.
#[derive(Debug, Default)]
pub struct L7Tracker {
    detection: Detection,
}

impl L7Tracker {
    /// Protocol label for export, once known.
    pub fn protocol(&self) -> Option<L7Protocol> {
        match &self.detection {
            Detection::Undecided | Detection::Opaque => None,
            Detection::Http1(_) => Some(L7Protocol::Http1),
            Detection::Http2(t) => Some(if t.is_grpc() {
                L7Protocol::Grpc
            } else {
                L7Protocol::Http2
            }),
        }
    }

    /// Feed one payload-bearing segment, already deduplicated by the TCP
    /// layer (retransmissions never reach here). `seq` is the segment's
    /// sequence number, used to recognize the ack that echoes its last byte.
    pub fn observe_payload(
        &mut self,
        direction: PacketDirection,
        seq: u32,
        payload: &[u8],
        ts_nanos: i64,
    ) {
        if let Detection::Undecided = self.detection {
            self.detection = if payload.starts_with(h2::PREFACE) {
                debug!(event.name = "l7.detected", proto = "http2");
                Detection::Http2(h2::Http2Tracker::new(direction))
            } else if h1::sniff(payload) {
                debug!(event.name = "l7.detected", proto = "http");
                Detection::Http1(h1::Http1Tracker::default())
            } else {
                Detection::Opaque
            };
        }

        match &mut self.detection {
            Detection::Http1(tracker) => {
                tracker.observe_payload(direction, seq, payload, ts_nanos)
            }
            Detection::Http2(tracker) => tracker.observe_payload(direction, payload, ts_nanos),
            Detection::Undecided | Detection::Opaque => {}
        }
    }

    /// Feed a bare ACK; completes an HTTP/1 exchange whose final response
    /// byte it echoes.
    pub fn observe_ack(&mut self, direction: PacketDirection, ack: u32) {
        if let Detection::Http1(tracker) = &mut self.detection {
            tracker.observe_ack(direction, ack);
        }
    }

    /// Drop all L7 state for a connection that turned out to speak gRPC.
    /// Returns true when state was discarded; the connection stays opaque.
    pub fn discard_if_grpc(&mut self) -> bool {
        if matches!(&self.detection, Detection::Http2(t) if t.is_grpc()) {
            debug!(event.name = "l7.grpc_discarded");
            self.detection = Detection::Opaque;
            return true;
        }
        false
    }

    /// Take completed exchanges. With `keep_unfinished` the in-progress
    /// exchange stays behind for a later sweep; without it everything is
    /// surrendered, finished or not.
    pub fn drain(&mut self, keep_unfinished: bool) -> Vec<HttpExchange> {
        match &mut self.detection {
            Detection::Http1(tracker) => tracker.drain(keep_unfinished),
            Detection::Http2(tracker) => tracker.drain(keep_unfinished),
            Detection::Undecided | Detection::Opaque => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_payload_never_reexamined() {
        let mut l7 = L7Tracker::default();
        l7.observe_payload(PacketDirection::Tx, 1, b"\x16\x03\x01\x02\x00", 1);
        assert_eq!(l7.protocol(), None);
        // A later payload that happens to look like HTTP must not flip the
        // decision.
        l7.observe_payload(PacketDirection::Tx, 1, b"GET / HTTP/1.1\r\n\r\n", 2);
        assert_eq!(l7.protocol(), None);
        assert!(l7.drain(false).is_empty());
    }

    #[test]
    fn http1_detected_from_request_line() {
        let mut l7 = L7Tracker::default();
        l7.observe_payload(PacketDirection::Tx, 1, b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n", 1);
        assert_eq!(l7.protocol(), Some(L7Protocol::Http1));
    }

    #[test]
    fn http2_detected_from_preface() {
        let mut l7 = L7Tracker::default();
        l7.observe_payload(PacketDirection::Tx, 1, h2::PREFACE, 1);
        assert_eq!(l7.protocol(), Some(L7Protocol::Http2));
    }

    #[test]
    fn grpc_connection_discarded_when_disabled() {
        let mut l7 = L7Tracker::default();
        // Preface then a request HEADERS carrying a gRPC content-type.
        let mut bytes = h2::PREFACE.to_vec();
        let mut block = vec![0x82, 0x84, 0x0f, 0x10, 0x10];
        block.extend_from_slice(b"application/grpc");
        let mut frame = Vec::new();
        frame.extend_from_slice(&(block.len() as u32).to_be_bytes()[1..]);
        frame.push(0x1); // HEADERS
        frame.push(0x4); // END_HEADERS
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.extend_from_slice(&block);
        bytes.extend_from_slice(&frame);
        l7.observe_payload(PacketDirection::Tx, 1, &bytes, 1);
        assert_eq!(l7.protocol(), Some(L7Protocol::Grpc));

        assert!(l7.discard_if_grpc());
        assert_eq!(l7.protocol(), None);
        assert!(l7.drain(false).is_empty());
        // Later payload must not re-promote the connection.
        l7.observe_payload(PacketDirection::Tx, 2, h2::PREFACE, 2);
        assert_eq!(l7.protocol(), None);
    }

    #[test]
    fn non_grpc_http2_survives_the_grpc_gate() {
        let mut l7 = L7Tracker::default();
        l7.observe_payload(PacketDirection::Tx, 1, h2::PREFACE, 1);
        assert!(!l7.discard_if_grpc());
        assert_eq!(l7.protocol(), Some(L7Protocol::Http2));
    }

    #[test]
    fn traceparent_parsing() {
        let (trace, parent) = parse_traceparent(
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        )
        .unwrap();
        assert_eq!(trace, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(parent, "b7ad6b7169203331");

        assert!(parse_traceparent("not-a-traceparent").is_none());
        // All-zero trace ids are defined as invalid.
        assert!(parse_traceparent(
            "00-00000000000000000000000000000000-b7ad6b7169203331-01"
        )
        .is_none());
        assert!(parse_traceparent("00-0af7-b7ad-01").is_none());
    }
}
