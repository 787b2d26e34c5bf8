//! HTTP/1.x transaction reconstruction from raw segment payloads.
//!
//! Only segment-leading lines are examined: a request line or status line
//! split across segments is missed, which matches what a per-packet observer
//! can see without reassembly. Pipelining is not modelled; at most one
//! exchange is in flight plus one finished exchange awaiting its ack echo.

use crate::{
    conn::key::PacketDirection,
    http::{parse_traceparent, HttpExchange, STATUS_UNKNOWN},
};

const METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Whether a payload plausibly opens an HTTP/1.x conversation.
pub fn sniff(payload: &[u8]) -> bool {
    parse_request_line(payload).is_some() || payload.starts_with(b"HTTP/1.")
}

/// (method, path, version) from a segment-leading request line.
fn parse_request_line(payload: &[u8]) -> Option<(String, String, String)> {
    let line_end = payload
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(payload.len());
    let line = std::str::from_utf8(&payload[..line_end]).ok()?;

    let mut parts = line.splitn(3, ' ');
    let method = parts.next()?;
    if !METHODS.contains(&method) {
        return None;
    }
    let path = parts.next()?;
    let version = parts.next()?.strip_prefix("HTTP/")?;
    Some((method.to_owned(), path.to_owned(), version.to_owned()))
}

/// Status code from a segment-leading status line, [`STATUS_UNKNOWN`] when
/// the line is recognizably HTTP but the code does not parse.
fn parse_status_line(payload: &[u8]) -> Option<i32> {
    if !payload.starts_with(b"HTTP/1.") {
        return None;
    }
    let line_end = payload
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(payload.len());
    let line = std::str::from_utf8(&payload[..line_end]).ok()?;
    let code = line.split(' ').nth(1).and_then(|s| s.parse::<i32>().ok());
    Some(code.unwrap_or(STATUS_UNKNOWN))
}

/// Named header value, scanned only within this segment's header bytes.
fn scan_header(payload: &[u8], wanted: &str) -> Option<String> {
    for line in payload.split(|&b| b == b'\n') {
        if line.is_empty() || line == b"\r" {
            break;
        }
        let Ok(line) = std::str::from_utf8(line) else {
            break;
        };
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case(wanted) {
            return Some(value.trim().trim_end_matches('\r').to_owned());
        }
    }
    None
}

#[derive(Debug, Default)]
pub struct Http1Tracker {
    current: Option<HttpExchange>,
    /// Response fully parsed, waiting for the client ack that confirms
    /// delivery of its last byte.
    awaiting_ack: Option<HttpExchange>,
    done: Vec<HttpExchange>,
    /// Ack value that closes `awaiting_ack` or the current response:
    /// seq + len of the newest response segment.
    expected_ack: Option<u32>,
}

impl Http1Tracker {
    pub fn observe_payload(
        &mut self,
        direction: PacketDirection,
        seq: u32,
        payload: &[u8],
        ts_nanos: i64,
    ) {
        if payload.is_empty() {
            return;
        }

        if let Some((method, path, version)) = parse_request_line(payload) {
            // A new request supersedes whatever came before it.
            self.finish_current();
            let (trace_id, parent_id) = scan_header(payload, "traceparent")
                .and_then(|v| parse_traceparent(&v))
                .unwrap_or_default();
            self.current = Some(HttpExchange {
                method,
                path,
                version,
                host: scan_header(payload, "host").unwrap_or_default(),
                trace_id,
                parent_id,
                request_direction: Some(direction),
                req_first_ts: ts_nanos,
                req_last_ts: ts_nanos,
                req_bytes: payload.len() as u64,
                ..HttpExchange::default()
            });
            return;
        }

        if let Some(status) = parse_status_line(payload) {
            // Response without an observed request: capture started
            // mid-exchange. Track it anyway for the status tally.
            let exchange = self.current.get_or_insert_with(|| HttpExchange {
                version: "1.1".to_owned(),
                ..HttpExchange::default()
            });
            exchange.status = status;
            exchange.resp_first_ts = ts_nanos;
            exchange.resp_last_ts = ts_nanos;
            exchange.resp_bytes += payload.len() as u64;
            self.expected_ack = Some(seq.wrapping_add(payload.len() as u32));
            return;
        }

        // Continuation bytes, attributed by direction.
        if let Some(exchange) = &mut self.current {
            if exchange.request_direction == Some(direction) {
                exchange.req_last_ts = ts_nanos;
                exchange.req_bytes += payload.len() as u64;
            } else if exchange.resp_first_ts != 0 {
                exchange.resp_last_ts = ts_nanos;
                exchange.resp_bytes += payload.len() as u64;
                self.expected_ack = Some(seq.wrapping_add(payload.len() as u32));
            }
        }
    }

    /// A bare ack from the requester echoing the last response byte means
    /// the exchange is fully delivered.
    pub fn observe_ack(&mut self, direction: PacketDirection, ack: u32) {
        if self.expected_ack != Some(ack) {
            return;
        }
        let requester = self
            .current
            .as_ref()
            .or(self.awaiting_ack.as_ref())
            .and_then(|e| e.request_direction);
        if requester.is_some() && requester != Some(direction) {
            return;
        }

        self.expected_ack = None;
        if let Some(mut exchange) = self.awaiting_ack.take() {
            exchange.finished = true;
            self.done.push(exchange);
        } else if self.current.as_ref().is_some_and(|e| e.resp_first_ts != 0) {
            let mut exchange = self.current.take().expect("checked above");
            exchange.finished = true;
            self.done.push(exchange);
        }
    }

    /// Park or complete the in-flight exchange because a new request began.
    fn finish_current(&mut self) {
        if let Some(mut exchange) = self.awaiting_ack.take() {
            exchange.finished = true;
            self.done.push(exchange);
        }
        if let Some(mut exchange) = self.current.take() {
            if exchange.resp_first_ts != 0 {
                // Response seen but its ack echo has not arrived yet.
                exchange.finished = true;
                self.awaiting_ack = Some(exchange);
            } else {
                // Request never answered.
                self.done.push(exchange);
            }
        }
    }

    pub fn drain(&mut self, keep_unfinished: bool) -> Vec<HttpExchange> {
        let mut out = std::mem::take(&mut self.done);
        if let Some(mut exchange) = self.awaiting_ack.take() {
            exchange.finished = true;
            out.push(exchange);
        }
        if !keep_unfinished {
            if let Some(exchange) = self.current.take() {
                self.expected_ack = None;
                out.push(exchange);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQ: &[u8] = b"GET /api/v1/items HTTP/1.1\r\nHost: shop.example\r\n\r\n";
    const RESP: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

    #[test]
    fn sniff_accepts_requests_and_responses_only() {
        assert!(sniff(REQ));
        assert!(sniff(RESP));
        assert!(!sniff(b"\x16\x03\x01\x02\x00"));
        assert!(!sniff(b"GETX / HTTP/1.1\r\n"));
    }

    #[test]
    fn simple_exchange_completed_by_ack_echo() {
        let mut t = Http1Tracker::default();
        t.observe_payload(PacketDirection::Tx, 1, REQ, 1_000);
        t.observe_payload(PacketDirection::Rx, 1, RESP, 2_000);
        // Ack from the requester for seq 1 + len.
        t.observe_ack(PacketDirection::Tx, 1 + RESP.len() as u32);

        let done = t.drain(true);
        assert_eq!(done.len(), 1);
        let e = &done[0];
        assert_eq!(e.method, "GET");
        assert_eq!(e.path, "/api/v1/items");
        assert_eq!(e.host, "shop.example");
        assert_eq!(e.version, "1.1");
        assert_eq!(e.status, 200);
        assert!(e.finished);
        assert_eq!(e.wait_cost(), Some(1_000));
    }

    #[test]
    fn ack_from_responder_does_not_finish() {
        let mut t = Http1Tracker::default();
        t.observe_payload(PacketDirection::Tx, 1, REQ, 1_000);
        t.observe_payload(PacketDirection::Rx, 1, RESP, 2_000);
        t.observe_ack(PacketDirection::Rx, 1 + RESP.len() as u32);
        assert!(t.drain(true).is_empty());
    }

    #[test]
    fn new_request_supersedes_unacked_exchange() {
        let mut t = Http1Tracker::default();
        t.observe_payload(PacketDirection::Tx, 1, REQ, 1_000);
        t.observe_payload(PacketDirection::Rx, 1, RESP, 2_000);
        // Next request arrives before the final ack was seen.
        t.observe_payload(PacketDirection::Tx, 100, REQ, 3_000);

        let done = t.drain(true);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, 200);
        assert!(done[0].finished);
        // The new request is still in flight.
        assert_eq!(t.drain(false).len(), 1);
    }

    #[test]
    fn malformed_status_keeps_sentinel() {
        let mut t = Http1Tracker::default();
        t.observe_payload(PacketDirection::Tx, 1, REQ, 1_000);
        t.observe_payload(PacketDirection::Rx, 1, b"HTTP/1.1 abc\r\n\r\n", 2_000);
        let done = t.drain(false);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, STATUS_UNKNOWN);
    }

    #[test]
    fn response_body_continuation_accumulates() {
        let mut t = Http1Tracker::default();
        t.observe_payload(PacketDirection::Tx, 1, REQ, 1_000);
        t.observe_payload(PacketDirection::Rx, 1, RESP, 2_000);
        t.observe_payload(PacketDirection::Rx, 1 + RESP.len() as u32, b"more-body", 3_000);
        let done = t.drain(false);
        assert_eq!(done[0].resp_bytes, RESP.len() as u64 + 9);
        assert_eq!(done[0].download_cost(), Some(1_000));
    }

    #[test]
    fn traceparent_header_carried_on_exchange() {
        let mut t = Http1Tracker::default();
        let req = b"GET / HTTP/1.1\r\nHost: a\r\n\
                    traceparent: 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01\r\n\r\n";
        t.observe_payload(PacketDirection::Tx, 1, req, 1_000);
        let done = t.drain(false);
        assert_eq!(done[0].trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(done[0].parent_id, "b7ad6b7169203331");
    }

    #[test]
    fn garbled_traceparent_left_empty() {
        let mut t = Http1Tracker::default();
        let req = b"GET / HTTP/1.1\r\ntraceparent: zz-bad\r\n\r\n";
        t.observe_payload(PacketDirection::Tx, 1, req, 1_000);
        let done = t.drain(false);
        assert!(done[0].trace_id.is_empty());
        assert!(done[0].parent_id.is_empty());
    }

    #[test]
    fn lone_response_still_tracked() {
        let mut t = Http1Tracker::default();
        t.observe_payload(PacketDirection::Rx, 1, RESP, 2_000);
        let done = t.drain(false);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, 200);
        assert!(done[0].request_direction.is_none());
    }
}
