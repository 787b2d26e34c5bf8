//! HTTP/2 transaction reconstruction: connection preface, frame reassembly
//! across segment boundaries, HPACK-decoded header blocks, and per-stream
//! exchange tracking. gRPC is recognized from the request content-type and
//! its trailer status is lifted from the trailing HEADERS frame.

use fxhash::FxHashMap;
use tracing::debug;

use crate::{
    conn::key::PacketDirection,
    http::{hpack::HpackDecoder, parse_traceparent, HttpExchange},
};

/// RFC 9113 client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;

/// Upper bound on a single frame we are willing to reassemble. Larger frames
/// abort decoding of the direction's pending bytes.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Upper bound on buffered, not-yet-decodable bytes per direction.
const MAX_PENDING: usize = 256 * 1024;

const TYPE_DATA: u8 = 0x0;
const TYPE_HEADERS: u8 = 0x1;
const TYPE_RST_STREAM: u8 = 0x3;
const TYPE_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

#[derive(Debug, Default)]
struct DirState {
    buf: Vec<u8>,
    hpack: HpackDecoder,
    /// Header block spanning HEADERS + CONTINUATION frames, with the stream
    /// it belongs to and the HEADERS frame's END_STREAM bit.
    pending_headers: Option<(u32, Vec<u8>, bool)>,
}

#[derive(Debug)]
struct StreamState {
    exchange: HttpExchange,
    resp_closed: bool,
}

/// Frame-level tracker for one HTTP/2 connection.
#[derive(Debug)]
pub struct Http2Tracker {
    /// Direction that sent the preface.
    client_direction: PacketDirection,
    preface_pending: bool,
    tx: DirState,
    rx: DirState,
    streams: FxHashMap<u32, StreamState>,
    done: Vec<HttpExchange>,
    grpc: bool,
}

impl Http2Tracker {
    pub fn new(client_direction: PacketDirection) -> Self {
        Self {
            client_direction,
            preface_pending: true,
            tx: DirState::default(),
            rx: DirState::default(),
            streams: FxHashMap::default(),
            done: Vec::new(),
            grpc: false,
        }
    }

    pub fn is_grpc(&self) -> bool {
        self.grpc
    }

    fn dir_state(&mut self, direction: PacketDirection) -> &mut DirState {
        match direction {
            PacketDirection::Tx => &mut self.tx,
            PacketDirection::Rx => &mut self.rx,
        }
    }

    pub fn observe_payload(&mut self, direction: PacketDirection, payload: &[u8], ts_nanos: i64) {
        let from_client = direction == self.client_direction;
        {
            let state = self.dir_state(direction);
            if state.buf.len() + payload.len() > MAX_PENDING {
                debug!(event.name = "http2.buffer_overflow", dropped = state.buf.len());
                state.buf.clear();
            }
            state.buf.extend_from_slice(payload);
        }

        if self.preface_pending && from_client {
            let state = self.dir_state(direction);
            if state.buf.len() < PREFACE.len() {
                return;
            }
            if state.buf.starts_with(PREFACE) {
                state.buf.drain(..PREFACE.len());
            }
            self.preface_pending = false;
        }

        loop {
            let frame = {
                let state = self.dir_state(direction);
                let Some(header) = state.buf.get(..FRAME_HEADER_LEN) else {
                    break;
                };
                let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
                let typ = header[3];
                let flags = header[4];
                let stream_id =
                    u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff;

                if len > MAX_FRAME_LEN {
                    debug!(
                        event.name = "http2.frame_oversized",
                        error = %crate::error::ParseError::FrameOversized(len),
                    );
                    state.buf.clear();
                    break;
                }
                if state.buf.len() < FRAME_HEADER_LEN + len {
                    break;
                }
                let body = state.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
                state.buf.drain(..FRAME_HEADER_LEN + len);
                (typ, flags, stream_id, body)
            };
            let (typ, flags, stream_id, body) = frame;
            self.process_frame(direction, typ, flags, stream_id, &body, ts_nanos);
        }
    }

    fn process_frame(
        &mut self,
        direction: PacketDirection,
        typ: u8,
        flags: u8,
        stream_id: u32,
        body: &[u8],
        ts_nanos: i64,
    ) {
        match typ {
            TYPE_HEADERS => {
                let Some(block) = strip_headers_frame(body, flags) else {
                    return;
                };
                let end_stream = flags & FLAG_END_STREAM != 0;
                if flags & FLAG_END_HEADERS != 0 {
                    self.apply_header_block(direction, stream_id, &block, end_stream, ts_nanos);
                } else {
                    self.dir_state(direction).pending_headers =
                        Some((stream_id, block, end_stream));
                }
            }
            TYPE_CONTINUATION => {
                let state = self.dir_state(direction);
                let Some((pending_stream, mut block, end_stream)) = state.pending_headers.take()
                else {
                    return;
                };
                if pending_stream != stream_id {
                    return;
                }
                block.extend_from_slice(body);
                if flags & FLAG_END_HEADERS != 0 {
                    self.apply_header_block(direction, stream_id, &block, end_stream, ts_nanos);
                } else {
                    self.dir_state(direction).pending_headers =
                        Some((stream_id, block, end_stream));
                }
            }
            TYPE_DATA => {
                if stream_id == 0 {
                    return;
                }
                let data_len = data_payload_len(body, flags) as u64;
                let from_client = direction == self.client_direction;
                let stream = self.stream(stream_id);
                if from_client {
                    if stream.exchange.req_first_ts == 0 {
                        stream.exchange.req_first_ts = ts_nanos;
                    }
                    stream.exchange.req_last_ts = ts_nanos;
                    stream.exchange.req_bytes += data_len;
                } else {
                    if stream.exchange.resp_first_ts == 0 {
                        stream.exchange.resp_first_ts = ts_nanos;
                    }
                    stream.exchange.resp_last_ts = ts_nanos;
                    stream.exchange.resp_bytes += data_len;
                    if flags & FLAG_END_STREAM != 0 {
                        stream.resp_closed = true;
                        self.finalize(stream_id);
                    }
                }
            }
            TYPE_RST_STREAM => {
                if self.streams.contains_key(&stream_id) {
                    self.finalize(stream_id);
                }
            }
            // SETTINGS, PING, GOAWAY, WINDOW_UPDATE, PRIORITY, PUSH_PROMISE:
            // nothing to record.
            _ => {}
        }
    }

    fn stream(&mut self, stream_id: u32) -> &mut StreamState {
        self.streams.entry(stream_id).or_insert_with(|| StreamState {
            exchange: HttpExchange {
                version: "2".to_owned(),
                stream_id,
                ..HttpExchange::default()
            },
            resp_closed: false,
        })
    }

    fn apply_header_block(
        &mut self,
        direction: PacketDirection,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        ts_nanos: i64,
    ) {
        if stream_id == 0 {
            return;
        }
        let fields = match self.dir_state(direction).hpack.decode_block(block) {
            Ok(fields) => fields,
            Err(err) => {
                // Only this block is lost; the stream and connection go on.
                debug!(event.name = "http2.hpack_error", error = %err);
                return;
            }
        };

        let from_client = direction == self.client_direction;
        let mut grpc_request = false;
        {
            let client_direction = self.client_direction;
            let stream = self.stream(stream_id);
            let exchange = &mut stream.exchange;
            for (name, value) in fields {
                match name.as_str() {
                    ":method" => exchange.method = value,
                    ":path" => exchange.path = value,
                    ":authority" => exchange.host = value,
                    ":status" => {
                        exchange.status = value.parse().unwrap_or(crate::http::STATUS_UNKNOWN)
                    }
                    "content-type" if from_client => {
                        grpc_request = value.starts_with("application/grpc");
                    }
                    "grpc-status" => exchange.grpc_status = value.parse().ok(),
                    "traceparent" if from_client => {
                        if let Some((trace, parent)) = parse_traceparent(&value) {
                            exchange.trace_id = trace;
                            exchange.parent_id = parent;
                        }
                    }
                    _ => {}
                }
            }

            if from_client {
                exchange.request_direction = Some(client_direction);
                if exchange.req_first_ts == 0 {
                    exchange.req_first_ts = ts_nanos;
                }
                exchange.req_last_ts = ts_nanos;
            } else {
                if exchange.resp_first_ts == 0 {
                    exchange.resp_first_ts = ts_nanos;
                }
                exchange.resp_last_ts = ts_nanos;
                if end_stream {
                    stream.resp_closed = true;
                }
            }
        }

        if grpc_request {
            self.grpc = true;
        }
        if !from_client && end_stream {
            self.finalize(stream_id);
        }
    }

    fn finalize(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.remove(&stream_id) {
            let mut exchange = stream.exchange;
            exchange.finished = stream.resp_closed;
            self.done.push(exchange);
        }
    }

    pub fn drain(&mut self, keep_unfinished: bool) -> Vec<HttpExchange> {
        let mut out = std::mem::take(&mut self.done);
        if !keep_unfinished {
            out.extend(
                std::mem::take(&mut self.streams)
                    .into_values()
                    .map(|s| s.exchange),
            );
        }
        out
    }
}

/// HEADERS payload after padding and priority, per PADDED/PRIORITY flags.
fn strip_headers_frame(body: &[u8], flags: u8) -> Option<Vec<u8>> {
    let mut start = 0usize;
    let mut end = body.len();
    if flags & FLAG_PADDED != 0 {
        let pad = *body.first()? as usize;
        start += 1;
        end = end.checked_sub(pad)?;
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5;
    }
    (start <= end).then(|| body[start..end].to_vec())
}

/// DATA payload length after padding.
fn data_payload_len(body: &[u8], flags: u8) -> usize {
    if flags & FLAG_PADDED != 0 {
        let Some(&pad) = body.first() else { return 0 };
        body.len().saturating_sub(1 + pad as usize)
    } else {
        body.len()
    }
}
