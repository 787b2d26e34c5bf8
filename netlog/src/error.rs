use thiserror::Error;

/// Packet-source read and setup failures. Never fatal to other interfaces:
/// the capture loop logs, backs off, and retries.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("packet source i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no capture channel available for interface {iface}")]
    ChannelUnavailable { iface: String },
}

/// Malformed L7 payload. Always local to the packet that carried it;
/// connection state is preserved and processing continues.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("http2 frame length {0} exceeds payload bound")]
    FrameOversized(usize),

    #[error("hpack integer overflow")]
    HpackInteger,

    #[error("hpack index {0} out of table range")]
    HpackIndex(usize),

    #[error("hpack string exceeds block bounds")]
    HpackString,
}

/// Sink-side failures. The affected flush is logged and dropped; there is
/// no durable retry queue, to bound memory.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sink write failed: {0}")]
    Sink(String),
}

/// Startup configuration failures. An invalid filter rule disables only the
/// filter feature; capture continues unfiltered.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file provided")]
    NoConfigFile,

    #[error("configuration error: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("invalid filter rule {rule:?}: {reason}")]
    FilterRule { rule: String, reason: String },

    #[error("no capture interfaces configured")]
    NoInterfaces,
}
