//! Link-layer packet acquisition.
//!
//! A [`PacketSource`] yields raw frames with capture timestamps; the live
//! implementation reads a `pnet` datalink channel. The trait seam keeps the
//! engine testable with synthetic frames.

use std::time::{SystemTime, UNIX_EPOCH};

use pnet::datalink::{self, Channel, DataLinkReceiver, NetworkInterface};

use crate::error::CaptureError;

/// One captured frame, link-layer bytes plus receive timestamp.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub ts_nanos: i64,
}

/// Blocking source of link-layer frames.
pub trait PacketSource: Send {
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Live capture from one NIC via a datalink channel.
pub struct DatalinkSource {
    rx: Box<dyn DataLinkReceiver>,
}

impl DatalinkSource {
    pub fn open(iface: &NetworkInterface) -> Result<Self, CaptureError> {
        match datalink::channel(iface, datalink::Config::default()) {
            Ok(Channel::Ethernet(_tx, rx)) => Ok(Self { rx }),
            Ok(_) => Err(CaptureError::ChannelUnavailable {
                iface: iface.name.clone(),
            }),
            Err(e) => Err(CaptureError::Io(e)),
        }
    }
}

impl PacketSource for DatalinkSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let data = self.rx.next()?;
        Ok(Frame {
            data: data.to_vec(),
            ts_nanos: now_nanos(),
        })
    }
}

/// Wall-clock nanoseconds; all record timestamps use this clock.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
