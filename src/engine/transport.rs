//! Transport handles.
//!
//! A session owns exactly one transport at a time. Long-poll keeps packets
//! in the session's write buffer until a GET drains them; the handle only
//! carries the wakeup. Websocket pushes frames into an unbounded channel
//! drained by the connection task that owns the actix-ws session.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use super::packet::EnginePacket;
use crate::error::Error;

/// Buffered-frame count above which a websocket peer is considered slow
/// and volatile packets are dropped. Polling peers are considered slow
/// whenever their buffer is non-empty.
pub const WS_VOLATILE_THRESHOLD: usize = 128;

/// Wire frame handed to the websocket writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Bytes),
}

impl From<&EnginePacket> for WsFrame {
    fn from(packet: &EnginePacket) -> Self {
        match packet {
            // Stream transports carry binary payloads raw, no prefix.
            EnginePacket::Binary(data) => WsFrame::Binary(data.clone()),
            other => WsFrame::Text(other.encode()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Polling,
    Websocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::Websocket => "websocket",
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "polling" => Ok(TransportKind::Polling),
            "websocket" => Ok(TransportKind::Websocket),
            _ => Err(Error::UnknownTransport),
        }
    }
}

/// The byte carrier beneath a session.
#[derive(Debug)]
pub enum Transport {
    Polling {
        /// Wakes a GET waiting for packets.
        notify: Arc<Notify>,
    },
    Websocket {
        tx: mpsc::UnboundedSender<WsFrame>,
    },
}

impl Transport {
    pub fn polling() -> Self {
        Transport::Polling {
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn websocket(tx: mpsc::UnboundedSender<WsFrame>) -> Self {
        Transport::Websocket { tx }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Polling { .. } => TransportKind::Polling,
            Transport::Websocket { .. } => TransportKind::Websocket,
        }
    }

    /// Whether a volatile packet may be enqueued given the current buffer
    /// depth.
    pub fn writable(&self, buffered: usize) -> bool {
        match self {
            Transport::Polling { .. } => buffered == 0,
            Transport::Websocket { tx } => !tx.is_closed() && buffered < WS_VOLATILE_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names_parse_both_ways() {
        assert_eq!(
            "polling".parse::<TransportKind>().unwrap(),
            TransportKind::Polling
        );
        assert_eq!(
            "websocket".parse::<TransportKind>().unwrap(),
            TransportKind::Websocket
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Polling.as_str(), "polling");
    }

    #[test]
    fn ws_frames_keep_binary_raw() {
        let frame = WsFrame::from(&EnginePacket::Binary(Bytes::from_static(b"\x00\x01")));
        assert_eq!(frame, WsFrame::Binary(Bytes::from_static(b"\x00\x01")));
        let frame = WsFrame::from(&EnginePacket::Ping("probe".into()));
        assert_eq!(frame, WsFrame::Text("2probe".into()));
    }

    #[test]
    fn writability_thresholds() {
        let polling = Transport::polling();
        assert!(polling.writable(0));
        assert!(!polling.writable(1));

        let (tx, _rx) = mpsc::unbounded_channel();
        let ws = Transport::websocket(tx);
        assert!(ws.writable(WS_VOLATILE_THRESHOLD - 1));
        assert!(!ws.writable(WS_VOLATILE_THRESHOLD));
    }
}
