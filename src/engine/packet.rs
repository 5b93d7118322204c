//! Engine packet framing.
//!
//! One packet is one frame: a single ASCII digit type prefix followed by
//! the payload. Binary MESSAGE payloads travel as raw binary frames on
//! transports that support them; on long-poll they are base64-encoded with
//! a `b` prefix instead of the digit. A long-poll batch concatenates
//! frames as `<length>:<frame>` where length is the character count.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::error::DecodeError;

/// Lowest-level framed unit carried by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    /// Handshake parameters, JSON-encoded.
    Open(String),
    /// Request closing of the transport.
    Close,
    /// Heartbeat probe; carries "probe" during a transport upgrade.
    Ping(String),
    /// Heartbeat reply.
    Pong(String),
    /// A messaging-layer text frame.
    Message(String),
    /// A messaging-layer binary frame.
    Binary(Bytes),
    /// Commits a transport upgrade.
    Upgrade,
    /// Forces a packet flush; releases a hanging poll.
    Noop,
}

impl EnginePacket {
    pub fn type_digit(&self) -> char {
        match self {
            EnginePacket::Open(_) => '0',
            EnginePacket::Close => '1',
            EnginePacket::Ping(_) => '2',
            EnginePacket::Pong(_) => '3',
            EnginePacket::Message(_) | EnginePacket::Binary(_) => '4',
            EnginePacket::Upgrade => '5',
            EnginePacket::Noop => '6',
        }
    }

    /// Encode as a text frame. Binary payloads become `b<base64>`.
    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(data) => format!("0{}", data),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{}", data),
            EnginePacket::Pong(data) => format!("3{}", data),
            EnginePacket::Message(data) => format!("4{}", data),
            EnginePacket::Binary(data) => format!("b{}", BASE64.encode(data)),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }

    /// Decode a text frame.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let mut chars = frame.chars();
        let prefix = chars.next().ok_or(DecodeError::EmptyPacket)?;
        let rest = chars.as_str();
        match prefix {
            '0' => Ok(EnginePacket::Open(rest.to_string())),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(rest.to_string())),
            '3' => Ok(EnginePacket::Pong(rest.to_string())),
            '4' => Ok(EnginePacket::Message(rest.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            'b' => BASE64
                .decode(rest)
                .map(|data| EnginePacket::Binary(Bytes::from(data)))
                .map_err(|_| DecodeError::InvalidBase64),
            other => Err(DecodeError::InvalidPacketType(other)),
        }
    }

    /// Decode a raw binary frame (stream transports carry binary payloads
    /// without any prefix).
    pub fn decode_binary(data: Bytes) -> Self {
        EnginePacket::Binary(data)
    }
}

/// OPEN handshake payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: String,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: usize,
}

impl OpenPacket {
    pub fn new(sid: &str, upgrades: Vec<String>, config: &ServerConfig) -> Self {
        Self {
            sid: sid.to_string(),
            upgrades,
            ping_interval: config.ping_interval_ms(),
            ping_timeout: config.ping_timeout_ms(),
            max_payload: config.max_payload,
        }
    }

    pub fn into_packet(self) -> EnginePacket {
        // OpenPacket serialization cannot fail: all fields are plain data.
        EnginePacket::Open(serde_json::to_string(&self).unwrap_or_default())
    }
}

/// Encode a batch of frames for one long-poll response, stopping before
/// `max_payload` characters would be exceeded. Returns the body and how
/// many packets were consumed; at least one packet is always taken so an
/// oversized single frame cannot wedge the buffer.
pub fn encode_polling_payload(packets: &[EnginePacket], max_payload: usize) -> (String, usize) {
    let mut body = String::new();
    let mut taken = 0;
    for packet in packets {
        let frame = packet.encode();
        let entry = format!("{}:{}", frame.chars().count(), frame);
        if taken > 0 && body.chars().count() + entry.chars().count() > max_payload {
            break;
        }
        body.push_str(&entry);
        taken += 1;
    }
    (body, taken)
}

/// Decode a long-poll batch body into its frames.
pub fn decode_polling_payload(body: &str) -> Result<Vec<EnginePacket>, DecodeError> {
    let mut packets = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let colon = rest.find(':').ok_or(DecodeError::InvalidFraming)?;
        let len: usize = rest[..colon]
            .parse()
            .map_err(|_| DecodeError::InvalidFraming)?;
        rest = &rest[colon + 1..];

        let end = if len == 0 {
            0
        } else {
            match rest.char_indices().nth(len - 1) {
                Some((idx, c)) => idx + c.len_utf8(),
                None => return Err(DecodeError::PrematureEnd),
            }
        };
        packets.push(EnginePacket::decode(&rest[..end])?);
        rest = &rest[end..];
    }
    if packets.is_empty() {
        return Err(DecodeError::EmptyPacket);
    }
    Ok(packets)
}
