//! Messaging-layer packet grammar.
//!
//! Textual form: `<type-digit>[<#attachments>-][<namespace>,][<ackId>][<json>]`.
//! Binary attachments travel as separate engine frames immediately after
//! the textual frame; [`decoder::PacketDecoder`] reassembles them.

pub mod decoder;

use std::collections::HashSet;

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::engine::packet::EnginePacket;
use crate::error::DecodeError;
use crate::payload::Value;

/// Event names owned by the protocol itself. They are never dispatched to
/// application listeners when they arrive from the wire.
pub static RESERVED_EVENTS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "connect",
        "connect_error",
        "disconnect",
        "disconnecting",
        "newListener",
        "removeListener",
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl PacketType {
    pub fn from_digit(digit: char) -> Option<Self> {
        match digit {
            '0' => Some(Self::Connect),
            '1' => Some(Self::Disconnect),
            '2' => Some(Self::Event),
            '3' => Some(Self::Ack),
            '4' => Some(Self::ConnectError),
            '5' => Some(Self::BinaryEvent),
            '6' => Some(Self::BinaryAck),
            _ => None,
        }
    }

    pub fn is_binary(self) -> bool {
        matches!(self, Self::BinaryEvent | Self::BinaryAck)
    }
}

/// One messaging packet: type, namespace, optional ack id, JSON data (with
/// placeholder nodes standing in for binary), and the binary attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub nsp: String,
    pub id: Option<u64>,
    pub data: serde_json::Value,
    pub attachments: Vec<Bytes>,
    /// Attachment count announced on the wire; equals `attachments.len()`
    /// once the packet is complete.
    pub attachment_count: usize,
}

impl Packet {
    fn new(packet_type: PacketType, nsp: &str) -> Self {
        Self {
            packet_type,
            nsp: nsp.to_string(),
            id: None,
            data: serde_json::Value::Null,
            attachments: Vec::new(),
            attachment_count: 0,
        }
    }

    /// Server CONNECT reply carrying the namespace socket id.
    pub fn connect(nsp: &str, sid: &str) -> Self {
        let mut packet = Self::new(PacketType::Connect, nsp);
        packet.data = serde_json::json!({ "sid": sid });
        packet
    }

    /// Client CONNECT request with optional auth payload.
    pub fn connect_request(nsp: &str, auth: serde_json::Value) -> Self {
        let mut packet = Self::new(PacketType::Connect, nsp);
        packet.data = auth;
        packet
    }

    pub fn disconnect(nsp: &str) -> Self {
        Self::new(PacketType::Disconnect, nsp)
    }

    pub fn connect_error(nsp: &str, message: &str, data: Option<serde_json::Value>) -> Self {
        let mut packet = Self::new(PacketType::ConnectError, nsp);
        packet.data = match data {
            Some(extra) => serde_json::json!({ "message": message, "data": extra }),
            None => serde_json::json!({ "message": message }),
        };
        packet
    }

    /// EVENT (or BINARY_EVENT when any arg carries binary). `args` become
    /// the wire array `[event, ...args]`.
    pub fn event(nsp: &str, event: &str, args: Vec<Value>) -> Result<Self, DecodeError> {
        let mut attachments = Vec::new();
        let mut wire = Vec::with_capacity(args.len() + 1);
        wire.push(serde_json::Value::String(event.to_string()));
        for arg in &args {
            wire.push(arg.to_wire(&mut attachments)?);
        }
        let packet_type = if attachments.is_empty() {
            PacketType::Event
        } else {
            PacketType::BinaryEvent
        };
        let mut packet = Self::new(packet_type, nsp);
        packet.data = serde_json::Value::Array(wire);
        packet.attachment_count = attachments.len();
        packet.attachments = attachments;
        Ok(packet)
    }

    /// ACK (or BINARY_ACK) reply for `id`.
    pub fn ack(nsp: &str, id: u64, args: Vec<Value>) -> Result<Self, DecodeError> {
        let mut attachments = Vec::new();
        let mut wire = Vec::with_capacity(args.len());
        for arg in &args {
            wire.push(arg.to_wire(&mut attachments)?);
        }
        let packet_type = if attachments.is_empty() {
            PacketType::Ack
        } else {
            PacketType::BinaryAck
        };
        let mut packet = Self::new(packet_type, nsp);
        packet.id = Some(id);
        packet.data = serde_json::Value::Array(wire);
        packet.attachment_count = attachments.len();
        packet.attachments = attachments;
        Ok(packet)
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Encode the textual frame. Attachments are carried separately.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(char::from_digit(self.packet_type as u32, 10).unwrap_or('0'));

        if self.packet_type.is_binary() {
            out.push_str(&self.attachment_count.to_string());
            out.push('-');
        }

        if self.nsp != "/" {
            out.push_str(&self.nsp);
            out.push(',');
        }

        if let Some(id) = self.id {
            out.push_str(&id.to_string());
        }

        if !self.data.is_null() {
            out.push_str(&self.data.to_string());
        }

        out
    }

    /// Encode to engine frames: one MESSAGE plus one binary frame per
    /// attachment. This is the unit the adapter pre-encodes and fans out.
    pub fn to_engine_frames(&self) -> Vec<EnginePacket> {
        let mut frames = Vec::with_capacity(1 + self.attachments.len());
        frames.push(EnginePacket::Message(self.encode()));
        for attachment in &self.attachments {
            frames.push(EnginePacket::Binary(attachment.clone()));
        }
        frames
    }

    /// Decode a textual frame. For BINARY_* the result is incomplete until
    /// `attachment_count` attachments have been added.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let mut chars = frame.chars();
        let type_digit = chars.next().ok_or(DecodeError::EmptyPacket)?;
        let packet_type =
            PacketType::from_digit(type_digit).ok_or(DecodeError::InvalidPacketType(type_digit))?;
        let mut rest = chars.as_str();

        let mut attachment_count = 0usize;
        if packet_type.is_binary() {
            let dash = rest.find('-').ok_or(DecodeError::InvalidAttachmentCount)?;
            attachment_count = rest[..dash]
                .parse()
                .map_err(|_| DecodeError::InvalidAttachmentCount)?;
            if attachment_count == 0 {
                return Err(DecodeError::InvalidAttachmentCount);
            }
            rest = &rest[dash + 1..];
        }

        let mut nsp = "/".to_string();
        if rest.starts_with('/') {
            match rest.find(',') {
                Some(comma) => {
                    nsp = rest[..comma].to_string();
                    rest = &rest[comma + 1..];
                }
                None => {
                    // Bare namespace with nothing after it (e.g. "1/admin").
                    if rest.contains('[') || rest.contains('{') {
                        return Err(DecodeError::InvalidFraming);
                    }
                    nsp = rest.to_string();
                    rest = "";
                }
            }
        }

        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let mut id = None;
        if !digits.is_empty() {
            id = Some(digits.parse().map_err(|_| DecodeError::InvalidAckId)?);
            rest = &rest[digits.len()..];
        }

        let data = if rest.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(rest).map_err(|_| DecodeError::InvalidJson)?
        };

        let packet = Self {
            packet_type,
            nsp,
            id,
            data,
            attachments: Vec::new(),
            attachment_count,
        };
        packet.validate()?;
        Ok(packet)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        match self.packet_type {
            PacketType::Event | PacketType::BinaryEvent => {
                let arr = self.data.as_array().ok_or(DecodeError::InvalidJson)?;
                let name = arr
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or(DecodeError::InvalidJson)?;
                if RESERVED_EVENTS.contains(name) {
                    return Err(DecodeError::InvalidJson);
                }
            }
            PacketType::Ack | PacketType::BinaryAck => {
                if self.id.is_none() || !self.data.is_array() {
                    return Err(DecodeError::InvalidJson);
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn add_attachment(&mut self, data: Bytes) {
        self.attachments.push(data);
    }

    pub fn is_complete(&self) -> bool {
        self.attachments.len() >= self.attachment_count
    }

    /// Event name for EVENT / BINARY_EVENT packets.
    pub fn event_name(&self) -> Option<&str> {
        match self.packet_type {
            PacketType::Event | PacketType::BinaryEvent => {
                self.data.as_array()?.first()?.as_str()
            }
            _ => None,
        }
    }

    /// Event arguments (everything after the name) with attachments
    /// resolved back into binary values.
    pub fn event_args(&self) -> Result<Vec<Value>, DecodeError> {
        let arr = self.data.as_array().ok_or(DecodeError::InvalidJson)?;
        arr.iter()
            .skip(1)
            .map(|v| Value::from_wire(v, &self.attachments))
            .collect()
    }

    /// ACK arguments with attachments resolved.
    pub fn ack_args(&self) -> Result<Vec<Value>, DecodeError> {
        let arr = self.data.as_array().ok_or(DecodeError::InvalidJson)?;
        arr.iter()
            .map(|v| Value::from_wire(v, &self.attachments))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_event_encodes_like_the_wire_examples() {
        let packet = Packet::event("/", "chat", vec!["hello".into()]).unwrap();
        assert_eq!(packet.encode(), r#"2["chat","hello"]"#);

        let packet = Packet::event("/room", "x", vec![1i64.into()])
            .unwrap()
            .with_id(12);
        assert_eq!(packet.encode(), r#"2/room,12["x",1]"#);
    }

    #[test]
    fn ack_and_connect_error_encode() {
        let ack = Packet::ack("/room", 12, vec!["ok".into()]).unwrap();
        assert_eq!(ack.encode(), r#"3/room,12["ok"]"#);

        let err = Packet::connect_error("/", "auth failed", None);
        assert_eq!(err.encode(), r#"4{"message":"auth failed"}"#);
    }

    #[test]
    fn binary_event_splits_attachments() {
        let packet = Packet::event(
            "/",
            "img",
            vec![Value::Binary(Bytes::from_static(&[0xDE, 0xAD]))],
        )
        .unwrap();
        assert_eq!(packet.packet_type, PacketType::BinaryEvent);
        assert_eq!(
            packet.encode(),
            r#"51-["img",{"_placeholder":true,"num":0}]"#
        );
        assert_eq!(packet.attachments.len(), 1);

        let frames = packet.to_engine_frames();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn binary_event_round_trips() {
        let original = Packet::event(
            "/files",
            "buf",
            vec![
                Value::Binary(Bytes::from_static(b"\x01\x02")),
                "meta".into(),
            ],
        )
        .unwrap();
        let mut decoded = Packet::decode(&original.encode()).unwrap();
        assert!(!decoded.is_complete());
        decoded.add_attachment(Bytes::from_static(b"\x01\x02"));
        assert!(decoded.is_complete());
        assert_eq!(decoded.event_name(), Some("buf"));
        assert_eq!(decoded.event_args().unwrap(), original.event_args().unwrap());
    }

    #[test]
    fn decode_parses_namespace_and_ack_id() {
        let packet = Packet::decode(r#"2/room,12["x",1]"#).unwrap();
        assert_eq!(packet.packet_type, PacketType::Event);
        assert_eq!(packet.nsp, "/room");
        assert_eq!(packet.id, Some(12));
        assert_eq!(packet.event_name(), Some("x"));

        let packet = Packet::decode("1/admin").unwrap();
        assert_eq!(packet.packet_type, PacketType::Disconnect);
        assert_eq!(packet.nsp, "/admin");
    }

    #[test]
    fn connect_packets() {
        let packet = Packet::decode(r#"0{"token":"t"}"#).unwrap();
        assert_eq!(packet.packet_type, PacketType::Connect);
        assert_eq!(packet.nsp, "/");
        assert_eq!(packet.data["token"], "t");

        let reply = Packet::connect("/admin", "s-1");
        assert_eq!(reply.encode(), r#"0/admin,{"sid":"s-1"}"#);
    }

    #[test]
    fn malformed_packets_are_rejected() {
        assert_eq!(Packet::decode(""), Err(DecodeError::EmptyPacket));
        assert_eq!(Packet::decode("7"), Err(DecodeError::InvalidPacketType('7')));
        assert_eq!(Packet::decode("2[broken"), Err(DecodeError::InvalidJson));
        assert_eq!(
            Packet::decode("5[\"x\"]"),
            Err(DecodeError::InvalidAttachmentCount)
        );
        assert_eq!(
            Packet::decode("50-[\"x\"]"),
            Err(DecodeError::InvalidAttachmentCount)
        );
        // Acks require an id and an array payload.
        assert_eq!(Packet::decode(r#"3["ok"]"#), Err(DecodeError::InvalidJson));
    }

    #[test]
    fn reserved_event_names_do_not_decode_as_events() {
        assert_eq!(
            Packet::decode(r#"2["connect",{}]"#),
            Err(DecodeError::InvalidJson)
        );
        assert_eq!(
            Packet::decode(r#"2["disconnect"]"#),
            Err(DecodeError::InvalidJson)
        );
    }
}
