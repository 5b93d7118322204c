//! Streaming packet reassembly.
//!
//! BINARY_EVENT / BINARY_ACK arrive as one textual frame followed by
//! `attachment_count` binary frames. The decoder holds the partial packet
//! until the last attachment lands. A text frame arriving mid-assembly is
//! a protocol violation: the decoder reports it and resets.

use bytes::Bytes;

use super::Packet;
use crate::error::DecodeError;

/// Per-connection messaging decoder. One instance per engine session.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    partial: Option<Packet>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self { partial: None }
    }

    /// Feed a textual frame. Returns a packet when one is complete;
    /// `None` while a binary packet still waits for attachments.
    pub fn decode_text(&mut self, frame: &str) -> Result<Option<Packet>, DecodeError> {
        if self.partial.take().is_some() {
            // The previous binary packet never finished.
            return Err(DecodeError::AttachmentMismatch);
        }
        let packet = Packet::decode(frame)?;
        if packet.packet_type.is_binary() {
            self.partial = Some(packet);
            Ok(None)
        } else {
            Ok(Some(packet))
        }
    }

    /// Feed a binary frame. Returns the reassembled packet once all
    /// announced attachments have arrived.
    pub fn decode_binary(&mut self, data: Bytes) -> Result<Option<Packet>, DecodeError> {
        let Some(partial) = self.partial.as_mut() else {
            return Err(DecodeError::UnexpectedBinary);
        };
        partial.add_attachment(data);
        if partial.is_complete() {
            Ok(self.partial.take())
        } else {
            Ok(None)
        }
    }

    /// Drop any partial state (used when the session closes).
    pub fn reset(&mut self) {
        self.partial = None;
    }
}
