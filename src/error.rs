use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the engine and messaging layers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("parse error: {0}")]
    Decode(#[from] DecodeError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("ping timeout")]
    PingTimeout,

    #[error("upgrade error: {0}")]
    Upgrade(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("unknown session id")]
    UnknownSession,

    #[error("transport mismatch")]
    TransportMismatch,

    #[error("unsupported protocol version")]
    UnsupportedProtocolVersion,

    #[error("unknown transport")]
    UnknownTransport,

    #[error("session closed")]
    SessionClosed,

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("payload limit exceeded")]
    PayloadTooLarge,

    #[error("multiple polling requests for one session")]
    MultiplePollingRequests,
}

/// Typed decode failures for both wire codecs. Decoding is total: every
/// malformed input maps to one of these, never a panic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty packet")]
    EmptyPacket,

    #[error("invalid packet type: {0}")]
    InvalidPacketType(char),

    #[error("premature end of packet")]
    PrematureEnd,

    #[error("invalid payload framing")]
    InvalidFraming,

    #[error("invalid json payload")]
    InvalidJson,

    #[error("invalid base64 payload")]
    InvalidBase64,

    #[error("invalid attachment count")]
    InvalidAttachmentCount,

    #[error("attachment count mismatch")]
    AttachmentMismatch,

    #[error("unexpected binary frame")]
    UnexpectedBinary,

    #[error("payload nesting too deep")]
    DepthExceeded,

    #[error("invalid ack id")]
    InvalidAckId,
}

/// Failure modes of an emit-with-ack, delivered through the [`AckHandle`].
///
/// [`AckHandle`]: crate::socket::AckHandle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("ack timed out")]
    Timeout,

    #[error("socket disconnected before ack")]
    Disconnected,

    #[error("send failed: {0}")]
    Send(String),
}

/// Why a session or a namespace socket was closed. Rendered strings are
/// part of the public surface: application disconnect listeners match on
/// them.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    /// The peer sent an engine CLOSE or dropped the transport cleanly.
    TransportClose,
    /// The transport failed mid-stream.
    TransportError,
    /// No PONG within the ping timeout.
    PingTimeout,
    /// A packet could not be decoded.
    ParseError,
    /// Two simultaneous GET polls for one session.
    MultiplePollingRequests,
    /// The client sent DISCONNECT for this namespace only.
    ClientNamespaceDisconnect,
    /// The server disconnected the socket from the namespace.
    ServerNamespaceDisconnect,
    /// The whole server is shutting down.
    ServerShutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::ParseError => "parse error",
            DisconnectReason::MultiplePollingRequests => "multiple polling requests",
            DisconnectReason::ClientNamespaceDisconnect => "client namespace disconnect",
            DisconnectReason::ServerNamespaceDisconnect => "server namespace disconnect",
            DisconnectReason::ServerShutdown => "server shutting down",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::UnknownSession
            | Error::TransportMismatch
            | Error::UnsupportedProtocolVersion
            | Error::UnknownTransport
            | Error::MultiplePollingRequests
            | Error::Decode(_)
            | Error::InvalidNamespace(_) => StatusCode::BAD_REQUEST,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Error::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        HttpResponse::build(status).json(ErrorResponse {
            code: status.as_u16(),
            message: self.to_string(),
        })
    }
}
