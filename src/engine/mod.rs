//! Engine layer: transports, framing, sessions, heartbeat, upgrades.
//!
//! The engine knows nothing about namespaces or events; it moves opaque
//! MESSAGE frames between one peer and the messaging layer above.

pub mod packet;
pub mod server;
pub mod session;
pub mod transport;

pub use packet::{EnginePacket, OpenPacket};
pub use server::{EngineHandler, EngineServer};
pub use session::{EngineSession, SessionState};
pub use transport::{Transport, TransportKind, WsFrame};
