//! Socket.IO v5 / Engine.IO v4 server core, with an embeddable
//! client-side connection manager.
//!
//! Architecture:
//! - Engine: transports (long-poll, websocket), packet framing, per-client
//!   sessions with heartbeat and transport upgrade
//! - Protocol: messaging packet grammar with binary attachment streaming
//! - Namespaces: per-channel socket registries with connect-time
//!   authorization and middleware
//! - Adapter: in-memory room membership index and broadcast executor,
//!   swappable for cross-process fan-out
//! - Server: root registry plus actix-web entry points
//! - Manager: client-side mirror with reconnect backoff and offline
//!   buffering
//!
//! ```no_run
//! use actix_web::{App, HttpServer};
//! use socketio_server::{ServerConfig, SocketIo};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let io = SocketIo::new(ServerConfig::from_env());
//!     io.of("/").on_connection(|socket| async move {
//!         socket.on("ping", |_socket, args, ack| async move {
//!             if let Some(ack) = ack {
//!                 ack.send(args).await.ok();
//!             }
//!         });
//!     });
//!
//!     let handle = io.clone();
//!     HttpServer::new(move || {
//!         App::new().configure(|cfg| handle.configure(cfg))
//!     })
//!     .bind(("0.0.0.0", 8080))?
//!     .run()
//!     .await
//! }
//! ```

pub mod adapter;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod namespace;
pub mod payload;
pub mod protocol;
pub mod server;
pub mod socket;

pub use adapter::{Adapter, BroadcastAck, BroadcastFlags, BroadcastOptions, LocalAdapter};
pub use config::{ReconnectConfig, ServerConfig};
pub use error::{AckError, DecodeError, DisconnectReason, Error};
pub use manager::{ClientSocket, Connector, EngineConn, Manager, ManagerEvent};
pub use namespace::{BroadcastOperator, ConnectRefusal, Namespace};
pub use payload::Value;
pub use server::SocketIo;
pub use socket::{AckHandle, AckResponder, Handshake, Socket};
