//! One [`Client`] wraps one engine session and demultiplexes the
//! messaging layer: it owns the streaming decoder, the per-namespace
//! socket map, and the shared egress path every socket writes through.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};

use crate::engine::packet::EnginePacket;
use crate::engine::session::EngineSession;
use crate::error::DisconnectReason;
use crate::protocol::decoder::PacketDecoder;
use crate::protocol::{Packet, PacketType};
use crate::server::ServerInner;
use crate::socket::Socket;

pub struct Client {
    session: Arc<EngineSession>,
    server: Weak<ServerInner>,
    decoder: Mutex<PacketDecoder>,
    sockets: RwLock<HashMap<String, Arc<Socket>>>,
    connect_timer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Client {
    pub(crate) fn new(session: Arc<EngineSession>, server: Weak<ServerInner>) -> Arc<Self> {
        let client = Arc::new(Self {
            session,
            server,
            decoder: Mutex::new(PacketDecoder::new()),
            sockets: RwLock::new(HashMap::new()),
            connect_timer: std::sync::Mutex::new(None),
        });
        client.spawn_connect_timeout();
        client
    }

    pub fn sid(&self) -> &str {
        &self.session.id
    }

    /// A session that never connects to any namespace within the deadline
    /// is torn down.
    fn spawn_connect_timeout(self: &Arc<Self>) {
        let deadline = self.session.config_connect_timeout();
        let client = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let Some(client) = client.upgrade() else {
                return;
            };
            if client.sockets.read().await.is_empty() {
                tracing::debug!("[sid={}] namespace connect timeout", client.sid());
                client.session.close(DisconnectReason::TransportClose).await;
            }
        });
        self.connect_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
    }

    fn cancel_connect_timeout(&self) {
        if let Some(handle) = self
            .connect_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// Egress path shared by every socket of this client. Frames are
    /// pre-encoded; one call keeps a packet and its attachments together.
    pub(crate) async fn write_to_engine(
        &self,
        frames: Vec<EnginePacket>,
    ) -> Result<(), crate::error::Error> {
        self.session.send_many(frames).await
    }

    /// Volatile variant: drops when the peer is not writable.
    pub(crate) async fn write_volatile(&self, frames: Vec<EnginePacket>) -> bool {
        self.session.send_volatile(frames).await
    }

    pub(crate) async fn forget_socket(&self, nsp: &str) {
        self.sockets.write().await.remove(nsp);
    }

    /// Ingress: one MESSAGE frame from the engine.
    pub(crate) async fn on_message(self: &Arc<Self>, msg: String) {
        let decoded = self.decoder.lock().await.decode_text(&msg);
        match decoded {
            Ok(Some(packet)) => self.route(packet).await,
            Ok(None) => {} // waiting for attachments
            Err(e) => {
                tracing::debug!("[sid={}] undecodable packet: {}", self.sid(), e);
                self.session.close(DisconnectReason::ParseError).await;
            }
        }
    }

    /// Ingress: one binary frame (an attachment of the pending packet).
    pub(crate) async fn on_binary(self: &Arc<Self>, data: Bytes) {
        let decoded = self.decoder.lock().await.decode_binary(data);
        match decoded {
            Ok(Some(packet)) => self.route(packet).await,
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("[sid={}] unexpected binary frame: {}", self.sid(), e);
                self.session.close(DisconnectReason::ParseError).await;
            }
        }
    }

    async fn route(self: &Arc<Self>, packet: Packet) {
        match packet.packet_type {
            PacketType::Connect => self.handle_connect(packet).await,
            PacketType::Disconnect => {
                let socket = self.sockets.read().await.get(&packet.nsp).cloned();
                if let Some(socket) = socket {
                    socket.close(DisconnectReason::ClientNamespaceDisconnect).await;
                }
            }
            PacketType::Event | PacketType::BinaryEvent => {
                let socket = self.sockets.read().await.get(&packet.nsp).cloned();
                match socket {
                    Some(socket) => socket.dispatch_event(&packet),
                    None => tracing::debug!(
                        "[sid={}] event for unconnected namespace {}",
                        self.sid(),
                        packet.nsp
                    ),
                }
            }
            PacketType::Ack | PacketType::BinaryAck => {
                let socket = self.sockets.read().await.get(&packet.nsp).cloned();
                if let (Some(socket), Some(id)) = (socket, packet.id) {
                    match packet.ack_args() {
                        Ok(args) => socket.resolve_ack(id, args),
                        Err(e) => {
                            tracing::debug!("[sid={}] bad ack payload: {}", self.sid(), e)
                        }
                    }
                }
            }
            PacketType::ConnectError => {
                tracing::debug!("[sid={}] peer sent CONNECT_ERROR; ignoring", self.sid());
            }
        }
    }

    async fn handle_connect(self: &Arc<Self>, packet: Packet) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let nsp = packet.nsp.clone();
        let Some(ns) = server.namespace_for_connect(&nsp).await else {
            tracing::debug!("[sid={}] invalid namespace requested: {}", self.sid(), nsp);
            self.send_connect_error(&nsp, "Invalid namespace", None).await;
            return;
        };

        let transport = self.session.transport_kind().await.as_str().to_string();
        match ns
            .connect(self, packet.data.clone(), &self.session.id, transport)
            .await
        {
            Ok(socket) => {
                self.sockets.write().await.insert(nsp, socket);
                self.cancel_connect_timeout();
            }
            Err(refusal) => {
                tracing::debug!(
                    "[sid={}] connect to {} refused: {}",
                    self.sid(),
                    nsp,
                    refusal.message
                );
                self.send_connect_error(&nsp, &refusal.message, refusal.data)
                    .await;
            }
        }
    }

    async fn send_connect_error(&self, nsp: &str, message: &str, data: Option<serde_json::Value>) {
        let packet = Packet::connect_error(nsp, message, data);
        if let Err(e) = self.write_to_engine(packet.to_engine_frames()).await {
            tracing::debug!("[sid={}] failed to send CONNECT_ERROR: {}", self.sid(), e);
        }
    }

    /// Engine session closed: every namespace socket of this client goes
    /// down with the session's reason.
    pub(crate) async fn close_all(&self, reason: DisconnectReason) {
        self.cancel_connect_timeout();
        let sockets: Vec<Arc<Socket>> = self.sockets.read().await.values().cloned().collect();
        for socket in sockets {
            socket.close(reason).await;
        }
        self.decoder.lock().await.reset();
    }
}
