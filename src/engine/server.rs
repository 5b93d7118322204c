//! Engine server: handshakes, session registry, packet routing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::packet::{decode_polling_payload, encode_polling_payload, EnginePacket, OpenPacket};
use super::session::EngineSession;
use super::transport::{Transport, TransportKind, WsFrame};
use crate::config::ServerConfig;
use crate::error::{DisconnectReason, Error};

/// Fresh URL-safe session id. Ids are never reused: every handshake and
/// every non-default namespace socket draws a new UUID.
pub(crate) fn new_sid() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

/// Upcalls from the engine into the messaging layer.
#[async_trait]
pub trait EngineHandler: Send + Sync + 'static {
    async fn on_open(&self, session: Arc<EngineSession>);
    async fn on_message(&self, session: Arc<EngineSession>, msg: String);
    async fn on_binary(&self, session: Arc<EngineSession>, data: Bytes);
    async fn on_close(&self, session: Arc<EngineSession>, reason: DisconnectReason);
}

pub struct EngineServer {
    config: Arc<ServerConfig>,
    handler: Arc<dyn EngineHandler>,
    sessions: RwLock<HashMap<String, Arc<EngineSession>>>,
}

impl EngineServer {
    pub fn new(config: Arc<ServerConfig>, handler: Arc<dyn EngineHandler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    fn close_callback(self: &Arc<Self>) -> Box<dyn Fn(Arc<EngineSession>, DisconnectReason) + Send + Sync> {
        let server = Arc::downgrade(self);
        Box::new(move |session, reason| {
            let Some(server) = server.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                server.sessions.write().await.remove(&session.id);
                server.handler.on_close(session, reason).await;
            });
        })
    }

    async fn register(self: &Arc<Self>, session: Arc<EngineSession>) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        session.mark_open().await;
        session.spawn_heartbeat();
        self.handler.on_open(session.clone()).await;
        tracing::info!("[sid={}] session opened", session.id);
    }

    /// Long-poll handshake. Returns the new session and the response body
    /// carrying the OPEN frame.
    pub async fn open_polling_session(self: &Arc<Self>) -> (Arc<EngineSession>, String) {
        let sid = new_sid();
        let session = EngineSession::new(
            sid.clone(),
            self.config.clone(),
            Transport::polling(),
            self.close_callback(),
        );
        self.register(session.clone()).await;

        let open = OpenPacket::new(&sid, vec!["websocket".to_string()], &self.config);
        let (body, _) = encode_polling_payload(&[open.into_packet()], usize::MAX);
        (session, body)
    }

    /// Direct websocket handshake (no prior polling session). The OPEN
    /// frame goes out on the socket; no upgrades remain to advertise.
    pub async fn open_ws_session(
        self: &Arc<Self>,
        tx: mpsc::UnboundedSender<WsFrame>,
    ) -> Result<Arc<EngineSession>, Error> {
        let sid = new_sid();
        let session = EngineSession::new(
            sid.clone(),
            self.config.clone(),
            Transport::websocket(tx),
            self.close_callback(),
        );
        self.register(session.clone()).await;

        let open = OpenPacket::new(&sid, Vec::new(), &self.config);
        session.send(open.into_packet()).await?;
        Ok(session)
    }

    pub async fn get_session(&self, sid: &str) -> Option<Arc<EngineSession>> {
        self.sessions.read().await.get(sid).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Serve a long-poll GET for an existing session.
    pub async fn handle_poll(&self, sid: &str) -> Result<String, Error> {
        let session = self.get_session(sid).await.ok_or(Error::UnknownSession)?;
        if session.transport_kind().await != TransportKind::Polling {
            return Err(Error::TransportMismatch);
        }
        session.poll_payload().await
    }

    /// Apply a long-poll POST body: split into frames and route each.
    pub async fn handle_post(&self, sid: &str, body: &str) -> Result<(), Error> {
        let session = self.get_session(sid).await.ok_or(Error::UnknownSession)?;
        if body.len() > self.config.max_payload {
            return Err(Error::PayloadTooLarge);
        }
        let packets = match decode_polling_payload(body) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::debug!("[sid={}] bad poll body: {}", sid, e);
                session.close(DisconnectReason::ParseError).await;
                return Err(e.into());
            }
        };
        for packet in packets {
            self.handle_packet(&session, packet).await?;
        }
        Ok(())
    }

    /// Route one decoded engine packet from any transport.
    pub async fn handle_packet(
        &self,
        session: &Arc<EngineSession>,
        packet: EnginePacket,
    ) -> Result<(), Error> {
        match packet {
            EnginePacket::Close => {
                session.close(DisconnectReason::TransportClose).await;
                Ok(())
            }
            EnginePacket::Ping(_) | EnginePacket::Pong(_) => {
                session.pong_received();
                Ok(())
            }
            EnginePacket::Message(msg) => {
                self.handler.on_message(session.clone(), msg).await;
                Ok(())
            }
            EnginePacket::Binary(data) => {
                self.handler.on_binary(session.clone(), data).await;
                Ok(())
            }
            EnginePacket::Noop => Ok(()),
            EnginePacket::Open(_) | EnginePacket::Upgrade => {
                tracing::debug!("[sid={}] unexpected packet from peer", session.id);
                session.close(DisconnectReason::ParseError).await;
                Err(Error::Transport("unexpected packet from peer".to_string()))
            }
        }
    }

    /// Close every session. Graceful mode lets each session flush its
    /// buffer up to the configured grace period first.
    pub async fn close_all(&self, graceful: bool) {
        let sessions: Vec<Arc<EngineSession>> =
            self.sessions.read().await.values().cloned().collect();
        if graceful {
            futures::future::join_all(sessions.iter().map(|s| s.close_graceful())).await;
        } else {
            for session in &sessions {
                session.close(DisconnectReason::ServerShutdown).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandler {
        messages: StdMutex<Vec<String>>,
        closes: StdMutex<Vec<(String, DisconnectReason)>>,
    }

    #[async_trait]
    impl EngineHandler for RecordingHandler {
        async fn on_open(&self, _session: Arc<EngineSession>) {}
        async fn on_message(&self, _session: Arc<EngineSession>, msg: String) {
            self.messages.lock().unwrap().push(msg);
        }
        async fn on_binary(&self, _session: Arc<EngineSession>, _data: Bytes) {}
        async fn on_close(&self, session: Arc<EngineSession>, reason: DisconnectReason) {
            self.closes
                .lock()
                .unwrap()
                .push((session.id.clone(), reason));
        }
    }

    fn server() -> (Arc<EngineServer>, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let server = EngineServer::new(Arc::new(ServerConfig::default()), handler.clone());
        (server, handler)
    }

    #[tokio::test]
    async fn polling_handshake_returns_open_frame() {
        let (server, _) = server();
        let (session, body) = server.open_polling_session().await;

        // "<len>:0{...}"
        let colon = body.find(':').unwrap();
        let frame = &body[colon + 1..];
        assert!(frame.starts_with("0{"));
        let json: serde_json::Value = serde_json::from_str(&frame[1..]).unwrap();
        assert_eq!(json["sid"], session.id.as_str());
        assert_eq!(json["upgrades"][0], "websocket");
        assert!(server.get_session(&session.id).await.is_some());
    }

    #[tokio::test]
    async fn post_routes_messages_in_order() {
        let (server, handler) = server();
        let (session, _) = server.open_polling_session().await;

        let frames = [
            EnginePacket::Message("2[\"a\"]".to_string()),
            EnginePacket::Message("2[\"b\"]".to_string()),
        ];
        let (body, _) = encode_polling_payload(&frames, usize::MAX);
        server.handle_post(&session.id, &body).await.unwrap();

        assert_eq!(
            *handler.messages.lock().unwrap(),
            vec!["2[\"a\"]".to_string(), "2[\"b\"]".to_string()]
        );
    }

    #[tokio::test]
    async fn malformed_post_closes_session_with_parse_error() {
        let (server, handler) = server();
        let (session, _) = server.open_polling_session().await;

        assert!(server.handle_post(&session.id, "garbage").await.is_err());
        assert!(session.is_closed().await);

        // Close callback runs on a spawned task.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let closes = handler.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].1, DisconnectReason::ParseError);
        drop(closes);
        assert!(server.get_session(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn unknown_sid_is_rejected() {
        let (server, _) = server();
        assert!(matches!(
            server.handle_poll("nope").await,
            Err(Error::UnknownSession)
        ));
        assert!(matches!(
            server.handle_post("nope", "1:6").await,
            Err(Error::UnknownSession)
        ));
    }

    #[tokio::test]
    async fn sids_are_unique_and_url_safe() {
        let (server, _) = server();
        let (a, _) = server.open_polling_session().await;
        let (b, _) = server.open_polling_session().await;
        assert_ne!(a.id, b.id);
        assert!(a
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let (server, _) = server();
        server.open_polling_session().await;
        server.open_polling_session().await;
        assert_eq!(server.session_count().await, 2);

        server.close_all(false).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.session_count().await, 0);
    }
}
