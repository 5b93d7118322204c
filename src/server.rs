//! Server root: namespace registry, engine bridge, HTTP entry points.
//!
//! The embedding application mounts [`SocketIo::configure`] on an
//! actix-web `App` and registers namespaces with [`SocketIo::of`]. The
//! handshake endpoint serves both transports: long-poll GET/POST plus the
//! websocket route used for fresh connections and upgrades.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use actix_web::{web, HttpRequest, HttpResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::client::Client;
use crate::config::ServerConfig;
use crate::engine::packet::EnginePacket;
use crate::engine::server::{EngineHandler, EngineServer};
use crate::engine::session::EngineSession;
use crate::engine::transport::WsFrame;
use crate::error::{DisconnectReason, Error};
use crate::namespace::Namespace;

const ENGINE_PROTOCOL_VERSION: u8 = 4;

type NamespaceSetup = Arc<dyn Fn(Arc<Namespace>) + Send + Sync>;

struct NamespaceMatcher {
    pattern: Regex,
    setup: NamespaceSetup,
}

pub(crate) struct ServerInner {
    config: Arc<ServerConfig>,
    engine: OnceCell<Arc<EngineServer>>,
    namespaces: StdRwLock<HashMap<String, Arc<Namespace>>>,
    matchers: StdRwLock<Vec<NamespaceMatcher>>,
    clients: StdRwLock<HashMap<String, Arc<Client>>>,
    shutting_down: AtomicBool,
}

impl ServerInner {
    fn engine(&self) -> &Arc<EngineServer> {
        // Set during construction, before any request can arrive.
        self.engine.get().expect("engine initialized")
    }

    fn get_namespace(&self, path: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    fn insert_namespace(&self, ns: Arc<Namespace>) {
        self.namespaces
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ns.path.clone(), ns);
    }

    /// Resolve the target namespace of a CONNECT: registry first, then the
    /// ordered dynamic matchers (first match instantiates and caches).
    pub(crate) async fn namespace_for_connect(&self, path: &str) -> Option<Arc<Namespace>> {
        if let Some(ns) = self.get_namespace(path) {
            return Some(ns);
        }
        let setup = {
            let matchers = self.matchers.read().unwrap_or_else(|e| e.into_inner());
            matchers
                .iter()
                .find(|m| m.pattern.is_match(path))
                .map(|m| m.setup.clone())
        };
        let setup = setup?;
        let ns = Namespace::new(path);
        setup(ns.clone());
        self.insert_namespace(ns.clone());
        tracing::info!("created dynamic namespace {}", path);
        Some(ns)
    }

    fn client(&self, sid: &str) -> Option<Arc<Client>> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(sid)
            .cloned()
    }
}

/// Adapts the engine's upcalls onto the client registry.
struct EngineBridge {
    server: std::sync::Weak<ServerInner>,
}

#[async_trait]
impl EngineHandler for EngineBridge {
    async fn on_open(&self, session: Arc<EngineSession>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let client = Client::new(session.clone(), self.server.clone());
        server
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id.clone(), client);
    }

    async fn on_message(&self, session: Arc<EngineSession>, msg: String) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        if let Some(client) = server.client(&session.id) {
            client.on_message(msg).await;
        }
    }

    async fn on_binary(&self, session: Arc<EngineSession>, data: Bytes) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        if let Some(client) = server.client(&session.id) {
            client.on_binary(data).await;
        }
    }

    async fn on_close(&self, session: Arc<EngineSession>, reason: DisconnectReason) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let client = server
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.id);
        if let Some(client) = client {
            client.close_all(reason).await;
        }
    }
}

/// The server handle. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct SocketIo {
    inner: Arc<ServerInner>,
}

impl Default for SocketIo {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl SocketIo {
    pub fn new(config: ServerConfig) -> Self {
        let inner = Arc::new(ServerInner {
            config: Arc::new(config),
            engine: OnceCell::new(),
            namespaces: StdRwLock::new(HashMap::new()),
            matchers: StdRwLock::new(Vec::new()),
            clients: StdRwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        });
        let bridge = Arc::new(EngineBridge {
            server: Arc::downgrade(&inner),
        });
        let engine = EngineServer::new(inner.config.clone(), bridge);
        let _ = inner.engine.set(engine);

        let io = Self { inner };
        // The default namespace always exists.
        io.of("/");
        io
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub(crate) fn engine(&self) -> Arc<EngineServer> {
        self.inner.engine().clone()
    }

    /// Get or create the namespace at `path`.
    pub fn of(&self, path: &str) -> Arc<Namespace> {
        if let Some(ns) = self.inner.get_namespace(path) {
            return ns;
        }
        let ns = Namespace::new(path);
        self.inner.insert_namespace(ns.clone());
        ns
    }

    /// Register a dynamic namespace matcher: the first CONNECT to an
    /// unknown name matching `pattern` instantiates the namespace and runs
    /// `setup` on it.
    pub fn dyn_ns<F>(&self, pattern: &str, setup: F) -> Result<(), regex::Error>
    where
        F: Fn(Arc<Namespace>) + Send + Sync + 'static,
    {
        let matcher = NamespaceMatcher {
            pattern: Regex::new(pattern)?,
            setup: Arc::new(setup),
        };
        self.inner
            .matchers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(matcher);
        Ok(())
    }

    /// Shut the server down: stop accepting handshakes, tell every socket
    /// in every namespace it is being disconnected, then close sessions.
    /// Graceful mode flushes outstanding writes up to the grace deadline.
    pub async fn close(&self, graceful: bool) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let namespaces: Vec<Arc<Namespace>> = self
            .inner
            .namespaces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for ns in namespaces {
            ns.close(DisconnectReason::ServerShutdown).await;
        }
        self.inner.engine().close_all(graceful).await;
        tracing::info!("server closed");
    }

    /// Mount the handshake endpoint on an actix-web service config.
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        let path = self.inner.config.path.clone();
        cfg.app_data(web::Data::new(self.clone())).service(
            web::resource(path.as_str())
                .route(web::get().to(io_get))
                .route(web::post().to(io_post)),
        );
    }
}

#[derive(Debug, Deserialize)]
struct EngineQuery {
    #[serde(rename = "EIO")]
    eio: Option<u8>,
    transport: Option<String>,
    sid: Option<String>,
    /// Cache buster; opaque.
    #[allow(dead_code)]
    t: Option<String>,
}

fn parse_query(req: &HttpRequest) -> Result<EngineQuery, Error> {
    let query = web::Query::<EngineQuery>::from_query(req.query_string())
        .map_err(|_| Error::UnknownTransport)?
        .into_inner();
    if query.eio != Some(ENGINE_PROTOCOL_VERSION) {
        return Err(Error::UnsupportedProtocolVersion);
    }
    Ok(query)
}

fn polling_response(body: String) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; charset=UTF-8")
        .body(body)
}

async fn io_get(
    req: HttpRequest,
    stream: web::Payload,
    io: web::Data<SocketIo>,
) -> Result<HttpResponse, Error> {
    let query = parse_query(&req)?;
    // Shutdown rejects new handshakes; polls of live sessions keep
    // draining so the grace period can flush.
    let shutting_down = io.inner.shutting_down.load(Ordering::SeqCst);
    if shutting_down && query.sid.is_none() {
        return Err(Error::SessionClosed);
    }
    match query.transport.as_deref() {
        Some("websocket") => ws_connect(req, stream, io, query.sid),
        Some("polling") => match query.sid {
            Some(sid) => {
                let body = io.engine().handle_poll(&sid).await?;
                Ok(polling_response(body))
            }
            None => {
                let (session, body) = io.engine().open_polling_session().await;
                tracing::debug!("[sid={}] polling handshake", session.id);
                Ok(polling_response(body))
            }
        },
        _ => Err(Error::UnknownTransport),
    }
}

async fn io_post(
    req: HttpRequest,
    body: web::Bytes,
    io: web::Data<SocketIo>,
) -> Result<HttpResponse, Error> {
    let query = parse_query(&req)?;
    let sid = query.sid.ok_or(Error::UnknownSession)?;
    let body = std::str::from_utf8(&body).map_err(|_| Error::Decode(
        crate::error::DecodeError::InvalidFraming,
    ))?;
    io.engine().handle_post(&sid, body).await?;
    Ok(polling_response("ok".to_string()))
}

/// Accept a websocket: either a fresh handshake or an upgrade probe for an
/// existing polling session.
fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    io: web::Data<SocketIo>,
    sid: Option<String>,
) -> Result<HttpResponse, Error> {
    let (response, ws_session, msg_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| Error::Transport(e.to_string()))?;

    let (tx, rx) = mpsc::unbounded_channel::<WsFrame>();
    actix_web::rt::spawn(ws_writer(ws_session.clone(), rx));
    actix_web::rt::spawn(ws_reader(
        io.get_ref().clone(),
        sid,
        tx,
        ws_session,
        msg_stream,
    ));
    Ok(response)
}

/// Forward engine frames into the websocket until the transport is
/// dropped.
async fn ws_writer(mut ws: actix_ws::Session, mut rx: mpsc::UnboundedReceiver<WsFrame>) {
    while let Some(frame) = rx.recv().await {
        let result = match frame {
            WsFrame::Text(text) => ws.text(text).await,
            WsFrame::Binary(data) => ws.binary(data).await,
        };
        if result.is_err() {
            break;
        }
    }
    let _ = ws.close(None).await;
}

async fn ws_reader(
    io: SocketIo,
    existing_sid: Option<String>,
    tx: mpsc::UnboundedSender<WsFrame>,
    mut ws: actix_ws::Session,
    mut stream: actix_ws::MessageStream,
) {
    let engine = io.engine();

    let session: Arc<EngineSession> = if let Some(sid) = existing_sid {
        // Upgrade path: probe ping, probe pong on the NEW transport, then
        // UPGRADE commits the switch. Writes keep going to the old
        // transport until then.
        let Some(session) = engine.get_session(&sid).await else {
            let _ = ws.close(None).await;
            return;
        };
        match stream.next().await {
            Some(Ok(actix_ws::Message::Text(text))) if &*text == "2probe" => {
                if session.begin_upgrade().await.is_err() {
                    let _ = ws.close(None).await;
                    return;
                }
                if ws.text("3probe").await.is_err() {
                    session.cancel_upgrade().await;
                    return;
                }
            }
            _ => {
                tracing::debug!("[sid={}] websocket opened without probe", sid);
                let _ = ws.close(None).await;
                return;
            }
        }
        match stream.next().await {
            Some(Ok(actix_ws::Message::Text(text))) if &*text == "5" => {
                if session.complete_upgrade(tx).await.is_err() {
                    let _ = ws.close(None).await;
                    return;
                }
            }
            _ => {
                tracing::debug!("[sid={}] upgrade probe not confirmed", sid);
                session.cancel_upgrade().await;
                let _ = ws.close(None).await;
                return;
            }
        }
        session
    } else {
        match engine.open_ws_session(tx).await {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("websocket handshake failed: {}", e);
                let _ = ws.close(None).await;
                return;
            }
        }
    };

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            actix_ws::Message::Text(text) => match EnginePacket::decode(&text) {
                Ok(packet) => {
                    if engine.handle_packet(&session, packet).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("[sid={}] bad websocket frame: {}", session.id, e);
                    session.close(DisconnectReason::ParseError).await;
                    break;
                }
            },
            actix_ws::Message::Binary(data) => {
                if engine
                    .handle_packet(&session, EnginePacket::Binary(data))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            actix_ws::Message::Ping(payload) => {
                let _ = ws.pong(&payload).await;
            }
            actix_ws::Message::Close(_) => {
                session.close(DisconnectReason::TransportClose).await;
                return;
            }
            _ => {}
        }
    }
    session.close(DisconnectReason::TransportClose).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::ConnectRefusal;
    use crate::payload::Value;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// In-process peer: the websocket transport without the websocket.
    struct FakePeer {
        session: Arc<EngineSession>,
        rx: mpsc::UnboundedReceiver<WsFrame>,
        engine: Arc<EngineServer>,
    }

    impl FakePeer {
        async fn open(io: &SocketIo) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let session = io.engine().open_ws_session(tx).await.unwrap();
            let mut peer = Self {
                session,
                rx,
                engine: io.engine(),
            };
            let open = peer.recv_text().await;
            assert!(open.starts_with("0{"), "expected OPEN frame, got {open}");
            peer
        }

        /// Open and CONNECT to `nsp`, returning the namespace sid.
        async fn connect(io: &SocketIo, nsp: &str) -> (Self, String) {
            let mut peer = Self::open(io).await;
            peer.send_connect(nsp).await;
            let reply = peer.recv_text().await;
            assert!(reply.starts_with("40"), "expected CONNECT reply, got {reply}");
            let json_start = reply.find('{').unwrap();
            let json: serde_json::Value = serde_json::from_str(&reply[json_start..]).unwrap();
            let sid = json["sid"].as_str().unwrap().to_string();
            (peer, sid)
        }

        async fn send_connect(&self, nsp: &str) {
            if nsp == "/" {
                self.send_text("40").await;
            } else {
                self.send_text(&format!("40{},", nsp)).await;
            }
        }

        async fn send_text(&self, frame: &str) {
            let packet = EnginePacket::decode(frame).unwrap();
            self.engine
                .handle_packet(&self.session, packet)
                .await
                .unwrap();
        }

        async fn send_binary(&self, data: &[u8]) {
            self.engine
                .handle_packet(&self.session, EnginePacket::Binary(Bytes::copy_from_slice(data)))
                .await
                .unwrap();
        }

        async fn recv_text(&mut self) -> String {
            match self.recv_frame().await {
                WsFrame::Text(text) => text,
                WsFrame::Binary(_) => panic!("expected text frame"),
            }
        }

        async fn recv_frame(&mut self) -> WsFrame {
            tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("transport closed")
        }

        async fn assert_silent(&mut self) {
            let outcome = tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await;
            assert!(outcome.is_err(), "expected no frame, got {:?}", outcome);
        }
    }

    #[tokio::test]
    async fn connect_to_default_namespace_echoes_session_id() {
        let io = SocketIo::default();
        let (peer, sid) = FakePeer::connect(&io, "/").await;
        // Inside "/" the socket id is the engine session id.
        assert_eq!(sid, peer.session.id);
        assert_eq!(io.of("/").socket_count().await, 1);
    }

    #[tokio::test]
    async fn event_reaches_listener_and_ack_flows_back() {
        let io = SocketIo::default();
        let received: Arc<StdMutex<Vec<Value>>> = Arc::new(StdMutex::new(Vec::new()));
        let captured = received.clone();
        io.of("/").on_connection(move |socket| {
            let captured = captured.clone();
            async move {
                socket.on("ping", move |_socket, args, ack| {
                    let captured = captured.clone();
                    async move {
                        let reply = format!(
                            "pong-{}",
                            args.first().and_then(Value::as_str).unwrap_or_default()
                        );
                        captured.lock().unwrap().extend(args);
                        if let Some(ack) = ack {
                            ack.send(vec![reply.as_str().into()]).await.ok();
                        }
                    }
                });
            }
        });

        let (mut peer, _) = FakePeer::connect(&io, "/").await;
        peer.send_text("4212[\"ping\",\"x\"]").await;

        let frame = peer.recv_text().await;
        assert_eq!(frame, "4312[\"pong-x\"]");
        assert_eq!(received.lock().unwrap()[0], Value::String("x".into()));
    }

    #[tokio::test]
    async fn namespace_isolation() {
        let io = SocketIo::default();
        io.of("/admin");
        let (mut a, _) = FakePeer::connect(&io, "/").await;
        let (mut b, _) = FakePeer::connect(&io, "/admin").await;

        let delivered = io.of("/").emit("m", vec!["hello".into()]).await;
        assert_eq!(delivered, 1);

        assert_eq!(a.recv_text().await, "42[\"m\",\"hello\"]");
        b.assert_silent().await;
    }

    #[tokio::test]
    async fn room_broadcast_with_except() {
        let io = SocketIo::default();
        let ns = io.of("/");
        let (mut a, a_sid) = FakePeer::connect(&io, "/").await;
        let (mut b, _) = FakePeer::connect(&io, "/").await;
        let (mut c, _) = FakePeer::connect(&io, "/").await;

        for socket in ns.fetch_sockets().await {
            socket.join(vec!["r".to_string()]).await;
        }

        let delivered = ns
            .to(vec!["r".to_string()])
            .except(vec![a_sid])
            .emit("x", vec![1i64.into()])
            .await;
        assert_eq!(delivered, 2);

        assert_eq!(b.recv_text().await, "42[\"x\",1]");
        assert_eq!(c.recv_text().await, "42[\"x\",1]");
        a.assert_silent().await;
    }

    #[tokio::test]
    async fn broadcast_dedup_across_rooms() {
        let io = SocketIo::default();
        let ns = io.of("/");
        let (mut a, _) = FakePeer::connect(&io, "/").await;
        for socket in ns.fetch_sockets().await {
            socket.join(vec!["r1".to_string(), "r2".to_string()]).await;
        }

        let delivered = ns
            .to(vec!["r1".to_string(), "r2".to_string()])
            .emit("once", vec![])
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(a.recv_text().await, "42[\"once\"]");
        a.assert_silent().await;
    }

    #[tokio::test]
    async fn binary_event_from_peer_reassembles() {
        let io = SocketIo::default();
        let received: Arc<StdMutex<Option<Bytes>>> = Arc::new(StdMutex::new(None));
        let captured = received.clone();
        io.of("/").on_connection(move |socket| {
            let captured = captured.clone();
            async move {
                socket.on("buf", move |_socket, args, _ack| {
                    let captured = captured.clone();
                    async move {
                        if let Some(Value::Binary(bytes)) = args.first() {
                            captured.lock().unwrap().replace(bytes.clone());
                        }
                    }
                });
            }
        });

        let (peer, _) = FakePeer::connect(&io, "/").await;
        peer.send_text("451-[\"buf\",{\"_placeholder\":true,\"num\":0}]")
            .await;
        peer.send_binary(&[0xDE, 0xAD]).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            received.lock().unwrap().as_deref(),
            Some(&[0xDE, 0xAD][..])
        );
    }

    #[tokio::test]
    async fn binary_event_to_peer_splits_frames() {
        let io = SocketIo::default();
        let (mut peer, _) = FakePeer::connect(&io, "/").await;

        io.of("/")
            .emit(
                "img",
                vec![Value::Binary(Bytes::from_static(&[0xDE, 0xAD]))],
            )
            .await;

        assert_eq!(
            peer.recv_text().await,
            "451-[\"img\",{\"_placeholder\":true,\"num\":0}]"
        );
        assert_eq!(
            peer.recv_frame().await,
            WsFrame::Binary(Bytes::from_static(&[0xDE, 0xAD]))
        );
    }

    #[tokio::test]
    async fn server_emit_with_ack_round_trips() {
        let io = SocketIo::default();
        let (mut peer, _) = FakePeer::connect(&io, "/").await;

        let socket = io.of("/").fetch_sockets().await.pop().unwrap();
        let handle = socket
            .emit_with_ack("q", vec!["v".into()], Some(Duration::from_secs(1)))
            .unwrap();

        let frame = peer.recv_text().await;
        assert_eq!(frame, "421[\"q\",\"v\"]");
        peer.send_text("431[\"r\"]").await;

        let reply = handle.wait().await.unwrap();
        assert_eq!(reply, vec![Value::String("r".into())]);
    }

    #[tokio::test]
    async fn broadcast_with_ack_reports_partial_results_on_timeout() {
        let io = SocketIo::default();
        let ns = io.of("/");
        let (mut a, a_sid) = FakePeer::connect(&io, "/").await;
        let (_b, b_sid) = FakePeer::connect(&io, "/").await;

        let waiter = tokio::spawn({
            let ns = ns.clone();
            async move {
                ns.to(Vec::new())
                    .emit_with_ack("q", vec![], Duration::from_millis(300))
                    .await
            }
        });

        // Only A replies; its frame carries the per-socket ack id.
        let frame = a.recv_text().await;
        let id: String = frame[2..].chars().take_while(|c| c.is_ascii_digit()).collect();
        a.send_text(&format!("43{}[\"ok\"]", id)).await;

        let mut results = waiter.await.unwrap();
        results.sort_by(|x, y| x.sid.cmp(&y.sid));
        assert_eq!(results.len(), 2);
        for entry in results {
            if entry.sid == a_sid {
                assert_eq!(entry.result.unwrap(), vec![Value::String("ok".into())]);
            } else {
                assert_eq!(entry.sid, b_sid);
                assert_eq!(entry.result.unwrap_err(), crate::error::AckError::Timeout);
            }
        }
    }

    #[tokio::test]
    async fn unknown_namespace_is_refused() {
        let io = SocketIo::default();
        let mut peer = FakePeer::open(&io).await;
        peer.send_connect("/nowhere").await;
        assert_eq!(
            peer.recv_text().await,
            "44/nowhere,{\"message\":\"Invalid namespace\"}"
        );
    }

    #[tokio::test]
    async fn dynamic_namespace_matcher_creates_on_first_connect() {
        let io = SocketIo::default();
        io.dyn_ns(r"^/room-\d+$", |ns| {
            ns.on_connection(|_socket| async {});
        })
        .unwrap();

        let (_peer, _) = FakePeer::connect(&io, "/room-7").await;
        assert_eq!(io.of("/room-7").socket_count().await, 1);

        let mut refused = FakePeer::open(&io).await;
        refused.send_connect("/room-x").await;
        assert!(refused.recv_text().await.starts_with("44/room-x,"));
    }

    #[tokio::test]
    async fn middleware_refusal_sends_connect_error() {
        let io = SocketIo::default();
        let ns = io.of("/guarded");
        ns.use_middleware(|socket| async move {
            match socket.handshake().auth.get("token") {
                Some(_) => Ok(()),
                None => Err(ConnectRefusal::new("auth required")),
            }
        });

        let mut peer = FakePeer::open(&io).await;
        peer.send_connect("/guarded").await;
        assert_eq!(
            peer.recv_text().await,
            "44/guarded,{\"message\":\"auth required\"}"
        );
        assert_eq!(ns.socket_count().await, 0);

        // With auth the same chain admits the socket.
        let mut peer2 = FakePeer::open(&io).await;
        peer2.send_text("40/guarded,{\"token\":\"t\"}").await;
        assert!(peer2.recv_text().await.starts_with("40/guarded,"));
        assert_eq!(ns.socket_count().await, 1);
    }

    #[tokio::test]
    async fn authorizer_runs_before_socket_exists() {
        let io = SocketIo::default();
        let ns = io.of("/");
        ns.set_authorizer(|handshake| {
            if handshake.auth.get("key").is_some() {
                Ok(())
            } else {
                Err(ConnectRefusal::new("no key"))
            }
        });

        let mut peer = FakePeer::open(&io).await;
        peer.send_connect("/").await;
        assert_eq!(peer.recv_text().await, "44{\"message\":\"no key\"}");
        assert_eq!(ns.socket_count().await, 0);
    }

    #[tokio::test]
    async fn client_namespace_disconnect_cleans_adapter_state() {
        let io = SocketIo::default();
        let ns = io.of("/");
        let (peer, sid) = FakePeer::connect(&io, "/").await;
        let socket = ns.get_socket(&sid).await.unwrap();
        socket.join(vec!["r".to_string()]).await;

        let handle = socket.emit_with_ack("q", vec![], None).unwrap();

        peer.send_text("41").await; // DISCONNECT for "/"
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(ns.get_socket(&sid).await.is_none());
        assert!(ns.adapter().socket_rooms(&sid).await.is_empty());
        // Pending acks fail with the disconnect sentinel.
        assert_eq!(
            handle.wait().await.unwrap_err(),
            crate::error::AckError::Disconnected
        );
    }

    #[tokio::test]
    async fn engine_close_disconnects_every_namespace_socket() {
        let io = SocketIo::default();
        io.of("/admin");
        let (peer, _) = FakePeer::connect(&io, "/").await;
        peer.send_connect("/admin").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(io.of("/admin").socket_count().await, 1);

        peer.send_text("1").await; // engine CLOSE
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(io.of("/").socket_count().await, 0);
        assert_eq!(io.of("/admin").socket_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_notifies_and_closes() {
        let io = SocketIo::default();
        let (mut peer, _) = FakePeer::connect(&io, "/").await;

        io.close(false).await;
        // DISCONNECT for the namespace, then engine CLOSE.
        assert_eq!(peer.recv_text().await, "41");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(io.engine().session_count().await, 0);
    }
}
