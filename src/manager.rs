//! Client-side connection manager.
//!
//! A [`Manager`] owns one engine connection (behind a [`Connector`]) and
//! multiplexes per-namespace [`ClientSocket`]s over it. It reconnects
//! with capped exponential backoff and jitter after unexpected closes;
//! sockets buffer emits while disconnected and flush them in FIFO order
//! once the namespace CONNECT is re-acknowledged.

pub mod polling;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::ReconnectConfig;
use crate::engine::packet::{EnginePacket, OpenPacket};
use crate::error::{AckError, Error};
use crate::payload::Value;
use crate::protocol::decoder::PacketDecoder;
use crate::protocol::{Packet, PacketType};
use crate::socket::AckHandle;

/// One engine-level connection attempt's result: the handshake data and a
/// frame pipe. The connector owns the transport mechanics.
pub struct EngineConn {
    pub handshake: OpenPacket,
    pub tx: mpsc::UnboundedSender<EnginePacket>,
    pub rx: mpsc::UnboundedReceiver<EnginePacket>,
}

/// Opens engine connections. Implementations: HTTP long-poll
/// ([`polling::PollingConnector`]), in-process pipes for tests, or any
/// external stream transport.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> Result<EngineConn, Error>;
}

/// Lifecycle notifications for the application.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Open { sid: String },
    Close { reason: String },
    ReconnectAttempt(u32),
    Reconnected { attempts: u32 },
    ReconnectFailed,
    Error(String),
}

type EventListener = Box<dyn Fn(ManagerEvent) + Send + Sync>;

enum ConnState {
    Disconnected,
    Connecting,
    Connected {
        tx: mpsc::UnboundedSender<EnginePacket>,
        epoch: u64,
    },
}

pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    reconnect: ReconnectConfig,
    state: Mutex<ConnState>,
    decoder: Mutex<PacketDecoder>,
    sockets: StdRwLock<HashMap<String, Arc<ClientSocket>>>,
    listeners: StdRwLock<Vec<EventListener>>,
    attempts: AtomicU32,
    epoch: AtomicU64,
    closing: AtomicBool,
}

impl Manager {
    pub fn new(connector: Arc<dyn Connector>, reconnect: ReconnectConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                reconnect,
                state: Mutex::new(ConnState::Disconnected),
                decoder: Mutex::new(PacketDecoder::new()),
                sockets: StdRwLock::new(HashMap::new()),
                listeners: StdRwLock::new(Vec::new()),
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(ManagerEvent) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(listener));
    }

    /// Open the engine connection. Errors while already opening or open.
    pub async fn open(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().await;
            match *state {
                ConnState::Disconnected => *state = ConnState::Connecting,
                _ => return Err(Error::Transport("already opening".to_string())),
            }
        }
        match self.inner.connector.open().await {
            Ok(conn) => {
                self.inner.clone().on_engine_open(conn).await;
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock().await = ConnState::Disconnected;
                self.inner.clone().maybe_schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Close for good: no reconnection.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        if let ConnState::Connected { tx, .. } = &*state {
            let _ = tx.send(EnginePacket::Close);
        }
        *state = ConnState::Disconnected;
    }

    /// Get or create the socket for `nsp` with no auth and no ack retry.
    pub fn socket(&self, nsp: &str) -> Arc<ClientSocket> {
        self.socket_with(nsp, serde_json::Value::Null, 0)
    }

    /// Get or create the socket for `nsp`. `retries > 0` keeps pending
    /// acks across reconnects and replays them after the CONNECT ack.
    pub fn socket_with(
        &self,
        nsp: &str,
        auth: serde_json::Value,
        retries: u32,
    ) -> Arc<ClientSocket> {
        let mut sockets = self
            .inner
            .sockets
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(socket) = sockets.get(nsp) {
            return socket.clone();
        }
        let socket = Arc::new(ClientSocket {
            nsp: nsp.to_string(),
            manager: Arc::downgrade(&self.inner),
            auth,
            retries,
            active: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            sid: StdMutex::new(None),
            send_buffer: StdMutex::new(VecDeque::new()),
            acks: StdMutex::new(HashMap::new()),
            ack_counter: AtomicU64::new(0),
            handlers: StdRwLock::new(HashMap::new()),
        });
        sockets.insert(nsp.to_string(), socket.clone());
        socket
    }

    pub async fn connected(&self) -> bool {
        matches!(*self.inner.state.lock().await, ConnState::Connected { .. })
    }
}

impl ManagerInner {
    fn emit_event(&self, event: ManagerEvent) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener(event.clone());
        }
    }

    async fn on_engine_open(self: Arc<Self>, conn: EngineConn) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state.lock().await;
            *state = ConnState::Connected {
                tx: conn.tx.clone(),
                epoch,
            };
        }
        self.attempts.store(0, Ordering::SeqCst);
        self.decoder.lock().await.reset();
        tracing::info!("[sid={}] engine connection open", conn.handshake.sid);
        self.emit_event(ManagerEvent::Open {
            sid: conn.handshake.sid.clone(),
        });

        // Replay CONNECT for every socket the application opened.
        let sockets = self.snapshot_sockets();
        for socket in &sockets {
            if socket.active.load(Ordering::SeqCst) {
                socket.send_connect_request().await;
            }
        }

        let weak = Arc::downgrade(&self);
        let mut rx = conn.rx;
        tokio::spawn(async move {
            loop {
                let Some(packet) = rx.recv().await else {
                    break;
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match packet {
                    // Server-initiated heartbeat: answer in kind.
                    EnginePacket::Ping(payload) => {
                        inner.send_engine(EnginePacket::Pong(payload)).await;
                    }
                    EnginePacket::Message(text) => inner.on_message(text).await,
                    EnginePacket::Binary(data) => inner.on_binary(data).await,
                    EnginePacket::Close => break,
                    _ => {}
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.handle_close(epoch, "transport close").await;
            }
        });
    }

    fn snapshot_sockets(&self) -> Vec<Arc<ClientSocket>> {
        self.sockets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    async fn send_engine(&self, packet: EnginePacket) {
        let state = self.state.lock().await;
        if let ConnState::Connected { tx, .. } = &*state {
            let _ = tx.send(packet);
        }
    }

    async fn send_packet(&self, packet: &Packet) -> bool {
        let state = self.state.lock().await;
        if let ConnState::Connected { tx, .. } = &*state {
            for frame in packet.to_engine_frames() {
                if tx.send(frame).is_err() {
                    return false;
                }
            }
            true
        } else {
            false
        }
    }

    async fn on_message(self: &Arc<Self>, text: String) {
        let decoded = self.decoder.lock().await.decode_text(&text);
        match decoded {
            Ok(Some(packet)) => self.route(packet).await,
            Ok(None) => {}
            Err(e) => tracing::warn!("undecodable server packet: {}", e),
        }
    }

    async fn on_binary(self: &Arc<Self>, data: Bytes) {
        let decoded = self.decoder.lock().await.decode_binary(data);
        match decoded {
            Ok(Some(packet)) => self.route(packet).await,
            Ok(None) => {}
            Err(e) => tracing::warn!("unexpected binary frame: {}", e),
        }
    }

    async fn route(self: &Arc<Self>, packet: Packet) {
        let socket = self
            .sockets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&packet.nsp)
            .cloned();
        let Some(socket) = socket else {
            tracing::debug!("packet for unknown namespace {}", packet.nsp);
            return;
        };
        socket.handle_packet(packet).await;
    }

    async fn handle_close(self: &Arc<Self>, epoch: u64, reason: &str) {
        {
            let mut state = self.state.lock().await;
            match &*state {
                // A newer connection already took over.
                ConnState::Connected { epoch: current, .. } if *current != epoch => return,
                _ => {}
            }
            *state = ConnState::Disconnected;
        }
        tracing::info!("engine connection closed: {}", reason);
        for socket in self.snapshot_sockets() {
            socket.on_manager_close();
        }
        self.emit_event(ManagerEvent::Close {
            reason: reason.to_string(),
        });
        self.clone().maybe_schedule_reconnect();
    }

    fn maybe_schedule_reconnect(self: Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) || !self.reconnect.enabled {
            return;
        }
        tokio::spawn(async move {
            loop {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if self.reconnect.max_attempts > 0 && attempt > self.reconnect.max_attempts {
                    self.emit_event(ManagerEvent::ReconnectFailed);
                    return;
                }
                tokio::time::sleep(backoff_delay(&self.reconnect, attempt)).await;
                if self.closing.load(Ordering::SeqCst) {
                    return;
                }
                self.emit_event(ManagerEvent::ReconnectAttempt(attempt));
                {
                    let mut state = self.state.lock().await;
                    match *state {
                        ConnState::Disconnected => *state = ConnState::Connecting,
                        _ => return,
                    }
                }
                match self.connector.open().await {
                    Ok(conn) => {
                        self.clone().on_engine_open(conn).await;
                        self.emit_event(ManagerEvent::Reconnected { attempts: attempt });
                        return;
                    }
                    Err(e) => {
                        *self.state.lock().await = ConnState::Disconnected;
                        self.emit_event(ManagerEvent::Error(e.to_string()));
                    }
                }
            }
        });
    }
}

/// Backoff before reconnect attempt `attempt` (1-based):
/// `min(delay_max, delay * 2^(attempt-1))`, spread by the randomization
/// factor in both directions.
fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = config.delay.as_millis() as u64;
    let capped = base
        .saturating_mul(1u64 << exp)
        .min(config.delay_max.as_millis() as u64);
    let jitter = (capped as f64 * config.randomization_factor) as u64;
    let low = capped.saturating_sub(jitter);
    let high = capped.saturating_add(jitter).max(low + 1);
    Duration::from_millis(rand::rng().random_range(low..high))
}

type AckResult = Result<Vec<Value>, AckError>;

struct PendingClientAck {
    tx: oneshot::Sender<AckResult>,
    /// Retained for replay when the socket is configured with retries.
    packet: Option<Packet>,
}

type ClientEventCallback =
    Arc<dyn Fn(Vec<Value>, Option<ClientAckResponder>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Reply capability for server-initiated acks on the client side.
pub struct ClientAckResponder {
    manager: Weak<ManagerInner>,
    nsp: String,
    id: u64,
}

impl ClientAckResponder {
    pub async fn send(&self, args: Vec<Value>) -> Result<(), Error> {
        let Some(manager) = self.manager.upgrade() else {
            return Err(Error::SessionClosed);
        };
        let packet = Packet::ack(&self.nsp, self.id, args)?;
        manager.send_packet(&packet).await;
        Ok(())
    }
}

/// Per-namespace client socket sharing the manager's engine connection.
pub struct ClientSocket {
    pub nsp: String,
    manager: Weak<ManagerInner>,
    auth: serde_json::Value,
    retries: u32,
    /// The application asked for this namespace to be open.
    active: AtomicBool,
    connected: AtomicBool,
    sid: StdMutex<Option<String>>,
    send_buffer: StdMutex<VecDeque<Packet>>,
    acks: StdMutex<HashMap<u64, PendingClientAck>>,
    ack_counter: AtomicU64,
    handlers: StdRwLock<HashMap<String, ClientEventCallback>>,
}

impl ClientSocket {
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Namespace sid from the last CONNECT ack.
    pub fn sid(&self) -> Option<String> {
        self.sid.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ask for this namespace to be opened (now, or at the next engine
    /// connect).
    pub async fn connect(&self) {
        self.active.store(true, Ordering::SeqCst);
        self.send_connect_request().await;
    }

    async fn send_connect_request(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let packet = Packet::connect_request(&self.nsp, self.auth.clone());
        manager.send_packet(&packet).await;
    }

    /// Register a listener for `event`; one listener per event name.
    pub fn on<F, Fut>(&self, event: &str, callback: F)
    where
        F: Fn(Vec<Value>, Option<ClientAckResponder>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: ClientEventCallback = Arc::new(move |args, ack| callback(args, ack).boxed());
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.to_string(), callback);
    }

    /// Emit an event; buffered in FIFO order while disconnected.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), Error> {
        let packet = Packet::event(&self.nsp, event, args)?;
        self.send_or_buffer(packet).await;
        Ok(())
    }

    /// Emit and wait for the server's ack.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<AckHandle, Error> {
        let id = self.ack_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let packet = Packet::event(&self.nsp, event, args)?.with_id(id);
        let (tx, rx) = oneshot::channel();
        {
            let mut acks = self.acks.lock().unwrap_or_else(|e| e.into_inner());
            acks.insert(
                id,
                PendingClientAck {
                    tx,
                    packet: (self.retries > 0).then(|| packet.clone()),
                },
            );
        }
        if let Some(after) = timeout {
            let manager = self.manager.clone();
            let nsp = self.nsp.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let socket = manager
                    .sockets
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&nsp)
                    .cloned();
                if let Some(socket) = socket {
                    socket.fail_ack(id, AckError::Timeout);
                }
            });
        }
        self.send_or_buffer(packet).await;
        Ok(AckHandle::from_receiver(rx))
    }

    async fn send_or_buffer(&self, packet: Packet) {
        let sent = if self.connected.load(Ordering::SeqCst) {
            match self.manager.upgrade() {
                Some(manager) => manager.send_packet(&packet).await,
                None => false,
            }
        } else {
            false
        };
        if !sent {
            self.send_buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(packet);
        }
    }

    fn fail_ack(&self, id: u64, error: AckError) {
        let entry = self
            .acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(entry) = entry {
            let _ = entry.tx.send(Err(error));
        }
    }

    /// Leave the namespace; the socket stays registered but inert.
    pub async fn disconnect(&self) {
        self.active.store(false, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Some(manager) = self.manager.upgrade() {
                let packet = Packet::disconnect(&self.nsp);
                manager.send_packet(&packet).await;
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, packet: Packet) {
        match packet.packet_type {
            PacketType::Connect => self.on_connect_ack(&packet).await,
            PacketType::Disconnect => {
                self.connected.store(false, Ordering::SeqCst);
                tracing::info!("server disconnected namespace {}", self.nsp);
            }
            PacketType::Event | PacketType::BinaryEvent => self.dispatch_event(&packet),
            PacketType::Ack | PacketType::BinaryAck => {
                if let Some(id) = packet.id {
                    match packet.ack_args() {
                        Ok(args) => {
                            let entry = self
                                .acks
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .remove(&id);
                            if let Some(entry) = entry {
                                let _ = entry.tx.send(Ok(args));
                            }
                        }
                        Err(e) => tracing::debug!("bad ack payload: {}", e),
                    }
                }
            }
            PacketType::ConnectError => {
                let message = packet.data["message"].as_str().unwrap_or("connect error");
                tracing::warn!("connect to {} refused: {}", self.nsp, message);
                self.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    /// CONNECT ack: the namespace is live. Flush buffered emits in FIFO
    /// order, then replay retained in-flight acks.
    async fn on_connect_ack(&self, packet: &Packet) {
        if let Some(sid) = packet.data.get("sid").and_then(|v| v.as_str()) {
            self.sid
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .replace(sid.to_string());
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("connected to namespace {}", self.nsp);

        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let buffered: Vec<Packet> = {
            let mut buffer = self
                .send_buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            buffer.drain(..).collect()
        };
        for packet in buffered {
            manager.send_packet(&packet).await;
        }

        let mut retained: Vec<Packet> = {
            let acks = self.acks.lock().unwrap_or_else(|e| e.into_inner());
            acks.values().filter_map(|a| a.packet.clone()).collect()
        };
        retained.sort_by_key(|p| p.id);
        for packet in retained {
            manager.send_packet(&packet).await;
        }
    }

    fn dispatch_event(self: &Arc<Self>, packet: &Packet) {
        let Some(name) = packet.event_name() else {
            return;
        };
        let args = match packet.event_args() {
            Ok(args) => args,
            Err(e) => {
                tracing::debug!("dropping event with bad payload: {}", e);
                return;
            }
        };
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(name).cloned()
        };
        let Some(handler) = handler else {
            return;
        };
        let ack = packet.id.map(|id| ClientAckResponder {
            manager: self.manager.clone(),
            nsp: self.nsp.clone(),
            id,
        });
        tokio::spawn(handler(args, ack));
    }

    /// The engine connection died. Without retries every pending ack is
    /// failed now; with retries the entries survive for replay.
    fn on_manager_close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if self.retries == 0 {
            let pending: Vec<PendingClientAck> = {
                let mut acks = self.acks.lock().unwrap_or_else(|e| e.into_inner());
                acks.drain().map(|(_, entry)| entry).collect()
            };
            for entry in pending {
                let _ = entry.tx.send(Err(AckError::Disconnected));
            }
        }
    }
}
