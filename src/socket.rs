//! A [`Socket`] is one client's endpoint inside one namespace.
//!
//! It carries the listener table, the pending-ack tracker and the room
//! membership helpers. Sockets are always handled through `Arc`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::client::Client;
use crate::error::{AckError, DisconnectReason, Error};
use crate::namespace::{BroadcastOperator, Namespace};
use crate::payload::Value;
use crate::protocol::Packet;

pub(crate) type EventCallback =
    Arc<dyn Fn(Arc<Socket>, Vec<Value>, Option<AckResponder>) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type DisconnectCallback =
    Arc<dyn Fn(Arc<Socket>, DisconnectReason) -> BoxFuture<'static, ()> + Send + Sync>;

/// What the client presented when it connected to the namespace.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Unix timestamp of the namespace connect.
    pub issued: i64,
    /// Auth payload from the CONNECT packet.
    pub auth: serde_json::Value,
    /// Transport the engine session was on at connect time.
    pub transport: String,
}

type AckResult = Result<Vec<Value>, AckError>;

struct PendingAck {
    tx: oneshot::Sender<AckResult>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

/// Awaitable acknowledgement for an emit-with-ack.
pub struct AckHandle {
    rx: oneshot::Receiver<AckResult>,
}

impl AckHandle {
    pub(crate) fn from_receiver(rx: oneshot::Receiver<AckResult>) -> Self {
        Self { rx }
    }

    /// Resolve to the peer's reply, a timeout, or a disconnect error.
    pub async fn wait(self) -> AckResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(AckError::Disconnected),
        }
    }
}

/// Reply capability handed to an event listener when the sender asked for
/// an acknowledgement. Consumed by `send`; replying twice is a no-op.
pub struct AckResponder {
    socket: Arc<Socket>,
    id: u64,
    used: AtomicBool,
}

impl AckResponder {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send(&self, args: Vec<Value>) -> Result<(), Error> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let packet = Packet::ack(&self.socket.ns().path, self.id, args)?;
        self.socket.send(packet).await
    }
}

pub struct Socket {
    /// Socket id: the engine session id inside "/", a fresh id elsewhere.
    pub id: String,
    ns: Arc<Namespace>,
    client: Arc<Client>,
    handshake: Handshake,
    connected: AtomicBool,
    ack_counter: AtomicU64,
    acks: Mutex<HashMap<u64, PendingAck>>,
    handlers: RwLock<HashMap<String, EventCallback>>,
    disconnect_handler: Mutex<Option<DisconnectCallback>>,
    /// Application-opaque per-socket data.
    data: RwLock<HashMap<String, serde_json::Value>>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("nsp", &self.ns.path)
            .field("connected", &self.connected)
            .finish()
    }
}

impl Socket {
    pub(crate) fn new(
        id: String,
        ns: Arc<Namespace>,
        client: Arc<Client>,
        handshake: Handshake,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            ns,
            client,
            handshake,
            connected: AtomicBool::new(false),
            ack_counter: AtomicU64::new(0),
            acks: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            disconnect_handler: Mutex::new(None),
            data: RwLock::new(HashMap::new()),
        })
    }

    pub fn ns(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub(crate) fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Register a listener for `event`. One listener per event name; a
    /// second registration replaces the first.
    pub fn on<F, Fut>(&self, event: &str, callback: F)
    where
        F: Fn(Arc<Socket>, Vec<Value>, Option<AckResponder>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: EventCallback =
            Arc::new(move |socket, args, ack| callback(socket, args, ack).boxed());
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.to_string(), callback);
    }

    /// Register the disconnect listener.
    pub fn on_disconnect<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<Socket>, DisconnectReason) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: DisconnectCallback =
            Arc::new(move |socket, reason| callback(socket, reason).boxed());
        self.disconnect_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(callback);
    }

    /// Emit an event to this client.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), Error> {
        let packet = Packet::event(&self.ns.path, event, args)?;
        self.send(packet).await
    }

    /// Emit and wait for the client's acknowledgement. With a timeout the
    /// tracker entry self-destructs and the handle resolves to
    /// [`AckError::Timeout`].
    pub fn emit_with_ack(
        self: &Arc<Self>,
        event: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<AckHandle, Error> {
        let packet = Packet::event(&self.ns.path, event, args)?;
        let (id, rx) = self.register_ack(timeout);
        let packet = packet.with_id(id);
        let socket = self.clone();
        tokio::spawn(async move {
            if let Err(e) = socket.send(packet).await {
                tracing::debug!("[sid={}] emit-with-ack send failed: {}", socket.id, e);
                socket.fail_ack(id, AckError::Send(e.to_string()));
            }
        });
        Ok(AckHandle { rx })
    }

    /// Allocate the next ack id and register the pending entry. Ids are
    /// strictly increasing over the socket's lifetime.
    pub(crate) fn register_ack(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> (u64, oneshot::Receiver<AckResult>) {
        let id = self.ack_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        let timer = timeout.map(|after| {
            let socket = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                socket.fail_ack(id, AckError::Timeout);
            })
        });
        self.acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, PendingAck { tx, timer });
        (id, rx)
    }

    fn fail_ack(&self, id: u64, error: AckError) {
        let entry = self
            .acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(entry) = entry {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.tx.send(Err(error));
        }
    }

    /// Resolve a pending ack from the wire. Expired ids are discarded.
    pub(crate) fn resolve_ack(&self, id: u64, args: Vec<Value>) {
        let entry = self
            .acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                let _ = entry.tx.send(Ok(args));
            }
            None => tracing::debug!("[sid={}] ack {} already expired", self.id, id),
        }
    }

    // Room membership

    pub async fn join(&self, rooms: Vec<String>) {
        self.ns.adapter().add_all(&self.id, rooms).await;
    }

    pub async fn leave(&self, room: &str) {
        self.ns.adapter().del(&self.id, room).await;
    }

    pub async fn rooms(&self) -> HashSet<String> {
        self.ns.adapter().socket_rooms(&self.id).await
    }

    // Broadcast operators

    /// Target rooms, excluding this socket.
    pub fn to(self: &Arc<Self>, rooms: Vec<String>) -> BroadcastOperator {
        self.ns.to(rooms).except(vec![self.id.clone()])
    }

    /// Everyone in the namespace except this socket.
    pub fn broadcast(self: &Arc<Self>) -> BroadcastOperator {
        self.ns.to(Vec::new()).except(vec![self.id.clone()])
    }

    pub fn except(self: &Arc<Self>, rooms: Vec<String>) -> BroadcastOperator {
        let mut except = rooms;
        except.push(self.id.clone());
        self.ns.to(Vec::new()).except(except)
    }

    // Per-socket application data

    pub fn set_data(&self, key: &str, value: serde_json::Value) {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }

    pub fn get_data(&self, key: &str) -> Option<serde_json::Value> {
        self.data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Server-initiated disconnect from this namespace: tells the client,
    /// then tears the socket down.
    pub async fn disconnect(self: &Arc<Self>) -> Result<(), Error> {
        let packet = Packet::disconnect(&self.ns.path);
        // Best effort: the teardown proceeds even if the notice fails.
        if let Err(e) = self.send(packet).await {
            tracing::debug!("[sid={}] disconnect notice failed: {}", self.id, e);
        }
        self.close(DisconnectReason::ServerNamespaceDisconnect).await;
        Ok(())
    }

    /// Write a packet to this client through the shared engine session.
    pub(crate) async fn send(&self, packet: Packet) -> Result<(), Error> {
        self.client.write_to_engine(packet.to_engine_frames()).await
    }

    /// Deliver a decoded EVENT to the listener table. Listener futures run
    /// on their own task; a panic inside one never tears down the session.
    pub(crate) fn dispatch_event(self: &Arc<Self>, packet: &Packet) {
        let Some(name) = packet.event_name() else {
            return;
        };
        let args = match packet.event_args() {
            Ok(args) => args,
            Err(e) => {
                tracing::debug!("[sid={}] dropping event with bad payload: {}", self.id, e);
                return;
            }
        };
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(name).cloned()
        };
        let Some(handler) = handler else {
            tracing::debug!("[sid={}] no listener for event {:?}", self.id, name);
            return;
        };
        let ack = packet.id.map(|id| AckResponder {
            socket: self.clone(),
            id,
            used: AtomicBool::new(false),
        });
        let socket = self.clone();
        let event = name.to_string();
        tokio::spawn(async move {
            let fut = std::panic::AssertUnwindSafe(handler(socket.clone(), args, ack));
            if fut.catch_unwind().await.is_err() {
                tracing::error!("[sid={}] listener for {:?} panicked", socket.id, event);
            }
        });
    }

    /// Tear the socket down: fail pending acks, leave all rooms, remove
    /// from the namespace, fire the disconnect listener. Idempotent.
    pub(crate) async fn close(self: &Arc<Self>, reason: DisconnectReason) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        let pending: Vec<PendingAck> = {
            let mut acks = self.acks.lock().unwrap_or_else(|e| e.into_inner());
            acks.drain().map(|(_, entry)| entry).collect()
        };
        for entry in pending {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.tx.send(Err(AckError::Disconnected));
        }

        self.ns.remove_socket(&self.id).await;
        self.client.forget_socket(&self.ns.path).await;
        tracing::info!(
            "[sid={}] disconnected from {}: {}",
            self.id,
            self.ns.path,
            reason
        );

        let handler = self
            .disconnect_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handler) = handler {
            let socket = self.clone();
            tokio::spawn(async move {
                let fut = std::panic::AssertUnwindSafe(handler(socket.clone(), reason));
                if fut.catch_unwind().await.is_err() {
                    tracing::error!("[sid={}] disconnect listener panicked", socket.id);
                }
            });
        }
    }
}
