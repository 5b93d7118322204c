//! A [`Namespace`] is a logical channel: its own socket registry, its own
//! adapter, its own connect-time authorization.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::RwLock;

use crate::adapter::{Adapter, BroadcastAck, BroadcastOptions, LocalAdapter};
use crate::client::Client;
use crate::engine::server::new_sid;
use crate::error::DisconnectReason;
use crate::payload::Value;
use crate::protocol::Packet;
use crate::socket::{Handshake, Socket};

/// Why a CONNECT was refused; becomes the CONNECT_ERROR payload.
#[derive(Debug, Clone)]
pub struct ConnectRefusal {
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ConnectRefusal {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            data: None,
        }
    }

    pub fn with_data(message: &str, data: serde_json::Value) -> Self {
        Self {
            message: message.to_string(),
            data: Some(data),
        }
    }
}

type Middleware =
    Arc<dyn Fn(Arc<Socket>) -> BoxFuture<'static, Result<(), ConnectRefusal>> + Send + Sync>;
type Authorizer = Arc<dyn Fn(&Handshake) -> Result<(), ConnectRefusal> + Send + Sync>;
type ConnectionCallback = Arc<dyn Fn(Arc<Socket>) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Namespace {
    /// Namespace name; always begins with `/`.
    pub path: String,
    sockets: RwLock<HashMap<String, Arc<Socket>>>,
    adapter: Arc<dyn Adapter>,
    middlewares: StdRwLock<Vec<Middleware>>,
    authorizer: Mutex<Option<Authorizer>>,
    connection_handler: Mutex<Option<ConnectionCallback>>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("path", &self.path).finish()
    }
}

impl Namespace {
    /// New namespace backed by the in-memory adapter.
    pub fn new(path: &str) -> Arc<Self> {
        Self::with_adapter(path, |ns| Arc::new(LocalAdapter::new(ns)))
    }

    /// New namespace with a custom adapter (the cross-process seam).
    pub fn with_adapter<F>(path: &str, make_adapter: F) -> Arc<Self>
    where
        F: FnOnce(std::sync::Weak<Namespace>) -> Arc<dyn Adapter>,
    {
        Arc::new_cyclic(|weak| Self {
            path: path.to_string(),
            sockets: RwLock::new(HashMap::new()),
            adapter: make_adapter(weak.clone()),
            middlewares: StdRwLock::new(Vec::new()),
            authorizer: Mutex::new(None),
            connection_handler: Mutex::new(None),
        })
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    /// Install the connect-time authorization hook. Runs before the socket
    /// exists; a refusal is sent back as CONNECT_ERROR.
    pub fn set_authorizer<F>(&self, authorizer: F)
    where
        F: Fn(&Handshake) -> Result<(), ConnectRefusal> + Send + Sync + 'static,
    {
        self.authorizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Arc::new(authorizer));
    }

    /// Append a middleware to the connect chain. Middlewares run in
    /// registration order and short-circuit on the first refusal.
    pub fn use_middleware<F, Fut>(&self, middleware: F)
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ConnectRefusal>> + Send + 'static,
    {
        let middleware: Middleware = Arc::new(move |socket| middleware(socket).boxed());
        self.middlewares
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(middleware);
    }

    /// Register the connection listener, fired for every accepted socket.
    pub fn on_connection<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: ConnectionCallback = Arc::new(move |socket| callback(socket).boxed());
        self.connection_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(callback);
    }

    /// Admit a client into this namespace: authorize, create the socket,
    /// auto-join its self room, run the middleware chain, confirm with
    /// CONNECT and hand the socket to the connection listener.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        client: &Arc<Client>,
        auth: serde_json::Value,
        engine_sid: &str,
        transport: String,
    ) -> Result<Arc<Socket>, ConnectRefusal> {
        let handshake = Handshake {
            issued: chrono::Utc::now().timestamp(),
            auth,
            transport,
        };

        let authorizer = self
            .authorizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(authorizer) = authorizer {
            authorizer(&handshake)?;
        }

        let id = if self.path == "/" {
            engine_sid.to_string()
        } else {
            new_sid()
        };
        let socket = Socket::new(id, self.clone(), client.clone(), handshake);
        self.sockets
            .write()
            .await
            .insert(socket.id.clone(), socket.clone());
        // Every socket is a member of a room named by its own id; this is
        // what makes "emit to one socket" a room broadcast.
        self.adapter
            .add_all(&socket.id, vec![socket.id.clone()])
            .await;

        let middlewares: Vec<Middleware> = self
            .middlewares
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for middleware in middlewares {
            if let Err(refusal) = middleware(socket.clone()).await {
                self.remove_socket(&socket.id).await;
                return Err(refusal);
            }
        }

        socket.mark_connected();
        if let Err(e) = socket.send(Packet::connect(&self.path, &socket.id)).await {
            tracing::debug!("[sid={}] connect confirmation failed: {}", socket.id, e);
            self.remove_socket(&socket.id).await;
            return Err(ConnectRefusal::new("connection failed"));
        }
        tracing::info!("[sid={}] connected to {}", socket.id, self.path);

        let handler = self
            .connection_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            let socket = socket.clone();
            tokio::spawn(async move { handler(socket).await });
        }
        Ok(socket)
    }

    pub async fn get_socket(&self, sid: &str) -> Option<Arc<Socket>> {
        self.sockets.read().await.get(sid).cloned()
    }

    pub async fn socket_count(&self) -> usize {
        self.sockets.read().await.len()
    }

    /// Snapshot of every live socket in the namespace.
    pub async fn fetch_sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().await.values().cloned().collect()
    }

    pub(crate) async fn remove_socket(&self, sid: &str) {
        self.adapter.del_all(sid).await;
        self.sockets.write().await.remove(sid);
    }

    /// Emit to every socket in the namespace.
    pub async fn emit(self: &Arc<Self>, event: &str, args: Vec<Value>) -> usize {
        self.to(Vec::new()).emit(event, args).await
    }

    /// Start a targeted broadcast.
    pub fn to(self: &Arc<Self>, rooms: Vec<String>) -> BroadcastOperator {
        BroadcastOperator {
            ns: self.clone(),
            opts: BroadcastOptions {
                rooms,
                ..Default::default()
            },
        }
    }

    /// Disconnect every socket (server shutdown path): each client gets a
    /// DISCONNECT packet for this namespace before the socket is dropped.
    pub async fn close(&self, reason: DisconnectReason) {
        let sockets = self.fetch_sockets().await;
        for socket in sockets {
            let packet = Packet::disconnect(&self.path);
            if let Err(e) = socket.send(packet).await {
                tracing::debug!("[sid={}] shutdown notice failed: {}", socket.id, e);
            }
            socket.close(reason).await;
        }
    }
}

/// Fluent target selection for broadcasts, shared by `Namespace` and
/// `Socket`.
#[derive(Clone)]
pub struct BroadcastOperator {
    ns: Arc<Namespace>,
    opts: BroadcastOptions,
}

impl BroadcastOperator {
    pub fn to(mut self, rooms: Vec<String>) -> Self {
        self.opts.rooms.extend(rooms);
        self
    }

    pub fn except(mut self, rooms: Vec<String>) -> Self {
        self.opts.except.extend(rooms);
        self
    }

    pub fn volatile(mut self) -> Self {
        self.opts.flags.volatile = true;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.opts.flags.compress = compress;
        self
    }

    /// Restrict to this node. No-op with the in-memory adapter.
    pub fn local(mut self) -> Self {
        self.opts.flags.local = true;
        self
    }

    /// Broadcast an event to the selected sockets. Returns how many
    /// sockets the packet was written to.
    pub async fn emit(self, event: &str, args: Vec<Value>) -> usize {
        let packet = match Packet::event(&self.ns.path, event, args) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("broadcast payload rejected: {}", e);
                return 0;
            }
        };
        self.ns.adapter().broadcast(packet, self.opts).await
    }

    /// Broadcast and gather one acknowledgement per selected socket.
    pub async fn emit_with_ack(
        self,
        event: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Vec<BroadcastAck> {
        let packet = match Packet::event(&self.ns.path, event, args) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("broadcast payload rejected: {}", e);
                return Vec::new();
            }
        };
        self.ns
            .adapter()
            .broadcast_with_ack(packet, self.opts, timeout)
            .await
    }

    /// Selected socket ids.
    pub async fn sockets(self) -> HashSet<String> {
        self.ns.adapter().sockets(&self.opts.rooms).await
    }

    /// Join every selected socket to `rooms`.
    pub async fn sockets_join(self, rooms: Vec<String>) {
        let sids = self.ns.adapter().sockets(&self.opts.rooms).await;
        for sid in sids {
            self.ns.adapter().add_all(&sid, rooms.clone()).await;
        }
    }

    /// Remove every selected socket from `room`.
    pub async fn sockets_leave(self, room: &str) {
        let sids = self.ns.adapter().sockets(&self.opts.rooms).await;
        for sid in sids {
            self.ns.adapter().del(&sid, room).await;
        }
    }
}
