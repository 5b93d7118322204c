//! Room membership index and broadcast executor.
//!
//! The [`Adapter`] trait is the seam for cross-process fan-out backends;
//! [`LocalAdapter`] is the in-memory default. It keeps two mutually
//! consistent indexes (`room -> sids`, `sid -> rooms`) under one lock and
//! snapshots broadcast targets before writing, so membership churn during
//! a broadcast never produces partial delivery.

use std::collections::{HashMap, HashSet};
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::AckError;
use crate::namespace::Namespace;
use crate::payload::Value;
use crate::protocol::Packet;

/// Broadcast modifier flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastFlags {
    /// Drop instead of queueing when the peer's buffer is over the
    /// transport threshold.
    pub volatile: bool,
    /// Ask the transport to compress (advisory; carried for adapters that
    /// honor it).
    pub compress: bool,
    /// Suppress cross-node fan-out. No-op in the in-memory adapter.
    pub local: bool,
}

/// Target selection for one broadcast.
///
/// `except` entries are room names; a socket id works too because every
/// socket is a member of a room named by its own id.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub rooms: Vec<String>,
    pub except: Vec<String>,
    pub flags: BroadcastFlags,
}

/// One target's outcome in a broadcast-with-ack.
#[derive(Debug)]
pub struct BroadcastAck {
    pub sid: String,
    pub result: Result<Vec<Value>, AckError>,
}

/// Per-namespace membership index and broadcast executor.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Insert `sid` into each room.
    async fn add_all(&self, sid: &str, rooms: Vec<String>);

    /// Remove `sid` from one room; empty rooms are deleted.
    async fn del(&self, sid: &str, room: &str);

    /// Remove `sid` from every room it is in, atomically.
    async fn del_all(&self, sid: &str);

    /// Union of members over `rooms`; all known sids when empty.
    async fn sockets(&self, rooms: &[String]) -> HashSet<String>;

    /// Rooms `sid` is a member of.
    async fn socket_rooms(&self, sid: &str) -> HashSet<String>;

    /// Deliver `packet` to every matching socket. The packet is encoded
    /// once and the frames fanned out. Returns the number of sockets the
    /// packet was written to; per-target failures are independent.
    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> usize;

    /// Broadcast and collect one ack per matching socket. Resolves when
    /// every target replied or `timeout` elapsed; late targets report
    /// [`AckError::Timeout`].
    async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
        timeout: Duration,
    ) -> Vec<BroadcastAck>;
}

#[derive(Default)]
struct Indexes {
    rooms: HashMap<String, HashSet<String>>,
    sids: HashMap<String, HashSet<String>>,
}

pub struct LocalAdapter {
    ns: Weak<Namespace>,
    indexes: RwLock<Indexes>,
}

impl LocalAdapter {
    pub fn new(ns: Weak<Namespace>) -> Self {
        Self {
            ns,
            indexes: RwLock::new(Indexes::default()),
        }
    }

    /// Snapshot the target sid set for `opts`. Taken under the read lock;
    /// later membership changes do not affect this broadcast.
    async fn targets(&self, opts: &BroadcastOptions) -> Vec<String> {
        let indexes = self.indexes.read().await;

        let mut excluded: HashSet<String> = HashSet::new();
        for entry in &opts.except {
            excluded.insert(entry.clone());
            if let Some(members) = indexes.rooms.get(entry) {
                excluded.extend(members.iter().cloned());
            }
        }

        let mut targets: Vec<String> = Vec::new();
        let mut seen: HashSet<&String> = HashSet::new();
        if opts.rooms.is_empty() {
            for sid in indexes.sids.keys() {
                if !excluded.contains(sid) && seen.insert(sid) {
                    targets.push(sid.clone());
                }
            }
        } else {
            for room in &opts.rooms {
                if let Some(members) = indexes.rooms.get(room) {
                    for sid in members {
                        if !excluded.contains(sid) && seen.insert(sid) {
                            targets.push(sid.clone());
                        }
                    }
                }
            }
        }
        targets
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    async fn add_all(&self, sid: &str, rooms: Vec<String>) {
        let mut indexes = self.indexes.write().await;
        for room in rooms {
            indexes
                .rooms
                .entry(room.clone())
                .or_default()
                .insert(sid.to_string());
            indexes
                .sids
                .entry(sid.to_string())
                .or_default()
                .insert(room);
        }
    }

    async fn del(&self, sid: &str, room: &str) {
        let mut indexes = self.indexes.write().await;
        if let Some(members) = indexes.rooms.get_mut(room) {
            members.remove(sid);
            if members.is_empty() {
                indexes.rooms.remove(room);
            }
        }
        if let Some(rooms) = indexes.sids.get_mut(sid) {
            rooms.remove(room);
            if rooms.is_empty() {
                indexes.sids.remove(sid);
            }
        }
    }

    async fn del_all(&self, sid: &str) {
        let mut indexes = self.indexes.write().await;
        if let Some(rooms) = indexes.sids.remove(sid) {
            for room in rooms {
                if let Some(members) = indexes.rooms.get_mut(&room) {
                    members.remove(sid);
                    if members.is_empty() {
                        indexes.rooms.remove(&room);
                    }
                }
            }
        }
    }

    async fn sockets(&self, rooms: &[String]) -> HashSet<String> {
        let indexes = self.indexes.read().await;
        if rooms.is_empty() {
            return indexes.sids.keys().cloned().collect();
        }
        let mut out = HashSet::new();
        for room in rooms {
            if let Some(members) = indexes.rooms.get(room) {
                out.extend(members.iter().cloned());
            }
        }
        out
    }

    async fn socket_rooms(&self, sid: &str) -> HashSet<String> {
        let indexes = self.indexes.read().await;
        indexes.sids.get(sid).cloned().unwrap_or_default()
    }

    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> usize {
        let targets = self.targets(&opts).await;
        let Some(ns) = self.ns.upgrade() else {
            return 0;
        };

        // Encode once, write the same frames to every target.
        let frames = packet.to_engine_frames();
        let mut delivered = 0;
        for sid in targets {
            let Some(socket) = ns.get_socket(&sid).await else {
                continue;
            };
            let ok = if opts.flags.volatile {
                socket.client().write_volatile(frames.clone()).await
            } else {
                match socket.client().write_to_engine(frames.clone()).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!("[sid={}] broadcast write failed: {}", sid, e);
                        false
                    }
                }
            };
            if ok {
                delivered += 1;
            }
        }
        delivered
    }

    async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
        timeout: Duration,
    ) -> Vec<BroadcastAck> {
        let targets = self.targets(&opts).await;
        let Some(ns) = self.ns.upgrade() else {
            return Vec::new();
        };

        // Ack ids are per-socket, so each target gets its own encoding.
        let mut failed = Vec::new();
        let mut pending = Vec::new();
        for sid in targets {
            let Some(socket) = ns.get_socket(&sid).await else {
                continue;
            };
            let (id, rx) = socket.register_ack(None);
            match socket.send(packet.clone().with_id(id)).await {
                Ok(()) => pending.push((sid, rx)),
                Err(e) => failed.push(BroadcastAck {
                    sid,
                    result: Err(AckError::Send(e.to_string())),
                }),
            }
        }

        let waits = pending.into_iter().map(|(sid, rx)| async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => BroadcastAck { sid, result },
                Ok(Err(_)) => BroadcastAck {
                    sid,
                    result: Err(AckError::Disconnected),
                },
                Err(_) => BroadcastAck {
                    sid,
                    result: Err(AckError::Timeout),
                },
            }
        });
        let mut results = futures::future::join_all(waits).await;
        results.extend(failed);
        results
    }
}
