//! Per-client engine session.
//!
//! Owns the current transport, the write buffer and the heartbeat task.
//! Every mutation of transport or buffer happens under one lock, so a
//! flush is atomic with respect to appends and a transport swap never
//! loses buffered packets.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use super::packet::{encode_polling_payload, EnginePacket};
use super::transport::{Transport, TransportKind, WsFrame};
use crate::config::ServerConfig;
use crate::error::{DisconnectReason, Error};

/// Session lifecycle. Transitions only move forward; a closed session id
/// is never reused (ids are fresh UUIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Open,
    Closing,
    Closed,
}

type CloseFn = Box<dyn Fn(Arc<EngineSession>, DisconnectReason) + Send + Sync>;

struct SessionInner {
    state: SessionState,
    transport: Transport,
    write_buffer: VecDeque<EnginePacket>,
    upgrading: bool,
}

pub struct EngineSession {
    pub id: String,
    config: Arc<ServerConfig>,
    inner: Mutex<SessionInner>,
    /// Held for the duration of one GET; a second concurrent poll is a
    /// protocol violation that closes the session.
    poll_guard: Mutex<()>,
    heartbeat_tx: mpsc::Sender<()>,
    heartbeat_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    closed_tx: watch::Sender<bool>,
    on_close: CloseFn,
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession").field("id", &self.id).finish()
    }
}

impl EngineSession {
    pub fn new(
        id: String,
        config: Arc<ServerConfig>,
        transport: Transport,
        on_close: CloseFn,
    ) -> Arc<Self> {
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            config,
            inner: Mutex::new(SessionInner {
                state: SessionState::Opening,
                transport,
                write_buffer: VecDeque::new(),
                upgrading: false,
            }),
            poll_guard: Mutex::new(()),
            heartbeat_tx,
            heartbeat_rx: std::sync::Mutex::new(Some(heartbeat_rx)),
            closed_tx,
            on_close,
        })
    }

    pub fn config_connect_timeout(&self) -> std::time::Duration {
        self.config.connect_timeout
    }

    pub async fn mark_open(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Opening {
            inner.state = SessionState::Open;
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.state == SessionState::Closed
    }

    pub async fn transport_kind(&self) -> TransportKind {
        self.inner.lock().await.transport.kind()
    }

    /// Watch that flips to `true` when the session closes.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Append one packet and flush.
    pub async fn send(self: &Arc<Self>, packet: EnginePacket) -> Result<(), Error> {
        self.send_many(vec![packet]).await
    }

    /// Append a run of packets and flush once. The whole append+flush is
    /// atomic under the session lock, so interleaved emits cannot split a
    /// packet from its binary attachments.
    pub async fn send_many(self: &Arc<Self>, packets: Vec<EnginePacket>) -> Result<(), Error> {
        let flush_result = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Opening | SessionState::Open => {}
                _ => return Err(Error::SessionClosed),
            }
            inner.write_buffer.extend(packets);
            Self::flush_inner(&mut inner)
        };
        if flush_result.is_err() {
            self.close(DisconnectReason::TransportError).await;
        }
        flush_result
    }

    /// Best-effort send: drops the packets without error when the peer's
    /// buffer is over the transport's writability threshold. Returns
    /// whether the packets were enqueued.
    pub async fn send_volatile(self: &Arc<Self>, packets: Vec<EnginePacket>) -> bool {
        let flush_result = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Open {
                return false;
            }
            if !inner.transport.writable(inner.write_buffer.len()) {
                tracing::debug!("[sid={}] dropping volatile packet", self.id);
                return false;
            }
            inner.write_buffer.extend(packets);
            Self::flush_inner(&mut inner)
        };
        flush_result.is_ok()
    }

    fn flush_inner(inner: &mut SessionInner) -> Result<(), Error> {
        match &inner.transport {
            Transport::Polling { notify } => {
                // Packets stay buffered; wake a hanging GET if any. The
                // permit persists so a poll arriving later drains directly.
                notify.notify_one();
                Ok(())
            }
            Transport::Websocket { tx } => {
                while let Some(packet) = inner.write_buffer.pop_front() {
                    tx.send(WsFrame::from(&packet))
                        .map_err(|_| Error::Transport("websocket writer gone".to_string()))?;
                }
                Ok(())
            }
        }
    }

    /// Serve one long-poll GET: drain buffered packets, or wait until
    /// something is flushed. Two concurrent polls close the session.
    pub async fn poll_payload(self: &Arc<Self>) -> Result<String, Error> {
        let _guard = match self.poll_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("[sid={}] concurrent polling requests", self.id);
                self.close(DisconnectReason::MultiplePollingRequests).await;
                return Err(Error::MultiplePollingRequests);
            }
        };

        let mut closed_rx = self.closed_signal();
        // A poll never outlives one heartbeat cycle; the server pings well
        // within this window, so an empty wait ends with a NOOP release.
        let deadline = self.config.ping_interval + self.config.ping_timeout;

        loop {
            let notify = {
                let mut inner = self.inner.lock().await;
                if inner.state == SessionState::Closed {
                    let (body, _) = encode_polling_payload(&[EnginePacket::Close], usize::MAX);
                    return Ok(body);
                }
                if !inner.write_buffer.is_empty() {
                    let packets: Vec<EnginePacket> =
                        inner.write_buffer.iter().cloned().collect();
                    let (body, taken) =
                        encode_polling_payload(&packets, self.config.max_payload);
                    inner.write_buffer.drain(..taken);
                    return Ok(body);
                }
                match &inner.transport {
                    Transport::Polling { notify } => notify.clone(),
                    // Transport switched mid-poll (upgrade): release the GET.
                    _ => {
                        let (body, _) = encode_polling_payload(&[EnginePacket::Noop], usize::MAX);
                        return Ok(body);
                    }
                }
            };

            tokio::select! {
                _ = notify.notified() => {}
                _ = closed_rx.changed() => {}
                _ = tokio::time::sleep(deadline) => {
                    let (body, _) = encode_polling_payload(&[EnginePacket::Noop], usize::MAX);
                    return Ok(body);
                }
            }
        }
    }

    /// Heartbeat signal from the peer.
    pub fn pong_received(&self) {
        let _ = self.heartbeat_tx.try_send(());
    }

    /// Spawn the server-initiated heartbeat: PING every `ping_interval`,
    /// close with "ping timeout" when no PONG lands within `ping_timeout`.
    pub fn spawn_heartbeat(self: &Arc<Self>) {
        let Some(mut rx) = self.heartbeat_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
        else {
            return;
        };
        let session = self.clone();
        let mut closed_rx = self.closed_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(session.config.ping_interval) => {}
                    _ = closed_rx.changed() => break,
                }
                if session.send(EnginePacket::Ping(String::new())).await.is_err() {
                    break;
                }
                match timeout(session.config.ping_timeout, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => break,
                    Err(_) => {
                        tracing::debug!("[sid={}] ping timeout", session.id);
                        session.close(DisconnectReason::PingTimeout).await;
                        break;
                    }
                }
            }
        });
    }

    /// A probe PING arrived on a fresh websocket while this session is on
    /// long-poll.
    pub async fn begin_upgrade(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.transport.kind() != TransportKind::Polling {
            return Err(Error::Upgrade("session is not on a polling transport".into()));
        }
        if inner.upgrading {
            return Err(Error::Upgrade("upgrade already in progress".into()));
        }
        inner.upgrading = true;
        Ok(())
    }

    /// UPGRADE received: swap to the new transport, release the hanging
    /// poll with a NOOP, and drain the buffer onto the new transport in
    /// order. Nothing buffered during the probe window is lost.
    pub async fn complete_upgrade(
        self: &Arc<Self>,
        tx: mpsc::UnboundedSender<WsFrame>,
    ) -> Result<(), Error> {
        let flush_result = {
            let mut inner = self.inner.lock().await;
            if !inner.upgrading {
                return Err(Error::Upgrade("no upgrade in progress".into()));
            }
            if let Transport::Polling { notify } = &inner.transport {
                notify.notify_one();
            }
            inner.transport = Transport::websocket(tx);
            inner.upgrading = false;
            Self::flush_inner(&mut inner)
        };
        tracing::debug!("[sid={}] upgraded to websocket", self.id);
        if flush_result.is_err() {
            self.close(DisconnectReason::TransportError).await;
        }
        flush_result
    }

    pub async fn cancel_upgrade(&self) {
        self.inner.lock().await.upgrading = false;
    }

    /// Close the session. Idempotent; the first call wins and runs the
    /// close callback exactly once.
    pub async fn close(self: &Arc<Self>, reason: DisconnectReason) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.write_buffer.clear();
            match &inner.transport {
                Transport::Polling { notify } => notify.notify_one(),
                Transport::Websocket { tx } => {
                    let _ = tx.send(WsFrame::Text(EnginePacket::Close.encode()));
                }
            }
        }
        let _ = self.closed_tx.send(true);
        tracing::debug!("[sid={}] session closed: {}", self.id, reason);
        (self.on_close)(self.clone(), reason);
    }

    /// Graceful variant used at server shutdown: stop accepting writes,
    /// give the peer up to the grace period to drain, then close.
    pub async fn close_graceful(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Open && inner.state != SessionState::Opening {
                return;
            }
            inner.state = SessionState::Closing;
        }
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            {
                let inner = self.inner.lock().await;
                if inner.write_buffer.is_empty() {
                    break;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        self.close(DisconnectReason::ServerShutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn test_session(transport: Transport) -> (Arc<EngineSession>, Arc<StdMutex<Option<DisconnectReason>>>) {
        let reason: Arc<StdMutex<Option<DisconnectReason>>> = Arc::new(StdMutex::new(None));
        let captured = reason.clone();
        let session = EngineSession::new(
            "sid-test".to_string(),
            Arc::new(ServerConfig::default()),
            transport,
            Box::new(move |_, r| {
                *captured.lock().unwrap() = Some(r);
            }),
        );
        (session, reason)
    }

    #[tokio::test]
    async fn websocket_flush_preserves_emit_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (session, _) = test_session(Transport::websocket(tx));
        session.mark_open().await;

        session
            .send_many(vec![
                EnginePacket::Message("4a".into()),
                EnginePacket::Message("4b".into()),
            ])
            .await
            .unwrap();
        session.send(EnginePacket::Message("4c".into())).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), WsFrame::Text("44a".into()));
        assert_eq!(rx.recv().await.unwrap(), WsFrame::Text("44b".into()));
        assert_eq!(rx.recv().await.unwrap(), WsFrame::Text("44c".into()));
    }

    #[tokio::test]
    async fn poll_drains_buffer_in_order() {
        let (session, _) = test_session(Transport::polling());
        session.mark_open().await;
        session
            .send_many(vec![
                EnginePacket::Message("2[\"a\"]".into()),
                EnginePacket::Noop,
            ])
            .await
            .unwrap();

        let body = session.poll_payload().await.unwrap();
        assert_eq!(body, "7:42[\"a\"]1:6");
    }

    #[tokio::test]
    async fn poll_wakes_on_late_send() {
        let (session, _) = test_session(Transport::polling());
        session.mark_open().await;

        let poller = {
            let session = session.clone();
            tokio::spawn(async move { session.poll_payload().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        session.send(EnginePacket::Message("4x".into())).await.unwrap();

        let body = poller.await.unwrap().unwrap();
        assert_eq!(body, "3:44x");
    }

    #[tokio::test]
    async fn concurrent_polls_close_the_session() {
        let (session, reason) = test_session(Transport::polling());
        session.mark_open().await;

        let hanging = {
            let session = session.clone();
            tokio::spawn(async move { session.poll_payload().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let second = session.poll_payload().await;
        assert!(matches!(second, Err(Error::MultiplePollingRequests)));
        assert_eq!(
            *reason.lock().unwrap(),
            Some(DisconnectReason::MultiplePollingRequests)
        );
        // The hanging poll is released by the close.
        let released = hanging.await.unwrap().unwrap();
        assert_eq!(released, "1:1");
    }

    #[tokio::test]
    async fn upgrade_drains_buffer_to_new_transport() {
        let (session, _) = test_session(Transport::polling());
        session.mark_open().await;
        session
            .send_many(vec![
                EnginePacket::Message("4one".into()),
                EnginePacket::Message("4two".into()),
            ])
            .await
            .unwrap();

        session.begin_upgrade().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.complete_upgrade(tx).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), WsFrame::Text("44one".into()));
        assert_eq!(rx.recv().await.unwrap(), WsFrame::Text("44two".into()));
        assert_eq!(session.transport_kind().await, TransportKind::Websocket);
    }

    #[tokio::test]
    async fn upgrade_requires_probe_first() {
        let (session, _) = test_session(Transport::polling());
        session.mark_open().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(session.complete_upgrade(tx).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_closes_with_ping_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (session, reason) = test_session(Transport::websocket(tx));
        session.mark_open().await;
        session.spawn_heartbeat();

        // One interval for the PING, one timeout for the missing PONG.
        tokio::time::sleep(ServerConfig::default().ping_interval).await;
        tokio::time::sleep(ServerConfig::default().ping_timeout).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(rx.recv().await.unwrap(), WsFrame::Text("2".into()));
        assert_eq!(*reason.lock().unwrap(), Some(DisconnectReason::PingTimeout));
        assert!(session.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_keeps_the_session_alive() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (session, reason) = test_session(Transport::websocket(tx));
        session.mark_open().await;
        session.spawn_heartbeat();

        for _ in 0..3 {
            tokio::time::sleep(ServerConfig::default().ping_interval).await;
            session.pong_received();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(reason.lock().unwrap().is_none());
        assert!(!session.is_closed().await);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_sends() {
        let (session, reason) = test_session(Transport::polling());
        session.mark_open().await;
        session.close(DisconnectReason::TransportClose).await;
        session.close(DisconnectReason::PingTimeout).await;
        assert_eq!(*reason.lock().unwrap(), Some(DisconnectReason::TransportClose));
        assert!(matches!(
            session.send(EnginePacket::Noop).await,
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn volatile_drops_when_poll_buffer_nonempty() {
        let (session, _) = test_session(Transport::polling());
        session.mark_open().await;
        assert!(session.send_volatile(vec![EnginePacket::Message("4a".into())]).await);
        // Buffer now non-empty: a polling peer is considered slow.
        assert!(!session.send_volatile(vec![EnginePacket::Message("4b".into())]).await);
    }
}
