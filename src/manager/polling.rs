//! HTTP long-poll connector for the client-side manager.
//!
//! One GET holds until the server has frames (or releases with a NOOP);
//! POSTs carry batched upstream frames. The connector turns that request
//! cycle into the frame pipe the [`Manager`](super::Manager) consumes.

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;

use super::{Connector, EngineConn};
use crate::engine::packet::{
    decode_polling_payload, encode_polling_payload, EnginePacket, OpenPacket,
};
use crate::error::{DecodeError, Error};

pub struct PollingConnector {
    base_url: String,
    client: reqwest::Client,
}

impl PollingConnector {
    /// `base_url` is the handshake endpoint, e.g.
    /// `http://localhost:8080/socket.io/`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, sid: Option<&str>) -> String {
        let buster: u64 = rand::rng().random();
        match sid {
            Some(sid) => format!(
                "{}/?EIO=4&transport=polling&t={:x}&sid={}",
                self.base_url, buster, sid
            ),
            None => format!("{}/?EIO=4&transport=polling&t={:x}", self.base_url, buster),
        }
    }

    async fn get(&self, sid: Option<&str>) -> Result<String, Error> {
        let response = self
            .client
            .get(self.url(sid))
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "poll failed with status {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn post(&self, sid: &str, body: String) -> Result<(), Error> {
        let response = self
            .client
            .post(self.url(Some(sid)))
            .header("content-type", "text/plain; charset=UTF-8")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "post failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for PollingConnector {
    async fn open(&self) -> Result<EngineConn, Error> {
        let body = self.get(None).await?;
        let mut packets = decode_polling_payload(&body)?.into_iter();
        let handshake: OpenPacket = match packets.next() {
            Some(EnginePacket::Open(json)) => {
                serde_json::from_str(&json).map_err(|_| DecodeError::InvalidJson)?
            }
            _ => return Err(Error::Transport("handshake did not begin with OPEN".into())),
        };
        let sid = handshake.sid.clone();
        let max_payload = handshake.max_payload;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<EnginePacket>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<EnginePacket>();

        // Frames the server piggybacked on the handshake response.
        for packet in packets {
            let _ = in_tx.send(packet);
        }

        // Upstream: batch whatever is ready into one POST.
        let upstream = {
            let connector = Self {
                base_url: self.base_url.clone(),
                client: self.client.clone(),
            };
            let sid = sid.clone();
            async move {
                while let Some(first) = out_rx.recv().await {
                    let mut batch = vec![first];
                    while let Ok(more) = out_rx.try_recv() {
                        batch.push(more);
                    }
                    let closing = batch.iter().any(|p| matches!(p, EnginePacket::Close));
                    while !batch.is_empty() {
                        let (body, taken) = encode_polling_payload(&batch, max_payload);
                        if connector.post(&sid, body).await.is_err() {
                            return;
                        }
                        batch.drain(..taken);
                    }
                    if closing {
                        return;
                    }
                }
            }
        };
        tokio::spawn(upstream);

        // Downstream: poll until the server closes or the manager drops
        // the receiving side.
        let downstream = {
            let connector = Self {
                base_url: self.base_url.clone(),
                client: self.client.clone(),
            };
            let sid = sid.clone();
            async move {
                loop {
                    let body = match connector.get(Some(&sid)).await {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::debug!("[sid={}] poll error: {}", sid, e);
                            return;
                        }
                    };
                    let packets = match decode_polling_payload(&body) {
                        Ok(packets) => packets,
                        Err(e) => {
                            tracing::debug!("[sid={}] bad poll payload: {}", sid, e);
                            return;
                        }
                    };
                    for packet in packets {
                        let closing = matches!(packet, EnginePacket::Close);
                        if in_tx.send(packet).is_err() {
                            return;
                        }
                        if closing {
                            return;
                        }
                    }
                }
            }
        };
        tokio::spawn(downstream);

        Ok(EngineConn {
            handshake,
            tx: out_tx,
            rx: in_rx,
        })
    }
}
