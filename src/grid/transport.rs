//! In-process node-to-node transport
//!
//! Each node owns a bounded mailbox. Requests are encoded into frames,
//! pushed into the target's mailbox and answered through a oneshot reply
//! channel. The node's dispatcher hands every envelope to the tokio worker
//! pool, so a node serves client and peer requests concurrently.
//!
//! Links can be cut (`disconnect`) to simulate a node that is a grid member
//! but temporarily unreachable; a stopped node's mailbox is unregistered.

use crate::common::{Error, Result};
use crate::grid::protocol::{decode_frame, encode_frame, PeerRequest, PeerResponse};
use crate::grid::NodeId;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A framed request waiting in a mailbox
#[derive(Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub frame: Bytes,
    pub reply: oneshot::Sender<Bytes>,
}

#[derive(Debug)]
pub struct Transport {
    mailboxes: RwLock<HashMap<NodeId, mpsc::Sender<Envelope>>>,
    disconnected: RwLock<HashSet<NodeId>>,
    request_timeout: Duration,
}

impl Transport {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            disconnected: RwLock::new(HashSet::new()),
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn register(&self, node: NodeId, mailbox: mpsc::Sender<Envelope>) {
        self.mailboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node, mailbox);
    }

    pub fn unregister(&self, node: NodeId) {
        self.mailboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node);
    }

    /// Drop every message to or from `node` until `reconnect`
    pub fn disconnect(&self, node: NodeId) {
        tracing::info!(node, "Disconnecting node");
        self.disconnected
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node);
    }

    pub fn reconnect(&self, node: NodeId) {
        tracing::info!(node, "Reconnecting node");
        self.disconnected
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node);
    }

    pub fn is_reachable(&self, from: NodeId, to: NodeId) -> bool {
        let cut = self.disconnected.read().unwrap_or_else(|e| e.into_inner());
        !cut.contains(&from) && !cut.contains(&to)
    }

    /// Send a request with the default timeout
    pub async fn request(
        &self,
        from: NodeId,
        to: NodeId,
        req: &PeerRequest,
    ) -> Result<PeerResponse> {
        self.request_with_timeout(from, to, req, self.request_timeout)
            .await
    }

    /// Send a request and wait at most `timeout` for the reply.
    ///
    /// Error responses from the peer come back as `Err`.
    pub async fn request_with_timeout(
        &self,
        from: NodeId,
        to: NodeId,
        req: &PeerRequest,
        timeout: Duration,
    ) -> Result<PeerResponse> {
        if !self.is_reachable(from, to) {
            return Err(Error::ConnectionFailed(format!(
                "node {} unreachable from node {}",
                to, from
            )));
        }

        let mailbox = self
            .mailboxes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&to)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed(format!("node {} is not running", to)))?;

        let frame = encode_frame(req)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            from,
            frame,
            reply: reply_tx,
        };

        tracing::trace!(from, to, kind = req.kind(), "Sending peer request");

        tokio::time::timeout(timeout, mailbox.send(envelope))
            .await
            .map_err(|_| Error::Timeout(format!("mailbox of node {} is full", to)))?
            .map_err(|_| Error::ConnectionFailed(format!("node {} stopped", to)))?;

        let reply = tokio::time::timeout(timeout, reply_rx)
            .await
            .map_err(|_| Error::Timeout(format!("{} to node {}", req.kind(), to)))?
            .map_err(|_| Error::ConnectionFailed(format!("node {} dropped the request", to)))?;

        // The link may have been cut while the request was in flight
        if !self.is_reachable(from, to) {
            return Err(Error::ConnectionFailed(format!(
                "node {} unreachable from node {}",
                to, from
            )));
        }

        let response: PeerResponse = decode_frame(&reply)?;
        response.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_node(transport: &Transport, id: NodeId) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<Envelope>(8);
        transport.register(id, tx);
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let req: PeerRequest = decode_frame(&env.frame).unwrap();
                let resp = match req {
                    PeerRequest::LocalSize { .. } => PeerResponse::Size(env.from as usize),
                    _ => PeerResponse::Error(Error::Internal("unsupported".into())),
                };
                let _ = env.reply.send(encode_frame(&resp).unwrap());
            }
        })
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let transport = Transport::new(Duration::from_secs(1));
        let _h = echo_node(&transport, 1);

        let resp = transport
            .request(7, 1, &PeerRequest::LocalSize { cache: "c".into() })
            .await
            .unwrap();
        assert!(matches!(resp, PeerResponse::Size(7)));

        let err = transport
            .request(
                7,
                1,
                &PeerRequest::Rollback {
                    cache: "c".into(),
                    tx: uuid::Uuid::nil(),
                },
            )
            .await;
        assert!(matches!(err, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_disconnect_and_unregister() {
        let transport = Transport::new(Duration::from_secs(1));
        let _h = echo_node(&transport, 1);
        let req = PeerRequest::LocalSize { cache: "c".into() };

        transport.disconnect(1);
        assert!(matches!(
            transport.request(0, 1, &req).await,
            Err(Error::ConnectionFailed(_))
        ));
        transport.reconnect(1);
        assert!(transport.request(0, 1, &req).await.is_ok());

        transport.unregister(1);
        assert!(matches!(
            transport.request(0, 1, &req).await,
            Err(Error::ConnectionFailed(_))
        ));
    }
}
