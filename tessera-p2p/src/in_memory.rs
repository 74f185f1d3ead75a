//! In-process network connecting several nodes through channels.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use tessera_common::error::Result;
use tessera_common::utils::Address;

use crate::error::NetworkError;
use crate::ports::{Inbound, Transport, REQUEST_TIMEOUT};
use crate::protocol::{SyncRequest, SyncResponse};

/// Decides whether an outbound message from a node reaches `to`.
/// Returning `false` drops it silently.
pub type OutboundFilter = Arc<dyn Fn(&Address, &[u8]) -> bool + Send + Sync>;

const INBOUND_CAPACITY: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared switchboard. Each joined node gets an [`InMemoryTransport`].
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    peers: Arc<Mutex<HashMap<Address, mpsc::Sender<Inbound>>>>,
    filters: Arc<Mutex<HashMap<Address, OutboundFilter>>>,
}

impl fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut peers: Vec<Address> = lock(&self.peers).keys().cloned().collect();
        peers.sort();
        f.debug_struct("InMemoryNetwork").field("peers", &peers).finish()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address`; a node joining twice replaces its old inbox.
    pub fn join(&self, address: Address) -> (InMemoryTransport, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        lock(&self.peers).insert(address.clone(), tx);
        (InMemoryTransport { local: address, network: self.clone() }, rx)
    }

    pub fn leave(&self, address: &Address) {
        lock(&self.peers).remove(address);
        lock(&self.filters).remove(address);
    }

    /// Filters everything `from` sends from now on.
    pub fn set_filter(&self, from: &Address, filter: OutboundFilter) {
        lock(&self.filters).insert(from.clone(), filter);
    }

    pub fn clear_filter(&self, from: &Address) {
        lock(&self.filters).remove(from);
    }

    fn sender(&self, to: &Address) -> Option<mpsc::Sender<Inbound>> {
        lock(&self.peers).get(to).cloned()
    }

    fn allowed(&self, from: &Address, to: &Address, bytes: &[u8]) -> bool {
        let filter = lock(&self.filters).get(from).cloned();
        filter.map_or(true, |f| f(to, bytes))
    }
}

#[derive(Clone)]
pub struct InMemoryTransport {
    local: Address,
    network: InMemoryNetwork,
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransport").field("local", &self.local).finish()
    }
}

impl InMemoryTransport {
    pub fn local(&self) -> &Address {
        &self.local
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<()> {
        let targets: Vec<(Address, mpsc::Sender<Inbound>)> = lock(&self.network.peers)
            .iter()
            .filter(|(a, _)| **a != self.local)
            .map(|(a, s)| (a.clone(), s.clone()))
            .collect();

        for (to, sender) in targets {
            if !self.network.allowed(&self.local, &to, &bytes) {
                debug!(target: "p2p", from = %self.local, to = %to, "broadcast dropped by filter");
                continue;
            }
            let msg = Inbound::Seal { from: Some(self.local.clone()), bytes: bytes.clone() };
            if sender.send(msg).await.is_err() {
                debug!(target: "p2p", to = %to, "peer inbox closed");
            }
        }
        Ok(())
    }

    async fn send(&self, node: &Address, bytes: Vec<u8>) -> Result<()> {
        let sender = self
            .network
            .sender(node)
            .ok_or_else(|| NetworkError::PeerNotFound(node.to_string()))?;
        if !self.network.allowed(&self.local, node, &bytes) {
            return Ok(());
        }
        sender
            .send(Inbound::Seal { from: Some(self.local.clone()), bytes })
            .await
            .map_err(|_| NetworkError::SendError(node.to_string()))?;
        Ok(())
    }

    async fn request(&self, node: &Address, request: SyncRequest) -> Result<SyncResponse> {
        let sender = self
            .network
            .sender(node)
            .ok_or_else(|| NetworkError::PeerNotFound(node.to_string()))?;

        let (reply, rx) = oneshot::channel();
        sender
            .send(Inbound::Request { from: Some(self.local.clone()), request, reply })
            .await
            .map_err(|_| NetworkError::SendError(node.to_string()))?;

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(res)) => Ok(res),
            Ok(Err(_)) => Err(NetworkError::RequestFailed(node.to_string(), "reply dropped".into()).into()),
            Err(_) => Err(NetworkError::Timeout(node.to_string()).into()),
        }
    }

    fn peers(&self) -> Vec<Address> {
        let mut peers: Vec<Address> =
            lock(&self.network.peers).keys().filter(|a| **a != self.local).cloned().collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_skips_self() {
        let net = InMemoryNetwork::new();
        let (t0, mut rx0) = net.join(addr("n0"));
        let (_t1, mut rx1) = net.join(addr("n1"));

        t0.broadcast(b"hello".to_vec()).await.unwrap();

        match rx1.recv().await {
            Some(Inbound::Seal { from, bytes }) => {
                assert_eq!(from, Some(addr("n0")));
                assert_eq!(bytes, b"hello".to_vec());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx0.try_recv().is_err());
        assert_eq!(t0.peers(), vec![addr("n1")]);
    }

    #[tokio::test]
    async fn test_filter_drops_outbound() {
        let net = InMemoryNetwork::new();
        let (t0, _rx0) = net.join(addr("n0"));
        let (_t1, mut rx1) = net.join(addr("n1"));

        net.set_filter(&addr("n0"), Arc::new(|_, bytes| bytes != b"drop"));
        t0.broadcast(b"drop".to_vec()).await.unwrap();
        t0.broadcast(b"keep".to_vec()).await.unwrap();

        match rx1.recv().await {
            Some(Inbound::Seal { bytes, .. }) => assert_eq!(bytes, b"keep".to_vec()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_reply() {
        let net = InMemoryNetwork::new();
        let (t0, _rx0) = net.join(addr("n0"));
        let (_t1, mut rx1) = net.join(addr("n1"));

        tokio::spawn(async move {
            if let Some(Inbound::Request { request, reply, .. }) = rx1.recv().await {
                assert_eq!(request, SyncRequest::NodeInfo);
                let _ = reply.send(SyncResponse::Error("busy".into()));
            }
        });

        let res = t0.request(&addr("n1"), SyncRequest::NodeInfo).await.unwrap();
        assert_eq!(res, SyncResponse::Error("busy".into()));
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let net = InMemoryNetwork::new();
        let (t0, _rx0) = net.join(addr("n0"));
        let err = t0.send(&addr("nx"), vec![1]).await.unwrap_err();
        assert!(matches!(err, tessera_common::TesseraError::Network(_)));
    }
}
