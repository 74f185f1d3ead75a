//! libp2p transport: gossipsub for broadcast, request-response for sync and
//! point-to-point delivery.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{
    core::upgrade,
    futures::StreamExt,
    gossipsub::{self, IdentTopic, MessageAuthenticity, ValidationMode},
    identify, kad, noise,
    multiaddr::Protocol,
    request_response::{
        self, Config as RequestResponseConfig, Event as RequestResponseEvent, Message, OutboundRequestId,
        ProtocolSupport, ResponseChannel,
    },
    swarm::{Config as SwarmConfig, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Transport as _,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use tessera_common::error::Result;
use tessera_common::utils::Address;

use crate::behaviour::{TesseraBehaviour, IDENTIFY_PROTOCOL, SEAL_TOPIC, SYNC_PROTOCOL};
use crate::config::{P2pConfig, PeerEntry};
use crate::error::{NetworkError, P2pError};
use crate::events::ComposedEvent;
use crate::key_manager;
use crate::ports::{Inbound, Transport, REQUEST_TIMEOUT};
use crate::protocol::{SyncRequest, SyncResponse};

const CHANNEL_CAPACITY: usize = 1024;

/// Node address ↔ peer id, built from the configured `nodes[].url`.
#[derive(Debug, Clone, Default)]
pub struct PeerBook {
    by_address: HashMap<Address, (PeerId, Multiaddr)>,
    by_peer: HashMap<PeerId, Address>,
}

impl PeerBook {
    pub fn from_entries(entries: &[PeerEntry]) -> std::result::Result<Self, P2pError> {
        let mut book = PeerBook::default();
        for e in entries {
            let addr: Multiaddr = e.url.parse()?;
            let peer = addr
                .iter()
                .find_map(|p| match p {
                    Protocol::P2p(id) => Some(id),
                    _ => None,
                })
                .ok_or_else(|| P2pError::MissingPeerId(e.url.clone()))?;
            book.by_peer.insert(peer, e.address.clone());
            book.by_address.insert(e.address.clone(), (peer, addr));
        }
        Ok(book)
    }

    pub fn peer_id(&self, address: &Address) -> Option<PeerId> {
        self.by_address.get(address).map(|(p, _)| *p)
    }

    pub fn address(&self, peer: &PeerId) -> Option<&Address> {
        self.by_peer.get(peer)
    }

    fn dial_targets(&self, local: &PeerId) -> Vec<(PeerId, Multiaddr)> {
        self.by_address.values().filter(|(p, _)| p != local).cloned().collect()
    }

    fn addresses(&self, local: &PeerId) -> Vec<Address> {
        let mut v: Vec<Address> = self
            .by_address
            .iter()
            .filter(|(_, (p, _))| p != local)
            .map(|(a, _)| a.clone())
            .collect();
        v.sort();
        v
    }
}

pub enum AdapterCmd {
    Publish {
        data: Vec<u8>,
    },
    Request {
        peer: PeerId,
        req: SyncRequest,
        reply: oneshot::Sender<Result<SyncResponse>>,
    },
    Respond {
        req_id: u64,
        res: SyncResponse,
    },
    Shutdown,
}

pub struct Libp2pAdapter {
    pub peer_id: PeerId,
    swarm: Swarm<TesseraBehaviour>,
    book: Arc<PeerBook>,
    cmd_tx: mpsc::Sender<AdapterCmd>,
    cmd_rx: mpsc::Receiver<AdapterCmd>,
    inbound_tx: mpsc::Sender<Inbound>,
    pending_requests: HashMap<OutboundRequestId, oneshot::Sender<Result<SyncResponse>>>,
    pending_responses: HashMap<u64, ResponseChannel<SyncResponse>>,
    next_req_id: u64,
}

/// Cloneable [`Transport`] front for a running [`Libp2pAdapter`].
#[derive(Clone)]
pub struct AdapterHandle {
    pub cmd_tx: mpsc::Sender<AdapterCmd>,
    book: Arc<PeerBook>,
    local: PeerId,
}

impl fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterHandle").field("local", &self.local).finish()
    }
}

impl Libp2pAdapter {
    /// Builds the swarm, starts listening and dials the known peers.
    pub fn new(cfg: &P2pConfig) -> std::result::Result<(Self, AdapterHandle, mpsc::Receiver<Inbound>), P2pError> {
        let key = key_manager::load_or_generate_keypair(Path::new(&cfg.keypair_path))?;
        let peer_id = PeerId::from(key.public());
        let book = Arc::new(PeerBook::from_entries(&cfg.peers)?);

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(upgrade::Version::V1Lazy)
            .authenticate(noise::Config::new(&key)?)
            .multiplex(yamux::Config::default())
            .boxed();

        let gcfg = gossipsub::ConfigBuilder::default()
            .validation_mode(ValidationMode::Strict)
            .heartbeat_interval(Duration::from_millis(500))
            .build()
            .map_err(|_| P2pError::GossipsubInit("invalid gossipsub config"))?;
        let gossipsub = gossipsub::Behaviour::new(MessageAuthenticity::Signed(key.clone()), gcfg)
            .map_err(P2pError::GossipsubInit)?;

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.into(), key.public()).with_agent_version("tessera".into()),
        );

        let mut kad_cfg = kad::Config::default();
        kad_cfg.set_query_timeout(Duration::from_secs(5));
        let kad = kad::Behaviour::with_config(peer_id, kad::store::MemoryStore::new(peer_id), kad_cfg);

        let rr = {
            let mut rcfg = RequestResponseConfig::default();
            #[allow(deprecated)]
            rcfg.set_request_timeout(REQUEST_TIMEOUT);
            let protocols = std::iter::once((StreamProtocol::new(SYNC_PROTOCOL), ProtocolSupport::Full));
            request_response::Behaviour::new(protocols, rcfg)
        };

        let mut behaviour = TesseraBehaviour {
            identify,
            ping: libp2p::ping::Behaviour::default(),
            kad,
            gossipsub,
            rr,
        };
        behaviour.subscribe_seal_topic()?;

        let mut swarm = Swarm::new(
            transport,
            behaviour,
            peer_id,
            SwarmConfig::with_tokio_executor().with_idle_connection_timeout(Duration::from_secs(60)),
        );

        for ma in &cfg.listen_multiaddrs {
            swarm.listen_on(ma.parse::<Multiaddr>()?)?;
        }
        for b in &cfg.bootstrap {
            if let Ok(addr) = b.parse::<Multiaddr>() {
                swarm.dial(addr)?;
            }
        }
        for (peer, addr) in book.dial_targets(&peer_id) {
            swarm.behaviour_mut().kad.add_address(&peer, addr.clone());
            if let Err(e) = swarm.dial(addr) {
                debug!(target: "p2p", %peer, error = %e, "initial dial failed");
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = AdapterHandle { cmd_tx: cmd_tx.clone(), book: book.clone(), local: peer_id };

        info!(target: "p2p", %peer_id, "libp2p adapter ready");
        Ok((
            Self {
                peer_id,
                swarm,
                book,
                cmd_tx,
                cmd_rx,
                inbound_tx,
                pending_requests: HashMap::new(),
                pending_responses: HashMap::new(),
                next_req_id: 0,
            },
            handle,
            inbound_rx,
        ))
    }

    /// Main loop: swarm events, reconnects and commands from the handles.
    pub async fn run(mut self) {
        let mut maintain = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                ev = self.swarm.select_next_some() => self.on_swarm_event(ev).await,

                _ = maintain.tick() => {
                    for (peer, addr) in self.book.dial_targets(&self.peer_id) {
                        if !self.swarm.is_connected(&peer) {
                            if let Err(e) = self.swarm.dial(addr) {
                                debug!(target: "p2p", %peer, error = %e, "redial failed");
                            }
                        }
                    }
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(AdapterCmd::Publish { data }) => {
                        let topic = IdentTopic::new(SEAL_TOPIC);
                        if let Err(e) = self.swarm.behaviour_mut().gossipsub.publish(topic, data) {
                            warn!(target: "p2p", error = %e, "gossipsub publish failed");
                        }
                    }
                    Some(AdapterCmd::Request { peer, req, reply }) => {
                        let id = self.swarm.behaviour_mut().rr.send_request(&peer, req);
                        self.pending_requests.insert(id, reply);
                    }
                    Some(AdapterCmd::Respond { req_id, res }) => {
                        match self.pending_responses.remove(&req_id) {
                            Some(channel) => {
                                if self.swarm.behaviour_mut().rr.send_response(channel, res).is_err() {
                                    debug!(target: "p2p", req_id, "response channel closed");
                                }
                            }
                            None => warn!(target: "p2p", req_id, "respond: unknown request"),
                        }
                    }
                    Some(AdapterCmd::Shutdown) | None => break,
                },
            }
        }
        info!(target: "p2p", "libp2p adapter stopped");
    }

    async fn on_swarm_event(&mut self, ev: SwarmEvent<ComposedEvent>) {
        match ev {
            SwarmEvent::Behaviour(ComposedEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }

            SwarmEvent::Behaviour(ComposedEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let source = message.source.unwrap_or(propagation_source);
                let from = self.book.address(&source).cloned();
                debug!(target: "p2p", size = message.data.len(), from = ?from, "seal received");
                self.deliver(Inbound::Seal { from, bytes: message.data }).await;
            }

            SwarmEvent::Behaviour(ComposedEvent::ReqRes(ev)) => self.on_request_response(ev).await,

            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!(target: "p2p", %peer_id, node = ?self.book.address(&peer_id), "connected");
                self.swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!(target: "p2p", %peer_id, "disconnected");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!(target: "p2p", ?peer_id, %error, "outgoing connection error");
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(target: "p2p", %address, "listening");
            }
            _ => {}
        }
    }

    async fn on_request_response(&mut self, ev: RequestResponseEvent<SyncRequest, SyncResponse>) {
        match ev {
            RequestResponseEvent::Message { peer, message } => match message {
                Message::Request { request, channel, .. } => {
                    let from = self.book.address(&peer).cloned();
                    let request = match request {
                        SyncRequest::Deliver(bytes) => {
                            let _ = self.swarm.behaviour_mut().rr.send_response(channel, SyncResponse::Ack);
                            self.deliver(Inbound::Seal { from, bytes }).await;
                            return;
                        }
                        other => other,
                    };

                    let req_id = self.next_req_id;
                    self.next_req_id += 1;
                    self.pending_responses.insert(req_id, channel);

                    let (reply, rx) = oneshot::channel();
                    self.deliver(Inbound::Request { from, request, reply }).await;

                    let cmd_tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        let res = rx.await.unwrap_or_else(|_| SyncResponse::Error("request dropped".into()));
                        let _ = cmd_tx.send(AdapterCmd::Respond { req_id, res }).await;
                    });
                }
                Message::Response { request_id, response } => {
                    if let Some(reply) = self.pending_requests.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            RequestResponseEvent::OutboundFailure { peer, request_id, error } => {
                if let Some(reply) = self.pending_requests.remove(&request_id) {
                    let err = match error {
                        request_response::OutboundFailure::Timeout => NetworkError::Timeout(peer.to_string()),
                        other => NetworkError::RequestFailed(peer.to_string(), other.to_string()),
                    };
                    let _ = reply.send(Err(err.into()));
                }
            }
            RequestResponseEvent::InboundFailure { peer, error, .. } => {
                debug!(target: "p2p", %peer, %error, "inbound request failed");
            }
            RequestResponseEvent::ResponseSent { .. } => {}
        }
    }

    async fn deliver(&mut self, msg: Inbound) {
        if self.inbound_tx.send(msg).await.is_err() {
            warn!(target: "p2p", "inbound channel closed");
        }
    }
}

impl AdapterHandle {
    fn peer(&self, node: &Address) -> std::result::Result<PeerId, NetworkError> {
        self.book.peer_id(node).ok_or_else(|| NetworkError::PeerNotFound(node.to_string()))
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(AdapterCmd::Shutdown).await;
    }
}

#[async_trait]
impl Transport for AdapterHandle {
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(AdapterCmd::Publish { data: bytes })
            .await
            .map_err(|_| NetworkError::Closed)?;
        Ok(())
    }

    async fn send(&self, node: &Address, bytes: Vec<u8>) -> Result<()> {
        match self.request(node, SyncRequest::Deliver(bytes)).await? {
            SyncResponse::Ack => Ok(()),
            other => Err(NetworkError::RequestFailed(node.to_string(), format!("unexpected {other:?}")).into()),
        }
    }

    async fn request(&self, node: &Address, request: SyncRequest) -> Result<SyncResponse> {
        let peer = self.peer(node)?;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(AdapterCmd::Request { peer, req: request, reply })
            .await
            .map_err(|_| NetworkError::Closed)?;

        // the behaviour times out on its own; the outer bound covers a stuck loop
        match tokio::time::timeout(REQUEST_TIMEOUT * 2, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(NetworkError::Closed.into()),
            Err(_) => Err(NetworkError::Timeout(node.to_string()).into()),
        }
    }

    fn peers(&self) -> Vec<Address> {
        self.book.addresses(&self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity;

    fn entry(name: &str, peer: &PeerId) -> PeerEntry {
        PeerEntry { address: Address::new(name).unwrap(), url: format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}") }
    }

    #[test]
    fn test_peer_book_maps_both_ways() {
        let p0 = identity::Keypair::generate_ed25519().public().to_peer_id();
        let p1 = identity::Keypair::generate_ed25519().public().to_peer_id();
        let book = PeerBook::from_entries(&[entry("n0", &p0), entry("n1", &p1)]).unwrap();

        let n1 = Address::new("n1").unwrap();
        assert_eq!(book.peer_id(&n1), Some(p1));
        assert_eq!(book.address(&p0), Some(&Address::new("n0").unwrap()));
        assert_eq!(book.addresses(&p0), vec![n1]);
    }

    #[test]
    fn test_peer_book_requires_peer_id() {
        let e = PeerEntry { address: Address::new("n0").unwrap(), url: "/ip4/127.0.0.1/tcp/4001".into() };
        assert!(matches!(PeerBook::from_entries(&[e]), Err(P2pError::MissingPeerId(_))));
    }

    #[tokio::test]
    async fn test_adapter_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = P2pConfig {
            listen_multiaddrs: vec!["/ip4/127.0.0.1/tcp/0".into()],
            bootstrap: vec![],
            keypair_path: dir.path().join("p2p.key").to_string_lossy().into_owned(),
            peers: vec![],
        };
        let (adapter, handle, _inbound) = Libp2pAdapter::new(&cfg).unwrap();
        let task = tokio::spawn(adapter.run());
        assert!(handle.peers().is_empty());
        handle.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
