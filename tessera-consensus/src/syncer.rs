//! Fetches, verifies and stores the blocks a node is missing.
//!
//! Heights are pulled in windows: manifests first, checked for continuity,
//! then the blocks in parallel chunks. Every block must be voted by the
//! local suffrage with keys from the node pool, and is re-applied locally
//! before it is written, so a peer cannot hand over state the operations do
//! not produce.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tessera_common::encoding::Encoders;
use tessera_common::env::{Block, Height, Manifest};
use tessera_common::error::{Result, TesseraError};
use tessera_common::utils::Address;
use tessera_ledger::Storage;
use tessera_p2p::{SyncRequest, SyncResponse, Transport};

use crate::checker::SealChecker;
use crate::local::{LocalState, NodePool};
use crate::processor::ProposalProcessor;
use crate::suffrage::Suffrage;

/// Heights handled per manifest request.
pub const WINDOW: i64 = 50;
/// Heights per block request.
const CHUNK: usize = 10;
const ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct Syncer {
    state: LocalState,
    nodepool: NodePool,
    suffrage: Arc<dyn Suffrage>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    encoders: Encoders,
    processor: Arc<ProposalProcessor>,
    peers: Vec<Address>,
    /// Lower is worse; peers that served bad data drop to the back.
    scores: Mutex<HashMap<Address, i64>>,
}

impl Syncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: LocalState,
        nodepool: NodePool,
        suffrage: Arc<dyn Suffrage>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        encoders: Encoders,
        processor: Arc<ProposalProcessor>,
        peers: Vec<Address>,
    ) -> Self {
        Self {
            state,
            nodepool,
            suffrage,
            storage,
            transport,
            encoders,
            processor,
            peers,
            scores: Mutex::new(HashMap::new()),
        }
    }

    fn scores(&self) -> std::sync::MutexGuard<'_, HashMap<Address, i64>> {
        self.scores.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ranked_peers(&self) -> Vec<Address> {
        let scores = self.scores();
        let mut peers = self.peers.clone();
        peers.sort_by_key(|p| std::cmp::Reverse(scores.get(p).copied().unwrap_or(0)));
        peers
    }

    fn demote(&self, peer: &Address, e: &TesseraError) {
        warn!(target: "syncer", peer = %peer, error = %e, "peer served bad data");
        *self.scores().entry(peer.clone()).or_insert(0) -= 1;
    }

    /// Stores blocks `from..=to`, sending each one on `saved` once written.
    /// Returns the last height stored.
    pub async fn sync(&self, from: Height, to: Height, saved: mpsc::Sender<Block>) -> Result<Height> {
        if from > to {
            return Ok(from.prev());
        }
        if self.peers.is_empty() {
            return Err(TesseraError::NotFound("no peers to sync from".into()));
        }
        info!(target: "syncer", from = %from, to = %to, "sync started");

        let mut previous = if from > Height::GENESIS {
            let m = self
                .storage
                .manifest_by_height(from.prev())?
                .ok_or_else(|| TesseraError::NotFound(format!("local manifest {}", from.prev())))?;
            Some(m)
        } else {
            None
        };

        let mut start = from;
        while start <= to {
            let end = Height((start.value() + WINDOW - 1).min(to.value()));
            let heights: Vec<Height> = (start.value()..=end.value()).map(Height).collect();

            let manifests = self.fetch_manifests(&heights, previous.as_ref()).await?;
            let blocks = self.fetch_blocks(&manifests).await?;
            for block in blocks {
                let states = self.processor.replay(&block)?;
                let block = self.processor.commit(block, states)?;
                debug!(target: "syncer", height = %block.height(), block = %block.hash(), "block stored");
                if saved.send(block).await.is_err() {
                    return Err(TesseraError::Other("sync receiver dropped".into()));
                }
            }

            previous = manifests.last().cloned();
            start = end.next();
        }
        info!(target: "syncer", to = %to, "sync finished");
        Ok(to)
    }

    async fn fetch_manifests(&self, heights: &[Height], previous: Option<&Manifest>) -> Result<Vec<Manifest>> {
        for attempt in 0..ATTEMPTS {
            for peer in self.ranked_peers() {
                let reply = self.transport.request(&peer, SyncRequest::Manifests(heights.to_vec())).await;
                let list = match reply {
                    Ok(SyncResponse::Manifests(list)) => list,
                    Ok(other) => {
                        debug!(target: "syncer", peer = %peer, reply = ?other, "unexpected manifests reply");
                        continue;
                    }
                    Err(e) => {
                        debug!(target: "syncer", peer = %peer, error = %e, "manifests request failed");
                        continue;
                    }
                };
                if list.len() < heights.len() {
                    debug!(target: "syncer", peer = %peer, got = list.len(), "peer is behind");
                    continue;
                }
                match self.verify_manifests(list, heights, previous) {
                    Ok(manifests) => return Ok(manifests),
                    Err(e) => self.demote(&peer, &e),
                }
            }
            tokio::time::sleep(RETRY_BACKOFF * (attempt + 1)).await;
        }
        Err(TesseraError::NotFound(format!(
            "no peer served manifests {}..={}",
            heights.first().copied().unwrap_or(Height::GENESIS),
            heights.last().copied().unwrap_or(Height::GENESIS)
        )))
    }

    fn verify_manifests(&self, list: Vec<Vec<u8>>, heights: &[Height], previous: Option<&Manifest>) -> Result<Vec<Manifest>> {
        let mut manifests = Vec::with_capacity(heights.len());
        let mut prev = previous.cloned();
        for (bytes, height) in list.iter().zip(heights) {
            let m = self.encoders.decode_manifest(bytes)?;
            m.is_valid()?;
            if m.height != *height {
                return Err(TesseraError::Invalid(format!("asked for manifest {height}, got {}", m.height)));
            }
            match &prev {
                Some(p) => m.is_next_of(p)?,
                None if m.height != Height::GENESIS => {
                    return Err(TesseraError::Invalid(format!("manifest {} has no parent", m.height)));
                }
                None => {}
            }
            prev = Some(m.clone());
            manifests.push(m);
        }
        Ok(manifests)
    }

    async fn fetch_blocks(&self, manifests: &[Manifest]) -> Result<Vec<Block>> {
        let chunks = manifests.chunks(CHUNK).enumerate().map(|(i, chunk)| self.fetch_chunk(i, chunk));
        let mut blocks = Vec::with_capacity(manifests.len());
        for r in join_all(chunks).await {
            blocks.extend(r?);
        }
        Ok(blocks)
    }

    /// Chunks start at different peers to spread the load.
    async fn fetch_chunk(&self, offset: usize, manifests: &[Manifest]) -> Result<Vec<Block>> {
        let heights: Vec<Height> = manifests.iter().map(|m| m.height).collect();
        for attempt in 0..ATTEMPTS {
            let mut peers = self.ranked_peers();
            if !peers.is_empty() {
                let shift = offset % peers.len();
                peers.rotate_left(shift);
            }
            for peer in peers {
                let list = match self.transport.request(&peer, SyncRequest::Blocks(heights.clone())).await {
                    Ok(SyncResponse::Blocks(list)) if list.len() == heights.len() => list,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(target: "syncer", peer = %peer, error = %e, "blocks request failed");
                        continue;
                    }
                };
                match self.verify_blocks(list, manifests) {
                    Ok(blocks) => return Ok(blocks),
                    Err(e) => self.demote(&peer, &e),
                }
            }
            tokio::time::sleep(RETRY_BACKOFF * (attempt + 1)).await;
        }
        Err(TesseraError::NotFound(format!("no peer served blocks {heights:?}")))
    }

    fn verify_blocks(&self, list: Vec<Vec<u8>>, manifests: &[Manifest]) -> Result<Vec<Block>> {
        let snapshot = self.state.snapshot();
        let checker = SealChecker {
            local: &snapshot,
            nodepool: &self.nodepool,
            suffrage: self.suffrage.as_ref(),
        };
        list.iter()
            .zip(manifests)
            .map(|(bytes, manifest)| {
                let block = self.encoders.decode_block(bytes)?;
                block.is_valid(&snapshot.policy.network_id)?;
                if block.manifest != *manifest {
                    return Err(TesseraError::Invalid(format!("block {} does not match its manifest", manifest.height)));
                }
                checker.check_block(&block)?;
                Ok(block)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    use crate::genesis::GenesisGenerator;
    use crate::local::LocalNode;
    use crate::processor::operations::OperationProcessors;
    use crate::responder::Responder;
    use crate::states::StateKind;
    use crate::suffrage::{FixedSuffrage, RoundrobinSuffrage};
    use crate::testing;
    use tessera_common::crypto::Privatekey;
    use tessera_common::encoding::EncoderKind;
    use tessera_common::env::{Ballot, BallotFact, InitFact, ProposalFact, Round};
    use tessera_ledger::MemoryStorage;
    use tessera_p2p::{InMemoryNetwork, Inbound};

    fn serve(responder: Responder, mut inbound: mpsc::Receiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                if let Inbound::Request { request, reply, .. } = msg {
                    let _ = reply.send(responder.respond(request));
                }
            }
        })
    }

    struct Fixture {
        nodes: Vec<LocalNode>,
        source: LocalNode,
        source_storage: Arc<dyn Storage>,
        genesis: Block,
        storage: Arc<dyn Storage>,
        syncer: Syncer,
        _server: JoinHandle<()>,
    }

    fn suffrage(nodes: &[LocalNode]) -> Arc<dyn Suffrage> {
        Arc::new(RoundrobinSuffrage::new(nodes.iter().map(|n| n.address.clone()).collect(), 1).unwrap())
    }

    async fn fixture() -> Fixture {
        let nodes = testing::nodes(2);
        let (source, local) = (nodes[0].clone(), nodes[1].clone());
        let encoders = Encoders::new(EncoderKind::Bincode);

        let source_storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let op = testing::kv_operation(&source, "g1", "greeting", "hello");
        let genesis = GenesisGenerator::new(source.clone(), testing::policy(), source_storage.clone())
            .with_operations(vec![op])
            .generate()
            .await
            .unwrap();

        let network = InMemoryNetwork::new();
        let (_source_transport, source_inbound) = network.join(source.address.clone());
        let (transport, _inbound) = network.join(local.address.clone());
        let (_kind_tx, kind_rx) = watch::channel(StateKind::Consensus);
        let responder = Responder::new(
            source.clone(),
            source_storage.clone(),
            encoders.clone(),
            LocalState::new(testing::policy()),
            kind_rx,
        );
        let server = serve(responder, source_inbound);

        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let state = LocalState::new(testing::policy());
        let processor = ProposalProcessor::new(
            storage.clone(),
            suffrage(&nodes),
            state.clone(),
            OperationProcessors::with_defaults(nodes.iter().map(|n| n.publickey())).unwrap(),
        );
        let syncer = Syncer::new(
            state,
            NodePool::new(nodes.iter().map(|n| (n.address.clone(), n.publickey()))).unwrap(),
            suffrage(&nodes),
            storage.clone(),
            Arc::new(transport),
            encoders,
            Arc::new(processor),
            vec![source.address.clone()],
        );
        Fixture { nodes, source, source_storage, genesis, storage, syncer, _server: server }
    }

    impl Fixture {
        fn proposer_of(&self, height: Height, round: Round) -> &LocalNode {
            let proposer = suffrage(&self.nodes).acting(height, round).proposer;
            self.nodes.iter().find(|n| n.address == proposer).unwrap()
        }

        /// Commits block 1 on the source, proposed by `proposer` and voted by
        /// `voters`. The source trusts whatever proposer and keys it is given.
        async fn source_block(&self, proposer: &LocalNode, voters: &[LocalNode]) -> Block {
            let addresses = self.nodes.iter().map(|n| n.address.clone()).collect();
            let processor = ProposalProcessor::new(
                self.source_storage.clone(),
                Arc::new(FixedSuffrage::new(proposer.address.clone(), addresses).unwrap()),
                LocalState::new(testing::policy()),
                OperationProcessors::new(),
            );
            let (h, r) = (Height(1), Round(0));
            let ivp = testing::voteproof(
                BallotFact::Init(InitFact { height: h, round: r, previous_block: self.genesis.hash() }),
                voters,
            );
            let fact = BallotFact::Proposal(ProposalFact {
                height: h,
                round: r,
                proposer: proposer.address.clone(),
                operations: vec![],
                seals: vec![],
            });
            let proposal =
                Ballot::new(proposer.address.clone(), fact, Some(ivp.clone()), None, &proposer.privatekey, &testing::net())
                    .unwrap();
            self.source_storage.new_proposal(&proposal).unwrap();
            let candidate = processor.process_init(&proposal.fact_hash(), &ivp).await.unwrap();
            let avp = testing::accept_voteproof(voters, h, r, proposal.fact_hash(), candidate.hash());
            processor.process_accept(&proposal.fact_hash(), &avp).unwrap()
        }

        async fn assert_block_refused(&self) {
            let (tx, _rx) = mpsc::channel(8);
            let err = self.syncer.sync(Height::GENESIS, Height(1), tx).await.unwrap_err();
            assert!(err.is_not_found());
            assert!(self.storage.manifest_by_height(Height(1)).unwrap().is_none());
            assert!(self.syncer.scores().get(&self.source.address).copied().unwrap_or(0) < 0);
        }
    }

    #[tokio::test]
    async fn test_sync_genesis() {
        let f = fixture().await;
        let (tx, mut rx) = mpsc::channel(8);

        let last = f.syncer.sync(Height::GENESIS, Height::GENESIS, tx).await.unwrap();
        assert_eq!(last, Height::GENESIS);

        let saved = rx.recv().await.unwrap();
        assert_eq!(saved.hash(), f.genesis.hash());
        assert_eq!(f.storage.last_manifest().unwrap().unwrap().hash, f.genesis.hash());
        assert_eq!(f.storage.state("greeting").unwrap().unwrap().value, b"hello".to_vec());
        assert!(f.storage.has_operation_fact(&f.genesis.operations[1].fact_hash()).unwrap());
    }

    #[tokio::test]
    async fn test_sync_block_voted_by_suffrage() {
        let f = fixture().await;
        let proposer = f.proposer_of(Height(1), Round(0)).clone();
        let block = f.source_block(&proposer, &f.nodes).await;

        let (tx, _rx) = mpsc::channel(8);
        let last = f.syncer.sync(Height::GENESIS, Height(1), tx).await.unwrap();
        assert_eq!(last, Height(1));
        assert_eq!(f.storage.manifest_by_height(Height(1)).unwrap().map(|m| m.hash), Some(block.hash()));
    }

    #[tokio::test]
    async fn test_block_signed_by_impostors_refused() {
        let f = fixture().await;
        // same addresses as the validators, fresh keys
        let impostors: Vec<LocalNode> =
            f.nodes.iter().map(|n| LocalNode::new(n.address.clone(), Privatekey::new_btc())).collect();
        let proposer = impostors.iter().find(|n| n.address == f.proposer_of(Height(1), Round(0)).address).unwrap();
        f.source_block(proposer, &impostors).await;

        f.assert_block_refused().await;
    }

    #[tokio::test]
    async fn test_block_voted_outside_suffrage_refused() {
        let f = fixture().await;
        let proposer = f.proposer_of(Height(1), Round(0)).clone();
        f.source_block(&proposer, std::slice::from_ref(&proposer)).await;

        f.assert_block_refused().await;
    }

    #[tokio::test]
    async fn test_block_from_wrong_proposer_refused() {
        let f = fixture().await;
        let proposer = f.proposer_of(Height(1), Round(0)).address.clone();
        let other = f.nodes.iter().find(|n| n.address != proposer).unwrap().clone();
        f.source_block(&other, &f.nodes).await;

        f.assert_block_refused().await;
    }

    #[tokio::test]
    async fn test_peer_behind_target() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);

        let err = f.syncer.sync(Height::GENESIS, Height(1), tx).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(f.storage.last_manifest().unwrap().is_none());
        assert_eq!(f.syncer.ranked_peers(), vec![f.source.address.clone()]);
    }

    #[tokio::test]
    async fn test_nothing_to_do() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let last = f.syncer.sync(Height(3), Height(2), tx).await.unwrap();
        assert_eq!(last, Height(2));
    }

    #[test]
    fn test_demoted_peer_goes_last() {
        let nodes = testing::nodes(3);
        let peers: Vec<Address> = nodes.iter().map(|n| n.address.clone()).collect();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let state = LocalState::new(testing::policy());
        let processor = ProposalProcessor::new(
            storage.clone(),
            suffrage(&nodes),
            state.clone(),
            OperationProcessors::new(),
        );
        let network = InMemoryNetwork::new();
        let (transport, _inbound) = network.join(Address::from("self"));
        let syncer = Syncer::new(
            state,
            NodePool::new(nodes.iter().map(|n| (n.address.clone(), n.publickey()))).unwrap(),
            suffrage(&nodes),
            storage,
            Arc::new(transport),
            Encoders::new(EncoderKind::Bincode),
            Arc::new(processor),
            peers.clone(),
        );

        syncer.demote(&peers[0], &TesseraError::Invalid("bad manifest".into()));
        assert_eq!(syncer.ranked_peers(), vec![peers[1].clone(), peers[2].clone(), peers[0].clone()]);
    }
}
