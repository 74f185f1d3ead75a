#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use tessera_common::crypto::{KeyKind, Privatekey};
use tessera_common::encoding::{EncoderKind, Encoders};
use tessera_common::env::{
    Block, ConsensusPolicy, Height, KvSetFact, NetworkId, Operation, OperationFact, OperationSeal, Seal, ThresholdRatio,
};
use tessera_common::utils::Address;
use tessera_consensus::{
    GenesisGenerator, LocalNode, LocalPolicy, NodePool, OperationProcessors, RoundrobinSuffrage, TimerPolicy,
};
use tessera_ledger::{MemoryStorage, Storage};
use tessera_node::{start_node, NodeParts, NodeRuntime};
use tessera_p2p::InMemoryNetwork;

pub const NETWORK_ID: &str = "tessera-cluster-test";

pub fn network_id() -> NetworkId {
    NetworkId::new(NETWORK_ID)
}

pub fn timers() -> TimerPolicy {
    TimerPolicy {
        timeout_waiting_proposal: 600,
        interval_broadcasting_init_ballot: 150,
        interval_broadcasting_proposal: 150,
        wait_broadcasting_accept_ballot: 200,
        interval_broadcasting_accept_ballot: 150,
        ..Default::default()
    }
}

/// Validators `n0..n{size-1}` sharing one in-memory network. Every validator
/// is acting and the genesis block is made by `n0`.
pub struct Cluster {
    pub network: InMemoryNetwork,
    pub nodes: Vec<LocalNode>,
    pub storages: Vec<Arc<dyn Storage>>,
    pub runtimes: Vec<Option<NodeRuntime>>,
    pub genesis: Block,
    pub encoders: Encoders,
}

impl Cluster {
    /// Only the nodes in `with_genesis` start with the genesis block stored.
    pub async fn new(size: usize, with_genesis: &[usize]) -> Self {
        let nodes: Vec<LocalNode> = (0..size)
            .map(|i| LocalNode::new(Address::from(format!("n{i}").as_str()), Privatekey::generate(KeyKind::Btc)))
            .collect();
        let storages: Vec<Arc<dyn Storage>> =
            (0..size).map(|_| Arc::new(MemoryStorage::new()) as Arc<dyn Storage>).collect();

        let genesis = GenesisGenerator::new(nodes[0].clone(), policy(size), storages[0].clone())
            .generate()
            .await
            .unwrap();
        for &i in with_genesis.iter().filter(|&&i| i != 0) {
            storages[i].commit_block(&genesis, &genesis.states).unwrap();
        }

        Self {
            network: InMemoryNetwork::new(),
            runtimes: (0..size).map(|_| None).collect(),
            nodes,
            storages,
            genesis,
            encoders: Encoders::new(EncoderKind::Bincode),
        }
    }

    pub fn address(&self, i: usize) -> Address {
        self.nodes[i].address.clone()
    }

    fn parts(&self, i: usize) -> NodeParts {
        let pool = NodePool::new(self.nodes.iter().map(|n| (n.address.clone(), n.publickey()))).unwrap();
        let addresses = pool.addresses();
        NodeParts {
            local: self.nodes[i].clone(),
            suffrage: Arc::new(RoundrobinSuffrage::new(addresses, self.nodes.len()).unwrap()),
            policy: policy(self.nodes.len()),
            storage: self.storages[i].clone(),
            encoders: self.encoders.clone(),
            operations: OperationProcessors::with_defaults(self.nodes.iter().map(|n| n.publickey())).unwrap(),
            nodepool: pool,
        }
    }

    pub fn start(&mut self, i: usize) {
        let (transport, inbound) = self.network.join(self.address(i));
        let runtime = start_node(self.parts(i), Arc::new(transport), inbound).unwrap();
        self.runtimes[i] = Some(runtime);
    }

    pub fn runtime(&self, i: usize) -> &NodeRuntime {
        self.runtimes[i].as_ref().unwrap()
    }

    pub fn height(&self, i: usize) -> Height {
        self.runtime(i).local().last_height()
    }

    pub fn kv_operation(&self, signer: usize, token: &str, key: &str, value: &str) -> Operation {
        let fact = KvSetFact::new(token.as_bytes().to_vec(), key, value.as_bytes().to_vec()).unwrap();
        Operation::new(OperationFact::KvSet(fact), &self.nodes[signer].privatekey, &network_id()).unwrap()
    }

    /// Hands `op` to every running node, as a client fanning out would.
    pub async fn submit(&self, op: Operation) {
        let seal = OperationSeal::new(vec![op], &self.nodes[0].privatekey, &network_id()).unwrap();
        for runtime in self.runtimes.iter().flatten() {
            runtime.seals().send(Seal::Operation(seal.clone())).await.unwrap();
        }
    }

    pub async fn wait_height(&self, i: usize, height: Height, timeout: Duration) {
        let what = format!("{} at height {height}", self.address(i));
        eventually(timeout, &what, || self.height(i) >= height).await;
    }

    pub fn block(&self, i: usize, height: Height) -> Block {
        self.storages[i].block_by_height(height).unwrap().unwrap()
    }

    pub async fn shutdown(mut self) {
        for runtime in self.runtimes.iter_mut().filter_map(Option::take) {
            runtime.shutdown().await.unwrap();
        }
    }
}

pub fn policy(size: usize) -> LocalPolicy {
    let consensus = ConsensusPolicy {
        threshold: ThresholdRatio::new(0.67).unwrap(),
        number_of_acting_suffrage_nodes: size as u32,
        ..Default::default()
    };
    LocalPolicy::new(network_id(), consensus, timers()).unwrap()
}

pub async fn eventually(timeout: Duration, what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
