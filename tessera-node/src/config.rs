//! Node design document: everything a node needs to start, in one JSON file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tessera_common::crypto::{Privatekey, Publickey};
use tessera_common::encoding::{EncoderKind, Encoders};
use tessera_common::env::{ConsensusPolicy, KvSetFact, NetworkId, Operation, OperationFact, ThresholdRatio};
use tessera_common::error::{Result, TesseraError};
use tessera_common::utils::Address;
use tessera_consensus::{
    FixedSuffrage, LocalNode, LocalPolicy, NodePool, OperationProcessors, RoundrobinSuffrage, Suffrage, TimerPolicy,
};
use tessera_p2p::{P2pConfig, PeerEntry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Redb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDesign {
    /// libp2p listen multiaddr.
    pub bind: String,
    /// Address announced to peers, when it differs from `bind`.
    #[serde(default)]
    pub publish: Option<String>,
    pub keypair_path: String,
}

impl Default for NetworkDesign {
    fn default() -> Self {
        Self {
            bind: "/ip4/0.0.0.0/tcp/4001".into(),
            publish: None,
            keypair_path: "keys/p2p.key".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: String,
    pub publickey: String,
    /// Multiaddr ending in `/p2p/<peer-id>`.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisPolicy {
    /// Ratio in `(0.5, 1.0]`, or a percentage in `(50, 100]`.
    pub threshold: f64,
    pub num_acting_suffrage_nodes: u32,
    pub max_operations_in_seal: u32,
    pub max_operations_in_proposal: u32,
}

impl Default for GenesisPolicy {
    fn default() -> Self {
        let p = ConsensusPolicy::default();
        Self {
            threshold: p.threshold.value() * 100.0,
            num_acting_suffrage_nodes: p.number_of_acting_suffrage_nodes,
            max_operations_in_seal: p.max_operations_in_seal,
            max_operations_in_proposal: p.max_operations_in_proposal,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuffrageKind {
    #[default]
    Roundrobin,
    FixedProposer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuffrageDesign {
    #[serde(rename = "type", default)]
    pub kind: SuffrageKind,
    #[serde(default)]
    pub proposer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisKv {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDesign {
    pub network_id: String,
    pub address: String,
    pub privatekey: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default)]
    pub encoder: EncoderKind,
    #[serde(default)]
    pub network: NetworkDesign,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    #[serde(default)]
    pub genesis_policy: GenesisPolicy,
    #[serde(default)]
    pub policy: TimerPolicy,
    #[serde(default)]
    pub suffrage: SuffrageDesign,
    #[serde(default)]
    pub genesis_operations: Vec<GenesisKv>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn config_err(msg: impl Into<String>) -> TesseraError {
    TesseraError::Config(msg.into())
}

impl NodeDesign {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|e| config_err(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&content).map_err(|e| config_err(format!("parsing {}: {e}", path.display())))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Checks the whole document; every other accessor assumes it passed.
    pub fn validate(&self) -> Result<()> {
        let local = self.local_node()?;
        let nodepool = self.nodepool()?;
        if let Some(known) = nodepool.publickey(&local.address) {
            if *known != local.publickey() {
                return Err(config_err(format!("privatekey does not match the public key listed for {}", local.address)));
            }
        }
        self.consensus_policy()?;
        self.policy.is_valid()?;
        if let Some(p) = &self.suffrage.proposer {
            let proposer = Address::new(p.clone()).map_err(|e| config_err(format!("suffrage.proposer: {e}")))?;
            if !nodepool.contains(&proposer) {
                return Err(config_err(format!("suffrage.proposer {proposer} is not a known node")));
            }
        } else if self.suffrage.kind == SuffrageKind::FixedProposer {
            return Err(config_err("fixed-proposer suffrage needs suffrage.proposer"));
        }
        self.genesis_operations(&local)?;
        Ok(())
    }

    pub fn network_id(&self) -> Result<NetworkId> {
        if self.network_id.is_empty() {
            return Err(config_err("network_id is empty"));
        }
        Ok(NetworkId::new(self.network_id.clone()))
    }

    pub fn local_node(&self) -> Result<LocalNode> {
        let address = Address::new(self.address.clone()).map_err(|e| config_err(format!("address: {e}")))?;
        let privatekey: Privatekey = self.privatekey.parse().map_err(|e| config_err(format!("privatekey: {e}")))?;
        Ok(LocalNode::new(address, privatekey))
    }

    /// Validators from `nodes[]`, plus the local node when it is not listed.
    pub fn nodepool(&self) -> Result<NodePool> {
        let local = self.local_node()?;
        let mut entries = Vec::with_capacity(self.nodes.len() + 1);
        for n in &self.nodes {
            let address = Address::new(n.address.clone()).map_err(|e| config_err(format!("nodes[].address: {e}")))?;
            let publickey: Publickey =
                n.publickey.parse().map_err(|e| config_err(format!("publickey of {address}: {e}")))?;
            entries.push((address, publickey));
        }
        if !entries.iter().any(|(a, _)| *a == local.address) {
            entries.push((local.address.clone(), local.publickey()));
        }
        NodePool::new(entries).map_err(|e| config_err(e.to_string()))
    }

    pub fn threshold(&self) -> Result<ThresholdRatio> {
        let t = self.genesis_policy.threshold;
        let ratio = if t > 1.0 { t / 100.0 } else { t };
        if !(ratio > 0.5 && ratio <= 1.0) {
            return Err(config_err(format!("genesis_policy.threshold {t} must be above 50%")));
        }
        ThresholdRatio::new(ratio).map_err(|e| config_err(e.to_string()))
    }

    pub fn consensus_policy(&self) -> Result<ConsensusPolicy> {
        let g = &self.genesis_policy;
        let policy = ConsensusPolicy {
            threshold: self.threshold()?,
            number_of_acting_suffrage_nodes: g.num_acting_suffrage_nodes,
            max_operations_in_seal: g.max_operations_in_seal,
            max_operations_in_proposal: g.max_operations_in_proposal,
        };
        policy.is_valid().map_err(|e| config_err(format!("genesis_policy: {e}")))?;
        Ok(policy)
    }

    pub fn local_policy(&self) -> Result<LocalPolicy> {
        LocalPolicy::new(self.network_id()?, self.consensus_policy()?, self.policy.clone())
    }

    pub fn suffrage(&self) -> Result<Arc<dyn Suffrage>> {
        let nodes = self.nodepool()?.addresses();
        Ok(match self.suffrage.kind {
            SuffrageKind::Roundrobin => {
                let acting = self.genesis_policy.num_acting_suffrage_nodes as usize;
                Arc::new(RoundrobinSuffrage::new(nodes, acting)?)
            }
            SuffrageKind::FixedProposer => {
                let proposer = self
                    .suffrage
                    .proposer
                    .clone()
                    .ok_or_else(|| config_err("fixed-proposer suffrage needs suffrage.proposer"))?;
                let proposer = Address::new(proposer).map_err(|e| config_err(e.to_string()))?;
                Arc::new(FixedSuffrage::new(proposer, nodes)?)
            }
        })
    }

    pub fn operation_processors(&self) -> Result<OperationProcessors> {
        let pool = self.nodepool()?;
        let validators: Vec<Publickey> =
            pool.addresses().iter().filter_map(|a| pool.publickey(a).cloned()).collect();
        OperationProcessors::with_defaults(validators)
    }

    /// `genesis_operations` as KV operations signed by `local`.
    pub fn genesis_operations(&self, local: &LocalNode) -> Result<Vec<Operation>> {
        let network_id = self.network_id()?;
        self.genesis_operations
            .iter()
            .enumerate()
            .map(|(i, kv)| {
                let fact = KvSetFact::new(format!("genesis-kv-{i}"), kv.key.clone(), kv.value.clone().into_bytes())
                    .map_err(|e| config_err(format!("genesis_operations[{i}]: {e}")))?;
                Operation::new(OperationFact::KvSet(fact), &local.privatekey, &network_id)
            })
            .collect()
    }

    pub fn encoders(&self) -> Encoders {
        Encoders::new(self.encoder)
    }

    pub fn p2p_config(&self) -> P2pConfig {
        let mut listen = vec![self.network.bind.clone()];
        if let Some(p) = &self.network.publish {
            if *p != self.network.bind {
                listen.push(p.clone());
            }
        }
        P2pConfig {
            listen_multiaddrs: listen,
            bootstrap: vec![],
            keypair_path: self.network.keypair_path.clone(),
            peers: self
                .nodes
                .iter()
                .filter(|n| n.address != self.address)
                .filter_map(|n| {
                    let url = n.url.clone()?;
                    Some(PeerEntry { address: Address::from(n.address.as_str()), url })
                })
                .collect(),
        }
    }
}
