//! Request/response messages exchanged between nodes.
//!
//! Seals, manifests and blocks travel as hinted bytes produced by the
//! node's encoder registry, so this layer never needs to know their types.

use serde::{Deserialize, Serialize};

use tessera_common::crypto::{Hash, Publickey};
use tessera_common::env::{ConsensusPolicy, Height, Manifest, NetworkId};
use tessera_common::utils::Address;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRequest {
    /// Point-to-point delivery of one encoded seal.
    Deliver(Vec<u8>),
    Seals(Vec<Hash>),
    /// Proposal ballot by fact hash.
    Proposal(Hash),
    /// Operations by operation hash.
    Operations(Vec<Hash>),
    Manifests(Vec<Height>),
    Blocks(Vec<Height>),
    NodeInfo,
}

impl SyncRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncRequest::Deliver(_) => "deliver",
            SyncRequest::Seals(_) => "seals",
            SyncRequest::Proposal(_) => "proposal",
            SyncRequest::Operations(_) => "operations",
            SyncRequest::Manifests(_) => "manifests",
            SyncRequest::Blocks(_) => "blocks",
            SyncRequest::NodeInfo => "node-info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncResponse {
    Ack,
    /// Encoded seals; unknown hashes are left out.
    Seals(Vec<Vec<u8>>),
    Proposal(Option<Vec<u8>>),
    /// Encoded operations; unknown hashes are left out.
    Operations(Vec<Vec<u8>>),
    /// Encoded manifests in the requested order; missing heights are left out.
    Manifests(Vec<Vec<u8>>),
    Blocks(Vec<Vec<u8>>),
    NodeInfo(NodeInfo),
    Error(String),
}

/// What a node tells peers about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: Address,
    pub publickey: Publickey,
    pub network_id: NetworkId,
    /// Name of the active consensus state, e.g. `CONSENSUS`.
    pub state: String,
    pub last_manifest: Option<Manifest>,
    pub policy: ConsensusPolicy,
}
