//! Blocks and manifests.
//!
//! The block hash is the manifest hash. Consensus info (voteproofs, the
//! proposal) rides along with the block but is not part of the hash, so the
//! ACCEPT voteproof can be attached after the block is agreed on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{FixedTree, FixedTreeNode, Hash};
use crate::env::ballot::Ballot;
use crate::env::operation::Operation;
use crate::env::state::State;
use crate::env::types::{Height, NetworkId, Round, Stage};
use crate::env::voteproof::Voteproof;
use crate::error::{Result, TesseraError};
use crate::hint::{self, Hint, Hinted, V0_0_1};
use crate::utils::{time, Address};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub hint: Hint,
    pub height: Height,
    pub round: Round,
    /// Fact hash of the proposal this block was built from.
    pub proposal: Hash,
    pub previous_block: Hash,
    pub operations_hash: Hash,
    pub states_hash: Hash,
    pub created_at: DateTime<Utc>,
    pub hash: Hash,
}

impl Manifest {
    pub fn new(
        height: Height,
        round: Round,
        proposal: Hash,
        previous_block: Hash,
        operations_hash: Hash,
        states_hash: Hash,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut m = Manifest {
            hint: Hint::new(hint::MANIFEST_TYPE, V0_0_1),
            height,
            round,
            proposal,
            previous_block,
            operations_hash,
            states_hash,
            created_at,
            hash: Hash::zero(),
        };
        m.hash = m.generate_hash();
        m
    }

    pub fn generate_hash(&self) -> Hash {
        Hash::sha256_parts(&[
            &self.hint.bytes(),
            &self.height.bytes(),
            &self.round.bytes(),
            self.proposal.as_bytes(),
            self.previous_block.as_bytes(),
            self.operations_hash.as_bytes(),
            self.states_hash.as_bytes(),
            &time::rfc3339_bytes(&self.created_at),
        ])
    }

    pub fn is_valid(&self) -> Result<()> {
        Hint::new(hint::MANIFEST_TYPE, V0_0_1).is_compatible(&self.hint)?;
        if self.height < Height::GENESIS {
            return Err(TesseraError::Invalid(format!("manifest height {}", self.height)));
        }
        if self.hash != self.generate_hash() {
            return Err(TesseraError::Invalid(format!("manifest {} hash does not match", self.height)));
        }
        Ok(())
    }

    /// Checks `self` directly follows `prev`.
    pub fn is_next_of(&self, prev: &Manifest) -> Result<()> {
        if self.height != prev.height.next() {
            return Err(TesseraError::Invalid(format!(
                "manifest height {} does not follow {}",
                self.height, prev.height
            )));
        }
        if self.previous_block != prev.hash {
            return Err(TesseraError::Invalid(format!(
                "manifest {} previous block {} != {}",
                self.height, self.previous_block, prev.hash
            )));
        }
        Ok(())
    }
}

impl Hinted for Manifest {
    fn hint(&self) -> &Hint {
        &self.hint
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffrageInfo {
    pub proposer: Address,
    pub nodes: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusInfo {
    pub init_voteproof: Voteproof,
    pub accept_voteproof: Option<Voteproof>,
    pub suffrage: SuffrageInfo,
    pub proposal: Ballot,
}

/// Data carried by an operations tree node: `in_state` flag byte, then the
/// failure reason if any.
pub fn operation_tree_node(index: u64, fact_hash: &Hash, in_state: bool, reason: Option<&str>) -> FixedTreeNode {
    let mut data = vec![u8::from(in_state)];
    if let Some(r) = reason {
        data.extend_from_slice(r.as_bytes());
    }
    FixedTreeNode::new(index, fact_hash.as_bytes().to_vec(), data)
}

/// Inverse of [`operation_tree_node`].
pub fn operation_tree_data(node: &FixedTreeNode) -> (bool, Option<String>) {
    let in_state = node.data.first().copied() == Some(1);
    let reason = node
        .data
        .get(1..)
        .filter(|r| !r.is_empty())
        .map(|r| String::from_utf8_lossy(r).into_owned());
    (in_state, reason)
}

pub fn state_tree_node(index: u64, state: &State) -> FixedTreeNode {
    FixedTreeNode::new(index, state.key.as_bytes().to_vec(), state.hash.as_bytes().to_vec())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub hint: Hint,
    pub manifest: Manifest,
    pub operations: Vec<Operation>,
    pub operations_tree: FixedTree,
    /// Sorted by key.
    pub states: Vec<State>,
    pub states_tree: FixedTree,
    pub consensus: ConsensusInfo,
}

impl Block {
    pub fn new(
        manifest: Manifest,
        operations: Vec<Operation>,
        operations_tree: FixedTree,
        states: Vec<State>,
        states_tree: FixedTree,
        consensus: ConsensusInfo,
    ) -> Self {
        Block {
            hint: Hint::new(hint::BLOCK_TYPE, V0_0_1),
            manifest,
            operations,
            operations_tree,
            states,
            states_tree,
            consensus,
        }
    }

    pub fn hash(&self) -> Hash {
        self.manifest.hash
    }

    pub fn height(&self) -> Height {
        self.manifest.height
    }

    pub fn round(&self) -> Round {
        self.manifest.round
    }

    pub fn previous_block(&self) -> Hash {
        self.manifest.previous_block
    }

    pub fn set_accept_voteproof(mut self, vp: Voteproof) -> Self {
        self.consensus.accept_voteproof = Some(vp);
        self
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        Hint::new(hint::BLOCK_TYPE, V0_0_1).is_compatible(&self.hint)?;
        self.manifest.is_valid()?;

        self.operations_tree.is_valid()?;
        if self.operations_tree.root() != self.manifest.operations_hash {
            return Err(TesseraError::Invalid("operations tree root does not match manifest".into()));
        }
        for op in &self.operations {
            op.is_valid(network_id)?;
            if self.operations_tree.find_by_key(op.fact_hash().as_bytes()).is_none() {
                return Err(TesseraError::Invalid(format!("operation {} missing in tree", op.fact_hash())));
            }
        }

        self.states_tree.is_valid()?;
        if self.states_tree.root() != self.manifest.states_hash {
            return Err(TesseraError::Invalid("states tree root does not match manifest".into()));
        }
        if self.states.len() != self.states_tree.len() {
            return Err(TesseraError::Invalid("states and states tree differ in size".into()));
        }
        for (i, st) in self.states.iter().enumerate() {
            st.is_valid()?;
            if st.height != self.manifest.height {
                return Err(TesseraError::Invalid(format!("state {} has height {}", st.key, st.height)));
            }
            if state_tree_node(i as u64, st).data != self.states_tree.nodes()[i].data {
                return Err(TesseraError::Invalid(format!("state {} differs from tree", st.key)));
            }
        }

        self.is_valid_consensus(network_id)
    }

    fn is_valid_consensus(&self, network_id: &NetworkId) -> Result<()> {
        let ci = &self.consensus;
        let ivp = &ci.init_voteproof;
        ivp.is_valid(network_id)?;
        if ivp.stage != Stage::Init
            || !ivp.is_majority()
            || ivp.height != self.manifest.height
            || ivp.round != self.manifest.round
        {
            return Err(TesseraError::Invalid("block init voteproof does not match manifest".into()));
        }

        ci.proposal.is_valid(network_id)?;
        if ci.proposal.fact_hash() != self.manifest.proposal {
            return Err(TesseraError::Invalid("block proposal does not match manifest".into()));
        }

        if let Some(avp) = &ci.accept_voteproof {
            avp.is_valid(network_id)?;
            let agreed = avp.majority.as_ref().and_then(|m| m.new_block());
            if avp.stage != Stage::Accept || agreed != Some((self.manifest.proposal, self.hash())) {
                return Err(TesseraError::Invalid("block accept voteproof does not agree on this block".into()));
            }
        }
        Ok(())
    }
}

impl Hinted for Block {
    fn hint(&self) -> &Hint {
        &self.hint
    }
}
