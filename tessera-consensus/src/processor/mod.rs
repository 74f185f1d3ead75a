//! Turns a proposal into a candidate block and commits it once accepted.

pub mod operations;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use tessera_common::crypto::{FixedTree, FixedTreeGenerator, Hash, Publickey};
use tessera_common::encoding::{Decoded, Encoders};
use tessera_common::env::block::{operation_tree_node, state_tree_node};
use tessera_common::env::{
    Ballot, BallotFact, Block, ConsensusInfo, Height, Manifest, NetworkId, Operation, Stage, State, SuffrageInfo,
    Voteproof,
};
use tessera_common::error::{Result, TesseraError};
use tessera_common::utils::Address;
use tessera_ledger::{StatePool, Storage};
use tessera_p2p::{SyncRequest, SyncResponse, Transport};

use crate::local::LocalState;
use crate::suffrage::Suffrage;
use operations::{OperationOutcome, OperationProcessors};

/// Asks peers for proposals and operations the local storage lacks.
#[derive(Debug, Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    encoders: Encoders,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, encoders: Encoders) -> Self {
        Self { transport, encoders }
    }

    async fn proposal(&self, from: &Address, hash: &Hash) -> Result<Option<Ballot>> {
        match self.transport.request(from, SyncRequest::Proposal(*hash)).await? {
            SyncResponse::Proposal(Some(bytes)) => {
                let seal = self.encoders.decode_seal(&bytes)?;
                Ok(seal.as_ballot().cloned())
            }
            SyncResponse::Proposal(None) => Ok(None),
            other => Err(TesseraError::Network(format!("unexpected reply to proposal request: {other:?}"))),
        }
    }

    async fn operations(&self, from: &Address, hashes: Vec<Hash>) -> Result<Vec<Operation>> {
        match self.transport.request(from, SyncRequest::Operations(hashes)).await? {
            SyncResponse::Operations(list) => {
                let mut ops = Vec::with_capacity(list.len());
                for bytes in list {
                    match self.encoders.decode(&bytes)? {
                        Decoded::Operation(op) => ops.push(op),
                        _ => return Err(TesseraError::InvalidHint("expected operation".into())),
                    }
                }
                Ok(ops)
            }
            other => Err(TesseraError::Network(format!("unexpected reply to operations request: {other:?}"))),
        }
    }
}

/// Operations applied for one height.
#[derive(Debug)]
pub struct Applied {
    pub operations: Vec<Operation>,
    pub operations_tree: FixedTree,
    pub states: Vec<State>,
    pub states_tree: FixedTree,
}

#[derive(Debug)]
pub struct ProposalProcessor {
    network_id: NetworkId,
    storage: Arc<dyn Storage>,
    suffrage: Arc<dyn Suffrage>,
    state: LocalState,
    operations: OperationProcessors,
    fetcher: Option<Fetcher>,
    /// Candidate blocks by proposal fact hash.
    processed: Mutex<HashMap<Hash, Block>>,
}

impl ProposalProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        suffrage: Arc<dyn Suffrage>,
        state: LocalState,
        operations: OperationProcessors,
    ) -> Self {
        let network_id = state.policy().network_id;
        Self {
            network_id,
            storage,
            suffrage,
            state,
            operations,
            fetcher: None,
            processed: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Fetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    fn processed(&self) -> MutexGuard<'_, HashMap<Hash, Block>> {
        self.processed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn candidate(&self, proposal: &Hash) -> Option<Block> {
        self.processed().get(proposal).cloned()
    }

    /// Builds the candidate block for `proposal` without persisting it.
    pub async fn process_init(&self, proposal: &Hash, ivp: &Voteproof) -> Result<Block> {
        let budget = self.state.policy().timeout_process_proposal();
        match tokio::time::timeout(budget, self.build(proposal, ivp)).await {
            Ok(r) => r,
            Err(_) => Err(TesseraError::Timeout(format!("processing proposal {proposal} took over {budget:?}"))),
        }
    }

    async fn build(&self, proposal_hash: &Hash, ivp: &Voteproof) -> Result<Block> {
        if ivp.stage != Stage::Init || !ivp.is_majority() {
            return Err(TesseraError::Invalid(format!("{} {} voteproof can not open a proposal", ivp.result, ivp.stage)));
        }
        if let Some(block) = self.candidate(proposal_hash) {
            return Ok(block);
        }

        let (h, r) = (ivp.height, ivp.round);
        let acting = self.suffrage.acting(h, r);
        let proposal = self.proposal(proposal_hash, &acting.proposer).await?;
        let fact = proposal
            .proposal_fact()
            .ok_or_else(|| TesseraError::Invalid(format!("seal {} is not a proposal", proposal.hash())))?;
        if fact.height != h || fact.round != r {
            return Err(TesseraError::Invalid(format!(
                "proposal for {}/{} under init voteproof {h}/{r}",
                fact.height, fact.round
            )));
        }
        if proposal.node != acting.proposer {
            return Err(TesseraError::Invalid(format!(
                "proposer mismatch at {h}/{r}: expected {}, got {}",
                acting.proposer, proposal.node
            )));
        }

        let max = self.state.policy().max_operations_in_proposal();
        if fact.operations.len() > max {
            return Err(TesseraError::Invalid(format!("proposal has {} operations, limit {max}", fact.operations.len())));
        }

        let previous = self.previous_block(h)?;
        if let Some(BallotFact::Init(init)) = &ivp.majority {
            if init.previous_block != previous {
                return Err(TesseraError::Invalid(format!(
                    "init voteproof builds on {}, local chain on {previous}",
                    init.previous_block
                )));
            }
        }

        let ops = self.resolve_operations(&fact.operations, &acting.proposer).await?;
        let applied = self.apply(h, ops)?;

        let manifest = Manifest::new(
            h,
            r,
            *proposal_hash,
            previous,
            applied.operations_tree.root(),
            applied.states_tree.root(),
            proposal.header.signed_at,
        );
        let consensus = ConsensusInfo {
            init_voteproof: ivp.clone(),
            accept_voteproof: None,
            suffrage: SuffrageInfo { proposer: acting.proposer.clone(), nodes: acting.nodes.clone() },
            proposal,
        };
        let block = Block::new(
            manifest,
            applied.operations,
            applied.operations_tree,
            applied.states,
            applied.states_tree,
            consensus,
        );

        info!(
            target: "consensus",
            height = %h, round = %r, proposal = %proposal_hash, block = %block.hash(),
            operations = block.operations.len(), states = block.states.len(),
            "proposal processed"
        );
        self.processed().insert(*proposal_hash, block.clone());
        Ok(block)
    }

    fn previous_block(&self, height: Height) -> Result<Hash> {
        if height == Height::GENESIS {
            return Ok(Hash::zero());
        }
        self.storage
            .manifest_by_height(height.prev())?
            .map(|m| m.hash)
            .ok_or_else(|| TesseraError::NotFound(format!("manifest of height {}", height.prev())))
    }

    async fn proposal(&self, hash: &Hash, proposer: &Address) -> Result<Ballot> {
        if let Some(p) = self.storage.proposal(hash)? {
            return Ok(p);
        }
        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| TesseraError::NotFound(format!("proposal {hash}")))?;

        debug!(target: "consensus", proposal = %hash, from = %proposer, "fetching proposal");
        let ballot = fetcher
            .proposal(proposer, hash)
            .await?
            .ok_or_else(|| TesseraError::NotFound(format!("proposal {hash}")))?;
        ballot.is_valid(&self.network_id)?;
        if ballot.fact_hash() != *hash {
            return Err(TesseraError::Invalid(format!("peer answered proposal {} for {hash}", ballot.fact_hash())));
        }
        self.storage.new_proposal(&ballot)?;
        Ok(ballot)
    }

    async fn resolve_operations(&self, hashes: &[Hash], proposer: &Address) -> Result<Vec<Operation>> {
        let mut found: HashMap<Hash, Operation> = HashMap::with_capacity(hashes.len());
        let mut missing = Vec::new();
        for h in hashes {
            match self.storage.operation(h)? {
                Some(op) => {
                    found.insert(*h, op);
                }
                None => missing.push(*h),
            }
        }

        if !missing.is_empty() {
            let fetcher = self.fetcher.as_ref().ok_or_else(|| {
                TesseraError::NotFound(format!("operation-fetch-failed: {} operations missing", missing.len()))
            })?;
            debug!(target: "consensus", missing = missing.len(), from = %proposer, "fetching operations");
            let wanted: HashSet<Hash> = missing.iter().copied().collect();
            let mut fetched = Vec::new();
            for op in fetcher.operations(proposer, missing).await? {
                if !wanted.contains(&op.hash) {
                    continue;
                }
                if let Err(e) = op.is_valid(&self.network_id) {
                    warn!(target: "consensus", operation = %op.hash, error = %e, "invalid operation fetched");
                    continue;
                }
                fetched.push(op);
            }
            self.storage.new_operations(&fetched)?;
            found.extend(fetched.into_iter().map(|op| (op.hash, op)));
        }

        hashes
            .iter()
            .map(|h| {
                found
                    .remove(h)
                    .ok_or_else(|| TesseraError::NotFound(format!("operation-fetch-failed: {h}")))
            })
            .collect()
    }

    /// Applies `ops` in order on top of the committed state.
    pub fn apply(&self, height: Height, ops: Vec<Operation>) -> Result<Applied> {
        let mut pool = StatePool::new(self.storage.clone(), height);
        let mut included = Vec::with_capacity(ops.len());
        let mut nodes = Vec::with_capacity(ops.len());
        let mut facts = HashSet::new();
        let mut tokens: HashSet<(Publickey, Vec<u8>)> = HashSet::new();

        for op in ops {
            let fact = op.fact_hash();
            if !facts.insert(fact) || self.storage.has_operation_fact(&fact)? {
                debug!(target: "consensus", %height, fact = %fact, "operation already applied; skipped");
                continue;
            }

            // a token is spent for every signer of the operation
            let token = op.fact.token().to_vec();
            let mut replayed = false;
            for signer in op.signers() {
                if self.storage.has_token(signer, &token)? || !tokens.insert((*signer, token.clone())) {
                    replayed = true;
                }
            }
            let reason = if replayed {
                Some("replayed token".to_string())
            } else {
                match self.operations.process(&op, &mut pool)? {
                    OperationOutcome::Applied => None,
                    OperationOutcome::Rejected(r) => Some(r),
                }
            };
            if let Some(r) = &reason {
                debug!(target: "consensus", %height, operation = %op.hash, reason = %r, "operation not applied");
            }

            nodes.push(operation_tree_node(included.len() as u64, &fact, reason.is_none(), reason.as_deref()));
            included.push(op);
        }

        let mut gen = FixedTreeGenerator::new(nodes.len());
        for n in nodes {
            gen.add(n)?;
        }
        let operations_tree = gen.tree()?;

        let states = pool.updated();
        let mut gen = FixedTreeGenerator::new(states.len());
        for (i, st) in states.iter().enumerate() {
            gen.add(state_tree_node(i as u64, st))?;
        }
        let states_tree = gen.tree()?;

        Ok(Applied { operations: included, operations_tree, states, states_tree })
    }

    /// Commits the candidate of `proposal` once `avp` agreed on it.
    pub fn process_accept(&self, proposal: &Hash, avp: &Voteproof) -> Result<Block> {
        if avp.stage != Stage::Accept || !avp.is_majority() {
            return Err(TesseraError::Invalid(format!("{} {} voteproof can not accept a block", avp.result, avp.stage)));
        }
        let (agreed_proposal, agreed_block) = avp
            .majority
            .as_ref()
            .and_then(|m| m.new_block())
            .ok_or_else(|| TesseraError::Invalid("accept voteproof without a block".into()))?;
        if agreed_proposal != *proposal {
            return Err(TesseraError::Invalid(format!("accept voteproof is for proposal {agreed_proposal}")));
        }

        let candidate = self
            .candidate(proposal)
            .ok_or_else(|| TesseraError::NotFound(format!("proposal {proposal} not processed")))?;
        if candidate.hash() != agreed_block {
            return Err(TesseraError::Invalid(format!(
                "agreed block {agreed_block} differs from processed {}",
                candidate.hash()
            )));
        }

        let block = candidate.set_accept_voteproof(avp.clone());
        let states = block.states.clone();
        self.commit(block, states)
    }

    /// Writes `block` with `states` in one transaction.
    pub fn commit(&self, block: Block, states: Vec<State>) -> Result<Block> {
        let mut tx = self.storage.open_block_tx(block.clone())?;
        tx.state_put(states);
        tx.commit()?;

        let height = block.height();
        self.processed().retain(|_, b| b.height() > height);
        Ok(block)
    }

    /// Re-applies a block fetched from a peer; fails when the result differs
    /// from what its manifest claims.
    pub fn replay(&self, block: &Block) -> Result<Vec<State>> {
        let applied = self.apply(block.height(), block.operations.clone())?;
        if applied.operations_tree.root() != block.manifest.operations_hash {
            return Err(TesseraError::Invalid(format!("block {} operations diverge on replay", block.height())));
        }
        if applied.states_tree.root() != block.manifest.states_hash {
            return Err(TesseraError::Invalid(format!("block {} states diverge on replay", block.height())));
        }
        Ok(applied.states)
    }
}
