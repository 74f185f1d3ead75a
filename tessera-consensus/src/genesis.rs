//! Builds block 0 with the local node as the only voter.
//!
//! The genesis block goes through the same INIT → PROPOSAL → ACCEPT path as
//! any other block, so it carries real voteproofs other nodes can verify.

use std::sync::Arc;

use tracing::info;

use tessera_common::crypto::Hash;
use tessera_common::env::{
    AcceptFact, Ballot, BallotFact, Block, Height, InitFact, Operation, OperationFact, ProposalFact, Round,
    SetPolicyFact, Voteproof,
};
use tessera_common::error::{Result, TesseraError};
use tessera_ledger::Storage;

use crate::ballotbox::Ballotbox;
use crate::local::{LocalNode, LocalState};
use crate::policy::LocalPolicy;
use crate::processor::operations::OperationProcessors;
use crate::processor::ProposalProcessor;
use crate::suffrage::FixedSuffrage;

const POLICY_TOKEN: &[u8] = b"genesis-policy";

pub struct GenesisGenerator {
    local: LocalNode,
    policy: LocalPolicy,
    storage: Arc<dyn Storage>,
    operations: Vec<Operation>,
}

impl GenesisGenerator {
    pub fn new(local: LocalNode, policy: LocalPolicy, storage: Arc<dyn Storage>) -> Self {
        Self { local, policy, storage, operations: Vec::new() }
    }

    /// Extra operations to include after the policy operation.
    pub fn with_operations(mut self, operations: Vec<Operation>) -> Self {
        self.operations = operations;
        self
    }

    fn sign(&self, fact: BallotFact, voteproof: Option<Voteproof>) -> Result<Ballot> {
        Ballot::new(
            self.local.address.clone(),
            fact,
            voteproof,
            None,
            &self.local.privatekey,
            &self.policy.network_id,
        )
    }

    pub async fn generate(&self) -> Result<Block> {
        if let Some(m) = self.storage.last_manifest()? {
            return Err(TesseraError::Duplicate(format!("chain already has block {}", m.height)));
        }
        let network_id = &self.policy.network_id;

        let set_policy = SetPolicyFact::new(POLICY_TOKEN, self.policy.consensus.clone())?;
        let mut operations = vec![Operation::new(OperationFact::SetPolicy(set_policy), &self.local.privatekey, network_id)?];
        operations.extend(self.operations.iter().cloned());
        self.storage.new_operations(&operations)?;

        let suffrage = Arc::new(FixedSuffrage::new(self.local.address.clone(), vec![self.local.address.clone()])?);
        let ballotbox = Ballotbox::new(network_id.clone(), suffrage.clone(), self.policy.threshold());
        let processor = ProposalProcessor::new(
            self.storage.clone(),
            suffrage,
            LocalState::new(self.policy.clone()),
            OperationProcessors::with_defaults([self.local.publickey()])?,
        );
        let finished = |ballot: &Ballot| -> Result<Voteproof> {
            ballotbox
                .vote(ballot)?
                .finished()
                .cloned()
                .ok_or_else(|| TesseraError::ConsensusBroken(format!("genesis {} vote did not finish", ballot.stage())))
        };

        let (height, round) = (Height::GENESIS, Round(0));
        let init = self.sign(BallotFact::Init(InitFact { height, round, previous_block: Hash::zero() }), None)?;
        let ivp = finished(&init)?;

        let proposal = self.sign(
            BallotFact::Proposal(ProposalFact {
                height,
                round,
                proposer: self.local.address.clone(),
                operations: operations.iter().map(|op| op.hash).collect(),
                seals: vec![],
            }),
            Some(ivp.clone()),
        )?;
        self.storage.new_proposal(&proposal)?;
        let proposal_hash = proposal.fact_hash();

        let candidate = processor.process_init(&proposal_hash, &ivp).await?;
        let accept = self.sign(
            BallotFact::Accept(AcceptFact { height, round, proposal: proposal_hash, new_block: candidate.hash() }),
            Some(ivp),
        )?;
        let avp = finished(&accept)?;
        let block = processor.process_accept(&proposal_hash, &avp)?;

        info!(
            target: "consensus",
            block = %block.hash(),
            operations = block.operations.len(),
            "EVENT:GENESIS"
        );
        Ok(block)
    }
}
