//! Admission checks run on every incoming seal before anything acts on it.

use std::collections::BTreeSet;

use tessera_common::crypto::Publickey;
use tessera_common::env::{Ballot, Block, Height, Seal, Stage, Voteproof};
use tessera_common::error::{Result, TesseraError};
use tessera_common::utils::{time, Address};

use crate::local::{LocalSnapshot, NodePool};
use crate::suffrage::Suffrage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Valid but too old to matter; dropped without a warning.
    Stale,
}

pub struct SealChecker<'a> {
    pub local: &'a LocalSnapshot,
    pub nodepool: &'a NodePool,
    pub suffrage: &'a dyn Suffrage,
}

impl<'a> SealChecker<'a> {
    pub fn check(&self, seal: &Seal) -> Result<Admission> {
        let policy = &self.local.policy;
        seal.is_valid(&policy.network_id)?;

        match seal {
            Seal::Operation(s) => {
                if s.operations.len() > policy.max_operations_in_seal() {
                    return Err(TesseraError::Invalid(format!(
                        "operation seal carries {} operations, limit {}",
                        s.operations.len(),
                        policy.max_operations_in_seal()
                    )));
                }
                Ok(Admission::Admit)
            }
            Seal::Ballot(b) => self.check_ballot(b),
        }
    }

    fn check_ballot(&self, ballot: &Ballot) -> Result<Admission> {
        let policy = &self.local.policy;
        if !time::within_now(&ballot.header.signed_at, policy.timespan_valid_ballot()) {
            return Err(TesseraError::Invalid(format!(
                "ballot signed at {} is outside the valid timespan",
                ballot.header.signed_at
            )));
        }

        if ballot.height() < self.local.last_height() {
            return Ok(Admission::Stale);
        }

        self.check_signer(&ballot.node, ballot.signer())?;

        let (h, r) = (ballot.height(), ballot.round());
        match ballot.stage() {
            Stage::Sign if !self.suffrage.is_acting(h, r, &ballot.node) => {
                return Err(TesseraError::Invalid(format!("{} is not acting at {h}/{r}", ballot.node)));
            }
            Stage::Proposal if !self.suffrage.is_proposer(h, r, &ballot.node) => {
                return Err(TesseraError::Invalid(format!("{} is not the proposer of {h}/{r}", ballot.node)));
            }
            _ => {}
        }

        for vp in ballot.voteproof.iter().chain(ballot.accept_voteproof.iter()) {
            self.check_voteproof(vp)?;
        }
        Ok(Admission::Admit)
    }

    /// Binds a block received from a peer to the local validator set. Both
    /// voteproofs and the proposal must be signed by known keys of the
    /// suffrage, and the proposal must come from the round's proposer.
    pub fn check_block(&self, block: &Block) -> Result<()> {
        let (h, r) = (block.height(), block.round());
        let ci = &block.consensus;
        let avp = ci
            .accept_voteproof
            .as_ref()
            .ok_or_else(|| TesseraError::Invalid(format!("block {h} lacks an accept voteproof")))?;
        self.check_voteproof(&ci.init_voteproof)?;
        self.check_voteproof(avp)?;

        let proposal = &ci.proposal;
        self.check_signer(&proposal.node, proposal.signer())?;
        let fact = proposal
            .proposal_fact()
            .ok_or_else(|| TesseraError::Invalid(format!("block {h} carries a {} ballot as proposal", proposal.stage())))?;
        if fact.proposer != proposal.node || ci.suffrage.proposer != proposal.node {
            return Err(TesseraError::Invalid(format!(
                "block {h} proposal signed by {} names proposer {}",
                proposal.node, fact.proposer
            )));
        }
        if h > Height::GENESIS && !self.suffrage.is_proposer(h, r, &proposal.node) {
            return Err(TesseraError::Invalid(format!("{} is not the proposer of {h}/{r}", proposal.node)));
        }
        Ok(())
    }

    fn check_signer(&self, node: &Address, signer: &Publickey) -> Result<()> {
        match self.nodepool.publickey(node) {
            Some(known) if known == signer => Ok(()),
            Some(_) => Err(TesseraError::SignatureInvalid(format!("{node} signed with an unknown key"))),
            None => Err(TesseraError::Invalid(format!("{node} is not a validator"))),
        }
    }

    /// Voteproofs were checked for internal consistency by `is_valid`; this
    /// binds them to the local validator set.
    pub fn check_voteproof(&self, vp: &Voteproof) -> Result<()> {
        let threshold = self.local.policy.threshold();
        if vp.threshold_ratio < threshold {
            return Err(TesseraError::Invalid(format!(
                "voteproof threshold {} below local {}",
                vp.threshold_ratio, threshold
            )));
        }

        for (node, vote) in &vp.votes {
            self.check_signer(node, &vote.sign.signer)?;
        }

        // the genesis block is voted by its creator alone
        if vp.height == Height::GENESIS {
            return match vp.suffrages.iter().all(|n| self.nodepool.contains(n)) {
                true => Ok(()),
                false => Err(TesseraError::Invalid("genesis voteproof from unknown nodes".into())),
            };
        }

        let voters = match vp.stage {
            Stage::Sign => self.suffrage.acting(vp.height, vp.round).nodes,
            _ => self.suffrage.nodes().to_vec(),
        };
        let expected: BTreeSet<&Address> = voters.iter().collect();
        let got: BTreeSet<&Address> = vp.suffrages.iter().collect();
        if got != expected {
            return Err(TesseraError::Invalid(format!(
                "voteproof {}/{}/{} voted by another suffrage",
                vp.height, vp.round, vp.stage
            )));
        }
        Ok(())
    }
}
