//! Ballots: the signed votes exchanged during a round.

use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, Privatekey, Publickey};
use crate::env::fact::FactSign;
use crate::env::seal::SealHeader;
use crate::env::types::{Height, NetworkId, Round, Stage, VoteResult};
use crate::env::voteproof::Voteproof;
use crate::error::{Result, TesseraError};
use crate::hint::{self, Hint, Hinted, V0_0_1};
use crate::utils::{concat_bytes, Address};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitFact {
    pub height: Height,
    pub round: Round,
    pub previous_block: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalFact {
    pub height: Height,
    pub round: Round,
    pub proposer: Address,
    /// Operation hashes, applied in this order.
    pub operations: Vec<Hash>,
    /// Operation seals the operations were collected from.
    pub seals: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignFact {
    pub height: Height,
    pub round: Round,
    pub proposal: Hash,
    pub new_block: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptFact {
    pub height: Height,
    pub round: Round,
    pub proposal: Hash,
    pub new_block: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BallotFact {
    Init(InitFact),
    Proposal(ProposalFact),
    Sign(SignFact),
    Accept(AcceptFact),
}

impl BallotFact {
    pub fn height(&self) -> Height {
        match self {
            BallotFact::Init(f) => f.height,
            BallotFact::Proposal(f) => f.height,
            BallotFact::Sign(f) => f.height,
            BallotFact::Accept(f) => f.height,
        }
    }

    pub fn round(&self) -> Round {
        match self {
            BallotFact::Init(f) => f.round,
            BallotFact::Proposal(f) => f.round,
            BallotFact::Sign(f) => f.round,
            BallotFact::Accept(f) => f.round,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            BallotFact::Init(_) => Stage::Init,
            BallotFact::Proposal(_) => Stage::Proposal,
            BallotFact::Sign(_) => Stage::Sign,
            BallotFact::Accept(_) => Stage::Accept,
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut b = vec![self.stage().byte()];
        b.extend_from_slice(&self.height().bytes());
        b.extend_from_slice(&self.round().bytes());
        match self {
            BallotFact::Init(f) => b.extend_from_slice(f.previous_block.as_bytes()),
            BallotFact::Proposal(f) => {
                b.extend_from_slice(f.proposer.bytes());
                for h in f.operations.iter().chain(f.seals.iter()) {
                    b.extend_from_slice(h.as_bytes());
                }
            }
            BallotFact::Sign(SignFact { proposal, new_block, .. })
            | BallotFact::Accept(AcceptFact { proposal, new_block, .. }) => {
                b.extend_from_slice(proposal.as_bytes());
                b.extend_from_slice(new_block.as_bytes());
            }
        }
        b
    }

    pub fn hash(&self) -> Hash {
        Hash::sha256(&self.bytes())
    }

    /// `(proposal, new_block)` for SIGN and ACCEPT facts.
    pub fn new_block(&self) -> Option<(Hash, Hash)> {
        match self {
            BallotFact::Sign(f) => Some((f.proposal, f.new_block)),
            BallotFact::Accept(f) => Some((f.proposal, f.new_block)),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> Result<()> {
        self.height().is_valid()?;
        if self.height() < Height::GENESIS {
            return Err(TesseraError::Invalid("ballot for pre-genesis height".into()));
        }
        if let BallotFact::Proposal(p) = self {
            p.proposer.is_valid()?;
            let mut seen = std::collections::HashSet::new();
            if !p.operations.iter().all(|h| seen.insert(*h)) {
                return Err(TesseraError::Invalid("duplicated operation in proposal".into()));
            }
        }
        Ok(())
    }
}

fn hint_type(stage: Stage) -> &'static str {
    match stage {
        Stage::Init => hint::INIT_BALLOT_TYPE,
        Stage::Proposal => hint::PROPOSAL_TYPE,
        Stage::Sign => hint::SIGN_BALLOT_TYPE,
        Stage::Accept => hint::ACCEPT_BALLOT_TYPE,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub hint: Hint,
    pub node: Address,
    pub fact: BallotFact,
    pub fact_sign: FactSign,
    /// INIT: voteproof that moved the node here. PROPOSAL and ACCEPT: the
    /// INIT majority of the same round.
    pub voteproof: Option<Voteproof>,
    /// INIT only: ACCEPT majority of the previous height.
    pub accept_voteproof: Option<Voteproof>,
    pub header: SealHeader,
}

impl Ballot {
    pub fn new(
        node: Address,
        fact: BallotFact,
        voteproof: Option<Voteproof>,
        accept_voteproof: Option<Voteproof>,
        privatekey: &Privatekey,
        network_id: &NetworkId,
    ) -> Result<Self> {
        let fact_sign = FactSign::new(privatekey, &fact.hash(), network_id)?;
        let payload = Self::payload(&node, &fact, &fact_sign, voteproof.as_ref(), accept_voteproof.as_ref());
        let header = SealHeader::sign(privatekey, &payload, network_id)?;
        Ok(Ballot {
            hint: Hint::new(hint_type(fact.stage()), V0_0_1),
            node,
            fact,
            fact_sign,
            voteproof,
            accept_voteproof,
            header,
        })
    }

    fn payload(
        node: &Address,
        fact: &BallotFact,
        fact_sign: &FactSign,
        voteproof: Option<&Voteproof>,
        accept_voteproof: Option<&Voteproof>,
    ) -> Vec<u8> {
        let vp = |v: Option<&Voteproof>| v.map(|v| [vec![1u8], v.bytes()].concat()).unwrap_or_else(|| vec![0u8]);
        concat_bytes(&[
            node.bytes(),
            &fact.bytes(),
            &fact_sign.bytes(),
            &vp(voteproof),
            &vp(accept_voteproof),
        ])
    }

    pub fn height(&self) -> Height {
        self.fact.height()
    }

    pub fn round(&self) -> Round {
        self.fact.round()
    }

    pub fn stage(&self) -> Stage {
        self.fact.stage()
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn fact_hash(&self) -> Hash {
        self.fact.hash()
    }

    pub fn signer(&self) -> &Publickey {
        &self.header.signer
    }

    pub fn proposal_fact(&self) -> Option<&ProposalFact> {
        match &self.fact {
            BallotFact::Proposal(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        Hint::new(hint_type(self.stage()), V0_0_1).is_compatible(&self.hint)?;
        self.node.is_valid()?;
        self.fact.is_valid()?;

        if self.fact_sign.signer != self.header.signer {
            return Err(TesseraError::Invalid("fact signer differs from seal signer".into()));
        }
        self.fact_sign.is_valid(&self.fact_hash(), network_id)?;

        let payload = Self::payload(
            &self.node,
            &self.fact,
            &self.fact_sign,
            self.voteproof.as_ref(),
            self.accept_voteproof.as_ref(),
        );
        self.header.is_valid(&payload, network_id)?;

        self.check_voteproofs()?;
        if let Some(vp) = &self.voteproof {
            vp.is_valid(network_id)?;
        }
        if let Some(vp) = &self.accept_voteproof {
            vp.is_valid(network_id)?;
        }
        Ok(())
    }

    fn check_voteproofs(&self) -> Result<()> {
        let (h, r) = (self.height(), self.round());
        match &self.fact {
            BallotFact::Init(f) => {
                if h == Height::GENESIS && r == Round(0) && self.voteproof.is_none() {
                    return Ok(());
                }
                let vp = self
                    .voteproof
                    .as_ref()
                    .ok_or_else(|| TesseraError::Invalid("init ballot without voteproof".into()))?;
                check_init_voteproof(h, r, vp)?;

                if h > Height::GENESIS {
                    let avp = self
                        .accept_voteproof
                        .as_ref()
                        .ok_or_else(|| TesseraError::Invalid("init ballot without accept voteproof".into()))?;
                    if avp.stage != Stage::Accept || !avp.is_majority() || avp.height != h.prev() {
                        return Err(TesseraError::Invalid(format!(
                            "init ballot needs accept majority of height {}",
                            h.prev()
                        )));
                    }
                    let previous = avp.majority.as_ref().and_then(|m| m.new_block()).map(|(_, b)| b);
                    if previous != Some(f.previous_block) {
                        return Err(TesseraError::Invalid("init ballot previous block differs from accept voteproof".into()));
                    }
                }
                Ok(())
            }
            BallotFact::Proposal(p) => {
                if p.proposer != self.node {
                    return Err(TesseraError::Invalid("proposal node is not its proposer".into()));
                }
                check_round_init_voteproof(h, r, self.voteproof.as_ref())
            }
            BallotFact::Sign(_) => Ok(()),
            BallotFact::Accept(_) => check_round_init_voteproof(h, r, self.voteproof.as_ref()),
        }
    }
}

fn check_init_voteproof(h: Height, r: Round, vp: &Voteproof) -> Result<()> {
    match vp.stage {
        Stage::Init => {
            if vp.height != h || r != vp.round.next() {
                return Err(TesseraError::Invalid(format!(
                    "init voteproof {}/{} does not lead to {h}/{r}",
                    vp.height, vp.round
                )));
            }
        }
        Stage::Accept if vp.result == VoteResult::Draw => {
            if vp.height != h || r == Round(0) || r != vp.round.next() {
                return Err(TesseraError::Invalid(format!(
                    "draw accept voteproof {}/{} does not lead to {h}/{r}",
                    vp.height, vp.round
                )));
            }
        }
        Stage::Accept => {
            if h != vp.height.next() {
                return Err(TesseraError::Invalid(format!(
                    "accept voteproof of {} does not lead to height {h}",
                    vp.height
                )));
            }
        }
        other => {
            return Err(TesseraError::Invalid(format!("{other} voteproof can not open a round")));
        }
    }
    Ok(())
}

fn check_round_init_voteproof(h: Height, r: Round, vp: Option<&Voteproof>) -> Result<()> {
    let vp = vp.ok_or_else(|| TesseraError::Invalid("ballot without init voteproof".into()))?;
    if vp.stage != Stage::Init || !vp.is_majority() || vp.height != h || vp.round != r {
        return Err(TesseraError::Invalid(format!(
            "ballot {h}/{r} needs the init majority of its round, got {} {}/{}/{}",
            vp.result, vp.height, vp.round, vp.stage
        )));
    }
    Ok(())
}

impl Hinted for Ballot {
    fn hint(&self) -> &Hint {
        &self.hint
    }
}
