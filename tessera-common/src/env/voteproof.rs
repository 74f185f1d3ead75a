use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::Hash;
use crate::env::ballot::BallotFact;
use crate::env::fact::FactSign;
use crate::env::types::{
    find_majority, Height, MajorityOutcome, NetworkId, Round, Stage, Threshold, ThresholdRatio, VoteResult,
};
use crate::error::{Result, TesseraError};
use crate::hint::{self, Hint, Hinted, V0_0_1};
use crate::utils::{time, Address};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteproofVote {
    pub fact: Hash,
    pub sign: FactSign,
}

/// Certificate that a quorum of the suffrage voted at `(height, round, stage)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voteproof {
    pub hint: Hint,
    pub height: Height,
    pub round: Round,
    pub stage: Stage,
    pub result: VoteResult,
    pub majority: Option<BallotFact>,
    pub facts: BTreeMap<Hash, BallotFact>,
    pub votes: BTreeMap<Address, VoteproofVote>,
    /// Voters the threshold was computed over.
    pub suffrages: Vec<Address>,
    pub threshold_ratio: ThresholdRatio,
    pub finished_at: DateTime<Utc>,
    pub closed: bool,
}

impl Voteproof {
    pub fn new_hint() -> Hint {
        Hint::new(hint::VOTEPROOF_TYPE, V0_0_1)
    }

    pub fn is_finished(&self) -> bool {
        self.result != VoteResult::NotYet
    }

    pub fn is_majority(&self) -> bool {
        self.result == VoteResult::Majority
    }

    pub fn majority_hash(&self) -> Option<Hash> {
        self.majority.as_ref().map(|f| f.hash())
    }

    /// Canonical bytes; `closed` is local bookkeeping and left out.
    pub fn bytes(&self) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&self.height.bytes());
        b.extend_from_slice(&self.round.bytes());
        b.push(self.stage.byte());
        b.push(self.result.byte());
        if let Some(h) = self.majority_hash() {
            b.extend_from_slice(h.as_bytes());
        }
        for h in self.facts.keys() {
            b.extend_from_slice(h.as_bytes());
        }
        for (addr, vote) in &self.votes {
            b.extend_from_slice(addr.bytes());
            b.extend_from_slice(vote.fact.as_bytes());
            b.extend_from_slice(&vote.sign.bytes());
        }
        for s in &self.suffrages {
            b.extend_from_slice(s.bytes());
        }
        b.extend_from_slice(&self.threshold_ratio.bytes());
        b.extend_from_slice(&time::rfc3339_bytes(&self.finished_at));
        b
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        Self::new_hint().is_compatible(&self.hint)?;
        self.height.is_valid()?;
        self.threshold_ratio.is_valid()?;

        if !self.stage.can_vote() {
            return Err(TesseraError::Invalid(format!("voteproof for {} stage", self.stage)));
        }
        if !self.is_finished() {
            return Err(TesseraError::Invalid("voteproof is not finished".into()));
        }
        if self.votes.is_empty() {
            return Err(TesseraError::Invalid("voteproof without votes".into()));
        }

        for (h, fact) in &self.facts {
            if &fact.hash() != h {
                return Err(TesseraError::Invalid(format!("voteproof fact {h} hash does not match")));
            }
            if fact.height() != self.height || fact.round() != self.round || fact.stage() != self.stage {
                return Err(TesseraError::Invalid(format!(
                    "voteproof fact {h} belongs to another vote; {}/{}/{}",
                    fact.height(),
                    fact.round(),
                    fact.stage()
                )));
            }
        }

        let suffrages: BTreeSet<&Address> = self.suffrages.iter().collect();
        if suffrages.len() != self.suffrages.len() {
            return Err(TesseraError::Invalid("duplicated node in voteproof suffrages".into()));
        }

        let mut counts: BTreeMap<Hash, usize> = BTreeMap::new();
        for (node, vote) in &self.votes {
            if !suffrages.contains(node) {
                return Err(TesseraError::Invalid(format!("voteproof vote from unknown node {node}")));
            }
            if !self.facts.contains_key(&vote.fact) {
                return Err(TesseraError::Invalid(format!("voteproof vote for unknown fact {}", vote.fact)));
            }
            vote.sign.is_valid(&vote.fact, network_id)?;
            *counts.entry(vote.fact).or_default() += 1;
        }

        let (hashes, tallies): (Vec<Hash>, Vec<usize>) = counts.into_iter().unzip();
        let threshold = Threshold::new(self.suffrages.len(), self.threshold_ratio);
        let (result, majority) = match find_majority(threshold.total, threshold.threshold, &tallies) {
            MajorityOutcome::Found(i) => (VoteResult::Majority, Some(hashes[i])),
            MajorityOutcome::Draw => (VoteResult::Draw, None),
            MajorityOutcome::NotYet => (VoteResult::NotYet, None),
        };

        if result != self.result || majority != self.majority_hash() {
            return Err(TesseraError::Invalid(format!(
                "voteproof result does not match votes; stored={} derived={result}",
                self.result
            )));
        }
        Ok(())
    }
}

impl Hinted for Voteproof {
    fn hint(&self) -> &Hint {
        &self.hint
    }
}
