//! Collects ballots per `(height, round, stage)` and decides when a quorum
//! is reached.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use tessera_common::crypto::Hash;
use tessera_common::env::types::{find_majority, MajorityOutcome};
use tessera_common::env::{
    Ballot, BallotFact, FactSign, Height, NetworkId, Round, Stage, Threshold, ThresholdRatio, VoteResult, Voteproof,
    VoteproofVote,
};
use tessera_common::error::{Result, TesseraError};
use tessera_common::utils::{time, Address};

use crate::suffrage::Suffrage;

/// Identifies one vote: all ballots of a `(height, round, stage)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VrKey {
    pub height: Height,
    pub round: Round,
    pub stage: Stage,
}

impl VrKey {
    pub fn of(ballot: &Ballot) -> Self {
        Self { height: ballot.height(), round: ballot.round(), stage: ballot.stage() }
    }
}

#[derive(Debug)]
struct Record {
    key: VrKey,
    suffrages: Vec<Address>,
    threshold: Threshold,
    voted: BTreeMap<Address, VoteproofVote>,
    facts: BTreeMap<Hash, BallotFact>,
    result: VoteResult,
    majority: Option<Hash>,
    finished_at: Option<DateTime<Utc>>,
    closed: bool,
}

impl Record {
    fn new(key: VrKey, suffrages: Vec<Address>, ratio: ThresholdRatio) -> Self {
        let threshold = Threshold::new(suffrages.len(), ratio);
        Self {
            key,
            suffrages,
            threshold,
            voted: BTreeMap::new(),
            facts: BTreeMap::new(),
            result: VoteResult::NotYet,
            majority: None,
            finished_at: None,
            closed: false,
        }
    }

    fn is_finished(&self) -> bool {
        self.result != VoteResult::NotYet
    }

    fn insert(&mut self, node: Address, fact: BallotFact, sign: FactSign) {
        let hash = fact.hash();
        self.facts.entry(hash).or_insert(fact);
        self.voted.insert(node, VoteproofVote { fact: hash, sign });
    }

    fn tally(&mut self) {
        let mut counts: BTreeMap<Hash, usize> = BTreeMap::new();
        for vote in self.voted.values() {
            *counts.entry(vote.fact).or_default() += 1;
        }
        let (hashes, tallies): (Vec<Hash>, Vec<usize>) = counts.into_iter().unzip();
        match find_majority(self.threshold.total, self.threshold.threshold, &tallies) {
            MajorityOutcome::Found(i) => {
                self.result = VoteResult::Majority;
                self.majority = Some(hashes[i]);
            }
            MajorityOutcome::Draw => self.result = VoteResult::Draw,
            MajorityOutcome::NotYet => return,
        }
        self.finished_at = Some(time::utc_now());
    }

    fn voteproof(&self) -> Voteproof {
        Voteproof {
            hint: Voteproof::new_hint(),
            height: self.key.height,
            round: self.key.round,
            stage: self.key.stage,
            result: self.result,
            majority: self.majority.and_then(|h| self.facts.get(&h).cloned()),
            facts: self.facts.clone(),
            votes: self.voted.clone(),
            suffrages: self.suffrages.clone(),
            threshold_ratio: self.threshold.ratio,
            finished_at: self.finished_at.unwrap_or_else(time::utc_now),
            closed: self.closed,
        }
    }
}

/// What a vote did to its record.
#[derive(Debug, Clone)]
pub struct VoteOutcome {
    /// Current state of the vote; `result` may still be `NotYet`.
    pub voteproof: Voteproof,
    /// True only for the vote that finished the record.
    pub finished_now: bool,
}

impl VoteOutcome {
    pub fn finished(&self) -> Option<&Voteproof> {
        self.finished_now.then_some(&self.voteproof)
    }
}

#[derive(Debug)]
pub struct Ballotbox {
    network_id: NetworkId,
    suffrage: Arc<dyn Suffrage>,
    threshold_ratio: Mutex<ThresholdRatio>,
    records: Mutex<HashMap<VrKey, Record>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Ballotbox {
    pub fn new(network_id: NetworkId, suffrage: Arc<dyn Suffrage>, threshold_ratio: ThresholdRatio) -> Self {
        Self {
            network_id,
            suffrage,
            threshold_ratio: Mutex::new(threshold_ratio),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Applies to votes that start after the call.
    pub fn set_threshold_ratio(&self, ratio: ThresholdRatio) {
        *lock(&self.threshold_ratio) = ratio;
    }

    /// SIGN is voted by the acting set, INIT and ACCEPT by every validator.
    fn voters(&self, key: &VrKey) -> Vec<Address> {
        match key.stage {
            Stage::Sign => self.suffrage.acting(key.height, key.round).nodes,
            _ => self.suffrage.nodes().to_vec(),
        }
    }

    pub fn vote(&self, ballot: &Ballot) -> Result<VoteOutcome> {
        ballot.is_valid(&self.network_id)?;
        let key = VrKey::of(ballot);
        if !key.stage.can_vote() {
            return Err(TesseraError::Invalid(format!("{} ballots are not voted", key.stage)));
        }

        let voters = self.voters(&key);
        if !voters.contains(&ballot.node) {
            return Err(TesseraError::Invalid(format!(
                "{} is not a voter of {}/{}/{}",
                ballot.node, key.height, key.round, key.stage
            )));
        }

        let ratio = *lock(&self.threshold_ratio);
        let mut records = lock(&self.records);
        let record = records.entry(key).or_insert_with(|| Record::new(key, voters, ratio));

        if record.voted.contains_key(&ballot.node) || record.closed {
            debug!(
                target: "ballotbox",
                height = %key.height, round = %key.round, stage = %key.stage, node = %ballot.node,
                "vote ignored"
            );
            return Ok(VoteOutcome { voteproof: record.voteproof(), finished_now: false });
        }

        if record.is_finished() {
            // kept for the audit trail; the decided result does not change
            record.insert(ballot.node.clone(), ballot.fact.clone(), ballot.fact_sign.clone());
            record.closed = true;
            return Ok(VoteOutcome { voteproof: record.voteproof(), finished_now: false });
        }

        record.insert(ballot.node.clone(), ballot.fact.clone(), ballot.fact_sign.clone());
        record.tally();

        let finished_now = record.is_finished();
        if finished_now {
            info!(
                target: "ballotbox",
                height = %key.height, round = %key.round, stage = %key.stage,
                result = %record.result, votes = record.voted.len(), threshold = record.threshold.threshold,
                "voteproof finished"
            );
        }
        Ok(VoteOutcome { voteproof: record.voteproof(), finished_now })
    }

    pub fn voteproof(&self, height: Height, round: Round, stage: Stage) -> Option<Voteproof> {
        lock(&self.records)
            .get(&VrKey { height, round, stage })
            .map(Record::voteproof)
    }

    /// Number of distinct voters seen for the vote.
    pub fn count(&self, height: Height, round: Round, stage: Stage) -> usize {
        lock(&self.records)
            .get(&VrKey { height, round, stage })
            .map_or(0, |r| r.voted.len())
    }

    /// Drops every vote below `height`.
    pub fn clean(&self, height: Height) {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|k, _| k.height >= height);
        let removed = before - records.len();
        if removed > 0 {
            debug!(target: "ballotbox", %height, removed, "ballotbox cleaned");
        }
    }
}
