//! Fixtures shared by unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use tessera_common::crypto::{Hash, Privatekey};
use tessera_common::encoding::{EncoderKind, Encoders};
use tessera_common::env::{
    AcceptFact, BallotFact, ConsensusPolicy, FactSign, Height, InitFact, KvSetFact, NetworkId, Operation, OperationFact,
    Round, SignFact, ThresholdRatio, VoteResult, Voteproof, VoteproofVote,
};
use tessera_common::utils::{time, Address};
use tessera_ledger::Storage;
use tessera_p2p::InMemoryNetwork;

use crate::local::{LocalNode, NodePool};
use crate::orchestrator::{States, StatesConfig};
use crate::policy::{LocalPolicy, TimerPolicy};
use crate::processor::operations::OperationProcessors;
use crate::suffrage::RoundrobinSuffrage;

pub(crate) fn net() -> NetworkId {
    NetworkId::new("consensus-test")
}

pub(crate) fn hash(s: &str) -> Hash {
    Hash::sha256(s.as_bytes())
}

/// `n0`, `n1`, ... with fresh keys.
pub(crate) fn nodes(n: usize) -> Vec<LocalNode> {
    (0..n)
        .map(|i| LocalNode::new(Address::from(format!("n{i}").as_str()), Privatekey::new_btc()))
        .collect()
}

pub(crate) fn policy() -> LocalPolicy {
    let timers = TimerPolicy {
        timeout_waiting_proposal: 300,
        interval_broadcasting_init_ballot: 100,
        interval_broadcasting_proposal: 100,
        wait_broadcasting_accept_ballot: 50,
        interval_broadcasting_accept_ballot: 100,
        ..Default::default()
    };
    LocalPolicy { network_id: net(), consensus: ConsensusPolicy::default(), timers }
}

/// Voteproof where every node in `voters` voted `fact`.
pub(crate) fn voteproof(fact: BallotFact, voters: &[LocalNode]) -> Voteproof {
    let mut votes = BTreeMap::new();
    for n in voters {
        let sign = FactSign::new(&n.privatekey, &fact.hash(), &net()).unwrap();
        votes.insert(n.address.clone(), VoteproofVote { fact: fact.hash(), sign });
    }
    let mut facts = BTreeMap::new();
    facts.insert(fact.hash(), fact.clone());
    Voteproof {
        hint: Voteproof::new_hint(),
        height: fact.height(),
        round: fact.round(),
        stage: fact.stage(),
        result: VoteResult::Majority,
        majority: Some(fact),
        facts,
        votes,
        suffrages: voters.iter().map(|n| n.address.clone()).collect(),
        threshold_ratio: ThresholdRatio::DEFAULT,
        finished_at: time::utc_now(),
        closed: false,
    }
}

pub(crate) fn init_voteproof(voters: &[LocalNode], height: Height, round: Round) -> Voteproof {
    voteproof(BallotFact::Init(InitFact { height, round, previous_block: hash("prev") }), voters)
}

pub(crate) fn sign_voteproof(voters: &[LocalNode], height: Height, round: Round, proposal: Hash, new_block: Hash) -> Voteproof {
    voteproof(BallotFact::Sign(SignFact { height, round, proposal, new_block }), voters)
}

pub(crate) fn accept_voteproof(
    voters: &[LocalNode],
    height: Height,
    round: Round,
    proposal: Hash,
    new_block: Hash,
) -> Voteproof {
    voteproof(BallotFact::Accept(AcceptFact { height, round, proposal, new_block }), voters)
}

pub(crate) fn kv_operation(node: &LocalNode, token: &str, key: &str, value: &str) -> Operation {
    let fact = OperationFact::KvSet(KvSetFact::new(token, key, value).unwrap());
    Operation::new(fact, &node.privatekey, &net()).unwrap()
}

/// Orchestrator of `node` as the only validator, not yet running.
pub(crate) fn single_node_states(node: &LocalNode, storage: Arc<dyn Storage>) -> States {
    let network = InMemoryNetwork::new();
    let (transport, _inbound) = network.join(node.address.clone());
    let config = StatesConfig {
        nodepool: NodePool::new([(node.address.clone(), node.publickey())]).unwrap(),
        suffrage: Arc::new(RoundrobinSuffrage::new(vec![node.address.clone()], 1).unwrap()),
        operations: OperationProcessors::with_defaults([node.publickey()]).unwrap(),
        local: node.clone(),
        policy: policy(),
        storage,
        transport: Arc::new(transport),
        encoders: Encoders::new(EncoderKind::Bincode),
    };
    States::new(config).unwrap().0
}
