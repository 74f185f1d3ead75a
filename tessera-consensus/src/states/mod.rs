//! Node states and what they share.
//!
//! Exactly one [`StateHandler`] is active. Handlers never call each other or
//! the orchestrator directly: they push a [`Request`] and the orchestrator
//! acts on it after the handler returns.

pub mod booting;
pub mod broken;
pub mod consensus;
pub mod joining;
pub mod syncing;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use tessera_common::crypto::Hash;
use tessera_common::encoding::Encoders;
use tessera_common::env::{Ballot, BallotFact, Block, Height, NetworkId, Round, Seal, Voteproof};
use tessera_common::error::{Result, TesseraError};
use tessera_common::utils::time;
use tessera_ledger::Storage;
use tessera_p2p::Transport;

use crate::ballotbox::Ballotbox;
use crate::local::{LocalNode, LocalState, NodePool};
use crate::policy::LocalPolicy;
use crate::processor::ProposalProcessor;
use crate::suffrage::Suffrage;
use crate::syncer::Syncer;
use crate::timers::{TimerId, Timers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Booting,
    Joining,
    Consensus,
    Syncing,
    Broken,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateKind::Booting => "BOOTING",
            StateKind::Joining => "JOINING",
            StateKind::Consensus => "CONSENSUS",
            StateKind::Syncing => "SYNCING",
            StateKind::Broken => "BROKEN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct StateSwitch {
    pub from: StateKind,
    pub to: StateKind,
    /// Voteproof that caused the switch, handed to the new state.
    pub voteproof: Option<Voteproof>,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub enum SyncEvent {
    Finished(Height),
    Failed(TesseraError),
}

#[derive(Debug)]
pub enum Request {
    Switch(StateSwitch),
    BlockSaved(Box<Block>),
    Sync(SyncEvent),
}

#[async_trait]
pub trait StateHandler: Send {
    fn kind(&self) -> StateKind;

    async fn enter(&mut self, switch: &StateSwitch) -> Result<()>;

    async fn exit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn new_seal(&mut self, _seal: &Seal) -> Result<()> {
        Ok(())
    }

    async fn new_voteproof(&mut self, _vp: &Voteproof) -> Result<()> {
        Ok(())
    }

    async fn new_block_saved(&mut self, _block: &Block) -> Result<()> {
        Ok(())
    }

    async fn on_timer(&mut self, _id: TimerId) -> Result<()> {
        Ok(())
    }

    async fn on_sync(&mut self, _event: SyncEvent) -> Result<()> {
        Ok(())
    }
}

/// Proposal fact hashes seen per `(height, round)`, so a node entering a
/// round late still finds the proposal it already received.
#[derive(Debug, Default)]
pub struct ProposalIndex {
    inner: Mutex<BTreeMap<(Height, Round), Hash>>,
}

impl ProposalIndex {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(Height, Round), Hash>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, proposal: &Ballot) {
        self.lock()
            .entry((proposal.height(), proposal.round()))
            .or_insert_with(|| proposal.fact_hash());
    }

    pub fn find(&self, height: Height, round: Round) -> Option<Hash> {
        self.lock().get(&(height, round)).copied()
    }

    /// Drops entries at or below `height`.
    pub fn prune(&self, height: Height) {
        self.lock().retain(|(h, _), _| *h > height);
    }
}

/// A ballot to be (re)broadcast by a timer. Re-signed once half the valid
/// timespan has passed.
#[derive(Debug, Clone)]
pub struct PendingBallot {
    pub fact: BallotFact,
    pub voteproof: Option<Voteproof>,
    pub accept_voteproof: Option<Voteproof>,
    signed: Option<Ballot>,
}

impl PendingBallot {
    pub fn new(fact: BallotFact, voteproof: Option<Voteproof>, accept_voteproof: Option<Voteproof>) -> Self {
        Self { fact, voteproof, accept_voteproof, signed: None }
    }

    pub fn ballot(&mut self, ctx: &Context) -> Result<Ballot> {
        let span = ctx.policy().timespan_valid_ballot() / 2;
        if let Some(b) = &self.signed {
            if time::within_now(&b.header.signed_at, span) {
                return Ok(b.clone());
            }
        }
        let b = ctx.sign_ballot(self.fact.clone(), self.voteproof.clone(), self.accept_voteproof.clone())?;
        self.signed = Some(b.clone());
        Ok(b)
    }
}

/// Everything a handler may use.
#[derive(Debug)]
pub struct Context {
    pub local: LocalNode,
    pub nodepool: NodePool,
    pub suffrage: Arc<dyn Suffrage>,
    pub state: LocalState,
    pub storage: Arc<dyn Storage>,
    pub transport: Arc<dyn Transport>,
    pub encoders: Encoders,
    pub ballotbox: Arc<Ballotbox>,
    pub processor: Arc<ProposalProcessor>,
    pub syncer: Arc<Syncer>,
    pub timers: Timers,
    pub proposals: ProposalIndex,
    pub(crate) requests: mpsc::Sender<Request>,
    pub(crate) loopback: mpsc::Sender<Seal>,
    pub(crate) errors: mpsc::Sender<TesseraError>,
}

impl Context {
    pub fn policy(&self) -> LocalPolicy {
        self.state.policy()
    }

    pub fn network_id(&self) -> NetworkId {
        self.state.policy().network_id
    }

    pub fn sign_ballot(
        &self,
        fact: BallotFact,
        voteproof: Option<Voteproof>,
        accept_voteproof: Option<Voteproof>,
    ) -> Result<Ballot> {
        Ballot::new(
            self.local.address.clone(),
            fact,
            voteproof,
            accept_voteproof,
            &self.local.privatekey,
            &self.network_id(),
        )
    }

    /// Sends `ballot` to peers and feeds it back into the local seal queue.
    pub async fn broadcast(&self, ballot: Ballot) -> Result<()> {
        let seal = Seal::from(ballot);
        let bytes = self.encoders.encode_seal(&seal)?;
        if let Err(e) = self.transport.broadcast(bytes).await {
            warn!(target: "states", seal = %seal.hash(), error = %e, "broadcast failed");
        }
        if self.loopback.try_send(seal).is_err() {
            warn!(target: "states", "seal queue full; own ballot dropped");
        }
        Ok(())
    }

    fn request(&self, req: Request) -> Result<()> {
        self.requests
            .try_send(req)
            .map_err(|e| TesseraError::ConsensusBroken(format!("state request queue: {e}")))
    }

    pub fn switch(&self, to: StateKind, voteproof: Option<Voteproof>) -> Result<()> {
        self.request(Request::Switch(StateSwitch { from: to, to, voteproof, reason: None }))
    }

    pub fn block_saved(&self, block: Block) -> Result<()> {
        self.request(Request::BlockSaved(Box::new(block)))
    }

    pub(crate) fn requester(&self) -> mpsc::Sender<Request> {
        self.requests.clone()
    }

    pub(crate) fn stop_timers(&self, ids: &[TimerId]) {
        for id in ids {
            self.timers.stop(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tessera_common::env::ProposalFact;

    fn proposal(height: i64, round: u64) -> Ballot {
        let node = testing::nodes(1).remove(0);
        let fact = BallotFact::Proposal(ProposalFact {
            height: Height(height),
            round: Round(round),
            proposer: node.address.clone(),
            operations: vec![],
            seals: vec![],
        });
        let ivp = testing::init_voteproof(std::slice::from_ref(&node), Height(height), Round(round));
        Ballot::new(node.address.clone(), fact, Some(ivp), None, &node.privatekey, &testing::net()).unwrap()
    }

    #[test]
    fn test_proposal_index() {
        let index = ProposalIndex::default();
        let (p1, p2) = (proposal(1, 0), proposal(2, 1));
        index.record(&p1);
        index.record(&p2);
        assert_eq!(index.find(Height(1), Round(0)), Some(p1.fact_hash()));
        assert_eq!(index.find(Height(1), Round(1)), None);

        // the first proposal seen for a round is kept
        index.record(&proposal(1, 0));
        assert_eq!(index.find(Height(1), Round(0)), Some(p1.fact_hash()));

        index.prune(Height(1));
        assert_eq!(index.find(Height(1), Round(0)), None);
        assert_eq!(index.find(Height(2), Round(1)), Some(p2.fact_hash()));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(StateKind::Consensus.to_string(), "CONSENSUS");
        assert_eq!(StateKind::Broken.to_string(), "BROKEN");
    }
}
