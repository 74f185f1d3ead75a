//! Takes part in rounds: INIT → PROPOSAL → SIGN → ACCEPT, one height at a
//! time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use tessera_common::crypto::Hash;
use tessera_common::env::{
    AcceptFact, Ballot, BallotFact, Block, Height, InitFact, ProposalFact, Round, Seal, SignFact, Stage, Threshold,
    Voteproof,
};
use tessera_common::error::{Result, TesseraError};

use super::{Context, PendingBallot, StateHandler, StateKind, StateSwitch};
use crate::timers::TimerId;

const ROUND_TIMERS: [TimerId; 3] = [TimerId::BroadcastInit, TimerId::BroadcastProposal, TimerId::BroadcastAccept];

/// The round the node is voting in, opened by an INIT majority.
#[derive(Debug)]
struct RoundState {
    height: Height,
    round: Round,
    ivp: Voteproof,
    /// Proposal fact hash and candidate block hash.
    processed: Option<(Hash, Hash)>,
}

impl RoundState {
    fn is(&self, height: Height, round: Round) -> bool {
        self.height == height && self.round == round
    }
}

pub struct ConsensusHandler {
    ctx: Arc<Context>,
    current: Option<RoundState>,
    /// INIT ballot sent by the `BroadcastInit` timer.
    init: Option<PendingBallot>,
    /// Highest round joined because enough peers were already voting there.
    followed: Option<(Height, Round)>,
    proposal: Option<Ballot>,
    accept: Option<PendingBallot>,
}

impl ConsensusHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, current: None, init: None, followed: None, proposal: None, accept: None }
    }

    fn reset(&mut self) {
        self.ctx.stop_timers(&ROUND_TIMERS);
        self.current = None;
        self.init = None;
        self.followed = None;
        self.proposal = None;
        self.accept = None;
    }

    /// Schedules INIT(height, round) backed by `vp`, first sent after `delay`.
    fn schedule_init(&mut self, height: Height, round: Round, vp: Voteproof, delay: Duration) -> Result<()> {
        let snap = self.ctx.state.snapshot();
        let previous = snap.last_manifest.as_ref().map_or_else(Hash::zero, |m| m.hash);
        let avp = if height > Height::GENESIS {
            let avp = snap
                .last_accept_voteproof
                .filter(|a| a.height == height.prev())
                .ok_or_else(|| TesseraError::NotFound(format!("accept voteproof of height {}", height.prev())))?;
            Some(avp)
        } else {
            None
        };
        let fact = BallotFact::Init(InitFact { height, round, previous_block: previous });
        self.init = Some(PendingBallot::new(fact, Some(vp), avp));
        let policy = self.ctx.policy();
        self.ctx.timers.start(TimerId::BroadcastInit, delay, policy.interval_broadcasting_init());
        Ok(())
    }

    async fn on_init_majority(&mut self, ivp: &Voteproof) -> Result<()> {
        self.reset();
        let (height, round) = (ivp.height, ivp.round);
        let acting = self.ctx.suffrage.acting(height, round);
        info!(
            target: "consensus",
            height = %height,
            round = %round,
            proposer = %acting.proposer,
            "round started"
        );
        self.current = Some(RoundState { height, round, ivp: ivp.clone(), processed: None });

        // moves to the next round unless the proposal shows up in time
        let timeout = self.ctx.policy().timeout_waiting_proposal();
        self.schedule_init(height, round.next(), ivp.clone(), timeout)?;

        if acting.proposer == self.ctx.local.address {
            self.propose(ivp).await
        } else if let Some(hash) = self.ctx.proposals.find(height, round) {
            self.process_proposal(hash).await
        } else {
            Ok(())
        }
    }

    async fn propose(&mut self, ivp: &Voteproof) -> Result<()> {
        let policy = self.ctx.policy();
        let ops = self.ctx.storage.staged_operations(policy.max_operations_in_proposal())?;
        let fact = BallotFact::Proposal(ProposalFact {
            height: ivp.height,
            round: ivp.round,
            proposer: self.ctx.local.address.clone(),
            operations: ops.iter().map(|op| op.hash).collect(),
            seals: vec![],
        });
        let ballot = self.ctx.sign_ballot(fact, Some(ivp.clone()), None)?;
        self.ctx.storage.new_proposal(&ballot)?;
        info!(
            target: "consensus",
            height = %ivp.height,
            round = %ivp.round,
            proposal = %ballot.fact_hash(),
            operations = ops.len(),
            "proposal created"
        );
        self.proposal = Some(ballot.clone());
        self.ctx.broadcast(ballot).await?;
        let interval = policy.interval_broadcasting_proposal();
        self.ctx.timers.start(TimerId::BroadcastProposal, interval, interval);
        Ok(())
    }

    async fn process_proposal(&mut self, proposal: Hash) -> Result<()> {
        let Some(rs) = self.current.as_ref() else { return Ok(()) };
        if rs.processed.is_some() {
            return Ok(());
        }
        let (height, round, ivp) = (rs.height, rs.round, rs.ivp.clone());

        let block = match self.ctx.processor.process_init(&proposal, &ivp).await {
            Ok(block) => block,
            Err(e) if e.is_storage() || e.is_broken() => return Err(e),
            Err(e) => {
                warn!(
                    target: "consensus",
                    height = %height,
                    round = %round,
                    proposal = %proposal,
                    error = %e,
                    "proposal not processed"
                );
                return Ok(());
            }
        };
        if let Some(rs) = self.current.as_mut().filter(|rs| rs.is(height, round)) {
            rs.processed = Some((proposal, block.hash()));
        } else {
            return Ok(());
        }

        // give the round a fresh deadline now that the proposal is known
        let timeout = self.ctx.policy().timeout_waiting_proposal();
        self.schedule_init(height, round.next(), ivp.clone(), timeout)?;

        if self.ctx.suffrage.is_acting(height, round, &self.ctx.local.address) {
            let fact = BallotFact::Sign(SignFact { height, round, proposal, new_block: block.hash() });
            let ballot = self.ctx.sign_ballot(fact, None, None)?;
            debug!(target: "consensus", height = %height, round = %round, block = %block.hash(), "signing block");
            self.ctx.broadcast(ballot).await?;
        }
        Ok(())
    }

    fn on_sign_majority(&mut self, svp: &Voteproof) -> Result<()> {
        let Some(rs) = self.current.as_ref().filter(|rs| rs.is(svp.height, svp.round)) else {
            return Ok(());
        };
        let Some((proposal, block)) = rs.processed else {
            debug!(target: "consensus", height = %svp.height, round = %svp.round, "sign majority before processing");
            return Ok(());
        };
        let agreed = svp.majority.as_ref().and_then(|m| m.new_block());
        if agreed != Some((proposal, block)) {
            warn!(
                target: "consensus",
                height = %svp.height,
                round = %svp.round,
                block = %block,
                "sign majority agreed on another block"
            );
            return Ok(());
        }

        let fact = BallotFact::Accept(AcceptFact { height: svp.height, round: svp.round, proposal, new_block: block });
        self.accept = Some(PendingBallot::new(fact, Some(rs.ivp.clone()), None));
        let policy = self.ctx.policy();
        self.ctx.timers.stop(TimerId::BroadcastProposal);
        self.ctx.timers.start(
            TimerId::BroadcastAccept,
            policy.wait_broadcasting_accept(),
            policy.interval_broadcasting_accept(),
        );
        let deadline = policy.wait_broadcasting_accept() + policy.timeout_waiting_proposal();
        let ivp = rs.ivp.clone();
        self.schedule_init(svp.height, svp.round.next(), ivp, deadline)
    }

    async fn on_accept_majority(&mut self, avp: &Voteproof) -> Result<()> {
        let Some((proposal, _)) = avp.majority.as_ref().and_then(|m| m.new_block()) else {
            return Err(TesseraError::Invalid("accept majority without a block".into()));
        };

        // the round may have been missed; process from the known INIT majority
        if self.ctx.processor.candidate(&proposal).is_none() {
            if let Some(ivp) = self.ctx.ballotbox.voteproof(avp.height, avp.round, Stage::Init) {
                if ivp.is_majority() {
                    if let Err(e) = self.ctx.processor.process_init(&proposal, &ivp).await {
                        debug!(target: "consensus", proposal = %proposal, error = %e, "late processing failed");
                    }
                }
            }
        }

        match self.ctx.processor.process_accept(&proposal, avp) {
            Ok(block) => {
                self.reset();
                self.ctx.block_saved(block)
            }
            Err(e) if e.is_storage() => Err(e),
            Err(e) => {
                warn!(
                    target: "consensus",
                    height = %avp.height,
                    round = %avp.round,
                    error = %e,
                    "accepted block unavailable locally; syncing"
                );
                self.ctx.switch(StateKind::Syncing, Some(avp.clone()))
            }
        }
    }

    /// Opens the next height after a block agreed by `avp`.
    fn start_next_height(&mut self, avp: &Voteproof) -> Result<()> {
        self.reset();
        self.schedule_init(avp.height.next(), Round(0), avp.clone(), Duration::ZERO)
    }

    async fn on_draw(&mut self, vp: &Voteproof) -> Result<()> {
        let base = match vp.stage {
            Stage::Sign => match self.current.as_ref().filter(|rs| rs.is(vp.height, vp.round)) {
                Some(rs) => rs.ivp.clone(),
                None => return Ok(()),
            },
            _ => vp.clone(),
        };
        info!(target: "consensus", height = %vp.height, round = %vp.round, stage = %vp.stage, "draw; next round");
        self.reset();
        self.schedule_init(vp.height, vp.round.next(), base, Duration::ZERO)
    }

    /// Joins a higher round once enough peers are already voting there that
    /// the current round can no longer reach a majority.
    fn follow_round(&mut self, ballot: &Ballot) -> Result<()> {
        let Some(rs) = self.current.as_ref() else { return Ok(()) };
        let (height, round) = (ballot.height(), ballot.round());
        if height != rs.height || round <= rs.round {
            return Ok(());
        }
        if self.followed.is_some_and(|(h, r)| h == height && r >= round) {
            return Ok(());
        }
        let BallotFact::Init(fact) = &ballot.fact else { return Ok(()) };
        let last = self.ctx.state.snapshot().last_manifest.map_or_else(Hash::zero, |m| m.hash);
        if fact.previous_block != last {
            return Ok(());
        }
        let Some(vp) = ballot.voteproof.clone() else { return Ok(()) };

        let total = self.ctx.suffrage.nodes().len();
        let threshold = Threshold::new(total, self.ctx.policy().threshold()).threshold;
        let needed = total.saturating_sub(threshold) + 1;
        if self.ctx.ballotbox.count(height, round, Stage::Init) < needed {
            return Ok(());
        }

        info!(target: "consensus", height = %height, from = %rs.round, to = %round, "following peers to a higher round");
        self.ctx.stop_timers(&[TimerId::BroadcastProposal, TimerId::BroadcastAccept]);
        self.accept = None;
        self.proposal = None;
        self.followed = Some((height, round));
        self.init = Some(PendingBallot::new(
            BallotFact::Init(fact.clone()),
            Some(vp),
            ballot.accept_voteproof.clone(),
        ));
        let interval = self.ctx.policy().interval_broadcasting_init();
        self.ctx.timers.start(TimerId::BroadcastInit, Duration::ZERO, interval);
        Ok(())
    }
}

#[async_trait]
impl StateHandler for ConsensusHandler {
    fn kind(&self) -> StateKind {
        StateKind::Consensus
    }

    async fn enter(&mut self, switch: &StateSwitch) -> Result<()> {
        self.reset();
        let vp = switch
            .voteproof
            .clone()
            .ok_or_else(|| TesseraError::Invalid("consensus entered without a voteproof".into()))?;
        info!(target: "states", height = %vp.height, round = %vp.round, stage = %vp.stage, "entering consensus");
        self.new_voteproof(&vp).await
    }

    async fn exit(&mut self) -> Result<()> {
        self.reset();
        Ok(())
    }

    async fn new_seal(&mut self, seal: &Seal) -> Result<()> {
        let Some(ballot) = seal.as_ballot() else { return Ok(()) };
        match ballot.stage() {
            Stage::Proposal => {
                let current = self.current.as_ref().is_some_and(|rs| rs.is(ballot.height(), ballot.round()));
                if current {
                    self.process_proposal(ballot.fact_hash()).await?;
                }
                Ok(())
            }
            Stage::Init => self.follow_round(ballot),
            _ => Ok(()),
        }
    }

    async fn new_voteproof(&mut self, vp: &Voteproof) -> Result<()> {
        let local = self.ctx.state.last_height();
        let expected = local.next();
        if vp.height > expected {
            return self.ctx.switch(StateKind::Syncing, Some(vp.clone()));
        }

        if vp.height == expected {
            if !vp.is_majority() {
                return self.on_draw(vp).await;
            }
            return match vp.stage {
                Stage::Init => self.on_init_majority(vp).await,
                Stage::Sign => self.on_sign_majority(vp),
                Stage::Accept => self.on_accept_majority(vp).await,
                Stage::Proposal => Ok(()),
            };
        }

        if vp.height == local && vp.stage == Stage::Accept && vp.is_majority() && self.current.is_none() {
            return self.start_next_height(vp);
        }
        debug!(target: "consensus", height = %vp.height, round = %vp.round, stage = %vp.stage, "stale voteproof");
        Ok(())
    }

    async fn new_block_saved(&mut self, block: &Block) -> Result<()> {
        let avp = block
            .consensus
            .accept_voteproof
            .clone()
            .ok_or_else(|| TesseraError::Invalid(format!("block {} saved without accept voteproof", block.height())))?;
        self.start_next_height(&avp)
    }

    async fn on_timer(&mut self, id: TimerId) -> Result<()> {
        let ballot = match id {
            TimerId::BroadcastInit => match self.init.as_mut() {
                Some(p) => p.ballot(&self.ctx)?,
                None => return Ok(()),
            },
            TimerId::BroadcastAccept => match self.accept.as_mut() {
                Some(p) => p.ballot(&self.ctx)?,
                None => return Ok(()),
            },
            TimerId::BroadcastProposal => match &self.proposal {
                Some(b) => b.clone(),
                None => return Ok(()),
            },
            TimerId::JoiningInit => return Ok(()),
        };
        self.ctx.broadcast(ballot).await
    }
}
