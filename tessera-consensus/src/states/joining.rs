//! Waits for the network to show where it is, announcing the local height
//! meanwhile.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use tessera_common::env::{BallotFact, InitFact, Round, Stage, Voteproof};
use tessera_common::error::Result;

use super::{Context, PendingBallot, StateHandler, StateKind, StateSwitch};
use crate::timers::TimerId;

pub struct JoiningHandler {
    ctx: Arc<Context>,
    init: Option<PendingBallot>,
}

impl JoiningHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, init: None }
    }

    /// INIT ballot for the height after the last block, justified by that
    /// block's ACCEPT voteproof.
    fn next_init(&self) -> Option<PendingBallot> {
        let snap = self.ctx.state.snapshot();
        let manifest = snap.last_manifest?;
        let avp = snap.last_accept_voteproof.filter(|vp| vp.height == manifest.height)?;
        let fact = BallotFact::Init(InitFact {
            height: manifest.height.next(),
            round: Round(0),
            previous_block: manifest.hash,
        });
        Some(PendingBallot::new(fact, Some(avp.clone()), Some(avp)))
    }
}

#[async_trait]
impl StateHandler for JoiningHandler {
    fn kind(&self) -> StateKind {
        StateKind::Joining
    }

    async fn enter(&mut self, switch: &StateSwitch) -> Result<()> {
        self.init = self.next_init();
        if self.init.is_some() {
            let policy = self.ctx.policy();
            self.ctx.timers.start(
                TimerId::JoiningInit,
                policy.wait_broadcasting_accept(),
                policy.interval_broadcasting_init(),
            );
        }
        info!(target: "states", height = %self.ctx.state.last_height(), "joining the network");

        if let Some(vp) = &switch.voteproof {
            self.new_voteproof(vp).await?;
        }
        Ok(())
    }

    async fn exit(&mut self) -> Result<()> {
        self.ctx.timers.stop(TimerId::JoiningInit);
        self.init = None;
        Ok(())
    }

    async fn new_voteproof(&mut self, vp: &Voteproof) -> Result<()> {
        let local = self.ctx.state.last_height();
        let expected = local.next();

        if vp.height > expected {
            return self.ctx.switch(StateKind::Syncing, Some(vp.clone()));
        }
        if vp.height == expected {
            return match vp.stage {
                Stage::Init => self.ctx.switch(StateKind::Consensus, Some(vp.clone())),
                Stage::Accept if vp.is_majority() => self.ctx.switch(StateKind::Syncing, Some(vp.clone())),
                Stage::Accept => self.ctx.switch(StateKind::Consensus, Some(vp.clone())),
                _ => Ok(()),
            };
        }
        // Below local+1 only an ACCEPT majority confirming the local head is
        // taken. Older voteproofs cannot move a joining node forward, so they
        // are dropped rather than handed to consensus.
        if vp.height == local && vp.stage == Stage::Accept && vp.is_majority() {
            let agreed = vp.majority.as_ref().and_then(|m| m.new_block()).map(|(_, block)| block);
            let last = self.ctx.state.snapshot().last_manifest.map(|m| m.hash);
            if agreed.is_some() && agreed == last {
                return self.ctx.switch(StateKind::Consensus, Some(vp.clone()));
            }
        }
        debug!(
            target: "states",
            height = %vp.height,
            round = %vp.round,
            stage = %vp.stage,
            "voteproof ignored while joining"
        );
        Ok(())
    }

    async fn on_timer(&mut self, id: TimerId) -> Result<()> {
        if id != TimerId::JoiningInit {
            return Ok(());
        }
        if let Some(pending) = self.init.as_mut() {
            let ballot = pending.ballot(&self.ctx)?;
            self.ctx.broadcast(ballot).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::GenesisGenerator;
    use crate::testing;
    use tessera_common::env::Height;
    use tessera_ledger::{MemoryStorage, Storage};

    #[tokio::test]
    async fn test_only_head_accept_taken_below_next_height() {
        let node = testing::nodes(1).remove(0);
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let genesis = GenesisGenerator::new(node.clone(), testing::policy(), storage.clone())
            .generate()
            .await
            .unwrap();
        let states = testing::single_node_states(&node, storage);
        let ctx = states.context();
        ctx.state.set_last_block(&genesis);

        let mut handler = JoiningHandler::new(ctx.clone());
        let free = ctx.requests.capacity();

        let init = testing::init_voteproof(std::slice::from_ref(&node), Height::GENESIS, Round(1));
        handler.new_voteproof(&init).await.unwrap();
        assert_eq!(ctx.requests.capacity(), free);

        let stale = testing::accept_voteproof(
            std::slice::from_ref(&node),
            Height::GENESIS,
            Round(0),
            testing::hash("p"),
            testing::hash("other block"),
        );
        handler.new_voteproof(&stale).await.unwrap();
        assert_eq!(ctx.requests.capacity(), free);

        let head = genesis.consensus.accept_voteproof.clone().unwrap();
        handler.new_voteproof(&head).await.unwrap();
        assert_eq!(ctx.requests.capacity(), free - 1);
    }
}
