//! Callbacks run by the orchestrator after every stored block.

use tracing::info;

use tessera_common::env::{Block, ConsensusPolicy, POLICY_STATE_KEY};
use tessera_common::error::{Result, TesseraError};
use tessera_ledger::Storage;

use crate::policy::LocalPolicy;
use crate::states::Context;

pub trait BlockSavedHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_block_saved(&self, ctx: &Context, block: &Block) -> Result<()>;
}

/// Logs `EVENT:COMMIT` lines, which operators grep for.
pub struct CommitLogHook;

impl BlockSavedHook for CommitLogHook {
    fn name(&self) -> &'static str {
        "commit-log"
    }

    fn on_block_saved(&self, _ctx: &Context, block: &Block) -> Result<()> {
        info!(
            target: "consensus",
            height = %block.height(),
            round = %block.round(),
            block = %block.hash(),
            operations = block.operations.len(),
            "EVENT:COMMIT"
        );
        Ok(())
    }
}

/// Forgets ballots and proposals of heights that are now final.
pub struct BallotboxCleanHook;

impl BlockSavedHook for BallotboxCleanHook {
    fn name(&self) -> &'static str {
        "ballotbox-clean"
    }

    fn on_block_saved(&self, ctx: &Context, block: &Block) -> Result<()> {
        ctx.ballotbox.clean(block.height());
        ctx.proposals.prune(block.height());
        Ok(())
    }
}

/// Picks up a policy changed by a committed set-policy operation.
pub struct PolicyHook;

impl BlockSavedHook for PolicyHook {
    fn name(&self) -> &'static str {
        "policy"
    }

    fn on_block_saved(&self, ctx: &Context, block: &Block) -> Result<()> {
        let Some(st) = block.states.iter().find(|s| s.key == POLICY_STATE_KEY) else {
            return Ok(());
        };
        let policy = ConsensusPolicy::from_bytes(&st.value)?;
        apply_policy(ctx, policy)
    }
}

pub fn default_hooks() -> Vec<Box<dyn BlockSavedHook>> {
    vec![Box::new(CommitLogHook), Box::new(BallotboxCleanHook), Box::new(PolicyHook)]
}

/// Policy recorded in chain state, if any.
pub fn stored_policy(storage: &dyn Storage) -> Result<Option<ConsensusPolicy>> {
    match storage.state(POLICY_STATE_KEY)? {
        Some(st) => ConsensusPolicy::from_bytes(&st.value).map(Some),
        None => Ok(None),
    }
}

/// Makes `policy` effective for voting, acting-set election and proposals.
pub fn apply_policy(ctx: &Context, policy: ConsensusPolicy) -> Result<()> {
    let current = ctx.policy();
    if current.consensus == policy {
        return Ok(());
    }
    let updated = LocalPolicy::new(current.network_id.clone(), policy.clone(), current.timers.clone())?;
    ctx.ballotbox.set_threshold_ratio(policy.threshold);
    ctx.suffrage.set_number_of_acting(policy.number_of_acting_suffrage_nodes as usize);
    ctx.state.set_policy(updated);
    info!(
        target: "consensus",
        threshold = %policy.threshold,
        acting = policy.number_of_acting_suffrage_nodes,
        "network policy updated"
    );
    Ok(())
}

pub(crate) fn policy_error(e: TesseraError) -> TesseraError {
    TesseraError::ConsensusBroken(format!("stored network policy unreadable: {e}"))
}
