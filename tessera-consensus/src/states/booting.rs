//! First state: checks local storage before taking part in consensus.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use tessera_common::env::Height;
use tessera_common::error::{Result, TesseraError};

use super::{Context, StateHandler, StateKind, StateSwitch};
use crate::hooks;

pub struct BootingHandler {
    ctx: Arc<Context>,
}

impl BootingHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn check_suffrage(&self) -> Result<()> {
        let nodes = self.ctx.suffrage.nodes();
        if nodes.is_empty() {
            return Err(broken("suffrage has no nodes"));
        }
        if let Some(unknown) = nodes.iter().find(|n| !self.ctx.nodepool.contains(n)) {
            return Err(broken(format!("suffrage node {unknown} missing from the node pool")));
        }
        Ok(())
    }

    /// Loads the last block and checks it links to its parent and that the
    /// chain starts at genesis.
    fn check_chain(&self) -> Result<bool> {
        let storage = &self.ctx.storage;
        let Some(block) = storage.last_block().map_err(storage_broken)? else {
            info!(target: "states", "storage is empty; joining without a block");
            return Ok(false);
        };
        block
            .is_valid(&self.ctx.network_id())
            .map_err(|e| broken(format!("last block is invalid: {e}")))?;

        let genesis = storage
            .manifest_by_height(Height::GENESIS)
            .map_err(storage_broken)?
            .ok_or_else(|| broken("genesis manifest missing"))?;
        if genesis.height != Height::GENESIS {
            return Err(broken("genesis manifest has wrong height"));
        }

        if block.height() > Height::GENESIS {
            let parent = storage
                .manifest_by_height(block.height().prev())
                .map_err(storage_broken)?
                .ok_or_else(|| broken(format!("manifest {} missing", block.height().prev())))?;
            block
                .manifest
                .is_next_of(&parent)
                .map_err(|e| broken(format!("last block does not follow its parent: {e}")))?;
        }

        if let Some(policy) = hooks::stored_policy(storage.as_ref()).map_err(hooks::policy_error)? {
            hooks::apply_policy(&self.ctx, policy)?;
        }
        self.ctx.state.set_last_block(&block);
        info!(
            target: "states",
            height = %block.height(),
            block = %block.hash(),
            "local chain loaded"
        );
        Ok(true)
    }
}

fn broken(msg: impl Into<String>) -> TesseraError {
    TesseraError::ConsensusBroken(msg.into())
}

fn storage_broken(e: TesseraError) -> TesseraError {
    broken(format!("reading storage: {e}"))
}

#[async_trait]
impl StateHandler for BootingHandler {
    fn kind(&self) -> StateKind {
        StateKind::Booting
    }

    async fn enter(&mut self, _switch: &StateSwitch) -> Result<()> {
        self.check_suffrage()?;
        self.check_chain()?;
        self.ctx.switch(StateKind::Joining, None)
    }
}
