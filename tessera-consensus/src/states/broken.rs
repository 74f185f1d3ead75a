//! Terminal state. The node stops voting and reports why.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use tessera_common::error::{Result, TesseraError};

use super::{Context, StateHandler, StateKind, StateSwitch};

pub struct BrokenHandler {
    ctx: Arc<Context>,
}

impl BrokenHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StateHandler for BrokenHandler {
    fn kind(&self) -> StateKind {
        StateKind::Broken
    }

    async fn enter(&mut self, switch: &StateSwitch) -> Result<()> {
        let reason = switch.reason.clone().unwrap_or_else(|| "unknown".into());
        error!(target: "states", from = %switch.from, reason = %reason, "node is broken");
        self.ctx.timers.stop_all();
        // the receiver may be gone during shutdown
        let _ = self.ctx.errors.try_send(TesseraError::ConsensusBroken(reason));
        Ok(())
    }
}
