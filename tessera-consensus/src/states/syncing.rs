//! Catches up with the network by pulling blocks from peers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tessera_common::env::{Height, Stage, Voteproof};
use tessera_common::error::{Result, TesseraError};

use super::{Context, Request, StateHandler, StateKind, StateSwitch, SyncEvent};
use crate::syncer::WINDOW;

pub struct SyncingHandler {
    ctx: Arc<Context>,
    target: Height,
    task: Option<JoinHandle<()>>,
}

/// Highest height known to be final given `vp`.
pub fn sync_target(vp: &Voteproof) -> Height {
    if vp.stage == Stage::Accept && vp.is_majority() {
        vp.height
    } else {
        vp.height.prev()
    }
}

impl SyncingHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, target: Height::PRE_GENESIS, task: None }
    }

    fn start(&mut self) -> Result<()> {
        let from = self.ctx.state.last_height().next();
        if from > self.target {
            return self.finish();
        }
        let (to, syncer, requests) = (self.target, self.ctx.syncer.clone(), self.ctx.requester());
        info!(target: "states", from = %from, to = %to, "syncing");

        self.task = Some(tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(WINDOW as usize);
            let run = syncer.sync(from, to, tx);
            tokio::pin!(run);
            let result = loop {
                tokio::select! {
                    r = &mut run => break r,
                    Some(block) = rx.recv() => {
                        if requests.send(Request::BlockSaved(Box::new(block))).await.is_err() {
                            return;
                        }
                    }
                }
            };
            while let Ok(block) = rx.try_recv() {
                if requests.send(Request::BlockSaved(Box::new(block))).await.is_err() {
                    return;
                }
            }
            let event = match result {
                Ok(height) => SyncEvent::Finished(height),
                Err(e) => SyncEvent::Failed(e),
            };
            let _ = requests.send(Request::Sync(event)).await;
        }));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.task = None;
        let snap = self.ctx.state.snapshot();
        info!(target: "states", height = %snap.last_height(), "sync done");
        // the latest voteproof tells joining where the network stands
        self.ctx.switch(StateKind::Joining, snap.last_voteproof)
    }
}

#[async_trait]
impl StateHandler for SyncingHandler {
    fn kind(&self) -> StateKind {
        StateKind::Syncing
    }

    async fn enter(&mut self, switch: &StateSwitch) -> Result<()> {
        let vp = switch
            .voteproof
            .as_ref()
            .ok_or_else(|| TesseraError::Invalid("syncing entered without a voteproof".into()))?;
        self.target = sync_target(vp);
        self.start()
    }

    async fn exit(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // blocks the task committed may not have reached the orchestrator yet
        if let Some(block) = self.ctx.storage.last_block()? {
            if block.height() > self.ctx.state.last_height() {
                debug!(target: "states", height = %block.height(), "local state refreshed from storage");
                self.ctx.state.set_last_block(&block);
            }
        }
        Ok(())
    }

    async fn new_voteproof(&mut self, vp: &Voteproof) -> Result<()> {
        let target = sync_target(vp);
        if target > self.target {
            debug!(target: "states", from = %self.target, to = %target, "sync target raised");
            self.target = target;
        }
        Ok(())
    }

    async fn on_sync(&mut self, event: SyncEvent) -> Result<()> {
        match event {
            SyncEvent::Finished(height) => {
                self.task = None;
                if height < self.target {
                    self.start()
                } else {
                    self.finish()
                }
            }
            SyncEvent::Failed(e) => Err(TesseraError::ConsensusBroken(format!("sync failed: {e}"))),
        }
    }
}
