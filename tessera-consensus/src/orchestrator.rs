//! Owns the state handlers and feeds them seals, voteproofs, timer ticks and
//! saved blocks, one at a time.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use tessera_common::encoding::Encoders;
use tessera_common::env::{Ballot, Block, Seal, Stage, Voteproof};
use tessera_common::error::{Result, TesseraError};
use tessera_ledger::Storage;
use tessera_p2p::Transport;

use crate::ballotbox::Ballotbox;
use crate::checker::{Admission, SealChecker};
use crate::hooks::{self, BlockSavedHook};
use crate::local::{compare_voteproof, LocalNode, LocalState, NodePool};
use crate::policy::LocalPolicy;
use crate::processor::operations::OperationProcessors;
use crate::processor::{Fetcher, ProposalProcessor};
use crate::states::booting::BootingHandler;
use crate::states::broken::BrokenHandler;
use crate::states::consensus::ConsensusHandler;
use crate::states::joining::JoiningHandler;
use crate::states::syncing::SyncingHandler;
use crate::states::{Context, ProposalIndex, Request, StateHandler, StateKind, StateSwitch};
use crate::suffrage::Suffrage;
use crate::syncer::Syncer;
use crate::timers::{TimerFired, Timers};

pub const SEALS_BUFFER: usize = 1024;
const REQUESTS_BUFFER: usize = 256;
const TIMERS_BUFFER: usize = 64;

/// What the orchestrator is built from.
#[derive(Debug)]
pub struct StatesConfig {
    pub local: LocalNode,
    pub nodepool: NodePool,
    pub suffrage: Arc<dyn Suffrage>,
    pub policy: LocalPolicy,
    pub storage: Arc<dyn Storage>,
    pub transport: Arc<dyn Transport>,
    pub encoders: Encoders,
    pub operations: OperationProcessors,
}

/// Outside view of a running orchestrator.
#[derive(Debug)]
pub struct StatesHandle {
    /// Seals received from peers.
    pub seals: mpsc::Sender<Seal>,
    pub state: watch::Receiver<StateKind>,
    /// Fatal errors; the node is broken once one arrives.
    pub errors: mpsc::Receiver<TesseraError>,
    pub local: LocalState,
}

struct Handlers {
    booting: BootingHandler,
    joining: JoiningHandler,
    consensus: ConsensusHandler,
    syncing: SyncingHandler,
    broken: BrokenHandler,
}

impl Handlers {
    fn new(ctx: &Arc<Context>) -> Self {
        Self {
            booting: BootingHandler::new(ctx.clone()),
            joining: JoiningHandler::new(ctx.clone()),
            consensus: ConsensusHandler::new(ctx.clone()),
            syncing: SyncingHandler::new(ctx.clone()),
            broken: BrokenHandler::new(ctx.clone()),
        }
    }

    fn get(&mut self, kind: StateKind) -> &mut dyn StateHandler {
        match kind {
            StateKind::Booting => &mut self.booting,
            StateKind::Joining => &mut self.joining,
            StateKind::Consensus => &mut self.consensus,
            StateKind::Syncing => &mut self.syncing,
            StateKind::Broken => &mut self.broken,
        }
    }
}

enum Event {
    Request(Request),
    Timer(TimerFired),
    Seal(Seal),
}

/// Runs `work` to completion unless `shutdown` resolves first.
async fn unless_shutdown<F: Future>(shutdown: &mut oneshot::Receiver<()>, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown => None,
        out = work => Some(out),
    }
}

pub struct States {
    ctx: Arc<Context>,
    handlers: Handlers,
    current: StateKind,
    hooks: Vec<Box<dyn BlockSavedHook>>,
    seals: mpsc::Receiver<Seal>,
    requests: mpsc::Receiver<Request>,
    timers: mpsc::Receiver<TimerFired>,
    state_tx: watch::Sender<StateKind>,
}

impl States {
    pub fn new(config: StatesConfig) -> Result<(States, StatesHandle)> {
        config.policy.is_valid()?;
        let StatesConfig { local, nodepool, suffrage, policy, storage, transport, encoders, operations } = config;

        let (seals_tx, seals_rx) = mpsc::channel(SEALS_BUFFER);
        let (requests_tx, requests_rx) = mpsc::channel(REQUESTS_BUFFER);
        let (timers_tx, timers_rx) = mpsc::channel(TIMERS_BUFFER);
        let (errors_tx, errors_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(StateKind::Booting);

        suffrage.set_number_of_acting(policy.number_of_acting());
        let network_id = policy.network_id.clone();
        let state = LocalState::new(policy.clone());
        let ballotbox = Arc::new(Ballotbox::new(network_id, suffrage.clone(), policy.threshold()));
        let processor = Arc::new(
            ProposalProcessor::new(storage.clone(), suffrage.clone(), state.clone(), operations)
                .with_fetcher(Fetcher::new(transport.clone(), encoders.clone())),
        );
        let peers = suffrage.nodes().iter().filter(|n| **n != local.address).cloned().collect();
        let syncer = Arc::new(Syncer::new(
            state.clone(),
            nodepool.clone(),
            suffrage.clone(),
            storage.clone(),
            transport.clone(),
            encoders.clone(),
            processor.clone(),
            peers,
        ));

        let ctx = Arc::new(Context {
            local,
            nodepool,
            suffrage,
            state: state.clone(),
            storage,
            transport,
            encoders,
            ballotbox,
            processor,
            syncer,
            timers: Timers::new(timers_tx),
            proposals: ProposalIndex::default(),
            requests: requests_tx,
            loopback: seals_tx.clone(),
            errors: errors_tx,
        });

        let handlers = Handlers::new(&ctx);

        let states = States {
            ctx,
            handlers,
            current: StateKind::Booting,
            hooks: hooks::default_hooks(),
            seals: seals_rx,
            requests: requests_rx,
            timers: timers_rx,
            state_tx,
        };
        let handle = StatesHandle { seals: seals_tx, state: state_rx, errors: errors_rx, local: state };
        Ok((states, handle))
    }

    pub fn context(&self) -> Arc<Context> {
        self.ctx.clone()
    }

    pub fn add_hook(&mut self, hook: Box<dyn BlockSavedHook>) {
        self.hooks.push(hook);
    }

    /// Runs until `shutdown` fires or its sender is dropped.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        info!(target: "states", node = %self.ctx.local.address, "states started");
        let boot = StateSwitch { from: StateKind::Booting, to: StateKind::Booting, voteproof: None, reason: None };
        let entered = self.handler().enter(&boot).await;
        self.settle(entered);
        self.drain().await;

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(req) = self.requests.recv() => Event::Request(req),
                Some(fired) = self.timers.recv() => Event::Timer(fired),
                Some(seal) = self.seals.recv() => Event::Seal(seal),
            };
            // a handler may wait on proposal processing; shutdown cuts it short
            if unless_shutdown(&mut shutdown, self.dispatch(event)).await.is_none() {
                break;
            }
        }

        let r = self.handler().exit().await;
        self.settle(r);
        self.ctx.timers.stop_all();
        info!(target: "states", "states stopped");
        Ok(())
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Request(req) => self.handle_request(req).await,
            Event::Timer(fired) => {
                if self.ctx.timers.is_current(&fired) {
                    let r = self.handler().on_timer(fired.id).await;
                    self.settle(r);
                }
            }
            Event::Seal(seal) => self.new_seal(seal).await,
        }
        self.drain().await;
    }

    fn handler(&mut self) -> &mut dyn StateHandler {
        self.handlers.get(self.current)
    }

    /// Acts on a handler result: storage failures and broken invariants stop
    /// the node, everything else is logged.
    fn settle(&mut self, result: Result<()>) {
        let Err(e) = result else { return };
        if self.current == StateKind::Broken {
            return;
        }
        if e.is_storage() || e.is_broken() {
            let switch = StateSwitch {
                from: self.current,
                to: StateKind::Broken,
                voteproof: None,
                reason: Some(e.to_string()),
            };
            if self.ctx.requests.try_send(Request::Switch(switch)).is_err() {
                warn!(target: "states", error = %e, "could not queue switch to broken");
            }
        } else {
            warn!(target: "states", state = %self.current, error = %e, "handler error");
        }
    }

    async fn drain(&mut self) {
        while let Ok(req) = self.requests.try_recv() {
            self.handle_request(req).await;
        }
    }

    async fn handle_request(&mut self, req: Request) {
        match req {
            Request::Switch(switch) => self.switch(switch).await,
            Request::BlockSaved(block) => self.block_saved(*block).await,
            Request::Sync(event) => {
                let r = self.handler().on_sync(event).await;
                self.settle(r);
            }
        }
    }

    async fn switch(&mut self, mut switch: StateSwitch) {
        if self.current == StateKind::Broken {
            debug!(target: "states", to = %switch.to, "broken; switch ignored");
            return;
        }
        if switch.to == self.current {
            debug!(target: "states", state = %self.current, "already in state");
            return;
        }
        switch.from = self.current;

        let r = self.handler().exit().await;
        if let Err(e) = r {
            warn!(target: "states", state = %self.current, error = %e, "exit failed");
        }
        self.ctx.timers.stop_all();

        info!(target: "states", from = %switch.from, to = %switch.to, "state switched");
        self.current = switch.to;
        self.state_tx.send_replace(switch.to);
        let r = self.handler().enter(&switch).await;
        self.settle(r);
    }

    async fn block_saved(&mut self, block: Block) {
        self.ctx.state.set_last_block(&block);
        for hook in &self.hooks {
            if let Err(e) = hook.on_block_saved(&self.ctx, &block) {
                warn!(target: "states", hook = hook.name(), height = %block.height(), error = %e, "hook failed");
            }
        }
        let r = self.handler().new_block_saved(&block).await;
        self.settle(r);
    }

    async fn new_seal(&mut self, seal: Seal) {
        if matches!(self.current, StateKind::Booting | StateKind::Broken) {
            return;
        }
        let hash = seal.hash();
        match self.ctx.storage.has_seal(&hash) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => return self.settle(Err(e)),
        }

        let snapshot = self.ctx.state.snapshot();
        let checker = SealChecker {
            local: &snapshot,
            nodepool: &self.ctx.nodepool,
            suffrage: self.ctx.suffrage.as_ref(),
        };
        match checker.check(&seal) {
            Ok(Admission::Admit) => {}
            Ok(Admission::Stale) => {
                debug!(target: "states", seal = %hash, "stale seal dropped");
                return;
            }
            Err(e) => {
                warn!(target: "states", seal = %hash, signer = %seal.signer(), error = %e, "invalid seal dropped");
                return;
            }
        }

        match self.ctx.storage.new_seal(&seal) {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => return,
            Err(e) => return self.settle(Err(e)),
        }

        if let Seal::Operation(os) = &seal {
            if let Err(e) = self.ctx.storage.new_operations(&os.operations) {
                return self.settle(Err(e));
            }
            debug!(target: "states", seal = %hash, operations = os.operations.len(), "operations staged");
        }

        if let Some(ballot) = seal.as_ballot() {
            let ballot = ballot.clone();
            self.new_ballot(&ballot).await;
        }

        let r = self.handler().new_seal(&seal).await;
        self.settle(r);
    }

    async fn new_ballot(&mut self, ballot: &Ballot) {
        if ballot.stage() == Stage::Proposal {
            if let Err(e) = self.ctx.storage.new_proposal(ballot) {
                if !e.is_duplicate() {
                    return self.settle(Err(e));
                }
            }
            self.ctx.proposals.record(ballot);
        }

        let mut voteproofs = Vec::new();
        if ballot.stage().can_vote() {
            match self.ctx.ballotbox.vote(ballot) {
                Ok(outcome) => voteproofs.extend(outcome.finished().cloned()),
                Err(e) => warn!(target: "ballotbox", ballot = %ballot.hash(), error = %e, "vote rejected"),
            }
        }
        // voteproofs carried by ballots let a node that missed votes follow
        if voteproofs.is_empty() {
            let last = self.ctx.state.snapshot().last_voteproof;
            for vp in [&ballot.accept_voteproof, &ballot.voteproof].into_iter().flatten() {
                let newer = last.as_ref().map_or(true, |l| compare_voteproof(vp, l).is_gt());
                if newer {
                    voteproofs.push(vp.clone());
                }
            }
        }

        for vp in voteproofs {
            self.new_voteproof(vp).await;
            self.drain().await;
        }
    }

    async fn new_voteproof(&mut self, vp: Voteproof) {
        if matches!(self.current, StateKind::Booting | StateKind::Broken) {
            return;
        }
        if !self.ctx.state.set_last_voteproof(&vp) {
            debug!(target: "states", height = %vp.height, round = %vp.round, stage = %vp.stage, "old voteproof");
            return;
        }
        info!(
            target: "states",
            height = %vp.height,
            round = %vp.round,
            stage = %vp.stage,
            result = %vp.result,
            "new voteproof"
        );
        let r = self.handler().new_voteproof(&vp).await;
        self.settle(r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::genesis::GenesisGenerator;
    use crate::suffrage::RoundrobinSuffrage;
    use crate::testing;
    use tessera_common::encoding::EncoderKind;
    use tessera_common::env::Height;
    use tessera_common::utils::Address;
    use tessera_ledger::MemoryStorage;
    use tessera_p2p::InMemoryNetwork;

    async fn single_node(suffrage_nodes: Vec<Address>) -> (States, StatesHandle, Arc<dyn Storage>) {
        let node = testing::nodes(1).remove(0);
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        GenesisGenerator::new(node.clone(), testing::policy(), storage.clone())
            .generate()
            .await
            .unwrap();
        let network = InMemoryNetwork::new();
        let (transport, _inbound) = network.join(node.address.clone());
        let config = StatesConfig {
            nodepool: NodePool::new([(node.address.clone(), node.publickey())]).unwrap(),
            suffrage: Arc::new(RoundrobinSuffrage::new(suffrage_nodes, 1).unwrap()),
            operations: OperationProcessors::with_defaults([node.publickey()]).unwrap(),
            local: node,
            policy: testing::policy(),
            storage: storage.clone(),
            transport: Arc::new(transport),
            encoders: Encoders::new(EncoderKind::Bincode),
        };
        let (states, handle) = States::new(config).unwrap();
        (states, handle, storage)
    }

    #[tokio::test]
    async fn test_single_node_commits_blocks() {
        let (states, mut handle, storage) = single_node(vec![Address::from("n0")]).await;
        let (stop, shutdown) = oneshot::channel();
        let task = tokio::spawn(states.run(shutdown));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while handle.local.last_height() < Height(2) {
            assert!(tokio::time::Instant::now() < deadline, "no block after genesis");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*handle.state.borrow(), StateKind::Consensus);

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();

        let m1 = storage.manifest_by_height(Height(1)).unwrap().unwrap();
        let m2 = storage.manifest_by_height(Height(2)).unwrap().unwrap();
        assert_eq!(m2.previous_block, m1.hash);
        let block = storage.block_by_height(Height(1)).unwrap().unwrap();
        assert!(block.consensus.accept_voteproof.is_some());
        assert!(handle.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_staged_operation_gets_included() {
        let (states, handle, storage) = single_node(vec![Address::from("n0")]).await;
        let node = states.context().local.clone();
        let op = testing::kv_operation(&node, "t-1", "color", "blue");
        let seal = tessera_common::env::OperationSeal::new(vec![op], &node.privatekey, &testing::net()).unwrap();

        let (stop, shutdown) = oneshot::channel();
        let task = tokio::spawn(states.run(shutdown));
        handle.seals.send(Seal::Operation(seal)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(st) = storage.state("color").unwrap() {
                assert_eq!(st.value, b"blue".to_vec());
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "operation never committed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_pending_work() {
        let (stop, mut shutdown) = oneshot::channel();
        let started = tokio::time::Instant::now();
        let pending = tokio::spawn(async move {
            unless_shutdown(&mut shutdown, std::future::pending::<()>()).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(()).unwrap();
        let out = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert!(out.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        let (_stop, mut shutdown) = oneshot::channel::<()>();
        assert_eq!(unless_shutdown(&mut shutdown, async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_unknown_suffrage_node_breaks() {
        let (states, mut handle, _storage) = single_node(vec![Address::from("n0"), Address::from("ghost")]).await;
        let (_stop, shutdown) = oneshot::channel();
        tokio::spawn(states.run(shutdown));

        let err = tokio::time::timeout(Duration::from_secs(2), handle.errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(err.is_broken());
        assert_eq!(*handle.state.borrow(), StateKind::Broken);
    }
}
