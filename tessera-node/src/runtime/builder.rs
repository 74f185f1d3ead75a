use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::info;

use tessera_common::encoding::Encoders;
use tessera_common::env::{Block, Seal};
use tessera_common::error::{Result, TesseraError};
use tessera_consensus::states::Context;
use tessera_consensus::{
    GenesisGenerator, LocalNode, LocalPolicy, LocalState, NodePool, OperationProcessors, Responder, StateKind, States,
    StatesConfig, Suffrage,
};
use tessera_ledger::{MemoryStorage, RedbStorage, Storage};
use tessera_p2p::{AdapterHandle, Inbound, Libp2pAdapter, Transport};

use crate::config::{NodeDesign, StorageKind};
use crate::runtime::maestro::Maestro;

/// Everything a node is made of, minus the wire.
pub struct NodeParts {
    pub local: LocalNode,
    pub nodepool: NodePool,
    pub suffrage: Arc<dyn Suffrage>,
    pub policy: LocalPolicy,
    pub storage: Arc<dyn Storage>,
    pub encoders: Encoders,
    pub operations: OperationProcessors,
}

impl NodeParts {
    pub fn from_design(design: &NodeDesign, storage: Arc<dyn Storage>) -> Result<Self> {
        Ok(Self {
            local: design.local_node()?,
            nodepool: design.nodepool()?,
            suffrage: design.suffrage()?,
            policy: design.local_policy()?,
            storage,
            encoders: design.encoders(),
            operations: design.operation_processors()?,
        })
    }
}

pub fn open_storage(design: &NodeDesign) -> Result<Arc<dyn Storage>> {
    Ok(match design.storage {
        StorageKind::Memory => Arc::new(MemoryStorage::new()),
        StorageKind::Redb => {
            let storage = RedbStorage::open(&design.data_dir).map_err(|e| match e {
                TesseraError::Io(e) => TesseraError::Storage(format!("opening {}: {e}", design.data_dir.display())),
                other => other,
            })?;
            Arc::new(storage)
        }
    })
}

/// Writes the genesis block. An existing chain is an error unless `force`.
pub async fn init_genesis(design: &NodeDesign, force: bool) -> Result<Block> {
    design.validate()?;
    let storage = open_storage(design)?;
    if force {
        info!(target: "consensus", data_dir = %design.data_dir.display(), "removing the existing chain");
        storage.clean()?;
    }
    let local = design.local_node()?;
    let operations = design.genesis_operations(&local)?;
    GenesisGenerator::new(local, design.local_policy()?, storage)
        .with_operations(operations)
        .generate()
        .await
}

/// A started node: orchestrator, maestro and, on a real network, the libp2p
/// adapter.
pub struct NodeRuntime {
    context: Arc<Context>,
    local: LocalState,
    state: tokio::sync::watch::Receiver<StateKind>,
    seals: mpsc::Sender<Seal>,
    errors: mpsc::Receiver<TesseraError>,
    shutdown: Option<oneshot::Sender<()>>,
    states_task: Option<JoinHandle<Result<()>>>,
    tasks: Vec<JoinHandle<()>>,
    adapter: Option<AdapterHandle>,
}

impl NodeRuntime {
    pub fn state(&self) -> StateKind {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<StateKind> {
        self.state.clone()
    }

    pub fn local(&self) -> &LocalState {
        &self.local
    }

    pub fn context(&self) -> Arc<Context> {
        self.context.clone()
    }

    /// Queue feeding the orchestrator, as the maestro uses it.
    pub fn seals(&self) -> mpsc::Sender<Seal> {
        self.seals.clone()
    }

    /// Resolves when the node stops on its own: a fatal error, or the
    /// orchestrator returning.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.states_task.as_mut() else {
            return Ok(());
        };
        let joined = tokio::select! {
            Some(err) = self.errors.recv() => return Err(err),
            joined = task => joined,
        };
        self.states_task = None;
        flatten(joined)
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.shutdown.take() {
            let _ = stop.send(());
        }
        let result = match self.states_task.take() {
            Some(task) => flatten(task.await),
            None => Ok(()),
        };
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(adapter) = &self.adapter {
            adapter.shutdown().await;
        }
        info!(target: "states", node = %self.context.local.address, "node stopped");
        result
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| TesseraError::Other(format!("states task: {e}")))?
}

/// Starts a node over an already connected transport.
pub fn start_node(parts: NodeParts, transport: Arc<dyn Transport>, inbound: mpsc::Receiver<Inbound>) -> Result<NodeRuntime> {
    let NodeParts { local, nodepool, suffrage, policy, storage, encoders, operations } = parts;
    let config = StatesConfig {
        local: local.clone(),
        nodepool,
        suffrage,
        policy,
        storage: storage.clone(),
        transport,
        encoders: encoders.clone(),
        operations,
    };
    let (states, handle) = States::new(config)?;
    let context = states.context();

    let responder = Responder::new(local, storage, encoders.clone(), handle.local.clone(), handle.state.clone());
    let maestro = Maestro::new(encoders, handle.seals.clone(), responder);

    let (stop, shutdown) = oneshot::channel();
    let states_task = tokio::spawn(states.run(shutdown));
    let maestro_task = tokio::spawn(maestro.run(inbound));

    Ok(NodeRuntime {
        context,
        local: handle.local,
        state: handle.state,
        seals: handle.seals,
        errors: handle.errors,
        shutdown: Some(stop),
        states_task: Some(states_task),
        tasks: vec![maestro_task],
        adapter: None,
    })
}

/// Validates the design, opens storage, brings up libp2p and starts the node.
pub async fn build_runtime(design: &NodeDesign) -> Result<NodeRuntime> {
    design.validate()?;
    let storage = open_storage(design)?;
    let parts = NodeParts::from_design(design, storage)?;

    let (adapter, handle, inbound) = Libp2pAdapter::new(&design.p2p_config())?;
    info!(target: "p2p", peer_id = %adapter.peer_id, "libp2p adapter ready");
    let adapter_task = tokio::spawn(adapter.run());

    let mut runtime = start_node(parts, Arc::new(handle.clone()), inbound)?;
    runtime.tasks.push(adapter_task);
    runtime.adapter = Some(handle);
    Ok(runtime)
}
