//! Uncommitted state view used while a proposal is processed.

use std::collections::BTreeMap;
use std::sync::Arc;

use tessera_common::crypto::Hash;
use tessera_common::env::{Height, State};
use tessera_common::error::Result;

use crate::storage::Storage;

#[derive(Debug, Clone)]
struct Pending {
    value: Vec<u8>,
    previous_height: Height,
    operations: Vec<Hash>,
}

/// Layers writes for `height` over the committed state in storage.
#[derive(Debug)]
pub struct StatePool {
    storage: Arc<dyn Storage>,
    height: Height,
    pending: BTreeMap<String, Pending>,
}

impl StatePool {
    pub fn new(storage: Arc<dyn Storage>, height: Height) -> Self {
        Self { storage, height, pending: BTreeMap::new() }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    /// Current value of `key`, including writes made in this pool.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(p) = self.pending.get(key) {
            return Ok(Some(p.value.clone()));
        }
        Ok(self.storage.state(key)?.map(|s| s.value))
    }

    pub fn set(&mut self, key: &str, value: Vec<u8>, operation: Hash) -> Result<()> {
        if let Some(p) = self.pending.get_mut(key) {
            p.value = value;
            if !p.operations.contains(&operation) {
                p.operations.push(operation);
            }
            return Ok(());
        }

        let previous_height = self
            .storage
            .state(key)?
            .map_or(Height::PRE_GENESIS, |s| s.height);
        self.pending.insert(
            key.to_string(),
            Pending { value, previous_height, operations: vec![operation] },
        );
        Ok(())
    }

    pub fn is_updated(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Written states for this height, sorted by key.
    pub fn updated(&self) -> Vec<State> {
        self.pending
            .iter()
            .map(|(k, p)| State::new(k.clone(), p.value.clone(), self.height, p.previous_height, p.operations.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> StatePoolSnapshot {
        StatePoolSnapshot(self.pending.clone())
    }

    /// Drops writes made since `snapshot` was taken.
    pub fn restore(&mut self, snapshot: StatePoolSnapshot) {
        self.pending = snapshot.0;
    }
}

/// Saved pending writes; restoring it rolls back a failed operation.
#[derive(Debug, Clone)]
pub struct StatePoolSnapshot(BTreeMap<String, Pending>);
