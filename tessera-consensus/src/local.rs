//! The local node, its view of the validators and its chain position.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tessera_common::crypto::{Privatekey, Publickey};
use tessera_common::env::{Block, Height, Manifest, Stage, Voteproof};
use tessera_common::error::{Result, TesseraError};
use tessera_common::utils::Address;

use crate::policy::LocalPolicy;

#[derive(Debug, Clone)]
pub struct LocalNode {
    pub address: Address,
    pub privatekey: Privatekey,
}

impl LocalNode {
    pub fn new(address: Address, privatekey: Privatekey) -> Self {
        Self { address, privatekey }
    }

    pub fn publickey(&self) -> Publickey {
        self.privatekey.publickey()
    }
}

/// Known validators and their public keys.
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    nodes: BTreeMap<Address, Publickey>,
}

impl NodePool {
    pub fn new(nodes: impl IntoIterator<Item = (Address, Publickey)>) -> Result<Self> {
        let mut pool = BTreeMap::new();
        for (addr, key) in nodes {
            if pool.insert(addr.clone(), key).is_some() {
                return Err(TesseraError::Config(format!("node {addr} listed twice")));
            }
        }
        Ok(Self { nodes: pool })
    }

    pub fn publickey(&self, node: &Address) -> Option<&Publickey> {
        self.nodes.get(node)
    }

    pub fn contains(&self, node: &Address) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Orders voteproofs by `(height, round, stage)`.
pub fn compare_voteproof(a: &Voteproof, b: &Voteproof) -> Ordering {
    (a.height, a.round, a.stage).cmp(&(b.height, b.round, b.stage))
}

/// Read-only copy of [`LocalState`].
#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    pub last_manifest: Option<Manifest>,
    /// ACCEPT majority that agreed on `last_manifest`.
    pub last_accept_voteproof: Option<Voteproof>,
    pub last_init_voteproof: Option<Voteproof>,
    pub last_voteproof: Option<Voteproof>,
    pub policy: LocalPolicy,
}

impl LocalSnapshot {
    pub fn last_height(&self) -> Height {
        self.last_manifest.as_ref().map_or(Height::PRE_GENESIS, |m| m.height)
    }
}

/// Chain position shared by the orchestrator and handlers. Only the
/// orchestrator writes to it.
#[derive(Debug, Clone)]
pub struct LocalState {
    inner: Arc<RwLock<LocalSnapshot>>,
}

impl LocalState {
    pub fn new(policy: LocalPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(LocalSnapshot {
                last_manifest: None,
                last_accept_voteproof: None,
                last_init_voteproof: None,
                last_voteproof: None,
                policy,
            })),
        }
    }

    pub fn snapshot(&self) -> LocalSnapshot {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_height(&self) -> Height {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).last_height()
    }

    pub fn policy(&self) -> LocalPolicy {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).policy.clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LocalSnapshot> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the local head to `block`; an older block is ignored.
    pub(crate) fn set_last_block(&self, block: &Block) {
        let mut s = self.write();
        if block.height() < s.last_height() {
            return;
        }
        s.last_manifest = Some(block.manifest.clone());
        if let Some(avp) = &block.consensus.accept_voteproof {
            s.last_accept_voteproof = Some(avp.clone());
        }
    }

    /// Stores `vp` if it is newer than the last one; returns whether it was.
    pub(crate) fn set_last_voteproof(&self, vp: &Voteproof) -> bool {
        let mut s = self.write();
        if let Some(last) = &s.last_voteproof {
            if compare_voteproof(vp, last) != Ordering::Greater {
                return false;
            }
        }
        s.last_voteproof = Some(vp.clone());
        if vp.stage == Stage::Init {
            s.last_init_voteproof = Some(vp.clone());
        }
        true
    }

    pub(crate) fn set_policy(&self, policy: LocalPolicy) {
        self.write().policy = policy;
    }
}
