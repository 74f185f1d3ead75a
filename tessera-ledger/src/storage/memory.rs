use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use tessera_common::crypto::{Hash, Publickey};
use tessera_common::env::{Ballot, Block, Height, Manifest, Operation, Seal, State};
use tessera_common::error::{Result, TesseraError};

use super::{token_key, Storage};

#[derive(Debug, Default)]
struct Inner {
    blocks: BTreeMap<Height, Block>,
    seals: HashMap<Hash, Seal>,
    proposals: HashMap<Hash, Ballot>,
    operations: HashMap<Hash, Operation>,
    staged: BTreeMap<u64, Hash>,
    staged_seq: u64,
    states: HashMap<String, State>,
    facts: HashSet<Hash>,
    tokens: HashSet<Vec<u8>>,
}

/// Storage kept entirely in memory. Used by tests and `storage = "memory"`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

fn poisoned<T>(_: T) -> TesseraError {
    TesseraError::Storage("memory storage lock poisoned".into())
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn last_manifest(&self) -> Result<Option<Manifest>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.blocks.values().next_back().map(|b| b.manifest.clone()))
    }

    fn last_block(&self) -> Result<Option<Block>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.blocks.values().next_back().cloned())
    }

    fn manifest_by_height(&self, height: Height) -> Result<Option<Manifest>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.blocks.get(&height).map(|b| b.manifest.clone()))
    }

    fn manifests(&self, from: Height, to: Height) -> Result<Vec<Manifest>> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut out = Vec::new();
        let mut h = from;
        while h <= to {
            match inner.blocks.get(&h) {
                Some(b) => out.push(b.manifest.clone()),
                None => break,
            }
            h = h.next();
        }
        Ok(out)
    }

    fn block_by_height(&self, height: Height) -> Result<Option<Block>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.blocks.get(&height).cloned())
    }

    fn seal_by_hash(&self, hash: &Hash) -> Result<Option<Seal>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.seals.get(hash).cloned())
    }

    fn has_seal(&self, hash: &Hash) -> Result<bool> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.seals.contains_key(hash))
    }

    fn new_seal(&self, seal: &Seal) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if inner.seals.contains_key(&seal.hash()) {
            return Err(TesseraError::Duplicate(format!("seal {}", seal.hash())));
        }
        inner.seals.insert(seal.hash(), seal.clone());
        Ok(())
    }

    fn new_proposal(&self, proposal: &Ballot) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner
            .proposals
            .entry(proposal.fact_hash())
            .or_insert_with(|| proposal.clone());
        Ok(())
    }

    fn proposal(&self, fact_hash: &Hash) -> Result<Option<Ballot>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.proposals.get(fact_hash).cloned())
    }

    fn new_operations(&self, operations: &[Operation]) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        for op in operations {
            if inner.operations.contains_key(&op.hash) || inner.facts.contains(&op.fact_hash()) {
                continue;
            }
            inner.operations.insert(op.hash, op.clone());
            let seq = inner.staged_seq;
            inner.staged_seq += 1;
            inner.staged.insert(seq, op.hash);
        }
        Ok(())
    }

    fn operation(&self, hash: &Hash) -> Result<Option<Operation>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.operations.get(hash).cloned())
    }

    fn staged_operations(&self, limit: usize) -> Result<Vec<Operation>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .staged
            .values()
            .filter_map(|h| inner.operations.get(h))
            .take(limit)
            .cloned()
            .collect())
    }

    fn has_operation_fact(&self, fact_hash: &Hash) -> Result<bool> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.facts.contains(fact_hash))
    }

    fn has_token(&self, signer: &Publickey, token: &[u8]) -> Result<bool> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.tokens.contains(&token_key(signer, token)))
    }

    fn state(&self, key: &str) -> Result<Option<State>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.states.get(key).cloned())
    }

    fn commit_block(&self, block: &Block, states: &[State]) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;

        if let Some(last) = inner.blocks.values().next_back() {
            block.manifest.is_next_of(&last.manifest)?;
        } else if block.height() != Height::GENESIS {
            return Err(TesseraError::Invalid(format!("first block must be genesis, got {}", block.height())));
        }

        for st in states {
            inner.states.insert(st.key.clone(), st.clone());
        }

        for op in &block.operations {
            inner.facts.insert(op.fact_hash());
            for signer in op.signers() {
                inner.tokens.insert(token_key(signer, op.fact.token()));
            }
            inner.operations.insert(op.hash, op.clone());
        }

        let inner = &mut *inner;
        let (operations, facts) = (&inner.operations, &inner.facts);
        inner
            .staged
            .retain(|_, h| operations.get(h).map_or(false, |o| !facts.contains(&o.fact_hash())));

        inner.blocks.insert(block.height(), block.clone());
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        *inner = Inner::default();
        Ok(())
    }
}
