pub mod memory;
pub mod redb_store;

use std::fmt;

use tessera_common::crypto::{Hash, Publickey};
use tessera_common::env::{Ballot, Block, Height, Manifest, Operation, Seal, State};
use tessera_common::error::{Result, TesseraError};
use tracing::{debug, warn};

/// Storage capability surface consumed by consensus.
///
/// Reads return `Ok(None)` for absent entries; `Err` is reserved for I/O
/// failures. Writes of committed data only happen through [`BlockTx`].
pub trait Storage: Send + Sync + fmt::Debug {
    fn last_manifest(&self) -> Result<Option<Manifest>>;
    fn last_block(&self) -> Result<Option<Block>>;
    fn manifest_by_height(&self, height: Height) -> Result<Option<Manifest>>;
    /// Manifests in `from..=to`, ascending; stops at the first gap.
    fn manifests(&self, from: Height, to: Height) -> Result<Vec<Manifest>>;
    fn block_by_height(&self, height: Height) -> Result<Option<Block>>;

    fn seal_by_hash(&self, hash: &Hash) -> Result<Option<Seal>>;
    fn has_seal(&self, hash: &Hash) -> Result<bool>;
    /// Fails with `Duplicate` when the seal is already stored.
    fn new_seal(&self, seal: &Seal) -> Result<()>;

    /// Proposals are keyed by fact hash.
    fn new_proposal(&self, proposal: &Ballot) -> Result<()>;
    fn proposal(&self, fact_hash: &Hash) -> Result<Option<Ballot>>;

    /// Stages operations for inclusion in a future proposal.
    fn new_operations(&self, operations: &[Operation]) -> Result<()>;
    /// Looks up by operation hash, staged or committed.
    fn operation(&self, hash: &Hash) -> Result<Option<Operation>>;
    /// Oldest staged operations first.
    fn staged_operations(&self, limit: usize) -> Result<Vec<Operation>>;
    fn has_operation_fact(&self, fact_hash: &Hash) -> Result<bool>;
    fn has_token(&self, signer: &Publickey, token: &[u8]) -> Result<bool>;

    fn state(&self, key: &str) -> Result<Option<State>>;

    /// Writes everything in one transaction. Called by [`BlockTx::commit`].
    fn commit_block(&self, block: &Block, states: &[State]) -> Result<()>;

    /// Wipes every table.
    fn clean(&self) -> Result<()>;
}

impl<'s> dyn Storage + 's {
    pub fn open_block_tx(&self, block: Block) -> Result<BlockTx<'_>> {
        if let Some(last) = self.last_manifest()? {
            block.manifest.is_next_of(&last)?;
        } else if block.height() != Height::GENESIS {
            return Err(TesseraError::Invalid(format!(
                "empty storage can only take the genesis block, got {}",
                block.height()
            )));
        }
        Ok(BlockTx { storage: self, block, states: Vec::new() })
    }
}

/// Key used for replay protection: signer public key bytes, then token.
pub(crate) fn token_key(signer: &Publickey, token: &[u8]) -> Vec<u8> {
    let mut k = signer.bytes().to_vec();
    k.extend_from_slice(token);
    k
}

/// A block waiting to be committed together with its states.
pub struct BlockTx<'a> {
    storage: &'a dyn Storage,
    block: Block,
    states: Vec<State>,
}

impl fmt::Debug for BlockTx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockTx")
            .field("height", &self.block.height())
            .field("block", &self.block.hash())
            .field("states", &self.states.len())
            .finish()
    }
}

impl<'a> BlockTx<'a> {
    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn state_put(&mut self, states: Vec<State>) {
        self.states.extend(states);
    }

    pub fn commit(self) -> Result<()> {
        match self.storage.commit_block(&self.block, &self.states) {
            Ok(()) => {
                debug!(
                    height = %self.block.height(),
                    block = %self.block.hash(),
                    states = self.states.len(),
                    "block committed to storage"
                );
                Ok(())
            }
            Err(e) => {
                warn!(height = %self.block.height(), error = %e, "block commit failed");
                Err(match e {
                    TesseraError::Storage(_) | TesseraError::Invalid(_) => e,
                    other => TesseraError::Storage(other.to_string()),
                })
            }
        }
    }

    pub fn abort(self) {
        debug!(height = %self.block.height(), "block transaction aborted");
    }
}
