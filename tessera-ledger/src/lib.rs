//! Persistence for a tessera node: blocks, manifests, seals, operations and
//! chain state behind one [`Storage`] trait.

pub mod state;
pub mod storage;

pub use state::StatePool;
pub use storage::memory::MemoryStorage;
pub use storage::redb_store::RedbStorage;
pub use storage::{BlockTx, Storage};
