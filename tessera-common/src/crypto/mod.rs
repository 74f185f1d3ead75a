pub mod fixedtree;
pub mod hash;
pub mod keys;

pub use fixedtree::{FixedTree, FixedTreeGenerator, FixedTreeNode, FixedTreeProof};
pub use hash::Hash;
pub use keys::{KeyKind, Privatekey, Publickey, Signature};
