//! Fixed-size Merkle tree stored in heap order.
//!
//! Node `i` has children `2i+1` and `2i+2`. A node hash commits to its index,
//! key, data and both child hashes, so the root (node 0) commits to the whole
//! tree. Hashes are filled bottom-up by [`FixedTreeGenerator::tree`].

use serde::{Deserialize, Serialize};

use super::hash::Hash;
use crate::error::{Result, TesseraError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTreeNode {
    pub index: u64,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub hash: Hash,
}

impl FixedTreeNode {
    pub fn new(index: u64, key: Vec<u8>, data: Vec<u8>) -> Self {
        FixedTreeNode { index, key, data, hash: Hash::zero() }
    }

    pub fn is_valid(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(TesseraError::Invalid(format!("tree node {} has empty key", self.index)));
        }
        if self.hash.is_zero() {
            return Err(TesseraError::Invalid(format!("tree node {} has empty hash", self.index)));
        }
        Ok(())
    }

    /// sha256(index_be ∥ key ∥ data ∥ left ∥ right); a missing child contributes nothing.
    pub fn compute_hash(&self, left: Option<&Hash>, right: Option<&Hash>) -> Hash {
        let index = self.index.to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![&index, &self.key, &self.data];
        if let Some(l) = left {
            parts.push(l.as_bytes());
        }
        if let Some(r) = right {
            parts.push(r.as_bytes());
        }
        Hash::sha256_parts(&parts)
    }
}

fn children_of(size: usize, index: u64) -> (Option<usize>, Option<usize>) {
    let l = (index as usize) * 2 + 1;
    let r = l + 1;
    ((l < size).then_some(l), (r < size).then_some(r))
}

fn parent_of(index: u64) -> Option<u64> {
    if index == 0 {
        None
    } else {
        Some((index - 1) / 2)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTree {
    nodes: Vec<FixedTreeNode>,
}

impl FixedTree {
    pub fn empty() -> Self {
        FixedTree { nodes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root hash; the zero hash for an empty tree.
    pub fn root(&self) -> Hash {
        self.nodes.first().map(|n| n.hash).unwrap_or_else(Hash::zero)
    }

    pub fn nodes(&self) -> &[FixedTreeNode] {
        &self.nodes
    }

    pub fn node(&self, index: u64) -> Result<&FixedTreeNode> {
        self.nodes
            .get(index as usize)
            .ok_or_else(|| TesseraError::NotFound(format!("tree node {index}")))
    }

    pub fn find_by_key(&self, key: &[u8]) -> Option<&FixedTreeNode> {
        self.nodes.iter().find(|n| n.key == key)
    }

    fn expected_hash(&self, n: &FixedTreeNode) -> Hash {
        let (l, r) = children_of(self.nodes.len(), n.index);
        n.compute_hash(l.map(|i| &self.nodes[i].hash), r.map(|i| &self.nodes[i].hash))
    }

    /// Checks indices are dense and every stored hash matches its recomputation.
    pub fn is_valid(&self) -> Result<()> {
        for (i, n) in self.nodes.iter().enumerate() {
            n.is_valid()?;
            if n.index as usize != i {
                return Err(TesseraError::Invalid(format!("wrong tree index; {} != {i}", n.index)));
            }
        }
        for n in &self.nodes {
            if self.expected_hash(n) != n.hash {
                return Err(TesseraError::Invalid(format!("tree node {} hash does not match", n.index)));
            }
        }
        Ok(())
    }

    /// Path from `index` up to the root, each step carrying the child hashes
    /// needed to recompute that step's hash.
    pub fn proof(&self, index: u64) -> Result<FixedTreeProof> {
        self.node(index)?;

        let mut steps = Vec::new();
        let mut current = Some(index);
        while let Some(i) = current {
            let node = self.nodes[i as usize].clone();
            let (l, r) = children_of(self.nodes.len(), i);
            steps.push(ProofStep {
                node,
                left: l.map(|c| self.nodes[c].hash),
                right: r.map(|c| self.nodes[c].hash),
            });
            current = parent_of(i);
        }

        Ok(FixedTreeProof { steps })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub node: FixedTreeNode,
    pub left: Option<Hash>,
    pub right: Option<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTreeProof {
    pub steps: Vec<ProofStep>,
}

impl FixedTreeProof {
    /// The node this proof was generated for.
    pub fn target(&self) -> Option<&FixedTreeNode> {
        self.steps.first().map(|s| &s.node)
    }

    /// Verifies the chain of hashes ends at `root`.
    pub fn prove(&self, root: &Hash) -> Result<()> {
        let last = self
            .steps
            .last()
            .ok_or_else(|| TesseraError::Invalid("nothing to prove".into()))?;
        if last.node.index != 0 {
            return Err(TesseraError::Invalid("proof does not end at root".into()));
        }
        if &last.node.hash != root {
            return Err(TesseraError::Invalid("proof root does not match".into()));
        }

        for (i, step) in self.steps.iter().enumerate() {
            step.node.is_valid()?;
            let h = step.node.compute_hash(step.left.as_ref(), step.right.as_ref());
            if h != step.node.hash {
                return Err(TesseraError::Invalid(format!(
                    "proof node {} has wrong hash",
                    step.node.index
                )));
            }

            if let Some(up) = self.steps.get(i + 1) {
                if parent_of(step.node.index) != Some(up.node.index) {
                    return Err(TesseraError::Invalid(format!(
                        "proof step {} is not the parent of {}",
                        up.node.index, step.node.index
                    )));
                }
                let slot = if step.node.index % 2 == 1 { up.left } else { up.right };
                if slot != Some(step.node.hash) {
                    return Err(TesseraError::Invalid(format!(
                        "proof node {} is not linked to its parent",
                        step.node.index
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Collects nodes by index, then hashes the tree in one bottom-up pass.
#[derive(Debug)]
pub struct FixedTreeGenerator {
    nodes: Vec<Option<FixedTreeNode>>,
}

impl FixedTreeGenerator {
    pub fn new(size: usize) -> Self {
        FixedTreeGenerator { nodes: vec![None; size] }
    }

    pub fn add(&mut self, node: FixedTreeNode) -> Result<()> {
        if node.key.is_empty() {
            return Err(TesseraError::Invalid("tree node with empty key".into()));
        }
        let size = self.nodes.len();
        let slot = self
            .nodes
            .get_mut(node.index as usize)
            .ok_or_else(|| TesseraError::Invalid(format!("tree index out of range; {} >= {size}", node.index)))?;
        *slot = Some(FixedTreeNode { hash: Hash::zero(), ..node });
        Ok(())
    }

    pub fn tree(self) -> Result<FixedTree> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (i, n) in self.nodes.into_iter().enumerate() {
            nodes.push(n.ok_or_else(|| TesseraError::Invalid(format!("empty node {i} in tree")))?);
        }

        for i in (0..nodes.len()).rev() {
            let (l, r) = children_of(nodes.len(), i as u64);
            let h = nodes[i].compute_hash(l.map(|c| &nodes[c].hash), r.map(|c| &nodes[c].hash));
            nodes[i].hash = h;
        }

        Ok(FixedTree { nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(n: usize) -> FixedTree {
        let mut g = FixedTreeGenerator::new(n);
        for i in 0..n {
            g.add(FixedTreeNode::new(i as u64, format!("k{i}").into_bytes(), vec![i as u8])).unwrap();
        }
        g.tree().unwrap()
    }

    #[test]
    fn test_empty_tree_has_zero_root() {
        let t = FixedTreeGenerator::new(0).tree().unwrap();
        assert!(t.root().is_zero());
        assert!(t.is_valid().is_ok());
    }

    #[test]
    fn test_generated_tree_is_valid() {
        let t = build(9);
        assert_eq!(t.len(), 9);
        assert!(t.is_valid().is_ok());
        assert!(!t.root().is_zero());
    }

    #[test]
    fn test_missing_node_fails() {
        let mut g = FixedTreeGenerator::new(3);
        g.add(FixedTreeNode::new(0, b"a".to_vec(), vec![])).unwrap();
        g.add(FixedTreeNode::new(2, b"c".to_vec(), vec![])).unwrap();
        assert!(g.tree().is_err());
        assert!(FixedTreeGenerator::new(1)
            .add(FixedTreeNode::new(4, b"x".to_vec(), vec![]))
            .is_err());
    }

    #[test]
    fn test_tamper_changes_validity() {
        let t = build(5);
        let mut nodes = t.nodes().to_vec();
        nodes[3].data = vec![42];
        let tampered = FixedTree { nodes };
        assert!(tampered.is_valid().is_err());
    }

    #[test]
    fn test_proof_for_every_node() {
        let t = build(10);
        for i in 0..10 {
            let p = t.proof(i).unwrap();
            assert_eq!(p.target().unwrap().index, i);
            assert!(p.prove(&t.root()).is_ok(), "proof for {i}");
        }
        assert!(t.proof(10).is_err());
    }

    #[test]
    fn test_proof_rejects_other_root_and_edits() {
        let t = build(7);
        let other = build(6);
        let p = t.proof(5).unwrap();
        assert!(p.prove(&other.root()).is_err());

        let mut bad = p.clone();
        bad.steps[0].node.data = vec![99];
        assert!(bad.prove(&t.root()).is_err());
    }
}
