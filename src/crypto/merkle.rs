//! Merkle tree over transaction hashes.
//!
//! Bitcoin rules: nodes are `double_sha256(left ‖ right)` over hashes in
//! internal byte order, and a level with an odd node count duplicates its
//! last node. An inclusion proof records each sibling hash together with the
//! side it sits on.

use serde::{Deserialize, Serialize};

use crate::crypto::hash::{double_sha256, Hash256};

/// Which side of the concatenation a proof sibling occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// One level of an inclusion proof: the sibling hash and its side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub side: Side,
    pub hash: Hash256,
}

/// An inclusion proof for a single leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf: Hash256,
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Recompute the root from the leaf and compare against `root`.
    pub fn verify(&self, root: &Hash256) -> bool {
        let mut current = self.leaf;
        for step in &self.steps {
            let mut combined = Vec::with_capacity(64);
            match step.side {
                Side::Left => {
                    combined.extend_from_slice(&step.hash.0);
                    combined.extend_from_slice(&current.0);
                }
                Side::Right => {
                    combined.extend_from_slice(&current.0);
                    combined.extend_from_slice(&step.hash.0);
                }
            }
            current = Hash256(double_sha256(&combined));
        }
        current == *root
    }
}

/// A Merkle tree with all levels retained for proof generation.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build the tree bottom-up from leaf hashes (internal byte order).
    pub fn new(leaves: &[Hash256]) -> Self {
        let mut levels: Vec<Vec<Hash256>> = Vec::new();
        if leaves.is_empty() {
            return MerkleTree { levels };
        }

        levels.push(leaves.to_vec());
        while levels.last().unwrap().len() > 1 {
            let mut current = levels.last().unwrap().clone();
            if current.len() % 2 != 0 {
                current.push(*current.last().unwrap());
            }

            let mut next = Vec::with_capacity(current.len() / 2);
            for pair in current.chunks(2) {
                let mut combined = Vec::with_capacity(64);
                combined.extend_from_slice(&pair[0].0);
                combined.extend_from_slice(&pair[1].0);
                next.push(Hash256(double_sha256(&combined)));
            }
            levels.push(next);
        }

        MerkleTree { levels }
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// The root hash, or `None` for an empty tree.
    pub fn root(&self) -> Option<Hash256> {
        self.levels.last().map(|level| level[0])
    }

    /// Generate an inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut steps = Vec::new();
        let mut current_index = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling_index, side) = if current_index % 2 == 0 {
                (current_index + 1, Side::Right)
            } else {
                (current_index - 1, Side::Left)
            };
            // An odd level duplicates its last node as the sibling.
            let sibling = if sibling_index < level.len() {
                level[sibling_index]
            } else {
                level[current_index]
            };
            steps.push(ProofStep { side, hash: sibling });
            current_index /= 2;
        }

        Some(MerkleProof {
            leaf: self.levels[0][index],
            steps,
        })
    }
}

/// Merkle root of a list of transaction hashes.
///
/// Block-level policy: an empty list yields the all-zeros root, a single
/// hash is the root itself.
pub fn compute_merkle_root(hashes: &[Hash256]) -> Hash256 {
    match hashes.len() {
        0 => Hash256::ZERO,
        1 => hashes[0],
        _ => MerkleTree::new(hashes).root().unwrap(),
    }
}
