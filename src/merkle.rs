//! Merkle accumulator over step-record digests.
//!
//! Pairing rule: leaves are taken in append order; a level with an odd node
//! count duplicates its last node. The root of an empty accumulator is the
//! SHA-256 of the empty string, a single leaf is its own root. Interior nodes
//! are hashed under a dedicated domain label so a leaf digest can never be
//! replayed as an interior node. Provers and verifiers share this one
//! implementation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{domain_hash, Digest32};

const NODE_DOMAIN: &[u8] = b"stepchain.merkle-node";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("leaf index {index} out of range for {len} leaves")]
    IndexOutOfRange { index: u64, len: u64 },
}

fn hash_children(left: &Digest32, right: &Digest32) -> Digest32 {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(left.as_bytes());
    bytes.extend_from_slice(right.as_bytes());
    domain_hash(NODE_DOMAIN, &bytes)
}

fn empty_root() -> Digest32 {
    Digest32::of(b"")
}

/// Append-only accumulator; the tree is re-folded from the stored leaves on
/// demand, which keeps append O(1) and suits the run sizes this ledger sees.
#[derive(Clone, Debug, Default)]
pub struct MerkleAccumulator {
    leaves: Vec<Digest32>,
}

impl MerkleAccumulator {
    pub fn new() -> Self {
        Self { leaves: Vec::new() }
    }

    pub fn from_leaves(leaves: Vec<Digest32>) -> Self {
        Self { leaves }
    }

    pub fn push(&mut self, leaf: Digest32) {
        self.leaves.push(leaf);
    }

    pub fn len(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn leaves(&self) -> &[Digest32] {
        &self.leaves
    }

    pub fn root(&self) -> Digest32 {
        if self.leaves.is_empty() {
            return empty_root();
        }
        let mut layer = self.leaves.clone();
        while layer.len() > 1 {
            layer = fold_layer(&layer);
        }
        layer[0]
    }

    /// Sibling path from the leaf at `index` to the current root. Stable only
    /// once the owning ledger is finalized; before that it targets the
    /// partial root over the leaves appended so far.
    pub fn path(&self, index: u64) -> Result<MerklePath, MerkleError> {
        let len = self.len();
        if index >= len {
            return Err(MerkleError::IndexOutOfRange { index, len });
        }

        let mut siblings = Vec::new();
        let mut layer = self.leaves.clone();
        let mut position = index as usize;
        while layer.len() > 1 {
            let sibling_position = position ^ 1;
            let sibling = if sibling_position < layer.len() {
                layer[sibling_position]
            } else {
                layer[position]
            };
            siblings.push(sibling);
            layer = fold_layer(&layer);
            position /= 2;
        }

        Ok(MerklePath {
            leaf_index: index,
            leaf: self.leaves[index as usize],
            siblings,
        })
    }
}

fn fold_layer(layer: &[Digest32]) -> Vec<Digest32> {
    let mut next = Vec::with_capacity(layer.len().div_ceil(2));
    for pair in layer.chunks(2) {
        let left = &pair[0];
        let right = pair.get(1).unwrap_or(left);
        next.push(hash_children(left, right));
    }
    next
}

/// Inclusion proof for one leaf; folding the siblings back up must reproduce
/// the root the proof was issued against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerklePath {
    pub leaf_index: u64,
    pub leaf: Digest32,
    pub siblings: Vec<Digest32>,
}

impl MerklePath {
    pub fn compute_root(&self) -> Digest32 {
        let mut value = self.leaf;
        let mut position = self.leaf_index;
        for sibling in &self.siblings {
            value = if position % 2 == 0 {
                hash_children(&value, sibling)
            } else {
                hash_children(sibling, &value)
            };
            position /= 2;
        }
        value
    }

    pub fn resolves_to(&self, root: &Digest32) -> bool {
        self.compute_root() == *root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn proptest_config() -> ProptestConfig {
        let cases = std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(32);
        ProptestConfig {
            cases,
            ..ProptestConfig::default()
        }
    }

    fn leaf(tag: u64) -> Digest32 {
        Digest32::of(&tag.to_le_bytes())
    }

    fn accumulator(count: u64) -> MerkleAccumulator {
        MerkleAccumulator::from_leaves((0..count).map(leaf).collect())
    }

    #[test]
    fn empty_root_is_sha256_of_nothing() {
        assert_eq!(
            MerkleAccumulator::new().root().to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let mut acc = MerkleAccumulator::new();
        acc.push(leaf(7));
        assert_eq!(acc.root(), leaf(7));
        let path = acc.path(0).expect("path");
        assert!(path.siblings.is_empty());
        assert!(path.resolves_to(&acc.root()));
    }

    #[test]
    fn odd_layer_duplicates_its_last_node() {
        let acc = accumulator(3);
        let left = hash_children(&leaf(0), &leaf(1));
        let right = hash_children(&leaf(2), &leaf(2));
        assert_eq!(acc.root(), hash_children(&left, &right));
    }

    #[test]
    fn path_rejects_out_of_range_index() {
        let acc = accumulator(4);
        assert_eq!(
            acc.path(4),
            Err(MerkleError::IndexOutOfRange { index: 4, len: 4 })
        );
    }

    #[test]
    fn forged_leaf_does_not_resolve() {
        let acc = accumulator(5);
        let root = acc.root();
        let mut path = acc.path(2).expect("path");
        path.leaf = Digest32::of(b"forged");
        assert!(!path.resolves_to(&root));
    }

    #[test]
    fn append_matches_batch_construction() {
        let mut incremental = MerkleAccumulator::new();
        for tag in 0..9 {
            incremental.push(leaf(tag));
        }
        assert_eq!(incremental.root(), accumulator(9).root());
    }

    proptest! {
        #![proptest_config(proptest_config())]

        #[test]
        fn every_leaf_resolves_to_the_root(count in 1u64..64) {
            let acc = accumulator(count);
            let root = acc.root();
            for index in 0..count {
                let path = acc.path(index).expect("path");
                prop_assert_eq!(path.leaf, leaf(index));
                prop_assert!(path.resolves_to(&root));
            }
        }

        #[test]
        fn appending_changes_the_root(count in 1u64..64) {
            let mut acc = accumulator(count);
            let before = acc.root();
            acc.push(leaf(count));
            prop_assert_ne!(before, acc.root());
        }
    }
}
