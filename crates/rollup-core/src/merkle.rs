// Copyright [2026] [Rollup Machine Manager Contributors]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Append-only complete Merkle trees and the proofs they produce.
//!
//! Nodes are addressed in bytes: a node of log2 size `s` spans `2^s` bytes
//! and sits at an address aligned to `2^s`. Leaves are keccak-256 digests of
//! `2^LOG2_KECCAK_SIZE`-byte words, so a pristine (all-zero) subtree of any
//! size has a hash that is independent of its position.

use crate::hash::{keccak, keccak_pair, Hash};
use crate::LOG2_KECCAK_SIZE;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MerkleError {
    #[error("tree is full")]
    TreeFull,
    #[error("address is not aligned to the node size")]
    MisalignedAddress,
    #[error("address is out of range")]
    AddressOutOfRange,
    #[error("log2 size is out of range")]
    SizeOutOfRange,
    #[error("proof has wrong number of sibling hashes")]
    WrongSiblingCount,
}

/// Proof that a target node belongs to a Merkle tree.
///
/// `sibling_hashes[i]` is the sibling of the ancestor of the target at level
/// `log2_target_size + i`, so the list reads bottom-up and has exactly
/// `log2_root_size - log2_target_size` entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub target_address: u64,
    pub log2_target_size: u32,
    pub target_hash: Hash,
    pub log2_root_size: u32,
    pub root_hash: Hash,
    pub sibling_hashes: Vec<Hash>,
}

impl Proof {
    /// Recomputes the root implied by the target and sibling hashes.
    pub fn compute_root(&self) -> Result<Hash, MerkleError> {
        if self.log2_target_size > self.log2_root_size || self.log2_root_size > 64 {
            return Err(MerkleError::SizeOutOfRange);
        }
        let depth = (self.log2_root_size - self.log2_target_size) as usize;
        if self.sibling_hashes.len() != depth {
            return Err(MerkleError::WrongSiblingCount);
        }
        let mut hash = self.target_hash;
        for (i, sibling) in self.sibling_hashes.iter().enumerate() {
            let level = self.log2_target_size + i as u32;
            if (self.target_address >> level) & 1 == 1 {
                hash = keccak_pair(sibling, &hash);
            } else {
                hash = keccak_pair(&hash, sibling);
            }
        }
        Ok(hash)
    }

    pub fn verify(&self) -> bool {
        self.compute_root()
            .map(|root| root == self.root_hash)
            .unwrap_or(false)
    }

    /// Restricts the proof to the subtree of log2 size `log2_from` that
    /// contains the target, turning a whole-tree proof into a proof against
    /// that subtree's root. The target size must be unchanged
    /// (`log2_to == self.log2_target_size`).
    pub fn slice(&self, log2_from: u32, log2_to: u32) -> Result<Proof, MerkleError> {
        if log2_to != self.log2_target_size
            || log2_from < log2_to
            || log2_from > self.log2_root_size
        {
            return Err(MerkleError::SizeOutOfRange);
        }
        let depth = (self.log2_root_size - self.log2_target_size) as usize;
        if self.sibling_hashes.len() != depth {
            return Err(MerkleError::WrongSiblingCount);
        }
        let keep = (log2_from - log2_to) as usize;
        let mask = if log2_from == 64 {
            u64::MAX
        } else {
            (1u64 << log2_from) - 1
        };
        let mut sliced = Proof {
            target_address: self.target_address & mask,
            log2_target_size: log2_to,
            target_hash: self.target_hash,
            log2_root_size: log2_from,
            root_hash: [0u8; 32],
            sibling_hashes: self.sibling_hashes[..keep].to_vec(),
        };
        sliced.root_hash = sliced.compute_root()?;
        Ok(sliced)
    }
}

/// Hash of a pristine subtree of log2 size `log2_size` whose leaves are
/// `2^log2_leaf_size`-byte words.
pub fn pristine_hash(log2_leaf_size: u32, log2_size: u32) -> Hash {
    let mut hash = keccak(&vec![0u8; 1usize << log2_leaf_size]);
    for _ in log2_leaf_size..log2_size {
        hash = keccak_pair(&hash, &hash);
    }
    hash
}

/// Append-only Merkle tree of fixed depth. Leaves are pushed left to right;
/// absent leaves read as pristine words.
#[derive(Debug, Clone)]
pub struct CompleteTree {
    log2_root_size: u32,
    log2_leaf_size: u32,
    /// `levels[k]` holds the non-pristine nodes of log2 size
    /// `log2_leaf_size + k`; `levels` has one vector per level up to the root.
    levels: Vec<Vec<Hash>>,
    /// `pristine[k]` is the pristine node hash at level `k`.
    pristine: Vec<Hash>,
}

impl CompleteTree {
    pub fn new(log2_root_size: u32, log2_leaf_size: u32) -> Result<Self, MerkleError> {
        if log2_leaf_size > log2_root_size || log2_root_size > 64 || log2_leaf_size > 24 {
            return Err(MerkleError::SizeOutOfRange);
        }
        let height = (log2_root_size - log2_leaf_size) as usize;
        let mut pristine = Vec::with_capacity(height + 1);
        let mut hash = keccak(&vec![0u8; 1usize << log2_leaf_size]);
        pristine.push(hash);
        for _ in 0..height {
            hash = keccak_pair(&hash, &hash);
            pristine.push(hash);
        }
        Ok(Self {
            log2_root_size,
            log2_leaf_size,
            levels: vec![Vec::new(); height + 1],
            pristine,
        })
    }

    fn height(&self) -> usize {
        (self.log2_root_size - self.log2_leaf_size) as usize
    }

    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    fn node_at(&self, level: usize, index: u64) -> Hash {
        self.levels[level]
            .get(index as usize)
            .copied()
            .unwrap_or(self.pristine[level])
    }

    pub fn root_hash(&self) -> Hash {
        self.node_at(self.height(), 0)
    }

    /// Appends a leaf and recomputes the right spine up to the root.
    pub fn push(&mut self, leaf: Hash) -> Result<(), MerkleError> {
        let height = self.height();
        if height < 64 && self.levels[0].len() as u64 >= 1u64 << height {
            return Err(MerkleError::TreeFull);
        }
        self.levels[0].push(leaf);
        let mut index = self.levels[0].len() - 1;
        for level in 1..=height {
            let parent = index / 2;
            let left = self.levels[level - 1][2 * parent];
            let right = self
                .levels[level - 1]
                .get(2 * parent + 1)
                .copied()
                .unwrap_or(self.pristine[level - 1]);
            let node = keccak_pair(&left, &right);
            if self.levels[level].len() == parent {
                self.levels[level].push(node);
            } else {
                self.levels[level][parent] = node;
            }
            index = parent;
        }
        Ok(())
    }

    /// Proof that the node of log2 size `log2_size` at `address` belongs to
    /// the tree.
    pub fn proof(&self, address: u64, log2_size: u32) -> Result<Proof, MerkleError> {
        if log2_size < self.log2_leaf_size || log2_size > self.log2_root_size {
            return Err(MerkleError::SizeOutOfRange);
        }
        if self.log2_root_size < 64 && address >= 1u64 << self.log2_root_size {
            return Err(MerkleError::AddressOutOfRange);
        }
        if address & ((1u64 << log2_size) - 1) != 0 {
            return Err(MerkleError::MisalignedAddress);
        }
        let first_level = (log2_size - self.log2_leaf_size) as usize;
        let mut index = address >> log2_size;
        let target_hash = self.node_at(first_level, index);
        let mut sibling_hashes = Vec::with_capacity(self.height() - first_level);
        for level in first_level..self.height() {
            sibling_hashes.push(self.node_at(level, index ^ 1));
            index >>= 1;
        }
        Ok(Proof {
            target_address: address,
            log2_target_size: log2_size,
            target_hash,
            log2_root_size: self.log2_root_size,
            root_hash: self.root_hash(),
            sibling_hashes,
        })
    }
}

/// Builds the word-level Merkle tree of a memory range from its contents.
/// Data shorter than `2^log2_size` bytes reads as zero-padded; a trailing
/// partial word is zero-padded as well.
pub fn range_tree(data: &[u8], log2_size: u32) -> Result<CompleteTree, MerkleError> {
    let word_size = 1usize << LOG2_KECCAK_SIZE;
    if log2_size < LOG2_KECCAK_SIZE || (data.len() as u64) > 1u64 << log2_size {
        return Err(MerkleError::SizeOutOfRange);
    }
    let mut tree = CompleteTree::new(log2_size, LOG2_KECCAK_SIZE)?;
    for word in data.chunks(word_size) {
        if word.len() == word_size {
            tree.push(keccak(word))?;
        } else {
            let mut padded = vec![0u8; word_size];
            padded[..word.len()].copy_from_slice(word);
            tree.push(keccak(&padded))?;
        }
    }
    Ok(tree)
}
