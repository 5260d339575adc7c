//! Bitcoin transaction merkle root.
//!
//! Leaves are txids; internal nodes are `sha256d(left || right)`.
//! Odd-length layers are padded by duplicating the last element.
//! Empty trees produce [`Hash256::ZERO`].

use crate::crypto::sha256d;
use crate::types::{Hash256, Transaction};

/// Internal node hash: `sha256d(left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    sha256d(&buf)
}

/// Merkle root over `leaves` (typically txids).
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    merkle_root_checked(leaves).0
}

/// Merkle root plus whether any layer paired a node with an identical
/// sibling. Such a tree has the same root as a shorter leaf list, so a body
/// that produces it may not be the one the header committed to.
pub fn merkle_root_checked(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return (Hash256::ZERO, false);
    }
    let mut mutated = false;
    let mut current = leaves.to_vec();
    while current.len() > 1 {
        mutated |= current.chunks_exact(2).any(|pair| pair[0] == pair[1]);
        current = next_layer(&current);
    }
    (current[0], mutated)
}

/// Merkle root of a transaction list.
pub fn transactions_root(txs: &[Transaction]) -> Hash256 {
    let ids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
    merkle_root(&ids)
}

fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    layer
        .chunks(2)
        .map(|pair| node_hash(&pair[0], pair.get(1).unwrap_or(&pair[0])))
        .collect()
}
