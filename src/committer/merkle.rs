// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Aggregate commitment over a batch of record digests.
//!
//! Standard binary Merkle tree: leaves are the record digests in store
//! order, inner nodes hash the concatenation of their children, an odd
//! node at any level is paired with itself. The root summarizes the
//! batch so its integrity can later be verified without republishing
//! every record.

use sha2::{Digest, Sha256};

pub const EMPTY_ROOT: [u8; 32] = [0u8; 32];

/// Digest of one record payload, used as its Merkle leaf.
pub fn record_digest(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Merkle root over the given leaves. An empty batch maps to the all-zero
/// root, which the chain rejects; callers never submit empty batches.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return EMPTY_ROOT;
    }
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(hash_pair(&pair[0], right));
        }
        level = next;
    }
    level[0]
}
