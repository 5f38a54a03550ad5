// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Append-only per-worker dedup ledger.
//!
//! Each worker owns one instance keyed by its identifier type (proposal
//! hash, commitment root, approval id). Entries live for the remainder of
//! the process; nothing is persisted across restarts, so every worker
//! either seeds the cache at startup or accepts at-least-once
//! re-processing of identifiers it saw before the restart.

use std::collections::HashSet;
use std::hash::Hash;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct ProcessedCache<T> {
    seen: RwLock<HashSet<T>>,
}

impl<T> ProcessedCache<T>
where
    T: Eq + Hash + Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            seen: RwLock::new(HashSet::new()),
        }
    }

    pub async fn has(&self, id: &T) -> bool {
        self.seen.read().await.contains(id)
    }

    /// Record `id` as processed. Returns false if it was already present.
    pub async fn add(&self, id: T) -> bool {
        self.seen.write().await.insert(id)
    }

    /// Bulk-insert identifiers, typically at worker startup. Returns the
    /// number of newly added entries.
    pub async fn seed(&self, ids: impl IntoIterator<Item = T>) -> usize {
        let mut seen = self.seen.write().await;
        let before = seen.len();
        seen.extend(ids);
        seen.len() - before
    }

    pub async fn len(&self) -> usize {
        self.seen.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.read().await.is_empty()
    }
}
