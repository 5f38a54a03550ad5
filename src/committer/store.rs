// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Interface to the local record store holding batchable pending records.
//!
//! The relational persistence behind this trait is an external
//! collaborator; the committer only needs grouping, per-group reads and
//! the commit mark. `MemoryRecordStore` backs tests and dry-run setups.

use crate::error::{ReconcilerError, ReconcilerResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// A batchable unit of off-chain work, flagged "not yet committed".
/// `digest` is the record's Merkle leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub id: u64,
    pub group_key: String,
    pub digest: [u8; 32],
}

/// A group of pending records under one owning key. Recomputed on every
/// scan; never persisted independently of the underlying records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGroup {
    pub group_key: String,
    pub pending_count: u64,
}

#[async_trait]
pub trait PendingRecordStore: Send + Sync + 'static {
    /// All groups that currently have at least one pending record.
    async fn pending_groups(&self) -> ReconcilerResult<Vec<PendingGroup>>;

    /// Every pending record in the group, in stable id order.
    async fn pending_records(&self, group_key: &str) -> ReconcilerResult<Vec<PendingRecord>>;

    /// Mark the given records committed under `root`. Called only after
    /// the on-chain submission finalized; must be all-or-nothing.
    async fn mark_committed(
        &self,
        group_key: &str,
        ids: &[u64],
        root: &[u8; 32],
    ) -> ReconcilerResult<()>;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record: PendingRecord,
    committed_root: Option<[u8; 32]>,
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<u64, StoredRecord>>,
    fail_marks: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_pending(&self, group_key: &str, id: u64, payload: &[u8]) {
        let record = PendingRecord {
            id,
            group_key: group_key.to_string(),
            digest: super::merkle::record_digest(payload),
        };
        self.records.write().await.insert(
            id,
            StoredRecord {
                record,
                committed_root: None,
            },
        );
    }

    pub async fn committed_count(&self, group_key: &str) -> u64 {
        self.records
            .read()
            .await
            .values()
            .filter(|s| s.record.group_key == group_key && s.committed_root.is_some())
            .count() as u64
    }

    pub async fn pending_count(&self, group_key: &str) -> u64 {
        self.records
            .read()
            .await
            .values()
            .filter(|s| s.record.group_key == group_key && s.committed_root.is_none())
            .count() as u64
    }

    /// Make the next `mark_committed` calls fail, for store-failure tests.
    pub fn set_fail_marks(&self, fail: bool) {
        self.fail_marks.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PendingRecordStore for MemoryRecordStore {
    async fn pending_groups(&self) -> ReconcilerResult<Vec<PendingGroup>> {
        let records = self.records.read().await;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for stored in records.values() {
            if stored.committed_root.is_none() {
                *counts.entry(stored.record.group_key.clone()).or_default() += 1;
            }
        }
        let mut groups: Vec<PendingGroup> = counts
            .into_iter()
            .map(|(group_key, pending_count)| PendingGroup {
                group_key,
                pending_count,
            })
            .collect();
        groups.sort_by(|a, b| a.group_key.cmp(&b.group_key));
        Ok(groups)
    }

    async fn pending_records(&self, group_key: &str) -> ReconcilerResult<Vec<PendingRecord>> {
        let records = self.records.read().await;
        let mut pending: Vec<PendingRecord> = records
            .values()
            .filter(|s| s.record.group_key == group_key && s.committed_root.is_none())
            .map(|s| s.record.clone())
            .collect();
        pending.sort_by_key(|r| r.id);
        Ok(pending)
    }

    async fn mark_committed(
        &self,
        group_key: &str,
        ids: &[u64],
        root: &[u8; 32],
    ) -> ReconcilerResult<()> {
        if self.fail_marks.load(Ordering::SeqCst) {
            return Err(ReconcilerError::Storage(
                "simulated mark_committed failure".to_string(),
            ));
        }
        let mut records = self.records.write().await;
        for id in ids {
            match records.get_mut(id) {
                Some(stored) if stored.record.group_key == group_key => {
                    stored.committed_root = Some(*root);
                }
                _ => {
                    return Err(ReconcilerError::Storage(format!(
                        "record {} not found in group {}",
                        id, group_key
                    )))
                }
            }
        }
        Ok(())
    }
}
