// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Threshold batch committer.
//!
//! Periodically scans the record store for groups of pending records
//! whose count has crossed the configured threshold and publishes one
//! aggregate commitment (Merkle root) per group on-chain. The threshold
//! only gates whether a group commits; a committing group always covers
//! all of its currently-pending records.
//!
//! State machine per cycle: Idle -> Scanning -> (per group: Committing ->
//! Updated | Skipped | Errored) -> Idle. Cycles never overlap; per-group
//! failures leave the group pending for the next cycle without touching
//! the other groups.

pub mod merkle;
pub mod store;

use crate::chain_client::{await_finalized, ChainCall, ChainClient, Signer};
use crate::config::WorkerConfig;
use crate::error::ReconcilerResult;
use crate::metrics::ReconcilerMetrics;
use crate::processed_cache::ProcessedCache;
use std::sync::Arc;
use std::time::Duration;
use store::PendingRecordStore;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_FINALITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of one group inside a commit cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupStatus {
    Updated { records: u64, root: [u8; 32] },
    Skipped { reason: String },
    Errored { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    pub group_key: String,
    pub status: GroupStatus,
}

/// Tally of one commit cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleResult {
    pub groups_processed: u64,
    pub groups_updated: u64,
    pub groups_skipped: u64,
    pub groups_errored: u64,
    pub outcomes: Vec<GroupOutcome>,
}

/// Read-only aggregate over the store, without performing any commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStats {
    pub total_pending: u64,
    pub qualifying_groups: u64,
}

struct RunState {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BatchCommitter<C: ChainClient, S: PendingRecordStore> {
    client: Arc<C>,
    store: Arc<S>,
    signer: Signer,
    config: WorkerConfig,
    finality_timeout: Duration,
    // Roots already accepted on-chain this process lifetime. Guards the
    // crash window between chain success and the store mark: an identical
    // recomputed root skips resubmission and retries the mark only.
    committed_roots: ProcessedCache<String>,
    // group keys seen at the previous scan, so drained groups can have
    // their pending gauge dropped back to zero
    gauge_groups: Mutex<Vec<String>>,
    running: Mutex<Option<RunState>>,
    metrics: Option<Arc<ReconcilerMetrics>>,
}

impl<C: ChainClient, S: PendingRecordStore> BatchCommitter<C, S> {
    pub fn new(client: Arc<C>, store: Arc<S>, signer: Signer, config: WorkerConfig) -> Self {
        Self {
            client,
            store,
            signer,
            config,
            finality_timeout: DEFAULT_FINALITY_TIMEOUT,
            committed_roots: ProcessedCache::new(),
            gauge_groups: Mutex::new(Vec::new()),
            running: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ReconcilerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_finality_timeout(mut self, timeout: Duration) -> Self {
        self.finality_timeout = timeout;
        self
    }

    /// Run one cycle immediately, then recurring cycles every configured
    /// interval. Idempotent if already running.
    pub async fn start(self: Arc<Self>) {
        let mut running = self.running.lock().await;
        if let Some(state) = running.as_ref() {
            if !state.handle.is_finished() {
                info!("[committer] already running, ignoring start");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let worker = self.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            worker.run_loop(loop_cancel).await;
        });
        *running = Some(RunState { cancel, handle });
        info!(
            "[committer] started (interval={:?}, threshold={}, dry_run={})",
            self.config.interval, self.config.threshold, self.config.dry_run
        );
    }

    /// Cancel the recurring timer. Safe to call when not running and
    /// concurrently with an in-flight cycle, which may still complete.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(state) = running.take() {
            state.cancel.cancel();
            info!("[committer] stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        let running = self.running.lock().await;
        running
            .as_ref()
            .map(|state| !state.handle.is_finished())
            .unwrap_or(false)
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let mut interval = time::interval(self.config.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[committer] cycle loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    match self.run_update().await {
                        Ok(result) => {
                            if result.groups_processed > 0 {
                                info!(
                                    "[committer] cycle done: processed={} updated={} skipped={} errored={}",
                                    result.groups_processed,
                                    result.groups_updated,
                                    result.groups_skipped,
                                    result.groups_errored
                                );
                            }
                        }
                        Err(e) => {
                            warn!("[committer] cycle failed, retrying next interval: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// One full scan-and-commit cycle. Callable directly, bypassing the
    /// timer, for on-demand or test invocation.
    pub async fn run_update(&self) -> ReconcilerResult<CycleResult> {
        if let Some(m) = &self.metrics {
            m.committer_cycles.inc();
        }

        let groups = self.store.pending_groups().await?;
        if let Some(m) = &self.metrics {
            let mut tracked = self.gauge_groups.lock().await;
            for key in tracked.iter() {
                if !groups.iter().any(|g| &g.group_key == key) {
                    m.committer_pending_records
                        .with_label_values(&[key])
                        .set(0);
                }
            }
            *tracked = groups.iter().map(|g| g.group_key.clone()).collect();
        }
        let mut result = CycleResult::default();

        for group in groups {
            if let Some(m) = &self.metrics {
                m.committer_pending_records
                    .with_label_values(&[&group.group_key])
                    .set(group.pending_count as i64);
            }
            if group.pending_count < self.config.threshold {
                debug!(
                    "[committer] group {} below threshold ({} < {}), leaving pending",
                    group.group_key, group.pending_count, self.config.threshold
                );
                continue;
            }

            result.groups_processed += 1;
            let outcome = self.commit_group(&group.group_key, &self.signer).await;
            match &outcome.status {
                GroupStatus::Updated { records, .. } => {
                    result.groups_updated += 1;
                    if let Some(m) = &self.metrics {
                        m.committer_groups_updated.inc();
                        m.committer_records_committed.inc_by(*records);
                    }
                }
                GroupStatus::Skipped { .. } => {
                    result.groups_skipped += 1;
                    if let Some(m) = &self.metrics {
                        m.committer_groups_skipped.inc();
                    }
                }
                GroupStatus::Errored { .. } => {
                    result.groups_errored += 1;
                }
            }
            result.outcomes.push(outcome);
        }

        Ok(result)
    }

    /// Commit one group regardless of the threshold gate, optionally with
    /// a one-off signer. Used for manual remediation and testing.
    pub async fn force_group_update(
        &self,
        group_key: &str,
        signer: Option<&Signer>,
    ) -> GroupOutcome {
        info!("[committer] forced update for group {}", group_key);
        self.commit_group(group_key, signer.unwrap_or(&self.signer))
            .await
    }

    /// Total pending records and how many groups currently qualify for
    /// commitment, without performing any commit.
    pub async fn pending_stats(&self) -> ReconcilerResult<PendingStats> {
        let groups = self.store.pending_groups().await?;
        let total_pending = groups.iter().map(|g| g.pending_count).sum();
        let qualifying_groups = groups
            .iter()
            .filter(|g| g.pending_count >= self.config.threshold)
            .count() as u64;
        Ok(PendingStats {
            total_pending,
            qualifying_groups,
        })
    }

    async fn commit_group(&self, group_key: &str, signer: &Signer) -> GroupOutcome {
        let status = match self.try_commit_group(group_key, signer).await {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    "[committer] group {} errored, records stay pending: {}",
                    group_key, e
                );
                if let Some(m) = &self.metrics {
                    m.committer_groups_errored
                        .with_label_values(&[e.error_type()])
                        .inc();
                }
                GroupStatus::Errored {
                    error: e.to_string(),
                }
            }
        };
        GroupOutcome {
            group_key: group_key.to_string(),
            status,
        }
    }

    async fn try_commit_group(
        &self,
        group_key: &str,
        signer: &Signer,
    ) -> ReconcilerResult<GroupStatus> {
        let records = self.store.pending_records(group_key).await?;
        if records.is_empty() {
            return Ok(GroupStatus::Skipped {
                reason: "no pending records".to_string(),
            });
        }

        if self.config.dry_run {
            info!(
                "[committer] dry-run: would commit {} records for group {}",
                records.len(),
                group_key
            );
            return Ok(GroupStatus::Skipped {
                reason: "dry-run".to_string(),
            });
        }

        let leaves: Vec<[u8; 32]> = records.iter().map(|r| r.digest).collect();
        let root = merkle::merkle_root(&leaves);
        let root_hex = hex::encode(root);
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();

        if self.committed_roots.has(&root_hex).await {
            // The chain already accepted this exact commitment; only the
            // store mark is outstanding.
            info!(
                "[committer] root {} for group {} already on-chain, retrying store mark",
                root_hex, group_key
            );
        } else {
            let call = ChainCall::CommitBatchRoot {
                group_key: group_key.to_string(),
                root,
                record_count: records.len() as u64,
            };
            let submitted_at = Instant::now();
            let mut status_rx = self.client.submit_transaction(call, signer).await?;
            let finalized = await_finalized(&mut status_rx, self.finality_timeout).await?;
            if let Some(m) = &self.metrics {
                m.tx_finality_latency
                    .with_label_values(&["commit_batch_root"])
                    .observe(submitted_at.elapsed().as_secs_f64());
            }
            self.committed_roots.add(root_hex.clone()).await;
            info!(
                "[committer] committed root {} for group {} ({} records) in block {}",
                root_hex,
                group_key,
                records.len(),
                finalized.block_hash
            );
        }

        self.store.mark_committed(group_key, &ids, &root).await?;
        Ok(GroupStatus::Updated {
            records: ids.len() as u64,
            root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::store::MemoryRecordStore;
    use super::*;
    use crate::test_utils::{MockChainClient, SubmitBehavior};
    use serde_json::json;

    fn committer(
        client: Arc<MockChainClient>,
        store: Arc<MemoryRecordStore>,
        threshold: u64,
        dry_run: bool,
    ) -> BatchCommitter<MockChainClient, MemoryRecordStore> {
        BatchCommitter::new(
            client,
            store,
            Signer::new("committer", "//Committer"),
            WorkerConfig::new(Duration::from_millis(10), threshold, dry_run),
        )
        .with_finality_timeout(Duration::from_secs(1))
    }

    async fn seed_couriers(store: &MemoryRecordStore) {
        for i in 0..137u64 {
            store
                .insert_pending("courier-a", i, format!("a-{}", i).as_bytes())
                .await;
        }
        for i in 0..40u64 {
            store
                .insert_pending("courier-b", 1000 + i, format!("b-{}", i).as_bytes())
                .await;
        }
    }

    #[tokio::test]
    async fn test_cycle_commits_whole_group_over_threshold() {
        let client = Arc::new(MockChainClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        seed_couriers(&store).await;

        let committer = committer(client.clone(), store.clone(), 100, false);
        let result = committer.run_update().await.unwrap();

        assert_eq!(result.groups_updated, 1);
        assert_eq!(result.groups_skipped, 0);
        assert_eq!(result.groups_errored, 0);
        // all 137 pending records committed, not merely threshold-many
        assert_eq!(store.committed_count("courier-a").await, 137);
        assert_eq!(store.pending_count("courier-a").await, 0);
        // courier-b stays untouched
        assert_eq!(store.committed_count("courier-b").await, 0);
        assert_eq!(store.pending_count("courier-b").await, 40);
        assert_eq!(client.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_dry_run_never_touches_the_chain() {
        let client = Arc::new(MockChainClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        seed_couriers(&store).await;

        let committer = committer(client.clone(), store.clone(), 100, true);
        let result = committer.run_update().await.unwrap();

        assert_eq!(result.groups_skipped, 1);
        assert_eq!(result.groups_updated, 0);
        assert_eq!(client.submission_count().await, 0);
        assert_eq!(store.committed_count("courier-a").await, 0);
    }

    #[tokio::test]
    async fn test_no_partial_commit_on_submission_failure() {
        let client = Arc::new(MockChainClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        seed_couriers(&store).await;

        client
            .push_submit_behavior(SubmitBehavior::FinalizeWithDispatchError(json!({
                "module": { "section": "commitments", "name": "RootRejected", "docs": [] }
            })))
            .await;

        let committer = committer(client.clone(), store.clone(), 100, false);
        let result = committer.run_update().await.unwrap();

        assert_eq!(result.groups_errored, 1);
        assert_eq!(result.groups_updated, 0);
        // zero records marked committed on failure
        assert_eq!(store.committed_count("courier-a").await, 0);
        assert_eq!(store.pending_count("courier-a").await, 137);

        // the failed group is retried on the next cycle
        let result = committer.run_update().await.unwrap();
        assert_eq!(result.groups_updated, 1);
        assert_eq!(store.committed_count("courier-a").await, 137);
    }

    #[tokio::test]
    async fn test_group_failure_does_not_stop_other_groups() {
        let client = Arc::new(MockChainClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        for i in 0..5u64 {
            store.insert_pending("alpha", i, b"a").await;
        }
        for i in 0..5u64 {
            store.insert_pending("beta", 100 + i, b"b").await;
        }

        // alpha commits first (groups scan in sorted order) and fails
        client
            .push_submit_behavior(SubmitBehavior::FinalizeWithDispatchError(json!({
                "module": { "section": "commitments", "name": "RootRejected", "docs": [] }
            })))
            .await;

        let committer = committer(client.clone(), store.clone(), 5, false);
        let result = committer.run_update().await.unwrap();

        assert_eq!(result.groups_processed, 2);
        assert_eq!(result.groups_errored, 1);
        assert_eq!(result.groups_updated, 1);
        assert_eq!(store.committed_count("beta").await, 5);
        assert_eq!(store.committed_count("alpha").await, 0);
    }

    #[tokio::test]
    async fn test_force_group_update_bypasses_threshold() {
        let client = Arc::new(MockChainClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        for i in 0..3u64 {
            store.insert_pending("courier-c", i, b"c").await;
        }

        let committer = committer(client.clone(), store.clone(), 100, false);

        // normal cycle leaves the small group pending
        let result = committer.run_update().await.unwrap();
        assert_eq!(result.groups_processed, 0);

        let outcome = committer.force_group_update("courier-c", None).await;
        assert!(matches!(
            outcome.status,
            GroupStatus::Updated { records: 3, .. }
        ));
        assert_eq!(store.committed_count("courier-c").await, 3);
    }

    #[tokio::test]
    async fn test_force_group_update_accepts_override_signer() {
        let client = Arc::new(MockChainClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        for i in 0..2u64 {
            store.insert_pending("epsilon", i, b"e").await;
        }

        let committer = committer(client.clone(), store.clone(), 100, false);
        let ops = Signer::new("ops-override", "//Ops");
        let outcome = committer.force_group_update("epsilon", Some(&ops)).await;
        assert!(matches!(outcome.status, GroupStatus::Updated { .. }));
        assert_eq!(
            client.submitted_accounts().await,
            vec!["ops-override".to_string()]
        );
    }

    #[tokio::test]
    async fn test_pending_gauge_drops_to_zero_after_group_drains() {
        let client = Arc::new(MockChainClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        for i in 0..5u64 {
            store.insert_pending("delta", i, b"d").await;
        }
        let metrics = Arc::new(ReconcilerMetrics::new_for_testing());
        let committer =
            committer(client.clone(), store.clone(), 5, false).with_metrics(metrics.clone());

        committer.run_update().await.unwrap();
        assert_eq!(
            metrics
                .committer_pending_records
                .with_label_values(&["delta"])
                .get(),
            5
        );

        // the drained group disappears from the next scan and its gauge
        // falls back to zero instead of freezing at the last value
        committer.run_update().await.unwrap();
        assert_eq!(
            metrics
                .committer_pending_records
                .with_label_values(&["delta"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_store_mark_failure_does_not_resubmit_same_root() {
        let client = Arc::new(MockChainClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        for i in 0..5u64 {
            store.insert_pending("gamma", i, b"g").await;
        }

        let committer = committer(client.clone(), store.clone(), 5, false);

        store.set_fail_marks(true);
        let result = committer.run_update().await.unwrap();
        assert_eq!(result.groups_errored, 1);
        assert_eq!(client.submission_count().await, 1);

        // the chain accepted the root; the retry only repeats the mark
        store.set_fail_marks(false);
        let result = committer.run_update().await.unwrap();
        assert_eq!(result.groups_updated, 1);
        assert_eq!(client.submission_count().await, 1);
        assert_eq!(store.committed_count("gamma").await, 5);
    }

    #[tokio::test]
    async fn test_pending_stats_reads_without_committing() {
        let client = Arc::new(MockChainClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        seed_couriers(&store).await;

        let committer = committer(client.clone(), store.clone(), 100, false);
        let stats = committer.pending_stats().await.unwrap();
        assert_eq!(
            stats,
            PendingStats {
                total_pending: 177,
                qualifying_groups: 1
            }
        );
        assert_eq!(client.submission_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_cancels() {
        let client = Arc::new(MockChainClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        let committer = Arc::new(committer(client.clone(), store.clone(), 100, false));

        committer.clone().start().await;
        committer.clone().start().await;
        assert!(committer.is_running().await);

        committer.stop().await;
        // stop on an already-stopped worker is a no-op
        committer.stop().await;
    }
}
