// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Approval-polling settlement executor.
//!
//! Polls the chain's approved-but-unpaid payout list on a timer, diffs it
//! against a process-local dedup ledger and submits the releasing
//! transaction for every new id. The chain list is the sole source of
//! truth for what is owed; the ledger only prevents duplicate submission
//! within one process lifetime. At startup the current list is seeded into
//! the ledger, so ids approved before this process are presumed already
//! handled by the previous one.
//!
//! An id is marked processed only after its transaction finalizes without
//! dispatch error (or the entry turns out to be gone). A timed-out or
//! rejected settlement keeps the id unprocessed and it is retried on a
//! later poll.

use crate::chain_client::{await_finalized, ChainCall, ChainClient, Signer};
use crate::config::WorkerConfig;
use crate::error::ReconcilerResult;
use crate::events::decode_paid_event;
use crate::metrics::ReconcilerMetrics;
use crate::processed_cache::ProcessedCache;
use crate::retry_with_max_elapsed_time;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_FINALITY_TIMEOUT: Duration = Duration::from_secs(60);
const SEED_MAX_ELAPSED: Duration = Duration::from_secs(30);

/// Result of one settlement attempt for a single approval id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// The payout finalized; beneficiary and amount as reported by the
    /// chain's payment event, falling back to the stored detail.
    Paid { beneficiary: String, amount: u128 },
    /// The id was already in the dedup ledger; nothing was submitted.
    AlreadyProcessed,
    /// The approval vanished between listing and detail lookup, or dry-run
    /// suppressed the submission.
    NothingToDo,
}

/// Tally of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollResult {
    pub approved_seen: u64,
    pub newly_settled: u64,
    pub failed: u64,
}

struct RunState {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SettlementExecutor<C: ChainClient> {
    client: Arc<C>,
    signer: Signer,
    config: WorkerConfig,
    finality_timeout: Duration,
    processed: ProcessedCache<u64>,
    running: Mutex<Option<RunState>>,
    metrics: Option<Arc<ReconcilerMetrics>>,
}

impl<C: ChainClient> SettlementExecutor<C> {
    pub fn new(client: Arc<C>, signer: Signer, config: WorkerConfig) -> Self {
        Self {
            client,
            signer,
            config,
            finality_timeout: DEFAULT_FINALITY_TIMEOUT,
            processed: ProcessedCache::new(),
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

    /// Seed the dedup ledger from the current approved list, then poll on
    /// the configured interval. Idempotent if already running.
    pub async fn start(self: Arc<Self>) {
        let mut running = self.running.lock().await;
        if let Some(state) = running.as_ref() {
            if !state.handle.is_finished() {
                info!("[settlement] already running, ignoring start");
                return;
            }
        }

        self.seed_ledger().await;

        let cancel = CancellationToken::new();
        let worker = self.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            worker.run_loop(loop_cancel).await;
        });
        *running = Some(RunState { cancel, handle });
        info!(
            "[settlement] started (interval={:?}, dry_run={})",
            self.config.interval, self.config.dry_run
        );
    }

    /// Cancel the recurring timer. Safe to call when not running; an
    /// in-flight poll may still complete.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(state) = running.take() {
            state.cancel.cancel();
            info!("[settlement] stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        let running = self.running.lock().await;
        running
            .as_ref()
            .map(|state| !state.handle.is_finished())
            .unwrap_or(false)
    }

    // Entries approved before this process started are presumed handled
    // by its predecessor. If seeding keeps failing the worker starts with
    // an empty ledger and may resubmit; the chain rejects duplicates.
    async fn seed_ledger(&self) {
        match retry_with_max_elapsed_time!(self.client.approved_payouts(), SEED_MAX_ELAPSED) {
            Ok(Ok(ids)) => {
                let count = ids.len();
                self.processed.seed(ids).await;
                info!(
                    "[settlement] seeded {} pre-existing approvals as already processed",
                    count
                );
            }
            Ok(Err(e)) | Err(e) => {
                warn!(
                    "[settlement] could not seed ledger, starting empty: {}",
                    e
                );
            }
        }
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let mut interval = time::interval(self.config.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[settlement] poll loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(result) => {
                            if result.newly_settled > 0 || result.failed > 0 {
                                info!(
                                    "[settlement] poll done: approved={} settled={} failed={}",
                                    result.approved_seen, result.newly_settled, result.failed
                                );
                            }
                        }
                        Err(e) => {
                            warn!("[settlement] poll failed, retrying next interval: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// One poll cycle: list approved ids, settle every id not yet in the
    /// ledger, in ascending order. Per-id failures are logged and the id
    /// stays eligible; they never abort the rest of the cycle.
    pub async fn poll_once(&self) -> ReconcilerResult<PollResult> {
        if let Some(m) = &self.metrics {
            m.settlement_polls.inc();
        }

        let mut approved = self.client.approved_payouts().await?;
        approved.sort_unstable();

        let mut result = PollResult {
            approved_seen: approved.len() as u64,
            ..Default::default()
        };
        for id in approved {
            if self.processed.has(&id).await {
                continue;
            }
            match self.execute_settlement(id).await {
                Ok(SettlementOutcome::Paid {
                    beneficiary,
                    amount,
                }) => {
                    result.newly_settled += 1;
                    info!(
                        "[settlement] payout {} settled: {} to {}",
                        id, amount, beneficiary
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    result.failed += 1;
                    warn!(
                        "[settlement] payout {} failed, will retry next poll: {}",
                        id, e
                    );
                }
            }
        }
        Ok(result)
    }

    /// Settle one approval id. Marks the id processed only on finalized
    /// success or when the approval no longer exists.
    pub async fn execute_settlement(&self, id: u64) -> ReconcilerResult<SettlementOutcome> {
        if self.processed.has(&id).await {
            debug!("[settlement] payout {} already processed, skipping", id);
            if let Some(m) = &self.metrics {
                m.settlement_already_processed.inc();
            }
            return Ok(SettlementOutcome::AlreadyProcessed);
        }

        let detail = self.client.payout_detail(id).await?;
        let Some(detail) = detail else {
            // gone from the approved list, so there is nothing left to pay
            info!("[settlement] payout {} no longer approved, marking done", id);
            self.processed.add(id).await;
            return Ok(SettlementOutcome::NothingToDo);
        };

        if self.config.dry_run {
            info!(
                "[settlement] dry-run: would pay {} to {} for payout {}",
                detail.amount, detail.beneficiary, id
            );
            return Ok(SettlementOutcome::NothingToDo);
        }

        let submitted_at = Instant::now();
        let mut status_rx = self
            .client
            .submit_transaction(ChainCall::ExecutePayout { id }, &self.signer)
            .await?;
        if let Some(m) = &self.metrics {
            m.settlement_submitted.inc();
        }

        let finalized = match await_finalized(&mut status_rx, self.finality_timeout).await {
            Ok(finalized) => finalized,
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.settlement_failed
                        .with_label_values(&[e.error_type()])
                        .inc();
                }
                return Err(e);
            }
        };
        if let Some(m) = &self.metrics {
            m.tx_finality_latency
                .with_label_values(&["execute_payout"])
                .observe(submitted_at.elapsed().as_secs_f64());
            m.settlement_confirmed.inc();
        }
        self.processed.add(id).await;

        // prefer the chain-reported payment details over the stored ones
        let (beneficiary, amount) = finalized
            .events
            .iter()
            .find_map(decode_paid_event)
            .filter(|(paid_id, _, _)| *paid_id == id)
            .map(|(_, beneficiary, amount)| (beneficiary, amount))
            .unwrap_or((detail.beneficiary, detail.amount));
        debug!(
            "[settlement] payout {} finalized in block {}",
            id, finalized.block_hash
        );
        Ok(SettlementOutcome::Paid {
            beneficiary,
            amount,
        })
    }

    pub async fn processed_count(&self) -> usize {
        self.processed.len().await
    }
}
