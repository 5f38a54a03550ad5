// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

const FINALITY_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 4.0, 5.0, 7.5, 10., 15., 20., 30., 45., 60., 90., 120., 180.,
    300.,
];

#[derive(Clone, Debug)]
pub struct ReconcilerMetrics {
    pub(crate) last_finalized_block: IntGauge,
    pub(crate) listener_blocks_processed: IntCounter,
    pub(crate) listener_events_decoded: IntCounterVec,
    pub(crate) listener_unrecognized_events: IntCounter,
    pub(crate) listener_handler_errors: IntCounter,
    pub(crate) listener_block_errors: IntCounterVec,

    pub(crate) committer_cycles: IntCounter,
    pub(crate) committer_groups_updated: IntCounter,
    pub(crate) committer_groups_skipped: IntCounter,
    pub(crate) committer_groups_errored: IntCounterVec,
    pub(crate) committer_records_committed: IntCounter,
    pub(crate) committer_pending_records: IntGaugeVec,

    pub(crate) settlement_polls: IntCounter,
    pub(crate) settlement_submitted: IntCounter,
    pub(crate) settlement_confirmed: IntCounter,
    pub(crate) settlement_failed: IntCounterVec,
    pub(crate) settlement_already_processed: IntCounter,

    pub(crate) tx_finality_latency: HistogramVec,
}

impl ReconcilerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            last_finalized_block: register_int_gauge_with_registry!(
                "reconciler_last_finalized_block",
                "Number of the last finalized block processed by the listener",
                registry,
            )
            .unwrap(),
            listener_blocks_processed: register_int_counter_with_registry!(
                "reconciler_listener_blocks_processed",
                "Total number of finalized blocks fully processed",
                registry,
            )
            .unwrap(),
            listener_events_decoded: register_int_counter_vec_with_registry!(
                "reconciler_listener_events_decoded",
                "Governance events decoded and dispatched, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            listener_unrecognized_events: register_int_counter_with_registry!(
                "reconciler_listener_unrecognized_events",
                "Events in the governance section with an unmonitored method",
                registry,
            )
            .unwrap(),
            listener_handler_errors: register_int_counter_with_registry!(
                "reconciler_listener_handler_errors",
                "Handler invocations that returned an error",
                registry,
            )
            .unwrap(),
            listener_block_errors: register_int_counter_vec_with_registry!(
                "reconciler_listener_block_errors",
                "Per-block processing errors, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            committer_cycles: register_int_counter_with_registry!(
                "reconciler_committer_cycles",
                "Total number of batch commit cycles run",
                registry,
            )
            .unwrap(),
            committer_groups_updated: register_int_counter_with_registry!(
                "reconciler_committer_groups_updated",
                "Groups whose commitment was published and records marked committed",
                registry,
            )
            .unwrap(),
            committer_groups_skipped: register_int_counter_with_registry!(
                "reconciler_committer_groups_skipped",
                "Groups skipped (dry-run or nothing pending)",
                registry,
            )
            .unwrap(),
            committer_groups_errored: register_int_counter_vec_with_registry!(
                "reconciler_committer_groups_errored",
                "Groups whose commit attempt failed, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            committer_records_committed: register_int_counter_with_registry!(
                "reconciler_committer_records_committed",
                "Total records marked committed after a successful on-chain commitment",
                registry,
            )
            .unwrap(),
            committer_pending_records: register_int_gauge_vec_with_registry!(
                "reconciler_committer_pending_records",
                "Pending record count observed at the last scan, per group",
                &["group"],
                registry,
            )
            .unwrap(),
            settlement_polls: register_int_counter_with_registry!(
                "reconciler_settlement_polls",
                "Total number of approved-payout poll cycles",
                registry,
            )
            .unwrap(),
            settlement_submitted: register_int_counter_with_registry!(
                "reconciler_settlement_submitted",
                "Payout transactions submitted",
                registry,
            )
            .unwrap(),
            settlement_confirmed: register_int_counter_with_registry!(
                "reconciler_settlement_confirmed",
                "Payout transactions finalized without dispatch error",
                registry,
            )
            .unwrap(),
            settlement_failed: register_int_counter_vec_with_registry!(
                "reconciler_settlement_failed",
                "Payout settlements that failed and stay retry-eligible, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            settlement_already_processed: register_int_counter_with_registry!(
                "reconciler_settlement_already_processed",
                "Settlement attempts skipped because the id was already in the dedup ledger",
                registry,
            )
            .unwrap(),
            tx_finality_latency: register_histogram_vec_with_registry!(
                "reconciler_tx_finality_latency",
                "Seconds from submission to observed finality, by call kind",
                &["call"],
                FINALITY_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
        }
    }

    #[cfg(test)]
    pub fn new_for_testing() -> Self {
        Self::new(&Registry::new())
    }
}
