// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node assembly: builds the chain client and the enabled workers from
//! config, wires default handlers and starts everything.

use crate::committer::store::MemoryRecordStore;
use crate::committer::BatchCommitter;
use crate::config::ReconcilerConfig;
use crate::listener::{EventHandler, GovernanceEventListener, GovernanceHandlers};
use crate::metrics::ReconcilerMetrics;
use crate::rpc_client::HttpChainClient;
use crate::settlement::SettlementExecutor;
use anyhow::Result;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{info, warn};

/// Handles to the running workers, used for orderly shutdown.
pub struct ReconcilerNode {
    listener: Option<Arc<GovernanceEventListener<HttpChainClient>>>,
    committer: Option<Arc<BatchCommitter<HttpChainClient, MemoryRecordStore>>>,
    settlement: Option<Arc<SettlementExecutor<HttpChainClient>>>,
    pub record_store: Arc<MemoryRecordStore>,
}

impl ReconcilerNode {
    pub async fn shutdown(&self) {
        if let Some(listener) = &self.listener {
            listener.stop_listening().await;
        }
        if let Some(committer) = &self.committer {
            committer.stop().await;
        }
        if let Some(settlement) = &self.settlement {
            settlement.stop().await;
        }
        info!("reconciler node stopped");
    }
}

pub async fn run_reconciler_node(
    config: ReconcilerConfig,
    prometheus_registry: &prometheus::Registry,
) -> Result<ReconcilerNode> {
    config.validate()?;
    let metrics = Arc::new(ReconcilerMetrics::new(prometheus_registry));
    let client = Arc::new(HttpChainClient::new(&config.chain_rpc_url));
    let record_store = Arc::new(MemoryRecordStore::new());

    let listener = if config.listener.enabled {
        let listener = Arc::new(
            GovernanceEventListener::new(client.clone(), config.governance_section.clone())
                .with_metrics(metrics.clone()),
        );
        listener.set_handlers(logging_handlers()).await;
        listener.start_listening().await?;
        Some(listener)
    } else {
        info!("listener disabled by config");
        None
    };

    let committer = if config.committer.enabled {
        let committer = Arc::new(
            BatchCommitter::new(
                client.clone(),
                record_store.clone(),
                config.commit_signer(),
                config.committer_worker_config(),
            )
            .with_metrics(metrics.clone()),
        );
        committer.clone().start().await;
        Some(committer)
    } else {
        info!("committer disabled by config");
        None
    };

    let settlement = if config.settlement.enabled {
        let settlement = Arc::new(
            SettlementExecutor::new(
                client.clone(),
                config.payout_signer(),
                config.settlement_worker_config(),
            )
            .with_finality_timeout(config.settlement_finality_timeout())
            .with_metrics(metrics.clone()),
        );
        settlement.clone().start().await;
        Some(settlement)
    } else {
        info!("settlement disabled by config");
        None
    };

    info!("reconciler node started");
    Ok(ReconcilerNode {
        listener,
        committer,
        settlement,
        record_store,
    })
}

// Default handler set: log every monitored governance event with its
// provenance. Deployments embedding this crate replace these through
// `set_handlers`.
fn logging_handlers() -> GovernanceHandlers {
    fn log_handler() -> EventHandler {
        Arc::new(|record| {
            async move {
                info!(
                    "governance {}: proposal {} (block #{}, extrinsic {})",
                    record.event.kind(),
                    record.event.proposal_hash(),
                    record.block_number,
                    record.extrinsic_hash
                );
                Ok(())
            }
            .boxed()
        })
    }

    GovernanceHandlers {
        on_proposed: Some(log_handler()),
        on_voted: Some(log_handler()),
        on_closed: Some(log_handler()),
        on_executed: Some(log_handler()),
        on_error: Some(Arc::new(|e| {
            warn!("listener reported error: {}", e);
        })),
    }
}
