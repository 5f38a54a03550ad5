// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Governance event listener.
//!
//! Maintains one long-lived finalized-head subscription; a dedicated task
//! drains the head channel, fully processing each block (event fetch,
//! extrinsic correlation, decode, handler dispatch) before the next,
//! preserving finalization order. Handlers for events within one block
//! are spawned fire-and-forget, so they must not assume ordering relative
//! to each other and must themselves be idempotent against duplicate
//! delivery after a restart.
//!
//! Connection loss closes the head channel; it is reported through
//! `on_error` and the listener stops. Re-subscription is not automatic;
//! an explicit restart is required.

use crate::chain_client::{BlockHeader, ChainClient, EventPhase};
use crate::error::{ReconcilerError, ReconcilerResult};
use crate::events::{decode_governance_event, GovernanceEvent, GovernanceEventRecord};
use crate::metrics::ReconcilerMetrics;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback invoked with a decoded governance event.
pub type EventHandler =
    Arc<dyn Fn(GovernanceEventRecord) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Callback invoked with errors the listener recovered from locally.
pub type ErrorHandler = Arc<dyn Fn(ReconcilerError) + Send + Sync>;

/// Pluggable handler set, one optional callback per monitored event kind.
#[derive(Clone, Default)]
pub struct GovernanceHandlers {
    pub on_proposed: Option<EventHandler>,
    pub on_voted: Option<EventHandler>,
    pub on_closed: Option<EventHandler>,
    pub on_executed: Option<EventHandler>,
    pub on_error: Option<ErrorHandler>,
}

impl GovernanceHandlers {
    /// Merge `other` into self, replacing only the callbacks it sets.
    fn merge(&mut self, other: GovernanceHandlers) {
        if other.on_proposed.is_some() {
            self.on_proposed = other.on_proposed;
        }
        if other.on_voted.is_some() {
            self.on_voted = other.on_voted;
        }
        if other.on_closed.is_some() {
            self.on_closed = other.on_closed;
        }
        if other.on_executed.is_some() {
            self.on_executed = other.on_executed;
        }
        if other.on_error.is_some() {
            self.on_error = other.on_error;
        }
    }

    fn handler_for(&self, event: &GovernanceEvent) -> Option<EventHandler> {
        match event {
            GovernanceEvent::Proposed { .. } => self.on_proposed.clone(),
            GovernanceEvent::Voted { .. } => self.on_voted.clone(),
            GovernanceEvent::Closed { .. } => self.on_closed.clone(),
            GovernanceEvent::Executed { .. } => self.on_executed.clone(),
        }
    }
}

struct ListenState {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct GovernanceEventListener<C: ChainClient> {
    client: Arc<C>,
    section: String,
    handlers: Arc<RwLock<GovernanceHandlers>>,
    state: Mutex<Option<ListenState>>,
    listening: Arc<AtomicBool>,
    metrics: Option<Arc<ReconcilerMetrics>>,
}

impl<C: ChainClient> GovernanceEventListener<C> {
    pub fn new(client: Arc<C>, section: impl Into<String>) -> Self {
        Self {
            client,
            section: section.into(),
            handlers: Arc::new(RwLock::new(GovernanceHandlers::default())),
            state: Mutex::new(None),
            listening: Arc::new(AtomicBool::new(false)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ReconcilerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace/merge the handler set. May be called before or after
    /// `start_listening`.
    pub async fn set_handlers(&self, handlers: GovernanceHandlers) {
        self.handlers.write().await.merge(handlers);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Open the finalized-head subscription and start the processing
    /// task. Idempotent: a second call while listening logs and returns.
    pub async fn start_listening(&self) -> ReconcilerResult<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.as_ref() {
            if !existing.handle.is_finished() {
                info!("[listener] already listening, ignoring start");
                return Ok(());
            }
        }

        let head_rx = self.client.subscribe_finalized_heads().await?;
        let cancel = CancellationToken::new();
        self.listening.store(true, Ordering::SeqCst);

        let client = self.client.clone();
        let section = self.section.clone();
        let handlers = self.handlers.clone();
        let listening = self.listening.clone();
        let metrics = self.metrics.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_listen_loop(client, section, handlers, head_rx, loop_cancel, metrics).await;
            listening.store(false, Ordering::SeqCst);
        });

        *state = Some(ListenState { cancel, handle });
        info!("[listener] started listening for finalized blocks");
        Ok(())
    }

    /// Cancel the subscription task. Idempotent no-op when not listening.
    pub async fn stop_listening(&self) {
        let mut state = self.state.lock().await;
        if let Some(state) = state.take() {
            state.cancel.cancel();
            self.listening.store(false, Ordering::SeqCst);
            info!("[listener] stopped listening");
        }
    }
}

async fn run_listen_loop<C: ChainClient>(
    client: Arc<C>,
    section: String,
    handlers: Arc<RwLock<GovernanceHandlers>>,
    mut head_rx: tokio::sync::mpsc::Receiver<BlockHeader>,
    cancel: CancellationToken,
    metrics: Option<Arc<ReconcilerMetrics>>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[listener] block loop cancelled");
                break;
            }
            header = head_rx.recv() => {
                let Some(header) = header else {
                    let err = ReconcilerError::Connection(
                        "finalized-head stream closed; restart required".to_string(),
                    );
                    warn!("[listener] {}", err);
                    report_error(&handlers, err).await;
                    break;
                };
                debug!("[listener] finalized block #{} ({})", header.number, header.hash);
                if let Err(e) =
                    process_block(&client, &section, &handlers, &header, metrics.as_deref()).await
                {
                    warn!(
                        "[listener] failed to process block #{}, continuing: {}",
                        header.number, e
                    );
                    if let Some(m) = &metrics {
                        m.listener_block_errors
                            .with_label_values(&[e.error_type()])
                            .inc();
                    }
                    report_error(&handlers, e).await;
                    continue;
                }
                if let Some(m) = &metrics {
                    m.listener_blocks_processed.inc();
                    m.last_finalized_block.set(header.number as i64);
                }
            }
        }
    }
}

async fn report_error(handlers: &RwLock<GovernanceHandlers>, error: ReconcilerError) {
    let on_error = handlers.read().await.on_error.clone();
    if let Some(on_error) = on_error {
        on_error(error);
    }
}

/// Process one finalized block to completion: fetch its events and
/// extrinsics, correlate each event to the extrinsic that produced it via
/// the apply-extrinsic phase index, decode governance events and dispatch
/// handlers. Decode errors are per-event; fetch errors abort the block.
async fn process_block<C: ChainClient>(
    client: &Arc<C>,
    section: &str,
    handlers: &Arc<RwLock<GovernanceHandlers>>,
    header: &BlockHeader,
    metrics: Option<&ReconcilerMetrics>,
) -> ReconcilerResult<()> {
    let events = client.block_events(&header.hash).await?;
    let mut extrinsics = client.block_extrinsics(&header.hash).await?;
    extrinsics.sort_by_key(|xt| xt.index);

    for xt in &extrinsics {
        for raw in events
            .iter()
            .filter(|e| e.phase == EventPhase::ApplyExtrinsic(xt.index))
        {
            // section filtering happens before decode
            if raw.section != section {
                continue;
            }
            let event = match decode_governance_event(raw) {
                Ok(Some(event)) => event,
                Ok(None) => {
                    debug!(
                        "[listener] ignoring unmonitored {}.{} in block #{}",
                        raw.section, raw.method, header.number
                    );
                    if let Some(m) = metrics {
                        m.listener_unrecognized_events.inc();
                    }
                    continue;
                }
                Err(e) => {
                    warn!(
                        "[listener] skipping undecodable {}.{} in block #{}: {}",
                        raw.section, raw.method, header.number, e
                    );
                    report_error(handlers, e).await;
                    continue;
                }
            };

            if let Some(m) = metrics {
                m.listener_events_decoded
                    .with_label_values(&[event.kind()])
                    .inc();
            }

            let record = GovernanceEventRecord {
                event,
                block_number: header.number,
                extrinsic_hash: xt.hash.clone(),
            };
            dispatch(handlers, record, metrics).await;
        }
    }

    Ok(())
}

/// Invoke the matching handler fire-and-forget. A failing handler never
/// aborts processing of subsequent events or blocks.
async fn dispatch(
    handlers: &Arc<RwLock<GovernanceHandlers>>,
    record: GovernanceEventRecord,
    metrics: Option<&ReconcilerMetrics>,
) {
    let guard = handlers.read().await;
    let Some(handler) = guard.handler_for(&record.event) else {
        debug!(
            "[listener] no handler registered for {} event",
            record.event.kind()
        );
        return;
    };
    let on_error = guard.on_error.clone();
    drop(guard);

    let kind = record.event.kind();
    let block_number = record.block_number;
    let handler_errors = metrics.map(|m| m.listener_handler_errors.clone());
    tokio::spawn(async move {
        if let Err(e) = handler(record).await {
            warn!(
                "[listener] {} handler failed for block #{}: {:#}",
                kind, block_number, e
            );
            if let Some(counter) = handler_errors {
                counter.inc();
            }
            if let Some(on_error) = on_error {
                on_error(ReconcilerError::Handler(format!("{:#}", e)));
            }
        }
    });
}
