// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The chain client adapter surface consumed by every worker.
//!
//! The trait covers the four node interactions the workers need: the
//! finalized-head stream, per-block event/extrinsic queries, the
//! approved-payout storage queries and transaction submission with a
//! finality-tracked status stream. Production uses the JSON-RPC
//! implementation in [`crate::rpc_client`]; tests use a programmable mock.

use crate::error::{DispatchErrorInfo, ReconcilerError, ReconcilerResult};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Header of a finalized block as delivered by the subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
}

/// Execution phase marker attached to every raw chain event. Events are
/// not self-describing as to which transaction caused them; correlation
/// goes through `ApplyExtrinsic(index)` against the block body position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    ApplyExtrinsic(u32),
    Finalization,
    Initialization,
}

/// Raw unit emitted by the chain per executed instruction inside a
/// finalized block. Exists only transiently during block processing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChainEvent {
    pub section: String,
    pub method: String,
    pub data: Vec<Value>,
    pub phase: EventPhase,
}

/// Position and hash of one extrinsic in a block body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtrinsicRef {
    pub hash: String,
    pub index: u32,
}

/// An entry the chain has approved for payout but not yet paid. The chain
/// storage list is the sole source of truth for its existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedItem {
    pub id: u64,
    pub beneficiary: String,
    pub amount: u128,
}

/// Undecoded dispatch error payload as returned by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDispatchError(pub Value);

/// Decoded form of a dispatch error: a structured module error when the
/// chain indicates one, the stringified payload otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedDispatchError {
    Module(DispatchErrorInfo),
    Other(String),
}

/// Decode a raw dispatch error into `{section, name, docs}` when the chain
/// indicates a module-level failure, or stringify it otherwise.
pub fn decode_dispatch_error(raw: &RawDispatchError) -> DecodedDispatchError {
    if let Some(module) = raw.0.get("module") {
        let section = module.get("section").and_then(|s| s.as_str());
        let name = module.get("name").and_then(|n| n.as_str());
        if let (Some(section), Some(name)) = (section, name) {
            let docs = module
                .get("docs")
                .and_then(|d| d.as_array())
                .map(|docs| {
                    docs.iter()
                        .filter_map(|d| d.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            return DecodedDispatchError::Module(DispatchErrorInfo {
                section: section.to_string(),
                name: name.to_string(),
                docs,
            });
        }
    }
    DecodedDispatchError::Other(raw.0.to_string())
}

/// Status updates produced by a transaction submission, ending with
/// `Finalized` once the chain guarantees the containing block.
#[derive(Debug, Clone, PartialEq)]
pub enum TxStatus {
    InBlock {
        block_hash: String,
    },
    Finalized {
        block_hash: String,
        dispatch_error: Option<RawDispatchError>,
        events: Vec<RawChainEvent>,
    },
}

/// The calls this layer submits on-chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainCall {
    /// Publish one aggregate commitment for a group of pending records.
    CommitBatchRoot {
        group_key: String,
        root: [u8; 32],
        record_count: u64,
    },
    /// Release funds for an approved-but-unpaid payout.
    ExecutePayout { id: u64 },
}

impl ChainCall {
    pub fn kind(&self) -> &'static str {
        match self {
            ChainCall::CommitBatchRoot { .. } => "commit_batch_root",
            ChainCall::ExecutePayout { .. } => "execute_payout",
        }
    }
}

/// Signing material for transaction submission. The secret never appears
/// in logs.
#[derive(Clone)]
pub struct Signer {
    account: String,
    seed: String,
}

impl Signer {
    pub fn new(account: impl Into<String>, seed: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            seed: seed.into(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("account", &self.account)
            .field("seed", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Open a finalized-head stream. Headers arrive in finalization order.
    /// The stream closing without cancellation means the connection was
    /// lost; re-subscription is not automatic.
    async fn subscribe_finalized_heads(&self) -> ReconcilerResult<mpsc::Receiver<BlockHeader>>;

    /// All events emitted inside the given block.
    async fn block_events(&self, block_hash: &str) -> ReconcilerResult<Vec<RawChainEvent>>;

    /// The extrinsics of the given block, in body order.
    async fn block_extrinsics(&self, block_hash: &str) -> ReconcilerResult<Vec<ExtrinsicRef>>;

    /// Ids currently in the chain's approved-but-unpaid payout list.
    async fn approved_payouts(&self) -> ReconcilerResult<Vec<u64>>;

    /// Detail for one approved payout, `None` if it is no longer approved.
    async fn payout_detail(&self, id: u64) -> ReconcilerResult<Option<ApprovedItem>>;

    /// Submit a signed call; the returned stream reports inclusion and
    /// finality. The stream ends after `Finalized`.
    async fn submit_transaction(
        &self,
        call: ChainCall,
        signer: &Signer,
    ) -> ReconcilerResult<mpsc::Receiver<TxStatus>>;

    fn decode_dispatch_error(&self, raw: &RawDispatchError) -> DecodedDispatchError {
        decode_dispatch_error(raw)
    }
}

/// A successfully finalized transaction and the events it emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedTx {
    pub block_hash: String,
    pub events: Vec<RawChainEvent>,
}

/// Drain a submission status stream until `Finalized`, bounded by
/// `timeout`. A dispatch error in the finalized status is decoded and
/// returned as an error; both dispatch errors and timeouts leave the
/// caller free to retry on a later cycle.
pub async fn await_finalized(
    rx: &mut mpsc::Receiver<TxStatus>,
    timeout: Duration,
) -> ReconcilerResult<FinalizedTx> {
    let started = Instant::now();
    loop {
        let remaining = match timeout.checked_sub(started.elapsed()) {
            Some(remaining) => remaining,
            None => {
                return Err(ReconcilerError::Timeout {
                    elapsed: started.elapsed(),
                })
            }
        };
        match tokio::time::timeout(remaining, rx.recv()).await {
            Err(_) => {
                return Err(ReconcilerError::Timeout {
                    elapsed: started.elapsed(),
                })
            }
            Ok(None) => {
                return Err(ReconcilerError::Connection(
                    "transaction status stream closed before finality".to_string(),
                ))
            }
            Ok(Some(TxStatus::InBlock { block_hash })) => {
                debug!("transaction included in block {}", block_hash);
            }
            Ok(Some(TxStatus::Finalized {
                block_hash,
                dispatch_error,
                events,
            })) => {
                if let Some(raw) = dispatch_error {
                    return Err(match decode_dispatch_error(&raw) {
                        DecodedDispatchError::Module(info) => ReconcilerError::Dispatch(info),
                        DecodedDispatchError::Other(msg) => ReconcilerError::DispatchOther(msg),
                    });
                }
                return Ok(FinalizedTx { block_hash, events });
            }
        }
    }
}
