// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Programmable in-process chain client for worker tests, plus raw event
//! fixtures.

use crate::chain_client::{
    ApprovedItem, BlockHeader, ChainCall, ChainClient, EventPhase, ExtrinsicRef, RawChainEvent,
    RawDispatchError, Signer, TxStatus,
};
use crate::error::ReconcilerResult;
use crate::events::{GOVERNANCE_SECTION, PAYOUT_PAID_METHOD, PAYOUT_SECTION};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, Mutex};

/// How the mock answers the next `submit_transaction` call. Behaviors are
/// consumed in push order; an empty queue finalizes cleanly with no events.
#[derive(Debug, Clone)]
pub enum SubmitBehavior {
    FinalizeOk { events: Vec<RawChainEvent> },
    FinalizeWithDispatchError(Value),
    NeverFinalize,
}

#[derive(Default)]
struct MockState {
    blocks: HashMap<String, (Vec<RawChainEvent>, Vec<ExtrinsicRef>)>,
    approved: Vec<u64>,
    details: HashMap<u64, ApprovedItem>,
    submissions: Vec<ChainCall>,
    submitted_accounts: Vec<String>,
    behaviors: VecDeque<SubmitBehavior>,
    head_tx: Option<mpsc::Sender<BlockHeader>>,
    subscriptions: usize,
    // keeps NeverFinalize status streams open instead of closed
    open_senders: Vec<mpsc::Sender<TxStatus>>,
}

#[derive(Default)]
pub struct MockChainClient {
    state: Mutex<MockState>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block and, if a head subscription is open, deliver its
    /// header. `extrinsics` are `(hash, index)` pairs in body order.
    pub async fn add_block(
        &self,
        header: BlockHeader,
        events: Vec<RawChainEvent>,
        extrinsics: Vec<(String, u32)>,
    ) {
        let head_tx = {
            let mut state = self.state.lock().await;
            let extrinsics = extrinsics
                .into_iter()
                .map(|(hash, index)| ExtrinsicRef { hash, index })
                .collect();
            state.blocks.insert(header.hash.clone(), (events, extrinsics));
            state.head_tx.clone()
        };
        if let Some(tx) = head_tx {
            tx.send(header).await.ok();
        }
    }

    /// Close the finalized-head stream, simulating connection loss.
    pub async fn close_head_stream(&self) {
        self.state.lock().await.head_tx = None;
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions
    }

    pub async fn set_approved(&self, ids: Vec<u64>) {
        self.state.lock().await.approved = ids;
    }

    pub async fn set_detail(&self, item: ApprovedItem) {
        self.state.lock().await.details.insert(item.id, item);
    }

    pub async fn push_submit_behavior(&self, behavior: SubmitBehavior) {
        self.state.lock().await.behaviors.push_back(behavior);
    }

    pub async fn submissions(&self) -> Vec<ChainCall> {
        self.state.lock().await.submissions.clone()
    }

    pub async fn submission_count(&self) -> usize {
        self.state.lock().await.submissions.len()
    }

    pub async fn submitted_accounts(&self) -> Vec<String> {
        self.state.lock().await.submitted_accounts.clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn subscribe_finalized_heads(&self) -> ReconcilerResult<mpsc::Receiver<BlockHeader>> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().await;
        state.head_tx = Some(tx);
        state.subscriptions += 1;
        Ok(rx)
    }

    async fn block_events(&self, block_hash: &str) -> ReconcilerResult<Vec<RawChainEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .blocks
            .get(block_hash)
            .map(|(events, _)| events.clone())
            .unwrap_or_default())
    }

    async fn block_extrinsics(&self, block_hash: &str) -> ReconcilerResult<Vec<ExtrinsicRef>> {
        let state = self.state.lock().await;
        Ok(state
            .blocks
            .get(block_hash)
            .map(|(_, extrinsics)| extrinsics.clone())
            .unwrap_or_default())
    }

    async fn approved_payouts(&self) -> ReconcilerResult<Vec<u64>> {
        Ok(self.state.lock().await.approved.clone())
    }

    async fn payout_detail(&self, id: u64) -> ReconcilerResult<Option<ApprovedItem>> {
        Ok(self.state.lock().await.details.get(&id).cloned())
    }

    async fn submit_transaction(
        &self,
        call: ChainCall,
        signer: &Signer,
    ) -> ReconcilerResult<mpsc::Receiver<TxStatus>> {
        let mut state = self.state.lock().await;
        state.submissions.push(call);
        state.submitted_accounts.push(signer.account().to_string());
        let behavior = state
            .behaviors
            .pop_front()
            .unwrap_or(SubmitBehavior::FinalizeOk { events: vec![] });

        let (tx, rx) = mpsc::channel(4);
        match behavior {
            SubmitBehavior::FinalizeOk { events } => {
                tx.try_send(TxStatus::InBlock {
                    block_hash: "0xmock-block".to_string(),
                })
                .ok();
                tx.try_send(TxStatus::Finalized {
                    block_hash: "0xmock-block".to_string(),
                    dispatch_error: None,
                    events,
                })
                .ok();
            }
            SubmitBehavior::FinalizeWithDispatchError(error) => {
                tx.try_send(TxStatus::Finalized {
                    block_hash: "0xmock-block".to_string(),
                    dispatch_error: Some(RawDispatchError(error)),
                    events: vec![],
                })
                .ok();
            }
            SubmitBehavior::NeverFinalize => {
                state.open_senders.push(tx);
            }
        }
        Ok(rx)
    }
}

pub fn header(number: u64) -> BlockHeader {
    BlockHeader {
        number,
        hash: format!("0xblock-{}", number),
    }
}

pub fn governance_event(method: &str, data: Vec<Value>, extrinsic_index: u32) -> RawChainEvent {
    RawChainEvent {
        section: GOVERNANCE_SECTION.to_string(),
        method: method.to_string(),
        data,
        phase: EventPhase::ApplyExtrinsic(extrinsic_index),
    }
}

pub fn other_section_event(section: &str, method: &str, extrinsic_index: u32) -> RawChainEvent {
    RawChainEvent {
        section: section.to_string(),
        method: method.to_string(),
        data: vec![],
        phase: EventPhase::ApplyExtrinsic(extrinsic_index),
    }
}

pub fn paid_event(id: u64, beneficiary: &str, amount: u128) -> RawChainEvent {
    RawChainEvent {
        section: PAYOUT_SECTION.to_string(),
        method: PAYOUT_PAID_METHOD.to_string(),
        data: vec![json!(id), json!(beneficiary), json!(amount.to_string())],
        phase: EventPhase::Finalization,
    }
}
