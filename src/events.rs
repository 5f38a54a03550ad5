// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Decoding of raw chain events into typed governance events.
//!
//! Only events in the governance section are decoded; the listener filters
//! by section before calling into this module. Unknown methods inside the
//! section decode to `None` and are ignored. Malformed data for a known
//! method is a decode error, caught per-event by the caller.

use crate::chain_client::RawChainEvent;
use crate::error::{ReconcilerError, ReconcilerResult};
use serde_json::Value;

/// Section under which the monitored governance events are emitted.
pub const GOVERNANCE_SECTION: &str = "council";

/// Section/method of the payment event emitted when a payout executes.
pub const PAYOUT_SECTION: &str = "treasury";
pub const PAYOUT_PAID_METHOD: &str = "Paid";

/// A decoded, named governance action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovernanceEvent {
    Proposed {
        account: String,
        proposal_index: u64,
        proposal_hash: String,
        threshold: u64,
    },
    Voted {
        account: String,
        proposal_hash: String,
        voted: bool,
        ayes: u64,
        nays: u64,
    },
    Closed {
        proposal_hash: String,
        ayes: u64,
        nays: u64,
    },
    Executed {
        proposal_hash: String,
        result: Result<(), String>,
    },
}

impl GovernanceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GovernanceEvent::Proposed { .. } => "proposed",
            GovernanceEvent::Voted { .. } => "voted",
            GovernanceEvent::Closed { .. } => "closed",
            GovernanceEvent::Executed { .. } => "executed",
        }
    }

    pub fn proposal_hash(&self) -> &str {
        match self {
            GovernanceEvent::Proposed { proposal_hash, .. }
            | GovernanceEvent::Voted { proposal_hash, .. }
            | GovernanceEvent::Closed { proposal_hash, .. }
            | GovernanceEvent::Executed { proposal_hash, .. } => proposal_hash,
        }
    }
}

/// A governance event with the block/extrinsic provenance needed for
/// traceability. Created per block pass, consumed once by its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernanceEventRecord {
    pub event: GovernanceEvent,
    pub block_number: u64,
    pub extrinsic_hash: String,
}

/// Decode one raw event from the governance section. Returns `Ok(None)`
/// for methods this layer does not monitor.
pub fn decode_governance_event(raw: &RawChainEvent) -> ReconcilerResult<Option<GovernanceEvent>> {
    let event = match raw.method.as_str() {
        "Proposed" => GovernanceEvent::Proposed {
            account: str_field(raw, 0)?,
            proposal_index: u64_field(raw, 1)?,
            proposal_hash: str_field(raw, 2)?,
            threshold: u64_field(raw, 3)?,
        },
        "Voted" => GovernanceEvent::Voted {
            account: str_field(raw, 0)?,
            proposal_hash: str_field(raw, 1)?,
            voted: bool_field(raw, 2)?,
            ayes: u64_field(raw, 3)?,
            nays: u64_field(raw, 4)?,
        },
        "Closed" => GovernanceEvent::Closed {
            proposal_hash: str_field(raw, 0)?,
            ayes: u64_field(raw, 1)?,
            nays: u64_field(raw, 2)?,
        },
        "Executed" => GovernanceEvent::Executed {
            proposal_hash: str_field(raw, 0)?,
            result: result_field(raw, 1)?,
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Extract `(id, beneficiary, amount)` from a payout payment event, if the
/// given event is one. Used to log the concrete payout details after a
/// settlement transaction finalizes.
pub fn decode_paid_event(raw: &RawChainEvent) -> Option<(u64, String, u128)> {
    if raw.section != PAYOUT_SECTION || raw.method != PAYOUT_PAID_METHOD {
        return None;
    }
    let id = value_as_u64(raw.data.first()?)?;
    let beneficiary = raw.data.get(1)?.as_str()?.to_string();
    let amount = value_as_u128(raw.data.get(2)?)?;
    Some((id, beneficiary, amount))
}

fn field<'a>(raw: &'a RawChainEvent, index: usize) -> ReconcilerResult<&'a Value> {
    raw.data.get(index).ok_or_else(|| {
        ReconcilerError::Decode(format!(
            "{}.{}: missing data field {} (got {} fields)",
            raw.section,
            raw.method,
            index,
            raw.data.len()
        ))
    })
}

fn str_field(raw: &RawChainEvent, index: usize) -> ReconcilerResult<String> {
    field(raw, index)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            ReconcilerError::Decode(format!(
                "{}.{}: data field {} is not a string",
                raw.section, raw.method, index
            ))
        })
}

// Numbers may arrive as JSON numbers or decimal strings depending on the
// node's serializer; accept both.
fn value_as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn value_as_u128(value: &Value) -> Option<u128> {
    if let Some(n) = value.as_u64() {
        return Some(n as u128);
    }
    value.as_str().and_then(|s| s.parse().ok())
}

fn u64_field(raw: &RawChainEvent, index: usize) -> ReconcilerResult<u64> {
    value_as_u64(field(raw, index)?).ok_or_else(|| {
        ReconcilerError::Decode(format!(
            "{}.{}: data field {} is not a u64",
            raw.section, raw.method, index
        ))
    })
}

fn bool_field(raw: &RawChainEvent, index: usize) -> ReconcilerResult<bool> {
    field(raw, index)?.as_bool().ok_or_else(|| {
        ReconcilerError::Decode(format!(
            "{}.{}: data field {} is not a bool",
            raw.section, raw.method, index
        ))
    })
}

// Dispatch results arrive as `null` / `{"ok": ...}` for success or
// `{"err": ...}` for failure.
fn result_field(raw: &RawChainEvent, index: usize) -> ReconcilerResult<Result<(), String>> {
    let value = field(raw, index)?;
    if value.is_null() || value.get("ok").is_some() || value.get("Ok").is_some() {
        return Ok(Ok(()));
    }
    if let Some(err) = value.get("err").or_else(|| value.get("Err")) {
        return Ok(Err(err.to_string()));
    }
    Err(ReconcilerError::Decode(format!(
        "{}.{}: data field {} is not a dispatch result: {}",
        raw.section, raw.method, index, value
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_client::EventPhase;
    use serde_json::json;

    fn raw(method: &str, data: Vec<Value>) -> RawChainEvent {
        RawChainEvent {
            section: GOVERNANCE_SECTION.to_string(),
            method: method.to_string(),
            data,
            phase: EventPhase::ApplyExtrinsic(0),
        }
    }

    #[test]
    fn test_decode_proposed() {
        let event = raw("Proposed", vec![json!("alice"), json!(7), json!("0xhash"), json!(3)]);
        match decode_governance_event(&event).unwrap().unwrap() {
            GovernanceEvent::Proposed {
                account,
                proposal_index,
                proposal_hash,
                threshold,
            } => {
                assert_eq!(account, "alice");
                assert_eq!(proposal_index, 7);
                assert_eq!(proposal_hash, "0xhash");
                assert_eq!(threshold, 3);
            }
            other => panic!("expected Proposed, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_voted_exact_fields() {
        let event = raw(
            "Voted",
            vec![json!("bob"), json!("0xh"), json!(true), json!(2), json!(0)],
        );
        assert_eq!(
            decode_governance_event(&event).unwrap().unwrap(),
            GovernanceEvent::Voted {
                account: "bob".to_string(),
                proposal_hash: "0xh".to_string(),
                voted: true,
                ayes: 2,
                nays: 0,
            }
        );
    }

    #[test]
    fn test_decode_closed_with_string_counts() {
        // counts serialized as strings by some node versions
        let event = raw("Closed", vec![json!("0xh"), json!("4"), json!("1")]);
        assert_eq!(
            decode_governance_event(&event).unwrap().unwrap(),
            GovernanceEvent::Closed {
                proposal_hash: "0xh".to_string(),
                ayes: 4,
                nays: 1,
            }
        );
    }

    #[test]
    fn test_decode_executed_ok_and_err() {
        let ok = raw("Executed", vec![json!("0xh"), json!(null)]);
        assert_eq!(
            decode_governance_event(&ok).unwrap().unwrap(),
            GovernanceEvent::Executed {
                proposal_hash: "0xh".to_string(),
                result: Ok(()),
            }
        );

        let err = raw(
            "Executed",
            vec![json!("0xh"), json!({"err": {"module": {"index": 4}}})],
        );
        match decode_governance_event(&err).unwrap().unwrap() {
            GovernanceEvent::Executed { result, .. } => assert!(result.is_err()),
            other => panic!("expected Executed, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_method_is_ignored() {
        let event = raw("MemberExecuted", vec![json!("0xh")]);
        assert_eq!(decode_governance_event(&event).unwrap(), None);
    }

    #[test]
    fn test_malformed_known_method_is_decode_error() {
        // Voted with too few fields
        let event = raw("Voted", vec![json!("bob")]);
        let err = decode_governance_event(&event).unwrap_err();
        assert_eq!(err.error_type(), "decode");

        // threshold is not numeric
        let event = raw(
            "Proposed",
            vec![json!("alice"), json!(1), json!("0xh"), json!(true)],
        );
        assert_eq!(
            decode_governance_event(&event).unwrap_err().error_type(),
            "decode"
        );
    }

    #[test]
    fn test_decode_paid_event() {
        let event = RawChainEvent {
            section: PAYOUT_SECTION.to_string(),
            method: PAYOUT_PAID_METHOD.to_string(),
            data: vec![json!(9), json!("courier-a"), json!("2500000")],
            phase: EventPhase::ApplyExtrinsic(0),
        };
        assert_eq!(
            decode_paid_event(&event),
            Some((9, "courier-a".to_string(), 2_500_000u128))
        );

        // other sections never decode as paid events
        let other = raw("Paid", vec![json!(9), json!("x"), json!(1)]);
        assert_eq!(decode_paid_event(&other), None);
    }
}
