// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the reconciliation workers.
//!
//! Every steady-state error is locally recoverable: workers log it, bump a
//! metric and retry on the next cycle or block. Only configuration errors
//! surfaced at startup abort the process.

use std::time::Duration;

/// Structured module-level failure reported by the chain after an extrinsic
/// was included and its dispatch logic rejected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchErrorInfo {
    pub section: String,
    pub name: String,
    pub docs: Vec<String>,
}

impl std::fmt::Display for DispatchErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.section, self.name)?;
        if !self.docs.is_empty() {
            write!(f, ": {}", self.docs.join(" "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcilerError {
    // Chain node unreachable or a subscription stream closed
    Connection(String),
    // RPC-level failure (transport error after retries, bad response shape)
    Rpc(String),
    // Malformed or unrecognized event/storage data
    Decode(String),
    // The chain rejected a submitted transaction with a module-level error
    Dispatch(DispatchErrorInfo),
    // The chain rejected a submitted transaction; not decodable as a module error
    DispatchOther(String),
    // Finality not observed within the configured bound
    Timeout { elapsed: Duration },
    // Local record store failure
    Storage(String),
    // A registered handler returned an error
    Handler(String),
    // Unrecoverable configuration error, aborts startup
    Config(String),
    // Uncategorized error
    Generic(String),
}

impl ReconcilerError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            ReconcilerError::Connection(_) => "connection",
            ReconcilerError::Rpc(_) => "rpc",
            ReconcilerError::Decode(_) => "decode",
            ReconcilerError::Dispatch(_) => "dispatch",
            ReconcilerError::DispatchOther(_) => "dispatch_other",
            ReconcilerError::Timeout { .. } => "timeout",
            ReconcilerError::Storage(_) => "storage",
            ReconcilerError::Handler(_) => "handler",
            ReconcilerError::Config(_) => "config",
            ReconcilerError::Generic(_) => "generic",
        }
    }

    /// Whether the failed operation is safe to run again on a later cycle.
    /// Everything except configuration errors is retry-eligible.
    pub fn is_retry_eligible(&self) -> bool {
        !matches!(self, ReconcilerError::Config(_))
    }
}

impl std::fmt::Display for ReconcilerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcilerError::Connection(msg) => write!(f, "connection error: {msg}"),
            ReconcilerError::Rpc(msg) => write!(f, "rpc error: {msg}"),
            ReconcilerError::Decode(msg) => write!(f, "decode error: {msg}"),
            ReconcilerError::Dispatch(info) => write!(f, "dispatch error: {info}"),
            ReconcilerError::DispatchOther(msg) => write!(f, "dispatch error: {msg}"),
            ReconcilerError::Timeout { elapsed } => {
                write!(f, "finality not observed within bound, waited {elapsed:?}")
            }
            ReconcilerError::Storage(msg) => write!(f, "storage error: {msg}"),
            ReconcilerError::Handler(msg) => write!(f, "handler error: {msg}"),
            ReconcilerError::Config(msg) => write!(f, "config error: {msg}"),
            ReconcilerError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ReconcilerError {}

pub type ReconcilerResult<T> = Result<T, ReconcilerError>;
