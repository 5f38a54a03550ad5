// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chain reconciliation layer: background workers that keep off-chain
//! records consistent with finalized on-chain state.
//!
//! Three workers share one problem (detect relevant chain state changes,
//! act on them exactly once, tolerate restarts) with different timing
//! models:
//! - [`listener::GovernanceEventListener`] reacts to governance events as
//!   blocks finalize (push-driven);
//! - [`committer::BatchCommitter`] periodically commits one Merkle root
//!   per group of pending records once the group crosses a size threshold
//!   (timer-driven);
//! - [`settlement::SettlementExecutor`] polls the chain's approved-but-unpaid
//!   payout list and submits the releasing transaction for new entries
//!   (timer-driven).
//!
//! All durable state lives in the record store and on-chain; the workers
//! themselves only hold process-local dedup ledgers.

pub mod chain_client;
pub mod committer;
pub mod config;
pub mod error;
pub mod events;
pub mod listener;
pub mod metrics;
pub mod node;
pub mod processed_cache;
pub mod rpc_client;
pub mod settlement;

#[cfg(test)]
pub mod test_utils;

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 30, 60, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => {
                        return Ok(result);
                    }
                    Err(e) => {
                        // Every error is treated as transient so we retry until max_elapsed_time
                        tracing::debug!("Retrying due to error: {:?}", e);
                        return Err(backoff::Error::transient(e));
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    async fn example_func_ok() -> anyhow::Result<()> {
        Ok(())
    }

    async fn example_func_err() -> anyhow::Result<()> {
        Err(anyhow::anyhow!(""))
    }

    #[tokio::test]
    async fn test_retry_with_max_elapsed_time() {
        // no retry is needed, should return immediately even with a very
        // small max_elapsed_time
        let max_elapsed_time = Duration::from_millis(20);
        retry_with_max_elapsed_time!(example_func_ok(), max_elapsed_time)
            .unwrap()
            .unwrap();

        // a function that always errors must give up before max_elapsed_time runs out
        let max_elapsed_time = Duration::from_secs(10);
        let instant = std::time::Instant::now();
        retry_with_max_elapsed_time!(example_func_err(), max_elapsed_time).unwrap_err();
        assert!(instant.elapsed() < max_elapsed_time);
    }
}
