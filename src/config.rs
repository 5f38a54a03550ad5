// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reconciler configuration.
//!
//! Loaded from a YAML file with `${VAR}` environment substitution. Each
//! worker has an enable flag plus its cadence/threshold knobs; validation
//! runs once at startup and aborts the process on unrecoverable problems
//! (a missing signing seed for an enabled, non-dry-run worker).

use crate::chain_client::Signer;
use crate::error::{ReconcilerError, ReconcilerResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime knobs shared by the timer-driven workers. Immutable for the
/// worker's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub interval: Duration,
    pub threshold: u64,
    pub dry_run: bool,
}

impl WorkerConfig {
    pub fn new(interval: Duration, threshold: u64, dry_run: bool) -> Self {
        Self {
            interval,
            threshold,
            dry_run,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReconcilerConfig {
    // Rpc url of the chain fullnode, used for queries and submissions.
    pub chain_rpc_url: String,
    // Section under which the monitored governance events are emitted.
    #[serde(default = "default_governance_section")]
    pub governance_section: String,
    #[serde(default)]
    pub listener: ListenerSettings,
    #[serde(default)]
    pub committer: CommitterSettings,
    #[serde(default)]
    pub settlement: SettlementSettings,
}

fn default_governance_section() -> String {
    crate::events::GOVERNANCE_SECTION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListenerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommitterSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_committer_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    #[serde(default)]
    pub dry_run: bool,
    // Account that signs batch commitment transactions.
    #[serde(default)]
    pub commit_account: String,
    #[serde(default)]
    pub commit_seed: String,
}

impl Default for CommitterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_committer_interval_ms(),
            threshold: default_threshold(),
            dry_run: false,
            commit_account: String::new(),
            commit_seed: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SettlementSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_settlement_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_finality_timeout_secs")]
    pub finality_timeout_secs: u64,
    #[serde(default)]
    pub dry_run: bool,
    // Account that signs payout transactions.
    #[serde(default)]
    pub payout_account: String,
    #[serde(default)]
    pub payout_seed: String,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_settlement_interval_ms(),
            finality_timeout_secs: default_finality_timeout_secs(),
            dry_run: false,
            payout_account: String::new(),
            payout_seed: String::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_committer_interval_ms() -> u64 {
    60_000
}

fn default_settlement_interval_ms() -> u64 {
    30_000
}

fn default_threshold() -> u64 {
    100
}

fn default_finality_timeout_secs() -> u64 {
    60
}

impl ReconcilerConfig {
    /// Load configuration from a YAML file with environment variable
    /// substitution.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read reconciler config file: {:?}", path))?;
        let contents = substitute_env_vars(&contents);
        let config: ReconcilerConfig =
            serde_yaml::from_str(&contents).context("Failed to parse reconciler config YAML")?;
        Ok(config)
    }

    /// Startup validation. Missing signing material for an enabled worker
    /// that writes to the chain aborts startup rather than degrading
    /// silently at the first submission.
    pub fn validate(&self) -> ReconcilerResult<()> {
        if self.chain_rpc_url.is_empty() {
            return Err(ReconcilerError::Config(
                "chain-rpc-url must not be empty".to_string(),
            ));
        }
        if self.committer.enabled && !self.committer.dry_run && self.committer.commit_seed.is_empty()
        {
            return Err(ReconcilerError::Config(
                "committer is enabled without commit-seed; set committer.dry-run or provide signing material".to_string(),
            ));
        }
        if self.settlement.enabled && !self.settlement.dry_run && self.settlement.payout_seed.is_empty()
        {
            return Err(ReconcilerError::Config(
                "settlement is enabled without payout-seed; set settlement.dry-run or provide signing material".to_string(),
            ));
        }
        Ok(())
    }

    pub fn committer_worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(
            Duration::from_millis(self.committer.interval_ms),
            self.committer.threshold,
            self.committer.dry_run,
        )
    }

    pub fn settlement_worker_config(&self) -> WorkerConfig {
        // the settlement poller has no batch threshold
        WorkerConfig::new(
            Duration::from_millis(self.settlement.interval_ms),
            0,
            self.settlement.dry_run,
        )
    }

    pub fn settlement_finality_timeout(&self) -> Duration {
        Duration::from_secs(self.settlement.finality_timeout_secs)
    }

    pub fn commit_signer(&self) -> Signer {
        Signer::new(&self.committer.commit_account, &self.committer.commit_seed)
    }

    pub fn payout_signer(&self) -> Signer {
        Signer::new(&self.settlement.payout_account, &self.settlement.payout_seed)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}. Unset
/// variables keep their placeholder so the YAML parse error points at the
/// offending key.
fn substitute_env_vars(content: &str) -> String {
    use regex::Regex;

    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    let mut result = content.to_string();

    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let var_name = &cap[1];

        if let Ok(var_value) = std::env::var(var_name) {
            result = result.replace(full_match, &var_value);
        } else {
            tracing::warn!(
                "Environment variable {} not found, keeping placeholder",
                var_name
            );
        }
    }

    result
}
