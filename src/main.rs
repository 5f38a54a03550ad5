// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use chain_reconciler::config::ReconcilerConfig;
use chain_reconciler::node::run_reconciler_node;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ReconcilerConfig::from_file(&args.config_path)?;
    let prometheus_registry = prometheus::Registry::new();

    let node = run_reconciler_node(config, &prometheus_registry).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.shutdown().await;
    Ok(())
}
