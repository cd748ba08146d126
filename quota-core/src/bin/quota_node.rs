//! Quota node binary
//!
//! Runs an in-process notary and a single node. Configuration comes from
//! the TOML file named by `QUOTA_CONFIG`, or from `QUOTA_*` environment
//! variables when it is unset.

use anyhow::Context;
use quota_core::{spawn_notary, Config, Identity, Network, NodeBuilder};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match std::env::var("QUOTA_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::from_env().context("reading QUOTA_* environment")?,
    };

    tracing::info!(
        party = %config.party_name,
        data_dir = %config.data_dir.display(),
        "Starting quota node"
    );

    let network = Network::new();
    let notary = spawn_notary(
        Identity::generate(config.notary_name.clone()),
        config.network.mailbox_capacity,
    );

    let node = NodeBuilder::new(
        Identity::generate(config.party_name.clone()),
        Arc::new(notary.clone()),
        network,
    )
    .config(config)
    .start()
    .context("starting node")?;

    let unspent = node.unspent()?;
    let in_flight = node.in_flight_flows()?;
    tracing::info!(
        unspent = unspent.len(),
        in_flight = in_flight.len(),
        "Vault loaded"
    );
    for checkpoint in &in_flight {
        tracing::warn!(
            flow_id = %checkpoint.flow_id,
            state = %checkpoint.state,
            "Flow interrupted by previous shutdown"
        );
    }

    tokio::signal::ctrl_c().await?;

    tracing::info!(metrics = ?node.metrics(), "Shutting down quota node");
    node.shutdown().await?;
    notary.shutdown().await?;
    Ok(())
}
