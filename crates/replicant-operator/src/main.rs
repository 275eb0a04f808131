//! Replicant operator - keeps each ReplicaGroup at its desired pod count

use std::sync::Arc;

use clap::Parser;

use replicant_common::kube_utils::create_client;
use replicant_common::telemetry::{init_telemetry, TelemetryConfig};
use replicant_controller::ReplicaContext;
use replicant_operator::controller_runner::build_replica_controller;
use replicant_operator::startup::{crd_yaml, ensure_crds_installed};
use replicant_operator::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: cli.log_json,
        ..Default::default()
    })?;

    run_controller(cli).await
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Replicant controller starting...");

    let client = create_client(cli.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    if cli.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crds_installed(&client, &cli.crd_install_retry()).await?;
    }

    let ctx = Arc::new(ReplicaContext::from_client(
        client.clone(),
        cli.controller_config(),
    ));

    // Abort in-flight API calls on shutdown; the controller itself drains on
    // the same signal.
    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    tracing::info!("Starting controllers:");
    build_replica_controller(client, cli.namespace.as_deref(), cli.concurrency, ctx).await;

    tracing::info!("Replicant controller shut down");
    Ok(())
}
