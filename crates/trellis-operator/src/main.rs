//! Trellis Operator - Cluster API bootstrap and control-plane provider for RKE2

use clap::Parser;
use kube::Client;

use trellis_common::adapter::KubeClusterAdapter;
use trellis_common::telemetry::init_telemetry;
use trellis_operator::config::{Cli, Commands, Settings};
use trellis_operator::controller_runner::{
    build_bootstrap_controllers, build_control_plane_controllers,
};
use trellis_operator::crds::{crd_manifest, install_crds};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifest()?);
        return Ok(());
    }

    init_telemetry(cli.settings.telemetry())?;

    match cli.command {
        Some(Commands::InstallCrds) => {
            let client = Client::try_default().await?;
            ensure_crds(&client, &cli.settings).await
        }
        Some(Commands::Controller) | None => run_controller(&cli.settings).await,
    }
}

async fn ensure_crds(client: &Client, settings: &Settings) -> anyhow::Result<()> {
    let adapter = KubeClusterAdapter::new(client.clone(), &settings.field_manager);
    install_crds(&adapter, settings.crd_timeout())
        .await
        .map_err(|e| anyhow::anyhow!("failed to install CRDs: {}", e))
}

async fn run_controller(settings: &Settings) -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    if settings.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crds(&client, settings).await?;
    }

    match &settings.watch_namespace {
        Some(ns) => tracing::info!(namespace = %ns, "Starting controllers"),
        None => tracing::info!("Starting controllers for all namespaces"),
    }

    let mut controllers = build_bootstrap_controllers(client.clone(), settings);
    controllers.extend(build_control_plane_controllers(client, settings));
    futures::future::join_all(controllers).await;

    tracing::info!("Controllers stopped");
    Ok(())
}
