#![warn(missing_docs)]

//! PlanetMesh node server

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use planetmesh_node::config::{LogFormat, NodeConfig};
use planetmesh_node::identity::IdentityCell;
use planetmesh_node::locator::PlacementTable;
use planetmesh_node::node::MeshNode;
use planetmesh_node::placement::{load_table, spawn_placement_reload, spawn_placement_sync};
use planetmesh_node::stats::{report_interval, spawn_stats_reporter, LogSink};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// PlanetMesh node: planet routing, realtime presence and admission control.
#[derive(Parser, Debug)]
#[command(name = "pm-node", version, about)]
struct Cli {
    /// Path to the node configuration file (.toml or .json)
    #[arg(long, env = "PLANETMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the placement file; overrides `placement` in the config
    #[arg(long, env = "PLANETMESH_PLACEMENT")]
    placement: Option<PathBuf>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let mut config = match path {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => NodeConfig::default(),
    };
    config.apply_env();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_logging(format: LogFormat) {
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(config.log_format);

    tracing::info!("PlanetMesh node starting...");

    let cell = IdentityCell::new();
    cell.install(config.identity())?;
    let identity = cell.current()?;

    let placement_path = cli.placement.clone().or_else(|| config.placement.clone());
    let table = match &placement_path {
        Some(path) => load_table(path)?,
        None => {
            tracing::warn!("no placement file configured, no planets are hosted until one arrives");
            PlacementTable::default()
        }
    };

    let node = Arc::new(MeshNode::new(identity, &config, table));
    tracing::info!(
        node = %node.identity().name(),
        address = node.identity().address().unwrap_or("-"),
        planets = node.locator().hosted_count(),
        "node ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (placement_tx, placement_rx) = mpsc::channel::<PlacementTable>(8);
    let sync_handle = spawn_placement_sync(node.locator().clone(), placement_rx);

    let stats_handle = spawn_stats_reporter(
        node.stats_aggregator(),
        Arc::new(LogSink),
        report_interval(&config.stats),
        shutdown_rx.clone(),
    );

    let maintenance_node = node.clone();
    let mut maintenance_shutdown = shutdown_rx.clone();
    let maintenance_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    maintenance_node.gate().purge_expired(now_ms());
                    maintenance_node.self_check();
                }
                _ = maintenance_shutdown.changed() => break,
            }
        }
    });

    let reload_handle = spawn_placement_reload(placement_path, placement_tx, shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    let _ = stats_handle.await;
    let _ = maintenance_handle.await;
    let _ = reload_handle.await;
    let _ = sync_handle.await;

    tracing::info!("PlanetMesh node stopped");
    Ok(())
}
