//! Placement tables as published by the control plane.
//!
//! A placement file lists which node hosts which planet plus the address of
//! each node:
//!
//! ```toml
//! version = 3
//!
//! [[assignments]]
//! planet = 10
//! node = "alpha"
//!
//! [[nodes]]
//! name = "alpha"
//! address = "https://alpha.nodes.example"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{MeshError, Result};
use crate::locator::{PlacementTable, ShardLocator};
use crate::types::{NodeName, PlanetId};

/// One planet -> node assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Planet being placed.
    pub planet: PlanetId,
    /// Node hosting it.
    pub node: NodeName,
}

/// Published address of a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Node name.
    pub name: NodeName,
    /// Address redirected clients should use.
    pub address: String,
}

/// Serialized form of a placement table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementFile {
    /// Placement version; higher supersedes lower.
    pub version: u64,
    /// Planet assignments.
    pub assignments: Vec<Assignment>,
    /// Node addresses.
    pub nodes: Vec<NodeAddress>,
}

impl PlacementFile {
    /// Loads a placement file from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e))),
            "json" => serde_json::from_str(&contents)
                .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e))),
            ext => Err(MeshError::Config(format!(
                "unsupported placement file extension: {}",
                ext
            ))),
        }
    }

    /// Converts to a table, rejecting planets assigned twice.
    pub fn into_table(self) -> Result<PlacementTable> {
        let mut table = PlacementTable::new(self.version);
        for a in self.assignments {
            if let Some(existing) = table.node_for(a.planet) {
                return Err(MeshError::Config(format!(
                    "planet {} assigned to both {} and {}",
                    a.planet, existing, a.node
                )));
            }
            table = table.assign(a.planet, a.node);
        }
        for n in self.nodes {
            table = table.with_address(n.name, n.address);
        }
        Ok(table)
    }
}

/// Loads a placement file and converts it to a table.
pub fn load_table(path: &Path) -> Result<PlacementTable> {
    let table = PlacementFile::from_file(path)?.into_table()?;
    info!(path = %path.display(), version = table.version(), planets = table.len(), "placement loaded");
    Ok(table)
}

/// Applies every table received on `updates` to `locator` until the channel
/// closes. Stale tables are logged and skipped.
pub fn spawn_placement_sync(
    locator: Arc<ShardLocator>,
    mut updates: mpsc::Receiver<PlacementTable>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(table) = updates.recv().await {
            let version = table.version();
            match locator.apply(table) {
                Ok(()) => debug!(version, "placement update applied"),
                Err(e @ MeshError::StalePlacement { .. }) => {
                    warn!(error = %e, "placement update ignored");
                }
                Err(e) => warn!(error = %e, version, "placement update failed"),
            }
        }
        info!("placement feed closed");
    })
}

/// Re-reads the placement file on SIGHUP and forwards each table to
/// `updates`.
///
/// The sender lives until `shutdown` fires, with or without a file to
/// reload, so the sync task on the other end only stops at shutdown.
pub fn spawn_placement_reload(
    path: Option<PathBuf>,
    updates: mpsc::Sender<PlacementTable>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match path {
            Some(path) => reload_on_hangup(&path, &updates, &mut shutdown).await,
            None => {
                let _ = shutdown.changed().await;
            }
        }
        drop(updates);
    })
}

#[cfg(unix)]
async fn reload_on_hangup(
    path: &Path,
    updates: &mpsc::Sender<PlacementTable>,
    shutdown: &mut watch::Receiver<bool>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGHUP, placement reload disabled");
            let _ = shutdown.changed().await;
            return;
        }
    };
    loop {
        tokio::select! {
            _ = hangup.recv() => match load_table(path) {
                Ok(table) => {
                    if updates.send(table).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(error = %e, "placement reload failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _path: &Path,
    _updates: &mpsc::Sender<PlacementTable>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let _ = shutdown.changed().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Credential, NodeIdentity};
    use std::io::Write;
    use std::time::Duration;

    const SAMPLE: &str = r#"
version = 3

[[assignments]]
planet = 10
node = "alpha"

[[assignments]]
planet = 20
node = "beta"

[[nodes]]
name = "alpha"
address = "https://alpha.nodes.example"
"#;

    #[test]
    fn test_load_toml_placement() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let table = load_table(file.path()).unwrap();
        assert_eq!(table.version(), 3);
        assert_eq!(table.node_for(PlanetId::new(10)).unwrap().as_str(), "alpha");
        assert_eq!(
            table.address_of(&NodeName::from("alpha")),
            Some("https://alpha.nodes.example")
        );
        assert_eq!(table.address_of(&NodeName::from("beta")), None);
    }

    #[test]
    fn test_json_placement() {
        let file: PlacementFile = serde_json::from_str(
            r#"{"version": 1, "assignments": [{"planet": 7, "node": "gamma"}]}"#,
        )
        .unwrap();
        let table = file.into_table().unwrap();
        assert_eq!(table.planets_on(&NodeName::from("gamma")), vec![PlanetId::new(7)]);
    }

    #[test]
    fn test_duplicate_assignment_rejected() {
        let file = PlacementFile {
            version: 1,
            assignments: vec![
                Assignment {
                    planet: PlanetId::new(10),
                    node: NodeName::from("alpha"),
                },
                Assignment {
                    planet: PlanetId::new(10),
                    node: NodeName::from("beta"),
                },
            ],
            nodes: vec![],
        };
        assert!(matches!(file.into_table(), Err(MeshError::Config(_))));
    }

    #[tokio::test]
    async fn test_sync_applies_updates_in_order() {
        let identity = Arc::new(NodeIdentity::new("gamma", Credential::new("k")));
        let locator = Arc::new(ShardLocator::new(identity));
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_placement_sync(locator.clone(), rx);

        tx.send(PlacementTable::new(1).assign(PlanetId::new(10), "alpha"))
            .await
            .unwrap();
        tx.send(PlacementTable::new(2).assign(PlanetId::new(10), "gamma"))
            .await
            .unwrap();
        // Stale: must not undo the migration.
        tx.send(PlacementTable::new(1).assign(PlanetId::new(10), "alpha"))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(locator.version(), 2);
        assert!(locator.route(PlanetId::new(10)).is_ok());
        assert_eq!(locator.swap_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_stays_open_without_placement_file() {
        let identity = Arc::new(NodeIdentity::new("gamma", Credential::new("k")));
        let locator = Arc::new(ShardLocator::new(identity));
        let (tx, rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sync = spawn_placement_sync(locator, rx);
        let reload = spawn_placement_reload(None, tx, shutdown_rx);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!sync.is_finished());
        assert!(!reload.is_finished());

        shutdown_tx.send(true).unwrap();
        reload.await.unwrap();
        sync.await.unwrap();
    }
}
