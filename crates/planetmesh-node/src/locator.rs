//! Planet routing for a partitioned node cluster.
//!
//! The locator holds a read-optimized local view of the planet -> node
//! placement published by the control plane. Lookups are lock-free loads of an
//! `Arc`; each control-plane update replaces the whole table in one atomic
//! swap, so no lookup can observe a half-applied mapping.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MeshError, Result};
use crate::identity::NodeIdentity;
use crate::types::{NodeName, PlanetId};

/// Where a caller must retry a planet-scoped request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redirect {
    /// The planet that was requested.
    pub planet_id: PlanetId,
    /// Node currently hosting the planet.
    pub correct_node_name: NodeName,
    /// Address of that node, when the control plane published one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correct_node_address: Option<String>,
}

/// Successful routing result: the planet is hosted on this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostingNode {
    /// The routed planet.
    pub planet_id: PlanetId,
    /// This node's name.
    pub node: NodeName,
    /// Placement version the decision was made under.
    pub placement_version: u64,
}

/// Immutable placement snapshot published by the control plane.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlacementTable {
    version: u64,
    planets: HashMap<PlanetId, NodeName>,
    addresses: HashMap<NodeName, String>,
}

impl PlacementTable {
    /// Creates an empty table with the given version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            planets: HashMap::new(),
            addresses: HashMap::new(),
        }
    }

    /// Assigns a planet to a node.
    pub fn assign(mut self, planet: PlanetId, node: impl Into<NodeName>) -> Self {
        self.planets.insert(planet, node.into());
        self
    }

    /// Records the address of a node.
    pub fn with_address(mut self, node: impl Into<NodeName>, address: impl Into<String>) -> Self {
        self.addresses.insert(node.into(), address.into());
        self
    }

    /// Version of this table. Higher versions supersede lower ones.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns the node hosting `planet`.
    pub fn node_for(&self, planet: PlanetId) -> Option<&NodeName> {
        self.planets.get(&planet)
    }

    /// Returns the published address of `node`.
    pub fn address_of(&self, node: &NodeName) -> Option<&str> {
        self.addresses.get(node).map(String::as_str)
    }

    /// Returns every planet assigned to `node`, sorted.
    pub fn planets_on(&self, node: &NodeName) -> Vec<PlanetId> {
        let mut planets: Vec<PlanetId> = self
            .planets
            .iter()
            .filter(|(_, n)| *n == node)
            .map(|(&p, _)| p)
            .collect();
        planets.sort_unstable();
        planets
    }

    /// Number of planets in the table.
    pub fn len(&self) -> usize {
        self.planets.len()
    }

    /// Returns true if no planet is assigned.
    pub fn is_empty(&self) -> bool {
        self.planets.is_empty()
    }
}

/// Response to a peer's handshake request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHandshake {
    /// Name of the answering node.
    pub node: NodeName,
    /// Software version of the answering node.
    pub version: String,
    /// Planets hosted by the answering node.
    pub planet_ids: Vec<PlanetId>,
}

/// Routes planets to their hosting node.
pub struct ShardLocator {
    local: Arc<NodeIdentity>,
    table: ArcSwap<PlacementTable>,
    /// Serializes writers; readers never take it.
    apply_lock: Mutex<()>,
    swaps: AtomicU64,
    redirects: AtomicU64,
}

impl ShardLocator {
    /// Creates a locator with an empty version-0 table.
    pub fn new(local: Arc<NodeIdentity>) -> Self {
        Self::with_table(local, PlacementTable::default())
    }

    /// Creates a locator seeded with an initial table.
    pub fn with_table(local: Arc<NodeIdentity>, table: PlacementTable) -> Self {
        Self {
            local,
            table: ArcSwap::from_pointee(table),
            apply_lock: Mutex::new(()),
            swaps: AtomicU64::new(0),
            redirects: AtomicU64::new(0),
        }
    }

    /// Name of the local node.
    pub fn local_node(&self) -> &NodeName {
        self.local.name()
    }

    /// Routes a planet-scoped request.
    ///
    /// Returns `NotHosted` with the correct node when another node hosts the
    /// planet, and `PlanetUnassigned` when the control plane has no placement.
    pub fn route(&self, planet: PlanetId) -> Result<HostingNode> {
        let table = self.table.load();
        match table.node_for(planet) {
            Some(node) if node == self.local.name() => Ok(HostingNode {
                planet_id: planet,
                node: node.clone(),
                placement_version: table.version,
            }),
            Some(node) => {
                self.redirects.fetch_add(1, Ordering::Relaxed);
                debug!(
                    planet = %planet,
                    target = %node,
                    "planet not hosted locally, redirecting"
                );
                Err(MeshError::NotHosted(Redirect {
                    planet_id: planet,
                    correct_node_name: node.clone(),
                    correct_node_address: table.address_of(node).map(str::to_string),
                }))
            }
            None => Err(MeshError::PlanetUnassigned(planet)),
        }
    }

    /// Returns the node hosting `planet`, local or not.
    pub fn node_for(&self, planet: PlanetId) -> Option<NodeName> {
        self.table.load().node_for(planet).cloned()
    }

    /// Returns true if `planet` is hosted on this node.
    pub fn is_local(&self, planet: PlanetId) -> bool {
        self.table.load().node_for(planet) == Some(self.local.name())
    }

    /// Replaces the placement table.
    ///
    /// Versions must increase; an older or equal version is rejected with
    /// `StalePlacement` and the current table stays in place. Version 0 means
    /// "no placement yet" and may be replaced by another version 0.
    pub fn apply(&self, table: PlacementTable) -> Result<()> {
        let _guard = self.apply_lock.lock();
        let current = self.table.load().version;
        if table.version < current || (table.version == current && current != 0) {
            return Err(MeshError::StalePlacement {
                current,
                got: table.version,
            });
        }

        let version = table.version;
        let planets = table.len();
        let previous = self.table.swap(Arc::new(table));
        self.swaps.fetch_add(1, Ordering::Relaxed);

        let (gained, lost) = placement_delta(
            &previous.planets_on(self.local.name()),
            &self.hosted_planets(),
        );

        info!(
            version,
            planets,
            gained,
            lost,
            "placement table applied"
        );
        Ok(())
    }

    /// Returns the current placement table.
    pub fn table(&self) -> Arc<PlacementTable> {
        self.table.load_full()
    }

    /// Version of the applied placement table.
    pub fn version(&self) -> u64 {
        self.table.load().version
    }

    /// Planets hosted on this node, sorted.
    pub fn hosted_planets(&self) -> Vec<PlanetId> {
        self.table.load().planets_on(self.local.name())
    }

    /// Number of planets hosted on this node.
    pub fn hosted_count(&self) -> usize {
        let table = self.table.load();
        table
            .planets
            .values()
            .filter(|n| *n == self.local.name())
            .count()
    }

    /// Builds the handshake answer for a peer node.
    pub fn handshake(&self) -> NodeHandshake {
        NodeHandshake {
            node: self.local.name().clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            planet_ids: self.hosted_planets(),
        }
    }

    /// Number of tables applied since startup.
    pub fn swap_count(&self) -> u64 {
        self.swaps.load(Ordering::Relaxed)
    }

    /// Number of `NotHosted` outcomes returned since startup.
    pub fn redirect_count(&self) -> u64 {
        self.redirects.load(Ordering::Relaxed)
    }
}

/// Counts planets gained and lost between two hosted-planet lists.
fn placement_delta(before: &[PlanetId], now: &[PlanetId]) -> (usize, usize) {
    let before: HashSet<_> = before.iter().collect();
    let now: HashSet<_> = now.iter().collect();
    (now.difference(&before).count(), before.difference(&now).count())
}
