//! Unified PlanetMesh node.
//!
//! Combines the locator, the presence directory, the admission gate and the
//! health monitor behind one API used by the request and realtime layers.
//! Every planet-scoped request flows gate -> locator -> directory; a rejection
//! at any step ends the request with no side effect.

use std::sync::Arc;

use tracing::{debug, error};

use crate::admission::{AdmissionGate, HUB_JOIN_POLICY, PLANET_ROUTE_POLICY};
use crate::config::NodeConfig;
use crate::directory::{GroupMembers, PresenceDirectory};
use crate::error::{MeshError, Result};
use crate::health::{HealthMonitor, HealthReport, HealthStatus};
use crate::identity::NodeIdentity;
use crate::locator::{HostingNode, NodeHandshake, PlacementTable, ShardLocator};
use crate::stats::{DetailedNodeStats, NodeStats, StatsAggregator};
use crate::types::{ConnectionId, Group, PlanetId, UserId};

const DIRECTORY_COMPONENT: &str = "directory";

/// One PlanetMesh node.
pub struct MeshNode {
    identity: Arc<NodeIdentity>,
    locator: Arc<ShardLocator>,
    directory: Arc<PresenceDirectory>,
    gate: Arc<AdmissionGate>,
    health: Arc<HealthMonitor>,
    stats: StatsAggregator,
}

impl MeshNode {
    /// Builds a node from its configuration and an initial placement table.
    pub fn new(identity: Arc<NodeIdentity>, config: &NodeConfig, placement: PlacementTable) -> Self {
        let locator = Arc::new(ShardLocator::with_table(identity.clone(), placement));
        let directory = Arc::new(PresenceDirectory::new(config.directory.clone()));
        let gate = Arc::new(AdmissionGate::from_config(&config.admission));
        Self::from_parts(identity, locator, directory, gate)
    }

    /// Builds a node from already constructed components.
    pub fn from_parts(
        identity: Arc<NodeIdentity>,
        locator: Arc<ShardLocator>,
        directory: Arc<PresenceDirectory>,
        gate: Arc<AdmissionGate>,
    ) -> Self {
        let health = Arc::new(HealthMonitor::new(
            identity.name().as_str(),
            &[DIRECTORY_COMPONENT],
        ));
        let stats = StatsAggregator::new(directory.clone(), locator.clone());
        Self {
            identity,
            locator,
            directory,
            gate,
            health,
            stats,
        }
    }

    /// This node's identity.
    pub fn identity(&self) -> &Arc<NodeIdentity> {
        &self.identity
    }

    /// The planet locator.
    pub fn locator(&self) -> &Arc<ShardLocator> {
        &self.locator
    }

    /// The presence directory.
    pub fn directory(&self) -> &Arc<PresenceDirectory> {
        &self.directory
    }

    /// The admission gate.
    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    /// A stats aggregator over this node's components.
    pub fn stats_aggregator(&self) -> StatsAggregator {
        self.stats.clone()
    }

    /// Flips health to degraded when `result` carries a defect.
    fn observe<T>(&self, component: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_defect() {
                self.health.degrade(component, e.to_string());
            }
        }
        result
    }

    /// Routes a planet-scoped request from `caller`.
    ///
    /// Fails with `RateLimited` before any lookup, or with `NotHosted` naming
    /// the node to retry on.
    pub fn route_planet(&self, caller: &str, planet: PlanetId, now_ms: u64) -> Result<HostingNode> {
        self.gate.guard(PLANET_ROUTE_POLICY, caller, now_ms, || {
            self.locator.route(planet)
        })
    }

    /// Adds a realtime connection to a group.
    ///
    /// Planet groups are only accepted on the node hosting the planet, and
    /// only in the canonical `planet:<id>` form.
    /// Returns `Ok(false)` if the connection already was in the group.
    pub fn join_group(
        &self,
        conn: &ConnectionId,
        user: UserId,
        group: &Group,
        now_ms: u64,
    ) -> Result<bool> {
        let caller = user.to_string();
        self.gate.guard(HUB_JOIN_POLICY, &caller, now_ms, || {
            if group.is_planet_scoped() {
                let planet = group
                    .planet_id()
                    .ok_or_else(|| MeshError::InvalidGroup(group.to_string()))?;
                self.locator.route(planet)?;
            }
            let joined = self.directory.join(conn, user, group);
            self.observe(DIRECTORY_COMPONENT, joined)
        })
    }

    /// Joins the group of a planet hosted here.
    pub fn join_planet(
        &self,
        conn: &ConnectionId,
        user: UserId,
        planet: PlanetId,
        now_ms: u64,
    ) -> Result<bool> {
        self.join_group(conn, user, &Group::planet(planet), now_ms)
    }

    /// Removes a connection from a group.
    pub fn leave_group(&self, conn: &ConnectionId, group: &Group) -> Result<bool> {
        let left = self.directory.leave(conn, group);
        self.observe(DIRECTORY_COMPONENT, left)
    }

    /// Clears a closed connection from every group.
    pub fn disconnect(&self, conn: &ConnectionId) -> Result<usize> {
        let cleared = self.directory.leave_all(conn);
        if let Ok(n) = &cleared {
            debug!(connection = %conn, groups = n, "connection closed");
        }
        self.observe(DIRECTORY_COMPONENT, cleared)
    }

    /// Fan-out targets of `group`.
    pub fn query_group(&self, group: &Group) -> GroupMembers {
        self.directory.query(group)
    }

    /// Applies a control-plane placement update.
    pub fn apply_placement(&self, table: PlacementTable) -> Result<()> {
        self.locator.apply(table)
    }

    /// Answer to a peer node's handshake, after checking its credential.
    pub fn handshake(&self, presented_key: &str) -> Result<NodeHandshake> {
        self.identity.verify_peer(presented_key)?;
        Ok(self.locator.handshake())
    }

    /// Scalar node stats.
    pub fn stats(&self) -> NodeStats {
        self.stats.stats()
    }

    /// Node stats with full index copies.
    pub fn detailed_stats(&self) -> DetailedNodeStats {
        self.stats.detailed()
    }

    /// Current health report.
    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    /// Overall health status.
    pub fn health_status(&self) -> HealthStatus {
        self.health.status()
    }

    /// Verifies every cross-index invariant on a fresh snapshot.
    ///
    /// Degrades health and returns the violations if any are found. A clean
    /// check never restores health; see [`MeshNode::clear_health`].
    pub fn self_check(&self) -> Vec<String> {
        let violations = self.directory.snapshot().violations();
        if !violations.is_empty() {
            error!(count = violations.len(), "presence directory self-check failed");
            self.health.degrade(DIRECTORY_COMPONENT, violations.join("; "));
        }
        violations
    }

    /// Marks the directory healthy again after an operator has looked at it.
    pub fn clear_health(&self) {
        self.health.recover(DIRECTORY_COMPONENT);
    }
}
