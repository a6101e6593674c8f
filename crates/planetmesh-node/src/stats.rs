//! Node statistics derived from the directory and the locator.
//!
//! Stats are read-only views computed on demand. A background reporter can
//! push [`NodeStats`] to a [`StatsSink`] on a fixed interval.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::directory::{DirectorySnapshot, PresenceDirectory};
use crate::locator::ShardLocator;
use crate::types::{ConnectionId, Group, NodeName, UserId};

/// Configuration for the stats reporter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Seconds between two reports.
    pub report_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 30,
        }
    }
}

/// Summary statistics for one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    /// Node the stats were taken on.
    pub name: NodeName,
    /// Connections present in the directory.
    pub connection_count: usize,
    /// Groups with at least one connection.
    pub connection_group_count: usize,
    /// Planets hosted on this node.
    pub planet_count: usize,
    /// Distinct users with at least one connection in some group.
    pub active_member_count: usize,
}

/// [`NodeStats`] plus full copies of the four presence indices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedNodeStats {
    /// Scalar counts, taken from the same cut as the indices.
    #[serde(flatten)]
    pub summary: NodeStats,
    /// group -> connections
    pub group_connections: BTreeMap<Group, BTreeSet<ConnectionId>>,
    /// group -> user ids
    pub group_user_ids: BTreeMap<Group, BTreeSet<UserId>>,
    /// connection -> groups
    pub connection_groups: BTreeMap<ConnectionId, BTreeSet<Group>>,
    /// user id -> groups
    pub user_id_groups: BTreeMap<UserId, BTreeSet<Group>>,
}

impl DetailedNodeStats {
    fn from_snapshot(name: NodeName, planet_count: usize, snap: DirectorySnapshot) -> Self {
        let counts = snap.counts();
        Self {
            summary: NodeStats {
                name,
                connection_count: counts.connections,
                connection_group_count: counts.groups,
                planet_count,
                active_member_count: counts.active_members,
            },
            group_connections: snap.group_connections,
            group_user_ids: snap.group_user_ids,
            connection_groups: snap.connection_groups,
            user_id_groups: snap.user_id_groups,
        }
    }
}

/// Computes stats from live components.
#[derive(Clone)]
pub struct StatsAggregator {
    directory: Arc<PresenceDirectory>,
    locator: Arc<ShardLocator>,
}

impl StatsAggregator {
    /// Creates an aggregator over the given components.
    pub fn new(directory: Arc<PresenceDirectory>, locator: Arc<ShardLocator>) -> Self {
        Self { directory, locator }
    }

    /// Scalar stats.
    pub fn stats(&self) -> NodeStats {
        let counts = self.directory.counts();
        NodeStats {
            name: self.locator.local_node().clone(),
            connection_count: counts.connections,
            connection_group_count: counts.groups,
            planet_count: self.locator.hosted_count(),
            active_member_count: counts.active_members,
        }
    }

    /// Scalar stats plus a consistent copy of every presence index.
    pub fn detailed(&self) -> DetailedNodeStats {
        DetailedNodeStats::from_snapshot(
            self.locator.local_node().clone(),
            self.locator.hosted_count(),
            self.directory.snapshot(),
        )
    }
}

/// Destination for periodic stats reports.
pub trait StatsSink: Send + Sync + 'static {
    /// Records one report.
    fn record(&self, stats: &NodeStats);
}

/// Sink that writes reports to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl StatsSink for LogSink {
    fn record(&self, stats: &NodeStats) {
        info!(
            node = %stats.name,
            connections = stats.connection_count,
            groups = stats.connection_group_count,
            planets = stats.planet_count,
            active_members = stats.active_member_count,
            "node stats"
        );
    }
}

/// Spawns a task that reports stats every `interval` until `shutdown` flips
/// to true or its sender is dropped.
pub fn spawn_stats_reporter(
    aggregator: StatsAggregator,
    sink: Arc<dyn StatsSink>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(interval_ms = interval.as_millis() as u64, "stats reporter started");
        loop {
            tokio::select! {
                _ = ticker.tick() => sink.record(&aggregator.stats()),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("stats reporter stopped");
    })
}

/// Validates a report interval. Zero is replaced by the default.
pub fn report_interval(config: &StatsConfig) -> Duration {
    if config.report_interval_secs == 0 {
        warn!("stats report interval of 0 replaced by default");
        Duration::from_secs(StatsConfig::default().report_interval_secs)
    } else {
        Duration::from_secs(config.report_interval_secs)
    }
}
