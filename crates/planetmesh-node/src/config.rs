//! Node configuration.
//!
//! Loaded once at startup from a `.toml` or `.json` file, then overridden by
//! `PLANETMESH_NODE_*` environment variables. Never reloaded.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionConfig;
use crate::directory::DirectoryConfig;
use crate::error::{MeshError, Result};
use crate::identity::{Credential, NodeIdentity};
use crate::stats::StatsConfig;

/// Environment variable overriding `node.name`.
pub const ENV_NODE_NAME: &str = "PLANETMESH_NODE_NAME";
/// Environment variable overriding `node.api_key`.
pub const ENV_NODE_API_KEY: &str = "PLANETMESH_NODE_API_KEY";
/// Environment variable overriding `node.address`.
pub const ENV_NODE_ADDRESS: &str = "PLANETMESH_NODE_ADDRESS";

/// Identity of this node.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Node name, unique in the cluster.
    pub name: String,
    /// Shared inter-node api key.
    pub api_key: String,
    /// Address clients are redirected to for planets on this node.
    pub address: Option<String>,
}

impl fmt::Debug for NodeSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSection")
            .field("name", &self.name)
            .field("api_key", &"<redacted>")
            .field("address", &self.address)
            .finish()
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Full node configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity.
    pub node: NodeSection,
    /// Presence directory sizing.
    pub directory: DirectoryConfig,
    /// Admission policies.
    pub admission: AdmissionConfig,
    /// Stats reporting.
    pub stats: StatsConfig,
    /// Placement file to seed the locator with.
    pub placement: Option<PathBuf>,
    /// Log output format.
    pub log_format: LogFormat,
}

impl NodeConfig {
    /// Loads configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext {
            "toml" => toml::from_str(&contents)
                .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e))),
            "json" => serde_json::from_str(&contents)
                .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e))),
            _ => Err(MeshError::Config(format!(
                "unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Applies `PLANETMESH_NODE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(ENV_NODE_NAME) {
            self.node.name = name;
        }
        if let Some(key) = lookup(ENV_NODE_API_KEY) {
            self.node.api_key = key;
        }
        if let Some(address) = lookup(ENV_NODE_ADDRESS) {
            self.node.address = Some(address).filter(|a| !a.is_empty());
        }
    }

    /// Checks the configuration for values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            return Err(MeshError::Config("node.name must not be empty".to_string()));
        }
        if self.node.api_key.is_empty() {
            return Err(MeshError::Config(
                "node.api_key must not be empty".to_string(),
            ));
        }
        let shards = self.directory.shard_count;
        if shards == 0 || !shards.is_power_of_two() {
            return Err(MeshError::Config(format!(
                "directory.shard_count must be a power of two, got {}",
                shards
            )));
        }
        if self.directory.max_groups_per_connection == 0 {
            return Err(MeshError::Config(
                "directory.max_groups_per_connection must be positive".to_string(),
            ));
        }
        if self.stats.report_interval_secs == 0 {
            return Err(MeshError::Config(
                "stats.report_interval_secs must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for policy in &self.admission.policies {
            if policy.name.is_empty() {
                return Err(MeshError::Config("admission policy without a name".to_string()));
            }
            if policy.permit_limit == 0 || policy.window_secs == 0 {
                return Err(MeshError::Config(format!(
                    "admission policy '{}' needs a positive limit and window",
                    policy.name
                )));
            }
            if !seen.insert(policy.name.as_str()) {
                return Err(MeshError::Config(format!(
                    "duplicate admission policy '{}'",
                    policy.name
                )));
            }
        }
        Ok(())
    }

    /// Builds the node identity described by the `node` section.
    pub fn identity(&self) -> NodeIdentity {
        let identity = NodeIdentity::new(
            self.node.name.clone(),
            Credential::new(self.node.api_key.clone()),
        );
        match &self.node.address {
            Some(address) => identity.with_address(address.clone()),
            None => identity,
        }
    }
}
