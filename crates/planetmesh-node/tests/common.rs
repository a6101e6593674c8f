//! Common test utilities and fixtures for integration tests.

use std::sync::Arc;

use planetmesh_node::{
    Credential, MeshNode, NodeConfig, NodeIdentity, PlacementTable, PlanetId,
};

/// Address published for every test node.
pub fn address_of(name: &str) -> String {
    format!("https://{}.nodes.test", name)
}

/// Placement used by the cluster tests: planet 10 on alpha, 20 on beta.
pub fn initial_placement() -> PlacementTable {
    PlacementTable::new(1)
        .assign(PlanetId::new(10), "alpha")
        .assign(PlanetId::new(11), "alpha")
        .assign(PlanetId::new(20), "beta")
        .with_address("alpha", address_of("alpha"))
        .with_address("beta", address_of("beta"))
        .with_address("gamma", address_of("gamma"))
}

/// An in-process cluster sharing one placement table.
pub struct TestCluster {
    nodes: Vec<MeshNode>,
}

impl TestCluster {
    /// Creates nodes with the given names, all seeded with `table`.
    pub fn new(names: &[&str], table: PlacementTable) -> Self {
        let nodes = names
            .iter()
            .map(|name| {
                let mut config = NodeConfig::default();
                config.node.name = name.to_string();
                config.node.api_key = "cluster-key".to_string();
                let identity = NodeIdentity::new(*name, Credential::new("cluster-key"))
                    .with_address(address_of(name));
                MeshNode::new(Arc::new(identity), &config, table.clone())
            })
            .collect();
        Self { nodes }
    }

    /// Returns the node with the given name.
    pub fn node(&self, name: &str) -> &MeshNode {
        self.nodes
            .iter()
            .find(|n| n.identity().name().as_str() == name)
            .unwrap_or_else(|| panic!("no node named {}", name))
    }

    /// Publishes a new placement to every node.
    pub fn publish(&self, table: PlacementTable) {
        for node in &self.nodes {
            node.apply_placement(table.clone()).unwrap();
        }
    }

    /// All nodes.
    pub fn nodes(&self) -> &[MeshNode] {
        &self.nodes
    }
}
