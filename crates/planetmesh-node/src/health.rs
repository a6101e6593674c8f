//! Node health tracking.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Health status of a component or node
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is healthy
    Healthy,
    /// Component hit a defect but keeps serving
    Degraded,
}

/// Health information for a single component
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Current health status
    pub status: HealthStatus,
    /// Reason of the last degradation
    pub message: Option<String>,
    /// Number of times the component was degraded since startup
    pub incidents: u64,
}

/// Complete health report for a node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    /// Node name
    pub node: String,
    /// Overall health status
    pub overall: HealthStatus,
    /// Component health details
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    /// Returns true if overall status is Healthy
    pub fn is_healthy(&self) -> bool {
        self.overall == HealthStatus::Healthy
    }

    /// Returns list of degraded components
    pub fn degraded_components(&self) -> Vec<&ComponentHealth> {
        self.components
            .iter()
            .filter(|c| c.status == HealthStatus::Degraded)
            .collect()
    }
}

/// Tracks per-component health for the node.
pub struct HealthMonitor {
    node: String,
    components: Mutex<Vec<ComponentHealth>>,
}

impl HealthMonitor {
    /// Creates a monitor with the given components, all healthy.
    pub fn new(node: impl Into<String>, components: &[&str]) -> Self {
        Self {
            node: node.into(),
            components: Mutex::new(
                components
                    .iter()
                    .map(|name| ComponentHealth {
                        name: name.to_string(),
                        status: HealthStatus::Healthy,
                        message: None,
                        incidents: 0,
                    })
                    .collect(),
            ),
        }
    }

    /// Marks `component` degraded. Unknown components are registered on the fly.
    pub fn degrade(&self, component: &str, reason: impl Into<String>) {
        let reason = reason.into();
        let mut components = self.components.lock();
        match components.iter_mut().find(|c| c.name == component) {
            Some(c) => {
                c.status = HealthStatus::Degraded;
                c.message = Some(reason.clone());
                c.incidents += 1;
            }
            None => components.push(ComponentHealth {
                name: component.to_string(),
                status: HealthStatus::Degraded,
                message: Some(reason.clone()),
                incidents: 1,
            }),
        }
        warn!(component, %reason, "node health degraded");
    }

    /// Marks `component` healthy again. The incident count is kept.
    pub fn recover(&self, component: &str) {
        let mut components = self.components.lock();
        if let Some(c) = components.iter_mut().find(|c| c.name == component) {
            if c.status != HealthStatus::Healthy {
                c.status = HealthStatus::Healthy;
                c.message = None;
                info!(component, "component recovered");
            }
        }
    }

    /// Overall status: degraded if any component is.
    pub fn status(&self) -> HealthStatus {
        let components = self.components.lock();
        if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Builds a full health report.
    pub fn report(&self) -> HealthReport {
        let components = self.components.lock().clone();
        let overall = if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            node: self.node.clone(),
            overall,
            components,
        }
    }
}
