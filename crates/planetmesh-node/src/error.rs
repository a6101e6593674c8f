//! Error types for the PlanetMesh node core.

use thiserror::Error;

use crate::locator::Redirect;
use crate::types::{ConnectionId, PlanetId};

/// Errors and expected non-success outcomes of node operations.
#[derive(Error, Debug)]
pub enum MeshError {
    /// The planet is hosted by another node; the caller retries there.
    #[error("planet {} is hosted on node {}", .0.planet_id, .0.correct_node_name)]
    NotHosted(Redirect),

    /// Quota exceeded for (policy, caller).
    #[error("rate limited by policy '{policy}' for caller '{caller}', retry in {retry_after_ms}ms")]
    RateLimited {
        /// Name of the policy that rejected the call
        policy: String,
        /// Caller identity the quota is tracked for
        caller: String,
        /// Milliseconds until the current window closes
        retry_after_ms: u64,
    },

    /// A directory mutation would break cross-index consistency.
    #[error("directory inconsistency on connection {connection}: {detail}")]
    DirectoryInconsistency {
        /// Connection the rejected operation targeted
        connection: ConnectionId,
        /// What would have been violated
        detail: String,
    },

    /// Node identity was read before startup initialization.
    #[error("node identity not initialized")]
    ConfigNotInitialized,

    /// Node identity was initialized a second time.
    #[error("node identity already initialized")]
    AlreadyInitialized,

    /// The control plane has no placement for this planet.
    #[error("planet {0} is not assigned to any node")]
    PlanetUnassigned(PlanetId),

    /// A guarded operation named a policy with no quota rule.
    #[error("unknown rate limit policy '{0}'")]
    UnknownPolicy(String),

    /// Group name uses a reserved prefix without the canonical id form.
    #[error("invalid group name '{0}'")]
    InvalidGroup(String),

    /// Capacity for an index update could not be reserved.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Control-plane update is older than the applied mapping.
    #[error("stale placement version {got}, current is {current}")]
    StalePlacement {
        /// Version already applied
        current: u64,
        /// Version that was offered
        got: u64,
    },

    /// Inter-node credential did not match.
    #[error("inter-node credential rejected")]
    Unauthorized,

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Returns true for outcomes the caller can act on by retrying,
    /// elsewhere or later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MeshError::NotHosted(_) | MeshError::RateLimited { .. })
    }

    /// Returns true for errors that signal an implementation or startup defect
    /// rather than a caller error.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            MeshError::DirectoryInconsistency { .. } | MeshError::ConfigNotInitialized
        )
    }

    /// Returns the redirect payload for a `NotHosted` outcome.
    pub fn redirect(&self) -> Option<&Redirect> {
        match self {
            MeshError::NotHosted(redirect) => Some(redirect),
            _ => None,
        }
    }
}

/// Result type alias using MeshError as the error type.
pub type Result<T> = std::result::Result<T, MeshError>;
