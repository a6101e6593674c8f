//! Immutable per-process node identity.
//!
//! The identity is built once at startup and shared by `Arc` with every
//! component that needs it. [`IdentityCell`] enforces the one-shot
//! initialization; after that, readers never synchronize.

use std::fmt;
use std::sync::{Arc, OnceLock};

use subtle::ConstantTimeEq;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{MeshError, Result};
use crate::types::NodeName;

/// Header carrying the inter-node credential on outgoing calls.
pub const NODE_AUTH_HEADER: &str = "x-planetmesh-node-auth";

/// Header carrying the calling node's name on outgoing calls.
pub const NODE_NAME_HEADER: &str = "x-planetmesh-node-name";

/// Shared secret used to authenticate calls between nodes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credential(String);

impl Credential {
    /// Wraps a raw api key.
    pub fn new(key: impl Into<String>) -> Self {
        Credential(key.into())
    }

    /// Constant-time comparison against a presented key.
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Returns true if the credential is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Identity of the local node.
#[derive(Clone, Debug)]
pub struct NodeIdentity {
    name: NodeName,
    credential: Credential,
    address: Option<String>,
}

impl NodeIdentity {
    /// Creates an identity with no advertised address.
    pub fn new(name: impl Into<NodeName>, credential: Credential) -> Self {
        Self {
            name: name.into(),
            credential,
            address: None,
        }
    }

    /// Sets the address other nodes and redirected clients should use.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Returns this node's name.
    pub fn name(&self) -> &NodeName {
        &self.name
    }

    /// Returns this node's advertised address, if configured.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Headers to attach to an outgoing inter-node call.
    pub fn auth_headers(&self) -> [(&'static str, String); 2] {
        [
            (NODE_NAME_HEADER, self.name.to_string()),
            (NODE_AUTH_HEADER, self.credential.expose().to_string()),
        ]
    }

    /// Verifies the credential presented by an incoming inter-node call.
    pub fn verify_peer(&self, presented: &str) -> Result<()> {
        if self.credential.matches(presented) {
            Ok(())
        } else {
            Err(MeshError::Unauthorized)
        }
    }
}

/// One-shot holder for the process identity.
#[derive(Default)]
pub struct IdentityCell {
    inner: OnceLock<Arc<NodeIdentity>>,
}

impl IdentityCell {
    /// Creates an empty cell.
    pub fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Initializes the identity. Fails if called more than once.
    pub fn initialize(
        &self,
        name: impl Into<NodeName>,
        credential: Credential,
    ) -> Result<Arc<NodeIdentity>> {
        self.install(NodeIdentity::new(name, credential))
    }

    /// Installs a fully built identity. Fails if called more than once.
    pub fn install(&self, identity: NodeIdentity) -> Result<Arc<NodeIdentity>> {
        let identity = Arc::new(identity);
        self.inner
            .set(identity.clone())
            .map_err(|_| MeshError::AlreadyInitialized)?;
        info!(node = %identity.name, "node identity initialized");
        Ok(identity)
    }

    /// Returns the identity, or `ConfigNotInitialized` before startup finished.
    pub fn current(&self) -> Result<Arc<NodeIdentity>> {
        self.inner.get().cloned().ok_or(MeshError::ConfigNotInitialized)
    }

    /// Returns true once `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.inner.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_before_initialize() {
        let cell = IdentityCell::new();
        assert!(matches!(cell.current(), Err(MeshError::ConfigNotInitialized)));
        assert!(!cell.is_initialized());
    }

    #[test]
    fn test_initialize_once() {
        let cell = IdentityCell::new();
        let id = cell.initialize("alpha", Credential::new("secret")).unwrap();
        assert_eq!(id.name().as_str(), "alpha");
        assert_eq!(cell.current().unwrap().name().as_str(), "alpha");

        let again = cell.initialize("beta", Credential::new("other"));
        assert!(matches!(again, Err(MeshError::AlreadyInitialized)));
        assert_eq!(cell.current().unwrap().name().as_str(), "alpha");
    }

    #[test]
    fn test_verify_peer() {
        let id = NodeIdentity::new("alpha", Credential::new("secret"));
        assert!(id.verify_peer("secret").is_ok());
        assert!(matches!(id.verify_peer("wrong"), Err(MeshError::Unauthorized)));
        assert!(id.verify_peer("").is_err());
    }

    #[test]
    fn test_credential_debug_redacted() {
        let id = NodeIdentity::new("alpha", Credential::new("secret"));
        let dbg = format!("{:?}", id);
        assert!(!dbg.contains("secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn test_auth_headers() {
        let id = NodeIdentity::new("alpha", Credential::new("secret")).with_address("https://alpha.nodes");
        let headers = id.auth_headers();
        assert_eq!(headers[0], (NODE_NAME_HEADER, "alpha".to_string()));
        assert_eq!(headers[1], (NODE_AUTH_HEADER, "secret".to_string()));
        assert_eq!(id.address(), Some("https://alpha.nodes"));
    }

    #[test]
    fn test_current_from_many_threads() {
        let cell = Arc::new(IdentityCell::new());
        cell.initialize("alpha", Credential::new("k")).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || cell.current().unwrap().name().to_string())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), "alpha");
        }
    }
}
