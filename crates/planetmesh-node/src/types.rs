use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Represents a unique identifier for a planet, the shard key for routing
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanetId(u64);

impl PlanetId {
    /// Creates a new PlanetId from a raw u64 value
    pub fn new(id: u64) -> Self {
        PlanetId(id)
    }

    /// Returns the raw u64 value of this planet ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlanetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents the id of an authenticated user
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
    /// Creates a new UserId from a raw u64 value
    pub fn new(id: u64) -> Self {
        UserId(id)
    }

    /// Returns the raw u64 value of this user ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a live realtime session, assigned by the transport layer
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates a new ConnectionId
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    /// Returns the connection id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        ConnectionId(s.to_string())
    }
}

/// Symbolic name of a backend node in the cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    /// Creates a new NodeName
    pub fn new(name: impl Into<String>) -> Self {
        NodeName(name.into())
    }

    /// Returns the node name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        NodeName(s.to_string())
    }
}

impl From<String> for NodeName {
    fn from(s: String) -> Self {
        NodeName(s)
    }
}

const PLANET_PREFIX: &str = "planet:";
const USER_PREFIX: &str = "user:";
const CHANNEL_PREFIX: &str = "channel:";

/// A logical broadcast channel.
///
/// Groups have no lifecycle of their own: one exists while at least one
/// connection has joined it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Group(String);

impl Group {
    /// Creates a group from a free-form name
    pub fn new(name: impl Into<String>) -> Self {
        Group(name.into())
    }

    /// Group receiving every event scoped to a planet
    pub fn planet(id: PlanetId) -> Self {
        Group(format!("{}{}", PLANET_PREFIX, id))
    }

    /// Group reaching every session of one user
    pub fn user(id: UserId) -> Self {
        Group(format!("{}{}", USER_PREFIX, id))
    }

    /// Group for a single chat channel
    pub fn channel(id: u64) -> Self {
        Group(format!("{}{}", CHANNEL_PREFIX, id))
    }

    /// Returns the group name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the name carries the `planet:` prefix, well-formed or not
    pub fn is_planet_scoped(&self) -> bool {
        self.0.starts_with(PLANET_PREFIX)
    }

    /// Returns the planet this group is scoped to.
    ///
    /// Only the canonical form `planet:<id>` matches: no sign, no leading
    /// zeros, no overflow.
    pub fn planet_id(&self) -> Option<PlanetId> {
        canonical_id(&self.0, PLANET_PREFIX).map(PlanetId)
    }

    /// Returns the user this group targets, in canonical `user:<id>` form only
    pub fn user_id(&self) -> Option<UserId> {
        canonical_id(&self.0, USER_PREFIX).map(UserId)
    }
}

fn canonical_id(name: &str, prefix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    let id: u64 = digits.parse().ok()?;
    (id.to_string() == digits).then_some(id)
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Group {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Group(s.to_string()))
    }
}

impl From<&str> for Group {
    fn from(s: &str) -> Self {
        Group(s.to_string())
    }
}
