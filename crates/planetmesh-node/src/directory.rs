//! Presence directory: which connections and users are in which groups.
//!
//! Four indices are kept mutually consistent: group -> connections,
//! group -> users, connection -> groups and user -> groups. Entries are spread
//! over a fixed number of shards by key hash. A mutation write-locks every
//! shard it touches (connection, group and user shard) in ascending shard
//! order, so it is applied as one atomic step and readers of any single shard
//! see either the state before it or after it.
//!
//! Shard contents live behind an `Arc`. A snapshot holds the read locks only
//! long enough to clone those `Arc`s; a writer that later touches a shard still
//! referenced by a snapshot copies it first (`Arc::make_mut`).

use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, TryReserveError};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{MeshError, Result};
use crate::types::{ConnectionId, Group, UserId};

/// Configuration for the presence directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Number of lock shards. Must be a power of two.
    pub shard_count: usize,
    /// Maximum number of groups a single connection may join.
    pub max_groups_per_connection: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            shard_count: 64,
            max_groups_per_connection: 256,
        }
    }
}

#[derive(Clone, Debug)]
struct ConnectionEntry {
    user: UserId,
    groups: HashSet<Group>,
}

impl ConnectionEntry {
    fn new(user: UserId) -> Self {
        Self {
            user,
            groups: HashSet::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct GroupEntry {
    connections: HashSet<ConnectionId>,
    /// Number of the user's connections in this group.
    users: HashMap<UserId, u32>,
}

#[derive(Clone, Debug, Default)]
struct UserEntry {
    /// Number of the user's connections in each group.
    groups: HashMap<Group, u32>,
}

#[derive(Clone, Debug, Default)]
struct Shard {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    groups: HashMap<Group, GroupEntry>,
    users: HashMap<UserId, UserEntry>,
}

/// Write guards over a sorted, deduplicated set of shards.
struct Locked<'a> {
    guards: Vec<(usize, RwLockWriteGuard<'a, Arc<Shard>>)>,
}

impl Locked<'_> {
    fn slot(&self, shard: usize) -> usize {
        self.guards.partition_point(|(i, _)| *i < shard)
    }

    fn covers(&self, shard: usize) -> bool {
        self.guards.binary_search_by_key(&shard, |(i, _)| *i).is_ok()
    }

    fn shard(&self, shard: usize) -> &Shard {
        &self.guards[self.slot(shard)].1
    }

    fn shard_mut(&mut self, shard: usize) -> &mut Shard {
        let slot = self.slot(shard);
        Arc::make_mut(&mut self.guards[slot].1)
    }
}

/// Shard indices touched by one membership.
#[derive(Clone, Copy)]
struct Footprint {
    conn: usize,
    group: usize,
    user: usize,
}

/// Members of one group at a single point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupMembers {
    /// Connections subscribed to the group.
    pub connections: Vec<ConnectionId>,
    /// Distinct users behind those connections.
    pub users: Vec<UserId>,
}

impl GroupMembers {
    /// Returns true if nobody is in the group.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Scalar directory counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryCounts {
    /// Connections with at least one group.
    pub connections: usize,
    /// Groups with at least one connection.
    pub groups: usize,
    /// Distinct users with at least one connection in some group.
    pub active_members: usize,
    /// Total (connection, group) memberships.
    pub memberships: usize,
}

/// Point-in-time copy of all four indices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySnapshot {
    /// group -> connections
    pub group_connections: BTreeMap<Group, BTreeSet<ConnectionId>>,
    /// group -> user ids
    pub group_user_ids: BTreeMap<Group, BTreeSet<UserId>>,
    /// connection -> groups
    pub connection_groups: BTreeMap<ConnectionId, BTreeSet<Group>>,
    /// user id -> groups
    pub user_id_groups: BTreeMap<UserId, BTreeSet<Group>>,
    /// connection -> authenticated user
    pub connection_users: BTreeMap<ConnectionId, UserId>,
}

impl DirectorySnapshot {
    /// Scalar counts derived from the snapshot.
    pub fn counts(&self) -> DirectoryCounts {
        DirectoryCounts {
            connections: self.connection_groups.len(),
            groups: self.group_connections.len(),
            active_members: self.user_id_groups.len(),
            memberships: self.connection_groups.values().map(BTreeSet::len).sum(),
        }
    }

    /// Checks every cross-index invariant and returns the violations found.
    pub fn violations(&self) -> Vec<String> {
        let mut found = Vec::new();

        for (group, conns) in &self.group_connections {
            for conn in conns {
                let listed = self
                    .connection_groups
                    .get(conn)
                    .is_some_and(|groups| groups.contains(group));
                if !listed {
                    found.push(format!("{} lists {} but not the reverse", group, conn));
                }
                match self.connection_users.get(conn) {
                    Some(user) => {
                        let has_user = self
                            .group_user_ids
                            .get(group)
                            .is_some_and(|users| users.contains(user));
                        if !has_user {
                            found.push(format!("{} has {} but not its user {}", group, conn, user));
                        }
                    }
                    None => found.push(format!("{} has no authenticated user", conn)),
                }
            }
        }

        for (conn, groups) in &self.connection_groups {
            for group in groups {
                let listed = self
                    .group_connections
                    .get(group)
                    .is_some_and(|conns| conns.contains(conn));
                if !listed {
                    found.push(format!("{} lists {} but not the reverse", conn, group));
                }
            }
        }

        let mut expected: BTreeMap<UserId, BTreeSet<Group>> = BTreeMap::new();
        for (conn, groups) in &self.connection_groups {
            if let Some(user) = self.connection_users.get(conn) {
                expected.entry(*user).or_default().extend(groups.iter().cloned());
            }
        }
        if expected != self.user_id_groups {
            found.push("user -> groups differs from union of connection groups".to_string());
        }

        found
    }
}

fn reserve(result: std::result::Result<(), TryReserveError>, index: &str) -> Result<()> {
    result.map_err(|e| MeshError::ResourceExhausted(format!("{}: {}", index, e)))
}

fn release<K: Hash + Eq>(counts: &mut HashMap<K, u32>, key: &K) {
    if let Some(n) = counts.get_mut(key) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            counts.remove(key);
        }
    }
}

/// Concurrent presence index for one node.
pub struct PresenceDirectory {
    shards: Box<[RwLock<Arc<Shard>>]>,
    mask: usize,
    hasher: RandomState,
    max_groups_per_connection: usize,
    joins: AtomicU64,
    leaves: AtomicU64,
    inconsistencies: AtomicU64,
}

impl PresenceDirectory {
    /// Creates an empty directory.
    ///
    /// `shard_count` is rounded up to the next power of two.
    pub fn new(config: DirectoryConfig) -> Self {
        let count = config.shard_count.max(1).next_power_of_two();
        let shards = (0..count)
            .map(|_| RwLock::new(Arc::new(Shard::default())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            mask: count - 1,
            hasher: RandomState::new(),
            max_groups_per_connection: config.max_groups_per_connection,
            joins: AtomicU64::new(0),
            leaves: AtomicU64::new(0),
            inconsistencies: AtomicU64::new(0),
        }
    }

    /// Number of lock shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn connection_shard(&self, conn: &ConnectionId) -> usize {
        self.hasher.hash_one((0u8, conn)) as usize & self.mask
    }

    fn group_shard(&self, group: &Group) -> usize {
        self.hasher.hash_one((1u8, group)) as usize & self.mask
    }

    fn user_shard(&self, user: UserId) -> usize {
        self.hasher.hash_one((2u8, user)) as usize & self.mask
    }

    fn footprint(&self, conn: &ConnectionId, user: UserId, group: &Group) -> Footprint {
        Footprint {
            conn: self.connection_shard(conn),
            group: self.group_shard(group),
            user: self.user_shard(user),
        }
    }

    /// Write-locks `wanted` in ascending order.
    fn lock(&self, wanted: &[usize]) -> Locked<'_> {
        let mut order = wanted.to_vec();
        order.sort_unstable();
        order.dedup();
        Locked {
            guards: order.into_iter().map(|i| (i, self.shards[i].write())).collect(),
        }
    }

    /// Clones every shard's `Arc` under a consistent cut.
    fn freeze(&self) -> Vec<Arc<Shard>> {
        let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
        guards.iter().map(|g| Arc::clone(&**g)).collect()
    }

    fn inconsistency(&self, conn: &ConnectionId, detail: String) -> MeshError {
        self.inconsistencies.fetch_add(1, Ordering::Relaxed);
        error!(connection = %conn, %detail, "presence directory invariant violated, operation rejected");
        MeshError::DirectoryInconsistency {
            connection: conn.clone(),
            detail,
        }
    }

    /// Adds `conn`, authenticated as `user`, to `group`.
    ///
    /// Returns `Ok(false)` if the connection already was in the group.
    /// All four indices change together or not at all.
    pub fn join(&self, conn: &ConnectionId, user: UserId, group: &Group) -> Result<bool> {
        let fp = self.footprint(conn, user, group);
        let mut locked = self.lock(&[fp.conn, fp.group, fp.user]);

        let in_conn = match locked.shard(fp.conn).connections.get(conn) {
            Some(entry) if entry.user != user => {
                let detail = format!(
                    "connection is authenticated as user {}, join requested as user {}",
                    entry.user, user
                );
                return Err(self.inconsistency(conn, detail));
            }
            Some(entry) => {
                if !entry.groups.contains(group)
                    && entry.groups.len() >= self.max_groups_per_connection
                {
                    return Err(MeshError::ResourceExhausted(format!(
                        "connection {} is already in {} groups",
                        conn,
                        entry.groups.len()
                    )));
                }
                entry.groups.contains(group)
            }
            None => false,
        };
        let in_group = locked
            .shard(fp.group)
            .groups
            .get(group)
            .is_some_and(|entry| entry.connections.contains(conn));
        if in_conn != in_group {
            let detail = format!("membership in {} recorded on one side only", group);
            return Err(self.inconsistency(conn, detail));
        }
        if in_conn {
            return Ok(false);
        }

        // Reserve capacity in every index before the first insert so that a
        // failed allocation leaves the directory untouched.
        let mut new_conn = None;
        {
            let shard = locked.shard_mut(fp.conn);
            match shard.connections.get_mut(conn) {
                Some(entry) => reserve(entry.groups.try_reserve(1), "connection groups")?,
                None => {
                    reserve(shard.connections.try_reserve(1), "connection index")?;
                    let mut entry = ConnectionEntry::new(user);
                    reserve(entry.groups.try_reserve(1), "connection groups")?;
                    new_conn = Some(entry);
                }
            }
        }
        let mut new_group = None;
        {
            let shard = locked.shard_mut(fp.group);
            match shard.groups.get_mut(group) {
                Some(entry) => {
                    reserve(entry.connections.try_reserve(1), "group connections")?;
                    reserve(entry.users.try_reserve(1), "group users")?;
                }
                None => {
                    reserve(shard.groups.try_reserve(1), "group index")?;
                    let mut entry = GroupEntry::default();
                    reserve(entry.connections.try_reserve(1), "group connections")?;
                    reserve(entry.users.try_reserve(1), "group users")?;
                    new_group = Some(entry);
                }
            }
        }
        let mut new_user = None;
        {
            let shard = locked.shard_mut(fp.user);
            match shard.users.get_mut(&user) {
                Some(entry) => reserve(entry.groups.try_reserve(1), "user groups")?,
                None => {
                    reserve(shard.users.try_reserve(1), "user index")?;
                    let mut entry = UserEntry::default();
                    reserve(entry.groups.try_reserve(1), "user groups")?;
                    new_user = Some(entry);
                }
            }
        }

        locked
            .shard_mut(fp.conn)
            .connections
            .entry(conn.clone())
            .or_insert_with(|| new_conn.unwrap_or_else(|| ConnectionEntry::new(user)))
            .groups
            .insert(group.clone());

        let entry = locked
            .shard_mut(fp.group)
            .groups
            .entry(group.clone())
            .or_insert_with(|| new_group.unwrap_or_default());
        entry.connections.insert(conn.clone());
        *entry.users.entry(user).or_insert(0) += 1;

        let entry = locked
            .shard_mut(fp.user)
            .users
            .entry(user)
            .or_insert_with(|| new_user.unwrap_or_default());
        *entry.groups.entry(group.clone()).or_insert(0) += 1;

        self.joins.fetch_add(1, Ordering::Relaxed);
        debug!(connection = %conn, user = %user, group = %group, "joined group");
        Ok(true)
    }

    /// Verifies that `conn` can be removed from `group` under `locked`.
    ///
    /// Returns `Ok(false)` when the connection is not in the group.
    fn check_removal(
        &self,
        locked: &Locked<'_>,
        fp: Footprint,
        conn: &ConnectionId,
        user: UserId,
        group: &Group,
    ) -> Result<bool> {
        let in_conn = locked
            .shard(fp.conn)
            .connections
            .get(conn)
            .is_some_and(|entry| entry.groups.contains(group));
        let group_entry = locked.shard(fp.group).groups.get(group);
        let in_group = group_entry.is_some_and(|entry| entry.connections.contains(conn));
        if in_conn != in_group {
            let detail = format!("membership in {} recorded on one side only", group);
            return Err(self.inconsistency(conn, detail));
        }
        if !in_conn {
            return Ok(false);
        }

        let group_counts_user = group_entry.is_some_and(|entry| entry.users.contains_key(&user));
        let user_counts_group = locked
            .shard(fp.user)
            .users
            .get(&user)
            .is_some_and(|entry| entry.groups.contains_key(group));
        if !group_counts_user || !user_counts_group {
            let detail = format!("user {} missing from user indices of {}", user, group);
            return Err(self.inconsistency(conn, detail));
        }
        Ok(true)
    }

    /// Removes a verified membership. Only removes, so it cannot fail.
    fn commit_removal(
        locked: &mut Locked<'_>,
        fp: Footprint,
        conn: &ConnectionId,
        user: UserId,
        group: &Group,
    ) {
        let shard = locked.shard_mut(fp.conn);
        if let Some(entry) = shard.connections.get_mut(conn) {
            entry.groups.remove(group);
            if entry.groups.is_empty() {
                shard.connections.remove(conn);
            }
        }

        let shard = locked.shard_mut(fp.group);
        if let Some(entry) = shard.groups.get_mut(group) {
            entry.connections.remove(conn);
            release(&mut entry.users, &user);
            if entry.connections.is_empty() {
                shard.groups.remove(group);
            }
        }

        let shard = locked.shard_mut(fp.user);
        if let Some(entry) = shard.users.get_mut(&user) {
            release(&mut entry.groups, group);
            if entry.groups.is_empty() {
                shard.users.remove(&user);
            }
        }
    }

    /// Removes `conn` from `group`. Leaving a group not joined is a no-op.
    ///
    /// Returns `Ok(true)` if a membership was removed.
    pub fn leave(&self, conn: &ConnectionId, group: &Group) -> Result<bool> {
        loop {
            let Some(user) = self.user_of_connection(conn) else {
                return Ok(false);
            };
            let fp = self.footprint(conn, user, group);
            let mut locked = self.lock(&[fp.conn, fp.group, fp.user]);

            match locked.shard(fp.conn).connections.get(conn) {
                None => return Ok(false),
                // The id was released and reused by another user between the
                // lookup and the lock.
                Some(entry) if entry.user != user => continue,
                Some(_) => {}
            }

            if !self.check_removal(&locked, fp, conn, user, group)? {
                return Ok(false);
            }
            Self::commit_removal(&mut locked, fp, conn, user, group);
            self.leaves.fetch_add(1, Ordering::Relaxed);
            debug!(connection = %conn, group = %group, "left group");
            return Ok(true);
        }
    }

    /// Removes `conn` from every group it joined, clearing it from all four
    /// indices. Returns the number of groups left.
    ///
    /// Mutations of one connection serialize on its shard lock, so a `join`
    /// racing with this call lands either entirely before it (and is removed)
    /// or entirely after it (and stays).
    pub fn leave_all(&self, conn: &ConnectionId) -> Result<usize> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let Some((user, groups)) = self.peek_connection(conn) else {
                return Ok(0);
            };
            let conn_shard = self.connection_shard(conn);
            let user_shard = self.user_shard(user);
            let mut wanted = Vec::with_capacity(groups.len() + 2);
            wanted.push(conn_shard);
            wanted.push(user_shard);
            wanted.extend(groups.iter().map(|g| self.group_shard(g)));
            let mut locked = self.lock(&wanted);

            let current: Vec<Group> = match locked.shard(conn_shard).connections.get(conn) {
                None => return Ok(0),
                Some(entry) if entry.user != user => continue,
                Some(entry) => entry.groups.iter().cloned().collect(),
            };
            // A join between the lookup and the lock may have added a group in
            // a shard we do not hold.
            if current.iter().any(|g| !locked.covers(self.group_shard(g))) {
                debug!(connection = %conn, attempts, "group set changed before lock, retrying");
                continue;
            }

            let footprints: Vec<Footprint> = current
                .iter()
                .map(|g| Footprint {
                    conn: conn_shard,
                    group: self.group_shard(g),
                    user: user_shard,
                })
                .collect();
            for (group, fp) in current.iter().zip(&footprints) {
                self.check_removal(&locked, *fp, conn, user, group)?;
            }
            for (group, fp) in current.iter().zip(&footprints) {
                Self::commit_removal(&mut locked, *fp, conn, user, group);
            }

            self.leaves.fetch_add(current.len() as u64, Ordering::Relaxed);
            debug!(connection = %conn, groups = current.len(), "connection cleared from directory");
            return Ok(current.len());
        }
    }

    /// Connections and users currently in `group`.
    pub fn query(&self, group: &Group) -> GroupMembers {
        let shard = self.shards[self.group_shard(group)].read();
        match shard.groups.get(group) {
            Some(entry) => GroupMembers {
                connections: entry.connections.iter().cloned().collect(),
                users: entry.users.keys().copied().collect(),
            },
            None => GroupMembers::default(),
        }
    }

    /// Fan-out targets for `group`.
    pub fn connections_in_group(&self, group: &Group) -> Vec<ConnectionId> {
        let shard = self.shards[self.group_shard(group)].read();
        shard
            .groups
            .get(group)
            .map(|entry| entry.connections.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true if any connection of `user` is in `group`.
    pub fn is_user_in_group(&self, user: UserId, group: &Group) -> bool {
        let shard = self.shards[self.user_shard(user)].read();
        shard
            .users
            .get(&user)
            .is_some_and(|entry| entry.groups.contains_key(group))
    }

    /// The user `conn` authenticated as, if it is in any group.
    pub fn user_of_connection(&self, conn: &ConnectionId) -> Option<UserId> {
        let shard = self.shards[self.connection_shard(conn)].read();
        shard.connections.get(conn).map(|entry| entry.user)
    }

    fn peek_connection(&self, conn: &ConnectionId) -> Option<(UserId, Vec<Group>)> {
        let shard = self.shards[self.connection_shard(conn)].read();
        shard
            .connections
            .get(conn)
            .map(|entry| (entry.user, entry.groups.iter().cloned().collect()))
    }

    /// Groups `conn` has joined.
    pub fn groups_of_connection(&self, conn: &ConnectionId) -> Vec<Group> {
        self.peek_connection(conn)
            .map(|(_, groups)| groups)
            .unwrap_or_default()
    }

    /// Groups any connection of `user` has joined.
    pub fn groups_of_user(&self, user: UserId) -> Vec<Group> {
        let shard = self.shards[self.user_shard(user)].read();
        shard
            .users
            .get(&user)
            .map(|entry| entry.groups.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Scalar counts under a consistent cut.
    pub fn counts(&self) -> DirectoryCounts {
        let shards = self.freeze();
        let mut counts = DirectoryCounts::default();
        for shard in &shards {
            counts.connections += shard.connections.len();
            counts.groups += shard.groups.len();
            counts.active_members += shard.users.len();
            counts.memberships += shard
                .connections
                .values()
                .map(|entry| entry.groups.len())
                .sum::<usize>();
        }
        counts
    }

    /// Copies all four indices under a consistent cut.
    ///
    /// Writers are held off only while the shard `Arc`s are cloned, not while
    /// the copy is built.
    pub fn snapshot(&self) -> DirectorySnapshot {
        let shards = self.freeze();
        let mut snap = DirectorySnapshot::default();
        for shard in &shards {
            for (conn, entry) in &shard.connections {
                snap.connection_groups
                    .insert(conn.clone(), entry.groups.iter().cloned().collect());
                snap.connection_users.insert(conn.clone(), entry.user);
            }
            for (group, entry) in &shard.groups {
                snap.group_connections
                    .insert(group.clone(), entry.connections.iter().cloned().collect());
                snap.group_user_ids
                    .insert(group.clone(), entry.users.keys().copied().collect());
            }
            for (user, entry) in &shard.users {
                snap.user_id_groups
                    .insert(*user, entry.groups.keys().cloned().collect());
            }
        }
        snap
    }

    /// Total successful joins since startup.
    pub fn join_count(&self) -> u64 {
        self.joins.load(Ordering::Relaxed)
    }

    /// Total memberships removed since startup.
    pub fn leave_count(&self) -> u64 {
        self.leaves.load(Ordering::Relaxed)
    }

    /// Operations rejected for a broken invariant since startup.
    pub fn inconsistency_count(&self) -> u64 {
        self.inconsistencies.load(Ordering::Relaxed)
    }
}

impl Default for PresenceDirectory {
    fn default() -> Self {
        Self::new(DirectoryConfig::default())
    }
}
