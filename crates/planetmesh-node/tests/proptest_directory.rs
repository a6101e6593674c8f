//! Property-based tests for the presence directory using proptest.
//!
//! Random sequences of joins and leaves must keep the four indices in
//! agreement, and the documented round-trip properties must hold for any
//! starting state.

use planetmesh_node::{ConnectionId, DirectoryConfig, Group, PresenceDirectory, UserId};
use proptest::prelude::*;

/// A directory mutation.
#[derive(Clone, Debug)]
enum Op {
    Join(u8, u8),
    Leave(u8, u8),
    LeaveAll(u8),
}

fn conn(id: u8) -> ConnectionId {
    ConnectionId::new(format!("c{}", id))
}

/// Connections map to a fixed user so joins never conflict.
fn user_of(id: u8) -> UserId {
    UserId::new(u64::from(id % 4))
}

fn group(id: u8) -> Group {
    Group::channel(u64::from(id))
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..12, 0u8..6).prop_map(|(c, g)| Op::Join(c, g)),
        2 => (0u8..12, 0u8..6).prop_map(|(c, g)| Op::Leave(c, g)),
        1 => (0u8..12).prop_map(Op::LeaveAll),
    ]
}

fn small_directory() -> PresenceDirectory {
    PresenceDirectory::new(DirectoryConfig {
        shard_count: 4,
        max_groups_per_connection: 64,
    })
}

fn apply(directory: &PresenceDirectory, ops: &[Op]) {
    for op in ops {
        match *op {
            Op::Join(c, g) => {
                directory.join(&conn(c), user_of(c), &group(g)).unwrap();
            }
            Op::Leave(c, g) => {
                directory.leave(&conn(c), &group(g)).unwrap();
            }
            Op::LeaveAll(c) => {
                directory.leave_all(&conn(c)).unwrap();
            }
        }
    }
}

proptest! {
    /// Test: any sequence of operations keeps the indices mutually consistent
    #[test]
    fn test_indices_stay_consistent(ops in proptest::collection::vec(any_op(), 0..200)) {
        let directory = small_directory();
        apply(&directory, &ops);
        let violations = directory.snapshot().violations();
        prop_assert!(violations.is_empty(), "{:?}", violations);
    }

    /// Test: leave_all leaves no index referencing the connection
    #[test]
    fn test_leave_all_clears_every_index(
        ops in proptest::collection::vec(any_op(), 0..200),
        target in 0u8..12,
    ) {
        let directory = small_directory();
        apply(&directory, &ops);
        directory.leave_all(&conn(target)).unwrap();

        let snap = directory.snapshot();
        prop_assert!(!snap.connection_groups.contains_key(&conn(target)));
        prop_assert!(!snap.connection_users.contains_key(&conn(target)));
        for conns in snap.group_connections.values() {
            prop_assert!(!conns.contains(&conn(target)));
        }
        prop_assert!(directory.groups_of_connection(&conn(target)).is_empty());
    }

    /// Test: join followed by leave restores the exact previous state
    #[test]
    fn test_join_leave_round_trip(
        ops in proptest::collection::vec(any_op(), 0..100),
        c in 0u8..12,
        g in 0u8..6,
    ) {
        let directory = small_directory();
        apply(&directory, &ops);
        prop_assume!(!directory.groups_of_connection(&conn(c)).contains(&group(g)));

        let before = directory.snapshot();
        prop_assert!(directory.join(&conn(c), user_of(c), &group(g)).unwrap());
        let members = directory.query(&group(g));
        prop_assert!(members.connections.contains(&conn(c)));
        prop_assert!(members.users.contains(&user_of(c)));

        prop_assert!(directory.leave(&conn(c), &group(g)).unwrap());
        prop_assert_eq!(directory.snapshot(), before);
    }

    /// Test: user -> groups equals the union over that user's connections
    #[test]
    fn test_user_groups_are_union_of_connection_groups(
        ops in proptest::collection::vec(any_op(), 0..200),
    ) {
        let directory = small_directory();
        apply(&directory, &ops);
        for u in 0u8..4 {
            let mut expected: Vec<Group> = (0u8..12)
                .filter(|c| user_of(*c) == user_of(u))
                .flat_map(|c| directory.groups_of_connection(&conn(c)))
                .collect();
            expected.sort();
            expected.dedup();
            let mut actual = directory.groups_of_user(user_of(u));
            actual.sort();
            prop_assert_eq!(actual, expected);
        }
    }
}
