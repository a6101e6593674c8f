//! Integration tests for multi-node routing and concurrent presence.
//!
//! These tests drive full nodes through the public API: redirects between
//! nodes, planet migration, and the directory under concurrent load.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use common::{address_of, initial_placement, TestCluster};
use planetmesh_node::{
    ConnectionId, Group, MeshError, PlacementTable, PlanetId, PresenceDirectory, UserId,
};

#[test]
fn test_route_hosted_and_redirect() {
    let cluster = TestCluster::new(&["alpha", "beta"], initial_placement());

    let hosted = cluster
        .node("alpha")
        .route_planet("client-1", PlanetId::new(10), 0)
        .unwrap();
    assert_eq!(hosted.node.as_str(), "alpha");

    let err = cluster
        .node("beta")
        .route_planet("client-1", PlanetId::new(10), 0)
        .unwrap_err();
    let redirect = err.redirect().expect("redirect");
    assert_eq!(redirect.planet_id, PlanetId::new(10));
    assert_eq!(redirect.correct_node_name.as_str(), "alpha");
    assert_eq!(redirect.correct_node_address.as_deref(), Some(address_of("alpha").as_str()));
    assert!(err.is_retryable());
}

#[test]
fn test_migration_reroutes_every_node() {
    let cluster = TestCluster::new(&["alpha", "beta", "gamma"], initial_placement());

    let migrated = PlacementTable::new(2)
        .assign(PlanetId::new(10), "gamma")
        .assign(PlanetId::new(11), "alpha")
        .assign(PlanetId::new(20), "beta")
        .with_address("gamma", address_of("gamma"));
    cluster.publish(migrated);

    assert!(cluster
        .node("gamma")
        .route_planet("c", PlanetId::new(10), 0)
        .is_ok());
    for name in ["alpha", "beta"] {
        let err = cluster
            .node(name)
            .route_planet("c", PlanetId::new(10), 0)
            .unwrap_err();
        assert_eq!(err.redirect().unwrap().correct_node_name.as_str(), "gamma");
    }
}

#[test]
fn test_stale_placement_keeps_migration() {
    let cluster = TestCluster::new(&["alpha"], initial_placement());
    let node = cluster.node("alpha");
    let err = node.apply_placement(PlacementTable::new(1)).unwrap_err();
    assert!(matches!(err, MeshError::StalePlacement { current: 1, got: 1 }));
    assert!(node.route_planet("c", PlanetId::new(10), 0).is_ok());
}

#[test]
fn test_routes_during_swap_see_whole_tables() {
    let cluster = Arc::new(TestCluster::new(&["gamma"], initial_placement()));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cluster = cluster.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    let table = cluster.node("gamma").locator().table();
                    // Tables alternate between two complete mappings; a reader
                    // must never see planet 10 and 11 on different nodes.
                    assert_eq!(
                        table.node_for(PlanetId::new(10)),
                        table.node_for(PlanetId::new(11))
                    );
                }
            })
        })
        .collect();

    for version in 2..200u64 {
        let owner = if version % 2 == 0 { "gamma" } else { "alpha" };
        cluster.node("gamma").apply_placement(
            PlacementTable::new(version)
                .assign(PlanetId::new(10), owner)
                .assign(PlanetId::new(11), owner),
        )
        .unwrap();
    }
    done.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }
}

#[test]
fn test_concurrent_joins_to_one_group() {
    let directory = Arc::new(PresenceDirectory::default());
    let group = Group::planet(PlanetId::new(10));
    let threads = 8;
    let per_thread = 250;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let directory = directory.clone();
            let group = group.clone();
            thread::spawn(move || {
                for i in 0..per_thread {
                    let conn = ConnectionId::new(format!("conn-{}-{}", t, i));
                    assert!(directory.join(&conn, UserId::new(i as u64), &group).unwrap());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let members = directory.query(&group);
    assert_eq!(members.connections.len(), threads * per_thread);
    assert_eq!(members.users.len(), per_thread);
    assert!(directory.snapshot().violations().is_empty());
}

#[test]
fn test_snapshot_consistent_under_interleaved_mutations() {
    let directory = Arc::new(PresenceDirectory::default());
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..4u64)
        .map(|w| {
            let directory = directory.clone();
            thread::spawn(move || {
                for i in 0..250u64 {
                    let conn = ConnectionId::new(format!("w{}-c{}", w, i % 16));
                    let user = UserId::new(w * 100 + i % 16);
                    let group = Group::channel(i % 7);
                    match i % 5 {
                        0 | 1 | 2 => {
                            directory.join(&conn, user, &group).unwrap();
                        }
                        3 => {
                            directory.leave(&conn, &group).unwrap();
                        }
                        _ => {
                            directory.leave_all(&conn).unwrap();
                        }
                    }
                }
            })
        })
        .collect();

    let reader = {
        let directory = directory.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut checked = 0;
            while !done.load(Ordering::Relaxed) || checked == 0 {
                let snap = directory.snapshot();
                let violations = snap.violations();
                assert!(violations.is_empty(), "{:?}", violations);
                for (group, conns) in &snap.group_connections {
                    for conn in conns {
                        let user = snap.connection_users[conn];
                        assert!(snap.group_user_ids[group].contains(&user));
                    }
                }
                checked += 1;
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    reader.join().unwrap();
    assert!(directory.snapshot().violations().is_empty());
}

#[test]
fn test_leave_all_racing_joins() {
    let directory = Arc::new(PresenceDirectory::default());
    let conn = ConnectionId::new("shared");

    let joiner = {
        let directory = directory.clone();
        let conn = conn.clone();
        thread::spawn(move || {
            for i in 0..500u64 {
                directory.join(&conn, UserId::new(1), &Group::channel(i % 32)).unwrap();
            }
        })
    };
    let closer = {
        let directory = directory.clone();
        let conn = conn.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                directory.leave_all(&conn).unwrap();
            }
        })
    };
    joiner.join().unwrap();
    closer.join().unwrap();

    assert!(directory.snapshot().violations().is_empty());
    directory.leave_all(&conn).unwrap();
    let snap = directory.snapshot();
    assert!(snap.connection_groups.is_empty());
    assert!(snap.group_connections.is_empty());
    assert!(snap.user_id_groups.is_empty());
}

#[tokio::test]
async fn test_realtime_session_lifecycle() {
    let cluster = TestCluster::new(&["alpha", "beta"], initial_placement());
    let alpha = cluster.node("alpha");
    let conn = ConnectionId::new("session-1");
    let user = UserId::new(42);

    alpha.join_group(&conn, user, &Group::user(user), 0).unwrap();
    alpha.join_planet(&conn, user, PlanetId::new(10), 0).unwrap();
    alpha.join_planet(&conn, user, PlanetId::new(11), 0).unwrap();

    let stats = alpha.stats();
    assert_eq!(stats.connection_count, 1);
    assert_eq!(stats.connection_group_count, 3);
    assert_eq!(stats.planet_count, 2);
    assert_eq!(stats.active_member_count, 1);

    // Planet 20 lives on beta: the join is redirected and leaves no trace.
    let err = alpha.join_planet(&conn, user, PlanetId::new(20), 0).unwrap_err();
    assert_eq!(err.redirect().unwrap().correct_node_name.as_str(), "beta");
    assert_eq!(alpha.stats().connection_group_count, 3);

    assert_eq!(alpha.disconnect(&conn).unwrap(), 3);
    let detailed = alpha.detailed_stats();
    assert!(detailed.connection_groups.is_empty());
    assert!(detailed.group_connections.is_empty());
    assert!(alpha.health().is_healthy());

    for node in cluster.nodes() {
        assert!(node.self_check().is_empty());
    }
}
