//! Sequence gaps, join replay and idempotent redelivery

use gsync_action::{Action, ObjectVersion};
use gsync_core::{Cluster, Scene, SyncConfig, SyncEvent};
use gsync_test_utils::*;
use pretty_assertions::assert_eq;

fn nodes(count: usize) -> Vec<(String, i64)> {
    (1..=count).map(|i| (format!("N{i}"), 1)).collect()
}

fn refs(objects: &[(String, i64)]) -> Vec<(&str, i64)> {
    objects.iter().map(|(id, v)| (id.as_str(), *v)).collect()
}

#[test]
fn hole_at_three_is_requested_and_filled() {
    let objects = nodes(4);
    let mut cluster = cluster(&refs(&objects), 2);
    cluster.drop_commit(B, 3);

    for i in 1..=4 {
        cluster.submit(move_to(A, &format!("N{i}"), 1.0)).unwrap();
    }
    // Deliver the four commits without letting B ask for anything yet
    while cluster.step_server() {}
    while cluster.step_client(B) {}

    assert_eq!(cluster.client(B).contiguous(), 2);
    assert!(cluster.client(B).has_gap());
    assert!(cluster
        .events(B)
        .contains(&SyncEvent::GapDetected { missing: vec![3] }));

    cluster.pump();
    assert_eq!(cluster.client(B).contiguous(), 4);
    assert!(!cluster.client(B).has_gap());
    assert_converged(&cluster);
}

#[test]
fn lost_tail_commit_found_by_head_announcement() {
    let objects = nodes(2);
    let mut cluster = cluster(&refs(&objects), 2);
    cluster.drop_commit(B, 2);

    cluster.submit(move_to(A, "N1", 1.0)).unwrap();
    cluster.submit(move_to(A, "N2", 2.0)).unwrap();
    cluster.pump();

    // Nothing after #2 arrived, so B cannot know it is behind yet
    assert_eq!(cluster.client(B).contiguous(), 1);
    assert!(!cluster.client(B).has_gap());

    cluster.tick();
    cluster.pump();
    assert_eq!(cluster.client(B).contiguous(), 2);
    assert_eq!(x_of(&cluster, B, "N2"), Some(2.0));
    assert_converged(&cluster);
}

#[test]
fn gap_requests_are_capped_and_retried() {
    let objects = nodes(5);
    let config = SyncConfig {
        max_gap_request: 2,
        ..SyncConfig::default()
    };
    let mut cluster = cluster_with(config, &refs(&objects), 2);
    for sequence in 1..=4 {
        cluster.drop_commit(B, sequence);
    }
    for i in 1..=5 {
        cluster.submit(move_to(A, &format!("N{i}"), 3.0)).unwrap();
    }
    cluster.pump();

    // First request named only two of the four holes
    assert_eq!(cluster.client(B).contiguous(), 2);
    assert!(cluster.client(B).has_gap());

    assert!(cluster.settle(4));
    assert_eq!(cluster.client(B).contiguous(), 5);
    assert_converged(&cluster);
}

#[test]
fn late_joiner_replays_history() {
    let mut cluster = cluster(&[("N1", 1), ("N2", 1)], 2);
    let moved = move_to(A, "N1", 4.0);
    cluster.submit(moved.clone()).unwrap();
    cluster.submit(delete(B, "N2")).unwrap();
    cluster.submit(add_node(A, "X")).unwrap();
    cluster.pump();
    cluster.record_done(&moved).unwrap();
    cluster.pump();

    cluster.connect(C).unwrap();
    cluster.pump();

    assert!(cluster
        .events(C)
        .contains(&SyncEvent::Joined { head: 3 }));
    assert_eq!(cluster.client(C).contiguous(), 3);
    assert_eq!(x_of(&cluster, C, "N1"), Some(4.0));
    assert_eq!(mirror_of(&cluster, C, "N2"), ObjectVersion::DELETED);
    assert_eq!(cluster.client(C).history().len(), 1);
    assert_converged(&cluster);
}

#[test]
fn transient_actions_are_not_replayed() {
    let mut cluster = cluster(&[("N1", 1)], 2);
    cluster.submit(hover(A, "N1", true)).unwrap();
    cluster.pump();

    let n1 = gsync_action::ObjectId::new("N1");
    assert!(cluster.client(B).scene().is_hovered(&n1));
    assert_eq!(cluster.server().head(), 0);
    assert!(cluster.events(A).contains(&SyncEvent::Committed {
        key: gsync_action::ActionKey {
            requester: A,
            network_version: 1,
            target: n1.clone(),
        },
        sequence: None,
    }));

    cluster.connect(C).unwrap();
    cluster.pump();
    assert!(!cluster.client(C).scene().is_hovered(&n1));
}

#[test]
fn targeted_commit_reaches_only_recipients() {
    let mut cluster = cluster(&[("N1", 1)], 3);
    let action = Action::builder(
        gsync_action::ActionKind::RenameNode(gsync_action::kind::RenameNode {
            name: "private".into(),
        }),
        "N1",
        A,
    )
    .with_recipients([B])
    .build()
    .unwrap();
    cluster.submit(action).unwrap();
    cluster.pump();

    let name = |c| {
        cluster
            .client(c)
            .scene()
            .node(&gsync_action::ObjectId::new("N1"))
            .map(|n| n.name.clone())
    };
    assert_eq!(name(A).as_deref(), Some("private"));
    assert_eq!(name(B).as_deref(), Some("private"));
    assert_eq!(name(C).as_deref(), Some("N1"));
    // Unsequenced and unversioned
    assert_eq!(cluster.server().head(), 0);
    assert_eq!(server_version(&cluster, "N1"), ObjectVersion::new(1));
}

#[test]
fn duplicated_commits_do_not_reapply() {
    let objects = nodes(3);
    let (scene, versions) = seeded(&refs(&objects));
    let mut cluster = Cluster::new(SyncConfig::default(), scene, versions).with_duplication(1.0);
    cluster.connect_all(2).unwrap();

    cluster.submit(move_to(A, "N1", 5.0)).unwrap();
    cluster.submit(move_to(A, "N1", 6.0)).unwrap();
    cluster.submit(rename(B, "N2", "renamed")).unwrap();
    cluster.pump();

    assert!(cluster.stats().duplicated > 0);
    let remote = cluster
        .events(B)
        .iter()
        .filter(|e| matches!(e, SyncEvent::RemoteApplied { .. }))
        .count();
    assert_eq!(remote, 2);
    let committed = cluster
        .events(A)
        .iter()
        .filter(|e| matches!(e, SyncEvent::Committed { .. }))
        .count();
    assert_eq!(committed, 2);
    assert_eq!(x_of(&cluster, B, "N1"), Some(6.0));
    assert_converged(&cluster);
}

#[test]
fn resync_rebuilds_identical_replica() {
    let mut cluster = cluster(&[("N1", 1), ("N2", 1)], 2);
    cluster.submit(move_to(A, "N1", 8.0)).unwrap();
    cluster.submit(add_edge(B, "E1", "N1", "N2")).unwrap();
    cluster.pump();
    let before = cluster.client(B).scene().clone();

    cluster.resync(B).unwrap();
    cluster.pump();
    assert_eq!(cluster.client(B).scene(), &before);
    assert_converged(&cluster);
}

#[test]
fn settle_waits_for_commit_lost_during_recovery() {
    let mut cluster = cluster(&[("N1", 1)], 2);
    cluster.drop_commit(A, 1);
    cluster.drop_commit(A, 2);

    cluster.submit(move_to(A, "N1", 1.0)).unwrap();
    cluster.submit(move_to(A, "N1", 2.0)).unwrap();
    cluster.pump();
    assert!(!cluster.client(A).has_gap());
    assert!(!cluster.is_quiescent());

    // Recovering #1 releases the held move, whose own commit is lost too
    assert!(cluster.settle(4));
    assert!(cluster.is_quiescent());
    assert!(cluster.client(A).pending().is_empty());
    assert_eq!(cluster.server().head(), 2);
    assert_eq!(x_of(&cluster, A, "N1"), Some(2.0));
    assert_converged(&cluster);
}
