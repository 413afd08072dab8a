//! Rollback, held submissions and escalation to resync

use gsync_action::{ActionKey, ObjectId, ObjectVersion};
use gsync_core::{PendingState, ReplicaStatus, RollbackCause, Scene, SyncEvent};
use gsync_test_utils::*;
use pretty_assertions::assert_eq;

#[test]
fn second_action_on_target_waits_for_first() {
    let mut cluster = cluster(&[("N1", 5)], 2);

    cluster.submit(move_to(A, "N1", 10.0)).unwrap();
    cluster.submit(move_to(A, "N1", 20.0)).unwrap();

    let pending = cluster.client(A).pending();
    assert_eq!(pending.len(), 2);
    let states: Vec<PendingState> = pending
        .keys()
        .map(|k| pending.get(k).unwrap().state)
        .collect();
    assert_eq!(states, vec![PendingState::Sent, PendingState::Held]);
    // Both applied locally straight away
    assert_eq!(x_of(&cluster, A, "N1"), Some(20.0));

    cluster.pump();

    assert_eq!(server_version(&cluster, "N1"), ObjectVersion::new(7));
    assert_eq!(cluster.server().head(), 2);
    assert_eq!(x_of(&cluster, B, "N1"), Some(20.0));
    let committed = cluster
        .events(A)
        .iter()
        .filter(|e| matches!(e, SyncEvent::Committed { .. }))
        .count();
    assert_eq!(committed, 2);
    assert_converged(&cluster);
}

#[test]
fn held_actions_roll_back_youngest_first() {
    let mut cluster = cluster(&[("N1", 5)], 2);

    cluster.submit(move_to(B, "N1", 99.0)).unwrap();
    cluster.submit(move_to(A, "N1", 10.0)).unwrap();
    cluster.submit(move_to(A, "N1", 20.0)).unwrap();
    cluster.pump();

    let rolled: Vec<u64> = cluster
        .events(A)
        .iter()
        .filter_map(|e| match e {
            SyncEvent::RolledBack { key, cause } => {
                assert_eq!(*cause, RollbackCause::Superseded);
                Some(key.network_version)
            }
            _ => None,
        })
        .collect();
    assert_eq!(rolled, vec![2, 1]);

    // The held action was never transmitted
    assert_eq!(cluster.server().stats().commits, 1);
    assert_eq!(cluster.server().stats().rejects, 1);
    assert_eq!(x_of(&cluster, A, "N1"), Some(99.0));
    assert_converged(&cluster);
}

#[test]
fn undo_restores_pre_optimistic_state() {
    let mut cluster = cluster(&[("N1", 3), ("N2", 3)], 2);
    let before = cluster.client(B).scene().clone();
    cluster.drop_commit(B, 1);
    cluster.drop_commit(B, 2);

    cluster.submit(rename(A, "N1", "Winner")).unwrap();
    cluster.submit(delete(A, "N2")).unwrap();
    cluster.submit(rename(B, "N1", "Loser")).unwrap();
    cluster.submit(move_to(B, "N2", 5.0)).unwrap();
    cluster.pump();

    // Both of B's changes were rejected and reverted
    assert_eq!(cluster.client(B).scene(), &before);
    assert!(cluster.client(B).pending().is_empty());

    assert!(cluster.settle(4));
    assert_converged(&cluster);
}

#[test]
fn preempted_action_that_still_commits_is_applied() {
    // Delete then revive returns N1 to version 1, so B's stamp is valid again
    let mut cluster = cluster(&[("N1", 1)], 2);

    cluster.submit(delete(A, "N1")).unwrap();
    cluster.submit(revive(A, "N1")).unwrap();
    assert!(cluster.step_server());
    // The delete's echo releases the held revive
    while cluster.step_client(A) {}
    assert!(cluster.step_server());
    cluster.submit(move_to(B, "N1", 42.0)).unwrap();
    cluster.pump();

    assert_eq!(server_version(&cluster, "N1"), ObjectVersion::new(2));
    assert_eq!(x_of(&cluster, A, "N1"), Some(42.0));
    assert_eq!(x_of(&cluster, B, "N1"), Some(42.0));
    assert_converged(&cluster);
}

#[test]
fn cascade_delete_rollback_forces_resync() {
    let mut cluster = cluster(&[("N1", 1), ("N2", 1)], 2);
    cluster.submit(add_edge(A, "E1", "N1", "N2")).unwrap();
    cluster.pump();

    cluster.submit(move_to(B, "N1", 7.0)).unwrap();
    cluster.submit(delete(A, "N1")).unwrap();
    assert!(cluster.client(A).scene().edge(&ObjectId::new("E1")).is_none());
    cluster.pump();

    let events = cluster.events(A);
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::ResyncRequired { .. })));
    assert!(events.iter().any(|e| matches!(e, SyncEvent::Joined { .. })));
    assert_eq!(cluster.notifications().blocking_count(), 1);

    // Rejoined from the replay with the edge and B's move
    assert_eq!(cluster.client(A).status(), ReplicaStatus::Live);
    assert!(cluster.client(A).scene().edge(&ObjectId::new("E1")).is_some());
    assert_eq!(x_of(&cluster, A, "N1"), Some(7.0));
    assert_converged(&cluster);
}

#[test]
fn replica_stays_compromised_without_auto_resync() {
    let config = gsync_core::SyncConfig::default().with_auto_resync(false);
    let mut cluster = cluster_with(config, &[("N1", 1), ("N2", 1)], 2);
    cluster.submit(add_edge(A, "E1", "N1", "N2")).unwrap();
    cluster.pump();
    cluster.submit(move_to(B, "N1", 7.0)).unwrap();
    cluster.submit(delete(A, "N1")).unwrap();
    cluster.pump();

    assert_eq!(cluster.client(A).status(), ReplicaStatus::Compromised);
    assert!(cluster.submit(move_to(A, "N2", 1.0)).is_err());

    cluster.resync(A).unwrap();
    cluster.pump();
    assert_eq!(cluster.client(A).status(), ReplicaStatus::Live);
    assert_converged(&cluster);
}

#[test]
fn reject_for_unknown_action_is_ignored() {
    let mut cluster = cluster(&[("N1", 5)], 2);
    cluster.submit(move_to(A, "N1", 1.0)).unwrap();
    cluster.submit(move_to(B, "N1", 2.0)).unwrap();
    cluster.pump();

    // B already reverted on A's commit; the reject changed nothing else
    let rolled = cluster
        .events(B)
        .iter()
        .filter(|e| matches!(e, SyncEvent::RolledBack { .. }))
        .count();
    assert_eq!(rolled, 1);
    assert!(!cluster
        .events(B)
        .iter()
        .any(|e| matches!(e, SyncEvent::Rejected { .. })));
    assert_eq!(
        cluster.client(B).pending().keys().collect::<Vec<&ActionKey>>(),
        Vec::<&ActionKey>::new()
    );
}

#[test]
fn rejected_delete_restores_hover() {
    let mut cluster = cluster(&[("N1", 1)], 2);
    let n1 = ObjectId::new("N1");
    cluster.submit(hover(B, "N1", true)).unwrap();
    cluster.pump();
    let before = cluster.client(B).scene().clone();
    assert!(before.is_hovered(&n1));

    cluster.drop_commit(B, 1);
    cluster.submit(move_to(A, "N1", 5.0)).unwrap();
    cluster.submit(delete(B, "N1")).unwrap();
    cluster.pump();

    assert!(cluster
        .events(B)
        .iter()
        .any(|e| matches!(e, SyncEvent::Rejected { .. })));
    assert_eq!(cluster.client(B).scene(), &before);

    assert!(cluster.settle(4));
    assert!(cluster.client(B).scene().is_hovered(&n1));
    assert_eq!(x_of(&cluster, B, "N1"), Some(5.0));
    assert_converged(&cluster);
}

#[test]
fn reject_replays_dependent_change_on_other_target() {
    let mut cluster = cluster(&[("N1", 3), ("N2", 1)], 2);
    cluster.drop_commit(B, 1);

    cluster.submit(rename(A, "N1", "Winner")).unwrap();
    // B's move is stale; its later edge onto N2 does not depend on it
    cluster.submit(move_to(B, "N1", 5.0)).unwrap();
    cluster.submit(add_edge(B, "E1", "N1", "N2")).unwrap();
    cluster.pump();

    let rolled: Vec<ActionKey> = cluster
        .events(B)
        .iter()
        .filter_map(|e| match e {
            SyncEvent::RolledBack { key, .. } => Some(key.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(rolled.len(), 1);
    assert_eq!(rolled[0].target, ObjectId::new("N1"));
    assert!(cluster.client(B).scene().edge(&ObjectId::new("E1")).is_some());
    assert_eq!(x_of(&cluster, B, "N1"), Some(0.0));

    assert!(cluster.settle(4));
    assert_eq!(cluster.client(B).status(), ReplicaStatus::Live);
    assert_converged(&cluster);
}
