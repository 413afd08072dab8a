//! Testing utilities for the gsync workspace
//!
//! Shared fixtures: seeded scenes, action constructors and clusters.

#![allow(missing_docs)]

use gsync_action::kind::{
    AddEdge, AddNode, DeleteEdge, DeleteNode, Hover, MoveNode, RenameNode, ReviveNode,
};
use gsync_action::{
    Action, ActionKind, ClientId, EdgeSnapshot, NodeSnapshot, ObjectId, ObjectVersion, Vec3,
};
use gsync_core::{Cluster, GraphScene, SyncConfig};
use gsync_version::VersionStore;

pub const A: ClientId = ClientId(1);
pub const B: ClientId = ClientId(2);
pub const C: ClientId = ClientId(3);

/// Route tracing output to the test harness; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn node(name: &str) -> NodeSnapshot {
    NodeSnapshot::new("class", name, Vec3::ZERO)
}

/// Scene holding `ids` plus matching versions
pub fn seeded(objects: &[(&str, i64)]) -> (GraphScene, Vec<(ObjectId, ObjectVersion)>) {
    let mut scene = GraphScene::new();
    let mut versions = Vec::new();
    for (id, version) in objects {
        let version = ObjectVersion::new(*version);
        if !version.is_deleted() {
            scene = scene.with_node(*id, node(id));
        }
        versions.push((ObjectId::new(*id), version));
    }
    (scene, versions)
}

/// Cluster over `objects` with clients 1..=clients joined
pub fn cluster(objects: &[(&str, i64)], clients: u64) -> Cluster {
    cluster_with(SyncConfig::default(), objects, clients)
}

pub fn cluster_with(config: SyncConfig, objects: &[(&str, i64)], clients: u64) -> Cluster {
    init_tracing();
    let (scene, versions) = seeded(objects);
    let mut cluster = Cluster::new(config, scene, versions);
    cluster.connect_all(clients).unwrap();
    cluster
}

fn build(kind: ActionKind, target: &str, client: ClientId) -> Action {
    Action::builder(kind, target, client).build().unwrap()
}

pub fn move_to(client: ClientId, target: &str, x: f32) -> Action {
    build(
        ActionKind::MoveNode(MoveNode {
            position: Vec3::new(x, 0.0, 0.0),
        }),
        target,
        client,
    )
}

pub fn rename(client: ClientId, target: &str, name: &str) -> Action {
    build(
        ActionKind::RenameNode(RenameNode { name: name.into() }),
        target,
        client,
    )
}

pub fn delete(client: ClientId, target: &str) -> Action {
    build(ActionKind::DeleteNode(DeleteNode {}), target, client)
}

pub fn revive(client: ClientId, target: &str) -> Action {
    build(
        ActionKind::ReviveNode(ReviveNode { node: node(target) }),
        target,
        client,
    )
}

pub fn add_node(client: ClientId, target: &str) -> Action {
    build(
        ActionKind::AddNode(AddNode { node: node(target) }),
        target,
        client,
    )
}

pub fn add_edge(client: ClientId, id: &str, source: &str, target: &str) -> Action {
    build(
        ActionKind::AddEdge(AddEdge {
            edge: EdgeSnapshot {
                source: source.into(),
                target: target.into(),
                edge_type: "calls".into(),
            },
        }),
        id,
        client,
    )
}

pub fn delete_edge(client: ClientId, id: &str) -> Action {
    build(ActionKind::DeleteEdge(DeleteEdge {}), id, client)
}

pub fn hover(client: ClientId, target: &str, hovered: bool) -> Action {
    build(ActionKind::Hover(Hover { hovered }), target, client)
}

/// Position x of `target` at `client`, if the node exists
pub fn x_of(cluster: &Cluster, client: ClientId, target: &str) -> Option<f32> {
    use gsync_core::Scene;
    cluster
        .client(client)
        .scene()
        .node(&ObjectId::new(target))
        .map(|n| n.position.x)
}

/// Mirror version of `target` at `client`
pub fn mirror_of(cluster: &Cluster, client: ClientId, target: &str) -> ObjectVersion {
    cluster.client(client).mirror().get(&ObjectId::new(target))
}

/// Authoritative version of `target`
pub fn server_version(cluster: &Cluster, target: &str) -> ObjectVersion {
    cluster.server().versions().get(&ObjectId::new(target))
}

/// Panic unless every client matches the first one and the server
pub fn assert_converged(cluster: &Cluster) {
    let ids: Vec<ClientId> = cluster.client_ids().collect();
    let Some(first) = ids.first() else {
        return;
    };
    let reference = cluster.client(*first).scene();
    let authoritative = cluster.server().versions().snapshot();
    for id in &ids {
        let replica = cluster.client(*id);
        assert!(
            reference.same_structure(replica.scene()),
            "client {id} diverged from client {first}"
        );
        assert_eq!(
            replica.mirror().snapshot(),
            authoritative,
            "client {id} mirror differs from server"
        );
        assert!(replica.pending().is_empty(), "client {id} has pending actions");
    }
}
