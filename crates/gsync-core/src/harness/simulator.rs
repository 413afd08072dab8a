//! Seeded multi-client workload with invariant checks
//!
//! Random clients submit random graph edits against their local view while
//! frames move in random order, with configurable commit loss and
//! duplication. After the cluster settles the report checks:
//! - every replica is live with no undecided actions
//! - scenes converge to the same graph
//! - every version mirror equals the server's authoritative versions
//! - every accepted submission ended with exactly one outcome
//! - ledgers hold the same records

use super::cluster::Cluster;
use crate::config::SyncConfig;
use crate::dispatch::{ReplicaStatus, ServerStats, SyncEvent};
use crate::scene::{GraphScene, Scene};
use gsync_action::kind::{
    AddEdge, AddNode, DeleteEdge, DeleteNode, Hover, MoveNode, RenameNode, ResizeNode,
    ReviveNode, RotateNode,
};
use gsync_action::{
    Action, ActionKey, ActionKind, ClientId, EdgeSnapshot, NodeSnapshot, ObjectId,
    ObjectVersion, Vec3,
};
use gsync_version::VersionStore;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub clients: u64,
    /// Submission attempts across all clients
    pub actions: u64,
    /// Nodes in the seeded base graph
    pub nodes: usize,
    /// Probability a sequenced commit delivery is lost
    pub loss_rate: f64,
    /// Probability a sequenced commit is delivered twice
    pub duplicate_rate: f64,
    /// Frames moved between submissions, at most
    pub max_interleave: usize,
    /// Packet size; small values force fragmentation
    pub max_packet_size: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            clients: 3,
            actions: 300,
            nodes: 8,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            max_interleave: 6,
            max_packet_size: 32_000,
        }
    }
}

/// An invariant broken at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum Violation {
    /// Gap recovery did not finish
    Unsettled { client: u64 },
    /// Replica not live at the end
    NotLive { client: u64 },
    /// Undecided actions remain
    PendingLeft { client: u64, count: usize },
    /// Scene differs from the first client's
    Diverged { client: u64 },
    /// Mirror differs from the server's versions
    MirrorMismatch { client: u64, object: String },
    /// A submission ended with zero or several outcomes
    Outcome {
        client: u64,
        action: String,
        outcomes: usize,
    },
    /// Ledger records differ from the server's
    LedgerMismatch { client: u64 },
}

/// Counters for one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    pub attempted: u64,
    /// Refused locally before transmission
    pub refused: u64,
    pub submitted: u64,
    pub committed: u64,
    pub rejected: u64,
    pub rolled_back: u64,
    pub resyncs: u64,
    pub gap_requests: u64,
    pub apply_failures: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub frames: u64,
    pub ledger_records: usize,
}

/// Final report from the simulator
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    pub config: SimulatorConfig,
    pub stats: SimulatorStats,
    pub server: ServerCounters,
    pub violations: Vec<Violation>,
}

/// Serializable copy of the server counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ServerCounters {
    pub head: u64,
    pub commits: u64,
    pub rejects: u64,
    pub dropped: u64,
    pub resent: u64,
}

impl ServerCounters {
    fn new(head: u64, stats: ServerStats) -> Self {
        Self {
            head,
            commits: stats.commits,
            rejects: stats.rejects,
            dropped: stats.dropped,
            resent: stats.resent,
        }
    }
}

impl SimulatorReport {
    /// Check if every invariant held
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Generate text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        use std::fmt::Write;

        let mut report = String::new();
        let _ = writeln!(report, "=== gsync simulator report ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Clients: {}", self.config.clients);
        let _ = writeln!(report, "Loss rate: {:.2}", self.config.loss_rate);
        let _ = writeln!(report, "Duplicate rate: {:.2}", self.config.duplicate_rate);
        let _ = writeln!(report, "Attempted: {}", self.stats.attempted);
        let _ = writeln!(report, "Refused locally: {}", self.stats.refused);
        let _ = writeln!(report, "Submitted: {}", self.stats.submitted);
        let _ = writeln!(report, "Committed: {}", self.stats.committed);
        let _ = writeln!(report, "Rejected: {}", self.stats.rejected);
        let _ = writeln!(report, "Rolled back: {}", self.stats.rolled_back);
        let _ = writeln!(report, "Resyncs: {}", self.stats.resyncs);
        let _ = writeln!(report, "Gap requests: {}", self.stats.gap_requests);
        let _ = writeln!(report, "Apply failures: {}", self.stats.apply_failures);
        let _ = writeln!(report, "Commits dropped: {}", self.stats.dropped);
        let _ = writeln!(report, "Commits duplicated: {}", self.stats.duplicated);
        let _ = writeln!(report, "Frames: {}", self.stats.frames);
        let _ = writeln!(report, "Ledger records: {}", self.stats.ledger_records);
        let _ = writeln!(
            report,
            "Server: head {} commits {} rejects {} resent {}",
            self.server.head, self.server.commits, self.server.rejects, self.server.resent
        );
        let _ = writeln!(report, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            report.push_str("\n=== Violations ===\n");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. {v:?}", i + 1);
            }
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }

    /// Report as pretty JSON
    ///
    /// # Errors
    /// JSON serialization failure
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Base graph: nodes `N1..=Nn` at version 1
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn base_graph(nodes: usize) -> (GraphScene, Vec<(ObjectId, ObjectVersion)>) {
    let mut scene = GraphScene::new();
    let mut versions = Vec::with_capacity(nodes);
    for i in 1..=nodes {
        let id = format!("N{i}");
        scene = scene.with_node(
            id.as_str(),
            NodeSnapshot::new("class", id.as_str(), Vec3::new(i as f32, 0.0, 0.0)),
        );
        versions.push((ObjectId::new(id), ObjectVersion::new(1)));
    }
    (scene, versions)
}

/// Run one seeded simulation
#[must_use]
pub fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (base, versions) = base_graph(config.nodes);
    let sync = SyncConfig::default().with_max_packet_size(config.max_packet_size);
    let mut cluster = Cluster::new(sync, base, versions)
        .with_loss(config.seed.wrapping_add(1), config.loss_rate)
        .with_duplication(config.duplicate_rate);

    let mut stats = SimulatorStats::default();
    if cluster.connect_all(config.clients).is_err() {
        tracing::error!("simulator clients failed to join");
    }

    let mut submitted: BTreeMap<ClientId, Vec<ActionKey>> = BTreeMap::new();
    let mut fresh = 0_u64;
    let clients: Vec<ClientId> = cluster.client_ids().collect();

    for _ in 0..config.actions {
        let Some(&client) = clients.choose(&mut rng) else {
            break;
        };
        stats.attempted += 1;
        fresh += 1;
        let Some(action) = random_action(&mut rng, &cluster, client, fresh) else {
            stats.refused += 1;
            continue;
        };
        let record_it = action.uses_versioning() && rng.random_bool(0.3);
        match cluster.submit(action.clone()) {
            Ok(()) => {
                stats.submitted += 1;
                if action.uses_versioning() {
                    if let Some(key) = last_submitted_key(&cluster, client, &action) {
                        submitted.entry(client).or_default().push(key);
                    }
                }
                if record_it && cluster.record_done(&action).is_err() {
                    tracing::debug!(%client, "ledger record refused");
                }
            }
            Err(err) => {
                tracing::debug!(%client, error = %err, "submission refused");
                stats.refused += 1;
            }
        }

        let moves = rng.random_range(0..=config.max_interleave);
        for _ in 0..moves {
            if !cluster.step_random(&mut rng) {
                break;
            }
        }
        if rng.random_bool(0.05) {
            cluster.tick();
        }
    }

    let settled = cluster.settle(64);
    let violations = check_invariants(&cluster, &submitted, settled);
    collect_stats(&cluster, &mut stats);

    let report = SimulatorReport {
        config,
        stats,
        server: ServerCounters::new(cluster.server().head(), cluster.server().stats()),
        violations,
    };
    tracing::info!(
        passed = report.passed(),
        violations = report.violations.len(),
        "simulation finished"
    );
    report
}

/// Key of the versioned action `client` just submitted
///
/// The dispatcher stamps the network version on submit; the newest pending
/// entry for the target carries it.
fn last_submitted_key(cluster: &Cluster, client: ClientId, action: &Action) -> Option<ActionKey> {
    cluster
        .client(client)
        .pending()
        .keys()
        .filter(|key| key.target == *action.target())
        .max_by_key(|key| key.network_version)
        .cloned()
}

fn random_action(
    rng: &mut StdRng,
    cluster: &Cluster,
    client: ClientId,
    fresh: u64,
) -> Option<Action> {
    let replica = cluster.client(client);
    let scene = replica.scene();
    let nodes: Vec<&ObjectId> = scene.nodes().map(|(id, _)| id).collect();
    let edges: Vec<&ObjectId> = scene.edges().map(|(id, _)| id).collect();
    let deleted: Vec<ObjectId> = replica
        .mirror()
        .snapshot()
        .into_iter()
        .filter(|(id, version)| {
            version.is_deleted() && scene.node(id).is_none() && !id.as_str().starts_with('E')
        })
        .map(|(id, _)| id)
        .collect();

    let roll = rng.random_range(0..100);
    let (kind, target) = match roll {
        0..=24 => {
            let id = (*nodes.choose(rng)?).clone();
            // Whole numbers survive the JSON round trip exactly
            let position = Vec3::new(
                f32::from(rng.random_range(-50_i16..50)),
                f32::from(rng.random_range(-50_i16..50)),
                0.0,
            );
            (ActionKind::MoveNode(MoveNode { position }), id)
        }
        25..=34 => {
            let id = (*nodes.choose(rng)?).clone();
            let s = f32::from(rng.random_range(1_u8..=6)) * 0.5;
            (ActionKind::ResizeNode(ResizeNode { scale: Vec3::new(s, s, s) }), id)
        }
        35..=42 => {
            let id = (*nodes.choose(rng)?).clone();
            let degrees = f32::from(rng.random_range(0_u16..360));
            (ActionKind::RotateNode(RotateNode { degrees }), id)
        }
        43..=54 => {
            let id = (*nodes.choose(rng)?).clone();
            let name = format!("{id}-c{}-{fresh}", client.0);
            (ActionKind::RenameNode(RenameNode { name }), id)
        }
        55..=61 => {
            let id = (*nodes.choose(rng)?).clone();
            (ActionKind::DeleteNode(DeleteNode {}), id)
        }
        62..=67 => {
            let id = deleted.choose(rng)?.clone();
            let node = NodeSnapshot::new("class", format!("{id}-revived"), Vec3::ZERO);
            (ActionKind::ReviveNode(ReviveNode { node }), id)
        }
        68..=74 => {
            let id = ObjectId::new(format!("C{}-{fresh}", client.0));
            let node = NodeSnapshot::new("class", id.as_str(), Vec3::ONE);
            (ActionKind::AddNode(AddNode { node }), id)
        }
        75..=84 => {
            let source = (*nodes.choose(rng)?).clone();
            let target = (*nodes.choose(rng)?).clone();
            if source == target {
                return None;
            }
            let id = ObjectId::new(format!("E{}-{fresh}", client.0));
            let edge = EdgeSnapshot {
                source,
                target,
                edge_type: "calls".into(),
            };
            (ActionKind::AddEdge(AddEdge { edge }), id)
        }
        85..=91 => {
            let id = (*edges.choose(rng)?).clone();
            (ActionKind::DeleteEdge(DeleteEdge {}), id)
        }
        _ => {
            let id = (*nodes.choose(rng)?).clone();
            let hovered = !scene.is_hovered(&id);
            (ActionKind::Hover(Hover { hovered }), id)
        }
    };
    Action::builder(kind, target, client).build().ok()
}

fn check_invariants(
    cluster: &Cluster,
    submitted: &BTreeMap<ClientId, Vec<ActionKey>>,
    settled: bool,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    let server = cluster.server();
    let authoritative = server.versions().snapshot();
    let server_records: BTreeSet<_> = server.history().records().iter().map(|r| r.record_id).collect();
    let mut reference: Option<&GraphScene> = None;

    for id in cluster.client_ids() {
        let replica = cluster.client(id);
        if !settled && replica.has_gap() {
            violations.push(Violation::Unsettled { client: id.0 });
        }
        if replica.status() != ReplicaStatus::Live {
            violations.push(Violation::NotLive { client: id.0 });
            continue;
        }
        if !replica.pending().is_empty() {
            violations.push(Violation::PendingLeft {
                client: id.0,
                count: replica.pending().len(),
            });
        }

        match reference {
            None => reference = Some(replica.scene()),
            Some(first) if !first.same_structure(replica.scene()) => {
                violations.push(Violation::Diverged { client: id.0 });
            }
            Some(_) => {}
        }

        let mirror = replica.mirror().snapshot();
        let objects: BTreeSet<&ObjectId> = mirror.keys().chain(authoritative.keys()).collect();
        for object in objects {
            if mirror.get(object) != authoritative.get(object) {
                violations.push(Violation::MirrorMismatch {
                    client: id.0,
                    object: object.to_string(),
                });
            }
        }

        let records: BTreeSet<_> = replica.history().records().iter().map(|r| r.record_id).collect();
        if records != server_records {
            violations.push(Violation::LedgerMismatch { client: id.0 });
        }

        let events = cluster.events(id);
        let resynced = events
            .iter()
            .any(|e| matches!(e, SyncEvent::ResyncRequired { .. }));
        for key in submitted.get(&id).into_iter().flatten() {
            let outcomes = events
                .iter()
                .filter(|e| match e {
                    SyncEvent::Committed { key: k, .. } | SyncEvent::RolledBack { key: k, .. } => {
                        k == key
                    }
                    _ => false,
                })
                .count();
            if outcomes > 1 || (outcomes == 0 && !resynced) {
                violations.push(Violation::Outcome {
                    client: id.0,
                    action: key.to_string(),
                    outcomes,
                });
            }
        }
    }
    violations
}

fn collect_stats(cluster: &Cluster, stats: &mut SimulatorStats) {
    for id in cluster.client_ids() {
        for event in cluster.events(id) {
            match event {
                SyncEvent::Committed { .. } => stats.committed += 1,
                SyncEvent::Rejected { .. } => stats.rejected += 1,
                SyncEvent::RolledBack { .. } => stats.rolled_back += 1,
                SyncEvent::ResyncRequired { .. } => stats.resyncs += 1,
                SyncEvent::GapDetected { .. } => stats.gap_requests += 1,
                SyncEvent::ApplyFailed { .. } => stats.apply_failures += 1,
                SyncEvent::RemoteApplied { .. } | SyncEvent::Joined { .. } => {}
            }
        }
    }
    let frames = cluster.stats();
    stats.dropped = frames.dropped;
    stats.duplicated = frames.duplicated;
    stats.frames = frames.frames;
    stats.ledger_records = cluster.server().history().len();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossless_run_passes() {
        let report = run_simulator(SimulatorConfig {
            actions: 150,
            ..SimulatorConfig::default()
        });
        assert!(report.passed(), "{}", report.generate_text());
        assert!(report.stats.committed > 0);
    }

    #[test]
    fn report_renders_result_line() {
        let report = run_simulator(SimulatorConfig {
            actions: 10,
            ..SimulatorConfig::default()
        });
        assert!(report.generate_text().contains("=== Result: PASS ==="));
        assert!(report.to_json().unwrap().contains("\"seed\": 42"));
    }

    #[test]
    fn base_graph_seeds_versions() {
        let (scene, versions) = base_graph(3);
        assert_eq!(scene.nodes().count(), 3);
        assert!(versions.iter().all(|(_, v)| *v == ObjectVersion::new(1)));
    }
}
