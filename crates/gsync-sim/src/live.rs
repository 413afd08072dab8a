//! Tokio-task cluster over the in-process hub

use anyhow::Context;
use futures::future::join_all;
use gsync_action::kind::MoveNode;
use gsync_action::{Action, ActionKind, ClientId, KindRegistry, ObjectId, Vec3};
use gsync_core::{
    base_graph, ClientDispatcher, ClientRuntime, GraphScene, LocalHub, NotificationLog,
    ReplicaStatus, ServerDispatcher, ServerRuntime, SyncConfig, SyncEvent, Transport, WireCodec,
};
use gsync_version::AuthoritativeVersions;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
const POLL: Duration = Duration::from_millis(20);

pub(crate) struct LiveOptions {
    pub(crate) clients: u64,
    pub(crate) actions: u64,
    pub(crate) nodes: usize,
    pub(crate) seed: u64,
    pub(crate) config: SyncConfig,
}

#[derive(Debug, Default)]
struct Tally {
    committed: u64,
    rejected: u64,
    rolled_back: u64,
    refused: u64,
    resyncs: u64,
}

impl Tally {
    fn observe(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::Committed { .. } => self.committed += 1,
            SyncEvent::Rejected { .. } => self.rejected += 1,
            SyncEvent::RolledBack { .. } => self.rolled_back += 1,
            SyncEvent::ResyncRequired { .. } => self.resyncs += 1,
            _ => {}
        }
    }

    fn add(&mut self, other: &Tally) {
        self.committed += other.committed;
        self.rejected += other.rejected;
        self.rolled_back += other.rolled_back;
        self.refused += other.refused;
        self.resyncs += other.resyncs;
    }
}

/// Outcome of one live run
#[derive(Debug)]
pub(crate) struct LiveSummary {
    clients: u64,
    head: u64,
    tally: Tally,
    pub(crate) converged: bool,
}

impl fmt::Display for LiveSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== gsync live run ===")?;
        writeln!(f, "Clients: {}", self.clients)?;
        writeln!(f, "Server head: {}", self.head)?;
        writeln!(f, "Committed: {}", self.tally.committed)?;
        writeln!(f, "Rejected: {}", self.tally.rejected)?;
        writeln!(f, "Rolled back: {}", self.tally.rolled_back)?;
        writeln!(f, "Refused: {}", self.tally.refused)?;
        writeln!(f, "Resyncs: {}", self.tally.resyncs)?;
        write!(
            f,
            "=== Result: {} ===",
            if self.converged { "CONVERGED" } else { "DIVERGED" }
        )
    }
}

async fn wait_joined(client: &mut ClientRuntime<GraphScene>) -> anyhow::Result<()> {
    tokio::time::timeout(JOIN_TIMEOUT, async {
        while let Some(event) = client.next_event().await {
            if matches!(event, SyncEvent::Joined { .. }) {
                return Ok(());
            }
        }
        anyhow::bail!("client {} event channel closed", client.id())
    })
    .await
    .with_context(|| format!("client {} never joined", client.id()))?
}

/// Submit `actions` random moves, yielding between submissions
async fn edit(
    mut client: ClientRuntime<GraphScene>,
    targets: Arc<Vec<ObjectId>>,
    actions: u64,
    seed: u64,
) -> (ClientRuntime<GraphScene>, Tally) {
    let mut rng = StdRng::seed_from_u64(seed ^ client.id().0);
    let mut tally = Tally::default();
    for _ in 0..actions {
        let Some(target) = targets.get(rng.random_range(0..targets.len())) else {
            break;
        };
        let position = Vec3::new(
            f32::from(rng.random_range(0_u8..100)),
            f32::from(rng.random_range(0_u8..100)),
            0.0,
        );
        let action = Action::builder(ActionKind::MoveNode(MoveNode { position }), target.clone(), client.id())
            .build();
        match action.map_err(anyhow::Error::from).and_then(|a| Ok(client.submit(a)?)) {
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(client = %client.id(), error = %err, "submission refused");
                tally.refused += 1;
            }
        }
        while let Some(event) = client.try_next_event() {
            tally.observe(&event);
        }
        tokio::time::sleep(Duration::from_millis(rng.random_range(0..3))).await;
    }
    (client, tally)
}

fn settled(server: &ServerRuntime, clients: &[ClientRuntime<GraphScene>]) -> bool {
    let head = server.inspect(ServerDispatcher::head);
    clients.iter().all(|client| {
        client.inspect(|d| {
            d.status() == ReplicaStatus::Live && d.pending().is_empty() && d.contiguous() == head
        })
    })
}

/// Run server and clients until every replica has caught up
///
/// # Errors
/// A client failed to join or a task panicked
pub(crate) async fn run(options: LiveOptions) -> anyhow::Result<LiveSummary> {
    let config = options.config;
    let codec = WireCodec::new(KindRegistry::with_defaults(), config.max_packet_size);
    let hub = Arc::new(LocalHub::new());
    let transport: Arc<dyn Transport> = hub.clone();
    let (scene, versions) = base_graph(options.nodes);
    let targets: Arc<Vec<ObjectId>> = Arc::new(versions.iter().map(|(id, _)| id.clone()).collect());

    let server = ServerRuntime::spawn(
        ServerDispatcher::with_versions(
            config.clone(),
            AuthoritativeVersions::with_versions(versions.iter().cloned()),
        ),
        codec.clone(),
        Arc::clone(&transport),
        hub.connect(config.server_id),
    );

    let sink = Arc::new(NotificationLog::new());
    let mut clients = Vec::new();
    for i in 1..=options.clients {
        let id = ClientId(i);
        let dispatcher = ClientDispatcher::new(id, scene.clone(), config.clone(), sink.clone())
            .with_versions(versions.iter().cloned());
        let mut client = ClientRuntime::start(dispatcher, codec.clone(), Arc::clone(&transport), hub.connect(id))?;
        wait_joined(&mut client).await?;
        clients.push(client);
    }
    tracing::info!(clients = clients.len(), nodes = options.nodes, "all clients joined");

    let tasks = clients
        .into_iter()
        .map(|client| tokio::spawn(edit(client, Arc::clone(&targets), options.actions, options.seed)));
    let mut tally = Tally::default();
    let mut clients = Vec::new();
    for joined in join_all(tasks).await {
        let (client, partial) = joined.context("editing task panicked")?;
        tally.add(&partial);
        clients.push(client);
    }

    let settle = tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !settled(&server, &clients) {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    if settle.is_err() {
        tracing::warn!("replicas did not settle in time");
    }

    for client in &mut clients {
        while let Some(event) = client.try_next_event() {
            tally.observe(&event);
        }
    }
    let scenes: Vec<GraphScene> = clients.iter().map(|c| c.inspect(|d| d.scene().clone())).collect();
    let converged = settle.is_ok() && scenes.windows(2).all(|pair| pair[0] == pair[1]);
    let head = server.inspect(ServerDispatcher::head);
    tracing::info!(head, converged, notifications = sink.entries().len(), "live run finished");

    for client in clients {
        client.shutdown();
    }
    server.shutdown();

    Ok(LiveSummary {
        clients: options.clients,
        head,
        tally,
        converged,
    })
}
