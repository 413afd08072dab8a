//! Deterministic in-memory cluster
//!
//! One server and any number of clients exchanging encoded frames through
//! FIFO inboxes. Nothing moves until [`Cluster::pump`] (or one of the
//! single-step methods) is called, so tests control the interleaving
//! exactly. Every message goes through the wire codec and fragmentation.

use crate::config::SyncConfig;
use crate::dispatch::{
    ClientDispatcher, Outbound, ReplicaStatus, ServerDispatcher, Step, SyncEvent,
};
use crate::error::{Result, SyncError, TransportError};
use crate::rollback::NotificationLog;
use crate::scene::GraphScene;
use crate::transport::Envelope;
use crate::wire::{Message, Reassembler, WireCodec};
use gsync_action::{Action, ClientId, KindRegistry, ObjectId, ObjectVersion};
use gsync_history::{ActionRecord, RecordId};
use gsync_version::AuthoritativeVersions;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Safety cap on pump iterations
const MAX_PUMP_FRAMES: usize = 1_000_000;

/// Frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub frames: u64,
    /// Commit deliveries dropped by rules or random loss
    pub dropped: u64,
    /// Commit deliveries sent twice
    pub duplicated: u64,
}

/// One client with its inbox
#[derive(Debug)]
struct Peer {
    dispatcher: ClientDispatcher<GraphScene>,
    inbox: VecDeque<String>,
    reassembler: Reassembler,
    events: Vec<SyncEvent>,
}

/// In-memory server plus clients
#[derive(Debug)]
pub struct Cluster {
    config: SyncConfig,
    codec: WireCodec,
    base: GraphScene,
    base_versions: Vec<(ObjectId, ObjectVersion)>,
    server: ServerDispatcher,
    server_inbox: VecDeque<Envelope>,
    server_reassembly: HashMap<ClientId, Reassembler>,
    peers: BTreeMap<ClientId, Peer>,
    notifications: Arc<NotificationLog>,
    drop_rules: Vec<(ClientId, u64)>,
    loss_rate: f64,
    duplicate_rate: f64,
    rng: StdRng,
    stats: ClusterStats,
}

impl Cluster {
    /// Create cluster whose server and clients start from `base`
    #[must_use]
    pub fn new(
        config: SyncConfig,
        base: GraphScene,
        base_versions: impl IntoIterator<Item = (ObjectId, ObjectVersion)>,
    ) -> Self {
        let base_versions: Vec<_> = base_versions.into_iter().collect();
        let server = ServerDispatcher::with_versions(
            config.clone(),
            AuthoritativeVersions::with_versions(base_versions.iter().cloned()),
        );
        Self {
            codec: WireCodec::new(KindRegistry::with_defaults(), config.max_packet_size),
            config,
            base,
            base_versions,
            server,
            server_inbox: VecDeque::new(),
            server_reassembly: HashMap::new(),
            peers: BTreeMap::new(),
            notifications: Arc::new(NotificationLog::new()),
            drop_rules: Vec::new(),
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            rng: StdRng::seed_from_u64(0),
            stats: ClusterStats::default(),
        }
    }

    /// Randomly drop sequenced commit deliveries with probability `rate`
    #[must_use]
    pub fn with_loss(mut self, seed: u64, rate: f64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Randomly deliver sequenced commits twice with probability `rate`
    #[must_use]
    pub fn with_duplication(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Add a client and queue its `Join`
    ///
    /// # Errors
    /// `SyncError::Codec` if the join cannot be encoded
    pub fn connect(&mut self, id: ClientId) -> Result<()> {
        let mut dispatcher = ClientDispatcher::new(
            id,
            self.base.clone(),
            self.config.clone(),
            self.notifications.clone(),
        )
        .with_versions(self.base_versions.iter().cloned());
        let join = dispatcher.join();
        self.peers.insert(
            id,
            Peer {
                dispatcher,
                inbox: VecDeque::new(),
                reassembler: Reassembler::new(),
                events: Vec::new(),
            },
        );
        self.queue_to_server(id, &join)
    }

    /// Connect `count` clients with ids 1..=count and deliver their joins
    ///
    /// # Errors
    /// As [`Self::connect`]
    pub fn connect_all(&mut self, count: u64) -> Result<()> {
        for id in 1..=count {
            self.connect(ClientId(id))?;
        }
        self.pump();
        Ok(())
    }

    /// Drop the next sequenced commit `sequence` addressed to `client`
    pub fn drop_commit(&mut self, client: ClientId, sequence: u64) {
        self.drop_rules.push((client, sequence));
    }

    /// Apply `action` at its requester and queue what it sends
    ///
    /// # Errors
    /// The dispatcher's submission error; nothing is queued
    pub fn submit(&mut self, action: Action) -> Result<()> {
        let client = action.requester();
        let peer = self.peer_mut(client)?;
        let step = peer.dispatcher.submit(action)?;
        self.absorb(client, step)
    }

    /// Record `action` in its requester's ledger and queue the op
    ///
    /// # Errors
    /// Unknown client, or the ledger refused the record
    pub fn record_done(&mut self, action: &Action) -> Result<RecordId> {
        let client = action.requester();
        let record = ActionRecord::done(action.id(), client, [action.target().clone()]);
        let record_id = record.record_id;
        let message = self.peer_mut(client)?.dispatcher.push_record(record)?;
        self.queue_to_server(client, &message)?;
        Ok(record_id)
    }

    /// Remove a ledger record at `client` and queue the op
    ///
    /// # Errors
    /// Unknown client or record
    pub fn delete_record(&mut self, client: ClientId, record_id: RecordId) -> Result<()> {
        let message = self.peer_mut(client)?.dispatcher.delete_record(record_id)?;
        self.queue_to_server(client, &message)
    }

    /// Replace a ledger record at `client`; `false` if nothing matched
    ///
    /// # Errors
    /// Unknown client
    pub fn replace_record(
        &mut self,
        client: ClientId,
        old: &ActionRecord,
        new: ActionRecord,
    ) -> Result<bool> {
        match self.peer_mut(client)?.dispatcher.replace_record(old, new) {
            Some(message) => self.queue_to_server(client, &message).map(|()| true),
            None => Ok(false),
        }
    }

    /// Drop `client`'s redo entries and queue the ops; returns how many
    ///
    /// # Errors
    /// Unknown client
    pub fn clear_redos(&mut self, client: ClientId) -> Result<usize> {
        let messages = self.peer_mut(client)?.dispatcher.clear_redos();
        for message in &messages {
            self.queue_to_server(client, message)?;
        }
        Ok(messages.len())
    }

    /// Discard `client`'s replica and queue a rejoin
    ///
    /// # Errors
    /// Unknown client
    pub fn resync(&mut self, client: ClientId) -> Result<()> {
        let join = self.peer_mut(client)?.dispatcher.resync();
        self.queue_to_server(client, &join)
    }

    /// Handle the next frame waiting at the server; `false` if none
    pub fn step_server(&mut self) -> bool {
        let Some(envelope) = self.server_inbox.pop_front() else {
            return false;
        };
        self.stats.frames += 1;
        let text = match self
            .server_reassembly
            .entry(envelope.from)
            .or_default()
            .push(&envelope.frame)
        {
            Ok(Some(text)) => text,
            Ok(None) => return true,
            Err(err) => {
                tracing::warn!(from = %envelope.from, error = %err, "bad frame at server");
                return true;
            }
        };
        match self.codec.decode(&text) {
            Ok(message) => {
                for outbound in self.server.handle(envelope.from, message) {
                    self.route(&outbound);
                }
            }
            Err(err) => tracing::warn!(from = %envelope.from, error = %err, "undecodable at server"),
        }
        true
    }

    /// Handle the next frame waiting at `client`; `false` if none
    pub fn step_client(&mut self, client: ClientId) -> bool {
        let Some(peer) = self.peers.get_mut(&client) else {
            return false;
        };
        let Some(frame) = peer.inbox.pop_front() else {
            return false;
        };
        self.stats.frames += 1;
        let text = match peer.reassembler.push(&frame) {
            Ok(Some(text)) => text,
            Ok(None) => return true,
            Err(err) => {
                tracing::warn!(%client, error = %err, "bad frame at client");
                return true;
            }
        };
        let message = match self.codec.decode(&text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(%client, error = %err, "undecodable at client");
                return true;
            }
        };
        let step = peer.dispatcher.receive(message);
        if let Err(err) = self.absorb(client, step) {
            tracing::warn!(%client, error = %err, "client output not queued");
        }
        true
    }

    /// Move one frame from a random non-empty inbox; `false` if all empty
    pub fn step_random(&mut self, rng: &mut impl Rng) -> bool {
        let mut ready: Vec<Option<ClientId>> = self
            .peers
            .iter()
            .filter(|(_, p)| !p.inbox.is_empty())
            .map(|(id, _)| Some(*id))
            .collect();
        if !self.server_inbox.is_empty() {
            ready.push(None);
        }
        if ready.is_empty() {
            return false;
        }
        match ready[rng.random_range(0..ready.len())] {
            None => self.step_server(),
            Some(client) => self.step_client(client),
        }
    }

    /// Deliver everything until all inboxes are empty
    ///
    /// Returns the number of frames moved.
    pub fn pump(&mut self) -> usize {
        let mut moved = 0;
        while moved < MAX_PUMP_FRAMES {
            let mut progressed = false;
            while self.step_server() {
                moved += 1;
                progressed = true;
            }
            let ids: Vec<ClientId> = self.peers.keys().copied().collect();
            for id in ids {
                while self.step_client(id) {
                    moved += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        moved
    }

    /// Run the timer-driven traffic once: head announcement and gap retries
    pub fn tick(&mut self) {
        if let Some(outbound) = self.server.head_announcement() {
            self.route(&outbound);
        }
        let requests: Vec<(ClientId, Message)> = self
            .peers
            .iter()
            .filter_map(|(id, p)| p.dispatcher.gap_request().map(|m| (*id, m)))
            .collect();
        for (client, request) in requests {
            if let Err(err) = self.queue_to_server(client, &request) {
                tracing::warn!(%client, error = %err, "gap retry not queued");
            }
        }
    }

    /// Pump and tick until the cluster is quiescent
    ///
    /// Every round runs the timer traffic, so a commit lost after the last
    /// announcement is still found. Returns `false` if [`Self::is_quiescent`]
    /// does not hold after `rounds` ticks.
    pub fn settle(&mut self, rounds: usize) -> bool {
        self.pump();
        for _ in 0..rounds {
            self.tick();
            self.pump();
            if self.is_quiescent() {
                return true;
            }
        }
        false
    }

    /// Nothing in flight and every client live, decided and at the server head
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        let head = self.server.head();
        self.in_flight() == 0
            && self.peers.values().all(|peer| {
                let replica = &peer.dispatcher;
                replica.status() == ReplicaStatus::Live
                    && replica.pending().is_empty()
                    && !replica.has_gap()
                    && replica.contiguous() == head
            })
    }

    /// Client dispatcher
    ///
    /// # Panics
    /// If `id` was never connected
    #[must_use]
    pub fn client(&self, id: ClientId) -> &ClientDispatcher<GraphScene> {
        match self.peers.get(&id) {
            Some(peer) => &peer.dispatcher,
            None => panic!("client {id} is not connected"),
        }
    }

    /// Connected client ids
    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.peers.keys().copied()
    }

    /// Events `id` produced so far
    #[must_use]
    pub fn events(&self, id: ClientId) -> &[SyncEvent] {
        self.peers.get(&id).map_or(&[], |p| p.events.as_slice())
    }

    /// Take and clear `id`'s events
    pub fn take_events(&mut self, id: ClientId) -> Vec<SyncEvent> {
        self.peers
            .get_mut(&id)
            .map(|p| std::mem::take(&mut p.events))
            .unwrap_or_default()
    }

    /// Server dispatcher
    #[inline]
    #[must_use]
    pub fn server(&self) -> &ServerDispatcher {
        &self.server
    }

    /// Notifications raised by every client's rollback controller
    #[inline]
    #[must_use]
    pub fn notifications(&self) -> &NotificationLog {
        &self.notifications
    }

    /// Frame counters
    #[inline]
    #[must_use]
    pub fn stats(&self) -> ClusterStats {
        self.stats
    }

    /// Frames waiting anywhere
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.server_inbox.len() + self.peers.values().map(|p| p.inbox.len()).sum::<usize>()
    }

    fn peer_mut(&mut self, id: ClientId) -> Result<&mut Peer> {
        self.peers
            .get_mut(&id)
            .ok_or(SyncError::Transport(TransportError::UnknownPeer(id)))
    }

    fn absorb(&mut self, client: ClientId, step: Step) -> Result<()> {
        for message in &step.outbound {
            self.queue_to_server(client, message)?;
        }
        if let Some(peer) = self.peers.get_mut(&client) {
            peer.events.extend(step.events);
        }
        Ok(())
    }

    fn queue_to_server(&mut self, from: ClientId, message: &Message) -> Result<()> {
        for frame in self.codec.frames(message)? {
            self.server_inbox.push_back(Envelope { from, frame });
        }
        Ok(())
    }

    fn route(&mut self, outbound: &Outbound) {
        let frames = match self.codec.frames(outbound.message()) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::error!(error = %err, "server output not encodable");
                return;
            }
        };
        let sequence = match outbound.message() {
            Message::Commit(committed) => committed.sequence,
            _ => None,
        };
        let recipients: Vec<ClientId> = self
            .peers
            .keys()
            .copied()
            .filter(|id| outbound.addresses(*id))
            .collect();

        for client in recipients {
            let mut copies = 1;
            if let Some(sequence) = sequence {
                if self.should_drop(client, sequence) {
                    tracing::debug!(%client, sequence, "commit dropped");
                    self.stats.dropped += 1;
                    continue;
                }
                if self.duplicate_rate > 0.0 && self.rng.random_bool(self.duplicate_rate) {
                    self.stats.duplicated += 1;
                    copies = 2;
                }
            }
            if let Some(peer) = self.peers.get_mut(&client) {
                for _ in 0..copies {
                    peer.inbox.extend(frames.iter().cloned());
                }
            }
        }
    }

    fn should_drop(&mut self, client: ClientId, sequence: u64) -> bool {
        if let Some(pos) = self
            .drop_rules
            .iter()
            .position(|rule| *rule == (client, sequence))
        {
            self.drop_rules.swap_remove(pos);
            return true;
        }
        self.loss_rate > 0.0 && self.rng.random_bool(self.loss_rate)
    }
}
