//! Client side of the protocol
//!
//! Actions are applied to the local scene as soon as they are submitted and
//! reconciled when the server's decision arrives:
//!
//! - own commit echo: the pending entry retires, the mirror advances and the
//!   next held action on that target is stamped and sent
//! - reject: the rejected entry and everything held behind it is rolled back
//! - another client's commit: pending changes it touches are rebased on it
//!
//! A rebase unwinds the pending entries entangled with the commit youngest
//! first, applies the commit to what is left, then replays the entries
//! oldest first with fresh undos. Entries on the commit's target, and
//! entries that no longer apply, are dropped and reported as rolled back.
//! Pending entries whose footprint is disjoint from the commit stay where
//! they are. An own commit that overtook earlier entangled entries is
//! rebased the same way.
//!
//! The version mirror only ever moves on commits. An entry that cannot be
//! undone during a rebase discards the replica.

use super::{Step, SyncEvent};
use crate::config::SyncConfig;
use crate::effect::ClientEffect;
use crate::error::{Result, SyncError};
use crate::pending::{PendingEntry, PendingSet, PendingState};
use crate::recovery::{Offer, SequenceTracker};
use crate::rollback::{NotificationSink, RollbackCause, RollbackController};
use crate::scene::Scene;
use crate::wire::{Committed, Message, Reject, Welcome};
use gsync_action::{Action, ActionKey, ClientId, ObjectId, ObjectVersion};
use gsync_history::{ActionHistory, ActionRecord, RecordId};
use gsync_version::{MirrorVersions, VersionStore};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Lifecycle of a client replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    /// Waiting for the join replay
    Joining,
    /// Accepting submissions
    Live,
    /// Local state discarded; must rejoin
    Compromised,
}

impl ReplicaStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Joining => "joining",
            Self::Live => "live",
            Self::Compromised => "compromised",
        }
    }
}

/// What lands between unwinding and replay
enum Landing {
    /// A commit not matched by any pending entry
    Remote { action: Action, sequence: Option<u64> },
    /// An own pending entry, committed ahead of entries it was applied after
    Own { key: ActionKey, sequence: Option<u64> },
    /// Nothing; the dead entries are only reverted
    Nothing,
}

/// Client protocol state machine over a local scene
#[derive(Debug)]
pub struct ClientDispatcher<S: Scene + Clone> {
    id: ClientId,
    config: SyncConfig,
    scene: S,
    mirror: MirrorVersions,
    base_scene: S,
    base_versions: MirrorVersions,
    pending: PendingSet,
    history: ActionHistory,
    tracker: SequenceTracker,
    rollback: RollbackController,
    status: ReplicaStatus,
    network_version: u64,
}

impl<S: Scene + Clone> ClientDispatcher<S> {
    /// Create a replica starting from `scene`
    ///
    /// `scene` is also the base state restored on resync, before the join
    /// replay is applied.
    #[must_use]
    pub fn new(
        id: ClientId,
        scene: S,
        config: SyncConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            id,
            history: ActionHistory::with_dedup_window(config.ledger_dedup_window),
            config,
            base_scene: scene.clone(),
            scene,
            mirror: MirrorVersions::new(),
            base_versions: MirrorVersions::new(),
            pending: PendingSet::new(),
            tracker: SequenceTracker::new(),
            rollback: RollbackController::new(sink),
            status: ReplicaStatus::Joining,
            network_version: 0,
        }
    }

    /// Seed base versions matching the base scene
    #[must_use]
    pub fn with_versions(
        mut self,
        versions: impl IntoIterator<Item = (ObjectId, ObjectVersion)>,
    ) -> Self {
        for (id, version) in versions {
            self.mirror.set(id.clone(), version);
            self.base_versions.set(id, version);
        }
        self
    }

    /// This client's id
    #[inline]
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current lifecycle state
    #[inline]
    #[must_use]
    pub fn status(&self) -> ReplicaStatus {
        self.status
    }

    /// Local scene, including optimistic changes
    #[inline]
    #[must_use]
    pub fn scene(&self) -> &S {
        &self.scene
    }

    /// Committed version mirror
    #[inline]
    #[must_use]
    pub fn mirror(&self) -> &MirrorVersions {
        &self.mirror
    }

    /// Local ledger replica
    #[inline]
    #[must_use]
    pub fn history(&self) -> &ActionHistory {
        &self.history
    }

    /// Undecided local actions
    #[inline]
    #[must_use]
    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    /// Highest sequence applied without gaps
    #[inline]
    #[must_use]
    pub fn contiguous(&self) -> u64 {
        self.tracker.contiguous()
    }

    /// Whether sequenced commits are known to be missing
    #[inline]
    #[must_use]
    pub fn has_gap(&self) -> bool {
        self.tracker.has_gap()
    }

    /// Start the first join
    pub fn join(&mut self) -> Message {
        self.status = ReplicaStatus::Joining;
        Message::Join
    }

    /// Discard local derived state and rejoin
    pub fn resync(&mut self) -> Message {
        self.discard_local_state();
        self.join()
    }

    /// Apply `action` locally and queue it for the server
    ///
    /// Never blocks on the server. If another action on the same target is
    /// still undecided, this one is applied now and sent once that one is
    /// decided.
    ///
    /// # Errors
    /// - `SyncError::NotLive` before the join replay or after a discard
    /// - `SyncError::ForeignAction` if the action names another requester
    /// - `SyncError::Action` if the mirror version forbids the action
    /// - `SyncError::Apply` if the scene cannot apply it; nothing is sent
    pub fn submit(&mut self, mut action: Action) -> Result<Step> {
        if self.status != ReplicaStatus::Live {
            return Err(SyncError::NotLive(self.status.as_str()));
        }
        if action.requester() != self.id {
            return Err(SyncError::ForeignAction {
                expected: self.id,
                actual: action.requester(),
            });
        }

        let network_version = self.network_version + 1;
        action.assign_network_version(network_version);
        let target = action.target().clone();
        let mut step = Step::new();

        if !action.uses_versioning() {
            action.stamp(self.mirror.get(&target))?;
            action.kind().execute_on_client(&target, &mut self.scene)?;
            self.network_version = network_version;
            step.outbound.push(Message::Submit(action));
            return Ok(step);
        }

        let held = self.pending.has_target(&target);
        if !held {
            action.stamp(self.mirror.get(&target))?;
        }
        let footprint = action.kind().footprint(&target, &self.scene);
        let undo = action.kind().execute_on_client(&target, &mut self.scene)?;
        self.network_version = network_version;

        if held {
            tracing::debug!(%action, "held behind undecided action on same target");
            self.pending
                .insert(PendingEntry::held(action, undo).with_footprint(footprint));
        } else {
            step.outbound.push(Message::Submit(action.clone()));
            self.pending
                .insert(PendingEntry::sent(action, undo).with_footprint(footprint));
        }
        Ok(step)
    }

    /// Process one message from the server
    pub fn receive(&mut self, message: Message) -> Step {
        match (self.status, message) {
            (ReplicaStatus::Joining, Message::Welcome(welcome)) => self.handle_welcome(welcome),
            (ReplicaStatus::Live, message) => self.handle_live(message),
            (status, message) => {
                tracing::debug!(
                    client = %self.id,
                    status = status.as_str(),
                    message = message.name(),
                    "message ignored"
                );
                Step::new()
            }
        }
    }

    /// Gap request for the periodic retry, if anything is missing
    #[must_use]
    pub fn gap_request(&self) -> Option<Message> {
        if self.status != ReplicaStatus::Live {
            return None;
        }
        let missing = self.tracker.missing(self.config.max_gap_request);
        (!missing.is_empty()).then_some(Message::GapRequest { missing })
    }

    /// Append a ledger record; returns the message to send
    ///
    /// # Errors
    /// `SyncError::NotLive` or `SyncError::History`
    pub fn push_record(&mut self, record: ActionRecord) -> Result<Message> {
        self.ensure_live()?;
        Ok(Message::Ledger(self.history.push(record)?))
    }

    /// Record `action` as done by this client
    ///
    /// # Errors
    /// Same as [`Self::push_record`]
    pub fn record_done(&mut self, action: &Action) -> Result<Message> {
        let record = ActionRecord::done(action.id(), self.id, [action.target().clone()]);
        self.push_record(record)
    }

    /// Remove a ledger record; returns the message to send
    ///
    /// # Errors
    /// `SyncError::NotLive` or `SyncError::History`
    pub fn delete_record(&mut self, record_id: RecordId) -> Result<Message> {
        self.ensure_live()?;
        Ok(Message::Ledger(self.history.delete(record_id)?))
    }

    /// Replace the ledger entry exactly equal to `old`
    ///
    /// `None` if no entry matches (nothing to send).
    pub fn replace_record(&mut self, old: &ActionRecord, new: ActionRecord) -> Option<Message> {
        if self.status != ReplicaStatus::Live {
            return None;
        }
        self.history.replace(old, new).map(Message::Ledger)
    }

    /// Drop this client's redo entries; returns the messages to send
    pub fn clear_redos(&mut self) -> Vec<Message> {
        if self.status != ReplicaStatus::Live {
            return Vec::new();
        }
        self.history
            .clear_redos(self.id)
            .into_iter()
            .map(Message::Ledger)
            .collect()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.status == ReplicaStatus::Live {
            Ok(())
        } else {
            Err(SyncError::NotLive(self.status.as_str()))
        }
    }

    fn handle_live(&mut self, message: Message) -> Step {
        match message {
            Message::Commit(committed) => self.handle_committed(committed),
            Message::Resend { entries } => {
                let mut step = Step::new();
                for committed in entries {
                    if self.status != ReplicaStatus::Live {
                        break;
                    }
                    step.extend(self.handle_committed(committed));
                }
                step
            }
            Message::Reject(reject) => self.handle_reject(reject),
            Message::Head { sequence } => {
                let missing = self.tracker.observe_head(sequence);
                self.gap_step(missing)
            }
            Message::Ledger(op) => {
                self.history.apply(&op);
                Step::new()
            }
            other => {
                tracing::warn!(client = %self.id, message = other.name(), "unexpected message at client");
                Step::new()
            }
        }
    }

    fn handle_welcome(&mut self, welcome: Welcome) -> Step {
        self.status = ReplicaStatus::Live;
        self.tracker.reset(0);

        let mut step = Step::new();
        for committed in welcome.replay {
            if self.status != ReplicaStatus::Live {
                return step;
            }
            step.extend(self.handle_committed(committed));
        }
        if let Some(records) = welcome.ledger {
            self.history.restore(records);
        }
        let missing = self.tracker.observe_head(welcome.head);
        step.extend(self.gap_step(missing));

        tracing::info!(client = %self.id, head = welcome.head, "joined");
        step.events.push(SyncEvent::Joined { head: welcome.head });
        step
    }

    fn handle_committed(&mut self, committed: Committed) -> Step {
        let Some(sequence) = committed.sequence else {
            return self.apply_commit(committed.action, None);
        };
        match self.tracker.offer(sequence, committed.action) {
            Offer::Duplicate => {
                tracing::debug!(client = %self.id, sequence, "duplicate commit skipped");
                Step::new()
            }
            Offer::Held { missing } => self.gap_step(missing),
            Offer::Ready(ready) => {
                let mut step = Step::new();
                for (sequence, action) in ready {
                    if self.status != ReplicaStatus::Live {
                        break;
                    }
                    step.extend(self.apply_commit(action, Some(sequence)));
                }
                step
            }
        }
    }

    fn apply_commit(&mut self, action: Action, sequence: Option<u64>) -> Step {
        if action.requester() == self.id {
            let key = action.key();
            if let Some(index) = self.pending.index_of(&key) {
                return self.apply_own_commit(key, index, sequence);
            }
            if !action.uses_versioning() {
                let mut step = Step::new();
                step.events.push(SyncEvent::Committed { key, sequence });
                return step;
            }
            // Own action no longer pending (rolled back or replayed): apply
            // like any other commit
        }
        self.apply_remote(action, sequence)
    }

    fn apply_own_commit(&mut self, key: ActionKey, index: usize, sequence: Option<u64>) -> Step {
        let seed = self
            .pending
            .get(&key)
            .map(|entry| entry.footprint.clone())
            .unwrap_or_default();
        let picks = self.entangled(seed, 0);
        if picks.range(..index).next().is_some() {
            tracing::debug!(client = %self.id, %key, "commit overtook entangled pending entries");
            return self.rebase(
                &picks,
                Landing::Own { key, sequence },
                BTreeSet::new(),
                RollbackCause::Superseded,
            );
        }

        let mut step = Step::new();
        if let Some(entry) = self.pending.retire(&key) {
            let target = entry.action.target().clone();
            if entry.action.uses_versioning() {
                self.mirror.set(target.clone(), entry.action.new_version());
            }
            step.events.push(SyncEvent::Committed { key, sequence });
            step.extend(self.promote_held(&target));
        }
        step
    }

    fn apply_remote(&mut self, action: Action, sequence: Option<u64>) -> Step {
        let target = action.target().clone();
        let versioned = action.uses_versioning();
        if versioned && self.mirror.get(&target) == action.new_version() {
            tracing::debug!(client = %self.id, %action, "commit already applied");
            return Step::new();
        }
        if action.is_transient() {
            return self.land(Landing::Remote { action, sequence }, &mut Vec::new());
        }

        let picks = self.entangled(action.kind().footprint(&target, &self.scene), 0);
        let dead = if versioned {
            BTreeSet::from([target])
        } else {
            BTreeSet::new()
        };
        self.rebase(
            &picks,
            Landing::Remote { action, sequence },
            dead,
            RollbackCause::Superseded,
        )
    }

    fn handle_reject(&mut self, reject: Reject) -> Step {
        if reject.requester != self.id {
            tracing::warn!(client = %self.id, requester = %reject.requester, "reject addressed to another client");
            return Step::new();
        }
        let key = ActionKey {
            requester: reject.requester,
            network_version: reject.network_version,
            target: reject.target,
        };
        if self.pending.get(&key).is_none() {
            tracing::debug!(client = %self.id, %key, "reject for action no longer pending");
            return Step::new();
        }

        tracing::warn!(
            client = %self.id,
            %key,
            reason = %reject.reason,
            authoritative = %reject.object_version,
            "action rejected"
        );
        let mut step = Step::new();
        step.events.push(SyncEvent::Rejected {
            key: key.clone(),
            reason: reject.reason,
            authoritative: reject.object_version,
        });
        step.extend(self.revert_from(&key, RollbackCause::Rejected(reject.reason)));
        step
    }

    /// Stamp and send the oldest held action on `target`
    fn promote_held(&mut self, target: &ObjectId) -> Step {
        let version = self.mirror.get(target);
        let promoted = match self.pending.next_held(target) {
            None => return Step::new(),
            Some(entry) => match entry.action.stamp(version) {
                Ok(()) => {
                    entry.state = PendingState::Sent;
                    Ok(entry.action.clone())
                }
                Err(err) => Err((entry.action.key(), err)),
            },
        };

        let mut step = Step::new();
        match promoted {
            Ok(action) => step.outbound.push(Message::Submit(action)),
            Err((key, err)) => {
                tracing::debug!(client = %self.id, %key, error = %err, "held action withdrawn");
                step.extend(self.revert_from(&key, RollbackCause::Withdrawn));
            }
        }
        step
    }

    /// Drop `key` and the later entries on its target; replay what depended on them
    fn revert_from(&mut self, key: &ActionKey, cause: RollbackCause) -> Step {
        let Some(index) = self.pending.index_of(key) else {
            return Step::new();
        };
        let seed = self
            .pending
            .get(key)
            .map(|entry| entry.footprint.clone())
            .unwrap_or_default();
        let picks = self.entangled(seed, index);
        let dead = BTreeSet::from([key.target.clone()]);
        self.rebase(&picks, Landing::Nothing, dead, cause)
    }

    /// Indices of pending entries from `from` on that meet `touched`
    ///
    /// An entry that joins widens `touched` by its own footprint, so later
    /// entries built on it join too.
    fn entangled(&self, mut touched: BTreeSet<ObjectId>, from: usize) -> BTreeSet<usize> {
        let mut picks = BTreeSet::new();
        for (index, entry) in self.pending.iter().enumerate().skip(from) {
            if !entry.footprint.is_disjoint(&touched) {
                touched.extend(entry.footprint.iter().cloned());
                picks.insert(index);
            }
        }
        picks
    }

    fn rebase(
        &mut self,
        picks: &BTreeSet<usize>,
        landing: Landing,
        mut dead: BTreeSet<ObjectId>,
        cause: RollbackCause,
    ) -> Step {
        let mut unwound = self.pending.take_indices(picks);
        let mut step = Step::new();
        let mut dropped = Vec::new();

        let replays = matches!(landing, Landing::Own { .. })
            || unwound.iter().any(|e| !dead.contains(e.action.target()));
        if !replays {
            let outcome = self.rollback.roll_back(unwound, &mut self.scene, cause);
            step.events.extend(
                outcome
                    .reverted
                    .into_iter()
                    .map(|key| SyncEvent::RolledBack { key, cause }),
            );
            if let Some(err) = outcome.compromised {
                step.extend(self.compromise(&err));
                return step;
            }
            step.extend(self.land(landing, &mut Vec::new()));
            return step;
        }

        for entry in unwound.iter_mut().rev() {
            if let Err(err) = self.rollback.undo_entry(entry, &mut self.scene) {
                step.extend(self.compromise(&err));
                return step;
            }
        }

        let promote = match &landing {
            Landing::Own { key, .. } => Some(key.target.clone()),
            _ => None,
        };
        step.extend(self.land(landing, &mut unwound));

        for mut entry in unwound {
            let target = entry.action.target().clone();
            if dead.contains(&target) {
                dropped.push(entry.action);
                continue;
            }
            let footprint = entry.action.kind().footprint(&target, &self.scene);
            match entry.action.kind().execute_on_client(&target, &mut self.scene) {
                Ok(undo) => {
                    entry.undo = undo;
                    entry.footprint = footprint;
                    self.pending.insert(entry);
                }
                Err(error) => {
                    tracing::debug!(
                        client = %self.id,
                        action = %entry.action,
                        %error,
                        "pending action no longer applies"
                    );
                    dead.insert(target);
                    dropped.push(entry.action);
                }
            }
        }

        for action in dropped.iter().rev() {
            self.rollback.notify_reverted(action, cause);
            step.events.push(SyncEvent::RolledBack {
                key: action.key(),
                cause,
            });
        }
        if let Some(target) = promote {
            step.extend(self.promote_held(&target));
        }
        step
    }

    /// Apply a commit to the scene as it stands
    ///
    /// An own landing is taken out of `unwound`, so it is not replayed.
    fn land(&mut self, landing: Landing, unwound: &mut Vec<PendingEntry>) -> Step {
        let mut step = Step::new();
        let (action, sequence, own) = match landing {
            Landing::Nothing => return step,
            Landing::Remote { action, sequence } => (action, sequence, false),
            Landing::Own { key, sequence } => {
                let Some(position) = unwound.iter().position(|e| e.action.key() == key) else {
                    return step;
                };
                (unwound.remove(position).action, sequence, true)
            }
        };

        let target = action.target().clone();
        match action.kind().execute_on_client(&target, &mut self.scene) {
            Ok(_) if own => {}
            Ok(_) => step.events.push(SyncEvent::RemoteApplied {
                action_id: action.id(),
                target: target.clone(),
                sequence,
            }),
            Err(error) => {
                tracing::warn!(client = %self.id, %action, %error, "commit could not be applied to scene");
                step.events.push(SyncEvent::ApplyFailed {
                    target: target.clone(),
                    error,
                });
            }
        }
        if own {
            step.events.push(SyncEvent::Committed {
                key: action.key(),
                sequence,
            });
        }
        if action.uses_versioning() {
            self.mirror.set(target, action.new_version());
        }
        step
    }

    fn compromise(&mut self, err: &SyncError) -> Step {
        tracing::error!(client = %self.id, error = %err, "replica compromised, discarding local state");
        self.discard_local_state();
        self.status = ReplicaStatus::Compromised;

        let mut step = Step::new();
        step.events.push(SyncEvent::ResyncRequired {
            reason: err.to_string(),
        });
        if self.config.auto_resync {
            step.outbound.push(self.join());
        }
        step
    }

    fn discard_local_state(&mut self) {
        self.scene = self.base_scene.clone();
        self.mirror = self.base_versions.clone();
        self.pending.clear();
        self.history.clear();
        self.tracker.reset(0);
    }

    fn gap_step(&self, missing: Vec<u64>) -> Step {
        let mut step = Step::new();
        if missing.is_empty() {
            return step;
        }
        let request: Vec<u64> = missing
            .iter()
            .copied()
            .take(self.config.max_gap_request)
            .collect();
        tracing::debug!(client = %self.id, ?request, "requesting missing commits");
        step.events.push(SyncEvent::GapDetected { missing });
        step.outbound.push(Message::GapRequest { missing: request });
        step
    }
}
