//! Authoritative server side of the protocol

use super::Outbound;
use crate::config::SyncConfig;
use crate::error::RejectReason;
use crate::recovery::CommitLog;
use crate::wire::{Committed, Message, Reject, Welcome};
use gsync_action::{Action, ActionId, ClientId, ObjectVersion};
use gsync_history::{ActionHistory, ApplyOutcome};
use gsync_version::{AuthoritativeVersions, VersionError, VersionStore};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Counters for one server instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Submissions accepted and broadcast
    pub commits: u64,
    /// Submissions refused with a reject to the requester
    pub rejects: u64,
    /// Submissions dropped without a decision (duplicates, empty recipients)
    pub dropped: u64,
    /// Commits sent again in answer to gap requests
    pub resent: u64,
}

/// Bounded memory of decided action ids
#[derive(Debug)]
struct DecidedWindow {
    order: VecDeque<ActionId>,
    set: HashSet<ActionId>,
    capacity: usize,
}

impl DecidedWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &ActionId) -> bool {
        self.set.contains(id)
    }

    fn insert(&mut self, id: ActionId) {
        if !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }
}

/// Server protocol state machine
///
/// Handles one message at a time; callers serialize access.
#[derive(Debug)]
pub struct ServerDispatcher {
    config: SyncConfig,
    versions: AuthoritativeVersions,
    log: CommitLog,
    history: ActionHistory,
    joined: BTreeSet<ClientId>,
    decided: DecidedWindow,
    stats: ServerStats,
}

impl ServerDispatcher {
    /// Create server with empty state
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        Self::with_versions(config, AuthoritativeVersions::new())
    }

    /// Create server over pre-seeded versions
    #[must_use]
    pub fn with_versions(config: SyncConfig, versions: AuthoritativeVersions) -> Self {
        Self {
            history: ActionHistory::with_dedup_window(config.ledger_dedup_window),
            decided: DecidedWindow::new(config.decided_window),
            config,
            versions,
            log: CommitLog::new(),
            joined: BTreeSet::new(),
            stats: ServerStats::default(),
        }
    }

    /// Handle one message from `from`
    pub fn handle(&mut self, from: ClientId, message: Message) -> Vec<Outbound> {
        match message {
            Message::Join => vec![self.handle_join(from)],
            Message::Submit(action) => self.handle_submit(from, action),
            Message::GapRequest { missing } => self.handle_gap_request(from, &missing),
            Message::Ledger(op) => {
                if self.history.apply(&op) == ApplyOutcome::Duplicate {
                    return Vec::new();
                }
                let to: Vec<ClientId> = self.joined.iter().copied().filter(|c| *c != from).collect();
                if to.is_empty() {
                    return Vec::new();
                }
                vec![Outbound::Broadcast {
                    to,
                    message: Message::Ledger(op),
                }]
            }
            other => {
                tracing::warn!(%from, message = other.name(), "unexpected message at server");
                Vec::new()
            }
        }
    }

    /// Forget a disconnected client
    pub fn disconnect(&mut self, client: ClientId) {
        if self.joined.remove(&client) {
            tracing::info!(%client, "client left");
        }
    }

    /// Current head announcement for all joined clients
    #[must_use]
    pub fn head_announcement(&self) -> Option<Outbound> {
        if self.joined.is_empty() {
            return None;
        }
        Some(Outbound::Broadcast {
            to: self.joined.iter().copied().collect(),
            message: Message::Head {
                sequence: self.log.head(),
            },
        })
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Authoritative versions
    #[inline]
    #[must_use]
    pub fn versions(&self) -> &AuthoritativeVersions {
        &self.versions
    }

    /// Server copy of the ledger
    #[inline]
    #[must_use]
    pub fn history(&self) -> &ActionHistory {
        &self.history
    }

    /// Highest assigned sequence number
    #[inline]
    #[must_use]
    pub fn head(&self) -> u64 {
        self.log.head()
    }

    /// Joined clients
    pub fn joined(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.joined.iter().copied()
    }

    /// Counters
    #[inline]
    #[must_use]
    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Authoritative bookkeeping for one action: the version check and bump
    ///
    /// # Errors
    /// `VersionError` if the action is stale or breaks the version policy
    pub fn execute_on_server(&self, action: &Action) -> Result<(), VersionError> {
        if !action.uses_versioning() {
            return Ok(());
        }
        self.versions
            .check_and_commit(action.target(), action.old_version(), action.new_version())
            .map(drop)
    }

    fn handle_join(&mut self, from: ClientId) -> Outbound {
        self.joined.insert(from);
        let head = self.log.head();
        tracing::info!(client = %from, head, "client joined");
        Outbound::Unicast {
            to: from,
            message: Message::Welcome(Welcome {
                head,
                replay: self.log.replay(),
                ledger: self
                    .config
                    .ledger_in_welcome
                    .then(|| self.history.snapshot()),
            }),
        }
    }

    fn handle_gap_request(&mut self, from: ClientId, missing: &[u64]) -> Vec<Outbound> {
        let limit = missing.len().min(self.config.max_gap_request);
        let entries = self.log.resend(&missing[..limit]);
        if entries.is_empty() {
            return Vec::new();
        }
        tracing::debug!(client = %from, count = entries.len(), "resending commits");
        self.stats.resent += entries.len() as u64;
        vec![Outbound::Unicast {
            to: from,
            message: Message::Resend { entries },
        }]
    }

    fn handle_submit(&mut self, from: ClientId, action: Action) -> Vec<Outbound> {
        if action.recipients().is_some_and(<[ClientId]>::is_empty) {
            tracing::debug!(%action, "dropping action with empty recipient list");
            self.stats.dropped += 1;
            return Vec::new();
        }
        if self.decided.contains(&action.id()) {
            tracing::debug!(%action, "duplicate submission ignored");
            self.stats.dropped += 1;
            return Vec::new();
        }
        self.decided.insert(action.id());

        if action.requester() != from {
            tracing::warn!(%from, %action, "requester does not match sender");
            return vec![self.reject(from, &action, RejectReason::Malformed)];
        }
        if let Err(err) = action.kind().validate() {
            tracing::warn!(%action, error = %err, "invalid action payload");
            return vec![self.reject(from, &action, RejectReason::Malformed)];
        }
        if action.expected_new_version() != Some(action.new_version()) {
            tracing::warn!(%action, "new version does not follow the version policy");
            return vec![self.reject(from, &action, RejectReason::Malformed)];
        }

        if let Err(err) = self.execute_on_server(&action) {
            tracing::warn!(%action, error = %err, "rejecting action");
            let reason = RejectReason::from_version_error(&err);
            return vec![self.reject_with(from, &action, reason, err.authoritative())];
        }

        let sequence = action.is_buffered().then(|| self.log.record(action.clone()));
        self.stats.commits += 1;
        tracing::info!(%action, ?sequence, "committed");

        let to: Vec<ClientId> = match action.recipients() {
            None => {
                let mut to: Vec<ClientId> = self.joined.iter().copied().collect();
                if !self.joined.contains(&from) {
                    to.push(from);
                }
                to
            }
            Some(recipients) => {
                let mut to: Vec<ClientId> = recipients.to_vec();
                if !to.contains(&from) {
                    to.push(from);
                }
                to
            }
        };
        vec![Outbound::Broadcast {
            to,
            message: Message::Commit(Committed { sequence, action }),
        }]
    }

    fn reject(&mut self, to: ClientId, action: &Action, reason: RejectReason) -> Outbound {
        let authoritative = self.versions.get(action.target());
        self.reject_with(to, action, reason, authoritative)
    }

    fn reject_with(
        &mut self,
        to: ClientId,
        action: &Action,
        reason: RejectReason,
        object_version: ObjectVersion,
    ) -> Outbound {
        self.stats.rejects += 1;
        Outbound::Unicast {
            to,
            message: Message::Reject(Reject {
                target: action.target().clone(),
                requester: action.requester(),
                network_version: action.network_version(),
                object_version,
                server_id: self.config.server_id,
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsync_action::kind::{Hover, MoveNode, RenameNode};
    use gsync_action::{ActionKind, ObjectId, Vec3};
    use pretty_assertions::assert_eq;

    fn server_with(target: &str, version: i64) -> ServerDispatcher {
        let mut server = ServerDispatcher::with_versions(
            SyncConfig::default(),
            AuthoritativeVersions::with_versions([(
                ObjectId::new(target),
                ObjectVersion::new(version),
            )]),
        );
        for client in [ClientId(1), ClientId(2)] {
            server.handle(client, Message::Join);
        }
        server
    }

    fn move_from(client: u64, old: i64, nv: u64) -> Action {
        let mut action = Action::builder(
            ActionKind::MoveNode(MoveNode {
                position: Vec3::new(client as f32, 0.0, 0.0),
            }),
            "N1",
            ClientId(client),
        )
        .build()
        .unwrap();
        action.assign_network_version(nv);
        action.stamp(ObjectVersion::new(old)).unwrap();
        action
    }

    #[test]
    fn first_committer_wins() {
        let mut server = server_with("N1", 5);
        let a = server.handle(ClientId(1), Message::Submit(move_from(1, 5, 1)));
        let b = server.handle(ClientId(2), Message::Submit(move_from(2, 5, 1)));

        assert!(matches!(
            &a[..],
            [Outbound::Broadcast { message: Message::Commit(Committed { sequence: Some(1), .. }), .. }]
        ));
        match &b[..] {
            [Outbound::Unicast {
                to,
                message: Message::Reject(reject),
            }] => {
                assert_eq!(*to, ClientId(2));
                assert_eq!(reject.object_version, ObjectVersion::new(6));
                assert_eq!(reject.reason, RejectReason::VersionConflict);
                assert_eq!(reject.network_version, 1);
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert_eq!(server.versions().get(&ObjectId::new("N1")), ObjectVersion::new(6));
        assert_eq!(server.stats().commits, 1);
        assert_eq!(server.stats().rejects, 1);
    }

    #[test]
    fn commit_reaches_originator_and_others() {
        let mut server = server_with("N1", 0);
        let out = server.handle(ClientId(1), Message::Submit(move_from(1, 0, 1)));
        assert!(out[0].addresses(ClientId(1)));
        assert!(out[0].addresses(ClientId(2)));
    }

    #[test]
    fn spoofed_requester_is_malformed() {
        let mut server = server_with("N1", 5);
        let out = server.handle(ClientId(2), Message::Submit(move_from(1, 5, 1)));
        match &out[..] {
            [Outbound::Unicast {
                message: Message::Reject(reject),
                ..
            }] => assert_eq!(reject.reason, RejectReason::Malformed),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.versions().get(&ObjectId::new("N1")), ObjectVersion::new(5));
    }

    #[test]
    fn duplicate_submission_is_decided_once() {
        let mut server = server_with("N1", 5);
        let action = move_from(1, 5, 1);
        assert_eq!(server.handle(ClientId(1), Message::Submit(action.clone())).len(), 1);
        assert!(server.handle(ClientId(1), Message::Submit(action)).is_empty());
        assert_eq!(server.head(), 1);
    }

    #[test]
    fn empty_recipients_dropped() {
        let mut server = server_with("N1", 5);
        let mut action = Action::builder(
            ActionKind::RenameNode(RenameNode { name: "x".into() }),
            "N1",
            ClientId(1),
        )
        .with_recipients(Vec::<ClientId>::new())
        .build()
        .unwrap();
        action.stamp(ObjectVersion::new(5)).unwrap();
        assert!(server.handle(ClientId(1), Message::Submit(action)).is_empty());
        assert_eq!(server.stats().dropped, 1);
        assert_eq!(server.versions().get(&ObjectId::new("N1")), ObjectVersion::new(5));
    }

    #[test]
    fn targeted_commit_is_unsequenced() {
        let mut server = server_with("N1", 5);
        let mut action = Action::builder(
            ActionKind::RenameNode(RenameNode { name: "x".into() }),
            "N1",
            ClientId(1),
        )
        .with_recipients([ClientId(2)])
        .build()
        .unwrap();
        action.stamp(ObjectVersion::new(5)).unwrap();
        let out = server.handle(ClientId(1), Message::Submit(action));
        match &out[..] {
            [Outbound::Broadcast {
                to,
                message: Message::Commit(Committed { sequence, .. }),
            }] => {
                assert_eq!(*sequence, None);
                assert_eq!(to, &vec![ClientId(2), ClientId(1)]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.head(), 0);
    }

    #[test]
    fn unversioned_hover_bypasses_version_check() {
        let mut server = server_with("N1", 5);
        let mut hover = Action::builder(ActionKind::Hover(Hover { hovered: true }), "N1", ClientId(1))
            .build()
            .unwrap();
        hover.stamp(ObjectVersion::new(2)).unwrap();
        let out = server.handle(ClientId(1), Message::Submit(hover));
        assert!(matches!(
            &out[..],
            [Outbound::Broadcast { message: Message::Commit(Committed { sequence: None, .. }), .. }]
        ));
        assert_eq!(server.versions().get(&ObjectId::new("N1")), ObjectVersion::new(5));
    }

    #[test]
    fn gap_request_resends_only_known() {
        let mut server = server_with("N1", 0);
        for (nv, old) in [(1, 0), (2, 1), (3, 2)] {
            server.handle(ClientId(1), Message::Submit(move_from(1, old, nv)));
        }
        let out = server.handle(ClientId(2), Message::GapRequest { missing: vec![2, 9] });
        match &out[..] {
            [Outbound::Unicast {
                to,
                message: Message::Resend { entries },
            }] => {
                assert_eq!(*to, ClientId(2));
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].sequence, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.head(), 3);
    }

    #[test]
    fn join_replays_buffered_commits() {
        let mut server = server_with("N1", 0);
        server.handle(ClientId(1), Message::Submit(move_from(1, 0, 1)));
        let out = server.handle(ClientId(3), Message::Join);
        match &out[..] {
            [Outbound::Unicast {
                message: Message::Welcome(welcome),
                ..
            }] => {
                assert_eq!(welcome.head, 1);
                assert_eq!(welcome.replay.len(), 1);
                assert_eq!(welcome.ledger.as_deref(), Some(&[][..]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
