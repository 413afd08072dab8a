//! Rollback of optimistically applied actions
//!
//! [`RollbackController`] undoes pending entries youngest first. A missing
//! or failing undo stops the rollback and marks the replica compromised;
//! no partial repair is attempted past that point.

use crate::error::{RejectReason, SyncError};
use crate::pending::PendingEntry;
use crate::scene::Scene;
use chrono::{DateTime, Utc};
use gsync_action::{Action, ActionKey};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    /// A local change was reverted
    Warning,
    /// The replica must reconnect before continuing
    BlockingError,
}

/// User-facing message about a rollback or resync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// How urgently the user must act
    pub level: NotificationLevel,
    /// Action kind category, e.g. "Move"
    pub category: String,
    /// Text shown to the user
    pub message: String,
    /// When the notification was raised
    pub at: DateTime<Utc>,
}

/// Presentation-layer consumer of notifications
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification
    fn notify(&self, notification: Notification);
}

/// Sink that logs through `tracing` and keeps a copy
#[derive(Debug, Default)]
pub struct NotificationLog {
    entries: Mutex<Vec<Notification>>,
}

impl NotificationLog {
    /// Create empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications so far
    #[must_use]
    pub fn entries(&self) -> Vec<Notification> {
        self.entries.lock().clone()
    }

    /// Number of blocking errors so far
    #[must_use]
    pub fn blocking_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|n| n.level == NotificationLevel::BlockingError)
            .count()
    }
}

impl NotificationSink for NotificationLog {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Warning => {
                tracing::warn!(category = %notification.category, "{}", notification.message);
            }
            NotificationLevel::BlockingError => {
                tracing::error!(category = %notification.category, "{}", notification.message);
            }
        }
        self.entries.lock().push(notification);
    }
}

/// Why pending entries are being rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackCause {
    /// Server rejected the in-flight action
    Rejected(RejectReason),
    /// Another client's commit on the same target arrived first
    Superseded,
    /// A held action could not be stamped after its predecessor committed
    Withdrawn,
}

impl fmt::Display for RollbackCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected by server ({reason})"),
            Self::Superseded => f.write_str("superseded by a concurrent change"),
            Self::Withdrawn => f.write_str("no longer applicable"),
        }
    }
}

/// Result of one rollback run
#[derive(Debug, Default)]
pub struct RollbackOutcome {
    /// Entries reverted, in undo order
    pub reverted: Vec<ActionKey>,
    /// Set when the replica can no longer be repaired in place
    pub compromised: Option<SyncError>,
}

impl RollbackOutcome {
    /// Whether every entry was reverted
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.compromised.is_none()
    }
}

/// Undoes rejected or superseded local changes
#[derive(Clone)]
pub struct RollbackController {
    sink: Arc<dyn NotificationSink>,
}

impl fmt::Debug for RollbackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackController").finish_non_exhaustive()
    }
}

impl RollbackController {
    /// Create controller reporting to `sink`
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Undo `entries` (given oldest first) in reverse order
    pub fn roll_back(
        &self,
        entries: Vec<PendingEntry>,
        scene: &mut dyn Scene,
        cause: RollbackCause,
    ) -> RollbackOutcome {
        let mut outcome = RollbackOutcome::default();

        for mut entry in entries.into_iter().rev() {
            if let Err(err) = self.undo_entry(&mut entry, scene) {
                outcome.compromised = Some(err);
                return outcome;
            }
            self.notify_reverted(&entry.action, cause);
            outcome.reverted.push(entry.action.key());
        }
        outcome
    }

    /// Run the undo of one entry, leaving the rest of it intact
    ///
    /// # Errors
    /// `SyncError::UnrecoverableConflict` when the entry has no undo or the
    /// undo fails; the blocking error has already been raised
    pub fn undo_entry(&self, entry: &mut PendingEntry, scene: &mut dyn Scene) -> Result<(), SyncError> {
        let category = entry.action.kind().category();
        let target = entry.action.target().clone();

        let Some(undo) = entry.undo.take() else {
            self.escalate(category, &format!("{category} of {target} cannot be undone"));
            return Err(SyncError::UnrecoverableConflict {
                target,
                reason: "no undo available".to_string(),
            });
        };

        undo.run(scene).map_err(|err| {
            tracing::error!(%target, error = %err, "undo failed");
            self.escalate(category, &format!("{category} of {target} could not be undone: {err}"));
            SyncError::UnrecoverableConflict {
                target,
                reason: err.to_string(),
            }
        })
    }

    /// Tell the user a local change is gone for good
    pub fn notify_reverted(&self, action: &Action, cause: RollbackCause) {
        let category = action.kind().category();
        self.sink.notify(Notification {
            level: NotificationLevel::Warning,
            category: category.to_string(),
            message: format!("{category} of {} was reverted: {cause}", action.target()),
            at: Utc::now(),
        });
    }

    /// Raise the blocking error that accompanies a discarded replica
    pub(crate) fn escalate(&self, category: &str, detail: &str) {
        self.sink.notify(Notification {
            level: NotificationLevel::BlockingError,
            category: category.to_string(),
            message: format!("{detail}; local state discarded, reconnect required"),
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::ClientEffect;
    use crate::scene::GraphScene;
    use gsync_action::kind::{DeleteNode, MoveNode, RenameNode};
    use gsync_action::{ActionKind, ClientId, NodeSnapshot, ObjectId, Vec3};
    use pretty_assertions::assert_eq;

    fn apply(scene: &mut GraphScene, kind: ActionKind, target: &str, nv: u64) -> PendingEntry {
        let mut action = Action::builder(kind, target, ClientId(1)).build().unwrap();
        action.assign_network_version(nv);
        let undo = action
            .kind()
            .execute_on_client(action.target(), scene)
            .unwrap();
        PendingEntry::sent(action, undo)
    }

    fn scene() -> GraphScene {
        GraphScene::new().with_node("N1", NodeSnapshot::new("Class", "Foo", Vec3::ZERO))
    }

    #[test]
    fn youngest_first_restores_original() {
        let mut scene = scene();
        let before = scene.clone();
        let first = apply(
            &mut scene,
            ActionKind::MoveNode(MoveNode {
                position: Vec3::ONE,
            }),
            "N1",
            1,
        );
        let second = apply(
            &mut scene,
            ActionKind::MoveNode(MoveNode {
                position: Vec3::new(9.0, 9.0, 9.0),
            }),
            "N1",
            2,
        );

        let log = Arc::new(NotificationLog::new());
        let controller = RollbackController::new(log.clone());
        let outcome = controller.roll_back(
            vec![first, second],
            &mut scene,
            RollbackCause::Rejected(RejectReason::VersionConflict),
        );

        assert!(outcome.is_clean());
        assert_eq!(
            outcome.reverted.iter().map(|k| k.network_version).collect::<Vec<_>>(),
            vec![2, 1]
        );
        assert_eq!(scene, before);
        let notes = log.entries();
        assert_eq!(notes.len(), 2);
        assert!(notes.iter().all(|n| n.level == NotificationLevel::Warning));
        assert_eq!(notes[0].category, "Move");
    }

    #[test]
    fn missing_undo_compromises_replica() {
        let mut scene = scene();
        let entry = PendingEntry::sent(
            Action::builder(ActionKind::DeleteNode(DeleteNode {}), "N1", ClientId(1))
                .build()
                .unwrap(),
            None,
        );
        let log = Arc::new(NotificationLog::new());
        let outcome = RollbackController::new(log.clone()).roll_back(
            vec![entry],
            &mut scene,
            RollbackCause::Superseded,
        );
        assert!(matches!(
            outcome.compromised,
            Some(SyncError::UnrecoverableConflict { .. })
        ));
        assert_eq!(log.blocking_count(), 1);
    }

    #[test]
    fn failing_undo_stops_rollback() {
        let mut scene = scene();
        let rename = apply(
            &mut scene,
            ActionKind::RenameNode(RenameNode { name: "Bar".into() }),
            "N1",
            1,
        );
        // Node vanished underneath the pending rename
        scene.remove_node(&ObjectId::new("N1"));

        let log = Arc::new(NotificationLog::new());
        let outcome = RollbackController::new(log.clone()).roll_back(
            vec![rename],
            &mut scene,
            RollbackCause::Rejected(RejectReason::ObjectDeleted),
        );
        assert!(!outcome.is_clean());
        assert!(outcome.reverted.is_empty());
        assert_eq!(log.blocking_count(), 1);
    }

    #[test]
    fn undo_entry_keeps_action_for_replay() {
        let mut scene = scene();
        let before = scene.clone();
        let mut entry = apply(
            &mut scene,
            ActionKind::MoveNode(MoveNode {
                position: Vec3::ONE,
            }),
            "N1",
            4,
        );

        let log = Arc::new(NotificationLog::new());
        RollbackController::new(log.clone())
            .undo_entry(&mut entry, &mut scene)
            .unwrap();
        assert_eq!(scene, before);
        assert!(entry.undo.is_none());
        assert_eq!(entry.action.network_version(), 4);
        // Nothing reported until the entry is known to be gone
        assert!(log.entries().is_empty());
    }
}
