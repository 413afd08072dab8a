//! The replicated action envelope
//!
//! An [`Action`] is a kind payload plus the routing and concurrency fields
//! the dispatcher needs. Actions are built once by the requesting client,
//! stamped against its version mirror and then consumed by the dispatcher.

use crate::error::{ActionError, CodecError};
use crate::id::{ActionId, ClientId, ObjectId};
use crate::kind::ActionKind;
use crate::version::ObjectVersion;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Key matching a server decision to a pending action
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey {
    pub requester: ClientId,
    pub network_version: u64,
    pub target: ObjectId,
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.requester, self.network_version, self.target)
    }
}

/// One intended replicated mutation
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    id: ActionId,
    kind: ActionKind,
    target: ObjectId,
    requester: ClientId,
    recipients: Option<Vec<ClientId>>,
    old_version: ObjectVersion,
    new_version: ObjectVersion,
    network_version: u64,
    uses_versioning: bool,
    transient: bool,
}

impl Action {
    /// Start building an action of `kind` on `target`
    #[inline]
    #[must_use]
    pub fn builder(
        kind: ActionKind,
        target: impl Into<ObjectId>,
        requester: ClientId,
    ) -> ActionBuilder {
        ActionBuilder::new(kind, target.into(), requester)
    }

    /// Unique id
    #[inline]
    #[must_use]
    pub fn id(&self) -> ActionId {
        self.id
    }

    /// Payload
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    /// Target object
    #[inline]
    #[must_use]
    pub fn target(&self) -> &ObjectId {
        &self.target
    }

    /// Requesting client
    #[inline]
    #[must_use]
    pub fn requester(&self) -> ClientId {
        self.requester
    }

    /// Explicit recipients; `None` means broadcast
    #[inline]
    #[must_use]
    pub fn recipients(&self) -> Option<&[ClientId]> {
        self.recipients.as_deref()
    }

    /// Version the action was based on
    #[inline]
    #[must_use]
    pub fn old_version(&self) -> ObjectVersion {
        self.old_version
    }

    /// Version after commit
    #[inline]
    #[must_use]
    pub fn new_version(&self) -> ObjectVersion {
        self.new_version
    }

    /// Requester-local submission counter
    #[inline]
    #[must_use]
    pub fn network_version(&self) -> u64 {
        self.network_version
    }

    /// Whether the server checks `old_version`
    ///
    /// Targeted and transient actions never do: they are not replayed, so
    /// some clients could never learn the resulting version.
    #[inline]
    #[must_use]
    pub fn uses_versioning(&self) -> bool {
        self.uses_versioning
    }

    /// Ephemeral: excluded from join replay and gap recovery
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Kept in the server commit log and assigned a sequence
    #[inline]
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        !self.transient && self.recipients.is_none()
    }

    /// Pending-set key
    #[must_use]
    pub fn key(&self) -> ActionKey {
        ActionKey {
            requester: self.requester,
            network_version: self.network_version,
            target: self.target.clone(),
        }
    }

    /// Assign the requester-local submission counter
    #[inline]
    pub fn assign_network_version(&mut self, network_version: u64) {
        self.network_version = network_version;
    }

    /// Stamp against the requester's mirror version
    ///
    /// Unversioned actions keep `new_version == old_version`.
    ///
    /// # Errors
    /// `ActionError::IllegalTransition` if the kind's version effect is not
    /// allowed from `old` (e.g. moving a deleted node)
    pub fn stamp(&mut self, old: ObjectVersion) -> Result<(), ActionError> {
        let new = if self.uses_versioning {
            let effect = self.kind.version_effect();
            old.apply(effect)
                .ok_or(ActionError::IllegalTransition { from: old, effect })?
        } else {
            old
        };
        self.old_version = old;
        self.new_version = new;
        Ok(())
    }

    /// Version the server must commit for this action, given `old_version`
    #[must_use]
    pub fn expected_new_version(&self) -> Option<ObjectVersion> {
        if self.uses_versioning {
            self.old_version.apply(self.kind.version_effect())
        } else {
            Some(self.old_version)
        }
    }

    /// Wire form
    ///
    /// # Errors
    /// Body serialization failure
    pub fn to_wire(&self) -> Result<WireAction, CodecError> {
        Ok(WireAction {
            id: self.id,
            kind: self.kind.tag().to_string(),
            body: self.kind.body()?,
            target: self.target.clone(),
            requester: self.requester,
            recipients: self.recipients.clone(),
            old_version: self.old_version,
            new_version: self.new_version,
            network_version: self.network_version,
            transient: self.transient,
        })
    }

    /// Rebuild from a wire record whose body has already been decoded
    pub(crate) fn from_wire_parts(wire: WireAction, kind: ActionKind) -> Result<Self, CodecError> {
        if wire.target.is_empty() {
            return Err(CodecError::EmptyTarget(wire.target));
        }
        let transient = wire.transient || kind.is_transient();
        Ok(Self {
            id: wire.id,
            uses_versioning: kind.uses_versioning() && wire.recipients.is_none() && !transient,
            transient,
            kind,
            target: wire.target,
            requester: wire.requester,
            recipients: wire.recipients,
            old_version: wire.old_version,
            new_version: wire.new_version,
            network_version: wire.network_version,
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) by {} nv={} {}->{}",
            self.kind.tag(),
            self.target,
            self.requester,
            self.network_version,
            self.old_version,
            self.new_version
        )
    }
}

/// Builder validating an action before it can be transmitted
#[derive(Debug, Clone)]
pub struct ActionBuilder {
    kind: ActionKind,
    target: ObjectId,
    requester: ClientId,
    recipients: Option<Vec<ClientId>>,
    transient: bool,
}

impl ActionBuilder {
    fn new(kind: ActionKind, target: ObjectId, requester: ClientId) -> Self {
        let transient = kind.is_transient();
        Self {
            kind,
            target,
            requester,
            recipients: None,
            transient,
        }
    }

    /// Deliver only to these clients (plus the requester's echo)
    #[must_use]
    pub fn with_recipients(mut self, recipients: impl IntoIterator<Item = ClientId>) -> Self {
        self.recipients = Some(recipients.into_iter().collect());
        self
    }

    /// Mark as transient
    #[must_use]
    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient || self.kind.is_transient();
        self
    }

    /// Validate and build
    ///
    /// # Errors
    /// - `ActionError::EmptyTarget` for a blank target id
    /// - `ActionError::NotReplicable` for payloads that cannot be replicated
    /// - `ActionError::DuplicateRecipient` if a recipient repeats
    /// - `ActionError::Codec` if the body fails to encode
    pub fn build(self) -> Result<Action, ActionError> {
        if self.target.is_empty() {
            return Err(ActionError::EmptyTarget);
        }
        self.kind.validate()?;
        if let Some(recipients) = &self.recipients {
            let mut seen = HashSet::with_capacity(recipients.len());
            if let Some(dup) = recipients.iter().find(|r| !seen.insert(**r)) {
                return Err(ActionError::DuplicateRecipient(*dup));
            }
        }
        // Encode check before anything leaves the client
        self.kind.body()?;

        Ok(Action {
            id: ActionId::new(),
            uses_versioning: self.kind.uses_versioning()
                && self.recipients.is_none()
                && !self.transient,
            kind: self.kind,
            target: self.target,
            requester: self.requester,
            recipients: self.recipients,
            old_version: ObjectVersion::ABSENT,
            new_version: ObjectVersion::ABSENT,
            network_version: 0,
            transient: self.transient,
        })
    }
}

/// Serialized action record: kind tag, body and concurrency fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAction {
    pub id: ActionId,
    pub kind: String,
    pub body: serde_json::Value,
    pub target: ObjectId,
    pub requester: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<ClientId>>,
    pub old_version: ObjectVersion,
    pub new_version: ObjectVersion,
    pub network_version: u64,
    #[serde(default)]
    pub transient: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{DeleteNode, Hover, MoveNode, NodeSnapshot, RenameNode, ReviveNode, Vec3};
    use pretty_assertions::assert_eq;

    fn move_to(x: f32) -> ActionKind {
        ActionKind::MoveNode(MoveNode {
            position: Vec3::new(x, 0.0, 0.0),
        })
    }

    #[test]
    fn stamp_bumps_alive_object() {
        let mut action = Action::builder(move_to(1.0), "N1", ClientId(1)).build().unwrap();
        action.stamp(ObjectVersion::new(5)).unwrap();
        assert_eq!(action.old_version(), ObjectVersion::new(5));
        assert_eq!(action.new_version(), ObjectVersion::new(6));
    }

    #[test]
    fn stamp_delete_sets_tombstone() {
        let mut action = Action::builder(ActionKind::DeleteNode(DeleteNode {}), "N2", ClientId(1))
            .build()
            .unwrap();
        action.stamp(ObjectVersion::new(5)).unwrap();
        assert_eq!(action.new_version(), ObjectVersion::DELETED);
    }

    #[test]
    fn stamp_revive_resets_to_one() {
        let kind = ActionKind::ReviveNode(ReviveNode {
            node: NodeSnapshot::new("Class", "Foo", Vec3::ZERO),
        });
        let mut action = Action::builder(kind, "N2", ClientId(1)).build().unwrap();
        action.stamp(ObjectVersion::DELETED).unwrap();
        assert_eq!(action.new_version(), ObjectVersion::REVIVED);
    }

    #[test]
    fn stamp_rejects_move_of_deleted_node() {
        let mut action = Action::builder(move_to(1.0), "N1", ClientId(1)).build().unwrap();
        let err = action.stamp(ObjectVersion::DELETED).unwrap_err();
        assert!(matches!(err, ActionError::IllegalTransition { .. }));
        assert_eq!(action.new_version(), ObjectVersion::ABSENT);
    }

    #[test]
    fn unversioned_stamp_keeps_version() {
        let kind = ActionKind::Hover(Hover { hovered: true });
        let mut action = Action::builder(kind, "N1", ClientId(2)).build().unwrap();
        action.stamp(ObjectVersion::new(4)).unwrap();
        assert_eq!(action.new_version(), ObjectVersion::new(4));
        assert!(action.is_transient());
        assert!(!action.is_buffered());
    }

    #[test]
    fn empty_target_fails_at_construction() {
        let err = Action::builder(move_to(1.0), "  ", ClientId(1)).build().unwrap_err();
        assert!(matches!(err, ActionError::EmptyTarget));
    }

    #[test]
    fn non_finite_payload_fails_at_construction() {
        let err = Action::builder(move_to(f32::INFINITY), "N1", ClientId(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ActionError::NotReplicable { .. }));
    }

    #[test]
    fn duplicate_recipient_fails_at_construction() {
        let kind = ActionKind::RenameNode(RenameNode {
            name: "x".to_string(),
        });
        let err = Action::builder(kind, "N1", ClientId(1))
            .with_recipients([ClientId(2), ClientId(2)])
            .build()
            .unwrap_err();
        assert!(matches!(err, ActionError::DuplicateRecipient(ClientId(2))));
    }

    #[test]
    fn targeted_action_is_not_buffered() {
        let action = Action::builder(move_to(1.0), "N1", ClientId(1))
            .with_recipients([ClientId(2)])
            .build()
            .unwrap();
        assert!(!action.is_buffered());
        assert!(!action.uses_versioning());
        assert_eq!(action.recipients(), Some(&[ClientId(2)][..]));
    }

    #[test]
    fn key_matches_reject_fields() {
        let mut action = Action::builder(move_to(1.0), "N1", ClientId(7)).build().unwrap();
        action.assign_network_version(12);
        assert_eq!(
            action.key(),
            ActionKey {
                requester: ClientId(7),
                network_version: 12,
                target: ObjectId::new("N1"),
            }
        );
    }
}
