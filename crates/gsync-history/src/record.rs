//! Ledger entries and replicable ledger operations

use gsync_action::{ActionId, ClientId, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use ulid::Ulid;

/// Ledger record id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Ulid);

impl RecordId {
    /// Generate new record ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec-{}", self.0)
    }
}

/// Id of one replicated ledger operation (dedup key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub Ulid);

impl OpId {
    /// Generate new op ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Whether the recorded action is currently done or undone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Done,
    Undone,
}

/// One ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub record_id: RecordId,
    pub kind: RecordKind,
    pub action_id: ActionId,
    /// Client that performed the action
    pub owner: ClientId,
    pub changed_objects: BTreeSet<ObjectId>,
}

impl ActionRecord {
    /// Record a freshly performed action
    #[must_use]
    pub fn done(
        action_id: ActionId,
        owner: ClientId,
        changed_objects: impl IntoIterator<Item = ObjectId>,
    ) -> Self {
        Self {
            record_id: RecordId::new(),
            kind: RecordKind::Done,
            action_id,
            owner,
            changed_objects: changed_objects.into_iter().collect(),
        }
    }

    /// Same entry flipped to `Undone`
    #[must_use]
    pub fn undone(&self) -> Self {
        Self {
            kind: RecordKind::Undone,
            ..self.clone()
        }
    }

    /// Same entry flipped back to `Done`
    #[must_use]
    pub fn redone(&self) -> Self {
        Self {
            kind: RecordKind::Done,
            ..self.clone()
        }
    }

    /// Whether both records changed at least one common object
    #[must_use]
    pub fn overlaps(&self, other: &ActionRecord) -> bool {
        !self.changed_objects.is_disjoint(&other.changed_objects)
    }
}

/// Replicable ledger edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    Push {
        op_id: OpId,
        record: ActionRecord,
    },
    Delete {
        op_id: OpId,
        record_id: RecordId,
    },
    Replace {
        op_id: OpId,
        old: ActionRecord,
        new: ActionRecord,
    },
}

impl LedgerOp {
    /// Dedup key
    #[inline]
    #[must_use]
    pub fn op_id(&self) -> OpId {
        match self {
            Self::Push { op_id, .. } | Self::Delete { op_id, .. } | Self::Replace { op_id, .. } => {
                *op_id
            }
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Push { .. } => "push",
            Self::Delete { .. } => "delete",
            Self::Replace { .. } => "replace",
        }
    }
}
