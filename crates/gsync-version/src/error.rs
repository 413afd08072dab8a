//! Version check errors

use gsync_action::{ObjectId, ObjectVersion};

/// Why the authoritative store refused a commit
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    /// Expected version is stale
    #[error("version conflict on {target}: expected {expected}, authoritative {actual}")]
    Conflict {
        target: ObjectId,
        expected: ObjectVersion,
        actual: ObjectVersion,
    },

    /// Target is tombstoned and the action is not a revive
    #[error("object {target} is deleted (expected {expected})")]
    Deleted {
        target: ObjectId,
        expected: ObjectVersion,
    },

    /// Proposed version does not follow the version policy
    #[error("illegal version transition on {target}: {from} -> {to}")]
    IllegalTransition {
        target: ObjectId,
        from: ObjectVersion,
        to: ObjectVersion,
    },
}

impl VersionError {
    /// Authoritative version at the time of the refusal
    #[must_use]
    pub fn authoritative(&self) -> ObjectVersion {
        match self {
            Self::Conflict { actual, .. } => *actual,
            Self::Deleted { .. } => ObjectVersion::DELETED,
            Self::IllegalTransition { from, .. } => *from,
        }
    }

    /// Whether the refusal is a stale-version conflict (deleted counts)
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Deleted { .. })
    }
}
