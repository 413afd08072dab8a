//! Error types for gsync Core
//!
//! Covers:
//! - Version conflicts and rejects
//! - Codec and scene application failures
//! - Unrecoverable conflicts that force a resync
//! - Transport and configuration failures

use crate::effect::ApplyError;
use gsync_action::{ActionError, ClientId, CodecError, ObjectId, ObjectVersion};
use gsync_history::HistoryError;
use gsync_version::VersionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Main dispatcher error type
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Target's authoritative version differs from the expected one
    #[error("version conflict on {target}: expected {expected}, authoritative {actual}")]
    VersionConflict {
        target: ObjectId,
        expected: ObjectVersion,
        actual: ObjectVersion,
    },

    /// Target is deleted
    #[error("object {0} is deleted")]
    ObjectDeleted(ObjectId),

    /// Action failed construction-time validation
    #[error("invalid action: {0}")]
    Action(#[from] ActionError),

    /// Wire encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Local scene could not apply or undo an action
    #[error("scene error: {0}")]
    Apply(#[from] ApplyError),

    /// Ledger edit failed
    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// Local replica can no longer be repaired in place
    #[error("unrecoverable conflict on {target}: {reason}")]
    UnrecoverableConflict { target: ObjectId, reason: String },

    /// Submission attempted before the replica is live
    #[error("replica not live ({0})")]
    NotLive(&'static str),

    /// Action requester does not match this client
    #[error("action belongs to {actual}, not {expected}")]
    ForeignAction {
        expected: ClientId,
        actual: ClientId,
    },

    /// Transport failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Check if error is a stale-version conflict (deleted counts)
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::ObjectDeleted(_))
    }

    /// Check if the replica must be discarded and rejoined
    #[inline]
    #[must_use]
    pub fn requires_resync(&self) -> bool {
        matches!(self, Self::UnrecoverableConflict { .. })
    }
}

impl From<VersionError> for SyncError {
    fn from(err: VersionError) -> Self {
        match err {
            VersionError::Conflict {
                target,
                expected,
                actual,
            } => Self::VersionConflict {
                target,
                expected,
                actual,
            },
            VersionError::Deleted { target, .. } => Self::ObjectDeleted(target),
            VersionError::IllegalTransition { target, from, to } => Self::VersionConflict {
                target,
                expected: from,
                actual: to,
            },
        }
    }
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Peer is not connected
    #[error("peer {0} is not connected")]
    UnknownPeer(ClientId),

    /// Channel closed
    #[error("channel closed")]
    Closed,
}

/// Why the server refused an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Stale `old_version`
    VersionConflict,
    /// Target deleted
    ObjectDeleted,
    /// Action failed server-side validation
    Malformed,
}

impl RejectReason {
    /// Classify a version-store refusal
    #[must_use]
    pub fn from_version_error(err: &VersionError) -> Self {
        match err {
            VersionError::Conflict { .. } => Self::VersionConflict,
            VersionError::Deleted { .. } => Self::ObjectDeleted,
            VersionError::IllegalTransition { .. } => Self::Malformed,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VersionConflict => "version conflict",
            Self::ObjectDeleted => "object deleted",
            Self::Malformed => "malformed",
        })
    }
}

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, SyncError>;
