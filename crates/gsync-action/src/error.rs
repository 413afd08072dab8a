//! Action construction and codec errors

use crate::id::{ClientId, ObjectId};
use crate::version::{ObjectVersion, VersionEffect};

/// Errors raised while building or stamping an action
///
/// All of these are caught on the originating client before anything is
/// transmitted.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Target id is empty
    #[error("action targets an empty object id")]
    EmptyTarget,

    /// Payload cannot be replicated as plain values
    #[error("{kind} payload is not replicable: {reason}")]
    NotReplicable {
        /// Kind tag
        kind: &'static str,
        /// What was wrong
        reason: String,
    },

    /// The version policy forbids this transition
    #[error("illegal version transition: {effect:?} from {from}")]
    IllegalTransition {
        /// Version the action was based on
        from: ObjectVersion,
        /// Requested effect
        effect: VersionEffect,
    },

    /// Recipient listed twice
    #[error("recipient {0} listed more than once")]
    DuplicateRecipient(ClientId),

    /// Encoding check failed
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ActionError {
    /// Create not-replicable error
    #[inline]
    #[must_use]
    pub fn not_replicable(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::NotReplicable {
            kind,
            reason: reason.into(),
        }
    }
}

/// Wire encoding/decoding errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// No decoder registered for tag
    #[error("unknown action kind tag: {0}")]
    UnknownTag(String),

    /// Body did not match the decoder for its tag
    #[error("malformed {tag} body: {source}")]
    MalformedBody {
        /// Kind tag
        tag: String,
        /// Underlying JSON error
        #[source]
        source: serde_json::Error,
    },

    /// Envelope-level JSON failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Fragment stream inconsistent
    #[error("bad fragment for packet {packet}: {reason}")]
    BadFragment {
        /// Packet id
        packet: String,
        /// What was wrong
        reason: String,
    },

    /// Decoded action referenced an empty id
    #[error("decoded action has empty target {0:?}")]
    EmptyTarget(ObjectId),
}
