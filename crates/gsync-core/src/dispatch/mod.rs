//! Protocol state machines
//!
//! [`ServerDispatcher`] decides commits against the authoritative versions;
//! [`ClientDispatcher`] applies actions optimistically and reconciles with
//! the server's decisions. Both are synchronous: they consume one message
//! and return what to send, leaving I/O to the runtime.

mod client;
mod server;

pub use client::{ClientDispatcher, ReplicaStatus};
pub use server::{ServerDispatcher, ServerStats};

use crate::effect::ApplyError;
use crate::error::RejectReason;
use crate::rollback::RollbackCause;
use crate::wire::Message;
use gsync_action::{ActionId, ActionKey, ClientId, ObjectId, ObjectVersion};

/// Server output for one handled message
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Send to one client
    Unicast { to: ClientId, message: Message },
    /// Send the same message to each listed client
    Broadcast { to: Vec<ClientId>, message: Message },
}

impl Outbound {
    /// The carried message
    #[must_use]
    pub fn message(&self) -> &Message {
        match self {
            Self::Unicast { message, .. } | Self::Broadcast { message, .. } => message,
        }
    }

    /// Whether `client` is addressed
    #[must_use]
    pub fn addresses(&self, client: ClientId) -> bool {
        match self {
            Self::Unicast { to, .. } => *to == client,
            Self::Broadcast { to, .. } => to.contains(&client),
        }
    }
}

/// Client-visible outcome of protocol processing
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Own action committed
    Committed {
        key: ActionKey,
        sequence: Option<u64>,
    },
    /// Own action rejected
    Rejected {
        key: ActionKey,
        reason: RejectReason,
        authoritative: ObjectVersion,
    },
    /// Local change reverted
    RolledBack { key: ActionKey, cause: RollbackCause },
    /// Another client's commit applied locally
    RemoteApplied {
        action_id: ActionId,
        target: ObjectId,
        sequence: Option<u64>,
    },
    /// Commit accepted into the mirror but the scene could not apply it
    ApplyFailed { target: ObjectId, error: ApplyError },
    /// Sequenced commits are missing
    GapDetected { missing: Vec<u64> },
    /// Local replica discarded; rejoin required
    ResyncRequired { reason: String },
    /// Join replay applied
    Joined { head: u64 },
}

/// Client output for one call
#[derive(Debug, Default)]
pub struct Step {
    /// Messages for the server, in order
    pub outbound: Vec<Message>,
    pub events: Vec<SyncEvent>,
}

impl Step {
    /// Empty step
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append another step's output
    pub fn extend(&mut self, other: Step) {
        self.outbound.extend(other.outbound);
        self.events.extend(other.events);
    }

    /// Whether resync was demanded
    #[must_use]
    pub fn requires_resync(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, SyncEvent::ResyncRequired { .. }))
    }
}
