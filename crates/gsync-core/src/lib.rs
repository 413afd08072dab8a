//! gsync Core
//!
//! Optimistic replication of a shared graph between one authoritative
//! server and many clients.
//!
//! # Core Concepts
//!
//! - [`ClientDispatcher`]: applies local actions at once, sends them to the
//!   server and reconciles commits and rejects
//! - [`ServerDispatcher`]: decides each submission against the
//!   authoritative versions (first committer wins) and fans commits out
//! - [`RollbackController`]: reverts rejected optimistic changes or
//!   escalates to a full resync
//! - [`CommitLog`] / [`SequenceTracker`]: sequence numbers, join replay and
//!   gap recovery
//! - [`WireCodec`]: JSON envelopes and packet fragmentation
//!
//! # Example
//!
//! ```rust,ignore
//! use gsync_core::{Cluster, SyncConfig, GraphScene};
//!
//! let mut cluster = Cluster::new(SyncConfig::default(), GraphScene::new(), []);
//! cluster.connect_all(2)?;
//! cluster.submit(action)?;
//! cluster.pump();
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod config;
mod effect;
mod error;
mod pending;
mod periodic;
mod recovery;
mod rollback;
mod runtime;
mod scene;
mod transport;
mod wire;

/// Client and server state machines
pub mod dispatch;

/// In-memory cluster and simulator
pub mod harness;

pub use config::{SyncConfig, MIN_PACKET_SIZE};
pub use dispatch::{
    ClientDispatcher, Outbound, ReplicaStatus, ServerDispatcher, ServerStats, Step, SyncEvent,
};
pub use effect::{ApplyError, ClientEffect, Undo};
pub use error::{RejectReason, Result, SyncError, TransportError};
pub use harness::{base_graph, run_simulator, Cluster, SimulatorConfig, SimulatorReport};
pub use pending::{PendingEntry, PendingSet, PendingState};
pub use periodic::PeriodicTask;
pub use recovery::{CommitLog, Offer, SequenceTracker};
pub use rollback::{
    Notification, NotificationLevel, NotificationLog, NotificationSink, RollbackCause,
    RollbackController, RollbackOutcome,
};
pub use runtime::{ClientRuntime, ServerRuntime};
pub use scene::{GraphScene, Scene};
pub use transport::{Envelope, LocalHub, Transport};
pub use wire::{
    split_packets, Committed, Message, Packet, Reassembler, Reject, Welcome, WireCodec,
    FRAGMENT_OVERHEAD,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
