//! gsync Action History
//!
//! A replicated, ordered ledger of past actions used to show undo/redo
//! state across clients. The ledger never takes part in version-based
//! conflict resolution.
//!
//! # Core Concepts
//!
//! - [`ActionRecord`]: one ledger entry (done or undone action, its owner
//!   and the objects it changed)
//! - [`LedgerOp`]: a replicable push/delete/replace carrying an [`OpId`]
//! - [`ActionHistory`]: the per-replica ledger; local edits return the op
//!   to broadcast, remote ops go through [`ActionHistory::apply`]

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod error;
mod ledger;
mod record;

pub use error::HistoryError;
pub use ledger::{ActionHistory, ApplyOutcome, DEFAULT_DEDUP_WINDOW};
pub use record::{ActionRecord, LedgerOp, OpId, RecordId, RecordKind};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
