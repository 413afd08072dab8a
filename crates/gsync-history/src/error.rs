//! Ledger errors

use crate::record::RecordId;

/// Errors from local ledger edits
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// A record with this id is already in the ledger
    #[error("record {0} already in ledger")]
    DuplicateRecord(RecordId),

    /// No record with this id
    #[error("record {0} not found")]
    UnknownRecord(RecordId),
}
