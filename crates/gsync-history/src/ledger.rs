//! The per-replica action ledger
//!
//! Local edits validate, apply and hand back the [`LedgerOp`] to broadcast.
//! Remote ops are applied with [`ActionHistory::apply`], which is
//! idempotent under at-least-once delivery: op ids seen within the dedup
//! window are skipped, a push of a record id already present is a no-op,
//! and deletes/replaces that find nothing are no-ops.

use crate::error::HistoryError;
use crate::record::{ActionRecord, LedgerOp, OpId, RecordId, RecordKind};
use gsync_action::ClientId;
use std::collections::{HashSet, VecDeque};

/// Default number of remembered op ids
pub const DEFAULT_DEDUP_WINDOW: usize = 1024;

/// What applying a remote op did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Ledger changed
    Applied,
    /// Op id already seen
    Duplicate,
    /// Nothing matched (or record already present)
    NoOp,
}

/// Bounded set of recently seen op ids
#[derive(Debug, Clone)]
struct SeenOps {
    order: VecDeque<OpId>,
    set: HashSet<OpId>,
    capacity: usize,
}

impl SeenOps {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(DEFAULT_DEDUP_WINDOW)),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if already seen
    fn insert(&mut self, op_id: OpId) -> bool {
        if !self.set.insert(op_id) {
            return false;
        }
        self.order.push_back(op_id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }
}

/// Ordered, replicated undo/redo ledger
#[derive(Debug, Clone)]
pub struct ActionHistory {
    records: Vec<ActionRecord>,
    seen: SeenOps,
}

impl Default for ActionHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionHistory {
    /// Create empty ledger with the default dedup window
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_dedup_window(DEFAULT_DEDUP_WINDOW)
    }

    /// Create empty ledger remembering `window` op ids
    #[must_use]
    pub fn with_dedup_window(window: usize) -> Self {
        Self {
            records: Vec::new(),
            seen: SeenOps::new(window),
        }
    }

    /// Append a record; returns the op to broadcast
    ///
    /// # Errors
    /// `HistoryError::DuplicateRecord` if the record id is already present
    pub fn push(&mut self, record: ActionRecord) -> Result<LedgerOp, HistoryError> {
        if self.position(record.record_id).is_some() {
            return Err(HistoryError::DuplicateRecord(record.record_id));
        }
        let op = LedgerOp::Push {
            op_id: OpId::new(),
            record: record.clone(),
        };
        self.seen.insert(op.op_id());
        self.records.push(record);
        Ok(op)
    }

    /// Remove a record by id; returns the op to broadcast
    ///
    /// # Errors
    /// `HistoryError::UnknownRecord` if no record has this id
    pub fn delete(&mut self, record_id: RecordId) -> Result<LedgerOp, HistoryError> {
        let index = self
            .position(record_id)
            .ok_or(HistoryError::UnknownRecord(record_id))?;
        self.records.remove(index);
        let op = LedgerOp::Delete {
            op_id: OpId::new(),
            record_id,
        };
        self.seen.insert(op.op_id());
        Ok(op)
    }

    /// Substitute `new` for the entry exactly equal to `old`
    ///
    /// Returns `None` and leaves the ledger untouched if no entry matches.
    pub fn replace(&mut self, old: &ActionRecord, new: ActionRecord) -> Option<LedgerOp> {
        let Some(index) = self.records.iter().position(|r| r == old) else {
            tracing::debug!(record = %old.record_id, "ledger replace found no exact match");
            return None;
        };
        self.records[index] = new.clone();
        let op = LedgerOp::Replace {
            op_id: OpId::new(),
            old: old.clone(),
            new,
        };
        self.seen.insert(op.op_id());
        Some(op)
    }

    /// Apply an op received from another replica
    pub fn apply(&mut self, op: &LedgerOp) -> ApplyOutcome {
        if !self.seen.insert(op.op_id()) {
            tracing::debug!(op = %op.op_id(), kind = op.name(), "duplicate ledger op skipped");
            return ApplyOutcome::Duplicate;
        }
        match op {
            LedgerOp::Push { record, .. } => {
                if self.position(record.record_id).is_some() {
                    return ApplyOutcome::NoOp;
                }
                self.records.push(record.clone());
                ApplyOutcome::Applied
            }
            LedgerOp::Delete { record_id, .. } => match self.position(*record_id) {
                Some(index) => {
                    self.records.remove(index);
                    ApplyOutcome::Applied
                }
                None => ApplyOutcome::NoOp,
            },
            LedgerOp::Replace { old, new, .. } => {
                match self.records.iter().position(|r| r == old) {
                    Some(index) => {
                        self.records[index] = new.clone();
                        ApplyOutcome::Applied
                    }
                    None => {
                        tracing::debug!(record = %old.record_id, "remote replace found no exact match");
                        ApplyOutcome::NoOp
                    }
                }
            }
        }
    }

    /// Records in ledger order
    #[inline]
    #[must_use]
    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    /// Record by id
    #[must_use]
    pub fn get(&self, record_id: RecordId) -> Option<&ActionRecord> {
        self.records.iter().find(|r| r.record_id == record_id)
    }

    /// Owned copy for join replay
    #[must_use]
    pub fn snapshot(&self) -> Vec<ActionRecord> {
        self.records.clone()
    }

    /// Replace the whole ledger with a snapshot
    pub fn restore(&mut self, records: Vec<ActionRecord>) {
        self.records = records;
    }

    /// Drop all records and remembered op ids
    pub fn clear(&mut self) {
        self.records.clear();
        self.seen.clear();
    }

    /// Number of records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if ledger is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent record of `kind` owned by `owner`
    #[must_use]
    pub fn last_of_owner(&self, owner: ClientId, kind: RecordKind) -> Option<&ActionRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.owner == owner && r.kind == kind)
    }

    /// Whether a later record by another owner touched the same objects
    ///
    /// Undoing or redoing such a record would overwrite someone else's
    /// work. Unknown ids report no conflict.
    #[must_use]
    pub fn has_conflicts(&self, record_id: RecordId) -> bool {
        let Some(index) = self.position(record_id) else {
            return false;
        };
        let record = &self.records[index];
        self.records[index + 1..]
            .iter()
            .any(|later| later.owner != record.owner && later.overlaps(record))
    }

    /// Drop every undone record of `owner`; returns the ops to broadcast
    pub fn clear_redos(&mut self, owner: ClientId) -> Vec<LedgerOp> {
        let redo_ids: Vec<RecordId> = self
            .records
            .iter()
            .filter(|r| r.owner == owner && r.kind == RecordKind::Undone)
            .map(|r| r.record_id)
            .collect();
        redo_ids
            .into_iter()
            .filter_map(|id| self.delete(id).ok())
            .collect()
    }

    fn position(&self, record_id: RecordId) -> Option<usize> {
        self.records.iter().position(|r| r.record_id == record_id)
    }
}
