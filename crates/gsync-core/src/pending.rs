//! Actions applied locally but not yet decided by the server
//!
//! Entries are kept in submission order. Per target at most one entry is
//! `Sent`; later actions on the same target wait as `Held` until it is
//! decided, so each is stamped against a committed mirror version. Each
//! entry also remembers its footprint, the objects it touched when applied.

use crate::effect::Undo;
use gsync_action::{Action, ActionKey, ObjectId};
use indexmap::IndexMap;
use std::collections::BTreeSet;

/// Whether the entry has been transmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Applied locally, waiting for the target's in-flight action
    Held,
    /// Transmitted, waiting for commit or reject
    Sent,
}

/// One optimistically applied action
#[derive(Debug)]
pub struct PendingEntry {
    /// The action as stamped and numbered on submit
    pub action: Action,
    /// `None` when the local change cannot be reversed
    pub undo: Option<Undo>,
    /// Whether the action has gone to the server yet
    pub state: PendingState,
    /// Objects touched when it was applied
    pub footprint: BTreeSet<ObjectId>,
}

impl PendingEntry {
    /// Entry for a transmitted action
    #[must_use]
    pub fn sent(action: Action, undo: Option<Undo>) -> Self {
        Self::with_state(action, undo, PendingState::Sent)
    }

    /// Entry for an action waiting behind another on the same target
    #[must_use]
    pub fn held(action: Action, undo: Option<Undo>) -> Self {
        Self::with_state(action, undo, PendingState::Held)
    }

    /// Replace the default footprint (the target alone)
    #[must_use]
    pub fn with_footprint(mut self, footprint: BTreeSet<ObjectId>) -> Self {
        self.footprint = footprint;
        self.footprint.insert(self.action.target().clone());
        self
    }

    fn with_state(action: Action, undo: Option<Undo>, state: PendingState) -> Self {
        Self {
            footprint: BTreeSet::from([action.target().clone()]),
            action,
            undo,
            state,
        }
    }
}

/// Per-client pending set keyed by (requester, network version, target)
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: IndexMap<ActionKey, PendingEntry>,
}

impl PendingSet {
    /// Create empty set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry at the end
    pub fn insert(&mut self, entry: PendingEntry) {
        self.entries.insert(entry.action.key(), entry);
    }

    /// Any entry (held or sent) for `target`
    #[must_use]
    pub fn has_target(&self, target: &ObjectId) -> bool {
        self.entries.keys().any(|k| &k.target == target)
    }

    /// Key of the transmitted entry for `target`
    #[must_use]
    pub fn in_flight(&self, target: &ObjectId) -> Option<&ActionKey> {
        self.entries
            .iter()
            .find(|(k, e)| &k.target == target && e.state == PendingState::Sent)
            .map(|(k, _)| k)
    }

    /// Entry by key
    #[must_use]
    pub fn get(&self, key: &ActionKey) -> Option<&PendingEntry> {
        self.entries.get(key)
    }

    /// Remove a decided entry
    pub fn retire(&mut self, key: &ActionKey) -> Option<PendingEntry> {
        self.entries.shift_remove(key)
    }

    /// Oldest held entry for `target`
    pub fn next_held(&mut self, target: &ObjectId) -> Option<&mut PendingEntry> {
        self.entries
            .iter_mut()
            .find(|(k, e)| &k.target == target && e.state == PendingState::Held)
            .map(|(_, e)| e)
    }

    /// Pending keys in submission order
    pub fn keys(&self) -> impl Iterator<Item = &ActionKey> {
        self.entries.keys()
    }

    /// Entries in submission order
    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.values()
    }

    /// Position of `key` in submission order
    #[must_use]
    pub fn index_of(&self, key: &ActionKey) -> Option<usize> {
        self.entries.get_index_of(key)
    }

    /// Remove the entries at `indices`, oldest first
    pub fn take_indices(&mut self, indices: &BTreeSet<usize>) -> Vec<PendingEntry> {
        self.take_where(|index, _| indices.contains(&index))
    }

    /// Number of pending entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is pending
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything (resync)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn take_where(&mut self, mut pick: impl FnMut(usize, &ActionKey) -> bool) -> Vec<PendingEntry> {
        let mut taken = Vec::new();
        let mut kept = IndexMap::with_capacity(self.entries.len());
        for (index, (key, entry)) in std::mem::take(&mut self.entries).into_iter().enumerate() {
            if pick(index, &key) {
                taken.push(entry);
            } else {
                kept.insert(key, entry);
            }
        }
        self.entries = kept;
        taken
    }
}
