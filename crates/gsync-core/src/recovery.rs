//! Gap detection and redelivery of sequenced commits
//!
//! The server numbers every buffered commit (`1, 2, ...`) and keeps it in
//! a [`CommitLog`]. Clients feed incoming numbers through a
//! [`SequenceTracker`], which releases commits strictly in order, holds
//! early arrivals and reports what is missing so it can be requested.
//! Redelivery is a pure resend of the logged record; nothing is
//! re-executed on the server.

use crate::wire::Committed;
use gsync_action::Action;
use std::collections::{BTreeMap, BTreeSet};

/// Server-side log of sequenced commits
#[derive(Debug, Default)]
pub struct CommitLog {
    entries: Vec<Action>,
}

impl CommitLog {
    /// Create empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a committed action, returning its sequence number
    pub fn record(&mut self, action: Action) -> u64 {
        self.entries.push(action);
        self.head()
    }

    /// Highest assigned sequence number (`0` if none)
    #[inline]
    #[must_use]
    pub fn head(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Logged commit by sequence number
    #[must_use]
    pub fn get(&self, sequence: u64) -> Option<&Action> {
        let index = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.entries.get(index)
    }

    /// Logged records for `missing`, in ascending order; unknown numbers
    /// are skipped
    #[must_use]
    pub fn resend(&self, missing: &[u64]) -> Vec<Committed> {
        let wanted: BTreeSet<u64> = missing.iter().copied().collect();
        wanted
            .into_iter()
            .filter_map(|seq| {
                self.get(seq).map(|action| Committed {
                    sequence: Some(seq),
                    action: action.clone(),
                })
            })
            .collect()
    }

    /// Every logged commit in order (join replay)
    #[must_use]
    pub fn replay(&self) -> Vec<Committed> {
        (1..=self.head())
            .zip(self.entries.iter())
            .map(|(seq, action)| Committed {
                sequence: Some(seq),
                action: action.clone(),
            })
            .collect()
    }
}

/// What the tracker did with an offered commit
#[derive(Debug, PartialEq)]
pub enum Offer {
    /// These commits are now next in order; apply them as given
    Ready(Vec<(u64, Action)>),
    /// Already applied or already held
    Duplicate,
    /// Held until earlier numbers arrive; `missing` lists newly noticed gaps
    Held { missing: Vec<u64> },
}

/// Client-side contiguous-prefix tracker with a reorder buffer
#[derive(Debug, Default)]
pub struct SequenceTracker {
    contiguous: u64,
    known_head: u64,
    held: BTreeMap<u64, Action>,
    requested: BTreeSet<u64>,
}

impl SequenceTracker {
    /// Create tracker expecting sequence `1` next
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence number applied with no gaps before it
    #[inline]
    #[must_use]
    pub fn contiguous(&self) -> u64 {
        self.contiguous
    }

    /// Highest sequence number known to exist
    #[inline]
    #[must_use]
    pub fn known_head(&self) -> u64 {
        self.known_head
    }

    /// Number of commits waiting in the reorder buffer
    #[inline]
    #[must_use]
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Offer a sequenced commit
    pub fn offer(&mut self, sequence: u64, action: Action) -> Offer {
        if sequence <= self.contiguous || self.held.contains_key(&sequence) {
            return Offer::Duplicate;
        }
        self.known_head = self.known_head.max(sequence);

        if sequence == self.contiguous + 1 {
            self.contiguous = sequence;
            self.requested.remove(&sequence);
            let mut ready = vec![(sequence, action)];
            while let Some(next) = self.held.remove(&(self.contiguous + 1)) {
                self.contiguous += 1;
                self.requested.remove(&self.contiguous);
                ready.push((self.contiguous, next));
            }
            return Offer::Ready(ready);
        }

        self.held.insert(sequence, action);
        Offer::Held {
            missing: self.take_unrequested(),
        }
    }

    /// Learn the server head; returns newly noticed missing numbers
    pub fn observe_head(&mut self, head: u64) -> Vec<u64> {
        self.known_head = self.known_head.max(head);
        self.take_unrequested()
    }

    /// Every currently missing number, capped at `limit` (periodic retry)
    #[must_use]
    pub fn missing(&self, limit: usize) -> Vec<u64> {
        (self.contiguous + 1..=self.known_head)
            .filter(|seq| !self.held.contains_key(seq))
            .take(limit)
            .collect()
    }

    /// Whether anything is missing
    #[must_use]
    pub fn has_gap(&self) -> bool {
        self.known_head > self.contiguous
    }

    /// Start over from `contiguous` (join replay)
    pub fn reset(&mut self, contiguous: u64) {
        self.contiguous = contiguous;
        self.known_head = contiguous;
        self.held.clear();
        self.requested.clear();
    }

    fn take_unrequested(&mut self) -> Vec<u64> {
        let fresh: Vec<u64> = self
            .missing(usize::MAX)
            .into_iter()
            .filter(|seq| !self.requested.contains(seq))
            .collect();
        self.requested.extend(fresh.iter().copied());
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsync_action::kind::MoveNode;
    use gsync_action::{ActionKind, ClientId, Vec3};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn action(n: u64) -> Action {
        let mut action = Action::builder(
            ActionKind::MoveNode(MoveNode {
                position: Vec3::ZERO,
            }),
            "N1",
            ClientId(1),
        )
        .build()
        .unwrap();
        action.assign_network_version(n);
        action
    }

    fn seqs(offer: Offer) -> Vec<u64> {
        match offer {
            Offer::Ready(ready) => ready.into_iter().map(|(s, _)| s).collect(),
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn gap_at_three_is_repaired() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(seqs(tracker.offer(1, action(1))), vec![1]);
        assert_eq!(seqs(tracker.offer(2, action(2))), vec![2]);
        assert_eq!(
            tracker.offer(4, action(4)),
            Offer::Held { missing: vec![3] }
        );
        assert_eq!(tracker.contiguous(), 2);

        assert_eq!(seqs(tracker.offer(3, action(3))), vec![3, 4]);
        assert_eq!(tracker.contiguous(), 4);
        assert!(!tracker.has_gap());
    }

    #[test]
    fn redelivery_is_duplicate() {
        let mut tracker = SequenceTracker::new();
        let _ = tracker.offer(1, action(1));
        assert_eq!(tracker.offer(1, action(1)), Offer::Duplicate);
        let _ = tracker.offer(3, action(3));
        assert_eq!(tracker.offer(3, action(3)), Offer::Duplicate);
    }

    #[test]
    fn missing_is_reported_once_until_retry() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.offer(3, action(3)), Offer::Held { missing: vec![1, 2] });
        assert_eq!(tracker.offer(4, action(4)), Offer::Held { missing: vec![] });
        assert_eq!(tracker.missing(10), vec![1, 2]);
        assert_eq!(tracker.missing(1), vec![1]);
    }

    #[test]
    fn head_reveals_tail_loss() {
        let mut tracker = SequenceTracker::new();
        let _ = tracker.offer(1, action(1));
        assert_eq!(tracker.observe_head(3), vec![2, 3]);
        assert!(tracker.observe_head(3).is_empty());
    }

    #[test]
    fn log_resend_skips_unknown() {
        let mut log = CommitLog::new();
        for n in 1..=4 {
            assert_eq!(log.record(action(n)), n);
        }
        let resent: Vec<u64> = log
            .resend(&[3, 9, 3])
            .into_iter()
            .filter_map(|c| c.sequence)
            .collect();
        assert_eq!(resent, vec![3]);
        assert!(log.get(0).is_none());
        assert_eq!(log.replay().len(), 4);
    }

    proptest! {
        /// Any delivery order of 1..=n (with duplicates) releases exactly 1..=n in order
        #[test]
        fn prop_release_order_is_contiguous(
            order in Just((1u64..=24).collect::<Vec<_>>()).prop_shuffle(),
            dups in prop::collection::vec(1u64..=24, 0..10),
        ) {
            let mut tracker = SequenceTracker::new();
            let mut released = Vec::new();
            for seq in order.iter().chain(dups.iter()) {
                if let Offer::Ready(ready) = tracker.offer(*seq, action(*seq)) {
                    released.extend(ready.into_iter().map(|(s, _)| s));
                }
            }
            prop_assert_eq!(released, (1u64..=24).collect::<Vec<_>>());
            prop_assert_eq!(tracker.held_len(), 0);
        }
    }
}
