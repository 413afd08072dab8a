//! Per-object version numbers
//!
//! Versions drive optimistic concurrency: an action is stamped with the
//! version it was based on and commits only if that is still current.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer version of one replicated object
///
/// # Invariants
/// - `-1` marks a deleted object until it is revived
/// - `0` is the implicit version of an object never written
/// - alive objects only move forward
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ObjectVersion(i64);

impl ObjectVersion {
    /// Tombstone of a deleted object
    pub const DELETED: Self = Self(-1);

    /// Version of an object that has no entry yet
    pub const ABSENT: Self = Self(0);

    /// Version an object restarts at after revival
    pub const REVIVED: Self = Self(1);

    /// Create from raw value
    #[inline]
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Raw value
    #[inline]
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether this is the deletion tombstone
    #[inline]
    #[must_use]
    pub const fn is_deleted(self) -> bool {
        self.0 == Self::DELETED.0
    }

    /// Version produced by `effect`, or `None` if the transition is illegal
    ///
    /// - `Bump` on an alive object: `v + 1`
    /// - `Delete` on an alive object: `-1`
    /// - `Revive` on a deleted object: `1`
    #[must_use]
    pub fn apply(self, effect: VersionEffect) -> Option<Self> {
        match effect {
            VersionEffect::Bump if !self.is_deleted() => self.0.checked_add(1).map(Self),
            VersionEffect::Delete if !self.is_deleted() => Some(Self::DELETED),
            VersionEffect::Revive if self.is_deleted() => Some(Self::REVIVED),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_deleted() {
            f.write_str("deleted")
        } else {
            write!(f, "v{}", self.0)
        }
    }
}

/// How a committed action moves its target's version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionEffect {
    /// Ordinary mutation (also creation from `0`)
    Bump,
    /// Object removal
    Delete,
    /// Re-creation of a deleted object
    Revive,
}
