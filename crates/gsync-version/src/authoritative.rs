//! Server-side authoritative version store

use crate::error::VersionError;
use crate::store::{VersionLookup, VersionStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gsync_action::{ObjectId, ObjectVersion, VersionEffect};
use std::collections::BTreeMap;

/// The authoritative map from object id to version
///
/// Compare-and-set happens under the target's shard lock, so concurrent
/// callers on the same target are serialized while distinct targets do not
/// block each other.
#[derive(Debug, Default)]
pub struct AuthoritativeVersions {
    versions: DashMap<ObjectId, ObjectVersion>,
}

impl AuthoritativeVersions {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            versions: DashMap::new(),
        }
    }

    /// Create store seeded with versions
    #[must_use]
    pub fn with_versions(versions: impl IntoIterator<Item = (ObjectId, ObjectVersion)>) -> Self {
        Self {
            versions: versions.into_iter().collect(),
        }
    }

    /// Commit `proposed` for `target` iff its version is still `expected`
    ///
    /// # Errors
    /// - `VersionError::Deleted` if the target is tombstoned and `expected`
    ///   differs
    /// - `VersionError::Conflict` if `expected` is stale
    /// - `VersionError::IllegalTransition` if `expected -> proposed` breaks
    ///   the version policy
    pub fn check_and_commit(
        &self,
        target: &ObjectId,
        expected: ObjectVersion,
        proposed: ObjectVersion,
    ) -> Result<ObjectVersion, VersionError> {
        let entry = self.versions.entry(target.clone());
        let current = match &entry {
            Entry::Occupied(occupied) => *occupied.get(),
            Entry::Vacant(_) => ObjectVersion::ABSENT,
        };

        if current != expected {
            return Err(if current.is_deleted() {
                VersionError::Deleted {
                    target: target.clone(),
                    expected,
                }
            } else {
                VersionError::Conflict {
                    target: target.clone(),
                    expected,
                    actual: current,
                }
            });
        }

        if !follows_policy(current, proposed) {
            return Err(VersionError::IllegalTransition {
                target: target.clone(),
                from: current,
                to: proposed,
            });
        }

        match entry {
            Entry::Occupied(mut occupied) => {
                occupied.insert(proposed);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(proposed);
            }
        }
        tracing::trace!(%target, from = %current, to = %proposed, "version committed");
        Ok(proposed)
    }

    /// Number of tracked objects
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Check if nothing is tracked
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl VersionStore for AuthoritativeVersions {
    fn lookup(&self, id: &ObjectId) -> VersionLookup {
        VersionLookup::from_stored(self.versions.get(id).map(|v| *v))
    }

    fn set(&mut self, id: ObjectId, version: ObjectVersion) {
        self.versions.insert(id, version);
    }

    fn snapshot(&self) -> BTreeMap<ObjectId, ObjectVersion> {
        self.versions
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// `to` is reachable from `from` by one policy step
fn follows_policy(from: ObjectVersion, to: ObjectVersion) -> bool {
    [VersionEffect::Bump, VersionEffect::Delete, VersionEffect::Revive]
        .into_iter()
        .any(|effect| from.apply(effect) == Some(to))
}
