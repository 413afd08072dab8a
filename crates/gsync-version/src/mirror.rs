//! Client-side version mirror

use crate::store::{VersionLookup, VersionStore};
use gsync_action::{ObjectId, ObjectVersion};
use std::collections::{BTreeMap, HashMap};

/// A client's copy of the authoritative versions
///
/// Only committed broadcasts move it; optimistic application never does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorVersions {
    versions: HashMap<ObjectId, ObjectVersion>,
}

impl MirrorVersions {
    /// Create empty mirror
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
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

    /// Forget everything (resync)
    pub fn clear(&mut self) {
        self.versions.clear();
    }
}

impl VersionStore for MirrorVersions {
    fn lookup(&self, id: &ObjectId) -> VersionLookup {
        VersionLookup::from_stored(self.versions.get(id).copied())
    }

    fn set(&mut self, id: ObjectId, version: ObjectVersion) {
        self.versions.insert(id, version);
    }

    fn snapshot(&self) -> BTreeMap<ObjectId, ObjectVersion> {
        self.versions
            .iter()
            .map(|(id, v)| (id.clone(), *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_defaults_to_absent() {
        let mirror = MirrorVersions::new();
        assert_eq!(mirror.get(&ObjectId::new("N1")), ObjectVersion::ABSENT);
        assert!(mirror.is_empty());
    }

    #[test]
    fn mirror_set_and_clear() {
        let mut mirror = MirrorVersions::new();
        mirror.set(ObjectId::new("N1"), ObjectVersion::new(6));
        assert_eq!(mirror.get(&ObjectId::new("N1")), ObjectVersion::new(6));
        mirror.clear();
        assert_eq!(mirror.len(), 0);
    }
}
