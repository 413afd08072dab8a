//! The version store contract

use gsync_action::{ObjectId, ObjectVersion};
use std::collections::BTreeMap;

/// Result of looking an object up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionLookup {
    /// Alive with this version
    Found(ObjectVersion),
    /// Tombstoned
    Deleted,
    /// Never written
    NotFound,
}

impl VersionLookup {
    /// Classify a stored version
    #[inline]
    #[must_use]
    pub fn from_stored(version: Option<ObjectVersion>) -> Self {
        match version {
            None => Self::NotFound,
            Some(v) if v.is_deleted() => Self::Deleted,
            Some(v) => Self::Found(v),
        }
    }

    /// Collapse to a plain version (`0` absent, `-1` deleted)
    #[inline]
    #[must_use]
    pub fn version(self) -> ObjectVersion {
        match self {
            Self::Found(v) => v,
            Self::Deleted => ObjectVersion::DELETED,
            Self::NotFound => ObjectVersion::ABSENT,
        }
    }
}

/// Map from object id to version
pub trait VersionStore {
    /// Look an object up
    fn lookup(&self, id: &ObjectId) -> VersionLookup;

    /// Overwrite an object's version
    fn set(&mut self, id: ObjectId, version: ObjectVersion);

    /// Current version: `0` if never written, `-1` if deleted
    fn get(&self, id: &ObjectId) -> ObjectVersion {
        self.lookup(id).version()
    }

    /// Ordered copy of every stored entry
    fn snapshot(&self) -> BTreeMap<ObjectId, ObjectVersion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_classifies_tombstone() {
        assert_eq!(
            VersionLookup::from_stored(Some(ObjectVersion::DELETED)),
            VersionLookup::Deleted
        );
        assert_eq!(VersionLookup::from_stored(None), VersionLookup::NotFound);
        assert_eq!(
            VersionLookup::from_stored(Some(ObjectVersion::new(3))),
            VersionLookup::Found(ObjectVersion::new(3))
        );
    }

    #[test]
    fn absent_collapses_to_zero() {
        assert_eq!(VersionLookup::NotFound.version(), ObjectVersion::ABSENT);
        assert_eq!(VersionLookup::Deleted.version(), ObjectVersion::DELETED);
    }
}
