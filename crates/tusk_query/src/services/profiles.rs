//! Read-only profile lookup used by the engine.
//!
//! Profiles are persisted by the surrounding application; the query core only needs to find
//! one by id when a pool is first created.

use crate::models::ConnectionProfile;

use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Lookup of connection profiles by id.
pub trait ProfileStore: Send + Sync {
    /// Find a profile.
    fn profile(&self, id: &Uuid) -> Option<ConnectionProfile>;
}

/// A `ProfileStore` held in memory.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<Uuid, ConnectionProfile>>,
}

impl InMemoryProfileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a profile. Pools already open for it keep their old settings.
    pub fn insert(&self, profile: ConnectionProfile) {
        self.profiles.write().insert(profile.id, profile);
    }

    /// Remove a profile.
    pub fn remove(&self, id: &Uuid) -> Option<ConnectionProfile> {
        self.profiles.write().remove(id)
    }

    /// Number of stored profiles.
    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.profiles.read().is_empty()
    }
}

impl FromIterator<ConnectionProfile> for InMemoryProfileStore {
    fn from_iter<I: IntoIterator<Item = ConnectionProfile>>(iter: I) -> Self {
        let store = Self::new();
        for profile in iter {
            store.insert(profile);
        }
        store
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn profile(&self, id: &Uuid) -> Option<ConnectionProfile> {
        self.profiles.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_insert_and_remove() {
        let profile = ConnectionProfile::new("local", "localhost", "postgres", "postgres");
        let id = profile.id;
        let store: InMemoryProfileStore = std::iter::once(profile).collect();

        assert_eq!(store.len(), 1);
        assert_eq!(store.profile(&id).map(|p| p.name), Some("local".to_string()));
        assert!(store.profile(&Uuid::new_v4()).is_none());

        assert!(store.remove(&id).is_some());
        assert!(store.is_empty());
    }
}
