//! Id catalog - canonical current version of every id
//!
//! The manager reserves a version here before writing and commits the
//! version an adapter actually assigned afterwards. The sync engine reports
//! the versions it writes so the catalog never falls behind an adapter.

use crate::error::{MemoryError, MemoryResult};
use crate::item::MemoryItem;
use crate::layer::{classify, MemoryLayer};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// What the manager knows about one id
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    /// Layer of the latest stored type
    pub layer: MemoryLayer,
    /// Adapters holding at least one version, in first-write order
    pub adapters: Vec<String>,
    /// Highest version any adapter confirmed
    pub current_version: u64,
    /// Creation time of version 1, shared by every later version
    pub created_at: DateTime<Utc>,
    /// Deleted; the id is never reused
    pub tombstoned: bool,
    reserved: u64,
}

/// Id to current-version map owned by the manager
#[derive(Default)]
pub struct Catalog {
    entries: DashMap<String, CatalogEntry>,
}

impl Catalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next version of `id`; returns it with the id's creation time
    pub fn reserve(&self, item: &MemoryItem) -> MemoryResult<(u64, DateTime<Utc>)> {
        let mut entry = self
            .entries
            .entry(item.id.clone())
            .or_insert_with(|| CatalogEntry {
                layer: classify(&item.item_type),
                adapters: Vec::new(),
                current_version: 0,
                created_at: item.created_at,
                tombstoned: false,
                reserved: 0,
            });

        if entry.tombstoned {
            return Err(MemoryError::validation(
                "id",
                "id was deleted and cannot be reused",
                item.id.clone(),
            ));
        }

        entry.reserved = entry.reserved.max(entry.current_version) + 1;
        entry.layer = classify(&item.item_type);
        Ok((entry.reserved, entry.created_at))
    }

    /// Record a version an adapter now holds
    pub fn commit(&self, id: &str, adapter: &str, version: u64) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            if !entry.adapters.iter().any(|a| a == adapter) {
                entry.adapters.push(adapter.to_string());
            }
            entry.current_version = entry.current_version.max(version);
            entry.reserved = entry.reserved.max(version);
        }
    }

    /// Give back a reservation whose store failed.
    ///
    /// An id with no stored version is forgotten entirely.
    pub fn release(&self, id: &str, reserved: u64) {
        let forget = match self.entries.get_mut(id) {
            Some(mut entry) => {
                if entry.reserved == reserved {
                    entry.reserved = entry.current_version;
                }
                entry.current_version == 0 && entry.reserved == 0 && !entry.tombstoned
            }
            None => false,
        };
        if forget {
            self.entries
                .remove_if(id, |_, e| e.current_version == 0 && e.reserved == 0 && !e.tombstoned);
        }
    }

    /// Record a version written outside the manager (sync propagation)
    pub fn observe(&self, item: &MemoryItem, adapter: &str) {
        let mut entry = self
            .entries
            .entry(item.id.clone())
            .or_insert_with(|| CatalogEntry {
                layer: classify(&item.item_type),
                adapters: Vec::new(),
                current_version: 0,
                created_at: item.created_at,
                tombstoned: false,
                reserved: 0,
            });
        if !entry.adapters.iter().any(|a| a == adapter) {
            entry.adapters.push(adapter.to_string());
        }
        entry.current_version = entry.current_version.max(item.version);
        entry.reserved = entry.reserved.max(item.version);
    }

    /// Mark `id` deleted; returns the adapters holding it
    pub fn tombstone(&self, id: &str) -> MemoryResult<Vec<String>> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| MemoryError::not_found(id))?;
        if entry.tombstoned {
            return Err(MemoryError::not_found(id));
        }
        entry.tombstoned = true;
        Ok(entry.adapters.clone())
    }

    /// Snapshot of one entry, tombstoned or not
    pub fn get(&self, id: &str) -> Option<CatalogEntry> {
        self.entries.get(id).map(|e| e.clone())
    }

    /// Adapters holding `id`, empty when unknown
    pub fn adapters_for(&self, id: &str) -> Vec<String> {
        self.entries
            .get(id)
            .map(|e| e.adapters.clone())
            .unwrap_or_default()
    }

    /// Whether `id` was deleted
    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.entries.get(id).map(|e| e.tombstoned).unwrap_or(false)
    }

    /// Whether `id` ever had a stored version, tombstoned or not
    pub fn has_version(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map(|e| e.current_version > 0)
            .unwrap_or(false)
    }

    /// Current version of a live id
    pub fn current_version(&self, id: &str) -> Option<u64> {
        self.entries
            .get(id)
            .filter(|e| !e.tombstoned && e.current_version > 0)
            .map(|e| e.current_version)
    }

    /// Number of known ids, tombstones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no id was ever reserved
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::MemoryItemType;

    #[test]
    fn test_reserve_commit_cycle() {
        let catalog = Catalog::new();
        let item = MemoryItem::new(MemoryItemType::Code, "fn a() {}").with_id("a");

        let (v1, created) = catalog.reserve(&item).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(created, item.created_at);
        catalog.commit("a", "vector", 1);
        catalog.commit("a", "graph", 1);

        let (v2, _) = catalog.reserve(&item).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(catalog.current_version("a"), Some(1));

        let entry = catalog.get("a").unwrap();
        assert_eq!(entry.adapters, vec!["vector", "graph"]);
        assert_eq!(entry.layer, MemoryLayer::Semantic);
    }

    #[test]
    fn test_tombstoned_ids_are_not_reused() {
        let catalog = Catalog::new();
        let item = MemoryItem::new(MemoryItemType::Context, "x").with_id("x");
        catalog.reserve(&item).unwrap();
        catalog.commit("x", "kv", 1);

        assert_eq!(catalog.tombstone("x").unwrap(), vec!["kv"]);
        assert!(catalog.reserve(&item).is_err());
        assert!(catalog.has_version("x"));
        assert_eq!(catalog.current_version("x"), None);
        assert!(catalog.tombstone("x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_release_forgets_unstored_ids() {
        let catalog = Catalog::new();
        let item = MemoryItem::new(MemoryItemType::Knowledge, "k").with_id("k");

        let (v1, _) = catalog.reserve(&item).unwrap();
        catalog.release("k", v1);
        assert!(catalog.get("k").is_none());

        catalog.reserve(&item).unwrap();
        catalog.commit("k", "graph", 1);
        let (v2, _) = catalog.reserve(&item).unwrap();
        catalog.release("k", v2);
        assert_eq!(catalog.current_version("k"), Some(1));
        assert_eq!(catalog.reserve(&item).unwrap().0, 2);
    }

    #[test]
    fn test_observe_tracks_external_versions() {
        let catalog = Catalog::new();
        let mut item = MemoryItem::new(MemoryItemType::Knowledge, "k").with_id("k");
        item.version = 4;
        catalog.observe(&item, "graph");
        assert_eq!(catalog.current_version("k"), Some(4));
        assert_eq!(catalog.reserve(&item).unwrap().0, 5);
    }
}
