//! Append-only versioned storage shared by the reference adapters
//!
//! Each adapter picks its own physical representation through an
//! [`ItemCodec`]; versioning, tombstones and transaction staging are common.

use super::AdapterStats;
use crate::error::{AdapterError, AdapterResult};
use crate::item::MemoryItem;
use crate::predicate::Predicate;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Converts items to and from an adapter's native format
pub trait ItemCodec: Send + Sync + 'static {
    type Stored: Clone + Send + Sync + 'static;

    fn encode(item: &MemoryItem) -> AdapterResult<Self::Stored>;

    fn decode(stored: &Self::Stored) -> AdapterResult<MemoryItem>;
}

/// Keeps items as-is
pub struct Passthrough;

impl ItemCodec for Passthrough {
    type Stored = MemoryItem;

    fn encode(item: &MemoryItem) -> AdapterResult<MemoryItem> {
        Ok(item.clone())
    }

    fn decode(stored: &MemoryItem) -> AdapterResult<MemoryItem> {
        Ok(stored.clone())
    }
}

struct Record<S> {
    versions: BTreeMap<u64, S>,
    created_at: DateTime<Utc>,
    tombstoned: bool,
}

impl<S> Record<S> {
    fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            versions: BTreeMap::new(),
            created_at,
            tombstoned: false,
        }
    }

    fn live_version(&self) -> Option<u64> {
        if self.tombstoned {
            return None;
        }
        self.versions.keys().next_back().copied()
    }
}

/// Per-id version chains with tombstones and staged transaction writes.
///
/// Same-id writes serialize on the map shard lock.
pub struct VersionedStore<C: ItemCodec> {
    records: DashMap<String, Record<C::Stored>>,
    staged: DashMap<String, Vec<MemoryItem>>,
    undo: DashMap<String, Vec<(String, u64)>>,
    _codec: PhantomData<C>,
}

impl<C: ItemCodec> VersionedStore<C> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            staged: DashMap::new(),
            undo: DashMap::new(),
            _codec: PhantomData,
        }
    }

    /// Append a version.
    ///
    /// A version number above the current maximum is kept (gaps are fine),
    /// anything else becomes `current + 1`.
    pub fn append(&self, mut item: MemoryItem) -> AdapterResult<u64> {
        if item.id.is_empty() {
            return Err(AdapterError::Invalid("item id is empty".into()));
        }

        let mut record = self
            .records
            .entry(item.id.clone())
            .or_insert_with(|| Record::new(item.created_at));

        if record.tombstoned {
            return Err(AdapterError::Invalid(format!("id '{}' was deleted", item.id)));
        }

        let current = record.versions.keys().next_back().copied().unwrap_or(0);
        let version = if item.version > current { item.version } else { current + 1 };
        item.version = version;
        item.created_at = record.created_at;

        let stored = C::encode(&item)?;
        record.versions.insert(version, stored);
        Ok(version)
    }

    /// Latest live version
    pub fn latest(&self, id: &str) -> AdapterResult<MemoryItem> {
        let record = self.records.get(id).ok_or_else(|| AdapterError::not_found(id))?;
        if record.tombstoned {
            return Err(AdapterError::not_found(id));
        }
        match record.versions.values().next_back() {
            Some(stored) => C::decode(stored),
            None => Err(AdapterError::not_found(id)),
        }
    }

    /// One version, live or tombstoned
    pub fn version(&self, id: &str, version: u64) -> AdapterResult<MemoryItem> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| AdapterError::version_not_found(id, version))?;
        match record.versions.get(&version) {
            Some(stored) => C::decode(stored),
            None => Err(AdapterError::version_not_found(id, version)),
        }
    }

    /// Every version in ascending order
    pub fn history(&self, id: &str) -> AdapterResult<Vec<MemoryItem>> {
        let record = self.records.get(id).ok_or_else(|| AdapterError::not_found(id))?;
        if record.versions.is_empty() {
            return Err(AdapterError::not_found(id));
        }
        record.versions.values().map(C::decode).collect()
    }

    /// Mark `id` deleted; history stays readable
    pub fn tombstone(&self, id: &str) -> AdapterResult<()> {
        let mut record = self.records.get_mut(id).ok_or_else(|| AdapterError::not_found(id))?;
        record.tombstoned = true;
        Ok(())
    }

    /// Latest version of a live id
    pub fn current_version(&self, id: &str) -> Option<u64> {
        self.records.get(id).and_then(|r| r.live_version())
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.records.get(id).map(|r| r.tombstoned).unwrap_or(false)
    }

    /// Latest live versions matching the predicate, oldest first
    pub fn scan(&self, predicate: &Predicate) -> AdapterResult<Vec<MemoryItem>> {
        let mut items = Vec::new();
        for record in self.records.iter() {
            if record.tombstoned {
                continue;
            }
            if let Some(stored) = record.versions.values().next_back() {
                let item = C::decode(stored)?;
                if predicate.matches(&item) {
                    items.push(item);
                }
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    /// Latest live versions for the given ids, skipping missing ones
    pub fn latest_many<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> AdapterResult<Vec<MemoryItem>> {
        let mut items = Vec::new();
        for id in ids {
            match self.latest(id) {
                Ok(item) => items.push(item),
                Err(AdapterError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| r.live_version().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate and hold a write until commit
    pub fn stage(&self, transaction_id: &str, item: MemoryItem) -> AdapterResult<()> {
        if item.id.is_empty() {
            return Err(AdapterError::Staging("item id is empty".into()));
        }
        if self.is_tombstoned(&item.id) {
            return Err(AdapterError::Staging(format!("id '{}' was deleted", item.id)));
        }
        C::encode(&item).map_err(|e| AdapterError::Staging(e.to_string()))?;
        self.staged
            .entry(transaction_id.to_string())
            .or_default()
            .push(item);
        Ok(())
    }

    /// Append every staged write; on failure nothing from this call stays
    pub fn commit_staged(&self, transaction_id: &str) -> AdapterResult<Vec<(String, u64)>> {
        let items = self
            .staged
            .remove(transaction_id)
            .map(|(_, items)| items)
            .unwrap_or_default();

        let mut applied = Vec::with_capacity(items.len());
        for item in items {
            let id = item.id.clone();
            match self.append(item) {
                Ok(version) => applied.push((id, version)),
                Err(e) => {
                    self.undo_versions(&applied);
                    return Err(e);
                }
            }
        }

        self.undo
            .entry(transaction_id.to_string())
            .or_default()
            .extend(applied.iter().cloned());
        Ok(applied)
    }

    /// Drop staged writes and remove versions committed under this transaction
    pub fn rollback(&self, transaction_id: &str) -> AdapterResult<()> {
        self.staged.remove(transaction_id);
        if let Some((_, applied)) = self.undo.remove(transaction_id) {
            self.undo_versions(&applied);
        }
        Ok(())
    }

    /// Remove a single version appended outside a transaction
    pub fn remove_version(&self, id: &str, version: u64) -> AdapterResult<()> {
        let present = self
            .records
            .get(id)
            .map(|r| r.versions.contains_key(&version))
            .unwrap_or(false);
        if !present {
            return Err(AdapterError::version_not_found(id, version));
        }
        self.undo_versions(&[(id.to_string(), version)]);
        Ok(())
    }

    /// Forget the undo log of a finished transaction
    pub fn finalize(&self, transaction_id: &str) {
        self.staged.remove(transaction_id);
        self.undo.remove(transaction_id);
    }

    fn undo_versions(&self, applied: &[(String, u64)]) {
        for (id, version) in applied.iter().rev() {
            let now_empty = match self.records.get_mut(id) {
                Some(mut record) => {
                    record.versions.remove(version);
                    record.versions.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.records.remove_if(id, |_, r| r.versions.is_empty());
            }
        }
    }
}

impl<C: ItemCodec> Default for VersionedStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Label, counters and versioned store shared by the reference adapters
pub struct AdapterCore<C: ItemCodec> {
    pub label: String,
    pub transactional: bool,
    pub store: VersionedStore<C>,
    pub stats: AdapterStats,
}

impl<C: ItemCodec> AdapterCore<C> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            transactional: true,
            store: VersionedStore::new(),
            stats: AdapterStats::default(),
        }
    }

    /// Append a version and count the write
    pub fn write(&self, item: MemoryItem) -> AdapterResult<u64> {
        self.stats.record_write();
        let id = item.id.clone();
        let version = self.store.append(item)?;
        tracing::debug!(adapter = %self.label, item_id = %id, version, "version appended");
        Ok(version)
    }

    pub fn read(&self, id: &str) -> AdapterResult<MemoryItem> {
        self.stats.record_read();
        self.store.latest(id)
    }

    pub fn read_version(&self, id: &str, version: u64) -> AdapterResult<MemoryItem> {
        self.stats.record_read();
        self.store.version(id, version)
    }

    pub fn history(&self, id: &str) -> AdapterResult<Vec<MemoryItem>> {
        self.stats.record_read();
        self.store.history(id)
    }

    pub fn delete(&self, id: &str) -> AdapterResult<()> {
        self.stats.record_write();
        self.store.tombstone(id)?;
        tracing::debug!(adapter = %self.label, item_id = %id, "tombstoned");
        Ok(())
    }

    /// Remove one appended version
    pub fn revert(&self, id: &str, version: u64) -> AdapterResult<()> {
        self.stats.record_write();
        self.store.remove_version(id, version)?;
        tracing::debug!(adapter = %self.label, item_id = %id, version, "version reverted");
        Ok(())
    }

    pub fn query(&self, predicate: &Predicate) -> AdapterResult<Vec<MemoryItem>> {
        self.stats.record_query();
        self.store.scan(predicate)
    }

    /// Stage a write; fails when staging is disabled
    pub fn prepare(&self, transaction_id: &str, item: MemoryItem) -> AdapterResult<()> {
        if !self.transactional {
            return Err(AdapterError::Unsupported("transactions".into()));
        }
        self.store.stage(transaction_id, item)
    }

    /// Apply staged writes
    pub fn commit(&self, transaction_id: &str) -> AdapterResult<Vec<(String, u64)>> {
        self.stats.record_write();
        self.store.commit_staged(transaction_id)
    }
}
