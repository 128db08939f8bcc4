//! Document adapter
//!
//! Each version is kept as a JSON document. A type index answers
//! `type = X` predicates without scanning the whole collection.

use super::store::{AdapterCore, ItemCodec};
use super::{AdapterKind, AdapterStatsSnapshot, MemoryAdapter};
use crate::error::{AdapterError, AdapterResult};
use crate::item::{MemoryItem, MemoryItemType};
use crate::predicate::Predicate;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

/// Items as JSON documents
pub struct JsonDocument;

impl ItemCodec for JsonDocument {
    type Stored = serde_json::Value;

    fn encode(item: &MemoryItem) -> AdapterResult<serde_json::Value> {
        serde_json::to_value(item).map_err(|e| AdapterError::Io(e.to_string()))
    }

    fn decode(stored: &serde_json::Value) -> AdapterResult<MemoryItem> {
        serde_json::from_value(stored.clone()).map_err(|e| AdapterError::Io(e.to_string()))
    }
}

/// In-process document collection
pub struct DocumentAdapter {
    core: AdapterCore<JsonDocument>,
    type_index: RwLock<HashMap<MemoryItemType, BTreeSet<String>>>,
}

impl DocumentAdapter {
    /// Empty collection under `label`
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            core: AdapterCore::new(label),
            type_index: RwLock::new(HashMap::new()),
        }
    }

    /// Enable or disable transaction staging
    pub fn with_transactions(mut self, enabled: bool) -> Self {
        self.core.transactional = enabled;
        self
    }

    /// Live items of one type, oldest first
    pub fn query_by_type(&self, item_type: &MemoryItemType) -> AdapterResult<Vec<MemoryItem>> {
        self.core.stats.record_query();
        let ids: Vec<String> = self
            .type_index
            .read()
            .get(item_type)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let mut items: Vec<MemoryItem> = self
            .core
            .store
            .latest_many(ids.iter().map(String::as_str))?
            .into_iter()
            .filter(|item| &item.item_type == item_type)
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    fn index(&self, item_type: &MemoryItemType, id: &str) {
        self.type_index
            .write()
            .entry(item_type.clone())
            .or_default()
            .insert(id.to_string());
    }
}

impl Default for DocumentAdapter {
    fn default() -> Self {
        Self::new(AdapterKind::Document.default_label())
    }
}

#[async_trait]
impl MemoryAdapter for DocumentAdapter {
    fn label(&self) -> &str {
        &self.core.label
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Document
    }

    async fn write(&self, item: MemoryItem) -> AdapterResult<u64> {
        let item_type = item.item_type.clone();
        let id = item.id.clone();
        let version = self.core.write(item)?;
        self.index(&item_type, &id);
        Ok(version)
    }

    async fn read(&self, id: &str) -> AdapterResult<MemoryItem> {
        self.core.read(id)
    }

    async fn read_version(&self, id: &str, version: u64) -> AdapterResult<MemoryItem> {
        self.core.read_version(id, version)
    }

    async fn history(&self, id: &str) -> AdapterResult<Vec<MemoryItem>> {
        self.core.history(id)
    }

    async fn delete(&self, id: &str) -> AdapterResult<()> {
        self.core.delete(id)
    }

    async fn revert(&self, id: &str, version: u64) -> AdapterResult<()> {
        self.core.revert(id, version)
    }

    async fn query_by_metadata(&self, predicate: &Predicate) -> AdapterResult<Vec<MemoryItem>> {
        match predicate {
            Predicate::TypeIs { item_type } => self.query_by_type(item_type),
            other => self.core.query(other),
        }
    }

    async fn current_version(&self, id: &str) -> AdapterResult<Option<u64>> {
        Ok(self.core.store.current_version(id))
    }

    fn supports_transactions(&self) -> bool {
        self.core.transactional
    }

    async fn prepare(&self, transaction_id: &str, item: MemoryItem) -> AdapterResult<()> {
        self.core.prepare(transaction_id, item)
    }

    async fn commit(&self, transaction_id: &str) -> AdapterResult<Vec<(String, u64)>> {
        let applied = self.core.commit(transaction_id)?;
        for (id, version) in &applied {
            if let Ok(item) = self.core.store.version(id, *version) {
                self.index(&item.item_type, id);
            }
        }
        Ok(applied)
    }

    async fn rollback(&self, transaction_id: &str) -> AdapterResult<()> {
        self.core.store.rollback(transaction_id)
    }

    async fn finalize(&self, transaction_id: &str) -> AdapterResult<()> {
        self.core.store.finalize(transaction_id);
        Ok(())
    }

    fn stats(&self) -> AdapterStatsSnapshot {
        self.core.stats.snapshot()
    }
}
