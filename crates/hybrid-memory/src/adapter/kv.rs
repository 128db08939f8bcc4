//! Key-value adapter
//!
//! Stores each version as a serialized JSON blob keyed by id. Metadata
//! queries decode and filter every live key.

use super::store::{AdapterCore, ItemCodec};
use super::{AdapterKind, AdapterStatsSnapshot, MemoryAdapter};
use crate::error::{AdapterError, AdapterResult};
use crate::item::MemoryItem;
use crate::predicate::Predicate;
use async_trait::async_trait;

/// Items as JSON bytes
pub struct JsonBytes;

impl ItemCodec for JsonBytes {
    type Stored = Vec<u8>;

    fn encode(item: &MemoryItem) -> AdapterResult<Vec<u8>> {
        serde_json::to_vec(item).map_err(|e| AdapterError::Io(e.to_string()))
    }

    fn decode(stored: &Vec<u8>) -> AdapterResult<MemoryItem> {
        serde_json::from_slice(stored).map_err(|e| AdapterError::Io(e.to_string()))
    }
}

/// In-process key-value store
pub struct KeyValueAdapter {
    core: AdapterCore<JsonBytes>,
}

impl KeyValueAdapter {
    /// Empty store under `label`
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            core: AdapterCore::new(label),
        }
    }

    /// Disable staging; the adapter then joins transactions best-effort only
    pub fn with_transactions(mut self, enabled: bool) -> Self {
        self.core.transactional = enabled;
        self
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.core.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.store.is_empty()
    }
}

impl Default for KeyValueAdapter {
    fn default() -> Self {
        Self::new(AdapterKind::KeyValue.default_label())
    }
}

#[async_trait]
impl MemoryAdapter for KeyValueAdapter {
    fn label(&self) -> &str {
        &self.core.label
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::KeyValue
    }

    async fn write(&self, item: MemoryItem) -> AdapterResult<u64> {
        self.core.write(item)
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
        self.core.query(predicate)
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
        self.core.commit(transaction_id)
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
