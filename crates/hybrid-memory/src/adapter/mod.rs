//! # Backend Adapters
//!
//! Uniform read/write/query contract over heterogeneous stores.
//!
//! ## Reference adapters
//!
//! - **Graph**: items plus relationship traversal ([`GraphAdapter`])
//! - **Vector**: cosine-similarity search over embeddings ([`VectorAdapter`])
//! - **Document**: JSON documents with a type index ([`DocumentAdapter`])
//! - **Key-Value**: serialized blobs keyed by id ([`KeyValueAdapter`])
//!
//! A configured primary can be wrapped in a [`FallbackAdapter`], which serves
//! its label from other adapters while it is down.
//!
//! Every adapter is append-only per id: `write` adds a version, `delete`
//! tombstones. Same-id writes are serialized inside the adapter; reads may
//! run concurrently.

mod document;
mod fallback;
mod graph;
mod kv;
mod registry;
mod store;
mod vector;

pub use document::DocumentAdapter;
pub use fallback::{FallbackAdapter, FallbackStatus, MemberStatus, StoreStatus};
pub use graph::GraphAdapter;
pub use kv::KeyValueAdapter;
pub use registry::{guarded, AdapterRegistry};
pub use store::{AdapterCore, ItemCodec, VersionedStore};
pub use vector::{cosine_similarity, VectorAdapter};

use crate::error::{AdapterError, AdapterResult};
use crate::item::MemoryItem;
use crate::predicate::Predicate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Store paradigm behind an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Graph,
    Vector,
    Document,
    KeyValue,
}

impl AdapterKind {
    /// Default label used when the configuration does not name the adapter
    pub fn default_label(&self) -> &'static str {
        match self {
            Self::Graph => "graph",
            Self::Vector => "vector",
            Self::Document => "document",
            Self::KeyValue => "kv",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_label())
    }
}

/// Contract every backend adapter implements
#[async_trait]
pub trait MemoryAdapter: Send + Sync {
    /// Unique label within a manager (e.g. `"vector"`)
    fn label(&self) -> &str;

    /// Store paradigm
    fn kind(&self) -> AdapterKind;

    /// Persist a new version and return its number. Never overwrites.
    async fn write(&self, item: MemoryItem) -> AdapterResult<u64>;

    /// Latest version, or `NotFound` if absent or tombstoned
    async fn read(&self, id: &str) -> AdapterResult<MemoryItem>;

    /// Specific version; historical versions survive a tombstone
    async fn read_version(&self, id: &str, version: u64) -> AdapterResult<MemoryItem>;

    /// All versions in ascending order
    async fn history(&self, id: &str) -> AdapterResult<Vec<MemoryItem>>;

    /// Tombstone an id
    async fn delete(&self, id: &str) -> AdapterResult<()>;

    /// Latest versions of live items matching the predicate
    async fn query_by_metadata(&self, predicate: &Predicate) -> AdapterResult<Vec<MemoryItem>>;

    /// Current version number of a live item
    async fn current_version(&self, id: &str) -> AdapterResult<Option<u64>> {
        match self.read(id).await {
            Ok(item) => Ok(Some(item.version)),
            Err(AdapterError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove one version this adapter appended, used to undo a store
    /// that failed on another adapter
    async fn revert(&self, id: &str, version: u64) -> AdapterResult<()> {
        let _ = (id, version);
        Err(AdapterError::Unsupported("revert".into()))
    }

    /// Similarity search capability
    fn as_vector(&self) -> Option<&dyn VectorSearch> {
        None
    }

    /// Relationship traversal capability
    fn as_graph(&self) -> Option<&dyn GraphTraversal> {
        None
    }

    /// Whether the adapter can stage, commit and undo writes
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Stage a write for `transaction_id` without making it visible
    async fn prepare(&self, transaction_id: &str, item: MemoryItem) -> AdapterResult<()> {
        let _ = (transaction_id, item);
        Err(AdapterError::Unsupported("prepare".into()))
    }

    /// Make staged writes visible; returns `(id, version)` per write
    async fn commit(&self, transaction_id: &str) -> AdapterResult<Vec<(String, u64)>> {
        let _ = transaction_id;
        Err(AdapterError::Unsupported("commit".into()))
    }

    /// Discard staged writes or undo committed ones from the same transaction
    async fn rollback(&self, transaction_id: &str) -> AdapterResult<()> {
        let _ = transaction_id;
        Err(AdapterError::Unsupported("rollback".into()))
    }

    /// Forget the undo log once the transaction is final
    async fn finalize(&self, transaction_id: &str) -> AdapterResult<()> {
        let _ = transaction_id;
        Ok(())
    }

    /// Call counters
    fn stats(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot::default()
    }
}

/// Vector similarity capability
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Top-k items by cosine similarity, descending; ties by newest `updated_at`
    async fn query_by_similarity(
        &self,
        vector: &[f32],
        top_k: usize,
    ) -> AdapterResult<Vec<(MemoryItem, f32)>>;
}

/// Relationship traversal capability
#[async_trait]
pub trait GraphTraversal: Send + Sync {
    /// Items reachable from `id` within `max_hops`, both edge directions
    async fn query_related(
        &self,
        id: &str,
        relation_filter: Option<&str>,
        max_hops: usize,
    ) -> AdapterResult<Vec<MemoryItem>>;
}

/// Per-adapter call counters
#[derive(Debug, Default)]
pub struct AdapterStats {
    reads: AtomicU64,
    writes: AtomicU64,
    queries: AtomicU64,
}

impl AdapterStats {
    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AdapterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub queries: u64,
}
