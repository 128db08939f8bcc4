//! # Hybrid Memory - Tiered Memory Across Heterogeneous Stores
//!
//! **Hybrid Memory** stores, classifies, caches, synchronizes and queries
//! versioned memory items across independent backends:
//!
//! - **Layers**: every item type maps to `SHORT_TERM`, `EPISODIC` or `SEMANTIC`
//! - **Adapters**: graph, vector, document and key-value stores behind one contract
//! - **Tiered cache**: bounded LRU with single-flight loads and write-through
//! - **Query engine**: direct, cross-store, cascading, federated and context-aware
//! - **Synchronization**: sync/async subscriptions, last-writer-wins conflicts,
//!   two-phase multi-store transactions
//! - **Fallbacks**: a primary adapter can fail over onto others and replay
//!   queued writes once it recovers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hybrid_memory::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let memory = MemoryManager::new(MemoryConfig::default())?;
//!
//!     let id = memory
//!         .store(MemoryItem::new(MemoryItemType::Knowledge, "python tips"))
//!         .await?;
//!     let item = memory.retrieve(&id).await?;
//!     assert_eq!(item.version, 1);
//!
//!     let semantic = memory.retrieve_by_layer(MemoryLayer::Semantic).await?;
//!     println!("{} semantic items", semantic.len());
//!
//!     let response = memory
//!         .query(&QueryStrategy::Federated, &MemoryQuery::text("python"))
//!         .await?;
//!     for hit in &response.hits {
//!         println!("{} from {} ({:.2})", hit.item.id, hit.source_adapter, hit.score);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!            caller
//!              │
//!      ┌───────▼────────┐      ┌──────────────┐
//!      │ MemoryManager  │─────▶│ QueryEngine  │
//!      │ catalog, cache │      └──────┬───────┘
//!      └───────┬────────┘             │ fan-out
//!              │ write                │
//!   ┌──────────▼──────────────────────▼──────────┐
//!   │ graph │ vector │ document │ kv  (adapters) │
//!   └──────────▲─────────────────────────────────┘
//!              │ propagate
//!      ┌───────┴────────┐
//!      │  SyncEngine    │
//!      └────────────────┘
//! ```

pub mod adapter;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod item;
pub mod layer;
pub mod manager;
pub mod predicate;
pub mod query;
pub mod relation;
pub mod sync;

pub use adapter::{
    AdapterKind, AdapterRegistry, DocumentAdapter, FallbackAdapter, FallbackStatus, GraphAdapter,
    GraphTraversal, KeyValueAdapter, MemoryAdapter, StoreStatus, VectorAdapter, VectorSearch,
};
pub use cache::{CacheEntry, CacheStats, TieredCache};
pub use config::{
    ConflictPolicy, FallbackConfig, MemoryConfig, RetryConfig, SubscriptionConfig, SyncMode,
};
pub use context::{ContextMap, SessionContext};
pub use error::{AdapterError, AdapterResult, MemoryError, MemoryResult};
pub use item::{ItemRef, Metadata, MemoryItem, MemoryItemType, Relationship};
pub use layer::{classify, MemoryLayer};
pub use manager::{MemoryManager, TransactionBuilder, EDRR_PHASES};
pub use predicate::Predicate;
pub use query::{
    AdapterStatus, DefaultScorer, MemoryQuery, QueryHit, QueryResponse, QueryStrategy,
    RelevanceScorer,
};
pub use relation::RelationGraph;
pub use sync::{
    ConflictRecord, SyncRecord, SyncStats, SyncStatus, TransactionOutcome, TransactionState,
};

/// Commonly used types and traits
pub mod prelude {
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::item::{ItemRef, MemoryItem, MemoryItemType, Relationship};
    pub use crate::layer::MemoryLayer;
    pub use crate::manager::MemoryManager;
    pub use crate::predicate::Predicate;
    pub use crate::query::{MemoryQuery, QueryStrategy};
    pub use crate::config::{MemoryConfig, SyncMode};
    pub use crate::adapter::MemoryAdapter;
}
