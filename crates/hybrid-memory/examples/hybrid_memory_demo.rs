//! # Hybrid Memory Demo
//!
//! Walks through the main capabilities of the memory manager:
//!
//! - **Layers**: items routed to short-term, episodic and semantic stores
//! - **Versioning**: revisions and history of one item
//! - **Queries**: federated, cascading and context-aware strategies
//! - **Synchronization**: an async subscription and a conflict audit
//! - **Transactions**: an atomic write across stores
//!
//! ## Run This Example
//!
//! ```bash
//! RUST_LOG=hybrid_memory=debug cargo run --example hybrid_memory_demo
//! ```

use hybrid_memory::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
cache_capacity = 256
adapter_timeout_ms = 50
query_timeout_ms = 200

[[subscriptions]]
source = "vector"
target = "document"
mode = "async"
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("=== Hybrid Memory Demo ===");

    let memory = MemoryManager::new(MemoryConfig::from_toml_str(CONFIG)?)?;
    info!("Adapters: {:?}", memory.adapter_labels());

    // ========================================
    // 1. LAYERS
    // ========================================
    let task = memory
        .store(MemoryItem::new(MemoryItemType::Context, "current task: token refresh"))
        .await?;
    let run = memory
        .store(MemoryItem::new(MemoryItemType::TaskHistory, "ran auth test suite, 2 failures"))
        .await?;
    let fact = memory
        .store(
            MemoryItem::new(MemoryItemType::Knowledge, "refresh tokens rotate on every use")
                .with_metadata("topic", "auth")
                .with_embedding(vec![0.9, 0.1, 0.0]),
        )
        .await?;

    for layer in MemoryLayer::ALL {
        let items = memory.retrieve_by_layer(layer).await?;
        info!("{layer}: {} item(s) via {:?}", items.len(), memory.routes_for(layer));
    }

    // ========================================
    // 2. VERSIONING
    // ========================================
    let current = memory.retrieve(&fact).await?;
    memory
        .store(current.revise("refresh tokens rotate on every use and expire after 14 days"))
        .await?;
    for version in memory.retrieve_history(&fact).await? {
        info!("v{}: {}", version.version, version.content_text());
    }

    // ========================================
    // 3. QUERIES
    // ========================================
    memory.add_relationship(Relationship::new(
        ItemRef::new(&run, "document"),
        ItemRef::new(&fact, "vector"),
        "informed_by",
    ))?;
    memory.add_relationship(Relationship::new(
        ItemRef::new(&task, "kv"),
        ItemRef::new(&run, "document"),
        "produced",
    ))?;

    let federated = memory
        .query(&QueryStrategy::Federated, &MemoryQuery::text("auth tokens"))
        .await?;
    for hit in &federated.hits {
        info!("federated: {} from {} ({:.2})", hit.item.id, hit.source_adapter, hit.score);
    }

    let cascade = memory
        .query(&QueryStrategy::cascading(&task, 3), &MemoryQuery::new())
        .await?;
    for hit in &cascade.hits {
        info!("cascade hop {:?}: {:?}", hit.hop, hit.path_labels());
    }

    memory.add_context("topic", "auth");
    let boosted = memory
        .query(
            &QueryStrategy::Federated.context_aware(),
            &MemoryQuery::text("tokens"),
        )
        .await?;
    if let Some(top) = boosted.hits.first() {
        info!("context-aware top hit: {} ({:.2})", top.item.content_text(), top.score);
    }

    // ========================================
    // 4. SYNCHRONIZATION
    // ========================================
    info!("pending propagation for fact: {}", memory.is_sync_pending(&fact));
    memory.flush_sync().await;
    let stats = memory.sync_stats();
    info!(
        "sync: {} propagated, {} conflicts, {} failed",
        stats.synchronized, stats.conflicts, stats.failed
    );

    // ========================================
    // 5. TRANSACTIONS
    // ========================================
    let outcome = memory
        .transaction()
        .write_layer(MemoryItem::new(MemoryItemType::Requirement, "tokens must be revocable"))
        .write("kv", MemoryItem::new(MemoryItemType::Context, "next: revocation endpoint"))
        .execute()
        .await?;
    info!(
        "transaction {} {:?} with {} write(s)",
        outcome.transaction_id,
        outcome.state,
        outcome.writes.len()
    );

    let cache = memory.cache_stats();
    info!("cache: {} hits, {} misses", cache.hits, cache.misses);

    memory.shutdown().await;
    info!("=== Demo Complete ===");
    Ok(())
}
