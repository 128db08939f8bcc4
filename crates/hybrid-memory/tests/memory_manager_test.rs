//! End-to-end behaviour of the memory manager: versioning, layers and cache

mod common;

use common::{dynamic, Faulty};
use futures::future::join_all;
use hybrid_memory::prelude::*;
use hybrid_memory::{DocumentAdapter, KeyValueAdapter, StoreStatus, VectorAdapter};
use serde_json::json;

fn kv_manager(capacity: usize) -> (MemoryManager, std::sync::Arc<Faulty>) {
    let kv = Faulty::wrap(KeyValueAdapter::new("kv"));
    let config = MemoryConfig::default().with_cache_capacity(capacity);
    let memory = MemoryManager::with_adapters(config, dynamic(&[&kv])).unwrap();
    (memory, kv)
}

fn context_item(id: &str) -> MemoryItem {
    MemoryItem::new(MemoryItemType::Context, format!("context {id}")).with_id(id)
}

#[tokio::test]
async fn round_trip_preserves_content_and_metadata() {
    let memory = MemoryManager::new(MemoryConfig::default()).unwrap();
    let item = MemoryItem::new(MemoryItemType::Code, json!({"file": "main.rs", "body": "fn main() {}"}))
        .with_metadata("language", "rust")
        .with_metadata("tags", json!(["entry", "bin"]));

    let id = memory.store(item.clone()).await.unwrap();
    let stored = memory.retrieve(&id).await.unwrap();

    assert_eq!(stored.id, id);
    assert_eq!(stored.version, 1);
    assert_eq!(stored.content, item.content);
    assert_eq!(stored.metadata, item.metadata);
    assert_eq!(stored.item_type, MemoryItemType::Code);
}

#[tokio::test]
async fn updates_are_versioned_monotonically() {
    let memory = MemoryManager::new(MemoryConfig::default()).unwrap();
    let id = memory
        .store(MemoryItem::new(MemoryItemType::Knowledge, "rev 1").with_id("fact"))
        .await
        .unwrap();

    for n in 2..=5 {
        let current = memory.retrieve(&id).await.unwrap();
        memory.store(current.revise(format!("rev {n}"))).await.unwrap();
    }

    let history = memory.retrieve_history(&id).await.unwrap();
    let versions: Vec<u64> = history.iter().map(|i| i.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    assert_eq!(memory.retrieve(&id).await.unwrap().version, 5);
    assert!(history.iter().all(|i| i.created_at == history[0].created_at));
}

#[tokio::test]
async fn layers_follow_item_types() {
    let memory = MemoryManager::new(MemoryConfig::default()).unwrap();
    let item1 = memory
        .store(MemoryItem::new(MemoryItemType::Context, "current task"))
        .await
        .unwrap();
    let short_term = memory.retrieve_by_layer(MemoryLayer::ShortTerm).await.unwrap();
    assert!(short_term.iter().any(|i| i.id == item1));

    let item2 = memory
        .store(MemoryItem::new(MemoryItemType::Knowledge, "python tips"))
        .await
        .unwrap();
    let semantic = memory.retrieve_by_layer(MemoryLayer::Semantic).await.unwrap();
    let short_term = memory.retrieve_by_layer(MemoryLayer::ShortTerm).await.unwrap();
    assert!(semantic.iter().any(|i| i.id == item2));
    assert!(!short_term.iter().any(|i| i.id == item2));

    // semantic items live in both vector and graph but are listed once
    assert_eq!(semantic.iter().filter(|i| i.id == item2).count(), 1);
}

#[tokio::test]
async fn cache_hit_makes_no_adapter_call() {
    let (memory, kv) = kv_manager(16);
    let id = memory.store(context_item("a")).await.unwrap();

    let before = kv.reads();
    for _ in 0..3 {
        memory.retrieve(&id).await.unwrap();
    }
    assert_eq!(kv.reads(), before);
    assert!(memory.cache_stats().hits >= 3);
}

#[tokio::test]
async fn lru_evicts_least_recently_used() {
    let (memory, kv) = kv_manager(2);
    for id in ["a", "b", "c"] {
        memory.store(context_item(id)).await.unwrap();
        memory.retrieve(id).await.unwrap();
    }
    let before = kv.reads();

    memory.retrieve("c").await.unwrap();
    assert_eq!(kv.reads(), before, "c is still cached");

    memory.retrieve("a").await.unwrap();
    assert_eq!(kv.reads(), before + 1, "a was evicted and reloaded");

    memory.retrieve("a").await.unwrap();
    assert_eq!(kv.reads(), before + 1);
}

#[tokio::test]
async fn concurrent_misses_load_once() {
    let (memory, kv) = kv_manager(1);
    memory.store(context_item("a")).await.unwrap();
    memory.store(context_item("b")).await.unwrap();

    kv.set_latency(std::time::Duration::from_millis(20));
    let before = kv.reads();
    let results = join_all((0..8).map(|_| memory.retrieve("a"))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(kv.reads(), before + 1);
}

#[tokio::test]
async fn missing_and_deleted_items_are_not_found() {
    let (memory, _kv) = kv_manager(8);
    assert!(memory.retrieve("nope").await.unwrap_err().is_not_found());

    memory.store(context_item("gone")).await.unwrap();
    memory.delete("gone").await.unwrap();
    let err = memory.retrieve("gone").await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { .. }));
    assert_eq!(memory.retrieve_history("gone").await.unwrap().len(), 1);
}

#[tokio::test]
async fn adapter_failure_fails_the_store() {
    let (memory, kv) = kv_manager(8);
    kv.fail_writes(true);
    let err = memory.store(context_item("a")).await.unwrap_err();
    assert!(matches!(err, MemoryError::BackendUnavailable { ref adapter, .. } if adapter == "kv"));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn session_context_is_an_overlay() {
    let (memory, kv) = kv_manager(8);
    memory.add_context("active_goal", "ship auth");
    memory.add_context("current_task", "token refresh");

    assert_eq!(memory.get_context("active_goal"), Some(json!("ship auth")));
    assert_eq!(memory.get_full_context().len(), 2);
    assert_eq!(kv.writes(), 0);

    let ended = memory.end_session();
    assert_ne!(ended, memory.session_id());
    assert!(memory.get_full_context().is_empty());
}

#[tokio::test]
async fn metadata_queries_accept_text_predicates() {
    let memory = MemoryManager::new(MemoryConfig::default()).unwrap();
    memory
        .store(MemoryItem::new(MemoryItemType::Code, "retry loop").with_metadata("language", "rust"))
        .await
        .unwrap();
    memory
        .store(MemoryItem::new(MemoryItemType::Code, "event loop").with_metadata("language", "python"))
        .await
        .unwrap();

    let rust = memory.query_by_metadata_str("language = rust").await.unwrap();
    assert_eq!(rust.len(), 1);
    assert_eq!(rust[0].content, json!("retry loop"));

    let err = memory.query_by_metadata_str("language = ").await.unwrap_err();
    assert!(matches!(err, MemoryError::QuerySyntax { .. }));
}

#[tokio::test]
async fn uncached_reads_keep_open_item_types() {
    let (memory, _kv) = kv_manager(0);
    let item = MemoryItem::new(MemoryItemType::Other("documentation".into()), "how to deploy");
    let id = memory.store(item.clone()).await.unwrap();

    let stored = memory.retrieve(&id).await.unwrap();
    assert_eq!(stored.item_type, item.item_type);
    assert_eq!(stored.item_type.as_str(), "documentation");

    let docs = memory
        .query_by_metadata(Predicate::type_is(MemoryItemType::parse("DOCUMENTATION")))
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, id);
}

#[tokio::test]
async fn rejected_store_leaves_no_trace_in_other_adapters() {
    let memory = MemoryManager::new(MemoryConfig::default()).unwrap();
    memory
        .store(
            MemoryItem::new(MemoryItemType::Knowledge, "a")
                .with_id("a")
                .with_embedding(vec![1.0, 0.0]),
        )
        .await
        .unwrap();

    let err = memory
        .store(
            MemoryItem::new(MemoryItemType::Knowledge, "b")
                .with_id("b")
                .with_embedding(vec![1.0, 0.0, 0.0]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation { .. }));

    let semantic = memory.retrieve_by_layer(MemoryLayer::Semantic).await.unwrap();
    let ids: Vec<&str> = semantic.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["a"]);
    assert!(memory.retrieve("b").await.unwrap_err().is_not_found());
    assert!(memory.adapter("graph").unwrap().read("b").await.is_err());
    assert_eq!(memory.current_version("b"), None);

    let id = memory
        .store(
            MemoryItem::new(MemoryItemType::Knowledge, "b")
                .with_id("b")
                .with_embedding(vec![0.0, 1.0]),
        )
        .await
        .unwrap();
    assert_eq!(memory.retrieve(&id).await.unwrap().version, 1);
}

#[tokio::test]
async fn fallback_keeps_a_label_serving_until_reconciled() {
    let document = Faulty::wrap(DocumentAdapter::new("document"));
    let kv = Faulty::wrap(KeyValueAdapter::new("kv"));
    let config = MemoryConfig::default()
        .with_cache_capacity(0)
        .with_fallback("document", ["kv"]);
    let memory = MemoryManager::with_adapters(config, dynamic(&[&document, &kv])).unwrap();

    document.fail_writes(true);
    document.fail_reads(true);
    let id = memory
        .store(MemoryItem::new(MemoryItemType::TaskHistory, "deploy failed").with_id("task-1"))
        .await
        .unwrap();
    assert_eq!(memory.retrieve(&id).await.unwrap().content_text(), "deploy failed");

    let status = memory.fallback_status("document").unwrap();
    assert_eq!(status.pending, 1);
    assert_ne!(status.primary.status, StoreStatus::Available);
    assert_eq!(status.fallbacks[0].label, "kv");
    assert!(memory.fallback_status("kv").is_none());

    document.fail_writes(false);
    document.fail_reads(false);
    assert_eq!(memory.reconcile("document").await.unwrap(), 1);
    assert_eq!(document.read(&id).await.unwrap().version, 1);
    assert_eq!(memory.fallback_status("document").unwrap().pending, 0);
    assert!(matches!(
        memory.reconcile("kv").await,
        Err(MemoryError::Validation { .. })
    ));
}

#[tokio::test]
async fn rejected_item_is_not_failed_over() {
    let vector = Faulty::wrap(VectorAdapter::new("vector").with_dimensions(2));
    let kv = Faulty::wrap(KeyValueAdapter::new("kv"));
    let config = MemoryConfig::default().with_fallback("vector", ["kv"]);
    let memory = MemoryManager::with_adapters(config, dynamic(&[&vector, &kv])).unwrap();

    let err = memory
        .store(
            MemoryItem::new(MemoryItemType::Knowledge, "wrong shape")
                .with_embedding(vec![1.0, 0.0, 0.0]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation { .. }));
    assert_eq!(kv.writes(), 0);
    let status = memory.fallback_status("vector").unwrap();
    assert_eq!(status.pending, 0);
    assert_eq!(status.primary.status, StoreStatus::Available);
}
