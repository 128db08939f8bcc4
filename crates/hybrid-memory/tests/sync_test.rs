//! Multi-store transactions, subscriptions and conflict resolution

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{dynamic, Faulty};
use hybrid_memory::prelude::*;
use hybrid_memory::{
    AdapterKind, ConflictPolicy, DocumentAdapter, KeyValueAdapter, SyncStatus, TransactionState,
    VectorAdapter,
};
use serde_json::json;
use std::time::Duration;

fn replicated(mode: SyncMode) -> (MemoryManager, std::sync::Arc<Faulty>, std::sync::Arc<Faulty>) {
    let primary = Faulty::wrap(KeyValueAdapter::new("primary"));
    let replica = Faulty::wrap(KeyValueAdapter::new("replica"));
    let config = MemoryConfig::default()
        .with_layer_route(MemoryLayer::ShortTerm, ["primary"])
        .with_subscription("primary", "replica", mode);
    let memory = MemoryManager::with_adapters(config, dynamic(&[&primary, &replica])).unwrap();
    (memory, primary, replica)
}

fn two_stores(policy: ConflictPolicy) -> MemoryManager {
    let adapters = dynamic(&[
        &Faulty::wrap(KeyValueAdapter::new("primary")),
        &Faulty::wrap(KeyValueAdapter::new("replica")),
    ]);
    let config = MemoryConfig::default().with_conflict_policy(policy);
    MemoryManager::with_adapters(config, adapters).unwrap()
}

/// Same id written independently to both stores, replica later
async fn diverge(memory: &MemoryManager) {
    let base = Utc::now();
    memory
        .store_in(
            "primary",
            MemoryItem::new(MemoryItemType::Knowledge, "old")
                .with_id("doc")
                .with_updated_at(base),
        )
        .await
        .unwrap();
    memory
        .store_in(
            "replica",
            MemoryItem::new(MemoryItemType::Knowledge, "new")
                .with_id("doc")
                .with_updated_at(base + ChronoDuration::seconds(5)),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_commit_leaves_every_store_unchanged() {
    let document = Faulty::wrap(DocumentAdapter::new("document"));
    let kv = Faulty::wrap(KeyValueAdapter::new("kv"));
    let vector = Faulty::wrap(VectorAdapter::new("vector"));
    let memory =
        MemoryManager::with_adapters(MemoryConfig::default(), dynamic(&[&document, &kv, &vector]))
            .unwrap();

    let seeds = [("document", "a"), ("kv", "b"), ("vector", "c")];
    for (label, id) in seeds {
        memory
            .store_in(label, MemoryItem::new(MemoryItemType::Knowledge, "original").with_id(id))
            .await
            .unwrap();
    }

    vector.fail_commit(true);
    let mut tx = memory.transaction();
    for (label, id) in seeds {
        let current = memory.retrieve(id).await.unwrap();
        tx = tx.write(label, current.revise("changed"));
    }
    let err = tx.execute().await.unwrap_err();
    assert!(matches!(err, MemoryError::TransactionAborted { .. }));

    for (label, id) in seeds {
        let item = memory.retrieve(id).await.unwrap();
        assert_eq!(item.content, json!("original"), "{id} in {label}");
        assert_eq!(item.version, 1);
        let history = memory.adapter(label).unwrap().history(id).await.unwrap();
        assert_eq!(history.len(), 1, "{id} in {label}");
    }
}

#[tokio::test]
async fn transaction_commits_across_routed_stores() {
    let memory = MemoryManager::new(MemoryConfig::default()).unwrap();
    let outcome = memory
        .transaction()
        .write_layer(MemoryItem::new(MemoryItemType::Knowledge, "shared fact").with_id("fact"))
        .write("kv", MemoryItem::new(MemoryItemType::Context, "scratch").with_id("note"))
        .execute()
        .await
        .unwrap();

    assert_eq!(outcome.state, TransactionState::Committed);
    assert!(outcome.atomic);
    assert_eq!(outcome.writes.len(), 3);
    assert_eq!(memory.retrieve("fact").await.unwrap().content, json!("shared fact"));
    assert!(memory.adapter("graph").unwrap().read("fact").await.is_ok());
    assert_eq!(memory.current_version("note"), Some(1));
}

#[tokio::test]
async fn transaction_without_staging_support_is_best_effort() {
    let config = MemoryConfig::default().with_transactional(AdapterKind::KeyValue, false);
    let memory = MemoryManager::new(config).unwrap();
    let outcome = memory
        .transaction()
        .write("kv", MemoryItem::new(MemoryItemType::Context, "a").with_id("a"))
        .write("document", MemoryItem::new(MemoryItemType::TaskHistory, "b").with_id("b"))
        .execute()
        .await
        .unwrap();

    assert!(!outcome.atomic);
    assert_eq!(outcome.state, TransactionState::Committed);
    assert!(outcome.warnings[0].contains("kv"));
}

#[tokio::test]
async fn last_writer_wins_and_is_audited() {
    for _ in 0..3 {
        let memory = two_stores(ConflictPolicy::LastWriterWins);
        diverge(&memory).await;

        let stats = memory.synchronize("primary", "replica", false).await.unwrap();
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.synchronized, 1);

        for label in ["primary", "replica"] {
            let item = memory.adapter(label).unwrap().read("doc").await.unwrap();
            assert_eq!(item.content, json!("new"), "{label}");
        }
        let history = memory.adapter("primary").unwrap().history("doc").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, json!("old"));

        let audit = memory.conflicts();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].winner.as_deref(), Some("replica"));
        assert_eq!(audit[0].resolved_version, Some(2));
        assert!(audit[0].target_updated_at > audit[0].source_updated_at);

        let again = memory.synchronize("primary", "replica", false).await.unwrap();
        assert_eq!((again.synchronized, again.conflicts), (0, 0));
    }
}

#[tokio::test]
async fn equal_timestamps_favour_the_source() {
    let memory = two_stores(ConflictPolicy::LastWriterWins);
    let at = Utc::now();
    for (label, content) in [("primary", "from primary"), ("replica", "from replica")] {
        memory
            .store_in(
                label,
                MemoryItem::new(MemoryItemType::Knowledge, content)
                    .with_id("doc")
                    .with_updated_at(at),
            )
            .await
            .unwrap();
    }

    memory.synchronize("primary", "replica", false).await.unwrap();
    let replica = memory.adapter("replica").unwrap().read("doc").await.unwrap();
    assert_eq!(replica.content, json!("from primary"));
    assert_eq!(replica.version, 3);
    assert_eq!(memory.conflicts()[0].winner.as_deref(), Some("primary"));
}

#[tokio::test]
async fn reject_policy_leaves_both_sides() {
    let memory = two_stores(ConflictPolicy::Reject);
    diverge(&memory).await;

    let stats = memory.synchronize("primary", "replica", false).await.unwrap();
    assert_eq!((stats.synchronized, stats.conflicts), (0, 1));

    let primary = memory.adapter("primary").unwrap().read("doc").await.unwrap();
    assert_eq!(primary.content, json!("old"));
    assert!(memory.conflicts()[0].winner.is_none());
}

#[tokio::test]
async fn async_subscription_flags_stale_hits_until_flushed() {
    let (memory, _primary, replica) = replicated(SyncMode::Async);
    replica.set_latency(Duration::from_millis(30));

    let id = memory
        .store(MemoryItem::new(MemoryItemType::Context, "draft plan"))
        .await
        .unwrap();
    assert!(memory.is_sync_pending(&id));

    let response = memory
        .query(&QueryStrategy::direct("primary"), &MemoryQuery::new())
        .await
        .unwrap();
    assert!(response.hits[0].possibly_stale);

    memory.flush_sync().await;
    assert!(!memory.is_sync_pending(&id));

    let copy = memory.adapter("replica").unwrap().read(&id).await.unwrap();
    assert_eq!(copy.content, json!("draft plan"));

    let records = memory.sync_records(&id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SyncStatus::Propagated);
    assert_eq!(records[0].propagated_version, Some(1));

    let response = memory
        .query(&QueryStrategy::direct("primary"), &MemoryQuery::new())
        .await
        .unwrap();
    assert!(!response.hits[0].possibly_stale);
    assert_eq!(memory.sync_stats().synchronized, 1);

    memory.shutdown().await;
}

#[tokio::test]
async fn sync_subscription_failure_fails_the_store() {
    let (memory, _primary, replica) = replicated(SyncMode::Sync);

    let ok = memory
        .store(MemoryItem::new(MemoryItemType::Context, "replicated").with_id("ok"))
        .await
        .unwrap();
    assert!(memory.adapter("replica").unwrap().read(&ok).await.is_ok());

    replica.fail_writes(true);
    let err = memory
        .store(MemoryItem::new(MemoryItemType::Context, "lost").with_id("bad"))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::BackendUnavailable { ref adapter, .. } if adapter == "replica"));

    let records = memory.sync_records("bad");
    assert_eq!(records[0].status, SyncStatus::Failed);
    assert!(records[0].last_error.is_some());
    assert_eq!(memory.sync_stats().failed, 1);
}

#[tokio::test]
async fn deletes_propagate_to_subscribers() {
    let (memory, _primary, _replica) = replicated(SyncMode::Sync);
    let id = memory
        .store(MemoryItem::new(MemoryItemType::Context, "temporary"))
        .await
        .unwrap();
    memory.delete(&id).await.unwrap();

    let err = memory.adapter("replica").unwrap().read(&id).await.unwrap_err();
    assert!(matches!(err, hybrid_memory::AdapterError::NotFound { .. }));
}
