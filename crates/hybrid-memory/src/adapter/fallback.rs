//! Fallback adapter - keeps a label serving while its primary store is down
//!
//! Writes go to the primary and are mirrored onto the fallbacks. When the
//! primary fails with a backend error the write lands on the first working
//! fallback and is queued. The queue replays onto the primary, in order,
//! before its next write or on [`FallbackAdapter::reconcile`].
//!
//! Only backend failures ([`AdapterError::is_backend_failure`]) fail over.
//! A rejected item is rejected everywhere.

use super::{AdapterKind, AdapterStatsSnapshot, GraphTraversal, MemoryAdapter, VectorSearch};
use crate::config::FallbackConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::item::MemoryItem;
use crate::predicate::Predicate;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Health of one store behind a fallback adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    Available,
    /// Failed recently; still tried on every call
    Degraded,
    /// Failed `unavailable_after` times in a row; skipped until `retry_after` elapses
    Unavailable,
}

/// Point-in-time health of one member
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberStatus {
    pub label: String,
    pub status: StoreStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Health of a primary, its fallbacks and the replay queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackStatus {
    pub primary: MemberStatus,
    pub fallbacks: Vec<MemberStatus>,
    /// Operations accepted by a fallback and not yet replayed onto the primary
    pub pending: usize,
}

#[derive(Debug, Clone)]
enum PendingOp {
    Write(MemoryItem),
    Delete(String),
}

impl PendingOp {
    fn id(&self) -> &str {
        match self {
            Self::Write(item) => &item.id,
            Self::Delete(id) => id,
        }
    }
}

#[derive(Debug)]
struct Health {
    status: StoreStatus,
    failures: u32,
    last_error: Option<String>,
    last_failure: Option<Instant>,
}

impl Health {
    fn new() -> Self {
        Self {
            status: StoreStatus::Available,
            failures: 0,
            last_error: None,
            last_failure: None,
        }
    }

    fn allows(&self, retry_after: Duration) -> bool {
        match (self.status, self.last_failure) {
            (StoreStatus::Unavailable, Some(at)) => at.elapsed() >= retry_after,
            _ => true,
        }
    }

    fn succeeded(&mut self) {
        self.status = StoreStatus::Available;
        self.failures = 0;
        self.last_error = None;
    }

    fn failed(&mut self, err: &AdapterError, unavailable_after: u32) {
        self.failures = self.failures.saturating_add(1);
        self.last_error = Some(err.to_string());
        self.last_failure = Some(Instant::now());
        self.status = if self.failures >= unavailable_after {
            StoreStatus::Unavailable
        } else {
            StoreStatus::Degraded
        };
    }
}

struct Member {
    adapter: Arc<dyn MemoryAdapter>,
    health: Mutex<Health>,
}

impl Member {
    fn new(adapter: Arc<dyn MemoryAdapter>) -> Self {
        Self {
            adapter,
            health: Mutex::new(Health::new()),
        }
    }

    fn snapshot(&self) -> MemberStatus {
        let health = self.health.lock();
        MemberStatus {
            label: self.adapter.label().to_string(),
            status: health.status,
            consecutive_failures: health.failures,
            last_error: health.last_error.clone(),
        }
    }
}

/// A primary adapter backed by an ordered list of fallbacks.
///
/// Takes the primary's label and kind, so routing and subscriptions are
/// unaffected. Transactions are staged on the primary only.
pub struct FallbackAdapter {
    primary: Member,
    fallbacks: Vec<Member>,
    pending: Mutex<VecDeque<PendingOp>>,
    replay: tokio::sync::Mutex<()>,
    unavailable_after: u32,
    retry_after: Duration,
}

impl FallbackAdapter {
    /// Wrap `primary`; `fallbacks` are tried in order
    pub fn new(primary: Arc<dyn MemoryAdapter>, fallbacks: Vec<Arc<dyn MemoryAdapter>>) -> Self {
        let defaults = FallbackConfig::new(primary.label(), Vec::<String>::new());
        Self {
            primary: Member::new(primary),
            fallbacks: fallbacks.into_iter().map(Member::new).collect(),
            pending: Mutex::new(VecDeque::new()),
            replay: tokio::sync::Mutex::new(()),
            unavailable_after: defaults.unavailable_after,
            retry_after: defaults.retry_after(),
        }
    }

    /// Thresholds from configuration
    pub fn with_thresholds(mut self, config: &FallbackConfig) -> Self {
        self.unavailable_after = config.unavailable_after.max(1);
        self.retry_after = config.retry_after();
        self
    }

    pub fn primary(&self) -> &Arc<dyn MemoryAdapter> {
        &self.primary.adapter
    }

    /// Labels of the fallbacks, in failover order
    pub fn fallback_labels(&self) -> Vec<String> {
        self.fallbacks
            .iter()
            .map(|m| m.adapter.label().to_string())
            .collect()
    }

    pub fn status(&self) -> FallbackStatus {
        FallbackStatus {
            primary: self.primary.snapshot(),
            fallbacks: self.fallbacks.iter().map(Member::snapshot).collect(),
            pending: self.pending.lock().len(),
        }
    }

    /// Replay queued operations onto the primary.
    ///
    /// Stops at the first backend failure and leaves the rest queued.
    /// Returns the number of operations applied.
    pub async fn reconcile(&self) -> AdapterResult<usize> {
        let _replay = self.replay.lock().await;
        let mut applied = 0;
        loop {
            let Some(op) = self.pending.lock().front().cloned() else {
                break;
            };
            let result = match &op {
                PendingOp::Write(item) => self.primary.adapter.write(item.clone()).await.map(|_| ()),
                PendingOp::Delete(id) => self.primary.adapter.delete(id).await,
            };
            self.observe(&self.primary, &result);
            match result {
                Ok(()) => applied += 1,
                Err(err) if err.is_backend_failure() => {
                    tracing::warn!(
                        adapter = %self.label(),
                        pending = self.pending.lock().len(),
                        error = %err,
                        "replay stopped"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        adapter = %self.label(),
                        item_id = %op.id(),
                        error = %err,
                        "queued operation rejected by primary, dropped"
                    );
                }
            }
            self.pending.lock().pop_front();
        }
        if applied > 0 {
            tracing::info!(adapter = %self.label(), applied, "fallback writes replayed");
        }
        Ok(applied)
    }

    fn members(&self) -> impl Iterator<Item = &Member> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }

    fn usable(&self, member: &Member) -> bool {
        member.health.lock().allows(self.retry_after)
    }

    fn observe<T>(&self, member: &Member, result: &AdapterResult<T>) {
        match result {
            Err(err) if err.is_backend_failure() => {
                let mut health = member.health.lock();
                health.failed(err, self.unavailable_after);
                tracing::warn!(
                    adapter = %member.adapter.label(),
                    status = ?health.status,
                    failures = health.failures,
                    error = %err,
                    "store failed"
                );
            }
            _ => member.health.lock().succeeded(),
        }
    }

    fn exhausted(&self) -> AdapterError {
        AdapterError::Io(format!(
            "'{}' and its fallbacks are unavailable",
            self.label()
        ))
    }

    /// Primary first, then each fallback, until one answers.
    ///
    /// `NotFound` falls through as well, since the item may only exist on a
    /// fallback until the queue is replayed.
    async fn read_through<T, F, Fut>(&self, op: F) -> AdapterResult<T>
    where
        F: Fn(Arc<dyn MemoryAdapter>) -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let mut not_found = None;
        let mut failure = None;
        for member in self.members() {
            if !self.usable(member) {
                continue;
            }
            let result = op(member.adapter.clone()).await;
            self.observe(member, &result);
            match result {
                Ok(value) => return Ok(value),
                Err(err @ AdapterError::NotFound { .. }) => {
                    not_found.get_or_insert(err);
                }
                Err(err) if err.is_backend_failure() => failure = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(not_found.or(failure).unwrap_or_else(|| self.exhausted()))
    }

    /// Copy a write accepted by the primary onto every usable fallback
    async fn mirror(&self, item: &MemoryItem) {
        for member in &self.fallbacks {
            if !self.usable(member) {
                continue;
            }
            let result = member.adapter.write(item.clone()).await;
            self.observe(member, &result);
            if let Err(err) = result {
                tracing::debug!(
                    adapter = %member.adapter.label(),
                    item_id = %item.id,
                    error = %err,
                    "mirror write skipped"
                );
            }
        }
    }

    fn enqueue(&self, op: PendingOp) {
        let mut pending = self.pending.lock();
        tracing::warn!(
            adapter = %self.primary.adapter.label(),
            item_id = %op.id(),
            pending = pending.len() + 1,
            "primary unavailable, operation queued for replay"
        );
        pending.push_back(op);
    }

    /// Replay the queue when the primary may be back; true when it is empty
    async fn primary_ready(&self) -> bool {
        if !self.usable(&self.primary) {
            return false;
        }
        if self.pending.lock().is_empty() {
            return true;
        }
        self.reconcile().await.is_ok()
    }
}

#[async_trait]
impl MemoryAdapter for FallbackAdapter {
    fn label(&self) -> &str {
        self.primary.adapter.label()
    }

    fn kind(&self) -> AdapterKind {
        self.primary.adapter.kind()
    }

    async fn write(&self, item: MemoryItem) -> AdapterResult<u64> {
        let mut failure = None;
        if self.primary_ready().await {
            let result = self.primary.adapter.write(item.clone()).await;
            self.observe(&self.primary, &result);
            match result {
                Ok(version) => {
                    let mut mirrored = item;
                    mirrored.version = version;
                    self.mirror(&mirrored).await;
                    return Ok(version);
                }
                Err(err) if err.is_backend_failure() => failure = Some(err),
                Err(err) => return Err(err),
            }
        }

        for member in &self.fallbacks {
            if !self.usable(member) {
                continue;
            }
            let result = member.adapter.write(item.clone()).await;
            self.observe(member, &result);
            match result {
                Ok(version) => {
                    let mut queued = item;
                    queued.version = version;
                    self.enqueue(PendingOp::Write(queued));
                    return Ok(version);
                }
                Err(err) if err.is_backend_failure() => failure = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(failure.unwrap_or_else(|| self.exhausted()))
    }

    async fn read(&self, id: &str) -> AdapterResult<MemoryItem> {
        self.read_through(|adapter| async move { adapter.read(id).await })
            .await
    }

    async fn read_version(&self, id: &str, version: u64) -> AdapterResult<MemoryItem> {
        self.read_through(|adapter| async move { adapter.read_version(id, version).await })
            .await
    }

    async fn history(&self, id: &str) -> AdapterResult<Vec<MemoryItem>> {
        self.read_through(|adapter| async move { adapter.history(id).await })
            .await
    }

    async fn delete(&self, id: &str) -> AdapterResult<()> {
        let primary = if self.primary_ready().await {
            let result = self.primary.adapter.delete(id).await;
            self.observe(&self.primary, &result);
            Some(result)
        } else {
            None
        };

        let mut fallback_deleted = false;
        for member in &self.fallbacks {
            if !self.usable(member) {
                continue;
            }
            let result = member.adapter.delete(id).await;
            self.observe(member, &result);
            fallback_deleted |= result.is_ok();
        }

        match primary {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) if !err.is_backend_failure() => {
                if fallback_deleted {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Some(Err(err)) if !fallback_deleted => Err(err),
            None if !fallback_deleted => Err(self.exhausted()),
            _ => {
                self.enqueue(PendingOp::Delete(id.to_string()));
                Ok(())
            }
        }
    }

    async fn query_by_metadata(&self, predicate: &Predicate) -> AdapterResult<Vec<MemoryItem>> {
        self.read_through(|adapter| async move { adapter.query_by_metadata(predicate).await })
            .await
    }

    async fn revert(&self, id: &str, version: u64) -> AdapterResult<()> {
        // replay pops the front after applying it
        let _replay = self.replay.lock().await;
        self.pending.lock().retain(|op| {
            !matches!(op, PendingOp::Write(item) if item.id == id && item.version == version)
        });

        let mut outcome = Err(AdapterError::version_not_found(id, version));
        for member in self.members() {
            if !self.usable(member) {
                continue;
            }
            match member.adapter.revert(id, version).await {
                Ok(()) => outcome = Ok(()),
                Err(err) if outcome.is_err() && !matches!(err, AdapterError::NotFound { .. }) => {
                    outcome = Err(err)
                }
                Err(_) => {}
            }
        }
        outcome
    }

    fn as_vector(&self) -> Option<&dyn VectorSearch> {
        self.primary.adapter.as_vector()
    }

    fn as_graph(&self) -> Option<&dyn GraphTraversal> {
        self.primary.adapter.as_graph()
    }

    fn supports_transactions(&self) -> bool {
        self.primary.adapter.supports_transactions()
    }

    async fn prepare(&self, transaction_id: &str, item: MemoryItem) -> AdapterResult<()> {
        self.primary.adapter.prepare(transaction_id, item).await
    }

    async fn commit(&self, transaction_id: &str) -> AdapterResult<Vec<(String, u64)>> {
        self.primary.adapter.commit(transaction_id).await
    }

    async fn rollback(&self, transaction_id: &str) -> AdapterResult<()> {
        self.primary.adapter.rollback(transaction_id).await
    }

    async fn finalize(&self, transaction_id: &str) -> AdapterResult<()> {
        self.primary.adapter.finalize(transaction_id).await
    }

    fn stats(&self) -> AdapterStatsSnapshot {
        self.primary.adapter.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{DocumentAdapter, KeyValueAdapter};
    use crate::item::MemoryItemType;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Key-value store that can be switched off
    struct Switchable {
        inner: KeyValueAdapter,
        down: AtomicBool,
    }

    impl Switchable {
        fn new(label: &str) -> Arc<Self> {
            Arc::new(Self {
                inner: KeyValueAdapter::new(label),
                down: AtomicBool::new(false),
            })
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> AdapterResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AdapterError::Io("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MemoryAdapter for Switchable {
        fn label(&self) -> &str {
            self.inner.label()
        }

        fn kind(&self) -> AdapterKind {
            self.inner.kind()
        }

        async fn write(&self, item: MemoryItem) -> AdapterResult<u64> {
            self.check()?;
            self.inner.write(item).await
        }

        async fn read(&self, id: &str) -> AdapterResult<MemoryItem> {
            self.check()?;
            self.inner.read(id).await
        }

        async fn read_version(&self, id: &str, version: u64) -> AdapterResult<MemoryItem> {
            self.check()?;
            self.inner.read_version(id, version).await
        }

        async fn history(&self, id: &str) -> AdapterResult<Vec<MemoryItem>> {
            self.check()?;
            self.inner.history(id).await
        }

        async fn delete(&self, id: &str) -> AdapterResult<()> {
            self.check()?;
            self.inner.delete(id).await
        }

        async fn revert(&self, id: &str, version: u64) -> AdapterResult<()> {
            self.check()?;
            self.inner.revert(id, version).await
        }

        async fn query_by_metadata(&self, predicate: &Predicate) -> AdapterResult<Vec<MemoryItem>> {
            self.check()?;
            self.inner.query_by_metadata(predicate).await
        }
    }

    fn note(id: &str, text: &str, version: u64) -> MemoryItem {
        let mut item = MemoryItem::new(MemoryItemType::Context, text).with_id(id);
        item.version = version;
        item
    }

    fn pair() -> (Arc<Switchable>, Arc<DocumentAdapter>, FallbackAdapter) {
        let primary = Switchable::new("primary");
        let backup = Arc::new(DocumentAdapter::new("backup"));
        let adapter = FallbackAdapter::new(primary.clone(), vec![backup.clone()]);
        (primary, backup, adapter)
    }

    #[tokio::test]
    async fn test_healthy_writes_are_mirrored() {
        let (primary, backup, adapter) = pair();
        assert_eq!(adapter.label(), "primary");

        assert_eq!(adapter.write(note("a", "one", 1)).await.unwrap(), 1);
        assert_eq!(primary.inner.read("a").await.unwrap().version, 1);
        assert_eq!(backup.read("a").await.unwrap().version, 1);

        let status = adapter.status();
        assert_eq!(status.primary.status, StoreStatus::Available);
        assert_eq!(status.pending, 0);
    }

    #[tokio::test]
    async fn test_fails_over_and_replays_in_order() {
        let (primary, backup, adapter) = pair();
        adapter.write(note("a", "one", 1)).await.unwrap();

        primary.set_down(true);
        assert_eq!(adapter.write(note("a", "two", 2)).await.unwrap(), 2);
        adapter.write(note("b", "other", 1)).await.unwrap();

        let status = adapter.status();
        assert_eq!(status.primary.status, StoreStatus::Degraded);
        assert_eq!(status.pending, 2);
        assert_eq!(adapter.read("a").await.unwrap().content_text(), "two");
        assert_eq!(backup.read("b").await.unwrap().version, 1);

        primary.set_down(false);
        assert_eq!(adapter.reconcile().await.unwrap(), 2);
        assert_eq!(primary.inner.read("a").await.unwrap().content_text(), "two");
        assert_eq!(primary.inner.read("a").await.unwrap().version, 2);
        assert_eq!(primary.inner.read("b").await.unwrap().version, 1);
        assert_eq!(adapter.status().pending, 0);
        assert_eq!(adapter.status().primary.status, StoreStatus::Available);
    }

    #[tokio::test]
    async fn test_next_write_replays_queue_first() {
        let (primary, _backup, adapter) = pair();
        primary.set_down(true);
        adapter.write(note("a", "one", 1)).await.unwrap();

        primary.set_down(false);
        assert_eq!(adapter.write(note("a", "two", 2)).await.unwrap(), 2);

        let versions: Vec<u64> = primary
            .inner
            .history("a")
            .await
            .unwrap()
            .iter()
            .map(|i| i.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(adapter.status().pending, 0);
    }

    #[tokio::test]
    async fn test_primary_marked_unavailable_after_threshold() {
        let (primary, _backup, adapter) = pair();
        let adapter = adapter.with_thresholds(
            &FallbackConfig::new("primary", ["backup"])
                .with_unavailable_after(2)
                .with_retry_after(Duration::from_secs(60)),
        );
        primary.set_down(true);

        adapter.write(note("a", "one", 1)).await.unwrap();
        assert_eq!(adapter.status().primary.status, StoreStatus::Degraded);
        adapter.write(note("b", "one", 1)).await.unwrap();
        let status = adapter.status();
        assert_eq!(status.primary.status, StoreStatus::Unavailable);
        assert_eq!(status.primary.consecutive_failures, 2);
        assert!(status.primary.last_error.unwrap().contains("connection refused"));

        // skipped while cooling down, so the failure count stays put
        primary.set_down(false);
        adapter.write(note("c", "one", 1)).await.unwrap();
        assert_eq!(adapter.status().primary.consecutive_failures, 2);
        assert!(primary.inner.read("c").await.is_err());
        assert_eq!(adapter.status().pending, 3);
    }

    #[tokio::test]
    async fn test_rejections_do_not_fail_over() {
        let (_primary, backup, adapter) = pair();
        let err = adapter.write(note("", "no id", 1)).await.unwrap_err();
        assert!(matches!(err, AdapterError::Invalid(_)));
        assert_eq!(adapter.status().primary.status, StoreStatus::Available);
        assert_eq!(adapter.status().pending, 0);
        assert!(backup.query_by_metadata(&Predicate::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_during_outage_is_replayed() {
        let (primary, backup, adapter) = pair();
        adapter.write(note("a", "one", 1)).await.unwrap();

        primary.set_down(true);
        adapter.delete("a").await.unwrap();
        assert!(backup.read("a").await.is_err());
        assert!(matches!(adapter.read("a").await, Err(AdapterError::NotFound { .. })));

        primary.set_down(false);
        assert_eq!(adapter.reconcile().await.unwrap(), 1);
        assert!(primary.inner.read("a").await.is_err());
        assert_eq!(primary.inner.history("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revert_drops_queued_write() {
        let (primary, backup, adapter) = pair();
        primary.set_down(true);
        adapter.write(note("a", "one", 1)).await.unwrap();

        adapter.revert("a", 1).await.unwrap();
        assert_eq!(adapter.status().pending, 0);
        assert!(backup.read("a").await.is_err());
    }
}
