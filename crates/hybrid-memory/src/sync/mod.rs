//! # Synchronization Engine
//!
//! Replicates writes between adapters according to explicit subscriptions
//! `(source, target, mode)`.
//!
//! - **SYNC** subscriptions propagate inside the caller's `store`; a failure
//!   fails the store.
//! - **ASYNC** subscriptions enqueue a [`SyncRecord`] on a bounded channel
//!   drained by background workers. Workers take a per-key lease and
//!   propagation is idempotent, so replaying a record is harmless.
//!
//! A conflict exists when both sides changed since the last successful sync
//! of an id. Under [`ConflictPolicy::LastWriterWins`] the later `updated_at`
//! is written as a new version on the losing side (the loser stays in
//! history) and a [`ConflictRecord`] is appended to the audit log.

mod retry;
mod transaction;

pub use crate::config::{ConflictPolicy, SubscriptionConfig, SyncMode};
pub use retry::RetryPolicy;
pub use transaction::{AppliedWrite, Transaction, TransactionOp, TransactionOutcome, TransactionState};

use crate::adapter::AdapterRegistry;
use crate::cache::TieredCache;
use crate::catalog::Catalog;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::item::MemoryItem;
use crate::predicate::Predicate;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type SyncKey = (String, String, String);

/// Lifecycle of a propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Propagated,
    Conflict,
    /// Retries exhausted
    Failed,
}

/// Latest propagation state of one id along one subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub item_id: String,
    pub source_adapter: String,
    pub target_adapter: String,
    pub source_version: u64,
    pub propagated_version: Option<u64>,
    pub status: SyncStatus,
    pub attempts: u32,
    pub detected_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Audit entry for divergent updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub item_id: String,
    pub source_adapter: String,
    pub target_adapter: String,
    pub source_version: u64,
    pub source_updated_at: DateTime<Utc>,
    pub target_version: u64,
    pub target_updated_at: DateTime<Utc>,
    /// Adapter whose version became canonical; `None` when rejected
    pub winner: Option<String>,
    /// Version written on the losing side
    pub resolved_version: Option<u64>,
    pub detected_at: DateTime<Utc>,
}

/// Cumulative counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub synchronized: u64,
    pub conflicts: u64,
    pub failed: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOp {
    Write,
    Delete,
}

#[derive(Debug, Clone)]
struct SyncTask {
    id: String,
    source: String,
    target: String,
    version: u64,
    op: SyncOp,
}

impl SyncTask {
    fn key(&self) -> SyncKey {
        (self.id.clone(), self.source.clone(), self.target.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Propagated,
    InSync,
    Resolved,
    Skipped,
}

/// Subscription-driven replication between adapters
pub struct SyncEngine {
    registry: Arc<AdapterRegistry>,
    catalog: Arc<Catalog>,
    cache: Arc<TieredCache<MemoryItem>>,
    subscriptions: Vec<SubscriptionConfig>,
    policy: ConflictPolicy,
    retry: RetryPolicy,
    records: DashMap<SyncKey, SyncRecord>,
    /// `(source_version, target_version)` at the last successful sync
    watermarks: DashMap<SyncKey, (u64, u64)>,
    leases: DashMap<SyncKey, Arc<tokio::sync::Mutex<()>>>,
    audit: Mutex<Vec<ConflictRecord>>,
    pending: DashMap<String, usize>,
    pending_total: AtomicUsize,
    idle: Notify,
    sender: Mutex<Option<mpsc::Sender<SyncTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    synchronized: AtomicU64,
    conflicts: AtomicU64,
    failed: AtomicU64,
}

impl SyncEngine {
    /// Create the engine and spawn workers when any subscription is async
    pub fn start(
        registry: Arc<AdapterRegistry>,
        catalog: Arc<Catalog>,
        cache: Arc<TieredCache<MemoryItem>>,
        config: &MemoryConfig,
    ) -> MemoryResult<Arc<Self>> {
        for sub in &config.subscriptions {
            if sub.source == sub.target {
                return Err(MemoryError::config(format!(
                    "subscription '{}' loops onto itself",
                    sub.source
                )));
            }
            registry.get(&sub.source)?;
            registry.get(&sub.target)?;
        }

        let engine = Arc::new(Self {
            registry,
            catalog,
            cache,
            subscriptions: config.subscriptions.clone(),
            policy: config.conflict_policy,
            retry: RetryPolicy::new(&config.retry),
            records: DashMap::new(),
            watermarks: DashMap::new(),
            leases: DashMap::new(),
            audit: Mutex::new(Vec::new()),
            pending: DashMap::new(),
            pending_total: AtomicUsize::new(0),
            idle: Notify::new(),
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            synchronized: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        if engine.subscriptions.iter().any(|s| s.mode == SyncMode::Async) {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                MemoryError::config("async subscriptions require a running tokio runtime")
            })?;
            let (tx, rx) = mpsc::channel(config.sync_queue_capacity.max(1));
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            *engine.sender.lock() = Some(tx);

            let mut workers = engine.workers.lock();
            for worker_id in 0..config.sync_workers.max(1) {
                workers.push(runtime.spawn(run_worker(
                    worker_id,
                    Arc::downgrade(&engine),
                    rx.clone(),
                    engine.cancel.clone(),
                )));
            }
            drop(workers);
        }

        tracing::info!(
            subscriptions = engine.subscriptions.len(),
            workers = engine.workers.lock().len(),
            "sync engine started"
        );
        Ok(engine)
    }

    /// Configured subscriptions
    pub fn subscriptions(&self) -> &[SubscriptionConfig] {
        &self.subscriptions
    }

    /// Propagate a write made by the manager to `source`
    pub async fn on_write(&self, id: &str, source: &str, version: u64) -> MemoryResult<()> {
        self.dispatch(id, source, version, SyncOp::Write).await
    }

    /// Propagate a tombstone made by the manager in `source`
    pub async fn on_delete(&self, id: &str, source: &str) -> MemoryResult<()> {
        self.dispatch(id, source, 0, SyncOp::Delete).await
    }

    async fn dispatch(&self, id: &str, source: &str, version: u64, op: SyncOp) -> MemoryResult<()> {
        for sub in self.subscriptions.iter().filter(|s| s.source == source) {
            let task = SyncTask {
                id: id.to_string(),
                source: sub.source.clone(),
                target: sub.target.clone(),
                version,
                op,
            };
            match sub.mode {
                SyncMode::Sync => {
                    self.record(&task, SyncStatus::Pending, None, 0, None);
                    if let Err(err) = self.propagate(&task).await {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        self.record(&task, SyncStatus::Failed, None, 1, Some(err.to_string()));
                        return Err(err);
                    }
                }
                SyncMode::Async => self.enqueue(task).await,
            }
        }
        Ok(())
    }

    async fn enqueue(&self, task: SyncTask) {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            tracing::warn!(item_id = %task.id, target = %task.target, "sync queue closed, dropping record");
            self.record(&task, SyncStatus::Failed, None, 0, Some("sync engine shut down".into()));
            return;
        };

        self.record(&task, SyncStatus::Pending, None, 0, None);
        *self.pending.entry(task.id.clone()).or_insert(0) += 1;
        self.pending_total.fetch_add(1, Ordering::SeqCst);

        let id = task.id.clone();
        if let Err(mpsc::error::SendError(task)) = sender.send(task).await {
            tracing::warn!(item_id = %task.id, "sync queue closed, dropping record");
            self.record(&task, SyncStatus::Failed, None, 0, Some("sync engine shut down".into()));
            self.finish_pending(&id);
        }
    }

    async fn process(&self, task: SyncTask) {
        let (attempts, result) = self.retry.run(&self.cancel, || self.propagate(&task)).await;
        match result {
            Ok(_) => {}
            Err(MemoryError::Conflict { .. }) => {}
            Err(MemoryError::Cancelled) => {
                self.record(&task, SyncStatus::Pending, None, attempts, Some("cancelled".into()));
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    item_id = %task.id,
                    source = %task.source,
                    target = %task.target,
                    attempts,
                    error = %err,
                    "async propagation failed"
                );
                self.record(&task, SyncStatus::Failed, None, attempts, Some(err.to_string()));
            }
        }
        self.finish_pending(&task.id);
    }

    async fn propagate(&self, task: &SyncTask) -> MemoryResult<Outcome> {
        let key = task.key();
        let lease = self.leases.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lease.lock().await;
            match task.op {
                SyncOp::Write => self.propagate_write(task).await,
                SyncOp::Delete => self.propagate_delete(task).await,
            }
        };

        // only the map holds an uncontended lease
        drop(lease);
        self.leases.remove_if(&key, |_, lease| Arc::strong_count(lease) == 1);
        result
    }

    async fn propagate_write(&self, task: &SyncTask) -> MemoryResult<Outcome> {
        let source = self.registry.get(&task.source)?;
        let target = self.registry.get(&task.target)?;

        let src = match self.registry.call(&task.source, source.read(&task.id)).await {
            Ok(item) => item,
            Err(err) if err.is_not_found() => return Ok(Outcome::Skipped),
            Err(err) => return Err(err),
        };

        let watermark = self.watermarks.get(&task.key()).map(|w| *w);
        if let Some((seen, synced)) = watermark {
            if src.version <= seen {
                self.record(task, SyncStatus::Propagated, Some(synced), 1, None);
                return Ok(Outcome::Skipped);
            }
        }

        let tgt = match self.registry.call(&task.target, target.read(&task.id)).await {
            Ok(item) => Some(item),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        match tgt {
            Some(tgt) if tgt.same_payload(&src) => {
                self.mark_synced(task, src.version, tgt.version);
                self.record(task, SyncStatus::Propagated, Some(tgt.version), 1, None);
                Ok(Outcome::InSync)
            }
            Some(tgt) if watermark.map_or(true, |(_, seen)| tgt.version > seen) => {
                self.resolve_conflict(task, src, tgt).await
            }
            _ => {
                let version = self
                    .registry
                    .call(&task.target, target.write(src.clone()))
                    .await?;
                self.applied(&src, &task.target, version);
                self.mark_synced(task, src.version, version);
                self.record(task, SyncStatus::Propagated, Some(version), 1, None);
                self.synchronized.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    item_id = %task.id,
                    source = %task.source,
                    target = %task.target,
                    version,
                    "propagated"
                );
                Ok(Outcome::Propagated)
            }
        }
    }

    async fn resolve_conflict(
        &self,
        task: &SyncTask,
        src: MemoryItem,
        tgt: MemoryItem,
    ) -> MemoryResult<Outcome> {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        let mut entry = ConflictRecord {
            item_id: task.id.clone(),
            source_adapter: task.source.clone(),
            target_adapter: task.target.clone(),
            source_version: src.version,
            source_updated_at: src.updated_at,
            target_version: tgt.version,
            target_updated_at: tgt.updated_at,
            winner: None,
            resolved_version: None,
            detected_at: Utc::now(),
        };

        if self.policy == ConflictPolicy::Reject {
            tracing::warn!(item_id = %task.id, source = %task.source, target = %task.target, "conflict rejected");
            self.audit.lock().push(entry);
            self.record(task, SyncStatus::Conflict, None, 1, Some("conflict rejected".into()));
            return Err(MemoryError::Conflict {
                id: task.id.clone(),
                source_adapter: task.source.clone(),
                target_adapter: task.target.clone(),
            });
        }

        let (winner, resolved) = if tgt.updated_at > src.updated_at {
            let source = self.registry.get(&task.source)?;
            let version = self
                .registry
                .call(&task.source, source.write(tgt.clone()))
                .await?;
            self.applied(&tgt, &task.source, version);
            self.mark_synced(task, version, tgt.version);
            (task.target.clone(), version)
        } else {
            let target = self.registry.get(&task.target)?;
            let version = self
                .registry
                .call(&task.target, target.write(src.clone()))
                .await?;
            self.applied(&src, &task.target, version);
            self.mark_synced(task, src.version, version);
            (task.source.clone(), version)
        };

        tracing::warn!(
            item_id = %task.id,
            winner = %winner,
            source_version = src.version,
            target_version = tgt.version,
            resolved_version = resolved,
            "conflict resolved by last writer"
        );
        entry.winner = Some(winner);
        entry.resolved_version = Some(resolved);
        self.audit.lock().push(entry);
        self.record(task, SyncStatus::Conflict, Some(resolved), 1, None);
        Ok(Outcome::Resolved)
    }

    async fn propagate_delete(&self, task: &SyncTask) -> MemoryResult<Outcome> {
        let target = self.registry.get(&task.target)?;
        match self.registry.call(&task.target, target.delete(&task.id)).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.cache.invalidate(&task.id);
        // deleted ids are never reused
        self.watermarks.remove(&task.key());
        self.watermarks
            .remove(&(task.id.clone(), task.target.clone(), task.source.clone()));
        self.record(task, SyncStatus::Propagated, None, 1, None);
        Ok(Outcome::Propagated)
    }

    /// Copy every current item of `source` into `target` under the conflict rules
    pub async fn synchronize(
        &self,
        source: &str,
        target: &str,
        bidirectional: bool,
    ) -> MemoryResult<SyncStats> {
        let mut stats = self.synchronize_one_way(source, target).await?;
        if bidirectional {
            let reverse = self.synchronize_one_way(target, source).await?;
            stats.synchronized += reverse.synchronized;
            stats.conflicts += reverse.conflicts;
        }
        tracing::info!(
            source = %source,
            target = %target,
            bidirectional,
            synchronized = stats.synchronized,
            conflicts = stats.conflicts,
            "batch synchronization finished"
        );
        Ok(stats)
    }

    async fn synchronize_one_way(&self, source: &str, target: &str) -> MemoryResult<SyncStats> {
        if source == target {
            return Err(MemoryError::validation("target", "must differ from source", target));
        }
        let adapter = self.registry.get(source)?;
        self.registry.get(target)?;
        let items = self
            .registry
            .call(source, adapter.query_by_metadata(&Predicate::All))
            .await?;

        let mut stats = SyncStats::default();
        for item in items {
            let task = SyncTask {
                id: item.id.clone(),
                source: source.to_string(),
                target: target.to_string(),
                version: item.version,
                op: SyncOp::Write,
            };
            match self.propagate(&task).await {
                Ok(Outcome::Propagated) => stats.synchronized += 1,
                Ok(Outcome::Resolved) => {
                    stats.synchronized += 1;
                    stats.conflicts += 1;
                }
                Ok(Outcome::InSync | Outcome::Skipped) => {}
                Err(MemoryError::Conflict { .. }) => stats.conflicts += 1,
                Err(err) => return Err(err),
            }
        }
        Ok(stats)
    }

    fn applied(&self, item: &MemoryItem, adapter: &str, version: u64) {
        let mut written = item.clone();
        written.version = version;
        self.catalog.observe(&written, adapter);
        self.cache.invalidate(&item.id);
    }

    fn mark_synced(&self, task: &SyncTask, source_version: u64, target_version: u64) {
        self.watermarks
            .insert(task.key(), (source_version, target_version));
        self.watermarks.insert(
            (task.id.clone(), task.target.clone(), task.source.clone()),
            (target_version, source_version),
        );
    }

    fn record(
        &self,
        task: &SyncTask,
        status: SyncStatus,
        propagated_version: Option<u64>,
        attempts: u32,
        last_error: Option<String>,
    ) {
        let mut record = self.records.entry(task.key()).or_insert_with(|| SyncRecord {
            item_id: task.id.clone(),
            source_adapter: task.source.clone(),
            target_adapter: task.target.clone(),
            source_version: task.version,
            propagated_version: None,
            status,
            attempts: 0,
            detected_at: Utc::now(),
            last_error: None,
        });
        if status == SyncStatus::Pending {
            record.source_version = task.version;
            record.detected_at = Utc::now();
            record.attempts = 0;
        }
        record.status = status;
        record.attempts = record.attempts.max(attempts);
        if propagated_version.is_some() {
            record.propagated_version = propagated_version;
        }
        record.last_error = last_error;
    }

    fn finish_pending(&self, id: &str) {
        let cleared = match self.pending.get_mut(id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if cleared {
            self.pending.remove_if(id, |_, count| *count == 0);
        }
        if self.pending_total.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Whether `id` has async propagation outstanding
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.get(id).map(|c| *c > 0).unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_total.load(Ordering::SeqCst)
    }

    /// Wait until no async record is pending
    pub async fn flush(&self) {
        loop {
            let idle = self.idle.notified();
            if self.pending_total.load(Ordering::SeqCst) == 0 || self.cancel.is_cancelled() {
                return;
            }
            idle.await;
        }
    }

    /// Stop the workers; records still queued stay `PENDING`
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        self.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "sync worker ended abnormally");
            }
        }
        self.idle.notify_waiters();
        tracing::info!(pending = self.pending_count(), "sync engine stopped");
    }

    /// Latest record per subscription for `id`
    pub fn records(&self, id: &str) -> Vec<SyncRecord> {
        let mut records: Vec<SyncRecord> = self
            .records
            .iter()
            .filter(|r| r.key().0 == id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            (&a.source_adapter, &a.target_adapter).cmp(&(&b.source_adapter, &b.target_adapter))
        });
        records
    }

    /// Conflict audit log, oldest first
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.audit.lock().clone()
    }

    /// Cumulative counters plus the current pending count
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            synchronized: self.synchronized.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: self.pending_count() as u64,
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(
    worker_id: usize,
    engine: Weak<SyncEngine>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<SyncTask>>>,
    cancel: CancellationToken,
) {
    tracing::info!(worker_id, "sync worker started");
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = async { queue.lock().await.recv().await } => task,
        };
        let Some(task) = task else { break };
        let Some(engine) = engine.upgrade() else { break };
        engine.process(task).await;
    }
    tracing::info!(worker_id, "sync worker stopped");
}
