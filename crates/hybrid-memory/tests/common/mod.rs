//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use hybrid_memory::adapter::AdapterStatsSnapshot;
use hybrid_memory::{
    AdapterError, AdapterKind, AdapterResult, GraphTraversal, MemoryAdapter, MemoryItem,
    Predicate, VectorSearch,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wraps an adapter with call counting, failure switches and latency
pub struct Faulty {
    inner: Arc<dyn MemoryAdapter>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_commit: AtomicBool,
    latency: Mutex<Duration>,
}

impl Faulty {
    pub fn wrap(inner: impl MemoryAdapter + 'static) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(inner),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
        })
    }

    /// Read-side calls so far (read, read_version, history, queries)
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, on: bool) {
        self.fail_commit.store(on, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    async fn before_read(&self) -> AdapterResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AdapterError::Io("injected read failure".into()));
        }
        Ok(())
    }

    async fn before_write(&self) -> AdapterResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AdapterError::Io("injected write failure".into()));
        }
        Ok(())
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl MemoryAdapter for Faulty {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn kind(&self) -> AdapterKind {
        self.inner.kind()
    }

    async fn write(&self, item: MemoryItem) -> AdapterResult<u64> {
        self.before_write().await?;
        self.inner.write(item).await
    }

    async fn read(&self, id: &str) -> AdapterResult<MemoryItem> {
        self.before_read().await?;
        self.inner.read(id).await
    }

    async fn read_version(&self, id: &str, version: u64) -> AdapterResult<MemoryItem> {
        self.before_read().await?;
        self.inner.read_version(id, version).await
    }

    async fn history(&self, id: &str) -> AdapterResult<Vec<MemoryItem>> {
        self.before_read().await?;
        self.inner.history(id).await
    }

    async fn delete(&self, id: &str) -> AdapterResult<()> {
        self.before_write().await?;
        self.inner.delete(id).await
    }

    async fn revert(&self, id: &str, version: u64) -> AdapterResult<()> {
        self.inner.revert(id, version).await
    }

    async fn query_by_metadata(&self, predicate: &Predicate) -> AdapterResult<Vec<MemoryItem>> {
        self.before_read().await?;
        self.inner.query_by_metadata(predicate).await
    }

    fn as_vector(&self) -> Option<&dyn VectorSearch> {
        self.inner.as_vector()
    }

    fn as_graph(&self) -> Option<&dyn GraphTraversal> {
        self.inner.as_graph()
    }

    fn supports_transactions(&self) -> bool {
        self.inner.supports_transactions()
    }

    async fn prepare(&self, transaction_id: &str, item: MemoryItem) -> AdapterResult<()> {
        self.before_write().await?;
        self.inner.prepare(transaction_id, item).await
    }

    async fn commit(&self, transaction_id: &str) -> AdapterResult<Vec<(String, u64)>> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(AdapterError::Io("injected commit failure".into()));
        }
        self.inner.commit(transaction_id).await
    }

    async fn rollback(&self, transaction_id: &str) -> AdapterResult<()> {
        self.inner.rollback(transaction_id).await
    }

    async fn finalize(&self, transaction_id: &str) -> AdapterResult<()> {
        self.inner.finalize(transaction_id).await
    }

    fn stats(&self) -> AdapterStatsSnapshot {
        self.inner.stats()
    }
}

/// Upcast for `MemoryManager::with_adapters`
pub fn dynamic(adapters: &[&Arc<Faulty>]) -> Vec<Arc<dyn MemoryAdapter>> {
    adapters
        .iter()
        .map(|a| (*a).clone() as Arc<dyn MemoryAdapter>)
        .collect()
}
