//! Vector adapter
//!
//! Items are kept whole; those carrying an embedding take part in cosine
//! similarity search. The embedding dimension is fixed by the first
//! embedded write unless configured up front.

use super::store::{AdapterCore, Passthrough};
use super::{AdapterKind, AdapterStatsSnapshot, MemoryAdapter, VectorSearch};
use crate::error::{AdapterError, AdapterResult};
use crate::item::MemoryItem;
use crate::predicate::Predicate;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;

/// Cosine similarity of two vectors.
///
/// Returns 0.0 for mismatched lengths or zero-norm input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// In-process vector index
pub struct VectorAdapter {
    core: AdapterCore<Passthrough>,
    dimensions: RwLock<Option<usize>>,
}

impl VectorAdapter {
    /// Empty index under `label`; the dimension is pinned by the first embedded write
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            core: AdapterCore::new(label),
            dimensions: RwLock::new(None),
        }
    }

    /// Fix the embedding dimension up front
    pub fn with_dimensions(self, dimensions: usize) -> Self {
        *self.dimensions.write() = Some(dimensions);
        self
    }

    /// Enable or disable transaction staging
    pub fn with_transactions(mut self, enabled: bool) -> Self {
        self.core.transactional = enabled;
        self
    }

    /// Pinned embedding dimension, if any
    pub fn dimensions(&self) -> Option<usize> {
        *self.dimensions.read()
    }

    fn check_dimensions(pinned: Option<usize>, len: usize) -> AdapterResult<()> {
        match pinned {
            Some(expected) if expected != len => Err(AdapterError::Invalid(format!(
                "embedding has {len} dimensions, expected {expected}"
            ))),
            _ => Ok(()),
        }
    }

    /// Pin the dimension from the first committed embedding
    fn pin_from_committed(&self, applied: &[(String, u64)]) {
        let mut dimensions = self.dimensions.write();
        if dimensions.is_some() {
            return;
        }
        *dimensions = applied.iter().find_map(|(id, version)| {
            let item = self.core.store.version(id, *version).ok()?;
            item.embedding.map(|e| e.len())
        });
    }
}

impl Default for VectorAdapter {
    fn default() -> Self {
        Self::new(AdapterKind::Vector.default_label())
    }
}

#[async_trait]
impl MemoryAdapter for VectorAdapter {
    fn label(&self) -> &str {
        &self.core.label
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Vector
    }

    async fn write(&self, item: MemoryItem) -> AdapterResult<u64> {
        let Some(len) = item.embedding.as_ref().map(Vec::len) else {
            return self.core.write(item);
        };
        let mut dimensions = self.dimensions.write();
        Self::check_dimensions(*dimensions, len)?;
        let version = self.core.write(item)?;
        dimensions.get_or_insert(len);
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
        self.core.query(predicate)
    }

    async fn current_version(&self, id: &str) -> AdapterResult<Option<u64>> {
        Ok(self.core.store.current_version(id))
    }

    fn as_vector(&self) -> Option<&dyn VectorSearch> {
        Some(self)
    }

    fn supports_transactions(&self) -> bool {
        self.core.transactional
    }

    async fn prepare(&self, transaction_id: &str, item: MemoryItem) -> AdapterResult<()> {
        if let Some(embedding) = &item.embedding {
            Self::check_dimensions(self.dimensions(), embedding.len())
                .map_err(|e| AdapterError::Staging(e.to_string()))?;
        }
        self.core.prepare(transaction_id, item)
    }

    async fn commit(&self, transaction_id: &str) -> AdapterResult<Vec<(String, u64)>> {
        let applied = self.core.commit(transaction_id)?;
        self.pin_from_committed(&applied);
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

#[async_trait]
impl VectorSearch for VectorAdapter {
    async fn query_by_similarity(
        &self,
        vector: &[f32],
        top_k: usize,
    ) -> AdapterResult<Vec<(MemoryItem, f32)>> {
        if let Some(expected) = self.dimensions() {
            if expected != vector.len() {
                return Err(AdapterError::Invalid(format!(
                    "query vector has {} dimensions, expected {expected}",
                    vector.len()
                )));
            }
        }

        let items = self.core.query(&Predicate::All)?;
        let mut scored: Vec<(MemoryItem, f32)> = items
            .into_iter()
            .filter_map(|item| {
                let score = cosine_similarity(vector, item.embedding.as_deref()?);
                Some((item, score))
            })
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(top_k);

        tracing::debug!(adapter = %self.core.label, hits = scored.len(), top_k, "similarity search");
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::MemoryItemType;
    use chrono::{Duration, Utc};

    fn embedded(id: &str, embedding: Vec<f32>) -> MemoryItem {
        MemoryItem::new(MemoryItemType::Knowledge, id)
            .with_id(id)
            .with_embedding(embedding)
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_similarity_ranking() {
        let vectors = VectorAdapter::default();
        vectors.write(embedded("near", vec![1.0, 0.1])).await.unwrap();
        vectors.write(embedded("far", vec![0.0, 1.0])).await.unwrap();
        vectors
            .write(MemoryItem::new(MemoryItemType::Knowledge, "no embedding").with_id("plain"))
            .await
            .unwrap();

        let hits = vectors.query_by_similarity(&[1.0, 0.0], 5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|(i, _)| i.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
        assert!(hits[0].1 > hits[1].1);
    }

    #[tokio::test]
    async fn test_similarity_ties_prefer_newest() {
        let vectors = VectorAdapter::default();
        let old = embedded("old", vec![1.0, 0.0]).with_updated_at(Utc::now() - Duration::seconds(60));
        let new = embedded("new", vec![2.0, 0.0]);
        vectors.write(old).await.unwrap();
        vectors.write(new).await.unwrap();

        let hits = vectors.query_by_similarity(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, "new");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let vectors = VectorAdapter::default().with_dimensions(3);
        let err = vectors.write(embedded("bad", vec![1.0, 0.0])).await.unwrap_err();
        assert!(matches!(err, AdapterError::Invalid(_)));

        let err = vectors.query_by_similarity(&[1.0], 1).await.unwrap_err();
        assert!(matches!(err, AdapterError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_pin_dimension() {
        let vectors = VectorAdapter::default();
        let err = vectors.write(embedded("", vec![1.0, 0.0, 0.0])).await.unwrap_err();
        assert!(matches!(err, AdapterError::Invalid(_)));
        assert_eq!(vectors.dimensions(), None);

        vectors.write(embedded("a", vec![1.0, 0.0])).await.unwrap();
        assert_eq!(vectors.dimensions(), Some(2));
    }

    #[tokio::test]
    async fn test_dimension_pinned_on_commit_not_prepare() {
        let vectors = VectorAdapter::default();
        vectors.prepare("tx1", embedded("a", vec![1.0, 0.0, 0.0])).await.unwrap();
        assert_eq!(vectors.dimensions(), None);
        vectors.rollback("tx1").await.unwrap();

        vectors.prepare("tx2", embedded("b", vec![1.0, 0.0])).await.unwrap();
        vectors.commit("tx2").await.unwrap();
        assert_eq!(vectors.dimensions(), Some(2));
    }
}
