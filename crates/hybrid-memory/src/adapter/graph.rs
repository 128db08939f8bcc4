//! Graph adapter
//!
//! Holds items as nodes and answers traversal queries over the shared
//! [`RelationGraph`]. Edges may point into other stores; traversal only
//! returns the items this adapter holds itself.

use super::store::{AdapterCore, Passthrough};
use super::{AdapterKind, AdapterStatsSnapshot, GraphTraversal, MemoryAdapter};
use crate::error::AdapterResult;
use crate::item::{ItemRef, MemoryItem, Relationship};
use crate::predicate::Predicate;
use crate::relation::RelationGraph;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// In-process graph store
pub struct GraphAdapter {
    core: AdapterCore<Passthrough>,
    relations: Arc<RelationGraph>,
}

impl GraphAdapter {
    /// Empty graph under `label` with its own relationship index
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            core: AdapterCore::new(label),
            relations: Arc::new(RelationGraph::new()),
        }
    }

    /// Share an existing relationship index
    pub fn with_relations(mut self, relations: Arc<RelationGraph>) -> Self {
        self.relations = relations;
        self
    }

    /// Enable or disable transaction staging
    pub fn with_transactions(mut self, enabled: bool) -> Self {
        self.core.transactional = enabled;
        self
    }

    /// Relationship index used for traversal
    pub fn relations(&self) -> &Arc<RelationGraph> {
        &self.relations
    }

    /// Add an edge between two items held by this adapter
    pub fn relate(&self, source_id: &str, target_id: &str, relation_type: &str) {
        self.relations.add(Relationship::new(
            ItemRef::new(source_id, self.core.label.clone()),
            ItemRef::new(target_id, self.core.label.clone()),
            relation_type,
        ));
    }
}

impl Default for GraphAdapter {
    fn default() -> Self {
        Self::new(AdapterKind::Graph.default_label())
    }
}

#[async_trait]
impl MemoryAdapter for GraphAdapter {
    fn label(&self) -> &str {
        &self.core.label
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Graph
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

    fn as_graph(&self) -> Option<&dyn GraphTraversal> {
        Some(self)
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

#[async_trait]
impl GraphTraversal for GraphAdapter {
    async fn query_related(
        &self,
        id: &str,
        relation_filter: Option<&str>,
        max_hops: usize,
    ) -> AdapterResult<Vec<MemoryItem>> {
        self.core.stats.record_query();
        let hops = self.relations.traverse(id, None, relation_filter, max_hops);

        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(id.to_string());
        let reached = hops
            .iter()
            .filter(|hop| hop.hop > 0)
            .filter(|hop| seen.insert(hop.item.id.clone()))
            .map(|hop| hop.item.id.as_str());

        let items = self.core.store.latest_many(reached)?;
        tracing::debug!(adapter = %self.core.label, item_id = %id, related = items.len(), "graph traversal");
        Ok(items)
    }
}
