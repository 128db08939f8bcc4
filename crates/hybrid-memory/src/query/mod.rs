//! # Query Engine
//!
//! Five strategies over the registered adapters:
//!
//! | Strategy | Adapters | Ordering |
//! |---|---|---|
//! | [`QueryStrategy::Direct`] | one named adapter | adapter-native |
//! | [`QueryStrategy::CrossStore`] | layer routes or an explicit list | grouped by source |
//! | [`QueryStrategy::Cascading`] | whichever hold the reachable items | BFS hop order |
//! | [`QueryStrategy::Federated`] | all | relevance, then newest |
//! | [`QueryStrategy::ContextAware`] | as the wrapped strategy | context-boosted relevance |
//!
//! Fan-out strategies never fail because one adapter did: the response
//! carries a per-adapter [`AdapterStatus`] map and a `partial` flag instead.

mod fanout;
mod scoring;

pub use scoring::{DefaultScorer, RelevanceScorer, ScoreInput};

use crate::adapter::{AdapterRegistry, MemoryAdapter};
use crate::catalog::Catalog;
use crate::context::{ContextMap, SessionContext};
use crate::error::{AdapterError, AdapterResult, MemoryError, MemoryResult};
use crate::item::{value_text, ItemRef, MemoryItem};
use crate::layer::{classify, MemoryLayer};
use crate::predicate::Predicate;
use crate::relation::{RelationGraph, TraversalHop};
use crate::sync::SyncEngine;
use fanout::{fan_out, FanOutBudget};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a query is dispatched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    /// Exactly one adapter, no fan-out
    Direct { adapter: String },

    /// Same query on several adapters, results tagged and grouped by source.
    /// `None` selects the routes of the query's layer, or every adapter.
    CrossStore { adapters: Option<Vec<String>> },

    /// Follow relationships outward from a seed item
    Cascading {
        seed_id: String,
        seed_adapter: Option<String>,
        relation_filter: Option<String>,
        max_hops: usize,
    },

    /// Every adapter, merged, de-duplicated and ranked
    Federated,

    /// Any strategy re-ranked against the session context
    ContextAware(Box<QueryStrategy>),
}

impl QueryStrategy {
    /// Query a single adapter by label
    pub fn direct(adapter: impl Into<String>) -> Self {
        Self::Direct {
            adapter: adapter.into(),
        }
    }

    /// Query every adapter and tag hits with their source
    pub fn cross_store() -> Self {
        Self::CrossStore { adapters: None }
    }

    /// Follow relationships outward from `seed_id`
    pub fn cascading(seed_id: impl Into<String>, max_hops: usize) -> Self {
        Self::Cascading {
            seed_id: seed_id.into(),
            seed_adapter: None,
            relation_filter: None,
            max_hops,
        }
    }

    /// Wrap a strategy so session context boosts matching items
    pub fn context_aware(self) -> Self {
        Self::ContextAware(Box::new(self))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "direct",
            Self::CrossStore { .. } => "cross_store",
            Self::Cascading { .. } => "cascading",
            Self::Federated => "federated",
            Self::ContextAware(_) => "context_aware",
        }
    }

    /// Strip context-aware wrappers; returns the base strategy and whether
    /// any wrapper was present
    fn unwrap_context(&self) -> (&QueryStrategy, bool) {
        let mut strategy = self;
        let mut wrapped = false;
        while let Self::ContextAware(inner) = strategy {
            strategy = inner;
            wrapped = true;
        }
        (strategy, wrapped)
    }
}

/// Search criteria shared by every strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Free text matched against content and metadata
    pub text: Option<String>,
    pub predicate: Predicate,
    pub embedding: Option<Vec<f32>>,
    /// Restrict to items of one layer
    pub layer: Option<MemoryLayer>,
    pub limit: Option<usize>,
    /// On cancellation return what already arrived instead of an error
    pub best_effort: bool,
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            text: None,
            predicate: Predicate::All,
            embedding: None,
            layer: None,
            limit: None,
            best_effort: false,
        }
    }
}

impl MemoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query matching free text
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Restrict candidates with a metadata predicate
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Rank by similarity to an embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Only items of one layer
    pub fn in_layer(mut self, layer: MemoryLayer) -> Self {
        self.layer = Some(layer);
        self
    }

    /// Keep at most `limit` hits
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Return partial results on cancellation instead of an error
    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }
}

/// Outcome of one adapter within a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdapterStatus {
    Ok { count: usize },
    Failed { reason: String },
    TimedOut,
    Cancelled,
}

impl AdapterStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// One result item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHit {
    pub item: MemoryItem,
    /// Adapter the item was fetched from
    pub source_adapter: String,
    pub score: f32,
    /// Distance from the seed, cascading queries only
    pub hop: Option<usize>,
    /// References walked from the seed, cascading queries only
    pub path: Vec<ItemRef>,
    /// Async propagation for this id is still pending
    pub possibly_stale: bool,
}

impl QueryHit {
    /// Adapter labels along the traversal path
    pub fn path_labels(&self) -> Vec<&str> {
        self.path.iter().map(|r| r.adapter.as_str()).collect()
    }
}

/// Ranked hits plus per-adapter status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub strategy: String,
    pub hits: Vec<QueryHit>,
    pub adapter_status: BTreeMap<String, AdapterStatus>,
    /// At least one adapter failed, timed out or was cancelled
    pub partial: bool,
}

impl QueryResponse {
    pub fn items(&self) -> Vec<&MemoryItem> {
        self.hits.iter().map(|h| &h.item).collect()
    }

    /// Hit ids in rank order
    pub fn ids(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.item.id.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Hits grouped by source adapter
    pub fn by_source(&self) -> BTreeMap<&str, Vec<&QueryHit>> {
        let mut groups: BTreeMap<&str, Vec<&QueryHit>> = BTreeMap::new();
        for hit in &self.hits {
            groups.entry(hit.source_adapter.as_str()).or_default().push(hit);
        }
        groups
    }
}

/// Strategy executor over the manager's adapters and indexes
pub struct QueryEngine {
    registry: Arc<AdapterRegistry>,
    relations: Arc<RelationGraph>,
    catalog: Arc<Catalog>,
    sync: Arc<SyncEngine>,
    context: Arc<SessionContext>,
    routes: BTreeMap<MemoryLayer, Vec<String>>,
    scorer: Arc<dyn RelevanceScorer>,
    query_timeout: Duration,
}

impl QueryEngine {
    pub(crate) fn new(
        registry: Arc<AdapterRegistry>,
        relations: Arc<RelationGraph>,
        catalog: Arc<Catalog>,
        sync: Arc<SyncEngine>,
        context: Arc<SessionContext>,
        routes: BTreeMap<MemoryLayer, Vec<String>>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            relations,
            catalog,
            sync,
            context,
            routes,
            scorer: Arc::new(DefaultScorer::default()),
            query_timeout,
        }
    }

    pub(crate) fn set_scorer(&mut self, scorer: Arc<dyn RelevanceScorer>) {
        self.scorer = scorer;
    }

    /// Run `query` under `strategy`; `cancel` aborts in-flight adapter calls
    pub async fn execute(
        &self,
        strategy: &QueryStrategy,
        query: &MemoryQuery,
        cancel: &CancellationToken,
    ) -> MemoryResult<QueryResponse> {
        let (base, context_aware) = strategy.unwrap_context();
        let context = context_aware.then(|| self.context.snapshot());
        let text = scoring_text(query.text.as_deref(), context.as_ref());
        let input = ScoreInput {
            text: text.as_deref(),
            embedding: query.embedding.as_deref(),
            context: context.as_ref(),
            filtering: ScoreInput::caller_criteria(query.text.as_deref(), query.embedding.as_deref()),
        };

        tracing::debug!(
            strategy = strategy.name(),
            layer = ?query.layer,
            context_keys = context.as_ref().map_or(0, |c| c.len()),
            "executing query"
        );

        let (mut hits, adapter_status) = match base {
            QueryStrategy::Direct { adapter } => self.direct(adapter, query, &input, cancel).await?,
            QueryStrategy::CrossStore { adapters } => {
                self.cross_store(adapters.as_deref(), query, &input, cancel)
                    .await?
            }
            QueryStrategy::Cascading {
                seed_id,
                seed_adapter,
                relation_filter,
                max_hops,
            } => {
                self.cascading(
                    seed_id,
                    seed_adapter.as_deref(),
                    relation_filter.as_deref(),
                    *max_hops,
                    query,
                    &input,
                    cancel,
                )
                .await?
            }
            QueryStrategy::Federated => self.federated(query, &input, cancel).await?,
            QueryStrategy::ContextAware(_) => unreachable!("context wrappers are stripped above"),
        };

        if context_aware {
            hits.sort_by(|a, b| self.rank(a, b));
            if let Some(limit) = query.limit {
                hits.truncate(limit);
            }
        }
        for hit in &mut hits {
            hit.possibly_stale = self.sync.is_pending(&hit.item.id);
        }

        let partial = adapter_status.values().any(|s| !s.is_ok());
        if partial {
            tracing::warn!(strategy = strategy.name(), "query returned partial results");
        }
        Ok(QueryResponse {
            strategy: strategy.name().to_string(),
            hits,
            adapter_status,
            partial,
        })
    }

    async fn direct(
        &self,
        label: &str,
        query: &MemoryQuery,
        input: &ScoreInput<'_>,
        cancel: &CancellationToken,
    ) -> MemoryResult<(Vec<QueryHit>, BTreeMap<String, AdapterStatus>)> {
        let adapter = self.registry.get(label)?;
        let items = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MemoryError::Cancelled),
            items = self.registry.call(label, candidates(adapter.as_ref(), query)) => items?,
        };

        let mut hits = self.admit(label, items, input);
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        let mut status = BTreeMap::new();
        status.insert(label.to_string(), AdapterStatus::Ok { count: hits.len() });
        Ok((hits, status))
    }

    async fn cross_store(
        &self,
        adapters: Option<&[String]>,
        query: &MemoryQuery,
        input: &ScoreInput<'_>,
        cancel: &CancellationToken,
    ) -> MemoryResult<(Vec<QueryHit>, BTreeMap<String, AdapterStatus>)> {
        let labels: Vec<String> = match (adapters, query.layer) {
            (Some(labels), _) => {
                for label in labels {
                    self.registry.get(label)?;
                }
                labels.to_vec()
            }
            (None, Some(layer)) => self.routes.get(&layer).cloned().unwrap_or_default(),
            (None, None) => self.registry.labels(),
        };

        let out = fan_out(&labels, self.budget(query, cancel), |label| {
            self.search(label, query)
        })
        .await?;

        let mut hits = Vec::new();
        for (label, items) in out.results {
            let mut group = self.admit(&label, items, input);
            if let Some(limit) = query.limit {
                group.truncate(limit);
            }
            hits.extend(group);
        }
        Ok((hits, out.status))
    }

    async fn federated(
        &self,
        query: &MemoryQuery,
        input: &ScoreInput<'_>,
        cancel: &CancellationToken,
    ) -> MemoryResult<(Vec<QueryHit>, BTreeMap<String, AdapterStatus>)> {
        let labels = self.registry.labels();
        let out = fan_out(&labels, self.budget(query, cancel), |label| {
            self.search(label, query)
        })
        .await?;

        let mut merged: HashMap<String, QueryHit> = HashMap::new();
        for (label, items) in out.results {
            for hit in self.admit(&label, items, input) {
                match merged.get(&hit.item.id) {
                    Some(existing) if existing.item.version >= hit.item.version => {}
                    _ => {
                        merged.insert(hit.item.id.clone(), hit);
                    }
                }
            }
        }

        let mut hits: Vec<QueryHit> = merged.into_values().collect();
        hits.sort_by(|a, b| self.rank(a, b));
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        Ok((hits, out.status))
    }

    #[allow(clippy::too_many_arguments)]
    async fn cascading(
        &self,
        seed_id: &str,
        seed_adapter: Option<&str>,
        relation_filter: Option<&str>,
        max_hops: usize,
        query: &MemoryQuery,
        input: &ScoreInput<'_>,
        cancel: &CancellationToken,
    ) -> MemoryResult<(Vec<QueryHit>, BTreeMap<String, AdapterStatus>)> {
        if let Some(label) = seed_adapter {
            self.registry.get(label)?;
        }

        let mut hops = self
            .relations
            .traverse(seed_id, seed_adapter, relation_filter, max_hops);
        if hops.is_empty() {
            // seed without edges: the seed itself from wherever it is stored
            let holders = match seed_adapter {
                Some(label) => vec![label.to_string()],
                None => self.catalog.adapters_for(seed_id),
            };
            hops = holders
                .into_iter()
                .map(|adapter| {
                    let item = ItemRef::new(seed_id, adapter);
                    TraversalHop {
                        path: vec![item.clone()],
                        item,
                        hop: 0,
                        via: None,
                    }
                })
                .collect();
        }
        if hops.is_empty() {
            return Err(MemoryError::not_found(seed_id));
        }

        let mut wanted: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for hop in &hops {
            wanted
                .entry(hop.item.adapter.clone())
                .or_default()
                .push(hop.item.id.clone());
        }
        let labels: Vec<String> = wanted.keys().cloned().collect();

        let out = fan_out(&labels, self.budget(query, cancel), |label| {
            let ids = wanted.get(&label).cloned().unwrap_or_default();
            self.fetch_many(label, ids)
        })
        .await?;

        let mut fetched: HashMap<ItemRef, MemoryItem> = HashMap::new();
        for (label, items) in out.results {
            for item in items {
                fetched.insert(ItemRef::new(item.id.clone(), label.clone()), item);
            }
        }

        let mut hits = Vec::new();
        for hop in hops {
            let Some(item) = fetched.remove(&hop.item) else {
                continue;
            };
            if hop.hop > 0 && !self.accepts(query, &item) {
                continue;
            }
            hits.push(QueryHit {
                score: self.scorer.score(input, &item),
                item,
                source_adapter: hop.item.adapter.clone(),
                hop: Some(hop.hop),
                path: hop.path,
                possibly_stale: false,
            });
        }
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        Ok((hits, out.status))
    }

    async fn search(&self, label: String, query: &MemoryQuery) -> AdapterResult<Vec<MemoryItem>> {
        let adapter = self
            .registry
            .get(&label)
            .map_err(|e| AdapterError::Io(e.to_string()))?;
        candidates(adapter.as_ref(), query).await
    }

    async fn fetch_many(&self, label: String, ids: Vec<String>) -> AdapterResult<Vec<MemoryItem>> {
        let adapter = self
            .registry
            .get(&label)
            .map_err(|e| AdapterError::Io(e.to_string()))?;
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            match adapter.read(&id).await {
                Ok(item) => items.push(item),
                Err(AdapterError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(items)
    }

    /// Score items from one adapter, dropping those that miss the criteria
    fn admit(&self, label: &str, items: Vec<MemoryItem>, input: &ScoreInput<'_>) -> Vec<QueryHit> {
        let require_score = input.filtering;
        items
            .into_iter()
            .filter_map(|item| {
                let score = self.scorer.score(input, &item);
                if require_score && score <= 0.0 {
                    return None;
                }
                Some(QueryHit {
                    item,
                    source_adapter: label.to_string(),
                    score,
                    hop: None,
                    path: Vec::new(),
                    possibly_stale: false,
                })
            })
            .collect()
    }

    fn accepts(&self, query: &MemoryQuery, item: &MemoryItem) -> bool {
        query.predicate.matches(item)
            && query
                .layer
                .map_or(true, |layer| classify(&item.item_type) == layer)
    }

    /// Score descending, newest first, then id and registration order
    fn rank(&self, a: &QueryHit, b: &QueryHit) -> Ordering {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.item.updated_at.cmp(&a.item.updated_at))
            .then_with(|| a.item.id.cmp(&b.item.id))
            .then_with(|| {
                self.registry
                    .position(&a.source_adapter)
                    .cmp(&self.registry.position(&b.source_adapter))
            })
    }

    fn budget<'a>(&self, query: &MemoryQuery, cancel: &'a CancellationToken) -> FanOutBudget<'a> {
        FanOutBudget {
            per_adapter: self.registry.timeout(),
            overall: self.query_timeout,
            cancel,
            best_effort: query.best_effort,
        }
    }
}

/// Items an adapter contributes to a query before scoring
async fn candidates(adapter: &dyn MemoryAdapter, query: &MemoryQuery) -> AdapterResult<Vec<MemoryItem>> {
    let mut items = match (query.embedding.as_deref(), adapter.as_vector()) {
        (Some(embedding), Some(vector)) => vector
            .query_by_similarity(embedding, usize::MAX)
            .await?
            .into_iter()
            .map(|(item, _)| item)
            .filter(|item| query.predicate.matches(item))
            .collect(),
        _ => adapter.query_by_metadata(&query.predicate).await?,
    };
    if let Some(layer) = query.layer {
        items.retain(|item| classify(&item.item_type) == layer);
    }
    Ok(items)
}

/// Query text extended with context values
fn scoring_text(text: Option<&str>, context: Option<&ContextMap>) -> Option<String> {
    let extra: Vec<String> = context
        .map(|c| c.values().map(value_text).collect())
        .unwrap_or_default();
    match (text, extra.is_empty()) {
        (None, true) => None,
        (Some(text), true) => Some(text.to_string()),
        (text, false) => {
            let mut parts: Vec<String> = text.map(|t| vec![t.to_string()]).unwrap_or_default();
            parts.extend(extra);
            Some(parts.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_wrappers_unwrap() {
        let strategy = QueryStrategy::Federated.context_aware().context_aware();
        let (base, wrapped) = strategy.unwrap_context();
        assert_eq!(base, &QueryStrategy::Federated);
        assert!(wrapped);
        assert_eq!(strategy.name(), "context_aware");
    }

    #[test]
    fn test_scoring_text_appends_context_values() {
        let mut context = ContextMap::new();
        context.insert("current_task".into(), "auth".into());
        assert_eq!(
            scoring_text(Some("token refresh"), Some(&context)).as_deref(),
            Some("token refresh auth")
        );
        assert_eq!(scoring_text(None, None), None);
        assert_eq!(scoring_text(None, Some(&context)).as_deref(), Some("auth"));
    }

    #[test]
    fn test_status_serializes_with_tag() {
        let json = serde_json::to_value(AdapterStatus::Ok { count: 2 }).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["count"], 2);
    }
}
