//! Memory manager - single entry point composing classifier, adapters,
//! cache, relationship index, sync engine and query engine
//!
//! One [`MemoryManager`] is constructed from a [`MemoryConfig`] and shared by
//! reference (or `Arc`) with every caller. It owns the id catalog, the only
//! authority on an id's current version.

use crate::adapter::{
    guarded, AdapterRegistry, AdapterStatsSnapshot, FallbackStatus, MemoryAdapter,
};
use crate::cache::{versioned_key, CacheStats, TieredCache};
use crate::catalog::Catalog;
use crate::config::MemoryConfig;
use crate::context::{ContextMap, SessionContext};
use crate::error::{MemoryError, MemoryResult};
use crate::item::{Metadata, MemoryItem, MemoryItemType, Relationship};
use crate::layer::{classify, MemoryLayer};
use crate::predicate::Predicate;
use crate::query::{MemoryQuery, QueryEngine, QueryResponse, QueryStrategy, RelevanceScorer};
use crate::relation::RelationGraph;
use crate::sync::{
    ConflictRecord, SyncEngine, SyncRecord, SyncStats, Transaction, TransactionOp,
    TransactionOutcome,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// EDRR phases in workflow order
pub const EDRR_PHASES: [&str; 4] = ["EXPAND", "DIFFERENTIATE", "REFINE", "RETROSPECT"];

/// Facade over the hybrid memory system
pub struct MemoryManager {
    config: MemoryConfig,
    registry: Arc<AdapterRegistry>,
    catalog: Arc<Catalog>,
    cache: Arc<TieredCache<MemoryItem>>,
    relations: Arc<RelationGraph>,
    context: Arc<SessionContext>,
    sync: Arc<SyncEngine>,
    query: QueryEngine,
    routes: BTreeMap<MemoryLayer, Vec<String>>,
}

impl MemoryManager {
    /// Build the reference adapters enabled in `config`.
    ///
    /// Must be called inside a tokio runtime when async subscriptions exist.
    pub fn new(config: MemoryConfig) -> MemoryResult<Self> {
        config.validate()?;
        let relations = Arc::new(RelationGraph::new());
        let registry = AdapterRegistry::from_config(&config, relations.clone())?;
        Self::assemble(config, registry, relations)
    }

    /// Use caller-supplied adapters instead of the reference ones
    pub fn with_adapters(
        config: MemoryConfig,
        adapters: Vec<Arc<dyn MemoryAdapter>>,
    ) -> MemoryResult<Self> {
        config.validate_limits()?;
        config.validate_fallbacks()?;
        let registry = AdapterRegistry::new(adapters, config.adapter_timeout())?
            .with_fallbacks(&config.fallbacks)?;
        Self::assemble(config, registry, Arc::new(RelationGraph::new()))
    }

    fn assemble(
        config: MemoryConfig,
        registry: AdapterRegistry,
        relations: Arc<RelationGraph>,
    ) -> MemoryResult<Self> {
        let registry = Arc::new(registry);
        let routes = resolve_routes(&config, &registry);
        let catalog = Arc::new(Catalog::new());
        let cache = Arc::new(TieredCache::new(config.cache_capacity));
        let context = Arc::new(SessionContext::new());
        let sync = SyncEngine::start(registry.clone(), catalog.clone(), cache.clone(), &config)?;
        let query = QueryEngine::new(
            registry.clone(),
            relations.clone(),
            catalog.clone(),
            sync.clone(),
            context.clone(),
            routes.clone(),
            config.query_timeout(),
        );

        tracing::info!(
            adapters = ?registry.labels(),
            cache_capacity = config.cache_capacity,
            subscriptions = config.subscriptions.len(),
            "memory manager ready"
        );

        Ok(Self {
            config,
            registry,
            catalog,
            cache,
            relations,
            context,
            sync,
            query,
            routes,
        })
    }

    /// Replace the relevance scorer used by federated and context-aware queries
    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.query.set_scorer(scorer);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Registered adapter labels in registration order
    pub fn adapter_labels(&self) -> Vec<String> {
        self.registry.labels()
    }

    /// Get an adapter by label
    pub fn adapter(&self, label: &str) -> MemoryResult<Arc<dyn MemoryAdapter>> {
        self.registry.get(label)
    }

    /// Adapters a layer is written to
    pub fn routes_for(&self, layer: MemoryLayer) -> &[String] {
        self.routes.get(&layer).map(Vec::as_slice).unwrap_or(&[])
    }

    // ---- items -------------------------------------------------------

    /// Store an item in the adapters routed for its layer; returns its id
    pub async fn store(&self, item: MemoryItem) -> MemoryResult<String> {
        let labels = self.routes_for(classify(&item.item_type)).to_vec();
        self.write_to(item, labels).await
    }

    /// Store an item in one named adapter regardless of its layer
    pub async fn store_in(&self, label: &str, item: MemoryItem) -> MemoryResult<String> {
        self.registry.get(label)?;
        self.write_to(item, vec![label.to_string()]).await
    }

    async fn write_to(&self, mut item: MemoryItem, labels: Vec<String>) -> MemoryResult<String> {
        if item.id.is_empty() {
            item.id = Uuid::new_v4().to_string();
        }
        let (version, created_at) = self.catalog.reserve(&item)?;
        item.version = version;
        item.created_at = created_at;

        let writes = labels.iter().map(|label| {
            let item = item.clone();
            async move {
                let adapter = self.registry.get(label)?;
                let version = self.registry.call(label, adapter.write(item)).await?;
                Ok::<_, MemoryError>((label.clone(), version))
            }
        });
        let results = join_all(writes).await;

        let mut written: Vec<(String, u64)> = Vec::new();
        let mut failure = None;
        for result in results {
            match result {
                Ok(applied) => written.push(applied),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            self.undo_partial_store(&item.id, version, &written).await;
            tracing::warn!(item_id = %item.id, reverted = written.len(), error = %err, "store failed");
            return Err(err);
        }

        for (label, applied) in &written {
            self.catalog.commit(&item.id, label, *applied);
        }
        item.version = written.iter().map(|(_, v)| *v).max().unwrap_or(version);
        tracing::debug!(
            item_id = %item.id,
            version = item.version,
            layer = %classify(&item.item_type),
            adapters = ?labels,
            "stored"
        );
        self.cache.put(&item.id, item.clone());

        for (label, version) in &written {
            self.sync.on_write(&item.id, label, *version).await?;
        }
        Ok(item.id)
    }

    /// Remove the versions a failed store left behind so the caller sees
    /// nothing of it
    async fn undo_partial_store(&self, id: &str, reserved: u64, written: &[(String, u64)]) {
        for (label, version) in written {
            let reverted = match self.registry.get(label) {
                Ok(adapter) => self.registry.call(label, adapter.revert(id, *version)).await,
                Err(err) => Err(err),
            };
            if let Err(err) = reverted {
                tracing::error!(
                    item_id = %id,
                    adapter = %label,
                    version,
                    error = %err,
                    "could not revert partial store"
                );
                self.catalog.commit(id, label, *version);
            }
        }
        self.catalog.release(id, reserved);
        self.cache.invalidate(id);
    }

    /// Latest version of an id; cache first
    pub async fn retrieve(&self, id: &str) -> MemoryResult<MemoryItem> {
        if self.catalog.is_tombstoned(id) {
            return Err(MemoryError::not_found(id));
        }
        let registry = self.registry.clone();
        let labels = self.holders(id);
        let key = id.to_string();
        self.cache
            .get_or_load(id, move || load_latest(registry, labels, key))
            .await
            .map_err(surface_not_found)
    }

    /// A specific version of an id
    pub async fn retrieve_version(&self, id: &str, version: u64) -> MemoryResult<MemoryItem> {
        let registry = self.registry.clone();
        let labels = self.holders(id);
        let key = id.to_string();
        self.cache
            .get_or_load(&versioned_key(id, version), move || {
                load_version(registry, labels, key, version)
            })
            .await
            .map_err(surface_not_found)
    }

    /// Every version of an id in ascending order; never cached
    pub async fn retrieve_history(&self, id: &str) -> MemoryResult<Vec<MemoryItem>> {
        let mut versions: BTreeMap<u64, MemoryItem> = BTreeMap::new();
        for label in self.holders(id) {
            let adapter = self.registry.get(&label)?;
            match self.registry.call(&label, adapter.history(id)).await {
                Ok(history) => {
                    for item in history {
                        versions.entry(item.version).or_insert(item);
                    }
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if versions.is_empty() {
            return Err(MemoryError::not_found(id));
        }
        Ok(versions.into_values().collect())
    }

    /// Live items of one layer, de-duplicated by id (highest version wins)
    pub async fn retrieve_by_layer(&self, layer: MemoryLayer) -> MemoryResult<Vec<MemoryItem>> {
        let labels = self.routes_for(layer).to_vec();
        let predicate = Predicate::All;
        let reads = labels.iter().map(|label| {
            let predicate = &predicate;
            async move {
                let adapter = self.registry.get(label)?;
                self.registry
                    .call(label, adapter.query_by_metadata(predicate))
                    .await
            }
        });

        let mut latest: HashMap<String, MemoryItem> = HashMap::new();
        for result in join_all(reads).await {
            for item in result? {
                if classify(&item.item_type) != layer {
                    continue;
                }
                match latest.get(&item.id) {
                    Some(existing) if existing.version >= item.version => {}
                    _ => {
                        latest.insert(item.id.clone(), item);
                    }
                }
            }
        }

        let mut items: Vec<MemoryItem> = latest.into_values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    /// Tombstone an id everywhere it is stored; the id is never reused
    pub async fn delete(&self, id: &str) -> MemoryResult<()> {
        let labels = self.catalog.tombstone(id)?;
        for label in &labels {
            let adapter = self.registry.get(label)?;
            match self.registry.call(label, adapter.delete(id)).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        self.cache.invalidate(id);
        tracing::debug!(item_id = %id, adapters = ?labels, "deleted");

        for label in &labels {
            self.sync.on_delete(id, label).await?;
        }
        Ok(())
    }

    /// Adapters known to hold `id`, or every adapter when unknown
    fn holders(&self, id: &str) -> Vec<String> {
        let labels = self.catalog.adapters_for(id);
        if labels.is_empty() {
            self.registry.labels()
        } else {
            labels
        }
    }

    // ---- session context ---------------------------------------------

    /// Set a session context value
    pub fn add_context(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.context.set(key, value);
    }

    /// Get a session context value
    pub fn get_context(&self, key: &str) -> Option<serde_json::Value> {
        self.context.get(key)
    }

    /// Copy of the whole session context
    pub fn get_full_context(&self) -> ContextMap {
        self.context.snapshot()
    }

    /// Remove a session context value
    pub fn remove_context(&self, key: &str) -> Option<serde_json::Value> {
        self.context.remove(key)
    }

    /// Id of the current session
    pub fn session_id(&self) -> String {
        self.context.session_id()
    }

    /// Clear the overlay and start a new session; returns the ended session id
    pub fn end_session(&self) -> String {
        self.context.end_session()
    }

    // ---- relationships -----------------------------------------------

    /// Add a directed edge; both endpoints must have a stored version
    pub fn add_relationship(&self, relationship: Relationship) -> MemoryResult<()> {
        for endpoint in [&relationship.source, &relationship.target] {
            if !self.registry.contains(&endpoint.adapter) {
                return Err(MemoryError::validation(
                    "relationship",
                    "unknown adapter label",
                    endpoint.adapter.clone(),
                ));
            }
            if !self.catalog.has_version(&endpoint.id) {
                return Err(MemoryError::validation(
                    "relationship",
                    "endpoint has no stored version",
                    endpoint.id.clone(),
                ));
            }
        }
        tracing::debug!(
            source = %relationship.source,
            target = %relationship.target,
            relation_type = %relationship.relation_type,
            "relationship added"
        );
        self.relations.add(relationship);
        Ok(())
    }

    /// Edges touching `id`, outgoing first
    pub fn relationships(&self, id: &str) -> Vec<Relationship> {
        self.relations.relationships_of(id)
    }

    /// Items reachable from `id` within `max_hops`, in hop order, excluding `id`
    pub async fn related(
        &self,
        id: &str,
        relation_filter: Option<&str>,
        max_hops: usize,
    ) -> MemoryResult<Vec<MemoryItem>> {
        if !self.relations.contains_id(id) {
            return Ok(Vec::new());
        }
        let strategy = QueryStrategy::Cascading {
            seed_id: id.to_string(),
            seed_adapter: None,
            relation_filter: relation_filter.map(str::to_string),
            max_hops,
        };
        let response = self.query(&strategy, &MemoryQuery::new()).await?;

        let mut seen = std::collections::HashSet::new();
        seen.insert(id.to_string());
        Ok(response
            .hits
            .into_iter()
            .filter(|hit| hit.hop.unwrap_or(0) > 0)
            .map(|hit| hit.item)
            .filter(|item| seen.insert(item.id.clone()))
            .collect())
    }

    // ---- search ------------------------------------------------------

    /// Top-k items by cosine similarity across every vector-capable adapter
    pub async fn similarity_search(
        &self,
        vector: &[f32],
        top_k: usize,
    ) -> MemoryResult<Vec<(MemoryItem, f32)>> {
        let mut best: HashMap<String, (MemoryItem, f32)> = HashMap::new();
        let mut searched = 0;
        for adapter in self.registry.all() {
            let Some(search) = adapter.as_vector() else {
                continue;
            };
            searched += 1;
            let scored = guarded(
                adapter.label(),
                self.registry.timeout(),
                search.query_by_similarity(vector, top_k),
            )
            .await?;
            for (item, score) in scored {
                match best.get(&item.id) {
                    Some((_, existing)) if *existing >= score => {}
                    _ => {
                        best.insert(item.id.clone(), (item, score));
                    }
                }
            }
        }
        if searched == 0 {
            return Err(MemoryError::config("no vector-capable adapter registered"));
        }

        let mut results: Vec<(MemoryItem, f32)> = best.into_values().collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.updated_at.cmp(&a.0.updated_at))
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        results.truncate(top_k);
        Ok(results)
    }

    /// Live items matching `predicate` across all adapters
    pub async fn query_by_metadata(&self, predicate: Predicate) -> MemoryResult<Vec<MemoryItem>> {
        let query = MemoryQuery::new().with_predicate(predicate);
        let response = self.query(&QueryStrategy::Federated, &query).await?;
        Ok(response.hits.into_iter().map(|hit| hit.item).collect())
    }

    /// [`query_by_metadata`](Self::query_by_metadata) with a textual predicate
    pub async fn query_by_metadata_str(&self, predicate: &str) -> MemoryResult<Vec<MemoryItem>> {
        self.query_by_metadata(Predicate::parse(predicate)?).await
    }

    /// Run a query strategy
    pub async fn query(
        &self,
        strategy: &QueryStrategy,
        query: &MemoryQuery,
    ) -> MemoryResult<QueryResponse> {
        self.query.execute(strategy, query, &CancellationToken::new()).await
    }

    /// Run a query strategy that stops when `cancel` fires
    pub async fn query_with_cancel(
        &self,
        strategy: &QueryStrategy,
        query: &MemoryQuery,
        cancel: &CancellationToken,
    ) -> MemoryResult<QueryResponse> {
        self.query.execute(strategy, query, cancel).await
    }

    // ---- EDRR helpers ------------------------------------------------

    /// Store content tagged with an EDRR phase (stored upper-case)
    pub async fn store_with_edrr_phase(
        &self,
        content: impl Into<serde_json::Value>,
        item_type: MemoryItemType,
        phase: &str,
        metadata: Metadata,
    ) -> MemoryResult<String> {
        let mut item = MemoryItem::new(item_type, content);
        item.metadata = metadata;
        item.metadata
            .insert("edrr_phase".to_string(), phase.trim().to_uppercase().into());
        self.store(item).await
    }

    /// Items tagged with an EDRR phase
    pub async fn query_by_edrr_phase(&self, phase: &str) -> MemoryResult<Vec<MemoryItem>> {
        self.query_by_metadata(Predicate::eq("edrr_phase", phase.trim().to_uppercase()))
            .await
    }

    /// An item and everything related to it, ordered by EDRR phase
    pub async fn query_evolution(&self, id: &str) -> MemoryResult<Vec<MemoryItem>> {
        let mut items = vec![self.retrieve(id).await?];
        items.extend(self.related(id, None, usize::MAX).await?);
        items.sort_by_key(|item| phase_rank(item.edrr_phase().as_deref()));
        Ok(items)
    }

    // ---- transactions and sync ---------------------------------------

    /// Start a multi-adapter transaction
    pub fn transaction(&self) -> TransactionBuilder<'_> {
        TransactionBuilder {
            manager: self,
            writes: Vec::new(),
        }
    }

    /// Copy current items of `source` into `target` (and back when bidirectional)
    pub async fn synchronize(
        &self,
        source: &str,
        target: &str,
        bidirectional: bool,
    ) -> MemoryResult<SyncStats> {
        self.sync.synchronize(source, target, bidirectional).await
    }

    /// Cumulative synchronization counters
    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    /// Wait until every async propagation has finished
    pub async fn flush_sync(&self) {
        self.sync.flush().await
    }

    /// Whether `id` has async propagation outstanding
    pub fn is_sync_pending(&self, id: &str) -> bool {
        self.sync.is_pending(id)
    }

    /// Propagation records for `id`
    pub fn sync_records(&self, id: &str) -> Vec<SyncRecord> {
        self.sync.records(id)
    }

    /// Conflict audit log
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.sync.conflicts()
    }

    // ---- fallbacks ---------------------------------------------------

    /// Health of a primary configured with fallbacks, and its replay backlog
    pub fn fallback_status(&self, label: &str) -> Option<FallbackStatus> {
        self.registry.fallback(label).map(|f| f.status())
    }

    /// Replay writes and deletes that a fallback accepted while `label` was down
    pub async fn reconcile(&self, label: &str) -> MemoryResult<usize> {
        let fallback = self
            .registry
            .fallback(label)
            .cloned()
            .ok_or_else(|| MemoryError::validation("adapter", "no fallbacks configured", label))?;
        self.registry.call(label, fallback.reconcile()).await
    }

    /// Stop background sync workers
    pub async fn shutdown(&self) {
        self.sync.shutdown().await;
        tracing::info!(session_id = %self.context.session_id(), "memory manager stopped");
    }

    // ---- stats -------------------------------------------------------

    /// Cache hit and miss counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Call counters per adapter label
    pub fn adapter_stats(&self) -> BTreeMap<String, AdapterStatsSnapshot> {
        self.registry
            .all()
            .iter()
            .map(|a| (a.label().to_string(), a.stats()))
            .collect()
    }

    /// Current version of a live id
    pub fn current_version(&self, id: &str) -> Option<u64> {
        self.catalog.current_version(id)
    }
}

/// Writes collected for one transaction
pub struct TransactionBuilder<'a> {
    manager: &'a MemoryManager,
    writes: Vec<(Option<String>, MemoryItem)>,
}

impl<'a> TransactionBuilder<'a> {
    /// Write `item` to one named adapter
    pub fn write(mut self, adapter: impl Into<String>, item: MemoryItem) -> Self {
        self.writes.push((Some(adapter.into()), item));
        self
    }

    /// Write `item` to every adapter routed for its layer
    pub fn write_layer(mut self, item: MemoryItem) -> Self {
        self.writes.push((None, item));
        self
    }

    /// Commit every write or none of them
    pub async fn execute(self) -> MemoryResult<TransactionOutcome> {
        let manager = self.manager;
        let mut reserved: HashMap<String, (u64, DateTime<Utc>)> = HashMap::new();
        let mut operations = Vec::new();

        for (adapter, mut item) in self.writes {
            if item.id.is_empty() {
                item.id = Uuid::new_v4().to_string();
            }
            let (version, created_at) = match reserved.get(&item.id) {
                Some(slot) => *slot,
                None => {
                    let slot = manager.catalog.reserve(&item)?;
                    reserved.insert(item.id.clone(), slot);
                    slot
                }
            };
            item.version = version;
            item.created_at = created_at;

            let labels = match adapter {
                Some(label) => vec![label],
                None => manager.routes_for(classify(&item.item_type)).to_vec(),
            };
            for label in labels {
                operations.push(TransactionOp::new(label, item.clone()));
            }
        }

        let mut transaction = Transaction::new(operations);
        let outcome = match transaction.execute(&manager.registry).await {
            Ok(outcome) => outcome,
            Err(err) => {
                for id in reserved.keys() {
                    manager.cache.invalidate(id);
                }
                return Err(err);
            }
        };

        for write in &outcome.writes {
            manager.catalog.commit(&write.id, &write.adapter, write.version);
        }
        for id in reserved.keys() {
            manager.cache.invalidate(id);
        }
        for write in &outcome.writes {
            manager
                .sync
                .on_write(&write.id, &write.adapter, write.version)
                .await?;
        }
        Ok(outcome)
    }
}

/// Resolve configured routes against the registered adapters; a layer with
/// no usable route falls back to the first adapter
fn resolve_routes(
    config: &MemoryConfig,
    registry: &AdapterRegistry,
) -> BTreeMap<MemoryLayer, Vec<String>> {
    let fallback = registry.labels().into_iter().take(1).collect::<Vec<_>>();
    MemoryLayer::ALL
        .iter()
        .map(|layer| {
            let usable: Vec<String> = config
                .layer_routes
                .for_layer(*layer)
                .iter()
                .filter(|label| registry.contains(label))
                .cloned()
                .collect();
            if usable.is_empty() {
                tracing::warn!(layer = %layer, fallback = ?fallback, "layer has no usable route");
                (*layer, fallback.clone())
            } else {
                (*layer, usable)
            }
        })
        .collect()
}

async fn load_latest(
    registry: Arc<AdapterRegistry>,
    labels: Vec<String>,
    id: String,
) -> MemoryResult<MemoryItem> {
    let mut best: Option<MemoryItem> = None;
    let mut failure = None;
    for label in labels {
        let adapter = registry.get(&label)?;
        match registry.call(&label, adapter.read(&id)).await {
            Ok(item) => {
                if best.as_ref().map_or(true, |b| item.version > b.version) {
                    best = Some(item);
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }
    match (best, failure) {
        (Some(item), _) => Ok(item),
        (None, Some(err)) => Err(err),
        (None, None) => Err(MemoryError::not_found(id)),
    }
}

async fn load_version(
    registry: Arc<AdapterRegistry>,
    labels: Vec<String>,
    id: String,
    version: u64,
) -> MemoryResult<MemoryItem> {
    let mut failure = None;
    for label in labels {
        let adapter = registry.get(&label)?;
        match registry.call(&label, adapter.read_version(&id, version)).await {
            Ok(item) => return Ok(item),
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }
    Err(failure.unwrap_or_else(|| MemoryError::version_not_found(id, version)))
}

/// Absent items are reported plainly, not as a cache load failure
fn surface_not_found(err: MemoryError) -> MemoryError {
    match err {
        MemoryError::CacheLoad { ref source, .. } if source.is_not_found() => (**source).clone(),
        other => other,
    }
}

fn phase_rank(phase: Option<&str>) -> usize {
    phase
        .and_then(|p| {
            let p = p.to_uppercase();
            EDRR_PHASES.iter().position(|known| *known == p)
        })
        .unwrap_or(EDRR_PHASES.len())
}
