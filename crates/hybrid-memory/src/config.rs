//! Memory system configuration
//!
//! Configuration can be built in code with the `with_*` methods, parsed from
//! TOML, or loaded from a file layered with `HYBRID_MEMORY_*` environment
//! variables (nested keys use `__`, e.g. `HYBRID_MEMORY_RETRY__MAX_RETRIES`).
//!
//! ```toml
//! cache_capacity = 512
//! adapter_timeout_ms = 40
//!
//! [adapters.vector]
//! dimensions = 384
//!
//! [[subscriptions]]
//! source = "vector"
//! target = "graph"
//! mode = "async"
//! ```

use crate::adapter::AdapterKind;
use crate::error::{MemoryError, MemoryResult};
use crate::layer::MemoryLayer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Per-adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub enabled: bool,

    /// Label override; defaults to the kind name (`graph`, `vector`, `document`, `kv`)
    pub label: Option<String>,

    /// Whether the adapter stages writes for atomic transactions
    pub transactional: bool,

    /// Fixed embedding dimension (vector adapter only)
    pub dimensions: Option<usize>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            transactional: true,
            dimensions: None,
        }
    }
}

/// Settings for the four reference adapters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptersConfig {
    pub graph: AdapterConfig,
    pub vector: AdapterConfig,
    pub document: AdapterConfig,
    pub kv: AdapterConfig,
}

impl AdaptersConfig {
    /// Construction order; also the fallback order for unrouted layers
    pub const KINDS: [AdapterKind; 4] = [
        AdapterKind::Graph,
        AdapterKind::Vector,
        AdapterKind::Document,
        AdapterKind::KeyValue,
    ];

    /// Settings of one adapter kind
    pub fn get(&self, kind: AdapterKind) -> &AdapterConfig {
        match kind {
            AdapterKind::Graph => &self.graph,
            AdapterKind::Vector => &self.vector,
            AdapterKind::Document => &self.document,
            AdapterKind::KeyValue => &self.kv,
        }
    }

    pub fn get_mut(&mut self, kind: AdapterKind) -> &mut AdapterConfig {
        match kind {
            AdapterKind::Graph => &mut self.graph,
            AdapterKind::Vector => &mut self.vector,
            AdapterKind::Document => &mut self.document,
            AdapterKind::KeyValue => &mut self.kv,
        }
    }

    /// Effective label of an adapter
    pub fn label(&self, kind: AdapterKind) -> String {
        self.get(kind)
            .label
            .clone()
            .unwrap_or_else(|| kind.default_label().to_string())
    }

    /// `(kind, label)` of every enabled adapter, in construction order
    pub fn enabled(&self) -> Vec<(AdapterKind, String)> {
        Self::KINDS
            .iter()
            .filter(|kind| self.get(**kind).enabled)
            .map(|kind| (*kind, self.label(*kind)))
            .collect()
    }
}

/// Ordered adapter labels per layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerRoutes {
    pub short_term: Vec<String>,
    pub episodic: Vec<String>,
    pub semantic: Vec<String>,
}

impl LayerRoutes {
    /// Routes of one layer
    pub fn for_layer(&self, layer: MemoryLayer) -> &[String] {
        match layer {
            MemoryLayer::ShortTerm => &self.short_term,
            MemoryLayer::Episodic => &self.episodic,
            MemoryLayer::Semantic => &self.semantic,
        }
    }

    pub fn set(&mut self, layer: MemoryLayer, labels: Vec<String>) {
        match layer {
            MemoryLayer::ShortTerm => self.short_term = labels,
            MemoryLayer::Episodic => self.episodic = labels,
            MemoryLayer::Semantic => self.semantic = labels,
        }
    }
}

impl Default for LayerRoutes {
    fn default() -> Self {
        Self {
            short_term: vec!["kv".to_string()],
            episodic: vec!["document".to_string()],
            semantic: vec!["vector".to_string(), "graph".to_string()],
        }
    }
}

/// Propagation mode of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Propagate inside the caller's write; failure fails the write
    #[serde(alias = "SYNC")]
    Sync,
    /// Queue for a background worker
    #[serde(alias = "ASYNC")]
    Async,
}

/// How divergent updates are settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Later `updated_at` wins; the loser stays in history
    #[default]
    LastWriterWins,
    /// Refuse to propagate and raise a conflict error
    Reject,
}

/// `source` writes are replicated to `target`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub source: String,
    pub target: String,
    pub mode: SyncMode,
}

impl SubscriptionConfig {
    pub fn new(source: impl Into<String>, target: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode,
        }
    }
}

/// Failover from a primary adapter onto ordered fallbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub primary: String,
    pub fallbacks: Vec<String>,

    /// Consecutive backend failures before the primary is skipped
    #[serde(default = "default_unavailable_after")]
    pub unavailable_after: u32,

    /// How long a skipped primary waits before it is tried again
    #[serde(default = "default_retry_after_ms")]
    pub retry_after_ms: u64,
}

fn default_unavailable_after() -> u32 {
    3
}

fn default_retry_after_ms() -> u64 {
    5_000
}

impl FallbackConfig {
    pub fn new<I, S>(primary: impl Into<String>, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            primary: primary.into(),
            fallbacks: fallbacks.into_iter().map(Into::into).collect(),
            unavailable_after: default_unavailable_after(),
            retry_after_ms: default_retry_after_ms(),
        }
    }

    pub fn with_unavailable_after(mut self, failures: u32) -> Self {
        self.unavailable_after = failures;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = retry_after.as_millis() as u64;
        self
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}

/// Backoff schedule for async propagation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Add up to 25% random delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 10,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1_000,
            jitter: true,
        }
    }
}

/// Top-level configuration of a [`MemoryManager`](crate::MemoryManager)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub adapters: AdaptersConfig,
    pub layer_routes: LayerRoutes,

    /// Maximum cached items; 0 disables caching
    pub cache_capacity: usize,

    /// Per-adapter call budget
    pub adapter_timeout_ms: u64,

    /// Overall fan-out query budget
    pub query_timeout_ms: u64,

    pub sync_queue_capacity: usize,
    pub sync_workers: usize,
    pub conflict_policy: ConflictPolicy,
    pub retry: RetryConfig,
    pub subscriptions: Vec<SubscriptionConfig>,
    pub fallbacks: Vec<FallbackConfig>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            adapters: AdaptersConfig::default(),
            layer_routes: LayerRoutes::default(),
            cache_capacity: 1024,
            adapter_timeout_ms: 50,
            query_timeout_ms: 100,
            sync_queue_capacity: 1024,
            sync_workers: 1,
            conflict_policy: ConflictPolicy::default(),
            retry: RetryConfig::default(),
            subscriptions: Vec::new(),
            fallbacks: Vec::new(),
        }
    }
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TOML text
    pub fn from_toml_str(text: &str) -> MemoryResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| MemoryError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a file (format from extension) layered with `HYBRID_MEMORY_*` variables
    pub fn load(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let config: Self = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix("HYBRID_MEMORY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| MemoryError::config(format!("{}: {e}", path.display())))?;

        config.validate()?;
        tracing::info!(path = %path.display(), "memory configuration loaded");
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> MemoryResult<String> {
        toml::to_string_pretty(self).map_err(|e| MemoryError::Serialization(e.to_string()))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> MemoryResult<()> {
        self.validate_limits()?;

        let enabled = self.adapters.enabled();
        if enabled.is_empty() {
            return Err(MemoryError::config("no adapters enabled"));
        }

        let mut labels = HashSet::new();
        for (_, label) in &enabled {
            if !labels.insert(label.as_str()) {
                return Err(MemoryError::config(format!("duplicate adapter label '{label}'")));
            }
        }

        let known: HashSet<String> = AdaptersConfig::KINDS
            .iter()
            .map(|kind| self.adapters.label(*kind))
            .collect();
        for layer in MemoryLayer::ALL {
            for label in self.layer_routes.for_layer(layer) {
                if !known.contains(label) {
                    return Err(MemoryError::config(format!(
                        "layer {layer} routes to unknown adapter '{label}'"
                    )));
                }
            }
        }

        for sub in &self.subscriptions {
            if sub.source == sub.target {
                return Err(MemoryError::config(format!(
                    "subscription '{}' loops onto itself",
                    sub.source
                )));
            }
            for label in [&sub.source, &sub.target] {
                if !labels.contains(label.as_str()) {
                    return Err(MemoryError::config(format!(
                        "subscription names disabled or unknown adapter '{label}'"
                    )));
                }
            }
        }

        self.validate_fallbacks()?;
        for fallback in &self.fallbacks {
            for label in std::iter::once(&fallback.primary).chain(&fallback.fallbacks) {
                if !labels.contains(label.as_str()) {
                    return Err(MemoryError::config(format!(
                        "fallback names disabled or unknown adapter '{label}'"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Shape of the fallback entries; label existence is checked by the registry
    /// when adapters are supplied by the caller
    pub fn validate_fallbacks(&self) -> MemoryResult<()> {
        let primaries: HashSet<&str> = self.fallbacks.iter().map(|f| f.primary.as_str()).collect();
        if primaries.len() != self.fallbacks.len() {
            return Err(MemoryError::config("an adapter has more than one fallback entry"));
        }
        for fallback in &self.fallbacks {
            if fallback.fallbacks.is_empty() {
                return Err(MemoryError::config(format!(
                    "fallback entry for '{}' lists no fallbacks",
                    fallback.primary
                )));
            }
            if fallback.unavailable_after == 0 {
                return Err(MemoryError::validation(
                    "fallbacks.unavailable_after",
                    "must be positive",
                    "0",
                ));
            }
            for label in &fallback.fallbacks {
                if label == &fallback.primary {
                    return Err(MemoryError::config(format!(
                        "adapter '{label}' falls back onto itself"
                    )));
                }
                // fallbacks are plain adapters, never wrapped themselves
                if primaries.contains(label.as_str()) {
                    return Err(MemoryError::config(format!(
                        "fallback '{label}' has fallbacks of its own"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Numeric limits only; used when adapters are supplied by the caller
    pub fn validate_limits(&self) -> MemoryResult<()> {
        if self.adapter_timeout_ms == 0 {
            return Err(MemoryError::validation(
                "adapter_timeout_ms",
                "must be positive",
                "0",
            ));
        }
        if self.adapter_timeout_ms >= self.query_timeout_ms {
            return Err(MemoryError::validation(
                "adapter_timeout_ms",
                "must be below query_timeout_ms",
                format!("{} >= {}", self.adapter_timeout_ms, self.query_timeout_ms),
            ));
        }
        if self.sync_queue_capacity == 0 {
            return Err(MemoryError::validation("sync_queue_capacity", "must be positive", "0"));
        }
        if self.sync_workers == 0 {
            return Err(MemoryError::validation("sync_workers", "must be positive", "0"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(MemoryError::validation(
                "retry.backoff_multiplier",
                "must be at least 1.0",
                self.retry.backoff_multiplier.to_string(),
            ));
        }
        Ok(())
    }

    /// Per-adapter call budget
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    /// Overall fan-out budget
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Set the cache capacity; 0 disables caching
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable one adapter kind
    pub fn with_adapter(mut self, kind: AdapterKind, enabled: bool) -> Self {
        self.adapters.get_mut(kind).enabled = enabled;
        self
    }

    /// Mark an adapter as able (or unable) to stage transactional writes
    pub fn with_transactional(mut self, kind: AdapterKind, transactional: bool) -> Self {
        self.adapters.get_mut(kind).transactional = transactional;
        self
    }

    pub fn with_vector_dimensions(mut self, dimensions: usize) -> Self {
        self.adapters.vector.dimensions = Some(dimensions);
        self
    }

    /// Replace the routes of one layer
    pub fn with_layer_route<I, S>(mut self, layer: MemoryLayer, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.layer_routes
            .set(layer, labels.into_iter().map(Into::into).collect());
        self
    }

    /// Replicate `source` writes into `target`
    pub fn with_subscription(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        mode: SyncMode,
    ) -> Self {
        self.subscriptions
            .push(SubscriptionConfig::new(source, target, mode));
        self
    }

    /// Set how divergent updates are settled
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Serve `primary` from `fallbacks`, in order, while it is down
    pub fn with_fallback<I, S>(mut self, primary: impl Into<String>, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallbacks.push(FallbackConfig::new(primary, fallbacks));
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sync_workers(mut self, workers: usize) -> Self {
        self.sync_workers = workers;
        self
    }

    pub fn with_sync_queue_capacity(mut self, capacity: usize) -> Self {
        self.sync_queue_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = MemoryConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cache_capacity, 1024);
        assert_eq!(config.adapter_timeout(), Duration::from_millis(50));
        assert_eq!(config.layer_routes.for_layer(MemoryLayer::Semantic), ["vector", "graph"]);
        assert_eq!(config.adapters.enabled().len(), 4);
    }

    #[test]
    fn test_from_toml() {
        let config = MemoryConfig::from_toml_str(
            r#"
            cache_capacity = 2
            conflict_policy = "reject"

            [adapters.graph]
            enabled = false

            [adapters.kv]
            label = "tinydb"

            [layer_routes]
            short_term = ["tinydb"]

            [[subscriptions]]
            source = "document"
            target = "tinydb"
            mode = "SYNC"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache_capacity, 2);
        assert_eq!(config.conflict_policy, ConflictPolicy::Reject);
        assert!(!config.adapters.graph.enabled);
        assert_eq!(config.adapters.label(AdapterKind::KeyValue), "tinydb");
        assert_eq!(config.subscriptions[0].mode, SyncMode::Sync);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_validation_failures() {
        let err = MemoryConfig::default()
            .with_adapter_timeout(Duration::from_millis(200))
            .validate()
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation { .. }));

        let err = MemoryConfig::default()
            .with_subscription("kv", "kv", SyncMode::Async)
            .validate()
            .unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));

        let err = MemoryConfig::default()
            .with_adapter(AdapterKind::Graph, false)
            .with_subscription("vector", "graph", SyncMode::Sync)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("graph"));

        let mut none = MemoryConfig::default();
        for kind in AdaptersConfig::KINDS {
            none = none.with_adapter(kind, false);
        }
        assert!(matches!(none.validate(), Err(MemoryError::Config(_))));
    }

    #[test]
    fn test_fallback_entries_are_checked() {
        let config = MemoryConfig::from_toml_str(
            r#"
            [[fallbacks]]
            primary = "document"
            fallbacks = ["kv"]
            retry_after_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.fallbacks[0].unavailable_after, 3);
        assert_eq!(config.fallbacks[0].retry_after(), Duration::from_millis(250));

        let err = MemoryConfig::default()
            .with_fallback("kv", ["kv"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("onto itself"));

        let err = MemoryConfig::default()
            .with_fallback("document", ["kv"])
            .with_fallback("kv", ["graph"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("fallbacks of its own"));

        let err = MemoryConfig::default()
            .with_adapter(AdapterKind::KeyValue, false)
            .with_fallback("document", ["kv"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("'kv'"));

        let empty: [&str; 0] = [];
        assert!(MemoryConfig::default()
            .with_fallback("document", empty)
            .validate()
            .is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "cache_capacity = 16\nsync_workers = 2").unwrap();

        let config = MemoryConfig::load(file.path()).unwrap();
        assert_eq!(config.cache_capacity, 16);
        assert_eq!(config.sync_workers, 2);
    }
}
