//! Adapter registry - the closed set of adapters a manager was built with
//!
//! Every adapter call that leaves the crate boundary goes through
//! [`guarded`], which applies the per-adapter timeout and wraps
//! adapter-native errors with the adapter label.

use super::{
    AdapterKind, DocumentAdapter, FallbackAdapter, GraphAdapter, KeyValueAdapter, MemoryAdapter,
    VectorAdapter,
};
use crate::config::{FallbackConfig, MemoryConfig};
use crate::error::{AdapterResult, MemoryError, MemoryResult};
use crate::relation::RelationGraph;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Run an adapter call under a timeout, converting its error
pub async fn guarded<T, Fut>(label: &str, timeout: Duration, call: Fut) -> MemoryResult<T>
where
    Fut: Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(MemoryError::from_adapter(label, err)),
        Err(_) => Err(MemoryError::backend(
            label,
            format!("timed out after {}ms", timeout.as_millis()),
        )),
    }
}

/// Adapters by label, in registration order
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn MemoryAdapter>>,
    index: HashMap<String, usize>,
    fallbacks: HashMap<String, Arc<FallbackAdapter>>,
    timeout: Duration,
}

impl AdapterRegistry {
    /// Register `adapters`; labels must be unique
    pub fn new(adapters: Vec<Arc<dyn MemoryAdapter>>, timeout: Duration) -> MemoryResult<Self> {
        if adapters.is_empty() {
            return Err(MemoryError::config("no adapters enabled"));
        }
        let mut index = HashMap::new();
        for (i, adapter) in adapters.iter().enumerate() {
            if index.insert(adapter.label().to_string(), i).is_some() {
                return Err(MemoryError::config(format!(
                    "duplicate adapter label '{}'",
                    adapter.label()
                )));
            }
        }
        Ok(Self {
            adapters,
            index,
            fallbacks: HashMap::new(),
            timeout,
        })
    }

    /// Put each configured primary behind a [`FallbackAdapter`] under the same label
    pub fn with_fallbacks(mut self, configs: &[FallbackConfig]) -> MemoryResult<Self> {
        let originals = self.adapters.clone();
        for config in configs {
            let member = |label: &str| {
                self.index
                    .get(label)
                    .map(|&i| originals[i].clone())
                    .ok_or_else(|| {
                        MemoryError::config(format!("fallback names unknown adapter '{label}'"))
                    })
            };
            let primary = member(&config.primary)?;
            let fallbacks = config
                .fallbacks
                .iter()
                .map(|label| member(label))
                .collect::<MemoryResult<Vec<_>>>()?;

            let wrapped =
                Arc::new(FallbackAdapter::new(primary, fallbacks).with_thresholds(config));
            tracing::info!(
                adapter = %config.primary,
                fallbacks = ?wrapped.fallback_labels(),
                "fallback configured"
            );
            let position = self.index[&config.primary];
            self.adapters[position] = wrapped.clone();
            self.fallbacks.insert(config.primary.clone(), wrapped);
        }
        Ok(self)
    }

    /// Build the enabled reference adapters; the graph adapter shares `relations`
    pub fn from_config(config: &MemoryConfig, relations: Arc<RelationGraph>) -> MemoryResult<Self> {
        let mut adapters: Vec<Arc<dyn MemoryAdapter>> = Vec::new();
        for (kind, label) in config.adapters.enabled() {
            let settings = config.adapters.get(kind);
            let adapter: Arc<dyn MemoryAdapter> = match kind {
                AdapterKind::Graph => Arc::new(
                    GraphAdapter::new(label)
                        .with_relations(relations.clone())
                        .with_transactions(settings.transactional),
                ),
                AdapterKind::Vector => {
                    let vector = VectorAdapter::new(label).with_transactions(settings.transactional);
                    Arc::new(match settings.dimensions {
                        Some(dimensions) => vector.with_dimensions(dimensions),
                        None => vector,
                    })
                }
                AdapterKind::Document => {
                    Arc::new(DocumentAdapter::new(label).with_transactions(settings.transactional))
                }
                AdapterKind::KeyValue => {
                    Arc::new(KeyValueAdapter::new(label).with_transactions(settings.transactional))
                }
            };
            adapters.push(adapter);
        }
        Self::new(adapters, config.adapter_timeout())?.with_fallbacks(&config.fallbacks)
    }

    /// Adapter by label, if registered
    pub fn find(&self, label: &str) -> Option<&Arc<dyn MemoryAdapter>> {
        self.index.get(label).map(|&i| &self.adapters[i])
    }

    /// Adapter by label, or a validation error naming it
    pub fn get(&self, label: &str) -> MemoryResult<Arc<dyn MemoryAdapter>> {
        self.find(label)
            .cloned()
            .ok_or_else(|| MemoryError::validation("adapter", "unknown adapter label", label))
    }

    /// Fallback wrapper registered under `label`, if one is configured
    pub fn fallback(&self, label: &str) -> Option<&Arc<FallbackAdapter>> {
        self.fallbacks.get(label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    pub fn all(&self) -> &[Arc<dyn MemoryAdapter>] {
        &self.adapters
    }

    /// Labels in registration order
    pub fn labels(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.label().to_string()).collect()
    }

    /// Position in registration order, used to break ties
    pub fn position(&self, label: &str) -> usize {
        self.index.get(label).copied().unwrap_or(usize::MAX)
    }

    /// Per-call budget applied by [`call`](Self::call)
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// [`guarded`] with this registry's timeout
    pub async fn call<T, Fut>(&self, label: &str, call: Fut) -> MemoryResult<T>
    where
        Fut: Future<Output = AdapterResult<T>>,
    {
        guarded(label, self.timeout, call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;

    #[test]
    fn test_registry_from_default_config() {
        let registry =
            AdapterRegistry::from_config(&MemoryConfig::default(), Arc::new(RelationGraph::new()))
                .unwrap();
        assert_eq!(registry.labels(), vec!["graph", "vector", "document", "kv"]);
        assert!(registry.get("vector").unwrap().as_vector().is_some());
        assert!(registry.get("graph").unwrap().as_graph().is_some());
        assert!(matches!(registry.get("nope"), Err(MemoryError::Validation { .. })));
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let adapters: Vec<Arc<dyn MemoryAdapter>> = vec![
            Arc::new(KeyValueAdapter::new("store")),
            Arc::new(DocumentAdapter::new("store")),
        ];
        assert!(matches!(
            AdapterRegistry::new(adapters, Duration::from_millis(10)),
            Err(MemoryError::Config(_))
        ));
    }

    #[test]
    fn test_fallback_wraps_primary_in_place() {
        let config = MemoryConfig::default().with_fallback("document", ["kv"]);
        let registry =
            AdapterRegistry::from_config(&config, Arc::new(RelationGraph::new())).unwrap();

        assert_eq!(registry.labels(), vec!["graph", "vector", "document", "kv"]);
        let fallback = registry.fallback("document").unwrap();
        assert_eq!(fallback.fallback_labels(), vec!["kv"]);
        assert_eq!(fallback.primary().kind(), AdapterKind::Document);
        assert!(registry.fallback("kv").is_none());

        let adapters: Vec<Arc<dyn MemoryAdapter>> = vec![Arc::new(KeyValueAdapter::new("kv"))];
        let err = AdapterRegistry::new(adapters, Duration::from_millis(10))
            .unwrap()
            .with_fallbacks(&config.fallbacks)
            .err()
            .unwrap();
        assert!(err.to_string().contains("'document'"));
    }

    #[tokio::test]
    async fn test_guarded_maps_errors_and_timeouts() {
        let err = guarded::<(), _>("kv", Duration::from_millis(10), async {
            Err(AdapterError::Io("closed".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, MemoryError::BackendUnavailable { ref adapter, .. } if adapter == "kv"));

        let err = guarded("slow", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, AdapterError>(1)
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
