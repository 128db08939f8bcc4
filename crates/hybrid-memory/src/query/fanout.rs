//! Concurrent adapter calls with per-adapter and overall deadlines

use super::AdapterStatus;
use crate::error::{AdapterResult, MemoryError, MemoryResult};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Deadlines and cancellation for one fan-out
pub(crate) struct FanOutBudget<'a> {
    pub per_adapter: Duration,
    pub overall: Duration,
    pub cancel: &'a CancellationToken,
    pub best_effort: bool,
}

/// Results in input label order, plus a status for every label
pub(crate) struct FanOut<T> {
    pub results: Vec<(String, Vec<T>)>,
    pub status: BTreeMap<String, AdapterStatus>,
}

impl<T> FanOut<T> {
    pub fn partial(&self) -> bool {
        self.status.values().any(|s| !s.is_ok())
    }
}

/// Call `call(label)` for every label concurrently.
///
/// A failing or slow adapter only loses its own results. Cancellation
/// returns `Cancelled`, or what has already arrived when `best_effort`.
pub(crate) async fn fan_out<T, F, Fut>(
    labels: &[String],
    budget: FanOutBudget<'_>,
    call: F,
) -> MemoryResult<FanOut<T>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = AdapterResult<Vec<T>>>,
{
    let mut pending: FuturesUnordered<_> = labels
        .iter()
        .map(|label| {
            let label = label.clone();
            let fut = tokio::time::timeout(budget.per_adapter, call(label.clone()));
            async move { (label, fut.await) }
        })
        .collect();

    let mut outstanding: HashSet<String> = labels.iter().cloned().collect();
    let mut results: Vec<(String, Vec<T>)> = Vec::new();
    let mut status: BTreeMap<String, AdapterStatus> = BTreeMap::new();

    let deadline = tokio::time::sleep(budget.overall);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            _ = budget.cancel.cancelled() => {
                if !budget.best_effort {
                    tracing::debug!(outstanding = outstanding.len(), "fan-out cancelled");
                    return Err(MemoryError::Cancelled);
                }
                for label in outstanding.drain() {
                    status.insert(label, AdapterStatus::Cancelled);
                }
                break;
            }
            _ = &mut deadline => {
                for label in outstanding.drain() {
                    tracing::warn!(adapter = %label, "adapter missed the query deadline");
                    status.insert(label, AdapterStatus::TimedOut);
                }
                break;
            }
            next = pending.next() => {
                let Some((label, outcome)) = next else { break };
                outstanding.remove(&label);
                match outcome {
                    Ok(Ok(items)) => {
                        status.insert(label.clone(), AdapterStatus::Ok { count: items.len() });
                        results.push((label, items));
                    }
                    Ok(Err(err)) => {
                        let err = MemoryError::from_adapter(&label, err);
                        tracing::warn!(adapter = %label, error = %err, "adapter failed during fan-out");
                        status.insert(label, AdapterStatus::Failed { reason: err.to_string() });
                    }
                    Err(_) => {
                        tracing::warn!(adapter = %label, timeout_ms = budget.per_adapter.as_millis() as u64, "adapter timed out");
                        status.insert(label, AdapterStatus::TimedOut);
                    }
                }
            }
        }
    }

    results.sort_by_key(|(label, _)| labels.iter().position(|l| l == label));
    Ok(FanOut { results, status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn budget(cancel: &CancellationToken, best_effort: bool) -> FanOutBudget<'_> {
        FanOutBudget {
            per_adapter: Duration::from_millis(20),
            overall: Duration::from_millis(80),
            cancel,
            best_effort,
        }
    }

    #[tokio::test]
    async fn test_failures_are_reported_not_raised() {
        let cancel = CancellationToken::new();
        let out = fan_out(&labels(&["vector", "graph", "kv"]), budget(&cancel, false), |label| async move {
            match label.as_str() {
                "graph" => Err(AdapterError::Io("connection reset".into())),
                "kv" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(vec![3])
                }
                _ => Ok(vec![1, 2]),
            }
        })
        .await
        .unwrap();

        assert_eq!(out.results, vec![("vector".to_string(), vec![1, 2])]);
        assert_eq!(out.status["vector"], AdapterStatus::Ok { count: 2 });
        assert!(matches!(out.status["graph"], AdapterStatus::Failed { .. }));
        assert_eq!(out.status["kv"], AdapterStatus::TimedOut);
        assert!(out.partial());
    }

    #[tokio::test]
    async fn test_results_follow_label_order() {
        let cancel = CancellationToken::new();
        let out = fan_out(&labels(&["slow", "fast"]), budget(&cancel, false), |label| async move {
            if label == "slow" {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok::<_, AdapterError>(vec![label])
        })
        .await
        .unwrap();
        let order: Vec<&str> = out.results.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(order, vec!["slow", "fast"]);
        assert!(!out.partial());
    }

    #[tokio::test]
    async fn test_cancellation_modes() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let strict = fan_out(&labels(&["kv"]), budget(&cancel, false), |_| async {
            Ok::<Vec<u8>, AdapterError>(vec![])
        })
        .await;
        assert!(matches!(strict, Err(MemoryError::Cancelled)));

        let lenient = fan_out(&labels(&["kv"]), budget(&cancel, true), |_| async {
            Ok::<Vec<u8>, AdapterError>(vec![])
        })
        .await
        .unwrap();
        assert_eq!(lenient.status["kv"], AdapterStatus::Cancelled);
    }
}
