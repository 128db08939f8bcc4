//! Two-phase writes across adapters
//!
//! When every participant stages writes the transaction is atomic: prepare
//! on all, commit on all, and any failure rolls every participant back. If
//! one participant cannot stage, the whole transaction degrades to ordered
//! best-effort writes and says so in its warnings.

use crate::adapter::{AdapterRegistry, MemoryAdapter};
use crate::error::{MemoryError, MemoryResult};
use crate::item::MemoryItem;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Init,
    Preparing,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    /// Best-effort write stopped part-way; earlier writes remain
    Failed,
}

impl TransactionState {
    /// Committed, rolled back or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

/// One write inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOp {
    pub adapter: String,
    pub item: MemoryItem,
}

impl TransactionOp {
    pub fn new(adapter: impl Into<String>, item: MemoryItem) -> Self {
        Self {
            adapter: adapter.into(),
            item,
        }
    }
}

/// A version made visible by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedWrite {
    pub adapter: String,
    pub id: String,
    pub version: u64,
}

/// Result of a committed transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionOutcome {
    pub transaction_id: String,
    pub state: TransactionState,
    pub writes: Vec<AppliedWrite>,
    /// False when the transaction ran best-effort
    pub atomic: bool,
    pub warnings: Vec<String>,
}

/// A set of writes committed together
#[derive(Debug)]
pub struct Transaction {
    transaction_id: String,
    operations: Vec<TransactionOp>,
    state: TransactionState,
    transitions: Vec<TransactionState>,
    warnings: Vec<String>,
}

impl Transaction {
    /// Transaction over `operations` with a fresh id
    pub fn new(operations: Vec<TransactionOp>) -> Self {
        Self {
            transaction_id: format!("tx-{}", Uuid::new_v4()),
            operations,
            state: TransactionState::Init,
            transitions: vec![TransactionState::Init],
            warnings: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.transaction_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn transitions(&self) -> &[TransactionState] {
        &self.transitions
    }

    pub fn operations(&self) -> &[TransactionOp] {
        &self.operations
    }

    /// Participating adapter labels in first-use order
    pub fn participants(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for op in &self.operations {
            if !labels.contains(&op.adapter) {
                labels.push(op.adapter.clone());
            }
        }
        labels
    }

    fn transition(&mut self, next: TransactionState) {
        tracing::debug!(
            transaction_id = %self.transaction_id,
            from = ?self.state,
            to = ?next,
            "transaction state"
        );
        self.state = next;
        self.transitions.push(next);
    }

    /// Run the transaction against `registry`
    pub async fn execute(&mut self, registry: &AdapterRegistry) -> MemoryResult<TransactionOutcome> {
        if self.state != TransactionState::Init {
            return Err(MemoryError::validation(
                "transaction",
                "already executed",
                self.transaction_id.clone(),
            ));
        }

        let mut participants: Vec<(String, Arc<dyn MemoryAdapter>)> = Vec::new();
        for label in self.participants() {
            let adapter = registry.get(&label)?;
            participants.push((label, adapter));
        }

        if participants.iter().all(|(_, a)| a.supports_transactions()) {
            self.run_atomic(registry, &participants).await
        } else {
            let incapable: Vec<&str> = participants
                .iter()
                .filter(|(_, a)| !a.supports_transactions())
                .map(|(label, _)| label.as_str())
                .collect();
            let warning = format!(
                "adapters without transaction support ({}); writes are not atomic",
                incapable.join(", ")
            );
            tracing::warn!(transaction_id = %self.transaction_id, "{}", warning);
            self.warnings.push(warning);
            self.run_best_effort(registry).await
        }
    }

    async fn run_atomic(
        &mut self,
        registry: &AdapterRegistry,
        participants: &[(String, Arc<dyn MemoryAdapter>)],
    ) -> MemoryResult<TransactionOutcome> {
        let tx = self.transaction_id.clone();

        self.transition(TransactionState::Preparing);
        let operations = self.operations.clone();
        for op in operations {
            let adapter = registry.get(&op.adapter)?;
            if let Err(err) = registry
                .call(&op.adapter, adapter.prepare(&tx, op.item))
                .await
            {
                let reason = format!("prepare failed on '{}': {}", op.adapter, err);
                return Err(self.abort(registry, participants, reason).await);
            }
        }

        self.transition(TransactionState::Committing);
        let mut writes = Vec::new();
        for (label, adapter) in participants {
            match registry.call(label, adapter.commit(&tx)).await {
                Ok(applied) => writes.extend(applied.into_iter().map(|(id, version)| AppliedWrite {
                    adapter: label.clone(),
                    id,
                    version,
                })),
                Err(err) => {
                    let reason = format!("commit failed on '{label}': {err}");
                    return Err(self.abort(registry, participants, reason).await);
                }
            }
        }

        for (label, adapter) in participants {
            if let Err(err) = registry.call(label, adapter.finalize(&tx)).await {
                tracing::warn!(transaction_id = %tx, adapter = %label, error = %err, "finalize failed");
            }
        }
        self.transition(TransactionState::Committed);
        tracing::info!(transaction_id = %tx, writes = writes.len(), "transaction committed");

        Ok(TransactionOutcome {
            transaction_id: tx,
            state: self.state,
            writes,
            atomic: true,
            warnings: self.warnings.clone(),
        })
    }

    async fn abort(
        &mut self,
        registry: &AdapterRegistry,
        participants: &[(String, Arc<dyn MemoryAdapter>)],
        reason: String,
    ) -> MemoryError {
        let tx = self.transaction_id.clone();
        tracing::warn!(transaction_id = %tx, reason = %reason, "rolling back transaction");
        self.transition(TransactionState::RollingBack);
        for (label, adapter) in participants {
            if let Err(err) = registry.call(label, adapter.rollback(&tx)).await {
                tracing::error!(transaction_id = %tx, adapter = %label, error = %err, "rollback failed");
                self.warnings.push(format!("rollback failed on '{label}': {err}"));
            }
        }
        self.transition(TransactionState::RolledBack);
        MemoryError::aborted(tx, reason)
    }

    async fn run_best_effort(&mut self, registry: &AdapterRegistry) -> MemoryResult<TransactionOutcome> {
        let tx = self.transaction_id.clone();
        self.transition(TransactionState::Committing);

        let mut writes = Vec::new();
        let operations = self.operations.clone();
        for op in operations {
            let id = op.item.id.clone();
            let adapter = registry.get(&op.adapter)?;
            match registry.call(&op.adapter, adapter.write(op.item)).await {
                Ok(version) => writes.push(AppliedWrite {
                    adapter: op.adapter,
                    id,
                    version,
                }),
                Err(err) => {
                    self.transition(TransactionState::Failed);
                    let reason = format!(
                        "best-effort write failed on '{}': {}; {} earlier write(s) remain",
                        op.adapter,
                        err,
                        writes.len()
                    );
                    tracing::error!(transaction_id = %tx, reason = %reason, "transaction failed");
                    return Err(MemoryError::aborted(tx, reason));
                }
            }
        }

        self.transition(TransactionState::Committed);
        Ok(TransactionOutcome {
            transaction_id: tx,
            state: self.state,
            writes,
            atomic: false,
            warnings: self.warnings.clone(),
        })
    }
}
