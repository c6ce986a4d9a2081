//! # Transactions
//!
//! Mutations queued on a [`Transaction`] are not sent anywhere until commit.
//! At commit the [`TransactionCoordinator`]:
//!
//! 1. merges the operation log so each key is touched once (later operations
//!    on the same key supersede earlier ones),
//! 2. opens a remote transaction,
//! 3. replays the merged operations through the [`BatchMutator`] with the
//!    transaction token attached,
//! 4. commits.
//!
//! ```text
//!             ┌──────────── attempt (retried on contention) ────────────┐
//! merge ops ─▶│ begin ──▶ replay saves/deletes ──▶ commit ──▶ Ok        │
//!             │              │ error                 │ error            │
//!             │              └──────────┬────────────┘                  │
//!             │                         ▼                               │
//!             │              rollback (once, failure only logged)       │
//!             │                         ▼                               │
//!             │              Err(original error)                        │
//!             └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Whole attempts are retried only for contention aborts; every other error is
//! returned as-is after its rollback. A rollback failure is never reported in
//! place of the error that caused it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::query::Query;
use crate::remote::RemoteStore;
use crate::retry::{retry_if, RetryPolicy};
use crate::types::{KeyId, Row, TableName, TransactionId};
use crate::writer::{BatchMutator, SaveOptions};

// =============================================================================
// Configuration
// =============================================================================

/// Attempts for a transaction, counting the first.
pub const DEFAULT_TRANSACTION_MAX_ATTEMPTS: u32 = 3;

/// Delay before the first re-attempt after a contention abort.
pub const DEFAULT_TRANSACTION_DELAY_MS: u64 = 500;

/// Contention retry for transactions.
///
/// There is no per-attempt timeout: an attempt that was cut short could not be
/// rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub delay_multiplier: f64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_TRANSACTION_MAX_ATTEMPTS,
            delay_ms: DEFAULT_TRANSACTION_DELAY_MS,
            delay_multiplier: 2.0,
        }
    }
}

impl TransactionConfig {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay_ms: self.delay_ms,
            delay_multiplier: self.delay_multiplier,
            max_delay_ms: None,
            timeout_ms: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.policy().validate("transaction")
    }
}

// =============================================================================
// Operations
// =============================================================================

/// One deferred mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum DbOperation {
    SaveBatch {
        table: TableName,
        rows: Vec<Row>,
        options: SaveOptions,
    },
    DeleteByIds {
        table: TableName,
        ids: Vec<KeyId>,
    },
    /// Accepted by the log so callers can build it uniformly, but cannot be
    /// replayed inside a transaction.
    DeleteByQuery { query: Query },
}

impl DbOperation {
    pub fn name(&self) -> &'static str {
        match self {
            DbOperation::SaveBatch { .. } => "saveBatch",
            DbOperation::DeleteByIds { .. } => "deleteByIds",
            DbOperation::DeleteByQuery { .. } => "deleteByQuery",
        }
    }
}

enum Entry {
    Save {
        table: TableName,
        row: Row,
        options: SaveOptions,
    },
    Delete {
        table: TableName,
        id: KeyId,
    },
}

#[derive(PartialEq, Eq, Hash)]
enum Group {
    Save(TableName, SaveOptions),
    Delete(TableName),
}

/// Collapses an operation log so every key is written at most once.
///
/// - The last save of a key wins.
/// - A delete after a save of the same key cancels the save, and vice versa.
/// - Saves are regrouped per table and save options; deletes per table.
///
/// # Errors
///
/// - [`Error::UnsupportedOperation`] for [`DbOperation::DeleteByQuery`]
/// - [`Error::MissingId`] for a saved row without identity
pub fn merge_operations(ops: Vec<DbOperation>) -> Result<Vec<DbOperation>> {
    let mut entries: Vec<Option<Entry>> = Vec::new();
    let mut latest: HashMap<(TableName, KeyId), usize> = HashMap::new();

    let mut record = |entries: &mut Vec<Option<Entry>>, table: &TableName, id: KeyId, entry: Entry| {
        if let Some(previous) = latest.insert((table.clone(), id), entries.len()) {
            entries[previous] = None;
        }
        entries.push(Some(entry));
    };

    for op in ops {
        match op {
            DbOperation::SaveBatch {
                table,
                rows,
                options,
            } => {
                for row in rows {
                    let key = row.resolve_key(&table).ok_or_else(|| Error::MissingId {
                        table: table.to_string(),
                    })?;
                    let entry = Entry::Save {
                        table: table.clone(),
                        row,
                        options: options.clone(),
                    };
                    record(&mut entries, &table, key.id, entry);
                }
            }
            DbOperation::DeleteByIds { table, ids } => {
                for id in ids {
                    let entry = Entry::Delete {
                        table: table.clone(),
                        id: id.clone(),
                    };
                    record(&mut entries, &table, id, entry);
                }
            }
            other => {
                return Err(Error::UnsupportedOperation {
                    op: other.name().to_string(),
                })
            }
        }
    }

    let mut merged: Vec<DbOperation> = Vec::new();
    let mut groups: HashMap<Group, usize> = HashMap::new();

    for entry in entries.into_iter().flatten() {
        match entry {
            Entry::Save {
                table,
                row,
                options,
            } => {
                let group = Group::Save(table.clone(), options.clone());
                let idx = *groups.entry(group).or_insert_with(|| {
                    merged.push(DbOperation::SaveBatch {
                        table,
                        rows: Vec::new(),
                        options,
                    });
                    merged.len() - 1
                });
                if let DbOperation::SaveBatch { rows, .. } = &mut merged[idx] {
                    rows.push(row);
                }
            }
            Entry::Delete { table, id } => {
                let idx = *groups.entry(Group::Delete(table.clone())).or_insert_with(|| {
                    merged.push(DbOperation::DeleteByIds {
                        table,
                        ids: Vec::new(),
                    });
                    merged.len() - 1
                });
                if let DbOperation::DeleteByIds { ids, .. } = &mut merged[idx] {
                    ids.push(id);
                }
            }
        }
    }

    Ok(merged)
}

// =============================================================================
// Coordinator
// =============================================================================

/// Runs merged operation logs inside remote transactions.
#[derive(Clone)]
pub struct TransactionCoordinator {
    remote: Arc<dyn RemoteStore>,
    mutator: BatchMutator,
    config: TransactionConfig,
}

impl TransactionCoordinator {
    pub fn new(remote: Arc<dyn RemoteStore>, mutator: BatchMutator, config: TransactionConfig) -> Self {
        Self {
            remote,
            mutator,
            config,
        }
    }

    /// Commits `ops` atomically.
    ///
    /// An empty log commits nothing and opens no transaction.
    ///
    /// # Errors
    ///
    /// - Precondition errors from [`merge_operations`], before any network call
    /// - The error that failed the last attempt (wrapped in
    ///   [`Error::RetriesExhausted`] if every attempt hit contention)
    pub async fn commit(&self, ops: Vec<DbOperation>) -> Result<()> {
        let merged = merge_operations(ops)?;
        if merged.is_empty() {
            return Ok(());
        }
        let merged = &merged;
        let policy = self.config.policy();

        retry_if("commitTransaction", &policy, Error::is_contention, move || {
            self.attempt(merged)
        })
        .await
    }

    async fn attempt(&self, ops: &[DbOperation]) -> Result<()> {
        let tx = self.remote.begin_transaction().await?;
        debug!(transaction = %tx, operations = ops.len(), "transaction started");

        let outcome = self.replay_and_commit(&tx, ops).await;
        if let Err(err) = &outcome {
            warn!(transaction = %tx, error = %err, "transaction failed, rolling back");
            if let Err(rollback_err) = self.remote.rollback(&tx).await {
                warn!(
                    transaction = %tx,
                    error = %rollback_err,
                    "rollback failed"
                );
            }
        }
        outcome
    }

    async fn replay_and_commit(&self, tx: &TransactionId, ops: &[DbOperation]) -> Result<()> {
        for op in ops {
            match op {
                DbOperation::SaveBatch {
                    table,
                    rows,
                    options,
                } => {
                    self.mutator
                        .save_batch(table, rows, &options.in_transaction(tx))
                        .await?;
                }
                DbOperation::DeleteByIds { table, ids } => {
                    self.mutator.delete_by_ids(table, ids, Some(tx)).await?;
                }
                other => {
                    return Err(Error::UnsupportedOperation {
                        op: other.name().to_string(),
                    })
                }
            }
        }
        self.remote.commit(tx).await?;
        debug!(transaction = %tx, "transaction committed");
        Ok(())
    }
}

// =============================================================================
// Transaction Handle
// =============================================================================

/// A deferred operation log bound to a coordinator.
///
/// Cloning the handle shares the same log, so a closure given to
/// [`crate::CloudStore::run_in_transaction`] can pass it around freely.
///
/// # Example
///
/// ```rust,ignore
/// let tx = store.begin_transaction();
/// tx.save_batch("accounts", vec![from, to], SaveOptions::default());
/// tx.delete_by_ids("holds", vec![hold_id.into()]);
/// tx.commit().await?;
/// ```
#[derive(Clone)]
pub struct Transaction {
    ops: Arc<Mutex<Vec<DbOperation>>>,
    coordinator: TransactionCoordinator,
}

impl Transaction {
    pub fn new(coordinator: TransactionCoordinator) -> Self {
        Self {
            ops: Arc::new(Mutex::new(Vec::new())),
            coordinator,
        }
    }

    /// Queues a save.
    pub fn save_batch(&self, table: impl Into<TableName>, rows: Vec<Row>, options: SaveOptions) -> &Self {
        self.push(DbOperation::SaveBatch {
            table: table.into(),
            rows,
            options,
        })
    }

    /// Queues a delete.
    pub fn delete_by_ids(&self, table: impl Into<TableName>, ids: Vec<KeyId>) -> &Self {
        self.push(DbOperation::DeleteByIds {
            table: table.into(),
            ids,
        })
    }

    /// Queues a delete by query. Commit will reject it.
    pub fn delete_by_query(&self, query: Query) -> &Self {
        self.push(DbOperation::DeleteByQuery { query })
    }

    /// Queues an arbitrary operation.
    pub fn push(&self, op: DbOperation) -> &Self {
        self.ops.lock().push(op);
        self
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Copy of the queued operations.
    pub fn operations(&self) -> Vec<DbOperation> {
        self.ops.lock().clone()
    }

    /// Commits every queued operation, draining the log.
    pub async fn commit(self) -> Result<()> {
        let ops = std::mem::take(&mut *self.ops.lock());
        self.coordinator.commit(ops).await
    }

    /// Runs `f` with a fresh handle, then commits what it queued.
    ///
    /// Nothing is sent if `f` fails.
    pub(crate) async fn run<T, F, Fut>(coordinator: TransactionCoordinator, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx = Transaction::new(coordinator);
        let value = f(tx.clone()).await?;
        tx.commit().await?;
        Ok(value)
    }
}

// =============================================================================
// Tests
// =============================================================================
