//! # Batch Mutator
//!
//! Saves and deletes of any size are split into chunks the remote store will
//! accept in one call, dispatched with bounded concurrency, and retried chunk
//! by chunk.
//!
//! ```text
//! save_batch(1200 rows)
//!   │
//!   ├─ derive keys for every row ── missing id? ──▶ Err(MissingId), nothing sent
//!   │
//!   ├─ chunk ≤ 500 ─▶ [0..500) [500..1000) [1000..1200)
//!   │                    │          │            │
//!   │                    ▼          ▼            ▼      (≤ concurrency in flight)
//!   │                 retry      retry        retry
//!   │                    │          │            │
//!   └────────────── all Ok ──▶ Ok(())    any exhausted ──▶ Err(BatchFailed)
//! ```
//!
//! A single chunk is sent directly. Chunks are independent: there is no
//! ordering between them, and a chunk that already succeeded stays written
//! when another one fails. Within a chunk the order of rows is preserved.
//!
//! When the options carry a transaction token, chunks are buffered by the
//! store and only become visible on commit.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::remote::{RemoteStore, MAX_ITEMS_PER_CALL};
use crate::retry::{retry_if, RetryPolicy};
use crate::types::{EntityPayload, Key, KeyId, Row, SaveMethod, TableName, TransactionId};

// =============================================================================
// Configuration
// =============================================================================

/// Chunks dispatched at the same time by one batch call.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Configuration for the batch mutator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutatorConfig {
    /// Entities per remote call. Must not exceed [`MAX_ITEMS_PER_CALL`].
    pub max_items_per_call: usize,

    /// Chunks in flight at once.
    pub concurrency: usize,

    /// Retry applied to each chunk.
    pub retry: RetryPolicy,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            max_items_per_call: MAX_ITEMS_PER_CALL,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::mutation(),
        }
    }
}

impl MutatorConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_items_per_call == 0 || self.max_items_per_call > MAX_ITEMS_PER_CALL {
            return Err(Error::InvalidConfig(format!(
                "mutation.max_items_per_call must be between 1 and {MAX_ITEMS_PER_CALL}"
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig(
                "mutation.concurrency must be at least 1".into(),
            ));
        }
        self.retry.validate("mutation.retry")
    }
}

/// Options for a save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SaveOptions {
    /// Fields the store should not index.
    pub exclude_from_indexes: Vec<String>,

    /// Insert, update or upsert.
    pub method: SaveMethod,

    /// Buffer the writes in this transaction instead of applying them.
    pub transaction: Option<TransactionId>,
}

impl SaveOptions {
    pub fn with_method(method: SaveMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn exclude_from_indexes<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_from_indexes = fields.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn in_transaction(&self, transaction: &TransactionId) -> Self {
        Self {
            transaction: Some(transaction.clone()),
            ..self.clone()
        }
    }
}

// =============================================================================
// Batch Mutator
// =============================================================================

/// Chunked, retried saves and deletes.
#[derive(Clone)]
pub struct BatchMutator {
    remote: Arc<dyn RemoteStore>,
    config: MutatorConfig,
}

impl BatchMutator {
    pub fn new(remote: Arc<dyn RemoteStore>, config: MutatorConfig) -> Self {
        Self { remote, config }
    }

    pub fn config(&self) -> &MutatorConfig {
        &self.config
    }

    /// Persists every row of `rows` into `table`.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingId`] if any row has no identity (before any network call)
    /// - [`Error::BatchFailed`] if any chunk fails after its retries
    pub async fn save_batch(&self, table: &TableName, rows: &[Row], options: &SaveOptions) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let entities = rows
            .iter()
            .map(|row| {
                EntityPayload::from_row(table, row, &options.exclude_from_indexes).ok_or_else(|| {
                    Error::MissingId {
                        table: table.to_string(),
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let method = options.method;
        let transaction = options.transaction.as_ref();
        let remote = &self.remote;
        let policy = &self.config.retry;
        let should_retry = chunk_retry_predicate(transaction.is_some());

        debug!(
            table = table.as_str(),
            rows = entities.len(),
            method = %method,
            in_transaction = transaction.is_some(),
            "saving batch"
        );

        self.dispatch(&entities, move |chunk| async move {
            retry_if("saveBatch", policy, should_retry, || {
                remote.save(chunk, method, transaction)
            })
            .await
        })
        .await
        .map_err(|source| batch_failed("saveBatch", table, entities.len(), source))
    }

    /// Deletes the entities with the given ids.
    ///
    /// The store does not report which ids existed, so the returned count is
    /// the number of ids submitted.
    pub async fn delete_by_ids(
        &self,
        table: &TableName,
        ids: &[KeyId],
        transaction: Option<&TransactionId>,
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let keys: Vec<Key> = ids
            .iter()
            .map(|id| Key {
                table: table.clone(),
                id: id.clone(),
            })
            .collect();
        let remote = &self.remote;
        let policy = &self.config.retry;
        let should_retry = chunk_retry_predicate(transaction.is_some());

        debug!(
            table = table.as_str(),
            ids = keys.len(),
            in_transaction = transaction.is_some(),
            "deleting batch"
        );

        self.dispatch(&keys, move |chunk| async move {
            retry_if("deleteByIds", policy, should_retry, || remote.delete(chunk, transaction)).await
        })
        .await
        .map_err(|source| batch_failed("deleteByIds", table, keys.len(), source))?;

        Ok(ids.len())
    }

    /// Sends `items` in chunks, one directly or many with bounded concurrency.
    async fn dispatch<'a, T, F, Fut>(&self, items: &'a [T], send: F) -> Result<()>
    where
        F: Fn(&'a [T]) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let size = self.config.max_items_per_call.clamp(1, MAX_ITEMS_PER_CALL);
        if items.len() <= size {
            return send(items).await;
        }

        stream::iter(items.chunks(size).map(Ok::<_, Error>))
            .try_for_each_concurrent(self.config.concurrency.max(1), send)
            .await
    }
}

/// Which chunk failures are retried in place.
///
/// Inside a transaction a contention abort has already doomed the remote
/// transaction, so it fails the chunk and the coordinator retries the whole
/// transaction.
fn chunk_retry_predicate(in_transaction: bool) -> fn(&Error) -> bool {
    if in_transaction {
        |err| err.is_transient() && !err.is_contention()
    } else {
        Error::is_transient
    }
}

fn batch_failed(operation: &str, table: &TableName, rows: usize, source: Error) -> Error {
    error!(operation, table = table.as_str(), rows, error = %source, "batch failed");
    Error::BatchFailed {
        operation: operation.to_string(),
        table: table.to_string(),
        rows,
        source: Box::new(source),
    }
}

// =============================================================================
// Tests
// =============================================================================
