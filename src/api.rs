//! # Async API for cloudstore
//!
//! [`CloudStore`] is the entry point. It owns one handle to the remote store
//! and wires the components together:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           CloudStore                             │
//! │                                                                  │
//! │  stream_query ─────▶ RowStream ──────┐                           │
//! │  run_query / count / get_by_ids ─────┼──▶ PageFetcher ──┐        │
//! │                                      │   (retry)        │        │
//! │  save_batch / delete_by_ids ───▶ BatchMutator ──────────┤        │
//! │                                  (chunks, retry)        │        │
//! │  run_in_transaction ──▶ TransactionCoordinator ─────────┤        │
//! │                         (merge, rollback, contention)   │        │
//! └─────────────────────────────────────────────────────────┼────────┘
//!                                                           ▼
//!                                                  Arc<dyn RemoteStore>
//! ```
//!
//! The handle is cheap to clone; clones share the remote connection and the
//! configuration. Streams are independent of each other and of the handle
//! that created them.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use crate::config::{ClientConfig, StreamOptions};
use crate::error::Result;
use crate::fetcher::{normalize_id, PageFetcher};
use crate::memory::{MemoryProbe, ProcessMemory};
use crate::query::{PageResult, Query};
use crate::remote::RemoteStore;
use crate::retry::retry;
use crate::stream::RowStream;
use crate::transaction::{DbOperation, Transaction, TransactionCoordinator};
use crate::types::{Key, KeyId, Row, TableName};
use crate::writer::{BatchMutator, SaveOptions};

/// The main cloudstore handle.
///
/// # Example
///
/// ```rust,ignore
/// let store = CloudStore::new(remote, ClientConfig::default())?;
///
/// store.save_batch("users", rows, &SaveOptions::default()).await?;
///
/// let mut users = store.stream_query(Query::new("users"), None);
/// while let Some(user) = users.try_next().await? {
///     println!("{:?}", user.id());
/// }
/// ```
#[derive(Clone)]
pub struct CloudStore {
    remote: Arc<dyn RemoteStore>,
    config: Arc<ClientConfig>,
    fetcher: PageFetcher,
    mutator: BatchMutator,
    coordinator: TransactionCoordinator,
    memory: Arc<dyn MemoryProbe>,
}

impl CloudStore {
    /// Creates a store handle.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] if the configuration does not validate.
    pub fn new(remote: Arc<dyn RemoteStore>, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let fetcher = PageFetcher::new(Arc::clone(&remote), config.page_retry.clone());
        let mutator = BatchMutator::new(Arc::clone(&remote), config.mutation.clone());
        let coordinator = TransactionCoordinator::new(
            Arc::clone(&remote),
            mutator.clone(),
            config.transaction.clone(),
        );

        debug!(
            project_id = config.resolve_project_id().as_deref().unwrap_or("<unset>"),
            "cloudstore client created"
        );

        Ok(Self {
            remote,
            config: Arc::new(config),
            fetcher,
            mutator,
            coordinator,
            memory: Arc::new(ProcessMemory::new()),
        })
    }

    /// Replaces the memory probe used by memory-limited streams.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Streams every row of `query`, page by page.
    ///
    /// `options` defaults to the configured [`ClientConfig::stream`].
    pub fn stream_query(&self, query: Query, options: Option<StreamOptions>) -> RowStream {
        let options = options.unwrap_or_else(|| self.config.stream.clone());
        RowStream::new(self.fetcher.clone(), query, &options, Arc::clone(&self.memory))
    }

    /// Runs `query` as a single page request.
    ///
    /// The result carries the cursor to continue from.
    pub async fn run_query(&self, query: &Query) -> Result<PageResult> {
        self.fetcher.fetch(query, query.limit, None, None).await
    }

    /// Counts the rows matching `query` with a key-only scan.
    pub async fn run_query_count(&self, query: &Query) -> Result<usize> {
        self.key_scan(query)
            .try_fold(0usize, |count, _| async move { Ok(count + 1) })
            .await
    }

    /// Fetches rows by id, sorted by id. Missing ids are skipped.
    pub async fn get_by_ids(&self, table: impl Into<TableName>, ids: &[KeyId]) -> Result<Vec<Row>> {
        let table = table.into();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<Key> = ids
            .iter()
            .map(|id| Key {
                table: table.clone(),
                id: id.clone(),
            })
            .collect();
        let chunk_size = self.config.mutation.max_items_per_call;
        let policy = &self.config.page_retry;
        let remote = &self.remote;

        let mut rows: Vec<Row> = stream::iter(keys.chunks(chunk_size))
            .map(|chunk| retry("getByIds", policy, move || remote.lookup(chunk, None)))
            .buffer_unordered(self.config.mutation.concurrency)
            .try_concat()
            .await?;

        for row in &mut rows {
            normalize_id(row, true);
        }
        rows.sort_by_key(|row| row.id());
        Ok(rows)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Saves `rows` into `table` in chunks.
    pub async fn save_batch(
        &self,
        table: impl Into<TableName>,
        rows: &[Row],
        options: &SaveOptions,
    ) -> Result<()> {
        self.mutator.save_batch(&table.into(), rows, options).await
    }

    /// Deletes by id, returning the number of ids submitted.
    pub async fn delete_by_ids(&self, table: impl Into<TableName>, ids: &[KeyId]) -> Result<usize> {
        self.mutator.delete_by_ids(&table.into(), ids, None).await
    }

    /// Deletes every row matching `query`, returning the number deleted.
    pub async fn delete_by_query(&self, query: &Query) -> Result<usize> {
        let ids: Vec<KeyId> = self
            .key_scan(query)
            .try_filter_map(|row| async move { Ok(row.key.map(|key| key.id)) })
            .try_collect()
            .await?;
        self.delete_by_ids(query.table.clone(), &ids).await
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Starts an operation log that is sent on [`Transaction::commit`].
    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new(self.coordinator.clone())
    }

    /// Runs `f`, then commits everything it queued in one remote transaction.
    ///
    /// # Errors
    ///
    /// The error from `f` (nothing is sent), or the commit error after the
    /// remote transaction was rolled back.
    pub async fn run_in_transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        Transaction::run(self.coordinator.clone(), f).await
    }

    /// Commits a prepared operation log.
    pub async fn commit_transaction(&self, ops: Vec<DbOperation>) -> Result<()> {
        self.coordinator.commit(ops).await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Key-only stream that prefetches eagerly with the configured batch size.
    fn key_scan(&self, query: &Query) -> RowStream {
        let options = StreamOptions {
            rss_limit_mb: None,
            single_batch_buffer: false,
            max_wait_seconds: None,
            ..self.config.stream.clone()
        };
        self.stream_query(query.keys_only(), Some(options))
    }

    pub(crate) async fn retry_remote<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry(operation, &self.config.page_retry, op).await
    }
}

impl std::fmt::Debug for CloudStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
