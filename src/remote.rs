//! # Remote Store Interface
//!
//! The cloud store itself (query execution, indexing, consistency) is an
//! external collaborator. Everything the crate needs from it is captured by the
//! [`RemoteStore`] trait: one paginated query, lookups, bounded saves and
//! deletes, transaction control, and statistics.
//!
//! ```text
//!   RowStream / PageFetcher ──run_query──┐
//!   BatchMutator ──────────save/delete───┤
//!   TransactionCoordinator ─begin/commit─┼──▶ dyn RemoteStore ──▶ network
//!   CloudStore::get_by_ids ──lookup──────┤
//!   stats ────────────────table_stats────┘
//! ```
//!
//! Implementations are expected to be thin: translate the call to the wire,
//! translate failures into [`Error::Remote`](crate::Error::Remote) with the
//! service's message intact so transient classification keeps working. They
//! must not retry on their own; retry is layered on top.
//!
//! ## Rust Concepts
//!
//! - `#[async_trait]` so the trait can be used as `Arc<dyn RemoteStore>`
//! - `Send + Sync` so one store handle can be shared by every task

use async_trait::async_trait;

use crate::error::Result;
use crate::query::{PageRequest, PageResult};
use crate::types::{EntityPayload, Key, Row, SaveMethod, TableName, TransactionId};

/// The most entities the store accepts in a single save, delete or lookup.
pub const MAX_ITEMS_PER_CALL: usize = 500;

/// Per-table statistics maintained by the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableStats {
    pub table: TableName,
    pub count: u64,
    pub bytes: u64,
    pub entity_bytes: u64,
    /// Unix timestamp (seconds) the statistics were computed at.
    pub timestamp: i64,
}

/// Operations of the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Runs one bounded query page.
    async fn run_query(&self, request: &PageRequest) -> Result<PageResult>;

    /// Fetches entities by key; missing keys are omitted from the result.
    async fn lookup(&self, keys: &[Key], transaction: Option<&TransactionId>) -> Result<Vec<Row>>;

    /// Writes at most [`MAX_ITEMS_PER_CALL`] entities.
    ///
    /// Inside a transaction the write is buffered until commit.
    async fn save(
        &self,
        entities: &[EntityPayload],
        method: SaveMethod,
        transaction: Option<&TransactionId>,
    ) -> Result<()>;

    /// Deletes at most [`MAX_ITEMS_PER_CALL`] keys. Missing keys are not an error.
    async fn delete(&self, keys: &[Key], transaction: Option<&TransactionId>) -> Result<()>;

    /// Opens a transaction.
    async fn begin_transaction(&self) -> Result<TransactionId>;

    /// Applies everything buffered in the transaction atomically.
    async fn commit(&self, transaction: &TransactionId) -> Result<()>;

    /// Discards the transaction.
    async fn rollback(&self, transaction: &TransactionId) -> Result<()>;

    /// Statistics for one table, or for every table when `table` is `None`.
    async fn table_stats(&self, table: Option<&TableName>) -> Result<Vec<TableStats>>;
}
