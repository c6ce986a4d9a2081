//! # cloudstore - Client Access Layer for a Paginated Document Store
//!
//! cloudstore sits between an application and a cloud-hosted, cursor-paginated
//! NoSQL store. It provides:
//!
//! - **Streaming scans**: full-table or filtered reads as a lazy `Stream` of rows,
//!   with prefetch controlled by a backpressure policy and a safety timer
//! - **Batch mutations**: saves and deletes of any size, chunked to the store's
//!   per-call limit, dispatched with bounded concurrency and retried per chunk
//! - **Transactions**: deferred operation logs replayed in one remote
//!   transaction, rolled back on failure and retried on contention
//! - **Resilience**: retry with exponential backoff for transient failures
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         CloudStore (api)                        │
//! │        stream_query · save_batch · delete_by_ids · run_in_tx    │
//! └───────┬──────────────────────┬───────────────────────┬──────────┘
//!         │                      │                       │
//!         ▼                      ▼                       ▼
//! ┌───────────────┐     ┌─────────────────┐     ┌──────────────────────┐
//! │   RowStream   │     │  BatchMutator   │◀────│ TransactionCoordinator│
//! │ (state machine│     │ (chunks ≤ 500,  │     │ (merge, commit,      │
//! │  backpressure,│     │  bounded pool)  │     │  rollback)           │
//! │  safety timer)│     └────────┬────────┘     └──────────┬───────────┘
//! └───────┬───────┘              │                         │
//!         ▼                      │                         │
//! ┌───────────────┐              │                         │
//! │  PageFetcher  │              │   retry + backoff       │
//! └───────┬───────┘              │                         │
//!         └──────────────────────┼─────────────────────────┘
//!                                ▼
//!                      ┌───────────────────┐
//!                      │ dyn RemoteStore   │
//!                      └───────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One fetch in flight per stream**: pages arrive in cursor order
//! 2. **Limits are respected**: a stream never requests more than the rows remaining
//! 3. **Terminal errors surface once**: a failed stream yields one error, then ends
//! 4. **Preconditions before I/O**: a row without id fails the batch before any call
//! 5. **Rollback never masks**: the caller sees the error that aborted a transaction
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum and transient classification
//! - [`types`]: Keys, values, rows and remote tokens
//! - [`query`]: Query descriptors and page requests
//! - [`config`]: Client and stream configuration
//! - [`remote`]: The remote store trait
//! - [`retry`]: Retry with exponential backoff
//! - [`fetcher`]: Single page fetches
//! - [`memory`]: Memory probes for backpressure
//! - [`stream`]: The streaming cursor reader
//! - [`writer`]: The batch mutator
//! - [`transaction`]: Transactions and operation merging
//! - [`api`]: The [`CloudStore`] entry point
//! - [`kv`]: Key-value facade
//! - [`stats`]: Table statistics

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for cloudstore operations.
///
/// A single error enum covers remote failures, precondition violations and
/// terminal errors, with helpers to decide what is worth retrying.
pub mod error;

/// Domain types: table names, keys, values, rows.
///
/// Uses the newtype pattern so cursors, transaction ids and table names
/// cannot be mixed up.
pub mod types;

/// Query descriptors and the bounded page requests derived from them.
pub mod query;

/// Configuration with defaults and JSON loading.
pub mod config;

/// The interface to the remote store.
pub mod remote;

/// Retry with exponential backoff and per-attempt timeouts.
pub mod retry;

/// Single page fetches with retry.
pub mod fetcher;

/// Resident memory sampling for memory-limited streams.
pub mod memory;

/// Streaming cursor reader.
///
/// Turns a query into a `Stream` of rows, fetching one page at a time under a
/// backpressure policy, with a safety timer that forces progress when the
/// consumer stalls.
pub mod stream;

/// Chunked batch saves and deletes with bounded concurrency.
pub mod writer;

/// Deferred operation logs committed in one remote transaction.
pub mod transaction;

/// Async API (main entry point).
///
/// The main entry point is [`CloudStore`](api::CloudStore).
pub mod api;

/// Key-value facade over a table of byte values.
pub mod kv;

/// Table statistics and table listing.
pub mod stats;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::CloudStore;
pub use config::{ClientConfig, StreamOptions};
pub use error::{Error, Result};
pub use fetcher::PageFetcher;
pub use kv::KeyValueStore;
pub use memory::{FixedMemory, MemoryProbe, ProcessMemory};
pub use query::{Filter, FilterOp, Order, PageRequest, PageResult, Query};
pub use remote::{RemoteStore, TableStats, MAX_ITEMS_PER_CALL};
pub use retry::RetryPolicy;
pub use stream::{BackpressurePolicy, RowStream, StreamPhase, StreamStats};
pub use transaction::{DbOperation, Transaction, TransactionConfig, TransactionCoordinator};
pub use writer::{BatchMutator, MutatorConfig, SaveOptions};

pub use types::{
    Cursor, EntityPayload, Key, KeyId, MoreResults, Row, SaveMethod, TableName, TransactionId,
    Value,
};
