//! # Streaming Cursor Reader
//!
//! [`RowStream`] turns a [`Query`] into a lazy sequence of rows by repeatedly
//! fetching bounded pages and following the continuation cursor. It is a
//! `futures::Stream<Item = Result<Row>>`: `None` means the scan is complete,
//! `Some(Err(_))` is a terminal failure, delivered exactly once.
//!
//! ## State Machine
//!
//! ```text
//!                 consumer demand / prefetch / safety timer
//!       ┌──────────────┐  (only when Idle)   ┌──────────────┐
//!  ───▶ │ Idle{cursor} │ ──────────────────▶ │   Fetching   │
//!       └──────────────┘                     └──────┬───────┘
//!              ▲       page arrived, more remains   │
//!              └────────────────────────────────────┤
//!                                                   │ empty / no cursor /
//!                   ┌──────────┐   fetch failed     │ NoMore / limit reached
//!                   │ Errored  │ ◀──────────────────┤
//!                   └──────────┘                    ▼
//!                                              ┌──────────┐
//!                                              │   Done   │
//!                                              └──────────┘
//! ```
//!
//! Every path that may start a fetch (consumer polling with an empty buffer,
//! the backpressure policy after a page lands, the safety timer) goes through
//! one function that performs the `Idle → Fetching` transition under the
//! session lock. That transition is the in-flight guard: at most one page is
//! ever being fetched, and pages are appended in cursor order.
//!
//! ## Backpressure
//!
//! After a page lands and more rows remain, the policy decides whether to fetch
//! ahead of the consumer:
//!
//! | Policy | Next fetch starts |
//! |--------|-------------------|
//! | [`BackpressurePolicy::SingleBatch`] | only when the consumer drained the buffer |
//! | [`BackpressurePolicy::MemoryLimited`] | immediately if RSS ≤ limit, else on demand |
//! | [`BackpressurePolicy::Eager`] | immediately |
//!
//! ## Safety Timer
//!
//! With `max_wait_seconds` set, a background task ticks every `max_wait / 2`.
//! If the consumer has not polled for `max_wait` (and no forced fetch happened
//! within that window), it forces the fetch decision. A forced fetch still has
//! to win the `Idle → Fetching` transition, so it can never overlap a fetch in
//! flight. The timer starts on the first poll and stops on any terminal state.
//!
//! ## Cancellation
//!
//! Dropping the stream moves it to `Done`, aborts the timer and any fetch in
//! flight.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::{FutureExt, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::StreamOptions;
use crate::error::{Error, Result};
use crate::fetcher::PageFetcher;
use crate::memory::MemoryProbe;
use crate::query::{PageResult, Query};
use crate::types::{Cursor, MoreResults, Row};

// =============================================================================
// Policy and Observability Types
// =============================================================================

/// When a stream may fetch ahead of its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackpressurePolicy {
    /// Never prefetch.
    SingleBatch,
    /// Prefetch while resident memory is at or below `limit_mb`.
    MemoryLimited { limit_mb: u64 },
    /// Always prefetch.
    Eager,
}

/// Externally visible phase of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Fetching,
    Done,
    Errored,
}

/// Snapshot of a stream's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    /// Rows received from the store so far.
    pub rows_retrieved: usize,
    /// Rows handed to the consumer so far.
    pub rows_delivered: usize,
    /// Page fetches started.
    pub fetches: u64,
    /// Page fetches started by the safety timer.
    pub forced_fetches: u64,
    /// Time spent idle between the end of one fetch and the start of the next.
    pub total_wait: Duration,
    /// Rows buffered but not yet delivered.
    pub buffered: usize,
    pub phase: StreamPhase,
}

// =============================================================================
// Session State
// =============================================================================

enum Phase {
    Idle { cursor: Option<Cursor> },
    Fetching,
    Done,
    Errored,
}

impl Phase {
    fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Errored)
    }

    fn public(&self) -> StreamPhase {
        match self {
            Phase::Idle { .. } => StreamPhase::Idle,
            Phase::Fetching => StreamPhase::Fetching,
            Phase::Done => StreamPhase::Done,
            Phase::Errored => StreamPhase::Errored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Consumer,
    Prefetch,
    SafetyTimer,
}

struct Session {
    phase: Phase,
    rows_retrieved: usize,
    rows_delivered: usize,
    fetches: u64,
    forced_fetches: u64,
    buffer: VecDeque<Row>,
    pending_error: Option<Error>,
    last_fetch_done: Instant,
    total_wait: Duration,
    last_read: Instant,
    last_forced: Option<Instant>,
    waker: Option<Waker>,
}

impl Session {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

#[derive(Default)]
struct Tasks {
    timer: Option<AbortHandle>,
    fetch: Option<AbortHandle>,
}

struct Shared {
    query: Query,
    fetcher: PageFetcher,
    batch_size: usize,
    read_time_ms: Option<i64>,
    debug: bool,
    policy: BackpressurePolicy,
    memory: Arc<dyn MemoryProbe>,
    session: Mutex<Session>,
    tasks: Mutex<Tasks>,
}

impl Shared {
    fn abort_timer(&self) {
        if let Some(timer) = self.tasks.lock().timer.take() {
            timer.abort();
        }
    }

    /// Moves to `Done`, stops the timer and wakes the consumer.
    fn finish(&self, session: &mut Session) {
        session.phase = Phase::Done;
        self.abort_timer();
        session.wake();
        self.log_progress(session, "stream finished");
    }

    fn log_progress(&self, session: &Session, message: &'static str) {
        let table = self.query.table.as_str();
        let total_wait_ms = session.total_wait.as_millis() as u64;
        if self.debug {
            info!(
                table,
                rows_retrieved = session.rows_retrieved,
                fetches = session.fetches,
                total_wait_ms,
                "{message}"
            );
        } else {
            debug!(
                table,
                rows_retrieved = session.rows_retrieved,
                fetches = session.fetches,
                total_wait_ms,
                "{message}"
            );
        }
    }
}

// =============================================================================
// Fetch Decision
// =============================================================================

/// Starts a page fetch if the stream is idle.
///
/// This is the only place a fetch is started. The `Idle → Fetching` transition
/// happens under the session lock, so concurrent triggers cannot both win.
fn maybe_fetch(shared: &Arc<Shared>, trigger: Trigger) {
    let (cursor, page_limit) = {
        let mut session = shared.session.lock();
        let cursor = match &session.phase {
            Phase::Idle { cursor } => cursor.clone(),
            _ => return,
        };

        let page_limit = match shared.query.limit {
            Some(limit) => {
                let remaining = limit.saturating_sub(session.rows_retrieved);
                if remaining == 0 {
                    shared.finish(&mut session);
                    return;
                }
                remaining.min(shared.batch_size)
            }
            None => shared.batch_size,
        };

        let now = Instant::now();
        if session.fetches > 0 {
            let idle = now.saturating_duration_since(session.last_fetch_done);
            session.total_wait += idle;
        }
        session.phase = Phase::Fetching;
        session.fetches += 1;
        if trigger == Trigger::SafetyTimer {
            session.forced_fetches += 1;
        }
        (cursor, page_limit)
    };

    debug!(
        table = shared.query.table.as_str(),
        page_limit,
        trigger = ?trigger,
        "fetching page"
    );

    // Held across the spawn so a prefetch started by this task cannot have its
    // handle overwritten by ours.
    let mut tasks = shared.tasks.lock();
    let task_shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        let fetch = task_shared.fetcher.fetch(
            &task_shared.query,
            Some(page_limit),
            cursor.as_ref(),
            task_shared.read_time_ms,
        );
        let result = match AssertUnwindSafe(fetch).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Error::Internal(format!(
                "page fetch panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        complete_fetch(&task_shared, result);
    });
    tasks.fetch = Some(handle.abort_handle());
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Applies a finished page fetch to the session.
fn complete_fetch(shared: &Arc<Shared>, result: Result<PageResult>) {
    let mut session = shared.session.lock();
    if !matches!(session.phase, Phase::Fetching) {
        // Dropped while the page was in flight.
        return;
    }
    session.last_fetch_done = Instant::now();

    let page = match result {
        Ok(page) => page,
        Err(err) => {
            error!(
                table = shared.query.table.as_str(),
                rows_retrieved = session.rows_retrieved,
                error = %err,
                "stream failed"
            );
            session.pending_error = Some(Error::StreamFailed {
                table: shared.query.table.to_string(),
                rows_retrieved: session.rows_retrieved,
                source: Box::new(err),
            });
            session.phase = Phase::Errored;
            shared.abort_timer();
            session.wake();
            return;
        }
    };

    let mut rows = page.rows;
    if let Some(limit) = shared.query.limit {
        rows.truncate(limit.saturating_sub(session.rows_retrieved));
    }
    let received = rows.len();
    session.rows_retrieved += received;
    session.buffer.extend(rows);

    let limit_reached = shared
        .query
        .limit
        .is_some_and(|limit| session.rows_retrieved >= limit);
    let exhausted = received == 0
        || page.end_cursor.is_none()
        || page.more_results == MoreResults::NoMore
        || limit_reached;

    if exhausted {
        shared.finish(&mut session);
        return;
    }

    shared.log_progress(&session, "page received");
    session.phase = Phase::Idle {
        cursor: page.end_cursor,
    };
    session.wake();
    drop(session);

    match shared.policy {
        BackpressurePolicy::SingleBatch => {}
        BackpressurePolicy::MemoryLimited { limit_mb } => match shared.memory.rss_mb() {
            Some(rss_mb) if rss_mb > limit_mb => {
                warn!(
                    table = shared.query.table.as_str(),
                    rss_mb,
                    limit_mb,
                    "memory above limit, pausing prefetch until the consumer catches up"
                );
            }
            _ => maybe_fetch(shared, Trigger::Prefetch),
        },
        BackpressurePolicy::Eager => maybe_fetch(shared, Trigger::Prefetch),
    }
}

// =============================================================================
// Safety Timer
// =============================================================================

async fn run_safety_timer(weak: Weak<Shared>, max_wait: Duration) {
    let half = (max_wait / 2).max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + half, half);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = weak.upgrade() else {
            return;
        };

        {
            let mut session = shared.session.lock();
            if session.phase.is_terminal() {
                return;
            }
            if !matches!(session.phase, Phase::Idle { .. }) {
                continue;
            }
            let now = Instant::now();
            let last_activity = match session.last_forced {
                Some(forced) => forced.max(session.last_read),
                None => session.last_read,
            };
            if now.saturating_duration_since(last_activity) < max_wait {
                continue;
            }
            session.last_forced = Some(now);
            warn!(
                table = shared.query.table.as_str(),
                rows_retrieved = session.rows_retrieved,
                buffered = session.buffer.len(),
                max_wait_ms = max_wait.as_millis() as u64,
                "consumer stalled, forcing next fetch"
            );
        }

        maybe_fetch(&shared, Trigger::SafetyTimer);
    }
}

// =============================================================================
// RowStream
// =============================================================================

/// A lazy, paginated scan over the rows of a query.
///
/// # Example
///
/// ```rust,ignore
/// use futures::TryStreamExt;
///
/// let mut rows = store.stream_query(Query::new("users"), None);
/// while let Some(row) = rows.try_next().await? {
///     process(row);
/// }
/// ```
pub struct RowStream {
    shared: Arc<Shared>,
    max_wait: Option<Duration>,
    started: bool,
}

impl RowStream {
    /// Creates a stream. Nothing is fetched until the first poll.
    ///
    /// Invalid `options` produce a stream whose only item is the
    /// [`Error::InvalidConfig`].
    pub fn new(
        fetcher: PageFetcher,
        query: Query,
        options: &StreamOptions,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        let now = Instant::now();
        let (phase, pending_error) = match options.validate() {
            Ok(()) => (
                Phase::Idle {
                    cursor: query.start_cursor.clone(),
                },
                None,
            ),
            Err(err) => (Phase::Errored, Some(err)),
        };
        let shared = Arc::new(Shared {
            query,
            fetcher,
            batch_size: options.batch_size.max(1),
            read_time_ms: options.read_time_ms(),
            debug: options.debug,
            policy: options.backpressure(),
            memory,
            session: Mutex::new(Session {
                phase,
                rows_retrieved: 0,
                rows_delivered: 0,
                fetches: 0,
                forced_fetches: 0,
                buffer: VecDeque::new(),
                pending_error,
                last_fetch_done: now,
                total_wait: Duration::ZERO,
                last_read: now,
                last_forced: None,
                waker: None,
            }),
            tasks: Mutex::new(Tasks::default()),
        });

        Self {
            shared,
            max_wait: options.max_wait(),
            started: false,
        }
    }

    /// The backpressure policy in effect.
    pub fn policy(&self) -> BackpressurePolicy {
        self.shared.policy
    }

    /// Current progress.
    pub fn stats(&self) -> StreamStats {
        let session = self.shared.session.lock();
        StreamStats {
            rows_retrieved: session.rows_retrieved,
            rows_delivered: session.rows_delivered,
            fetches: session.fetches,
            forced_fetches: session.forced_fetches,
            total_wait: session.total_wait,
            buffered: session.buffer.len(),
            phase: session.phase.public(),
        }
    }

    fn start(&mut self) {
        self.started = true;
        {
            let mut session = self.shared.session.lock();
            let now = Instant::now();
            session.last_read = now;
            session.last_fetch_done = now;
        }
        if let Some(max_wait) = self.max_wait {
            let timer = tokio::spawn(run_safety_timer(Arc::downgrade(&self.shared), max_wait));
            self.shared.tasks.lock().timer = Some(timer.abort_handle());
        }
    }
}

impl Stream for RowStream {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.started {
            this.start();
        }

        {
            let mut session = this.shared.session.lock();
            session.last_read = Instant::now();

            if let Some(row) = session.buffer.pop_front() {
                session.rows_delivered += 1;
                return Poll::Ready(Some(Ok(row)));
            }
            if let Some(err) = session.pending_error.take() {
                return Poll::Ready(Some(Err(err)));
            }
            match session.phase {
                Phase::Done | Phase::Errored => return Poll::Ready(None),
                Phase::Fetching => {
                    session.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                Phase::Idle { .. } => {
                    session.waker = Some(cx.waker().clone());
                }
            }
        }

        maybe_fetch(&this.shared, Trigger::Consumer);
        Poll::Pending
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        {
            let mut session = self.shared.session.lock();
            if !session.phase.is_terminal() {
                session.phase = Phase::Done;
            }
            session.waker = None;
        }
        let mut tasks = self.shared.tasks.lock();
        if let Some(timer) = tasks.timer.take() {
            timer.abort();
        }
        if let Some(fetch) = tasks.fetch.take() {
            fetch.abort();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
