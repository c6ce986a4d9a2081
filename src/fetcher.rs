//! # Page Fetcher
//!
//! Executes one bounded query against the remote store and returns its rows,
//! continuation cursor and "more results" signal. Each call is wrapped in
//! [`retry`](crate::retry::retry) with the page fetch policy, so a caller sees
//! either a complete page or a single terminal error; a partially received
//! page is never handed out.
//!
//! Rows coming back are normalized: the `id` field is filled from the entity
//! key, or removed when the query's projection does not ask for it.

use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::query::{PageResult, Query};
use crate::remote::RemoteStore;
use crate::retry::{retry, RetryPolicy};
use crate::types::{Cursor, Row, Value, ID_FIELD};

/// Fetches single pages with retry.
#[derive(Clone)]
pub struct PageFetcher {
    remote: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
}

impl PageFetcher {
    pub fn new(remote: Arc<dyn RemoteStore>, policy: RetryPolicy) -> Self {
        Self { remote, policy }
    }

    /// The retry policy applied to every fetch.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetches one page of `query`.
    ///
    /// # Arguments
    ///
    /// * `page_limit` - Maximum rows in this page
    /// * `cursor` - Continuation token from the previous page
    /// * `read_time_ms` - Snapshot timestamp
    ///
    /// # Errors
    ///
    /// Non-transient remote errors immediately, or
    /// [`Error::RetriesExhausted`](crate::Error::RetriesExhausted).
    pub async fn fetch(
        &self,
        query: &Query,
        page_limit: Option<usize>,
        cursor: Option<&Cursor>,
        read_time_ms: Option<i64>,
    ) -> Result<PageResult> {
        let request = query.to_page_request(page_limit, cursor, read_time_ms);
        let request = &request;
        let remote = &self.remote;

        let mut page = retry("runQuery", &self.policy, move || remote.run_query(request)).await?;

        trace!(
            table = %query.table,
            rows = page.rows.len(),
            more = ?page.more_results,
            "page fetched"
        );

        let include_id = query.selects_id();
        for row in &mut page.rows {
            normalize_id(row, include_id);
        }
        Ok(page)
    }
}

/// Fills or strips the synthetic `id` field.
pub(crate) fn normalize_id(row: &mut Row, include_id: bool) {
    if !include_id {
        row.fields.remove(ID_FIELD);
        return;
    }
    if let Some(key) = &row.key {
        row.fields
            .insert(ID_FIELD.to_string(), Value::from(&key.id));
    }
}
