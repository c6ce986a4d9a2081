//! # Query Descriptors
//!
//! A [`Query`] describes what the application wants: a table, filters, ordering,
//! an optional field selection and an optional overall limit. It is immutable
//! once handed to a reader. Each page fetch derives a [`PageRequest`] from it:
//! a bounded copy carrying the page limit, the continuation cursor and the
//! read timestamp.
//!
//! ```text
//! Query { limit: 2500 }                       PageRequest per fetch
//!   │                                          ┌──────────────────────────┐
//!   ├─ page 1 ──────────────────────────────▶  │ limit 1000, cursor None  │
//!   ├─ page 2 ──────────────────────────────▶  │ limit 1000, cursor c1    │
//!   └─ page 3 ──────────────────────────────▶  │ limit  500, cursor c2    │
//!                                              └──────────────────────────┘
//! ```
//!
//! ## Identity Translation
//!
//! Applications refer to identity as the field `id`. The store calls it
//! [`KEY_FIELD`]. Translation happens here, once, when the page request is
//! built: filters, orders and projections on `id` are rewritten, and an empty
//! projection becomes a key-only projection.

use std::collections::BTreeSet;

use crate::types::{Cursor, MoreResults, Row, TableName, Value, ID_FIELD};

/// The store's name for the identity pseudo-field.
pub const KEY_FIELD: &str = "__key__";

// =============================================================================
// Filters and Ordering
// =============================================================================

/// Comparison operator of a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl FilterOp {
    /// The operator as the store spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::In => "IN",
            FilterOp::NotIn => "NOT_IN",
        }
    }
}

/// A single `field op value` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// An ordering clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub field: String,
    pub descending: bool,
}

// =============================================================================
// Query
// =============================================================================

/// What to read, independent of paging.
///
/// # Example
///
/// ```rust,ignore
/// let q = Query::new("users")
///     .filter("age", FilterOp::Ge, 18)
///     .order("age", true)
///     .limit(100);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: TableName,
    pub filters: Vec<Filter>,
    pub orders: Vec<Order>,
    /// Selected fields; empty means all fields.
    pub projection: Vec<String>,
    /// Overall row limit; `None` means unbounded.
    pub limit: Option<usize>,
    pub start_cursor: Option<Cursor>,
    pub end_cursor: Option<Cursor>,
}

impl Query {
    /// Creates a query over every row of `table`.
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            orders: Vec::new(),
            projection: Vec::new(),
            limit: None,
            start_cursor: None,
            end_cursor: None,
        }
    }

    /// Adds a filter predicate.
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Adds an ordering clause.
    pub fn order(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.orders.push(Order {
            field: field.into(),
            descending,
        });
        self
    }

    /// Restricts the returned fields.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the overall row limit. A limit of `0` means no limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    /// Resumes from a cursor returned by an earlier read.
    pub fn start(mut self, cursor: Cursor) -> Self {
        self.start_cursor = Some(cursor);
        self
    }

    /// Stops at a cursor.
    pub fn end(mut self, cursor: Cursor) -> Self {
        self.end_cursor = Some(cursor);
        self
    }

    /// Whether rows returned for this query should carry the `id` field.
    pub fn selects_id(&self) -> bool {
        self.projection.is_empty() || self.projection.iter().any(|f| f == ID_FIELD)
    }

    /// Same query, reduced to a key-only projection.
    pub fn keys_only(&self) -> Self {
        let mut q = self.clone();
        q.projection = vec![ID_FIELD.to_string()];
        q
    }

    /// Builds the bounded request for one page.
    ///
    /// # Arguments
    ///
    /// * `page_limit` - Maximum rows for this page (`None` = store default)
    /// * `cursor` - Continuation from the previous page; falls back to the
    ///   query's own start cursor
    /// * `read_time_ms` - Snapshot timestamp, if reading at a fixed time
    pub fn to_page_request(
        &self,
        page_limit: Option<usize>,
        cursor: Option<&Cursor>,
        read_time_ms: Option<i64>,
    ) -> PageRequest {
        let projection = if self.projection.is_empty() {
            Vec::new()
        } else {
            let mut seen = BTreeSet::new();
            self.projection
                .iter()
                .map(|f| map_field(f))
                .filter(|f| seen.insert(f.clone()))
                .collect()
        };

        PageRequest {
            table: self.table.clone(),
            filters: self
                .filters
                .iter()
                .map(|f| Filter {
                    field: map_field(&f.field),
                    op: f.op,
                    value: f.value.clone(),
                })
                .collect(),
            orders: self
                .orders
                .iter()
                .map(|o| Order {
                    field: map_field(&o.field),
                    descending: o.descending,
                })
                .collect(),
            projection,
            limit: page_limit.filter(|l| *l > 0),
            start_cursor: cursor.cloned().or_else(|| self.start_cursor.clone()),
            end_cursor: self.end_cursor.clone(),
            read_time_ms,
        }
    }
}

fn map_field(field: &str) -> String {
    if field == ID_FIELD {
        KEY_FIELD.to_string()
    } else {
        field.to_string()
    }
}

// =============================================================================
// Wire-Level Page Types
// =============================================================================

/// One bounded query as sent to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub table: TableName,
    pub filters: Vec<Filter>,
    pub orders: Vec<Order>,
    /// Store field names; empty means all fields. `[KEY_FIELD]` means keys only.
    pub projection: Vec<String>,
    pub limit: Option<usize>,
    pub start_cursor: Option<Cursor>,
    pub end_cursor: Option<Cursor>,
    pub read_time_ms: Option<i64>,
}

impl PageRequest {
    /// Whether only keys were requested.
    pub fn is_keys_only(&self) -> bool {
        self.projection.len() == 1 && self.projection[0] == KEY_FIELD
    }
}

/// One page as returned by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResult {
    /// Rows in store order.
    pub rows: Vec<Row>,
    /// Continuation; `None` when the store has nothing further.
    pub end_cursor: Option<Cursor>,
    pub more_results: MoreResults,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_maps_to_key_field() {
        let q = Query::new("users")
            .filter("id", FilterOp::Eq, "u1")
            .order("id", false)
            .select(["id", "name"]);
        let req = q.to_page_request(Some(10), None, None);

        assert_eq!(req.filters[0].field, KEY_FIELD);
        assert_eq!(req.orders[0].field, KEY_FIELD);
        assert_eq!(req.projection, vec![KEY_FIELD.to_string(), "name".to_string()]);
    }

    #[test]
    fn test_projection_deduplicated_in_order() {
        let req = Query::new("users")
            .select(["id", "a", "id", "__key__", "a"])
            .to_page_request(None, None, None);
        assert_eq!(req.projection, vec![KEY_FIELD.to_string(), "a".to_string()]);
    }

    #[test]
    fn test_keys_only_projection() {
        let req = Query::new("users").keys_only().to_page_request(None, None, None);
        assert!(req.is_keys_only());
    }

    #[test]
    fn test_zero_limit_means_none() {
        assert_eq!(Query::new("t").limit(0).limit, None);
        assert_eq!(Query::new("t").limit(5).limit, Some(5));
        assert_eq!(Query::new("t").to_page_request(Some(0), None, None).limit, None);
    }

    #[test]
    fn test_cursor_overrides_query_start() {
        let q = Query::new("t").start(Cursor::new("s"));
        assert_eq!(
            q.to_page_request(None, None, None).start_cursor,
            Some(Cursor::new("s"))
        );
        let next = Cursor::new("c2");
        assert_eq!(
            q.to_page_request(None, Some(&next), Some(5)).start_cursor,
            Some(next)
        );
    }

    #[test]
    fn test_selects_id() {
        assert!(Query::new("t").selects_id());
        assert!(Query::new("t").select(["id"]).selects_id());
        assert!(!Query::new("t").select(["name"]).selects_id());
    }
}
