//! # Key-Value Facade
//!
//! Stores opaque byte values under string ids. Each entry is a row with the
//! value in the field [`VALUE_FIELD`], which is excluded from indexes so
//! values of any size can be written.
//!
//! ```text
//! ("session-9", b"...")  ──▶  Row { id: "session-9", v: Bytes(...) }
//! ```

use futures::future;
use futures::{Stream, TryStreamExt};

use crate::api::CloudStore;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::types::{KeyId, Row, TableName, Value, ID_FIELD};
use crate::writer::SaveOptions;

/// Field holding the value bytes.
pub const VALUE_FIELD: &str = "v";

/// A key and its value.
pub type KeyValue = (String, Vec<u8>);

/// Byte values keyed by string id, on top of a [`CloudStore`].
#[derive(Clone, Debug)]
pub struct KeyValueStore {
    store: CloudStore,
}

impl KeyValueStore {
    pub fn new(store: CloudStore) -> Self {
        Self { store }
    }

    /// Entries for the ids that exist, sorted by id.
    pub async fn get_by_ids(&self, table: impl Into<TableName>, ids: &[String]) -> Result<Vec<KeyValue>> {
        let ids: Vec<KeyId> = ids.iter().map(KeyId::from).collect();
        self.store
            .get_by_ids(table, &ids)
            .await?
            .into_iter()
            .map(into_entry)
            .collect()
    }

    /// Upserts every entry.
    pub async fn save_batch(&self, table: impl Into<TableName>, entries: Vec<KeyValue>) -> Result<()> {
        let rows: Vec<Row> = entries
            .into_iter()
            .map(|(id, value)| Row::with_id(id).with(VALUE_FIELD, value))
            .collect();
        let options = SaveOptions::default().exclude_from_indexes([VALUE_FIELD]);
        self.store.save_batch(table, &rows, &options).await
    }

    /// Deletes entries, returning the number of ids submitted.
    pub async fn delete_by_ids(&self, table: impl Into<TableName>, ids: &[String]) -> Result<usize> {
        let ids: Vec<KeyId> = ids.iter().map(KeyId::from).collect();
        self.store.delete_by_ids(table, &ids).await
    }

    /// Streams ids, optionally at most `limit`.
    pub fn stream_ids(
        &self,
        table: impl Into<TableName>,
        limit: Option<usize>,
    ) -> impl Stream<Item = Result<String>> + Send + Unpin {
        self.store
            .stream_query(scan(table, limit).keys_only(), None)
            .and_then(|row| future::ready(row_id(&row)))
    }

    /// Streams values in id order.
    pub fn stream_values(
        &self,
        table: impl Into<TableName>,
        limit: Option<usize>,
    ) -> impl Stream<Item = Result<Vec<u8>>> + Send + Unpin {
        self.store
            .stream_query(scan(table, limit), None)
            .and_then(|row| future::ready(into_entry(row).map(|(_, value)| value)))
    }

    /// Streams `(id, value)` pairs in id order.
    pub fn stream_entries(
        &self,
        table: impl Into<TableName>,
        limit: Option<usize>,
    ) -> impl Stream<Item = Result<KeyValue>> + Send + Unpin {
        self.store
            .stream_query(scan(table, limit), None)
            .and_then(|row| future::ready(into_entry(row)))
    }

    /// Number of entries in `table`.
    pub async fn count(&self, table: impl Into<TableName>) -> Result<usize> {
        self.store.run_query_count(&Query::new(table)).await
    }
}

fn scan(table: impl Into<TableName>, limit: Option<usize>) -> Query {
    Query::new(table)
        .order(ID_FIELD, false)
        .limit(limit.unwrap_or(0))
}

fn row_id(row: &Row) -> Result<String> {
    row.id()
        .ok_or_else(|| Error::Internal("key-value row without id".into()))
}

fn into_entry(mut row: Row) -> Result<KeyValue> {
    let id = row_id(&row)?;
    match row.fields.remove(VALUE_FIELD) {
        Some(Value::Bytes(bytes)) => Ok((id, bytes)),
        Some(Value::Null) | None => Ok((id, Vec::new())),
        Some(other) => Err(Error::Internal(format!(
            "entry '{id}' holds a non-bytes value: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Key;

    #[test]
    fn test_into_entry() {
        let mut row = Row::new().with(VALUE_FIELD, vec![1u8, 2, 3]);
        row.key = Some(Key::new("kv", "k1"));
        assert_eq!(into_entry(row).unwrap(), ("k1".to_string(), vec![1, 2, 3]));
    }

    #[test]
    fn test_into_entry_rejects_non_bytes() {
        let row = Row::with_id("k1").with(VALUE_FIELD, "text");
        assert!(matches!(into_entry(row), Err(Error::Internal(_))));
    }

    #[test]
    fn test_scan_order_and_limit() {
        let q = scan("kv", Some(3));
        assert_eq!(q.limit, Some(3));
        assert!(q.orders.is_empty());
        assert_eq!(scan("kv", None).limit, None);
    }
}
