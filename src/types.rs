//! # Domain Types for cloudstore
//!
//! This module defines the core types shared by the reader, the mutator and the
//! transaction layer: table names, keys, field values, rows, and the small
//! tokens (cursors, transaction ids) the remote store hands back.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Table names, cursors and transaction ids are all strings on the wire. We wrap
//! each one in a single-field struct so a cursor can never be passed where a
//! table name is expected.
//!
//! ## Identity
//!
//! Every stored entity has a [`Key`]: its table plus a [`KeyId`], which is
//! either a string name or a numeric id. Rows read back from the store expose
//! that identity twice: as [`Row::key`] and as a synthetic `id` field, so
//! callers that think in flat records can read `row.get("id")`.
//!
//! ```text
//! stored entity                      Row
//! ┌───────────────────────┐          ┌───────────────────────────────┐
//! │ key: users/"u-17"     │  read →  │ key:    Some(users/"u-17")    │
//! │ name: "Ada"           │          │ fields: id   = "u-17"         │
//! │ age:  36              │          │         name = "Ada"          │
//! └───────────────────────┘          │         age  = 36             │
//!                                    └───────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;

/// Name of the synthetic identity field on rows.
pub const ID_FIELD: &str = "id";

// =============================================================================
// Table Identification
// =============================================================================

/// Name of a table (the store calls these "kinds").
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName(String);

impl TableName {
    /// Creates a table name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tables whose names start with `_` belong to the store itself.
    pub fn is_internal(&self) -> bool {
        self.0.starts_with('_')
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TableName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TableName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Keys
// =============================================================================

/// The identifier part of a key.
///
/// The store accepts either a string name or a 64-bit numeric id. Both render
/// to the same string form in the `id` field of a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyId {
    /// Caller-chosen string name.
    Name(String),
    /// Numeric id.
    Id(i64),
}

impl KeyId {
    /// Derives a key id from a field value, if the value can be one.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(KeyId::Name(s.clone())),
            Value::Integer(i) => Some(KeyId::Id(*i)),
            _ => None,
        }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyId::Name(name) => write!(f, "{name}"),
            KeyId::Id(id) => write!(f, "{id}"),
        }
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        KeyId::Name(s.to_string())
    }
}

impl From<String> for KeyId {
    fn from(s: String) -> Self {
        KeyId::Name(s)
    }
}

impl From<&String> for KeyId {
    fn from(s: &String) -> Self {
        KeyId::Name(s.clone())
    }
}

impl From<i64> for KeyId {
    fn from(id: i64) -> Self {
        KeyId::Id(id)
    }
}

/// Full key of a stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    /// Table the entity lives in.
    pub table: TableName,
    /// Identifier within the table.
    pub id: KeyId,
}

impl Key {
    /// Creates a key.
    pub fn new(table: impl Into<TableName>, id: impl Into<KeyId>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

// =============================================================================
// Values and Rows
// =============================================================================

/// A field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the string contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer contents, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the byte contents, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<&KeyId> for Value {
    fn from(id: &KeyId) -> Self {
        Value::String(id.to_string())
    }
}

/// A flat record plus its identity.
///
/// `key` is `None` for rows built by the application that have not been saved
/// yet; in that case the `id` field (if any) determines the key on save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    /// Identity key, when known.
    pub key: Option<Key>,
    /// Field values, ordered by name.
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a row whose `id` field is set to the given id.
    pub fn with_id(id: impl Into<KeyId>) -> Self {
        let id = id.into();
        let mut row = Self::new();
        row.fields.insert(ID_FIELD.to_string(), Value::from(&id));
        row
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Sets a field.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// The row's identity as a string: the key id if there is a key, else the
    /// `id` field.
    pub fn id(&self) -> Option<String> {
        if let Some(key) = &self.key {
            return Some(key.id.to_string());
        }
        self.fields
            .get(ID_FIELD)
            .and_then(KeyId::from_value)
            .map(|id| id.to_string())
    }

    /// Resolves the key this row would be saved under in `table`.
    ///
    /// An explicit [`Row::key`] wins over the `id` field.
    pub fn resolve_key(&self, table: &TableName) -> Option<Key> {
        if let Some(key) = &self.key {
            return Some(key.clone());
        }
        self.fields
            .get(ID_FIELD)
            .and_then(KeyId::from_value)
            .map(|id| Key {
                table: table.clone(),
                id,
            })
    }
}

// =============================================================================
// Mutation Payloads
// =============================================================================

/// How a save treats existing entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SaveMethod {
    /// Fails if the entity exists.
    Insert,
    /// Fails if the entity does not exist.
    Update,
    /// Creates or replaces.
    #[default]
    Upsert,
}

impl fmt::Display for SaveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SaveMethod::Insert => "insert",
            SaveMethod::Update => "update",
            SaveMethod::Upsert => "upsert",
        };
        write!(f, "{s}")
    }
}

/// One entity as sent to the remote store.
///
/// The synthetic `id` field is not part of `data`; identity travels in `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPayload {
    pub key: Key,
    pub data: BTreeMap<String, Value>,
    pub exclude_from_indexes: Vec<String>,
}

impl EntityPayload {
    /// Builds the payload for `row`, or `None` if the row has no identity.
    pub fn from_row(table: &TableName, row: &Row, exclude_from_indexes: &[String]) -> Option<Self> {
        let key = row.resolve_key(table)?;
        let mut data = row.fields.clone();
        data.remove(ID_FIELD);
        Some(Self {
            key,
            data,
            exclude_from_indexes: exclude_from_indexes.to_vec(),
        })
    }
}

// =============================================================================
// Remote Tokens
// =============================================================================

/// Opaque continuation token returned by a page fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote transaction token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The store's signal about what lies past the returned page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoreResults {
    /// The page was cut by the limit or a cursor; more rows may follow.
    HasMore,
    /// The query is exhausted.
    NoMore,
    /// The store did not say.
    #[default]
    Unknown,
}

// =============================================================================
// Tests
// =============================================================================
