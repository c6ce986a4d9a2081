#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloudstore::query::KEY_FIELD;
use cloudstore::{
    ClientConfig, CloudStore, EntityPayload, Error, FilterOp, FixedMemory, Key, KeyId,
    MoreResults, PageRequest, PageResult, RemoteStore, Result, RetryPolicy, Row, SaveMethod,
    TableName, TableStats, TransactionConfig, TransactionId, Value,
};
use parking_lot::Mutex;

// =============================================================================
// In-Memory Remote Store
// =============================================================================

type Entity = BTreeMap<String, Value>;

enum Pending {
    Save(Vec<EntityPayload>, SaveMethod),
    Delete(Vec<Key>),
}

#[derive(Default)]
struct State {
    tables: BTreeMap<TableName, BTreeMap<KeyId, Entity>>,
    stats: Vec<TableStats>,

    query_errors: VecDeque<String>,
    save_errors: VecDeque<String>,
    delete_errors: VecDeque<String>,
    commit_errors: VecDeque<String>,
    rollback_errors: VecDeque<String>,
    query_panics: usize,

    query_requests: Vec<PageRequest>,
    pages_served: Vec<(usize, MoreResults)>,
    save_calls: Vec<usize>,
    saved_payloads: Vec<EntityPayload>,
    delete_calls: Vec<usize>,
    lookup_calls: Vec<usize>,

    in_flight: usize,
    max_in_flight: usize,

    transactions: HashMap<TransactionId, Vec<Pending>>,
    next_tx: u64,
    begins: usize,
    commits: usize,
    rollbacks: usize,
}

/// A `RemoteStore` backed by ordered maps, with fault injection and call
/// accounting.
///
/// Cursors are offsets into the filtered, ordered result set, so re-running a
/// page with the same cursor returns the same rows.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
    query_delay: Mutex<Option<Duration>>,
    save_delay: Mutex<Option<Duration>>,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts `n` rows `id_0 .. id_{n-1}` with field `n` set to the index.
    pub fn seed(&self, table: &str, n: usize) {
        let mut state = self.state.lock();
        let rows = state.tables.entry(TableName::new(table)).or_default();
        for i in 0..n {
            let mut entity = Entity::new();
            entity.insert("n".to_string(), Value::Integer(i as i64));
            rows.insert(KeyId::Name(format!("id_{i}")), entity);
        }
    }

    pub fn insert(&self, table: &str, id: impl Into<KeyId>, entity: Entity) {
        self.state
            .lock()
            .tables
            .entry(TableName::new(table))
            .or_default()
            .insert(id.into(), entity);
    }

    pub fn get(&self, table: &str, id: impl Into<KeyId>) -> Option<Entity> {
        self.state
            .lock()
            .tables
            .get(&TableName::new(table))
            .and_then(|rows| rows.get(&id.into()).cloned())
    }

    pub fn count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(&TableName::new(table))
            .map_or(0, |rows| rows.len())
    }

    pub fn set_stats(&self, stats: Vec<TableStats>) {
        self.state.lock().stats = stats;
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock() = Some(delay);
    }

    pub fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock() = Some(delay);
    }

    pub fn fail_queries(&self, message: &str, times: usize) {
        let mut state = self.state.lock();
        state.query_errors.extend(std::iter::repeat(message.to_string()).take(times));
    }

    /// Makes the next `times` queries panic instead of returning.
    pub fn panic_queries(&self, times: usize) {
        self.state.lock().query_panics += times;
    }

    pub fn fail_saves(&self, message: &str, times: usize) {
        let mut state = self.state.lock();
        state.save_errors.extend(std::iter::repeat(message.to_string()).take(times));
    }

    pub fn fail_deletes(&self, message: &str, times: usize) {
        let mut state = self.state.lock();
        state.delete_errors.extend(std::iter::repeat(message.to_string()).take(times));
    }

    pub fn fail_commits(&self, message: &str, times: usize) {
        let mut state = self.state.lock();
        state.commit_errors.extend(std::iter::repeat(message.to_string()).take(times));
    }

    pub fn fail_rollbacks(&self, message: &str, times: usize) {
        let mut state = self.state.lock();
        state.rollback_errors.extend(std::iter::repeat(message.to_string()).take(times));
    }

    pub fn query_requests(&self) -> Vec<PageRequest> {
        self.state.lock().query_requests.clone()
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().query_requests.len()
    }

    pub fn pages_served(&self) -> Vec<(usize, MoreResults)> {
        self.state.lock().pages_served.clone()
    }

    pub fn save_calls(&self) -> Vec<usize> {
        self.state.lock().save_calls.clone()
    }

    pub fn saved_payloads(&self) -> Vec<EntityPayload> {
        self.state.lock().saved_payloads.clone()
    }

    pub fn delete_calls(&self) -> Vec<usize> {
        self.state.lock().delete_calls.clone()
    }

    pub fn lookup_calls(&self) -> Vec<usize> {
        self.state.lock().lookup_calls.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    pub fn begins(&self) -> usize {
        self.state.lock().begins
    }

    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn open_transactions(&self) -> usize {
        self.state.lock().transactions.len()
    }

    fn apply_save(state: &mut State, entities: &[EntityPayload], method: SaveMethod) -> Result<()> {
        for entity in entities {
            let rows = state.tables.entry(entity.key.table.clone()).or_default();
            let exists = rows.contains_key(&entity.key.id);
            match method {
                SaveMethod::Insert if exists => {
                    return Err(Error::remote(format!("6 ALREADY_EXISTS: entity already exists: {}", entity.key)))
                }
                SaveMethod::Update if !exists => {
                    return Err(Error::remote(format!("5 NOT_FOUND: no entity to update: {}", entity.key)))
                }
                _ => {}
            }
        }
        for entity in entities {
            state
                .tables
                .entry(entity.key.table.clone())
                .or_default()
                .insert(entity.key.id.clone(), entity.data.clone());
        }
        Ok(())
    }

    fn apply_delete(state: &mut State, keys: &[Key]) {
        for key in keys {
            if let Some(rows) = state.tables.get_mut(&key.table) {
                rows.remove(&key.id);
            }
        }
    }
}

fn key_value(id: &KeyId) -> Value {
    Value::String(id.to_string())
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Double(x), Value::Double(y)) => x.partial_cmp(y),
        (Value::Integer(x), Value::Double(y)) => (*x as f64).partial_cmp(y),
        (Value::Double(x), Value::Integer(y)) => x.partial_cmp(&(*y as f64)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn matches(actual: Option<&Value>, op: FilterOp, expected: &Value) -> bool {
    let actual = actual.unwrap_or(&Value::Null);
    let ord = compare(actual, expected);
    match op {
        FilterOp::Eq => ord == Some(Ordering::Equal),
        FilterOp::Ne => ord != Some(Ordering::Equal),
        FilterOp::Lt => ord == Some(Ordering::Less),
        FilterOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        FilterOp::Gt => ord == Some(Ordering::Greater),
        FilterOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
        FilterOp::In | FilterOp::NotIn => {
            let found = match expected {
                Value::Array(items) => items
                    .iter()
                    .any(|item| compare(actual, item) == Some(Ordering::Equal)),
                _ => false,
            };
            (op == FilterOp::In) == found
        }
    }
}

fn field_of(id: &KeyId, entity: &Entity, field: &str) -> Option<Value> {
    if field == KEY_FIELD {
        Some(key_value(id))
    } else {
        entity.get(field).cloned()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn run_query(&self, request: &PageRequest) -> Result<PageResult> {
        let delay = *self.query_delay.lock();
        {
            let mut state = self.state.lock();
            state.query_requests.push(request.clone());
            if let Some(message) = state.query_errors.pop_front() {
                return Err(Error::remote(message));
            }
            if state.query_panics > 0 {
                state.query_panics -= 1;
                drop(state);
                panic!("remote query handler crashed");
            }
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let mut matching: Vec<(KeyId, Entity)> = state
            .tables
            .get(&request.table)
            .map(|rows| {
                rows.iter()
                    .filter(|(id, entity)| {
                        request.filters.iter().all(|f| {
                            matches(field_of(id, entity, &f.field).as_ref(), f.op, &f.value)
                        })
                    })
                    .map(|(id, entity)| (id.clone(), entity.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for order in request.orders.iter().rev() {
            matching.sort_by(|(a_id, a), (b_id, b)| {
                let av = field_of(a_id, a, &order.field).unwrap_or(Value::Null);
                let bv = field_of(b_id, b, &order.field).unwrap_or(Value::Null);
                let ord = compare(&av, &bv).unwrap_or(Ordering::Equal);
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        let offset: usize = request
            .start_cursor
            .as_ref()
            .and_then(|c| c.as_str().strip_prefix("offset:"))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let total = matching.len();
        let end = match request.limit {
            Some(limit) => (offset + limit).min(total),
            None => total,
        };
        let start = offset.min(end);

        let rows: Vec<Row> = matching[start..end]
            .iter()
            .map(|(id, entity)| {
                let fields = if request.is_keys_only() {
                    BTreeMap::new()
                } else if request.projection.is_empty() {
                    entity.clone()
                } else {
                    entity
                        .iter()
                        .filter(|(name, _)| request.projection.contains(name))
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect()
                };
                Row {
                    key: Some(Key {
                        table: request.table.clone(),
                        id: id.clone(),
                    }),
                    fields,
                }
            })
            .collect();

        let more_results = if end >= total {
            MoreResults::NoMore
        } else {
            MoreResults::HasMore
        };
        state.pages_served.push((rows.len(), more_results));

        Ok(PageResult {
            rows,
            end_cursor: Some(cloudstore::Cursor::new(format!("offset:{end}"))),
            more_results,
        })
    }

    async fn lookup(&self, keys: &[Key], _transaction: Option<&TransactionId>) -> Result<Vec<Row>> {
        let mut state = self.state.lock();
        state.lookup_calls.push(keys.len());
        let mut rows: Vec<Row> = keys
            .iter()
            .filter_map(|key| {
                state
                    .tables
                    .get(&key.table)
                    .and_then(|rows| rows.get(&key.id))
                    .map(|entity| Row {
                        key: Some(key.clone()),
                        fields: entity.clone(),
                    })
            })
            .collect();
        // The real store does not preserve request order either.
        rows.reverse();
        Ok(rows)
    }

    async fn save(
        &self,
        entities: &[EntityPayload],
        method: SaveMethod,
        transaction: Option<&TransactionId>,
    ) -> Result<()> {
        let delay = *self.save_delay.lock();
        {
            let mut state = self.state.lock();
            state.save_calls.push(entities.len());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.in_flight -= 1;
        if let Some(message) = state.save_errors.pop_front() {
            return Err(Error::remote(message));
        }
        state.saved_payloads.extend(entities.iter().cloned());

        match transaction {
            Some(tx) => match state.transactions.get_mut(tx) {
                Some(pending) => {
                    pending.push(Pending::Save(entities.to_vec(), method));
                    Ok(())
                }
                None => Err(Error::remote("3 INVALID_ARGUMENT: unknown transaction")),
            },
            None => Self::apply_save(&mut state, entities, method),
        }
    }

    async fn delete(&self, keys: &[Key], transaction: Option<&TransactionId>) -> Result<()> {
        let mut state = self.state.lock();
        state.delete_calls.push(keys.len());
        if let Some(message) = state.delete_errors.pop_front() {
            return Err(Error::remote(message));
        }
        match transaction {
            Some(tx) => match state.transactions.get_mut(tx) {
                Some(pending) => {
                    pending.push(Pending::Delete(keys.to_vec()));
                    Ok(())
                }
                None => Err(Error::remote("3 INVALID_ARGUMENT: unknown transaction")),
            },
            None => {
                Self::apply_delete(&mut state, keys);
                Ok(())
            }
        }
    }

    async fn begin_transaction(&self) -> Result<TransactionId> {
        let mut state = self.state.lock();
        state.begins += 1;
        state.next_tx += 1;
        let tx = TransactionId::new(format!("tx-{}", state.next_tx));
        state.transactions.insert(tx.clone(), Vec::new());
        Ok(tx)
    }

    async fn commit(&self, transaction: &TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(message) = state.commit_errors.pop_front() {
            return Err(Error::remote(message));
        }
        let pending = state
            .transactions
            .remove(transaction)
            .ok_or_else(|| Error::remote("3 INVALID_ARGUMENT: unknown transaction"))?;
        for op in &pending {
            match op {
                Pending::Save(entities, method) => Self::apply_save(&mut state, entities, *method)?,
                Pending::Delete(keys) => Self::apply_delete(&mut state, keys),
            }
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self, transaction: &TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        state.rollbacks += 1;
        state.transactions.remove(transaction);
        if let Some(message) = state.rollback_errors.pop_front() {
            return Err(Error::remote(message));
        }
        Ok(())
    }

    async fn table_stats(&self, table: Option<&TableName>) -> Result<Vec<TableStats>> {
        let state = self.state.lock();
        Ok(state
            .stats
            .iter()
            .filter(|s| table.map_or(true, |t| &s.table == t))
            .cloned()
            .collect())
    }
}

// =============================================================================
// Store Helpers
// =============================================================================

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        delay_ms: 1,
        delay_multiplier: 2.0,
        max_delay_ms: Some(10),
        timeout_ms: None,
    }
}

/// Configuration with millisecond backoff so failure tests run quickly.
pub fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.page_retry = fast_retry(5);
    config.mutation.retry = fast_retry(5);
    config.transaction = TransactionConfig {
        max_attempts: 3,
        delay_ms: 1,
        delay_multiplier: 2.0,
    };
    config
}

/// A store over `remote` whose memory probe reports 1 MB.
pub fn store_with(remote: &Arc<MemoryRemote>, config: ClientConfig) -> CloudStore {
    let remote: Arc<dyn RemoteStore> = remote.clone();
    CloudStore::new(remote, config)
        .expect("valid config")
        .with_memory_probe(Arc::new(FixedMemory::from_mb(1)))
}

pub fn store(remote: &Arc<MemoryRemote>) -> CloudStore {
    store_with(remote, fast_config())
}

pub fn rows(ids: std::ops::Range<usize>) -> Vec<Row> {
    ids.map(|i| Row::with_id(format!("id_{i}")).with("n", i as i64))
        .collect()
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = tokio::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
