//! MVCC ordered table store.
//!
//! The witness/stake state of the chain lives in named tables with a byte
//! primary id, optional secondary indexes on u64 fields, and prefix /
//! equality / ordered queries. Committed snapshots are immutable and shared;
//! a working copy forked from a snapshot absorbs transaction writes and is
//! either committed (producing the snapshot id recorded in block metadata)
//! or dropped. Read leases must be released exactly once; the registry
//! keeps lease counts so tests can assert nothing leaks.
//!
//! Memory usage is tracked per working copy: the system contract surcharge
//! charges gas for growth in the store footprint.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Identifier of a committed snapshot, stored in block metadata.
pub type SnapshotId = u64;

/// Errors from store operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("malformed where/order expression")]
    BadQuery,
    #[error("no such table: {0}")]
    NoTable(String),
    #[error("table already exists: {0}")]
    TableExists(String),
    #[error("no entry found")]
    NoEntry,
    #[error("cannot index non-empty table {0}")]
    NonEmptyTable(String),
    #[error("field {0} is not indexed")]
    NotIndexed(String),
    #[error("unknown snapshot id {0}")]
    UnknownSnapshot(SnapshotId),
    #[error("snapshot {0} already released")]
    AlreadyReleased(SnapshotId),
    #[error("row codec error: {0}")]
    Codec(String),
}

/// A typed table row. Implementors expose the primary id and the values of
/// any secondary-indexed fields.
pub trait Row: Serialize + DeserializeOwned {
    fn id(&self) -> Vec<u8>;
    /// Value of a named indexed field, if this row type carries it.
    fn index_value(&self, field: &str) -> Option<u64> {
        let _ = field;
        None
    }
}

/// Equality or prefix match on the primary id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Where<'a> {
    IdEq(&'a [u8]),
    IdPrefix(&'a [u8]),
}

impl Where<'_> {
    fn matches(&self, id: &[u8]) -> bool {
        match self {
            Where::IdEq(key) => id == *key,
            Where::IdPrefix(prefix) => id.starts_with(prefix),
        }
    }
}

/// Ordering over the primary id or an indexed field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    pub field: String,
    pub descending: bool,
}

/// Parse the textual where clause used by the database precompile:
/// `"<Field> = <bytes>"` or `"<Field> LIKE <bytes>"`, empty means no filter.
/// Only the primary `Id` field is queryable.
pub fn parse_where_clause(clause: &[u8]) -> Result<Option<OwnedWhere>, StoreError> {
    if clause.is_empty() {
        return Ok(None);
    }
    const EQ: &[u8] = b"Id = ";
    const LIKE: &[u8] = b"Id LIKE ";
    if let Some(rest) = clause.strip_prefix(LIKE) {
        return Ok(Some(OwnedWhere::prefix(rest)));
    }
    if let Some(rest) = clause.strip_prefix(EQ) {
        return Ok(Some(OwnedWhere::eq(rest)));
    }
    Err(StoreError::BadQuery)
}

/// Parse the textual order clause: `"<Field> ASC"` / `"<Field> DESC"`,
/// empty means insertion (id) order.
pub fn parse_order_clause(clause: &[u8]) -> Result<Option<Order>, StoreError> {
    if clause.is_empty() {
        return Ok(None);
    }
    let text = std::str::from_utf8(clause).map_err(|_| StoreError::BadQuery)?;
    let mut parts = text.split_whitespace();
    let field = parts.next().ok_or(StoreError::BadQuery)?;
    let direction = parts.next().ok_or(StoreError::BadQuery)?;
    if parts.next().is_some() || field.is_empty() {
        return Err(StoreError::BadQuery);
    }
    let descending = match direction {
        "ASC" => false,
        "DESC" => true,
        _ => return Err(StoreError::BadQuery),
    };
    Ok(Some(Order {
        field: field.to_string(),
        descending,
    }))
}

/// An owning [`Where`], produced by the clause parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedWhere {
    key: Vec<u8>,
    prefix: bool,
}

impl OwnedWhere {
    pub fn eq(key: &[u8]) -> Self {
        OwnedWhere {
            key: key.to_vec(),
            prefix: false,
        }
    }

    pub fn prefix(key: &[u8]) -> Self {
        OwnedWhere {
            key: key.to_vec(),
            prefix: true,
        }
    }

    pub fn as_where(&self) -> Where<'_> {
        if self.prefix {
            Where::IdPrefix(&self.key)
        } else {
            Where::IdEq(&self.key)
        }
    }
}

/// One stored row: encoded bytes plus the indexed field values captured at
/// insertion time, so overwrite/delete can unindex without decoding.
#[derive(Clone, Debug, Default)]
struct StoredRow {
    bytes: Vec<u8>,
    index_values: Vec<(String, u64)>,
}

#[derive(Clone, Debug, Default)]
struct Table {
    rows: BTreeMap<Vec<u8>, StoredRow>,
    /// field name -> ordered (value, id) pairs
    indexes: BTreeMap<String, BTreeMap<(u64, Vec<u8>), ()>>,
}

/// The full table state at one point in time. Both read snapshots and
/// working copies deref to this for queries.
#[derive(Clone, Debug, Default)]
pub struct Tables {
    tables: HashMap<String, Table>,
    scalars: BTreeMap<Vec<u8>, Vec<u8>>,
    used_memory: u64,
}

impl Tables {
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Approximate store footprint in bytes; the gas surcharge input.
    pub fn used_memory(&self) -> u64 {
        self.used_memory
    }

    /// Raw scalar read (e.g. the global system stake).
    pub fn get_raw(&self, key: &[u8]) -> Option<&[u8]> {
        self.scalars.get(key).map(|v| v.as_slice())
    }

    /// Names of the secondary indexes declared on `table`.
    pub fn table_indexes(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let table_data = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::NoTable(table.to_string()))?;
        Ok(table_data.indexes.keys().cloned().collect())
    }

    /// Query rows as raw encoded bytes in the requested order.
    pub fn query_raw(
        &self,
        table: &str,
        filter: Option<Where<'_>>,
        order: Option<&Order>,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let table_data = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::NoTable(table.to_string()))?;

        let matches = |id: &[u8]| filter.as_ref().map_or(true, |w| w.matches(id));

        let ids: Vec<&Vec<u8>> = match order {
            None => table_data.rows.keys().filter(|id| matches(id)).collect(),
            Some(order) if order.field == "Id" => {
                let iter = table_data.rows.keys().filter(|id| matches(id));
                if order.descending {
                    iter.rev().collect()
                } else {
                    iter.collect()
                }
            }
            Some(order) => {
                let index = table_data
                    .indexes
                    .get(&order.field)
                    .ok_or_else(|| StoreError::NotIndexed(order.field.clone()))?;
                let iter = index.keys().map(|(_, id)| id).filter(|id| matches(id));
                if order.descending {
                    iter.rev().collect()
                } else {
                    iter.collect()
                }
            }
        };

        Ok(ids
            .into_iter()
            .map(|id| table_data.rows[id].bytes.clone())
            .collect())
    }

    /// Query rows decoded into their typed form.
    pub fn query<R: Row>(
        &self,
        table: &str,
        filter: Option<Where<'_>>,
        order: Option<&Order>,
    ) -> Result<Vec<R>, StoreError> {
        self.query_raw(table, filter, order)?
            .iter()
            .map(|bytes| decode_row(bytes))
            .collect()
    }

    /// First matching row, if any.
    pub fn query_one<R: Row>(
        &self,
        table: &str,
        filter: Option<Where<'_>>,
    ) -> Result<Option<R>, StoreError> {
        let rows = self.query_raw(table, filter, None)?;
        match rows.first() {
            Some(bytes) => Ok(Some(decode_row(bytes)?)),
            None => Ok(None),
        }
    }
}

fn decode_row<R: Row>(bytes: &[u8]) -> Result<R, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

fn encode_row<R: Row>(row: &R) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(row).map_err(|e| StoreError::Codec(e.to_string()))
}

/// An immutable read lease on a committed snapshot. Must be released back to
/// the [`Db`] exactly once.
#[derive(Clone, Debug)]
pub struct Snapshot {
    id: SnapshotId,
    data: Arc<Tables>,
}

impl Snapshot {
    pub fn id(&self) -> SnapshotId {
        self.id
    }

    /// Deep-copy into a mutable working copy.
    pub fn fork_mut(&self) -> WorkingCopy {
        WorkingCopy {
            data: (*self.data).clone(),
        }
    }
}

impl Deref for Snapshot {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        &self.data
    }
}

/// A mutable working copy of the table state, owned by a single writer.
#[derive(Clone, Debug, Default)]
pub struct WorkingCopy {
    data: Tables,
}

impl Deref for WorkingCopy {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        &self.data
    }
}

impl DerefMut for WorkingCopy {
    fn deref_mut(&mut self) -> &mut Tables {
        &mut self.data
    }
}

impl WorkingCopy {
    pub fn new() -> Self {
        WorkingCopy::default()
    }

    /// Cheap sub-snapshot of the current working state, for rollback.
    pub fn fork(&self) -> WorkingCopy {
        self.clone()
    }

    /// Discard the current state in favor of a previously forked copy.
    pub fn reset_to(&mut self, other: WorkingCopy) {
        self.data = other.data;
    }

    /// Create an empty table. System tables are created once at genesis;
    /// an existing name is an error.
    pub fn create_table(&mut self, name: &str) -> Result<(), StoreError> {
        if self.data.tables.contains_key(name) {
            return Err(StoreError::TableExists(name.to_string()));
        }
        self.data.used_memory += name.len() as u64;
        self.data.tables.insert(name.to_string(), Table::default());
        Ok(())
    }

    /// Declare a secondary index on a u64 field. Only allowed while the
    /// table is empty (a schema step, not a rebuild).
    pub fn create_index(&mut self, table: &str, field: &str) -> Result<(), StoreError> {
        let table_data = self
            .data
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::NoTable(table.to_string()))?;
        if !table_data.rows.is_empty() {
            return Err(StoreError::NonEmptyTable(table.to_string()));
        }
        table_data.indexes.insert(field.to_string(), BTreeMap::new());
        Ok(())
    }

    /// Upsert a typed row, maintaining every declared index.
    pub fn insert<R: Row>(&mut self, table: &str, row: &R) -> Result<(), StoreError> {
        let id = row.id();
        let bytes = encode_row(row)?;
        let declared: Vec<String> = self
            .data
            .tables
            .get(table)
            .ok_or_else(|| StoreError::NoTable(table.to_string()))?
            .indexes
            .keys()
            .cloned()
            .collect();
        let mut index_values = Vec::new();
        for field in declared {
            let value = row.index_value(&field).ok_or_else(|| {
                StoreError::Codec(format!("row misses indexed field {field}"))
            })?;
            index_values.push((field, value));
        }
        self.insert_encoded(table, &id, &bytes, &index_values)
    }

    /// Upsert a pre-encoded row with explicit index values (the database
    /// precompile path, where rows are schema-driven records).
    pub fn insert_encoded(
        &mut self,
        table: &str,
        id: &[u8],
        bytes: &[u8],
        index_values: &[(String, u64)],
    ) -> Result<(), StoreError> {
        let table_data = self
            .data
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::NoTable(table.to_string()))?;
        for (field, _) in index_values {
            if !table_data.indexes.contains_key(field) {
                return Err(StoreError::NotIndexed(field.clone()));
            }
        }
        let id = id.to_vec();
        let bytes = bytes.to_vec();
        let index_values = index_values.to_vec();

        let new_size = (id.len() + bytes.len()) as u64;
        if let Some(old) = table_data.rows.insert(
            id.clone(),
            StoredRow {
                bytes,
                index_values: index_values.clone(),
            },
        ) {
            for (field, value) in &old.index_values {
                if let Some(index) = table_data.indexes.get_mut(field) {
                    index.remove(&(*value, id.clone()));
                }
            }
            self.data.used_memory = self
                .data
                .used_memory
                .saturating_sub((id.len() + old.bytes.len()) as u64);
        }
        for (field, value) in index_values {
            if let Some(index) = table_data.indexes.get_mut(&field) {
                index.insert((value, id.clone()), ());
            }
        }
        self.data.used_memory += new_size;
        Ok(())
    }

    /// Delete a row by primary id. A missing row is [`StoreError::NoEntry`].
    pub fn delete(&mut self, table: &str, id: &[u8]) -> Result<(), StoreError> {
        let table_data = self
            .data
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::NoTable(table.to_string()))?;
        let old = table_data.rows.remove(id).ok_or(StoreError::NoEntry)?;
        for (field, value) in &old.index_values {
            if let Some(index) = table_data.indexes.get_mut(field) {
                index.remove(&(*value, id.to_vec()));
            }
        }
        self.data.used_memory = self
            .data
            .used_memory
            .saturating_sub((id.len() + old.bytes.len()) as u64);
        Ok(())
    }

    /// Raw scalar write.
    pub fn insert_raw(&mut self, key: &[u8], value: &[u8]) {
        let new_size = (key.len() + value.len()) as u64;
        if let Some(old) = self.data.scalars.insert(key.to_vec(), value.to_vec()) {
            self.data.used_memory = self
                .data
                .used_memory
                .saturating_sub((key.len() + old.len()) as u64);
        }
        self.data.used_memory += new_size;
    }
}

#[derive(Default)]
struct Registry {
    snapshots: HashMap<SnapshotId, Arc<Tables>>,
    leases: HashMap<SnapshotId, usize>,
    next_id: SnapshotId,
}

/// The snapshot registry. Committed states are immutable and addressed by
/// id; readers take leases that must be released exactly once.
#[derive(Clone, Default)]
pub struct Db {
    inner: Arc<Mutex<Registry>>,
}

impl Db {
    pub fn new() -> Self {
        Db::default()
    }

    /// Commit a working copy, returning the id of the new immutable
    /// snapshot.
    pub fn commit(&self, working: &WorkingCopy) -> SnapshotId {
        let mut registry = self.inner.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.snapshots.insert(id, Arc::new(working.data.clone()));
        id
    }

    /// Take a read lease on a committed snapshot.
    pub fn snapshot(&self, id: SnapshotId) -> Result<Snapshot, StoreError> {
        let mut registry = self.inner.lock();
        let data = registry
            .snapshots
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownSnapshot(id))?;
        *registry.leases.entry(id).or_insert(0) += 1;
        Ok(Snapshot { id, data })
    }

    /// Release a read lease. Releasing more often than acquired is an error.
    pub fn release(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut registry = self.inner.lock();
        match registry.leases.get_mut(&snapshot.id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    registry.leases.remove(&snapshot.id);
                }
                Ok(())
            }
            _ => Err(StoreError::AlreadyReleased(snapshot.id)),
        }
    }

    /// Number of outstanding read leases, across all snapshots.
    pub fn active_leases(&self) -> usize {
        self.inner.lock().leases.values().sum()
    }
}
