//! The embedded database contract.
//!
//! Exposes the ordered table store to contracts at the fixed address
//! `0x…0102`. Tables are namespaced per calling contract, so user tables can
//! never collide with the system tables. A table's row layout is an ABI
//! schema stored alongside it; rows travel as ABI-packed records prefixed
//! with a 32-byte length word. `select` materializes a result set behind an
//! opaque 32-byte handle that `next` drains.

use std::collections::{HashMap, VecDeque};

use serde::Deserialize;

use super::abi::{self, AbiType, Method, Value};
use super::{
    contract_abi_id, contract_abi_table, gas, system, table_name, CallContext, ContractAbi,
    ContractError, Precompile,
};
use crate::store::{self, Tables, Where};
use crate::{constants, Address};

/// Static method table of the database contract.
pub const METHODS: &[Method] = &[
    Method {
        name: "createTable",
        inputs: &[AbiType::Str, AbiType::Str, AbiType::Str],
        outputs: &[AbiType::Bool],
    },
    Method {
        name: "insertObj",
        inputs: &[AbiType::Str, AbiType::Bytes],
        outputs: &[AbiType::Bool],
    },
    Method {
        name: "deleteObj",
        inputs: &[AbiType::Str, AbiType::Bytes],
        outputs: &[AbiType::Bool],
    },
    Method {
        name: "get",
        inputs: &[AbiType::Str, AbiType::Str, AbiType::Str],
        outputs: &[AbiType::Bytes],
    },
    Method {
        name: "select",
        inputs: &[AbiType::Str, AbiType::Str, AbiType::Str],
        outputs: &[AbiType::Bytes32],
    },
    Method {
        name: "next",
        inputs: &[AbiType::Bytes32],
        outputs: &[AbiType::Bytes],
    },
];

/// Canonical ABI of the database contract.
pub const DB_CONTRACT_ABI: &str = r#"[
{"type":"function","name":"createTable","inputs":[{"name":"tableName","type":"string"},{"name":"indexes","type":"string"},{"name":"abi","type":"string"}],"outputs":[{"type":"bool"}]},
{"type":"function","name":"insertObj","inputs":[{"name":"tableName","type":"string"},{"name":"data","type":"bytes"}],"outputs":[{"type":"bool"}]},
{"type":"function","name":"deleteObj","inputs":[{"name":"tableName","type":"string"},{"name":"id","type":"bytes"}],"outputs":[{"type":"bool"}]},
{"type":"function","name":"get","inputs":[{"name":"tableName","type":"string"},{"name":"whereClause","type":"string"},{"name":"orderClause","type":"string"}],"outputs":[{"type":"bytes"}]},
{"type":"function","name":"select","inputs":[{"name":"tableName","type":"string"},{"name":"whereClause","type":"string"},{"name":"orderClause","type":"string"}],"outputs":[{"type":"bytes32"}]},
{"type":"function","name":"next","inputs":[{"type":"bytes32"}],"outputs":[{"type":"bytes"}]}
]"#;

/// Result sets handed out by `select`, keyed by handle.
#[derive(Default)]
pub struct IteratorRegistry {
    iterators: HashMap<u64, VecDeque<Vec<u8>>>,
    next_handle: u64,
}

impl IteratorRegistry {
    pub fn register(&mut self, rows: Vec<Vec<u8>>) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.iterators.insert(handle, rows.into());
        handle
    }

    pub fn advance(&mut self, handle: u64) -> Result<Option<Vec<u8>>, ContractError> {
        let rows = self
            .iterators
            .get_mut(&handle)
            .ok_or(ContractError::Malformed)?;
        Ok(rows.pop_front())
    }
}

/// A table's column layout, parsed from its stored ABI schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<(String, AbiType)>,
}

impl TableSchema {
    fn column_types(&self) -> Vec<AbiType> {
        self.columns.iter().map(|(_, ty)| *ty).collect()
    }

    fn id_type(&self) -> Result<AbiType, ContractError> {
        self.columns
            .iter()
            .find(|(name, _)| name == "Id")
            .map(|(_, ty)| *ty)
            .ok_or_else(|| ContractError::Generic("table schema misses Id column".into()))
    }
}

#[derive(Deserialize)]
struct AbiEntry {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    inputs: Vec<AbiField>,
}

#[derive(Deserialize)]
struct AbiField {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

/// Parse a table schema out of an ABI JSON document.
pub fn parse_table_schema(abi_json: &str, table: &str) -> Result<TableSchema, ContractError> {
    let entries: Vec<AbiEntry> =
        serde_json::from_str(abi_json).map_err(|_| ContractError::Malformed)?;
    let entry = entries
        .into_iter()
        .find(|entry| entry.kind == "table" && entry.name == table)
        .ok_or(ContractError::AbiNotFound)?;
    let columns = entry
        .inputs
        .into_iter()
        .map(|field| Ok((field.name, AbiType::parse(&field.ty)?)))
        .collect::<Result<Vec<_>, ContractError>>()?;
    Ok(TableSchema {
        name: entry.name,
        columns,
    })
}

/// Schema of `name` under `contract`'s namespace. The system contract's
/// tables use the built-in schema document.
pub fn schema_for_table(
    tables: &Tables,
    contract: Address,
    name: &str,
) -> Result<TableSchema, ContractError> {
    if contract == constants::SYSTEM_CONTRACT {
        return parse_table_schema(system::SYSTEM_TABLES_ABI, name);
    }
    let id = contract_abi_id(contract, "table", name);
    let stored: ContractAbi = tables
        .query_one(&contract_abi_table(), Some(Where::IdEq(&id)))?
        .ok_or(ContractError::AbiNotFound)?;
    parse_table_schema(&stored.abi, name)
}

/// Raw primary-key bytes of an id value.
fn id_bytes(value: &Value) -> Result<Vec<u8>, ContractError> {
    match value {
        Value::Address(address) => Ok(address.as_bytes().to_vec()),
        Value::FixedBytes(bytes) | Value::Bytes(bytes) => Ok(bytes.clone()),
        Value::Str(text) => Ok(text.as_bytes().to_vec()),
        Value::Uint64(v) => Ok(v.to_be_bytes().to_vec()),
        _ => Err(ContractError::Malformed),
    }
}

/// A record's id column value and raw key bytes.
fn record_id(schema: &TableSchema, values: &[Value]) -> Result<Vec<u8>, ContractError> {
    let position = schema
        .columns
        .iter()
        .position(|(name, _)| name == "Id")
        .ok_or_else(|| ContractError::Generic("table schema misses Id column".into()))?;
    id_bytes(&values[position])
}

/// Pack a stored row into its ABI record form. System tables are stored as
/// typed rows and need conversion; user tables are stored packed already.
fn packed_row(
    contract: Address,
    schema: &TableSchema,
    stored: &[u8],
) -> Result<Vec<u8>, ContractError> {
    if contract != constants::SYSTEM_CONTRACT {
        return Ok(stored.to_vec());
    }
    let values = system_row_values(&schema.name, stored)?;
    Ok(abi::encode_values(&schema.column_types(), &values)?)
}

fn system_row_values(table: &str, stored: &[u8]) -> Result<Vec<Value>, ContractError> {
    let codec = |e: bincode::Error| ContractError::Generic(e.to_string());
    match table {
        "Witnesses" => {
            let row: super::Witness = bincode::deserialize(stored).map_err(codec)?;
            Ok(vec![
                Value::Address(row.id),
                Value::Uint64(row.stake),
                Value::Uint64(row.flags),
            ])
        }
        "Staked" => {
            let row: super::Staked = bincode::deserialize(stored).map_err(codec)?;
            Ok(vec![Value::Address(row.id), Value::Uint64(row.amount)])
        }
        "Claimable" => {
            let row: super::Claimable = bincode::deserialize(stored).map_err(codec)?;
            Ok(vec![
                Value::FixedBytes(row.id),
                Value::Uint64(row.amount),
                Value::Uint64(row.timestamp),
            ])
        }
        "Delegations" => {
            let row: super::Delegation = bincode::deserialize(stored).map_err(codec)?;
            Ok(vec![Value::FixedBytes(row.id)])
        }
        "ContractAbi" => {
            let row: super::ContractAbi = bincode::deserialize(stored).map_err(codec)?;
            Ok(vec![Value::Bytes(row.id), Value::Str(row.abi)])
        }
        other => Err(ContractError::Generic(format!(
            "unknown system table {other}"
        ))),
    }
}

/// Prefix data with a 32-byte big-endian length word, the contract-facing
/// byte-string envelope.
fn prepend_byte_size(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 32];
    out[28..].copy_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// The database precompile.
pub struct DbContract;

impl Precompile for DbContract {
    fn required_gas(&self, input: &[u8]) -> u64 {
        let Ok((method, _)) = abi::method_by_selector(METHODS, input) else {
            return gas::DB_BASE;
        };
        match method.name {
            "createTable" => gas::DB_CREATE_TABLE,
            "insertObj" => gas::DB_INSERT_OBJ,
            "deleteObj" => gas::DB_DELETE_OBJ,
            "get" => gas::DB_GET,
            "select" => gas::DB_SELECT,
            "next" => gas::DB_NEXT,
            _ => gas::DB_BASE,
        }
    }

    fn run(&self, ctx: &mut CallContext<'_>, input: &[u8]) -> Result<Vec<u8>, ContractError> {
        let (method, args) = abi::method_by_selector(METHODS, input)
            .map_err(|_| ContractError::Generic("db contract selector".into()))?;
        let values = method
            .decode_inputs(args)
            .map_err(|_| ContractError::Malformed)?;

        match method.name {
            "createTable" => create_table(
                ctx,
                values[0].as_str()?,
                values[1].as_str()?,
                values[2].as_str()?,
            ),
            "insertObj" => insert_obj(ctx, values[0].as_str()?, values[1].as_byte_slice()?),
            "deleteObj" => delete_obj(ctx, values[0].as_str()?, values[1].as_byte_slice()?),
            "get" => get(
                ctx,
                values[0].as_str()?,
                values[1].as_str()?,
                values[2].as_str()?,
            ),
            "select" => select(
                ctx,
                values[0].as_str()?,
                values[1].as_str()?,
                values[2].as_str()?,
            ),
            "next" => next(ctx, values[0].as_byte_slice()?),
            _ => Err(ContractError::Generic("unhandled db method".into())),
        }
    }
}

fn bool_word(value: bool) -> Vec<u8> {
    let mut out = vec![0u8; 32];
    out[31] = value as u8;
    out
}

fn create_table(
    ctx: &mut CallContext<'_>,
    name: &str,
    indexes: &str,
    abi_json: &str,
) -> Result<Vec<u8>, ContractError> {
    if name.is_empty() {
        return Err(ContractError::Malformed);
    }
    if abi_json.is_empty() {
        return Err(ContractError::Malformed);
    }
    let schema = parse_table_schema(abi_json, name).map_err(|_| ContractError::Malformed)?;
    schema.id_type()?;

    let abi_row_id = contract_abi_id(ctx.caller, "table", name);
    let existing: Option<ContractAbi> = ctx
        .store
        .query_one(&contract_abi_table(), Some(Where::IdEq(&abi_row_id)))?;
    if existing.is_some() {
        return Err(ContractError::Generic(format!("table {name} exists")));
    }

    let namespaced = table_name(ctx.caller, name);
    ctx.store.create_table(&namespaced)?;

    if !indexes.is_empty() {
        for index in indexes.split(',') {
            let column = schema
                .columns
                .iter()
                .find(|(column, _)| column == index)
                .ok_or(ContractError::Malformed)?;
            if column.1 != AbiType::Uint64 {
                return Err(ContractError::Malformed);
            }
            ctx.store.create_index(&namespaced, index)?;
        }
    }

    ctx.store.insert(
        &contract_abi_table(),
        &ContractAbi {
            id: abi_row_id,
            abi: abi_json.to_string(),
        },
    )?;

    Ok(bool_word(true))
}

fn insert_obj(
    ctx: &mut CallContext<'_>,
    name: &str,
    data: &[u8],
) -> Result<Vec<u8>, ContractError> {
    if name.is_empty() {
        return Err(ContractError::Malformed);
    }
    let schema = schema_for_table(ctx.store, ctx.caller, name)?;
    let values = abi::decode_values(&schema.column_types(), data)?;
    let id = record_id(&schema, &values)?;

    let namespaced = table_name(ctx.caller, name);
    let mut index_values = Vec::new();
    for field in ctx.store.table_indexes(&namespaced)? {
        let position = schema
            .columns
            .iter()
            .position(|(column, _)| *column == field)
            .ok_or_else(|| ContractError::Generic("indexed column missing".into()))?;
        index_values.push((field, values[position].as_u64()?));
    }

    let packed = abi::encode_values(&schema.column_types(), &values)?;
    match ctx
        .store
        .insert_encoded(&namespaced, &id, &packed, &index_values)
    {
        Ok(()) => Ok(bool_word(true)),
        Err(_) => Ok(bool_word(false)),
    }
}

fn delete_obj(
    ctx: &mut CallContext<'_>,
    name: &str,
    id_data: &[u8],
) -> Result<Vec<u8>, ContractError> {
    if name.is_empty() {
        return Err(ContractError::Malformed);
    }
    let schema = schema_for_table(ctx.store, ctx.caller, name)?;
    let id_values = abi::decode_values(&[schema.id_type()?], id_data)?;
    let id = id_bytes(&id_values[0])?;

    let namespaced = table_name(ctx.caller, name);
    match ctx.store.delete(&namespaced, &id) {
        Ok(()) => Ok(bool_word(true)),
        Err(_) => Ok(bool_word(false)),
    }
}

fn query_packed(
    ctx: &CallContext<'_>,
    name: &str,
    where_clause: &str,
    order_clause: &str,
) -> Result<Vec<Vec<u8>>, ContractError> {
    if name.is_empty() {
        return Err(ContractError::Malformed);
    }
    let schema = schema_for_table(ctx.store, ctx.caller, name)?;
    let filter = store::parse_where_clause(where_clause.as_bytes())?;
    let order = store::parse_order_clause(order_clause.as_bytes())?;

    let namespaced = table_name(ctx.caller, name);
    let rows = ctx.store.query_raw(
        &namespaced,
        filter.as_ref().map(|w| w.as_where()),
        order.as_ref(),
    )?;
    rows.iter()
        .map(|stored| packed_row(ctx.caller, &schema, stored))
        .collect()
}

fn get(
    ctx: &mut CallContext<'_>,
    name: &str,
    where_clause: &str,
    order_clause: &str,
) -> Result<Vec<u8>, ContractError> {
    let rows = query_packed(ctx, name, where_clause, order_clause)?;
    let first = rows.into_iter().next().ok_or(ContractError::NoEntryFound)?;
    Ok(prepend_byte_size(&first))
}

fn select(
    ctx: &mut CallContext<'_>,
    name: &str,
    where_clause: &str,
    order_clause: &str,
) -> Result<Vec<u8>, ContractError> {
    let rows = query_packed(ctx, name, where_clause, order_clause)?;
    let handle = ctx.iterators.register(rows);
    let mut out = vec![0u8; 32];
    out[..8].copy_from_slice(&handle.to_be_bytes());
    Ok(out)
}

fn next(ctx: &mut CallContext<'_>, handle_bytes: &[u8]) -> Result<Vec<u8>, ContractError> {
    if handle_bytes.len() < 8 {
        return Err(ContractError::Malformed);
    }
    let handle = u64::from_be_bytes(
        handle_bytes[..8]
            .try_into()
            .map_err(|_| ContractError::Malformed)?,
    );
    match ctx.iterators.advance(handle)? {
        Some(row) => Ok(prepend_byte_size(&row)),
        // exhausted iterators answer with an empty byte string, not an error
        None => Ok(prepend_byte_size(&[])),
    }
}
