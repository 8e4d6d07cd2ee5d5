//! Built-in system contracts.
//!
//! Two precompiled contracts live at fixed addresses: the staking/voting
//! contract ([`system`]) and the embedded database contract ([`db`]). Both
//! decode their call data with the [`abi`] codec and operate on the MVCC
//! table store. Gas is a flat per-method cost plus a surcharge proportional
//! to the growth of the store footprint, the only size-dependent term.

pub mod abi;
pub mod db;
pub mod system;

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::state::StateDb;
use crate::store::{Row, StoreError, Tables, WorkingCopy};
use crate::{constants, Address};

/// Flat method costs and the store-growth surcharge rate.
pub mod gas {
    pub const SYSTEM_BASE: u64 = 3_000;
    pub const STAKE: u64 = 10_000;
    pub const GET_STAKED: u64 = 3_000;
    pub const UNSTAKE: u64 = 10_000;
    pub const CLAIM: u64 = 5_000;
    /// Charged per voted address.
    pub const VOTE: u64 = 8_000;
    pub const UNVOTE: u64 = 8_000;
    pub const ELECT_ENABLE: u64 = 5_000;
    pub const STORE_ABI: u64 = 20_000;
    pub const GET_ABI: u64 = 3_000;

    pub const DB_BASE: u64 = 3_000;
    pub const DB_CREATE_TABLE: u64 = 50_000;
    pub const DB_INSERT_OBJ: u64 = 20_000;
    pub const DB_DELETE_OBJ: u64 = 10_000;
    pub const DB_GET: u64 = 5_000;
    pub const DB_SELECT: u64 = 5_000;
    pub const DB_NEXT: u64 = 3_000;

    /// Gas per byte of store memory growth.
    pub const MEMORY_PER_BYTE: u64 = 100;
}

/// System contract failure taxonomy.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("transaction input malformed")]
    Malformed,
    #[error("not enough balance for staking")]
    NotEnoughBalance,
    #[error("not enough staked tokens for amount requested")]
    NotEnoughStaked,
    #[error("too many claimable entries")]
    TooManyClaimable,
    #[error("a voted address is not a witness")]
    NotAWitness,
    #[error("contract abi not found")]
    AbiNotFound,
    #[error("contract abi exists")]
    AbiAlreadyExists,
    #[error("malformed where/order expression")]
    BadQuery,
    #[error("no entry found in db")]
    NoEntryFound,
    #[error("out of gas")]
    OutOfGas,
    #[error("system contract error: {0}")]
    Generic(String),
}

impl From<StoreError> for ContractError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BadQuery => ContractError::BadQuery,
            other => ContractError::Generic(other.to_string()),
        }
    }
}

impl From<abi::AbiError> for ContractError {
    fn from(_: abi::AbiError) -> Self {
        ContractError::Malformed
    }
}

/// The witness elect-enabled flag (bit 0).
pub const ELECT_ENABLED_FLAG: u64 = 1;

/// Namespaced table name for a contract-owned table.
pub fn table_name(contract: Address, name: &str) -> String {
    format!("{}:{}", hex::encode(contract.as_bytes()), name)
}

pub fn witnesses_table() -> String {
    table_name(constants::SYSTEM_CONTRACT, "Witnesses")
}

pub fn staked_table() -> String {
    table_name(constants::SYSTEM_CONTRACT, "Staked")
}

pub fn claimable_table() -> String {
    table_name(constants::SYSTEM_CONTRACT, "Claimable")
}

pub fn delegations_table() -> String {
    table_name(constants::SYSTEM_CONTRACT, "Delegations")
}

pub fn contract_abi_table() -> String {
    table_name(constants::SYSTEM_CONTRACT, "ContractAbi")
}

/// A witness: an account eligible (when elect-enabled) for block production,
/// weighted by the stake delegated to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub id: Address,
    pub stake: u64,
    pub flags: u64,
}

impl Witness {
    pub fn elect_enabled(&self) -> bool {
        self.flags & ELECT_ENABLED_FLAG != 0
    }
}

impl Row for Witness {
    fn id(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }

    fn index_value(&self, field: &str) -> Option<u64> {
        (field == "Stake").then_some(self.stake)
    }
}

/// An owner's total staked amount, in 4-decimal staking units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staked {
    pub id: Address,
    pub amount: u64,
}

impl Row for Staked {
    fn id(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }
}

/// An unstaked amount vesting until `timestamp`. The composite id is
/// `owner ∥ le_u64(timestamp)` (28 bytes).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claimable {
    pub id: Vec<u8>,
    pub amount: u64,
    pub timestamp: u64,
}

/// Composite claimable id for `owner` unlocking at `timestamp`.
pub fn claimable_id(owner: Address, timestamp: u64) -> Vec<u8> {
    let mut id = Vec::with_capacity(Address::LENGTH + 8);
    id.extend_from_slice(owner.as_bytes());
    id.extend_from_slice(&timestamp.to_le_bytes());
    id
}

impl Row for Claimable {
    fn id(&self) -> Vec<u8> {
        self.id.clone()
    }
}

/// A delegation edge `owner → witness`; its existence contributes the
/// owner's staked amount to the witness. The 40-byte id is both addresses
/// concatenated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: Vec<u8>,
}

pub fn delegation_id(owner: Address, witness: Address) -> Vec<u8> {
    let mut id = Vec::with_capacity(Address::LENGTH * 2);
    id.extend_from_slice(owner.as_bytes());
    id.extend_from_slice(witness.as_bytes());
    id
}

impl Delegation {
    pub fn new(owner: Address, witness: Address) -> Self {
        Delegation {
            id: delegation_id(owner, witness),
        }
    }

    /// The `(owner, witness)` pair encoded in the id.
    pub fn parts(&self) -> (Address, Address) {
        (
            Address::from_slice(&self.id[..Address::LENGTH]),
            Address::from_slice(&self.id[Address::LENGTH..]),
        )
    }
}

impl Row for Delegation {
    fn id(&self) -> Vec<u8> {
        self.id.clone()
    }
}

/// A stored contract ABI, keyed `address ∥ kind ∥ name`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAbi {
    pub id: Vec<u8>,
    pub abi: String,
}

pub fn contract_abi_id(address: Address, kind: &str, name: &str) -> Vec<u8> {
    let kind = if kind.is_empty() { "abi" } else { kind };
    let mut id = Vec::with_capacity(Address::LENGTH + kind.len() + name.len());
    id.extend_from_slice(address.as_bytes());
    id.extend_from_slice(kind.as_bytes());
    id.extend_from_slice(name.as_bytes());
    id
}

impl Row for ContractAbi {
    fn id(&self) -> Vec<u8> {
        self.id.clone()
    }
}

/// Execution context handed to a precompile call.
pub struct CallContext<'a> {
    pub caller: Address,
    pub value: U256,
    /// Gas available to the call.
    pub gas: u64,
    /// Block timestamp the call executes under.
    pub time: u64,
    pub state: &'a mut StateDb,
    pub store: &'a mut WorkingCopy,
    pub iterators: &'a mut db::IteratorRegistry,
}

/// A precompiled contract: a flat gas estimate over the raw input and the
/// execution itself.
pub trait Precompile {
    fn required_gas(&self, input: &[u8]) -> u64;
    fn run(&self, ctx: &mut CallContext<'_>, input: &[u8]) -> Result<Vec<u8>, ContractError>;
}

/// Look up the precompile at `address`.
pub fn precompile_for(address: Address) -> Option<&'static dyn Precompile> {
    if address == constants::SYSTEM_CONTRACT {
        Some(&system::SystemContract)
    } else if address == constants::DB_CONTRACT {
        Some(&db::DbContract)
    } else {
        None
    }
}

/// Run a precompile, charging the flat method gas up front and the store
/// memory surcharge afterwards. Returns the output and total gas used.
pub fn run_precompile(
    precompile: &dyn Precompile,
    ctx: &mut CallContext<'_>,
    input: &[u8],
) -> Result<(Vec<u8>, u64), ContractError> {
    let memory_before = ctx.store.used_memory();

    let minimum_gas = precompile.required_gas(input);
    if ctx.gas < minimum_gas {
        return Err(ContractError::OutOfGas);
    }
    let output = precompile.run(ctx, input)?;

    let memory_after = ctx.store.used_memory();
    let grown = memory_after.saturating_sub(memory_before);
    let total_gas = minimum_gas + grown * gas::MEMORY_PER_BYTE;
    if total_gas > ctx.gas {
        return Err(ContractError::OutOfGas);
    }

    Ok((output, total_gas))
}

/// Read the sender's virtual capacity: their share of the system-wide stake,
/// floored by epsilon so zero-stake accounts keep a positive capacity.
pub fn virtual_capacity(from: Address, tables: &Tables) -> f64 {
    use crate::store::Where;

    let account_staked = tables
        .query_one::<Staked>(&staked_table(), Some(Where::IdPrefix(from.as_bytes())))
        .ok()
        .flatten()
        .map(|staked| staked.amount)
        .unwrap_or(0);

    let system_staked = read_system_stake(tables);

    (constants::EPSILON_STAKE + account_staked as f64)
        / (constants::EPSILON_STAKE + system_staked as f64)
}

/// The global staked-amount scalar (big-endian u64 at a well-known key).
pub fn read_system_stake(tables: &Tables) -> u64 {
    tables
        .get_raw(constants::SYSTEM_STAKE_KEY)
        .and_then(|bytes| bytes.try_into().ok().map(u64::from_be_bytes))
        .unwrap_or(0)
}

pub(crate) fn write_system_stake(store: &mut WorkingCopy, value: u64) {
    store.insert_raw(constants::SYSTEM_STAKE_KEY, &value.to_be_bytes());
}
