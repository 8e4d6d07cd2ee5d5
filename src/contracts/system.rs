//! The staking/voting system contract.
//!
//! Lives at the fixed address `0x…0101` and owns the Witnesses, Staked,
//! Claimable, Delegations and ContractAbi tables. Stake amounts are in
//! 4-decimal staking units; one unit moves `10^14` wei between the caller
//! and the contract address.
//!
//! Mutating methods run against the caller-provided working copy; `stake`
//! forks the store on entry and resets to the fork when the balance test
//! fails, so no claimable mutation leaks out of a refused call.

use primitive_types::U256;

use super::abi::{self, AbiType, Method, Value};
use super::{
    claimable_id, claimable_table, contract_abi_id, contract_abi_table, delegations_table,
    gas, read_system_stake, staked_table, witnesses_table, write_system_stake, CallContext,
    Claimable, ContractAbi, ContractError, Delegation, Precompile, Staked, Witness,
    ELECT_ENABLED_FLAG,
};
use crate::store::{Order, Where, WorkingCopy};
use crate::{constants, Address};

/// Static method table; selectors derive from these signatures.
pub const METHODS: &[Method] = &[
    Method {
        name: "stake",
        inputs: &[AbiType::Uint64],
        outputs: &[],
    },
    Method {
        name: "getStaked",
        inputs: &[],
        outputs: &[AbiType::Uint64],
    },
    Method {
        name: "unstake",
        inputs: &[AbiType::Uint64],
        outputs: &[],
    },
    Method {
        name: "claim",
        inputs: &[],
        outputs: &[],
    },
    Method {
        name: "vote",
        inputs: &[AbiType::AddressArray],
        outputs: &[],
    },
    Method {
        name: "unvote",
        inputs: &[],
        outputs: &[],
    },
    Method {
        name: "electEnable",
        inputs: &[AbiType::Bool],
        outputs: &[],
    },
    Method {
        name: "storeAbiForAddress",
        inputs: &[AbiType::Address, AbiType::Str],
        outputs: &[],
    },
    Method {
        name: "getAbiForAddress",
        inputs: &[AbiType::Address],
        outputs: &[AbiType::Str],
    },
];

/// Canonical ABI of the system contract, returned by `getAbiForAddress`.
pub const SYSTEM_CONTRACT_ABI: &str = r#"[
{"type":"function","name":"stake","inputs":[{"name":"amount","type":"uint64"}],"outputs":[]},
{"type":"function","name":"getStaked","inputs":[],"outputs":[{"name":"staked","type":"uint64"}]},
{"type":"function","name":"unstake","inputs":[{"name":"amount","type":"uint64"}],"outputs":[]},
{"type":"function","name":"claim","inputs":[],"outputs":[]},
{"type":"function","name":"vote","inputs":[{"name":"addresses","type":"address[]"}],"outputs":[]},
{"type":"function","name":"unvote","inputs":[],"outputs":[]},
{"type":"function","name":"electEnable","inputs":[{"name":"enable","type":"bool"}],"outputs":[]},
{"type":"function","name":"storeAbiForAddress","inputs":[{"name":"address","type":"address"},{"name":"abi","type":"string"}],"outputs":[]},
{"type":"function","name":"getAbiForAddress","inputs":[{"name":"address","type":"address"}],"outputs":[{"type":"string"}]}
]"#;

/// Schemas of the system-owned tables, used by the database contract when
/// packing rows for contract consumption.
pub const SYSTEM_TABLES_ABI: &str = r#"[
{"type":"table","name":"Witnesses","inputs":[{"name":"Id","type":"address"},{"name":"Stake","type":"uint64"},{"name":"Flags","type":"uint64"}]},
{"type":"table","name":"Staked","inputs":[{"name":"Id","type":"address"},{"name":"Amount","type":"uint64"}]},
{"type":"table","name":"Claimable","inputs":[{"name":"Id","type":"bytes28"},{"name":"Amount","type":"uint64"},{"name":"Timestamp","type":"uint64"}]},
{"type":"table","name":"Delegations","inputs":[{"name":"Id","type":"bytes40"}]},
{"type":"table","name":"ContractAbi","inputs":[{"name":"Id","type":"bytes"},{"name":"Abi","type":"string"}]}
]"#;

/// One staking unit in wei: 10^(18-4).
pub fn precision_factor() -> U256 {
    U256::from(10u64).pow(U256::from(18 - constants::VALUE_DECIMAL_POINTS))
}

/// Create the system tables at genesis. Any pre-existing table is a fatal
/// schema mismatch.
pub fn setup_genesis_tables(
    store: &mut WorkingCopy,
    genesis_witness: Address,
) -> Result<(), ContractError> {
    for table in [
        witnesses_table(),
        staked_table(),
        claimable_table(),
        delegations_table(),
        contract_abi_table(),
    ] {
        if store.has_table(&table) {
            return Err(ContractError::Generic(format!(
                "system table {table} existed in genesis"
            )));
        }
    }

    store.create_table(&witnesses_table())?;
    store.create_index(&witnesses_table(), "Stake")?;
    store.insert(
        &witnesses_table(),
        &Witness {
            id: genesis_witness,
            stake: 0,
            flags: ELECT_ENABLED_FLAG,
        },
    )?;

    store.create_table(&staked_table())?;
    store.create_table(&claimable_table())?;
    store.create_table(&delegations_table())?;
    store.create_table(&contract_abi_table())?;

    // occupy the precompile addresses with their own ABIs
    store_abi_at_address(store, constants::SYSTEM_CONTRACT, SYSTEM_CONTRACT_ABI)?;
    store_abi_at_address(store, constants::DB_CONTRACT, super::db::DB_CONTRACT_ABI)?;

    Ok(())
}

/// The system precompile.
pub struct SystemContract;

impl Precompile for SystemContract {
    fn required_gas(&self, input: &[u8]) -> u64 {
        let Ok((method, args)) = abi::method_by_selector(METHODS, input) else {
            return gas::SYSTEM_BASE;
        };
        match method.name {
            "stake" => gas::STAKE,
            "getStaked" => gas::GET_STAKED,
            "unstake" => gas::UNSTAKE,
            "claim" => gas::CLAIM,
            "vote" => match method.decode_inputs(args) {
                Ok(values) => match values[0].as_addresses() {
                    Ok(addresses) => gas::VOTE * addresses.len() as u64,
                    Err(_) => gas::SYSTEM_BASE,
                },
                Err(_) => gas::SYSTEM_BASE,
            },
            "unvote" => gas::UNVOTE,
            "electEnable" => gas::ELECT_ENABLE,
            "storeAbiForAddress" => gas::STORE_ABI,
            "getAbiForAddress" => gas::GET_ABI,
            _ => gas::SYSTEM_BASE,
        }
    }

    fn run(&self, ctx: &mut CallContext<'_>, input: &[u8]) -> Result<Vec<u8>, ContractError> {
        let (method, args) = abi::method_by_selector(METHODS, input)
            .map_err(|_| ContractError::Generic("system contract selector".into()))?;
        let values = method
            .decode_inputs(args)
            .map_err(|_| ContractError::Malformed)?;

        match method.name {
            "stake" => {
                let amount = values[0].as_u64()?;
                // absorb matured claimables into balance first
                claim(ctx)?;
                stake(ctx, amount)?;
                Ok(vec![])
            }
            "getStaked" => {
                let amount = get_staked(ctx);
                Ok(method.encode_outputs(&[Value::Uint64(amount)])?)
            }
            "unstake" => {
                unstake(ctx, values[0].as_u64()?)?;
                Ok(vec![])
            }
            "claim" => {
                claim(ctx)?;
                Ok(vec![])
            }
            "vote" => {
                vote(ctx, values[0].as_addresses()?)?;
                Ok(vec![])
            }
            "unvote" => {
                unvote(ctx)?;
                Ok(vec![])
            }
            "electEnable" => {
                elect_enable(ctx, values[0].as_bool()?)?;
                Ok(vec![])
            }
            "storeAbiForAddress" => {
                store_abi_at_address(
                    ctx.store,
                    values[0].as_address()?,
                    values[1].as_str()?,
                )?;
                Ok(vec![])
            }
            "getAbiForAddress" => {
                let stored = abi_at_address(ctx.store, values[0].as_address()?)?;
                Ok(method.encode_outputs(&[Value::Str(stored)])?)
            }
            _ => Err(ContractError::Generic("unhandled system method".into())),
        }
    }
}

fn find_staked(store: &WorkingCopy, owner: Address) -> Result<Option<Staked>, ContractError> {
    Ok(store.query_one(&staked_table(), Some(Where::IdPrefix(owner.as_bytes())))?)
}

fn find_witness(store: &WorkingCopy, address: Address) -> Result<Option<Witness>, ContractError> {
    Ok(store.query_one(&witnesses_table(), Some(Where::IdPrefix(address.as_bytes())))?)
}

/// Balance of `owner` in whole staking units.
fn balance_units(ctx: &CallContext<'_>, owner: Address) -> u64 {
    let units = ctx.state.balance(&owner) / precision_factor();
    if units > U256::from(u64::MAX) {
        u64::MAX
    } else {
        units.as_u64()
    }
}

/// `stake(amount)`: consume outstanding claimables as credit, transfer the
/// residual from the caller's balance, then re-establish delegations at the
/// new total.
fn stake(ctx: &mut CallContext<'_>, amount: u64) -> Result<(), ContractError> {
    if amount == 0 {
        tracing::trace!("can't stake zero amounts");
        return Err(ContractError::Malformed);
    }

    let checkpoint = ctx.store.fork();

    // walk not-yet-matured claimables newest-first, consuming them as credit
    let order = Order {
        field: "Id".into(),
        descending: true,
    };
    let claimables: Vec<Claimable> = ctx.store.query(
        &claimable_table(),
        Some(Where::IdPrefix(ctx.caller.as_bytes())),
        Some(&order),
    )?;

    let mut credited = 0u64;
    let mut consumed = Vec::new();
    for mut claimable in claimables {
        if amount - credited >= claimable.amount {
            credited += claimable.amount;
            consumed.push(claimable);
        } else {
            claimable.amount -= amount - credited;
            credited = amount;
            ctx.store.insert(&claimable_table(), &claimable)?;
        }
        if credited == amount {
            break;
        }
    }

    let to_transfer = amount - credited;
    if to_transfer > balance_units(ctx, ctx.caller) {
        tracing::trace!(caller = %ctx.caller, "account doesn't have sufficient balance");
        ctx.store.reset_to(checkpoint);
        return Err(ContractError::NotEnoughBalance);
    }
    for claimable in &consumed {
        ctx.store.delete(&claimable_table(), &claimable.id)?;
    }

    write_system_stake(ctx.store, read_system_stake(ctx.store) + amount);

    let staked = match find_staked(ctx.store, ctx.caller)? {
        Some(mut staked) => {
            let delegated = unvote_all(ctx.store, ctx.caller, staked.amount)?;
            staked.amount += amount;
            vote_for(ctx.store, ctx.caller, &delegated, staked.amount)?;
            staked
        }
        None => {
            let delegated = unvote_all(ctx.store, ctx.caller, 0)?;
            let staked = Staked {
                id: ctx.caller,
                amount,
            };
            vote_for(ctx.store, ctx.caller, &delegated, staked.amount)?;
            staked
        }
    };
    ctx.store.insert(&staked_table(), &staked)?;

    let wei = U256::from(to_transfer) * precision_factor();
    if !ctx.state.can_transfer(&ctx.caller, wei) {
        ctx.store.reset_to(checkpoint);
        return Err(ContractError::NotEnoughBalance);
    }
    ctx.state
        .transfer(ctx.caller, constants::SYSTEM_CONTRACT, wei)
        .map_err(|e| ContractError::Generic(e.to_string()))?;

    Ok(())
}

fn get_staked(ctx: &CallContext<'_>) -> u64 {
    find_staked(ctx.store, ctx.caller)
        .ok()
        .flatten()
        .map(|staked| staked.amount)
        .unwrap_or(0)
}

/// `unstake(amount)`: move stake into a vesting claimable and re-vote the
/// remainder.
fn unstake(ctx: &mut CallContext<'_>, amount: u64) -> Result<(), ContractError> {
    let timestamp = ctx.time + constants::UNSTAKE_VESTING_PERIOD;
    let new_id = claimable_id(ctx.caller, timestamp);

    let claimables: Vec<Claimable> = ctx.store.query(
        &claimable_table(),
        Some(Where::IdPrefix(ctx.caller.as_bytes())),
        None,
    )?;
    let mut count = 0usize;
    for claimable in &claimables {
        count += 1;
        if claimable.id == new_id {
            tracing::trace!("unstake refused: entry for same block exists");
            return Err(ContractError::Generic(
                "claimable entry for this block exists".into(),
            ));
        }
        if count >= constants::MAX_CLAIMABLE_ENTRIES {
            tracing::trace!(
                max = constants::MAX_CLAIMABLE_ENTRIES,
                "unstake refused: max claimable entries reached"
            );
            return Err(ContractError::TooManyClaimable);
        }
    }

    let mut staked = find_staked(ctx.store, ctx.caller)?
        .ok_or_else(|| ContractError::Generic("no staked entry".into()))?;

    let old_stake = staked.amount;
    let new_stake;
    if amount > staked.amount {
        return Err(ContractError::NotEnoughStaked);
    } else if amount == staked.amount {
        ctx.store
            .delete(&staked_table(), &staked.id.as_bytes().to_vec())?;
        new_stake = 0;
    } else {
        staked.amount -= amount;
        new_stake = staked.amount;
        ctx.store.insert(&staked_table(), &staked)?;
    }

    ctx.store.insert(
        &claimable_table(),
        &Claimable {
            id: new_id,
            amount,
            timestamp,
        },
    )?;

    let delegated = unvote_all(ctx.store, ctx.caller, old_stake)?;
    vote_for(ctx.store, ctx.caller, &delegated, new_stake)?;

    let system_stake = read_system_stake(ctx.store);
    if system_stake < amount {
        return Err(ContractError::Generic("system stake underflow".into()));
    }
    write_system_stake(ctx.store, system_stake - amount);

    Ok(())
}

/// `claim()`: delete matured claimables and pay them back out of the
/// contract balance. No matured entries is a silent success.
fn claim(ctx: &mut CallContext<'_>) -> Result<(), ContractError> {
    let claimables: Vec<Claimable> = ctx.store.query(
        &claimable_table(),
        Some(Where::IdPrefix(ctx.caller.as_bytes())),
        None,
    )?;

    let mut matured = 0u64;
    let mut consumed = Vec::new();
    for claimable in claimables {
        if claimable.timestamp <= ctx.time {
            matured += claimable.amount;
            consumed.push(claimable);
        }
    }
    for claimable in &consumed {
        ctx.store.delete(&claimable_table(), &claimable.id)?;
    }

    if matured == 0 {
        tracing::trace!("no amount to be claimed");
        return Ok(());
    }

    let wei = U256::from(matured) * precision_factor();
    if !ctx.state.can_transfer(&constants::SYSTEM_CONTRACT, wei) {
        return Err(ContractError::NotEnoughBalance);
    }
    ctx.state
        .transfer(constants::SYSTEM_CONTRACT, ctx.caller, wei)
        .map_err(|e| ContractError::Generic(e.to_string()))?;

    Ok(())
}

/// `vote(addresses)`: re-delegate the caller's full stake to the given
/// witnesses.
fn vote(ctx: &mut CallContext<'_>, addresses: &[Address]) -> Result<(), ContractError> {
    let staked = find_staked(ctx.store, ctx.caller)?
        .ok_or_else(|| ContractError::Generic("no staked entry".into()))?;
    unvote_all(ctx.store, ctx.caller, staked.amount)?;
    vote_for(ctx.store, ctx.caller, addresses, staked.amount)?;
    Ok(())
}

/// `unvote()`: drop every delegation of the caller.
fn unvote(ctx: &mut CallContext<'_>) -> Result<(), ContractError> {
    let staked = find_staked(ctx.store, ctx.caller)?
        .ok_or_else(|| ContractError::Generic("no staked entry".into()))?;
    unvote_all(ctx.store, ctx.caller, staked.amount)?;
    Ok(())
}

/// `electEnable(enable)`: flip the elect bit, creating a zero-stake witness
/// row if the caller has none.
fn elect_enable(ctx: &mut CallContext<'_>, enable: bool) -> Result<(), ContractError> {
    let mut witness = find_witness(ctx.store, ctx.caller)?.unwrap_or(Witness {
        id: ctx.caller,
        stake: 0,
        flags: 0,
    });

    if enable {
        witness.flags |= ELECT_ENABLED_FLAG;
    } else {
        witness.flags &= !ELECT_ENABLED_FLAG;
    }

    ctx.store.insert(&witnesses_table(), &witness)?;
    Ok(())
}

/// Add `amount` of weight to each target witness and record the delegation
/// edges. A repeated address accumulates weight repeatedly while the edge
/// row is written once (equality-keyed).
fn vote_for(
    store: &mut WorkingCopy,
    from: Address,
    addresses: &[Address],
    amount: u64,
) -> Result<(), ContractError> {
    for address in addresses {
        let mut witness =
            find_witness(store, *address)?.ok_or(ContractError::NotAWitness)?;
        witness.stake += amount;
        store.insert(&witnesses_table(), &witness)?;
        store.insert(&delegations_table(), &Delegation::new(from, *address))?;
    }
    Ok(())
}

/// Remove every delegation of `from`, subtracting `amount` weight from each
/// delegated witness. Returns the witnesses that were delegated to.
fn unvote_all(
    store: &mut WorkingCopy,
    from: Address,
    amount: u64,
) -> Result<Vec<Address>, ContractError> {
    let delegations: Vec<Delegation> = store.query(
        &delegations_table(),
        Some(Where::IdPrefix(from.as_bytes())),
        None,
    )?;

    let mut delegated = Vec::with_capacity(delegations.len());
    for delegation in &delegations {
        let (_, witness_address) = delegation.parts();
        delegated.push(witness_address);

        let mut witness = find_witness(store, witness_address)?
            .ok_or_else(|| ContractError::Generic("delegated witness missing".into()))?;
        if witness.stake < amount {
            return Err(ContractError::Generic("witness stake underflow".into()));
        }
        witness.stake -= amount;
        store.insert(&witnesses_table(), &witness)?;
    }

    for delegation in &delegations {
        store.delete(&delegations_table(), &delegation.id)?;
    }

    Ok(delegated)
}

/// Store an ABI for `address`; refuses to overwrite.
pub fn store_abi_at_address(
    store: &mut WorkingCopy,
    address: Address,
    abi_json: &str,
) -> Result<(), ContractError> {
    let id = contract_abi_id(address, "abi", "");
    let existing: Option<ContractAbi> =
        store.query_one(&contract_abi_table(), Some(Where::IdPrefix(&id)))?;
    if existing.is_some() {
        return Err(ContractError::AbiAlreadyExists);
    }
    store.insert(
        &contract_abi_table(),
        &ContractAbi {
            id,
            abi: abi_json.to_string(),
        },
    )?;
    Ok(())
}

/// The ABI stored for `address`. The two precompile addresses answer with
/// their built-in ABI without a store lookup.
pub fn abi_at_address(
    store: &WorkingCopy,
    address: Address,
) -> Result<String, ContractError> {
    if address == constants::SYSTEM_CONTRACT {
        return Ok(SYSTEM_CONTRACT_ABI.to_string());
    }
    if address == constants::DB_CONTRACT {
        return Ok(super::db::DB_CONTRACT_ABI.to_string());
    }

    let id = contract_abi_id(address, "abi", "");
    let stored: ContractAbi = store
        .query_one(&contract_abi_table(), Some(Where::IdPrefix(&id)))?
        .ok_or(ContractError::AbiNotFound)?;
    if Address::from_slice(&stored.id[..Address::LENGTH]) != address {
        return Err(ContractError::Generic("abi row id mismatch".into()));
    }
    Ok(stored.abi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::db::IteratorRegistry;
    use crate::state::StateDb;

    fn method(name: &str) -> &'static Method {
        METHODS
            .iter()
            .find(|m| m.name == name)
            .expect("method in static table")
    }

    struct Env {
        state: StateDb,
        store: WorkingCopy,
        iterators: IteratorRegistry,
        time: u64,
    }

    impl Env {
        fn new() -> Self {
            let mut store = WorkingCopy::new();
            setup_genesis_tables(&mut store, Address([0xff; 20])).unwrap();
            Env {
                state: StateDb::new(),
                store,
                iterators: IteratorRegistry::default(),
                time: 1_000_000,
            }
        }

        fn fund_units(&mut self, owner: Address, units: u64) {
            self.state
                .add_balance(owner, U256::from(units) * precision_factor());
        }

        fn call<T>(
            &mut self,
            caller: Address,
            f: impl FnOnce(&mut CallContext<'_>) -> T,
        ) -> T {
            let mut ctx = CallContext {
                caller,
                value: U256::zero(),
                gas: u64::MAX,
                time: self.time,
                state: &mut self.state,
                store: &mut self.store,
                iterators: &mut self.iterators,
            };
            f(&mut ctx)
        }
    }

    const ALICE: Address = Address([0xaa; 20]);

    #[test]
    fn stake_moves_balance_and_updates_system_stake() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);

        env.call(ALICE, |ctx| stake(ctx, 5_000)).unwrap();

        assert_eq!(
            env.call(ALICE, |ctx| get_staked(ctx)),
            5_000,
        );
        assert_eq!(read_system_stake(&env.store), 5_000);
        assert_eq!(
            env.state.balance(&ALICE),
            U256::from(5_000u64) * precision_factor()
        );
        assert_eq!(
            env.state.balance(&constants::SYSTEM_CONTRACT),
            U256::from(5_000u64) * precision_factor()
        );
    }

    #[test]
    fn stake_zero_is_malformed() {
        let mut env = Env::new();
        assert_eq!(
            env.call(ALICE, |ctx| stake(ctx, 0)),
            Err(ContractError::Malformed)
        );
    }

    #[test]
    fn stake_without_balance_fails() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10);
        assert_eq!(
            env.call(ALICE, |ctx| stake(ctx, 11)),
            Err(ContractError::NotEnoughBalance)
        );
        assert_eq!(read_system_stake(&env.store), 0);
    }

    #[test]
    fn elect_enable_creates_witness_row() {
        let mut env = Env::new();
        env.call(ALICE, |ctx| elect_enable(ctx, true)).unwrap();
        let witness = find_witness(&env.store, ALICE).unwrap().unwrap();
        assert!(witness.elect_enabled());
        assert_eq!(witness.stake, 0);

        env.call(ALICE, |ctx| elect_enable(ctx, false)).unwrap();
        let witness = find_witness(&env.store, ALICE).unwrap().unwrap();
        assert!(!witness.elect_enabled());
    }

    #[test]
    fn vote_requires_witness_row() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);
        env.call(ALICE, |ctx| stake(ctx, 1_000)).unwrap();
        assert_eq!(
            env.call(ALICE, |ctx| vote(ctx, &[Address([0x0b; 20])])),
            Err(ContractError::NotAWitness)
        );
    }

    #[test]
    fn stake_vote_elect_scenario() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);

        env.call(ALICE, |ctx| elect_enable(ctx, true)).unwrap();
        env.call(ALICE, |ctx| stake(ctx, 5_000)).unwrap();
        env.call(ALICE, |ctx| vote(ctx, &[ALICE])).unwrap();

        let witness = find_witness(&env.store, ALICE).unwrap().unwrap();
        assert_eq!(witness.stake, 5_000);
        let delegations: Vec<Delegation> = env
            .store
            .query(
                &delegations_table(),
                Some(Where::IdPrefix(ALICE.as_bytes())),
                None,
            )
            .unwrap();
        assert_eq!(delegations.len(), 1);
    }

    #[test]
    fn restaking_revotes_at_new_total() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);
        env.call(ALICE, |ctx| elect_enable(ctx, true)).unwrap();
        env.call(ALICE, |ctx| stake(ctx, 2_000)).unwrap();
        env.call(ALICE, |ctx| vote(ctx, &[ALICE])).unwrap();

        env.call(ALICE, |ctx| stake(ctx, 3_000)).unwrap();
        let witness = find_witness(&env.store, ALICE).unwrap().unwrap();
        assert_eq!(witness.stake, 5_000);
    }

    #[test]
    fn unstake_creates_vesting_claimable() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);
        env.call(ALICE, |ctx| elect_enable(ctx, true)).unwrap();
        env.call(ALICE, |ctx| stake(ctx, 5_000)).unwrap();
        env.call(ALICE, |ctx| vote(ctx, &[ALICE])).unwrap();

        env.call(ALICE, |ctx| unstake(ctx, 2_000)).unwrap();

        assert_eq!(env.call(ALICE, |ctx| get_staked(ctx)), 3_000);
        assert_eq!(read_system_stake(&env.store), 3_000);
        let witness = find_witness(&env.store, ALICE).unwrap().unwrap();
        assert_eq!(witness.stake, 3_000);

        let claimables: Vec<Claimable> = env
            .store
            .query(
                &claimable_table(),
                Some(Where::IdPrefix(ALICE.as_bytes())),
                None,
            )
            .unwrap();
        assert_eq!(claimables.len(), 1);
        assert_eq!(claimables[0].amount, 2_000);
        assert_eq!(
            claimables[0].timestamp,
            env.time + constants::UNSTAKE_VESTING_PERIOD
        );
    }

    #[test]
    fn claim_respects_vesting_boundary() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);
        env.call(ALICE, |ctx| stake(ctx, 5_000)).unwrap();
        env.call(ALICE, |ctx| unstake(ctx, 2_000)).unwrap();
        let unlock = env.time + constants::UNSTAKE_VESTING_PERIOD;

        // one second early: nothing happens
        env.time = unlock - 1;
        env.call(ALICE, |ctx| claim(ctx)).unwrap();
        assert_eq!(
            env.state.balance(&ALICE),
            U256::from(5_000u64) * precision_factor()
        );

        // exactly at the boundary: paid out
        env.time = unlock;
        env.call(ALICE, |ctx| claim(ctx)).unwrap();
        assert_eq!(
            env.state.balance(&ALICE),
            U256::from(7_000u64) * precision_factor()
        );
        let claimables: Vec<Claimable> = env
            .store
            .query(
                &claimable_table(),
                Some(Where::IdPrefix(ALICE.as_bytes())),
                None,
            )
            .unwrap();
        assert!(claimables.is_empty());
    }

    #[test]
    fn sixth_unstake_hits_claimable_limit() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);
        env.call(ALICE, |ctx| stake(ctx, 5_000)).unwrap();

        for i in 0..5u64 {
            env.time = 1_000_000 + i;
            env.call(ALICE, |ctx| unstake(ctx, 100)).unwrap();
        }
        env.time = 1_000_006;
        assert_eq!(
            env.call(ALICE, |ctx| unstake(ctx, 100)),
            Err(ContractError::TooManyClaimable)
        );
    }

    #[test]
    fn unstake_same_timestamp_twice_is_refused() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);
        env.call(ALICE, |ctx| stake(ctx, 5_000)).unwrap();
        env.call(ALICE, |ctx| unstake(ctx, 100)).unwrap();
        assert!(matches!(
            env.call(ALICE, |ctx| unstake(ctx, 100)),
            Err(ContractError::Generic(_))
        ));
    }

    #[test]
    fn unstake_more_than_staked() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);
        env.call(ALICE, |ctx| stake(ctx, 1_000)).unwrap();
        assert_eq!(
            env.call(ALICE, |ctx| unstake(ctx, 1_001)),
            Err(ContractError::NotEnoughStaked)
        );
    }

    #[test]
    fn unstake_everything_deletes_staked_row() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);
        env.call(ALICE, |ctx| stake(ctx, 1_000)).unwrap();
        env.call(ALICE, |ctx| unstake(ctx, 1_000)).unwrap();
        assert!(find_staked(&env.store, ALICE).unwrap().is_none());
        assert_eq!(read_system_stake(&env.store), 0);
    }

    #[test]
    fn stake_consumes_unmatured_claimable_without_transfer() {
        let mut env = Env::new();
        env.fund_units(ALICE, 4_000);
        env.call(ALICE, |ctx| stake(ctx, 4_000)).unwrap();
        env.call(ALICE, |ctx| unstake(ctx, 4_000)).unwrap();
        // balance is zero; the claimable alone must cover the new stake
        assert_eq!(env.state.balance(&ALICE), U256::zero());

        env.call(ALICE, |ctx| {
            claim(ctx)?;
            stake(ctx, 4_000)
        })
        .unwrap();
        assert_eq!(env.call(ALICE, |ctx| get_staked(ctx)), 4_000);
        assert_eq!(env.state.balance(&ALICE), U256::zero());

        // nothing left to cover even one more unit
        assert_eq!(
            env.call(ALICE, |ctx| {
                claim(ctx)?;
                stake(ctx, 1)
            }),
            Err(ContractError::NotEnoughBalance)
        );
        // the failed stake left no claimable mutation behind
        let claimables: Vec<Claimable> = env
            .store
            .query(
                &claimable_table(),
                Some(Where::IdPrefix(ALICE.as_bytes())),
                None,
            )
            .unwrap();
        assert!(claimables.is_empty());
    }

    #[test]
    fn partial_claimable_consumption_updates_entry() {
        let mut env = Env::new();
        env.fund_units(ALICE, 4_000);
        env.call(ALICE, |ctx| stake(ctx, 4_000)).unwrap();
        env.call(ALICE, |ctx| unstake(ctx, 4_000)).unwrap();

        env.call(ALICE, |ctx| stake(ctx, 1_500)).unwrap();
        let claimables: Vec<Claimable> = env
            .store
            .query(
                &claimable_table(),
                Some(Where::IdPrefix(ALICE.as_bytes())),
                None,
            )
            .unwrap();
        assert_eq!(claimables.len(), 1);
        assert_eq!(claimables[0].amount, 2_500);
        assert_eq!(env.call(ALICE, |ctx| get_staked(ctx)), 1_500);
    }

    #[test]
    fn duplicate_vote_addresses_double_weight() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);
        env.call(ALICE, |ctx| elect_enable(ctx, true)).unwrap();
        env.call(ALICE, |ctx| stake(ctx, 1_000)).unwrap();
        env.call(ALICE, |ctx| vote(ctx, &[ALICE, ALICE])).unwrap();

        // weight is added per occurrence while the delegation row is single
        let witness = find_witness(&env.store, ALICE).unwrap().unwrap();
        assert_eq!(witness.stake, 2_000);
        let delegations: Vec<Delegation> = env
            .store
            .query(
                &delegations_table(),
                Some(Where::IdPrefix(ALICE.as_bytes())),
                None,
            )
            .unwrap();
        assert_eq!(delegations.len(), 1);
    }

    #[test]
    fn abi_store_and_fetch() {
        let mut env = Env::new();
        let target = Address([0x33; 20]);
        store_abi_at_address(&mut env.store, target, "[]").unwrap();
        assert_eq!(abi_at_address(&env.store, target).unwrap(), "[]");
        assert_eq!(
            store_abi_at_address(&mut env.store, target, "[]"),
            Err(ContractError::AbiAlreadyExists)
        );
        assert_eq!(
            abi_at_address(&env.store, Address([0x44; 20])),
            Err(ContractError::AbiNotFound)
        );
        // precompile addresses answer with their built-in ABI
        assert_eq!(
            abi_at_address(&env.store, constants::SYSTEM_CONTRACT).unwrap(),
            SYSTEM_CONTRACT_ABI
        );
    }

    #[test]
    fn dispatch_via_abi_call() {
        let mut env = Env::new();
        env.fund_units(ALICE, 10_000);

        let call = method("stake")
            .encode_call(&[Value::Uint64(2_500)])
            .unwrap();
        env.call(ALICE, |ctx| SystemContract.run(ctx, &call))
            .unwrap();

        let call = method("getStaked").encode_call(&[]).unwrap();
        let output = env
            .call(ALICE, |ctx| SystemContract.run(ctx, &call))
            .unwrap();
        let values = method("getStaked").outputs;
        let decoded = abi::decode_values(values, &output).unwrap();
        assert_eq!(decoded[0], Value::Uint64(2_500));
    }

    #[test]
    fn vote_gas_scales_with_addresses() {
        let contract = SystemContract;
        let one = method("vote")
            .encode_call(&[Value::AddressArray(vec![ALICE])])
            .unwrap();
        let three = method("vote")
            .encode_call(&[Value::AddressArray(vec![ALICE, ALICE, ALICE])])
            .unwrap();
        assert_eq!(contract.required_gas(&one), gas::VOTE);
        assert_eq!(contract.required_gas(&three), gas::VOTE * 3);
    }

    #[test]
    fn vote_gas_with_forged_length_word_falls_back() {
        // the gas estimator decodes the address array before any gas is
        // charged; a length word claiming billions of entries over an empty
        // body must fail the decode cleanly and fall back to the base cost
        let mut input = method("vote").selector().to_vec();
        let mut offset_word = [0u8; 32];
        offset_word[31] = 32;
        input.extend_from_slice(&offset_word);
        let mut length_word = [0u8; 32];
        length_word[27] = 0x40;
        input.extend_from_slice(&length_word);

        assert_eq!(SystemContract.required_gas(&input), gas::SYSTEM_BASE);

        // and the execution path refuses the same input as malformed
        let mut env = Env::new();
        assert_eq!(
            env.call(ALICE, |ctx| SystemContract.run(ctx, &input)),
            Err(ContractError::Malformed)
        );
    }
}
