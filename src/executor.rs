//! Transaction application.
//!
//! The packing loop and block import both route transactions through
//! [`apply_transaction`]: sender recovery, replay/nonce checks, gas-pool
//! accounting, then either a native value transfer or a precompile call
//! (the staking and database contracts). A failed application reverts every
//! state and store write of that transaction; the caller decides whether to
//! shift or pop the sender based on the error kind.

use primitive_types::U256;

use crate::block::Header;
use crate::contracts::{self, db::IteratorRegistry, CallContext, ContractError};
use crate::rlp::{self, Item};
use crate::state::StateDb;
use crate::store::WorkingCopy;
use crate::transaction::Transaction;
use crate::{constants, Address, Hash};

/// Outcomes that decide the packing loop's next move.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ExecError {
    #[error("gas limit reached for current block")]
    GasLimitReached,
    #[error("nonce too low")]
    NonceTooLow,
    #[error("nonce too high")]
    NonceTooHigh,
    #[error("replay protected transaction not accepted")]
    ReplayProtectionViolation,
    #[error("sender recovery failed")]
    InvalidSender,
    #[error("intrinsic gas exceeds the transaction gas limit")]
    IntrinsicGas,
    #[error("insufficient balance for transfer")]
    InsufficientBalance,
    #[error("contract creation is not supported")]
    CreationUnsupported,
    #[error(transparent)]
    Contract(#[from] ContractError),
}

/// Remaining gas of the block being packed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasPool(u64);

impl GasPool {
    pub fn new(gas: u64) -> Self {
        GasPool(gas)
    }

    pub fn gas(&self) -> u64 {
        self.0
    }

    pub fn sub_gas(&mut self, amount: u64) -> Result<(), ExecError> {
        if self.0 < amount {
            return Err(ExecError::GasLimitReached);
        }
        self.0 -= amount;
        Ok(())
    }

    pub fn add_gas(&mut self, amount: u64) {
        self.0 = self.0.saturating_add(amount);
    }
}

/// An execution receipt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub success: bool,
    pub gas_used: u64,
    pub output: Vec<u8>,
}

impl Receipt {
    pub fn encode(&self) -> Vec<u8> {
        rlp::encode_list(&[
            Item::bytes(self.tx_hash),
            Item::uint(self.success as u64),
            Item::uint(self.gas_used),
            Item::bytes(&self.output),
        ])
    }
}

/// Executor configuration shared across a block.
#[derive(Clone, Copy, Debug)]
pub struct ExecConfig {
    pub chain_id: u64,
    /// Whether replay-protected (chain-id-carrying) transactions are
    /// accepted.
    pub replay_protection: bool,
}

/// Apply one transaction against the block-in-progress. On any error the
/// account state and table store are exactly as before the call.
pub fn apply_transaction(
    config: &ExecConfig,
    header: &Header,
    gas_pool: &mut GasPool,
    state: &mut StateDb,
    store: &mut WorkingCopy,
    iterators: &mut IteratorRegistry,
    tx: &Transaction,
) -> Result<Receipt, ExecError> {
    let sender = tx
        .sender(config.chain_id)
        .map_err(|_| ExecError::InvalidSender)?;

    if tx.protected() && !config.replay_protection {
        return Err(ExecError::ReplayProtectionViolation);
    }

    let expected_nonce = state.nonce(&sender);
    if tx.account_nonce < expected_nonce {
        return Err(ExecError::NonceTooLow);
    }
    if tx.account_nonce > expected_nonce {
        return Err(ExecError::NonceTooHigh);
    }

    gas_pool.sub_gas(tx.gas_limit)?;
    if tx.gas_limit < constants::TX_GAS {
        gas_pool.add_gas(tx.gas_limit);
        return Err(ExecError::IntrinsicGas);
    }

    let checkpoint = state.checkpoint();
    let store_checkpoint = store.fork();

    let result = execute(header, state, store, iterators, sender, tx);
    match result {
        Ok((output, gas_used)) => {
            state.increment_nonce(sender);
            gas_pool.add_gas(tx.gas_limit - gas_used);
            Ok(Receipt {
                tx_hash: tx.hash(),
                success: true,
                gas_used,
                output,
            })
        }
        Err(e) => {
            state.revert_to(checkpoint);
            store.reset_to(store_checkpoint);
            gas_pool.add_gas(tx.gas_limit);
            Err(e)
        }
    }
}

fn execute(
    header: &Header,
    state: &mut StateDb,
    store: &mut WorkingCopy,
    iterators: &mut IteratorRegistry,
    sender: Address,
    tx: &Transaction,
) -> Result<(Vec<u8>, u64), ExecError> {
    let mut gas_used = constants::TX_GAS;

    let Some(recipient) = tx.recipient else {
        return Err(ExecError::CreationUnsupported);
    };

    if !state.can_transfer(&sender, tx.amount) {
        return Err(ExecError::InsufficientBalance);
    }

    if let Some(precompile) = contracts::precompile_for(recipient) {
        state
            .transfer(sender, recipient, tx.amount)
            .map_err(|_| ExecError::InsufficientBalance)?;

        let gas_for_call = tx.gas_limit - gas_used;
        let mut ctx = CallContext {
            caller: sender,
            value: tx.amount,
            gas: gas_for_call,
            time: header.time,
            state,
            store,
            iterators,
        };
        let (output, call_gas) = contracts::run_precompile(precompile, &mut ctx, &tx.payload)?;
        gas_used += call_gas;
        Ok((output, gas_used))
    } else {
        state
            .transfer(sender, recipient, tx.amount)
            .map_err(|_| ExecError::InsufficientBalance)?;
        Ok((vec![], gas_used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Bloom;
    use crate::contracts::abi::Value;
    use crate::contracts::system;
    use crate::crypto::Keypair;

    const CHAIN_ID: u64 = 101;

    fn config() -> ExecConfig {
        ExecConfig {
            chain_id: CHAIN_ID,
            replay_protection: true,
        }
    }

    fn header() -> Header {
        Header {
            parent_hash: [0; 32],
            signature: vec![],
            root: [0; 32],
            tx_hash: [0; 32],
            receipt_hash: [0; 32],
            bloom: Bloom::zero(),
            number: 1,
            gas_limit: constants::GENESIS_GAS_LIMIT,
            gas_used: 0,
            time: 1_000_000,
            delegate_diff: vec![],
        }
    }

    struct Env {
        state: StateDb,
        store: WorkingCopy,
        iterators: IteratorRegistry,
        pool: GasPool,
    }

    impl Env {
        fn new() -> Self {
            let mut store = WorkingCopy::new();
            system::setup_genesis_tables(&mut store, Address([0xfe; 20])).unwrap();
            Env {
                state: StateDb::new(),
                store,
                iterators: IteratorRegistry::default(),
                pool: GasPool::new(constants::GENESIS_GAS_LIMIT),
            }
        }

        fn apply(&mut self, tx: &Transaction) -> Result<Receipt, ExecError> {
            apply_transaction(
                &config(),
                &header(),
                &mut self.pool,
                &mut self.state,
                &mut self.store,
                &mut self.iterators,
                tx,
            )
        }
    }

    fn signed_transfer(kp: &Keypair, nonce: u64, to: Address, amount: u64) -> Transaction {
        Transaction::new(nonce, to, U256::from(amount), constants::TX_GAS, vec![])
            .sign(kp, CHAIN_ID)
            .unwrap()
    }

    #[test]
    fn plain_transfer() {
        let mut env = Env::new();
        let kp = Keypair::from_secret(&[1; 32]).unwrap();
        env.state.add_balance(kp.address(), U256::from(1_000u64));

        let to = Address([0x10; 20]);
        let receipt = env.apply(&signed_transfer(&kp, 0, to, 400)).unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.gas_used, constants::TX_GAS);
        assert_eq!(env.state.balance(&to), U256::from(400u64));
        assert_eq!(env.state.nonce(&kp.address()), 1);
    }

    #[test]
    fn nonce_ordering_errors() {
        let mut env = Env::new();
        let kp = Keypair::from_secret(&[2; 32]).unwrap();
        env.state.add_balance(kp.address(), U256::from(1_000u64));
        let to = Address([0x10; 20]);

        assert_eq!(
            env.apply(&signed_transfer(&kp, 3, to, 1)),
            Err(ExecError::NonceTooHigh)
        );
        env.apply(&signed_transfer(&kp, 0, to, 1)).unwrap();
        assert_eq!(
            env.apply(&signed_transfer(&kp, 0, to, 1)),
            Err(ExecError::NonceTooLow)
        );
    }

    #[test]
    fn gas_pool_exhaustion() {
        let mut env = Env::new();
        env.pool = GasPool::new(constants::TX_GAS - 1);
        let kp = Keypair::from_secret(&[3; 32]).unwrap();
        env.state.add_balance(kp.address(), U256::from(10u64));

        assert_eq!(
            env.apply(&signed_transfer(&kp, 0, Address([1; 20]), 1)),
            Err(ExecError::GasLimitReached)
        );
    }

    #[test]
    fn replay_protection_toggle() {
        let mut env = Env::new();
        let kp = Keypair::from_secret(&[4; 32]).unwrap();
        env.state.add_balance(kp.address(), U256::from(10u64));
        let tx = signed_transfer(&kp, 0, Address([1; 20]), 1);

        let strict = ExecConfig {
            chain_id: CHAIN_ID,
            replay_protection: false,
        };
        let result = apply_transaction(
            &strict,
            &header(),
            &mut env.pool,
            &mut env.state,
            &mut env.store,
            &mut env.iterators,
            &tx,
        );
        assert_eq!(result, Err(ExecError::ReplayProtectionViolation));
    }

    #[test]
    fn stake_via_precompile_call() {
        let mut env = Env::new();
        let kp = Keypair::from_secret(&[5; 32]).unwrap();
        env.state.add_balance(
            kp.address(),
            U256::from(10_000u64) * system::precision_factor(),
        );

        let stake_method = system::METHODS.iter().find(|m| m.name == "stake").unwrap();
        let payload = stake_method.encode_call(&[Value::Uint64(4_000)]).unwrap();
        let tx = Transaction::new(
            0,
            constants::SYSTEM_CONTRACT,
            U256::zero(),
            1_000_000,
            payload,
        )
        .sign(&kp, CHAIN_ID)
        .unwrap();

        let receipt = env.apply(&tx).unwrap();
        assert!(receipt.success);
        assert!(receipt.gas_used > constants::TX_GAS);
        assert_eq!(crate::contracts::read_system_stake(&env.store), 4_000);
        assert_eq!(
            env.state.balance(&constants::SYSTEM_CONTRACT),
            U256::from(4_000u64) * system::precision_factor()
        );
    }

    #[test]
    fn failed_precompile_reverts_everything() {
        let mut env = Env::new();
        let kp = Keypair::from_secret(&[6; 32]).unwrap();
        // no balance at all: stake must fail and leave no trace
        let stake_method = system::METHODS.iter().find(|m| m.name == "stake").unwrap();
        let payload = stake_method.encode_call(&[Value::Uint64(100)]).unwrap();
        let tx = Transaction::new(
            0,
            constants::SYSTEM_CONTRACT,
            U256::zero(),
            1_000_000,
            payload,
        )
        .sign(&kp, CHAIN_ID)
        .unwrap();

        let before_memory = env.store.used_memory();
        let before_pool = env.pool;
        assert!(matches!(
            env.apply(&tx),
            Err(ExecError::Contract(ContractError::NotEnoughBalance))
        ));
        assert_eq!(env.store.used_memory(), before_memory);
        assert_eq!(env.pool, before_pool);
        assert_eq!(env.state.nonce(&kp.address()), 0);
        assert_eq!(crate::contracts::read_system_stake(&env.store), 0);
    }

    #[test]
    fn contract_creation_is_routed_out() {
        let mut env = Env::new();
        let kp = Keypair::from_secret(&[7; 32]).unwrap();
        env.state.add_balance(kp.address(), U256::from(10u64));
        let tx = Transaction::new_contract_creation(0, U256::zero(), 100_000, vec![1])
            .sign(&kp, CHAIN_ID)
            .unwrap();
        assert_eq!(env.apply(&tx), Err(ExecError::CreationUnsupported));
    }

    #[test]
    fn receipt_encoding_is_stable() {
        let receipt = Receipt {
            tx_hash: [1; 32],
            success: true,
            gas_used: 21_000,
            output: vec![5, 6],
        };
        assert_eq!(receipt.encode(), receipt.encode());
        assert_ne!(
            receipt.encode(),
            Receipt {
                success: false,
                ..receipt.clone()
            }
            .encode()
        );
    }
}
