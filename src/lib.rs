//! # Meridian
//!
//! A delegated-proof-of-stake blockchain node with:
//! - **DPoS sealing** — slot-scheduled block producers drawn from a ranked,
//!   stake-weighted witness set with a randomized bonus slot
//! - **Per-transaction proof-of-work** — a work nonce searched client-side
//!   gives every transaction a "virtual difficulty" used for mempool ordering
//! - **System contracts** — staking/voting and an embedded ordered table
//!   store exposed to contracts at fixed precompile addresses
//! - **MVCC table store** — snapshotable witness/stake tables with
//!   equality/prefix/order queries

pub mod block;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod contracts;
pub mod crypto;
pub mod executor;
pub mod genesis;
pub mod mempool;
pub mod producer;
pub mod rlp;
pub mod rpc;
pub mod state;
pub mod store;
pub mod transaction;

use serde::{Deserialize, Serialize};

/// Protocol constants
pub mod constants {
    use super::Address;

    /// Default block issuance period in seconds
    pub const BLOCK_PERIOD: u64 = 1;
    /// Default number of delegate producers per schedule
    pub const DELEGATE_COUNT: u64 = 21;
    /// Default number of bonus candidates beyond the deterministic set
    pub const BONUS_DELEGATE_COUNT: u64 = 1;
    /// Default consecutive slots per producer turn
    pub const TURN_BLOCK_COUNT: u64 = 4;
    /// Seconds between consensus checkpoints
    pub const CHECKPOINT_INTERVAL: u64 = 60 * 10;
    /// Initial token distribution (whole tokens)
    pub const INITIAL_DISTRIBUTION: u64 = 1_000_000_000;

    /// Seconds until unstaked tokens become claimable (3 days)
    pub const UNSTAKE_VESTING_PERIOD: u64 = 60 * 60 * 24 * 3;
    /// Maximum outstanding claimable entries per account
    pub const MAX_CLAIMABLE_ENTRIES: usize = 5;
    /// Decimal points of the staking unit (the native token has 18)
    pub const VALUE_DECIMAL_POINTS: u32 = 4;

    /// Flat per-block coinbase reward in wei
    pub const BLOCK_REWARD_WEI: u128 = 3171 * 100_000_000_000_000;

    /// Minimum target difficulty accepted for the transaction work nonce
    pub const MINIMUM_TARGET_DIFFICULTY: f64 = 0.2;
    /// Minimum virtual difficulty accepted into the mempool
    pub const MINIMUM_VIRTUAL_DIFFICULTY: f64 = 0.0;
    /// Stake epsilon keeping zero-stake accounts at positive capacity
    pub const EPSILON_STAKE: f64 = 1e-10;

    /// Number of recent block signatures kept for fast author recovery
    pub const SIGNATURE_CACHE_SIZE: usize = 4096;

    /// Wall-clock budget for packing transactions into one block
    pub const PACKING_BUDGET_MS: u64 = 500;
    /// Intrinsic gas of the cheapest transaction
    pub const TX_GAS: u64 = 21_000;
    /// Default gas limit for new chains
    pub const GENESIS_GAS_LIMIT: u64 = 10_000_000;

    /// The staking/voting system contract address (0x…0101)
    pub const SYSTEM_CONTRACT: Address = Address([
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1,
    ]);
    /// The embedded database contract address (0x…0102)
    pub const DB_CONTRACT: Address = Address([
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2,
    ]);

    /// Raw store key of the global staked-amount scalar
    pub const SYSTEM_STAKE_KEY: &[u8] = b"meridian:global:systemStake";
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// A 20-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const LENGTH: usize = 20;

    /// The all-zero address (no signer / contract creation sentinel).
    pub const fn zero() -> Self {
        Address([0u8; 20])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Build an address from a byte slice: longer inputs keep their last 20
    /// bytes, shorter inputs are zero-padded on the left.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; 20];
        if bytes.len() >= 20 {
            out.copy_from_slice(&bytes[bytes.len() - 20..]);
        } else {
            out[20 - bytes.len()..].copy_from_slice(bytes);
        }
        Address(out)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        if bytes.len() != 20 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        Ok(Address::from_slice(&bytes))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hex-encode a hash for logs and RPC responses.
pub fn hash_hex(h: &Hash) -> String {
    format!("0x{}", hex::encode(h))
}
