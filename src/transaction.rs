//! Transactions and the per-transaction proof-of-work.
//!
//! There is no gas price. A transaction instead carries a *work nonce*: the
//! sender searches for a nonce whose keccak256 chain produces a numerically
//! small hash, and the derived "difficulty" (2^256 divided by that hash)
//! stands in for the fee market. The mempool orders transactions by
//! difficulty scaled with the sender's share of total stake (virtual
//! difficulty, computed in [`crate::mempool`]).

use once_cell::sync::OnceCell;
use primitive_types::U256;

use crate::crypto::{self, keccak256, CryptoError, Keypair};
use crate::rlp::{self, Item, RlpError};
use crate::{Address, Hash};

/// 2^256 as a float, the numerator of every difficulty computation.
pub const TWO_256_F64: f64 = 1.157920892373162e77;

/// A signed transaction.
///
/// `hash`, `from` and `pow` are lazily computed caches, never serialized.
#[derive(Clone, Debug, Default)]
pub struct Transaction {
    pub account_nonce: u64,
    pub work_nonce: u64,
    pub gas_limit: u64,
    /// `None` means contract creation.
    pub recipient: Option<Address>,
    pub amount: U256,
    pub payload: Vec<u8>,

    // signature values
    pub v: U256,
    pub r: U256,
    pub s: U256,

    hash: OnceCell<Hash>,
    from: OnceCell<Address>,
    pow: OnceCell<f64>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.account_nonce == other.account_nonce
            && self.work_nonce == other.work_nonce
            && self.gas_limit == other.gas_limit
            && self.recipient == other.recipient
            && self.amount == other.amount
            && self.payload == other.payload
            && self.v == other.v
            && self.r == other.r
            && self.s == other.s
    }
}

impl Transaction {
    /// Build an unsigned transfer/call to `recipient`.
    pub fn new(
        account_nonce: u64,
        recipient: Address,
        amount: U256,
        gas_limit: u64,
        payload: Vec<u8>,
    ) -> Self {
        Transaction {
            account_nonce,
            work_nonce: 0,
            gas_limit,
            recipient: Some(recipient),
            amount,
            payload,
            ..Default::default()
        }
    }

    /// Build an unsigned contract creation.
    pub fn new_contract_creation(
        account_nonce: u64,
        amount: U256,
        gas_limit: u64,
        payload: Vec<u8>,
    ) -> Self {
        Transaction {
            account_nonce,
            work_nonce: 0,
            gas_limit,
            recipient: None,
            amount,
            payload,
            ..Default::default()
        }
    }

    fn recipient_item(&self) -> Item {
        match &self.recipient {
            Some(address) => Item::bytes(address.as_bytes()),
            None => Item::bytes([]),
        }
    }

    /// RLP preimage of the work-nonce search: the signed fields minus the
    /// work nonce itself.
    pub fn rlp_for_pow(&self) -> Vec<u8> {
        rlp::encode_list(&[
            Item::uint(self.account_nonce),
            Item::uint(self.gas_limit),
            self.recipient_item(),
            Item::big_uint(self.amount),
            Item::bytes(&self.payload),
        ])
    }

    /// Hash signed by the sender (replay-protected with the chain id).
    pub fn sign_hash(&self, chain_id: u64) -> Hash {
        keccak256(&rlp::encode_list(&[
            Item::uint(self.account_nonce),
            Item::uint(self.work_nonce),
            Item::uint(self.gas_limit),
            self.recipient_item(),
            Item::big_uint(self.amount),
            Item::bytes(&self.payload),
            Item::uint(chain_id),
            Item::uint(0),
            Item::uint(0),
        ]))
    }

    /// Sign with `keypair`, producing the replay-protected `v` value
    /// `recovery_id + 35 + 2 * chain_id`.
    pub fn sign(mut self, keypair: &Keypair, chain_id: u64) -> Result<Self, CryptoError> {
        let prehash = self.sign_hash(chain_id);
        let signature = keypair.sign_hash(&prehash)?;
        self.r = U256::from_big_endian(&signature[..32]);
        self.s = U256::from_big_endian(&signature[32..64]);
        self.v = U256::from(signature[64] as u64 + 35 + chain_id * 2);
        self.hash = OnceCell::new();
        self.from = OnceCell::new();
        Ok(self)
    }

    /// Whether `v` carries a chain id (EIP-155 style replay protection).
    pub fn protected(&self) -> bool {
        if self.v.bits() <= 8 {
            let v = self.v.low_u64();
            return v != 27 && v != 28;
        }
        true
    }

    /// Chain id derived from `v`, if replay-protected. `None` also covers
    /// nonsense `v` values below the protected range.
    pub fn chain_id(&self) -> Option<u64> {
        if !self.protected() {
            return None;
        }
        self.v.low_u64().checked_sub(35).map(|shifted| shifted / 2)
    }

    /// Recover (and cache) the sender address.
    pub fn sender(&self, chain_id: u64) -> Result<Address, CryptoError> {
        if let Some(from) = self.from.get() {
            return Ok(*from);
        }
        let v = self.v.low_u64();
        let recovery_id = if self.protected() {
            match self.chain_id() {
                Some(derived) if derived == chain_id => (v - 35 - 2 * chain_id) as u8,
                _ => return Err(CryptoError::InvalidSignature),
            }
        } else {
            (v - 27) as u8
        };
        if !crypto::validate_signature_values(recovery_id, self.r, self.s) {
            return Err(CryptoError::InvalidSignature);
        }
        let mut signature = [0u8; 65];
        self.r.to_big_endian(&mut signature[..32]);
        self.s.to_big_endian(&mut signature[32..64]);
        signature[64] = recovery_id;
        let from = crypto::recover_address(&self.sign_hash(chain_id), &signature)?;
        let _ = self.from.set(from);
        Ok(from)
    }

    /// Canonical encoding: the full signed field list.
    pub fn to_item(&self) -> Item {
        Item::List(vec![
            Item::uint(self.account_nonce),
            Item::uint(self.work_nonce),
            Item::uint(self.gas_limit),
            self.recipient_item(),
            Item::big_uint(self.amount),
            Item::bytes(&self.payload),
            Item::big_uint(self.v),
            Item::big_uint(self.r),
            Item::big_uint(self.s),
        ])
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(&self.to_item())
    }

    pub fn from_item(item: &Item) -> Result<Self, RlpError> {
        let fields = item.as_list()?;
        if fields.len() != 9 {
            return Err(RlpError::Expected("transaction with 9 fields"));
        }
        let recipient_bytes = fields[3].as_bytes()?;
        let recipient = match recipient_bytes.len() {
            0 => None,
            Address::LENGTH => Some(Address::from_slice(recipient_bytes)),
            _ => return Err(RlpError::Expected("20 byte recipient or empty")),
        };
        Ok(Transaction {
            account_nonce: fields[0].as_u64()?,
            work_nonce: fields[1].as_u64()?,
            gas_limit: fields[2].as_u64()?,
            recipient,
            amount: fields[4].as_u256()?,
            payload: fields[5].as_bytes()?.to_vec(),
            v: fields[6].as_u256()?,
            r: fields[7].as_u256()?,
            s: fields[8].as_u256()?,
            ..Default::default()
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self, RlpError> {
        Self::from_item(&rlp::decode(data)?)
    }

    /// Transaction identity: keccak256 of the canonical encoding, cached.
    pub fn hash(&self) -> Hash {
        *self.hash.get_or_init(|| keccak256(&self.encode()))
    }

    /// The 64-byte work buffer for a given nonce: preimage hash, 24 zero
    /// bytes, then the nonce big-endian in the last 8 bytes.
    fn work_buffer(preimage_hash: &Hash, nonce: u64) -> [u8; 64] {
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(preimage_hash);
        buf[56..].copy_from_slice(&nonce.to_be_bytes());
        buf
    }

    /// Proof-of-work difficulty of this transaction, cached:
    /// 2^256 / keccak256(work buffer) as a float.
    pub fn difficulty(&self) -> f64 {
        *self.pow.get_or_init(|| {
            let preimage_hash = keccak256(&self.rlp_for_pow());
            let buf = Self::work_buffer(&preimage_hash, self.work_nonce);
            let hash = U256::from_big_endian(&keccak256(&buf));
            TWO_256_F64 / u256_to_f64(hash)
        })
    }

    /// Search a work nonce reaching `target` difficulty. Nonces are tried in
    /// ascending order; the smallest hash seen so far is kept, and the search
    /// stops once it drops under the integer threshold `2^256 / target`.
    /// Targets below 1.0 need no work at all.
    pub fn calculate_work_nonce(&mut self, target: f64) {
        if target < 1.0 {
            return;
        }
        let threshold = difficulty_threshold(target);
        let preimage_hash = keccak256(&self.rlp_for_pow());

        let mut nonce = 0u64;
        let mut smallest = U256::MAX;
        loop {
            let buf = Self::work_buffer(&preimage_hash, nonce);
            let hash = U256::from_big_endian(&keccak256(&buf));
            if hash < smallest {
                self.work_nonce = nonce;
                smallest = hash;
                if smallest < threshold {
                    self.pow = OnceCell::new();
                    self.hash = OnceCell::new();
                    return;
                }
            }
            nonce += 1;
        }
    }

    /// Difficulty per unit of gas; the stake-independent part of the mempool
    /// ordering key.
    pub fn gas_price(&self) -> f64 {
        self.difficulty() / self.gas_limit as f64
    }
}

/// Convert a 256-bit integer to the nearest float.
pub fn u256_to_f64(value: U256) -> f64 {
    let mut out = 0f64;
    for limb in value.0.iter().rev() {
        out = out * 1.8446744073709552e19 + *limb as f64;
    }
    out
}

/// Integer threshold `2^256 / target`, rounded down so that any hash under
/// it certainly reaches `target` difficulty.
fn difficulty_threshold(target: f64) -> U256 {
    // scale the target into a 32.32 fixed-point integer, rounding up
    let scaled = (target * 4_294_967_296.0).ceil() as u128;
    (U256::MAX / U256::from(scaled)) << 32
}
