//! Block and header types.
//!
//! A header carries the producer's 65-byte signature and a compact
//! *delegate diff*: the positional difference between the delegate array of
//! this block and its parent. The signed preimage covers every header field
//! except the signature itself; the header hash (block identity) covers the
//! signature too.

use crate::crypto::keccak256;
use crate::rlp::{self, Item, RlpError};
use crate::transaction::Transaction;
use crate::{Address, Hash};

/// 2048-bit log bloom carried by every header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bloom(pub [u8; 256]);

impl Bloom {
    pub const fn zero() -> Self {
        Bloom([0u8; 256])
    }
}

impl Default for Bloom {
    fn default() -> Self {
        Bloom::zero()
    }
}

impl std::fmt::Debug for Bloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == [0u8; 256] {
            write!(f, "Bloom(zero)")
        } else {
            write!(f, "Bloom(0x{}…)", hex::encode(&self.0[..8]))
        }
    }
}

/// One entry of a delegate diff.
///
/// Either a new address entering the array at `pos`, or the element that was
/// previously at index `number` moving to `pos`. The address form is the
/// discriminator: an all-zero address means the `number` form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DelegateItem {
    pub pos: u8,
    pub address: Address,
    pub number: u8,
}

impl DelegateItem {
    /// Compact encoding: 2 bytes `[pos, number]` for a move, 21 bytes
    /// `[pos ‖ address]` for a new entry.
    pub fn encode(&self) -> Vec<u8> {
        if self.address.is_zero() {
            vec![self.pos, self.number]
        } else {
            let mut out = Vec::with_capacity(1 + Address::LENGTH);
            out.push(self.pos);
            out.extend_from_slice(self.address.as_bytes());
            out
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RlpError> {
        match bytes.len() {
            2 => Ok(DelegateItem {
                pos: bytes[0],
                address: Address::zero(),
                number: bytes[1],
            }),
            len if len == Address::LENGTH + 1 => Ok(DelegateItem {
                pos: bytes[0],
                address: Address::from_slice(&bytes[1..]),
                number: 0,
            }),
            _ => Err(RlpError::Expected("2 or 21 byte delegate item")),
        }
    }
}

/// Ordered list of delegate changes between consecutive blocks.
pub type DelegateDiff = Vec<DelegateItem>;

/// Positional diff of two delegate arrays. Entries of `new` found in `old`
/// at a different index become moves, unknown entries become inserts, and
/// unchanged positions are omitted.
pub fn delegate_diff(old: &[Address], new: &[Address]) -> DelegateDiff {
    let mut diff = DelegateDiff::new();
    for (i, address) in new.iter().enumerate() {
        match old.iter().position(|from| from == address) {
            Some(j) if i == j => {}
            Some(j) => diff.push(DelegateItem {
                pos: i as u8,
                address: Address::zero(),
                number: j as u8,
            }),
            None => diff.push(DelegateItem {
                pos: i as u8,
                address: *address,
                number: 0,
            }),
        }
    }
    diff
}

/// A block header.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub parent_hash: Hash,
    /// 65-byte producer signature; empty until sealed.
    pub signature: Vec<u8>,
    pub root: Hash,
    pub tx_hash: Hash,
    pub receipt_hash: Hash,
    pub bloom: Bloom,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub time: u64,
    pub delegate_diff: DelegateDiff,
}

impl Header {
    /// RLP preimage of the producer signature: every field except the
    /// signature, with the delegate diff as a nested list.
    pub fn seal_preimage(&self) -> Vec<u8> {
        let diff_items: Vec<Item> = self
            .delegate_diff
            .iter()
            .map(|item| Item::bytes(item.encode()))
            .collect();
        rlp::encode_list(&[
            Item::bytes(self.parent_hash),
            Item::bytes(self.root),
            Item::bytes(self.tx_hash),
            Item::bytes(self.receipt_hash),
            Item::bytes(self.bloom.0),
            Item::uint(self.number),
            Item::uint(self.gas_limit),
            Item::uint(self.gas_used),
            Item::uint(self.time),
            Item::List(diff_items),
        ])
    }

    /// Hash the producer actually signs.
    pub fn seal_hash(&self) -> Hash {
        keccak256(&self.seal_preimage())
    }

    /// Block identity: keccak256 of the full header encoding, signature
    /// included.
    pub fn hash(&self) -> Hash {
        keccak256(&self.encode())
    }

    /// Canonical header encoding. The delegate diff items form the list's
    /// tail, flattened after the fixed fields.
    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(&self.to_item())
    }

    fn to_item(&self) -> Item {
        let mut items = vec![
            Item::bytes(self.parent_hash),
            Item::bytes(&self.signature),
            Item::bytes(self.root),
            Item::bytes(self.tx_hash),
            Item::bytes(self.receipt_hash),
            Item::bytes(self.bloom.0),
            Item::uint(self.number),
            Item::uint(self.gas_limit),
            Item::uint(self.gas_used),
            Item::uint(self.time),
        ];
        items.extend(
            self.delegate_diff
                .iter()
                .map(|item| Item::bytes(item.encode())),
        );
        Item::List(items)
    }

    pub fn decode(data: &[u8]) -> Result<Self, RlpError> {
        Self::from_items(rlp::decode(data)?.as_list()?)
    }

    fn from_items(items: &[Item]) -> Result<Self, RlpError> {
        if items.len() < 10 {
            return Err(RlpError::Expected("header with 10 fixed fields"));
        }
        let fixed32 = |item: &Item| -> Result<Hash, RlpError> {
            let b = item.as_bytes()?;
            b.try_into().map_err(|_| RlpError::Expected("32 byte hash"))
        };
        let bloom_bytes = items[5].as_bytes()?;
        let bloom: [u8; 256] = bloom_bytes
            .try_into()
            .map_err(|_| RlpError::Expected("256 byte bloom"))?;
        let delegate_diff = items[10..]
            .iter()
            .map(|item| DelegateItem::decode(item.as_bytes()?))
            .collect::<Result<_, _>>()?;
        Ok(Header {
            parent_hash: fixed32(&items[0])?,
            signature: items[1].as_bytes()?.to_vec(),
            root: fixed32(&items[2])?,
            tx_hash: fixed32(&items[3])?,
            receipt_hash: fixed32(&items[4])?,
            bloom: Bloom(bloom),
            number: items[6].as_u64()?,
            gas_limit: items[7].as_u64()?,
            gas_used: items[8].as_u64()?,
            time: items[9].as_u64()?,
            delegate_diff,
        })
    }

    /// Guard against junk in unbounded fields.
    pub fn sanity_check(&self) -> Result<(), RlpError> {
        if self.signature.len() > 65 {
            return Err(RlpError::Expected("at most 65 signature bytes"));
        }
        if self.delegate_diff.len() > u8::MAX as usize {
            return Err(RlpError::Expected("at most 255 delegate diff items"));
        }
        Ok(())
    }
}

/// Root hash over a transaction list: keccak256 of the RLP list of each
/// transaction's canonical encoding.
pub fn derive_tx_root(txs: &[Transaction]) -> Hash {
    let items: Vec<Item> = txs.iter().map(|tx| Item::bytes(tx.encode())).collect();
    keccak256(&rlp::encode_list(&items))
}

/// Root hash over opaque receipt encodings, same shape as [`derive_tx_root`].
pub fn derive_receipt_root(receipts: &[Vec<u8>]) -> Hash {
    let items: Vec<Item> = receipts.iter().map(Item::bytes).collect();
    keccak256(&rlp::encode_list(&items))
}

/// An entire block: sealed header plus its transactions.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    header: Header,
    transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble a block. `tx_hash` is derived from `transactions`; the
    /// delegate diff, if given, replaces whatever the header carried.
    pub fn new(
        mut header: Header,
        transactions: Vec<Transaction>,
        delegate_diff: Option<DelegateDiff>,
    ) -> Self {
        if let Some(diff) = delegate_diff {
            header.delegate_diff = diff;
        }
        header.tx_hash = derive_tx_root(&transactions);
        Block {
            header,
            transactions,
        }
    }

    pub fn from_parts(header: Header, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
        }
    }

    /// Replace the header with its sealed version, keeping the body.
    pub fn with_seal(&self, header: Header) -> Block {
        Block {
            header,
            transactions: self.transactions.clone(),
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn time(&self) -> u64 {
        self.header.time
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn encode(&self) -> Vec<u8> {
        let tx_items: Vec<Item> = self.transactions.iter().map(|tx| tx.to_item()).collect();
        rlp::encode_list(&[self.header.to_item(), Item::List(tx_items)])
    }

    pub fn decode(data: &[u8]) -> Result<Self, RlpError> {
        let top = rlp::decode(data)?;
        let parts = top.as_list()?;
        if parts.len() != 2 {
            return Err(RlpError::Expected("block as [header, txs]"));
        }
        let header = Header::from_items(parts[0].as_list()?)?;
        let transactions = parts[1]
            .as_list()?
            .iter()
            .map(Transaction::from_item)
            .collect::<Result<_, _>>()?;
        Ok(Block {
            header,
            transactions,
        })
    }

}
