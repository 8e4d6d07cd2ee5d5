//! Transaction pool and virtual-difficulty ordering.
//!
//! The pool groups pending transactions per sender in nonce order. When the
//! producer packs a block it takes a read-only view of the pool and builds a
//! [`TxsByVirtualDifficultyAndNonce`]: per-sender queues behind a max-heap
//! keyed by each sender's *current head* transaction, ordered by virtual
//! difficulty. Emission therefore interleaves senders by priority while
//! never reordering one sender's nonces.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::contracts::virtual_capacity;
use crate::store::Tables;
use crate::transaction::Transaction;
use crate::{constants, Address};

/// Errors from pool admission.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum MempoolError {
    #[error("transaction already pending")]
    Duplicate,
    #[error("replacement transaction has no more work than the pending one")]
    ReplaceUnderpriced,
    #[error("transaction work {difficulty} below minimum {minimum}")]
    InsufficientWork { difficulty: f64, minimum: f64 },
    #[error("sender recovery failed")]
    InvalidSender,
}

/// Pending transactions, grouped per sender and ordered by nonce.
#[derive(Default)]
pub struct TxPool {
    chain_id: u64,
    pending: HashMap<Address, BTreeMap<u64, Transaction>>,
    count: usize,
}

impl TxPool {
    pub fn new(chain_id: u64) -> Self {
        TxPool {
            chain_id,
            pending: HashMap::new(),
            count: 0,
        }
    }

    /// Admit a transaction: the work nonce must reach the minimum target
    /// difficulty, the signature must recover, and an already-pending
    /// `(sender, nonce)` slot is only replaced by strictly more work.
    pub fn insert(&mut self, tx: Transaction) -> Result<Address, MempoolError> {
        let difficulty = tx.difficulty();
        if difficulty < constants::MINIMUM_TARGET_DIFFICULTY {
            return Err(MempoolError::InsufficientWork {
                difficulty,
                minimum: constants::MINIMUM_TARGET_DIFFICULTY,
            });
        }
        let sender = tx
            .sender(self.chain_id)
            .map_err(|_| MempoolError::InvalidSender)?;

        let slots = self.pending.entry(sender).or_default();
        match slots.get(&tx.account_nonce) {
            Some(existing) if existing.hash() == tx.hash() => {
                return Err(MempoolError::Duplicate)
            }
            Some(existing) if existing.difficulty() >= difficulty => {
                return Err(MempoolError::ReplaceUnderpriced)
            }
            Some(_) => {
                slots.insert(tx.account_nonce, tx);
            }
            None => {
                slots.insert(tx.account_nonce, tx);
                self.count += 1;
            }
        }
        Ok(sender)
    }

    /// Drop every pending transaction of `sender` with a nonce below
    /// `nonce` (mined or stale).
    pub fn prune_below(&mut self, sender: &Address, nonce: u64) {
        if let Some(slots) = self.pending.get_mut(sender) {
            let keep = slots.split_off(&nonce);
            self.count -= slots.len();
            *slots = keep;
            if slots.is_empty() {
                self.pending.remove(sender);
            }
        }
    }

    /// Snapshot of the pending set: per sender, transactions in ascending
    /// nonce order.
    pub fn pending(&self) -> HashMap<Address, Vec<Transaction>> {
        self.pending
            .iter()
            .filter(|(_, slots)| !slots.is_empty())
            .map(|(sender, slots)| (*sender, slots.values().cloned().collect()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// A sender's current head transaction in the priority heap.
struct HeadEntry {
    virtual_difficulty: f64,
    sender: Address,
    nonce: u64,
    tx: Transaction,
}

impl PartialEq for HeadEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeadEntry {}

impl PartialOrd for HeadEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // max-heap on virtual difficulty; ties broken by sender then nonce
        // so emission order stays deterministic
        self.virtual_difficulty
            .total_cmp(&other.virtual_difficulty)
            .then_with(|| other.sender.cmp(&self.sender))
            .then_with(|| other.nonce.cmp(&self.nonce))
    }
}

/// The block packer's transaction stream: highest virtual difficulty across
/// senders first, strict nonce order within a sender.
pub struct TxsByVirtualDifficultyAndNonce<'a> {
    txs: HashMap<Address, VecDeque<Transaction>>,
    heads: std::collections::BinaryHeap<HeadEntry>,
    tables: &'a Tables,
}

impl<'a> TxsByVirtualDifficultyAndNonce<'a> {
    /// Build the stream from a pending snapshot and the table snapshot used
    /// for capacity lookups. Entries whose recovered sender differs from
    /// their grouping key are dropped.
    pub fn new(
        chain_id: u64,
        pending: HashMap<Address, Vec<Transaction>>,
        tables: &'a Tables,
    ) -> Self {
        let mut txs = HashMap::new();
        let mut heads = std::collections::BinaryHeap::with_capacity(pending.len());

        for (from, list) in pending {
            let mut queue: VecDeque<Transaction> = list.into();
            let Some(head) = queue.pop_front() else {
                continue;
            };
            match head.sender(chain_id) {
                Ok(sender) if sender == from => {
                    let entry = Self::entry(tables, sender, head);
                    if entry.virtual_difficulty < constants::MINIMUM_VIRTUAL_DIFFICULTY {
                        tracing::debug!(%sender, "Dropping head below minimum virtual difficulty");
                        continue;
                    }
                    heads.push(entry);
                    txs.insert(sender, queue);
                }
                _ => {
                    tracing::warn!(claimed = %from, "Dropping pending entry with bad sender");
                }
            }
        }

        TxsByVirtualDifficultyAndNonce { txs, heads, tables }
    }

    fn entry(tables: &Tables, sender: Address, tx: Transaction) -> HeadEntry {
        let capacity = virtual_capacity(sender, tables);
        let virtual_difficulty = capacity * tx.gas_price();
        HeadEntry {
            virtual_difficulty,
            sender,
            nonce: tx.account_nonce,
            tx,
        }
    }

    /// The highest-priority transaction, without consuming it.
    pub fn peek(&self) -> Option<&Transaction> {
        self.heads.peek().map(|entry| &entry.tx)
    }

    /// Sender of the current head.
    pub fn peek_sender(&self) -> Option<Address> {
        self.heads.peek().map(|entry| entry.sender)
    }

    /// Consume the head and promote the same sender's next-nonce
    /// transaction into the heap.
    pub fn shift(&mut self) {
        let Some(entry) = self.heads.pop() else {
            return;
        };
        if let Some(queue) = self.txs.get_mut(&entry.sender) {
            if let Some(next) = queue.pop_front() {
                let promoted = Self::entry(self.tables, entry.sender, next);
                self.heads.push(promoted);
                return;
            }
            self.txs.remove(&entry.sender);
        }
    }

    /// Consume the head and discard the rest of its sender's queue (used
    /// when the head's failure invalidates its successors).
    pub fn pop(&mut self) {
        if let Some(entry) = self.heads.pop() {
            self.txs.remove(&entry.sender);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}
