//! Chain store and the view the consensus engine consumes.
//!
//! The engine never reaches back into a concrete blockchain type; it sees a
//! [`ChainView`]: headers by number/hash, the current head, and the table
//! snapshot recorded for a block. Blocks persist RLP-encoded behind a
//! [`BlockStore`] (sled on disk, a map in tests), together with the
//! canonical number index and the block-hash → snapshot-id mapping.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::block::{Block, Header};
use crate::state::StateDb;
use crate::store::{Db, Snapshot, SnapshotId, StoreError};
use crate::Hash;

/// Errors from chain storage and lookup.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("chain storage I/O error: {0}")]
    Io(String),
    #[error("chain codec error: {0}")]
    Codec(String),
    #[error("unknown block")]
    UnknownBlock,
    #[error("invalid state header alignment")]
    InvalidStateHeaderAlignment,
    #[error("no snapshot recorded for block")]
    MissingSnapshot,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read access to the chain, as the consensus engine sees it.
pub trait ChainView: Send + Sync {
    fn current_header(&self) -> Header;
    fn header_by_number(&self, number: u64) -> Option<Header>;
    fn header_by_hash(&self, hash: &Hash) -> Option<Header>;
    /// Lease the table snapshot recorded for `(hash, number)`.
    fn state_at(&self, hash: &Hash, number: u64) -> Result<Snapshot, ChainError>;
}

/// Persistent block storage backend.
pub trait BlockStore: Send + Sync {
    fn put_block(&self, block: &Block) -> Result<(), ChainError>;
    fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, ChainError>;
    fn put_canonical(&self, number: u64, hash: &Hash) -> Result<(), ChainError>;
    fn canonical_hash(&self, number: u64) -> Result<Option<Hash>, ChainError>;
    fn put_head(&self, hash: &Hash) -> Result<(), ChainError>;
    fn head_hash(&self) -> Result<Option<Hash>, ChainError>;
    fn put_snapshot_id(&self, hash: &Hash, id: SnapshotId) -> Result<(), ChainError>;
    fn snapshot_id(&self, hash: &Hash) -> Result<Option<SnapshotId>, ChainError>;
    fn put_account_state(&self, hash: &Hash, bytes: &[u8]) -> Result<(), ChainError>;
    fn account_state(&self, hash: &Hash) -> Result<Option<Vec<u8>>, ChainError>;
    fn flush(&self) -> Result<(), ChainError>;
}

const HEAD_KEY: &[u8] = b"head_hash";

fn encode_state(state: &StateDb) -> Result<Vec<u8>, ChainError> {
    bincode::serialize(state).map_err(|e| ChainError::Codec(e.to_string()))
}

/// Sled-backed block store.
pub struct SledBlockStore {
    db: sled::Db,
    blocks: sled::Tree,
    canonical: sled::Tree,
    snapshots: sled::Tree,
    states: sled::Tree,
    meta: sled::Tree,
}

impl SledBlockStore {
    pub fn open(path: &Path) -> Result<Self, ChainError> {
        let db = sled::open(path).map_err(io)?;
        Ok(SledBlockStore {
            blocks: db.open_tree("blocks").map_err(io)?,
            canonical: db.open_tree("canonical").map_err(io)?,
            snapshots: db.open_tree("snapshots").map_err(io)?,
            states: db.open_tree("states").map_err(io)?,
            meta: db.open_tree("meta").map_err(io)?,
            db,
        })
    }
}

fn io(e: sled::Error) -> ChainError {
    ChainError::Io(e.to_string())
}

impl BlockStore for SledBlockStore {
    fn put_block(&self, block: &Block) -> Result<(), ChainError> {
        self.blocks
            .insert(block.hash(), block.encode())
            .map_err(io)?;
        Ok(())
    }

    fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        match self.blocks.get(hash).map_err(io)? {
            Some(bytes) => Ok(Some(
                Block::decode(&bytes).map_err(|e| ChainError::Codec(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn put_canonical(&self, number: u64, hash: &Hash) -> Result<(), ChainError> {
        self.canonical
            .insert(number.to_be_bytes(), hash.as_slice())
            .map_err(io)?;
        Ok(())
    }

    fn canonical_hash(&self, number: u64) -> Result<Option<Hash>, ChainError> {
        Ok(self
            .canonical
            .get(number.to_be_bytes())
            .map_err(io)?
            .and_then(|bytes| bytes.as_ref().try_into().ok()))
    }

    fn put_head(&self, hash: &Hash) -> Result<(), ChainError> {
        self.meta.insert(HEAD_KEY, hash.as_slice()).map_err(io)?;
        Ok(())
    }

    fn head_hash(&self) -> Result<Option<Hash>, ChainError> {
        Ok(self
            .meta
            .get(HEAD_KEY)
            .map_err(io)?
            .and_then(|bytes| bytes.as_ref().try_into().ok()))
    }

    fn put_snapshot_id(&self, hash: &Hash, id: SnapshotId) -> Result<(), ChainError> {
        self.snapshots
            .insert(hash, &id.to_be_bytes())
            .map_err(io)?;
        Ok(())
    }

    fn snapshot_id(&self, hash: &Hash) -> Result<Option<SnapshotId>, ChainError> {
        Ok(self
            .snapshots
            .get(hash)
            .map_err(io)?
            .and_then(|bytes| bytes.as_ref().try_into().ok().map(u64::from_be_bytes)))
    }

    fn put_account_state(&self, hash: &Hash, bytes: &[u8]) -> Result<(), ChainError> {
        self.states.insert(hash, bytes).map_err(io)?;
        Ok(())
    }

    fn account_state(&self, hash: &Hash) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.states.get(hash).map_err(io)?.map(|b| b.to_vec()))
    }

    fn flush(&self) -> Result<(), ChainError> {
        self.db.flush().map_err(io)?;
        Ok(())
    }
}

/// In-memory block store for tests and tools.
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    blocks: HashMap<Hash, Vec<u8>>,
    canonical: HashMap<u64, Hash>,
    snapshots: HashMap<Hash, SnapshotId>,
    states: HashMap<Hash, Vec<u8>>,
    head: Option<Hash>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        MemoryBlockStore::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn put_block(&self, block: &Block) -> Result<(), ChainError> {
        self.inner
            .lock()
            .blocks
            .insert(block.hash(), block.encode());
        Ok(())
    }

    fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        match self.inner.lock().blocks.get(hash) {
            Some(bytes) => Ok(Some(
                Block::decode(bytes).map_err(|e| ChainError::Codec(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn put_canonical(&self, number: u64, hash: &Hash) -> Result<(), ChainError> {
        self.inner.lock().canonical.insert(number, *hash);
        Ok(())
    }

    fn canonical_hash(&self, number: u64) -> Result<Option<Hash>, ChainError> {
        Ok(self.inner.lock().canonical.get(&number).copied())
    }

    fn put_head(&self, hash: &Hash) -> Result<(), ChainError> {
        self.inner.lock().head = Some(*hash);
        Ok(())
    }

    fn head_hash(&self) -> Result<Option<Hash>, ChainError> {
        Ok(self.inner.lock().head)
    }

    fn put_snapshot_id(&self, hash: &Hash, id: SnapshotId) -> Result<(), ChainError> {
        self.inner.lock().snapshots.insert(*hash, id);
        Ok(())
    }

    fn snapshot_id(&self, hash: &Hash) -> Result<Option<SnapshotId>, ChainError> {
        Ok(self.inner.lock().snapshots.get(hash).copied())
    }

    fn put_account_state(&self, hash: &Hash, bytes: &[u8]) -> Result<(), ChainError> {
        self.inner.lock().states.insert(*hash, bytes.to_vec());
        Ok(())
    }

    fn account_state(&self, hash: &Hash) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.inner.lock().states.get(hash).cloned())
    }

    fn flush(&self) -> Result<(), ChainError> {
        Ok(())
    }
}

/// The canonical chain: a head pointer over a [`BlockStore`], plus the
/// snapshot registry. Writes are serialized by the single chain writer;
/// readers go through [`ChainView`].
pub struct Chain {
    store: Arc<dyn BlockStore>,
    db: Db,
    head: RwLock<Header>,
}

impl Chain {
    /// Open the chain, inserting `genesis` (with its committed snapshot id
    /// and account state) when the store is empty.
    ///
    /// The snapshot registry is process-local, so an existing chain always
    /// opens at genesis too: stored blocks are replayed through the import
    /// path (see `producer::replay_chain`), which recommits every snapshot
    /// and refreshes the id mapping.
    pub fn open(
        store: Arc<dyn BlockStore>,
        db: Db,
        genesis: &Block,
        genesis_snapshot: SnapshotId,
        genesis_state: &StateDb,
    ) -> Result<Self, ChainError> {
        match store.head_hash()? {
            Some(hash) => {
                // sanity: the stored chain must be rooted in this genesis
                if store.block_by_hash(&genesis.hash())?.is_none() {
                    return Err(ChainError::UnknownBlock);
                }
                tracing::info!(
                    head = %crate::hash_hex(&hash),
                    "Existing chain found, replay required"
                );
                store.put_snapshot_id(&genesis.hash(), genesis_snapshot)?;
            }
            None => {
                store.put_block(genesis)?;
                store.put_canonical(0, &genesis.hash())?;
                store.put_snapshot_id(&genesis.hash(), genesis_snapshot)?;
                store.put_account_state(&genesis.hash(), &encode_state(genesis_state)?)?;
                store.put_head(&genesis.hash())?;
                store.flush()?;
                tracing::info!(hash = %crate::hash_hex(&genesis.hash()), "Wrote genesis block");
            }
        }
        Ok(Chain {
            store,
            db,
            head: RwLock::new(genesis.header().clone()),
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Append a block extending the current head, recording its committed
    /// snapshot id and resulting account state.
    pub fn write_block(
        &self,
        block: &Block,
        snapshot: SnapshotId,
        state: &StateDb,
    ) -> Result<(), ChainError> {
        let mut head = self.head.write();
        if block.number() != head.number + 1 || block.parent_hash() != head.hash() {
            return Err(ChainError::InvalidStateHeaderAlignment);
        }
        self.store.put_block(block)?;
        self.store.put_canonical(block.number(), &block.hash())?;
        self.store.put_snapshot_id(&block.hash(), snapshot)?;
        self.store
            .put_account_state(&block.hash(), &encode_state(state)?)?;
        self.store.put_head(&block.hash())?;
        self.store.flush()?;
        *head = block.header().clone();
        Ok(())
    }

    /// The account state as of block `hash`.
    pub fn account_state_at(&self, hash: &Hash) -> Result<StateDb, ChainError> {
        let bytes = self
            .store
            .account_state(hash)?
            .ok_or(ChainError::UnknownBlock)?;
        bincode::deserialize(&bytes).map_err(|e| ChainError::Codec(e.to_string()))
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.store.block_by_hash(hash).ok().flatten()
    }

    pub fn block_by_number(&self, number: u64) -> Option<Block> {
        let hash = self.store.canonical_hash(number).ok().flatten()?;
        self.block_by_hash(&hash)
    }

    /// Snapshot id recorded for a block hash.
    pub fn snapshot_id(&self, hash: &Hash) -> Result<SnapshotId, ChainError> {
        self.store
            .snapshot_id(hash)?
            .ok_or(ChainError::MissingSnapshot)
    }
}

impl ChainView for Chain {
    fn current_header(&self) -> Header {
        self.head.read().clone()
    }

    fn header_by_number(&self, number: u64) -> Option<Header> {
        self.block_by_number(number).map(|b| b.header().clone())
    }

    fn header_by_hash(&self, hash: &Hash) -> Option<Header> {
        self.block_by_hash(hash).map(|b| b.header().clone())
    }

    fn state_at(&self, hash: &Hash, _number: u64) -> Result<Snapshot, ChainError> {
        let id = self.snapshot_id(hash)?;
        Ok(self.db.snapshot(id)?)
    }
}
