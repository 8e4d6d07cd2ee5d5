//! The delegated-proof-of-stake sealing engine.
//!
//! Producers take turns in wall-clock slots (`slot = time / period`, each
//! producer keeping the turn for `turn_block_count` slots). The schedule is
//! the delegate election run against the parent block's table snapshot, so
//! every node derives the same in-turn signer. Headers are sealed with a
//! recoverable secp256k1 signature over the seal preimage; authorship is
//! recovered, never declared, and cached for recent blocks.

pub mod election;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::block::{delegate_diff, Block, DelegateDiff, Header};
use crate::chain::ChainView;
use crate::config::ChainConfig;
use crate::crypto::{self, CryptoError, Keypair};
use crate::state::StateDb;
use crate::store::{Db, StoreError, Tables};
use crate::{constants, Address, Hash};

/// Consensus failure kinds.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("unknown block")]
    UnknownBlock,
    #[error("block in the future")]
    FutureBlock,
    #[error("unknown ancestor")]
    UnknownAncestor,
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("unauthorized signer")]
    Unauthorized,
    #[error("65 byte signature missing")]
    MissingSignature,
    #[error("invalid state header alignment")]
    InvalidStateHeaderAlignment,
    #[error("delegates updated at wrong block")]
    InvalidDelegateUpdateBlock,
    #[error("production aborted")]
    ProductionAborted,
    #[error("sealing paused, waiting for transactions")]
    WaitForTransactions,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("consensus failure: {0}")]
    Other(String),
}

impl From<CryptoError> for ConsensusError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::MissingSignature => ConsensusError::MissingSignature,
            _ => ConsensusError::Unauthorized,
        }
    }
}

impl From<crate::chain::ChainError> for ConsensusError {
    fn from(err: crate::chain::ChainError) -> Self {
        match err {
            crate::chain::ChainError::UnknownBlock => ConsensusError::UnknownBlock,
            crate::chain::ChainError::InvalidStateHeaderAlignment => {
                ConsensusError::InvalidStateHeaderAlignment
            }
            other => ConsensusError::Other(other.to_string()),
        }
    }
}

/// Wall clock in whole unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The DPoS consensus engine.
pub struct Dpos {
    config: ChainConfig,
    db: Db,
    /// Recovered authors of recent headers, keyed by header hash.
    signatures: Mutex<LruCache<Hash, Address>>,
    /// Sealing identity; single writer, brief reads while sealing.
    signer: RwLock<Option<Arc<Keypair>>>,
}

impl Dpos {
    pub fn new(config: ChainConfig, db: Db) -> Self {
        let capacity = NonZeroUsize::new(constants::SIGNATURE_CACHE_SIZE)
            .unwrap_or(NonZeroUsize::MIN);
        Dpos {
            config: config.normalized(),
            db,
            signatures: Mutex::new(LruCache::new(capacity)),
            signer: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Inject the sealing key.
    pub fn authorize(&self, keypair: Keypair) {
        tracing::info!(signer = %keypair.address(), "Sealing authorized");
        *self.signer.write() = Some(Arc::new(keypair));
    }

    /// The configured sealing address, if any.
    pub fn signer_address(&self) -> Option<Address> {
        self.signer.read().as_ref().map(|kp| kp.address())
    }

    /// Recover the address that sealed `header`, consulting the signature
    /// cache first.
    pub fn author(&self, header: &Header) -> Result<Address, ConsensusError> {
        let hash = header.hash();
        if let Some(address) = self.signatures.lock().get(&hash) {
            return Ok(*address);
        }
        if header.signature.len() < crypto::SIGNATURE_LENGTH {
            return Err(ConsensusError::MissingSignature);
        }
        let signer = crypto::recover_address(&header.seal_hash(), &header.signature)?;
        self.signatures.lock().put(hash, signer);
        Ok(signer)
    }

    /// Ancestry and timestamp checks against the chain (or the provided
    /// in-batch parents, most recent last).
    fn verify_header_against(
        &self,
        chain: &dyn ChainView,
        header: &Header,
        parents: &[Header],
    ) -> Result<(), ConsensusError> {
        if header.time > unix_now() {
            return Err(ConsensusError::FutureBlock);
        }
        if header.number == 0 {
            return Ok(());
        }

        let parent = match parents.last() {
            Some(parent) => Some(parent.clone()),
            None => chain.header_by_hash(&header.parent_hash),
        };
        let parent = match parent {
            Some(parent)
                if parent.number == header.number - 1
                    && parent.hash() == header.parent_hash =>
            {
                parent
            }
            _ => return Err(ConsensusError::UnknownAncestor),
        };
        if parent.time + self.config.period > header.time {
            return Err(ConsensusError::InvalidTimestamp);
        }
        Ok(())
    }

    pub fn verify_header(
        &self,
        chain: &dyn ChainView,
        header: &Header,
    ) -> Result<(), ConsensusError> {
        self.verify_header_against(chain, header, &[])
    }

    /// Verify a batch, each header checked against its in-batch parent.
    pub fn verify_headers(
        &self,
        chain: &dyn ChainView,
        headers: &[Header],
    ) -> Vec<Result<(), ConsensusError>> {
        headers
            .iter()
            .enumerate()
            .map(|(i, header)| self.verify_header_against(chain, header, &headers[..i]))
            .collect()
    }

    /// Verify the producer signature: the recovered author must be the
    /// in-turn signer of the header's slot, derived from the parent's table
    /// snapshot.
    pub fn verify_seal(
        &self,
        chain: &dyn ChainView,
        header: &Header,
    ) -> Result<(), ConsensusError> {
        if header.number == 0 {
            return Ok(());
        }
        let slot = header.time / self.config.period;

        let parent_header = chain
            .header_by_hash(&header.parent_hash)
            .ok_or(ConsensusError::UnknownAncestor)?;
        let snapshot = chain
            .state_at(&header.parent_hash, header.number - 1)
            .map_err(|e| ConsensusError::Other(format!("verify seal state: {e}")))?;
        let expected = self.signer_at_slot(&parent_header, &snapshot, slot);
        self.db.release(snapshot)?;

        let signer = self.author(header)?;
        if signer != expected {
            return Err(ConsensusError::Unauthorized);
        }
        Ok(())
    }

    /// Full block verification (ancestry plus seal).
    pub fn verify_block(
        &self,
        chain: &dyn ChainView,
        block: &Block,
    ) -> Result<(), ConsensusError> {
        self.verify_header(chain, block.header())?;
        self.verify_seal(chain, block.header())
    }

    /// The in-turn signer of `slot` under the delegate schedule derived
    /// from `parent`'s snapshot. Zero address when no schedule applies.
    pub fn signer_at_slot(&self, parent: &Header, tables: &Tables, slot: u64) -> Address {
        let delegates = election::get_delegates(
            parent,
            tables,
            self.config.delegate_count,
            self.config.bonus_delegate_count,
            self.config.turn_block_count,
        );

        if self.config.turn_block_count == 0 {
            tracing::warn!("Turn block count is zero; sealing won't match a signer");
        }
        if self.config.delegate_count == 0 || self.config.turn_block_count == 0 {
            return Address::zero();
        }

        let index = ((slot / self.config.turn_block_count) % self.config.delegate_count) as usize;
        delegates
            .get(index)
            .map(|witness| witness.id)
            .unwrap_or_else(Address::zero)
    }

    /// Wait for this node's next in-turn slot, then return the head block's
    /// header and a prepared child header for packing. Returns
    /// [`ConsensusError::ProductionAborted`] when `cancel` fires during the
    /// inter-slot sleep.
    pub async fn prepare(
        &self,
        chain: &dyn ChainView,
        cancel: &CancellationToken,
    ) -> Result<(Header, Header), ConsensusError> {
        let signer = self.signer_address().unwrap_or_else(Address::zero);

        loop {
            let head = chain.current_header();
            let head_slot = head.time / self.config.period;

            let now = unix_now();
            let slot = now / self.config.period;

            let head_hash = head.hash();
            let snapshot = chain
                .state_at(&head_hash, head.number)
                .map_err(|e| ConsensusError::Other(format!("prepare state: {e}")))?;
            let in_turn = self.signer_at_slot(&head, &snapshot, slot);
            self.db.release(snapshot)?;

            tracing::trace!(slot, %signer, turn_for = %in_turn, "Check turn");

            if slot > head_slot && signer == in_turn && !signer.is_zero() {
                let header = Header {
                    parent_hash: head_hash,
                    signature: vec![],
                    root: [0; 32],
                    tx_hash: [0; 32],
                    receipt_hash: [0; 32],
                    bloom: Default::default(),
                    number: head.number + 1,
                    gas_limit: 0,
                    gas_used: 0,
                    time: slot * self.config.period,
                    delegate_diff: vec![],
                };
                tracing::trace!(number = header.number, slot, "Will seal block");
                return Ok((head, header));
            }

            let next_slot_start = (slot + 1) * self.config.period;
            let wait = Duration::from_secs(next_slot_start.saturating_sub(now).max(1));
            tracing::trace!(?wait, "Sleeping until next slot");
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Woke to abort");
                    return Err(ConsensusError::ProductionAborted);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Credit the flat block reward to the coinbase.
    pub fn accumulate_rewards(&self, state: &mut StateDb, coinbase: Address) {
        state.add_balance(
            coinbase,
            primitive_types::U256::from(constants::BLOCK_REWARD_WEI),
        );
    }

    /// Post-transaction finalization: reward plus state root.
    pub fn finalize(&self, state: &mut StateDb, header: &mut Header, coinbase: Address) {
        self.accumulate_rewards(state, coinbase);
        header.root = state.root();
    }

    /// The delegate diff between the parent's schedule and the schedule
    /// derived from the post-execution tables.
    pub fn delegate_diff_for(
        &self,
        chain: &dyn ChainView,
        header: &Header,
        tables: &Tables,
    ) -> Result<DelegateDiff, ConsensusError> {
        let parent = chain
            .header_by_hash(&header.parent_hash)
            .ok_or(ConsensusError::UnknownBlock)?;
        let parent_snapshot = chain
            .state_at(&header.parent_hash, header.number - 1)
            .map_err(|e| ConsensusError::Other(format!("delegate diff state: {e}")))?;

        let old = election::get_delegates(
            &parent,
            &parent_snapshot,
            self.config.delegate_count,
            self.config.bonus_delegate_count,
            self.config.turn_block_count,
        );
        self.db.release(parent_snapshot)?;

        let new = election::get_delegates(
            header,
            tables,
            self.config.delegate_count,
            self.config.bonus_delegate_count,
            self.config.turn_block_count,
        );

        Ok(delegate_diff(
            &election::delegate_addresses(&old),
            &election::delegate_addresses(&new),
        ))
    }

    /// Verify that a received block's delegate diff matches the locally
    /// derived one.
    pub fn verify_delegate_diff(
        &self,
        chain: &dyn ChainView,
        header: &Header,
        tables: &Tables,
    ) -> Result<(), ConsensusError> {
        let expected = self.delegate_diff_for(chain, header, tables)?;
        if header.delegate_diff != expected {
            return Err(ConsensusError::InvalidDelegateUpdateBlock);
        }
        Ok(())
    }

    /// Finalize and assemble the sealed-ready block. An empty transaction
    /// list refuses to seal and asks the producer to wait.
    pub fn finalize_and_assemble(
        &self,
        chain: &dyn ChainView,
        mut header: Header,
        state: &mut StateDb,
        tables: &Tables,
        coinbase: Address,
        txs: Vec<crate::transaction::Transaction>,
        receipts: &[Vec<u8>],
    ) -> Result<Block, ConsensusError> {
        if txs.is_empty() {
            return Err(ConsensusError::WaitForTransactions);
        }

        self.finalize(state, &mut header, coinbase);
        header.receipt_hash = crate::block::derive_receipt_root(receipts);

        let diff = self.delegate_diff_for(chain, &header, tables)?;
        tracing::trace!(items = diff.len(), "Delegates diff");

        Ok(Block::new(header, txs, Some(diff)))
    }

    /// Seal a block with the authorized key.
    pub fn seal(&self, chain: &dyn ChainView, block: &Block) -> Result<Block, ConsensusError> {
        let mut header = block.header().clone();
        if header.number == 0 {
            return Err(ConsensusError::UnknownBlock);
        }

        let keypair = {
            let guard = self.signer.read();
            guard
                .clone()
                .ok_or_else(|| ConsensusError::Other("sealing without a signer key".into()))?
        };

        if chain.header_by_hash(&header.parent_hash).is_none() {
            return Err(ConsensusError::UnknownAncestor);
        }

        let signature = keypair.sign_hash(&header.seal_hash())?;
        header.signature = signature.to_vec();

        Ok(block.with_seal(header))
    }

    /// Count missed seconds (and broken/invalid blocks) in the lookback
    /// window ending at block `number`. A second without a block, a block
    /// whose seal fails, and a broken number/parent-hash link each count;
    /// a bad block can be counted twice, which is kept for compatibility.
    pub fn block_density(
        &self,
        chain: &dyn ChainView,
        number: u64,
        lookback: u64,
    ) -> Result<u64, ConsensusError> {
        let latest = chain.current_header().number;
        if number > latest {
            return Err(ConsensusError::FutureBlock);
        }
        let initial = chain
            .header_by_number(number)
            .ok_or(ConsensusError::UnknownBlock)?;

        // map block timestamps to headers, walking back `lookback` parents
        let mut by_time = std::collections::HashMap::new();
        by_time.insert(initial.time, initial.clone());
        let mut cursor = initial.clone();
        let mut collected = 1u64;
        while collected < lookback + 1 {
            let Some(parent) = chain.header_by_hash(&cursor.parent_hash) else {
                break;
            };
            by_time.insert(parent.time, parent.clone());
            cursor = parent;
            collected += 1;
        }

        let mut lookback_timestamp = initial.time.saturating_sub(lookback);
        if lookback > collected {
            lookback_timestamp = initial.time.saturating_sub(collected);
        }

        let mut missed = 0u64;
        let mut previous: Option<&Header> = None;
        let mut timestamp = initial.time;
        while timestamp >= lookback_timestamp {
            match by_time.get(&timestamp) {
                None => missed += 1,
                Some(header) => {
                    if self.verify_seal(chain, header).is_err() {
                        missed += 1;
                    }
                    if let Some(prev) = previous {
                        if prev.number != header.number + 1 || header.hash() != prev.parent_hash
                        {
                            missed += 1;
                        }
                    }
                    previous = Some(header);
                }
            }
            if timestamp == 0 {
                break;
            }
            timestamp -= 1;
        }

        Ok(missed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Bloom;

    fn engine() -> Dpos {
        Dpos::new(ChainConfig::default(), Db::new())
    }

    fn header_at(number: u64, time: u64) -> Header {
        Header {
            parent_hash: [0; 32],
            signature: vec![],
            root: [0; 32],
            tx_hash: [0; 32],
            receipt_hash: [0; 32],
            bloom: Bloom::zero(),
            number,
            gas_limit: 0,
            gas_used: 0,
            time,
            delegate_diff: vec![],
        }
    }

    #[test]
    fn author_roundtrip_and_cache() {
        let dpos = engine();
        let keypair = Keypair::from_secret(&[11u8; 32]).unwrap();
        let mut header = header_at(1, 100);
        header.signature = keypair.sign_hash(&header.seal_hash()).unwrap().to_vec();

        assert_eq!(dpos.author(&header).unwrap(), keypair.address());
        // second call is served from the cache
        assert_eq!(dpos.author(&header).unwrap(), keypair.address());
        assert_eq!(dpos.signatures.lock().len(), 1);
    }

    #[test]
    fn author_missing_signature() {
        let dpos = engine();
        let header = header_at(1, 100);
        assert_eq!(
            dpos.author(&header),
            Err(ConsensusError::MissingSignature)
        );
    }

    #[test]
    fn signer_rotation_over_slots() {
        // schedule arithmetic only: indexes advance every turn_block_count
        // slots and wrap at delegate_count
        let config = ChainConfig {
            delegate_count: 3,
            turn_block_count: 2,
            ..Default::default()
        };
        let turn = |slot: u64| ((slot / config.turn_block_count) % config.delegate_count) as usize;
        assert_eq!(turn(0), 0);
        assert_eq!(turn(1), 0);
        assert_eq!(turn(2), 1);
        assert_eq!(turn(5), 2);
        assert_eq!(turn(6), 0);
    }

    #[test]
    fn authorize_exposes_signer() {
        let dpos = engine();
        assert_eq!(dpos.signer_address(), None);
        let keypair = Keypair::from_secret(&[4u8; 32]).unwrap();
        let address = keypair.address();
        dpos.authorize(keypair);
        assert_eq!(dpos.signer_address(), Some(address));
    }
}
