//! The block producer loop.
//!
//! Drives the sealing engine: wait for the in-turn slot, fork a working
//! snapshot from the head, drain the mempool ordering under a wall-clock
//! and gas budget, finalize (reward, roots, delegate diff), sign and write
//! the block. The same execution path imports remotely produced blocks, and
//! a speculative precache variant replays a block against a disposable fork
//! to warm caches, bailing out on an atomic interrupt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::block::Block;
use crate::chain::{Chain, ChainView};
use crate::consensus::{ConsensusError, Dpos};
use crate::contracts::db::IteratorRegistry;
use crate::executor::{apply_transaction, ExecConfig, ExecError, GasPool, Receipt};
use crate::mempool::{TxPool, TxsByVirtualDifficultyAndNonce};
use crate::transaction::Transaction;
use crate::{constants, Address};

/// Minimum gas limit a produced block may carry.
const MIN_GAS_LIMIT: u64 = 5_000;

/// Derive the child gas limit from the parent's, moving toward the
/// floor/ceil target by at most 1/1024 per block.
pub fn calc_gas_limit(parent_gas_limit: u64, parent_gas_used: u64, floor: u64, ceil: u64) -> u64 {
    let contrib = (parent_gas_used + parent_gas_used / 2) / 1024;
    let decay = parent_gas_limit / 1024;

    let mut limit = (parent_gas_limit + contrib).saturating_sub(decay);
    if limit < floor {
        limit = (parent_gas_limit + decay).min(floor);
    } else if limit > ceil {
        limit = (parent_gas_limit.saturating_sub(decay)).max(ceil);
    }
    limit.max(MIN_GAS_LIMIT)
}

/// The producer: owns the working snapshot for the block being packed.
pub struct Producer {
    engine: Arc<Dpos>,
    chain: Arc<Chain>,
    pool: Arc<RwLock<TxPool>>,
    exec_config: ExecConfig,
    gas_floor: u64,
    gas_ceil: u64,
    sealed: tokio::sync::mpsc::UnboundedSender<Block>,
}

impl Producer {
    pub fn new(
        engine: Arc<Dpos>,
        chain: Arc<Chain>,
        pool: Arc<RwLock<TxPool>>,
        gas_floor: u64,
        gas_ceil: u64,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<Block>) {
        let (sealed, sealed_rx) = tokio::sync::mpsc::unbounded_channel();
        let exec_config = ExecConfig {
            chain_id: engine.config().chain_id,
            replay_protection: true,
        };
        (
            Producer {
                engine,
                chain,
                pool,
                exec_config,
                gas_floor,
                gas_ceil,
                sealed,
            },
            sealed_rx,
        )
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Block producer starting");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.commit_new_work(&cancel).await {
                Ok(block) => {
                    tracing::info!(
                        number = block.number(),
                        txs = block.transactions().len(),
                        hash = %crate::hash_hex(&block.hash()),
                        "Successfully sealed new block"
                    );
                }
                Err(ConsensusError::ProductionAborted) => break,
                Err(ConsensusError::WaitForTransactions) => {
                    tracing::trace!("Sealing paused, waiting for transactions");
                    self.sleep_to_next_slot(&cancel).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to produce block");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    }
                }
            }
        }
        tracing::info!("Block producer terminating");
    }

    async fn sleep_to_next_slot(&self, cancel: &CancellationToken) {
        let period = self.engine.config().period;
        let now = crate::consensus::unix_now();
        let next = (now / period + 1) * period;
        let wait = Duration::from_secs(next.saturating_sub(now).max(1));
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// One full production cycle: prepare, pack, finalize, seal, write.
    pub async fn commit_new_work(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Block, ConsensusError> {
        let (head, mut header) = self.engine.prepare(&*self.chain, cancel).await?;
        header.gas_limit =
            calc_gas_limit(head.gas_limit, head.gas_used, self.gas_floor, self.gas_ceil);

        let coinbase = self
            .engine
            .signer_address()
            .ok_or_else(|| ConsensusError::Other("producing without a signer".into()))?;

        let head_hash = head.hash();
        let mut state = self.chain.account_state_at(&head_hash)?;
        let parent_snapshot = self.chain.state_at(&head_hash, head.number)?;
        let mut working = parent_snapshot.fork_mut();
        let mut iterators = IteratorRegistry::default();

        let pending = self.pool.read().pending();
        let mut stream =
            TxsByVirtualDifficultyAndNonce::new(self.exec_config.chain_id, pending, &parent_snapshot);

        let mut gas_pool = GasPool::new(header.gas_limit);
        let mut included: Vec<Transaction> = Vec::new();
        let mut receipts: Vec<Receipt> = Vec::new();

        let started = Instant::now();
        loop {
            if started.elapsed() > Duration::from_millis(constants::PACKING_BUDGET_MS) {
                tracing::trace!("Not enough time for further transactions");
                break;
            }
            if gas_pool.gas() < constants::TX_GAS {
                tracing::trace!(have = gas_pool.gas(), "Not enough gas for further transactions");
                break;
            }
            let Some(tx) = stream.peek().cloned() else {
                break;
            };
            let sender = stream.peek_sender().unwrap_or_else(Address::zero);

            match apply_transaction(
                &self.exec_config,
                &header,
                &mut gas_pool,
                &mut state,
                &mut working,
                &mut iterators,
                &tx,
            ) {
                Ok(receipt) => {
                    header.gas_used += receipt.gas_used;
                    included.push(tx);
                    receipts.push(receipt);
                    stream.shift();
                }
                Err(ExecError::GasLimitReached) => {
                    tracing::trace!(%sender, "Gas limit exceeded for current block");
                    stream.pop();
                }
                Err(ExecError::NonceTooLow) => {
                    tracing::trace!(%sender, nonce = tx.account_nonce, "Skipping transaction with low nonce");
                    stream.shift();
                }
                Err(ExecError::NonceTooHigh) => {
                    tracing::trace!(%sender, nonce = tx.account_nonce, "Skipping account with high nonce");
                    stream.pop();
                }
                Err(ExecError::ReplayProtectionViolation) => {
                    tracing::trace!(%sender, "Ignoring replay protected transaction");
                    stream.pop();
                }
                Err(e) => {
                    tracing::debug!(hash = %crate::hash_hex(&tx.hash()), error = %e, "Transaction failed, skipped");
                    stream.shift();
                }
            }
        }

        drop(stream);
        self.chain.db().release(parent_snapshot)?;

        let receipt_bytes: Vec<Vec<u8>> = receipts.iter().map(|r| r.encode()).collect();
        let block = self.engine.finalize_and_assemble(
            &*self.chain,
            header,
            &mut state,
            &working,
            coinbase,
            included,
            &receipt_bytes,
        )?;

        let sealed = self.engine.seal(&*self.chain, &block)?;

        let snapshot_id = self.chain.db().commit(&working);
        self.chain.write_block(&sealed, snapshot_id, &state)?;

        // drop mined nonces from the pool
        {
            let mut pool = self.pool.write();
            for tx in sealed.transactions() {
                if let Ok(sender) = tx.sender(self.exec_config.chain_id) {
                    pool.prune_below(&sender, tx.account_nonce + 1);
                }
            }
        }

        let _ = self.sealed.send(sealed.clone());
        Ok(sealed)
    }
}

/// Import a sealed block produced elsewhere: verify ancestry, seal and
/// delegate diff, re-execute its transactions, and append it.
pub fn import_block(
    engine: &Dpos,
    chain: &Chain,
    block: &Block,
) -> Result<(), ConsensusError> {
    block
        .header()
        .sanity_check()
        .map_err(|e| ConsensusError::Other(e.to_string()))?;
    engine.verify_header(chain, block.header())?;
    engine.verify_seal(chain, block.header())?;

    let parent_hash = block.parent_hash();
    let mut state = chain.account_state_at(&parent_hash)?;
    let parent_snapshot = chain.state_at(&parent_hash, block.number() - 1)?;
    let mut working = parent_snapshot.fork_mut();
    chain.db().release(parent_snapshot)?;
    let mut iterators = IteratorRegistry::default();

    let exec_config = ExecConfig {
        chain_id: engine.config().chain_id,
        replay_protection: true,
    };
    let mut gas_pool = GasPool::new(block.header().gas_limit);

    for tx in block.transactions() {
        apply_transaction(
            &exec_config,
            block.header(),
            &mut gas_pool,
            &mut state,
            &mut working,
            &mut iterators,
            tx,
        )
        .map_err(|e| ConsensusError::Other(format!("block transaction failed: {e}")))?;
    }

    let coinbase = engine.author(block.header())?;
    engine.accumulate_rewards(&mut state, coinbase);
    if state.root() != block.header().root {
        return Err(ConsensusError::Other("state root mismatch".into()));
    }
    engine.verify_delegate_diff(chain, block.header(), &working)?;

    let snapshot_id = chain.db().commit(&working);
    chain.write_block(block, snapshot_id, &state)?;
    Ok(())
}

/// Replay every stored block above the current head through the import
/// path. Run after opening an existing chain: the snapshot registry is
/// process-local, so table snapshots and account states are rebuilt by
/// re-execution. Returns the resulting head number.
pub fn replay_chain(engine: &Dpos, chain: &Chain) -> Result<u64, ConsensusError> {
    let mut replayed = 0u64;
    loop {
        let next = chain.current_header().number + 1;
        let Some(block) = chain.block_by_number(next) else {
            break;
        };
        import_block(engine, chain, &block)?;
        replayed += 1;
    }
    if replayed > 0 {
        tracing::info!(blocks = replayed, head = chain.current_header().number, "Replayed chain");
    }
    Ok(chain.current_header().number)
}

/// Speculatively replay a block's transactions against a disposable fork to
/// warm caches. Polls `interrupt` between transactions and gives up early.
pub fn precache_block(
    engine: &Dpos,
    chain: &Chain,
    block: &Block,
    interrupt: &AtomicBool,
) -> Result<usize, ConsensusError> {
    let parent_hash = block.parent_hash();
    let mut state = chain.account_state_at(&parent_hash)?;
    let parent_snapshot = chain.state_at(&parent_hash, block.number().saturating_sub(1))?;
    let mut working = parent_snapshot.fork_mut();
    chain.db().release(parent_snapshot)?;
    let mut iterators = IteratorRegistry::default();

    let exec_config = ExecConfig {
        chain_id: engine.config().chain_id,
        replay_protection: true,
    };
    let mut gas_pool = GasPool::new(block.header().gas_limit);

    let mut warmed = 0usize;
    for tx in block.transactions() {
        if interrupt.load(Ordering::Relaxed) {
            break;
        }
        // results are discarded; failures here are not an import verdict
        let _ = apply_transaction(
            &exec_config,
            block.header(),
            &mut gas_pool,
            &mut state,
            &mut working,
            &mut iterators,
            tx,
        );
        warmed += 1;
    }
    Ok(warmed)
}
