//! Meridian node binary.
//!
//! Runs a full node: chain store, DPoS sealing engine, mempool, block
//! producer and the JSON RPC API. A node without a signer key follows the
//! chain and serves RPC only.
//!
//! Usage:
//!   meridian                             # run a node
//!   meridian --signer-key <hex>          # run a sealing node
//!   meridian --data-dir ./chain --rpc-port 8545

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use meridian::chain::{Chain, SledBlockStore};
use meridian::config::MeridianConfig;
use meridian::consensus::Dpos;
use meridian::crypto::Keypair;
use meridian::genesis::Genesis;
use meridian::mempool::TxPool;
use meridian::producer::{replay_chain, Producer};
use meridian::rpc::{self, RpcState};
use meridian::store::Db;
use meridian::Address;

/// Meridian delegated-proof-of-stake node.
#[derive(Parser, Debug)]
#[command(name = "meridian", version, about = "Meridian DPoS blockchain node")]
struct Cli {
    /// Data directory for persistent storage.
    #[arg(long, default_value = "./meridian-data")]
    data_dir: PathBuf,

    /// RPC host to bind.
    #[arg(long)]
    rpc_host: Option<String>,

    /// RPC port to bind.
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Producer signing key (hex). Without it the node does not seal.
    #[arg(long)]
    signer_key: Option<String>,

    /// Genesis producer address for a fresh dev chain (defaults to the
    /// signer's address, or zero).
    #[arg(long)]
    genesis_producer: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = MeridianConfig::load(&cli.data_dir);
    if let Some(host) = cli.rpc_host {
        config.node.rpc_host = host;
    }
    if let Some(port) = cli.rpc_port {
        config.node.rpc_port = port;
    }
    if let Some(key) = cli.signer_key {
        config.node.signer_key = Some(key);
    }

    let signer = match &config.node.signer_key {
        Some(key) => Some(Keypair::from_secret_hex(key)?),
        None => None,
    };

    let genesis_producer = match (&cli.genesis_producer, &signer) {
        (Some(hex), _) => Address::from_hex(hex)?,
        (None, Some(keypair)) => keypair.address(),
        (None, None) => Address::zero(),
    };

    std::fs::create_dir_all(&cli.data_dir)?;
    let db = Db::new();
    let genesis = Genesis::dev(genesis_producer);
    let (genesis_block, genesis_snapshot, genesis_state) = genesis.build(&db)?;

    let block_store = Arc::new(SledBlockStore::open(&cli.data_dir.join("chain"))?);
    let chain = Arc::new(Chain::open(
        block_store,
        db,
        &genesis_block,
        genesis_snapshot,
        &genesis_state,
    )?);

    let engine = Arc::new(Dpos::new(config.chain.clone(), chain.db().clone()));
    let pool = Arc::new(RwLock::new(TxPool::new(config.chain.chain_id)));

    let head = replay_chain(&engine, &chain)?;

    let rpc_addr = config.node.rpc_addr()?;
    tracing::info!(
        rpc = %rpc_addr,
        data = %cli.data_dir.display(),
        head,
        "Starting Meridian node"
    );

    let cancel = CancellationToken::new();

    if let Some(keypair) = signer {
        engine.authorize(keypair);
        let (producer, mut sealed_rx) = Producer::new(
            engine.clone(),
            chain.clone(),
            pool.clone(),
            config.node.gas_floor,
            config.node.gas_ceil,
        );
        let producer_cancel = cancel.clone();
        tokio::spawn(async move { producer.run(producer_cancel).await });
        tokio::spawn(async move {
            while let Some(block) = sealed_rx.recv().await {
                tracing::debug!(number = block.number(), "Sealed block observed");
            }
        });
    } else {
        tracing::info!("No signer key; running as a follower");
    }

    let rpc_state = RpcState {
        chain: chain.clone(),
        engine: engine.clone(),
        pool: pool.clone(),
    };
    let rpc_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = rpc::serve(rpc_addr, rpc_state).await {
            tracing::error!(error = %e, "RPC server failed");
            rpc_cancel.cancel();
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down...");
    cancel.cancel();

    Ok(())
}
