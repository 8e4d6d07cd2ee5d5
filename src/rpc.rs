//! JSON HTTP RPC API.
//!
//! Exposes the `dpos` namespace (delegates, per-delegate lookup, block
//! density), transaction submission and basic chain inspection. Binds to
//! localhost by default; deployments exposing it to a network should add an
//! authentication layer in front of the router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::chain::{Chain, ChainView};
use crate::consensus::election;
use crate::consensus::Dpos;
use crate::contracts::{witnesses_table, Witness};
use crate::mempool::TxPool;
use crate::store::Where;
use crate::transaction::Transaction;
use crate::Address;

/// Shared RPC state.
#[derive(Clone)]
pub struct RpcState {
    pub chain: Arc<Chain>,
    pub engine: Arc<Dpos>,
    pub pool: Arc<RwLock<TxPool>>,
}

/// Build the RPC router.
pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/tx", post(submit_tx))
        .route("/head", get(get_head))
        .route("/mempool", get(get_mempool))
        .route("/dpos/delegates/{number}", get(get_delegates))
        .route("/dpos/delegate/{address}/{number}", get(get_delegate))
        .route("/dpos/density/{number}", get(get_block_density))
        .with_state(state)
}

/// Start the RPC server.
pub async fn serve(
    addr: SocketAddr,
    state: RpcState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("RPC server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

type RpcError = (StatusCode, String);

fn bad_request(message: impl Into<String>) -> RpcError {
    (StatusCode::BAD_REQUEST, message.into())
}

fn not_found(message: impl Into<String>) -> RpcError {
    (StatusCode::NOT_FOUND, message.into())
}

/// Resolve `"latest"` or a decimal block number against the chain head.
fn resolve_number(state: &RpcState, number: &str) -> Result<u64, RpcError> {
    if number == "latest" {
        return Ok(state.chain.current_header().number);
    }
    number
        .parse::<u64>()
        .map_err(|_| bad_request(format!("bad block number: {number}")))
}

// ── POST /tx ──

#[derive(Deserialize)]
struct SubmitTxRequest {
    /// Hex-encoded canonical transaction.
    tx_hex: String,
}

#[derive(Serialize)]
struct SubmitTxResponse {
    hash: String,
}

async fn submit_tx(
    State(state): State<RpcState>,
    Json(request): Json<SubmitTxRequest>,
) -> Result<Json<SubmitTxResponse>, RpcError> {
    let raw = request.tx_hex.strip_prefix("0x").unwrap_or(&request.tx_hex);
    let bytes = hex::decode(raw).map_err(|e| bad_request(format!("invalid hex: {e}")))?;
    let tx = Transaction::decode(&bytes)
        .map_err(|e| bad_request(format!("invalid transaction: {e}")))?;
    let hash = tx.hash();

    state
        .pool
        .write()
        .insert(tx)
        .map_err(|e| bad_request(format!("rejected: {e}")))?;

    Ok(Json(SubmitTxResponse {
        hash: crate::hash_hex(&hash),
    }))
}

// ── GET /head ──

#[derive(Serialize)]
struct HeadResponse {
    number: u64,
    hash: String,
    time: u64,
    gas_limit: u64,
    gas_used: u64,
}

async fn get_head(State(state): State<RpcState>) -> Json<HeadResponse> {
    let head = state.chain.current_header();
    Json(HeadResponse {
        number: head.number,
        hash: crate::hash_hex(&head.hash()),
        time: head.time,
        gas_limit: head.gas_limit,
        gas_used: head.gas_used,
    })
}

// ── GET /mempool ──

#[derive(Serialize)]
struct MempoolResponse {
    pending: usize,
}

async fn get_mempool(State(state): State<RpcState>) -> Json<MempoolResponse> {
    Json(MempoolResponse {
        pending: state.pool.read().len(),
    })
}

// ── GET /dpos/delegates/{number} ──

#[derive(Serialize)]
struct DelegateEntry {
    address: String,
    stake: u64,
}

async fn get_delegates(
    State(state): State<RpcState>,
    Path(number): Path<String>,
) -> Result<Json<Vec<DelegateEntry>>, RpcError> {
    let number = resolve_number(&state, &number)?;
    let header = state
        .chain
        .header_by_number(number)
        .ok_or_else(|| not_found("block in the future"))?;

    let snapshot = state
        .chain
        .state_at(&header.hash(), number)
        .map_err(|e| bad_request(e.to_string()))?;
    let config = state.engine.config();
    let delegates = election::get_delegates(
        &header,
        &snapshot,
        config.delegate_count,
        config.bonus_delegate_count,
        config.turn_block_count,
    );
    let response = delegates
        .iter()
        .map(|witness| DelegateEntry {
            address: witness.id.to_hex(),
            stake: witness.stake,
        })
        .collect();
    state
        .chain
        .db()
        .release(snapshot)
        .map_err(|e| bad_request(e.to_string()))?;

    Ok(Json(response))
}

// ── GET /dpos/delegate/{address}/{number} ──

#[derive(Serialize)]
struct DelegateInfo {
    address: String,
    stake: u64,
    elected: bool,
}

async fn get_delegate(
    State(state): State<RpcState>,
    Path((address, number)): Path<(String, String)>,
) -> Result<Json<DelegateInfo>, RpcError> {
    let address =
        Address::from_hex(&address).map_err(|e| bad_request(format!("bad address: {e}")))?;
    let number = resolve_number(&state, &number)?;
    let header = state
        .chain
        .header_by_number(number)
        .ok_or_else(|| not_found("block in the future"))?;

    let snapshot = state
        .chain
        .state_at(&header.hash(), number)
        .map_err(|e| bad_request(e.to_string()))?;
    let lookup: Result<Option<Witness>, _> =
        snapshot.query_one(&witnesses_table(), Some(Where::IdPrefix(address.as_bytes())));
    state
        .chain
        .db()
        .release(snapshot)
        .map_err(|e| bad_request(e.to_string()))?;

    let witness = lookup
        .map_err(|e| bad_request(e.to_string()))?
        .ok_or_else(|| not_found("Address is not a delegate"))?;
    Ok(Json(DelegateInfo {
        address: witness.id.to_hex(),
        stake: witness.stake,
        elected: witness.elect_enabled(),
    }))
}

// ── GET /dpos/density/{number}?lookback=N ──

#[derive(Deserialize)]
struct DensityQuery {
    #[serde(default = "default_lookback")]
    lookback: u64,
}

fn default_lookback() -> u64 {
    60
}

#[derive(Serialize)]
struct DensityResponse {
    total_missed_blocks: u64,
}

async fn get_block_density(
    State(state): State<RpcState>,
    Path(number): Path<String>,
    Query(query): Query<DensityQuery>,
) -> Result<Json<DensityResponse>, RpcError> {
    let number = resolve_number(&state, &number)?;
    let missed = state
        .engine
        .block_density(&*state.chain, number, query.lookback)
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(DensityResponse {
        total_missed_blocks: missed,
    }))
}
