//! HTTP control API.
//!
//! A small axum router over the chain manager and the sync engine. Blocks
//! are served in their JSON form, hashes in path segments are lowercase
//! hex. Mining runs on a blocking task so it cannot stall the runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pyrite_chain::{ChainError, ChainManager};
use pyrite_codec::{Block, Transaction, TxOutput};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::p2p::SyncEngine;

/// Amount a mined block's coinbase output mints.
const BLOCK_REWARD: u64 = 50;

#[derive(Clone)]
pub struct AppState {
    pub chain: Arc<ChainManager>,
    pub engine: Arc<SyncEngine>,
    pub wallet_address: String,
    pub wallet_public_key: String,
}

/// Maps request failures onto HTTP statuses.
pub enum ApiError {
    Chain(ChainError),
    /// The blocking mining task panicked or was cancelled.
    MiningTask,
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::Chain(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Chain(err) => {
                let status = match &err {
                    ChainError::NotFound(_) => StatusCode::NOT_FOUND,
                    ChainError::RaceLost => StatusCode::CONFLICT,
                    ChainError::MiningExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
            ApiError::MiningTask => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "mining task failed".to_string(),
            ),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %message, "request failed");
        }
        let body = Json(serde_json::json!({ "error": message }));
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct Status {
    height: usize,
    latest_hash: String,
    connected_peers: usize,
    known_addresses: usize,
    wallet_address: String,
}

#[derive(Serialize)]
struct PeerView {
    connected: Vec<String>,
    known: Vec<String>,
}

#[derive(Deserialize)]
struct AddPeerRequest {
    peer: String,
}

#[derive(Serialize)]
struct WalletView {
    address: String,
    public_key: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/blocks", get(blocks))
        .route("/blocks/latest", get(latest_block))
        .route("/blocks/{hash}", get(block_by_hash))
        .route("/mine", post(mine))
        .route("/peers", get(peers).post(add_peer))
        .route("/wallet", get(wallet))
        .with_state(state)
}

/// Runs the API until ctrl-c.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install ctrl-c handler");
    }
    info!("shutdown requested");
}

async fn status(State(state): State<AppState>) -> Result<Json<Status>, ApiError> {
    let latest = state.chain.latest_block()?;
    Ok(Json(Status {
        height: state.chain.height()?,
        latest_hash: hex::encode(latest.hash),
        connected_peers: state.engine.peer_count(),
        known_addresses: state.engine.known_addresses().len(),
        wallet_address: state.wallet_address.clone(),
    }))
}

async fn blocks(State(state): State<AppState>) -> Result<Json<Vec<Block>>, ApiError> {
    Ok(Json(state.chain.chain()?))
}

async fn latest_block(State(state): State<AppState>) -> Result<Json<Block>, ApiError> {
    Ok(Json(state.chain.latest_block()?))
}

async fn block_by_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Block>, ApiError> {
    let hash = parse_hash(&hash).ok_or_else(|| ChainError::NotFound(hash.clone()))?;
    Ok(Json(state.chain.block_by_hash(&hash)?))
}

/// Mines the next block: a coinbase paying this node's wallet followed by
/// whatever transactions the caller submitted.
async fn mine(
    State(state): State<AppState>,
    Json(submitted): Json<Vec<Transaction>>,
) -> Result<Json<Block>, ApiError> {
    let mut transactions = Vec::with_capacity(submitted.len() + 1);
    transactions.push(coinbase_paying(&state.wallet_address));
    transactions.extend(submitted);
    let chain = Arc::clone(&state.chain);
    let block = tokio::task::spawn_blocking(move || chain.generate_next_block(transactions))
        .await
        .map_err(|_| ApiError::MiningTask)??;
    Ok(Json(block))
}

fn coinbase_paying(address: &str) -> Transaction {
    Transaction {
        version: 1,
        inputs: Vec::new(),
        outputs: vec![TxOutput {
            amount: BLOCK_REWARD,
            lock_script: address.as_bytes().to_vec(),
        }],
        locktime: 0,
    }
}

async fn peers(State(state): State<AppState>) -> Json<PeerView> {
    Json(PeerView {
        connected: state.engine.peer_labels(),
        known: state.engine.known_addresses(),
    })
}

async fn add_peer(
    State(state): State<AppState>,
    Json(req): Json<AddPeerRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    state.engine.connect(req.peer.clone());
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "peer": req.peer })),
    )
}

async fn wallet(State(state): State<AppState>) -> Json<WalletView> {
    Json(WalletView {
        address: state.wallet_address.clone(),
        public_key: state.wallet_public_key.clone(),
    })
}

fn parse_hash(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    let mut hash = [0u8; 32];
    if bytes.len() != hash.len() {
        return None;
    }
    hash.copy_from_slice(&bytes);
    Some(hash)
}
