//! The JSON-RPC surface: `eth`, `net`, `web3`, `debug` and `nogo`
//! namespaces over a single HTTP POST endpoint, JSON-RPC 2.0 envelopes
//! throughout.
//!
//! When a JWT secret is configured, non-loopback clients must present a
//! valid HS256 bearer token (`Authorization: Bearer <token>`, claims
//! `{iat, exp}`); loopback clients are exempt, matching the operator
//! workflow of issuing tokens from the node host itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use ethereum_types::{H256, U256};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::chain::Chain;
use crate::consensus::{block_reward, to_target};
use crate::crypto::{jwt, keccak256, Address};
use crate::errors::ChainResult;
use crate::p2p::P2pServer;
use crate::params;
use crate::state::WorldState;
use crate::stratum::WorkProvider;
use crate::sync::Synchronizer;
use crate::txpool::TxPool;
use crate::types::{Block, Transaction};

pub const CLIENT_VERSION: &str = concat!("nogochain/v", env!("CARGO_PKG_VERSION"));

/// Default lifetime of issued tokens.
pub const TOKEN_TTL_SECS: u64 = 365 * 24 * 3600;

pub struct RpcContext {
    pub chain: Arc<Chain>,
    pub state: Arc<Mutex<WorldState>>,
    pub pool: Arc<TxPool>,
    pub sync: Arc<Synchronizer>,
    pub p2p: Option<Arc<P2pServer>>,
    pub work: Option<Arc<dyn WorkProvider>>,
    pub jwt_secret: Option<String>,
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("the method {method} does not exist/is not available"),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32000,
            message: message.into(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Issue a bearer token against the configured secret.
pub fn issue_token(secret: &str) -> ChainResult<String> {
    jwt::issue(secret.as_bytes(), unix_now(), TOKEN_TTL_SECS)
}

/// Serve JSON-RPC until shutdown flips.
pub async fn serve(
    ctx: Arc<RpcContext>,
    listener: tokio::net::TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> ChainResult<()> {
    info!(addr = %listener.local_addr()?, "rpc server started");
    let app = Router::new().route("/", post(handle)).with_state(ctx);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;
    info!("rpc server stopped");
    Ok(())
}

async fn handle(
    State(ctx): State<Arc<RpcContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    if let Some(secret) = &ctx.jwt_secret {
        if !addr.ip().is_loopback() && !authorized(secret, &headers) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return Ok(Json(error_envelope(id, -32600, "invalid request")));
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    debug!(method, "rpc call");
    match dispatch(&ctx, method, &params) {
        Ok(result) => Ok(Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))),
        Err(error) => Ok(Json(error_envelope(id, error.code, &error.message))),
    }
}

fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn authorized(secret: &str, headers: &HeaderMap) -> bool {
    let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return false;
    };
    jwt::verify(secret.as_bytes(), token, unix_now()).is_ok()
}

fn dispatch(ctx: &RpcContext, method: &str, params: &Value) -> Result<Value, RpcError> {
    match method {
        // eth namespace.
        "eth_chainId" => Ok(hex_u64(params::CHAIN_ID)),
        "eth_blockNumber" => Ok(hex_u64(ctx.chain.head_number())),
        "eth_getBalance" => {
            let address = address_param(params, 0)?;
            let balance = ctx.state.lock().get_balance(address);
            Ok(hex_u256(balance))
        }
        "eth_getTransactionCount" => {
            let address = address_param(params, 0)?;
            let nonce = ctx.state.lock().get_nonce(address);
            Ok(hex_u64(nonce))
        }
        "eth_getCode" => {
            let address = address_param(params, 0)?;
            let code = ctx.state.lock().get_code(address);
            Ok(Value::String(format!("0x{}", hex::encode(code))))
        }
        "eth_gasPrice" => Ok(hex_u64(params::MIN_GAS_PRICE)),
        "eth_getBlockByNumber" => {
            let number = block_number_param(ctx, params, 0)?;
            Ok(ctx
                .chain
                .get_by_number(number)
                .map(|block| block_to_json(ctx, &block))
                .unwrap_or(Value::Null))
        }
        "eth_getBlockByHash" => {
            let hash = h256_param(params, 0)?;
            Ok(ctx
                .chain
                .get_by_hash(hash)
                .map(|block| block_to_json(ctx, &block))
                .unwrap_or(Value::Null))
        }
        "eth_sendRawTransaction" | "eth_sendTransaction" => {
            let tx: Transaction = serde_json::from_value(
                params
                    .get(0)
                    .cloned()
                    .ok_or_else(|| RpcError::invalid_params("missing transaction"))?,
            )
            .map_err(|err| RpcError::invalid_params(format!("bad transaction: {err}")))?;
            ctx.pool
                .validate(&tx)
                .map_err(|err| RpcError::invalid_params(err.to_string()))?;
            let hash = ctx.pool.add(tx.clone());
            if let Some(p2p) = &ctx.p2p {
                p2p.broadcast_transaction(tx);
            }
            Ok(Value::String(format!("{hash:#x}")))
        }
        "eth_getTransactionByHash" => {
            let hash = h256_param(params, 0)?;
            Ok(ctx
                .pool
                .get(hash)
                .map(|tx| serde_json::to_value(tx).unwrap_or(Value::Null))
                .unwrap_or(Value::Null))
        }
        "eth_syncing" => {
            let status = ctx.sync.status();
            if status.highest_block > status.current_block {
                Ok(json!({
                    "startingBlock": hex_u64(status.starting_block),
                    "currentBlock": hex_u64(status.current_block),
                    "highestBlock": hex_u64(status.highest_block),
                    "pulledStates": hex_u64(status.pulled_states),
                    "knownStates": hex_u64(status.known_states),
                }))
            } else {
                Ok(Value::Bool(false))
            }
        }
        method if method.starts_with("eth_") => Err(RpcError::method_not_found(method)),

        // net namespace.
        "net_version" => Ok(Value::String(params::CHAIN_ID.to_string())),
        "net_peerCount" => Ok(hex_u64(
            ctx.p2p
                .as_ref()
                .map(|p2p| p2p.peer_count() as u64)
                .unwrap_or(0),
        )),
        "net_listening" => Ok(Value::Bool(ctx.p2p.is_some())),

        // web3 namespace.
        "web3_clientVersion" => Ok(Value::String(CLIENT_VERSION.to_string())),
        "web3_sha3" => {
            let input = params
                .get(0)
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::invalid_params("missing data"))?;
            let bytes = hex::decode(input.trim_start_matches("0x"))
                .map_err(|err| RpcError::invalid_params(format!("bad hex: {err}")))?;
            Ok(Value::String(format!("{:#x}", keccak256(&bytes))))
        }

        // debug namespace.
        "debug_getStateRoot" => Ok(Value::String(format!("{:#x}", ctx.state.lock().state_root()))),
        "debug_getSnapshotCount" => Ok(hex_u64(ctx.state.lock().snapshot_count() as u64)),

        // nogo namespace.
        "nogo_getChainInfo" => {
            let difficulty = ctx.chain.current_head().difficulty();
            Ok(json!({
                "chainId": params::CHAIN_ID,
                "symbol": params::SYMBOL,
                "decimals": params::DECIMALS,
                "consensus": "NogoPow",
                "difficulty": hex_u256(difficulty),
            }))
        }
        "nogo_getDifficulty" => Ok(hex_u256(ctx.chain.current_head().difficulty())),
        "nogo_getReward" => Ok(hex_u256(block_reward(ctx.chain.head_number() + 1))),
        "nogo_getMiningInfo" => {
            let head = ctx.chain.current_head();
            Ok(json!({
                "difficulty": hex_u256(head.difficulty()),
                "height": hex_u64(head.number()),
                "target": hex_u256(to_target(head.difficulty())),
                "miner": format!("{:#x}", head.header.coinbase),
            }))
        }
        "nogo_getWork" => {
            let provider = ctx
                .work
                .as_ref()
                .ok_or_else(|| RpcError::internal("mining is not enabled"))?;
            let template = provider
                .get_work()
                .map_err(|err| RpcError::internal(err.to_string()))?;
            let sealed = template.header.pow_bytes();
            Ok(json!([
                format!("0x{}", hex::encode(&sealed)),
                format!("0x{}", hex::encode(crate::crypto::sha256(&sealed))),
                hex_u256(to_target(template.difficulty())),
            ]))
        }
        "nogo_submitWork" => {
            let provider = ctx
                .work
                .as_ref()
                .ok_or_else(|| RpcError::internal("mining is not enabled"))?;
            let block: Block = serde_json::from_value(
                params
                    .get(0)
                    .cloned()
                    .ok_or_else(|| RpcError::invalid_params("missing block"))?,
            )
            .map_err(|err| RpcError::invalid_params(format!("bad block: {err}")))?;
            match provider.submit_work(block) {
                Ok(()) => Ok(Value::Bool(true)),
                Err(_) => Ok(Value::Bool(false)),
            }
        }

        other => Err(RpcError::method_not_found(other)),
    }
}

fn hex_u64(value: u64) -> Value {
    Value::String(format!("{value:#x}"))
}

fn hex_u256(value: U256) -> Value {
    Value::String(format!("{value:#x}"))
}

fn address_param(params: &Value, index: usize) -> Result<Address, RpcError> {
    let text = params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params("missing address"))?;
    let bytes = hex::decode(text.trim_start_matches("0x"))
        .map_err(|err| RpcError::invalid_params(format!("bad address: {err}")))?;
    if bytes.len() != 20 {
        return Err(RpcError::invalid_params("address must be 20 bytes"));
    }
    Ok(Address::from_slice(&bytes))
}

fn h256_param(params: &Value, index: usize) -> Result<H256, RpcError> {
    let text = params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params("missing hash"))?;
    let bytes = hex::decode(text.trim_start_matches("0x"))
        .map_err(|err| RpcError::invalid_params(format!("bad hash: {err}")))?;
    if bytes.len() != 32 {
        return Err(RpcError::invalid_params("hash must be 32 bytes"));
    }
    Ok(H256::from_slice(&bytes))
}

fn block_number_param(ctx: &RpcContext, params: &Value, index: usize) -> Result<u64, RpcError> {
    let text = params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params("missing block number"))?;
    match text {
        "latest" | "pending" => Ok(ctx.chain.head_number()),
        "earliest" => Ok(0),
        hex => u64::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|err| RpcError::invalid_params(format!("bad block number: {err}"))),
    }
}

fn block_to_json(ctx: &RpcContext, block: &Block) -> Value {
    json!({
        "hash": format!("{:#x}", block.hash()),
        "totalDifficulty": ctx
            .chain
            .total_difficulty(block.hash())
            .map(hex_u256)
            .unwrap_or(Value::Null),
        "header": block.header,
        "transactions": block.transactions,
        "uncles": block.uncles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::PowCache;
    use crate::sync::{NullFetcher, SyncMode};
    use crate::validator::Validator;

    fn context() -> RpcContext {
        let chain = Arc::new(Chain::new(None));
        let state = Arc::new(Mutex::new(WorldState::new()));
        let sync = Arc::new(Synchronizer::new(
            chain.clone(),
            state.clone(),
            Validator::default(),
            Arc::new(PowCache::new()),
            Arc::new(NullFetcher),
            SyncMode::Full,
        ));
        RpcContext {
            chain,
            state,
            pool: Arc::new(TxPool::new()),
            sync,
            p2p: None,
            work: None,
            jwt_secret: None,
        }
    }

    #[test]
    fn chain_info_reports_the_reference_parameters() {
        let ctx = context();
        let info = dispatch(&ctx, "nogo_getChainInfo", &Value::Null).expect("info");
        assert_eq!(info["chainId"], 318);
        assert_eq!(info["symbol"], "NOGO");
        assert_eq!(info["decimals"], 18);
        assert_eq!(info["consensus"], "NogoPow");
        assert!(info["difficulty"].as_str().expect("hex").starts_with("0x"));
    }

    #[test]
    fn eth_basics_answer_from_the_chain() {
        let ctx = context();
        assert_eq!(
            dispatch(&ctx, "eth_chainId", &Value::Null).expect("id"),
            json!("0x13e")
        );
        assert_eq!(
            dispatch(&ctx, "eth_blockNumber", &Value::Null).expect("number"),
            json!("0x0")
        );
        let block = dispatch(&ctx, "eth_getBlockByNumber", &json!(["latest"])).expect("block");
        assert_eq!(block["header"]["number"], 0);
    }

    #[test]
    fn balances_read_through_the_state() {
        let ctx = context();
        let address = Address::repeat_byte(0x11);
        ctx.state.lock().add_balance(address, U256::from(1234u64));
        let result = dispatch(
            &ctx,
            "eth_getBalance",
            &json!([format!("{address:#x}"), "latest"]),
        )
        .expect("balance");
        assert_eq!(result, json!("0x4d2"));
    }

    #[test]
    fn transactions_enter_the_pool() {
        let ctx = context();
        let tx = Transaction::transfer(
            0,
            U256::one(),
            21_000,
            Address::repeat_byte(0x22),
            U256::from(5u64),
            Vec::new(),
        );
        let result = dispatch(
            &ctx,
            "eth_sendRawTransaction",
            &json!([serde_json::to_value(&tx).expect("encode")]),
        )
        .expect("send");
        assert_eq!(result, json!(format!("{:#x}", tx.hash())));
        assert_eq!(ctx.pool.size(), 1);
    }

    #[test]
    fn unknown_methods_return_not_found() {
        let ctx = context();
        let error = dispatch(&ctx, "eth_call", &Value::Null).expect_err("stubbed");
        assert_eq!(error.code, -32601);
        let error = dispatch(&ctx, "foo_bar", &Value::Null).expect_err("unknown");
        assert_eq!(error.code, -32601);
    }

    #[test]
    fn web3_sha3_hashes_hex_input() {
        let ctx = context();
        let result = dispatch(&ctx, "web3_sha3", &json!(["0x"])).expect("hash");
        assert_eq!(
            result,
            json!("0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
        );
    }

    #[test]
    fn tokens_gate_remote_clients() {
        let secret = "pool-secret";
        let token = issue_token(secret).expect("issue");
        let mut headers = HeaderMap::new();
        assert!(!authorized(secret, &headers));
        headers.insert(
            "authorization",
            format!("Bearer {token}").parse().expect("header"),
        );
        assert!(authorized(secret, &headers));
        assert!(!authorized("other-secret", &headers));
    }
}
