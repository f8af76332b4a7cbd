//! REST/JSON administration API
//!
//! Read-only views over the chain and wallet, a transaction-submit
//! operation, and the mining context. Runs on its own port, one hyper
//! connection task per client.
//!
//! Routes:
//!
//! - `GET  /ping`
//! - `GET  /blockchain/transaction?txId=<hex>`
//! - `GET  /blockchain/miningContext`  /  `POST /blockchain/miningContext`
//! - `GET  /wallet/info` · `GET /wallet/addresses` · `GET /wallet/newAddress`
//! - `GET  /wallet/unspent?address=<base58>`
//! - `POST /wallet/sendFrom`

use crate::consensus::transaction::Unlock;
use crate::network::Network;
use crate::node::engine::MiningContext;
use crate::node::mempool::Mempool;
use crate::storage::Storage;
use crate::types::{Hash160, Hash256};
use crate::wallet::DiskWallet;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Maximum accepted request body.
const MAX_REQUEST_SIZE: usize = 1_048_576;

/// Shared state the handlers read from.
pub struct RpcContext {
    pub storage: Arc<Storage>,
    pub mempool: Arc<Mempool>,
    pub network: Arc<Network>,
    pub wallet: Arc<DiskWallet>,
    pub mining: Arc<Mutex<MiningContext>>,
}

#[derive(Serialize)]
struct TxInDto {
    #[serde(rename = "prevTxId")]
    prev_txid: String,
    vout: u32,
    #[serde(rename = "scriptSig")]
    script_sig: String,
}

#[derive(Serialize)]
struct TxOutDto {
    address: String,
    amount: u32,
}

#[derive(Serialize)]
struct TransactionDto {
    #[serde(rename = "txId")]
    txid: String,
    inputs: Vec<TxInDto>,
    outputs: Vec<TxOutDto>,
}

#[derive(Serialize, Deserialize)]
struct MiningContextDto {
    #[serde(rename = "minerAddress", default)]
    miner_address: String,
    #[serde(rename = "prevHash", default)]
    prev_hash: String,
}

#[derive(Deserialize)]
struct SendFromForm {
    from: String,
    to: String,
    amount: u32,
    fee: u32,
}

pub struct RpcServer {
    port: u16,
    ctx: Arc<RpcContext>,
}

impl RpcServer {
    pub fn new(port: u16, ctx: RpcContext) -> Self {
        RpcServer {
            port,
            ctx: Arc::new(ctx),
        }
    }

    /// Accept loop; one task per connection.
    pub async fn run(self) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot bind rpc server to {}", addr))?;
        info!(addr = addr.as_str(), "rpc server started");

        loop {
            let (stream, remote) = listener.accept().await?;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service =
                    service_fn(move |req| handle_request(req, Arc::clone(&ctx)));
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(peer = %remote, "rpc connection ended: {}", e);
                }
            });
        }
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "error": message.to_string() }))
}

fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<RpcContext>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let body = req.collect().await?.to_bytes();
    if body.len() > MAX_REQUEST_SIZE {
        return Ok(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "request body too large",
        ));
    }

    let response = match (method.as_str(), uri.path()) {
        ("GET", "/ping") => json_response(StatusCode::OK, &json!({ "message": "pong" })),
        ("GET", "/blockchain/transaction") => get_transaction(&ctx, &uri),
        ("GET", "/blockchain/miningContext") => get_mining_context(&ctx),
        ("POST", "/blockchain/miningContext") => set_mining_context(&ctx, &body),
        ("GET", "/wallet/info") => wallet_info(&ctx),
        ("GET", "/wallet/addresses") => wallet_addresses(&ctx),
        ("GET", "/wallet/newAddress") => wallet_new_address(&ctx),
        ("GET", "/wallet/unspent") => wallet_unspent(&ctx, &uri),
        ("POST", "/wallet/sendFrom") => send_from(&ctx, &body).await,
        _ => error_response(StatusCode::NOT_FOUND, "no such route"),
    };
    Ok(response)
}

fn get_transaction(ctx: &RpcContext, uri: &Uri) -> Response<Full<Bytes>> {
    let params = query_params(uri);
    let txid: Hash256 = match params.get("txId").map(|s| s.parse()) {
        Some(Ok(txid)) => txid,
        _ => return error_response(StatusCode::BAD_REQUEST, "missing or invalid txId"),
    };

    let record = match ctx.storage.index.tx_record(&txid) {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "transaction not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let tx = match ctx.storage.transaction_at(&record) {
        Ok(tx) => tx,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    let inputs = tx
        .ins
        .iter()
        .map(|input| {
            let raw = match &input.unlock {
                Unlock::Coinbase(data) => data.clone(),
                Unlock::Script(script) => crate::codec::tx::encode_script_sig(script),
            };
            TxInDto {
                prev_txid: input.prev_txid.to_string(),
                vout: input.vout,
                script_sig: hex::encode(raw),
            }
        })
        .collect();
    let outputs = tx
        .outs
        .iter()
        .map(|out| TxOutDto {
            address: out.pubkey_hash.to_string(),
            amount: out.value,
        })
        .collect();

    let dto = TransactionDto {
        txid: tx.hash().to_string(),
        inputs,
        outputs,
    };
    json_response(
        StatusCode::OK,
        &serde_json::to_value(&dto).unwrap_or_default(),
    )
}

fn get_mining_context(ctx: &RpcContext) -> Response<Full<Bytes>> {
    let mining = ctx.mining.lock().expect("mining context lock poisoned");
    let dto = MiningContextDto {
        miner_address: mining.address.to_string(),
        prev_hash: mining.prev_hash.to_string(),
    };
    json_response(
        StatusCode::OK,
        &serde_json::to_value(&dto).unwrap_or_default(),
    )
}

fn set_mining_context(ctx: &RpcContext, body: &[u8]) -> Response<Full<Bytes>> {
    let form: MiningContextDto = match serde_json::from_slice(body) {
        Ok(form) => form,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    if let Err(e) = apply_mining_context(ctx, &form) {
        return error_response(StatusCode::BAD_REQUEST, e);
    }
    json_response(StatusCode::OK, &json!({ "status": "ok" }))
}

fn apply_mining_context(ctx: &RpcContext, form: &MiningContextDto) -> Result<()> {
    let mut address = None;
    let mut parent = None;

    if !form.miner_address.is_empty() {
        address = Some(
            form.miner_address
                .parse::<Hash160>()
                .map_err(|e| anyhow!("invalid minerAddress: {}", e))?,
        );
    }
    if !form.prev_hash.is_empty() {
        let hash = form
            .prev_hash
            .parse::<Hash256>()
            .map_err(|e| anyhow!("invalid prevHash: {}", e))?;
        let record = ctx
            .storage
            .index
            .block_record(&hash)?
            .ok_or_else(|| anyhow!("prevHash {} is not an indexed block", hash))?;
        parent = Some((hash, record.height));
    }

    let mut mining = ctx.mining.lock().expect("mining context lock poisoned");
    if let Some(address) = address {
        mining.address = address;
        info!(address = %mining.address, "mining context: miner address set");
    }
    if let Some((hash, height)) = parent {
        mining.prev_hash = hash;
        mining.prev_height = height;
        info!(prev = %hash, height, "mining context: parent overridden");
    }
    mining.cancel.cancel();
    mining.cancel = tokio_util::sync::CancellationToken::new();
    Ok(())
}

fn wallet_info(ctx: &RpcContext) -> Response<Full<Bytes>> {
    match ctx.wallet.balances() {
        Ok(balances) => {
            let info: HashMap<String, u32> = balances
                .into_iter()
                .map(|(addr, balance)| (addr.to_string(), balance))
                .collect();
            json_response(
                StatusCode::OK,
                &serde_json::to_value(&info).unwrap_or_default(),
            )
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

fn wallet_addresses(ctx: &RpcContext) -> Response<Full<Bytes>> {
    match ctx.wallet.list_addresses() {
        Ok(addresses) => {
            let list: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
            json_response(
                StatusCode::OK,
                &serde_json::to_value(&list).unwrap_or_default(),
            )
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

fn wallet_new_address(ctx: &RpcContext) -> Response<Full<Bytes>> {
    match ctx.wallet.new_address() {
        Ok(address) => json_response(StatusCode::OK, &json!({ "address": address.to_string() })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

fn wallet_unspent(ctx: &RpcContext, uri: &Uri) -> Response<Full<Bytes>> {
    let params = query_params(uri);
    let address: Hash160 = match params.get("address").map(|s| s.parse()) {
        Some(Ok(address)) => address,
        _ => return error_response(StatusCode::BAD_REQUEST, "missing or invalid address"),
    };

    match ctx.wallet.list_unspent(&address) {
        Ok(utxos) => {
            let list: Vec<serde_json::Value> = utxos
                .iter()
                .map(|u| {
                    json!({
                        "txId": u.txid.to_string(),
                        "vout": u.vout,
                        "amount": u.value,
                    })
                })
                .collect();
            json_response(
                StatusCode::OK,
                &serde_json::to_value(&list).unwrap_or_default(),
            )
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Builds a wallet transaction, admits it to the mempool, and gossips it.
async fn send_from(ctx: &RpcContext, body: &[u8]) -> Response<Full<Bytes>> {
    let form: SendFromForm = match serde_json::from_slice(body) {
        Ok(form) => form,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let from: Hash160 = match form.from.parse() {
        Ok(addr) => addr,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid from: {}", e)),
    };
    let to: Hash160 = match form.to.parse() {
        Ok(addr) => addr,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid to: {}", e)),
    };

    let tx = match ctx
        .wallet
        .create_transaction(&from, &to, form.amount, form.fee)
    {
        Ok(tx) => tx,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let txid = tx.hash();

    if let Err(e) = ctx.mempool.accept(tx.clone(), &ctx.storage.chain) {
        error!(%txid, "submitted transaction rejected: {}", e);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }

    let network = Arc::clone(&ctx.network);
    tokio::spawn(async move {
        network.broadcast_tx(&tx, None).await;
    });

    json_response(StatusCode::OK, &json!({ "txId": txid.to_string() }))
}
