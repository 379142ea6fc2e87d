//! Typed JSON-RPC client wrappers for the chains the backend submits to.
//!
//! One client per chain id, shared through a registry behind an RW-lock.
//! Each client carries the network's ordered endpoint list; a transport
//! failure rotates the active endpoint so the next probe dials the
//! fallback.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::types::ChainIdMap;

/// Default deadline for RPC reads.
const RPC_READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Receipt fetches get a longer deadline.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Minimal receipt view: everything the pollers key on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    /// Status byte of the receipt; `false` is an on-chain revert.
    pub success: bool,
}

/// The RPC surface the workers consume, behind a trait so queue and
/// probe logic is testable without a network.
pub trait ChainRpc: Send + Sync + 'static {
    fn network_id(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn block_number(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn balance_at(&self, addr: Address) -> impl Future<Output = Result<U256, RpcError>> + Send;

    fn pending_nonce_at(&self, addr: Address)
        -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn suggest_gas_price(&self) -> impl Future<Output = Result<u128, RpcError>> + Send;

    fn send_raw_transaction(
        &self,
        raw: Vec<u8>,
    ) -> impl Future<Output = Result<B256, RpcError>> + Send;

    fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<TxReceipt>, RpcError>> + Send;

    /// Whether the chain knows the transaction at all (mempool or mined).
    fn transaction_known(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<bool, RpcError>> + Send;
}

pub struct ChainClient {
    /// SLIP-44 id the backend files this client under.
    pub chain_id: u32,
    pub evm_chain_id: u64,
    endpoints: Vec<String>,
    active: AtomicUsize,
    http: reqwest::Client,
}

impl ChainClient {
    pub fn new(chain_id: u32, evm_chain_id: u64, endpoints: Vec<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(RPC_READ_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            chain_id,
            evm_chain_id,
            endpoints,
            active: AtomicUsize::new(0),
            http,
        }
    }

    fn endpoint(&self) -> &str {
        let idx = self.active.load(Ordering::Relaxed) % self.endpoints.len().max(1);
        &self.endpoints[idx]
    }

    /// A failed primary falls back to the next configured endpoint for the
    /// following probe.
    fn rotate_endpoint(&self) {
        if self.endpoints.len() > 1 {
            let next = (self.active.load(Ordering::Relaxed) + 1) % self.endpoints.len();
            self.active.store(next, Ordering::Relaxed);
            warn!(
                chain_id = self.chain_id,
                endpoint = %self.endpoints[next],
                "rotated to fallback rpc endpoint"
            );
        }
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let url = self.endpoint().to_string();
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let fut = self.http.post(&url).json(&body).send();
        let resp = match tokio::time::timeout(timeout, fut).await {
            Err(_) => {
                self.rotate_endpoint();
                return Err(RpcError::Timeout(timeout));
            }
            Ok(Err(e)) => {
                self.rotate_endpoint();
                return Err(RpcError::Transport(e.to_string()));
            }
            Ok(Ok(resp)) => resp,
        };

        let payload: RpcResponse = resp
            .json()
            .await
            .map_err(|e| RpcError::BadResponse(e.to_string()))?;
        if let Some(err) = payload.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        payload
            .result
            .ok_or_else(|| RpcError::BadResponse("missing result".into()))
    }

    async fn call_quantity(&self, method: &str, params: Value) -> Result<U256, RpcError> {
        let value = self.call(method, params, RPC_READ_TIMEOUT).await?;
        parse_quantity(&value)
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

fn parse_quantity(value: &Value) -> Result<U256, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::BadResponse(format!("expected hex quantity, got {value}")))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    U256::from_str_radix(digits, 16)
        .map_err(|_| RpcError::BadResponse(format!("bad hex quantity: {s}")))
}

fn quantity_u64(value: &Value) -> Result<u64, RpcError> {
    let q = parse_quantity(value)?;
    u64::try_from(q).map_err(|_| RpcError::BadResponse("quantity exceeds u64".into()))
}

impl ChainRpc for ChainClient {
    async fn network_id(&self) -> Result<u64, RpcError> {
        let v = self.call_quantity("eth_chainId", json!([])).await?;
        u64::try_from(v).map_err(|_| RpcError::BadResponse("chain id exceeds u64".into()))
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let v = self.call("eth_blockNumber", json!([]), RPC_READ_TIMEOUT).await?;
        quantity_u64(&v)
    }

    async fn balance_at(&self, addr: Address) -> Result<U256, RpcError> {
        self.call_quantity("eth_getBalance", json!([addr.to_string(), "latest"]))
            .await
    }

    async fn pending_nonce_at(&self, addr: Address) -> Result<u64, RpcError> {
        let v = self
            .call(
                "eth_getTransactionCount",
                json!([addr.to_string(), "pending"]),
                RPC_READ_TIMEOUT,
            )
            .await?;
        quantity_u64(&v)
    }

    async fn suggest_gas_price(&self) -> Result<u128, RpcError> {
        let v = self.call_quantity("eth_gasPrice", json!([])).await?;
        u128::try_from(v).map_err(|_| RpcError::BadResponse("gas price exceeds u128".into()))
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<B256, RpcError> {
        let hex_tx = format!("0x{}", hex::encode(raw));
        let v = self
            .call("eth_sendRawTransaction", json!([hex_tx]), RPC_READ_TIMEOUT)
            .await?;
        let s = v
            .as_str()
            .ok_or_else(|| RpcError::BadResponse("tx hash is not a string".into()))?;
        s.parse::<B256>()
            .map_err(|_| RpcError::BadResponse(format!("bad tx hash: {s}")))
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, RpcError> {
        let v = self
            .call(
                "eth_getTransactionReceipt",
                json!([tx_hash.to_string()]),
                RECEIPT_TIMEOUT,
            )
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        let status = v
            .get("status")
            .and_then(|s| s.as_str())
            .ok_or_else(|| RpcError::BadResponse("receipt missing status".into()))?;
        let block_number = v
            .get("blockNumber")
            .map(quantity_u64)
            .transpose()?
            .unwrap_or_default();
        Ok(Some(TxReceipt {
            tx_hash,
            block_number,
            success: status == "0x1",
        }))
    }

    async fn transaction_known(&self, tx_hash: B256) -> Result<bool, RpcError> {
        let v = self
            .call(
                "eth_getTransactionByHash",
                json!([tx_hash.to_string()]),
                RPC_READ_TIMEOUT,
            )
            .await?;
        Ok(!v.is_null())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Per-worker handle resolving chain ids to shared RPC clients.
pub trait ChainProvider: Send + Sync + 'static {
    type Rpc: ChainRpc;

    /// Accepts a SLIP-44 id, falling back to the EVM counterpart.
    fn client_for(&self, chain_id: u32) -> Option<Arc<Self::Rpc>>;
}

pub struct ChainClientRegistry {
    clients: RwLock<HashMap<u32, Arc<ChainClient>>>,
    chain_map: ChainIdMap,
}

impl ChainClientRegistry {
    pub fn new(chain_map: ChainIdMap) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            chain_map,
        }
    }

    pub fn register(&self, client: ChainClient) {
        let mut clients = self.clients.write().expect("registry lock poisoned");
        debug!(chain_id = client.chain_id, "rpc client registered");
        clients.insert(client.chain_id, Arc::new(client));
    }

    pub fn chain_ids(&self) -> Vec<u32> {
        let clients = self.clients.read().expect("registry lock poisoned");
        clients.keys().copied().collect()
    }
}

impl ChainProvider for ChainClientRegistry {
    type Rpc = ChainClient;

    fn client_for(&self, chain_id: u32) -> Option<Arc<ChainClient>> {
        let clients = self.clients.read().expect("registry lock poisoned");
        if let Some(c) = clients.get(&chain_id) {
            return Some(Arc::clone(c));
        }
        // The caller may have handed us an EVM chain id.
        let slip44 = self.chain_map.normalise(chain_id as u64)?;
        clients.get(&slip44).map(Arc::clone)
    }
}
