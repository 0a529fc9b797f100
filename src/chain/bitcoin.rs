//! Bitcoin Core JSON-RPC client
//!
//! Only the handful of calls the relayer needs: block traversal for the watcher
//! and UTXO lookup / broadcast for the resolver.

use super::{BlockHeader, BlockSource, Chain, SourceBlock};
use crate::config::BitcoinConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::types::BlockRef;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// RPC error code bitcoind returns for "transaction already in block chain"
const RPC_VERIFY_ALREADY_IN_CHAIN: i64 = -27;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// `getblock <hash> 2`
#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlock {
    pub hash: String,
    pub height: u64,
    pub time: i64,
    pub tx: Vec<RpcTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransaction {
    pub txid: String,
    pub vin: Vec<RpcInput>,
    pub vout: Vec<RpcOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcInput {
    pub txid: Option<String>,
    pub vout: Option<u32>,
    pub coinbase: Option<String>,
    #[serde(rename = "scriptSig")]
    pub script_sig: Option<RpcScript>,
    #[serde(default)]
    pub txinwitness: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcScript {
    pub hex: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcOutput {
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: RpcScriptPubKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcScriptPubKey {
    pub hex: String,
    pub address: Option<String>,
}

/// `gettxout <txid> <n>`
#[derive(Debug, Clone, Deserialize)]
pub struct RpcTxOut {
    pub confirmations: u64,
    pub value: f64,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: RpcScriptPubKey,
}

/// Subset of `getblockchaininfo`
#[derive(Debug, Clone, Deserialize)]
pub struct RpcChainInfo {
    pub chain: String,
    pub blocks: u64,
    pub mediantime: u64,
}

/// JSON-RPC client for a bitcoind node
pub struct BitcoinRpcClient {
    http: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    request_id: AtomicU64,
}

impl BitcoinRpcClient {
    pub fn new(config: &BitcoinConfig) -> RelayerResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RelayerError::Config(format!("bitcoin http client: {}", e)))?;

        Ok(Self {
            http,
            url: config.rpc_url.clone(),
            user: config.rpc_user.clone(),
            password: config.rpc_password.clone(),
            request_id: AtomicU64::new(1),
        })
    }

    fn connection_error(&self, message: impl Into<String>) -> RelayerError {
        RelayerError::ChainConnection {
            chain: Chain::Bitcoin,
            message: message.into(),
        }
    }

    async fn call_raw(&self, method: &str, params: Vec<Value>) -> RelayerResult<Result<Value, JsonRpcError>> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            id,
            method,
            params,
        };

        trace!(method, id, "bitcoind request");

        let mut builder = self.http.post(&self.url).json(&request);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_ref());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.connection_error(format!("{}: {}", method, e)))?;

        // bitcoind answers RPC-level errors with HTTP 500 and a JSON body
        let status = response.status();
        let body: JsonRpcResponse = response.json().await.map_err(|e| {
            self.connection_error(format!("{}: unreadable response ({}): {}", method, status, e))
        })?;

        match (body.error, body.result) {
            (Some(error), _) => Ok(Err(error)),
            (None, Some(result)) => Ok(Ok(result)),
            (None, None) => Ok(Ok(Value::Null)),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> RelayerResult<T> {
        let value = self
            .call_raw(method, params)
            .await?
            .map_err(|e| self.connection_error(format!("{} failed ({}): {}", method, e.code, e.message)))?;

        serde_json::from_value(value).map_err(|e| RelayerError::Decode {
            chain: Chain::Bitcoin,
            message: format!("{}: {}", method, e),
        })
    }

    pub async fn get_block_count(&self) -> RelayerResult<u64> {
        self.call("getblockcount", vec![]).await
    }

    pub async fn get_block_hash(&self, height: u64) -> RelayerResult<String> {
        self.call("getblockhash", vec![json!(height)]).await
    }

    pub async fn get_block(&self, hash: &str) -> RelayerResult<RpcBlock> {
        self.call("getblock", vec![json!(hash), json!(2)]).await
    }

    /// Unspent output lookup including the mempool; `None` when spent or unknown
    pub async fn get_tx_out(&self, txid: &str, vout: u32) -> RelayerResult<Option<RpcTxOut>> {
        self.call("gettxout", vec![json!(txid), json!(vout), json!(true)])
            .await
    }

    pub async fn get_blockchain_info(&self) -> RelayerResult<RpcChainInfo> {
        self.call("getblockchaininfo", vec![]).await
    }

    /// Broadcast a signed transaction, returning its txid
    pub async fn send_raw_transaction(&self, raw_tx_hex: &str, txid_hint: Option<&str>) -> RelayerResult<String> {
        match self
            .call_raw("sendrawtransaction", vec![json!(raw_tx_hex)])
            .await?
        {
            Ok(value) => value.as_str().map(str::to_string).ok_or_else(|| RelayerError::Decode {
                chain: Chain::Bitcoin,
                message: "sendrawtransaction returned a non-string txid".to_string(),
            }),
            Err(e) if e.code == RPC_VERIFY_ALREADY_IN_CHAIN && txid_hint.is_some() => {
                debug!(code = e.code, "Transaction already broadcast");
                Ok(txid_hint.unwrap_or_default().to_string())
            }
            Err(e) => Err(RelayerError::BroadcastFailure {
                chain: Chain::Bitcoin,
                message: format!("{} ({})", e.message, e.code),
            }),
        }
    }
}

#[async_trait]
impl BlockSource for BitcoinRpcClient {
    type Tx = RpcTransaction;

    fn chain(&self) -> Chain {
        Chain::Bitcoin
    }

    async fn tip_height(&self) -> RelayerResult<u64> {
        self.get_block_count().await
    }

    async fn fetch_block(&self, height: u64) -> RelayerResult<SourceBlock<RpcTransaction>> {
        let hash = self.get_block_hash(height).await?;
        let block = self.get_block(&hash).await?;

        if block.height != height {
            return Err(RelayerError::Decode {
                chain: Chain::Bitcoin,
                message: format!("asked for block {} but node returned {}", height, block.height),
            });
        }

        let timestamp = Utc
            .timestamp_opt(block.time, 0)
            .single()
            .ok_or_else(|| RelayerError::Decode {
                chain: Chain::Bitcoin,
                message: format!("block {} has invalid time {}", height, block.time),
            })?;

        debug!(height, txs = block.tx.len(), "Fetched bitcoin block");

        Ok(SourceBlock {
            header: BlockHeader {
                block: BlockRef {
                    height: block.height,
                    hash: block.hash,
                },
                timestamp,
            },
            txs: block.tx,
        })
    }
}
