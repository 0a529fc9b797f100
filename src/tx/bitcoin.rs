//! Bitcoin resolver: spends HTLC outputs through an external signing service

use super::{ActionKind, ChainResolver, CrossChainAction};
use crate::chain::bitcoin::RpcTxOut;
use crate::chain::{BitcoinRpcClient, Chain, ChainClock};
use crate::config::BitcoinConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::bitcoin::btc_to_sats;
use crate::events::script::{as_p2wsh_program, p2wsh_program, parse_htlc};
use crate::events::ScriptRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Which branch of the HTLC script the spend takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendPath {
    Redeem,
    Refund,
}

/// Everything the signer needs to build and sign one HTLC spend
#[derive(Debug, Clone, Serialize)]
pub struct SpendRequest {
    pub key_id: String,
    pub network: String,
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    /// Hex witness script (or the bare output script)
    pub witness_script: String,
    pub path: SpendPath,
    /// Hex preimage, redeem path only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// nLockTime for the refund path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locktime: Option<u64>,
    pub destination: String,
    pub fee_rate_sat_vb: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignedSpend {
    pub raw_tx: String,
    pub txid: String,
}

/// HTTP client for the external bitcoin signer (`POST {signer_url}/sign`)
pub struct SignerClient {
    http: reqwest::Client,
    url: String,
}

impl SignerClient {
    pub fn new(signer_url: &str) -> RelayerResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RelayerError::Config(format!("signer http client: {}", e)))?;

        Ok(Self {
            http,
            url: format!("{}/sign", signer_url.trim_end_matches('/')),
        })
    }

    pub async fn sign(&self, request: &SpendRequest) -> RelayerResult<SignedSpend> {
        let response = self
            .http
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayerError::Timeout {
                        operation: "bitcoin signer".to_string(),
                    }
                } else {
                    RelayerError::Signer(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayerError::Signer(format!("signer returned {}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| RelayerError::Signer(format!("unreadable signer response: {}", e)))
    }
}

pub struct BitcoinResolver {
    rpc: Arc<BitcoinRpcClient>,
    signer: SignerClient,
    registry: Arc<ScriptRegistry>,
    key_id: String,
    network: String,
    fee_rate_sat_vb: u64,
    redeem_address: Option<String>,
}

impl BitcoinResolver {
    pub fn new(
        config: &BitcoinConfig,
        rpc: Arc<BitcoinRpcClient>,
        registry: Arc<ScriptRegistry>,
    ) -> RelayerResult<Self> {
        let resolver = &config.resolver;
        let signer_url = resolver
            .signer_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| RelayerError::Config("bitcoin resolver has no signer_url".to_string()))?;
        let key_id = resolver
            .signer_key_id
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RelayerError::Config("bitcoin resolver has no signer_key_id".to_string()))?;

        info!(signer = signer_url, key_id = %key_id, "Bitcoin resolver initialized");
        Ok(Self {
            rpc,
            signer: SignerClient::new(signer_url)?,
            registry,
            key_id,
            network: config.network.clone(),
            fee_rate_sat_vb: resolver.fee_rate_sat_vb,
            redeem_address: resolver.redeem_address.clone(),
        })
    }

    fn not_found(action: &CrossChainAction) -> RelayerError {
        RelayerError::LockNotFound {
            chain: Chain::Bitcoin,
            hashlock: action.hashlock.to_hex(),
        }
    }

    /// Witness script for the lock output: registered P2WSH script or the bare output itself
    fn witness_script(&self, action: &CrossChainAction, out: &RpcTxOut) -> RelayerResult<Vec<u8>> {
        let script_pub_key = hex::decode(&out.script_pub_key.hex).map_err(|e| RelayerError::Decode {
            chain: Chain::Bitcoin,
            message: format!("gettxout script: {}", e),
        })?;

        if parse_htlc(&script_pub_key).is_some() {
            return Ok(script_pub_key);
        }

        let program = as_p2wsh_program(&script_pub_key).ok_or_else(|| Self::not_found(action))?;
        match self.registry.by_hashlock(&action.hashlock) {
            Some(script) if p2wsh_program(&script) == program => Ok(script),
            _ => Err(Self::not_found(action)),
        }
    }

    fn destination(&self, action: &CrossChainAction) -> RelayerResult<String> {
        let configured = match action.kind {
            ActionKind::Redeem => self.redeem_address.clone(),
            ActionKind::Refund => None,
        };
        action
            .destination
            .clone()
            .filter(|d| !d.is_empty())
            .or(configured)
            .ok_or_else(|| {
                RelayerError::Internal(format!("no {} destination for {}", action.kind, action.order_id))
            })
    }

    async fn check_refundable(&self, action: &CrossChainAction, locktime: u64) -> RelayerResult<()> {
        let info = self.rpc.get_blockchain_info().await?;
        let clock = ChainClock {
            bitcoin_height: Some(info.blocks),
            bitcoin_median_time: Some(info.mediantime),
            ethereum_time: None,
        };
        if clock.is_expired(Chain::Bitcoin, locktime) {
            return Ok(());
        }
        Err(RelayerError::TimelockNotExpired {
            chain: Chain::Bitcoin,
            hashlock: action.hashlock.to_hex(),
            locktime,
            current: clock.current(Chain::Bitcoin, locktime).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ChainResolver for BitcoinResolver {
    fn chain(&self) -> Chain {
        Chain::Bitcoin
    }

    async fn execute_action(&self, action: &CrossChainAction) -> RelayerResult<String> {
        let lock = action.lock_ref.as_ref().ok_or_else(|| Self::not_found(action))?;
        let vout = lock.output_index.ok_or_else(|| Self::not_found(action))?;

        let out = self
            .rpc
            .get_tx_out(&lock.tx_id, vout)
            .await?
            .ok_or_else(|| RelayerError::AlreadySpent {
                chain: Chain::Bitcoin,
                hashlock: action.hashlock.to_hex(),
            })?;

        let witness_script = self.witness_script(action, &out)?;
        let script = parse_htlc(&witness_script).ok_or_else(|| Self::not_found(action))?;
        if script.hashlock != action.hashlock {
            return Err(Self::not_found(action));
        }

        let (path, secret, locktime) = match action.kind {
            ActionKind::Redeem => {
                let secret = action
                    .secret
                    .filter(|s| s.matches(&action.hashlock))
                    .ok_or_else(|| RelayerError::InvalidSecret {
                        hashlock: action.hashlock.to_hex(),
                    })?;
                (SpendPath::Redeem, Some(secret.to_hex()), None)
            }
            ActionKind::Refund => {
                self.check_refundable(action, script.locktime).await?;
                (SpendPath::Refund, None, Some(script.locktime))
            }
        };

        let request = SpendRequest {
            key_id: self.key_id.clone(),
            network: self.network.clone(),
            txid: lock.tx_id.clone(),
            vout,
            value_sats: btc_to_sats(out.value) as u64,
            witness_script: hex::encode(&witness_script),
            path,
            secret,
            locktime,
            destination: self.destination(action)?,
            fee_rate_sat_vb: self.fee_rate_sat_vb,
        };

        debug!(
            order_id = %action.order_id,
            txid = %request.txid,
            vout,
            path = ?path,
            "Requesting bitcoin spend signature"
        );
        let signed = self.signer.sign(&request).await?;
        self.rpc
            .send_raw_transaction(&signed.raw_tx, Some(&signed.txid))
            .await
    }
}
