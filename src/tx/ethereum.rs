//! Ethereum resolver: calls redeem/refund on the HTLC contract with the hot key

use super::{ActionKind, ChainResolver, CrossChainAction};
use crate::chain::{Chain, EthereumBlockSource};
use crate::config::EthereumConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ethereum::{u256_to_u64, HashedTimelock};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

type HtlcClient = SignerMiddleware<Provider<Http>, LocalWallet>;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// On-chain view of one contract lock
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContractLock {
    sender: Address,
    locktime: u64,
    redeemed: bool,
    refunded: bool,
}

pub struct EthereumResolver {
    source: Arc<EthereumBlockSource>,
    wallet: LocalWallet,
}

impl EthereumResolver {
    pub fn new(config: &EthereumConfig, source: Arc<EthereumBlockSource>) -> RelayerResult<Self> {
        let key = config.resolver.signing_key().ok_or_else(|| {
            RelayerError::Config("ethereum resolver has no signing key".to_string())
        })?;
        let wallet = key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Config(format!("invalid ethereum private key: {}", e)))?
            .with_chain_id(config.chain_id);

        info!(address = ?wallet.address(), "Ethereum resolver initialized");
        Ok(Self { source, wallet })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Contract handle bound to the currently active provider
    fn contract(&self) -> HashedTimelock<HtlcClient> {
        let client = SignerMiddleware::new(self.source.http().clone(), self.wallet.clone());
        HashedTimelock::new(self.source.contract(), Arc::new(client))
    }

    fn connection_error(&self, e: impl std::fmt::Display) -> RelayerError {
        self.source.failover();
        RelayerError::ChainConnection {
            chain: Chain::Ethereum,
            message: e.to_string(),
        }
    }

    async fn read_lock(&self, action: &CrossChainAction) -> RelayerResult<ContractLock> {
        let (sender, _recipient, _amount, locktime, redeemed, refunded) = self
            .contract()
            .locks(action.hashlock.0)
            .call()
            .await
            .map_err(|e| self.connection_error(e))?;

        if sender == Address::zero() {
            return Err(RelayerError::LockNotFound {
                chain: Chain::Ethereum,
                hashlock: action.hashlock.to_hex(),
            });
        }

        Ok(ContractLock {
            sender,
            locktime: u256_to_u64(locktime).unwrap_or(u64::MAX),
            redeemed,
            refunded,
        })
    }

    /// Submit a prepared call and wait for the node to accept it
    async fn submit(&self, call: ContractCall<HtlcClient, ()>, what: &str) -> RelayerResult<String> {
        let sent = timeout(SEND_TIMEOUT, call.send())
            .await
            .map_err(|_| RelayerError::Timeout {
                operation: format!("ethereum {}", what),
            })?;

        match sent {
            Ok(pending) => Ok(format!("{:?}", pending.tx_hash())),
            Err(e) => {
                let message = e.to_string();
                if message.contains("revert") {
                    // Reverts are deterministic; retrying will not help
                    Err(RelayerError::Internal(format!("{} reverted: {}", what, message)))
                } else {
                    Err(RelayerError::BroadcastFailure {
                        chain: Chain::Ethereum,
                        message,
                    })
                }
            }
        }
    }
}

#[async_trait]
impl ChainResolver for EthereumResolver {
    fn chain(&self) -> Chain {
        Chain::Ethereum
    }

    async fn execute_action(&self, action: &CrossChainAction) -> RelayerResult<String> {
        let lock = self.read_lock(action).await?;
        if lock.redeemed || lock.refunded {
            return Err(RelayerError::AlreadySpent {
                chain: Chain::Ethereum,
                hashlock: action.hashlock.to_hex(),
            });
        }

        let contract = self.contract();
        match action.kind {
            ActionKind::Redeem => {
                let secret = action.secret.ok_or_else(|| {
                    RelayerError::Internal(format!("redeem for {} has no secret", action.order_id))
                })?;
                if !secret.matches(&action.hashlock) {
                    return Err(RelayerError::InvalidSecret {
                        hashlock: action.hashlock.to_hex(),
                    });
                }
                debug!(order_id = %action.order_id, sender = ?lock.sender, "Submitting ethereum redeem");
                self.submit(contract.redeem(action.hashlock.0, secret.0), "redeem")
                    .await
            }
            ActionKind::Refund => {
                let now = self.source.latest_timestamp().await?;
                if now < lock.locktime {
                    return Err(RelayerError::TimelockNotExpired {
                        chain: Chain::Ethereum,
                        hashlock: action.hashlock.to_hex(),
                        locktime: lock.locktime,
                        current: now,
                    });
                }
                debug!(order_id = %action.order_id, "Submitting ethereum refund");
                self.submit(contract.refund(action.hashlock.0), "refund").await
            }
        }
    }
}
