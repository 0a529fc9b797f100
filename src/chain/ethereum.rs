//! Ethereum block source with multi-RPC support and automatic failover

use super::{BlockHeader, BlockSource, Chain, SourceBlock};
use crate::config::EthereumConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::types::BlockRef;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider block source scoped to the HTLC contract's logs
pub struct EthereumBlockSource {
    chain_id: u64,
    contract: Address,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EthereumBlockSource {
    pub fn new(config: &EthereumConfig) -> RelayerResult<Self> {
        let contract: Address = config.htlc_contract.parse().map_err(|e| {
            RelayerError::Config(format!(
                "invalid htlc_contract {}: {}",
                config.htlc_contract, e
            ))
        })?;

        let mut http_providers = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(500)));
                    debug!(chain_id = config.chain_id, url = %url, "Added HTTP provider");
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain: Chain::Ethereum,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain_id: config.chain_id,
            contract,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!(chain_id = self.chain_id, provider = next, "Ethereum RPC failover");
    }

    fn connection_error(message: impl Into<String>) -> RelayerError {
        RelayerError::ChainConnection {
            chain: Chain::Ethereum,
            message: message.into(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(Self::connection_error("All providers failed"))
    }

    /// Get block header (transaction hashes only) with failover
    pub async fn get_block(
        &self,
        id: impl Into<BlockId> + Clone + Send + Sync,
    ) -> RelayerResult<Option<Block<H256>>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block(id.clone()).await {
                Ok(block) => return Ok(block),
                Err(e) => {
                    warn!("Failed to get block from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(Self::connection_error("All providers failed to get block"))
    }

    /// Get logs for a filter with failover
    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(Self::connection_error("All providers failed to get logs"))
    }

    /// Timestamp of the latest block, used for timelock checks
    pub async fn latest_timestamp(&self) -> RelayerResult<u64> {
        let block = self
            .get_block(BlockNumber::Latest)
            .await?
            .ok_or_else(|| Self::connection_error("No latest block"))?;
        Ok(block.timestamp.as_u64())
    }
}

#[async_trait]
impl BlockSource for EthereumBlockSource {
    type Tx = Log;

    fn chain(&self) -> Chain {
        Chain::Ethereum
    }

    async fn tip_height(&self) -> RelayerResult<u64> {
        self.get_block_number().await
    }

    async fn fetch_block(&self, height: u64) -> RelayerResult<SourceBlock<Log>> {
        let block = self
            .get_block(height)
            .await?
            .ok_or_else(|| Self::connection_error(format!("block {} not yet available", height)))?;

        let hash = block.hash.ok_or_else(|| RelayerError::Decode {
            chain: Chain::Ethereum,
            message: format!("block {} has no hash", height),
        })?;

        // Pin the log query to the block hash so header and logs cannot straddle a reorg
        let filter = Filter::new().address(self.contract).at_block_hash(hash);
        let logs = self.get_logs(&filter).await?;

        let timestamp = Utc
            .timestamp_opt(block.timestamp.as_u64() as i64, 0)
            .single()
            .ok_or_else(|| RelayerError::Decode {
                chain: Chain::Ethereum,
                message: format!("block {} has invalid timestamp", height),
            })?;

        debug!(height, logs = logs.len(), "Fetched ethereum block");

        Ok(SourceBlock {
            header: BlockHeader {
                block: BlockRef {
                    height,
                    hash: format!("{:?}", hash),
                },
                timestamp,
            },
            txs: logs,
        })
    }
}
