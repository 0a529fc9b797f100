//! Chain module - block sources and HTLC watchers for both swap legs
//!
//! This module provides:
//! - The `BlockSource` seam over a chain's RPC (tip height, block fetch)
//! - The `HtlcClassifier` seam turning raw transactions/logs into HTLC events
//! - A generic polling `ChainWatcher` with cursor persistence and reconnects

pub mod bitcoin;
pub mod clock;
pub mod ethereum;
pub mod watcher;

pub use self::bitcoin::BitcoinRpcClient;
pub use clock::{ChainClock, LOCKTIME_THRESHOLD};
pub use self::ethereum::EthereumBlockSource;
pub use watcher::ChainWatcher;

use crate::error::RelayerResult;
use crate::events::HtlcEvent;
use crate::types::BlockRef;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// The two chain families a swap spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// UTXO leg
    Bitcoin,
    /// Account leg
    Ethereum,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::Bitcoin, Chain::Ethereum];

    /// The chain on the other side of the swap
    pub fn counterpart(self) -> Chain {
        match self {
            Chain::Bitcoin => Chain::Ethereum,
            Chain::Ethereum => Chain::Bitcoin,
        }
    }

    /// Prefix used in flattened order statuses
    pub fn short(self) -> &'static str {
        match self {
            Chain::Bitcoin => "btc",
            Chain::Ethereum => "eth",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Chain::Bitcoin => "bitcoin",
            Chain::Ethereum => "ethereum",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitcoin" | "btc" => Ok(Chain::Bitcoin),
            "ethereum" | "eth" => Ok(Chain::Ethereum),
            other => Err(format!("unknown chain: {}", other)),
        }
    }
}

/// Header data every classified event is stamped with
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub block: BlockRef,
    pub timestamp: DateTime<Utc>,
}

/// A fetched block with its raw chain-native transactions
#[derive(Debug, Clone)]
pub struct SourceBlock<T> {
    pub header: BlockHeader,
    pub txs: Vec<T>,
}

/// Read access to a chain's blocks
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    type Tx: Send + Sync + 'static;

    fn chain(&self) -> Chain;

    /// Current best block height
    async fn tip_height(&self) -> RelayerResult<u64>;

    /// Fetch the block at `height` with the transactions relevant to classification
    async fn fetch_block(&self, height: u64) -> RelayerResult<SourceBlock<Self::Tx>>;
}

/// Turns one raw transaction (or log) into zero or more HTLC events.
///
/// Kept narrow so a heuristic decoder can be swapped for a precise one
/// without touching the event processor.
pub trait HtlcClassifier: Send + Sync + 'static {
    type Tx;

    fn classify(&self, tx: &Self::Tx, header: &BlockHeader) -> RelayerResult<Vec<HtlcEvent>>;
}

/// Snapshot of a watcher's connection and cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatcherStatus {
    pub chain: Chain,
    pub connected: bool,
    pub last_block: u64,
}

/// Object-safe watcher interface used by the supervisor
#[async_trait]
pub trait Watcher: Send + Sync {
    fn chain(&self) -> Chain;

    /// Connect and initialise the cursor; fails after the configured retries
    async fn start(&self) -> RelayerResult<()>;

    /// Scan newly available blocks once, returning the number of emitted events
    async fn poll(&self) -> RelayerResult<usize>;

    /// Poll on the configured interval until cancelled or stopped
    async fn run(&self, cancel: CancellationToken);

    /// Halt polling; idempotent
    fn stop(&self);

    fn status(&self) -> WatcherStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_names() {
        assert_eq!(Chain::Bitcoin.counterpart(), Chain::Ethereum);
        assert_eq!("ETH".parse::<Chain>().unwrap(), Chain::Ethereum);
        assert_eq!(Chain::Bitcoin.to_string(), "bitcoin");
        assert_eq!(
            serde_json::to_string(&Chain::Ethereum).unwrap(),
            "\"ethereum\""
        );
        assert!("solana".parse::<Chain>().is_err());
    }
}
