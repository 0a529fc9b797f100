//! Cross-chain actions and the resolvers that put them on chain
//!
//! The event processor plans actions; the dispatcher drains them through a
//! bounded worker pool into one `ChainResolver` per chain.

mod bitcoin;
mod dispatcher;
mod ethereum;

pub use self::bitcoin::{BitcoinResolver, SignerClient};
pub use self::ethereum::EthereumResolver;
pub use dispatcher::{ActionDispatcher, ActionOutcome, ActionResult};

use crate::chain::Chain;
use crate::error::RelayerResult;
use crate::types::{Hashlock, Secret};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Redeem,
    Refund,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Redeem => "redeem",
            ActionKind::Refund => "refund",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redeem" => Ok(ActionKind::Redeem),
            "refund" => Ok(ActionKind::Refund),
            other => Err(format!("unknown action kind: {}", other)),
        }
    }
}

/// Dispatch ordering; `High` sorts first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

/// The HTLC output or contract entry an action spends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRef {
    pub tx_id: String,
    pub output_index: Option<u32>,
    #[serde(with = "crate::types::amount")]
    pub amount: u128,
}

/// A directive to redeem or refund one HTLC leg
#[derive(Debug, Clone, PartialEq)]
pub struct CrossChainAction {
    pub kind: ActionKind,
    pub target_chain: Chain,
    pub hashlock: Hashlock,
    /// Only ever the secret revealed on chain
    pub secret: Option<Secret>,
    pub order_id: String,
    pub priority: Priority,
    pub lock_ref: Option<LockRef>,
    pub locktime: Option<u64>,
    /// Where a UTXO spend pays out; contract spends ignore it
    pub destination: Option<String>,
}

impl CrossChainAction {
    /// At-most-once key: one action per chain, hashlock and kind
    pub fn idempotency_key(&self) -> String {
        action_key(self.target_chain, &self.hashlock, self.kind)
    }
}

pub fn action_key(chain: Chain, hashlock: &Hashlock, kind: ActionKind) -> String {
    format!("{}-{}-{}", chain, hashlock.to_hex(), kind)
}

/// Inverse of [`action_key`]
pub fn parse_action_key(key: &str) -> Option<(Chain, Hashlock, ActionKind)> {
    let mut parts = key.splitn(3, '-');
    let chain = parts.next()?.parse().ok()?;
    let hashlock = parts.next()?.parse().ok()?;
    let kind = parts.next()?.parse().ok()?;
    Some((chain, hashlock, kind))
}

/// Builds, signs and broadcasts the transaction for one action
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainResolver: Send + Sync {
    fn chain(&self) -> Chain;

    /// Returns the broadcast transaction id
    async fn execute_action(&self, action: &CrossChainAction) -> RelayerResult<String>;
}
