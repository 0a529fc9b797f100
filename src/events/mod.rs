//! HTLC event types and per-chain classification
//!
//! Watchers fold chain-native transactions into canonical `HtlcEvent`s through
//! the classifiers defined here.

pub mod bitcoin;
pub mod ethereum;
pub mod script;

pub use self::bitcoin::{BitcoinClassifier, ScriptRegistry};
pub use self::ethereum::EthereumClassifier;

use crate::chain::Chain;
use crate::types::{BlockRef, Hashlock, Secret};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

/// What happened to an HTLC on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HtlcEventKind {
    Lock,
    Redeem,
    Refund,
}

impl HtlcEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HtlcEventKind::Lock => "lock",
            HtlcEventKind::Redeem => "redeem",
            HtlcEventKind::Refund => "refund",
        }
    }
}

impl fmt::Display for HtlcEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical observation emitted by a chain watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcEvent {
    pub kind: HtlcEventKind,
    pub chain: Chain,
    pub tx_id: String,
    pub block: BlockRef,
    pub timestamp: DateTime<Utc>,
    pub hashlock: Hashlock,
    /// Locked amount in base units; zero when the spend does not expose it
    pub amount: u128,
    pub secret: Option<Secret>,
    pub counterparty: Option<String>,
    /// Absolute locktime read from the script or contract (lock events)
    pub locktime: Option<u64>,
    /// Output index of the lock on UTXO chains
    pub output_index: Option<u32>,
    /// Where the event sits: output (lock) or input (spend) index on bitcoin, log index on ethereum
    #[serde(default)]
    pub position: u64,
}

impl HtlcEvent {
    /// Deduplication key: one physical event per chain, transaction position and kind.
    /// A single transaction can lock or spend several HTLCs.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}:{}-{}", self.chain, self.tx_id, self.position, self.kind)
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }
}

/// An event on its way to the processor.
///
/// The watcher keeps the receipt and only moves its cursor past a block once
/// every event of that block reports `true`. A dropped delivery reads as `false`.
#[derive(Debug)]
pub struct EventDelivery {
    pub event: HtlcEvent,
    receipt: oneshot::Sender<bool>,
}

impl EventDelivery {
    pub fn new(event: HtlcEvent) -> (Self, oneshot::Receiver<bool>) {
        let (receipt, rx) = oneshot::channel();
        (Self { event, receipt }, rx)
    }

    /// Report whether the event is done with (applied, duplicate, unmatched or rejected for good)
    pub fn settle(self, settled: bool) {
        // The watcher may have gone away during shutdown
        let _ = self.receipt.send(settled);
    }
}
