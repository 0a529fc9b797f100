//! Chain-native notion of "now" for timelock checks

use super::Chain;
use crate::events::HtlcEvent;

use serde::Serialize;

/// nLockTime values below this are block heights, above it UNIX times (BIP-65)
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

/// Average bitcoin block interval used to turn a height distance into seconds
const BITCOIN_BLOCK_SECS: u64 = 600;

/// Latest known position of both chains.
///
/// Unknown fields never make a timelock look expired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChainClock {
    pub bitcoin_height: Option<u64>,
    pub bitcoin_median_time: Option<u64>,
    pub ethereum_time: Option<u64>,
}

impl ChainClock {
    /// Whether a spend of the refund path is valid now
    pub fn is_expired(&self, chain: Chain, locktime: u64) -> bool {
        match chain {
            Chain::Bitcoin if locktime < LOCKTIME_THRESHOLD => {
                self.bitcoin_height.is_some_and(|h| h >= locktime)
            }
            // Median time past must be strictly past a time-based locktime
            Chain::Bitcoin => self.bitcoin_median_time.is_some_and(|t| t > locktime),
            Chain::Ethereum => self.ethereum_time.is_some_and(|t| t >= locktime),
        }
    }

    /// Current chain value in the locktime's own unit
    pub fn current(&self, chain: Chain, locktime: u64) -> Option<u64> {
        match chain {
            Chain::Bitcoin if locktime < LOCKTIME_THRESHOLD => self.bitcoin_height,
            Chain::Bitcoin => self.bitcoin_median_time,
            Chain::Ethereum => self.ethereum_time,
        }
    }

    /// Approximate seconds until the locktime passes; zero once expired
    pub fn secs_until(&self, chain: Chain, locktime: u64) -> Option<u64> {
        let now = self.current(chain, locktime)?;
        let remaining = locktime.saturating_sub(now);
        if chain == Chain::Bitcoin && locktime < LOCKTIME_THRESHOLD {
            Some(remaining.saturating_mul(BITCOIN_BLOCK_SECS))
        } else {
            Some(remaining)
        }
    }

    /// Advance each field to the later of the two readings
    pub fn merge(&mut self, other: &ChainClock) {
        fn later(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            }
        }
        self.bitcoin_height = later(self.bitcoin_height, other.bitcoin_height);
        self.bitcoin_median_time = later(self.bitcoin_median_time, other.bitcoin_median_time);
        self.ethereum_time = later(self.ethereum_time, other.ethereum_time);
    }

    /// Learn from an observed block. Bitcoin block times are not median times and are ignored.
    pub fn observe(&mut self, event: &HtlcEvent) {
        let seen = match event.chain {
            Chain::Bitcoin => ChainClock {
                bitcoin_height: Some(event.block.height),
                ..Default::default()
            },
            Chain::Ethereum => ChainClock {
                ethereum_time: Some(event.timestamp.timestamp().max(0) as u64),
                ..Default::default()
            },
        };
        self.merge(&seen);
    }
}
