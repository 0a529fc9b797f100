//! Swap order model and its per-leg state machine

use crate::chain::Chain;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{HtlcEvent, HtlcEventKind};
use crate::types::{amount, hex_bytes, BlockRef, Hashlock, Secret};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lock state of a single swap leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    #[default]
    Unlocked,
    Locked,
    Redeemed,
    Refunded,
}

impl LockState {
    pub fn as_str(self) -> &'static str {
        match self {
            LockState::Unlocked => "unlocked",
            LockState::Locked => "locked",
            LockState::Redeemed => "redeemed",
            LockState::Refunded => "refunded",
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, LockState::Redeemed | LockState::Refunded)
    }
}

/// One on-chain transaction folded into a leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxObservation {
    pub tx_id: String,
    pub block: BlockRef,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "amount")]
    pub amount: u128,
    pub counterparty: Option<String>,
}

impl From<&HtlcEvent> for TxObservation {
    fn from(event: &HtlcEvent) -> Self {
        Self {
            tx_id: event.tx_id.clone(),
            block: event.block.clone(),
            timestamp: event.timestamp,
            amount: event.amount,
            counterparty: event.counterparty.clone(),
        }
    }
}

/// What the relayer has seen of one chain's HTLC for this order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegObservation {
    pub state: LockState,
    pub lock: Option<TxObservation>,
    pub redeem: Option<TxObservation>,
    pub refund: Option<TxObservation>,
    /// Locktime as observed on chain, which may differ from the order's terms
    pub locktime: Option<u64>,
    pub output_index: Option<u32>,
}

impl LegObservation {
    /// Fold an event into the leg. Returns whether anything changed.
    fn apply(&mut self, chain: Chain, event: &HtlcEvent) -> RelayerResult<bool> {
        let observed = TxObservation::from(event);
        let conflict = |from: LockState, to: &str| RelayerError::InvalidStateTransition {
            chain,
            from: from.as_str().to_string(),
            to: to.to_string(),
        };

        match event.kind {
            HtlcEventKind::Lock => {
                if let Some(lock) = &self.lock {
                    if lock.tx_id == observed.tx_id {
                        return Ok(false);
                    }
                    return Err(conflict(self.state, "locked"));
                }
                // A late lock after a settlement is recorded without moving the state
                if self.state == LockState::Unlocked {
                    self.state = LockState::Locked;
                }
                self.locktime = event.locktime.or(self.locktime);
                self.output_index = event.output_index;
                self.lock = Some(observed);
                Ok(true)
            }
            HtlcEventKind::Redeem => match self.state {
                LockState::Redeemed => match &self.redeem {
                    Some(redeem) if redeem.tx_id == observed.tx_id => Ok(false),
                    _ => Err(conflict(LockState::Redeemed, "redeemed")),
                },
                LockState::Refunded => Err(conflict(LockState::Refunded, "redeemed")),
                LockState::Unlocked | LockState::Locked => {
                    self.state = LockState::Redeemed;
                    self.redeem = Some(observed);
                    Ok(true)
                }
            },
            HtlcEventKind::Refund => match self.state {
                LockState::Refunded => match &self.refund {
                    Some(refund) if refund.tx_id == observed.tx_id => Ok(false),
                    _ => Err(conflict(LockState::Refunded, "refunded")),
                },
                LockState::Redeemed => Err(conflict(LockState::Redeemed, "refunded")),
                LockState::Unlocked | LockState::Locked => {
                    self.state = LockState::Refunded;
                    self.refund = Some(observed);
                    Ok(true)
                }
            },
        }
    }
}

/// Flattened display status, derived from the legs and fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Partial,
    Filled,
    Cancelled,
    BtcLocked,
    EthLocked,
    BtcRedeemed,
    EthRedeemed,
    BtcRefunded,
    EthRefunded,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 10] = [
        OrderStatus::Open,
        OrderStatus::Partial,
        OrderStatus::Filled,
        OrderStatus::Cancelled,
        OrderStatus::BtcLocked,
        OrderStatus::EthLocked,
        OrderStatus::BtcRedeemed,
        OrderStatus::EthRedeemed,
        OrderStatus::BtcRefunded,
        OrderStatus::EthRefunded,
    ];

    fn for_leg(chain: Chain, state: LockState) -> Option<Self> {
        let status = match (chain, state) {
            (_, LockState::Unlocked) => return None,
            (Chain::Bitcoin, LockState::Locked) => OrderStatus::BtcLocked,
            (Chain::Ethereum, LockState::Locked) => OrderStatus::EthLocked,
            (Chain::Bitcoin, LockState::Redeemed) => OrderStatus::BtcRedeemed,
            (Chain::Ethereum, LockState::Redeemed) => OrderStatus::EthRedeemed,
            (Chain::Bitcoin, LockState::Refunded) => OrderStatus::BtcRefunded,
            (Chain::Ethereum, LockState::Refunded) => OrderStatus::EthRefunded,
        };
        Some(status)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::BtcLocked => "btc_locked",
            OrderStatus::EthLocked => "eth_locked",
            OrderStatus::BtcRedeemed => "btc_redeemed",
            OrderStatus::EthRedeemed => "eth_redeemed",
            OrderStatus::BtcRefunded => "btc_refunded",
            OrderStatus::EthRefunded => "eth_refunded",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown order status: {}", s))
    }
}

/// Append-only record of a partial fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    #[serde(with = "amount")]
    pub amount: u128,
    pub tx_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Fill reported by the order-creation side
#[derive(Debug, Clone, Deserialize)]
pub struct FillRequest {
    pub fill_id: Option<String>,
    #[serde(with = "amount")]
    pub amount: u128,
    pub tx_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    Dispatched,
    Succeeded,
    Abandoned,
}

/// Persisted marker that a cross-chain action was handed to a resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub state: ActionState,
    pub tx_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ActionRecord {
    pub fn dispatched() -> Self {
        Self {
            state: ActionState::Dispatched,
            tx_id: None,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Terms supplied by the external order-creation step
#[derive(Debug, Clone, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub hashlock: Hashlock,
    #[serde(with = "amount")]
    pub total_amount: u128,
    #[serde(with = "amount")]
    pub min_fill_amount: u128,
    #[serde(with = "amount")]
    pub max_fill_amount: u128,
    pub recipient_address: String,
    pub refund_address: String,
    pub locktime: u64,
    pub network: String,
    pub chain: Chain,
    #[serde(default)]
    pub secret: Option<Secret>,
    #[serde(default, with = "hex_bytes")]
    pub bitcoin_htlc_script: Option<Vec<u8>>,
}

/// A swap intent and everything observed about it on both chains
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub hashlock: Hashlock,
    #[serde(with = "amount")]
    pub total_amount: u128,
    #[serde(with = "amount")]
    pub remaining_amount: u128,
    #[serde(with = "amount")]
    pub min_fill_amount: u128,
    #[serde(with = "amount")]
    pub max_fill_amount: u128,
    pub recipient_address: String,
    pub refund_address: String,
    pub locktime: u64,
    pub network: String,
    pub chain: Chain,
    /// Never logged and never used to build a redeem
    pub secret: Option<Secret>,
    #[serde(default, with = "hex_bytes")]
    pub bitcoin_htlc_script: Option<Vec<u8>>,
    #[serde(default)]
    pub bitcoin: LegObservation,
    #[serde(default)]
    pub ethereum: LegObservation,
    pub revealed_secret: Option<Secret>,
    #[serde(default)]
    pub fills: Vec<Fill>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionRecord>,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Order")
            .field("order_id", &self.order_id)
            .field("hashlock", &self.hashlock)
            .field("status", &self.status())
            .field("remaining_amount", &self.remaining_amount)
            .field("bitcoin", &self.bitcoin.state)
            .field("ethereum", &self.ethereum.state)
            .finish_non_exhaustive()
    }
}

fn valid_order_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && id != "."
        && id != ".."
}

impl Order {
    /// Build a fresh order, validating its terms
    pub fn new(request: OrderRequest) -> RelayerResult<Self> {
        if !valid_order_id(&request.order_id) {
            return Err(RelayerError::InvalidOrder(format!(
                "order id {:?} must be 1-128 characters of [A-Za-z0-9._-]",
                request.order_id
            )));
        }
        if request.total_amount == 0 {
            return Err(RelayerError::InvalidOrder("total_amount must be positive".into()));
        }
        if request.min_fill_amount > request.max_fill_amount
            || request.max_fill_amount > request.total_amount
        {
            return Err(RelayerError::InvalidOrder(format!(
                "fill bounds must satisfy min ({}) <= max ({}) <= total ({})",
                request.min_fill_amount, request.max_fill_amount, request.total_amount
            )));
        }
        if request.max_fill_amount == 0 {
            return Err(RelayerError::InvalidOrder("max_fill_amount must be positive".into()));
        }
        if let Some(secret) = &request.secret {
            if !secret.matches(&request.hashlock) {
                return Err(RelayerError::InvalidSecret {
                    hashlock: request.hashlock.to_hex(),
                });
            }
        }

        let now = Utc::now();
        Ok(Self {
            order_id: request.order_id,
            hashlock: request.hashlock,
            total_amount: request.total_amount,
            remaining_amount: request.total_amount,
            min_fill_amount: request.min_fill_amount,
            max_fill_amount: request.max_fill_amount,
            recipient_address: request.recipient_address,
            refund_address: request.refund_address,
            locktime: request.locktime,
            network: request.network,
            chain: request.chain,
            secret: request.secret,
            bitcoin_htlc_script: request.bitcoin_htlc_script,
            bitcoin: LegObservation::default(),
            ethereum: LegObservation::default(),
            revealed_secret: None,
            fills: Vec::new(),
            actions: BTreeMap::new(),
            cancelled: false,
            created_at: now,
            updated_at: now,
            archived_at: None,
        })
    }

    pub fn leg(&self, chain: Chain) -> &LegObservation {
        match chain {
            Chain::Bitcoin => &self.bitcoin,
            Chain::Ethereum => &self.ethereum,
        }
    }

    pub fn leg_mut(&mut self, chain: Chain) -> &mut LegObservation {
        match chain {
            Chain::Bitcoin => &mut self.bitcoin,
            Chain::Ethereum => &mut self.ethereum,
        }
    }

    pub fn status(&self) -> OrderStatus {
        if self.cancelled {
            return OrderStatus::Cancelled;
        }

        for rank in [LockState::Refunded, LockState::Redeemed, LockState::Locked] {
            for chain in Chain::ALL {
                if self.leg(chain).state == rank {
                    if let Some(status) = OrderStatus::for_leg(chain, rank) {
                        return status;
                    }
                }
            }
        }

        if self.remaining_amount == 0 {
            OrderStatus::Filled
        } else if self.remaining_amount < self.total_amount {
            OrderStatus::Partial
        } else {
            OrderStatus::Open
        }
    }

    /// No further observation can require relayer action.
    ///
    /// A locked leg always keeps the order live, whatever the fill state.
    pub fn is_terminal(&self) -> bool {
        if self.cancelled {
            return true;
        }
        let any_locked = Chain::ALL
            .iter()
            .any(|c| self.leg(*c).state == LockState::Locked);
        if any_locked {
            return false;
        }
        let any_settled = Chain::ALL.iter().any(|c| self.leg(*c).state.is_settled());
        any_settled || self.remaining_amount == 0
    }

    /// Fold an observed HTLC event into the matching leg
    pub fn apply_event(&mut self, event: &HtlcEvent) -> RelayerResult<bool> {
        if event.hashlock != self.hashlock {
            return Err(RelayerError::Internal(format!(
                "event for {} applied to order {} ({})",
                event.hashlock, self.order_id, self.hashlock
            )));
        }

        if event.kind == HtlcEventKind::Redeem {
            match &event.secret {
                Some(secret) if secret.matches(&self.hashlock) => {}
                _ => {
                    return Err(RelayerError::InvalidSecret {
                        hashlock: self.hashlock.to_hex(),
                    })
                }
            }
        }

        let changed = self.leg_mut(event.chain).apply(event.chain, event)?;
        if changed && event.kind == HtlcEventKind::Redeem && self.revealed_secret.is_none() {
            self.revealed_secret = event.secret;
        }
        Ok(changed)
    }

    /// Record a partial fill. Returns false for a replayed fill id.
    pub fn apply_fill(&mut self, request: FillRequest) -> RelayerResult<bool> {
        let reject = |reason: String| RelayerError::InvalidFill {
            order_id: self.order_id.clone(),
            reason,
        };

        if let Some(id) = &request.fill_id {
            if self.fills.iter().any(|f| &f.fill_id == id) {
                return Ok(false);
            }
        }
        if self.cancelled {
            return Err(reject("order is cancelled".to_string()));
        }
        if request.tx_id.trim().is_empty() {
            return Err(reject("fill has no transaction id".to_string()));
        }
        if request.amount == 0 {
            return Err(reject("amount must be positive".to_string()));
        }
        if request.amount > self.remaining_amount {
            return Err(reject(format!(
                "amount {} exceeds remaining {}",
                request.amount, self.remaining_amount
            )));
        }
        if request.amount > self.max_fill_amount {
            return Err(reject(format!(
                "amount {} exceeds max fill {}",
                request.amount, self.max_fill_amount
            )));
        }
        if request.amount < self.min_fill_amount && request.amount != self.remaining_amount {
            return Err(reject(format!(
                "amount {} below min fill {}",
                request.amount, self.min_fill_amount
            )));
        }

        self.remaining_amount -= request.amount;
        self.fills.push(Fill {
            fill_id: request
                .fill_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            amount: request.amount,
            tx_id: request.tx_id,
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    /// Cancel before either leg has been touched
    pub fn cancel(&mut self) -> RelayerResult<()> {
        if self.cancelled {
            return Ok(());
        }
        for chain in Chain::ALL {
            let state = self.leg(chain).state;
            if state != LockState::Unlocked {
                return Err(RelayerError::InvalidStateTransition {
                    chain,
                    from: state.as_str().to_string(),
                    to: "cancelled".to_string(),
                });
            }
        }
        if self.is_terminal() {
            return Err(RelayerError::InvalidOrder(format!(
                "order {} is {} and cannot be cancelled",
                self.order_id,
                self.status()
            )));
        }
        self.cancelled = true;
        Ok(())
    }

    /// Effective locktime for a leg, preferring what the chain reported
    pub fn leg_locktime(&self, chain: Chain) -> u64 {
        self.leg(chain).locktime.unwrap_or(self.locktime)
    }

    pub fn filled_amount(&self) -> u128 {
        self.fills.iter().map(|f| f.amount).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::test_support::event;

    pub fn secret() -> Secret {
        Secret([0x5a; 32])
    }

    pub fn request(order_id: &str, total: u128, min: u128, max: u128) -> OrderRequest {
        OrderRequest {
            order_id: order_id.to_string(),
            hashlock: secret().hashlock(),
            total_amount: total,
            min_fill_amount: min,
            max_fill_amount: max,
            recipient_address: "bc1qrecipient".to_string(),
            refund_address: "0xrefund".to_string(),
            locktime: 800_000,
            network: "testnet".to_string(),
            chain: Chain::Bitcoin,
            secret: None,
            bitcoin_htlc_script: None,
        }
    }

    pub fn order() -> Order {
        Order::new(request("order-1", 100_000, 10_000, 50_000)).unwrap()
    }

    fn lock(chain: Chain, tx: &str, amount: u128) -> HtlcEvent {
        let mut ev = event(HtlcEventKind::Lock, chain, tx, secret().hashlock());
        ev.amount = amount;
        ev
    }

    fn redeem(chain: Chain, tx: &str) -> HtlcEvent {
        let mut ev = event(HtlcEventKind::Redeem, chain, tx, secret().hashlock());
        ev.secret = Some(secret());
        ev
    }

    #[test]
    fn test_new_order_validates_terms() {
        assert!(Order::new(request("ok", 100, 10, 50)).is_ok());
        assert!(matches!(
            Order::new(request("bad", 100, 60, 50)),
            Err(RelayerError::InvalidOrder(_))
        ));
        assert!(matches!(
            Order::new(request("bad", 100, 10, 150)),
            Err(RelayerError::InvalidOrder(_))
        ));
        assert!(matches!(
            Order::new(request("../etc", 100, 10, 50)),
            Err(RelayerError::InvalidOrder(_))
        ));

        let mut wrong_secret = request("s", 100, 10, 50);
        wrong_secret.secret = Some(Secret([1u8; 32]));
        assert!(matches!(
            Order::new(wrong_secret),
            Err(RelayerError::InvalidSecret { .. })
        ));
    }

    #[test]
    fn test_lock_does_not_touch_remaining() {
        let mut order = order();
        assert_eq!(order.status(), OrderStatus::Open);

        assert!(order.apply_event(&lock(Chain::Bitcoin, "btc-lock", 30_000)).unwrap());
        assert_eq!(order.status(), OrderStatus::BtcLocked);
        assert_eq!(order.remaining_amount, 100_000);
        assert_eq!(order.bitcoin.lock.as_ref().unwrap().amount, 30_000);
        assert!(!order.is_terminal());
    }

    #[test]
    fn test_reapplying_an_event_is_noop() {
        let mut order = order();
        let ev = lock(Chain::Ethereum, "0xlock", 1);
        assert!(order.apply_event(&ev).unwrap());
        let snapshot = order.clone();
        assert!(!order.apply_event(&ev).unwrap());
        assert_eq!(order, snapshot);
    }

    #[test]
    fn test_redeem_reveals_secret_and_requires_preimage() {
        let mut order = order();
        order.apply_event(&lock(Chain::Bitcoin, "l", 1)).unwrap();

        let mut bad = redeem(Chain::Bitcoin, "r");
        bad.secret = Some(Secret([9u8; 32]));
        assert!(matches!(
            order.apply_event(&bad),
            Err(RelayerError::InvalidSecret { .. })
        ));
        assert_eq!(order.bitcoin.state, LockState::Locked);

        assert!(order.apply_event(&redeem(Chain::Bitcoin, "r")).unwrap());
        assert_eq!(order.status(), OrderStatus::BtcRedeemed);
        assert_eq!(order.revealed_secret, Some(secret()));
    }

    #[test]
    fn test_refund_after_redeem_is_rejected() {
        let mut order = order();
        order.apply_event(&redeem(Chain::Ethereum, "r")).unwrap();

        let refund = event(HtlcEventKind::Refund, Chain::Ethereum, "f", secret().hashlock());
        let err = order.apply_event(&refund).unwrap_err();
        assert!(matches!(
            err,
            RelayerError::InvalidStateTransition { chain: Chain::Ethereum, .. }
        ));
        assert_eq!(order.ethereum.state, LockState::Redeemed);
    }

    #[test]
    fn test_late_lock_after_settlement_keeps_state() {
        let mut order = order();
        order.apply_event(&redeem(Chain::Bitcoin, "r")).unwrap();
        assert!(order.apply_event(&lock(Chain::Bitcoin, "l", 5)).unwrap());
        assert_eq!(order.bitcoin.state, LockState::Redeemed);
        assert!(order.bitcoin.lock.is_some());
    }

    #[test]
    fn test_status_prefers_most_advanced_leg() {
        let mut order = order();
        order.apply_event(&lock(Chain::Bitcoin, "bl", 1)).unwrap();
        order.apply_event(&lock(Chain::Ethereum, "el", 1)).unwrap();
        assert_eq!(order.status(), OrderStatus::BtcLocked);

        order.apply_event(&redeem(Chain::Ethereum, "er")).unwrap();
        assert_eq!(order.status(), OrderStatus::EthRedeemed);
        assert!(!order.is_terminal());

        order.apply_event(&redeem(Chain::Bitcoin, "br")).unwrap();
        assert_eq!(order.status(), OrderStatus::BtcRedeemed);
        assert!(order.is_terminal());
    }

    #[test]
    fn test_fill_sequence() {
        let mut order = Order::new(request("fills", 50_000, 10_000, 25_000)).unwrap();
        let fill = |amount: u128, tx: &str| FillRequest {
            fill_id: None,
            amount,
            tx_id: tx.to_string(),
        };

        assert!(order.apply_fill(fill(15_000, "tx1")).unwrap());
        assert!(order.apply_fill(fill(20_000, "tx2")).unwrap());
        assert_eq!(order.remaining_amount, 15_000);
        assert_eq!(order.status(), OrderStatus::Partial);

        let err = order.apply_fill(fill(20_000, "tx3")).unwrap_err();
        match err {
            RelayerError::InvalidFill { reason, .. } => assert!(reason.contains("exceeds remaining")),
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(order.remaining_amount, order.total_amount - order.filled_amount());
    }

    #[test]
    fn test_fill_bounds() {
        let mut order = Order::new(request("bounds", 50_000, 10_000, 25_000)).unwrap();
        let fill = |amount: u128, tx: &str| FillRequest {
            fill_id: None,
            amount,
            tx_id: tx.to_string(),
        };

        assert!(order.apply_fill(fill(0, "t")).is_err());
        assert!(order.apply_fill(fill(30_000, "t")).is_err());
        assert!(order.apply_fill(fill(5_000, "t")).is_err());
        assert!(order.apply_fill(fill(10_000, "")).is_err());

        order.apply_fill(fill(25_000, "a")).unwrap();
        order.apply_fill(fill(20_000, "b")).unwrap();
        // Below the minimum but completes the order
        assert!(order.apply_fill(fill(5_000, "c")).unwrap());
        assert_eq!(order.status(), OrderStatus::Filled);
        assert!(order.is_terminal());
    }

    #[test]
    fn test_duplicate_fill_id_is_noop() {
        let mut order = order();
        let fill = FillRequest {
            fill_id: Some("f-1".to_string()),
            amount: 20_000,
            tx_id: "tx".to_string(),
        };
        assert!(order.apply_fill(fill.clone()).unwrap());
        assert!(!order.apply_fill(fill).unwrap());
        assert_eq!(order.remaining_amount, 80_000);
        assert_eq!(order.fills.len(), 1);
    }

    #[test]
    fn test_cancel_only_before_lock() {
        let mut order = order();
        order.cancel().unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert!(order.is_terminal());

        let mut locked = super::tests::order();
        locked.apply_event(&lock(Chain::Ethereum, "l", 1)).unwrap();
        assert!(matches!(
            locked.cancel(),
            Err(RelayerError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_status_parse_and_serde() {
        assert_eq!("btc_locked".parse::<OrderStatus>().unwrap(), OrderStatus::BtcLocked);
        assert!("locked".parse::<OrderStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&OrderStatus::EthRefunded).unwrap(),
            "\"eth_refunded\""
        );
    }

    #[test]
    fn test_order_record_roundtrip_keeps_wide_amounts() {
        let mut order = Order::new(request("wei", u128::MAX, 1, u128::MAX)).unwrap();
        order.bitcoin_htlc_script = Some(vec![0xa8, 0x20]);
        let json = serde_json::to_value(&order).unwrap();
        let back: Order = serde_json::from_value(json).unwrap();
        assert_eq!(back, order);
    }
}
