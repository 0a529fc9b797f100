//! Event processor: the single funnel from observed events to order state and actions

use super::idempotency::{Claim, IdempotencyCache};
use crate::chain::{Chain, ChainClock};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{EventDelivery, HtlcEvent};
use crate::state::{ActionRecord, ActionState, FillRequest, LockState, Order, OrderStore};
use crate::tx::{
    action_key, parse_action_key, ActionKind, ActionOutcome, ActionResult, CrossChainAction,
    LockRef, Priority,
};
use crate::types::{Hashlock, Secret};

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// What became of one delivered event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Already applied or being applied
    Duplicate,
    /// No tracked order holds the hashlock
    Unmatched,
    Applied { orders: usize, actions: usize },
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_events_in_flight(now);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        crate::metrics::set_events_in_flight(now);
    }
}

/// Applies HTLC events to orders and plans the cross-chain actions they imply.
///
/// Events sharing a hashlock are serialized on a per-hashlock mutex; distinct
/// hashlocks proceed concurrently. Every planned action is recorded on its
/// order before it is handed to the dispatcher, so an action key is never
/// dispatched twice.
pub struct EventProcessor {
    store: Arc<OrderStore>,
    idempotency: IdempotencyCache,
    hashlock_locks: DashMap<Hashlock, Arc<Mutex<()>>>,
    actions: mpsc::UnboundedSender<CrossChainAction>,
    /// Chains with an active resolver
    action_chains: Vec<Chain>,
    auto_refund_chains: Vec<Chain>,
    urgent_window_secs: u64,
    clock: std::sync::Mutex<ChainClock>,
    in_flight: AtomicUsize,
}

impl EventProcessor {
    pub fn new(
        store: Arc<OrderStore>,
        config: &RelayerConfig,
        action_chains: Vec<Chain>,
        actions: mpsc::UnboundedSender<CrossChainAction>,
    ) -> Self {
        Self {
            store,
            idempotency: IdempotencyCache::new(
                Duration::from_secs(config.idempotency_ttl_secs),
                config.idempotency_capacity,
            ),
            hashlock_locks: DashMap::new(),
            actions,
            action_chains,
            auto_refund_chains: config.auto_refund_chains.clone(),
            urgent_window_secs: config.urgent_window_secs,
            clock: std::sync::Mutex::new(ChainClock::default()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    /// Events currently being applied
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn clock(&self) -> ChainClock {
        *self.clock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn advance_clock(&self, f: impl FnOnce(&mut ChainClock)) -> ChainClock {
        let mut clock = self.clock.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut clock);
        *clock
    }

    fn hashlock_lock(&self, hashlock: &Hashlock) -> Arc<Mutex<()>> {
        self.hashlock_locks.entry(*hashlock).or_default().clone()
    }

    /// Drop the hashlock's mutex once nobody else holds a handle to it
    fn release_hashlock_lock(&self, hashlock: &Hashlock) {
        self.hashlock_locks
            .remove_if(hashlock, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Process a watcher delivery and settle its receipt.
    ///
    /// Storage failures leave the receipt unsettled so the watcher rescans the
    /// block; every other outcome is final for that event.
    pub async fn deliver(&self, delivery: EventDelivery) {
        let event = delivery.event.clone();
        let settled = match self.process_event(event).await {
            Ok(_) => true,
            Err(e) if e.is_storage_failure() => {
                warn!(
                    chain = %delivery.event.chain,
                    tx_id = %delivery.event.tx_id,
                    hashlock = %delivery.event.hashlock.short(),
                    error = %e,
                    "Event not persisted, block will be rescanned"
                );
                false
            }
            Err(e) => {
                debug!(error = %e, "Event not applied");
                true
            }
        };
        delivery.settle(settled);
    }

    /// Fold one observed event into every order holding its hashlock
    pub async fn process_event(&self, event: HtlcEvent) -> RelayerResult<EventOutcome> {
        let key = event.idempotency_key();
        match self.idempotency.try_acquire(&key) {
            Claim::Acquired => {}
            claim => {
                debug!(key = %key, ?claim, "Duplicate event dropped");
                crate::metrics::record_duplicate_event(event.chain);
                return Ok(EventOutcome::Duplicate);
            }
        }

        let _in_flight = InFlightGuard::enter(&self.in_flight);
        let clock = self.advance_clock(|c| c.observe(&event));

        let lock = self.hashlock_lock(&event.hashlock);
        let result = {
            let _serialized = lock.lock().await;
            self.apply_to_orders(&event, &clock).await
        };
        drop(lock);
        self.release_hashlock_lock(&event.hashlock);

        match &result {
            Ok(EventOutcome::Applied { .. }) => self.idempotency.mark_applied(&key),
            _ => self.idempotency.release(&key),
        }
        result
    }

    async fn apply_to_orders(
        &self,
        event: &HtlcEvent,
        clock: &ChainClock,
    ) -> RelayerResult<EventOutcome> {
        let order_ids = self.store.order_ids_for_hashlock(&event.hashlock);
        if order_ids.is_empty() {
            info!(
                chain = %event.chain,
                kind = %event.kind,
                tx_id = %event.tx_id,
                hashlock = %event.hashlock.short(),
                "No order tracks this hashlock, discarding event"
            );
            return Ok(EventOutcome::Unmatched);
        }

        let mut applied = 0;
        let mut dispatched = 0;
        let mut last_error = None;
        let mut storage_error = None;

        for order_id in &order_ids {
            let result = self
                .store
                .update(order_id, |order| {
                    if order.cancelled {
                        return Ok((false, order.status(), Vec::new()));
                    }
                    let changed = order.apply_event(event)?;
                    let actions = self.plan_redeems(order, clock);
                    for action in &actions {
                        order
                            .actions
                            .insert(action.idempotency_key(), ActionRecord::dispatched());
                    }
                    Ok((changed, order.status(), actions))
                })
                .await;

            match result {
                Ok((changed, status, actions)) => {
                    applied += 1;
                    if changed {
                        info!(
                            order_id = %order_id,
                            chain = %event.chain,
                            kind = %event.kind,
                            tx_id = %event.tx_id,
                            status = %status,
                            "Order updated"
                        );
                    }
                    for action in actions {
                        self.dispatch(action);
                        dispatched += 1;
                    }
                }
                Err(e) => {
                    error!(
                        order_id = %order_id,
                        hashlock = %event.hashlock.short(),
                        chain = %event.chain,
                        tx_id = %event.tx_id,
                        error = %e,
                        "Failed to apply event"
                    );
                    crate::metrics::record_event_error(event.chain, e.kind());
                    if e.is_storage_failure() {
                        storage_error = Some(e);
                    } else {
                        last_error = Some(e);
                    }
                }
            }
        }

        // Unpersisted orders must see the event again; re-applying it elsewhere is a no-op
        if let Some(e) = storage_error {
            return Err(e);
        }

        match (applied, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(EventOutcome::Applied {
                orders: applied,
                actions: dispatched,
            }),
        }
    }

    /// Redeems implied by the order's current legs.
    ///
    /// A redeem on chain Y requires leg Y locked and the secret revealed by an
    /// on-chain redeem of the other leg. Keys already on the order are skipped.
    fn plan_redeems(&self, order: &Order, clock: &ChainClock) -> Vec<CrossChainAction> {
        if order.is_terminal() {
            return Vec::new();
        }
        let Some(secret) = order.revealed_secret else {
            return Vec::new();
        };

        let mut planned = Vec::new();
        for target in Chain::ALL {
            if order.leg(target).state != LockState::Locked
                || order.leg(target.counterpart()).state != LockState::Redeemed
            {
                continue;
            }
            if order
                .actions
                .contains_key(&action_key(target, &order.hashlock, ActionKind::Redeem))
            {
                continue;
            }
            if !self.action_chains.contains(&target) {
                warn!(
                    order_id = %order.order_id,
                    chain = %target,
                    "Secret revealed but no resolver is enabled; redeem must be done manually"
                );
                continue;
            }
            planned.push(self.build_action(order, target, ActionKind::Redeem, Some(secret), clock));
        }
        planned
    }

    fn build_action(
        &self,
        order: &Order,
        target: Chain,
        kind: ActionKind,
        secret: Option<Secret>,
        clock: &ChainClock,
    ) -> CrossChainAction {
        let leg = order.leg(target);
        let locktime = order.leg_locktime(target);

        let priority = match (kind, clock.secs_until(target, locktime)) {
            (ActionKind::Redeem, Some(secs)) if secs <= self.urgent_window_secs => Priority::High,
            _ => Priority::Normal,
        };

        CrossChainAction {
            kind,
            target_chain: target,
            hashlock: order.hashlock,
            secret,
            order_id: order.order_id.clone(),
            priority,
            lock_ref: leg.lock.as_ref().map(|lock| LockRef {
                tx_id: lock.tx_id.clone(),
                output_index: leg.output_index,
                amount: lock.amount,
            }),
            locktime: Some(locktime),
            destination: Some(match kind {
                ActionKind::Redeem => order.recipient_address.clone(),
                ActionKind::Refund => order.refund_address.clone(),
            }),
        }
    }

    fn dispatch(&self, action: CrossChainAction) {
        info!(
            order_id = %action.order_id,
            chain = %action.target_chain,
            kind = %action.kind,
            hashlock = %action.hashlock.short(),
            priority = ?action.priority,
            "Dispatching action"
        );
        crate::metrics::record_action_dispatched(action.target_chain, action.kind.as_str());
        if self.actions.send(action).is_err() {
            // Still recorded as dispatched; resumed on next start
            error!("Action channel closed");
        }
    }

    /// Record a partial fill on an order
    pub async fn apply_fill(&self, order_id: &str, fill: FillRequest) -> RelayerResult<Order> {
        let changed = self.store.update(order_id, |o| o.apply_fill(fill)).await?;
        let order = self
            .store
            .get(order_id)
            .await
            .ok_or_else(|| RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        if changed {
            crate::metrics::record_fill(order.chain);
            info!(
                order_id,
                remaining = %order.remaining_amount,
                status = %order.status(),
                "Fill applied"
            );
        }
        Ok(order)
    }

    /// Cancel an order whose legs are both still unlocked
    pub async fn cancel(&self, order_id: &str) -> RelayerResult<Order> {
        let hashlock = self
            .store
            .get(order_id)
            .await
            .map(|o| o.hashlock)
            .ok_or_else(|| RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        let lock = self.hashlock_lock(&hashlock);
        let result = {
            let _serialized = lock.lock().await;
            self.store.update(order_id, |o| o.cancel()).await
        };
        drop(lock);
        self.release_hashlock_lock(&hashlock);
        result?;

        info!(order_id, "Order cancelled");
        self.store
            .get(order_id)
            .await
            .ok_or_else(|| RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    fn refund_due(&self, order: &Order, chain: Chain, clock: &ChainClock) -> bool {
        if order.is_terminal() || order.leg(chain).state != LockState::Locked {
            return false;
        }
        if order
            .actions
            .contains_key(&action_key(chain, &order.hashlock, ActionKind::Refund))
        {
            return false;
        }
        let redeem_pending = order
            .actions
            .get(&action_key(chain, &order.hashlock, ActionKind::Redeem))
            .is_some_and(|r| r.state != ActionState::Abandoned);
        !redeem_pending && clock.is_expired(chain, order.leg_locktime(chain))
    }

    /// Dispatch refunds for locked legs whose timelock has passed.
    ///
    /// Only chains in `auto_refund_chains` with an enabled resolver are swept.
    pub async fn sweep_expired(&self, reading: ChainClock) -> RelayerResult<usize> {
        let clock = self.advance_clock(|c| c.merge(&reading));
        let chains: Vec<Chain> = self
            .auto_refund_chains
            .iter()
            .copied()
            .filter(|c| self.action_chains.contains(c))
            .collect();
        if chains.is_empty() {
            return Ok(0);
        }

        let mut dispatched = 0;
        for order in self.store.list().await {
            for chain in &chains {
                if !self.refund_due(&order, *chain, &clock) {
                    continue;
                }

                let lock = self.hashlock_lock(&order.hashlock);
                let planned = {
                    let _serialized = lock.lock().await;
                    self.store
                        .update(&order.order_id, |o| {
                            if !self.refund_due(o, *chain, &clock) {
                                return Ok(None);
                            }
                            let action = self.build_action(o, *chain, ActionKind::Refund, None, &clock);
                            o.actions
                                .insert(action.idempotency_key(), ActionRecord::dispatched());
                            Ok(Some(action))
                        })
                        .await
                };
                drop(lock);
                self.release_hashlock_lock(&order.hashlock);

                match planned {
                    Ok(Some(action)) => {
                        warn!(
                            order_id = %order.order_id,
                            chain = %chain,
                            locktime = order.leg_locktime(*chain),
                            "Timelock expired, refunding"
                        );
                        self.dispatch(action);
                        dispatched += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(order_id = %order.order_id, chain = %chain, error = %e, "Refund sweep failed");
                    }
                }
            }
        }

        Ok(dispatched)
    }

    /// Fold a resolver result back into the order's action record
    pub async fn record_outcome(&self, outcome: ActionOutcome) -> RelayerResult<()> {
        let key = outcome.key.clone();
        self.store
            .update(&outcome.order_id, |order| {
                let record = order.actions.get_mut(&key).ok_or_else(|| {
                    RelayerError::Internal(format!(
                        "order {} has no action {}",
                        order.order_id, key
                    ))
                })?;
                record.attempts = outcome.attempts;
                record.updated_at = Utc::now();
                match &outcome.result {
                    ActionResult::Succeeded { tx_id } => {
                        record.state = ActionState::Succeeded;
                        record.tx_id = Some(tx_id.clone());
                        record.last_error = None;
                    }
                    ActionResult::Abandoned { error } => {
                        record.state = ActionState::Abandoned;
                        record.last_error = Some(error.clone());
                    }
                }
                Ok(())
            })
            .await
    }

    /// Re-dispatch actions persisted as dispatched by a previous run
    pub async fn resume_pending(&self) -> RelayerResult<usize> {
        let clock = self.clock();
        let mut resumed = 0;

        for order in self.store.list().await {
            let pending: Vec<String> = order
                .actions
                .iter()
                .filter(|(_, record)| record.state == ActionState::Dispatched)
                .map(|(key, _)| key.clone())
                .collect();

            for key in pending {
                let rebuilt = parse_action_key(&key).and_then(|(chain, _, kind)| {
                    if !self.action_chains.contains(&chain) {
                        return None;
                    }
                    match kind {
                        ActionKind::Redeem => order
                            .revealed_secret
                            .map(|s| self.build_action(&order, chain, kind, Some(s), &clock)),
                        ActionKind::Refund => Some(self.build_action(&order, chain, kind, None, &clock)),
                    }
                });

                match rebuilt {
                    Some(action) => {
                        self.dispatch(action);
                        resumed += 1;
                    }
                    None => {
                        warn!(order_id = %order.order_id, key = %key, "Cannot resume action, abandoning");
                        self.record_outcome(ActionOutcome {
                            key,
                            order_id: order.order_id.clone(),
                            attempts: 0,
                            result: ActionResult::Abandoned {
                                error: "not resumable".to_string(),
                            },
                        })
                        .await?;
                    }
                }
            }
        }

        if resumed > 0 {
            info!(resumed, "Resumed pending actions");
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::event;
    use crate::events::HtlcEventKind;
    use crate::state::order::tests::{request, secret};
    use crate::state::{FileRecordStore, OrderStatus};
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    struct Harness {
        _dir: TempDir,
        store: Arc<OrderStore>,
        processor: Arc<EventProcessor>,
        actions: mpsc::UnboundedReceiver<CrossChainAction>,
    }

    fn relayer_config(extra: &str) -> RelayerConfig {
        toml::from_str(&format!("instance_id = \"test\"\n{}", extra)).unwrap()
    }

    async fn harness_with(config: RelayerConfig, action_chains: Vec<Chain>) -> Harness {
        let dir = TempDir::new().unwrap();
        let records = Arc::new(FileRecordStore::open(dir.path()).await.unwrap());
        let store = Arc::new(OrderStore::new(records));
        let (tx, rx) = mpsc::unbounded_channel();
        let processor = Arc::new(EventProcessor::new(store.clone(), &config, action_chains, tx));
        Harness {
            _dir: dir,
            store,
            processor,
            actions: rx,
        }
    }

    async fn harness() -> Harness {
        harness_with(relayer_config(""), Chain::ALL.to_vec()).await
    }

    async fn create(h: &Harness) -> Order {
        let order = Order::new(request("swap-1", 100_000, 10_000, 50_000)).unwrap();
        h.store.create(order).await.unwrap()
    }

    fn lock(chain: Chain, tx: &str, amount: u128, locktime: u64) -> HtlcEvent {
        let mut ev = event(HtlcEventKind::Lock, chain, tx, secret().hashlock());
        ev.amount = amount;
        ev.locktime = Some(locktime);
        ev
    }

    fn redeem(chain: Chain, tx: &str) -> HtlcEvent {
        let mut ev = event(HtlcEventKind::Redeem, chain, tx, secret().hashlock());
        ev.secret = Some(secret());
        ev
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CrossChainAction>) -> Vec<CrossChainAction> {
        let mut out = Vec::new();
        while let Ok(action) = rx.try_recv() {
            out.push(action);
        }
        out
    }

    #[tokio::test]
    async fn test_lock_is_not_a_fill() {
        let mut h = harness().await;
        create(&h).await;

        let outcome = h
            .processor
            .process_event(lock(Chain::Bitcoin, "btc-lock", 30_000, 800_000))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Applied { orders: 1, actions: 0 });

        let order = h.store.get("swap-1").await.unwrap();
        assert_eq!(order.status(), OrderStatus::BtcLocked);
        assert_eq!(order.remaining_amount, 100_000);
        assert!(drain(&mut h.actions).is_empty());
    }

    #[tokio::test]
    async fn test_redeem_on_one_chain_triggers_redeem_on_the_other() {
        let mut h = harness().await;
        create(&h).await;

        h.processor
            .process_event(lock(Chain::Ethereum, "0xeth-lock", 30_000, 1_900_000_000))
            .await
            .unwrap();
        h.processor
            .process_event(lock(Chain::Bitcoin, "btc-lock", 30_000, 800_000))
            .await
            .unwrap();
        let outcome = h
            .processor
            .process_event(redeem(Chain::Bitcoin, "btc-redeem"))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Applied { orders: 1, actions: 1 });

        let actions = drain(&mut h.actions);
        assert_eq!(actions.len(), 1);
        let action = &actions[0];
        assert_eq!(action.kind, ActionKind::Redeem);
        assert_eq!(action.target_chain, Chain::Ethereum);
        assert_eq!(action.secret, Some(secret()));
        assert_eq!(action.lock_ref.as_ref().unwrap().tx_id, "0xeth-lock");

        let order = h.store.get("swap-1").await.unwrap();
        assert_eq!(order.revealed_secret, Some(secret()));
        let record = &order.actions[&action.idempotency_key()];
        assert_eq!(record.state, ActionState::Dispatched);
    }

    #[tokio::test]
    async fn test_redeem_without_counter_lock_plans_nothing() {
        let mut h = harness().await;
        create(&h).await;

        h.processor
            .process_event(redeem(Chain::Bitcoin, "btc-redeem"))
            .await
            .unwrap();
        assert!(drain(&mut h.actions).is_empty());

        // The counter lock arriving later completes the picture
        h.processor
            .process_event(lock(Chain::Ethereum, "0xlate", 1, 1_900_000_000))
            .await
            .unwrap();
        let actions = drain(&mut h.actions);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].target_chain, Chain::Ethereum);
    }

    #[tokio::test]
    async fn test_reprocessing_is_idempotent() {
        let h = harness().await;
        create(&h).await;

        let ev = lock(Chain::Bitcoin, "btc-lock", 30_000, 800_000);
        h.processor.process_event(ev.clone()).await.unwrap();
        let before = h.store.get("swap-1").await.unwrap();

        let outcome = h.processor.process_event(ev).await.unwrap();
        assert_eq!(outcome, EventOutcome::Duplicate);
        assert_eq!(h.store.get("swap-1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_delivery_redeems_once() {
        let mut h = harness().await;
        create(&h).await;
        h.processor
            .process_event(lock(Chain::Ethereum, "0xeth-lock", 1, 1_900_000_000))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let processor = h.processor.clone();
            // Half are exact re-deliveries, half claim a different spending tx
            let tx = if i % 2 == 0 { "btc-redeem".to_string() } else { format!("btc-redeem-{}", i) };
            tasks.push(tokio::spawn(async move {
                processor.process_event(redeem(Chain::Bitcoin, &tx)).await
            }));
        }
        for task in tasks {
            let _ = task.await.unwrap();
        }

        assert_eq!(drain(&mut h.actions).len(), 1);
        assert_eq!(h.processor.in_flight_count(), 0);
        let order = h.store.get("swap-1").await.unwrap();
        assert_eq!(order.actions.len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_event_can_apply_later() {
        let h = harness().await;
        let ev = lock(Chain::Bitcoin, "early", 5, 800_000);

        let outcome = h.processor.process_event(ev.clone()).await.unwrap();
        assert_eq!(outcome, EventOutcome::Unmatched);

        create(&h).await;
        let outcome = h.processor.process_event(ev).await.unwrap();
        assert_eq!(outcome, EventOutcome::Applied { orders: 1, actions: 0 });
    }

    #[tokio::test]
    async fn test_conflicting_event_is_an_error_not_a_crash() {
        let h = harness().await;
        create(&h).await;
        h.processor
            .process_event(redeem(Chain::Ethereum, "0xredeem"))
            .await
            .unwrap();

        let refund = event(HtlcEventKind::Refund, Chain::Ethereum, "0xrefund", secret().hashlock());
        let err = h.processor.process_event(refund.clone()).await.unwrap_err();
        assert!(matches!(err, RelayerError::InvalidStateTransition { .. }));

        // Released, so a re-delivery is evaluated again rather than swallowed
        assert!(h.processor.process_event(refund.clone()).await.is_err());

        // Rejected for good, so the watcher may move on
        let (delivery, receipt) = EventDelivery::new(refund);
        h.processor.deliver(delivery).await;
        assert_eq!(receipt.await, Ok(true));
    }

    #[tokio::test]
    async fn test_two_locks_in_one_transaction_both_apply() {
        let h = harness().await;
        let other = Secret([0x21; 32]);
        create(&h).await;
        let mut second = request("swap-2", 100_000, 10_000, 50_000);
        second.hashlock = other.hashlock();
        h.store.create(Order::new(second).unwrap()).await.unwrap();

        let first_lock = lock(Chain::Bitcoin, "batchtx", 30_000, 800_000);
        let mut second_lock = event(HtlcEventKind::Lock, Chain::Bitcoin, "batchtx", other.hashlock());
        second_lock.amount = 20_000;
        second_lock.locktime = Some(800_000);
        second_lock.output_index = Some(1);
        second_lock.position = 1;

        for ev in [first_lock, second_lock] {
            let outcome = h.processor.process_event(ev).await.unwrap();
            assert_eq!(outcome, EventOutcome::Applied { orders: 1, actions: 0 });
        }

        for order_id in ["swap-1", "swap-2"] {
            let order = h.store.get(order_id).await.unwrap();
            assert_eq!(order.status(), OrderStatus::BtcLocked, "{}", order_id);
        }
    }

    #[tokio::test]
    async fn test_unpersisted_event_is_left_for_redelivery() {
        let h = harness().await;
        create(&h).await;
        let orders_dir = h._dir.path().join("orders");
        std::fs::remove_dir_all(&orders_dir).unwrap();

        let ev = lock(Chain::Bitcoin, "btc-lock", 30_000, 800_000);
        let (delivery, receipt) = EventDelivery::new(ev.clone());
        h.processor.deliver(delivery).await;
        assert_eq!(receipt.await, Ok(false));
        assert_eq!(
            h.store.get("swap-1").await.unwrap().status(),
            OrderStatus::Open
        );

        std::fs::create_dir_all(&orders_dir).unwrap();
        let (delivery, receipt) = EventDelivery::new(ev);
        h.processor.deliver(delivery).await;
        assert_eq!(receipt.await, Ok(true));
        assert_eq!(
            h.store.get("swap-1").await.unwrap().status(),
            OrderStatus::BtcLocked
        );
    }

    #[tokio::test]
    async fn test_missing_resolver_plans_nothing() {
        let mut h = harness_with(relayer_config(""), vec![Chain::Bitcoin]).await;
        create(&h).await;
        h.processor
            .process_event(lock(Chain::Ethereum, "0xl", 1, 1_900_000_000))
            .await
            .unwrap();
        h.processor
            .process_event(redeem(Chain::Bitcoin, "r"))
            .await
            .unwrap();
        assert!(drain(&mut h.actions).is_empty());
    }

    #[tokio::test]
    async fn test_fill_sequence_through_processor() {
        let h = harness().await;
        h.store
            .create(Order::new(request("fills", 50_000, 10_000, 25_000)).unwrap())
            .await
            .unwrap();

        let fill = |amount: u128, tx: &str| FillRequest {
            fill_id: None,
            amount,
            tx_id: tx.to_string(),
        };

        assert_ok!(h.processor.apply_fill("fills", fill(15_000, "a")).await);
        let order = assert_ok!(h.processor.apply_fill("fills", fill(20_000, "b")).await);
        assert_eq!(order.remaining_amount, 15_000);

        let err = h.processor.apply_fill("fills", fill(20_000, "c")).await.unwrap_err();
        assert!(err.to_string().contains("exceeds remaining"));
        assert_eq!(h.store.get("fills").await.unwrap().remaining_amount, 15_000);
    }

    #[tokio::test]
    async fn test_cancel_pre_lock_only() {
        let h = harness().await;
        create(&h).await;
        let order = h.processor.cancel("swap-1").await.unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);

        assert!(matches!(
            h.processor.cancel("nope").await,
            Err(RelayerError::OrderNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_sweep_refunds_expired_locks_once() {
        let mut h = harness_with(
            relayer_config("auto_refund_chains = [\"ethereum\"]"),
            Chain::ALL.to_vec(),
        )
        .await;
        create(&h).await;
        let expiry = Utc::now().timestamp() as u64 + 86_400;
        h.processor
            .process_event(lock(Chain::Ethereum, "0xlock", 1, expiry))
            .await
            .unwrap();

        let early = ChainClock {
            ethereum_time: Some(expiry - 1),
            ..Default::default()
        };
        assert_eq!(h.processor.sweep_expired(early).await.unwrap(), 0);

        let late = ChainClock {
            ethereum_time: Some(expiry),
            ..Default::default()
        };
        assert_eq!(h.processor.sweep_expired(late).await.unwrap(), 1);
        assert_eq!(h.processor.sweep_expired(late).await.unwrap(), 0);

        let actions = drain(&mut h.actions);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Refund);
        assert_eq!(actions[0].target_chain, Chain::Ethereum);
        assert_eq!(actions[0].secret, None);
    }

    #[tokio::test]
    async fn test_sweep_ignores_chains_not_listed() {
        let h = harness().await;
        create(&h).await;
        h.processor
            .process_event(lock(Chain::Ethereum, "0xlock", 1, 1_000))
            .await
            .unwrap();

        let clock = ChainClock {
            ethereum_time: Some(5_000),
            ..Default::default()
        };
        assert_eq!(h.processor.sweep_expired(clock).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_outcome_and_resume() {
        let mut h = harness().await;
        create(&h).await;
        h.processor
            .process_event(lock(Chain::Ethereum, "0xl", 1, 1_900_000_000))
            .await
            .unwrap();
        h.processor
            .process_event(redeem(Chain::Bitcoin, "r"))
            .await
            .unwrap();
        let action = drain(&mut h.actions).pop().unwrap();

        // A restart re-dispatches what was never confirmed
        assert_eq!(h.processor.resume_pending().await.unwrap(), 1);
        assert_eq!(drain(&mut h.actions), vec![action.clone()]);

        h.processor
            .record_outcome(ActionOutcome {
                key: action.idempotency_key(),
                order_id: "swap-1".to_string(),
                attempts: 2,
                result: ActionResult::Succeeded {
                    tx_id: "0xredeem".to_string(),
                },
            })
            .await
            .unwrap();

        let order = h.store.get("swap-1").await.unwrap();
        let record = &order.actions[&action.idempotency_key()];
        assert_eq!(record.state, ActionState::Succeeded);
        assert_eq!(record.tx_id.as_deref(), Some("0xredeem"));
        assert_eq!(record.attempts, 2);

        assert_eq!(h.processor.resume_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_urgent_redeem_gets_high_priority() {
        let mut h = harness().await;
        create(&h).await;

        let mut eth_lock = lock(Chain::Ethereum, "0xl", 1, 0);
        let now = Utc::now().timestamp() as u64;
        eth_lock.locktime = Some(now + 600);
        h.processor.process_event(eth_lock).await.unwrap();
        h.processor
            .process_event(redeem(Chain::Bitcoin, "r"))
            .await
            .unwrap();

        let actions = drain(&mut h.actions);
        assert_eq!(actions[0].priority, Priority::High);
    }
}
