//! Priority queue and bounded worker pool in front of the chain resolvers

use super::{ChainResolver, CrossChainAction, Priority};
use crate::chain::Chain;
use crate::config::RelayerConfig;
use crate::error::RelayerError;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Final result of driving one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Succeeded { tx_id: String },
    Abandoned { error: String },
}

/// Reported back to the event processor once an action settles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub key: String,
    pub order_id: String,
    pub attempts: u32,
    pub result: ActionResult,
}

struct Queued {
    action: CrossChainAction,
    attempts: u32,
    seq: u64,
    enqueued: Instant,
}

impl Queued {
    fn rank(&self) -> (Priority, std::cmp::Reverse<u64>) {
        (self.action.priority, std::cmp::Reverse(self.seq))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // High priority first, then FIFO
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Debug, Clone)]
struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    requeue_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff for the given failed attempt, starting at 1
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Drains planned actions into the resolvers.
///
/// At most `max_concurrent_actions` resolver calls run at once. High priority
/// actions jump the queue. Transient failures back off and retry; an action
/// refused because its timelock has not passed yet is requeued later.
pub struct ActionDispatcher {
    resolvers: HashMap<Chain, Arc<dyn ChainResolver>>,
    queue: Mutex<BinaryHeap<Queued>>,
    notify: Notify,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    outcomes: mpsc::UnboundedSender<ActionOutcome>,
    policy: RetryPolicy,
    seq: AtomicU64,
}

impl ActionDispatcher {
    pub fn new(
        resolvers: Vec<Arc<dyn ChainResolver>>,
        config: &RelayerConfig,
        outcomes: mpsc::UnboundedSender<ActionOutcome>,
    ) -> Self {
        Self {
            resolvers: resolvers.into_iter().map(|r| (r.chain(), r)).collect(),
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_actions.max(1))),
            tracker: TaskTracker::new(),
            outcomes,
            policy: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.retry_delay_ms),
                max_delay: Duration::from_millis(config.max_retry_delay_ms),
                requeue_delay: Duration::from_secs(config.requeue_delay_secs),
            },
            seq: AtomicU64::new(0),
        }
    }

    /// Chains this dispatcher can act on
    pub fn chains(&self) -> Vec<Chain> {
        let mut chains: Vec<Chain> = self.resolvers.keys().copied().collect();
        chains.sort();
        chains
    }

    /// Actions waiting for a worker
    pub fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Queued>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn enqueue(&self, action: CrossChainAction) {
        self.push(action, 0);
    }

    fn push(&self, action: CrossChainAction, attempts: u32) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.lock_queue().push(Queued {
            action,
            attempts,
            seq,
            enqueued: Instant::now(),
        });
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Queued> {
        self.lock_queue().pop()
    }

    /// Receive actions and work the queue until cancelled, then wait for
    /// in-flight resolver calls to finish.
    pub async fn run(
        self: Arc<Self>,
        mut actions: mpsc::UnboundedReceiver<CrossChainAction>,
        cancel: CancellationToken,
    ) {
        info!(chains = ?self.chains(), "Action dispatcher started");

        let mut receiving = true;
        while receiving {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = actions.recv() => match received {
                    Some(action) => self.enqueue(action),
                    None => break,
                },
                _ = self.notify.notified() => {}
            }

            if !self.drain(&mut actions, &mut receiving, &cancel).await {
                break;
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!(queued = self.queued(), "Action dispatcher stopped");
    }

    /// Hand queued actions to workers as permits free up. Actions arriving
    /// while every worker is busy still enter the heap, so a late high
    /// priority redeem takes the next free permit. Returns false once cancelled.
    async fn drain(
        self: &Arc<Self>,
        actions: &mut mpsc::UnboundedReceiver<CrossChainAction>,
        receiving: &mut bool,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            if self.queued() == 0 {
                return true;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                received = actions.recv(), if *receiving => {
                    match received {
                        Some(action) => self.enqueue(action),
                        None => *receiving = false,
                    }
                    continue;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return false,
                },
            };
            while let Ok(action) = actions.try_recv() {
                self.enqueue(action);
            }
            let Some(job) = self.pop() else {
                return true;
            };

            let dispatcher = self.clone();
            let cancel = cancel.clone();
            self.tracker
                .spawn(async move { dispatcher.execute(job, permit, cancel).await });
        }
    }

    fn report(&self, job: &Queued, attempts: u32, result: ActionResult) {
        let outcome = ActionOutcome {
            key: job.action.idempotency_key(),
            order_id: job.action.order_id.clone(),
            attempts,
            result,
        };
        if self.outcomes.send(outcome).is_err() {
            warn!("Outcome channel closed");
        }
    }

    fn abandon(&self, job: &Queued, attempts: u32, error: &RelayerError) {
        let action = &job.action;
        error!(
            order_id = %action.order_id,
            chain = %action.target_chain,
            kind = %action.kind,
            attempts,
            error = %error,
            "Action abandoned"
        );
        crate::metrics::record_action_abandoned(action.target_chain, action.kind.as_str(), error.kind());
        self.report(
            job,
            attempts,
            ActionResult::Abandoned {
                error: error.to_string(),
            },
        );
    }

    async fn execute(self: Arc<Self>, job: Queued, permit: OwnedSemaphorePermit, cancel: CancellationToken) {
        let action = &job.action;
        let Some(resolver) = self.resolvers.get(&action.target_chain).cloned() else {
            let err = RelayerError::Internal(format!("no resolver for {}", action.target_chain));
            self.abandon(&job, job.attempts, &err);
            return;
        };

        let mut attempts = job.attempts;
        let mut retries = 0;
        loop {
            attempts += 1;
            debug!(
                order_id = %action.order_id,
                chain = %action.target_chain,
                kind = %action.kind,
                attempt = attempts,
                "Executing action"
            );

            match resolver.execute_action(action).await {
                Ok(tx_id) => {
                    info!(
                        order_id = %action.order_id,
                        chain = %action.target_chain,
                        kind = %action.kind,
                        tx_id = %tx_id,
                        "Action broadcast"
                    );
                    crate::metrics::record_action_succeeded(
                        action.target_chain,
                        action.kind.as_str(),
                        job.enqueued.elapsed().as_secs_f64(),
                    );
                    self.report(&job, attempts, ActionResult::Succeeded { tx_id });
                    return;
                }
                Err(e @ RelayerError::TimelockNotExpired { .. }) => {
                    info!(
                        order_id = %action.order_id,
                        chain = %action.target_chain,
                        error = %e,
                        "Timelock not reached yet, requeueing"
                    );
                    drop(permit);
                    self.requeue_later(job, attempts, cancel);
                    return;
                }
                Err(e) if e.is_retryable() && retries < self.policy.max_retries => {
                    retries += 1;
                    let delay = self.policy.backoff(retries);
                    warn!(
                        order_id = %action.order_id,
                        chain = %action.target_chain,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Action failed, retrying"
                    );
                    crate::metrics::record_action_retry(action.target_chain, e.kind());
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.abandon(&job, attempts, &e);
                    return;
                }
            }
        }
    }

    fn requeue_later(self: &Arc<Self>, job: Queued, attempts: u32, cancel: CancellationToken) {
        let dispatcher = self.clone();
        let delay = self.policy.requeue_delay;
        self.tracker.spawn(async move {
            tokio::select! {
                // Stays dispatched on the order and is resumed on the next start
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => dispatcher.push(job.action, attempts),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{ActionKind, MockChainResolver};
    use crate::types::Secret;
    use std::sync::atomic::AtomicUsize;

    fn config(extra: &str) -> RelayerConfig {
        toml::from_str(&format!(
            "instance_id = \"test\"\nretry_delay_ms = 1\nmax_retry_delay_ms = 5\n{}",
            extra
        ))
        .unwrap()
    }

    fn action(order_id: &str, priority: Priority) -> CrossChainAction {
        CrossChainAction {
            kind: ActionKind::Redeem,
            target_chain: Chain::Ethereum,
            hashlock: Secret([9u8; 32]).hashlock(),
            secret: Some(Secret([9u8; 32])),
            order_id: order_id.to_string(),
            priority,
            lock_ref: None,
            locktime: None,
            destination: None,
        }
    }

    fn resolver(mock: MockChainResolver) -> Vec<Arc<dyn ChainResolver>> {
        vec![Arc::new(mock)]
    }

    fn start(
        dispatcher: ActionDispatcher,
    ) -> (
        mpsc::UnboundedSender<CrossChainAction>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(dispatcher).run(rx, cancel.clone()));
        (tx, cancel, handle)
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            requeue_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_queue_prefers_high_priority_then_fifo() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = ActionDispatcher::new(Vec::new(), &config(""), tx);
        dispatcher.enqueue(action("a", Priority::Normal));
        dispatcher.enqueue(action("b", Priority::Normal));
        dispatcher.enqueue(action("c", Priority::High));

        let order: Vec<String> = std::iter::from_fn(|| dispatcher.pop())
            .map(|q| q.action.order_id)
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_success_reports_tx_id() {
        let mut mock = MockChainResolver::new();
        mock.expect_chain().return_const(Chain::Ethereum);
        mock.expect_execute_action()
            .times(1)
            .returning(|_| Ok("0xabc".to_string()));

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let dispatcher = ActionDispatcher::new(resolver(mock), &config(""), out_tx);
        let (tx, cancel, handle) = start(dispatcher);

        tx.send(action("o1", Priority::Normal)).unwrap();
        let outcome = out_rx.recv().await.unwrap();
        assert_eq!(outcome.order_id, "o1");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.result,
            ActionResult::Succeeded {
                tx_id: "0xabc".to_string()
            }
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let mut mock = MockChainResolver::new();
        mock.expect_chain().return_const(Chain::Ethereum);
        mock.expect_execute_action().times(3).returning(move |_| {
            if seen.fetch_add(1, AtomicOrdering::SeqCst) < 2 {
                Err(RelayerError::BroadcastFailure {
                    chain: Chain::Ethereum,
                    message: "node busy".into(),
                })
            } else {
                Ok("0xdef".to_string())
            }
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let dispatcher = ActionDispatcher::new(resolver(mock), &config(""), out_tx);
        let (tx, cancel, handle) = start(dispatcher);

        tx.send(action("o1", Priority::Normal)).unwrap();
        let outcome = out_rx.recv().await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, ActionResult::Succeeded { .. }));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_exhausted_abandons() {
        let mut mock = MockChainResolver::new();
        mock.expect_chain().return_const(Chain::Ethereum);
        mock.expect_execute_action().times(3).returning(|_| {
            Err(RelayerError::Timeout {
                operation: "broadcast".into(),
            })
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let dispatcher = ActionDispatcher::new(resolver(mock), &config("max_retries = 2"), out_tx);
        let (tx, cancel, handle) = start(dispatcher);

        tx.send(action("o1", Priority::Normal)).unwrap();
        let outcome = out_rx.recv().await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, ActionResult::Abandoned { .. }));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let mut mock = MockChainResolver::new();
        mock.expect_chain().return_const(Chain::Ethereum);
        mock.expect_execute_action().times(1).returning(|a| {
            Err(RelayerError::AlreadySpent {
                chain: Chain::Ethereum,
                hashlock: a.hashlock.to_hex(),
            })
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let dispatcher = ActionDispatcher::new(resolver(mock), &config(""), out_tx);
        let (tx, cancel, handle) = start(dispatcher);

        tx.send(action("o1", Priority::Normal)).unwrap();
        let outcome = out_rx.recv().await.unwrap();
        match outcome.result {
            ActionResult::Abandoned { error } => assert!(error.contains("already spent")),
            other => panic!("unexpected result: {:?}", other),
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_resolver_abandons() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let dispatcher = ActionDispatcher::new(Vec::new(), &config(""), out_tx);
        let (tx, cancel, handle) = start(dispatcher);

        tx.send(action("o1", Priority::High)).unwrap();
        let outcome = out_rx.recv().await.unwrap();
        assert_eq!(outcome.attempts, 0);
        assert!(matches!(outcome.result, ActionResult::Abandoned { .. }));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_refund_is_requeued() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let mut mock = MockChainResolver::new();
        mock.expect_chain().return_const(Chain::Ethereum);
        mock.expect_execute_action().times(2).returning(move |a| {
            if seen.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                Err(RelayerError::TimelockNotExpired {
                    chain: Chain::Ethereum,
                    hashlock: a.hashlock.to_hex(),
                    locktime: 10,
                    current: 5,
                })
            } else {
                Ok("0xrefund".to_string())
            }
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let dispatcher =
            ActionDispatcher::new(resolver(mock), &config("requeue_delay_secs = 30"), out_tx);
        let (tx, cancel, handle) = start(dispatcher);

        let mut refund = action("o1", Priority::Normal);
        refund.kind = ActionKind::Refund;
        refund.secret = None;
        tx.send(refund).unwrap();

        let outcome = out_rx.recv().await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    /// Holds every call until released and records the order calls arrive in
    struct GatedResolver {
        gate: Semaphore,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ChainResolver for GatedResolver {
        fn chain(&self) -> Chain {
            Chain::Ethereum
        }

        async fn execute_action(&self, action: &CrossChainAction) -> crate::error::RelayerResult<String> {
            self.calls.lock().unwrap().push(action.order_id.clone());
            self.gate
                .acquire()
                .await
                .map_err(|e| RelayerError::Internal(e.to_string()))?
                .forget();
            Ok(format!("0x{}", action.order_id))
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn test_high_priority_arriving_while_busy_goes_next() {
        let gated = Arc::new(GatedResolver {
            gate: Semaphore::new(0),
            calls: Mutex::new(Vec::new()),
        });
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(ActionDispatcher::new(
            vec![gated.clone() as Arc<dyn ChainResolver>],
            &config("max_concurrent_actions = 1"),
            out_tx,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.clone().run(rx, cancel.clone()));

        tx.send(action("busy", Priority::Normal)).unwrap();
        eventually(|| gated.calls.lock().unwrap().len() == 1).await;

        tx.send(action("n1", Priority::Normal)).unwrap();
        tx.send(action("n2", Priority::Normal)).unwrap();
        tx.send(action("urgent", Priority::High)).unwrap();
        // All three reach the heap even though the only worker is taken
        eventually(|| dispatcher.queued() == 3).await;

        gated.gate.add_permits(4);
        for _ in 0..4 {
            out_rx.recv().await.unwrap();
        }
        assert_eq!(
            *gated.calls.lock().unwrap(),
            vec!["busy", "urgent", "n1", "n2"]
        );

        cancel.cancel();
        handle.await.unwrap();
    }
}
