//! Relayer supervisor: wires the store, processor, dispatcher and watchers
//! together and owns their task lifecycle.

use crate::chain::{
    BitcoinRpcClient, Chain, ChainClock, ChainWatcher, EthereumBlockSource, Watcher, WatcherStatus,
};
use crate::config::{RelayerConfig, Settings};
use crate::coordination::EventProcessor;
use crate::error::{RelayerError, RelayerResult};
use crate::events::script::parse_htlc;
use crate::events::{BitcoinClassifier, EthereumClassifier, EventDelivery, ScriptRegistry};
use crate::state::{
    FileRecordStore, FillRequest, Order, OrderRequest, OrderStatus, OrderStore, PgRecordStore,
    RecordStore,
};
use crate::tx::{
    ActionDispatcher, ActionOutcome, BitcoinResolver, ChainResolver, CrossChainAction,
    EthereumResolver,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Watchers block on a full channel rather than drop events
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Current position of both chains, read from their nodes
#[async_trait]
pub trait ClockSource: Send + Sync {
    async fn read(&self) -> ChainClock;
}

/// Reads the chain clock from the configured nodes. Unreachable nodes leave their fields unknown.
#[derive(Default)]
pub struct NodeClock {
    bitcoin: Option<Arc<BitcoinRpcClient>>,
    ethereum: Option<Arc<EthereumBlockSource>>,
}

#[async_trait]
impl ClockSource for NodeClock {
    async fn read(&self) -> ChainClock {
        let mut clock = ChainClock::default();
        if let Some(rpc) = &self.bitcoin {
            match rpc.get_blockchain_info().await {
                Ok(info) => {
                    clock.bitcoin_height = Some(info.blocks);
                    clock.bitcoin_median_time = Some(info.mediantime);
                }
                Err(e) => warn!(chain = %Chain::Bitcoin, "Clock read failed: {}", e),
            }
        }
        if let Some(source) = &self.ethereum {
            match source.latest_timestamp().await {
                Ok(time) => clock.ethereum_time = Some(time),
                Err(e) => warn!(chain = %Chain::Ethereum, "Clock read failed: {}", e),
            }
        }
        clock
    }
}

/// Everything the supervisor runs, built from settings or assembled by hand
pub struct RelayerParts {
    pub config: RelayerConfig,
    pub store: Arc<OrderStore>,
    pub registry: Arc<ScriptRegistry>,
    pub watchers: Vec<Arc<dyn Watcher>>,
    pub resolvers: Vec<Arc<dyn ChainResolver>>,
    pub clock: Arc<dyn ClockSource>,
    /// Receiving end of the channel the watchers were built with
    pub events: mpsc::Receiver<EventDelivery>,
}

/// Aggregate health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RelayerStatus {
    pub instance_id: String,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub watchers: Vec<WatcherStatus>,
    pub order_counts: BTreeMap<OrderStatus, usize>,
    pub in_flight_events: usize,
    pub queued_actions: usize,
    pub clock: ChainClock,
}

struct Channels {
    events: mpsc::Receiver<EventDelivery>,
    actions: mpsc::UnboundedReceiver<CrossChainAction>,
    outcomes: mpsc::UnboundedReceiver<ActionOutcome>,
}

pub struct Relayer {
    config: RelayerConfig,
    store: Arc<OrderStore>,
    registry: Arc<ScriptRegistry>,
    processor: Arc<EventProcessor>,
    dispatcher: Arc<ActionDispatcher>,
    watchers: Vec<Arc<dyn Watcher>>,
    clock: Arc<dyn ClockSource>,
    channels: Mutex<Option<Channels>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Relayer {
    /// Build every component from validated settings
    pub async fn from_settings(settings: &Settings) -> RelayerResult<Self> {
        let records: Arc<dyn RecordStore> = match settings
            .storage
            .database_url
            .as_deref()
            .filter(|u| !u.is_empty())
        {
            Some(_) => {
                let pg = PgRecordStore::connect(&settings.storage).await?;
                info!("Using Postgres record store");
                Arc::new(pg)
            }
            None => {
                let dir = settings.storage.data_dir.as_deref().unwrap_or_default();
                let files = FileRecordStore::open(dir).await?;
                info!(data_dir = dir, "Using file record store");
                Arc::new(files)
            }
        };

        let store = Arc::new(OrderStore::new(records.clone()));
        store.load().await?;

        let registry = Arc::new(ScriptRegistry::new());
        for order in store.list().await {
            if order.is_terminal() {
                continue;
            }
            if let Some(script) = &order.bitcoin_htlc_script {
                if let Err(e) = registry.register(script) {
                    warn!(order_id = %order.order_id, "Stored bitcoin script rejected: {}", e);
                }
            }
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut watchers: Vec<Arc<dyn Watcher>> = Vec::new();
        let mut resolvers: Vec<Arc<dyn ChainResolver>> = Vec::new();
        let mut clock = NodeClock::default();

        if settings.bitcoin.enabled {
            let rpc = Arc::new(BitcoinRpcClient::new(&settings.bitcoin)?);
            watchers.push(Arc::new(ChainWatcher::new(
                settings.bitcoin.watcher.clone(),
                rpc.clone(),
                BitcoinClassifier::new(registry.clone()),
                records.clone(),
                events_tx.clone(),
            )));
            if settings.resolver_enabled(Chain::Bitcoin) {
                resolvers.push(Arc::new(BitcoinResolver::new(
                    &settings.bitcoin,
                    rpc.clone(),
                    registry.clone(),
                )?));
            }
            clock.bitcoin = Some(rpc);
        }

        if settings.ethereum.enabled {
            let source = Arc::new(EthereumBlockSource::new(&settings.ethereum)?);
            watchers.push(Arc::new(ChainWatcher::new(
                settings.ethereum.watcher.clone(),
                source.clone(),
                EthereumClassifier::new(source.contract()),
                records.clone(),
                events_tx.clone(),
            )));
            if settings.resolver_enabled(Chain::Ethereum) {
                resolvers.push(Arc::new(EthereumResolver::new(
                    &settings.ethereum,
                    source.clone(),
                )?));
            }
            clock.ethereum = Some(source);
        }

        Ok(Self::new(RelayerParts {
            config: settings.relayer.clone(),
            store,
            registry,
            watchers,
            resolvers,
            clock: Arc::new(clock),
            events: events_rx,
        }))
    }

    pub fn new(parts: RelayerParts) -> Self {
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(ActionDispatcher::new(parts.resolvers, &parts.config, outcomes_tx));
        let processor = Arc::new(EventProcessor::new(
            parts.store.clone(),
            &parts.config,
            dispatcher.chains(),
            actions_tx,
        ));

        Self {
            config: parts.config,
            store: parts.store,
            registry: parts.registry,
            processor,
            dispatcher,
            watchers: parts.watchers,
            clock: parts.clock,
            channels: Mutex::new(Some(Channels {
                events: parts.events,
                actions: actions_rx,
                outcomes: outcomes_rx,
            })),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start watchers (fatal on connection failure), resume pending actions and spawn the loops
    pub async fn start(&self) -> RelayerResult<()> {
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| RelayerError::Internal("relayer already started".to_string()))?;

        try_join_all(self.watchers.iter().map(|w| w.start())).await?;

        let dispatcher_done = CancellationToken::new();
        {
            let dispatcher = self.dispatcher.clone();
            let cancel = self.cancel.clone();
            let done = dispatcher_done.clone();
            self.tracker.spawn(async move {
                dispatcher.run(channels.actions, cancel).await;
                done.cancel();
            });
        }

        // Dispatched actions left over from a previous run
        self.processor.resume_pending().await?;

        for watcher in &self.watchers {
            let watcher = watcher.clone();
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move { watcher.run(cancel).await });
        }

        self.tracker.spawn(event_pump(
            self.processor.clone(),
            channels.events,
            self.tracker.clone(),
            self.cancel.clone(),
        ));
        self.tracker.spawn(outcome_pump(
            self.processor.clone(),
            channels.outcomes,
            dispatcher_done,
        ));

        if self.config.refund_sweep_interval_secs > 0 {
            self.tracker.spawn(refund_sweeper(
                self.processor.clone(),
                self.clock.clone(),
                Duration::from_secs(self.config.refund_sweep_interval_secs),
                self.cancel.clone(),
            ));
        }

        self.tracker.spawn(health_loop(
            self.store.records().clone(),
            Duration::from_secs(self.config.health_check_interval_secs.max(1)),
            self.cancel.clone(),
        ));

        *self.started_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
        self.running.store(true, Ordering::SeqCst);
        info!(
            instance_id = %self.config.instance_id,
            watchers = self.watchers.len(),
            resolvers = ?self.dispatcher.chains(),
            "Relayer started"
        );
        Ok(())
    }

    /// Cancel every loop and wait for in-flight work to finish
    pub async fn stop(&self) {
        info!("Stopping relayer");
        for watcher in &self.watchers {
            watcher.stop();
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.running.store(false, Ordering::SeqCst);
        info!("Relayer stopped");
    }

    pub async fn status(&self) -> RelayerStatus {
        let started_at = *self.started_at.lock().unwrap_or_else(|p| p.into_inner());
        RelayerStatus {
            instance_id: self.config.instance_id.clone(),
            running: self.is_running(),
            started_at,
            watchers: self.watchers.iter().map(|w| w.status()).collect(),
            order_counts: self.store.counts_by_status().await,
            in_flight_events: self.processor.in_flight_count(),
            queued_actions: self.dispatcher.queued(),
            clock: self.processor.clock(),
        }
    }

    /// Track a new order, registering its bitcoin witness script for lock detection
    pub async fn submit_order(&self, request: OrderRequest) -> RelayerResult<Order> {
        let order = Order::new(request)?;

        if let Some(script) = &order.bitcoin_htlc_script {
            let parsed = parse_htlc(script).ok_or_else(|| {
                RelayerError::InvalidOrder("bitcoin_htlc_script is not an HTLC script".to_string())
            })?;
            if parsed.hashlock != order.hashlock {
                return Err(RelayerError::InvalidOrder(format!(
                    "bitcoin_htlc_script commits to {} but the order hashlock is {}",
                    parsed.hashlock, order.hashlock
                )));
            }
        }

        let order = self.store.create(order).await?;
        if let Some(script) = &order.bitcoin_htlc_script {
            self.registry.register(script)?;
        }
        info!(
            order_id = %order.order_id,
            hashlock = %order.hashlock.short(),
            chain = %order.chain,
            total = %order.total_amount,
            "Order submitted"
        );
        Ok(order)
    }

    pub async fn apply_fill(&self, order_id: &str, fill: FillRequest) -> RelayerResult<Order> {
        self.processor.apply_fill(order_id, fill).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> RelayerResult<Order> {
        self.processor.cancel(order_id).await
    }
}

/// One processing task per event; remaining events are drained on shutdown
async fn event_pump(
    processor: Arc<EventProcessor>,
    mut events: mpsc::Receiver<EventDelivery>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = events.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let processor = processor.clone();
        tracker.spawn(async move { processor.deliver(delivery).await });
    }

    events.close();
    while let Ok(delivery) = events.try_recv() {
        processor.deliver(delivery).await;
    }
    debug!("Event pump stopped");
}

/// Outcomes keep flowing until the dispatcher has finished its in-flight actions
async fn outcome_pump(
    processor: Arc<EventProcessor>,
    mut outcomes: mpsc::UnboundedReceiver<ActionOutcome>,
    dispatcher_done: CancellationToken,
) {
    loop {
        let outcome = tokio::select! {
            biased;
            outcome = outcomes.recv() => match outcome {
                Some(outcome) => outcome,
                None => break,
            },
            _ = dispatcher_done.cancelled() => break,
        };
        record(&processor, outcome).await;
    }

    while let Ok(outcome) = outcomes.try_recv() {
        record(&processor, outcome).await;
    }
    debug!("Outcome pump stopped");
}

async fn record(processor: &EventProcessor, outcome: ActionOutcome) {
    if let Err(e) = processor.record_outcome(outcome.clone()).await {
        error!(order_id = %outcome.order_id, key = %outcome.key, "Failed to record action outcome: {}", e);
    }
}

async fn refund_sweeper(
    processor: Arc<EventProcessor>,
    clock: Arc<dyn ClockSource>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let reading = clock.read().await;
        match processor.sweep_expired(reading).await {
            Ok(0) => {}
            Ok(dispatched) => info!(dispatched, "Refund sweep dispatched actions"),
            Err(e) => error!("Refund sweep failed: {}", e),
        }
    }
}

async fn health_loop(records: Arc<dyn RecordStore>, every: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        match records.health_check().await {
            Ok(()) => crate::metrics::record_health_check(),
            Err(e) => {
                warn!("Record store health check failed: {}", e);
                crate::metrics::record_health_check_failure();
            }
        }
    }
}
