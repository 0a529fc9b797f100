//! Polling chain watcher with a persisted block cursor

use super::{BlockSource, Chain, HtlcClassifier, Watcher, WatcherStatus};
use crate::config::WatcherConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{EventDelivery, HtlcEvent};
use crate::state::RecordStore;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watches one chain, emitting HTLC events block by block.
///
/// `cursor` is the last fully processed block. It only moves forward, and only
/// once every event of that block has been settled by the processor, so the
/// persisted checkpoint never runs ahead of applied state.
pub struct ChainWatcher<S, C> {
    chain: Chain,
    config: WatcherConfig,
    source: Arc<S>,
    classifier: C,
    records: Arc<dyn RecordStore>,
    events: mpsc::Sender<EventDelivery>,
    cursor: AtomicU64,
    connected: AtomicBool,
    stopped: CancellationToken,
    /// One scan at a time
    poll_lock: Mutex<()>,
}

impl<S, C> ChainWatcher<S, C>
where
    S: BlockSource,
    C: HtlcClassifier<Tx = S::Tx>,
{
    pub fn new(
        config: WatcherConfig,
        source: Arc<S>,
        classifier: C,
        records: Arc<dyn RecordStore>,
        events: mpsc::Sender<EventDelivery>,
    ) -> Self {
        Self {
            chain: source.chain(),
            config,
            source,
            classifier,
            records,
            events,
            cursor: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            poll_lock: Mutex::new(()),
        }
    }

    /// Highest block with enough confirmations to be scanned
    fn scan_target(&self, tip: u64) -> u64 {
        tip.saturating_sub(self.config.confirmations.saturating_sub(1))
    }

    fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::Relaxed);
        if was != connected {
            if connected {
                info!(chain = %self.chain, "Watcher connected");
            } else {
                warn!(chain = %self.chain, "Watcher disconnected");
            }
        }
        crate::metrics::record_watcher_health(self.chain, connected);
    }

    async fn initial_cursor(&self, tip: u64) -> RelayerResult<u64> {
        if self.config.resume_from_checkpoint {
            if let Some(checkpoint) = self.records.load_checkpoint(self.chain).await? {
                info!(chain = %self.chain, checkpoint, tip, "Resuming from checkpoint");
                return Ok(checkpoint);
            }
        }
        Ok(self.scan_target(tip))
    }

    /// Classify one block's transactions. Malformed transactions are skipped.
    fn classify_block(&self, block: &super::SourceBlock<S::Tx>) -> Vec<HtlcEvent> {
        let mut events = Vec::new();
        for (index, tx) in block.txs.iter().enumerate() {
            match self.classifier.classify(tx, &block.header) {
                Ok(found) => events.extend(found),
                Err(e) => {
                    warn!(
                        chain = %self.chain,
                        height = block.header.block.height,
                        index,
                        error = %e,
                        "Skipping undecodable transaction"
                    );
                }
            }
        }
        events
    }
}

#[async_trait]
impl<S, C> Watcher for ChainWatcher<S, C>
where
    S: BlockSource,
    C: HtlcClassifier<Tx = S::Tx>,
{
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn start(&self) -> RelayerResult<()> {
        let attempts = self.config.start_retries.max(1);
        let delay = Duration::from_secs(self.config.reconnect_delay_secs);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.source.tip_height().await {
                Ok(tip) => {
                    let cursor = self.initial_cursor(tip).await?;
                    self.cursor.store(cursor, Ordering::SeqCst);
                    self.set_connected(true);
                    info!(chain = %self.chain, tip, cursor, "Watcher started");
                    return Ok(());
                }
                Err(e) => {
                    warn!(chain = %self.chain, attempt, attempts, error = %e, "Watcher connect failed");
                    self.set_connected(false);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(RelayerError::ChainConnection {
            chain: self.chain,
            message: format!(
                "unreachable after {} attempts: {}",
                attempts,
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }

    async fn poll(&self) -> RelayerResult<usize> {
        let _guard = self.poll_lock.lock().await;

        let tip = match self.source.tip_height().await {
            Ok(tip) => tip,
            Err(e) => {
                self.set_connected(false);
                return Err(e);
            }
        };
        self.set_connected(true);

        let target = self.scan_target(tip);
        let start = self.cursor.load(Ordering::SeqCst) + 1;
        if start > target {
            return Ok(0);
        }

        debug!(chain = %self.chain, from = start, to = target, "Scanning blocks");

        let mut emitted = 0;
        for height in start..=target {
            if self.stopped.is_cancelled() {
                break;
            }

            let block = match self.source.fetch_block(height).await {
                Ok(block) => block,
                Err(e) => {
                    // The cursor stays on the last good block; this one is retried next tick
                    if !matches!(e, RelayerError::Decode { .. }) {
                        self.set_connected(false);
                    }
                    return Err(e);
                }
            };

            let mut receipts = Vec::new();
            for event in self.classify_block(&block) {
                debug!(
                    chain = %self.chain,
                    height,
                    kind = %event.kind,
                    tx_id = %event.tx_id,
                    hashlock = %event.hashlock.short(),
                    "HTLC event"
                );
                crate::metrics::record_event(&event);
                let (delivery, receipt) = EventDelivery::new(event);
                self.events
                    .send(delivery)
                    .await
                    .map_err(|_| RelayerError::Internal("event channel closed".to_string()))?;
                receipts.push(receipt);
                emitted += 1;
            }

            for receipt in receipts {
                if receipt.await != Ok(true) {
                    // Cursor stays put; the block is rescanned and applied events dedup
                    return Err(RelayerError::Internal(format!(
                        "{} block {} has unsettled events",
                        self.chain, height
                    )));
                }
            }

            self.cursor.store(height, Ordering::SeqCst);
            crate::metrics::record_block_processed(self.chain, height);
            if let Err(e) = self.records.save_checkpoint(self.chain, height).await {
                warn!(chain = %self.chain, height, "Failed to save checkpoint: {}", e);
            }
        }

        Ok(emitted)
    }

    async fn run(&self, cancel: CancellationToken) {
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs);
        let reconnect_delay = Duration::from_secs(self.config.reconnect_delay_secs);

        loop {
            if cancel.is_cancelled() || self.stopped.is_cancelled() {
                break;
            }

            let wait = match self.poll().await {
                Ok(_) => poll_interval,
                Err(e) => {
                    error!(
                        chain = %self.chain,
                        cursor = self.cursor.load(Ordering::SeqCst),
                        "Watcher poll failed: {}",
                        e
                    );
                    reconnect_delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.stopped.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(chain = %self.chain, "Watcher stopped");
    }

    fn stop(&self) {
        self.stopped.cancel();
    }

    fn status(&self) -> WatcherStatus {
        WatcherStatus {
            chain: self.chain,
            connected: self.connected.load(Ordering::Relaxed),
            last_block: self.cursor.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockHeader, SourceBlock};
    use crate::events::test_support::event;
    use crate::events::HtlcEventKind;
    use crate::state::FileRecordStore;
    use crate::types::{BlockRef, Secret};
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// `None` stands in for a transaction the classifier cannot decode
    type FakeTx = Option<HtlcEvent>;

    #[derive(Default)]
    struct FakeSource {
        tip: AtomicU64,
        down: AtomicBool,
        failing: StdMutex<HashSet<u64>>,
        blocks: StdMutex<HashMap<u64, Vec<FakeTx>>>,
        fetched: StdMutex<Vec<u64>>,
    }

    #[async_trait]
    impl BlockSource for FakeSource {
        type Tx = FakeTx;

        fn chain(&self) -> Chain {
            Chain::Bitcoin
        }

        async fn tip_height(&self) -> RelayerResult<u64> {
            if self.down.load(Ordering::SeqCst) {
                return Err(RelayerError::ChainConnection {
                    chain: Chain::Bitcoin,
                    message: "connection refused".into(),
                });
            }
            Ok(self.tip.load(Ordering::SeqCst))
        }

        async fn fetch_block(&self, height: u64) -> RelayerResult<SourceBlock<FakeTx>> {
            self.fetched.lock().unwrap().push(height);
            if self.failing.lock().unwrap().contains(&height) {
                return Err(RelayerError::ChainConnection {
                    chain: Chain::Bitcoin,
                    message: format!("timeout fetching {}", height),
                });
            }
            let txs = self.blocks.lock().unwrap().get(&height).cloned().unwrap_or_default();
            Ok(SourceBlock {
                header: BlockHeader {
                    block: BlockRef {
                        height,
                        hash: format!("h{}", height),
                    },
                    timestamp: Utc::now(),
                },
                txs,
            })
        }
    }

    struct PassThrough;

    impl HtlcClassifier for PassThrough {
        type Tx = FakeTx;

        fn classify(&self, tx: &FakeTx, header: &BlockHeader) -> RelayerResult<Vec<HtlcEvent>> {
            match tx {
                Some(ev) => {
                    let mut ev = ev.clone();
                    ev.block = header.block.clone();
                    Ok(vec![ev])
                }
                None => Err(RelayerError::Decode {
                    chain: Chain::Bitcoin,
                    message: "garbage".into(),
                }),
            }
        }
    }

    fn config(confirmations: u64, resume: bool) -> WatcherConfig {
        WatcherConfig {
            poll_interval_secs: 1,
            confirmations,
            reconnect_delay_secs: 0,
            start_retries: 2,
            resume_from_checkpoint: resume,
        }
    }

    fn lock_tx(tx_id: &str) -> FakeTx {
        Some(event(
            HtlcEventKind::Lock,
            Chain::Bitcoin,
            tx_id,
            Secret([1u8; 32]).hashlock(),
        ))
    }

    /// Stands in for the event pump: records each delivery and settles it
    #[derive(Default)]
    struct Pump {
        seen: StdMutex<Vec<String>>,
        rejected: StdMutex<HashSet<String>>,
        /// Drop deliveries unsettled, as a crash would
        crashed: AtomicBool,
    }

    struct Harness {
        _dir: TempDir,
        source: Arc<FakeSource>,
        records: Arc<FileRecordStore>,
        watcher: ChainWatcher<FakeSource, PassThrough>,
        pump: Arc<Pump>,
    }

    async fn harness(tip: u64, config: WatcherConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let records = Arc::new(FileRecordStore::open(dir.path()).await.unwrap());
        let source = Arc::new(FakeSource::default());
        source.tip.store(tip, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel::<EventDelivery>(64);
        let pump = Arc::new(Pump::default());
        tokio::spawn({
            let pump = pump.clone();
            async move {
                while let Some(delivery) = rx.recv().await {
                    let tx_id = delivery.event.tx_id.clone();
                    pump.seen.lock().unwrap().push(tx_id.clone());
                    if pump.crashed.load(Ordering::SeqCst) {
                        drop(delivery);
                        continue;
                    }
                    let settled = !pump.rejected.lock().unwrap().contains(&tx_id);
                    delivery.settle(settled);
                }
            }
        });
        let watcher = ChainWatcher::new(config, source.clone(), PassThrough, records.clone(), tx);
        Harness {
            _dir: dir,
            source,
            records,
            watcher,
            pump,
        }
    }

    fn drain(h: &Harness) -> Vec<String> {
        std::mem::take(&mut *h.pump.seen.lock().unwrap())
    }

    #[tokio::test]
    async fn test_start_skips_history() {
        let h = harness(100, config(1, false)).await;
        h.source.blocks.lock().unwrap().insert(100, vec![lock_tx("old")]);

        h.watcher.start().await.unwrap();
        assert_eq!(h.watcher.status().last_block, 100);
        assert!(h.watcher.status().connected);

        assert_eq!(h.watcher.poll().await.unwrap(), 0);
        assert!(drain(&h).is_empty());
    }

    #[tokio::test]
    async fn test_poll_emits_in_block_order_and_checkpoints() {
        let h = harness(100, config(1, false)).await;
        h.watcher.start().await.unwrap();

        {
            let mut blocks = h.source.blocks.lock().unwrap();
            blocks.insert(101, vec![lock_tx("a"), lock_tx("b")]);
            blocks.insert(103, vec![lock_tx("c")]);
        }
        h.source.tip.store(103, Ordering::SeqCst);

        assert_eq!(h.watcher.poll().await.unwrap(), 3);
        assert_eq!(drain(&h), vec!["a", "b", "c"]);
        assert_eq!(h.watcher.status().last_block, 103);
        assert_eq!(
            h.records.load_checkpoint(Chain::Bitcoin).await.unwrap(),
            Some(103)
        );
    }

    #[tokio::test]
    async fn test_failed_block_is_rescanned_next_tick() {
        let h = harness(1000, config(1, false)).await;
        h.watcher.start().await.unwrap();

        {
            let mut blocks = h.source.blocks.lock().unwrap();
            blocks.insert(1001, vec![lock_tx("first")]);
            blocks.insert(1002, vec![lock_tx("second")]);
        }
        h.source.failing.lock().unwrap().insert(1002);
        h.source.tip.store(1003, Ordering::SeqCst);

        assert!(h.watcher.poll().await.is_err());
        assert_eq!(h.watcher.status().last_block, 1001);
        assert!(!h.watcher.status().connected);
        assert_eq!(drain(&h), vec!["first"]);

        h.source.failing.lock().unwrap().clear();
        h.source.fetched.lock().unwrap().clear();

        assert_eq!(h.watcher.poll().await.unwrap(), 1);
        assert_eq!(*h.source.fetched.lock().unwrap(), vec![1002, 1003]);
        assert_eq!(drain(&h), vec!["second"]);
        assert_eq!(h.watcher.status().last_block, 1003);
        assert!(h.watcher.status().connected);
    }

    #[tokio::test]
    async fn test_confirmation_depth() {
        let h = harness(100, config(3, false)).await;
        h.watcher.start().await.unwrap();
        assert_eq!(h.watcher.status().last_block, 98);

        h.source.blocks.lock().unwrap().insert(99, vec![lock_tx("x")]);
        h.source.blocks.lock().unwrap().insert(101, vec![lock_tx("y")]);
        h.source.tip.store(102, Ordering::SeqCst);

        h.watcher.poll().await.unwrap();
        assert_eq!(h.watcher.status().last_block, 100);
        assert_eq!(drain(&h), vec!["x"]);
    }

    #[tokio::test]
    async fn test_malformed_transaction_is_skipped() {
        let h = harness(10, config(1, false)).await;
        h.watcher.start().await.unwrap();

        h.source
            .blocks
            .lock()
            .unwrap()
            .insert(11, vec![None, lock_tx("ok")]);
        h.source.tip.store(11, Ordering::SeqCst);

        assert_eq!(h.watcher.poll().await.unwrap(), 1);
        assert_eq!(drain(&h), vec!["ok"]);
        assert_eq!(h.watcher.status().last_block, 11);
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint() {
        let h = harness(100, config(1, true)).await;
        h.records.save_checkpoint(Chain::Bitcoin, 95).await.unwrap();

        h.watcher.start().await.unwrap();
        assert_eq!(h.watcher.status().last_block, 95);
    }

    #[tokio::test]
    async fn test_start_fails_after_retries() {
        let h = harness(100, config(1, false)).await;
        h.source.down.store(true, Ordering::SeqCst);

        let err = h.watcher.start().await.unwrap_err();
        assert!(matches!(err, RelayerError::ChainConnection { .. }));
        assert!(!h.watcher.status().connected);
    }

    #[tokio::test]
    async fn test_run_exits_on_stop() {
        let h = harness(5, config(1, false)).await;
        h.watcher.start().await.unwrap();

        h.watcher.stop();
        h.watcher.stop();
        tokio::time::timeout(Duration::from_secs(2), h.watcher.run(CancellationToken::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cursor_waits_for_settled_events() {
        let h = harness(10, config(1, false)).await;
        h.watcher.start().await.unwrap();

        h.source
            .blocks
            .lock()
            .unwrap()
            .insert(11, vec![lock_tx("ok"), lock_tx("flaky")]);
        h.source.tip.store(11, Ordering::SeqCst);
        h.pump.rejected.lock().unwrap().insert("flaky".to_string());

        assert!(h.watcher.poll().await.is_err());
        assert_eq!(h.watcher.status().last_block, 10);
        assert!(h.watcher.status().connected);
        assert_eq!(h.records.load_checkpoint(Chain::Bitcoin).await.unwrap(), None);
        assert_eq!(drain(&h), vec!["ok", "flaky"]);

        h.pump.rejected.lock().unwrap().clear();
        assert_eq!(h.watcher.poll().await.unwrap(), 2);
        assert_eq!(drain(&h), vec!["ok", "flaky"]);
        assert_eq!(h.watcher.status().last_block, 11);
        assert_eq!(
            h.records.load_checkpoint(Chain::Bitcoin).await.unwrap(),
            Some(11)
        );
    }

    #[tokio::test]
    async fn test_unapplied_block_is_replayed_after_restart() {
        let h = harness(11, config(1, true)).await;
        h.records.save_checkpoint(Chain::Bitcoin, 10).await.unwrap();
        h.watcher.start().await.unwrap();

        h.source.blocks.lock().unwrap().insert(11, vec![lock_tx("queued")]);
        h.pump.crashed.store(true, Ordering::SeqCst);

        assert!(h.watcher.poll().await.is_err());
        assert_eq!(
            h.records.load_checkpoint(Chain::Bitcoin).await.unwrap(),
            Some(10)
        );

        // A fresh watcher over the same records resumes before the lost block
        let (tx, _rx) = mpsc::channel(1);
        let restarted =
            ChainWatcher::new(config(1, true), h.source.clone(), PassThrough, h.records.clone(), tx);
        restarted.start().await.unwrap();
        assert_eq!(restarted.status().last_block, 10);
    }
}
