//! Durable record backends for orders and watcher checkpoints

use super::order::Order;
use crate::chain::Chain;
use crate::error::RelayerResult;

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// Persistence seam under the order store.
///
/// Every call must be durable by the time it returns.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All orders that have not been archived
    async fn load_orders(&self) -> RelayerResult<Vec<Order>>;

    async fn persist_order(&self, order: &Order) -> RelayerResult<()>;

    /// Move a terminal order out of the active set
    async fn archive_order(&self, order: &Order) -> RelayerResult<()>;

    async fn remove_order(&self, order_id: &str) -> RelayerResult<()>;

    async fn load_checkpoint(&self, chain: Chain) -> RelayerResult<Option<u64>>;

    async fn save_checkpoint(&self, chain: Chain, height: u64) -> RelayerResult<()>;

    async fn health_check(&self) -> RelayerResult<()>;
}

/// One JSON file per order under `data_dir`
pub struct FileRecordStore {
    orders_dir: PathBuf,
    archive_dir: PathBuf,
    checkpoints_dir: PathBuf,
}

impl FileRecordStore {
    pub async fn open(data_dir: impl AsRef<Path>) -> RelayerResult<Self> {
        let root = data_dir.as_ref();
        let store = Self {
            orders_dir: root.join("orders"),
            archive_dir: root.join("archive"),
            checkpoints_dir: root.join("checkpoints"),
        };

        for dir in [&store.orders_dir, &store.archive_dir, &store.checkpoints_dir] {
            fs::create_dir_all(dir).await?;
        }

        info!(data_dir = %root.display(), "Opened file record store");
        Ok(store)
    }

    fn order_path(&self, order_id: &str) -> PathBuf {
        self.orders_dir.join(format!("{}.json", order_id))
    }

    fn archive_path(&self, order_id: &str) -> PathBuf {
        self.archive_dir.join(format!("{}.json", order_id))
    }
}

/// Write to a sibling temp file, fsync, then rename over the target
async fn write_atomic(path: &Path, bytes: &[u8]) -> RelayerResult<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> RelayerResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load_orders(&self) -> RelayerResult<Vec<Order>> {
        let mut orders = Vec::new();
        let mut entries = fs::read_dir(&self.orders_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<Order>(&bytes) {
                Ok(order) => orders.push(order),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Skipping unreadable order record");
                }
            }
        }

        debug!(count = orders.len(), "Loaded order records");
        Ok(orders)
    }

    async fn persist_order(&self, order: &Order) -> RelayerResult<()> {
        let bytes = serde_json::to_vec_pretty(order)?;
        write_atomic(&self.order_path(&order.order_id), &bytes).await?;
        remove_if_exists(&self.archive_path(&order.order_id)).await
    }

    async fn archive_order(&self, order: &Order) -> RelayerResult<()> {
        let bytes = serde_json::to_vec_pretty(order)?;
        write_atomic(&self.archive_path(&order.order_id), &bytes).await?;
        remove_if_exists(&self.order_path(&order.order_id)).await
    }

    async fn remove_order(&self, order_id: &str) -> RelayerResult<()> {
        remove_if_exists(&self.order_path(order_id)).await?;
        remove_if_exists(&self.archive_path(order_id)).await
    }

    async fn load_checkpoint(&self, chain: Chain) -> RelayerResult<Option<u64>> {
        let path = self.checkpoints_dir.join(chain.as_str());
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(text.trim().parse().ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_checkpoint(&self, chain: Chain, height: u64) -> RelayerResult<()> {
        let path = self.checkpoints_dir.join(chain.as_str());
        write_atomic(&path, height.to_string().as_bytes()).await
    }

    async fn health_check(&self) -> RelayerResult<()> {
        fs::metadata(&self.orders_dir).await?;
        Ok(())
    }
}
