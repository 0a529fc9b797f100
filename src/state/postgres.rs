//! PostgreSQL record store

use super::order::Order;
use super::records::RecordStore;
use crate::chain::Chain;
use crate::config::StorageConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

/// Order and checkpoint persistence in Postgres
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(config: &StorageConfig) -> RelayerResult<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| RelayerError::Config("storage.database_url is not set".into()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create tables inline; the schema is two tables
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                hashlock CHAR(64) NOT NULL,
                status VARCHAR(20) NOT NULL,
                record JSONB NOT NULL,
                archived_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_hashlock
            ON orders (hashlock) WHERE archived_at IS NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                chain VARCHAR(16) PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn upsert(&self, order: &Order) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (order_id, hashlock, status, record, archived_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (order_id)
            DO UPDATE SET status = $3, record = $4, archived_at = $5, updated_at = $6
            "#,
        )
        .bind(&order.order_id)
        .bind(order.hashlock.to_hex())
        .bind(order.status().as_str())
        .bind(Json(order))
        .bind(order.archived_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn load_orders(&self) -> RelayerResult<Vec<Order>> {
        let rows = sqlx::query("SELECT record FROM orders WHERE archived_at IS NULL")
            .fetch_all(&self.pool)
            .await?;

        let orders = rows
            .into_iter()
            .map(|row| row.try_get::<Json<Order>, _>("record").map(|json| json.0))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count = orders.len(), "Loaded order records");
        Ok(orders)
    }

    async fn persist_order(&self, order: &Order) -> RelayerResult<()> {
        self.upsert(order).await
    }

    async fn archive_order(&self, order: &Order) -> RelayerResult<()> {
        if order.archived_at.is_none() {
            return Err(RelayerError::Internal(format!(
                "order {} archived without archived_at",
                order.order_id
            )));
        }
        self.upsert(order).await
    }

    async fn remove_order(&self, order_id: &str) -> RelayerResult<()> {
        sqlx::query("DELETE FROM orders WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_checkpoint(&self, chain: Chain) -> RelayerResult<Option<u64>> {
        let row = sqlx::query("SELECT block_number FROM chain_checkpoints WHERE chain = $1")
            .bind(chain.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }

    async fn save_checkpoint(&self, chain: Chain, height: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain)
            DO UPDATE SET block_number = $2, updated_at = NOW()
            "#,
        )
        .bind(chain.as_str())
        .bind(height as i64)
        .execute(&self.pool)
        .await?;

        debug!(chain = %chain, height, "Saved checkpoint");
        Ok(())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
