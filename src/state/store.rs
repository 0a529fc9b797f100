//! In-memory order index over a durable record store

use super::order::{Order, OrderStatus};
use super::records::RecordStore;
use crate::error::{RelayerError, RelayerResult};
use crate::types::Hashlock;

use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Orders keyed by id, with a hashlock index and one mutex per order.
///
/// Writers hold the order's mutex for the whole read-patch-persist cycle, so
/// the record on disk never lags what readers can observe.
pub struct OrderStore {
    orders: DashMap<String, Arc<Mutex<Order>>>,
    by_hashlock: DashMap<Hashlock, Vec<String>>,
    records: Arc<dyn RecordStore>,
    /// Serializes creation so the one-active-order-per-hashlock check is atomic
    create_lock: Mutex<()>,
}

impl OrderStore {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            orders: DashMap::new(),
            by_hashlock: DashMap::new(),
            records,
            create_lock: Mutex::new(()),
        }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    fn index(&self, order: Order) {
        let order_id = order.order_id.clone();
        let mut ids = self.by_hashlock.entry(order.hashlock).or_default();
        if !ids.contains(&order_id) {
            ids.push(order_id.clone());
        }
        drop(ids);
        self.orders.insert(order_id, Arc::new(Mutex::new(order)));
    }

    fn handle(&self, order_id: &str) -> Option<Arc<Mutex<Order>>> {
        self.orders.get(order_id).map(|entry| entry.value().clone())
    }

    /// Rehydrate the index from persisted records
    pub async fn load(&self) -> RelayerResult<usize> {
        let orders = self.records.load_orders().await?;
        let count = orders.len();
        for order in orders {
            self.index(order);
        }
        info!(count, "Order store loaded");
        Ok(count)
    }

    pub async fn get(&self, order_id: &str) -> Option<Order> {
        match self.handle(order_id) {
            Some(handle) => Some(handle.lock().await.clone()),
            None => None,
        }
    }

    /// Ids of every order indexed under the hashlock, oldest first
    pub fn order_ids_for_hashlock(&self, hashlock: &Hashlock) -> Vec<String> {
        self.by_hashlock
            .get(hashlock)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    pub async fn find_by_hashlock(&self, hashlock: &Hashlock) -> Vec<Order> {
        let mut orders = Vec::new();
        for id in self.order_ids_for_hashlock(hashlock) {
            if let Some(order) = self.get(&id).await {
                orders.push(order);
            }
        }
        orders
    }

    pub async fn list(&self) -> Vec<Order> {
        let handles: Vec<_> = self.orders.iter().map(|e| e.value().clone()).collect();
        let mut orders = Vec::with_capacity(handles.len());
        for handle in handles {
            orders.push(handle.lock().await.clone());
        }
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    pub async fn find_by_status(&self, status: OrderStatus) -> Vec<Order> {
        self.list()
            .await
            .into_iter()
            .filter(|o| o.status() == status)
            .collect()
    }

    pub async fn counts_by_status(&self) -> BTreeMap<OrderStatus, usize> {
        let mut counts = BTreeMap::new();
        for order in self.list().await {
            *counts.entry(order.status()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Insert a new order after persisting it
    pub async fn create(&self, order: Order) -> RelayerResult<Order> {
        let _guard = self.create_lock.lock().await;

        if self.orders.contains_key(&order.order_id) {
            return Err(RelayerError::DuplicateOrder {
                order_id: order.order_id.clone(),
            });
        }

        for existing in self.find_by_hashlock(&order.hashlock).await {
            if !existing.is_terminal() {
                return Err(RelayerError::HashlockInUse {
                    hashlock: order.hashlock.to_hex(),
                    order_id: existing.order_id,
                });
            }
        }

        self.records.persist_order(&order).await?;
        debug!(order_id = %order.order_id, hashlock = %order.hashlock.short(), "Order created");
        self.index(order.clone());
        Ok(order)
    }

    /// Patch an order under its lock and persist before returning.
    ///
    /// A patch error leaves the order untouched. A patch that changes nothing
    /// is not persisted. Orders becoming terminal are archived, and unarchived
    /// if a later observation makes them live again.
    pub async fn update<T, F>(&self, order_id: &str, patch: F) -> RelayerResult<T>
    where
        F: FnOnce(&mut Order) -> RelayerResult<T>,
    {
        let handle = self.handle(order_id).ok_or_else(|| RelayerError::OrderNotFound {
            order_id: order_id.to_string(),
        })?;

        let mut current = handle.lock().await;
        let mut updated = current.clone();
        let result = patch(&mut updated)?;

        if updated == *current {
            return Ok(result);
        }

        updated.updated_at = Utc::now();
        if !updated.is_terminal() {
            // A late lock can revive a settled order
            updated.archived_at = None;
        } else if updated.archived_at.is_none() {
            updated.archived_at = Some(updated.updated_at);
        }

        if updated.archived_at.is_some() {
            self.records.archive_order(&updated).await?;
            if current.archived_at.is_none() {
                info!(order_id, status = %updated.status(), "Order archived");
            }
        } else {
            self.records.persist_order(&updated).await?;
        }

        *current = updated;
        Ok(result)
    }

    /// Drop a terminal order from the index and from durable storage
    pub async fn remove(&self, order_id: &str) -> RelayerResult<Order> {
        let handle = self.handle(order_id).ok_or_else(|| RelayerError::OrderNotFound {
            order_id: order_id.to_string(),
        })?;

        let order = handle.lock().await.clone();
        if !order.is_terminal() {
            return Err(RelayerError::InvalidOrder(format!(
                "order {} is {} and cannot be removed",
                order_id,
                order.status()
            )));
        }

        self.records.remove_order(order_id).await?;
        self.orders.remove(order_id);
        if let Some(mut ids) = self.by_hashlock.get_mut(&order.hashlock) {
            ids.retain(|id| id != order_id);
        }
        self.by_hashlock.remove_if(&order.hashlock, |_, ids| ids.is_empty());

        Ok(order)
    }
}
