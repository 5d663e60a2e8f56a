use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::db::{Database, OrderSort, OrderStats};
use crate::feed::OperationKind;
use crate::model::{Order, OrderDraft, OrderPatch, OrderStatus};
use crate::session::SnapshotSource;

/// Async facade over [`Database`]. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct OrderStore {
    db: Arc<Database>,
}

impl OrderStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|err| anyhow!("failed to join database task: {err}"))?
    }

    pub async fn insert(&self, draft: OrderDraft) -> Result<Order> {
        let order = Order::from_draft(None, draft);
        let stored = order.clone();
        self.run(move |db| db.insert_order(&stored)).await?;
        debug!(order_id = %order.id, "order inserted");
        Ok(order)
    }

    pub async fn upsert(&self, id: &str, draft: OrderDraft) -> Result<(Order, OperationKind)> {
        let order = Order::from_draft(Some(id.to_string()), draft);
        self.run(move |db| db.upsert_order(&order)).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Order>> {
        let id = id.to_string();
        self.run(move |db| db.get_order(&id)).await
    }

    pub async fn list(
        &self,
        status: Option<OrderStatus>,
        limit: usize,
        sort: OrderSort,
    ) -> Result<Vec<Order>> {
        self.run(move |db| db.list_orders(status, limit, sort)).await
    }

    pub async fn update(&self, id: &str, patch: OrderPatch) -> Result<Option<Order>> {
        let id = id.to_string();
        self.run(move |db| db.update_order(&id, &patch)).await
    }

    pub async fn update_status(&self, id: &str, status: OrderStatus) -> Result<Option<Order>> {
        self.update(id, OrderPatch::status(status)).await
    }

    pub async fn delete(&self, id: &str) -> Result<Option<Order>> {
        let id = id.to_string();
        self.run(move |db| db.delete_order(&id)).await
    }

    pub async fn clear(&self) -> Result<usize> {
        self.run(|db| db.clear_orders()).await
    }

    pub async fn stats(&self) -> Result<OrderStats> {
        self.run(|db| db.order_stats()).await
    }

    /// Most recently updated orders, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<Order>> {
        self.list(None, limit, OrderSort::default()).await
    }

    pub async fn compact_change_log(&self, retain: usize, consumed: i64) -> Result<usize> {
        self.run(move |db| db.compact_change_log(retain, consumed)).await
    }
}

#[async_trait]
impl SnapshotSource for OrderStore {
    async fn recent(&self, limit: usize) -> Result<Vec<Value>> {
        let orders = OrderStore::recent(self, limit).await?;
        Ok(orders.iter().map(Order::to_document).collect())
    }
}
