pub mod db;
pub mod feed;
pub mod store;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::feed::OperationKind;
use crate::model::{NewOrder, Order, OrderStatus};

pub use db::{Database, OrderSort, OrderStats, SortField, DROP_OPERATION};
pub use feed::{ChangeLogCursor, SqliteChangeFeed};
pub use store::OrderStore;

const SAMPLE_ORDERS: [(&str, &str, OrderStatus); 10] = [
    ("John Smith", "MacBook Pro 16\"", OrderStatus::Pending),
    ("Sarah Johnson", "iPhone 15 Pro", OrderStatus::Shipped),
    ("Mike Wilson", "Samsung Galaxy S24", OrderStatus::Delivered),
    ("Emily Davis", "Dell XPS 13", OrderStatus::Pending),
    ("David Brown", "iPad Air", OrderStatus::Shipped),
    ("Lisa Anderson", "Sony WH-1000XM5 Headphones", OrderStatus::Delivered),
    ("Robert Taylor", "Nintendo Switch OLED", OrderStatus::Pending),
    ("Jennifer Martinez", "Apple Watch Series 9", OrderStatus::Shipped),
    ("Christopher Lee", "Microsoft Surface Pro 9", OrderStatus::Delivered),
    ("Amanda White", "AirPods Pro 2nd Gen", OrderStatus::Pending),
];

/// Open (creating if needed) the database file and its schema.
pub async fn init(path: &Path) -> Result<Arc<Database>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let path = path.to_path_buf();
    let db = tokio::task::spawn_blocking(move || -> Result<Database> {
        let db = Database::open(&path)?;
        db.initialize()?;
        Ok(db)
    })
    .await??;

    Ok(Arc::new(db))
}

/// Outcome of [`seed`]
#[derive(Debug, Default)]
pub struct SeedReport {
    pub cleared: usize,
    pub inserted: Vec<Order>,
    pub replaced: Vec<Order>,
}

/// Upsert the sample orders `ORD-0001`..`ORD-0010`. With `reset`, every
/// existing order is removed first.
pub async fn seed(store: &OrderStore, reset: bool) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    if reset {
        report.cleared = store.clear().await?;
    }

    for (n, (customer, product, status)) in SAMPLE_ORDERS.iter().enumerate() {
        let draft = NewOrder::new(customer, product, *status).validate()?;
        let (order, operation) = store.upsert(&format!("ORD-{:04}", n + 1), draft).await?;
        match operation {
            OperationKind::Replace => report.replaced.push(order),
            _ => report.inserted.push(order),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seed_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let db = init(&dir.path().join("nested/orders.db")).await.unwrap();
        let store = OrderStore::new(db);

        let first = seed(&store, false).await.unwrap();
        assert_eq!(first.inserted.len(), 10);
        assert_eq!(first.inserted[0].id, "ORD-0001");
        assert_eq!(first.inserted[9].id, "ORD-0010");

        let second = seed(&store, false).await.unwrap();
        assert_eq!(second.replaced.len(), 10);
        assert_eq!(store.stats().await.unwrap().total, 10);

        let reset = seed(&store, true).await.unwrap();
        assert_eq!(reset.cleared, 10);
        assert_eq!(reset.inserted.len(), 10);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.by_status["pending"], 4);
        assert_eq!(stats.by_status["shipped"], 3);
        assert_eq!(stats.by_status["delivered"], 3);
    }
}
