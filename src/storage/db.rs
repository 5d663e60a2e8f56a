use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::feed::{OperationKind, RawChange};
use crate::model::{Order, OrderPatch, OrderStatus};

/// Operation recorded by `clear`. Not part of the envelope vocabulary, so the
/// watcher logs and skips it.
pub const DROP_OPERATION: &str = "drop";

const ORDER_COLUMNS: &str = "id, customer_name, product_name, status, created_at, updated_at";

pub struct Database {
    pub conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                customer_name TEXT NOT NULL,
                product_name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS change_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_type TEXT NOT NULL,
                document_key TEXT,
                full_document TEXT,
                full_document_before TEXT,
                recorded_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_updated
             ON orders(updated_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_status
             ON orders(status)",
            [],
        )?;

        Ok(())
    }

    pub fn insert_order(&self, order: &Order) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        write_order(&tx, order, false)?;
        record_change(&tx, &RawChange::insert(order.to_document()))?;
        tx.commit()?;
        Ok(())
    }

    /// Insert, or replace an existing order with the same id. The original
    /// `created_at` survives a replace.
    pub fn upsert_order(&self, order: &Order) -> Result<(Order, OperationKind)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut stored = order.clone();
        let operation = match find_order(&tx, &order.id)? {
            Some(existing) => {
                stored.created_at = existing.created_at;
                write_order(&tx, &stored, true)?;
                record_change(&tx, &RawChange::replace(stored.to_document()))?;
                OperationKind::Replace
            }
            None => {
                write_order(&tx, &stored, false)?;
                record_change(&tx, &RawChange::insert(stored.to_document()))?;
                OperationKind::Insert
            }
        };

        tx.commit()?;
        Ok((stored, operation))
    }

    pub fn get_order(&self, id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock();
        find_order(&conn, id)
    }

    pub fn list_orders(
        &self,
        status: Option<OrderStatus>,
        limit: usize,
        sort: OrderSort,
    ) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let order_by = sort.to_sql();

        let orders = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ORDER_COLUMNS} FROM orders WHERE status = ?1 ORDER BY {order_by} LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit as i64], order_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ORDER_COLUMNS} FROM orders ORDER BY {order_by} LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], order_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(orders)
    }

    /// Apply `patch` to the order `id`. `Ok(None)` when no such order exists.
    /// A patch that fails validation is returned as a `ValidationError` inside
    /// the `anyhow::Error` and nothing is written.
    pub fn update_order(&self, id: &str, patch: &OrderPatch) -> Result<Option<Order>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let Some(before) = find_order(&tx, id)? else {
            return Ok(None);
        };
        let mut after = before.clone();
        patch.apply_to(&mut after)?;

        write_order(&tx, &after, true)?;
        record_change(
            &tx,
            &RawChange::update(after.to_document(), Some(before.to_document())),
        )?;
        tx.commit()?;

        Ok(Some(after))
    }

    pub fn delete_order(&self, id: &str) -> Result<Option<Order>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let Some(existing) = find_order(&tx, id)? else {
            return Ok(None);
        };
        tx.execute("DELETE FROM orders WHERE id = ?1", params![id])?;
        record_change(&tx, &RawChange::delete(Order::key_document(id)))?;
        tx.commit()?;

        Ok(Some(existing))
    }

    /// Remove every order. Returns how many were deleted.
    pub fn clear_orders(&self) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM orders", [])?;
        record_change(&tx, &RawChange::new(DROP_OPERATION))?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn order_stats(&self) -> Result<OrderStats> {
        let conn = self.conn.lock();

        let mut by_status: BTreeMap<String, u64> = OrderStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM orders GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut total = 0;
        for row in rows {
            let (status, count) = row?;
            total += count as u64;
            *by_status.entry(status).or_default() += count as u64;
        }

        Ok(OrderStats { total, by_status })
    }

    /// Highest change-log sequence number, 0 when the log is empty.
    pub fn change_log_head(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let head = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM change_log", [], |row| {
            row.get(0)
        })?;
        Ok(head)
    }

    /// Change-log entries after `cursor`, in commit order.
    pub fn changes_since(&self, cursor: i64, limit: usize) -> Result<Vec<(i64, RawChange)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, operation_type, document_key, full_document, full_document_before
             FROM change_log
             WHERE seq > ?1
             ORDER BY seq ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![cursor, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut changes = Vec::new();
        for row in rows {
            let (seq, operation_type, key, document, before) = row?;
            let change = RawChange {
                operation_type,
                full_document: parse_json(document)?,
                full_document_before_change: parse_json(before)?,
                document_key: parse_json(key)?,
            };
            changes.push((seq, change));
        }

        Ok(changes)
    }

    /// Keep the newest `retain` change-log rows, never removing a row past
    /// `consumed` (the highest seq a change feed has already read). Returns
    /// how many rows were removed.
    pub fn compact_change_log(&self, retain: usize, consumed: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM change_log
             WHERE seq <= MIN(?2, (SELECT COALESCE(MAX(seq), 0) FROM change_log) - ?1)",
            params![retain as i64, consumed],
        )?;
        Ok(removed)
    }
}

/// Order list sort key, written as `field` or `-field` for descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderSort {
    pub field: SortField,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    CustomerName,
    ProductName,
    Status,
}

impl SortField {
    fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::CustomerName => "customer_name",
            SortField::ProductName => "product_name",
            SortField::Status => "status",
        }
    }
}

impl OrderSort {
    fn to_sql(self) -> String {
        let direction = if self.descending { "DESC" } else { "ASC" };
        format!("{} {direction}, id {direction}", self.field.column())
    }
}

impl Default for OrderSort {
    fn default() -> Self {
        Self {
            field: SortField::UpdatedAt,
            descending: true,
        }
    }
}

impl FromStr for OrderSort {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (descending, name) = match raw.strip_prefix('-') {
            Some(name) => (true, name),
            None => (false, raw),
        };
        let field = match name {
            "created_at" => SortField::CreatedAt,
            "updated_at" => SortField::UpdatedAt,
            "customer_name" => SortField::CustomerName,
            "product_name" => SortField::ProductName,
            "status" => SortField::Status,
            other => return Err(format!("unsupported sort field '{other}'")),
        };
        Ok(Self { field, descending })
    }
}

/// Order counts, overall and per status
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

fn find_order(conn: &Connection, id: &str) -> Result<Option<Order>> {
    let order = conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )
        .optional()?;
    Ok(order)
}

fn write_order(tx: &Transaction<'_>, order: &Order, replace: bool) -> Result<()> {
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    tx.execute(
        &format!("{verb} INTO orders ({ORDER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
        params![
            order.id,
            order.customer_name,
            order.product_name,
            order.status.as_str(),
            timestamp(&order.created_at),
            timestamp(&order.updated_at),
        ],
    )?;
    Ok(())
}

fn record_change(tx: &Transaction<'_>, change: &RawChange) -> Result<()> {
    tx.execute(
        "INSERT INTO change_log (operation_type, document_key, full_document, full_document_before, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            change.operation_type,
            to_json(&change.document_key)?,
            to_json(&change.full_document)?,
            to_json(&change.full_document_before_change)?,
            timestamp(&Utc::now()),
        ],
    )?;
    Ok(())
}

// Fixed-width so lexical order matches time order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(Order {
        id: row.get(0)?,
        customer_name: row.get(1)?,
        product_name: row.get(2)?,
        status: OrderStatus::from_str(&status).map_err(|err| conversion_error(3, err))?,
        created_at: parse_timestamp(4, &created_at)?,
        updated_at: parse_timestamp(5, &updated_at)?,
    })
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| conversion_error(column, err))
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn to_json(value: &Option<Value>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Into::into)
}

fn parse_json(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|err| anyhow!("corrupt change log payload: {err}"))
    })
    .transpose()
}
