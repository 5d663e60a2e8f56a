//! Observer-side state.
//!
//! [`LocalView`] folds relay messages into a map of orders keyed by `id`.
//! Applying the same message twice leaves the view unchanged, so replays
//! after a reconnect are harmless.

pub mod remote;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::feed::{NotificationEnvelope, OperationKind};
use crate::session::ServerMessage;

pub use remote::{monitor, ws_url, MonitorEvent};

/// What a message did to the view
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange {
    /// The view was replaced by a snapshot of `len` records.
    Reset { len: usize },
    Upserted { id: String, operation: OperationKind },
    Removed { id: String, existed: bool },
    /// The relay dropped updates; the view may be stale until the next snapshot.
    Stale { dropped: u64 },
    SnapshotFailed,
    /// The message carried no usable key.
    Ignored,
}

#[derive(Debug, Default)]
pub struct LocalView {
    records: BTreeMap<String, Value>,
    stale: bool,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, message: &ServerMessage) -> ViewChange {
        match message {
            ServerMessage::InitialOrders(records) => {
                self.records = records
                    .iter()
                    .filter_map(|record| Some((record_id(record)?.to_string(), record.clone())))
                    .collect();
                self.stale = false;
                ViewChange::Reset {
                    len: self.records.len(),
                }
            }
            ServerMessage::SnapshotError { .. } => ViewChange::SnapshotFailed,
            ServerMessage::OrderUpdate(envelope) => self.apply_envelope(envelope),
            ServerMessage::Gap { dropped } => {
                self.stale = true;
                ViewChange::Stale { dropped: *dropped }
            }
        }
    }

    pub fn apply_envelope(&mut self, envelope: &NotificationEnvelope) -> ViewChange {
        let Some(id) = envelope.key().map(str::to_string) else {
            return ViewChange::Ignored;
        };

        match envelope.operation() {
            OperationKind::Delete => {
                let existed = self.records.remove(&id).is_some();
                ViewChange::Removed { id, existed }
            }
            operation => {
                self.records.insert(id.clone(), envelope.data().clone());
                ViewChange::Upserted { id, operation }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn records(&self) -> impl Iterator<Item = &Value> {
        self.records.values()
    }
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}
