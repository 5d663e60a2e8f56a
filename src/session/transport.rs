use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::feed::NotificationEnvelope;

/// Messages the relay sends to an observer, framed as
/// `{"event": "<name>", "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Recent records, most recent first. Always the first message of a session
    /// unless the snapshot could not be loaded.
    InitialOrders(Vec<Value>),
    /// The snapshot could not be loaded; live updates still follow.
    SnapshotError { message: String },
    OrderUpdate(Arc<NotificationEnvelope>),
    /// Updates were dropped because this observer fell behind.
    Gap { dropped: u64 },
}

impl ServerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::InitialOrders(_) => "initial_orders",
            ServerMessage::SnapshotError { .. } => "snapshot_error",
            ServerMessage::OrderUpdate(_) => "order_update",
            ServerMessage::Gap { .. } => "gap",
        }
    }
}

/// Outbound half of one observer connection.
///
/// Owned exclusively by the session's delivery task; the hub never touches it.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, message: ServerMessage) -> Result<()>;

    /// Best-effort close; the transport is dropped right after.
    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_framing() {
        let snapshot = ServerMessage::InitialOrders(vec![json!({"id": "A1"})]);
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            json!({"event": "initial_orders", "payload": [{"id": "A1"}]})
        );

        let gap = ServerMessage::Gap { dropped: 3 };
        assert_eq!(
            serde_json::to_value(&gap).unwrap(),
            json!({"event": "gap", "payload": {"dropped": 3}})
        );

        let update = ServerMessage::OrderUpdate(Arc::new(NotificationEnvelope::delete(
            json!({"id": "A1"}),
        )));
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["event"], "order_update");
        assert_eq!(value["payload"]["operation"], "delete");
        assert_eq!(value["payload"]["data"], json!({"id": "A1"}));

        let parsed: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, update);
        assert_eq!(parsed.name(), "order_update");
    }
}
