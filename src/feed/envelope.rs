//! Notification envelopes
//!
//! A [`RawChange`] is whatever the store's change feed reports. A
//! [`NotificationEnvelope`] is the normalized shape that fans out to observers.
//! The envelope's fields are private: the only ways to build one are the
//! per-operation constructors, the normalizer and the validating deserializer,
//! so a `delete` carrying `previousData` cannot exist.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kind of mutation an envelope describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Replace,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Replace => "replace",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = NormalizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            "replace" => Ok(OperationKind::Replace),
            other => Err(NormalizeError::UnrecognizedOperation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("unrecognized operation type '{0}'")]
    UnrecognizedOperation(String),

    #[error("{operation} event is missing {field}")]
    MissingPayload {
        operation: OperationKind,
        field: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("previousData is only allowed on update envelopes, found on {0}")]
    PreviousDataNotAllowed(OperationKind),
}

/// One event as reported by a change feed, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChange {
    pub operation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document_before_change: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Value>,
}

impl RawChange {
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            full_document: None,
            full_document_before_change: None,
            document_key: None,
        }
    }

    pub fn insert(document: Value) -> Self {
        Self {
            full_document: Some(document),
            ..Self::new("insert")
        }
    }

    pub fn update(document: Value, before: Option<Value>) -> Self {
        Self {
            full_document: Some(document),
            full_document_before_change: before,
            ..Self::new("update")
        }
    }

    pub fn replace(document: Value) -> Self {
        Self {
            full_document: Some(document),
            ..Self::new("replace")
        }
    }

    pub fn delete(key: Value) -> Self {
        Self {
            document_key: Some(key),
            ..Self::new("delete")
        }
    }
}

/// Normalized change notification delivered to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "EnvelopeWire")]
pub struct NotificationEnvelope {
    operation: OperationKind,
    timestamp: DateTime<Utc>,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_data: Option<Value>,
}

impl NotificationEnvelope {
    fn build(operation: OperationKind, data: Value, previous_data: Option<Value>) -> Self {
        Self {
            operation,
            timestamp: Utc::now(),
            data,
            previous_data,
        }
    }

    pub fn insert(document: Value) -> Self {
        Self::build(OperationKind::Insert, document, None)
    }

    /// `previous` is best-effort: stores may not be able to supply it.
    pub fn update(document: Value, previous: Option<Value>) -> Self {
        Self::build(OperationKind::Update, document, previous)
    }

    pub fn replace(document: Value) -> Self {
        Self::build(OperationKind::Replace, document, None)
    }

    pub fn delete(key: Value) -> Self {
        Self::build(OperationKind::Delete, key, None)
    }

    /// Normalize a raw feed event, stamping the envelope with the current time.
    pub fn from_raw(raw: RawChange) -> Result<Self, NormalizeError> {
        let operation: OperationKind = raw.operation_type.parse()?;
        let missing = |field| NormalizeError::MissingPayload { operation, field };

        let envelope = match operation {
            OperationKind::Insert => {
                Self::insert(raw.full_document.ok_or_else(|| missing("fullDocument"))?)
            }
            OperationKind::Update => Self::update(
                raw.full_document.ok_or_else(|| missing("fullDocument"))?,
                raw.full_document_before_change,
            ),
            OperationKind::Replace => {
                Self::replace(raw.full_document.ok_or_else(|| missing("fullDocument"))?)
            }
            OperationKind::Delete => {
                Self::delete(raw.document_key.ok_or_else(|| missing("documentKey"))?)
            }
        };
        Ok(envelope)
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn previous_data(&self) -> Option<&Value> {
        self.previous_data.as_ref()
    }

    /// The `id` of the document this envelope concerns, if present.
    pub fn key(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }
}

impl TryFrom<RawChange> for NotificationEnvelope {
    type Error = NormalizeError;

    fn try_from(raw: RawChange) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeWire {
    operation: OperationKind,
    timestamp: DateTime<Utc>,
    data: Value,
    #[serde(default)]
    previous_data: Option<Value>,
}

impl TryFrom<EnvelopeWire> for NotificationEnvelope {
    type Error = EnvelopeError;

    fn try_from(wire: EnvelopeWire) -> Result<Self, Self::Error> {
        if wire.previous_data.is_some() && wire.operation != OperationKind::Update {
            return Err(EnvelopeError::PreviousDataNotAllowed(wire.operation));
        }
        Ok(Self {
            operation: wire.operation,
            timestamp: wire.timestamp,
            data: wire.data,
            previous_data: wire.previous_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_carries_previous_data() {
        let envelope = NotificationEnvelope::from_raw(RawChange::update(
            json!({"id": "A1", "status": "shipped"}),
            Some(json!({"id": "A1", "status": "pending"})),
        ))
        .unwrap();

        assert_eq!(envelope.operation(), OperationKind::Update);
        assert_eq!(envelope.data()["status"], "shipped");
        assert_eq!(envelope.previous_data().unwrap()["status"], "pending");
        assert_eq!(envelope.key(), Some("A1"));
    }

    #[test]
    fn update_without_before_image_is_still_valid() {
        let envelope =
            NotificationEnvelope::from_raw(RawChange::update(json!({"id": "A1"}), None)).unwrap();
        assert!(envelope.previous_data().is_none());
    }

    #[test]
    fn delete_uses_document_key_and_ignores_before_image() {
        let mut raw = RawChange::delete(json!({"id": "A1"}));
        raw.full_document_before_change = Some(json!({"id": "A1", "status": "pending"}));

        let envelope = NotificationEnvelope::from_raw(raw).unwrap();
        assert_eq!(envelope.operation(), OperationKind::Delete);
        assert_eq!(envelope.data(), &json!({"id": "A1"}));
        assert!(envelope.previous_data().is_none());
    }

    #[test]
    fn insert_and_replace_never_carry_previous_data() {
        let mut raw = RawChange::replace(json!({"id": "A1"}));
        raw.full_document_before_change = Some(json!({"id": "A0"}));
        let envelope = NotificationEnvelope::from_raw(raw).unwrap();
        assert_eq!(envelope.operation(), OperationKind::Replace);
        assert!(envelope.previous_data().is_none());

        let envelope = NotificationEnvelope::from_raw(RawChange::insert(json!({"id": "B"}))).unwrap();
        assert_eq!(envelope.operation(), OperationKind::Insert);
        assert!(envelope.previous_data().is_none());
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let err = NotificationEnvelope::from_raw(RawChange::new("drop")).unwrap_err();
        assert_eq!(err, NormalizeError::UnrecognizedOperation("drop".into()));
    }

    #[test]
    fn missing_payload_is_rejected() {
        let err = NotificationEnvelope::from_raw(RawChange::new("insert")).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::MissingPayload {
                operation: OperationKind::Insert,
                field: "fullDocument"
            }
        );
    }

    #[test]
    fn wire_format_omits_absent_previous_data() {
        let envelope = NotificationEnvelope::insert(json!({"id": "A1"}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["operation"], "insert");
        assert!(value.get("previousData").is_none());
        assert!(value["timestamp"].is_string());

        let envelope = NotificationEnvelope::update(json!({"id": "A1"}), Some(json!({"id": "A1"})));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["previousData"], json!({"id": "A1"}));
    }

    #[test]
    fn deserializing_delete_with_previous_data_fails() {
        let payload = json!({
            "operation": "delete",
            "timestamp": "2026-01-01T00:00:00Z",
            "data": {"id": "A1"},
            "previousData": {"id": "A1", "status": "pending"}
        });
        assert!(serde_json::from_value::<NotificationEnvelope>(payload).is_err());

        let payload = json!({
            "operation": "update",
            "timestamp": "2026-01-01T00:00:00Z",
            "data": {"id": "A1", "status": "shipped"},
            "previousData": {"id": "A1", "status": "pending"}
        });
        let envelope: NotificationEnvelope = serde_json::from_value(payload).unwrap();
        assert_eq!(envelope.operation(), OperationKind::Update);
    }
}
