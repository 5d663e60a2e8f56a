use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

static CUSTOMER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z\s'-]+$").expect("customer name pattern compiles"));

const CUSTOMER_NAME_LEN: (usize, usize) = (2, 100);
const PRODUCT_NAME_LEN: (usize, usize) = (2, 200);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(&'static str),

    #[error("{field} must be at least {min} characters long")]
    TooShort { field: &'static str, min: usize },

    #[error("{field} cannot exceed {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("Customer name can only contain letters, spaces, hyphens, and apostrophes")]
    CustomerNameCharacters,

    #[error("Status must be one of: pending, shipped, delivered (got '{0}')")]
    Status(String),
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Shipped,
    Delivered,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 3] = [
        OrderStatus::Pending,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| ValidationError::Status(s.to_string()))
    }
}

/// A stored order document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub customer_name: String,
    pub product_name: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build a fresh order from a validated draft, stamping both timestamps.
    pub fn from_draft(id: Option<String>, draft: OrderDraft) -> Self {
        let now = Utc::now();
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            customer_name: draft.customer_name,
            product_name: draft.product_name,
            status: draft.status,
            created_at: now,
            updated_at: now,
        }
    }

    /// JSON document form, as delivered to observers
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "customer_name": self.customer_name,
            "product_name": self.product_name,
            "status": self.status,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        })
    }

    /// Minimal key identifying an order, used for delete notifications
    pub fn key_document(id: &str) -> serde_json::Value {
        serde_json::json!({ "id": id })
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Validated order fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDraft {
    pub customer_name: String,
    pub product_name: String,
    pub status: OrderStatus,
}

/// Create-order request body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewOrder {
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl NewOrder {
    pub fn new(customer_name: &str, product_name: &str, status: OrderStatus) -> Self {
        Self {
            customer_name: Some(customer_name.to_string()),
            product_name: Some(product_name.to_string()),
            status: Some(status.as_str().to_string()),
        }
    }

    pub fn validate(self) -> Result<OrderDraft, ValidationError> {
        let customer_name = self
            .customer_name
            .ok_or(ValidationError::Required("customer_name"))?;
        let product_name = self
            .product_name
            .ok_or(ValidationError::Required("product_name"))?;
        let status = match self.status.as_deref() {
            None | Some("") => OrderStatus::default(),
            Some(raw) => raw.parse()?,
        };

        Ok(OrderDraft {
            customer_name: validate_customer_name(&customer_name)?,
            product_name: validate_product_name(&product_name)?,
            status,
        })
    }
}

/// Partial update request body; absent fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderPatch {
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl OrderPatch {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status: Some(status.as_str().to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.customer_name.is_none() && self.product_name.is_none() && self.status.is_none()
    }

    /// Validate every present field and apply them to `order`. On error the
    /// order is left unchanged.
    pub fn apply_to(&self, order: &mut Order) -> Result<(), ValidationError> {
        let customer_name = self
            .customer_name
            .as_deref()
            .map(validate_customer_name)
            .transpose()?;
        let product_name = self
            .product_name
            .as_deref()
            .map(validate_product_name)
            .transpose()?;
        let status = self
            .status
            .as_deref()
            .map(OrderStatus::from_str)
            .transpose()?;

        if let Some(name) = customer_name {
            order.customer_name = name;
        }
        if let Some(name) = product_name {
            order.product_name = name;
        }
        if let Some(status) = status {
            order.status = status;
        }
        order.touch();
        Ok(())
    }
}

fn validate_customer_name(raw: &str) -> Result<String, ValidationError> {
    let name = check_length("Customer name", raw, CUSTOMER_NAME_LEN)?;
    if !CUSTOMER_NAME.is_match(&name) {
        return Err(ValidationError::CustomerNameCharacters);
    }
    Ok(name)
}

fn validate_product_name(raw: &str) -> Result<String, ValidationError> {
    check_length("Product name", raw, PRODUCT_NAME_LEN)
}

fn check_length(
    field: &'static str,
    raw: &str,
    (min, max): (usize, usize),
) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    if len < min {
        return Err(ValidationError::TooShort { field, min });
    }
    if len > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_order_defaults_to_pending_and_trims() {
        let draft = NewOrder {
            customer_name: Some("  Mary O'Neil ".into()),
            product_name: Some(" Kettle ".into()),
            status: None,
        }
        .validate()
        .unwrap();

        assert_eq!(draft.customer_name, "Mary O'Neil");
        assert_eq!(draft.product_name, "Kettle");
        assert_eq!(draft.status, OrderStatus::Pending);
    }

    #[test]
    fn new_order_requires_names() {
        let err = NewOrder {
            product_name: Some("Kettle".into()),
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert_eq!(err, ValidationError::Required("customer_name"));
    }

    #[test]
    fn customer_name_rejects_digits() {
        let err = NewOrder::new("R2D2", "Droid oil", OrderStatus::Pending)
            .validate()
            .unwrap_err();
        assert_eq!(err, ValidationError::CustomerNameCharacters);
    }

    #[test]
    fn length_limits() {
        let err = NewOrder::new("A", "Kettle", OrderStatus::Pending)
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::TooShort {
                field: "Customer name",
                min: 2
            }
        );

        let long_product = "x".repeat(201);
        let err = NewOrder::new("Jane Doe", &long_product, OrderStatus::Pending)
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::TooLong {
                field: "Product name",
                max: 200
            }
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(matches!(
            "lost".parse::<OrderStatus>(),
            Err(ValidationError::Status(_))
        ));
        assert_eq!("shipped".parse::<OrderStatus>(), Ok(OrderStatus::Shipped));
    }

    #[test]
    fn patch_is_all_or_nothing() {
        let draft = NewOrder::new("Jane Doe", "Kettle", OrderStatus::Pending)
            .validate()
            .unwrap();
        let mut order = Order::from_draft(Some("A1".into()), draft);
        let before = order.clone();

        let bad = OrderPatch {
            product_name: Some("Teapot".into()),
            status: Some("lost".into()),
            ..Default::default()
        };
        assert!(bad.apply_to(&mut order).is_err());
        assert_eq!(order, before);

        OrderPatch::status(OrderStatus::Shipped)
            .apply_to(&mut order)
            .unwrap();
        assert_eq!(order.status, OrderStatus::Shipped);
        assert!(order.updated_at >= before.updated_at);
    }

    #[test]
    fn document_shape() {
        let draft = NewOrder::new("Jane Doe", "Kettle", OrderStatus::Shipped)
            .validate()
            .unwrap();
        let order = Order::from_draft(Some("A1".into()), draft);
        let doc = order.to_document();
        assert_eq!(doc["id"], "A1");
        assert_eq!(doc["status"], "shipped");
        assert_eq!(Order::key_document("A1"), serde_json::json!({"id": "A1"}));
    }
}
