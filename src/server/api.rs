use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AppState;
use crate::error::RelayError;
use crate::model::{NewOrder, Order, OrderPatch, OrderStatus, ValidationError};
use crate::storage::{OrderSort, OrderStats};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Success body shared by every endpoint
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: T,
}

impl<T> ApiResponse<T> {
    fn data(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            count: None,
            message: None,
            data,
        })
    }

    fn message(message: &str, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            count: None,
            message: Some(message.to_string()),
            data,
        })
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, RelayError>;

/// Map a store failure, surfacing patch validation errors as 400s.
fn store_error(context: &'static str) -> impl FnOnce(anyhow::Error) -> RelayError {
    move |err| match err.downcast::<ValidationError>() {
        Ok(validation) => RelayError::Validation(validation),
        Err(err) => RelayError::internal(context, err),
    }
}

fn not_found() -> RelayError {
    RelayError::NotFound("Order not found".to_string())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
    sort: Option<String>,
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Order>> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<OrderStatus>)
        .transpose()?;
    let sort = match query.sort.as_deref() {
        Some(raw) if !raw.is_empty() => raw.parse::<OrderSort>().map_err(RelayError::BadRequest)?,
        _ => OrderSort::default(),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let orders = state
        .store
        .list(status, limit, sort)
        .await
        .map_err(store_error("Error fetching orders"))?;

    Ok(Json(ApiResponse {
        success: true,
        count: Some(orders.len()),
        message: None,
        data: orders,
    }))
}

pub async fn get_order(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Order> {
    let order = state
        .store
        .get(&id)
        .await
        .map_err(store_error("Error fetching order"))?
        .ok_or_else(not_found)?;
    Ok(ApiResponse::data(order))
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(body): Json<NewOrder>,
) -> Result<(StatusCode, Json<ApiResponse<Order>>), RelayError> {
    let draft = body.validate()?;
    let order = state
        .store
        .insert(draft)
        .await
        .map_err(store_error("Error creating order"))?;

    info!(order_id = %order.id, status = %order.status, "order created");
    Ok((
        StatusCode::CREATED,
        ApiResponse::message("Order created successfully", order),
    ))
}

pub async fn update_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<OrderPatch>,
) -> ApiResult<Order> {
    if patch.is_empty() {
        return Err(RelayError::BadRequest(
            "at least one of customer_name, product_name, status is required".to_string(),
        ));
    }

    let order = state
        .store
        .update(&id, patch)
        .await
        .map_err(store_error("Error updating order"))?
        .ok_or_else(not_found)?;

    info!(order_id = %order.id, "order updated");
    Ok(ApiResponse::message("Order updated successfully", order))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    status: Option<String>,
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> ApiResult<Order> {
    let status = body
        .status
        .as_deref()
        .and_then(|raw| raw.parse::<OrderStatus>().ok())
        .ok_or_else(|| {
            RelayError::BadRequest(
                "Valid status (pending, shipped, delivered) is required".to_string(),
            )
        })?;

    let order = state
        .store
        .update_status(&id, status)
        .await
        .map_err(store_error("Error updating order status"))?
        .ok_or_else(not_found)?;

    info!(order_id = %order.id, %status, "order status changed");
    Ok(ApiResponse::message(
        &format!("Order status updated to {status}"),
        order,
    ))
}

pub async fn delete_order(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Order> {
    let order = state
        .store
        .delete(&id)
        .await
        .map_err(store_error("Error deleting order"))?
        .ok_or_else(not_found)?;

    info!(order_id = %order.id, "order deleted");
    Ok(ApiResponse::message("Order deleted successfully", order))
}

pub async fn stats(State(state): State<AppState>) -> ApiResult<OrderStats> {
    let stats = state
        .store
        .stats()
        .await
        .map_err(store_error("Error fetching statistics"))?;
    Ok(ApiResponse::data(stats))
}
