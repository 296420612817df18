//! Order endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::{Money, OrderId, UserId};
use events::OrderLine;
use inventory::Reservation;
use order::{Order, OrderQuery, OrderStatus};
use serde::Deserialize;

use super::parse_id;
use crate::AppState;
use crate::error::ApiError;

const DEFAULT_CANCEL_REASON: &str = "cancelled by user";

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: String,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub quantity: u32,
    /// Unit price as a decimal amount.
    pub price: f64,
}

#[derive(Deserialize, Default)]
pub struct ListOrdersParams {
    pub user_id: Option<String>,
    pub status: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Deserialize, Default)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

/// POST /orders: place an order. Reservation starts asynchronously.
#[tracing::instrument(skip(state, req))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let items = req
        .items
        .into_iter()
        .map(|item| {
            let price = Money::from_decimal(item.price)
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            Ok(OrderLine::new(item.product_id, item.quantity, price))
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let order = state
        .runtime
        .orders()
        .create_order(UserId::new(req.user_id), items)
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /orders: newest first, optionally filtered by user and status.
#[tracing::instrument(skip(state, params))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListOrdersParams>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let mut query = OrderQuery::new().page(
        params.offset.unwrap_or(0),
        params.limit.unwrap_or(OrderQuery::DEFAULT_LIMIT),
    );
    if let Some(user_id) = params.user_id {
        query = query.user(UserId::new(user_id));
    }
    if let Some(status) = params.status {
        query = query.status(status.parse::<OrderStatus>()?);
    }

    let orders = state.runtime.orders().list_orders(&query).await?;
    Ok(Json(orders))
}

/// GET /orders/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    let order = state.runtime.orders().get_order(order_id).await?;
    Ok(Json(order))
}

/// POST /orders/{id}/cancel: cancel a pending or processing order. Any
/// reserved stock is released asynchronously.
#[tracing::instrument(skip(state, req))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    req: Option<Json<CancelOrderRequest>>,
) -> Result<Json<Order>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    let reason = req
        .and_then(|Json(r)| r.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

    let order = state
        .runtime
        .orders()
        .cancel_order(order_id, &reason)
        .await?;
    Ok(Json(order))
}

/// GET /orders/{id}/reservations: the inventory reservations held or
/// released for an order.
#[tracing::instrument(skip(state))]
pub async fn reservations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Reservation>>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    let reservations = state
        .runtime
        .inventory()
        .reservations_for_order(order_id)
        .await?;
    Ok(Json(reservations))
}
