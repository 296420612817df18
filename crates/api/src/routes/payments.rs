//! Payment trigger and lookup endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{OrderId, PaymentId};
use payment::{Payment, PaymentOutcome, PaymentStatus};
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ProcessPaymentRequest {
    pub order_id: String,
    #[serde(default)]
    pub payment_method: Option<String>,
}

#[derive(Serialize)]
pub struct PaymentOutcomeResponse {
    pub payment_id: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl From<PaymentOutcome> for PaymentOutcomeResponse {
    fn from(outcome: PaymentOutcome) -> Self {
        match outcome {
            PaymentOutcome::Completed {
                payment_id,
                transaction_id,
            } => Self {
                payment_id: payment_id.to_string(),
                status: PaymentStatus::Completed,
                transaction_id: Some(transaction_id),
                failure_reason: None,
            },
            PaymentOutcome::Declined { payment_id, reason } => Self {
                payment_id: payment_id.to_string(),
                status: PaymentStatus::Failed,
                transaction_id: None,
                failure_reason: Some(reason),
            },
        }
    }
}

/// POST /payments: settle the payment of an order whose stock is
/// reserved. Repeating the call returns the stored outcome.
#[tracing::instrument(skip(state, req), fields(order_id = %req.order_id))]
pub async fn process(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProcessPaymentRequest>,
) -> Result<Json<PaymentOutcomeResponse>, ApiError> {
    let order_id: OrderId = parse_id(&req.order_id)?;
    let outcome = match req.payment_method.as_deref() {
        Some(method) => state.runtime.pay_order_with_method(order_id, method).await?,
        None => state.runtime.pay_order(order_id).await?,
    };
    Ok(Json(outcome.into()))
}

/// GET /payments/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Payment>, ApiError> {
    let payment_id: PaymentId = parse_id(&id)?;
    let payment = state.runtime.payments().get_payment(payment_id).await?;
    Ok(Json(payment))
}

/// GET /orders/{id}/payment
#[tracing::instrument(skip(state))]
pub async fn for_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Payment>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    let payment = state
        .runtime
        .payments()
        .payment_for_order(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No payment for order {order_id}")))?;
    Ok(Json(payment))
}
