//! Product catalogue and stock endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::ProductId;
use inventory::Product;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CreateProductRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub stock_quantity: u32,
}

#[derive(Deserialize)]
pub struct AddStockRequest {
    pub quantity: u32,
}

#[derive(Serialize)]
pub struct ProductResponse {
    #[serde(flatten)]
    pub product: Product,
    pub available_quantity: u32,
}

impl From<Product> for ProductResponse {
    fn from(product: Product) -> Self {
        Self {
            available_quantity: product.available_quantity(),
            product,
        }
    }
}

/// POST /products
#[tracing::instrument(skip(state, req), fields(product_id = %req.id))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<ProductResponse>), ApiError> {
    let product = state
        .runtime
        .inventory()
        .create_product(ProductId::new(req.id), &req.name, req.stock_quantity)
        .await?;
    Ok((StatusCode::CREATED, Json(product.into())))
}

/// GET /products
pub async fn list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ProductResponse>>, ApiError> {
    let products = state.runtime.inventory().list_products().await?;
    Ok(Json(products.into_iter().map(Into::into).collect()))
}

/// GET /products/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ProductResponse>, ApiError> {
    let product = state
        .runtime
        .inventory()
        .get_product(&ProductId::new(id))
        .await?;
    Ok(Json(product.into()))
}

/// POST /products/{id}/stock: add units to on-hand stock.
#[tracing::instrument(skip(state, req))]
pub async fn add_stock(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AddStockRequest>,
) -> Result<Json<ProductResponse>, ApiError> {
    let product = state
        .runtime
        .inventory()
        .add_stock(&ProductId::new(id), req.quantity)
        .await?;
    Ok(Json(product.into()))
}
