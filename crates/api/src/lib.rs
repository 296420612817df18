//! HTTP API for the order fulfillment saga.
//!
//! A thin boundary over [`saga::SagaRuntime`]: orders, products, payments,
//! health and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::SagaRuntime;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub runtime: SagaRuntime,
}

impl AppState {
    pub fn new(runtime: SagaRuntime) -> Arc<Self> {
        Arc::new(Self { runtime })
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create).get(routes::orders::list))
        .route("/orders/{id}", get(routes::orders::get))
        .route("/orders/{id}/cancel", post(routes::orders::cancel))
        .route("/orders/{id}/reservations", get(routes::orders::reservations))
        .route("/orders/{id}/payment", get(routes::payments::for_order))
        .route("/products", post(routes::products::create).get(routes::products::list))
        .route("/products/{id}", get(routes::products::get))
        .route("/products/{id}/stock", post(routes::products::add_stock))
        .route("/payments", post(routes::payments::process))
        .route("/payments/{id}", get(routes::payments::get))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
