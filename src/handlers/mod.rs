pub mod health;
pub mod payment_webhooks;
pub mod payments;

use axum::{routing::get, Router};

use crate::AppState;

/// Versioned API routes
pub fn api_v1_routes() -> Router<AppState> {
    Router::new().nest("/payments", payments::payments_routes())
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health::health_check))
}
