//! EventHub Payments
//!
//! Ticket checkout, gateway webhook intake and exactly-once settlement for
//! the EventHub ticketing backend.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod notifications;
pub mod openapi;
pub mod services;
pub mod tracing;
pub mod webhooks;

use axum::{extract::FromRef, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;

use crate::auth::{AuthConfig, AuthService};
use crate::config::AppConfig;
use crate::gateway::PaymentGateway;
use crate::notifications::NotificationSink;
use crate::services::{
    CheckoutService, CheckoutSettings, SettlementReconciler, VerificationService,
};
use crate::webhooks::WebhookDispatcher;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthService>,
    pub checkout: CheckoutService,
    pub verification: VerificationService,
    pub webhooks: WebhookDispatcher,
    pub reconciler: SettlementReconciler,
}

impl AppState {
    /// Wires the services around one gateway and one notification sink.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let reconciler = SettlementReconciler::new(db.clone(), notifier);
        let checkout = CheckoutService::new(
            db.clone(),
            gateway.clone(),
            CheckoutSettings::from_config(&config),
        );
        let verification = VerificationService::new(db.clone(), gateway, reconciler.clone());
        let webhooks = WebhookDispatcher::new(
            config.payment_webhook_secret.clone(),
            Duration::from_secs(config.payment_webhook_tolerance_secs),
            reconciler.clone(),
        );
        let auth = Arc::new(AuthService::new(AuthConfig::from(&config)));

        Self {
            db,
            config: Arc::new(config),
            auth,
            checkout,
            verification,
            webhooks,
            reconciler,
        }
    }
}

impl FromRef<AppState> for Arc<AuthService> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Full HTTP application: API routes, health, OpenAPI document, request ids and tracing.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", handlers::api_v1_routes())
        .merge(handlers::health_routes())
        .merge(openapi::openapi_routes())
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}
