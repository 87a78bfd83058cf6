use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::entities::payment;
use crate::errors::ServiceError;
use crate::services::{CheckoutCommand, IssuedCheckout};
use crate::{ApiResponse, AppState};

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "ticketId": "550e8400-e29b-41d4-a716-446655440000",
    "currency": "usd"
}))]
pub struct CheckoutRequest {
    /// Ticket to pay for; must belong to the caller
    pub ticket_id: Uuid,
    /// ISO 4217 code, defaults to the configured currency
    #[validate(length(equal = 3))]
    #[schema(example = "usd")]
    pub currency: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    /// Gateway checkout reference, used later for verification
    pub checkout_reference: String,
    /// Hosted payment page to redirect the client to
    pub redirect_url: String,
    pub payment_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<IssuedCheckout> for CheckoutResponse {
    fn from(issued: IssuedCheckout) -> Self {
        Self {
            checkout_reference: issued.checkout_reference,
            redirect_url: issued.redirect_url,
            payment_id: issued.payment_id,
            expires_at: issued.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub event_id: Uuid,
    #[schema(example = "49.50")]
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    /// pending, succeeded, failed or refunded
    #[schema(example = "succeeded")]
    pub status: String,
    pub gateway_transaction_id: String,
    pub checkout_reference: String,
    pub refund_amount: Decimal,
    pub refund_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl From<payment::Model> for PaymentResponse {
    fn from(model: payment::Model) -> Self {
        Self {
            id: model.id,
            ticket_id: model.ticket_id,
            event_id: model.event_id,
            amount: model.amount,
            currency: model.currency,
            payment_method: model.payment_method,
            status: model.status.to_string(),
            gateway_transaction_id: model.gateway_transaction_id,
            checkout_reference: model.checkout_session_id,
            refund_amount: model.refund_amount,
            refund_reason: model.refund_reason,
            created_at: model.created_at,
            updated_at: model.updated_at,
            settled_at: model.settled_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VerifyPaymentResponse {
    pub payment: PaymentResponse,
}

/// Open a gateway checkout for a ticket
#[utoipa::path(
    post,
    path = "/api/v1/payments/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Checkout issued", body = ApiResponse<CheckoutResponse>),
        (status = 400, description = "Ticket cancelled or invalid request", body = crate::errors::ErrorResponse),
        (status = 403, description = "Ticket belongs to another user", body = crate::errors::ErrorResponse),
        (status = 404, description = "Ticket not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Ticket already paid", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway failure", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn create_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutResponse>>), ServiceError> {
    request.validate()?;

    let issued = state
        .checkout
        .issue_checkout(CheckoutCommand {
            user_id: user.user_id,
            user_email: user.email,
            ticket_id: request.ticket_id,
            currency: request.currency,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CheckoutResponse::from(issued))),
    ))
}

/// Reconcile a checkout against the gateway and return the payment
#[utoipa::path(
    get,
    path = "/api/v1/payments/verify/{checkout_reference}",
    params(
        ("checkout_reference" = String, Path, description = "Reference returned by checkout")
    ),
    responses(
        (status = 200, description = "Current payment state", body = ApiResponse<VerifyPaymentResponse>),
        (status = 404, description = "No payment of the caller has this reference", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway failure, retry later", body = crate::errors::ErrorResponse),
        (status = 504, description = "Gateway timeout, retry later", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(checkout_reference): Path<String>,
) -> Result<Json<ApiResponse<VerifyPaymentResponse>>, ServiceError> {
    let payment = state
        .verification
        .verify(user.user_id, &checkout_reference)
        .await?;

    Ok(Json(ApiResponse::success(VerifyPaymentResponse {
        payment: payment.into(),
    })))
}

/// Fetch one of the caller's payments
#[utoipa::path(
    get,
    path = "/api/v1/payments/{payment_id}",
    params(
        ("payment_id" = Uuid, Path, description = "Payment ID")
    ),
    responses(
        (status = 200, description = "Payment", body = ApiResponse<PaymentResponse>),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn get_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentResponse>>, ServiceError> {
    let payment = state
        .verification
        .payment_for_user(user.user_id, payment_id)
        .await?;

    Ok(Json(ApiResponse::success(payment.into())))
}

pub fn payments_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(create_checkout))
        .route("/webhook", post(super::payment_webhooks::payment_webhook))
        .route("/verify/:checkout_reference", get(verify_payment))
        .route("/:payment_id", get(get_payment))
}
