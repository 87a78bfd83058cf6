use axum::{routing::get, Json, Router};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "EventHub Payments API",
        version = "1.0.0",
        description = r#"
# EventHub Payments

Ticket checkout, gateway webhook intake and payment verification.

## Authentication

Client endpoints require a bearer token:

```
Authorization: Bearer <your-jwt-token>
```

The webhook endpoint is authenticated by the gateway's `Stripe-Signature` header instead.
"#
    ),
    tags(
        (name = "Payments", description = "Checkout, verification and gateway webhooks"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::payments::create_checkout,
        crate::handlers::payments::verify_payment,
        crate::handlers::payments::get_payment,
        crate::handlers::payment_webhooks::payment_webhook,
        crate::handlers::health::health_check,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::handlers::payments::CheckoutRequest,
            crate::handlers::payments::CheckoutResponse,
            crate::handlers::payments::PaymentResponse,
            crate::handlers::payments::VerifyPaymentResponse,
            crate::handlers::payment_webhooks::WebhookAck,
            crate::handlers::health::HealthResponse,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDocV1::openapi())
}

pub fn openapi_routes() -> Router<AppState> {
    Router::new().route("/api-docs/openapi.json", get(openapi_json))
}
