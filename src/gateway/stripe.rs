use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{
    to_minor_units, CheckoutSession, CheckoutSnapshot, CreateCheckoutRequest, GatewayError,
    PaymentGateway,
};
use crate::config::AppConfig;

/// Stripe Checkout Sessions adapter
#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    id: String,
    url: Option<String>,
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl StripeGateway {
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self, GatewayError> {
        Self::new(
            cfg.gateway_api_base.clone(),
            cfg.gateway_api_key.clone(),
            cfg.gateway_timeout(),
        )
    }

    fn api_key(&self) -> Result<&str, GatewayError> {
        self.api_key.as_deref().ok_or(GatewayError::NotConfigured)
    }

    fn session_form(request: &CreateCheckoutRequest) -> Result<Vec<(String, String)>, GatewayError> {
        let unit_amount = to_minor_units(request.amount)?;
        let expires_at = Utc::now().timestamp() + request.expires_in.as_secs() as i64;

        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
            (
                "client_reference_id".to_string(),
                request.ticket_id.to_string(),
            ),
            ("expires_at".to_string(), expires_at.to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            (
                "line_items[0][price_data][currency]".to_string(),
                request.currency.to_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]".to_string(),
                unit_amount.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".to_string(),
                request.description.clone(),
            ),
        ];

        if let Some(email) = &request.customer_email {
            form.push(("customer_email".to_string(), email.clone()));
        }

        // Intents carry the same metadata so payment_intent.* events can fall back to the ticket.
        for (key, value) in request.metadata() {
            form.push((format!("metadata[{key}]"), value.clone()));
            form.push((format!("payment_intent_data[metadata][{key}]"), value));
        }

        Ok(form)
    }

    async fn error_from(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let message = match response.json::<ErrorEnvelope>().await {
            Ok(envelope) => envelope
                .error
                .message
                .unwrap_or_else(|| "no error message".to_string()),
            Err(_) => "unreadable error body".to_string(),
        };
        warn!(status, %message, "payment gateway rejected request");
        GatewayError::Rejected { status, message }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, request), fields(ticket_id = %request.ticket_id))]
    async fn create_checkout(
        &self,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let api_key = self.api_key()?;
        let form = Self::session_form(&request)?;

        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(api_key)
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let created: SessionCreated = response.json().await?;
        let redirect_url = created.url.ok_or_else(|| {
            GatewayError::InvalidResponse(format!("checkout {} has no redirect url", created.id))
        })?;

        debug!(reference = %created.id, "checkout session created");

        Ok(CheckoutSession {
            reference: created.id,
            redirect_url,
            expires_at: created
                .expires_at
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
        })
    }

    #[instrument(skip(self))]
    async fn retrieve_checkout(&self, reference: &str) -> Result<CheckoutSnapshot, GatewayError> {
        let api_key = self.api_key()?;

        let response = self
            .client
            .get(format!("{}/v1/checkout/sessions/{}", self.api_base, reference))
            .bearer_auth(api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: Value = response.json().await?;
        CheckoutSnapshot::from_value(body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}
