//! Payment gateway port.
//!
//! The checkout flow and the verification path talk to the gateway only
//! through [`PaymentGateway`]; [`StripeGateway`] is the production adapter.

pub mod stripe;

pub use stripe::StripeGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Metadata keys echoed back by the gateway on sessions and intents
pub const METADATA_TICKET_ID: &str = "ticketId";
pub const METADATA_USER_ID: &str = "userId";
pub const METADATA_EVENT_ID: &str = "eventId";

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a hosted checkout for one ticket purchase.
    async fn create_checkout(
        &self,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError>;

    /// Fetch the gateway's current view of a checkout.
    async fn retrieve_checkout(&self, reference: &str) -> Result<CheckoutSnapshot, GatewayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCheckoutRequest {
    pub ticket_id: Uuid,
    pub user_id: Uuid,
    pub event_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    /// Line-item description shown on the hosted page
    pub description: String,
    pub customer_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    pub expires_in: Duration,
}

impl CreateCheckoutRequest {
    pub fn metadata(&self) -> [(&'static str, String); 3] {
        [
            (METADATA_TICKET_ID, self.ticket_id.to_string()),
            (METADATA_USER_ID, self.user_id.to_string()),
            (METADATA_EVENT_ID, self.event_id.to_string()),
        ]
    }
}

/// Result of opening a checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSession {
    /// Checkout reference; not necessarily the id the payment settles under
    pub reference: String,
    pub redirect_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Gateway-side state of a checkout, as fetched or as pushed in a webhook.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSnapshot {
    #[serde(rename = "id")]
    pub reference: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(skip)]
    pub raw: Value,
}

impl CheckoutSnapshot {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut snapshot: CheckoutSnapshot = serde_json::from_value(value.clone())?;
        snapshot.raw = value;
        Ok(snapshot)
    }

    /// Ticket this checkout was opened for; metadata wins over `client_reference_id`.
    pub fn ticket_id(&self) -> Option<Uuid> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get(METADATA_TICKET_ID))
            .or(self.client_reference_id.as_ref())
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway is not configured")]
    NotConfigured,

    #[error("payment gateway timed out: {0}")]
    Timeout(String),

    #[error("payment gateway unreachable: {0}")]
    Transport(String),

    #[error("payment gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected payment gateway response: {0}")]
    InvalidResponse(String),

    #[error("amount {0} cannot be charged")]
    InvalidAmount(Decimal),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Timeout(_) => ServiceError::GatewayTimeout(err.to_string()),
            GatewayError::InvalidAmount(_) => ServiceError::InvalidOperation(err.to_string()),
            _ => ServiceError::ExternalServiceError(err.to_string()),
        }
    }
}

/// Converts a major-unit amount into the gateway's integer minor units.
pub fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .filter(|units| *units > 0)
        .ok_or(GatewayError::InvalidAmount(amount))
}
