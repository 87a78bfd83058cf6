use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    config::{validate_currency, AppConfig},
    entities::{
        event,
        payment::{self, PaymentStatus, CHECKOUT_SESSION_KEY},
        ticket::{self, TicketPaymentStatus, TicketStatus},
    },
    errors::ServiceError,
    gateway::{CreateCheckoutRequest, PaymentGateway},
};

/// Redirect and expiry settings forwarded to the gateway
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub success_url: String,
    pub cancel_url: String,
    pub expiry: Duration,
    pub default_currency: String,
}

impl CheckoutSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            success_url: with_session_placeholder(&cfg.checkout_success_url),
            cancel_url: cfg.checkout_cancel_url.clone(),
            expiry: cfg.checkout_expiry(),
            default_currency: cfg.default_currency.to_lowercase(),
        }
    }
}

/// Appends the gateway's session placeholder so the client can verify after redirect-back.
fn with_session_placeholder(url: &str) -> String {
    if url.contains("{CHECKOUT_SESSION_ID}") {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}session_id={{CHECKOUT_SESSION_ID}}")
}

#[derive(Debug, Clone)]
pub struct CheckoutCommand {
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub ticket_id: Uuid,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCheckout {
    pub payment_id: Uuid,
    pub checkout_reference: String,
    pub redirect_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Opens gateway checkouts and records the pending payment
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            settings,
        }
    }

    /// Gateway failures are surfaced as-is; nothing is persisted unless the gateway accepted.
    #[instrument(skip(self, command), fields(ticket_id = %command.ticket_id, user_id = %command.user_id))]
    pub async fn issue_checkout(
        &self,
        command: CheckoutCommand,
    ) -> Result<IssuedCheckout, ServiceError> {
        let currency = command
            .currency
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(self.settings.default_currency.as_str())
            .to_lowercase();
        validate_currency(&currency)
            .map_err(|_| ServiceError::ValidationError(format!("invalid currency '{currency}'")))?;

        let ticket = ticket::Entity::find_by_id(command.ticket_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("ticket {} not found", command.ticket_id))
            })?;

        if ticket.attendee_id != command.user_id {
            return Err(ServiceError::Forbidden(
                "ticket belongs to another user".to_string(),
            ));
        }
        if ticket.payment_status == TicketPaymentStatus::Paid {
            return Err(ServiceError::Conflict(format!(
                "ticket {} is already paid",
                ticket.id
            )));
        }
        if matches!(ticket.status, TicketStatus::Cancelled | TicketStatus::Refunded) {
            return Err(ServiceError::InvalidOperation(format!(
                "ticket {} is {}",
                ticket.id, ticket.status
            )));
        }
        if ticket.total_amount <= Decimal::ZERO {
            return Err(ServiceError::InvalidOperation(format!(
                "ticket {} has nothing to charge",
                ticket.id
            )));
        }

        let event_title = event::Entity::find_by_id(ticket.event_id)
            .one(&*self.db)
            .await?
            .map(|e| e.title)
            .unwrap_or_else(|| "Event".to_string());

        let session = self
            .gateway
            .create_checkout(CreateCheckoutRequest {
                ticket_id: ticket.id,
                user_id: command.user_id,
                event_id: ticket.event_id,
                amount: ticket.total_amount,
                currency: currency.clone(),
                description: format!("{} x{} ({})", event_title, ticket.quantity, ticket.ticket_number),
                customer_email: command.user_email.clone(),
                success_url: self.settings.success_url.clone(),
                cancel_url: self.settings.cancel_url.clone(),
                expires_in: self.settings.expiry,
            })
            .await?;

        let now = Utc::now();
        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            ticket_id: Set(ticket.id),
            user_id: Set(command.user_id),
            user_email: Set(command.user_email),
            event_id: Set(ticket.event_id),
            amount: Set(ticket.total_amount),
            currency: Set(currency),
            payment_method: Set("card".to_string()),
            status: Set(PaymentStatus::Pending),
            gateway_transaction_id: Set(session.reference.clone()),
            checkout_session_id: Set(session.reference.clone()),
            refund_amount: Set(Decimal::ZERO),
            refund_reason: Set(None),
            metadata: Set(json!({
                CHECKOUT_SESSION_KEY: session.reference,
                "expiresAt": session.expires_at,
            })),
            created_at: Set(now),
            updated_at: Set(now),
            settled_at: Set(None),
        }
        .insert(&*self.db)
        .await?;

        counter!("eventhub_checkout.issued", 1);
        info!(payment_id = %payment.id, reference = %session.reference, "checkout issued");

        Ok(IssuedCheckout {
            payment_id: payment.id,
            checkout_reference: session.reference,
            redirect_url: session.redirect_url,
            expires_at: session.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_url_gets_session_placeholder() {
        assert_eq!(
            with_session_placeholder("https://app.test/payments/success"),
            "https://app.test/payments/success?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(
            with_session_placeholder("https://app.test/ok?from=checkout"),
            "https://app.test/ok?from=checkout&session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(
            with_session_placeholder("https://app.test/ok?sid={CHECKOUT_SESSION_ID}"),
            "https://app.test/ok?sid={CHECKOUT_SESSION_ID}"
        );
    }
}
