use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::settlement::{SettlementReconciler, SettlementSignal, SignalSource};
use crate::{entities::payment, errors::ServiceError, gateway::PaymentGateway};

const MAX_REFERENCE_LEN: usize = 255;

/// Client-driven settlement check: re-reads the gateway and reconciles.
#[derive(Clone)]
pub struct VerificationService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: SettlementReconciler,
}

impl VerificationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        reconciler: SettlementReconciler,
    ) -> Self {
        Self {
            db,
            gateway,
            reconciler,
        }
    }

    /// Returns the caller's payment for `checkout_reference` after reconciling
    /// it against the gateway's current state.
    #[instrument(skip(self), fields(%user_id))]
    pub async fn verify(
        &self,
        user_id: Uuid,
        checkout_reference: &str,
    ) -> Result<payment::Model, ServiceError> {
        validate_reference(checkout_reference)?;

        let payment = payment::Entity::find()
            .filter(payment::Column::CheckoutSessionId.eq(checkout_reference))
            .one(&*self.db)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("payment for checkout {checkout_reference} not found"))
            })?;

        let snapshot = self.gateway.retrieve_checkout(checkout_reference).await?;
        if snapshot.reference != checkout_reference {
            return Err(ServiceError::ExternalServiceError(format!(
                "gateway returned checkout {} for {}",
                snapshot.reference, checkout_reference
            )));
        }

        let signal = SettlementSignal::from_checkout(SignalSource::Verification, &snapshot);
        let outcome = self.reconciler.reconcile(signal).await?;
        info!(payment_id = %payment.id, outcome = outcome.label(), "checkout verified");

        payment::Entity::find_by_id(payment.id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {} not found", payment.id)))
    }

    /// Read-back of a payment owned by `user_id`.
    pub async fn payment_for_user(
        &self,
        user_id: Uuid,
        payment_id: Uuid,
    ) -> Result<payment::Model, ServiceError> {
        payment::Entity::find_by_id(payment_id)
            .one(&*self.db)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| ServiceError::NotFound(format!("payment {payment_id} not found")))
    }
}

fn validate_reference(reference: &str) -> Result<(), ServiceError> {
    let valid = !reference.is_empty()
        && reference.len() <= MAX_REFERENCE_LEN
        && reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ServiceError::BadRequest(
            "malformed checkout reference".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_gateway_style_references() {
        assert!(validate_reference("cs_test_a1B2c3").is_ok());
        assert!(validate_reference("cs-live-01").is_ok());
    }

    #[test]
    fn rejects_injection_shaped_references() {
        assert!(validate_reference("").is_err());
        assert!(validate_reference("cs_1/../../v1/charges").is_err());
        assert!(validate_reference("cs 1").is_err());
        assert!(validate_reference(&"x".repeat(256)).is_err());
    }
}
