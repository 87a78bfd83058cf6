use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::events::{GatewayEvent, WebhookEnvelope};
use super::signature::SignatureVerifier;
use crate::errors::ServiceError;
use crate::services::settlement::SettlementReconciler;

/// Receipt outcome for a verified object that does not parse as its event type
pub const MALFORMED_OUTCOME: &str = "malformed";

/// What happened to an accepted webhook delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceipt {
    pub event_id: Option<String>,
    pub event_type: String,
    /// Reconcile outcome label; `None` when the event type is ignored
    pub outcome: Option<&'static str>,
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    verifier: Option<Arc<SignatureVerifier>>,
    reconciler: SettlementReconciler,
}

impl WebhookDispatcher {
    pub fn new(secret: Option<String>, tolerance: Duration, reconciler: SettlementReconciler) -> Self {
        Self {
            verifier: secret
                .filter(|s| !s.trim().is_empty())
                .map(|s| Arc::new(SignatureVerifier::new(s, tolerance))),
            reconciler,
        }
    }

    /// Verify, classify and reconcile one delivery. Errors map to non-2xx so the
    /// gateway redelivers; an unmatched or ignored event is still a success.
    #[instrument(skip(self, signature, body), fields(body_len = body.len()))]
    pub async fn dispatch(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookReceipt, ServiceError> {
        let Some(verifier) = &self.verifier else {
            warn!(target: "security", "webhook rejected: no signing secret configured");
            counter!("eventhub_webhooks.rejected", 1, "reason" => "no_secret");
            return Err(ServiceError::Unauthorized(
                "webhook signing secret not configured".to_string(),
            ));
        };

        if let Err(err) = verifier.verify(signature, body) {
            warn!(target: "security", reason = %err, "webhook signature verification failed");
            counter!("eventhub_webhooks.rejected", 1, "reason" => "signature");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }

        let envelope: WebhookEnvelope = serde_json::from_slice(body)
            .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {e}")))?;
        let event_id = envelope.id.clone();
        let event_type = envelope.event_type.clone();

        // Redelivery cannot fix a signed object of the wrong shape; acknowledge it.
        let event = match GatewayEvent::from_envelope(envelope) {
            Ok(event) => event,
            Err(err) => {
                warn!(target: "security", ?event_id, %event_type, error = %err, "signed webhook object has unexpected shape");
                counter!("eventhub_webhooks.malformed_object", 1);
                return Ok(WebhookReceipt {
                    event_id,
                    event_type,
                    outcome: Some(MALFORMED_OUTCOME),
                });
            }
        };

        let Some(signal) = event.settlement_signal() else {
            info!(?event_id, %event_type, "ignoring unhandled webhook event");
            return Ok(WebhookReceipt {
                event_id,
                event_type,
                outcome: None,
            });
        };

        let outcome = self.reconciler.reconcile(signal).await?;
        info!(?event_id, %event_type, outcome = outcome.label(), "webhook processed");

        Ok(WebhookReceipt {
            event_id,
            event_type,
            outcome: Some(outcome.label()),
        })
    }
}
