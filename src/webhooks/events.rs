use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::gateway::{CheckoutSnapshot, METADATA_TICKET_ID};
use crate::services::settlement::{SettlementOutcome, SettlementSignal, SignalSource};

/// Raw webhook body: `{ id, type, data: { object } }`
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeData {
    pub object: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(skip)]
    pub raw: Value,
}

impl PaymentIntentObject {
    fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut intent: PaymentIntentObject = serde_json::from_value(value.clone())?;
        intent.raw = value;
        Ok(intent)
    }

    pub fn ticket_id(&self) -> Option<Uuid> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get(METADATA_TICKET_ID))
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

/// The event kinds settlement reacts to; everything else is `Unrecognized`.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    CheckoutCompleted(CheckoutSnapshot),
    CheckoutExpired(CheckoutSnapshot),
    PaymentSucceeded(PaymentIntentObject),
    PaymentFailed(PaymentIntentObject),
    Unrecognized { event_type: String },
}

impl GatewayEvent {
    pub fn from_envelope(envelope: WebhookEnvelope) -> Result<Self, serde_json::Error> {
        let object = envelope.data.object;
        Ok(match envelope.event_type.as_str() {
            "checkout.session.completed" => {
                GatewayEvent::CheckoutCompleted(CheckoutSnapshot::from_value(object)?)
            }
            "checkout.session.expired" => {
                GatewayEvent::CheckoutExpired(CheckoutSnapshot::from_value(object)?)
            }
            "payment_intent.succeeded" => {
                GatewayEvent::PaymentSucceeded(PaymentIntentObject::from_value(object)?)
            }
            "payment_intent.payment_failed" => {
                GatewayEvent::PaymentFailed(PaymentIntentObject::from_value(object)?)
            }
            _ => GatewayEvent::Unrecognized {
                event_type: envelope.event_type,
            },
        })
    }

    /// `None` for events that carry no settlement information.
    pub fn settlement_signal(&self) -> Option<SettlementSignal> {
        match self {
            GatewayEvent::CheckoutCompleted(session) => {
                let mut signal = SettlementSignal::from_checkout(SignalSource::Webhook, session);
                signal.outcome = SettlementOutcome::for_checkout(
                    Some("complete"),
                    session.payment_status.as_deref(),
                );
                Some(signal)
            }
            GatewayEvent::CheckoutExpired(session) => {
                let mut signal = SettlementSignal::from_checkout(SignalSource::Webhook, session);
                signal.outcome = SettlementOutcome::Failed;
                Some(signal)
            }
            GatewayEvent::PaymentSucceeded(intent) => {
                Some(intent_signal(intent, SettlementOutcome::Succeeded))
            }
            GatewayEvent::PaymentFailed(intent) => Some(intent_signal(intent, SettlementOutcome::Failed)),
            GatewayEvent::Unrecognized { .. } => None,
        }
    }
}

fn intent_signal(intent: &PaymentIntentObject, outcome: SettlementOutcome) -> SettlementSignal {
    SettlementSignal {
        source: SignalSource::Webhook,
        outcome,
        transaction_id: Some(intent.id.clone()),
        checkout_reference: None,
        ticket_id: intent.ticket_id(),
        payload: intent.raw.clone(),
    }
}
