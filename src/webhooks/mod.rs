//! Inbound gateway webhooks: signature check, event classification and
//! hand-off to the settlement reconciler.

pub mod dispatcher;
pub mod events;
pub mod signature;

pub use dispatcher::{WebhookDispatcher, WebhookReceipt, MALFORMED_OUTCOME};
pub use events::{GatewayEvent, PaymentIntentObject, WebhookEnvelope};
pub use signature::{SignatureError, SignatureVerifier, SIGNATURE_HEADER};
