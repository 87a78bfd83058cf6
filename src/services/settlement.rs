//! Settlement reconciliation.
//!
//! Every gateway status change, whether pushed by webhook or pulled by the
//! verification path, ends up in [`SettlementReconciler::reconcile`]. The
//! reconciler finds the payment the signal refers to and advances the
//! payment, its ticket, the event counter and the attendee roster in one
//! transaction, at most once per ticket.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use strum::Display;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::with_transaction,
    entities::{
        attendee, event,
        payment::{self, PaymentStatus},
        ticket::{self, TicketPaymentStatus, TicketStatus},
    },
    errors::ServiceError,
    gateway::CheckoutSnapshot,
    notifications::{NotificationKind, NotificationSink},
};

/// Where a settlement signal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SignalSource {
    Webhook,
    Verification,
}

/// Gateway-reported outcome carried by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SettlementOutcome {
    Succeeded,
    Failed,
    /// Gateway has not decided yet; only identifiers are recorded.
    Pending,
}

impl SettlementOutcome {
    /// Maps a checkout's `status`/`payment_status` pair onto an outcome.
    pub fn for_checkout(status: Option<&str>, payment_status: Option<&str>) -> Self {
        match (status, payment_status) {
            (Some("expired"), _) => SettlementOutcome::Failed,
            (_, Some("paid")) | (_, Some("no_payment_required")) => SettlementOutcome::Succeeded,
            _ => SettlementOutcome::Pending,
        }
    }
}

/// Candidate identifiers plus outcome, independent of how the news arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementSignal {
    pub source: SignalSource,
    pub outcome: SettlementOutcome,
    /// Settlement-time transaction id (payment intent)
    pub transaction_id: Option<String>,
    /// Reference issued when the checkout was opened
    pub checkout_reference: Option<String>,
    pub ticket_id: Option<Uuid>,
    /// Gateway object snapshot, merged into payment metadata
    pub payload: Value,
}

impl SettlementSignal {
    pub fn from_checkout(source: SignalSource, snapshot: &CheckoutSnapshot) -> Self {
        Self {
            source,
            outcome: SettlementOutcome::for_checkout(
                snapshot.status.as_deref(),
                snapshot.payment_status.as_deref(),
            ),
            transaction_id: snapshot.payment_intent.clone(),
            checkout_reference: Some(snapshot.reference.clone()),
            ticket_id: snapshot.ticket_id(),
            payload: snapshot.raw.clone(),
        }
    }

    fn has_candidates(&self) -> bool {
        self.transaction_id.is_some() || self.checkout_reference.is_some() || self.ticket_id.is_some()
    }
}

/// Records written by a successful settlement
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub payment: payment::Model,
    pub ticket: ticket::Model,
    pub attendee: attendee::Model,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Payment moved to `succeeded` by this call.
    Settled(Box<Settlement>),
    /// Payment moved to `failed` by this call.
    Failed(payment::Model),
    /// Payment was already terminal; nothing written.
    AlreadyFinal(payment::Model),
    /// Gateway still undecided; identifiers backfilled at most.
    Deferred(payment::Model),
    /// No payment matches any candidate identifier.
    Unmatched,
    /// Ticket already settled through another payment; this charge needs a manual refund.
    DuplicateCharge(payment::Model),
}

impl ReconcileOutcome {
    pub fn payment(&self) -> Option<&payment::Model> {
        match self {
            ReconcileOutcome::Settled(settlement) => Some(&settlement.payment),
            ReconcileOutcome::Failed(p)
            | ReconcileOutcome::AlreadyFinal(p)
            | ReconcileOutcome::Deferred(p)
            | ReconcileOutcome::DuplicateCharge(p) => Some(p),
            ReconcileOutcome::Unmatched => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Settled(_) => "settled",
            ReconcileOutcome::Failed(_) => "failed",
            ReconcileOutcome::AlreadyFinal(_) => "already_final",
            ReconcileOutcome::Deferred(_) => "deferred",
            ReconcileOutcome::Unmatched => "unmatched",
            ReconcileOutcome::DuplicateCharge(_) => "duplicate_charge",
        }
    }
}

#[derive(Debug, Clone, Copy, Display)]
#[strum(serialize_all = "snake_case")]
enum LookupPath {
    TransactionId,
    CheckoutReference,
    PendingTicket,
}

/// The single writer of settlement state
#[derive(Clone)]
pub struct SettlementReconciler {
    db: Arc<DatabaseConnection>,
    notifier: Arc<dyn NotificationSink>,
}

impl SettlementReconciler {
    pub fn new(db: Arc<DatabaseConnection>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { db, notifier }
    }

    /// Apply a settlement signal. Safe to call any number of times, concurrently,
    /// in any order, for the same purchase.
    #[instrument(skip(self, signal), fields(source = %signal.source, outcome = %signal.outcome))]
    pub async fn reconcile(
        &self,
        signal: SettlementSignal,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if !signal.has_candidates() {
            warn!("settlement signal carries no identifiers");
            return Ok(ReconcileOutcome::Unmatched);
        }

        let outcome = with_transaction(&self.db, move |txn| {
            Box::pin(async move { reconcile_in(txn, signal).await })
        })
        .await?;

        counter!("eventhub_settlement.reconciled", 1, "outcome" => outcome.label());

        if let ReconcileOutcome::Settled(settlement) = &outcome {
            info!(
                payment_id = %settlement.payment.id,
                ticket_id = %settlement.ticket.id,
                attendee_id = %settlement.attendee.id,
                "payment settled"
            );
            self.spawn_confirmation(settlement);
        }

        Ok(outcome)
    }

    /// Runs after commit; failures are logged only.
    fn spawn_confirmation(&self, settlement: &Settlement) {
        let notifier = self.notifier.clone();
        let user_id = settlement.payment.user_id;
        let payload = json!({
            "paymentId": settlement.payment.id,
            "ticketId": settlement.ticket.id,
            "eventId": settlement.ticket.event_id,
            "amount": settlement.payment.amount,
            "currency": settlement.payment.currency,
            "ticketNumber": settlement.ticket.ticket_number,
        });

        tokio::spawn(async move {
            if let Err(err) = notifier
                .notify(user_id, NotificationKind::TicketConfirmation, payload)
                .await
            {
                counter!("eventhub_settlement.notification_failed", 1);
                warn!(%user_id, error = %err, "ticket confirmation notification failed");
            }
        });
    }
}

async fn reconcile_in(
    txn: &DatabaseTransaction,
    signal: SettlementSignal,
) -> Result<ReconcileOutcome, ServiceError> {
    let Some((payment, path)) = find_payment(txn, &signal).await? else {
        info!(
            transaction_id = ?signal.transaction_id,
            checkout_reference = ?signal.checkout_reference,
            ticket_id = ?signal.ticket_id,
            "no payment matches settlement signal; acknowledging"
        );
        return Ok(ReconcileOutcome::Unmatched);
    };

    debug!(payment_id = %payment.id, matched_by = %path, status = %payment.status, "payment matched");

    if payment.is_final() {
        return Ok(ReconcileOutcome::AlreadyFinal(payment));
    }

    match signal.outcome {
        SettlementOutcome::Succeeded => settle(txn, payment, &signal).await,
        SettlementOutcome::Failed => fail(txn, payment, &signal).await,
        SettlementOutcome::Pending => defer(txn, payment, &signal).await,
    }
}

/// Tries transaction id, then checkout reference, then a pending payment for the ticket.
async fn find_payment(
    txn: &DatabaseTransaction,
    signal: &SettlementSignal,
) -> Result<Option<(payment::Model, LookupPath)>, ServiceError> {
    if let Some(transaction_id) = &signal.transaction_id {
        let found = payment::Entity::find()
            .filter(payment::Column::GatewayTransactionId.eq(transaction_id.as_str()))
            .lock_exclusive()
            .one(txn)
            .await?;
        if let Some(p) = found {
            return Ok(Some((p, LookupPath::TransactionId)));
        }
    }

    if let Some(reference) = &signal.checkout_reference {
        let found = payment::Entity::find()
            .filter(payment::Column::CheckoutSessionId.eq(reference.as_str()))
            .lock_exclusive()
            .one(txn)
            .await?;
        if let Some(p) = found {
            return Ok(Some((p, LookupPath::CheckoutReference)));
        }
    }

    if let Some(ticket_id) = signal.ticket_id {
        // A paid ticket's leftover pending payments are duplicate charges, never candidates.
        let paid = ticket::Entity::find_by_id(ticket_id)
            .filter(ticket::Column::PaymentStatus.eq(TicketPaymentStatus::Paid))
            .one(txn)
            .await?
            .is_some();
        if paid {
            return Ok(None);
        }

        let found = payment::Entity::find()
            .filter(payment::Column::TicketId.eq(ticket_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .order_by_desc(payment::Column::CreatedAt)
            .lock_exclusive()
            .one(txn)
            .await?;
        if let Some(p) = found {
            return Ok(Some((p, LookupPath::PendingTicket)));
        }
    }

    Ok(None)
}

/// Transaction id to write onto the payment, if the signal brings a new one.
fn backfill_id(payment: &payment::Model, signal: &SettlementSignal) -> Option<String> {
    signal
        .transaction_id
        .as_ref()
        .filter(|id| **id != payment.gateway_transaction_id)
        .cloned()
}

fn merged_metadata(existing: &Value, signal: &SettlementSignal) -> Value {
    let mut merged = match existing {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    // checkoutSessionId lives at the top level and is never touched here
    merged.insert("gateway".to_string(), signal.payload.clone());
    merged.insert(
        "settlementSource".to_string(),
        Value::String(signal.source.to_string()),
    );
    Value::Object(merged)
}

/// Compare-and-set from `pending`. Returns the updated row, or `None` when
/// a concurrent reconcile already moved the payment.
async fn transition(
    txn: &DatabaseTransaction,
    payment: &payment::Model,
    signal: &SettlementSignal,
    status: Option<PaymentStatus>,
) -> Result<Option<payment::Model>, ServiceError> {
    let now = Utc::now();
    let settled = status.is_some();

    let changes = payment::ActiveModel {
        status: status.map(Set).unwrap_or(NotSet),
        gateway_transaction_id: backfill_id(payment, signal).map(Set).unwrap_or(NotSet),
        metadata: if settled {
            Set(merged_metadata(&payment.metadata, signal))
        } else {
            NotSet
        },
        settled_at: if status == Some(PaymentStatus::Succeeded) {
            Set(Some(now))
        } else {
            NotSet
        },
        updated_at: Set(now),
        ..Default::default()
    };

    let result = payment::Entity::update_many()
        .set(changes)
        .filter(payment::Column::Id.eq(payment.id))
        .filter(payment::Column::Status.eq(PaymentStatus::Pending))
        .exec(txn)
        .await?;

    if result.rows_affected == 0 {
        return Ok(None);
    }

    payment::Entity::find_by_id(payment.id)
        .one(txn)
        .await?
        .map(Some)
        .ok_or_else(|| ServiceError::NotFound(format!("payment {} disappeared", payment.id)))
}

async fn reload_final(
    txn: &DatabaseTransaction,
    payment: payment::Model,
) -> Result<ReconcileOutcome, ServiceError> {
    let current = payment::Entity::find_by_id(payment.id)
        .one(txn)
        .await?
        .unwrap_or(payment);
    Ok(ReconcileOutcome::AlreadyFinal(current))
}

async fn settle(
    txn: &DatabaseTransaction,
    payment: payment::Model,
    signal: &SettlementSignal,
) -> Result<ReconcileOutcome, ServiceError> {
    let ticket = ticket::Entity::find_by_id(payment.ticket_id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("ticket {} not found", payment.ticket_id)))?;

    let attendee_exists = attendee::Entity::find()
        .filter(attendee::Column::TicketId.eq(ticket.id))
        .one(txn)
        .await?
        .is_some();
    let other_settled = payment::Entity::find()
        .filter(payment::Column::TicketId.eq(ticket.id))
        .filter(payment::Column::Status.eq(PaymentStatus::Succeeded))
        .filter(payment::Column::Id.ne(payment.id))
        .one(txn)
        .await?;

    if attendee_exists || other_settled.is_some() {
        counter!("eventhub_settlement.duplicate_charge", 1);
        warn!(
            payment_id = %payment.id,
            ticket_id = %ticket.id,
            settled_payment_id = ?other_settled.map(|p| p.id),
            "ticket already settled by another payment; leaving this charge for manual refund"
        );
        return Ok(ReconcileOutcome::DuplicateCharge(payment));
    }

    let Some(payment) = transition(txn, &payment, signal, Some(PaymentStatus::Succeeded)).await?
    else {
        return reload_final(txn, payment).await;
    };

    let now = Utc::now();
    let quantity = ticket.quantity;
    let event_id = ticket.event_id;

    let mut ticket_update: ticket::ActiveModel = ticket.into();
    ticket_update.status = Set(TicketStatus::Confirmed);
    ticket_update.payment_status = Set(TicketPaymentStatus::Paid);
    ticket_update.updated_at = Set(now);
    let ticket = ticket_update.update(txn).await?;

    let bumped = event::Entity::update_many()
        .col_expr(
            event::Column::TicketsSold,
            Expr::col(event::Column::TicketsSold).add(quantity),
        )
        .col_expr(event::Column::UpdatedAt, Expr::value(now))
        .filter(event::Column::Id.eq(event_id))
        .exec(txn)
        .await?;
    if bumped.rows_affected == 0 {
        return Err(ServiceError::NotFound(format!("event {} not found", event_id)));
    }

    let attendee = attendee::ActiveModel {
        id: Set(Uuid::new_v4()),
        event_id: Set(event_id),
        user_id: Set(payment.user_id),
        ticket_id: Set(ticket.id),
        payment_id: Set(payment.id),
        created_at: Set(now),
    }
    .insert(txn)
    .await?;

    Ok(ReconcileOutcome::Settled(Box::new(Settlement {
        payment,
        ticket,
        attendee,
    })))
}

async fn fail(
    txn: &DatabaseTransaction,
    payment: payment::Model,
    signal: &SettlementSignal,
) -> Result<ReconcileOutcome, ServiceError> {
    let Some(payment) = transition(txn, &payment, signal, Some(PaymentStatus::Failed)).await?
    else {
        return reload_final(txn, payment).await;
    };

    let ticket = ticket::Entity::find_by_id(payment.ticket_id)
        .lock_exclusive()
        .one(txn)
        .await?;

    match ticket {
        Some(ticket) if ticket.payment_status == TicketPaymentStatus::Paid => {
            // Paid through another payment; this failure only concerns its own attempt.
            info!(ticket_id = %ticket.id, payment_id = %payment.id, "failed attempt on a paid ticket");
        }
        Some(ticket) => {
            let mut ticket_update: ticket::ActiveModel = ticket.into();
            ticket_update.status = Set(TicketStatus::Cancelled);
            ticket_update.payment_status = Set(TicketPaymentStatus::Failed);
            ticket_update.updated_at = Set(Utc::now());
            ticket_update.update(txn).await?;
        }
        None => {
            warn!(ticket_id = %payment.ticket_id, "ticket for failed payment not found");
        }
    }

    Ok(ReconcileOutcome::Failed(payment))
}

async fn defer(
    txn: &DatabaseTransaction,
    payment: payment::Model,
    signal: &SettlementSignal,
) -> Result<ReconcileOutcome, ServiceError> {
    if backfill_id(&payment, signal).is_none() {
        return Ok(ReconcileOutcome::Deferred(payment));
    }

    match transition(txn, &payment, signal, None).await? {
        Some(updated) => Ok(ReconcileOutcome::Deferred(updated)),
        None => reload_final(txn, payment).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(Some("complete"), Some("paid"), SettlementOutcome::Succeeded)]
    #[case(Some("complete"), Some("no_payment_required"), SettlementOutcome::Succeeded)]
    #[case(Some("complete"), Some("unpaid"), SettlementOutcome::Pending)]
    #[case(Some("open"), Some("unpaid"), SettlementOutcome::Pending)]
    #[case(Some("expired"), Some("unpaid"), SettlementOutcome::Failed)]
    #[case(None, None, SettlementOutcome::Pending)]
    fn checkout_state_maps_to_outcome(
        #[case] status: Option<&str>,
        #[case] payment_status: Option<&str>,
        #[case] expected: SettlementOutcome,
    ) {
        assert_eq!(SettlementOutcome::for_checkout(status, payment_status), expected);
    }

    #[test]
    fn signal_from_checkout_carries_all_candidates() {
        let ticket_id = Uuid::new_v4();
        let snapshot = CheckoutSnapshot::from_value(json!({
            "id": "cs_1",
            "status": "complete",
            "payment_status": "paid",
            "payment_intent": "pi_9",
            "metadata": { "ticketId": ticket_id.to_string() }
        }))
        .unwrap();

        let signal = SettlementSignal::from_checkout(SignalSource::Verification, &snapshot);
        assert_eq!(signal.outcome, SettlementOutcome::Succeeded);
        assert_eq!(signal.transaction_id.as_deref(), Some("pi_9"));
        assert_eq!(signal.checkout_reference.as_deref(), Some("cs_1"));
        assert_eq!(signal.ticket_id, Some(ticket_id));
        assert!(signal.has_candidates());
    }

    #[test]
    fn merged_metadata_keeps_checkout_reference() {
        let signal = SettlementSignal {
            source: SignalSource::Webhook,
            outcome: SettlementOutcome::Succeeded,
            transaction_id: Some("pi_9".into()),
            checkout_reference: None,
            ticket_id: None,
            payload: json!({"id": "pi_9", "checkoutSessionId": "forged"}),
        };
        let merged = merged_metadata(&json!({"checkoutSessionId": "cs_1"}), &signal);

        assert_eq!(merged["checkoutSessionId"], "cs_1");
        assert_eq!(merged["gateway"]["id"], "pi_9");
        assert_eq!(merged["settlementSource"], "webhook");
    }
}
