//! Webhook endpoint integration tests: signature enforcement, event
//! classification and settlement through the reconciler.

mod common;

use axum::http::StatusCode;
use common::{response_json, sign_webhook, webhook_event, TestApp};
use eventhub_payments::entities::{payment::PaymentStatus, ticket::TicketStatus};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

// ==================== Signature ====================

#[tokio::test]
async fn missing_signature_is_rejected() {
    let app = TestApp::new().await;
    let payload = serde_json::to_vec(&webhook_event("payment_intent.succeeded", json!({"id": "pi_1"})))
        .unwrap();

    let response = app.post_webhook_raw(&payload, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tampered_body_is_rejected() {
    let app = TestApp::new().await;
    let event = app.seed_event("Tamper Night").await;
    let ticket = app.seed_ticket(event.id, Uuid::new_v4(), 1, dec!(10.00)).await;
    let payment = app.seed_pending_payment(&ticket, "cs_tamper").await;

    let original = serde_json::to_vec(&webhook_event(
        "checkout.session.completed",
        json!({"id": "cs_tamper", "payment_status": "unpaid"}),
    ))
    .unwrap();
    let signature = sign_webhook(&original);
    let forged = serde_json::to_vec(&webhook_event(
        "checkout.session.completed",
        json!({"id": "cs_tamper", "payment_status": "paid", "payment_intent": "pi_forged"}),
    ))
    .unwrap();

    let response = app.post_webhook_raw(&forged, Some(&signature)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.payment(payment.id).await.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn stale_signature_is_rejected() {
    let app = TestApp::new().await;
    let payload = serde_json::to_vec(&webhook_event("customer.created", json!({"id": "cus_1"})))
        .unwrap();
    let stale = eventhub_payments::webhooks::SignatureVerifier::new(
        common::WEBHOOK_SECRET,
        std::time::Duration::from_secs(300),
    )
    .sign(&payload, chrono::Utc::now().timestamp() - 3_600)
    .unwrap();

    let response = app.post_webhook_raw(&payload, Some(&stale)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_secret_rejects_everything() {
    let app = TestApp::without_webhook_secret().await;
    let payload = serde_json::to_vec(&webhook_event("customer.created", json!({"id": "cus_1"})))
        .unwrap();
    let signature = sign_webhook(&payload);

    let response = app.post_webhook_raw(&payload, Some(&signature)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ==================== Payload ====================

#[tokio::test]
async fn signed_garbage_is_a_bad_request() {
    let app = TestApp::new().await;
    let payload = b"not json at all".to_vec();
    let signature = sign_webhook(&payload);

    let response = app.post_webhook_raw(&payload, Some(&signature)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn handled_type_with_wrong_shape_is_acknowledged_without_writes() {
    let app = TestApp::new().await;
    let event = app.seed_event("Odd Shapes").await;
    let ticket = app.seed_ticket(event.id, Uuid::new_v4(), 1, dec!(10.00)).await;
    let payment = app.seed_pending_payment(&ticket, "cs_shape").await;

    let response = app
        .post_webhook(&webhook_event(
            "payment_intent.succeeded",
            json!({"amount": 100, "metadata": {"ticketId": ticket.id.to_string()}}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["received"], true);
    assert_eq!(body["outcome"], "malformed");
    assert_eq!(app.payment(payment.id).await.status, PaymentStatus::Pending);
    assert_eq!(app.event(event.id).await.tickets_sold, 0);
}

#[tokio::test]
async fn unrelated_event_types_are_acknowledged() {
    let app = TestApp::new().await;
    let response = app
        .post_webhook(&webhook_event("customer.created", json!({"id": "cus_1"})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["received"], true);
    assert!(body.get("outcome").is_none());
}

#[tokio::test]
async fn unmatched_settlement_is_acknowledged() {
    let app = TestApp::new().await;
    let response = app
        .post_webhook(&webhook_event(
            "payment_intent.succeeded",
            json!({"id": "pi_nobody", "metadata": {"ticketId": Uuid::new_v4().to_string()}}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["received"], true);
    assert_eq!(body["outcome"], "unmatched");
}

// ==================== Settlement ====================

#[tokio::test]
async fn completed_checkout_settles_and_redelivery_is_a_noop() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let event = app.seed_event("Dockside").await;
    let ticket = app.seed_ticket(event.id, user, 2, dec!(25.00)).await;
    let payment = app.seed_pending_payment(&ticket, "cs_hook").await;

    let delivery = webhook_event(
        "checkout.session.completed",
        json!({
            "id": "cs_hook",
            "status": "complete",
            "payment_status": "paid",
            "payment_intent": "pi_hook",
            "metadata": { "ticketId": ticket.id.to_string() }
        }),
    );

    let response = app.post_webhook(&delivery).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "settled");

    let response = app.post_webhook(&delivery).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "already_final");

    let stored = app.payment(payment.id).await;
    assert_eq!(stored.status, PaymentStatus::Succeeded);
    assert_eq!(stored.gateway_transaction_id, "pi_hook");
    assert_eq!(stored.metadata["gateway"]["id"], "cs_hook");
    assert_eq!(app.event(event.id).await.tickets_sold, 2);
    assert_eq!(app.attendee_count(ticket.id).await, 1);
    assert!(app.next_notification().await.is_some());
}

#[tokio::test]
async fn intent_event_settles_through_ticket_metadata() {
    let app = TestApp::new().await;
    let event = app.seed_event("Intent Only").await;
    let ticket = app.seed_ticket(event.id, Uuid::new_v4(), 1, dec!(60.00)).await;
    let payment = app.seed_pending_payment(&ticket, "cs_intent").await;

    let response = app
        .post_webhook(&webhook_event(
            "payment_intent.succeeded",
            json!({
                "id": "pi_intent",
                "status": "succeeded",
                "metadata": { "ticketId": ticket.id.to_string() }
            }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "settled");

    let stored = app.payment(payment.id).await;
    assert_eq!(stored.status, PaymentStatus::Succeeded);
    assert_eq!(stored.gateway_transaction_id, "pi_intent");
    assert_eq!(stored.checkout_session_id, "cs_intent");
}

#[tokio::test]
async fn session_completed_after_intent_succeeded_is_already_final() {
    let app = TestApp::new().await;
    let event = app.seed_event("Late Session").await;
    let ticket = app.seed_ticket(event.id, Uuid::new_v4(), 3, dec!(18.00)).await;
    let payment = app.seed_pending_payment(&ticket, "cs_order").await;

    let response = app
        .post_webhook(&webhook_event(
            "payment_intent.succeeded",
            json!({
                "id": "pi_order",
                "status": "succeeded",
                "metadata": { "ticketId": ticket.id.to_string() }
            }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "settled");

    let response = app
        .post_webhook(&webhook_event(
            "checkout.session.completed",
            json!({
                "id": "cs_order",
                "status": "complete",
                "payment_status": "paid",
                "payment_intent": "pi_order",
                "metadata": { "ticketId": ticket.id.to_string() }
            }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "already_final");

    let stored = app.payment(payment.id).await;
    assert_eq!(stored.status, PaymentStatus::Succeeded);
    assert_eq!(stored.gateway_transaction_id, "pi_order");
    assert_eq!(app.event(event.id).await.tickets_sold, 3);
    assert_eq!(app.attendee_count(ticket.id).await, 1);
    assert!(app.next_notification().await.is_some());
    assert!(app.no_more_notifications().await);
}

#[tokio::test]
async fn expired_checkout_fails_the_payment() {
    let app = TestApp::new().await;
    let event = app.seed_event("Missed It").await;
    let ticket = app.seed_ticket(event.id, Uuid::new_v4(), 1, dec!(22.00)).await;
    let payment = app.seed_pending_payment(&ticket, "cs_expired").await;

    let response = app
        .post_webhook(&webhook_event(
            "checkout.session.expired",
            json!({"id": "cs_expired", "status": "expired", "payment_status": "unpaid"}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "failed");

    assert_eq!(app.payment(payment.id).await.status, PaymentStatus::Failed);
    assert_eq!(app.ticket(ticket.id).await.status, TicketStatus::Cancelled);
    assert_eq!(app.event(event.id).await.tickets_sold, 0);
}

#[tokio::test]
async fn duplicate_deliveries_racing_verification_settle_once() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let token = app.token_for(user);
    let event = app.seed_event("Harbour Lights").await;
    let ticket = app.seed_ticket(event.id, user, 2, dec!(25.00)).await;
    let payment = app.seed_pending_payment(&ticket, "cs_1").await;
    app.gateway.complete("cs_1", ticket.id, "pi_9");

    let delivery = webhook_event(
        "checkout.session.completed",
        json!({
            "id": "cs_1",
            "status": "complete",
            "payment_status": "paid",
            "payment_intent": "pi_9",
            "metadata": { "ticketId": ticket.id.to_string() }
        }),
    );

    let (first, second, verified) = tokio::join!(
        app.post_webhook(&delivery),
        app.post_webhook(&delivery),
        app.request(
            axum::http::Method::GET,
            "/api/v1/payments/verify/cs_1",
            None,
            Some(&token)
        )
    );
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(verified.status(), StatusCode::OK);
    assert_eq!(
        response_json(verified).await["data"]["payment"]["status"],
        "succeeded"
    );

    let stored = app.payment(payment.id).await;
    assert_eq!(stored.status, PaymentStatus::Succeeded);
    assert_eq!(stored.gateway_transaction_id, "pi_9");
    let stored_ticket = app.ticket(ticket.id).await;
    assert_eq!(stored_ticket.status, TicketStatus::Confirmed);
    assert_eq!(
        stored_ticket.payment_status,
        eventhub_payments::entities::ticket::TicketPaymentStatus::Paid
    );
    assert_eq!(app.event(event.id).await.tickets_sold, 2);
    assert_eq!(app.attendee_count(ticket.id).await, 1);
    assert!(app.next_notification().await.is_some());
    assert!(app.no_more_notifications().await);
}
