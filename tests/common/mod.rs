//! Shared harness for integration tests: in-memory SQLite, a scripted
//! gateway and a notification sink that records what it was asked to send.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use eventhub_payments::{
    app_router,
    config::AppConfig,
    db,
    entities::{
        attendee, event,
        payment::{self, PaymentStatus, CHECKOUT_SESSION_KEY},
        ticket::{self, TicketPaymentStatus, TicketStatus},
    },
    gateway::{
        CheckoutSession, CheckoutSnapshot, CreateCheckoutRequest, GatewayError, PaymentGateway,
    },
    notifications::{NotificationError, NotificationKind, NotificationSink},
    webhooks::SignatureVerifier,
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, Database, EntityTrait, PaginatorTrait,
    QueryFilter, Set,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_7f3a9c2e41b84d0c";
const JWT_SECRET: &str = "integration-tests-jwt-secret-0123456789abcdef";

/// Gateway double. Checkouts get sequential references and start out open and unpaid;
/// tests script what a later retrieve returns.
#[derive(Default)]
pub struct FakeGateway {
    created: AtomicUsize,
    snapshots: Mutex<HashMap<String, Value>>,
    requests: Mutex<Vec<CreateCheckoutRequest>>,
    fail_create: Mutex<Option<String>>,
}

impl FakeGateway {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CreateCheckoutRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// Replace the gateway's view of `reference`.
    pub fn set_checkout(&self, reference: &str, snapshot: Value) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(reference.to_string(), snapshot);
    }

    /// Mark a checkout completed and paid under `transaction_id`.
    pub fn complete(&self, reference: &str, ticket_id: Uuid, transaction_id: &str) {
        self.set_checkout(
            reference,
            json!({
                "id": reference,
                "status": "complete",
                "payment_status": "paid",
                "payment_intent": transaction_id,
                "metadata": { "ticketId": ticket_id.to_string() }
            }),
        );
    }

    pub fn reject_creates(&self, message: &str) {
        *self.fail_create.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout(
        &self,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        if let Some(message) = self.fail_create.lock().unwrap().clone() {
            return Err(GatewayError::Rejected {
                status: 402,
                message,
            });
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let reference = format!("cs_test_{n:04}");
        self.set_checkout(
            &reference,
            json!({
                "id": reference,
                "status": "open",
                "payment_status": "unpaid",
                "metadata": { "ticketId": request.ticket_id.to_string() }
            }),
        );
        self.requests.lock().unwrap().push(request.clone());

        Ok(CheckoutSession {
            redirect_url: format!("https://checkout.test/pay/{reference}"),
            reference,
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        })
    }

    async fn retrieve_checkout(&self, reference: &str) -> Result<CheckoutSnapshot, GatewayError> {
        let value = self
            .snapshots
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                status: 404,
                message: format!("No such checkout.session: '{reference}'"),
            })?;
        CheckoutSnapshot::from_value(value).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

pub type SentNotification = (Uuid, NotificationKind, Value);

/// Forwards every notification to a channel the test can await on
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<SentNotification>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(
        &self,
        user_id: Uuid,
        kind: NotificationKind,
        payload: Value,
    ) -> Result<(), NotificationError> {
        let _ = self.tx.send((user_id, kind, payload));
        Ok(())
    }
}

/// Always fails, like a broker that is down
pub struct FailingSink {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl NotificationSink for FailingSink {
    async fn notify(
        &self,
        _user_id: Uuid,
        _kind: NotificationKind,
        _payload: Value,
    ) -> Result<(), NotificationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let err = serde_json::from_str::<Value>("{").unwrap_err();
        Err(NotificationError::Serialization(err))
    }
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub gateway: Arc<FakeGateway>,
    notifications: tokio::sync::Mutex<mpsc::UnboundedReceiver<SentNotification>>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(|cfg| cfg, None).await
    }

    /// App whose webhook endpoint has no signing secret.
    pub async fn without_webhook_secret() -> Self {
        Self::build(
            |mut cfg| {
                cfg.payment_webhook_secret = None;
                cfg
            },
            None,
        )
        .await
    }

    pub async fn with_sink(sink: Arc<dyn NotificationSink>) -> Self {
        Self::build(|cfg| cfg, Some(sink)).await
    }

    async fn build(
        configure: impl FnOnce(AppConfig) -> AppConfig,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        // A single connection keeps every query on the same in-memory database.
        let mut opt = ConnectOptions::new("sqlite::memory:".to_string());
        opt.max_connections(1)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .sqlx_logging(false);
        let conn = Database::connect(opt)
            .await
            .expect("connect to in-memory sqlite");
        db::run_migrations(&conn).await.expect("run migrations");

        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        let cfg = configure(cfg);

        let (tx, rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn NotificationSink> = match sink {
            Some(sink) => sink,
            None => Arc::new(RecordingSink { tx }),
        };
        let gateway = Arc::new(FakeGateway::default());

        let state = AppState::new(Arc::new(conn), cfg, gateway.clone(), sink);
        let router = app_router(state.clone());

        Self {
            state,
            router,
            gateway,
            notifications: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn token_for(&self, user_id: Uuid) -> String {
        self.state
            .auth
            .issue_token(user_id, Some(format!("{}@example.com", user_id.simple())))
            .expect("issue test token")
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// POST raw bytes to the webhook endpoint with an optional signature header.
    pub async fn post_webhook_raw(&self, payload: &[u8], signature: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header("stripe-signature", sig);
        }
        let request = builder
            .body(Body::from(payload.to_vec()))
            .expect("failed to build webhook request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook request")
    }

    /// POST a correctly signed webhook delivery.
    pub async fn post_webhook(&self, event: &Value) -> Response {
        let payload = serde_json::to_vec(event).expect("serialize webhook event");
        let signature = sign_webhook(&payload);
        self.post_webhook_raw(&payload, Some(&signature)).await
    }

    pub async fn seed_event(&self, title: &str) -> event::Model {
        let now = Utc::now();
        event::ActiveModel {
            id: Set(Uuid::new_v4()),
            title: Set(title.to_string()),
            tickets_sold: Set(0),
            capacity: Set(Some(500)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed event")
    }

    pub async fn seed_ticket(
        &self,
        event_id: Uuid,
        attendee_id: Uuid,
        quantity: i32,
        unit_price: Decimal,
    ) -> ticket::Model {
        let now = Utc::now();
        let id = Uuid::new_v4();
        ticket::ActiveModel {
            id: Set(id),
            event_id: Set(event_id),
            attendee_id: Set(attendee_id),
            quantity: Set(quantity),
            unit_price: Set(unit_price),
            total_amount: Set(unit_price * Decimal::from(quantity)),
            status: Set(TicketStatus::Pending),
            payment_status: Set(TicketPaymentStatus::Pending),
            ticket_number: Set(format!("TKT-{}", &id.simple().to_string()[..10])),
            qr_code: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed ticket")
    }

    /// Pending payment as the checkout flow would record it.
    pub async fn seed_pending_payment(
        &self,
        ticket: &ticket::Model,
        checkout_reference: &str,
    ) -> payment::Model {
        let now = Utc::now();
        payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            ticket_id: Set(ticket.id),
            user_id: Set(ticket.attendee_id),
            user_email: Set(None),
            event_id: Set(ticket.event_id),
            amount: Set(ticket.total_amount),
            currency: Set("usd".to_string()),
            payment_method: Set("card".to_string()),
            status: Set(PaymentStatus::Pending),
            gateway_transaction_id: Set(checkout_reference.to_string()),
            checkout_session_id: Set(checkout_reference.to_string()),
            refund_amount: Set(Decimal::ZERO),
            refund_reason: Set(None),
            metadata: Set(json!({ CHECKOUT_SESSION_KEY: checkout_reference })),
            created_at: Set(now),
            updated_at: Set(now),
            settled_at: Set(None),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed payment")
    }

    pub async fn payment(&self, id: Uuid) -> payment::Model {
        payment::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load payment")
            .expect("payment exists")
    }

    pub async fn ticket(&self, id: Uuid) -> ticket::Model {
        ticket::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load ticket")
            .expect("ticket exists")
    }

    pub async fn event(&self, id: Uuid) -> event::Model {
        event::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load event")
            .expect("event exists")
    }

    pub async fn attendee_count(&self, ticket_id: Uuid) -> u64 {
        attendee::Entity::find()
            .filter(attendee::Column::TicketId.eq(ticket_id))
            .count(&*self.state.db)
            .await
            .expect("count attendees")
    }

    /// Next confirmation the sink received, waiting briefly for the spawned send.
    pub async fn next_notification(&self) -> Option<SentNotification> {
        let mut rx = self.notifications.lock().await;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// True when nothing further arrives within a short grace period.
    pub async fn no_more_notifications(&self) -> bool {
        let mut rx = self.notifications.lock().await;
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    }
}

pub fn sign_webhook(payload: &[u8]) -> String {
    SignatureVerifier::new(WEBHOOK_SECRET, Duration::from_secs(300))
        .sign(payload, Utc::now().timestamp())
        .expect("sign webhook payload")
}

pub fn webhook_event(event_type: &str, object: Value) -> Value {
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "data": { "object": object }
    })
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
