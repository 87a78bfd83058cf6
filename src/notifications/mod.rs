use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use strum::Display;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

/// Represents a notification
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: Uuid, kind: NotificationKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Types of notifications
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NotificationKind {
    TicketConfirmation,
}

/// Notification sink errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Best-effort delivery of user-facing notices.
///
/// Callers treat failures as log-only; nothing upstream is rolled back.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        user_id: Uuid,
        kind: NotificationKind,
        payload: Value,
    ) -> Result<(), NotificationError>;
}

/// Publishes notifications on a Redis channel and keeps a short per-user inbox
#[derive(Clone)]
pub struct RedisNotificationSink {
    redis: Arc<Client>,
    channel: String,
}

impl RedisNotificationSink {
    const INBOX_LIMIT: isize = 100;

    pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self, NotificationError> {
        let redis = Client::open(redis_url).map_err(NotificationError::Redis)?;
        Ok(Self {
            redis: Arc::new(redis),
            channel: channel.into(),
        })
    }

    fn user_key(user_id: Uuid) -> String {
        format!("notifications:user:{}", user_id)
    }
}

#[async_trait]
impl NotificationSink for RedisNotificationSink {
    #[instrument(skip(self, payload), fields(kind = %kind))]
    async fn notify(
        &self,
        user_id: Uuid,
        kind: NotificationKind,
        payload: Value,
    ) -> Result<(), NotificationError> {
        let notification = Notification::new(user_id, kind, payload);
        let json = serde_json::to_string(&notification)?;
        let user_key = Self::user_key(user_id);

        let mut conn = self.redis.get_async_connection().await?;
        redis::pipe()
            .atomic()
            .publish(&self.channel, &json)
            .ignore()
            .zadd(&user_key, &json, notification.created_at.timestamp())
            .ignore()
            .zremrangebyrank(&user_key, 0, -(Self::INBOX_LIMIT + 1))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        info!(notification_id = %notification.id, "notification published");
        Ok(())
    }
}

/// Sink used when no broker is configured
#[derive(Clone, Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify(
        &self,
        user_id: Uuid,
        kind: NotificationKind,
        payload: Value,
    ) -> Result<(), NotificationError> {
        info!(%user_id, kind = %kind, %payload, "notification (no broker configured)");
        Ok(())
    }
}
