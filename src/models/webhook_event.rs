use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MessageId;

/// Mirrors Mandrill's webhook event taxonomy (`send`, `deferral`, `hard_bounce`,
/// `soft_bounce`, `reject`) so the notifier stays drop-in compatible with
/// consumers already parsing Mandrill payloads (§4.L).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "webhook_event_kind", rename_all = "snake_case")]
pub enum WebhookEventKind {
    Send,
    Deferral,
    HardBounce,
    SoftBounce,
    Reject,
}

impl WebhookEventKind {
    /// The Mandrill-compatible wire name used in outbound webhook payloads —
    /// not the column encoding, which goes through the derived `sqlx::Type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventKind::Send => "send",
            WebhookEventKind::Deferral => "deferral",
            WebhookEventKind::HardBounce => "hard_bounce",
            WebhookEventKind::SoftBounce => "soft_bounce",
            WebhookEventKind::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub message_id: MessageId,
    pub event_kind: WebhookEventKind,
    pub recipient: String,
    pub occurred_at: DateTime<Utc>,
    pub details: serde_json::Value,
    pub delivered: bool,
    pub attempts: i32,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub message_id: MessageId,
    pub event_kind: WebhookEventKind,
    pub recipient: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct WebhookEventRepository {
    pool: sqlx::PgPool,
}

impl WebhookEventRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, event: &NewWebhookEvent) -> Result<WebhookEvent, super::Error> {
        let row: (Uuid, Uuid, WebhookEventKind, String, DateTime<Utc>, serde_json::Value, bool, i32) = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (id, message_id, event_kind, recipient, occurred_at, details, delivered, attempts)
            VALUES (gen_random_uuid(), $1, $2, $3, now(), $4, false, 0)
            RETURNING id, message_id, event_kind, recipient, occurred_at, details, delivered, attempts
            "#,
        )
        .bind(event.message_id.as_uuid())
        .bind(event.event_kind)
        .bind(&event.recipient)
        .bind(&event.details)
        .fetch_one(&self.pool)
        .await?;

        Ok(WebhookEvent {
            id: row.0,
            message_id: MessageId::from(row.1),
            event_kind: event.event_kind,
            recipient: row.3,
            occurred_at: row.4,
            details: row.5,
            delivered: row.6,
            attempts: row.7,
        })
    }

    /// Events not yet successfully delivered to the configured webhook URL,
    /// in the order they occurred (oldest first), for retry-loop pickup.
    pub async fn pending(&self, limit: i64) -> Result<Vec<WebhookEvent>, super::Error> {
        let rows: Vec<(Uuid, Uuid, WebhookEventKind, String, DateTime<Utc>, serde_json::Value, bool, i32)> =
            sqlx::query_as(
                r#"
                SELECT id, message_id, event_kind, recipient, occurred_at, details, delivered, attempts
                FROM webhook_events
                WHERE delivered = false
                ORDER BY occurred_at ASC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| WebhookEvent {
                id: row.0,
                message_id: MessageId::from(row.1),
                event_kind: row.2,
                recipient: row.3,
                occurred_at: row.4,
                details: row.5,
                delivered: row.6,
                attempts: row.7,
            })
            .collect())
    }

    pub async fn mark_delivered(&self, id: Uuid) -> Result<(), super::Error> {
        sqlx::query("UPDATE webhook_events SET delivered = true WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_attempt(&self, id: Uuid) -> Result<(), super::Error> {
        sqlx::query("UPDATE webhook_events SET attempts = attempts + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
