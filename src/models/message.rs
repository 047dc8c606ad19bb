use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::{Headers, MessageId, WorkspaceId};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, sqlx::Type, PartialEq, Eq, Default)]
#[sqlx(type_name = "message_status", rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Queued,
    Processing,
    Sent,
    Failed,
    AuthError,
}

/// Per-recipient outcome tracked independently of the message-level status,
/// since one send attempt can partially succeed (§3 recipient_status addition).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Deferred,
    Bounced,
    Failed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub campaign_id: Option<String>,
    pub user_id: Option<String>,
    pub invitation_id: Option<String>,
    pub email_type: Option<String>,
    pub workspace_id: Option<WorkspaceId>,
    pub status: MessageStatus,
    pub queued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub leased_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recipient_status: HashMap<String, RecipientStatus>,
}

impl Message {
    /// All addressees in `to`/`cc`/`bcc`, in that order — the set a provider send
    /// attempt and `recipient_status` both iterate over (§4.A).
    pub fn all_recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }

    pub fn sender_domain(&self) -> Option<&str> {
        self.from.split('@').next_back()
    }
}

fn parse_recipient_status(value: serde_json::Value) -> HashMap<String, RecipientStatus> {
    serde_json::from_value(value).unwrap_or_default()
}

fn row_to_message(row: PgRow) -> Result<Message, sqlx::Error> {
    let headers_json: serde_json::Value = row.try_get("headers")?;
    let metadata_json: serde_json::Value = row.try_get("metadata")?;
    let attachments_json: serde_json::Value = row.try_get("attachments")?;
    let recipient_status_json: serde_json::Value = row.try_get("recipient_status")?;
    let status: MessageStatus = row.try_get("status")?;
    let workspace_id: Option<String> = row.try_get("workspace_id")?;

    Ok(Message {
        id: MessageId::from(row.try_get::<uuid::Uuid, _>("id")?),
        from: row.try_get("from_address")?,
        to: row.try_get::<serde_json::Value, _>("to_addresses")?.as_array().map(|v| {
            v.iter().filter_map(|x| x.as_str().map(str::to_string)).collect()
        }).unwrap_or_default(),
        cc: row.try_get::<serde_json::Value, _>("cc_addresses")?.as_array().map(|v| {
            v.iter().filter_map(|x| x.as_str().map(str::to_string)).collect()
        }).unwrap_or_default(),
        bcc: row.try_get::<serde_json::Value, _>("bcc_addresses")?.as_array().map(|v| {
            v.iter().filter_map(|x| x.as_str().map(str::to_string)).collect()
        }).unwrap_or_default(),
        subject: row.try_get("subject")?,
        text: row.try_get("text_body")?,
        html: row.try_get("html_body")?,
        headers: serde_json::from_value(headers_json).unwrap_or_default(),
        attachments: serde_json::from_value(attachments_json).unwrap_or_default(),
        metadata: serde_json::from_value(metadata_json).unwrap_or_default(),
        campaign_id: row.try_get("campaign_id")?,
        user_id: row.try_get("user_id")?,
        invitation_id: row.try_get("invitation_id")?,
        email_type: row.try_get("email_type")?,
        workspace_id: workspace_id.map(WorkspaceId::from),
        status,
        queued_at: row.try_get("queued_at")?,
        processed_at: row.try_get("processed_at")?,
        error: row.try_get("error")?,
        retry_count: row.try_get("retry_count")?,
        leased_until: row.try_get("leased_until")?,
        recipient_status: parse_recipient_status(recipient_status_json),
    })
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub headers: Headers,
    pub attachments: Vec<Attachment>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub campaign_id: Option<String>,
    pub user_id: Option<String>,
    pub invitation_id: Option<String>,
    pub email_type: Option<String>,
    pub workspace_id: Option<WorkspaceId>,
}

#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: sqlx::PgPool,
}

impl MessageRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, message: &NewMessage) -> Result<Message, super::Error> {
        let id = MessageId::new();
        let recipient_status: HashMap<&str, RecipientStatus> = message
            .to
            .iter()
            .chain(message.cc.iter())
            .chain(message.bcc.iter())
            .map(|addr| (addr.as_str(), RecipientStatus::Pending))
            .collect();

        let row = sqlx::query(
            r#"
            INSERT INTO messages (
                id, from_address, to_addresses, cc_addresses, bcc_addresses, subject,
                text_body, html_body, headers, attachments, metadata,
                campaign_id, user_id, invitation_id, email_type, workspace_id,
                status, queued_at, retry_count, recipient_status
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                'queued', now(), 0, $17
            )
            RETURNING id, from_address, to_addresses, cc_addresses, bcc_addresses, subject,
                      text_body, html_body, headers, attachments, metadata,
                      campaign_id, user_id, invitation_id, email_type, workspace_id,
                      status, queued_at, processed_at, error, retry_count, leased_until,
                      recipient_status
            "#,
        )
        .bind(id.as_uuid())
        .bind(&message.from)
        .bind(serde_json::to_value(&message.to)?)
        .bind(serde_json::to_value(&message.cc)?)
        .bind(serde_json::to_value(&message.bcc)?)
        .bind(&message.subject)
        .bind(&message.text)
        .bind(&message.html)
        .bind(serde_json::to_value(&message.headers)?)
        .bind(serde_json::to_value(&message.attachments)?)
        .bind(serde_json::to_value(&message.metadata)?)
        .bind(&message.campaign_id)
        .bind(&message.user_id)
        .bind(&message.invitation_id)
        .bind(&message.email_type)
        .bind(message.workspace_id.as_ref().map(WorkspaceId::as_str))
        .bind(serde_json::to_value(&recipient_status)?)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_message(row)?)
    }

    /// Leases up to `batch_size` queued (or auth-error messages past their
    /// cooldown) rows via `FOR UPDATE SKIP LOCKED` so concurrent processors
    /// never race on the same message (§4.B, §9 lease re-architecture note).
    pub async fn dequeue(
        &self,
        batch_size: i64,
        lease_duration: Duration,
        auth_error_cooldown: Duration,
    ) -> Result<Vec<Message>, super::Error> {
        let now = Utc::now();
        let lease_until = now + lease_duration;
        let auth_error_cutoff = now - auth_error_cooldown;

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, from_address, to_addresses, cc_addresses, bcc_addresses, subject,
                   text_body, html_body, headers, attachments, metadata,
                   campaign_id, user_id, invitation_id, email_type, workspace_id,
                   status, queued_at, processed_at, error, retry_count, leased_until,
                   recipient_status
            FROM messages
            WHERE (leased_until IS NULL OR leased_until < $1)
              AND (
                    status = 'queued'
                    OR (status = 'autherror' AND processed_at < $2)
                    OR (status = 'processing' AND leased_until < $1)
                  )
            ORDER BY queued_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(auth_error_cutoff)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let message = row_to_message(row)?;
            let re_leased = message.status == MessageStatus::Processing;
            sqlx::query(
                r#"
                UPDATE messages
                SET status = 'processing',
                    leased_until = $2,
                    retry_count = retry_count + CASE WHEN status = 'processing' THEN 1 ELSE 0 END
                WHERE id = $1
                "#,
            )
            .bind(message.id.as_uuid())
            .bind(lease_until)
            .execute(&mut *tx)
            .await?;
            messages.push(Message {
                status: MessageStatus::Processing,
                leased_until: Some(lease_until),
                retry_count: if re_leased { message.retry_count + 1 } else { message.retry_count },
                ..message
            });
        }

        tx.commit().await?;
        Ok(messages)
    }

    /// Settles a message after a processing attempt: clears the lease, stamps
    /// `processed_at`, and bumps `retry_count` only when re-entering QUEUED
    /// (§4.B) — an AUTH_ERROR transition is not itself a retry.
    pub async fn update_status(
        &self,
        id: MessageId,
        status: MessageStatus,
        error: Option<&str>,
        recipient_status: &HashMap<String, RecipientStatus>,
    ) -> Result<(), super::Error> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = $2,
                error = $3,
                recipient_status = $4,
                processed_at = now(),
                leased_until = NULL,
                retry_count = retry_count + CASE WHEN $2 = 'queued' THEN 1 ELSE 0 END
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status)
        .bind(error)
        .bind(serde_json::to_value(recipient_status)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Re-queues a message denied by the rate limiter without bumping
    /// `retry_count` — a rate-limit deferral is not a delivery failure
    /// (§4.C excess policy, §7 RATE_LIMITED).
    pub async fn defer_for_rate_limit(&self, id: MessageId) -> Result<(), super::Error> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'queued',
                processed_at = now(),
                leased_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Count of messages this workspace (optionally: this sender within it)
    /// has successfully sent since UTC midnight, used to warm-start and
    /// enforce [`super::RateLimits`] (§4.C).
    pub async fn count_sent_today(
        &self,
        workspace_id: &WorkspaceId,
        sender: Option<&str>,
    ) -> Result<i64, super::Error> {
        let midnight_utc = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*)
            FROM messages
            WHERE workspace_id = $1
              AND status = 'sent'
              AND processed_at >= $2
              AND ($3::text IS NULL OR from_address = $3)
            "#,
        )
        .bind(workspace_id.as_str())
        .bind(midnight_utc)
        .bind(sender)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Every sender in `workspace_id` with at least one SENT row since UTC
    /// midnight, so [`super::super::rate_limiter::RateLimiter`]'s warm start
    /// can seed a per-sender counter for every sender that actually sent
    /// today, not only the ones with a configured custom limit (§4.C).
    pub async fn distinct_senders_sent_today(&self, workspace_id: &WorkspaceId) -> Result<Vec<String>, super::Error> {
        let midnight_utc = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();

        let senders: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT from_address
            FROM messages
            WHERE workspace_id = $1
              AND status = 'sent'
              AND processed_at >= $2
            "#,
        )
        .bind(workspace_id.as_str())
        .bind(midnight_utc)
        .fetch_all(&self.pool)
        .await?;

        Ok(senders)
    }

    pub async fn find_by_id(&self, id: MessageId) -> Result<Message, super::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, from_address, to_addresses, cc_addresses, bcc_addresses, subject,
                   text_body, html_body, headers, attachments, metadata,
                   campaign_id, user_id, invitation_id, email_type, workspace_id,
                   status, queued_at, processed_at, error, retry_count, leased_until,
                   recipient_status
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_message(row)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("X-Campaign", "spring-sale");
        assert_eq!(headers.get("x-campaign"), Some("spring-sale"));
        headers.set("X-CAMPAIGN", "autumn-sale");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-Campaign"), Some("autumn-sale"));
    }

    #[test]
    fn sender_domain_extracts_host_part() {
        let email: email_address::EmailAddress = "alice@example.com".parse().unwrap();
        assert_eq!(email.domain(), "example.com");
    }
}
