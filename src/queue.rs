use std::collections::HashMap;

use chrono::Duration;
use sqlx::PgPool;

use crate::models::{self, Message, MessageId, MessageStatus, NewMessage, RecipientStatus, WorkspaceId};

/// Durable, at-least-once message queue backed by the `messages` table.
/// Leasing (`FOR UPDATE SKIP LOCKED` + `leased_until`) is what makes a
/// crashed processor's in-flight batch eligible for redelivery rather than
/// lost (§4.B).
#[derive(Debug, Clone)]
pub struct MessageQueue {
    repository: models::MessageRepository,
    lease_duration: Duration,
    auth_error_cooldown: Duration,
}

impl MessageQueue {
    pub fn new(pool: PgPool, lease_duration: Duration, auth_error_cooldown: Duration) -> Self {
        Self {
            repository: models::MessageRepository::new(pool),
            lease_duration,
            auth_error_cooldown,
        }
    }

    pub async fn enqueue(&self, message: &NewMessage) -> Result<Message, models::Error> {
        self.repository.enqueue(message).await
    }

    pub async fn dequeue(&self, batch_size: i64) -> Result<Vec<Message>, models::Error> {
        self.repository
            .dequeue(batch_size, self.lease_duration, self.auth_error_cooldown)
            .await
    }

    pub async fn update_status(
        &self,
        id: MessageId,
        status: MessageStatus,
        error: Option<&str>,
        recipient_status: &HashMap<String, RecipientStatus>,
    ) -> Result<(), models::Error> {
        self.repository
            .update_status(id, status, error, recipient_status)
            .await
    }

    /// Re-queues a message the rate limiter denied, without counting it as
    /// a retry (§4.C, §7 RATE_LIMITED).
    pub async fn defer_for_rate_limit(&self, id: MessageId) -> Result<(), models::Error> {
        self.repository.defer_for_rate_limit(id).await
    }

    pub async fn count_sent_today(
        &self,
        workspace_id: &WorkspaceId,
        sender: Option<&str>,
    ) -> Result<i64, models::Error> {
        self.repository.count_sent_today(workspace_id, sender).await
    }

    pub async fn distinct_senders_sent_today(&self, workspace_id: &WorkspaceId) -> Result<Vec<String>, models::Error> {
        self.repository.distinct_senders_sent_today(workspace_id).await
    }

    pub async fn find_by_id(&self, id: MessageId) -> Result<Message, models::Error> {
        self.repository.find_by_id(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_cooldown_durations_are_positive() {
        let lease_duration = Duration::minutes(5);
        let auth_error_cooldown = Duration::hours(1);
        assert!(lease_duration.num_seconds() > 0);
        assert!(auth_error_cooldown.num_seconds() > 0);
    }
}
