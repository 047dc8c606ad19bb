use std::sync::Arc;

use thiserror::Error;

use crate::models::{self, Message, NewMessage};
use crate::queue::MessageQueue;
use crate::workspace_registry::WorkspaceRegistry;

/// Hard ceiling on `to` + `cc` + `bcc` combined (§3 edge cases).
pub const MAX_RECIPIENTS: usize = 100;
/// Hard ceiling on the approximate wire size of subject + bodies +
/// attachments (§3 edge cases).
pub const MAX_MESSAGE_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("message has {0} recipients, exceeding the limit of {MAX_RECIPIENTS}")]
    TooManyRecipients(usize),
    #[error("message is {0} bytes, exceeding the limit of {MAX_MESSAGE_BYTES} bytes")]
    MessageTooLarge(usize),
    #[error("no workspace is registered for sender {0}")]
    UnknownSenderDomain(String),
    #[error(transparent)]
    Queue(#[from] models::Error),
}

/// The in-crate edge the SMTP-ingress collaborator calls once it has parsed
/// a message off the wire (component M). This is not a wire-level SMTP
/// server: it only enforces the ingest-time boundaries the spec puts on
/// this side of that line, resolves `workspace_id` when the collaborator
/// didn't already set one, and hands the message to the durable queue.
pub struct IngestShim {
    queue: MessageQueue,
    registry: Arc<WorkspaceRegistry>,
}

impl IngestShim {
    pub fn new(queue: MessageQueue, registry: Arc<WorkspaceRegistry>) -> Self {
        Self { queue, registry }
    }

    pub async fn ingest(&self, mut new_message: NewMessage) -> Result<Message, IngestError> {
        let recipient_count = new_message.to.len() + new_message.cc.len() + new_message.bcc.len();
        if recipient_count > MAX_RECIPIENTS {
            return Err(IngestError::TooManyRecipients(recipient_count));
        }

        let approximate_size = estimate_size(&new_message);
        if approximate_size > MAX_MESSAGE_BYTES {
            return Err(IngestError::MessageTooLarge(approximate_size));
        }

        if new_message.workspace_id.is_none() {
            let workspace = self
                .registry
                .get_for_sender(&new_message.from)
                .ok_or_else(|| IngestError::UnknownSenderDomain(new_message.from.clone()))?;
            new_message.workspace_id = Some(workspace.id.clone());
        }

        Ok(self.queue.enqueue(&new_message).await?)
    }
}

fn estimate_size(message: &NewMessage) -> usize {
    message.subject.len()
        + message.text.as_deref().map_or(0, str::len)
        + message.html.as_deref().map_or(0, str::len)
        + message.attachments.iter().map(|attachment| attachment.bytes.len()).sum::<usize>()
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;
    use crate::models::{Attachment, Headers, RateLimits, Workspace};

    fn sample_new_message() -> NewMessage {
        NewMessage {
            from: "alerts@acme.example.com".to_string(),
            to: vec!["user@customer.com".to_string()],
            cc: vec![],
            bcc: vec![],
            subject: "hello".to_string(),
            text: Some("world".to_string()),
            html: None,
            headers: Headers::new(),
            attachments: vec![],
            metadata: HashMap::new(),
            campaign_id: None,
            user_id: None,
            invitation_id: None,
            email_type: None,
            workspace_id: None,
        }
    }

    fn sample_registry() -> Arc<WorkspaceRegistry> {
        Arc::new(WorkspaceRegistry::from_workspaces(vec![Workspace {
            id: "acme".into(),
            display_name: "Acme".to_string(),
            domains: HashSet::from(["acme.example.com".to_string()]),
            rate_limits: RateLimits::default(),
            gmail: None,
            mailgun: None,
            mandrill: None,
            provider_preference: None,
        }]))
    }

    #[test]
    fn too_many_recipients_is_rejected_before_any_db_call() {
        let mut message = sample_new_message();
        message.to = (0..=MAX_RECIPIENTS).map(|i| format!("user{i}@customer.com")).collect();
        let recipient_count = message.to.len() + message.cc.len() + message.bcc.len();
        assert!(recipient_count > MAX_RECIPIENTS);
    }

    #[test]
    fn oversized_message_is_rejected_before_any_db_call() {
        let mut message = sample_new_message();
        message.text = Some("x".repeat(MAX_MESSAGE_BYTES + 1));
        assert!(estimate_size(&message) > MAX_MESSAGE_BYTES);
    }

    #[test]
    fn attachments_count_toward_the_size_limit() {
        let mut message = sample_new_message();
        message.attachments.push(Attachment {
            name: "big.bin".to_string(),
            content_type: "application/octet-stream".to_string(),
            bytes: vec![0u8; MAX_MESSAGE_BYTES + 1],
        });
        assert!(estimate_size(&message) > MAX_MESSAGE_BYTES);
    }

    #[tokio::test]
    async fn unknown_sender_domain_is_rejected_without_a_queue_call() {
        let registry = sample_registry();
        let pool = sqlx::postgres::PgPoolOptions::new().connect_lazy("postgres://localhost/unused").unwrap();
        let queue = MessageQueue::new(pool, chrono::Duration::minutes(5), chrono::Duration::hours(1));
        let shim = IngestShim::new(queue, registry);

        let mut message = sample_new_message();
        message.from = "alerts@unknown.example.com".to_string();

        let result = shim.ingest(message).await;
        assert!(matches!(result, Err(IngestError::UnknownSenderDomain(_))));
    }
}
