use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::{self, HeaderRewriteRule, Message, MessageStatus, ProviderKind, RecipientStatus};
use crate::provider::{Provider, ProviderError};
use crate::queue::MessageQueue;
use crate::rate_limiter::RateLimiter;
use crate::router::Router;
use crate::transform::{self, LlmPersonalizer, TrendingVariableSource};
use crate::webhook::WebhookNotifier;
use crate::workspace_registry::WorkspaceRegistry;

/// Fire-and-forget recipient tracking (§4.K step 1): errors are logged, not
/// fatal, matching the teacher's pattern of side-channel bookkeeping that
/// must never hold up the send path.
#[async_trait]
pub trait RecipientTracker: Send + Sync {
    async fn track(&self, message: &Message) -> Result<(), String>;
}

pub struct NoopRecipientTracker;

#[async_trait]
impl RecipientTracker for NoopRecipientTracker {
    async fn track(&self, _message: &Message) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub batch_size: i64,
    pub process_interval: StdDuration,
    pub max_retries: i32,
    pub enable_variable_replacement: bool,
    pub enable_personalization: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            process_interval: StdDuration::from_secs(5),
            max_retries: 5,
            enable_variable_replacement: true,
            enable_personalization: false,
        }
    }
}

/// Ties the queue, rate limiter, router, provider abstraction, and webhook
/// notifier together into the one dequeue→settle pipeline the whole system
/// exists to run (§4.K). A ticker loop with a try-lock batch guard ensures
/// overlapping ticks coalesce into at most one in-flight batch, the same
/// shape as the teacher's `Handler::spawn`/`periodically::run_periodically`
/// select-loop-with-cancellation.
pub struct Processor {
    queue: MessageQueue,
    rate_limiter: RateLimiter,
    router: Router,
    registry: Arc<WorkspaceRegistry>,
    webhook: WebhookNotifier,
    recipient_tracker: Arc<dyn RecipientTracker + Send + Sync>,
    trending: Arc<dyn TrendingVariableSource + Send + Sync>,
    personalizer: Arc<dyn LlmPersonalizer + Send + Sync>,
    config: ProcessorConfig,
    batch_guard: Mutex<()>,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: MessageQueue,
        rate_limiter: RateLimiter,
        router: Router,
        registry: Arc<WorkspaceRegistry>,
        webhook: WebhookNotifier,
        recipient_tracker: Arc<dyn RecipientTracker + Send + Sync>,
        trending: Arc<dyn TrendingVariableSource + Send + Sync>,
        personalizer: Arc<dyn LlmPersonalizer + Send + Sync>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            queue,
            rate_limiter,
            router,
            registry,
            webhook,
            recipient_tracker,
            trending,
            personalizer,
            config,
            batch_guard: Mutex::new(()),
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.process_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("processor shutting down, letting in-flight batch settle");
                        return;
                    }
                    _ = interval.tick() => {
                        match self.batch_guard.try_lock() {
                            Ok(_guard) => {
                                if let Err(error) = self.process_batch().await {
                                    error!("batch processing failed: {error}");
                                }
                            }
                            Err(_) => {
                                debug!("previous batch still in flight, skipping this tick");
                            }
                        }
                    }
                }
            }
        })
    }

    pub async fn process_batch(&self) -> Result<(), models::Error> {
        let messages = self.queue.dequeue(self.config.batch_size).await?;
        if messages.is_empty() {
            return Ok(());
        }

        debug!(count = messages.len(), "dequeued batch");
        for message in messages {
            self.process_one(message).await;
        }

        Ok(())
    }

    async fn process_one(&self, mut message: Message) {
        if let Err(error) = self.recipient_tracker.track(&message).await {
            warn!(message_id = %message.id, "recipient tracking failed (non-fatal): {error}");
        }

        if let Err(error) = self.router.assign_workspace(&mut message) {
            warn!(message_id = %message.id, "routing failed: {error}");
            self.fail_unroutable(&mut message, &error.to_string()).await;
            return;
        }
        let workspace_id = message.workspace_id.clone().expect("assigned above");

        if let Err(error) = self.rate_limiter.allow(&workspace_id, &message.from).await {
            debug!(message_id = %message.id, "rate limited: {error}");
            if let Err(db_error) = self.queue.defer_for_rate_limit(message.id).await {
                error!(message_id = %message.id, "failed to defer rate-limited message: {db_error}");
            }
            self.emit_to_all_recipients(&message, models::WebhookEventKind::Deferral, &error.to_string())
                .await;
            return;
        }

        let Some(workspace) = self.registry.get_workspace(&workspace_id) else {
            self.fail_unroutable(&mut message, "workspace disappeared after assignment").await;
            return;
        };
        let header_rules = header_rewrite_rules_for(workspace, primary_enabled_kind(workspace));

        let transform_result = transform::run_full_transform_chain(
            &mut message,
            header_rules,
            self.trending.as_ref(),
            self.personalizer.as_ref(),
            self.config.enable_variable_replacement,
            self.config.enable_personalization,
        )
        .await;

        if let Err(error) = transform_result {
            warn!(message_id = %message.id, "transform chain failed: {error}");
            self.fail_message(&mut message, &error.to_string(), RecipientStatus::Failed).await;
            self.emit_to_all_recipients(&message, models::WebhookEventKind::Reject, &error.to_string())
                .await;
            return;
        }

        let provider = match self.router.select_provider(&workspace_id).await {
            Ok(provider) => provider,
            Err(error) => {
                warn!(message_id = %message.id, "no provider available: {error}");
                self.fail_unroutable(&mut message, &error.to_string()).await;
                return;
            }
        };

        match provider.send_message(&mut message).await {
            Ok(()) => {
                self.settle_success(&mut message, &workspace_id).await;
            }
            Err(ProviderError::Transient(reason)) => {
                self.settle_transient(&mut message, &reason).await;
            }
            Err(ProviderError::Authentication(reason)) => {
                self.settle_auth_error(&mut message, &reason).await;
            }
            Err(ProviderError::Permanent(reason)) => {
                self.settle_permanent(&mut message, &reason).await;
            }
            Err(ProviderError::InvalidRecipient { reason, .. }) => {
                self.settle_permanent(&mut message, &reason).await;
            }
        }
    }

    async fn settle_success(&self, message: &mut Message, workspace_id: &models::WorkspaceId) {
        set_all_recipients(message, RecipientStatus::Sent);
        if let Err(error) = self
            .queue
            .update_status(message.id, MessageStatus::Sent, None, &message.recipient_status)
            .await
        {
            error!(message_id = %message.id, "failed to record sent status: {error}");
        }
        self.rate_limiter.record_send(workspace_id, &message.from).await;
        self.emit_to_all_recipients(message, models::WebhookEventKind::Send, "").await;
    }

    async fn settle_transient(&self, message: &mut Message, reason: &str) {
        if message.retry_count < self.config.max_retries {
            if let Err(error) = self
                .queue
                .update_status(message.id, MessageStatus::Queued, Some(reason), &message.recipient_status)
                .await
            {
                error!(message_id = %message.id, "failed to re-queue after transient error: {error}");
            }
            self.emit_to_all_recipients(message, models::WebhookEventKind::Deferral, reason).await;
        } else {
            self.fail_message(message, reason, RecipientStatus::Failed).await;
            self.emit_to_all_recipients(message, models::WebhookEventKind::Reject, reason).await;
        }
    }

    async fn settle_auth_error(&self, message: &mut Message, reason: &str) {
        set_all_recipients(message, RecipientStatus::Deferred);
        if let Err(error) = self
            .queue
            .update_status(message.id, MessageStatus::AuthError, Some(reason), &message.recipient_status)
            .await
        {
            error!(message_id = %message.id, "failed to record auth-error status: {error}");
        }
        self.emit_to_all_recipients(message, models::WebhookEventKind::Deferral, reason).await;
    }

    async fn settle_permanent(&self, message: &mut Message, reason: &str) {
        let bounced = looks_like_bounce(reason);
        self.fail_message(message, reason, if bounced { RecipientStatus::Bounced } else { RecipientStatus::Failed })
            .await;
        let kind = if bounced { models::WebhookEventKind::HardBounce } else { models::WebhookEventKind::Reject };
        self.emit_to_all_recipients(message, kind, reason).await;
    }

    async fn fail_unroutable(&self, message: &mut Message, reason: &str) {
        self.fail_message(message, reason, RecipientStatus::Failed).await;
        self.emit_to_all_recipients(message, models::WebhookEventKind::Reject, reason).await;
    }

    async fn fail_message(&self, message: &mut Message, reason: &str, recipient_status: RecipientStatus) {
        set_all_recipients(message, recipient_status);
        if let Err(error) = self
            .queue
            .update_status(message.id, MessageStatus::Failed, Some(reason), &message.recipient_status)
            .await
        {
            error!(message_id = %message.id, "failed to record failed status: {error}");
        }
    }

    async fn emit_to_all_recipients(&self, message: &Message, kind: models::WebhookEventKind, reason: &str) {
        if !self.webhooks_enabled_for(message) {
            return;
        }

        let details = serde_json::json!({ "reason": reason });
        for recipient in message.all_recipients() {
            self.webhook.emit(message, recipient, kind, details.clone()).await;
        }
    }

    /// Webhook emission is gated on the workspace's primary enabled
    /// provider's `enable_webhooks` flag (§4.L). A message with no resolved
    /// workspace/provider (e.g. an unroutable message) has nothing to gate
    /// against, so it fails open and still emits.
    fn webhooks_enabled_for(&self, message: &Message) -> bool {
        let Some(workspace_id) = &message.workspace_id else {
            return true;
        };
        let Some(workspace) = self.registry.get_workspace(workspace_id) else {
            return true;
        };
        webhooks_enabled(workspace, primary_enabled_kind(workspace))
    }
}

fn set_all_recipients(message: &mut Message, status: RecipientStatus) {
    let recipients: Vec<String> = message.all_recipients().map(str::to_string).collect();
    for recipient in recipients {
        message.recipient_status.insert(recipient, status);
    }
}

/// Classifies a provider's permanent-failure text as bounce-like, isolating
/// the substring triggers the spec's source system relies on behind one
/// function rather than scattering the match across call sites (§9 "Error
/// classification by string matching").
fn looks_like_bounce(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    ["bounce", "invalid", "not exist"].iter().any(|needle| lower.contains(needle))
}

/// The provider kind whose `header_rewrite` rules apply during the
/// pre-routing transform pass: the workspace's most-preferred enabled
/// provider. Actual delivery may still fall back to a different, healthy
/// provider at the routing step: header rewriting and provider selection
/// are resolved independently, as the source system leaves ambiguous
/// (§4.J note on provider-kind scoping).
fn primary_enabled_kind(workspace: &models::Workspace) -> Option<ProviderKind> {
    workspace.preference_order().into_iter().find(|kind| match kind {
        ProviderKind::Gmail => workspace.gmail.as_ref().is_some_and(|c| c.enabled),
        ProviderKind::Mailgun => workspace.mailgun.as_ref().is_some_and(|c| c.enabled),
        ProviderKind::Mandrill => workspace.mandrill.as_ref().is_some_and(|c| c.enabled),
    })
}

/// The `enable_webhooks` flag of the same provider block `primary_enabled_kind`
/// resolves, defaulting to enabled when no config block exists for it (§4.L).
fn webhooks_enabled(workspace: &models::Workspace, kind: Option<ProviderKind>) -> bool {
    match kind {
        Some(ProviderKind::Gmail) => workspace.gmail.as_ref().map(|c| c.enable_webhooks).unwrap_or(true),
        Some(ProviderKind::Mailgun) => workspace.mailgun.as_ref().map(|c| c.enable_webhooks).unwrap_or(true),
        Some(ProviderKind::Mandrill) => workspace.mandrill.as_ref().map(|c| c.enable_webhooks).unwrap_or(true),
        None => true,
    }
}

fn header_rewrite_rules_for(workspace: &models::Workspace, kind: Option<ProviderKind>) -> &[HeaderRewriteRule] {
    match kind {
        Some(ProviderKind::Gmail) => workspace.gmail.as_ref().map(|c| c.header_rewrite.as_slice()).unwrap_or(&[]),
        Some(ProviderKind::Mailgun) => workspace.mailgun.as_ref().map(|c| c.header_rewrite.as_slice()).unwrap_or(&[]),
        Some(ProviderKind::Mandrill) => workspace.mandrill.as_ref().map(|c| c.header_rewrite.as_slice()).unwrap_or(&[]),
        None => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounce_classifier_matches_spec_triggers_case_insensitively() {
        assert!(looks_like_bounce("Recipient address does not EXIST"));
        assert!(looks_like_bounce("hard bounce detected"));
        assert!(looks_like_bounce("Invalid mailbox"));
        assert!(!looks_like_bounce("insufficient storage, try later"));
    }
}
