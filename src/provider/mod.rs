mod gmail;
mod mailgun;
mod mandrill;

pub use gmail::{GmailProvider, ServiceAccountCredentials};
pub use mailgun::MailgunProvider;
pub use mandrill::MandrillProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{Message, ProviderId, ProviderKind};

/// Failure taxonomy a [`Provider`] maps its transport- and API-level errors
/// onto, so the processor can decide retry vs. terminal failure without
/// knowing which wire protocol produced the error (§4.E, §7).
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    /// Credentials are invalid or expired; message should move to AUTH_ERROR.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Transient failure (timeout, 5xx, rate limit from the provider itself);
    /// message should be retried.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Permanent failure unrelated to any one recipient; message should fail.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// A specific recipient address was rejected; other recipients may still
    /// succeed (§3 recipient_status).
    #[error("recipient {recipient} rejected: {reason}")]
    InvalidRecipient { recipient: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: ProviderId,
    pub kind: ProviderKind,
    pub supported_domains: Vec<String>,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

/// One outbound sending backend. Implementations hold their own HTTP client
/// and cached credentials; `Arc<dyn Provider + Send + Sync>` is how the
/// router and processor treat Gmail/Mailgun/Mandrill uniformly, the same
/// shape the teacher used for its Moneybird integration (§4.E).
#[async_trait]
pub trait Provider {
    /// `message` is `&mut` solely so a provider can annotate
    /// `message.metadata` on a fallback send (Gmail's `sender_substitution`,
    /// §4.F) — providers that never substitute the sender never write to it.
    async fn send_message(&self, message: &mut Message) -> Result<(), ProviderError>;

    /// Refreshes and returns the provider's health, used by the router to
    /// skip unhealthy providers (§4.I).
    async fn health_check(&self) -> bool;

    async fn is_healthy(&self) -> bool;

    async fn last_error(&self) -> Option<String>;

    fn can_send_from_domain(&self, domain: &str) -> bool;

    fn supported_domains(&self) -> &[String];

    fn kind(&self) -> ProviderKind;

    fn id(&self) -> &ProviderId;

    async fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id().clone(),
            kind: self.kind(),
            supported_domains: self.supported_domains().to_vec(),
            healthy: self.is_healthy().await,
            last_error: self.last_error().await,
            last_checked: Some(Utc::now()),
        }
    }
}

/// Shared health-state bookkeeping every provider embeds, so each
/// implementation only has to report outcomes rather than reimplement the
/// bookkeeping (analogous to the teacher's cached-session pattern).
#[derive(Debug, Default)]
pub(crate) struct HealthState {
    inner: RwLock<HealthInner>,
}

#[derive(Debug, Default, Clone)]
struct HealthInner {
    healthy: bool,
    last_error: Option<String>,
}

impl HealthState {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(HealthInner {
                healthy: true,
                last_error: None,
            }),
        }
    }

    pub(crate) async fn mark_healthy(&self) {
        let mut inner = self.inner.write().await;
        inner.healthy = true;
        inner.last_error = None;
    }

    pub(crate) async fn mark_unhealthy(&self, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.healthy = false;
        inner.last_error = Some(error.into());
    }

    pub(crate) async fn is_healthy(&self) -> bool {
        self.inner.read().await.healthy
    }

    pub(crate) async fn last_error(&self) -> Option<String> {
        self.inner.read().await.last_error.clone()
    }
}
