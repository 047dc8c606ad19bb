use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod config;
pub mod ingest;
pub mod models;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod rate_limiter;
pub mod router;
pub mod transform;
pub mod webhook;
pub mod workspace_registry;

pub use config::Config;
pub use ingest::{IngestError, IngestShim};
pub use processor::{Processor, ProcessorConfig};
pub use provider::{Provider, ProviderError};
pub use queue::MessageQueue;
pub use rate_limiter::RateLimiter;
pub use router::Router;
pub use webhook::{WebhookConfig, WebhookNotifier};
pub use workspace_registry::WorkspaceRegistry;

use models::{ProviderKind, Workspace, WorkspaceId};

/// Mirrors the teacher's own `Environment`, used only to decide log format —
/// this crate has no staging-specific behavior of its own.
#[derive(Debug, Default, Clone, Copy)]
pub enum Environment {
    Staging,
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn from_env() -> Self {
        match env::var("ENVIRONMENT").as_deref() {
            Ok("production") => Environment::Production,
            Ok("staging") => Environment::Staging,
            _ => {
                warn!("did not find ENVIRONMENT env var, defaulting to development");
                Environment::Development
            }
        }
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Picks one configured domain from a workspace to hand to provider
/// constructors that need a single sending domain (Mailgun). `domains` is a
/// `HashSet`, so this sorts first for a deterministic choice across restarts.
fn primary_domain(workspace: &Workspace) -> anyhow::Result<String> {
    workspace
        .domains
        .iter()
        .min()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("workspace {} has no configured domains", workspace.id.as_str()))
}

/// Builds one `Arc<dyn Provider>` per enabled provider block across every
/// workspace in the registry, loading Gmail service-account credentials via
/// [`config::load_gmail_credentials`] along the way. This is the wiring step
/// the teacher's `run_mta`/`run_api_server` does inline in `main`; here it is
/// pulled out since three binaries all need it (§4.D, §4.E).
pub fn build_providers(
    registry: &WorkspaceRegistry,
) -> anyhow::Result<HashMap<WorkspaceId, HashMap<ProviderKind, Arc<dyn Provider + Send + Sync>>>> {
    let mut providers = HashMap::new();

    for workspace in registry.all_workspaces() {
        let mut by_kind: HashMap<ProviderKind, Arc<dyn Provider + Send + Sync>> = HashMap::new();

        if let Some(gmail_config) = &workspace.gmail {
            if gmail_config.enabled {
                let credentials = config::load_gmail_credentials(&gmail_config.credentials_locator)?;
                let provider = provider::GmailProvider::new(workspace, credentials)?;
                by_kind.insert(ProviderKind::Gmail, Arc::new(provider));
            }
        }

        if let Some(mailgun_config) = &workspace.mailgun {
            if mailgun_config.enabled {
                let domain = primary_domain(workspace)?;
                let provider = provider::MailgunProvider::new(workspace, mailgun_config.api_key.clone(), domain)?;
                by_kind.insert(ProviderKind::Mailgun, Arc::new(provider));
            }
        }

        if let Some(mandrill_config) = &workspace.mandrill {
            if mandrill_config.enabled {
                let provider = provider::MandrillProvider::new(workspace, mandrill_config.api_key.clone())?;
                by_kind.insert(ProviderKind::Mandrill, Arc::new(provider));
            }
        }

        if by_kind.is_empty() {
            warn!(workspace = %workspace.id, "workspace has no enabled providers");
        }

        providers.insert(workspace.id.clone(), by_kind);
    }

    Ok(providers)
}

/// Assembles every collaborator a running processor needs from a loaded
/// registry and database pool, and spawns it. Returns the join handle so
/// callers (the three `bin/`s) can race it against the shutdown signal the
/// way the teacher's `Handler::spawn` is raced in `main`.
pub async fn run_processor(
    pool: PgPool,
    registry: Arc<WorkspaceRegistry>,
    config: &Config,
    shutdown: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let providers = build_providers(&registry)?;
    let router = Router::new(registry.clone(), providers);

    let queue = MessageQueue::new(pool.clone(), config.lease_duration, config.auth_error_cooldown);

    let rate_limiter = RateLimiter::new(registry.clone());
    rate_limiter.initialize_from_queue(&queue).await?;

    let webhook = WebhookNotifier::new(
        pool.clone(),
        WebhookConfig {
            url: config.webhook_url.clone(),
            signing_key: config.webhook_signing_key.clone(),
            max_retries: config.webhook_max_retries,
        },
    );

    let processor = Arc::new(Processor::new(
        queue,
        rate_limiter,
        router,
        registry,
        webhook,
        Arc::new(processor::NoopRecipientTracker),
        Arc::new(transform::NoopTrendingVariableSource),
        Arc::new(transform::NoopLlmPersonalizer),
        ProcessorConfig {
            batch_size: config.batch_size,
            process_interval: config.process_interval,
            max_retries: config.max_retries,
            enable_variable_replacement: config.enable_variable_replacement,
            enable_personalization: config.enable_personalization,
        },
    ));

    info!("processor starting");
    Ok(processor.spawn(shutdown))
}

/// Spawns the periodic webhook-retry loop (SPEC_FULL.md §4.L persistence
/// addition), the same ticker-plus-cancellation shape as the teacher's
/// `periodic.rs` maintenance loop.
pub fn run_webhook_retry_loop(
    pool: PgPool,
    config: &Config,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let webhook = WebhookNotifier::new(
        pool,
        WebhookConfig {
            url: config.webhook_url.clone(),
            signing_key: config.webhook_signing_key.clone(),
            max_retries: config.webhook_max_retries,
        },
    );
    let interval_duration = config.webhook_retry_interval;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval_duration);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(error) = webhook.retry_pending(100).await {
                        warn!("webhook retry pass failed: {error}");
                    }
                }
            }
        }
    })
}
