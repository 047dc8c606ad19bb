use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{Message, ProviderKind, WorkspaceId};
use crate::provider::Provider;
use crate::workspace_registry::WorkspaceRegistry;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no workspace is registered for domain {0}")]
    UnknownDomain(String),
    #[error("message has no sender domain")]
    MissingSenderDomain,
    #[error("workspace {0} has no enabled providers")]
    NoProvidersConfigured(WorkspaceId),
}

/// Resolves a message to a workspace and picks the provider that should
/// attempt delivery, preferring the workspace's configured order and
/// skipping providers the health checker has marked unhealthy — falling
/// back to the most-preferred provider anyway if all are unhealthy, since
/// refusing to even try is worse than a likely-failing attempt (§4.I).
pub struct Router {
    registry: Arc<WorkspaceRegistry>,
    providers: HashMap<WorkspaceId, HashMap<ProviderKind, Arc<dyn Provider + Send + Sync>>>,
}

impl Router {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        providers: HashMap<WorkspaceId, HashMap<ProviderKind, Arc<dyn Provider + Send + Sync>>>,
    ) -> Self {
        Self { registry, providers }
    }

    /// Assigns `message.workspace_id` from the sender's domain if it is not
    /// already set, without ever overwriting an existing assignment.
    pub fn assign_workspace(&self, message: &mut Message) -> Result<(), RoutingError> {
        if message.workspace_id.is_some() {
            return Ok(());
        }

        let domain = message.sender_domain().ok_or(RoutingError::MissingSenderDomain)?;
        let workspace = self
            .registry
            .get_by_domain(domain)
            .ok_or_else(|| RoutingError::UnknownDomain(domain.to_string()))?;

        message.workspace_id = Some(workspace.id.clone());
        Ok(())
    }

    pub async fn select_provider(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Arc<dyn Provider + Send + Sync>, RoutingError> {
        let workspace = self
            .registry
            .get_workspace(workspace_id)
            .ok_or_else(|| RoutingError::NoProvidersConfigured(workspace_id.clone()))?;

        let available = self
            .providers
            .get(workspace_id)
            .ok_or_else(|| RoutingError::NoProvidersConfigured(workspace_id.clone()))?;

        let preference = workspace.preference_order();

        for kind in &preference {
            if let Some(provider) = available.get(kind) {
                if provider.is_healthy().await {
                    debug!(%workspace_id, provider = kind.as_str(), "selected healthy provider");
                    return Ok(provider.clone());
                }
            }
        }

        let fallback_kind = preference
            .iter()
            .find(|kind| available.contains_key(*kind))
            .ok_or_else(|| RoutingError::NoProvidersConfigured(workspace_id.clone()))?;
        let fallback = available
            .get(fallback_kind)
            .ok_or_else(|| RoutingError::NoProvidersConfigured(workspace_id.clone()))?;

        warn!(
            %workspace_id,
            provider = fallback_kind.as_str(),
            "all preferred providers unhealthy, falling back to most-preferred anyway"
        );
        Ok(fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;

    use super::*;
    use crate::models::{ProviderId, RateLimits, Workspace};
    use crate::provider::{ProviderError, ProviderInfo};

    struct FakeProvider {
        kind: ProviderKind,
        id: ProviderId,
        healthy: bool,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn send_message(&self, _message: &mut Message) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn health_check(&self) -> bool {
            self.healthy
        }

        async fn is_healthy(&self) -> bool {
            self.healthy
        }

        async fn last_error(&self) -> Option<String> {
            None
        }

        fn can_send_from_domain(&self, _domain: &str) -> bool {
            true
        }

        fn supported_domains(&self) -> &[String] {
            &[]
        }

        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn id(&self) -> &ProviderId {
            &self.id
        }

        async fn info(&self) -> ProviderInfo {
            unimplemented!("not exercised by these tests")
        }
    }

    fn workspace(id: &str) -> Workspace {
        Workspace {
            id: WorkspaceId::from(id),
            display_name: id.to_string(),
            domains: HashSet::from([format!("{id}.example.com")]),
            rate_limits: RateLimits::default(),
            gmail: None,
            mailgun: None,
            mandrill: None,
            provider_preference: None,
        }
    }

    /// Gmail is preferred by default but this workspace never configured it;
    /// `select_provider` must fall back to the provider that actually exists
    /// (Mailgun) instead of erroring just because the *global* first
    /// preference has no registered provider (§4.I "never return nil while
    /// any non-nil provider exists").
    #[tokio::test]
    async fn falls_back_to_the_preferred_available_provider_when_all_are_unhealthy() {
        let workspace_id = WorkspaceId::from("acme");
        let registry = Arc::new(WorkspaceRegistry::from_workspaces(vec![workspace("acme")]));

        let mailgun: Arc<dyn Provider + Send + Sync> = Arc::new(FakeProvider {
            kind: ProviderKind::Mailgun,
            id: ProviderId::new(ProviderKind::Mailgun, &workspace_id),
            healthy: false,
        });
        let mut by_kind = HashMap::new();
        by_kind.insert(ProviderKind::Mailgun, mailgun);
        let mut providers = HashMap::new();
        providers.insert(workspace_id.clone(), by_kind);

        let router = Router::new(registry, providers);
        let selected = router.select_provider(&workspace_id).await.unwrap();
        assert_eq!(selected.kind(), ProviderKind::Mailgun);
    }
}
