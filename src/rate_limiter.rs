use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::WorkspaceId;
use crate::queue::MessageQueue;
use crate::workspace_registry::WorkspaceRegistry;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("workspace {0} has reached its daily send limit")]
    WorkspaceLimitExceeded(WorkspaceId),
    #[error("sender {sender} in workspace {workspace} has reached its daily send limit")]
    SenderLimitExceeded { workspace: WorkspaceId, sender: String },
    #[error("workspace {0} is not registered")]
    UnknownWorkspace(WorkspaceId),
    #[error(transparent)]
    Queue(#[from] crate::models::Error),
}

#[derive(Debug, Clone, Default)]
struct WorkspaceCounters {
    day: Option<NaiveDate>,
    workspace_sent: u32,
    sender_sent: HashMap<String, u32>,
}

impl WorkspaceCounters {
    fn roll_over_if_needed(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.workspace_sent = 0;
            self.sender_sent.clear();
        }
    }
}

/// In-memory, lazily UTC-day-rolling counters guarding per-workspace and
/// per-sender daily send quotas (§4.C). Backed by a single mutex rather than
/// per-workspace locks: contention is bounded by the number of concurrent
/// processor workers, which is small by design (§5 concurrency model).
#[derive(Debug, Clone)]
pub struct RateLimiter {
    registry: Arc<WorkspaceRegistry>,
    counters: Arc<Mutex<HashMap<WorkspaceId, WorkspaceCounters>>>,
}

impl RateLimiter {
    pub fn new(registry: Arc<WorkspaceRegistry>) -> Self {
        Self {
            registry,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Seeds today's counters from already-sent messages so a freshly
    /// started processor doesn't grant a fresh quota on top of sends a
    /// prior instance already made today (§4.C "warm start").
    pub async fn initialize_from_queue(&self, queue: &MessageQueue) -> Result<(), RateLimitError> {
        let today = Utc::now().date_naive();
        let mut counters = self.counters.lock().await;

        for workspace in self.registry.all_workspaces() {
            let workspace_sent = queue.count_sent_today(&workspace.id, None).await? as u32;
            let mut entry = WorkspaceCounters {
                day: Some(today),
                workspace_sent,
                sender_sent: HashMap::new(),
            };

            // Every sender with at least one SENT row today, not just senders
            // with a configured custom limit — otherwise a sender on the
            // workspace's plain per_user_daily default would have its quota
            // silently reset by a restart (§4.C "warm start", §8 invariant).
            for sender in queue.distinct_senders_sent_today(&workspace.id).await? {
                let sent = queue.count_sent_today(&workspace.id, Some(&sender)).await? as u32;
                entry.sender_sent.insert(sender, sent);
            }

            counters.insert(workspace.id.clone(), entry);
        }

        Ok(())
    }

    /// Returns `Ok(())` if `sender` in `workspace_id` may send one more
    /// message today, otherwise the specific limit that would be exceeded.
    /// Does not record the send — callers call [`Self::record_send`] only
    /// after a provider attempt actually succeeds.
    pub async fn allow(&self, workspace_id: &WorkspaceId, sender: &str) -> Result<(), RateLimitError> {
        let workspace = self
            .registry
            .get_workspace(workspace_id)
            .ok_or_else(|| RateLimitError::UnknownWorkspace(workspace_id.clone()))?;

        let today = Utc::now().date_naive();
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(workspace_id.clone()).or_default();
        entry.roll_over_if_needed(today);

        if entry.workspace_sent >= workspace.rate_limits.workspace_daily {
            return Err(RateLimitError::WorkspaceLimitExceeded(workspace_id.clone()));
        }

        let sender_limit = workspace.effective_user_daily_limit(sender);
        let sender_sent = entry.sender_sent.get(sender).copied().unwrap_or(0);
        if sender_sent >= sender_limit {
            return Err(RateLimitError::SenderLimitExceeded {
                workspace: workspace_id.clone(),
                sender: sender.to_string(),
            });
        }

        Ok(())
    }

    pub async fn record_send(&self, workspace_id: &WorkspaceId, sender: &str) {
        let today = Utc::now().date_naive();
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(workspace_id.clone()).or_default();
        entry.roll_over_if_needed(today);
        entry.workspace_sent += 1;
        *entry.sender_sent.entry(sender.to_string()).or_insert(0) += 1;
    }

    pub async fn status(&self, workspace_id: &WorkspaceId) -> Option<(u32, u32)> {
        let workspace = self.registry.get_workspace(workspace_id)?;
        let today = Utc::now().date_naive();
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(workspace_id.clone()).or_default();
        entry.roll_over_if_needed(today);
        Some((entry.workspace_sent, workspace.rate_limits.workspace_daily))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::models::{RateLimits, Workspace};

    fn workspace(id: &str, workspace_daily: u32, per_user_daily: u32) -> Workspace {
        Workspace {
            id: WorkspaceId::from(id),
            display_name: id.to_string(),
            domains: HashSet::from([format!("{id}.example.com")]),
            rate_limits: RateLimits {
                workspace_daily,
                per_user_daily,
                custom_user_limits: HashMap::new(),
            },
            gmail: None,
            mailgun: None,
            mandrill: None,
            provider_preference: None,
        }
    }

    #[tokio::test]
    async fn blocks_exactly_at_the_limit() {
        let registry = Arc::new(WorkspaceRegistry::from_workspaces(vec![workspace("acme", 2, 2)]));
        let limiter = RateLimiter::new(registry);
        let workspace_id = WorkspaceId::from("acme");

        limiter.allow(&workspace_id, "a@acme.example.com").await.unwrap();
        limiter.record_send(&workspace_id, "a@acme.example.com").await;
        limiter.allow(&workspace_id, "a@acme.example.com").await.unwrap();
        limiter.record_send(&workspace_id, "a@acme.example.com").await;

        let result = limiter.allow(&workspace_id, "a@acme.example.com").await;
        assert!(matches!(result, Err(RateLimitError::SenderLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn zero_limit_blocks_all_sends() {
        let registry = Arc::new(WorkspaceRegistry::from_workspaces(vec![workspace("acme", 0, 0)]));
        let limiter = RateLimiter::new(registry);
        let workspace_id = WorkspaceId::from("acme");

        let result = limiter.allow(&workspace_id, "a@acme.example.com").await;
        assert!(matches!(result, Err(RateLimitError::WorkspaceLimitExceeded(_))));
    }
}
