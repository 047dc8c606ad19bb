use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Primary key of a [`super::Message`] row.
#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of a [`super::Workspace`] as it appears in the workspace-registry JSON.
#[derive(
    Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkspaceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// `"<kind>-<workspace_id>"`, the identity of one enabled provider block.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(kind: super::ProviderKind, workspace_id: &WorkspaceId) -> Self {
        Self(format!("{}-{}", kind.as_str(), workspace_id.as_str()))
    }
}
