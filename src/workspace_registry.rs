use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::models::{Workspace, WorkspaceId};

#[derive(Debug, Error)]
pub enum WorkspaceRegistryError {
    #[error("failed to read workspace registry file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse workspace registry JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("domain {domain} is claimed by both workspace {first} and workspace {second}")]
    DuplicateDomain {
        domain: String,
        first: WorkspaceId,
        second: WorkspaceId,
    },
}

/// The set of configured workspaces, loaded once at startup (§4.D). Domain
/// lookup is case-insensitive and built eagerly so routing never re-scans
/// the full workspace list per message.
#[derive(Debug, Clone)]
pub struct WorkspaceRegistry {
    workspaces: HashMap<WorkspaceId, Workspace>,
    by_domain: HashMap<String, WorkspaceId>,
}

impl WorkspaceRegistry {
    pub fn from_workspaces(workspaces: Vec<Workspace>) -> Self {
        let mut by_domain = HashMap::new();
        let mut by_id = HashMap::new();

        for workspace in workspaces {
            for domain in &workspace.domains {
                by_domain.insert(domain.to_ascii_lowercase(), workspace.id.clone());
            }
            by_id.insert(workspace.id.clone(), workspace);
        }

        Self {
            workspaces: by_id,
            by_domain,
        }
    }

    /// Enforces domain uniqueness up front (§4.D invariant): two workspaces
    /// can never silently share a sending domain.
    pub fn load(workspaces: Vec<Workspace>) -> Result<Self, WorkspaceRegistryError> {
        let mut by_domain: HashMap<String, WorkspaceId> = HashMap::new();
        for workspace in &workspaces {
            for domain in &workspace.domains {
                let key = domain.to_ascii_lowercase();
                if let Some(existing) = by_domain.get(&key) {
                    if existing != &workspace.id {
                        return Err(WorkspaceRegistryError::DuplicateDomain {
                            domain: key,
                            first: existing.clone(),
                            second: workspace.id.clone(),
                        });
                    }
                }
                by_domain.insert(key, workspace.id.clone());
            }
        }

        Ok(Self::from_workspaces(workspaces))
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, WorkspaceRegistryError> {
        let path_ref = path.as_ref();
        let contents = std::fs::read_to_string(path_ref).map_err(|source| WorkspaceRegistryError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        let workspaces: Vec<Workspace> = serde_json::from_str(&contents)?;
        Self::load(workspaces)
    }

    pub fn load_from_json(contents: &str) -> Result<Self, WorkspaceRegistryError> {
        let workspaces: Vec<Workspace> = serde_json::from_str(contents)?;
        Self::load(workspaces)
    }

    pub fn get_workspace(&self, id: &WorkspaceId) -> Option<&Workspace> {
        self.workspaces.get(id)
    }

    pub fn get_by_domain(&self, domain: &str) -> Option<&Workspace> {
        let id = self.by_domain.get(&domain.to_ascii_lowercase())?;
        self.workspaces.get(id)
    }

    /// Resolves a workspace from a full sender address (`user@domain`).
    pub fn get_for_sender(&self, sender: &str) -> Option<&Workspace> {
        let domain = sender.rsplit('@').next()?;
        self.get_by_domain(domain)
    }

    pub fn all_workspaces(&self) -> impl Iterator<Item = &Workspace> {
        self.workspaces.values()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::models::RateLimits;

    fn workspace(id: &str, domains: &[&str]) -> Workspace {
        Workspace {
            id: WorkspaceId::from(id),
            display_name: id.to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect::<HashSet<_>>(),
            rate_limits: RateLimits::default(),
            gmail: None,
            mailgun: None,
            mandrill: None,
            provider_preference: None,
        }
    }

    #[test]
    fn domain_lookup_is_case_insensitive() {
        let registry = WorkspaceRegistry::from_workspaces(vec![workspace("acme", &["Example.com"])]);
        assert!(registry.get_by_domain("EXAMPLE.COM").is_some());
        assert!(registry.get_by_domain("example.com").is_some());
    }

    #[test]
    fn duplicate_domain_across_workspaces_is_rejected() {
        let workspaces = vec![
            workspace("acme", &["shared.example.com"]),
            workspace("globex", &["shared.example.com"]),
        ];
        let result = WorkspaceRegistry::load(workspaces);
        assert!(matches!(result, Err(WorkspaceRegistryError::DuplicateDomain { .. })));
    }

    #[test]
    fn get_for_sender_extracts_domain() {
        let registry = WorkspaceRegistry::from_workspaces(vec![workspace("acme", &["acme.example.com"])]);
        let workspace = registry.get_for_sender("billing@acme.example.com").unwrap();
        assert_eq!(workspace.id, WorkspaceId::from("acme"));
    }
}
