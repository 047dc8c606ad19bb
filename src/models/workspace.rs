use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::WorkspaceId;

/// `(header_name, new_value)` — empty `new_value` means "remove this header",
/// otherwise replace-or-add on a case-insensitive match (§4.J).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HeaderRewriteRule {
    pub header_name: String,
    #[serde(default)]
    pub new_value: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gmail,
    Mailgun,
    Mandrill,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Mailgun => "mailgun",
            ProviderKind::Mandrill => "mandrill",
        }
    }

    /// Default preference order when a workspace does not configure its own
    /// (SPEC_FULL.md §9 resolution of the "exact semantics of default
    /// preference" open question).
    pub const DEFAULT_PREFERENCE: [ProviderKind; 3] =
        [ProviderKind::Gmail, ProviderKind::Mailgun, ProviderKind::Mandrill];
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimits {
    pub workspace_daily: u32,
    pub per_user_daily: u32,
    pub custom_user_limits: HashMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GmailProviderConfig {
    pub enabled: bool,
    /// Locator for the service-account JSON (env var name or file path);
    /// loading it is an environment concern, not workspace-config surface.
    pub credentials_locator: String,
    pub default_sender: Option<String>,
    #[serde(default)]
    pub require_valid_sender: bool,
    #[serde(default)]
    pub header_rewrite: Vec<HeaderRewriteRule>,
    #[serde(default)]
    pub enable_webhooks: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MailgunTracking {
    pub opens: bool,
    pub clicks: bool,
    pub unsubscribe: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailgunProviderConfig {
    pub enabled: bool,
    pub api_key: String,
    #[serde(default = "default_mailgun_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub tracking: MailgunTracking,
    #[serde(default)]
    pub header_rewrite: Vec<HeaderRewriteRule>,
    #[serde(default)]
    pub enable_webhooks: bool,
}

fn default_mailgun_base_url() -> String {
    "https://api.mailgun.net/v3".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MandrillTracking {
    pub track_opens: bool,
    pub track_clicks: bool,
    pub auto_text: bool,
    pub auto_html: bool,
    pub inline_css: bool,
    pub url_strip_qs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MandrillProviderConfig {
    pub enabled: bool,
    pub api_key: String,
    #[serde(default = "default_mandrill_base_url")]
    pub base_url: String,
    pub subaccount: Option<String>,
    #[serde(default)]
    pub tracking: MandrillTracking,
    #[serde(default)]
    pub header_rewrite: Vec<HeaderRewriteRule>,
    #[serde(default)]
    pub enable_webhooks: bool,
}

fn default_mandrill_base_url() -> String {
    "https://mandrillapp.com/api/1.0".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub display_name: String,
    pub domains: HashSet<String>,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub gmail: Option<GmailProviderConfig>,
    #[serde(default)]
    pub mailgun: Option<MailgunProviderConfig>,
    #[serde(default)]
    pub mandrill: Option<MandrillProviderConfig>,
    /// Per-workspace override of provider selection order; falls back to
    /// [`ProviderKind::DEFAULT_PREFERENCE`] when absent.
    #[serde(default)]
    pub provider_preference: Option<Vec<ProviderKind>>,
}

impl Workspace {
    pub fn preference_order(&self) -> Vec<ProviderKind> {
        self.provider_preference
            .clone()
            .unwrap_or_else(|| ProviderKind::DEFAULT_PREFERENCE.to_vec())
    }

    /// The daily limit for `sender`: custom override → per-workspace default → 0 (unlimited-less,
    /// i.e. no sends) when neither is configured. Per §4.C precedence order.
    pub fn effective_user_daily_limit(&self, sender: &str) -> u32 {
        self.rate_limits
            .custom_user_limits
            .get(sender)
            .copied()
            .unwrap_or(self.rate_limits.per_user_daily)
    }
}
