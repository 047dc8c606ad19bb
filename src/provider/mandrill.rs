use base64ct::{Base64, Encoding};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Message, ProviderId, ProviderKind, Workspace};

use super::{HealthState, Provider, ProviderError};

#[derive(Debug, Serialize)]
struct MandrillAttachment<'a> {
    #[serde(rename = "type")]
    content_type: &'a str,
    name: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct MandrillRecipient<'a> {
    email: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Debug, Serialize)]
struct MandrillMessage<'a> {
    html: Option<&'a str>,
    text: Option<&'a str>,
    subject: &'a str,
    from_email: &'a str,
    to: Vec<MandrillRecipient<'a>>,
    headers: std::collections::HashMap<&'a str, &'a str>,
    track_opens: bool,
    track_clicks: bool,
    auto_text: bool,
    auto_html: bool,
    inline_css: bool,
    url_strip_qs: bool,
    attachments: Vec<MandrillAttachment<'a>>,
    metadata: &'a std::collections::HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subaccount: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    key: &'a str,
    message: MandrillMessage<'a>,
    #[serde(rename = "async")]
    async_: bool,
}

#[derive(Debug, Deserialize)]
struct SendResult {
    email: String,
    status: String,
    #[serde(default)]
    reject_reason: Option<String>,
}

/// Mandrill's JSON `POST /messages/send.json` API (§4.H).
pub struct MandrillProvider {
    id: ProviderId,
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    subaccount: Option<String>,
    tracking: crate::models::MandrillTracking,
    supported_domains: Vec<String>,
    health: HealthState,
}

impl MandrillProvider {
    pub fn new(workspace: &Workspace, api_key: String) -> Result<Self, ProviderError> {
        let config = workspace
            .mandrill
            .as_ref()
            .ok_or_else(|| ProviderError::Permanent("workspace has no mandrill config".into()))?;

        Ok(Self {
            id: ProviderId::new(ProviderKind::Mandrill, &workspace.id),
            http: reqwest::Client::new(),
            api_key,
            base_url: config.base_url.clone(),
            subaccount: config.subaccount.clone(),
            tracking: config.tracking.clone(),
            supported_domains: workspace.domains.iter().cloned().collect(),
            health: HealthState::new(),
        })
    }
}

fn is_standard_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "from" | "to" | "cc" | "bcc" | "subject" | "content-type" | "mime-version"
    )
}

fn is_success_status(status: &str) -> bool {
    matches!(status, "sent" | "queued" | "scheduled")
}

#[async_trait]
impl Provider for MandrillProvider {
    async fn send_message(&self, message: &mut Message) -> Result<(), ProviderError> {
        let mut to: Vec<MandrillRecipient> = message
            .to
            .iter()
            .map(|email| MandrillRecipient { email, kind: "to" })
            .collect();
        to.extend(message.cc.iter().map(|email| MandrillRecipient { email, kind: "cc" }));
        to.extend(message.bcc.iter().map(|email| MandrillRecipient { email, kind: "bcc" }));

        let headers: std::collections::HashMap<&str, &str> = message
            .headers
            .iter()
            .filter(|(name, _)| !is_standard_header(name))
            .collect();

        let attachments: Vec<MandrillAttachment> = message
            .attachments
            .iter()
            .map(|attachment| MandrillAttachment {
                content_type: &attachment.content_type,
                name: &attachment.name,
                content: Base64::encode_string(&attachment.bytes),
            })
            .collect();

        let request = SendRequest {
            key: &self.api_key,
            message: MandrillMessage {
                html: message.html.as_deref(),
                text: message.text.as_deref(),
                subject: &message.subject,
                from_email: &message.from,
                to,
                headers,
                track_opens: self.tracking.track_opens,
                track_clicks: self.tracking.track_clicks,
                auto_text: self.tracking.auto_text,
                auto_html: self.tracking.auto_html,
                inline_css: self.tracking.inline_css,
                url_strip_qs: self.tracking.url_strip_qs,
                attachments,
                metadata: &message.metadata,
                subaccount: self.subaccount.as_deref(),
            },
            async_: false,
        };

        let response = self
            .http
            .post(format!("{}/messages/send.json", self.base_url.trim_end_matches('/')))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("mandrill request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            let error = ProviderError::Authentication(body);
            self.health.mark_unhealthy(error.to_string()).await;
            return Err(error);
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Transient(format!("mandrill returned {status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Permanent(format!("mandrill returned {status}: {body}")));
        }

        let results: Vec<SendResult> = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("invalid mandrill response: {e}")))?;

        self.health.mark_healthy().await;

        let rejected: Vec<_> = results.iter().filter(|r| !is_success_status(&r.status)).collect();
        if let Some(first) = rejected.first() {
            return Err(ProviderError::InvalidRecipient {
                recipient: first.email.clone(),
                reason: first
                    .reject_reason
                    .clone()
                    .unwrap_or_else(|| first.status.clone()),
            });
        }

        Ok(())
    }

    async fn health_check(&self) -> bool {
        let response = self
            .http
            .post(format!("{}/users/ping2.json", self.base_url.trim_end_matches('/')))
            .json(&serde_json::json!({ "key": self.api_key }))
            .send()
            .await;

        let healthy = matches!(response, Ok(r) if r.status().is_success());
        if healthy {
            self.health.mark_healthy().await;
        } else {
            self.health.mark_unhealthy("ping2 health check failed").await;
        }
        healthy
    }

    async fn is_healthy(&self) -> bool {
        self.health.is_healthy().await
    }

    async fn last_error(&self) -> Option<String> {
        self.health.last_error().await
    }

    fn can_send_from_domain(&self, domain: &str) -> bool {
        self.supported_domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    fn supported_domains(&self) -> &[String] {
        &self.supported_domains
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Mandrill
    }

    fn id(&self) -> &ProviderId {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sent_queued_and_scheduled_are_success() {
        assert!(is_success_status("sent"));
        assert!(is_success_status("queued"));
        assert!(is_success_status("scheduled"));
        assert!(!is_success_status("rejected"));
        assert!(!is_success_status("invalid"));
    }
}
