use async_trait::async_trait;
use serde::Deserialize;

use crate::models::{Message, ProviderId, ProviderKind, Workspace};

use super::{HealthState, Provider, ProviderError};

#[derive(Debug, Deserialize)]
struct MailgunResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Mailgun's classic `POST /v3/<domain>/messages` form-encoded API (§4.G).
pub struct MailgunProvider {
    id: ProviderId,
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    domain: String,
    supported_domains: Vec<String>,
    tracking: crate::models::MailgunTracking,
    health: HealthState,
}

impl MailgunProvider {
    pub fn new(workspace: &Workspace, api_key: String, domain: String) -> Result<Self, ProviderError> {
        let config = workspace
            .mailgun
            .as_ref()
            .ok_or_else(|| ProviderError::Permanent("workspace has no mailgun config".into()))?;

        Ok(Self {
            id: ProviderId::new(ProviderKind::Mailgun, &workspace.id),
            http: reqwest::Client::new(),
            api_key,
            base_url: config.base_url.clone(),
            domain,
            supported_domains: workspace.domains.iter().cloned().collect(),
            tracking: config.tracking.clone(),
            health: HealthState::new(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/{}/messages", self.base_url.trim_end_matches('/'), self.domain)
    }
}

fn is_standard_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "content-type" | "to" | "from" | "subject" | "cc" | "bcc" | "date" | "message-id"
    )
}

#[async_trait]
impl Provider for MailgunProvider {
    async fn send_message(&self, message: &mut Message) -> Result<(), ProviderError> {
        let sender_domain = message.sender_domain().unwrap_or_default();
        if !self.can_send_from_domain(sender_domain) {
            return Err(ProviderError::Permanent("unsupported_domain".to_string()));
        }

        let mut form: Vec<(String, String)> = vec![
            ("from".to_string(), message.from.clone()),
            ("subject".to_string(), message.subject.clone()),
        ];
        if !message.to.is_empty() {
            form.push(("to".to_string(), message.to.join(",")));
        }
        if !message.cc.is_empty() {
            form.push(("cc".to_string(), message.cc.join(",")));
        }
        if !message.bcc.is_empty() {
            form.push(("bcc".to_string(), message.bcc.join(",")));
        }
        if let Some(text) = &message.text {
            form.push(("text".to_string(), text.clone()));
        }
        if let Some(html) = &message.html {
            form.push(("html".to_string(), html.clone()));
        }

        form.push(("o:tracking-opens".to_string(), bool_str(self.tracking.opens)));
        form.push((
            "o:tracking-clicks".to_string(),
            if self.tracking.clicks { "htmlonly".to_string() } else { "no".to_string() },
        ));
        form.push(("o:tracking-unsubscribe".to_string(), bool_str(self.tracking.unsubscribe)));

        for (name, value) in message.headers.iter() {
            if is_standard_header(name) {
                continue;
            }
            form.push((format!("h:{name}"), value.to_string()));
        }

        form.push(("v:message_id".to_string(), message.id.to_string()));
        form.push(("v:provider_id".to_string(), self.id.to_string()));
        if let Some(invitation_id) = &message.invitation_id {
            form.push(("v:invitation_id".to_string(), invitation_id.clone()));
        }
        if let Some(email_type) = &message.email_type {
            form.push(("v:email_type".to_string(), email_type.clone()));
        }
        for (key, value) in &message.metadata {
            if let serde_json::Value::String(value) = value {
                form.push((format!("v:{key}"), value.clone()));
            }
        }

        let response = self
            .http
            .post(self.endpoint())
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("mailgun request failed: {e}")))?;

        let status = response.status();
        match status {
            s if s.is_success() => {
                self.health.mark_healthy().await;
                Ok(())
            }
            reqwest::StatusCode::UNAUTHORIZED => {
                let body: MailgunResponse = response.json().await.unwrap_or(MailgunResponse { id: None, message: None });
                let error = ProviderError::Authentication(body.message.unwrap_or_else(|| "unauthorized".into()));
                self.health.mark_unhealthy(error.to_string()).await;
                Err(error)
            }
            s if s.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Transient(format!("mailgun returned {status}: {body}")))
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Permanent(format!("mailgun returned {status}: {body}")))
            }
        }
    }

    async fn health_check(&self) -> bool {
        let response = self
            .http
            .get(format!("{}/domains/{}", self.base_url.trim_end_matches('/'), self.domain))
            .basic_auth("api", Some(&self.api_key))
            .send()
            .await;

        let healthy = matches!(response, Ok(r) if r.status().is_success());
        if healthy {
            self.health.mark_healthy().await;
        } else {
            self.health.mark_unhealthy("domain health check failed").await;
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
        ProviderKind::Mailgun
    }

    fn id(&self) -> &ProviderId {
        &self.id
    }
}

fn bool_str(value: bool) -> String {
    if value { "yes".to_string() } else { "no".to_string() }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use httpmock::MockServer;

    use crate::models::{MailgunProviderConfig, MailgunTracking, Workspace, WorkspaceId};

    use super::*;

    #[test]
    fn standard_headers_are_not_duplicated_as_custom() {
        assert!(is_standard_header("To"));
        assert!(is_standard_header("BCC"));
        assert!(!is_standard_header("X-Custom"));
    }

    #[test]
    fn tracking_flags_use_mailgun_yes_no_convention() {
        assert_eq!(bool_str(true), "yes");
        assert_eq!(bool_str(false), "no");
    }

    fn sample_workspace() -> Workspace {
        Workspace {
            id: WorkspaceId::from("acme"),
            display_name: "Acme".to_string(),
            domains: HashSet::from(["acme.example.com".to_string()]),
            rate_limits: Default::default(),
            gmail: None,
            mailgun: Some(MailgunProviderConfig {
                enabled: true,
                api_key: "key-test".to_string(),
                base_url: "http://placeholder".to_string(),
                tracking: MailgunTracking { opens: true, clicks: true, unsubscribe: false },
                header_rewrite: Vec::new(),
                enable_webhooks: false,
            }),
            mandrill: None,
            provider_preference: None,
        }
    }

    fn sample_message() -> Message {
        Message {
            id: MessageId::new(),
            from: "hello@acme.example.com".to_string(),
            to: vec!["alice@example.com".to_string()],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: "Hi".to_string(),
            text: Some("body".to_string()),
            html: None,
            headers: Default::default(),
            attachments: Vec::new(),
            metadata: HashMap::new(),
            campaign_id: None,
            user_id: None,
            invitation_id: Some("inv-1".to_string()),
            email_type: Some("transactional".to_string()),
            workspace_id: Some(WorkspaceId::from("acme")),
            status: crate::models::MessageStatus::Queued,
            queued_at: chrono::Utc::now(),
            processed_at: None,
            error: None,
            retry_count: 0,
            leased_until: None,
            recipient_status: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn send_message_posts_tracking_flags_and_custom_variables() {
        let server = MockServer::start();
        let workspace = sample_workspace();
        let provider =
            MailgunProvider::new(&workspace, "key-test".to_string(), "acme.example.com".to_string()).unwrap();
        let provider = MailgunProvider { base_url: server.base_url(), ..provider };
        let mut message = sample_message();

        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/acme.example.com/messages")
                .body_contains("o:tracking-clicks=htmlonly")
                .body_contains("o:tracking-unsubscribe=no")
                .body_contains(&format!("v:message_id={}", message.id))
                .body_contains("v:invitation_id=inv-1")
                .body_contains("v:email_type=transactional");
            then.status(200).json_body(serde_json::json!({"id": "<mock@mailgun>", "message": "Queued"}));
        });

        provider.send_message(&mut message).await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn send_message_rejects_an_unsupported_sender_domain_before_any_request() {
        let server = MockServer::start();
        let workspace = sample_workspace();
        let provider =
            MailgunProvider::new(&workspace, "key-test".to_string(), "acme.example.com".to_string()).unwrap();
        let provider = MailgunProvider { base_url: server.base_url(), ..provider };
        let mut message = sample_message();
        message.from = "hello@not-acme.example.com".to_string();

        let mock = server.mock(|when, then| {
            when.any_request();
            then.status(200);
        });

        let result = provider.send_message(&mut message).await;
        assert!(matches!(result, Err(ProviderError::Permanent(reason)) if reason == "unsupported_domain"));
        mock.assert_hits(0);
    }
}
