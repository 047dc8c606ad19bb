use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{self, RsaKeyPair};
use base64ct::{Base64UrlUnpadded, Encoding};
use mail_builder::MessageBuilder;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::models::{Message, ProviderId, ProviderKind, Workspace};

use super::{HealthState, Provider, ProviderError};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";
const SENDER_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountCredentials {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    TOKEN_URL.to_string()
}

#[derive(Debug, Serialize)]
struct JwtHeader<'a> {
    alg: &'a str,
    typ: &'a str,
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    sub: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedSession {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct CachedValidation {
    valid: bool,
    cached_at: Instant,
}

/// Gmail send-as via domain-wide delegation: one short-lived OAuth access
/// token per sending mailbox, minted from a service-account JWT signed with
/// the same RSA primitive the teacher already uses for DKIM (§4.F).
pub struct GmailProvider {
    id: ProviderId,
    http: reqwest::Client,
    credentials: ServiceAccountCredentials,
    key_pair: RsaKeyPair,
    default_sender: Option<String>,
    require_valid_sender: bool,
    supported_domains: Vec<String>,
    sessions: RwLock<HashMap<String, CachedSession>>,
    sender_validation: RwLock<HashMap<String, CachedValidation>>,
    health: HealthState,
}

impl GmailProvider {
    pub fn new(
        workspace: &Workspace,
        credentials: ServiceAccountCredentials,
    ) -> Result<Self, ProviderError> {
        let key_pair = parse_private_key(&credentials.private_key)?;
        let config = workspace
            .gmail
            .as_ref()
            .ok_or_else(|| ProviderError::Permanent("workspace has no gmail config".into()))?;

        Ok(Self {
            id: ProviderId::new(ProviderKind::Gmail, &workspace.id),
            http: reqwest::Client::new(),
            credentials,
            key_pair,
            default_sender: config.default_sender.clone(),
            require_valid_sender: config.require_valid_sender,
            supported_domains: workspace.domains.iter().cloned().collect(),
            sessions: RwLock::new(HashMap::new()),
            sender_validation: RwLock::new(HashMap::new()),
            health: HealthState::new(),
        })
    }

    /// Checks (and caches, for [`SENDER_CACHE_TTL`]) whether `sender` is a
    /// valid send-as alias for the domain, so `require_valid_sender`
    /// workspaces fall back to `default_sender` instead of attempting a send
    /// Gmail would reject outright.
    async fn sender_is_valid(&self, sender: &str) -> bool {
        {
            let cache = self.sender_validation.read().await;
            if let Some(entry) = cache.get(sender) {
                if entry.cached_at.elapsed() < SENDER_CACHE_TTL {
                    return entry.valid;
                }
            }
        }

        let Ok(token) = self.access_token(sender).await else {
            return false;
        };

        let valid = self
            .http
            .get(format!(
                "https://gmail.googleapis.com/gmail/v1/users/{sender}/settings/sendAs/{sender}"
            ))
            .bearer_auth(&token)
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false);

        self.sender_validation.write().await.insert(
            sender.to_string(),
            CachedValidation { valid, cached_at: Instant::now() },
        );
        valid
    }

    async fn access_token(&self, sender: &str) -> Result<String, ProviderError> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(sender) {
                if session.expires_at > Instant::now() {
                    return Ok(session.access_token.clone());
                }
            }
        }

        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &self.credentials.client_email,
            scope: SCOPE,
            aud: &self.credentials.token_uri,
            sub: sender,
            iat: now,
            exp: now + 3600,
        };
        let assertion = sign_jwt(&self.key_pair, &claims)?;

        let response = self
            .http
            .post(&self.credentials.token_uri)
            .form(&[("grant_type", GRANT_TYPE), ("assertion", &assertion)])
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("token request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_token_error(&body));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Transient(format!("token endpoint returned {status}: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("invalid token response: {e}")))?;

        let expires_in = if token.expires_in > 0 { token.expires_in } else { 3600 };
        self.sessions.write().await.insert(
            sender.to_string(),
            CachedSession {
                access_token: token.access_token.clone(),
                expires_at: Instant::now() + Duration::from_secs(expires_in as u64 - 30.min(expires_in as u64)),
            },
        );

        Ok(token.access_token)
    }

    fn build_raw_message(&self, message: &Message, sender: &str) -> Result<String, ProviderError> {
        let mut builder = MessageBuilder::new().from(sender.to_string()).subject(message.subject.clone());

        builder = builder.to(message.to.iter().cloned().collect::<Vec<_>>());
        if !message.cc.is_empty() {
            builder = builder.cc(message.cc.iter().cloned().collect::<Vec<_>>());
        }
        if !message.bcc.is_empty() {
            builder = builder.bcc(message.bcc.iter().cloned().collect::<Vec<_>>());
        }

        for (name, value) in message.headers.iter() {
            if is_reserved_header(name) {
                continue;
            }
            builder = builder.header(name.to_string(), mail_builder::headers::raw::Raw::new(value.to_string()));
        }

        builder = match (&message.text, &message.html) {
            (Some(text), Some(html)) => builder.text_body(text.clone()).html_body(html.clone()),
            (Some(text), None) => builder.text_body(text.clone()),
            (None, Some(html)) => builder.html_body(html.clone()),
            (None, None) => builder.text_body(String::new()),
        };

        let raw = builder
            .write_to_vec()
            .map_err(|e| ProviderError::Permanent(format!("failed to build RFC 5322 message: {e}")))?;

        Ok(Base64UrlUnpadded::encode_string(&raw))
    }
}

/// Whether an authentication failure on `sender`'s own token acquisition
/// should trigger the one-shot `default_sender` retry (§4.F fallback). A
/// sender that was already substituted (pre-validation already swapped it
/// in) never retries again, and a workspace with `require_valid_sender` set
/// has opted out of the fallback entirely.
fn should_retry_with_default_sender(require_valid_sender: bool, already_substituted: bool, error: &ProviderError) -> bool {
    !already_substituted && !require_valid_sender && matches!(error, ProviderError::Authentication(_))
}

fn is_reserved_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "from" | "to" | "cc" | "bcc" | "subject" | "content-type" | "mime-version"
    )
}

fn parse_private_key(pem: &str) -> Result<RsaKeyPair, ProviderError> {
    let der = pem_to_der(pem).map_err(ProviderError::Permanent)?;
    RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| ProviderError::Permanent(format!("invalid service-account private key: {e}")))
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>, String> {
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("");
    base64ct::Base64::decode_vec(&body).map_err(|e| format!("invalid PEM body: {e}"))
}

fn sign_jwt(key_pair: &RsaKeyPair, claims: &JwtClaims<'_>) -> Result<String, ProviderError> {
    let header = JwtHeader { alg: "RS256", typ: "JWT" };
    let header_b64 = Base64UrlUnpadded::encode_string(
        &serde_json::to_vec(&header).map_err(|e| ProviderError::Permanent(e.to_string()))?,
    );
    let claims_b64 = Base64UrlUnpadded::encode_string(
        &serde_json::to_vec(claims).map_err(|e| ProviderError::Permanent(e.to_string()))?,
    );
    let signing_input = format!("{header_b64}.{claims_b64}");

    let rng = SystemRandom::new();
    let mut signature = vec![0u8; key_pair.public_modulus_len()];
    key_pair
        .sign(&signature::RSA_PKCS1_SHA256, &rng, signing_input.as_bytes(), &mut signature)
        .map_err(|e| ProviderError::Permanent(format!("failed to sign JWT: {e}")))?;

    let signature_b64 = Base64UrlUnpadded::encode_string(&signature);
    Ok(format!("{signing_input}.{signature_b64}"))
}

fn classify_token_error(body: &str) -> ProviderError {
    if body.contains("invalid_grant") {
        ProviderError::Authentication(format!("invalid_grant: {body}"))
    } else if body.contains("unauthorized_client") {
        ProviderError::Authentication(format!("unauthorized_client (domain-wide delegation not granted): {body}"))
    } else {
        ProviderError::Authentication(body.to_string())
    }
}

#[async_trait]
impl Provider for GmailProvider {
    async fn send_message(&self, message: &mut Message) -> Result<(), ProviderError> {
        let original_sender = message.from.clone();
        let mut sender = original_sender.clone();
        let mut substituted = false;

        if self.require_valid_sender && !self.sender_is_valid(&sender).await {
            let Some(default_sender) = self.default_sender.clone() else {
                return Err(ProviderError::InvalidRecipient {
                    recipient: sender,
                    reason: "sender is not a valid Gmail send-as alias and no default_sender is configured".into(),
                });
            };
            debug!(original_sender = %sender, fallback_sender = %default_sender, "gmail: sender failed validation, using default sender");
            sender = default_sender;
            substituted = true;
        }

        // §4.F fallback: a failure to authenticate the original sender gets
        // one retry with `default_sender`, but only when require_valid_sender
        // is not strictly enforced (that case already substituted above, or
        // has no default_sender to fall back to).
        let token = match self.access_token(&sender).await {
            Ok(token) => token,
            Err(error) => {
                let retry_sender = should_retry_with_default_sender(self.require_valid_sender, substituted, &error)
                    .then(|| self.default_sender.clone())
                    .flatten();

                match retry_sender {
                    Some(default_sender) => {
                        warn!(
                            original_sender = %sender,
                            fallback_sender = %default_sender,
                            error = %error,
                            "gmail: sender authentication failed, retrying with default sender"
                        );
                        sender = default_sender;
                        substituted = true;
                        match self.access_token(&sender).await {
                            Ok(token) => token,
                            Err(fallback_error) => {
                                self.health.mark_unhealthy(fallback_error.to_string()).await;
                                return Err(fallback_error);
                            }
                        }
                    }
                    None => {
                        if matches!(error, ProviderError::Authentication(_)) {
                            self.health.mark_unhealthy(error.to_string()).await;
                        }
                        return Err(error);
                    }
                }
            }
        };

        if substituted {
            message
                .metadata
                .insert("original_sender".to_string(), serde_json::json!(original_sender));
            message.metadata.insert("actual_sender".to_string(), serde_json::json!(sender));
            message.metadata.insert("sender_substitution".to_string(), serde_json::json!(true));
        }

        let raw = self.build_raw_message(message, &sender)?;

        let response = self
            .http
            .post(format!(
                "https://gmail.googleapis.com/gmail/v1/users/{sender}/messages/send"
            ))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("gmail send request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                self.health.mark_healthy().await;
                Ok(())
            }
            reqwest::StatusCode::UNAUTHORIZED => {
                let body = response.text().await.unwrap_or_default();
                let error = ProviderError::Authentication(format!("unauthorized: {body}"));
                self.health.mark_unhealthy(error.to_string()).await;
                Err(error)
            }
            reqwest::StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Authentication(format!("forbidden (check domain-wide delegation scopes): {body}")))
            }
            reqwest::StatusCode::NOT_FOUND => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Permanent(format!("user_not_found: {body}")))
            }
            status if status.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Transient(format!("gmail returned {status}: {body}")))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Permanent(format!("gmail returned {status}: {body}")))
            }
        }
    }

    async fn health_check(&self) -> bool {
        let sender = self.default_sender.clone().unwrap_or_else(|| {
            let domain = self.supported_domains.first().cloned().unwrap_or_default();
            format!("postmaster@{domain}")
        });

        match self.access_token(&sender).await {
            Ok(_) => {
                self.health.mark_healthy().await;
                true
            }
            Err(error) => {
                self.health.mark_unhealthy(error.to_string()).await;
                false
            }
        }
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
        ProviderKind::Gmail
    }

    fn id(&self) -> &ProviderId {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_headers_are_stripped_case_insensitively() {
        assert!(is_reserved_header("From"));
        assert!(is_reserved_header("CONTENT-TYPE"));
        assert!(!is_reserved_header("X-Campaign-Id"));
    }

    #[test]
    fn retries_with_default_sender_only_on_a_fresh_auth_failure() {
        let auth_error = ProviderError::Authentication("invalid_grant".into());
        let transient_error = ProviderError::Transient("timeout".into());

        assert!(should_retry_with_default_sender(false, false, &auth_error));
        assert!(!should_retry_with_default_sender(false, true, &auth_error), "already substituted once");
        assert!(!should_retry_with_default_sender(true, false, &auth_error), "require_valid_sender opts out");
        assert!(!should_retry_with_default_sender(false, false, &transient_error), "not an auth failure");
    }

    #[test]
    fn classifies_token_endpoint_errors_by_known_substrings() {
        assert!(matches!(classify_token_error("invalid_grant: bad subject"), ProviderError::Authentication(_)));
        assert!(matches!(
            classify_token_error("unauthorized_client: delegation missing"),
            ProviderError::Authentication(_)
        ));
    }
}
