use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::models::{HeaderRewriteRule, Message};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unresolved template variable(s) in message: {0:?}")]
    UnresolvedVariables(Vec<String>),
    #[error("external transform collaborator failed: {0}")]
    External(String),
}

/// Applies a workspace's header-rewrite rules in order: a blank `new_value`
/// removes the header (case-insensitively), otherwise it replaces-or-adds
/// it. Idempotent — applying the same ruleset twice leaves the headers
/// unchanged on the second pass (§4.J).
pub fn apply_header_rewrite(message: &mut Message, rules: &[HeaderRewriteRule]) {
    for rule in rules {
        if rule.new_value.is_empty() {
            message.headers.remove(&rule.header_name);
        } else {
            message.headers.set(&rule.header_name, rule.new_value.clone());
        }
    }
}

fn variable_regex() -> Regex {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("static regex is valid")
}

/// Replaces every `{{TOKEN}}` resolvable by `source`; tokens `source`
/// cannot resolve are left untouched so [`validate_no_unresolved`] can
/// report them distinctly from a deliberately literal `{{...}}` in content.
pub(crate) fn replace_variables(body: &str, source: &MapVariableSource) -> String {
    let pattern = variable_regex();
    pattern
        .replace_all(body, |caps: &regex::Captures| {
            let token = &caps[1];
            source.0.get(token).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Fails the message rather than sending it with a literal `{{TOKEN}}`
/// visible to the recipient (§4.J edge case, §7).
pub fn validate_no_unresolved(bodies: &[&str]) -> Result<(), TransformError> {
    let pattern = variable_regex();
    let mut unresolved = Vec::new();
    for body in bodies {
        for caps in pattern.captures_iter(body) {
            unresolved.push(caps[1].to_string());
        }
    }
    if unresolved.is_empty() {
        Ok(())
    } else {
        Err(TransformError::UnresolvedVariables(unresolved))
    }
}

pub(crate) struct MapVariableSource(pub HashMap<String, String>);

/// The external "trending content" variable service (§4.J): supplies one
/// batch of token→value substitutions per message. An injectable
/// collaborator the same way the teacher injects `DnsResolver`
/// (`handler::dns::DnsResolver`, with a mock used in tests) — this crate
/// specifies and drives only the call-site contract, not the service itself.
#[async_trait]
pub trait TrendingVariableSource: Send + Sync {
    async fn resolve(&self, message: &Message) -> Result<HashMap<String, String>, TransformError>;
}

/// Used when variable replacement is disabled by feature flag.
pub struct NoopTrendingVariableSource;

#[async_trait]
impl TrendingVariableSource for NoopTrendingVariableSource {
    async fn resolve(&self, _message: &Message) -> Result<HashMap<String, String>, TransformError> {
        Ok(HashMap::new())
    }
}

/// Text rewritten by the LLM personalizer for a message's body.
#[derive(Debug, Clone, Default)]
pub struct PersonalizedBody {
    pub text: Option<String>,
    pub html: Option<String>,
}

/// The external LLM personalizer (§4.J): may rewrite body text. A failure
/// degrades to the original content and never blocks send.
#[async_trait]
pub trait LlmPersonalizer: Send + Sync {
    async fn rewrite(&self, message: &Message) -> Result<PersonalizedBody, TransformError>;
}

pub struct NoopLlmPersonalizer;

#[async_trait]
impl LlmPersonalizer for NoopLlmPersonalizer {
    async fn rewrite(&self, message: &Message) -> Result<PersonalizedBody, TransformError> {
        Ok(PersonalizedBody { text: message.text.clone(), html: message.html.clone() })
    }
}

/// The full pre-send chain the processor drives (§4.J, §4.K step 2): header
/// rewrite, then trending-variable substitution (degrading to the original
/// content and failing the message only on a genuinely unresolved token),
/// then personalization (degrading silently, never blocking send).
pub async fn run_full_transform_chain(
    message: &mut Message,
    header_rules: &[HeaderRewriteRule],
    trending: &dyn TrendingVariableSource,
    personalizer: &dyn LlmPersonalizer,
    enable_variables: bool,
    enable_personalization: bool,
) -> Result<(), TransformError> {
    apply_header_rewrite(message, header_rules);

    if enable_variables {
        let vars = trending.resolve(message).await.unwrap_or_default();
        let source = MapVariableSource(vars);

        message.subject = replace_variables(&message.subject, &source);
        if let Some(text) = message.text.clone() {
            message.text = Some(replace_variables(&text, &source));
        }
        if let Some(html) = message.html.clone() {
            message.html = Some(replace_variables(&html, &source));
        }

        let mut bodies = vec![message.subject.as_str()];
        if let Some(text) = &message.text {
            bodies.push(text);
        }
        if let Some(html) = &message.html {
            bodies.push(html);
        }
        validate_no_unresolved(&bodies)?;
    }

    if enable_personalization {
        if let Ok(body) = personalizer.rewrite(message).await {
            if let Some(text) = body.text {
                message.text = Some(text);
            }
            if let Some(html) = body.html {
                message.html = Some(html);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::models::{Headers, MessageId, MessageStatus};

    fn sample_message() -> Message {
        Message {
            id: MessageId::new(),
            from: "alerts@example.com".to_string(),
            to: vec!["user@customer.com".to_string()],
            cc: vec![],
            bcc: vec![],
            subject: "Hello {{FIRST_NAME}}".to_string(),
            text: Some("Welcome, {{FIRST_NAME}}! Token: {{UNKNOWN}}".to_string()),
            html: None,
            headers: Headers::new(),
            attachments: vec![],
            metadata: HashMap::new(),
            campaign_id: None,
            user_id: None,
            invitation_id: None,
            email_type: None,
            workspace_id: None,
            status: MessageStatus::Queued,
            queued_at: chrono::Utc::now(),
            processed_at: None,
            error: None,
            retry_count: 0,
            leased_until: None,
            recipient_status: HashMap::new(),
        }
    }

    #[test]
    fn header_rewrite_removes_on_empty_value_and_is_idempotent() {
        let mut message = sample_message();
        message.headers.set("X-Old", "value");
        let rules = vec![
            HeaderRewriteRule { header_name: "X-Old".to_string(), new_value: String::new() },
            HeaderRewriteRule { header_name: "X-New".to_string(), new_value: "added".to_string() },
        ];

        apply_header_rewrite(&mut message, &rules);
        assert!(!message.headers.contains("X-Old"));
        assert_eq!(message.headers.get("X-New"), Some("added"));

        let before = message.headers.clone();
        apply_header_rewrite(&mut message, &rules);
        assert_eq!(before, message.headers);
    }

    #[test]
    fn unresolved_variables_are_reported_but_known_ones_are_not() {
        let message = sample_message();
        let mut vars = HashMap::new();
        vars.insert("FIRST_NAME".to_string(), "Alex".to_string());
        let source = MapVariableSource(vars);

        let resolved_subject = replace_variables(&message.subject, &source);
        assert_eq!(resolved_subject, "Hello Alex");

        let resolved_text = replace_variables(message.text.as_ref().unwrap(), &source);
        assert_eq!(resolved_text, "Welcome, Alex! Token: {{UNKNOWN}}");

        let result = validate_no_unresolved(&[&resolved_subject, &resolved_text]);
        assert!(matches!(result, Err(TransformError::UnresolvedVariables(tokens)) if tokens == vec!["UNKNOWN".to_string()]));
    }

    struct StaticTrendingSource(HashMap<String, String>);

    #[async_trait]
    impl TrendingVariableSource for StaticTrendingSource {
        async fn resolve(&self, _message: &Message) -> Result<HashMap<String, String>, TransformError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn fully_resolved_message_passes_validation() {
        let mut message = sample_message();
        message.text = Some("Welcome, {{FIRST_NAME}}!".to_string());
        let mut vars = HashMap::new();
        vars.insert("FIRST_NAME".to_string(), "Alex".to_string());

        run_full_transform_chain(
            &mut message,
            &[],
            &StaticTrendingSource(vars),
            &NoopLlmPersonalizer,
            true,
            false,
        )
        .await
        .unwrap();
        assert_eq!(message.subject, "Hello Alex");
        assert_eq!(message.text.as_deref(), Some("Welcome, Alex!"));
    }

    struct FailingTrendingSource;

    #[async_trait]
    impl TrendingVariableSource for FailingTrendingSource {
        async fn resolve(&self, _message: &Message) -> Result<HashMap<String, String>, TransformError> {
            Err(TransformError::External("trending service unreachable".into()))
        }
    }

    #[tokio::test]
    async fn trending_service_failure_degrades_to_unresolved_failure() {
        let mut message = sample_message();
        let result = run_full_transform_chain(
            &mut message,
            &[],
            &FailingTrendingSource,
            &NoopLlmPersonalizer,
            true,
            false,
        )
        .await;

        assert!(matches!(result, Err(TransformError::UnresolvedVariables(_))));
    }

    struct FailingPersonalizer;

    #[async_trait]
    impl LlmPersonalizer for FailingPersonalizer {
        async fn rewrite(&self, _message: &Message) -> Result<PersonalizedBody, TransformError> {
            Err(TransformError::External("llm unavailable".into()))
        }
    }

    #[tokio::test]
    async fn personalizer_failure_never_blocks_send() {
        let mut message = sample_message();
        message.subject = "no vars here".to_string();
        message.text = Some("plain body".to_string());

        let result = run_full_transform_chain(
            &mut message,
            &[],
            &NoopTrendingVariableSource,
            &FailingPersonalizer,
            false,
            true,
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(message.text.as_deref(), Some("plain body"));
    }
}
