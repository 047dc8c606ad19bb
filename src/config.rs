use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::provider::ServiceAccountCredentials;

/// Environment-driven configuration for every binary in this crate — no
/// config-file format beyond the workspace-registry JSON itself, following
/// the teacher's `std::env::var` + `anyhow::Context` idiom rather than
/// introducing a new layer (SPEC_FULL.md configuration section).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub workspace_registry_path: String,
    pub batch_size: i64,
    pub process_interval: Duration,
    pub lease_duration: chrono::Duration,
    pub auth_error_cooldown: chrono::Duration,
    pub max_retries: i32,
    pub enable_variable_replacement: bool,
    pub enable_personalization: bool,
    pub webhook_url: Option<String>,
    pub webhook_signing_key: Option<String>,
    pub webhook_max_retries: u32,
    pub webhook_retry_interval: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            workspace_registry_path: std::env::var("WORKSPACE_REGISTRY_PATH")
                .context("WORKSPACE_REGISTRY_PATH must be set")?,
            batch_size: env_parse_or("BATCH_SIZE", 50)?,
            process_interval: Duration::from_secs(env_parse_or("PROCESS_INTERVAL_SECS", 5)?),
            lease_duration: chrono::Duration::seconds(env_parse_or("LEASE_DURATION_SECS", 300)?),
            auth_error_cooldown: chrono::Duration::seconds(env_parse_or(
                "AUTH_ERROR_COOLDOWN_SECS",
                3600,
            )?),
            max_retries: env_parse_or("MAX_RETRIES", 5)?,
            enable_variable_replacement: env_bool_or("ENABLE_VARIABLE_REPLACEMENT", true)?,
            enable_personalization: env_bool_or("ENABLE_PERSONALIZATION", false)?,
            webhook_url: std::env::var("WEBHOOK_URL").ok(),
            webhook_signing_key: std::env::var("WEBHOOK_SIGNING_KEY").ok(),
            webhook_max_retries: env_parse_or("WEBHOOK_MAX_RETRIES", 5)?,
            webhook_retry_interval: Duration::from_secs(env_parse_or(
                "WEBHOOK_RETRY_INTERVAL_SECS",
                60,
            )?),
        })
    }
}

fn env_parse_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.parse::<T>().map_err(|error| anyhow::anyhow!("invalid {key}: {error}")),
        Err(_) => Ok(default),
    }
}

fn env_bool_or(key: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(key) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => anyhow::bail!("invalid boolean for {key}: {other}"),
        },
        Err(_) => Ok(default),
    }
}

/// Resolves a Gmail `credentials_locator` (§4.D: "env var name or file
/// path") into the service-account JSON it names: first an env var of that
/// exact name, falling back to reading it as a file path.
pub fn load_gmail_credentials(locator: &str) -> anyhow::Result<ServiceAccountCredentials> {
    let raw = match std::env::var(locator) {
        Ok(value) => value,
        Err(_) => std::fs::read_to_string(locator)
            .with_context(|| format!("credentials_locator {locator} is neither an env var nor a readable file"))?,
    };
    serde_json::from_str(&raw).with_context(|| format!("invalid service account JSON from {locator}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_or_falls_back_to_default_when_unset() {
        let value: i64 = env_parse_or("POSTRELAY_TEST_DOES_NOT_EXIST", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_bool_or_accepts_common_spellings() {
        assert!(env_bool_or("POSTRELAY_TEST_BOOL_UNSET", true).unwrap());
        assert!(!env_bool_or("POSTRELAY_TEST_BOOL_UNSET", false).unwrap());
    }

    #[test]
    fn load_gmail_credentials_fails_clearly_on_a_missing_locator() {
        let result = load_gmail_credentials("POSTRELAY_TEST_MISSING_LOCATOR_AND_FILE");
        assert!(result.is_err());
    }
}
