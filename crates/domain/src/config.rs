use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for one realtime client instance.
///
/// Every field has a default so a TOML file only needs to name what it
/// overrides:
///
/// ```toml
/// endpoint = "wss://realtime.example.com"
/// key = "app.key:secret"
/// connection_state_ttl_ms = 60000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    #[serde(default = "d_endpoint")]
    pub endpoint: String,
    /// API key in `name:secret` form. Enables basic auth when no
    /// authenticator is configured.
    #[serde(default)]
    pub key: Option<String>,
    /// Static token. Cannot be renewed without an authenticator.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "d_true")]
    pub auto_connect: bool,
    /// Queue publishes issued while the connection is not yet connected.
    #[serde(default = "d_true")]
    pub queue_messages: bool,
    #[serde(default = "d_true")]
    pub echo_messages: bool,
    /// Generate `<base>:<ordinal>` ids for messages published without one.
    #[serde(default = "d_true")]
    pub idempotent_publishing: bool,
    #[serde(default = "d_15000")]
    pub disconnected_retry_timeout_ms: u64,
    #[serde(default = "d_30000")]
    pub suspended_retry_timeout_ms: u64,
    #[serde(default = "d_15000")]
    pub channel_retry_timeout_ms: u64,
    #[serde(default = "d_10000")]
    pub realtime_request_timeout_ms: u64,
    /// How long the client may stay disconnected before it gives up on
    /// resuming and moves to suspended.
    #[serde(default = "d_120000")]
    pub connection_state_ttl_ms: u64,
    #[serde(default = "d_max_message_size")]
    pub max_message_size: usize,
    /// Silent token renewals allowed per connect attempt before an auth
    /// error becomes fatal.
    #[serde(default = "d_1")]
    pub max_auth_retries: u32,
    /// Recovery key handed over by a previous client instance.
    #[serde(default)]
    pub recover: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoint: d_endpoint(),
            key: None,
            token: None,
            client_id: None,
            auto_connect: true,
            queue_messages: true,
            echo_messages: true,
            idempotent_publishing: true,
            disconnected_retry_timeout_ms: d_15000(),
            suspended_retry_timeout_ms: d_30000(),
            channel_retry_timeout_ms: d_15000(),
            realtime_request_timeout_ms: d_10000(),
            connection_state_ttl_ms: d_120000(),
            max_message_size: d_max_message_size(),
            max_auth_retries: d_1(),
            recover: None,
        }
    }
}

impl ClientOptions {
    /// Parse options from a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn disconnected_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_timeout_ms)
    }

    pub fn suspended_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.suspended_retry_timeout_ms)
    }

    pub fn channel_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_retry_timeout_ms)
    }

    pub fn realtime_request_timeout(&self) -> Duration {
        Duration::from_millis(self.realtime_request_timeout_ms)
    }

    pub fn connection_state_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_state_ttl_ms)
    }

    /// Validate the options and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.endpoint.is_empty() {
            errors.push(ConfigError::error("endpoint", "endpoint must not be empty"));
        } else {
            match url::Url::parse(&self.endpoint) {
                Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
                Ok(_) => errors.push(ConfigError::error(
                    "endpoint",
                    "endpoint must use the ws:// or wss:// scheme",
                )),
                Err(_) => errors.push(ConfigError::error("endpoint", "endpoint is not a valid URL")),
            }
        }

        if let Some(key) = &self.key {
            match key.split_once(':') {
                Some((name, secret)) if !name.is_empty() && !secret.is_empty() => {}
                _ => errors.push(ConfigError::error("key", "key must have the form name:secret")),
            }
        }

        if self.key.is_none() && self.token.is_none() {
            errors.push(ConfigError::warning(
                "key",
                "neither key nor token set; an authenticator is required",
            ));
        }

        if self.client_id.as_deref() == Some("*") {
            errors.push(ConfigError::error(
                "client_id",
                "wildcard client_id is reserved for token capabilities",
            ));
        }

        if self.max_message_size == 0 {
            errors.push(ConfigError::error(
                "max_message_size",
                "max_message_size must be greater than 0",
            ));
        }

        if self.realtime_request_timeout_ms == 0 {
            errors.push(ConfigError::error(
                "realtime_request_timeout_ms",
                "timeout must be greater than 0",
            ));
        }

        if self.connection_state_ttl_ms < self.disconnected_retry_timeout_ms {
            errors.push(ConfigError::warning(
                "connection_state_ttl_ms",
                "state TTL is shorter than the first retry delay; the client will suspend before retrying",
            ));
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_endpoint() -> String {
    "wss://realtime.example.com".into()
}

fn d_true() -> bool {
    true
}

fn d_1() -> u32 {
    1
}

fn d_10000() -> u64 {
    10_000
}

fn d_15000() -> u64 {
    15_000
}

fn d_30000() -> u64 {
    30_000
}

fn d_120000() -> u64 {
    120_000
}

fn d_max_message_size() -> usize {
    64 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let opts = ClientOptions::from_toml_str("").unwrap();
        assert_eq!(opts.connection_state_ttl(), Duration::from_secs(120));
        assert_eq!(opts.suspended_retry_timeout(), Duration::from_secs(30));
        assert_eq!(opts.disconnected_retry_timeout(), Duration::from_secs(15));
        assert_eq!(opts.max_message_size, 65_536);
        assert!(opts.idempotent_publishing);
        assert!(opts.queue_messages);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let opts = ClientOptions::from_toml_str(
            r#"
            endpoint = "ws://localhost:9000"
            key = "app.key:secret"
            idempotent_publishing = false
            connection_state_ttl_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(opts.endpoint, "ws://localhost:9000");
        assert_eq!(opts.key.as_deref(), Some("app.key:secret"));
        assert!(!opts.idempotent_publishing);
        assert_eq!(opts.connection_state_ttl(), Duration::from_secs(5));
    }

    #[test]
    fn validate_accepts_key_auth() {
        let opts = ClientOptions {
            key: Some("app.key:secret".into()),
            ..Default::default()
        };
        assert!(opts.validate().is_empty(), "{:?}", opts.validate());
    }

    #[test]
    fn validate_rejects_malformed_key_and_scheme() {
        let opts = ClientOptions {
            endpoint: "http://nope".into(),
            key: Some("no-secret".into()),
            ..Default::default()
        };
        let errors = opts.validate();
        assert!(errors.iter().any(|e| e.field == "endpoint"));
        assert!(errors
            .iter()
            .any(|e| e.field == "key" && e.severity == ConfigSeverity::Error));
    }

    #[test]
    fn validate_rejects_unparseable_endpoint() {
        let opts = ClientOptions {
            endpoint: "wss://".into(),
            key: Some("app.key:secret".into()),
            ..Default::default()
        };
        let errors = opts.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "endpoint is not a valid URL");
    }

    #[test]
    fn missing_credentials_is_only_a_warning() {
        let errors = ClientOptions::default().validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].severity, ConfigSeverity::Warning);
        assert_eq!(errors[0].to_string(), "[WARN] key: neither key nor token set; an authenticator is required");
    }
}
