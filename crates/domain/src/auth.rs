//! Credential value types shared by the client and its authenticator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A token issued by the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub token: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub issued: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_id: Option<String>,
    /// JSON capability document, e.g. `{"chat:*":["publish","subscribe"]}`.
    #[serde(default)]
    pub capability: Option<String>,
}

impl TokenDetails {
    /// A bare token string with no known expiry.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires: None,
            issued: None,
            client_id: None,
            capability: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires, Some(exp) if exp <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Parameters forwarded to the authenticator when a token is requested.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenParams {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
    /// Requested time to live in milliseconds.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

/// Per-call authentication options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthOptions {
    /// Skip any cached token and always ask the authenticator.
    #[serde(default)]
    pub force: bool,
    /// Use this token as-is instead of calling the authenticator.
    #[serde(default)]
    pub token: Option<String>,
}
