use rt_domain::ErrorInfo;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::message::Message;

/// One frame on the realtime transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub flags: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Token carried by an outbound `auth` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

/// Server-side limits and identity sent with `connected`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
    #[serde(
        default,
        rename = "connectionStateTtl",
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_state_ttl_ms: Option<u64>,
    #[serde(
        default,
        rename = "maxIdleInterval",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_idle_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            flags: 0,
            count: None,
            error: None,
            id: None,
            channel: None,
            channel_serial: None,
            connection_id: None,
            connection_key: None,
            connection_serial: None,
            msg_serial: None,
            messages: Vec::new(),
            auth: None,
            connection_details: None,
            timestamp: None,
        }
    }

    fn for_channel(action: Action, channel: &str) -> Self {
        Self {
            channel: Some(channel.to_owned()),
            ..Self::new(action)
        }
    }

    // ── Outbound constructors ───────────────────────────────────────

    pub fn attach(channel: &str) -> Self {
        Self::for_channel(Action::Attach, channel)
    }

    pub fn detach(channel: &str) -> Self {
        Self::for_channel(Action::Detach, channel)
    }

    pub fn publish(channel: &str, messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::for_channel(Action::Message, channel)
        }
    }

    pub fn auth(access_token: impl Into<String>) -> Self {
        Self {
            auth: Some(AuthDetails {
                access_token: access_token.into(),
            }),
            ..Self::new(Action::Auth)
        }
    }

    pub fn close() -> Self {
        Self::new(Action::Close)
    }

    // ── Inbound constructors (servers and tests) ────────────────────

    pub fn connected(connection_id: &str, details: ConnectionDetails) -> Self {
        Self {
            connection_id: Some(connection_id.to_owned()),
            connection_key: details.connection_key.clone(),
            connection_details: Some(details),
            ..Self::new(Action::Connected)
        }
    }

    pub fn attached(channel: &str) -> Self {
        Self::for_channel(Action::Attached, channel)
    }

    pub fn detached(channel: &str) -> Self {
        Self::for_channel(Action::Detached, channel)
    }

    pub fn ack(msg_serial: u64, count: u32) -> Self {
        Self {
            msg_serial: Some(msg_serial),
            count: Some(count),
            ..Self::new(Action::Ack)
        }
    }

    pub fn nack(msg_serial: u64, count: u32, error: ErrorInfo) -> Self {
        Self {
            msg_serial: Some(msg_serial),
            count: Some(count),
            error: Some(error),
            ..Self::new(Action::Nack)
        }
    }

    pub fn error(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::new(Action::Error)
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    pub fn with_flag(mut self, flag: u32) -> Self {
        self.flags |= flag;
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Number of serials an ack/nack frame covers. Servers omit `count`
    /// for single-serial acks.
    pub fn ack_count(&self) -> u32 {
        self.count.unwrap_or(1).max(1)
    }

    pub fn channel_name(&self) -> Option<&str> {
        self.channel.as_deref()
    }
}
