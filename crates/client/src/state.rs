//! Connection and channel states and the change records emitted for them.

use std::fmt;
use std::time::Duration;

use rt_domain::ErrorInfo;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    /// States in which no recovery key is offered.
    pub fn is_unrecoverable(self) -> bool {
        matches!(
            self,
            ConnectionState::Closing
                | ConnectionState::Closed
                | ConnectionState::Failed
                | ConnectionState::Suspended
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event tag of a [`ConnectionStateChange`]: the new state, or `Update`
/// when the state stayed `connected` but connection details changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEvent {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
    Update,
}

impl From<ConnectionState> for ConnectionEvent {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Initialized => ConnectionEvent::Initialized,
            ConnectionState::Connecting => ConnectionEvent::Connecting,
            ConnectionState::Connected => ConnectionEvent::Connected,
            ConnectionState::Disconnected => ConnectionEvent::Disconnected,
            ConnectionState::Suspended => ConnectionEvent::Suspended,
            ConnectionState::Closing => ConnectionEvent::Closing,
            ConnectionState::Closed => ConnectionEvent::Closed,
            ConnectionState::Failed => ConnectionEvent::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub event: ConnectionEvent,
    pub reason: Option<ErrorInfo>,
    /// Delay before the next automatic connection attempt, if one is armed.
    pub retry_in: Option<Duration>,
    /// On `connected`: whether the previous session continued.
    pub resumed: bool,
}

// ── Channels ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelEvent {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
    Update,
}

impl From<ChannelState> for ChannelEvent {
    fn from(state: ChannelState) -> Self {
        match state {
            ChannelState::Initialized => ChannelEvent::Initialized,
            ChannelState::Attaching => ChannelEvent::Attaching,
            ChannelState::Attached => ChannelEvent::Attached,
            ChannelState::Detaching => ChannelEvent::Detaching,
            ChannelState::Detached => ChannelEvent::Detached,
            ChannelState::Suspended => ChannelEvent::Suspended,
            ChannelState::Failed => ChannelEvent::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub event: ChannelEvent,
    pub reason: Option<ErrorInfo>,
    pub resumed: bool,
}
