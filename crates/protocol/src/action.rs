use std::fmt;

use serde::{Deserialize, Serialize};

/// Frame action. Serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Action {
    Heartbeat,
    Ack,
    Nack,
    Connect,
    Connected,
    Disconnect,
    Disconnected,
    Close,
    Closed,
    Error,
    Attach,
    Attached,
    Detach,
    Detached,
    Presence,
    Message,
    Sync,
    Auth,
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        match action {
            Action::Heartbeat => 0,
            Action::Ack => 1,
            Action::Nack => 2,
            Action::Connect => 3,
            Action::Connected => 4,
            Action::Disconnect => 5,
            Action::Disconnected => 6,
            Action::Close => 7,
            Action::Closed => 8,
            Action::Error => 9,
            Action::Attach => 10,
            Action::Attached => 11,
            Action::Detach => 12,
            Action::Detached => 13,
            Action::Presence => 14,
            Action::Message => 15,
            Action::Sync => 16,
            Action::Auth => 17,
        }
    }
}

/// Integer that does not name any [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownAction(pub u8);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown protocol action {}", self.0)
    }
}

impl std::error::Error for UnknownAction {}

impl TryFrom<u8> for Action {
    type Error = UnknownAction;

    fn try_from(code: u8) -> Result<Self, UnknownAction> {
        Ok(match code {
            0 => Action::Heartbeat,
            1 => Action::Ack,
            2 => Action::Nack,
            3 => Action::Connect,
            4 => Action::Connected,
            5 => Action::Disconnect,
            6 => Action::Disconnected,
            7 => Action::Close,
            8 => Action::Closed,
            9 => Action::Error,
            10 => Action::Attach,
            11 => Action::Attached,
            12 => Action::Detach,
            13 => Action::Detached,
            14 => Action::Presence,
            15 => Action::Message,
            16 => Action::Sync,
            17 => Action::Auth,
            other => return Err(UnknownAction(other)),
        })
    }
}

impl Action {
    /// Frames of these actions are assigned a `msgSerial` and wait for an
    /// ack or nack.
    pub fn is_ackable(self) -> bool {
        matches!(self, Action::Message | Action::Presence)
    }
}

/// Bit flags carried in [`ProtocolMessage::flags`](crate::ProtocolMessage).
pub mod flags {
    pub const HAS_PRESENCE: u32 = 1 << 0;
    pub const HAS_BACKLOG: u32 = 1 << 1;
    /// On `connected`/`attached`: the previous session continued.
    pub const RESUMED: u32 = 1 << 2;
    /// On `attach`: the client believes it is still attached.
    pub const ATTACH_RESUME: u32 = 1 << 5;
}
