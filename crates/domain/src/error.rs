use serde::{Deserialize, Serialize};

/// Numeric error codes carried in [`ErrorInfo::code`].
///
/// The 4xxxx range mirrors the server's HTTP-style codes; the 8xxxx range is
/// reserved for conditions the client detects on its own.
pub mod codes {
    pub const BAD_REQUEST: u32 = 40000;
    pub const INVALID_ARGUMENTS: u32 = 40003;
    pub const MAX_MESSAGE_LENGTH_EXCEEDED: u32 = 40009;
    pub const UNAUTHORIZED: u32 = 40100;
    pub const INVALID_CREDENTIALS: u32 = 40101;
    pub const INCOMPATIBLE_CREDENTIALS: u32 = 40102;
    pub const TOKEN_ERROR_UNSPECIFIED: u32 = 40140;
    pub const TOKEN_EXPIRED: u32 = 40142;
    pub const TOKEN_ERROR_MAX: u32 = 40149;
    pub const OPERATION_NOT_PERMITTED: u32 = 40160;
    pub const NO_MEANS_TO_RENEW_TOKEN: u32 = 40171;
    pub const FORBIDDEN: u32 = 40300;
    pub const INTERNAL: u32 = 50000;
    pub const TIMEOUT: u32 = 50003;
    pub const CONNECTION_FAILED: u32 = 80000;
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    pub const DISCONNECTED: u32 = 80003;
    pub const CONNECTION_RESUME_FAILED: u32 = 80008;
    pub const CONNECTION_TIMED_OUT: u32 = 80014;
    pub const CONNECTION_CLOSED: u32 = 80017;
    pub const CANCELLED: u32 = 80019;
    pub const CHANNEL_OPERATION_FAILED: u32 = 90000;
    pub const CHANNEL_INVALID_STATE: u32 = 90001;
    pub const CHANNEL_ATTACH_TIMEOUT: u32 = 90007;
}

/// Broad classification of an [`ErrorInfo`], used to decide how far an
/// error propagates (connection, channel, or a single call).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Dropped or timed-out transport; recoverable by reconnecting.
    Transport,
    /// Expired, invalid or unobtainable credentials.
    Auth,
    /// Malformed handshake or a fatal error frame from the server.
    Protocol,
    /// Operation denied for the current capability; scoped to one channel or call.
    Capability,
    /// Payload exceeds the negotiated size limit.
    TooLarge,
    /// Operation abandoned because the connection moved on.
    Cancelled,
    /// Client-side invariant break.
    Internal,
}

/// Error payload exchanged with the server and surfaced to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: u32,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_TIMED_OUT, 408, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(codes::CANCELLED, 400, message)
    }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_CLOSED, 400, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(codes::DISCONNECTED, 400, message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_FAILED, 500, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, 500, message)
    }

    /// Token errors (`40140..=40149`) are the only auth errors the client
    /// can recover from by fetching a fresh token.
    pub fn is_token_error(&self) -> bool {
        (codes::TOKEN_ERROR_UNSPECIFIED..=codes::TOKEN_ERROR_MAX).contains(&self.code)
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code {
            codes::MAX_MESSAGE_LENGTH_EXCEEDED => ErrorKind::TooLarge,
            codes::OPERATION_NOT_PERMITTED | codes::FORBIDDEN => ErrorKind::Capability,
            40100..=40199 => ErrorKind::Auth,
            codes::CANCELLED | codes::CONNECTION_CLOSED => ErrorKind::Cancelled,
            codes::DISCONNECTED
            | codes::CONNECTION_SUSPENDED
            | codes::CONNECTION_RESUME_FAILED
            | codes::CONNECTION_TIMED_OUT
            | codes::TIMEOUT => ErrorKind::Transport,
            codes::INTERNAL => ErrorKind::Internal,
            _ => ErrorKind::Protocol,
        }
    }
}
