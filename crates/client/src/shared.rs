//! State the worker publishes for the public handles to read.

use std::sync::atomic::AtomicUsize;

use rt_domain::ErrorInfo;
use rt_protocol::Message;
use tokio::sync::watch;

use crate::events::EventEmitter;
use crate::state::{ChannelState, ChannelStateChange, ConnectionState, ConnectionStateChange};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub error_reason: Option<ErrorInfo>,
    pub id: Option<String>,
    pub key: Option<String>,
    pub client_id: Option<String>,
    pub recovery_key: Option<String>,
}

pub(crate) struct ConnectionShared {
    pub snapshot: watch::Sender<ConnectionSnapshot>,
    pub events: EventEmitter<ConnectionStateChange>,
    /// Negotiated limit; the server may lower or raise it on `connected`.
    pub max_message_size: AtomicUsize,
}

impl ConnectionShared {
    pub(crate) fn new(max_message_size: usize, client_id: Option<String>) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot {
            state: ConnectionState::Initialized,
            error_reason: None,
            id: None,
            key: None,
            client_id,
            recovery_key: None,
        });
        Self {
            snapshot,
            events: EventEmitter::new(),
            max_message_size: AtomicUsize::new(max_message_size),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChannelSnapshot {
    pub state: ChannelState,
    pub error_reason: Option<ErrorInfo>,
    pub serial: Option<String>,
}

pub(crate) struct ChannelShared {
    pub name: String,
    pub snapshot: watch::Sender<ChannelSnapshot>,
    pub events: EventEmitter<ChannelStateChange>,
    pub messages: EventEmitter<Message>,
}

impl ChannelShared {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (snapshot, _) = watch::channel(ChannelSnapshot {
            state: ChannelState::Initialized,
            error_reason: None,
            serial: None,
        });
        Self {
            name: name.into(),
            snapshot,
            events: EventEmitter::new(),
            messages: EventEmitter::new(),
        }
    }
}
