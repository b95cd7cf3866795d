//! Transport seam. A transport carries encoded frames for exactly one
//! connection attempt; the worker creates a fresh one per attempt and tears
//! the old one down first.

use rt_domain::ErrorInfo;
use rt_protocol::ProtocolMessage;
use tokio::sync::mpsc;

use crate::worker::Command;

/// Everything a transport needs to open a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub endpoint: String,
    /// Basic auth; only set when no token is available.
    pub key: Option<String>,
    pub access_token: Option<String>,
    pub client_id: Option<String>,
    pub echo: bool,
    /// Connection key of the session to resume.
    pub resume: Option<String>,
    pub connection_serial: Option<i64>,
    /// Recovery key from a previous client instance.
    pub recover: Option<String>,
}

/// What a transport reports back to the worker.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Frame(ProtocolMessage),
    /// The transport is gone. `None` means a clean close.
    Closed(Option<ErrorInfo>),
}

/// Push-style sink for one transport's events. Events from a transport the
/// worker has already replaced are dropped by the worker.
#[derive(Clone)]
pub struct TransportEvents {
    id: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl TransportEvents {
    pub(crate) fn new(id: u64, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn frame(&self, frame: ProtocolMessage) {
        self.post(TransportEvent::Frame(frame));
    }

    pub fn closed(&self, error: Option<ErrorInfo>) {
        self.post(TransportEvent::Closed(error));
    }

    fn post(&self, event: TransportEvent) {
        if self
            .tx
            .send(Command::Transport { id: self.id, event })
            .is_err()
        {
            tracing::trace!(transport_id = self.id, "worker gone; transport event dropped");
        }
    }
}

/// Outbound half of a live transport.
pub trait Transport: Send {
    fn send(&mut self, frame: ProtocolMessage) -> Result<(), ErrorInfo>;

    /// Close gracefully. No further events need to be reported.
    fn close(&mut self);
}

/// Opens transports. `connect` must not block: connection progress and
/// failure are reported through `events`.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, params: ConnectParams, events: TransportEvents) -> Box<dyn Transport>;
}
