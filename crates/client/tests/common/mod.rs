//! Shared harness: an in-test transport the tests drive frame by frame.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rt_client::{
    AuthOptions, ConnectParams, ConnectionState, ErrorInfo, ProtocolMessage,
    Realtime, RealtimeBuilder, TokenDetails, TokenParams, Transport, TransportEvents,
    TransportFactory,
};
use rt_protocol::ConnectionDetails;
use tokio::sync::mpsc;

/// Generous bound: tests run with paused time, so waiting is free, and it
/// must outlast every engine timer a test relies on.
pub const WAIT: Duration = Duration::from_secs(3600);

// ── Mock transport ──────────────────────────────────────────────────────

pub struct MockFactory {
    accepted: mpsc::UnboundedSender<MockConnection>,
}

/// The server side of every transport the client opens, in order.
pub struct MockServer {
    accepted: mpsc::UnboundedReceiver<MockConnection>,
}

pub fn mock_transport() -> (Arc<MockFactory>, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockFactory { accepted: tx }),
        MockServer { accepted: rx },
    )
}

impl TransportFactory for MockFactory {
    fn connect(&self, params: ConnectParams, events: TransportEvents) -> Box<dyn Transport> {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let _ = self.accepted.send(MockConnection {
            params,
            events,
            sent: sent_rx,
            closed: closed.clone(),
        });
        Box::new(MockTransport {
            sent: sent_tx,
            closed,
        })
    }
}

struct MockTransport {
    sent: mpsc::UnboundedSender<ProtocolMessage>,
    closed: Arc<AtomicBool>,
}

impl Transport for MockTransport {
    fn send(&mut self, frame: ProtocolMessage) -> Result<(), ErrorInfo> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ErrorInfo::disconnected("mock transport closed"));
        }
        self.sent
            .send(frame)
            .map_err(|_| ErrorInfo::disconnected("mock transport gone"))
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl MockServer {
    /// Next transport the client opened.
    pub async fn accept(&mut self) -> MockConnection {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection attempt")
            .expect("client gone")
    }

    pub fn try_accept(&mut self) -> Option<MockConnection> {
        self.accepted.try_recv().ok()
    }
}

pub struct MockConnection {
    pub params: ConnectParams,
    events: TransportEvents,
    sent: mpsc::UnboundedReceiver<ProtocolMessage>,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    pub fn deliver(&self, frame: ProtocolMessage) {
        self.events.frame(frame);
    }

    /// Complete the handshake.
    pub fn connected(&self, connection_id: &str, connection_key: &str) {
        self.connected_with(
            connection_id,
            ConnectionDetails {
                connection_key: Some(connection_key.into()),
                ..Default::default()
            },
        );
    }

    pub fn connected_with(&self, connection_id: &str, details: ConnectionDetails) {
        self.deliver(ProtocolMessage::connected(connection_id, details));
    }

    /// Simulate the socket going away.
    pub fn drop_connection(&self, error: Option<ErrorInfo>) {
        self.events.closed(error);
    }

    /// Next frame the client sent on this transport.
    pub async fn next_sent(&mut self) -> ProtocolMessage {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("transport dropped")
    }

    pub fn try_sent(&mut self) -> Option<ProtocolMessage> {
        self.sent.try_recv().ok()
    }

    /// Whether the client has torn this transport down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ── Authenticator ───────────────────────────────────────────────────────

/// Hands out `tok-1`, `tok-2`, … and counts requests.
#[derive(Default)]
pub struct CountingAuthenticator {
    pub calls: AtomicU32,
}

#[async_trait::async_trait]
impl rt_client::Authenticator for CountingAuthenticator {
    async fn request_token(
        &self,
        params: &TokenParams,
        _options: &AuthOptions,
    ) -> Result<TokenDetails, ErrorInfo> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut token = TokenDetails::from_token(format!("tok-{n}"));
        token.client_id = params.client_id.clone();
        Ok(token)
    }
}

impl CountingAuthenticator {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

// ── Client helpers ──────────────────────────────────────────────────────

/// Client on a mock transport with key auth and default settings.
pub fn client(factory: Arc<MockFactory>) -> RealtimeBuilder {
    Realtime::builder()
        .endpoint("wss://rt.test")
        .key("app.k:secret")
        .transport(factory)
}

/// Build a client and complete its first handshake as `conn-1` / `key-1`.
pub async fn connected_client(builder: RealtimeBuilder, server: &mut MockServer) -> (Realtime, MockConnection) {
    let client = builder.build().expect("client builds");
    let conn = server.accept().await;
    conn.connected("conn-1", "key-1");
    wait_for_state(&client, ConnectionState::Connected).await;
    (client, conn)
}

pub async fn wait_for_state(client: &Realtime, state: ConnectionState) {
    tokio::time::timeout(WAIT, client.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("client shut down");
}
