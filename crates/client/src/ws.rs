//! WebSocket transport: one socket per connection attempt, JSON text frames.

use futures_util::{SinkExt, StreamExt};
use rt_domain::ErrorInfo;
use rt_protocol::ProtocolMessage;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::transport::{ConnectParams, Transport, TransportEvents, TransportFactory};

/// Inbound frames larger than this are dropped before parsing.
pub const DEFAULT_MAX_INBOUND_BYTES: usize = 1024 * 1024;

/// Opens [`WebSocketTransport`]s with `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    max_inbound_bytes: usize,
}

impl WebSocketTransportFactory {
    pub fn new() -> Self {
        Self {
            max_inbound_bytes: DEFAULT_MAX_INBOUND_BYTES,
        }
    }

    pub fn with_max_inbound_bytes(mut self, n: usize) -> Self {
        self.max_inbound_bytes = n;
        self
    }
}

impl Default for WebSocketTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn connect(&self, params: ConnectParams, events: TransportEvents) -> Box<dyn Transport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        match build_url(&params) {
            Ok(url) => {
                tokio::spawn(run_connection(
                    url,
                    events,
                    rx,
                    cancel.clone(),
                    self.max_inbound_bytes,
                ));
            }
            Err(e) => {
                tracing::warn!(transport_id = events.id(), endpoint = %params.endpoint, error = %e, "invalid endpoint");
                events.closed(Some(ErrorInfo::connection_failed(format!(
                    "invalid endpoint {}: {e}",
                    params.endpoint
                ))));
            }
        }
        Box::new(WebSocketTransport {
            tx: Some(tx),
            cancel,
        })
    }
}

/// Handle to a socket task spawned by [`WebSocketTransportFactory`].
pub struct WebSocketTransport {
    tx: Option<mpsc::UnboundedSender<ProtocolMessage>>,
    cancel: CancellationToken,
}

impl Transport for WebSocketTransport {
    fn send(&mut self, frame: ProtocolMessage) -> Result<(), ErrorInfo> {
        let Some(tx) = &self.tx else {
            return Err(ErrorInfo::disconnected("transport closed"));
        };
        tx.send(frame)
            .map_err(|_| ErrorInfo::disconnected("transport closed"))
    }

    fn close(&mut self) {
        // Dropping the sender lets the writer flush and send a close frame.
        self.tx.take();
        self.cancel.cancel();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Exit {
    Cancelled,
    Closed(Option<ErrorInfo>),
}

async fn run_connection(
    url: Url,
    events: TransportEvents,
    mut outbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    cancel: CancellationToken,
    max_inbound_bytes: usize,
) {
    let transport_id = events.id();
    tracing::debug!(transport_id, host = ?url.host_str(), "websocket connecting");

    let connected = tokio::select! {
        r = tokio_tungstenite::connect_async(url.as_str()) => r,
        _ = cancel.cancelled() => return,
    };
    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            tracing::warn!(transport_id, error = %e, "websocket connect failed");
            if !cancel.is_cancelled() {
                events.closed(Some(ErrorInfo::disconnected(format!(
                    "websocket connect failed: {e}"
                ))));
            }
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    // Writer task: encodes outbound frames onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let json = match rt_protocol::encode(&frame) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!(error = %e, action = ?frame.action, "failed to encode outbound frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(WsMessage::Close(None)).await;
    });

    // Reader loop: decode inbound frames and hand them to the worker.
    let exit = loop {
        let msg = tokio::select! {
            m = stream.next() => m,
            _ = cancel.cancelled() => break Exit::Cancelled,
        };
        match msg {
            Some(Ok(WsMessage::Text(text))) => {
                if text.len() > max_inbound_bytes {
                    tracing::warn!(
                        transport_id,
                        bytes = text.len(),
                        max = max_inbound_bytes,
                        "inbound frame exceeds limit, dropping"
                    );
                    continue;
                }
                match rt_protocol::decode(&text) {
                    Ok(frame) => events.frame(frame),
                    Err(e) => tracing::debug!(transport_id, error = %e, "failed to parse frame"),
                }
            }
            Some(Ok(WsMessage::Close(_))) => {
                tracing::info!(transport_id, "server closed websocket");
                break Exit::Closed(None);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                break Exit::Closed(Some(ErrorInfo::disconnected(format!(
                    "websocket error: {e}"
                ))))
            }
            None => break Exit::Closed(None),
        }
    };

    match exit {
        Exit::Cancelled => tracing::debug!(transport_id, "websocket closed by client"),
        Exit::Closed(err) => {
            writer.abort();
            if !cancel.is_cancelled() {
                events.closed(err);
            }
        }
    }
}

/// Connection URL with the session parameters in the query string.
/// Parameters already on the endpoint are kept; values are form-encoded.
pub fn build_url(params: &ConnectParams) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&params.endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("format", "json");
        match (&params.access_token, &params.key) {
            (Some(token), _) => {
                query.append_pair("access_token", token);
            }
            (None, Some(key)) => {
                query.append_pair("key", key);
            }
            (None, None) => {}
        }
        if let Some(client_id) = &params.client_id {
            query.append_pair("clientId", client_id);
        }
        if !params.echo {
            query.append_pair("echo", "false");
        }
        if let Some(resume) = &params.resume {
            query.append_pair("resume", resume);
            if let Some(serial) = params.connection_serial {
                query.append_pair("connectionSerial", &serial.to_string());
            }
        }
        if let Some(recover) = &params.recover {
            query.append_pair("recover", recover);
        }
    }
    Ok(url)
}
