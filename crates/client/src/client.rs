//! Public connection handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rt_domain::{AuthOptions, ErrorInfo, TokenDetails, TokenParams};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::builder::RealtimeBuilder;
use crate::channel::Channel;
use crate::events::Subscription;
use crate::shared::{ChannelShared, ConnectionShared};
use crate::state::{ConnectionState, ConnectionStateChange};
use crate::types::{Completion, RealtimeError};
use crate::worker::Command;

/// A realtime client: one logical connection plus its channels.
///
/// Cloning is cheap and every clone drives the same connection. The
/// background worker stops once the last clone is dropped; anything still
/// waiting on it then resolves with [`RealtimeError::Shutdown`].
#[derive(Clone)]
pub struct Realtime {
    inner: Arc<RealtimeInner>,
}

struct RealtimeInner {
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<ConnectionShared>,
    channels: Mutex<HashMap<String, Channel>>,
    idempotent_publishing: bool,
    shutdown: CancellationToken,
}

impl Drop for RealtimeInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Realtime {
    /// Start a new builder.
    pub fn builder() -> RealtimeBuilder {
        RealtimeBuilder::new()
    }

    pub(crate) fn from_parts(
        tx: mpsc::UnboundedSender<Command>,
        shared: Arc<ConnectionShared>,
        idempotent_publishing: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RealtimeInner {
                tx,
                shared,
                channels: Mutex::new(HashMap::new()),
                idempotent_publishing,
                shutdown,
            }),
        }
    }

    fn send(&self, cmd: Command) {
        if self.inner.tx.send(cmd).is_err() {
            tracing::debug!("realtime worker gone; command dropped");
        }
    }

    // ── Connection ───────────────────────────────────────────────────

    /// Open the connection. A no-op while connecting or connected.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the connection. Pending publishes and auth upgrades fail.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    /// Obtain a fresh token and apply it to the connection.
    ///
    /// Concurrent calls share one upgrade. While connected the token is
    /// applied in place; the completion resolves once the server confirms.
    pub fn authorize(&self, params: TokenParams, options: AuthOptions) -> Completion<TokenDetails> {
        let (done, completion) = Completion::channel();
        self.send(Command::Authorize {
            params,
            options,
            done,
        });
        completion
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.snapshot.borrow().state
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.inner.shared.snapshot.borrow().error_reason.clone()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.inner.shared.snapshot.borrow().id.clone()
    }

    pub fn connection_key(&self) -> Option<String> {
        self.inner.shared.snapshot.borrow().key.clone()
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.shared.snapshot.borrow().client_id.clone()
    }

    /// `<connectionKey>:<connectionSerial>:<msgSerial>`; pass it as
    /// `recover` to a new client to continue this session.
    pub fn recovery_key(&self) -> Option<String> {
        self.inner.shared.snapshot.borrow().recovery_key.clone()
    }

    pub fn on_state_change(&self) -> Subscription<ConnectionStateChange> {
        self.inner.shared.events.subscribe()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<(), RealtimeError> {
        let mut rx = self.inner.shared.snapshot.subscribe();
        rx.wait_for(|s| s.state == state)
            .await
            .map(|_| ())
            .map_err(|_| RealtimeError::Shutdown)
    }

    // ── Channels ─────────────────────────────────────────────────────

    /// Get or create the channel called `name`.
    pub fn channel(&self, name: &str) -> Channel {
        let mut channels = self.inner.channels.lock();
        if let Some(channel) = channels.get(name) {
            return channel.clone();
        }
        let shared = Arc::new(ChannelShared::new(name));
        self.send(Command::RegisterChannel(shared.clone()));
        let channel = Channel::new(
            shared,
            self.inner.shared.clone(),
            self.inner.tx.clone(),
            self.inner.idempotent_publishing,
        );
        channels.insert(name.to_owned(), channel.clone());
        channel
    }

    /// Detach and forget the channel. Existing handles stop working.
    pub fn release(&self, name: &str) {
        if self.inner.channels.lock().remove(name).is_some() {
            self.send(Command::Release {
                channel: name.to_owned(),
            });
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
