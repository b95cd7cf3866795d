//! Public channel handle.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rt_domain::ErrorInfo;
use rt_protocol::Message;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::ack::AckCallback;
use crate::events::Subscription;
use crate::idempotent;
use crate::shared::{ChannelShared, ConnectionShared};
use crate::state::{ChannelState, ChannelStateChange};
use crate::types::{Completion, RealtimeError};
use crate::worker::Command;

/// A named channel on a [`Realtime`](crate::Realtime) connection.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    connection: Arc<ConnectionShared>,
    tx: mpsc::UnboundedSender<Command>,
    idempotent_publishing: bool,
}

impl Channel {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        connection: Arc<ConnectionShared>,
        tx: mpsc::UnboundedSender<Command>,
        idempotent_publishing: bool,
    ) -> Self {
        Self {
            shared,
            connection,
            tx,
            idempotent_publishing,
        }
    }

    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            tracing::debug!(channel = %self.shared.name, "realtime worker gone; command dropped");
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ChannelState {
        self.shared.snapshot.borrow().state
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.snapshot.borrow().error_reason.clone()
    }

    /// Last channel serial received from the server.
    pub fn serial(&self) -> Option<String> {
        self.shared.snapshot.borrow().serial.clone()
    }

    /// Attach. Before the connection is up the request is held and sent
    /// once connected; calling this on a fresh client also connects it.
    pub fn attach(&self) -> Completion<()> {
        let (done, completion) = Completion::channel();
        self.send(Command::Attach {
            channel: self.shared.name.clone(),
            done,
        });
        completion
    }

    pub fn detach(&self) -> Completion<()> {
        let (done, completion) = Completion::channel();
        self.send(Command::Detach {
            channel: self.shared.name.clone(),
            done,
        });
        completion
    }

    /// Publish a batch. The completion resolves once the whole batch is
    /// acknowledged, or with the first error.
    ///
    /// Empty and oversized batches are rejected here and never queued.
    pub fn publish(&self, mut messages: Vec<Message>) -> Result<Completion<()>, RealtimeError> {
        if messages.is_empty() {
            return Err(RealtimeError::InvalidArgs(
                "publish requires at least one message".into(),
            ));
        }
        let size: usize = messages.iter().map(Message::size).sum();
        let max = self.connection.max_message_size.load(Ordering::Relaxed);
        if size > max {
            return Err(RealtimeError::MessageTooLarge { size, max });
        }
        if self.idempotent_publishing {
            idempotent::assign_ids(&mut messages, &idempotent::random_base());
        }

        let (resolver, completion) = Completion::channel();
        let done: AckCallback = Box::new(move |result| {
            let _ = resolver.send(result);
        });
        self.send(Command::Publish {
            channel: self.shared.name.clone(),
            messages,
            done,
        });
        Ok(completion)
    }

    pub fn publish_one(
        &self,
        name: impl Into<String>,
        data: Value,
    ) -> Result<Completion<()>, RealtimeError> {
        self.publish(vec![Message::new(name, data)])
    }

    /// Messages received while attached, in arrival order.
    pub fn subscribe(&self) -> Subscription<Message> {
        self.shared.messages.subscribe()
    }

    pub fn on_state_change(&self) -> Subscription<ChannelStateChange> {
        self.shared.events.subscribe()
    }

    /// Wait until the channel reaches `state`.
    pub async fn wait_for_state(&self, state: ChannelState) -> Result<(), RealtimeError> {
        let mut rx = self.shared.snapshot.subscribe();
        rx.wait_for(|s| s.state == state)
            .await
            .map(|_| ())
            .map_err(|_| RealtimeError::Shutdown)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}
