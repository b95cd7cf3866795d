use std::sync::atomic::Ordering;

use rt_domain::{codes, ErrorInfo};
use rt_protocol::{Message, ProtocolMessage};

use super::Worker;
use crate::ack::{AckCallback, PendingMessage};
use crate::state::{ChannelState, ConnectionState};

/// Publish held back until the connection is usable.
pub(crate) struct QueuedPublish {
    pub channel: String,
    pub messages: Vec<Message>,
    pub callbacks: Vec<AckCallback>,
}

fn total_size(messages: &[Message]) -> usize {
    messages.iter().map(Message::size).sum()
}

impl Worker {
    pub(super) fn publish(&mut self, channel: String, messages: Vec<Message>, done: AckCallback) {
        if let Some(entry) = self.channels.get(&channel) {
            if matches!(entry.state, ChannelState::Suspended | ChannelState::Failed) {
                done(Err(ErrorInfo::new(
                    codes::CHANNEL_INVALID_STATE,
                    400,
                    format!("unable to publish in channel state {}", entry.state),
                )));
                return;
            }
        }

        match self.state {
            ConnectionState::Connected => self.send_publish(channel, messages, vec![done]),
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Disconnected => {
                if !self.options.queue_messages {
                    done(Err(self.state_error()));
                    return;
                }
                self.enqueue_publish(channel, messages, done);
            }
            _ => done(Err(self.state_error())),
        }
    }

    /// Queue a publish, folding it into the previous entry when both target
    /// the same channel and the merged batch still fits one frame.
    fn enqueue_publish(&mut self, channel: String, mut messages: Vec<Message>, done: AckCallback) {
        let max = self.shared.max_message_size.load(Ordering::Relaxed);
        if let Some(last) = self.queue.back_mut() {
            if last.channel == channel
                && total_size(&last.messages) + total_size(&messages) <= max
            {
                last.messages.append(&mut messages);
                last.callbacks.push(done);
                tracing::trace!(channel = %channel, batched = last.messages.len(), "publish merged into queued batch");
                return;
            }
        }
        tracing::debug!(channel = %channel, queued = self.queue.len() + 1, "publish queued");
        self.queue.push_back(QueuedPublish {
            channel,
            messages,
            callbacks: vec![done],
        });
    }

    fn send_publish(&mut self, channel: String, messages: Vec<Message>, callbacks: Vec<AckCallback>) {
        let mut frame = ProtocolMessage::publish(&channel, messages);
        let serial = self.ack.next_serial(1);
        frame.msg_serial = Some(serial);
        tracing::trace!(channel = %channel, msg_serial = serial, "publish sent");
        self.ack
            .enqueue(PendingMessage::new(serial, 1, frame.clone(), callbacks));
        // A send failure leaves the frame pending: it is resent on resume or
        // failed when the connection is not resumed.
        self.send_frame(frame);
    }

    pub(super) fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        tracing::debug!(count = self.queue.len(), "flushing queued publishes");
        while let Some(queued) = self.queue.pop_front() {
            self.send_publish(queued.channel, queued.messages, queued.callbacks);
        }
    }

    pub(super) fn fail_queue(&mut self, reason: &ErrorInfo) {
        for queued in self.queue.drain(..) {
            for cb in queued.callbacks {
                cb(Err(reason.clone()));
            }
        }
    }
}
