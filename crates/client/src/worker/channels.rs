//! Per-channel attach/detach lifecycle, driven by the connection worker.

use std::sync::Arc;

use rt_domain::{codes, ErrorInfo, ErrorKind};
use rt_protocol::{flags, Action, ProtocolMessage};

use super::{TimerKind, Worker};
use crate::retry::{RetryDelayCalculator, RetryScheduler};
use crate::shared::{ChannelShared, ChannelSnapshot};
use crate::state::{ChannelEvent, ChannelState, ChannelStateChange, ConnectionState};
use crate::types::{Completion, Resolver};

pub(crate) struct ChannelEntry {
    shared: Arc<ChannelShared>,
    pub(super) state: ChannelState,
    error_reason: Option<ErrorInfo>,
    serial: Option<String>,
    attach_waiters: Vec<Resolver<()>>,
    detach_waiters: Vec<Resolver<()>>,
    /// `attach()` was called while the connection was not yet connected.
    pending_attach: bool,
    /// Set after the first successful attach on the current session.
    attach_resume: bool,
    release_when_detached: bool,
    retry: RetryScheduler,
}

impl ChannelEntry {
    fn new(shared: Arc<ChannelShared>, retry_delay: Arc<dyn RetryDelayCalculator>) -> Self {
        Self {
            shared,
            state: ChannelState::Initialized,
            error_reason: None,
            serial: None,
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            pending_attach: false,
            attach_resume: false,
            release_when_detached: false,
            retry: RetryScheduler::new(retry_delay),
        }
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn set_state(&mut self, next: ChannelState, reason: Option<ErrorInfo>, resumed: bool) {
        let previous = self.state;
        self.state = next;
        if reason.is_some() || next == ChannelState::Attached {
            self.error_reason = reason.clone();
        }
        if !matches!(next, ChannelState::Attaching | ChannelState::Suspended) {
            self.retry.reset();
        }
        tracing::debug!(
            channel = %self.name(),
            from = %previous,
            to = %next,
            code = reason.as_ref().map(|r| r.code),
            "channel state change"
        );
        self.shared.events.emit(ChannelStateChange {
            previous,
            current: next,
            event: next.into(),
            reason,
            resumed,
        });
        self.publish_snapshot();
    }

    fn emit_update(&mut self, reason: Option<ErrorInfo>, resumed: bool) {
        if reason.is_some() {
            self.error_reason = reason.clone();
        }
        self.shared.events.emit(ChannelStateChange {
            previous: self.state,
            current: self.state,
            event: ChannelEvent::Update,
            reason,
            resumed,
        });
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let snapshot = ChannelSnapshot {
            state: self.state,
            error_reason: self.error_reason.clone(),
            serial: self.serial.clone(),
        };
        self.shared.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn resolve_attach(&mut self, result: Result<(), ErrorInfo>) {
        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn resolve_detach(&mut self, result: Result<(), ErrorInfo>) {
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    /// Drop a queued attach request, failing whoever waits on it.
    fn cancel_pending_attach(&mut self, reason: &ErrorInfo) {
        if std::mem::take(&mut self.pending_attach) {
            self.resolve_attach(Err(reason.clone()));
        }
    }
}

fn released(name: &str) -> ErrorInfo {
    ErrorInfo::new(
        codes::CHANNEL_OPERATION_FAILED,
        400,
        format!("channel {name} has been released"),
    )
}

impl Worker {
    pub(super) fn register_channel(&mut self, shared: Arc<ChannelShared>) {
        let name = shared.name.clone();
        match self.channels.get_mut(&name) {
            Some(entry) => {
                entry.shared = shared;
                entry.release_when_detached = false;
                entry.publish_snapshot();
            }
            None => {
                tracing::debug!(channel = %name, "channel registered");
                let entry = ChannelEntry::new(shared, self.channel_retry_delay.clone());
                self.channels.insert(name, entry);
            }
        }
    }

    // ── Caller operations ───────────────────────────────────────────

    pub(super) fn attach_channel(&mut self, name: &str, done: Resolver<()>) {
        let connection = self.state;
        let state_error = self.state_error();
        let Some(entry) = self.channels.get_mut(name) else {
            let _ = done.send(Err(released(name)));
            return;
        };
        entry.release_when_detached = false;

        match entry.state {
            ChannelState::Attached => {
                let _ = done.send(Ok(()));
                return;
            }
            ChannelState::Attaching => {
                entry.attach_waiters.push(done);
                return;
            }
            ChannelState::Detaching => {
                entry.resolve_detach(Err(ErrorInfo::new(
                    codes::CHANNEL_OPERATION_FAILED,
                    400,
                    "detach superseded by attach",
                )));
            }
            _ => {}
        }

        match connection {
            ConnectionState::Connected => {
                entry.attach_waiters.push(done);
                self.send_attach(name);
            }
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Disconnected => {
                tracing::debug!(channel = %name, connection = %connection, "attach queued until connected");
                entry.pending_attach = true;
                entry.attach_waiters.push(done);
                if connection == ConnectionState::Initialized {
                    self.connect();
                }
            }
            _ => {
                let _ = done.send(Err(state_error));
            }
        }
    }

    pub(super) fn detach_channel(&mut self, name: &str, done: Resolver<()>) {
        let connected = self.state == ConnectionState::Connected;
        let Some(entry) = self.channels.get_mut(name) else {
            let _ = done.send(Ok(()));
            return;
        };
        let superseded = ErrorInfo::new(
            codes::CHANNEL_OPERATION_FAILED,
            400,
            "attach superseded by detach",
        );
        entry.cancel_pending_attach(&superseded);

        match entry.state {
            ChannelState::Initialized | ChannelState::Detached => {
                let _ = done.send(Ok(()));
            }
            ChannelState::Detaching => entry.detach_waiters.push(done),
            ChannelState::Failed => {
                let err = entry.error_reason.clone().unwrap_or_else(|| {
                    ErrorInfo::new(codes::CHANNEL_INVALID_STATE, 400, "channel failed")
                });
                let _ = done.send(Err(err));
            }
            ChannelState::Suspended => {
                entry.set_state(ChannelState::Detached, None, false);
                let _ = done.send(Ok(()));
                self.timers.cancel_channel(name);
            }
            ChannelState::Attaching | ChannelState::Attached => {
                entry.resolve_attach(Err(superseded));
                if connected {
                    entry.detach_waiters.push(done);
                    entry.set_state(ChannelState::Detaching, None, false);
                    self.timers.cancel_channel(name);
                    self.timers.start(
                        TimerKind::DetachTimeout(name.to_owned()),
                        self.options.realtime_request_timeout(),
                    );
                    self.send_frame(ProtocolMessage::detach(name));
                } else {
                    entry.set_state(ChannelState::Detached, None, false);
                    let _ = done.send(Ok(()));
                    self.timers.cancel_channel(name);
                }
            }
        }
        self.maybe_release(name);
    }

    pub(super) fn release_channel(&mut self, name: &str) {
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        entry.release_when_detached = true;
        let (done, _ignored) = Completion::channel();
        self.detach_channel(name, done);
    }

    fn maybe_release(&mut self, name: &str) {
        let releasable = self.channels.get(name).is_some_and(|entry| {
            entry.release_when_detached
                && matches!(
                    entry.state,
                    ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
                )
        });
        if !releasable {
            return;
        }
        self.timers.cancel_channel(name);
        if let Some(mut entry) = self.channels.remove(name) {
            entry.resolve_attach(Err(released(name)));
            entry.resolve_detach(Ok(()));
            tracing::debug!(channel = %name, "channel released");
        }
    }

    fn send_attach(&mut self, name: &str) {
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        entry.pending_attach = false;
        let mut frame = ProtocolMessage::attach(name);
        if entry.attach_resume {
            frame = frame.with_flag(flags::ATTACH_RESUME);
        }
        frame.channel_serial = entry.serial.clone();
        if entry.state != ChannelState::Attaching {
            let reason = entry.error_reason.clone().filter(|_| entry.state == ChannelState::Suspended);
            entry.set_state(ChannelState::Attaching, reason, false);
        }
        self.timers.cancel_channel(name);
        self.timers.start(
            TimerKind::AttachTimeout(name.to_owned()),
            self.options.realtime_request_timeout(),
        );
        self.send_frame(frame);
    }

    /// Attach failed without the channel being at fault: suspend it and
    /// retry with channel backoff.
    fn channel_attach_failed(&mut self, name: &str, reason: ErrorInfo) {
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        entry.set_state(ChannelState::Suspended, Some(reason.clone()), false);
        entry.resolve_attach(Err(reason.clone()));
        let attempt = entry.retry.record_attempt();
        tracing::warn!(
            channel = %name,
            attempt = attempt.number,
            code = reason.code,
            retry_in_ms = attempt.delay.as_millis() as u64,
            "channel attach failed"
        );
        self.timers.cancel_channel(name);
        self.timers
            .start(TimerKind::ChannelRetry(name.to_owned()), attempt.delay);
    }

    fn fail_channel(&mut self, name: &str, reason: ErrorInfo) {
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        tracing::warn!(channel = %name, code = reason.code, error = %reason, "channel failed");
        entry.pending_attach = false;
        entry.set_state(ChannelState::Failed, Some(reason.clone()), false);
        entry.resolve_attach(Err(reason.clone()));
        entry.resolve_detach(Err(reason));
        self.timers.cancel_channel(name);
        self.maybe_release(name);
    }

    // ── Inbound frames ──────────────────────────────────────────────

    pub(super) fn on_channel_frame(&mut self, frame: ProtocolMessage) {
        let Some(name) = frame.channel.clone() else {
            tracing::warn!(action = ?frame.action, "channel frame without a channel name");
            return;
        };
        if !self.channels.contains_key(&name) {
            tracing::debug!(channel = %name, action = ?frame.action, "frame for unknown channel dropped");
            return;
        }
        match frame.action {
            Action::Attached => self.on_attached(&name, frame),
            Action::Detached => self.on_detached(&name, frame),
            Action::Message => self.on_channel_messages(&name, frame),
            Action::Presence | Action::Sync => {
                tracing::trace!(channel = %name, action = ?frame.action, "presence frame not tracked")
            }
            _ => {}
        }
    }

    /// Channel-scoped `error` frame: the channel fails, the connection is
    /// unaffected.
    pub(super) fn on_channel_error(&mut self, frame: ProtocolMessage) {
        let Some(name) = frame.channel else {
            return;
        };
        let reason = frame
            .error
            .unwrap_or_else(|| ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, 500, "channel error"));
        self.fail_channel(&name, reason);
    }

    fn on_attached(&mut self, name: &str, frame: ProtocolMessage) {
        let resumed = frame.has_flag(flags::RESUMED);
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        if let Some(serial) = frame.channel_serial {
            entry.serial = Some(serial);
        }
        match entry.state {
            ChannelState::Attaching => {
                entry.attach_resume = true;
                entry.set_state(ChannelState::Attached, frame.error, resumed);
                entry.resolve_attach(Ok(()));
                self.timers.cancel_channel(name);
            }
            ChannelState::Attached => entry.emit_update(frame.error, resumed),
            other => {
                tracing::debug!(channel = %name, state = %other, "unexpected attached ignored");
            }
        }
    }

    fn on_detached(&mut self, name: &str, frame: ProtocolMessage) {
        let connected = self.state == ConnectionState::Connected;
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        match entry.state {
            ChannelState::Detaching => {
                entry.set_state(ChannelState::Detached, frame.error, false);
                entry.resolve_detach(Ok(()));
                self.timers.cancel_channel(name);
                self.maybe_release(name);
            }
            ChannelState::Attached if connected => {
                tracing::info!(channel = %name, code = frame.error.as_ref().map(|e| e.code), "server detached channel; reattaching");
                entry.set_state(ChannelState::Attaching, frame.error, false);
                self.send_attach(name);
            }
            ChannelState::Attaching => {
                let reason = frame.error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, 500, "attach rejected")
                });
                if reason.kind() == ErrorKind::Capability {
                    self.fail_channel(name, reason);
                } else {
                    self.channel_attach_failed(name, reason);
                }
            }
            other => {
                tracing::debug!(channel = %name, state = %other, "unexpected detached ignored");
            }
        }
    }

    fn on_channel_messages(&mut self, name: &str, frame: ProtocolMessage) {
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        if entry.state != ChannelState::Attached {
            tracing::debug!(channel = %name, state = %entry.state, "message on unattached channel dropped");
            return;
        }
        if let Some(serial) = frame.channel_serial {
            entry.serial = Some(serial);
            entry.publish_snapshot();
        }
        for (i, mut message) in frame.messages.into_iter().enumerate() {
            if message.id.is_none() {
                message.id = frame.id.as_ref().map(|id| format!("{id}:{i}"));
            }
            if message.connection_id.is_none() {
                message.connection_id = frame.connection_id.clone();
            }
            if message.timestamp.is_none() {
                message.timestamp = frame.timestamp;
            }
            entry.shared.messages.emit(message);
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    pub(super) fn on_attach_timeout(&mut self, name: &str) {
        if self.channels.get(name).map(|e| e.state) == Some(ChannelState::Attaching) {
            self.channel_attach_failed(
                name,
                ErrorInfo::new(codes::CHANNEL_ATTACH_TIMEOUT, 408, "channel attach timed out"),
            );
        }
    }

    pub(super) fn on_detach_timeout(&mut self, name: &str) {
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        if entry.state != ChannelState::Detaching {
            return;
        }
        let reason = ErrorInfo::timed_out("channel detach timed out");
        tracing::warn!(channel = %name, "detach not confirmed in time");
        entry.set_state(ChannelState::Attached, Some(reason.clone()), false);
        entry.resolve_detach(Err(reason));
    }

    pub(super) fn on_channel_retry(&mut self, name: &str) {
        let suspended = self.channels.get(name).map(|e| e.state) == Some(ChannelState::Suspended);
        if suspended && self.state == ConnectionState::Connected {
            self.send_attach(name);
        }
    }

    // ── Connection transitions ──────────────────────────────────────

    pub(super) fn channels_on_connected(&mut self, resumed: bool) {
        let mut to_attach = Vec::new();
        for (name, entry) in self.channels.iter_mut() {
            if !resumed {
                entry.attach_resume = false;
            }
            if entry.pending_attach
                || matches!(entry.state, ChannelState::Attaching | ChannelState::Suspended)
            {
                to_attach.push(name.clone());
            }
        }
        for name in to_attach {
            self.send_attach(&name);
        }
    }

    pub(super) fn channels_on_connection_interrupted(
        &mut self,
        connection: ConnectionState,
        reason: &ErrorInfo,
    ) {
        let suspended = connection == ConnectionState::Suspended;
        for entry in self.channels.values_mut() {
            match entry.state {
                ChannelState::Attached | ChannelState::Attaching => {
                    entry.set_state(ChannelState::Suspended, Some(reason.clone()), false);
                }
                ChannelState::Detaching => {
                    entry.set_state(ChannelState::Detached, None, false);
                    entry.resolve_detach(Ok(()));
                }
                _ => {}
            }
            if suspended {
                entry.pending_attach = false;
                entry.resolve_attach(Err(reason.clone()));
            }
        }
        self.timers.cancel_all_channels();
        self.release_detached();
    }

    pub(super) fn channels_on_connection_failed(&mut self, reason: &ErrorInfo) {
        for entry in self.channels.values_mut() {
            match entry.state {
                ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended => {
                    entry.set_state(ChannelState::Failed, Some(reason.clone()), false);
                }
                ChannelState::Detaching => {
                    entry.set_state(ChannelState::Detached, None, false);
                    entry.resolve_detach(Ok(()));
                }
                _ => {}
            }
            entry.pending_attach = false;
            entry.resolve_attach(Err(reason.clone()));
        }
        self.timers.cancel_all_channels();
        self.release_detached();
    }

    pub(super) fn channels_on_connection_closed(&mut self) {
        let reason = ErrorInfo::connection_closed("connection closed");
        for entry in self.channels.values_mut() {
            if matches!(
                entry.state,
                ChannelState::Attaching
                    | ChannelState::Attached
                    | ChannelState::Suspended
                    | ChannelState::Detaching
            ) {
                entry.set_state(ChannelState::Detached, None, false);
            }
            entry.pending_attach = false;
            entry.resolve_attach(Err(reason.clone()));
            entry.resolve_detach(Ok(()));
        }
        self.timers.cancel_all_channels();
        self.release_detached();
    }

    pub(super) fn channels_on_shutdown(&mut self, reason: &ErrorInfo) {
        for entry in self.channels.values_mut() {
            entry.resolve_attach(Err(reason.clone()));
            entry.resolve_detach(Err(reason.clone()));
        }
    }

    fn release_detached(&mut self) {
        let flagged: Vec<String> = self
            .channels
            .values()
            .filter(|e| e.release_when_detached)
            .map(|e| e.name().to_owned())
            .collect();
        for name in flagged {
            self.maybe_release(&name);
        }
    }
}
