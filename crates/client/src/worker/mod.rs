//! The connection worker: a single task that owns the connection, the ack
//! tracker, the auth coordinator and every channel state machine.
//!
//! Public handles talk to it exclusively through [`Command`]s; transports,
//! timers and token fetches post their results back the same way, so all
//! state changes happen in one place and in arrival order.

mod channels;
mod publish;
mod timers;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rt_domain::{codes, AuthOptions, ClientOptions, ErrorInfo, TokenDetails, TokenParams};
use rt_protocol::{Action, Message, ProtocolMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ack::{AckCallback, AckTracker};
use crate::auth::{AuthCoordinator, Authenticator, Join, UpgradeStage};
use crate::recovery::RecoveryKey;
use crate::retry::{FixedDelay, RetryDelayCalculator, RetryScheduler};
use crate::shared::{ChannelShared, ConnectionShared, ConnectionSnapshot};
use crate::state::{ConnectionEvent, ConnectionState, ConnectionStateChange};
use crate::timer::Scheduler;
use crate::transport::{ConnectParams, Transport, TransportEvent, TransportEvents, TransportFactory};
use crate::types::Resolver;

use channels::ChannelEntry;
use publish::QueuedPublish;
pub(crate) use timers::TimerKind;
use timers::Timers;

pub(crate) enum Command {
    Connect,
    Close,
    Authorize {
        params: TokenParams,
        options: AuthOptions,
        done: Resolver<TokenDetails>,
    },
    Publish {
        channel: String,
        messages: Vec<Message>,
        done: AckCallback,
    },
    RegisterChannel(Arc<ChannelShared>),
    Attach {
        channel: String,
        done: Resolver<()>,
    },
    Detach {
        channel: String,
        done: Resolver<()>,
    },
    Release {
        channel: String,
    },
    Transport {
        id: u64,
        event: TransportEvent,
    },
    TimerFired {
        kind: TimerKind,
        generation: u64,
    },
    TokenFetched {
        generation: u64,
        result: Result<TokenDetails, ErrorInfo>,
    },
}

/// Collaborators and settings the worker is built from.
pub(crate) struct WorkerConfig {
    pub options: ClientOptions,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub transport: Arc<dyn TransportFactory>,
    pub scheduler: Arc<dyn Scheduler>,
    pub retry_delay: Arc<dyn RetryDelayCalculator>,
    pub channel_retry_delay: Arc<dyn RetryDelayCalculator>,
}

struct ActiveTransport {
    id: u64,
    inner: Box<dyn Transport>,
}

/// Connection timers; channel timers are handled in `channels`.
const CONNECTION_TIMERS: [TimerKind; 7] = [
    TimerKind::ConnectRetry,
    TimerKind::SuspendedRetry,
    TimerKind::ConnectTimeout,
    TimerKind::StateTtl,
    TimerKind::CloseTimeout,
    TimerKind::Idle,
    TimerKind::AuthTimeout,
];

pub(crate) struct Worker {
    options: ClientOptions,
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    shared: Arc<ConnectionShared>,

    factory: Arc<dyn TransportFactory>,
    transport: Option<ActiveTransport>,
    next_transport_id: u64,

    state: ConnectionState,
    error_reason: Option<ErrorInfo>,
    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: Option<i64>,
    client_id: Option<String>,
    connection_state_ttl: Duration,
    max_idle_interval: Option<Duration>,
    /// Set once the state TTL has elapsed (or the connection was
    /// suspended): the next failed attempt goes to suspended.
    suspend_on_failure: bool,
    /// The running connect attempt is blocked on a token fetch.
    connect_awaits_token: bool,
    auth_attempts: u32,
    pending_recover: Option<RecoveryKey>,

    ack: AckTracker,
    queue: VecDeque<QueuedPublish>,
    auth: AuthCoordinator,
    connect_retry: RetryScheduler,
    suspended_retry: RetryScheduler,
    channel_retry_delay: Arc<dyn RetryDelayCalculator>,
    timers: Timers,
    channels: BTreeMap<String, ChannelEntry>,
}

impl Worker {
    pub(crate) fn new(
        config: WorkerConfig,
        shared: Arc<ConnectionShared>,
        tx: mpsc::UnboundedSender<Command>,
        rx: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) -> Self {
        let WorkerConfig {
            options,
            authenticator,
            transport,
            scheduler,
            retry_delay,
            channel_retry_delay,
        } = config;

        let mut ack = AckTracker::new();
        let pending_recover = options.recover.as_deref().and_then(|raw| {
            match raw.parse::<RecoveryKey>() {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring invalid recovery key");
                    None
                }
            }
        });
        if let Some(key) = &pending_recover {
            ack.set_msg_serial(key.msg_serial);
        }

        let suspended_delay: Arc<dyn RetryDelayCalculator> =
            Arc::new(FixedDelay(options.suspended_retry_timeout()));

        Self {
            auth: AuthCoordinator::new(authenticator, options.token.clone()),
            connect_retry: RetryScheduler::new(retry_delay),
            suspended_retry: RetryScheduler::new(suspended_delay),
            channel_retry_delay,
            timers: Timers::new(scheduler, tx.clone()),
            client_id: options.client_id.clone(),
            connection_state_ttl: options.connection_state_ttl(),
            connection_serial: pending_recover.as_ref().map(|k| k.connection_serial),
            pending_recover,
            ack,
            options,
            rx,
            tx,
            shutdown,
            shared,
            factory: transport,
            transport: None,
            next_transport_id: 0,
            state: ConnectionState::Initialized,
            error_reason: None,
            connection_id: None,
            connection_key: None,
            max_idle_interval: None,
            suspend_on_failure: false,
            connect_awaits_token: false,
            auth_attempts: 0,
            queue: VecDeque::new(),
            channels: BTreeMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!("realtime worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        self.handle(cmd);
                        self.publish_snapshot();
                    }
                    None => break,
                },
            }
        }
        self.teardown();
        tracing::debug!("realtime worker stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect(),
            Command::Close => self.close(),
            Command::Authorize {
                params,
                options,
                done,
            } => self.authorize(params, options, done),
            Command::Publish {
                channel,
                messages,
                done,
            } => self.publish(channel, messages, done),
            Command::RegisterChannel(shared) => self.register_channel(shared),
            Command::Attach { channel, done } => self.attach_channel(&channel, done),
            Command::Detach { channel, done } => self.detach_channel(&channel, done),
            Command::Release { channel } => self.release_channel(&channel),
            Command::Transport { id, event } => self.on_transport_event(id, event),
            Command::TimerFired { kind, generation } => self.on_timer(kind, generation),
            Command::TokenFetched { generation, result } => {
                self.on_token_fetched(generation, result)
            }
        }
    }

    /// Client dropped: release everything still waiting on the worker.
    fn teardown(&mut self) {
        let reason = ErrorInfo::cancelled("client shut down");
        self.drop_transport();
        self.timers.cancel_all();
        self.ack.fail_all(&reason);
        self.fail_queue(&reason);
        self.auth.complete(Err(reason.clone()));
        self.channels_on_shutdown(&reason);
    }

    // ── State bookkeeping ───────────────────────────────────────────

    fn set_state(
        &mut self,
        next: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
        resumed: bool,
    ) {
        let previous = self.state;
        self.state = next;
        if reason.is_some() || next == ConnectionState::Connected {
            self.error_reason = reason.clone();
        }
        if !matches!(next, ConnectionState::Connecting | ConnectionState::Disconnected) {
            self.connect_retry.reset();
        }
        if !matches!(next, ConnectionState::Connecting | ConnectionState::Suspended) {
            self.suspended_retry.reset();
        }

        tracing::debug!(
            from = %previous,
            to = %next,
            code = reason.as_ref().map(|r| r.code),
            retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
            "connection state change"
        );
        self.shared.events.emit(ConnectionStateChange {
            previous,
            current: next,
            event: next.into(),
            reason,
            retry_in,
            resumed,
        });
        self.publish_snapshot();
        self.auth.connection_transitioned(next, self.error_reason.as_ref());
    }

    fn emit_update(&mut self, reason: Option<ErrorInfo>) {
        self.error_reason = reason.clone();
        self.shared.events.emit(ConnectionStateChange {
            previous: ConnectionState::Connected,
            current: ConnectionState::Connected,
            event: ConnectionEvent::Update,
            reason,
            retry_in: None,
            resumed: false,
        });
    }

    fn publish_snapshot(&self) {
        let snapshot = ConnectionSnapshot {
            state: self.state,
            error_reason: self.error_reason.clone(),
            id: self.connection_id.clone(),
            key: self.connection_key.clone(),
            client_id: self.client_id.clone(),
            recovery_key: self.recovery_key(),
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

    fn recovery_key(&self) -> Option<String> {
        if self.state.is_unrecoverable() {
            return None;
        }
        let key = self.connection_key.as_ref()?;
        Some(
            RecoveryKey {
                connection_key: key.clone(),
                connection_serial: self.connection_serial.unwrap_or(-1),
                msg_serial: self.ack.msg_serial(),
            }
            .to_string(),
        )
    }

    /// Error handed to operations the current state cannot serve.
    fn state_error(&self) -> ErrorInfo {
        match self.state {
            ConnectionState::Suspended => {
                ErrorInfo::new(codes::CONNECTION_SUSPENDED, 400, "connection suspended")
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                ErrorInfo::connection_closed("connection closed")
            }
            ConnectionState::Failed => self
                .error_reason
                .clone()
                .unwrap_or_else(|| ErrorInfo::connection_failed("connection failed")),
            other => ErrorInfo::disconnected(format!("connection {other}")),
        }
    }

    // ── Transport plumbing ──────────────────────────────────────────

    fn open_transport(&mut self) {
        self.drop_transport();
        self.next_transport_id += 1;
        let id = self.next_transport_id;

        let access_token = self.auth.access_token().map(str::to_owned);
        let resume = self.connection_key.clone();
        let params = ConnectParams {
            endpoint: self.options.endpoint.clone(),
            key: match access_token {
                Some(_) => None,
                None => self.options.key.clone(),
            },
            access_token,
            client_id: self.options.client_id.clone(),
            echo: self.options.echo_messages,
            connection_serial: resume.as_ref().and(self.connection_serial),
            recover: match resume {
                Some(_) => None,
                None => self.pending_recover.as_ref().map(ToString::to_string),
            },
            resume,
        };
        tracing::info!(
            transport_id = id,
            endpoint = %params.endpoint,
            resume = params.resume.is_some(),
            recover = params.recover.is_some(),
            "opening transport"
        );
        let inner = self
            .factory
            .connect(params, TransportEvents::new(id, self.tx.clone()));
        self.transport = Some(ActiveTransport { id, inner });
    }

    fn drop_transport(&mut self) {
        if let Some(mut t) = self.transport.take() {
            tracing::debug!(transport_id = t.id, "closing transport");
            t.inner.close();
        }
    }

    fn send_frame(&mut self, frame: ProtocolMessage) -> bool {
        let Some(t) = self.transport.as_mut() else {
            tracing::debug!(action = ?frame.action, "no transport; frame not sent");
            return false;
        };
        match t.inner.send(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(transport_id = t.id, error = %e, "transport send failed");
                false
            }
        }
    }

    fn on_transport_event(&mut self, id: u64, event: TransportEvent) {
        if self.transport.as_ref().map(|t| t.id) != Some(id) {
            tracing::warn!(transport_id = id, "event from stale transport ignored");
            return;
        }
        match event {
            TransportEvent::Frame(frame) => self.on_frame(frame),
            TransportEvent::Closed(err) => {
                self.transport = None;
                let reason = err.unwrap_or_else(|| ErrorInfo::disconnected("transport closed"));
                match self.state {
                    ConnectionState::Connected => {
                        tracing::info!(code = reason.code, reason = %reason.message, "connection lost");
                        self.enter_disconnected(reason, Duration::ZERO);
                    }
                    ConnectionState::Connecting => self.connect_failed(reason),
                    ConnectionState::Closing => self.enter_closed(),
                    other => tracing::debug!(state = %other, "transport closed"),
                }
            }
        }
    }

    fn on_frame(&mut self, frame: ProtocolMessage) {
        self.restart_idle_timer();
        if let Some(serial) = frame.connection_serial {
            self.connection_serial = Some(serial);
        }
        tracing::trace!(action = ?frame.action, channel = ?frame.channel, "frame received");

        match frame.action {
            Action::Heartbeat => {}
            Action::Ack | Action::Nack => {
                let Some(serial) = frame.msg_serial else {
                    tracing::warn!(action = ?frame.action, "ack without msgSerial ignored");
                    return;
                };
                let count = frame.ack_count();
                match frame.error {
                    Some(err) if frame.action == Action::Nack => self.ack.on_nack(serial, count, err),
                    None if frame.action == Action::Nack => self.ack.on_nack(
                        serial,
                        count,
                        ErrorInfo::new(codes::INTERNAL, 500, "message rejected by server"),
                    ),
                    _ => self.ack.on_ack(serial, count),
                }
            }
            Action::Connected => self.on_connected(frame),
            Action::Disconnected => self.on_server_disconnected(frame.error),
            Action::Closed => {
                if self.state != ConnectionState::Closing {
                    tracing::info!("server closed the connection");
                }
                self.enter_closed();
            }
            Action::Error => {
                if frame.channel.is_some() {
                    self.on_channel_error(frame);
                } else {
                    self.on_connection_error(frame.error);
                }
            }
            Action::Auth => self.on_auth_requested(),
            Action::Attached
            | Action::Detached
            | Action::Message
            | Action::Presence
            | Action::Sync => self.on_channel_frame(frame),
            Action::Connect
            | Action::Disconnect
            | Action::Close
            | Action::Attach
            | Action::Detach => {
                tracing::warn!(action = ?frame.action, "client-only action received from server")
            }
        }
    }

    fn restart_idle_timer(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Some(idle) = self.max_idle_interval {
            self.timers.start(
                TimerKind::Idle,
                idle + self.options.realtime_request_timeout(),
            );
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    fn connect(&mut self) {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Closing => {
                tracing::debug!(state = %self.state, "connect ignored");
            }
            ConnectionState::Closed | ConnectionState::Failed => {
                self.auth_attempts = 0;
                self.start_connecting();
            }
            ConnectionState::Initialized
            | ConnectionState::Disconnected
            | ConnectionState::Suspended => self.start_connecting(),
        }
    }

    fn start_connecting(&mut self) {
        self.timers
            .cancel_many(&[TimerKind::ConnectRetry, TimerKind::SuspendedRetry]);
        if self.state != ConnectionState::Connecting {
            self.set_state(ConnectionState::Connecting, None, None, false);
        }
        self.timers.start(
            TimerKind::ConnectTimeout,
            self.options.realtime_request_timeout(),
        );
        if self.auth.needs_token() {
            self.drop_transport();
            self.connect_awaits_token = true;
            self.begin_token_fetch(None, TokenParams::default(), AuthOptions::default());
            return;
        }
        self.open_transport();
    }

    fn connect_failed(&mut self, reason: ErrorInfo) {
        let attempt = self.connect_retry.record_attempt();
        tracing::warn!(
            attempt = attempt.number,
            code = reason.code,
            error = %reason,
            "connection attempt failed"
        );
        self.enter_disconnected(reason, attempt.delay);
    }

    fn on_connected(&mut self, frame: ProtocolMessage) {
        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Connected => return self.on_connection_update(frame),
            other => {
                tracing::warn!(state = %other, "connected frame ignored");
                return;
            }
        }
        self.timers.cancel_many(&[
            TimerKind::ConnectTimeout,
            TimerKind::ConnectRetry,
            TimerKind::SuspendedRetry,
            TimerKind::StateTtl,
        ]);
        self.suspend_on_failure = false;
        self.connect_awaits_token = false;
        self.auth_attempts = 0;

        let details = frame.connection_details.clone().unwrap_or_default();
        self.apply_connection_details(&details);

        let resumed = self.connection_id.is_some() && self.connection_id == frame.connection_id;
        let recovering = self.pending_recover.take().is_some();
        let recovered = recovering && frame.error.is_none();
        if !resumed && !recovered {
            if recovering {
                tracing::warn!(
                    code = frame.error.as_ref().map(|e| e.code),
                    "recovery failed; starting a fresh session"
                );
            } else if self.connection_id.is_some() {
                tracing::info!(
                    previous = ?self.connection_id,
                    current = ?frame.connection_id,
                    "connection not resumed"
                );
            }
            self.ack.reset_for_new_connection(frame.error.clone());
            self.connection_serial = frame.connection_serial;
        }
        self.connection_id = frame.connection_id.clone();
        self.connection_key = frame.connection_key.clone().or(details.connection_key);

        tracing::info!(
            connection_id = ?self.connection_id,
            resumed,
            recovered,
            "connected"
        );
        self.set_state(
            ConnectionState::Connected,
            frame.error,
            None,
            resumed || recovered,
        );
        self.restart_idle_timer();

        if resumed {
            let frames = self.ack.pending_frames();
            if !frames.is_empty() {
                tracing::debug!(count = frames.len(), "resending unacknowledged frames");
            }
            for f in frames {
                self.send_frame(f);
            }
        }
        self.flush_queue();
        self.channels_on_connected(resumed || recovered);
    }

    /// `connected` while already connected: new details, typically after
    /// an in-place auth upgrade.
    fn on_connection_update(&mut self, frame: ProtocolMessage) {
        if frame.connection_id.is_some() && frame.connection_id != self.connection_id {
            tracing::warn!(
                previous = ?self.connection_id,
                current = ?frame.connection_id,
                "connection id changed in update"
            );
        }
        if let Some(details) = &frame.connection_details {
            self.apply_connection_details(details);
            if let Some(key) = &details.connection_key {
                self.connection_key = Some(key.clone());
            }
        }
        if let Some(key) = frame.connection_key {
            self.connection_key = Some(key);
        }
        self.timers.cancel(&TimerKind::AuthTimeout);
        tracing::debug!("connection details updated");
        self.emit_update(frame.error);
        self.auth
            .connection_transitioned(ConnectionState::Connected, None);
    }

    fn apply_connection_details(&mut self, details: &rt_protocol::ConnectionDetails) {
        if let Some(ttl) = details.connection_state_ttl_ms {
            self.connection_state_ttl = Duration::from_millis(ttl);
        }
        if let Some(max) = details.max_message_size {
            self.shared.max_message_size.store(max, Ordering::Relaxed);
        }
        self.max_idle_interval = details.max_idle_interval_ms.map(Duration::from_millis);
        if let Some(client_id) = &details.client_id {
            self.client_id = Some(client_id.clone());
        }
    }

    fn on_server_disconnected(&mut self, error: Option<ErrorInfo>) {
        let reason = error.unwrap_or_else(|| ErrorInfo::disconnected("disconnected by server"));
        if reason.is_token_error() {
            return self.on_token_error(reason);
        }
        match self.state {
            ConnectionState::Connected => self.enter_disconnected(reason, Duration::ZERO),
            ConnectionState::Connecting => self.connect_failed(reason),
            other => tracing::debug!(state = %other, "disconnected frame ignored"),
        }
    }

    /// Connection-level `error` frame.
    fn on_connection_error(&mut self, error: Option<ErrorInfo>) {
        let err = error.unwrap_or_else(|| ErrorInfo::connection_failed("connection error"));
        let live = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        );
        if err.is_token_error() && live {
            return self.on_token_error(err);
        }
        match (err.kind(), self.state) {
            (rt_domain::ErrorKind::Transport, ConnectionState::Connecting) => self.connect_failed(err),
            (rt_domain::ErrorKind::Transport, ConnectionState::Connected) => {
                self.enter_disconnected(err, Duration::ZERO)
            }
            _ => self.enter_failed(err),
        }
    }

    /// The server rejected the presented token.
    fn on_token_error(&mut self, err: ErrorInfo) {
        self.drop_transport();
        if !self.auth.can_renew() {
            return self.enter_failed(ErrorInfo::new(
                codes::NO_MEANS_TO_RENEW_TOKEN,
                err.status_code,
                format!("{}; no means to renew the token", err.message),
            ));
        }
        if self.auth_attempts >= self.options.max_auth_retries {
            tracing::warn!(attempts = self.auth_attempts, "token renewal retries exhausted");
            return self.enter_failed(err);
        }
        self.auth_attempts += 1;
        tracing::info!(attempt = self.auth_attempts, code = err.code, "token rejected; renewing");
        if self
            .auth
            .stage()
            .is_some_and(|stage| stage != UpgradeStage::Fetching)
        {
            // The token this upgrade obtained is the one just rejected.
            self.auth.complete(Err(err.clone()));
        }
        self.auth.invalidate();
        match self.state {
            ConnectionState::Connected => self.enter_disconnected(err, Duration::ZERO),
            _ => self.start_connecting(),
        }
    }

    fn enter_disconnected(&mut self, reason: ErrorInfo, retry_in: Duration) {
        self.drop_transport();
        self.timers
            .cancel_many(&[TimerKind::ConnectTimeout, TimerKind::Idle]);
        if self.suspend_on_failure {
            return self.enter_suspended(reason);
        }
        if !self.timers.is_active(&TimerKind::StateTtl) {
            self.timers
                .start(TimerKind::StateTtl, self.connection_state_ttl);
        }
        self.set_state(
            ConnectionState::Disconnected,
            Some(reason.clone()),
            Some(retry_in),
            false,
        );
        self.channels_on_connection_interrupted(ConnectionState::Disconnected, &reason);
        if retry_in.is_zero() {
            self.start_connecting();
        } else {
            self.timers.start(TimerKind::ConnectRetry, retry_in);
        }
    }

    fn enter_suspended(&mut self, cause: ErrorInfo) {
        self.drop_transport();
        self.timers.cancel_many(&[
            TimerKind::ConnectTimeout,
            TimerKind::ConnectRetry,
            TimerKind::StateTtl,
            TimerKind::Idle,
        ]);
        self.suspend_on_failure = true;
        let reason = ErrorInfo::new(
            codes::CONNECTION_SUSPENDED,
            cause.status_code,
            format!("connection unavailable for longer than the state TTL: {}", cause.message),
        );
        // The server has discarded the session.
        self.connection_id = None;
        self.connection_key = None;
        self.connection_serial = None;
        self.ack.fail_all(&reason);
        self.fail_queue(&reason);

        let attempt = self.suspended_retry.record_attempt();
        self.set_state(
            ConnectionState::Suspended,
            Some(reason.clone()),
            Some(attempt.delay),
            false,
        );
        self.timers.start(TimerKind::SuspendedRetry, attempt.delay);
        self.channels_on_connection_interrupted(ConnectionState::Suspended, &reason);
    }

    fn enter_failed(&mut self, reason: ErrorInfo) {
        tracing::error!(code = reason.code, error = %reason, "connection failed");
        self.drop_transport();
        self.timers.cancel_many(&CONNECTION_TIMERS);
        self.suspend_on_failure = false;
        self.connect_awaits_token = false;
        self.connection_id = None;
        self.connection_key = None;
        self.connection_serial = None;
        self.ack.fail_all(&reason);
        self.fail_queue(&reason);
        self.set_state(ConnectionState::Failed, Some(reason.clone()), None, false);
        self.channels_on_connection_failed(&reason);
    }

    fn close(&mut self) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => {}
            ConnectionState::Connected => {
                self.timers.cancel_many(&CONNECTION_TIMERS);
                self.set_state(ConnectionState::Closing, None, None, false);
                self.timers.start(
                    TimerKind::CloseTimeout,
                    self.options.realtime_request_timeout(),
                );
                if !self.send_frame(ProtocolMessage::close()) {
                    self.enter_closed();
                }
            }
            ConnectionState::Connecting => {
                self.set_state(ConnectionState::Closing, None, None, false);
                self.enter_closed();
            }
            ConnectionState::Initialized
            | ConnectionState::Disconnected
            | ConnectionState::Suspended
            | ConnectionState::Failed => self.enter_closed(),
        }
    }

    fn enter_closed(&mut self) {
        self.drop_transport();
        self.timers.cancel_many(&CONNECTION_TIMERS);
        self.suspend_on_failure = false;
        self.connect_awaits_token = false;
        let reason = ErrorInfo::connection_closed("connection closed");
        self.ack.fail_all(&reason);
        self.fail_queue(&reason);
        self.connection_id = None;
        self.connection_key = None;
        self.connection_serial = None;
        tracing::info!("connection closed");
        self.set_state(ConnectionState::Closed, None, None, false);
        self.channels_on_connection_closed();
    }

    // ── Timers ──────────────────────────────────────────────────────

    fn on_timer(&mut self, kind: TimerKind, generation: u64) {
        if !self.timers.fired(&kind, generation) {
            tracing::trace!(?kind, generation, "stale timer fire ignored");
            return;
        }
        match kind {
            TimerKind::ConnectRetry => {
                if self.state == ConnectionState::Disconnected {
                    self.start_connecting();
                }
            }
            TimerKind::SuspendedRetry => {
                if self.state == ConnectionState::Suspended {
                    self.start_connecting();
                }
            }
            TimerKind::ConnectTimeout => {
                if self.state == ConnectionState::Connecting {
                    self.connect_failed(ErrorInfo::timed_out("connection attempt timed out"));
                }
            }
            TimerKind::StateTtl => match self.state {
                ConnectionState::Disconnected => {
                    let cause = self
                        .error_reason
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::disconnected("disconnected"));
                    self.enter_suspended(cause);
                }
                ConnectionState::Connecting => self.suspend_on_failure = true,
                _ => {}
            },
            TimerKind::CloseTimeout => {
                if self.state == ConnectionState::Closing {
                    tracing::warn!("no closed frame from server; closing anyway");
                    self.enter_closed();
                }
            }
            TimerKind::Idle => {
                if self.state == ConnectionState::Connected {
                    tracing::warn!("no activity from server within the idle interval");
                    self.enter_disconnected(
                        ErrorInfo::new(codes::DISCONNECTED, 408, "idle timeout"),
                        Duration::ZERO,
                    );
                }
            }
            TimerKind::AuthTimeout => self.on_auth_timeout(),
            TimerKind::AttachTimeout(name) => self.on_attach_timeout(&name),
            TimerKind::DetachTimeout(name) => self.on_detach_timeout(&name),
            TimerKind::ChannelRetry(name) => self.on_channel_retry(&name),
        }
    }

    // ── Auth ────────────────────────────────────────────────────────

    fn authorize(&mut self, params: TokenParams, options: AuthOptions, done: Resolver<TokenDetails>) {
        if self.state == ConnectionState::Closing {
            let _ = done.send(Err(ErrorInfo::cancelled("authorize cancelled: connection closing")));
            return;
        }
        tracing::debug!(coalesced = self.auth.in_flight(), "authorize requested");
        self.begin_token_fetch(Some(done), params, options);
    }

    /// Server asked for fresh credentials.
    fn on_auth_requested(&mut self) {
        if self.state != ConnectionState::Connected {
            tracing::debug!(state = %self.state, "auth request ignored");
            return;
        }
        if !self.auth.can_renew() {
            tracing::warn!("server requested re-authentication but no authenticator is configured");
            return;
        }
        tracing::info!("server requested re-authentication");
        self.begin_token_fetch(
            None,
            TokenParams::default(),
            AuthOptions {
                force: true,
                token: None,
            },
        );
    }

    fn begin_token_fetch(
        &mut self,
        waiter: Option<Resolver<TokenDetails>>,
        params: TokenParams,
        options: AuthOptions,
    ) {
        let Join::Started { generation } = self.auth.join(waiter) else {
            return;
        };
        self.timers.start(
            TimerKind::AuthTimeout,
            self.options.realtime_request_timeout(),
        );

        let result = if let Some(token) = &options.token {
            Some(Ok(TokenDetails::from_token(token.clone())))
        } else if !self.auth.can_renew() {
            Some(Err(ErrorInfo::new(
                codes::NO_MEANS_TO_RENEW_TOKEN,
                401,
                "no authenticator configured to obtain a token",
            )))
        } else {
            None
        };
        if let Some(result) = result {
            let _ = self.tx.send(Command::TokenFetched { generation, result });
            return;
        }

        let Some(authenticator) = self.auth.authenticator() else {
            return;
        };
        let params = TokenParams {
            client_id: params.client_id.or_else(|| self.options.client_id.clone()),
            ..params
        };
        let tx = self.tx.clone();
        tracing::debug!(generation, "requesting token");
        tokio::spawn(async move {
            let result = authenticator.request_token(&params, &options).await;
            let _ = tx.send(Command::TokenFetched { generation, result });
        });
    }

    fn on_token_fetched(&mut self, generation: u64, result: Result<TokenDetails, ErrorInfo>) {
        let Some(result) = self.auth.accept_fetch(generation, result) else {
            return;
        };
        self.timers.cancel(&TimerKind::AuthTimeout);
        let token = match result {
            Ok(token) => token,
            Err(err) => return self.token_fetch_failed(err),
        };
        tracing::debug!(generation, client_id = ?token.client_id, "token obtained");
        self.auth.store(token.clone());
        self.connect_awaits_token = false;

        match self.state {
            ConnectionState::Connected => {
                self.auth.set_stage(UpgradeStage::AwaitingConfirmation);
                self.timers.start(
                    TimerKind::AuthTimeout,
                    self.options.realtime_request_timeout(),
                );
                self.send_frame(ProtocolMessage::auth(token.token));
            }
            ConnectionState::Connecting => {
                // A fetch nobody waits on was only for this connect; settle it
                // so a later authorize() starts its own upgrade.
                if self.auth.has_waiters() {
                    self.auth.set_stage(UpgradeStage::AwaitingConnected);
                } else {
                    self.auth.complete(Ok(()));
                }
                // Restart the attempt so only the new credentials are in play.
                self.timers.start(
                    TimerKind::ConnectTimeout,
                    self.options.realtime_request_timeout(),
                );
                self.open_transport();
            }
            ConnectionState::Disconnected | ConnectionState::Suspended => {
                self.auth.complete(Ok(()));
                self.start_connecting();
            }
            ConnectionState::Initialized | ConnectionState::Closed | ConnectionState::Failed => {
                self.auth.complete(Ok(()));
            }
            ConnectionState::Closing => {
                self.auth
                    .complete(Err(ErrorInfo::cancelled("authorize cancelled: connection closing")));
            }
        }
    }

    fn token_fetch_failed(&mut self, err: ErrorInfo) {
        tracing::warn!(code = err.code, error = %err, "token request failed");
        self.auth.complete(Err(err.clone()));
        if self.state == ConnectionState::Connecting && std::mem::take(&mut self.connect_awaits_token) {
            if err.status_code == 403 || err.code == codes::NO_MEANS_TO_RENEW_TOKEN {
                self.enter_failed(err);
            } else {
                self.connect_failed(err);
            }
        }
    }

    fn on_auth_timeout(&mut self) {
        match self.auth.stage() {
            Some(UpgradeStage::Fetching) => {
                self.token_fetch_failed(ErrorInfo::timed_out("token request timed out"))
            }
            Some(UpgradeStage::AwaitingConfirmation) => {
                tracing::warn!("no confirmation for auth upgrade");
                self.auth
                    .complete(Err(ErrorInfo::timed_out("auth upgrade not confirmed in time")));
            }
            Some(UpgradeStage::AwaitingConnected) | None => {}
        }
    }
}
