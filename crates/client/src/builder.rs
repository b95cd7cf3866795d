//! Builder pattern for constructing a [`Realtime`] client.

use std::sync::Arc;

use rt_domain::{ClientOptions, ConfigSeverity};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::client::Realtime;
use crate::retry::{BackoffRetryDelayCalculator, RetryDelayCalculator};
use crate::shared::ConnectionShared;
use crate::timer::{Scheduler, TokioScheduler};
use crate::transport::TransportFactory;
use crate::types::RealtimeError;
use crate::worker::{Command, Worker, WorkerConfig};
use crate::ws::WebSocketTransportFactory;

/// Fluent builder for [`Realtime`].
///
/// # Example
///
/// ```rust,no_run
/// # async fn run() -> Result<(), rt_client::RealtimeError> {
/// let client = rt_client::Realtime::builder()
///     .endpoint("wss://realtime.example.com")
///     .key("app.key:secret")
///     .client_id("alice")
///     .build()?;
/// client.channel("chat").publish_one("greeting", serde_json::json!("hi"))?.await?;
/// # Ok(())
/// # }
/// ```
pub struct RealtimeBuilder {
    options: ClientOptions,
    authenticator: Option<Arc<dyn Authenticator>>,
    transport: Option<Arc<dyn TransportFactory>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    retry_delay: Option<Arc<dyn RetryDelayCalculator>>,
    channel_retry_delay: Option<Arc<dyn RetryDelayCalculator>>,
}

impl RealtimeBuilder {
    pub fn new() -> Self {
        Self {
            options: ClientOptions::default(),
            authenticator: None,
            transport: None,
            scheduler: None,
            retry_delay: None,
            channel_retry_delay: None,
        }
    }

    /// Replace all options at once, e.g. with ones loaded from TOML.
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    // ── Identity / credentials ───────────────────────────────────────

    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.options.endpoint = url.into();
        self
    }

    /// API key `name:secret`, presented when no token is available.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.options.key = Some(key.into());
        self
    }

    /// Static token. It cannot be renewed without an authenticator.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.options.token = Some(token.into());
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.options.client_id = Some(id.into());
        self
    }

    /// Source of renewable tokens.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Connect as soon as the client is built (default true).
    pub fn auto_connect(mut self, yes: bool) -> Self {
        self.options.auto_connect = yes;
        self
    }

    /// Queue publishes made while not connected (default true).
    pub fn queue_messages(mut self, yes: bool) -> Self {
        self.options.queue_messages = yes;
        self
    }

    /// Receive this connection's own publishes back (default true).
    pub fn echo_messages(mut self, yes: bool) -> Self {
        self.options.echo_messages = yes;
        self
    }

    pub fn idempotent_publishing(mut self, yes: bool) -> Self {
        self.options.idempotent_publishing = yes;
        self
    }

    /// Recovery key of a previous client instance.
    pub fn recover(mut self, key: impl Into<String>) -> Self {
        self.options.recover = Some(key.into());
        self
    }

    // ── Collaborators ────────────────────────────────────────────────

    /// Override the transport (default: WebSocket).
    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(factory);
        self
    }

    /// Override the timer source (default: tokio timers).
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Override the connection retry delays.
    pub fn retry_delay(mut self, calculator: Arc<dyn RetryDelayCalculator>) -> Self {
        self.retry_delay = Some(calculator);
        self
    }

    /// Override the channel re-attach delays.
    pub fn channel_retry_delay(mut self, calculator: Arc<dyn RetryDelayCalculator>) -> Self {
        self.channel_retry_delay = Some(calculator);
        self
    }

    /// Build the client and spawn its worker. Must be called inside a
    /// tokio runtime.
    pub fn build(self) -> Result<Realtime, RealtimeError> {
        let has_authenticator = self.authenticator.is_some();
        let mut errors = Vec::new();
        for issue in self.options.validate() {
            match issue.severity {
                ConfigSeverity::Error => errors.push(issue.to_string()),
                // An authenticator makes key/token optional.
                ConfigSeverity::Warning if has_authenticator && issue.field == "key" => {}
                ConfigSeverity::Warning => {
                    tracing::warn!(field = %issue.field, "{}", issue.message)
                }
            }
        }
        if !errors.is_empty() {
            return Err(RealtimeError::Config(errors.join("; ")));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(RealtimeError::Config(
                "Realtime must be built inside a tokio runtime".into(),
            ));
        }

        let options = self.options;
        let shared = Arc::new(ConnectionShared::new(
            options.max_message_size,
            options.client_id.clone(),
        ));
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        let shutdown = CancellationToken::new();

        let config = WorkerConfig {
            authenticator: self.authenticator,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(WebSocketTransportFactory::new())),
            scheduler: self.scheduler.unwrap_or_else(|| Arc::new(TokioScheduler)),
            retry_delay: self.retry_delay.unwrap_or_else(|| {
                Arc::new(BackoffRetryDelayCalculator::new(
                    options.disconnected_retry_timeout(),
                ))
            }),
            channel_retry_delay: self.channel_retry_delay.unwrap_or_else(|| {
                Arc::new(BackoffRetryDelayCalculator::new(
                    options.channel_retry_timeout(),
                ))
            }),
            options: options.clone(),
        };
        let worker = Worker::new(config, shared.clone(), tx.clone(), rx, shutdown.clone());
        tokio::spawn(worker.run());

        tracing::debug!(endpoint = %options.endpoint, auto_connect = options.auto_connect, "realtime client built");
        let client = Realtime::from_parts(tx, shared, options.idempotent_publishing, shutdown);
        if options.auto_connect {
            client.connect();
        }
        Ok(client)
    }
}

impl Default for RealtimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
