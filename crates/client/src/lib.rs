//! `rt-client`: connection engine for a realtime publish/subscribe service.
//!
//! A [`Realtime`] client keeps one logical session with the service alive
//! over a replaceable transport: it reconnects and resumes after drops,
//! renews tokens in place, and tracks every publish until the server
//! acknowledges or rejects it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Realtime / Channel handles (any task)                      │
//! │        │ Command (mpsc)                 ▲ watch snapshots   │
//! │        ▼                                │ Subscription<E>   │
//! │  ┌───────────────── worker task ────────┴───────────────┐   │
//! │  │ connection state machine                             │   │
//! │  │   ├── RetryScheduler (connect / suspended)           │   │
//! │  │   ├── AuthCoordinator (one upgrade at a time)        │   │
//! │  │   ├── AckTracker (msgSerial, ack/nack resolution)    │   │
//! │  │   └── channel state machines                         │   │
//! │  └────────▲──────────────────────────────┬──────────────┘   │
//! │           │ TransportEvents / timers      │ ProtocolMessage  │
//! │           │                               ▼                  │
//! │        Transport (WebSocket by default, one per attempt)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All connection, ack, auth and channel state is owned by the worker and
//! mutated only there. Handles send commands and read published snapshots;
//! completions resolve on the task that awaits them.

pub mod ack;
pub mod auth;
pub mod builder;
pub mod channel;
pub mod client;
pub mod events;
pub mod idempotent;
pub mod recovery;
pub mod retry;
pub mod state;
pub mod timer;
pub mod transport;
pub mod types;
pub mod ws;

mod shared;
mod worker;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use auth::Authenticator;
pub use builder::RealtimeBuilder;
pub use channel::Channel;
pub use client::Realtime;
pub use events::Subscription;
pub use recovery::RecoveryKey;
pub use retry::{BackoffRetryDelayCalculator, FixedDelay, RetryAttempt, RetryDelayCalculator};
pub use state::{
    ChannelEvent, ChannelState, ChannelStateChange, ConnectionEvent, ConnectionState,
    ConnectionStateChange,
};
pub use timer::{Scheduler, TimerHandle, TokioScheduler};
pub use transport::{ConnectParams, Transport, TransportEvent, TransportEvents, TransportFactory};
pub use types::{Completion, RealtimeError};
pub use ws::WebSocketTransportFactory;

// Re-export domain and protocol types so callers rarely need those crates.
pub use rt_domain::{
    codes, AuthOptions, ClientOptions, ErrorInfo, ErrorKind, TokenDetails, TokenParams,
};
pub use rt_protocol::{Message, ProtocolMessage};
