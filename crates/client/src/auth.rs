//! Token acquisition and in-place credential upgrades.
//!
//! At most one upgrade is in flight per connection. Concurrent `authorize`
//! callers join the running upgrade and all see the same outcome.

use std::sync::Arc;

use async_trait::async_trait;
use rt_domain::{codes, AuthOptions, ErrorInfo, TokenDetails, TokenParams};

use crate::state::ConnectionState;
use crate::types::Resolver;

/// Obtains tokens, typically from the application's own auth server.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn request_token(
        &self,
        params: &TokenParams,
        options: &AuthOptions,
    ) -> Result<TokenDetails, ErrorInfo>;
}

/// Progress of the in-flight upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpgradeStage {
    /// Waiting for the authenticator.
    Fetching,
    /// `auth` frame sent on a connected transport; the next `connected` or
    /// `error` frame settles it.
    AwaitingConfirmation,
    /// A new transport was opened with the token; settles on `connected`.
    AwaitingConnected,
}

struct Upgrade {
    generation: u64,
    stage: UpgradeStage,
    waiters: Vec<Resolver<TokenDetails>>,
}

/// Whether a caller started a new upgrade or joined the running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Join {
    Started { generation: u64 },
    Coalesced,
}

pub(crate) struct AuthCoordinator {
    authenticator: Option<Arc<dyn Authenticator>>,
    static_token: Option<String>,
    current: Option<TokenDetails>,
    upgrade: Option<Upgrade>,
    generation: u64,
}

impl AuthCoordinator {
    pub(crate) fn new(
        authenticator: Option<Arc<dyn Authenticator>>,
        static_token: Option<String>,
    ) -> Self {
        Self {
            authenticator,
            static_token,
            current: None,
            upgrade: None,
            generation: 0,
        }
    }

    pub(crate) fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        self.authenticator.clone()
    }

    /// Whether a fresh token can be obtained without caller input.
    pub(crate) fn can_renew(&self) -> bool {
        self.authenticator.is_some()
    }

    /// Token to present on the next connect, if any.
    pub(crate) fn access_token(&self) -> Option<&str> {
        self.current
            .as_ref()
            .map(|t| t.token.as_str())
            .or(self.static_token.as_deref())
    }

    /// A connect attempt must fetch a token first.
    pub(crate) fn needs_token(&self) -> bool {
        self.can_renew() && self.current.as_ref().map_or(true, TokenDetails::is_expired)
    }

    /// Forget the current token after the server rejected it.
    pub(crate) fn invalidate(&mut self) {
        self.current = None;
        self.static_token = None;
    }

    pub(crate) fn store(&mut self, token: TokenDetails) {
        self.current = Some(token);
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.upgrade.is_some()
    }

    /// Whether any `authorize` caller waits on the running upgrade.
    pub(crate) fn has_waiters(&self) -> bool {
        self.upgrade.as_ref().is_some_and(|u| !u.waiters.is_empty())
    }

    pub(crate) fn stage(&self) -> Option<UpgradeStage> {
        self.upgrade.as_ref().map(|u| u.stage)
    }

    /// Join the running upgrade or start a new one.
    pub(crate) fn join(&mut self, waiter: Option<Resolver<TokenDetails>>) -> Join {
        if let Some(upgrade) = &mut self.upgrade {
            upgrade.waiters.extend(waiter);
            tracing::debug!(
                generation = upgrade.generation,
                waiters = upgrade.waiters.len(),
                "authorize joined in-flight upgrade"
            );
            return Join::Coalesced;
        }
        self.generation += 1;
        self.upgrade = Some(Upgrade {
            generation: self.generation,
            stage: UpgradeStage::Fetching,
            waiters: waiter.into_iter().collect(),
        });
        Join::Started {
            generation: self.generation,
        }
    }

    /// Accept a fetch result if it belongs to the running upgrade. Results
    /// of abandoned fetches yield `None`.
    pub(crate) fn accept_fetch(
        &mut self,
        generation: u64,
        result: Result<TokenDetails, ErrorInfo>,
    ) -> Option<Result<TokenDetails, ErrorInfo>> {
        match &self.upgrade {
            Some(u) if u.generation == generation && u.stage == UpgradeStage::Fetching => {
                Some(result)
            }
            _ => {
                tracing::debug!(generation, "stale token fetch result ignored");
                None
            }
        }
    }

    pub(crate) fn set_stage(&mut self, stage: UpgradeStage) {
        if let Some(upgrade) = &mut self.upgrade {
            upgrade.stage = stage;
        }
    }

    /// Settle the running upgrade for every waiter.
    pub(crate) fn complete(&mut self, result: Result<(), ErrorInfo>) {
        let Some(upgrade) = self.upgrade.take() else {
            return;
        };
        let result = match result {
            Ok(()) => self.current.clone().ok_or_else(|| {
                ErrorInfo::new(codes::NO_MEANS_TO_RENEW_TOKEN, 401, "no token available")
            }),
            Err(e) => Err(e),
        };
        tracing::debug!(
            generation = upgrade.generation,
            ok = result.is_ok(),
            waiters = upgrade.waiters.len(),
            "auth upgrade settled"
        );
        for waiter in upgrade.waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Apply a connection transition to the running upgrade.
    pub(crate) fn connection_transitioned(
        &mut self,
        state: ConnectionState,
        reason: Option<&ErrorInfo>,
    ) {
        let Some(stage) = self.stage() else {
            return;
        };
        match state {
            ConnectionState::Connected => {
                if stage != UpgradeStage::Fetching {
                    self.complete(Ok(()));
                }
            }
            ConnectionState::Failed => {
                let err = reason
                    .cloned()
                    .unwrap_or_else(|| ErrorInfo::connection_failed("connection failed"));
                self.complete(Err(err));
            }
            ConnectionState::Suspended | ConnectionState::Closing | ConnectionState::Closed => {
                self.complete(Err(ErrorInfo::cancelled(format!(
                    "authorize cancelled: connection {state}"
                ))));
            }
            ConnectionState::Disconnected => {
                if stage == UpgradeStage::AwaitingConfirmation {
                    self.set_stage(UpgradeStage::AwaitingConnected);
                }
            }
            ConnectionState::Initialized | ConnectionState::Connecting => {}
        }
    }
}
