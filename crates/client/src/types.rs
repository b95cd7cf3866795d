//! Public error type and the completion future returned by async operations.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use rt_domain::{codes, ErrorInfo};
use tokio::sync::oneshot;

/// Top-level client error.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RealtimeError {
    #[error("config: {0}")]
    Config(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("message size {size} exceeds limit {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Remote(#[from] ErrorInfo),
    #[error("client shut down")]
    Shutdown,
}

impl RealtimeError {
    /// The wire-level error for this failure.
    pub fn error_info(&self) -> ErrorInfo {
        match self {
            RealtimeError::Config(m) | RealtimeError::InvalidArgs(m) => {
                ErrorInfo::new(codes::INVALID_ARGUMENTS, 400, m.clone())
            }
            RealtimeError::MessageTooLarge { size, max } => ErrorInfo::new(
                codes::MAX_MESSAGE_LENGTH_EXCEEDED,
                400,
                format!("message size {size} exceeds limit {max}"),
            ),
            RealtimeError::Remote(info) => info.clone(),
            RealtimeError::Shutdown => ErrorInfo::cancelled("client shut down"),
        }
    }
}

/// Resolves once the worker has finished an operation.
///
/// Resolution happens on whichever task awaits the completion, never on the
/// worker. Dropping it does not cancel the operation.
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, ErrorInfo>>,
}

pub(crate) type Resolver<T> = oneshot::Sender<Result<T, ErrorInfo>>;

impl<T> Completion<T> {
    pub(crate) fn channel() -> (Resolver<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, RealtimeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| match r {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(RealtimeError::Remote(e)),
            Err(_) => Err(RealtimeError::Shutdown),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completion_maps_remote_errors() {
        let (tx, done) = Completion::<()>::channel();
        tx.send(Err(ErrorInfo::cancelled("gone"))).unwrap();
        let err = done.await.unwrap_err();
        assert_eq!(err.error_info().code, codes::CANCELLED);
    }

    #[tokio::test]
    async fn dropped_resolver_means_shutdown() {
        let (tx, done) = Completion::<u32>::channel();
        drop(tx);
        assert_eq!(done.await, Err(RealtimeError::Shutdown));
    }

    #[test]
    fn too_large_maps_to_wire_code() {
        let e = RealtimeError::MessageTooLarge { size: 10, max: 5 };
        assert_eq!(e.error_info().code, codes::MAX_MESSAGE_LENGTH_EXCEEDED);
    }
}
