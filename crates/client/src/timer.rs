//! Cancellable one-shot timers.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Handle to an armed timer. Cancelling after it fired is a no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancel: CancellationToken,
}

impl TimerHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs a callback once after a delay.
pub trait Scheduler: Send + Sync {
    fn after(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// [`Scheduler`] on top of `tokio::time`. Must be used inside a runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        callback();
                    }
                }
            }
        });
        TimerHandle::new(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        TokioScheduler.after(
            Duration::from_secs(5),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let handle = TokioScheduler.after(
            Duration::from_secs(1),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }
}
