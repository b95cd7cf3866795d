use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::Command;
use crate::timer::{Scheduler, TimerHandle};

/// Every timer the worker arms. At most one of each kind is armed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    ConnectRetry,
    SuspendedRetry,
    ConnectTimeout,
    StateTtl,
    CloseTimeout,
    Idle,
    AuthTimeout,
    AttachTimeout(String),
    DetachTimeout(String),
    ChannelRetry(String),
}

impl TimerKind {
    pub(crate) fn channel(&self) -> Option<&str> {
        match self {
            TimerKind::AttachTimeout(name)
            | TimerKind::DetachTimeout(name)
            | TimerKind::ChannelRetry(name) => Some(name),
            _ => None,
        }
    }
}

/// Armed timers, each tagged with a generation so a fire that raced with
/// a cancel or re-arm is recognised and dropped.
pub(crate) struct Timers {
    scheduler: Arc<dyn Scheduler>,
    tx: mpsc::UnboundedSender<Command>,
    armed: HashMap<TimerKind, (u64, TimerHandle)>,
    next_generation: u64,
}

impl Timers {
    pub(crate) fn new(scheduler: Arc<dyn Scheduler>, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            scheduler,
            tx,
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm `kind`, replacing any timer of the same kind.
    pub(crate) fn start(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(&kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let fired = kind.clone();
        let handle = self.scheduler.after(
            delay,
            Box::new(move || {
                let _ = tx.send(Command::TimerFired {
                    kind: fired,
                    generation,
                });
            }),
        );
        self.armed.insert(kind, (generation, handle));
    }

    pub(crate) fn cancel(&mut self, kind: &TimerKind) {
        if let Some((_, handle)) = self.armed.remove(kind) {
            handle.cancel();
        }
    }

    pub(crate) fn cancel_many(&mut self, kinds: &[TimerKind]) {
        for kind in kinds {
            self.cancel(kind);
        }
    }

    /// Cancel every timer belonging to channel `name`.
    pub(crate) fn cancel_channel(&mut self, name: &str) {
        self.cancel_where(|kind| kind.channel() == Some(name));
    }

    pub(crate) fn cancel_all_channels(&mut self) {
        self.cancel_where(|kind| kind.channel().is_some());
    }

    pub(crate) fn cancel_all(&mut self) {
        self.cancel_where(|_| true);
    }

    fn cancel_where(&mut self, mut pred: impl FnMut(&TimerKind) -> bool) {
        self.armed.retain(|kind, (_, handle)| {
            if pred(kind) {
                handle.cancel();
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn is_active(&self, kind: &TimerKind) -> bool {
        self.armed.contains_key(kind)
    }

    /// Consume a fire notification. Returns `false` for stale fires.
    pub(crate) fn fired(&mut self, kind: &TimerKind, generation: u64) -> bool {
        match self.armed.get(kind) {
            Some((armed, _)) if *armed == generation => {
                self.armed.remove(kind);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TokioScheduler;

    fn timers() -> (Timers, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Timers::new(Arc::new(TokioScheduler), tx), rx)
    }

    async fn next_fire(rx: &mut mpsc::UnboundedReceiver<Command>) -> (TimerKind, u64) {
        match rx.recv().await {
            Some(Command::TimerFired { kind, generation }) => (kind, generation),
            _ => panic!("expected a timer fire"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fire_is_consumed_once() {
        let (mut t, mut rx) = timers();
        t.start(TimerKind::Idle, Duration::from_secs(1));
        let (kind, generation) = next_fire(&mut rx).await;
        assert_eq!(kind, TimerKind::Idle);
        assert!(t.fired(&kind, generation));
        assert!(!t.fired(&kind, generation));
        assert!(!t.is_active(&TimerKind::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_makes_previous_fire_stale() {
        let (mut t, mut rx) = timers();
        t.start(TimerKind::ConnectRetry, Duration::from_secs(1));
        let stale_generation = t.next_generation;
        t.start(TimerKind::ConnectRetry, Duration::from_secs(2));
        let (kind, generation) = next_fire(&mut rx).await;
        assert_ne!(generation, stale_generation);
        assert!(!t.fired(&kind, stale_generation));
        assert!(t.fired(&kind, generation));
    }

    #[tokio::test]
    async fn channel_timers_cancel_together() {
        let (mut t, _rx) = timers();
        t.start(TimerKind::AttachTimeout("a".into()), Duration::from_secs(5));
        t.start(TimerKind::ChannelRetry("a".into()), Duration::from_secs(5));
        t.start(TimerKind::AttachTimeout("b".into()), Duration::from_secs(5));
        t.start(TimerKind::Idle, Duration::from_secs(5));
        t.cancel_channel("a");
        assert!(!t.is_active(&TimerKind::ChannelRetry("a".into())));
        assert!(t.is_active(&TimerKind::AttachTimeout("b".into())));
        t.cancel_all_channels();
        assert!(t.is_active(&TimerKind::Idle));
        assert!(!t.is_active(&TimerKind::AttachTimeout("b".into())));
    }
}
