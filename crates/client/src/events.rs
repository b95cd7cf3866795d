//! Per-owner observer lists.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Fan-out of events to any number of [`Subscription`]s.
///
/// Emitting never blocks and never runs subscriber code: each subscriber
/// drains its own queue on its own task.
pub struct EventEmitter<E> {
    listeners: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        Subscription { rx }
    }

    /// Deliver `event` to every live subscription, pruning dropped ones.
    pub fn emit(&self, event: E) {
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<E: Clone> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [`EventEmitter`]. Dropping it unsubscribes.
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Next event, or `None` once the emitter is gone.
    pub async fn next(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_next(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}
