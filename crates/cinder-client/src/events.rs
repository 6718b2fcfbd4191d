//! Typed, in-order event delivery.
//!
//! Leases and watchers publish lifecycle events through an [`Emitter`].
//! Consumers either register a callback with [`Emitter::on`], which runs
//! synchronously on the emitting task, or take an unbounded channel with
//! [`Emitter::subscribe`]. Both see every event in emission order.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Callback invoked for every emitted event.
pub type EventCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Listener<E> {
    Callback(EventCallback<E>),
    Channel(mpsc::UnboundedSender<E>),
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        match self {
            Listener::Callback(cb) => Listener::Callback(cb.clone()),
            Listener::Channel(tx) => Listener::Channel(tx.clone()),
        }
    }
}

/// Fan-out point for events of type `E`.
pub struct Emitter<E> {
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E: Clone + Send + 'static> Emitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers a callback for every future event.
    pub fn on<F>(&self, callback: F)
    where F: Fn(&E) + Send + Sync + 'static {
        self.listeners.lock().push(Listener::Callback(Arc::new(callback)));
    }

    /// Returns a receiver of every future event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(Listener::Channel(tx));
        rx
    }

    /// Delivers `event` to every listener.
    ///
    /// Listeners are snapshotted first, so callbacks may register further
    /// listeners; those only see later events. Closed channels are pruned.
    pub fn emit(&self, event: E) {
        let listeners: Vec<Listener<E>> = self.listeners.lock().clone();
        let mut saw_closed = false;
        for listener in &listeners {
            match listener {
                Listener::Callback(cb) => cb(&event),
                Listener::Channel(tx) => saw_closed |= tx.send(event.clone()).is_err(),
            }
        }
        if saw_closed {
            self.listeners.lock().retain(|l| match l {
                Listener::Callback(_) => true,
                Listener::Channel(tx) => !tx.is_closed(),
            });
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<E: Clone + Send + 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").field("listeners", &self.listeners.lock().len()).finish()
    }
}
