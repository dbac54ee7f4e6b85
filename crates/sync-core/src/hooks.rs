//! Hook bus modelling the host application's lifecycle event bus.
//!
//! Host adapters `emit` events; the runtime synchronizer subscribes for the
//! lifetime of a session. Wrap the bus in `Arc` to enable subscriptions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription<E> {
    bus: Weak<HookBus<E>>,
    id: usize,
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing host lifecycle events to subscribers.
pub struct HookBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for HookBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone> HookBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

impl<E> HookBus<E> {
    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }
}
