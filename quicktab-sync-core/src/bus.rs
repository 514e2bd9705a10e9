//! Event bus for dispatching events to subscribed listeners
//!
//! One bus is constructed per context and shared by reference (usually an
//! `Arc`). Listeners for a given event kind run in registration order,
//! synchronously inside [`EventBus::emit`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::config::SentinelConfig;
use crate::event::BusEvent;
use crate::sentinel::SubscriptionSentinel;

/// Handle returned by [`EventBus::on`] and [`EventBus::once`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<E> {
    id: ListenerId,
    handler: Handler<E>,
    once: bool,
}

/// In-process FIFO publish/subscribe
///
/// Generic over the event family `E`; listeners subscribe to an `E::Kind`.
///
/// A panicking listener is caught and logged. It never prevents the
/// remaining listeners from running, and never reaches the emitter.
pub struct EventBus<E: BusEvent> {
    listeners: Mutex<HashMap<E::Kind, Vec<Listener<E>>>>,
    next_id: AtomicU64,
    sentinel: SubscriptionSentinel,
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.total_listeners())
            .finish()
    }
}

impl<E: BusEvent> EventBus<E> {
    /// Create a new event bus with the default sentinel threshold
    pub fn new() -> Self {
        Self::with_sentinel(&SentinelConfig::default())
    }

    /// Create a new event bus with a custom sentinel threshold
    pub fn with_sentinel(config: &SentinelConfig) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sentinel: SubscriptionSentinel::new("event_bus", config),
        }
    }

    /// Subscribe a listener to an event kind
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler), false)
    }

    /// Subscribe a listener that removes itself after its first call
    pub fn once<F>(&self, kind: E::Kind, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler), true)
    }

    /// Unsubscribe a listener. Returns `false` if it was already gone.
    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|listener| listener.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(&kind);
        }
        drop(listeners);
        self.sentinel.observe(self.total_listeners());
        removed
    }

    /// Emit an event to every listener of its kind.
    ///
    /// Returns `true` if at least one listener was subscribed.
    pub fn emit(&self, event: E) -> bool {
        let kind = event.kind();

        // Snapshot under the lock so listeners may re-enter the bus.
        let handlers: Vec<(ListenerId, Handler<E>)> = {
            let mut listeners = self.lock();
            let Some(list) = listeners.get_mut(&kind) else {
                return false;
            };
            let snapshot = list
                .iter()
                .map(|listener| (listener.id, Arc::clone(&listener.handler)))
                .collect();
            list.retain(|listener| !listener.once);
            if list.is_empty() {
                listeners.remove(&kind);
            }
            snapshot
        };

        if handlers.is_empty() {
            return false;
        }

        for (id, handler) in &handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                warn!(
                    kind = ?kind,
                    listener = id.0,
                    error = %panic_message(&panic),
                    "Event listener panicked"
                );
            }
        }
        true
    }

    /// Remove every listener, or only the listeners of one kind
    pub fn remove_all_listeners(&self, kind: Option<E::Kind>) {
        let mut listeners = self.lock();
        match kind {
            Some(kind) => {
                listeners.remove(&kind);
            }
            None => listeners.clear(),
        }
        drop(listeners);
        self.sentinel.observe(self.total_listeners());
    }

    /// Number of listeners subscribed to a kind
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Number of listeners across every kind
    pub fn total_listeners(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    /// Report leaked listeners and clear the bus.
    ///
    /// Returns `true` if listeners were still subscribed.
    pub fn teardown(&self) -> bool {
        let leaked = self.sentinel.check_teardown(self.total_listeners());
        self.lock().clear();
        debug!(leaked, "Event bus torn down");
        leaked
    }

    fn register(&self, kind: E::Kind, handler: Handler<E>, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let total = {
            let mut listeners = self.lock();
            listeners
                .entry(kind)
                .or_default()
                .push(Listener { id, handler, once });
            listeners.values().map(Vec::len).sum()
        };
        self.sentinel.observe(total);
        id
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<E::Kind, Vec<Listener<E>>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
