//! Test utilities for code built on quicktab-sync
//!
//! - [`EventRecorder`]: captures every state event emitted on a bus
//! - [`MockTransport`]: scripted [`Transport`] with delays and failures
//! - [`YieldingArea`]: storage that yields to the scheduler on every call
//! - Assertion macros for verifying emitted events
//!
//! # Example
//!
//! ```ignore
//! use quicktab_sync::testing::EventRecorder;
//!
//! let bus = Arc::new(EventBus::new());
//! let mut recorder = EventRecorder::attach(&bus);
//! let mut store = StateStore::new(Arc::clone(&bus));
//!
//! store.add(tab);
//! let events = recorder.drain_emitted();
//! assert_emitted!(events, StateEvent::Added(_));
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bus::{EventBus, ListenerId};
use crate::error::{StorageError, TransportError};
use crate::event::{BusEvent, StateEvent, StateEventType};
use crate::protocol::{Request, Transport};
use crate::storage::{KeyValueArea, MemoryArea};

/// Records events from an [`EventBus`] for later inspection.
///
/// Listeners are removed again when the recorder is dropped.
pub struct EventRecorder<E: BusEvent = StateEvent> {
    bus: Arc<EventBus<E>>,
    listeners: Vec<(E::Kind, ListenerId)>,
    rx: mpsc::UnboundedReceiver<E>,
    held: Vec<E>,
}

impl EventRecorder<StateEvent> {
    /// Record every state event type
    pub fn attach(bus: &Arc<EventBus<StateEvent>>) -> Self {
        Self::attach_kinds(bus, &StateEventType::ALL)
    }
}

impl<E: BusEvent> EventRecorder<E> {
    /// Record only the given event kinds
    pub fn attach_kinds(bus: &Arc<EventBus<E>>, kinds: &[E::Kind]) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let listeners = kinds
            .iter()
            .map(|&kind| {
                let tx = tx.clone();
                let id = bus.on(kind, move |event: &E| {
                    let _ = tx.send(event.clone());
                });
                (kind, id)
            })
            .collect();
        Self {
            bus: Arc::clone(bus),
            listeners,
            rx,
            held: Vec::new(),
        }
    }

    /// Drain all recorded events, oldest first.
    pub fn drain_emitted(&mut self) -> Vec<E> {
        let mut events = std::mem::take(&mut self.held);
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Drain only the events of one kind; the rest stay recorded.
    pub fn drain_kind(&mut self, kind: E::Kind) -> Vec<E> {
        let (matching, rest): (Vec<E>, Vec<E>) = self
            .drain_emitted()
            .into_iter()
            .partition(|event| event.kind() == kind);
        self.held = rest;
        matching
    }

    /// Check if any event was recorded. Drains the recorder.
    pub fn has_emitted(&mut self) -> bool {
        !self.drain_emitted().is_empty()
    }
}

impl<E: BusEvent> Drop for EventRecorder<E> {
    fn drop(&mut self) {
        for (kind, id) in self.listeners.drain(..) {
            self.bus.off(kind, id);
        }
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Value(Value),
    Fail(TransportError),
}

/// A scripted [`Transport`].
///
/// Answers `null` by default, which a request waiting for an
/// acknowledgement treats as "ack follows out of band".
#[derive(Debug)]
pub struct MockTransport {
    reply: Reply,
    delay: Option<Duration>,
    sent: Mutex<Vec<Request>>,
    completed: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            reply: Reply::Value(Value::Null),
            delay: None,
            sent: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    /// Answer only after `delay` (tokio time, so it can be paused)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer every request with `value`
    pub fn responding(mut self, value: Value) -> Self {
        self.reply = Reply::Value(value);
        self
    }

    /// Fail every request with `error`
    pub fn failing(mut self, error: TransportError) -> Self {
        self.reply = Reply::Fail(error);
        self
    }

    /// Every request received so far, in order
    pub fn sent(&self) -> Vec<Request> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of sends that ran to completion (were not dropped mid-delay)
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: Request) -> Result<Value, TransportError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Reply::Value(value) => Ok(value.clone()),
            Reply::Fail(error) => Err(error.clone()),
        }
    }
}

/// A [`MemoryArea`] that yields before every call.
///
/// Concurrent tasks on a current-thread runtime interleave at each storage
/// access, the way they would against real asynchronous storage.
#[derive(Debug)]
pub struct YieldingArea {
    inner: MemoryArea,
}

impl YieldingArea {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: MemoryArea::new(name),
        }
    }
}

#[async_trait]
impl KeyValueArea for YieldingArea {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>, StorageError> {
        tokio::task::yield_now().await;
        self.inner.get(keys).await
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.inner.set(items).await
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.inner.remove(keys).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.inner.clear().await
    }
}

/// Pause tokio time so timers only move via [`advance_time`].
///
/// Must be called from within a current-thread runtime.
#[cfg(feature = "testing-time")]
pub fn pause_time() {
    tokio::time::pause();
}

/// Move paused tokio time forward, firing any timers that come due
#[cfg(feature = "testing-time")]
pub async fn advance_time(duration: Duration) {
    tokio::time::advance(duration).await;
}

#[cfg(feature = "testing-time")]
pub fn resume_time() {
    tokio::time::resume();
}

/// Assert that a specific event was emitted.
///
/// # Example
///
/// ```ignore
/// let events = recorder.drain_emitted();
/// assert_emitted!(events, StateEvent::Added(_));
/// assert_emitted!(events, StateEvent::Deleted { id } if id == "qt-1");
/// ```
#[macro_export]
macro_rules! assert_emitted {
    ($events:expr, $pattern:pat $(if $guard:expr)?) => {
        assert!(
            $events.iter().any(|e| matches!(e, $pattern $(if $guard)?)),
            "Expected event matching `{}` to be emitted, but got: {:?}",
            stringify!($pattern),
            $events
        );
    };
}

/// Assert that a specific event was NOT emitted.
#[macro_export]
macro_rules! assert_not_emitted {
    ($events:expr, $pattern:pat $(if $guard:expr)?) => {
        assert!(
            !$events.iter().any(|e| matches!(e, $pattern $(if $guard)?)),
            "Expected event matching `{}` NOT to be emitted, but it was: {:?}",
            stringify!($pattern),
            $events
        );
    };
}

/// Find and return the first event matching a pattern.
#[macro_export]
macro_rules! find_emitted {
    ($events:expr, $pattern:pat $(if $guard:expr)?) => {
        $events.iter().find(|e| matches!(e, $pattern $(if $guard)?))
    };
}

/// Count how many events match a pattern.
///
/// # Example
///
/// ```ignore
/// let events = recorder.drain_emitted();
/// assert_eq!(count_emitted!(events, StateEvent::Updated(_)), 3);
/// ```
#[macro_export]
macro_rules! count_emitted {
    ($events:expr, $pattern:pat $(if $guard:expr)?) => {
        $events.iter().filter(|e| matches!(e, $pattern $(if $guard)?)).count()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_drain_and_detach() {
        let bus = Arc::new(EventBus::new());
        let mut recorder = EventRecorder::attach(&bus);
        assert_eq!(bus.total_listeners(), StateEventType::ALL.len());

        bus.emit(StateEvent::Deleted { id: "a".into() });
        bus.emit(StateEvent::Hydrated {
            added: 0,
            updated: 0,
            deleted: 1,
        });

        let events = recorder.drain_emitted();
        assert_eq!(events.len(), 2);
        assert!(recorder.drain_emitted().is_empty());

        drop(recorder);
        assert_eq!(bus.total_listeners(), 0);
    }

    #[test]
    fn test_drain_kind_keeps_the_rest() {
        let bus = Arc::new(EventBus::new());
        let mut recorder = EventRecorder::attach(&bus);

        bus.emit(StateEvent::Deleted { id: "a".into() });
        bus.emit(StateEvent::Deleted { id: "b".into() });
        bus.emit(StateEvent::Hydrated {
            added: 0,
            updated: 0,
            deleted: 2,
        });

        assert_eq!(recorder.drain_kind(StateEventType::Deleted).len(), 2);

        bus.emit(StateEvent::Deleted { id: "c".into() });
        let rest = recorder.drain_emitted();
        assert_eq!(rest.len(), 2);
        assert_emitted!(rest, StateEvent::Hydrated { .. });
        assert_emitted!(rest, StateEvent::Deleted { id } if id == "c");
    }

    #[test]
    fn test_assert_macros() {
        let events = vec![
            StateEvent::Deleted { id: "a".into() },
            StateEvent::Deleted { id: "b".into() },
        ];

        assert_emitted!(events, StateEvent::Deleted { .. });
        assert_not_emitted!(events, StateEvent::Added(_));
        assert!(find_emitted!(events, StateEvent::Deleted { id } if id == "b").is_some());
        assert_eq!(count_emitted!(events, StateEvent::Deleted { .. }), 2);
    }

    #[tokio::test]
    async fn test_mock_transport_records_requests() {
        let transport = MockTransport::new().responding(Value::Bool(true));
        let request = Request {
            request_id: crate::protocol::RequestId::new("req-1"),
            action: "PING".into(),
            payload: Value::Null,
        };
        assert_eq!(transport.send(request).await, Ok(Value::Bool(true)));
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.completed(), 1);
    }
}
