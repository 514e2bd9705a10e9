//! Adaptive batching and coalescing of outbound mutation intents
//!
//! The batcher moves through `Idle → WindowOpen → Flushing → Idle`. The first
//! enqueue opens a window; rapid follow-ups stretch it up to a hard cap; when
//! it closes, the queued operations are coalesced per Quick Tab and handed to
//! a single flush callback.
//!
//! # Example
//!
//! ```ignore
//! use quicktab_sync_core::batcher::MessageBatcher;
//! use quicktab_sync_core::model::OpType;
//!
//! let batcher = MessageBatcher::new(BatcherConfig::default(), |batch| {
//!     println!("{} ops coalesced into {}", batch.original_count, batch.coalesced_count);
//! });
//!
//! batcher.queue("qt-1", OpType::Update, json!({ "left": 1 }), None);
//! batcher.queue("qt-1", OpType::Update, json!({ "left": 2 }), None);
//! // ~50ms later the callback receives one update with { "left": 2 }
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::panic_message;
use crate::config::BatcherConfig;
use crate::model::{now_ms, OpType, PendingOperation};

/// What a flush hands to the callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub operations: Vec<PendingOperation>,
    /// Operations in the window when it closed, before TTL pruning
    pub original_count: usize,
    pub coalesced_count: usize,
    /// Milliseconds between the first enqueue and the flush
    pub window_duration: u64,
    pub extensions: u32,
    pub pruned_count: usize,
    pub correlation_ids: Vec<String>,
}

/// Observable phase of the batcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    WindowOpen,
    Flushing,
}

/// Diagnostic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatcherStats {
    pub queued: u64,
    pub flushed_batches: u64,
    pub flushed_operations: u64,
    pub overflow_dropped: u64,
    pub ttl_pruned: u64,
    pub cancelled: u64,
}

struct QueuedOperation {
    op: PendingOperation,
    enqueued_at: Instant,
}

struct BatchWindow {
    operations: Vec<QueuedOperation>,
    window_start: Instant,
    deadline: Instant,
    last_enqueue: Instant,
    extensions: u32,
}

struct Inner {
    config: BatcherConfig,
    window: Option<BatchWindow>,
    flushing: bool,
    timer: Option<AbortHandle>,
    stats: BatcherStats,
}

type FlushFn = Arc<dyn Fn(BatchPayload) + Send + Sync>;

/// Collects per-entity mutation intents and releases them in batches.
///
/// Requires a tokio runtime: the window timer runs as a spawned task.
pub struct MessageBatcher {
    inner: Arc<Mutex<Inner>>,
    on_flush: FlushFn,
}

impl std::fmt::Debug for MessageBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBatcher")
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl MessageBatcher {
    /// Create a batcher that calls `on_flush` for every released batch
    pub fn new<F>(config: BatcherConfig, on_flush: F) -> Self
    where
        F: Fn(BatchPayload) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                window: None,
                flushing: false,
                timer: None,
                stats: BatcherStats::default(),
            })),
            on_flush: Arc::new(on_flush),
        }
    }

    /// Create a batcher that forwards released batches into a channel
    pub fn with_sender(config: BatcherConfig, tx: mpsc::UnboundedSender<BatchPayload>) -> Self {
        Self::new(config, move |batch| {
            if tx.send(batch).is_err() {
                debug!("Batch channel closed, dropping batch");
            }
        })
    }

    /// Queue one mutation intent
    pub fn queue(
        &self,
        quick_tab_id: impl Into<String>,
        op_type: OpType,
        data: Value,
        correlation_id: Option<String>,
    ) {
        let op = PendingOperation {
            quick_tab_id: quick_tab_id.into(),
            op_type,
            data,
            timestamp: now_ms(),
            correlation_id,
        };
        self.queue_operation(op);
    }

    /// Queue a prepared operation, keeping its timestamp
    pub fn queue_operation(&self, op: PendingOperation) {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        let config = inner.config.clone();
        inner.stats.queued += 1;

        match inner.window.as_mut() {
            None => {
                inner.window = Some(BatchWindow {
                    operations: vec![QueuedOperation {
                        op,
                        enqueued_at: now,
                    }],
                    window_start: now,
                    deadline: now + config.initial_window,
                    last_enqueue: now,
                    extensions: 0,
                });
                inner.timer = Some(self.spawn_timer());
                debug!("Batch window opened");
            }
            Some(window) => {
                let mut dropped = 0;
                if window.operations.len() >= config.max_queue_size {
                    dropped = (window.operations.len() / 10).max(1);
                    window.operations.drain(..dropped);
                }

                if now.duration_since(window.last_enqueue) < config.extension_threshold {
                    let cap = window.window_start + config.max_window;
                    let extended = (now + config.extension_threshold).min(cap);
                    if extended > window.deadline {
                        window.deadline = extended;
                        window.extensions += 1;
                    }
                }
                window.last_enqueue = now;
                window.operations.push(QueuedOperation {
                    op,
                    enqueued_at: now,
                });

                if dropped > 0 {
                    inner.stats.overflow_dropped += dropped as u64;
                    warn!(
                        dropped,
                        capacity = config.max_queue_size,
                        "Batch queue overflow, dropped oldest operations"
                    );
                }
            }
        }
    }

    /// Release the current window immediately
    pub fn flush(&self) {
        if let Some(timer) = lock(&self.inner).timer.take() {
            timer.abort();
        }
        flush_window(&self.inner, &self.on_flush);
    }

    /// Discard pending work without calling the flush callback
    pub fn cancel(&self) {
        let mut inner = lock(&self.inner);
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if let Some(window) = inner.window.take() {
            let count = window.operations.len();
            inner.stats.cancelled += count as u64;
            debug!(count, "Batch cancelled");
        }
    }

    pub fn state(&self) -> BatchState {
        let inner = lock(&self.inner);
        if inner.flushing {
            BatchState::Flushing
        } else if inner.window.is_some() {
            BatchState::WindowOpen
        } else {
            BatchState::Idle
        }
    }

    /// Operations waiting in the open window
    pub fn pending_len(&self) -> usize {
        lock(&self.inner)
            .window
            .as_ref()
            .map(|w| w.operations.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BatcherStats {
        lock(&self.inner).stats
    }

    fn spawn_timer(&self) -> AbortHandle {
        let inner = Arc::clone(&self.inner);
        let on_flush = Arc::clone(&self.on_flush);
        tokio::spawn(async move {
            loop {
                let deadline = match lock(&inner).window.as_ref() {
                    Some(window) => window.deadline,
                    None => return,
                };
                tokio::time::sleep_until(deadline).await;
                let extended = match lock(&inner).window.as_ref() {
                    Some(window) => window.deadline > Instant::now(),
                    None => return,
                };
                if !extended {
                    break;
                }
            }
            lock(&inner).timer = None;
            flush_window(&inner, &on_flush);
        })
        .abort_handle()
    }
}

impl Drop for MessageBatcher {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.inner).timer.take() {
            timer.abort();
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn flush_window(inner: &Mutex<Inner>, on_flush: &FlushFn) {
    let now = Instant::now();
    let (payload, ttl) = {
        let mut guard = lock(inner);
        let Some(window) = guard.window.take() else {
            return;
        };
        guard.flushing = true;
        let ttl = guard.config.item_ttl;

        let original_count = window.operations.len();
        let (fresh, stale): (Vec<_>, Vec<_>) = window
            .operations
            .into_iter()
            .partition(|queued| now.duration_since(queued.enqueued_at) <= ttl);
        let pruned_count = stale.len();
        guard.stats.ttl_pruned += pruned_count as u64;

        let operations: Vec<PendingOperation> = fresh.into_iter().map(|q| q.op).collect();
        let mut correlation_ids: Vec<String> = Vec::new();
        for id in operations.iter().filter_map(|op| op.correlation_id.as_ref()) {
            if !correlation_ids.contains(id) {
                correlation_ids.push(id.clone());
            }
        }
        let operations = coalesce(operations);

        let payload = BatchPayload {
            coalesced_count: operations.len(),
            operations,
            original_count,
            window_duration: now.duration_since(window.window_start).as_millis() as u64,
            extensions: window.extensions,
            pruned_count,
            correlation_ids,
        };
        (payload, ttl)
    };

    if payload.operations.is_empty() {
        debug!(
            pruned = payload.pruned_count,
            ttl_ms = ttl.as_millis() as u64,
            "Every queued operation expired, nothing to flush"
        );
    } else {
        {
            let mut guard = lock(inner);
            guard.stats.flushed_batches += 1;
            guard.stats.flushed_operations += payload.operations.len() as u64;
        }
        debug!(
            original = payload.original_count,
            coalesced = payload.coalesced_count,
            extensions = payload.extensions,
            window_ms = payload.window_duration,
            "Flushing batch"
        );
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| on_flush(payload))) {
            warn!(error = %panic_message(&panic), "Batch flush callback panicked");
        }
    }

    lock(inner).flushing = false;
}

/// Coalesce operations per Quick Tab id, preserving first-arrival order.
///
/// - a later `delete` replaces everything before it and is terminal
/// - anything after a `delete` is dropped
/// - `create` then `update` merges into one `create`
/// - `update` then `update` merges fields, later values winning
/// - a later `create` replaces whatever came before it
pub fn coalesce(operations: Vec<PendingOperation>) -> Vec<PendingOperation> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, PendingOperation> = HashMap::new();

    for op in operations {
        let Some(existing) = merged.get_mut(&op.quick_tab_id) else {
            order.push(op.quick_tab_id.clone());
            merged.insert(op.quick_tab_id.clone(), op);
            continue;
        };

        match (existing.op_type, op.op_type) {
            (OpType::Delete, _) => {
                debug!(id = %op.quick_tab_id, op = op.op_type.name(), "Dropping operation after delete");
            }
            (_, OpType::Delete) | (_, OpType::Create) => *existing = op,
            (OpType::Create | OpType::Update, OpType::Update) => {
                merge_data(&mut existing.data, op.data);
                existing.timestamp = op.timestamp;
                if op.correlation_id.is_some() {
                    existing.correlation_id = op.correlation_id;
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| merged.remove(&id))
        .collect()
}

/// Grouped entity fields and the flat keys that address their members
const GROUPED_FIELDS: [(&str, &[&str]); 3] = [
    ("position", &["left", "top"]),
    ("size", &["width", "height"]),
    ("visibility", &["minimized"]),
];

/// Field-wise merge, later values winning; non-object data is replaced
/// outright.
///
/// Grouped fields (`position`, `size`, `visibility`) merge member by member,
/// whether they arrive nested or as flat keys, so a partial update never
/// erases the members it does not mention. Other values, `metadata`
/// included, are replaced whole.
fn merge_data(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(target), Value::Object(incoming)) => {
            for (key, value) in incoming {
                merge_key(target, key, value);
            }
        }
        (target, incoming) => *target = incoming,
    }
}

fn merge_key(target: &mut Map<String, Value>, key: String, value: Value) {
    let is_group = GROUPED_FIELDS.iter().any(|(group, _)| *group == key);
    match value {
        Value::Object(members) if is_group => {
            for (member, member_value) in members {
                merge_key(target, member, member_value);
            }
        }
        value => {
            // A flat member lands inside its group when the target keeps one
            let group = GROUPED_FIELDS
                .iter()
                .find(|(_, members)| members.contains(&key.as_str()))
                .map(|(group, _)| *group);
            if let Some(Value::Object(nested)) = group.and_then(|group| target.get_mut(group)) {
                nested.insert(key, value);
            } else {
                target.insert(key, value);
            }
        }
    }
}
