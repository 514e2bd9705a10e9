//! In-context state store for Quick Tabs
//!
//! The store is the only owner of a context's Quick Tab map. Every mutation
//! goes through a [`Middleware`] hook and announces itself on the shared
//! [`EventBus`] so renderers never poll.
//!
//! # Example
//!
//! ```ignore
//! let bus = Arc::new(EventBus::new());
//! let mut store = StateStore::new(Arc::clone(&bus));
//!
//! bus.on(StateEventType::Added, |event| println!("added {:?}", event.quick_tab_id()));
//! store.add(tab);
//! store.update_with_queue("qt-9", OpType::Update, json!({ "left": 40 })); // queued
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::entity::field_updates;
use crate::event::{QuickTabChanges, StateEvent};
use crate::model::{now_ms, OpType, PendingOperation, QuickTab};

/// A mutation applied to the store, as seen by middleware
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Add { id: String },
    Update { id: String },
    Delete { id: String },
    Hydrate { incoming: usize, silent: bool },
    Apply { id: String, op: OpType },
    BringToFront { id: String },
    MergeRemote { id: String },
    PrunePending { max_age: Duration },
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Add { .. } => "Add",
            Mutation::Update { .. } => "Update",
            Mutation::Delete { .. } => "Delete",
            Mutation::Hydrate { silent: false, .. } => "Hydrate",
            Mutation::Hydrate { silent: true, .. } => "HydrateSilent",
            Mutation::Apply { .. } => "Apply",
            Mutation::BringToFront { .. } => "BringToFront",
            Mutation::MergeRemote { .. } => "MergeRemote",
            Mutation::PrunePending { .. } => "PrunePending",
        }
    }
}

/// Middleware trait for intercepting store mutations
pub trait Middleware {
    /// Called before the mutation is applied
    fn before(&mut self, mutation: &Mutation);

    /// Called after the mutation is applied
    fn after(&mut self, mutation: &Mutation, state_changed: bool);
}

/// A no-op middleware that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMiddleware;

impl Middleware for NoopMiddleware {
    fn before(&mut self, _mutation: &Mutation) {}
    fn after(&mut self, _mutation: &Mutation, _state_changed: bool) {}
}

/// Middleware that logs mutations at debug level
#[derive(Debug, Clone)]
pub struct LoggingMiddleware {
    /// Whether to log before the mutation
    pub log_before: bool,
    /// Whether to log after the mutation
    pub log_after: bool,
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingMiddleware {
    /// Log after each mutation only
    pub fn new() -> Self {
        Self {
            log_before: false,
            log_after: true,
        }
    }

    pub fn verbose() -> Self {
        Self {
            log_before: true,
            log_after: true,
        }
    }
}

impl Middleware for LoggingMiddleware {
    fn before(&mut self, mutation: &Mutation) {
        if self.log_before {
            debug!(mutation = %mutation.name(), detail = ?mutation, "Applying mutation");
        }
    }

    fn after(&mut self, mutation: &Mutation, state_changed: bool) {
        if self.log_after {
            debug!(
                mutation = %mutation.name(),
                state_changed = state_changed,
                "Mutation applied"
            );
        }
    }
}

/// Compose multiple middleware into one
#[derive(Default)]
pub struct ComposedMiddleware {
    middlewares: Vec<Box<dyn Middleware + Send>>,
}

impl std::fmt::Debug for ComposedMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedMiddleware")
            .field("middlewares_count", &self.middlewares.len())
            .finish()
    }
}

impl ComposedMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Middleware + Send + 'static>(&mut self, middleware: M) {
        self.middlewares.push(Box::new(middleware));
    }
}

impl Middleware for ComposedMiddleware {
    fn before(&mut self, mutation: &Mutation) {
        for middleware in &mut self.middlewares {
            middleware.before(mutation);
        }
    }

    fn after(&mut self, mutation: &Mutation, state_changed: bool) {
        // Reverse order for proper nesting
        for middleware in self.middlewares.iter_mut().rev() {
            middleware.after(mutation, state_changed);
        }
    }
}

/// Options for [`StateStore::hydrate`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrateOptions {
    /// Emit `state:quicktab:changed` for shared tabs whose geometry or
    /// stacking differs
    pub detect_changes: bool,
}

/// What a hydration pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrateSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl HydrateSummary {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Result of [`StateStore::update_with_queue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Applied to an existing (or newly created) tab
    Applied,
    /// The target does not exist yet; replayed when it is added
    Queued,
    /// Invalid data, or nothing to delete
    Rejected,
}

/// Holds the Quick Tabs known to one context.
///
/// The type parameter selects the middleware; [`StateStore::new`] uses
/// [`LoggingMiddleware`].
pub struct StateStore<M: Middleware = LoggingMiddleware> {
    tabs: HashMap<String, QuickTab>,
    pending: Vec<PendingOperation>,
    next_z_index: u64,
    bus: Arc<EventBus<StateEvent>>,
    middleware: M,
}

impl<M: Middleware> std::fmt::Debug for StateStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("tabs", &self.tabs.len())
            .field("pending", &self.pending.len())
            .field("next_z_index", &self.next_z_index)
            .finish()
    }
}

impl StateStore<LoggingMiddleware> {
    /// Create an empty store publishing to `bus`
    pub fn new(bus: Arc<EventBus<StateEvent>>) -> Self {
        Self::with_middleware(bus, LoggingMiddleware::new())
    }
}

impl<M: Middleware> StateStore<M> {
    pub fn with_middleware(bus: Arc<EventBus<StateEvent>>, middleware: M) -> Self {
        Self {
            tabs: HashMap::new(),
            pending: Vec::new(),
            next_z_index: 1,
            bus,
            middleware,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus<StateEvent>> {
        &self.bus
    }

    pub fn middleware(&self) -> &M {
        &self.middleware
    }

    pub fn middleware_mut(&mut self) -> &mut M {
        &mut self.middleware
    }

    pub fn get(&self, id: &str) -> Option<&QuickTab> {
        self.tabs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tabs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    /// All tabs, in no particular order
    pub fn tabs(&self) -> impl Iterator<Item = &QuickTab> {
        self.tabs.values()
    }

    /// All tabs ordered by slot, ready to persist
    pub fn snapshot(&self) -> Vec<QuickTab> {
        let mut tabs: Vec<QuickTab> = self.tabs.values().cloned().collect();
        tabs.sort_by(|a, b| a.slot.cmp(&b.slot).then_with(|| a.id.cmp(&b.id)));
        tabs
    }

    /// Insert a tab, replacing any tab with the same id as a whole.
    ///
    /// A new tab gets a slot and emits `state:added`; queued updates for it
    /// are then replayed. Replacing an existing tab keeps its slot and emits
    /// `state:updated` only if the content differs.
    pub fn add(&mut self, tab: QuickTab) -> bool {
        let mutation = Mutation::Add { id: tab.id.clone() };
        self.middleware.before(&mutation);
        let changed = self.insert(tab, true);
        self.middleware.after(&mutation, changed);
        changed
    }

    /// Replace an existing tab. Unknown ids are ignored.
    pub fn update(&mut self, tab: QuickTab) -> bool {
        let mutation = Mutation::Update { id: tab.id.clone() };
        self.middleware.before(&mutation);
        let changed = if self.tabs.contains_key(&tab.id) {
            self.insert(tab, true)
        } else {
            warn!(id = %tab.id, "Update for unknown Quick Tab ignored");
            false
        };
        self.middleware.after(&mutation, changed);
        changed
    }

    /// Remove a tab and anything queued for it
    pub fn delete(&mut self, id: &str) -> bool {
        let mutation = Mutation::Delete { id: id.to_string() };
        self.middleware.before(&mutation);
        let changed = self.remove(id, true);
        self.middleware.after(&mutation, changed);
        changed
    }

    /// Converge on `incoming` as the authoritative set of tabs.
    ///
    /// Local-only tabs are deleted (in id order), new tabs added and shared
    /// tabs replaced. Identical state emits nothing.
    pub fn hydrate(&mut self, incoming: Vec<QuickTab>, options: HydrateOptions) -> HydrateSummary {
        let mutation = Mutation::Hydrate {
            incoming: incoming.len(),
            silent: false,
        };
        self.middleware.before(&mutation);
        let summary = self.converge(incoming, options.detect_changes, true);
        if !summary.is_empty() {
            self.bus.emit(StateEvent::Hydrated {
                added: summary.added,
                updated: summary.updated,
                deleted: summary.deleted,
            });
        }
        self.middleware.after(&mutation, !summary.is_empty());
        summary
    }

    /// [`hydrate`](Self::hydrate) without emitting any event
    pub fn hydrate_silent(&mut self, incoming: Vec<QuickTab>) -> HydrateSummary {
        let mutation = Mutation::Hydrate {
            incoming: incoming.len(),
            silent: true,
        };
        self.middleware.before(&mutation);
        let summary = self.converge(incoming, false, false);
        self.middleware.after(&mutation, !summary.is_empty());
        summary
    }

    /// Apply a mutation intent, queueing updates whose target is missing
    pub fn update_with_queue(
        &mut self,
        quick_tab_id: impl Into<String>,
        op_type: OpType,
        data: Value,
    ) -> UpdateOutcome {
        self.apply_operation(PendingOperation::new(quick_tab_id, op_type, data))
    }

    /// Apply a prepared operation; see [`update_with_queue`](Self::update_with_queue)
    pub fn apply_operation(&mut self, op: PendingOperation) -> UpdateOutcome {
        let mutation = Mutation::Apply {
            id: op.quick_tab_id.clone(),
            op: op.op_type,
        };
        self.middleware.before(&mutation);

        let outcome = match op.op_type {
            OpType::Create => match QuickTab::from_value(&op.data) {
                Ok(tab) if tab.id == op.quick_tab_id => {
                    self.insert(tab, true);
                    UpdateOutcome::Applied
                }
                Ok(tab) => {
                    warn!(id = %op.quick_tab_id, data_id = %tab.id, "Create payload id mismatch");
                    UpdateOutcome::Rejected
                }
                Err(error) => {
                    warn!(id = %op.quick_tab_id, %error, "Rejected create operation");
                    UpdateOutcome::Rejected
                }
            },
            OpType::Update => {
                if self.tabs.contains_key(&op.quick_tab_id) {
                    self.patch(&op.quick_tab_id, &op.data, true);
                    UpdateOutcome::Applied
                } else {
                    debug!(id = %op.quick_tab_id, "Target missing, queueing update");
                    self.pending.push(op);
                    UpdateOutcome::Queued
                }
            }
            OpType::Delete => {
                if self.remove(&op.quick_tab_id, true) {
                    UpdateOutcome::Applied
                } else {
                    self.pending.retain(|p| p.quick_tab_id != op.quick_tab_id);
                    UpdateOutcome::Rejected
                }
            }
        };

        self.middleware
            .after(&mutation, outcome != UpdateOutcome::Rejected);
        outcome
    }

    /// Number of queued updates across all ids
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_for(&self, id: &str) -> usize {
        self.pending.iter().filter(|op| op.quick_tab_id == id).count()
    }

    /// Drop queued updates older than `max_age`. Returns how many were dropped.
    pub fn prune_pending(&mut self, max_age: Duration) -> usize {
        let mutation = Mutation::PrunePending { max_age };
        self.middleware.before(&mutation);
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let before = self.pending.len();
        self.pending.retain(|op| op.timestamp >= cutoff);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(dropped, "Pruned stale pending updates");
        }
        self.middleware.after(&mutation, dropped > 0);
        dropped
    }

    /// Allocate the next stacking value. Never returns the same value twice.
    pub fn get_next_z_index(&mut self) -> u64 {
        let z = self.next_z_index;
        self.next_z_index += 1;
        z
    }

    /// Raise a tab above every other. Always allocates a fresh z-index.
    pub fn bring_to_front(&mut self, id: &str) -> Option<u64> {
        let mutation = Mutation::BringToFront { id: id.to_string() };
        self.middleware.before(&mutation);
        if !self.tabs.contains_key(id) {
            self.middleware.after(&mutation, false);
            return None;
        }
        let z = self.get_next_z_index();
        let updated = self.tabs.get_mut(id).map(|tab| {
            tab.z_index = z;
            tab.touch(now_ms());
            tab.clone()
        });
        if let Some(tab) = updated {
            self.bus.emit(StateEvent::Updated(tab));
        }
        self.middleware.after(&mutation, true);
        Some(z)
    }

    /// Apply one tab received from another context, last write wins.
    ///
    /// Writes with an older `lastModified` than the local copy are dropped.
    /// Timestamps come from each context's own clock and skew is not
    /// corrected.
    pub fn merge_remote(&mut self, tab: QuickTab) -> bool {
        let mutation = Mutation::MergeRemote { id: tab.id.clone() };
        self.middleware.before(&mutation);
        let changed = match self.tabs.get(&tab.id) {
            Some(local) if tab.last_modified < local.last_modified => {
                debug!(
                    id = %tab.id,
                    local = local.last_modified,
                    remote = tab.last_modified,
                    "Ignoring stale remote write"
                );
                false
            }
            _ => self.insert(tab, true),
        };
        self.middleware.after(&mutation, changed);
        changed
    }

    fn converge(&mut self, incoming: Vec<QuickTab>, detect_changes: bool, emit: bool) -> HydrateSummary {
        let mut summary = HydrateSummary::default();
        let incoming_ids: HashSet<&str> = incoming.iter().map(|tab| tab.id.as_str()).collect();

        let mut stale: Vec<String> = self
            .tabs
            .keys()
            .filter(|id| !incoming_ids.contains(id.as_str()))
            .cloned()
            .collect();
        stale.sort();
        for id in stale {
            if self.remove(&id, emit) {
                summary.deleted += 1;
            }
        }

        for tab in incoming {
            let previous = self.tabs.get(&tab.id).cloned();
            let id = tab.id.clone();
            if !self.insert(tab, emit) {
                continue;
            }
            let Some(previous) = previous else {
                summary.added += 1;
                continue;
            };
            summary.updated += 1;
            if emit && detect_changes {
                if let Some(current) = self.tabs.get(&id) {
                    let changes = QuickTabChanges::between(&previous, current);
                    if !changes.is_empty() {
                        self.bus.emit(StateEvent::QuickTabChanged { id, changes });
                    }
                }
            }
        }
        summary
    }

    /// Insert or replace. Returns `false` when nothing changed.
    fn insert(&mut self, mut tab: QuickTab, emit: bool) -> bool {
        self.next_z_index = self.next_z_index.max(tab.z_index.saturating_add(1));

        if let Some(existing) = self.tabs.get(&tab.id) {
            tab.slot = existing.slot;
            if *existing == tab {
                return false;
            }
            self.tabs.insert(tab.id.clone(), tab.clone());
            if emit {
                self.bus.emit(StateEvent::Updated(tab));
            }
            return true;
        }

        if tab.slot == 0 || self.slot_taken(tab.slot) {
            tab.slot = self.free_slot();
        }
        let id = tab.id.clone();
        self.tabs.insert(id.clone(), tab.clone());
        if emit {
            self.bus.emit(StateEvent::Added(tab));
        }
        self.replay_pending(&id, emit);
        true
    }

    fn remove(&mut self, id: &str, emit: bool) -> bool {
        self.pending.retain(|op| op.quick_tab_id != id);
        if self.tabs.remove(id).is_none() {
            return false;
        }
        if emit {
            self.bus.emit(StateEvent::Deleted { id: id.to_string() });
        }
        true
    }

    /// Write the fields in `data` onto an existing tab
    fn patch(&mut self, id: &str, data: &Value, emit: bool) -> bool {
        let Some(tab) = self.tabs.get_mut(id) else {
            return false;
        };
        let mut changed = false;
        for (field, value) in field_updates(data) {
            match tab.set_field(field, value) {
                Ok(true) => changed = true,
                Ok(false) => {}
                Err(reason) => warn!(id, field = field.key(), %reason, "Rejected field update"),
            }
        }
        if !changed {
            return false;
        }
        tab.touch(now_ms());
        self.next_z_index = self.next_z_index.max(tab.z_index.saturating_add(1));
        let tab = tab.clone();
        if emit {
            self.bus.emit(StateEvent::Updated(tab));
        }
        true
    }

    fn replay_pending(&mut self, id: &str, emit: bool) {
        let (mut ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|op| op.quick_tab_id == id);
        self.pending = rest;
        if ready.is_empty() {
            return;
        }
        ready.sort_by_key(|op| op.timestamp);
        debug!(id, count = ready.len(), "Replaying pending updates");
        for op in ready {
            self.patch(id, &op.data, emit);
        }
    }

    fn slot_taken(&self, slot: u32) -> bool {
        self.tabs.values().any(|tab| tab.slot == slot)
    }

    fn free_slot(&self) -> u32 {
        let used: HashSet<u32> = self.tabs.values().map(|tab| tab.slot).collect();
        (1..).find(|slot| !used.contains(slot)).unwrap_or(1)
    }
}
