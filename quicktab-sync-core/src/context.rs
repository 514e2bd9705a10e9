//! Wiring for one browser context
//!
//! A [`SyncContext`] owns the context-local pieces and connects them:
//! local edits go through a [`ReactiveQuickTab`] into the state store and the
//! batcher; released batches are sent to the coordinator; storage snapshots
//! come back through a [`StorageWatcher`] and are hydrated into the store.
//!
//! Each stored tab that has been edited or watched keeps one reactive entity
//! for the life of the tab, so field watchers survive across edits.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batcher::{BatchPayload, MessageBatcher};
use crate::bus::EventBus;
use crate::config::SyncConfig;
use crate::coordinator::{BatchReport, BATCH_UPDATE};
use crate::entity::{Field, FieldValue, ReactiveQuickTab, Unwatch};
use crate::event::StateEvent;
use crate::model::{ContainerState, OpType, QuickTab};
use crate::protocol::{MessageClient, Transport};
use crate::state::{HydrateOptions, HydrateSummary, StateStore};
use crate::storage::{ContainerResolver, PersistentStore};
use crate::watcher::StorageWatcher;

/// What became of the batches this context sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Batches the coordinator acknowledged
    pub delivered: u64,
    /// Batches that failed, timed out or were rejected as a whole
    pub failed: u64,
    pub rejected_operations: u64,
    pub skipped_operations: u64,
}

#[derive(Debug, Default)]
struct DeliveryCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected_operations: AtomicU64,
    skipped_operations: AtomicU64,
}

impl DeliveryCounters {
    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected_operations: self.rejected_operations.load(Ordering::Relaxed),
            skipped_operations: self.skipped_operations.load(Ordering::Relaxed),
        }
    }
}

/// Everything one context needs to keep its Quick Tabs in sync
pub struct SyncContext<T: Transport + 'static> {
    container: String,
    config: SyncConfig,
    bus: Arc<EventBus<StateEvent>>,
    state: StateStore,
    entities: HashMap<String, ReactiveQuickTab>,
    batcher: Arc<MessageBatcher>,
    client: Arc<MessageClient<T>>,
    store: Arc<PersistentStore>,
    watcher: Option<StorageWatcher>,
    forwarder: JoinHandle<()>,
    delivery: Arc<DeliveryCounters>,
    correlation: Arc<AtomicU64>,
}

impl<T: Transport + 'static> std::fmt::Debug for SyncContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("container", &self.container)
            .field("state", &self.state)
            .field("entities", &self.entities.len())
            .field("batcher", &self.batcher)
            .finish()
    }
}

impl<T: Transport + 'static> SyncContext<T> {
    /// Build a context for the container `resolver` reports.
    ///
    /// Spawns the task that sends released batches, so this must run inside
    /// a tokio runtime.
    pub async fn new(
        transport: T,
        store: Arc<PersistentStore>,
        resolver: &dyn ContainerResolver,
        config: SyncConfig,
    ) -> Self {
        let container = resolver.container_id().await;
        let bus = Arc::new(EventBus::with_sentinel(&config.sentinel));
        let client = Arc::new(MessageClient::new(transport, config.request.clone()));

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let batcher = Arc::new(MessageBatcher::with_sender(config.batcher.clone(), batch_tx));
        let delivery = Arc::new(DeliveryCounters::default());
        let forwarder = spawn_forwarder(
            Arc::clone(&client),
            container.clone(),
            Arc::clone(&delivery),
            batch_rx,
        );

        info!(container = %container, "Sync context started");
        Self {
            state: StateStore::new(Arc::clone(&bus)),
            entities: HashMap::new(),
            container,
            config,
            bus,
            batcher,
            client,
            store,
            watcher: None,
            forwarder,
            delivery,
            correlation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn bus(&self) -> &Arc<EventBus<StateEvent>> {
        &self.bus
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateStore {
        &mut self.state
    }

    pub fn batcher(&self) -> &MessageBatcher {
        &self.batcher
    }

    pub fn client(&self) -> &MessageClient<T> {
        &self.client
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.delivery.snapshot()
    }

    /// Load the container bucket and hydrate the store from it
    pub async fn load(&mut self) -> HydrateSummary {
        let snapshot = self.store.load(&self.container).await;
        self.apply_snapshot(snapshot)
    }

    /// Hydrate from a storage snapshot, reporting geometry changes
    pub fn apply_snapshot(&mut self, snapshot: ContainerState) -> HydrateSummary {
        let summary = self.state.hydrate(
            snapshot.tabs,
            HydrateOptions {
                detect_changes: true,
            },
        );
        let state = &self.state;
        self.entities.retain(|id, entity| {
            let keep = state.contains(id);
            if !keep {
                entity.destroy();
            }
            keep
        });
        summary
    }

    /// Start polling storage. Snapshots arrive on the returned channel.
    pub fn watch_storage(&mut self) -> mpsc::UnboundedReceiver<ContainerState> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(mut previous) = self.watcher.take() {
            previous.cancel();
        }
        self.watcher = Some(StorageWatcher::spawn(
            Arc::clone(&self.store),
            self.container.clone(),
            &self.config.watcher,
            tx,
        ));
        rx
    }

    /// Add a tab locally and queue its creation
    pub fn create(&mut self, mut tab: QuickTab) -> bool {
        if tab.cookie_store_id.is_none() {
            tab.cookie_store_id = Some(self.container.clone());
        }
        tab.z_index = self.state.get_next_z_index();
        let id = tab.id.clone();
        if !self.state.add(tab) {
            return false;
        }
        let data = self.state.get(&id).map(serde_json::to_value);
        match data {
            Some(Ok(data)) => self.queue(OpType::Create, id, data),
            Some(Err(error)) => warn!(id = %id, %error, "Failed to encode new Quick Tab"),
            None => {}
        }
        true
    }

    /// Write one field through the tab's reactive entity.
    ///
    /// Invalid or no-op writes change nothing and queue nothing.
    pub fn edit(&mut self, id: &str, field: Field, value: FieldValue) -> bool {
        let Some(tab) = self.state.get(id).cloned() else {
            warn!(id, field = field.key(), "Edit for unknown Quick Tab ignored");
            return false;
        };

        let entity = self.entity_for(tab);
        if !entity.set(field, value) {
            return false;
        }
        let updated = entity.tab().clone();
        self.state.update(updated)
    }

    /// Observe writes to one field of a stored tab. Callbacks receive
    /// `(new, old)`.
    ///
    /// Watchers fire for edits made through this context and stay registered
    /// until unwatched or the tab is deleted. Changes that arrive from
    /// storage are reported on the [`bus`](Self::bus) instead.
    pub fn watch<F>(&mut self, id: &str, field: Field, callback: F) -> Option<Unwatch>
    where
        F: Fn(&FieldValue, &FieldValue) + Send + Sync + 'static,
    {
        let tab = self.state.get(id).cloned()?;
        Some(self.entity_for(tab).watch(field, callback))
    }

    /// Raise a tab above every other and queue the new z-index
    pub fn bring_to_front(&mut self, id: &str) -> Option<u64> {
        let z = self.state.bring_to_front(id)?;
        self.queue(OpType::Update, id.to_string(), json!({ "zIndex": z }));
        Some(z)
    }

    /// Remove a tab locally and queue its deletion
    pub fn delete(&mut self, id: &str) -> bool {
        if !self.state.delete(id) {
            return false;
        }
        if let Some(mut entity) = self.entities.remove(id) {
            entity.destroy();
        }
        self.queue(OpType::Delete, id.to_string(), Value::Null);
        true
    }

    /// Release queued operations now instead of waiting for the window
    pub fn flush(&self) {
        self.batcher.flush();
    }

    /// Flush pending work, wait for it to be delivered, then stop
    /// background tasks and release subscriptions.
    ///
    /// Returns `true` if bus listeners were still subscribed.
    pub async fn shutdown(self) -> bool {
        let Self {
            container,
            bus,
            batcher,
            watcher,
            forwarder,
            ..
        } = self;

        batcher.flush();
        // Dropping the last batcher handle closes the channel and lets the
        // forwarder finish what was already released.
        drop(batcher);
        if let Err(error) = forwarder.await {
            warn!(container = %container, %error, "Batch forwarder ended abnormally");
        }
        if let Some(mut watcher) = watcher {
            watcher.cancel();
        }

        let leaked = bus.teardown();
        info!(container = %container, leaked, "Sync context stopped");
        leaked
    }

    fn queue(&self, op: OpType, id: String, data: Value) {
        let correlation_id = next_correlation_id(&self.container, &self.correlation);
        self.batcher.queue(id, op, data, Some(correlation_id));
    }

    /// The tab's entity, brought up to date with the stored copy
    fn entity_for(&mut self, tab: QuickTab) -> &mut ReactiveQuickTab {
        match self.entities.entry(tab.id.clone()) {
            Entry::Occupied(entry) => {
                let entity = entry.into_mut();
                entity.replace_tab(tab);
                entity
            }
            Entry::Vacant(entry) => {
                let batcher = Arc::clone(&self.batcher);
                let correlation = Arc::clone(&self.correlation);
                let container = self.container.clone();
                let entity = ReactiveQuickTab::with_config(
                    tab,
                    self.config.reactive.clone(),
                    &self.config.sentinel,
                )
                .on_sync(move |id, field, value| {
                    let mut data = Map::new();
                    data.insert(field.key().to_string(), value.to_json());
                    let correlation_id = next_correlation_id(&container, &correlation);
                    batcher.queue(id, OpType::Update, Value::Object(data), Some(correlation_id));
                });
                entry.insert(entity)
            }
        }
    }
}

fn next_correlation_id(container: &str, counter: &AtomicU64) -> String {
    let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{container}-op-{n}")
}

fn spawn_forwarder<T: Transport + 'static>(
    client: Arc<MessageClient<T>>,
    container: String,
    delivery: Arc<DeliveryCounters>,
    mut rx: mpsc::UnboundedReceiver<BatchPayload>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            let count = batch.operations.len();
            let payload = match serde_json::to_value(&batch) {
                Ok(batch) => json!({ "containerId": container, "batch": batch }),
                Err(error) => {
                    warn!(%error, "Failed to encode batch");
                    continue;
                }
            };
            let response = client.send_with_retry(BATCH_UPDATE, payload).await;
            if !response.is_success() {
                delivery.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    container = %container,
                    operations = count,
                    code = ?response.code(),
                    "Batch delivery failed"
                );
                continue;
            }

            delivery.delivered.fetch_add(1, Ordering::Relaxed);
            let report = response.data().and_then(BatchReport::from_ack);
            match report {
                Some(report) if report.rejected > 0 || report.skipped > 0 => {
                    delivery
                        .rejected_operations
                        .fetch_add(report.rejected as u64, Ordering::Relaxed);
                    delivery
                        .skipped_operations
                        .fetch_add(report.skipped as u64, Ordering::Relaxed);
                    warn!(
                        container = %container,
                        applied = report.applied,
                        skipped = report.skipped,
                        rejected = report.rejected,
                        "Batch delivered with operations not applied"
                    );
                }
                _ => debug!(container = %container, operations = count, "Batch delivered"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::model::{Position, Size};
    use crate::storage::StaticContainer;
    use crate::testing::{EventRecorder, MockTransport};
    use crate::{assert_emitted, count_emitted};
    use std::time::Duration;

    fn tab(id: &str) -> QuickTab {
        QuickTab::new(
            id,
            format!("https://example.com/{id}"),
            Position::new(10.0, 10.0),
            Size::new(300.0, 200.0),
        )
        .unwrap()
    }

    async fn context(store: &Arc<PersistentStore>) -> SyncContext<Coordinator> {
        SyncContext::new(
            Coordinator::new(Arc::clone(store)),
            Arc::clone(store),
            &StaticContainer("c1".into()),
            SyncConfig::default(),
        )
        .await
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_edits_reach_storage() {
        let store = Arc::new(PersistentStore::in_memory());
        let mut ctx = context(&store).await;

        assert!(ctx.create(tab("a")));
        assert!(ctx.edit("a", Field::Left, FieldValue::Number(42.0)));
        assert!(ctx.edit("a", Field::Title, FieldValue::Text("Docs".into())));
        settle().await;

        let stored = store.load("c1").await;
        assert_eq!(stored.tabs.len(), 1);
        assert_eq!(stored.tabs[0].position.left, 42.0);
        assert_eq!(stored.tabs[0].title, "Docs");
        assert_eq!(stored.tabs[0].cookie_store_id.as_deref(), Some("c1"));

        // One coalesced batch for the whole burst
        assert_eq!(ctx.client().stats().sent, 1);

        assert!(ctx.delete("a"));
        settle().await;
        assert!(store.load("c1").await.tabs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_edit_queues_nothing() {
        let store = Arc::new(PersistentStore::in_memory());
        let mut ctx = context(&store).await;
        ctx.create(tab("a"));
        ctx.flush();
        settle().await;

        assert!(!ctx.edit("a", Field::Width, FieldValue::Number(-5.0)));
        assert!(!ctx.edit("a", Field::Left, FieldValue::Number(10.0)));
        assert!(!ctx.edit("missing", Field::Left, FieldValue::Number(1.0)));
        assert_eq!(ctx.batcher().pending_len(), 0);
        assert_eq!(ctx.state().get("a").unwrap().size.width, 300.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bring_to_front_queues_z_index() {
        let store = Arc::new(PersistentStore::in_memory());
        let mut ctx = context(&store).await;
        ctx.create(tab("a"));
        ctx.create(tab("b"));

        let z = ctx.bring_to_front("a").unwrap();
        assert!(z > ctx.state().get("b").unwrap().z_index);
        assert!(ctx.bring_to_front("missing").is_none());
        settle().await;

        let stored = store.load("c1").await;
        assert_eq!(stored.find("a").unwrap().z_index, z);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_snapshots_hydrate_the_store() {
        let store = Arc::new(PersistentStore::in_memory());
        let mut ctx = context(&store).await;
        let mut recorder = EventRecorder::attach(ctx.bus());
        let mut snapshots = ctx.watch_storage();

        store.save("c1", vec![tab("remote")]).await;
        let snapshot = tokio::time::timeout(Duration::from_secs(2), snapshots.recv())
            .await
            .unwrap()
            .unwrap();
        let summary = ctx.apply_snapshot(snapshot);
        assert_eq!(summary.added, 1);
        assert!(ctx.state().contains("remote"));

        let events = recorder.drain_emitted();
        assert_emitted!(events, StateEvent::Added(tab) if tab.id == "remote");
        assert_eq!(count_emitted!(events, StateEvent::Hydrated { .. }), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_reads_container_bucket() {
        let store = Arc::new(PersistentStore::in_memory());
        store.save("c1", vec![tab("a"), tab("b")]).await;
        store.save("other", vec![tab("x")]).await;

        let mut ctx = context(&store).await;
        let summary = ctx.load().await;
        assert_eq!(summary.added, 2);
        assert!(!ctx.state().contains("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_delivers_pending_and_releases_listeners() {
        let store = Arc::new(PersistentStore::in_memory());
        let mut ctx = context(&store).await;
        let _listener = ctx.bus().on(crate::event::StateEventType::Added, |_| {});
        ctx.create(tab("a"));

        assert!(ctx.shutdown().await);
        assert_eq!(store.load("c1").await.tabs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchers_survive_across_edits() {
        let store = Arc::new(PersistentStore::in_memory());
        let mut ctx = context(&store).await;
        ctx.create(tab("a"));
        assert!(ctx.watch("missing", Field::Left, |_, _| {}).is_none());

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let unwatch = ctx
            .watch("a", Field::Left, move |new, old| {
                sink.lock().unwrap().push((new.clone(), old.clone()));
            })
            .unwrap();

        ctx.edit("a", Field::Left, FieldValue::Number(20.0));
        ctx.edit("a", Field::Title, FieldValue::Text("Docs".into()));
        ctx.edit("a", Field::Left, FieldValue::Number(30.0));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (FieldValue::Number(20.0), FieldValue::Number(10.0)),
                (FieldValue::Number(30.0), FieldValue::Number(20.0)),
            ]
        );

        assert!(ctx.delete("a"));
        assert!(!unwatch.unwatch());
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_after_snapshot_starts_from_stored_tab() {
        let store = Arc::new(PersistentStore::in_memory());
        let mut ctx = context(&store).await;
        ctx.create(tab("a"));
        ctx.edit("a", Field::Left, FieldValue::Number(42.0));

        let mut remote = ctx.state().get("a").unwrap().clone();
        remote.position.top = 99.0;
        remote.last_modified += 1_000;
        ctx.apply_snapshot(ContainerState::new(vec![remote]));
        assert_eq!(ctx.state().get("a").unwrap().position.top, 99.0);

        assert!(ctx.edit("a", Field::Title, FieldValue::Text("Docs".into())));
        let local = ctx.state().get("a").unwrap();
        assert_eq!(local.position.top, 99.0);
        assert_eq!(local.title, "Docs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_operations_are_counted() {
        let transport = MockTransport::new().responding(json!({
            "success": true,
            "data": { "applied": 0, "skipped": 1, "rejected": 2 },
        }));
        let mut ctx = SyncContext::new(
            transport,
            Arc::new(PersistentStore::in_memory()),
            &StaticContainer::default(),
            SyncConfig::default(),
        )
        .await;

        ctx.create(tab("a"));
        settle().await;
        assert_eq!(
            ctx.delivery_stats(),
            DeliveryStats {
                delivered: 1,
                failed: 0,
                rejected_operations: 2,
                skipped_operations: 1,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fully_rejected_batch_counts_as_failed() {
        let store = Arc::new(PersistentStore::in_memory());
        let ctx = context(&store).await;

        // A create the coordinator cannot decode
        ctx.batcher()
            .queue("bad", OpType::Create, json!({ "id": "bad" }), None);
        settle().await;

        let stats = ctx.delivery_stats();
        assert_eq!((stats.delivered, stats.failed), (0, 1));
        assert!(store.load("c1").await.tabs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_keeps_local_state() {
        let store = Arc::new(PersistentStore::in_memory());
        let transport = MockTransport::new().failing(crate::error::TransportError::NoReceiver);
        let mut ctx = SyncContext::new(
            transport,
            Arc::clone(&store),
            &StaticContainer::default(),
            SyncConfig::default(),
        )
        .await;

        ctx.create(tab("a"));
        settle().await;
        settle().await;

        assert!(ctx.state().contains("a"));
        assert_eq!(ctx.client().stats().disconnects, 3);
        assert_eq!(ctx.delivery_stats().failed, 1);
        assert!(store.load(ctx.container()).await.tabs.is_empty());
    }
}
