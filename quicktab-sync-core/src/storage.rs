//! Two-tier persistence for container buckets
//!
//! Each container id maps to one [`ContainerState`] bucket. Reads prefer the
//! fast ephemeral tier and fall back to the durable one; writes go to both
//! tiers concurrently and a failure in one never blocks the other.
//!
//! Read-modify-write cycles ([`PersistentStore::modify_bucket`] and the
//! per-tab helpers built on it) hold a per-container write lock across both
//! storage round trips, so concurrent writers never overwrite each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::model::{now_ms, ContainerState, Position, QuickTab, Size};

/// Container id used when the identity resolver has nothing better
pub const DEFAULT_CONTAINER: &str = "firefox-default";

/// An asynchronous key-value storage area
#[async_trait]
pub trait KeyValueArea: Send + Sync {
    /// Fetch the values stored under `keys`. Missing keys are absent from the map.
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>, StorageError>;

    async fn set(&self, items: HashMap<String, Value>) -> Result<(), StorageError>;

    async fn remove(&self, keys: &[String]) -> Result<(), StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;
}

/// In-memory [`KeyValueArea`] with an optional byte quota.
///
/// Counts reads and writes so tests can tell which tier served a load.
#[derive(Debug)]
pub struct MemoryArea {
    name: String,
    data: Mutex<HashMap<String, Value>>,
    quota: Option<usize>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryArea {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(HashMap::new()),
            quota: None,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Reject writes that would grow the serialized contents past `bytes`
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every call fail with [`StorageError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Store a raw value, bypassing quota and counters
    pub fn insert_raw(&self, key: impl Into<String>, value: Value) {
        self.lock().insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StorageError::Unavailable(self.name.clone()));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stored_size(data: &HashMap<String, Value>) -> usize {
    data.iter()
        .map(|(key, value)| key.len() + value.to_string().len())
        .sum()
}

#[async_trait]
impl KeyValueArea for MemoryArea {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>, StorageError> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.lock();
        Ok(keys
            .iter()
            .filter_map(|key| data.get(key).map(|value| (key.clone(), value.clone())))
            .collect())
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<(), StorageError> {
        self.check_available()?;
        let mut data = self.lock();
        if let Some(quota) = self.quota {
            let mut next = data.clone();
            next.extend(items.clone());
            let needed = stored_size(&next);
            if needed > quota {
                return Err(StorageError::QuotaExceeded { needed, quota });
            }
        }
        data.extend(items);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
        self.check_available()?;
        let mut data = self.lock();
        for key in keys {
            data.remove(key);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.check_available()?;
        self.lock().clear();
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Supplies the container id the current context belongs to
#[async_trait]
pub trait ContainerResolver: Send + Sync {
    async fn container_id(&self) -> String;
}

/// A resolver that always answers with the same container
#[derive(Debug, Clone)]
pub struct StaticContainer(pub String);

impl Default for StaticContainer {
    fn default() -> Self {
        Self(DEFAULT_CONTAINER.to_string())
    }
}

#[async_trait]
impl ContainerResolver for StaticContainer {
    async fn container_id(&self) -> String {
        self.0.clone()
    }
}

/// Which tier answered a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Ephemeral,
    Durable,
    /// Neither tier had the bucket
    Empty,
}

/// Per-tier result of a save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    pub durable: bool,
    pub ephemeral: bool,
}

impl SaveOutcome {
    /// Both tiers accepted the write
    pub fn is_complete(&self) -> bool {
        self.durable && self.ephemeral
    }

    /// At least one tier accepted the write
    pub fn any(&self) -> bool {
        self.durable || self.ephemeral
    }
}

/// Container-scoped persistence over a durable and an ephemeral tier
pub struct PersistentStore {
    durable: Arc<dyn KeyValueArea>,
    ephemeral: Arc<dyn KeyValueArea>,
    last_timestamp: AtomicU64,
    write_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("last_timestamp", &self.last_timestamp.load(Ordering::Relaxed))
            .finish()
    }
}

impl PersistentStore {
    pub fn new(durable: Arc<dyn KeyValueArea>, ephemeral: Arc<dyn KeyValueArea>) -> Self {
        Self {
            durable,
            ephemeral,
            last_timestamp: AtomicU64::new(0),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Both tiers backed by fresh [`MemoryArea`]s
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryArea::new("durable")),
            Arc::new(MemoryArea::new("ephemeral")),
        )
    }

    /// Load a container's bucket. Never fails: a total miss is an empty bucket.
    pub async fn load(&self, container: &str) -> ContainerState {
        self.load_with_source(container).await.0
    }

    /// Load a container's bucket and report which tier served it.
    ///
    /// A durable hit is copied into the ephemeral tier so the next load does
    /// not touch durable storage.
    pub async fn load_with_source(&self, container: &str) -> (ContainerState, LoadSource) {
        if let Some(state) = read_bucket(self.ephemeral.as_ref(), "ephemeral", container).await {
            return (state, LoadSource::Ephemeral);
        }

        if let Some(state) = read_bucket(self.durable.as_ref(), "durable", container).await {
            match bucket_item(container, &state) {
                Ok(items) => {
                    if let Err(error) = self.ephemeral.set(items).await {
                        warn!(container, %error, "Failed to cache bucket in ephemeral tier");
                    }
                }
                Err(error) => warn!(container, %error, "Failed to encode bucket"),
            }
            return (state, LoadSource::Durable);
        }

        debug!(container, "No stored bucket, starting empty");
        (ContainerState::empty(), LoadSource::Empty)
    }

    /// Write `tabs` as the container's bucket with a fresh timestamp
    pub async fn save(&self, container: &str, tabs: Vec<QuickTab>) -> SaveOutcome {
        let state = ContainerState {
            tabs,
            timestamp: self.next_timestamp(),
        };
        self.save_state(container, &state).await
    }

    /// Write a prepared bucket to both tiers concurrently
    pub async fn save_state(&self, container: &str, state: &ContainerState) -> SaveOutcome {
        let items = match bucket_item(container, state) {
            Ok(items) => items,
            Err(error) => {
                warn!(container, %error, "Failed to encode bucket");
                return SaveOutcome {
                    durable: false,
                    ephemeral: false,
                };
            }
        };

        let (durable, ephemeral) = tokio::join!(
            self.durable.set(items.clone()),
            self.ephemeral.set(items)
        );
        let outcome = SaveOutcome {
            durable: log_tier_result("durable", container, durable),
            ephemeral: log_tier_result("ephemeral", container, ephemeral),
        };
        debug!(
            container,
            tabs = state.tabs.len(),
            timestamp = state.timestamp,
            durable = outcome.durable,
            ephemeral = outcome.ephemeral,
            "Saved bucket"
        );
        outcome
    }

    /// Move one tab, addressed by id or url
    pub async fn update_position(&self, container: &str, key: &str, position: Position) -> bool {
        self.modify_tab(container, key, |tab| tab.position = position)
            .await
    }

    /// Resize one tab, addressed by id or url
    pub async fn update_size(&self, container: &str, key: &str, size: Size) -> bool {
        if !(size.width > 0.0 && size.height > 0.0) {
            warn!(container, key, ?size, "Rejected non-positive size");
            return false;
        }
        self.modify_tab(container, key, |tab| tab.size = size).await
    }

    /// Pin a tab to a page url, or unpin it with `None`
    pub async fn pin_tab(&self, container: &str, key: &str, pinned_to_url: Option<String>) -> bool {
        self.modify_tab(container, key, move |tab| tab.pinned_to_url = pinned_to_url)
            .await
    }

    /// Remove the container's bucket from both tiers
    pub async fn clear_container(&self, container: &str) -> SaveOutcome {
        let keys = [container.to_string()];
        let (durable, ephemeral) =
            tokio::join!(self.durable.remove(&keys), self.ephemeral.remove(&keys));
        SaveOutcome {
            durable: log_tier_result("durable", container, durable),
            ephemeral: log_tier_result("ephemeral", container, ephemeral),
        }
    }

    /// Load a bucket, let `apply` change it and save it back, holding the
    /// container's write lock for the whole cycle.
    ///
    /// `apply` returns its result and whether the bucket should be written.
    /// The outcome is `None` when nothing was written.
    ///
    /// Plain [`save`](Self::save) and [`load`](Self::load) do not take the
    /// lock; `apply` must not call back into this method.
    pub async fn modify_bucket<F, R>(&self, container: &str, apply: F) -> (R, Option<SaveOutcome>)
    where
        F: FnOnce(&mut ContainerState) -> (R, bool) + Send,
        R: Send,
    {
        let lock = self.write_lock(container);
        let _guard = lock.lock().await;

        let mut state = self.load(container).await;
        let (result, write) = apply(&mut state);
        if !write {
            return (result, None);
        }
        let outcome = self.save(container, state.tabs).await;
        (result, Some(outcome))
    }

    async fn modify_tab<F>(&self, container: &str, key: &str, apply: F) -> bool
    where
        F: FnOnce(&mut QuickTab) + Send,
    {
        let (found, outcome) = self
            .modify_bucket(container, |state| match state.find_mut(key) {
                Some(tab) => {
                    apply(tab);
                    tab.touch(now_ms());
                    (true, true)
                }
                None => (false, false),
            })
            .await;
        if !found {
            debug!(container, key, "No stored tab matches key");
        }
        outcome.is_some_and(|outcome| outcome.any())
    }

    fn write_lock(&self, container: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(container.to_string()).or_default())
    }

    /// Strictly increasing bucket timestamp, even within one millisecond
    fn next_timestamp(&self) -> u64 {
        let now = now_ms();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }
}

async fn read_bucket(area: &dyn KeyValueArea, tier: &str, container: &str) -> Option<ContainerState> {
    let keys = [container.to_string()];
    let mut values = match area.get(&keys).await {
        Ok(values) => values,
        Err(error) => {
            warn!(tier, container, %error, "Storage read failed");
            return None;
        }
    };
    let value = values.remove(container)?;
    match serde_json::from_value::<ContainerState>(value) {
        Ok(state) => Some(state),
        Err(error) => {
            warn!(tier, container, %error, "Malformed bucket treated as missing");
            None
        }
    }
}

fn bucket_item(container: &str, state: &ContainerState) -> Result<HashMap<String, Value>, StorageError> {
    let value = serde_json::to_value(state)?;
    Ok(HashMap::from([(container.to_string(), value)]))
}

fn log_tier_result(tier: &str, container: &str, result: Result<(), StorageError>) -> bool {
    match result {
        Ok(()) => true,
        Err(error) => {
            warn!(tier, container, %error, "Storage write failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::YieldingArea;
    use serde_json::json;

    fn tab(id: &str) -> QuickTab {
        QuickTab::new(
            id,
            format!("https://example.com/{id}"),
            Position::new(0.0, 0.0),
            Size::new(300.0, 200.0),
        )
        .unwrap()
    }

    fn tiers() -> (Arc<MemoryArea>, Arc<MemoryArea>, PersistentStore) {
        let durable = Arc::new(MemoryArea::new("durable"));
        let ephemeral = Arc::new(MemoryArea::new("ephemeral"));
        let store = PersistentStore::new(durable.clone(), ephemeral.clone());
        (durable, ephemeral, store)
    }

    #[tokio::test]
    async fn test_empty_load() {
        let (_, _, store) = tiers();
        let (state, source) = store.load_with_source(DEFAULT_CONTAINER).await;
        assert_eq!(source, LoadSource::Empty);
        assert!(state.tabs.is_empty());
        assert!(state.timestamp > 0);
    }

    #[tokio::test]
    async fn test_durable_fallback_fills_cache() {
        let (durable, ephemeral, store) = tiers();
        let state = ContainerState::new(vec![tab("a")]);
        durable.insert_raw("c1", serde_json::to_value(&state).unwrap());

        let (loaded, source) = store.load_with_source("c1").await;
        assert_eq!(source, LoadSource::Durable);
        assert_eq!(loaded, state);
        assert!(ephemeral.contains_key("c1"));

        let reads_before = durable.reads();
        let (_, source) = store.load_with_source("c1").await;
        assert_eq!(source, LoadSource::Ephemeral);
        assert_eq!(durable.reads(), reads_before);
    }

    #[tokio::test]
    async fn test_save_writes_both_tiers() {
        let (durable, ephemeral, store) = tiers();
        let outcome = store.save("c1", vec![tab("a")]).await;
        assert!(outcome.is_complete());
        assert!(durable.contains_key("c1"));
        assert!(ephemeral.contains_key("c1"));
    }

    #[tokio::test]
    async fn test_tier_failure_does_not_block_other() {
        let (durable, ephemeral, store) = tiers();
        ephemeral.set_unavailable(true);

        let outcome = store.save("c1", vec![tab("a")]).await;
        assert_eq!(
            outcome,
            SaveOutcome {
                durable: true,
                ephemeral: false
            }
        );
        assert!(durable.contains_key("c1"));

        // Unreadable ephemeral tier still falls back to durable
        let (state, source) = store.load_with_source("c1").await;
        assert_eq!(source, LoadSource::Durable);
        assert_eq!(state.tabs.len(), 1);
    }

    #[tokio::test]
    async fn test_containers_are_isolated() {
        let (_, _, store) = tiers();
        store.save("work", vec![tab("a")]).await;
        store.save("personal", vec![tab("b"), tab("c")]).await;

        assert_eq!(store.load("work").await.tabs.len(), 1);
        assert_eq!(store.load("personal").await.tabs.len(), 2);

        store.clear_container("work").await;
        assert!(store.load("work").await.tabs.is_empty());
        assert_eq!(store.load("personal").await.tabs.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_bucket_is_a_miss() {
        let (durable, ephemeral, store) = tiers();
        ephemeral.insert_raw("c1", json!({ "tabs": "not a list" }));
        let state = ContainerState::new(vec![tab("a")]);
        durable.insert_raw("c1", serde_json::to_value(&state).unwrap());

        let (loaded, source) = store.load_with_source("c1").await;
        assert_eq!(source, LoadSource::Durable);
        assert_eq!(loaded.tabs[0].id, "a");
    }

    #[tokio::test]
    async fn test_read_modify_write_helpers() {
        let (_, _, store) = tiers();
        store.save("c1", vec![tab("a"), tab("b")]).await;

        assert!(
            store
                .update_position("c1", "https://example.com/b", Position::new(5.0, 6.0))
                .await
        );
        assert!(store.update_size("c1", "a", Size::new(640.0, 480.0)).await);
        assert!(!store.update_size("c1", "a", Size::new(0.0, 480.0)).await);
        assert!(
            store
                .pin_tab("c1", "a", Some("https://pinned.example".into()))
                .await
        );
        assert!(!store.update_position("c1", "missing", Position::default()).await);

        let state = store.load("c1").await;
        let a = state.find("a").unwrap();
        assert_eq!(a.size, Size::new(640.0, 480.0));
        assert_eq!(a.pinned_to_url.as_deref(), Some("https://pinned.example"));
        assert_eq!(state.find("b").unwrap().position, Position::new(5.0, 6.0));
    }

    #[tokio::test]
    async fn test_concurrent_tab_edits_are_not_lost() {
        let store = PersistentStore::new(
            Arc::new(YieldingArea::new("durable")),
            Arc::new(YieldingArea::new("ephemeral")),
        );
        store.save("c1", vec![tab("a"), tab("b")]).await;

        let (moved, pinned) = tokio::join!(
            store.update_position("c1", "a", Position::new(40.0, 50.0)),
            store.pin_tab("c1", "b", Some("https://pinned.example".into())),
        );
        assert!(moved && pinned);

        let state = store.load("c1").await;
        assert_eq!(state.find("a").unwrap().position, Position::new(40.0, 50.0));
        assert_eq!(
            state.find("b").unwrap().pinned_to_url.as_deref(),
            Some("https://pinned.example")
        );
    }

    #[tokio::test]
    async fn test_modify_bucket_can_skip_the_write() {
        let (durable, _, store) = tiers();
        let (count, outcome) = store
            .modify_bucket("c1", |state| (state.tabs.len(), false))
            .await;
        assert_eq!(count, 0);
        assert!(outcome.is_none());
        assert_eq!(durable.writes(), 0);
    }

    #[tokio::test]
    async fn test_bucket_timestamps_increase() {
        let (_, _, store) = tiers();
        store.save("c1", vec![]).await;
        let first = store.load("c1").await.timestamp;
        store.save("c1", vec![]).await;
        let second = store.load("c1").await.timestamp;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let area = MemoryArea::new("small").with_quota(16);
        let err = area
            .set(HashMap::from([("key".to_string(), json!("a long value here"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { quota: 16, .. }));
        assert_eq!(area.writes(), 0);
    }

    #[tokio::test]
    async fn test_static_resolver_default() {
        assert_eq!(StaticContainer::default().container_id().await, "firefox-default");
    }
}
