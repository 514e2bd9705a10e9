//! Polls persistent storage and forwards newer container snapshots
//!
//! A context runs one watcher for its container and feeds every snapshot it
//! receives into [`StateStore::hydrate`](crate::StateStore::hydrate).
//!
//! # Example
//!
//! ```ignore
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let watcher = StorageWatcher::spawn(store, "firefox-default", &WatcherConfig::default(), tx);
//!
//! while let Some(snapshot) = rx.recv().await {
//!     state.hydrate(snapshot.tabs, HydrateOptions { detect_changes: true });
//! }
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::WatcherConfig;
use crate::model::ContainerState;
use crate::storage::{LoadSource, PersistentStore};

/// Background poller for one container bucket.
///
/// Polls immediately, then on every interval. A snapshot is forwarded when
/// its timestamp is newer than the last one forwarded, or when the bucket
/// disappeared while tabs were last known.
pub struct StorageWatcher {
    container: String,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for StorageWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWatcher")
            .field("container", &self.container)
            .field("active", &self.is_active())
            .finish()
    }
}

impl StorageWatcher {
    pub fn spawn(
        store: Arc<PersistentStore>,
        container: impl Into<String>,
        config: &WatcherConfig,
        tx: mpsc::UnboundedSender<ContainerState>,
    ) -> Self {
        let container = container.into();
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let poll_interval = config.poll_interval;
        let watched = container.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = IntervalStream::new(interval);
            let mut last_timestamp = 0u64;
            let mut last_had_tabs = false;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                    }
                }

                let (state, source) = store.load_with_source(&watched).await;
                let forward = match source {
                    LoadSource::Empty => last_had_tabs,
                    _ => state.timestamp > last_timestamp,
                };
                if !forward {
                    continue;
                }

                if source != LoadSource::Empty {
                    last_timestamp = last_timestamp.max(state.timestamp);
                }
                last_had_tabs = !state.tabs.is_empty();
                debug!(
                    container = %watched,
                    tabs = state.tabs.len(),
                    timestamp = state.timestamp,
                    "Forwarding storage snapshot"
                );
                if tx.send(state).is_err() {
                    // Receiver dropped, stop polling
                    break;
                }
            }
            debug!(container = %watched, "Storage watcher stopped");
        });

        Self {
            container,
            cancel_token,
            handle: Some(handle),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Stop polling. Idempotent.
    pub fn cancel(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for StorageWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}
