//! quicktab-sync: Cross-context state synchronization for Quick Tabs
//!
//! Every browser context keeps its own copy of the floating Quick Tab
//! windows. Local edits are batched and sent to one coordinator, which owns
//! the stored state; every context picks up the result from storage and
//! reconciles, emitting events only for what changed.
//!
//! # Example
//! ```ignore
//! use quicktab_sync::prelude::*;
//!
//! let store = Arc::new(PersistentStore::in_memory());
//! let coordinator = Coordinator::new(Arc::clone(&store));
//! let mut ctx = SyncContext::new(coordinator, store, &StaticContainer::default(), SyncConfig::default()).await;
//!
//! ctx.bus().on(StateEventType::QuickTabChanged, |event| {
//!     tracing::info!(?event, "Quick Tab moved");
//! });
//!
//! let mut snapshots = ctx.watch_storage();
//! while let Some(snapshot) = snapshots.recv().await {
//!     ctx.apply_snapshot(snapshot);
//! }
//! ```

// Re-export everything from core
pub use quicktab_sync_core::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use quicktab_sync_core::prelude::*;

    // Middleware
    pub use quicktab_sync_core::{ComposedMiddleware, LoggingMiddleware, Middleware, NoopMiddleware};

    // Errors
    pub use quicktab_sync_core::{EntityError, StorageError, TransportError};
}
