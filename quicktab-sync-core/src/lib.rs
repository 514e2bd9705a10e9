//! Core state synchronization engine for quicktab-sync
//!
//! Quick Tabs are floating browser windows whose state has to stay
//! consistent across every context that shows them. This crate provides the
//! pieces each context runs and the background-side consumer they talk to.
//!
//! # Core Concepts
//!
//! - **EventBus**: Typed pub/sub with panic isolation and leak detection
//! - **ReactiveQuickTab**: A Quick Tab whose writes are validated, watched
//!   and reported for sync
//! - **StateStore**: The in-memory collection of Quick Tabs, reconciled
//!   from storage snapshots with change detection
//! - **MessageBatcher**: Coalesces bursts of operations into one message
//! - **MessageClient**: Request/response with deadlines and acknowledgements
//! - **PersistentStore**: Two storage tiers with fallback and cache fill
//! - **Coordinator**: Applies batches to the authoritative bucket
//!
//! # Basic Example
//!
//! ```ignore
//! use quicktab_sync_core::prelude::*;
//!
//! let store = Arc::new(PersistentStore::in_memory());
//! let mut ctx = SyncContext::new(
//!     Coordinator::new(Arc::clone(&store)),
//!     Arc::clone(&store),
//!     &StaticContainer::default(),
//!     SyncConfig::default(),
//! )
//! .await;
//!
//! ctx.load().await;
//! ctx.create(tab);
//! ctx.edit("qt-1", Field::Left, FieldValue::Number(120.0));
//! ```
//!
//! # Data Flow
//!
//! Local edits flow one way and remote changes come back another:
//!
//! 1. An edit is written through a [`ReactiveQuickTab`], applied to the
//!    [`StateStore`] and queued on the [`MessageBatcher`]
//! 2. The batcher releases a coalesced [`BatchPayload`] once its window
//!    closes, and it is sent with [`MessageClient::send_with_retry`]
//! 3. The [`Coordinator`] applies the batch and saves the bucket
//! 4. Each context's [`StorageWatcher`] sees the newer bucket and hydrates
//!    its store, emitting events only for what actually changed

pub mod batcher;
pub mod bus;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod event;
pub mod model;
pub mod protocol;
pub mod sentinel;
pub mod state;
pub mod storage;
pub mod testing;
pub mod watcher;

// Entity exports
pub use entity::{Computed, ComputedValue, Field, FieldValue, ReactiveQuickTab, Unwatch};
pub use model::{ContainerState, OpType, PendingOperation, Position, QuickTab, Size, Visibility};

// Event system exports
pub use bus::{EventBus, ListenerId};
pub use event::{BusEvent, ChangedFields, QuickTabChanges, StateEvent, StateEventType};
pub use sentinel::SubscriptionSentinel;

// Store exports
pub use state::{
    ComposedMiddleware, HydrateOptions, HydrateSummary, LoggingMiddleware, Middleware, Mutation,
    NoopMiddleware, StateStore, UpdateOutcome,
};

// Messaging exports
pub use batcher::{BatchPayload, BatchState, BatcherStats, MessageBatcher};
pub use protocol::{ErrorCode, MessageClient, Request, RequestId, RequestOptions, Response, Transport};

// Storage exports
pub use coordinator::{BatchReport, Coordinator};
pub use storage::{
    ContainerResolver, KeyValueArea, LoadSource, MemoryArea, PersistentStore, SaveOutcome,
    StaticContainer,
};
pub use watcher::StorageWatcher;

pub use config::SyncConfig;
pub use context::{DeliveryStats, SyncContext};
pub use error::{EntityError, StorageError, TransportError};

// Testing exports
pub use testing::{EventRecorder, MockTransport, YieldingArea};

#[cfg(feature = "testing-time")]
pub use testing::{advance_time, pause_time, resume_time};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batcher::{BatchPayload, MessageBatcher};
    pub use crate::bus::{EventBus, ListenerId};
    pub use crate::config::{
        BatcherConfig, ReactiveConfig, RequestConfig, SentinelConfig, SyncConfig, WatcherConfig,
    };
    pub use crate::context::SyncContext;
    pub use crate::coordinator::Coordinator;
    pub use crate::entity::{Field, FieldValue, ReactiveQuickTab};
    pub use crate::event::{StateEvent, StateEventType};
    pub use crate::model::{ContainerState, OpType, Position, QuickTab, Size};
    pub use crate::protocol::{MessageClient, Response, Transport};
    pub use crate::state::{HydrateOptions, StateStore};
    pub use crate::storage::{ContainerResolver, PersistentStore, StaticContainer};
    pub use crate::watcher::StorageWatcher;
    pub use std::sync::Arc;
}
