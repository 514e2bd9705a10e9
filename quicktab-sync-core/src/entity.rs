//! Reactive wrapper around a single Quick Tab
//!
//! Every write goes through [`ReactiveQuickTab::set`], which validates the
//! value, skips no-op writes, stamps `lastModified`, invalidates dependent
//! computed values, notifies field watchers and finally reports the change
//! to an optional sync callback.
//!
//! # Example
//!
//! ```
//! use quicktab_sync_core::entity::{Computed, ComputedValue, Field, FieldValue, ReactiveQuickTab};
//! use quicktab_sync_core::model::{Position, QuickTab, Size};
//!
//! let tab = QuickTab::new("qt-1", "https://example.com", Position::new(0.0, 0.0), Size::new(300.0, 200.0)).unwrap();
//! let mut entity = ReactiveQuickTab::new(tab);
//!
//! let unwatch = entity.watch(Field::Left, |new, old| println!("left: {old:?} -> {new:?}"));
//! assert!(entity.set(Field::Left, FieldValue::Number(40.0)));
//! assert!(!entity.set(Field::Width, FieldValue::Number(-1.0)));
//! unwatch.unwatch();
//!
//! entity.set(Field::Minimized, FieldValue::Bool(true));
//! assert_eq!(entity.computed(Computed::Visibility), ComputedValue::Visibility(false));
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::bus::panic_message;
use crate::config::{ReactiveConfig, SentinelConfig};
use crate::model::{now_ms, QuickTab};
use crate::sentinel::SubscriptionSentinel;

/// Positions further than this from the origin are rejected
pub const POSITION_LIMIT: f64 = 100_000.0;
/// Widths and heights above this are rejected
pub const SIZE_LIMIT: f64 = 100_000.0;

/// The mutable fields of a Quick Tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Left,
    Top,
    Width,
    Height,
    Title,
    ZIndex,
    Minimized,
    PinnedToUrl,
    SoloedOn,
    MutedOn,
    Metadata,
    LastModified,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::Left,
        Field::Top,
        Field::Width,
        Field::Height,
        Field::Title,
        Field::ZIndex,
        Field::Minimized,
        Field::PinnedToUrl,
        Field::SoloedOn,
        Field::MutedOn,
        Field::Metadata,
        Field::LastModified,
    ];

    /// The JSON key used for this field in update payloads
    pub fn key(&self) -> &'static str {
        match self {
            Field::Left => "left",
            Field::Top => "top",
            Field::Width => "width",
            Field::Height => "height",
            Field::Title => "title",
            Field::ZIndex => "zIndex",
            Field::Minimized => "minimized",
            Field::PinnedToUrl => "pinnedToUrl",
            Field::SoloedOn => "soloedOn",
            Field::MutedOn => "mutedOn",
            Field::Metadata => "metadata",
            Field::LastModified => "lastModified",
        }
    }

    pub fn from_key(key: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|field| field.key() == key)
    }
}

/// A field value. Lists compare element-wise.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Integer(u64),
    Bool(bool),
    Text(String),
    Null,
    List(Vec<u64>),
    Object(Map<String, Value>),
}

impl FieldValue {
    /// Convert a JSON value into the representation `field` expects.
    ///
    /// Returns `None` when the JSON type cannot represent the field at all.
    pub fn from_json(field: Field, value: &Value) -> Option<FieldValue> {
        match field {
            Field::Left | Field::Top | Field::Width | Field::Height => {
                value.as_f64().map(FieldValue::Number)
            }
            Field::ZIndex | Field::LastModified => match value {
                Value::Number(n) => match n.as_u64() {
                    Some(n) => Some(FieldValue::Integer(n)),
                    None => n.as_f64().map(FieldValue::Number),
                },
                _ => None,
            },
            Field::Title => value.as_str().map(|s| FieldValue::Text(s.to_string())),
            Field::Minimized => value.as_bool().map(FieldValue::Bool),
            Field::PinnedToUrl => match value {
                Value::Null => Some(FieldValue::Null),
                Value::String(s) => Some(FieldValue::Text(s.clone())),
                _ => None,
            },
            Field::SoloedOn | Field::MutedOn => value.as_array().and_then(|items| {
                items
                    .iter()
                    .map(Value::as_u64)
                    .collect::<Option<Vec<_>>>()
                    .map(FieldValue::List)
            }),
            Field::Metadata => value.as_object().cloned().map(FieldValue::Object),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Number(n) => Value::from(*n),
            FieldValue::Integer(n) => Value::from(*n),
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Null => Value::Null,
            FieldValue::List(items) => Value::from(items.clone()),
            FieldValue::Object(map) => Value::Object(map.clone()),
        }
    }
}

/// Check a value against the validator for `field`
pub fn validate(field: Field, value: &FieldValue) -> Result<(), String> {
    match (field, value) {
        (Field::Left | Field::Top, FieldValue::Number(n)) => {
            if n.is_finite() && n.abs() <= POSITION_LIMIT {
                Ok(())
            } else {
                Err(format!("position out of range: {n}"))
            }
        }
        (Field::Width | Field::Height, FieldValue::Number(n)) => {
            if n.is_finite() && *n > 0.0 && *n <= SIZE_LIMIT {
                Ok(())
            } else {
                Err(format!("size must be in (0, {SIZE_LIMIT}], got {n}"))
            }
        }
        (Field::ZIndex | Field::LastModified, FieldValue::Integer(_)) => Ok(()),
        (Field::ZIndex, FieldValue::Number(n)) => Err(format!("z-index must be non-negative, got {n}")),
        (Field::Title, FieldValue::Text(_)) => Ok(()),
        (Field::Minimized, FieldValue::Bool(_)) => Ok(()),
        (Field::PinnedToUrl, FieldValue::Text(_) | FieldValue::Null) => Ok(()),
        (Field::SoloedOn | Field::MutedOn, FieldValue::List(_)) => Ok(()),
        (Field::Metadata, FieldValue::Object(_)) => Ok(()),
        (field, value) => Err(format!("{} cannot hold {value:?}", field.key())),
    }
}

impl QuickTab {
    /// Read a field as a [`FieldValue`]
    pub fn get_field(&self, field: Field) -> FieldValue {
        match field {
            Field::Left => FieldValue::Number(self.position.left),
            Field::Top => FieldValue::Number(self.position.top),
            Field::Width => FieldValue::Number(self.size.width),
            Field::Height => FieldValue::Number(self.size.height),
            Field::Title => FieldValue::Text(self.title.clone()),
            Field::ZIndex => FieldValue::Integer(self.z_index),
            Field::Minimized => FieldValue::Bool(self.visibility.minimized),
            Field::PinnedToUrl => match &self.pinned_to_url {
                Some(url) => FieldValue::Text(url.clone()),
                None => FieldValue::Null,
            },
            Field::SoloedOn => FieldValue::List(self.soloed_on.clone()),
            Field::MutedOn => FieldValue::List(self.muted_on.clone()),
            Field::Metadata => FieldValue::Object(self.metadata.clone()),
            Field::LastModified => FieldValue::Integer(self.last_modified),
        }
    }

    /// Validate and write a field without any reactive side effects.
    ///
    /// Returns `Ok(false)` for a no-op write. Does not touch `lastModified`
    /// unless that is the field being written.
    pub fn set_field(&mut self, field: Field, value: FieldValue) -> Result<bool, String> {
        validate(field, &value)?;
        if self.get_field(field) == value {
            return Ok(false);
        }
        match (field, value) {
            (Field::Left, FieldValue::Number(n)) => self.position.left = n,
            (Field::Top, FieldValue::Number(n)) => self.position.top = n,
            (Field::Width, FieldValue::Number(n)) => self.size.width = n,
            (Field::Height, FieldValue::Number(n)) => self.size.height = n,
            (Field::Title, FieldValue::Text(s)) => self.title = s,
            (Field::ZIndex, FieldValue::Integer(n)) => self.z_index = n,
            (Field::Minimized, FieldValue::Bool(b)) => self.visibility.minimized = b,
            (Field::PinnedToUrl, FieldValue::Text(s)) => self.pinned_to_url = Some(s),
            (Field::PinnedToUrl, FieldValue::Null) => self.pinned_to_url = None,
            (Field::SoloedOn, FieldValue::List(items)) => self.soloed_on = items,
            (Field::MutedOn, FieldValue::List(items)) => self.muted_on = items,
            (Field::Metadata, FieldValue::Object(map)) => self.metadata = map,
            (Field::LastModified, FieldValue::Integer(n)) => self.last_modified = n,
            (field, value) => return Err(format!("{} cannot hold {value:?}", field.key())),
        }
        Ok(true)
    }
}

/// Decode an update payload into field writes.
///
/// Accepts flat keys (`left`, `width`, `zIndex`, ...) as well as the nested
/// `position`, `size` and `visibility` objects of the entity's JSON form.
/// Unknown keys and values of the wrong JSON type are logged and skipped.
pub fn field_updates(data: &Value) -> Vec<(Field, FieldValue)> {
    let Some(object) = data.as_object() else {
        warn!(data = %data, "Update payload is not an object");
        return Vec::new();
    };

    let mut updates = Vec::new();
    for (key, value) in object {
        match key.as_str() {
            "position" | "size" | "visibility" => {
                if let Some(nested) = value.as_object() {
                    for (inner_key, inner_value) in nested {
                        push_update(&mut updates, inner_key, inner_value);
                    }
                }
            }
            _ => push_update(&mut updates, key, value),
        }
    }
    updates
}

fn push_update(updates: &mut Vec<(Field, FieldValue)>, key: &str, value: &Value) {
    match Field::from_key(key) {
        Some(field) => match FieldValue::from_json(field, value) {
            Some(value) => updates.push((field, value)),
            None => warn!(field = key, value = %value, "Ignoring update with wrong type"),
        },
        None => debug!(field = key, "Ignoring unknown or immutable field"),
    }
}

/// Derived values cached by a [`ReactiveQuickTab`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Computed {
    /// Whether the window is shown (not minimized)
    Visibility,
    /// Position and size as one rectangle
    Bounds,
    /// Width times height
    Area,
}

impl Computed {
    pub const ALL: [Computed; 3] = [Computed::Visibility, Computed::Bounds, Computed::Area];

    /// Fields whose writes invalidate this value
    pub fn dependencies(&self) -> &'static [Field] {
        match self {
            Computed::Visibility => &[Field::Minimized],
            Computed::Bounds => &[Field::Left, Field::Top, Field::Width, Field::Height],
            Computed::Area => &[Field::Width, Field::Height],
        }
    }

    fn evaluate(&self, tab: &QuickTab) -> ComputedValue {
        match self {
            Computed::Visibility => ComputedValue::Visibility(!tab.visibility.minimized),
            Computed::Bounds => ComputedValue::Bounds {
                left: tab.position.left,
                top: tab.position.top,
                width: tab.size.width,
                height: tab.size.height,
            },
            Computed::Area => ComputedValue::Area(tab.size.width * tab.size.height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComputedValue {
    Visibility(bool),
    Bounds {
        left: f64,
        top: f64,
        width: f64,
        height: f64,
    },
    Area(f64),
}

type WatchFn = Arc<dyn Fn(&FieldValue, &FieldValue) + Send + Sync>;
type SyncFn = Box<dyn Fn(&str, Field, &FieldValue) + Send + Sync>;

struct WatcherRegistry {
    watchers: HashMap<Field, Vec<(u64, WatchFn)>>,
    next_id: u64,
    sentinel: SubscriptionSentinel,
}

impl WatcherRegistry {
    fn count(&self) -> usize {
        self.watchers.values().map(Vec::len).sum()
    }
}

fn lock_registry(registry: &Mutex<WatcherRegistry>) -> MutexGuard<'_, WatcherRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returned by [`ReactiveQuickTab::watch`]; removes the watcher when called.
///
/// Calling it more than once, or after the entity was destroyed, is a no-op.
pub struct Unwatch {
    registry: Weak<Mutex<WatcherRegistry>>,
    field: Field,
    id: u64,
}

impl Unwatch {
    /// Remove the watcher. Returns `true` only on the call that removed it.
    pub fn unwatch(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = lock_registry(&registry);
        let Some(list) = registry.watchers.get_mut(&self.field) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        let removed = list.len() != before;
        let count = registry.count();
        registry.sentinel.observe(count);
        removed
    }
}

/// A Quick Tab behind validated, observable setters
pub struct ReactiveQuickTab {
    tab: QuickTab,
    config: ReactiveConfig,
    registry: Arc<Mutex<WatcherRegistry>>,
    cache: RefCell<HashMap<Computed, ComputedValue>>,
    evaluations: Cell<usize>,
    on_sync: Option<SyncFn>,
    destroyed: bool,
}

impl std::fmt::Debug for ReactiveQuickTab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveQuickTab")
            .field("id", &self.tab.id)
            .field("watchers", &self.watcher_count())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl ReactiveQuickTab {
    pub fn new(tab: QuickTab) -> Self {
        Self::with_config(tab, ReactiveConfig::default(), &SentinelConfig::default())
    }

    pub fn with_config(tab: QuickTab, config: ReactiveConfig, sentinel: &SentinelConfig) -> Self {
        Self {
            tab,
            config,
            registry: Arc::new(Mutex::new(WatcherRegistry {
                watchers: HashMap::new(),
                next_id: 1,
                sentinel: SubscriptionSentinel::new("entity_watchers", sentinel),
            })),
            cache: RefCell::new(HashMap::new()),
            evaluations: Cell::new(0),
            on_sync: None,
            destroyed: false,
        }
    }

    /// Install the callback invoked after every accepted write
    pub fn on_sync<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Field, &FieldValue) + Send + Sync + 'static,
    {
        self.on_sync = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> &str {
        &self.tab.id
    }

    /// The wrapped tab
    pub fn tab(&self) -> &QuickTab {
        &self.tab
    }

    /// Unwrap the tab. Outstanding [`Unwatch`] handles become no-ops.
    pub fn into_inner(self) -> QuickTab {
        self.tab
    }

    /// Adopt a newer copy of the tab without notifying anyone.
    ///
    /// Used when the stored tab changed underneath the entity, e.g. after a
    /// storage snapshot was applied. Cached computed values are dropped.
    pub fn replace_tab(&mut self, tab: QuickTab) {
        if tab != self.tab {
            self.tab = tab;
            self.cache.borrow_mut().clear();
        }
    }

    pub fn get(&self, field: Field) -> FieldValue {
        self.tab.get_field(field)
    }

    /// Write a field.
    ///
    /// Returns `true` when the write was accepted and changed the value.
    /// Invalid values are logged and ignored; this never panics or errors.
    pub fn set(&mut self, field: Field, value: FieldValue) -> bool {
        if self.destroyed {
            warn!(id = %self.tab.id, field = field.key(), "Write to destroyed entity ignored");
            return false;
        }

        let old = self.tab.get_field(field);
        match self.tab.set_field(field, value.clone()) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(reason) => {
                warn!(id = %self.tab.id, field = field.key(), %reason, "Rejected invalid write");
                return false;
            }
        }

        self.after_write(field, value, old);
        true
    }

    /// Write into the nested `metadata` object along `path`.
    ///
    /// Intermediate objects are created as needed; a path crossing a
    /// non-object value is rejected. Every accepted write is observed as one
    /// change to [`Field::Metadata`]. Paths deeper than the configured depth
    /// are stored the same way, without any finer-grained tracking.
    pub fn set_nested(&mut self, path: &[&str], value: Value) -> bool {
        if self.destroyed {
            warn!(id = %self.tab.id, "Write to destroyed entity ignored");
            return false;
        }
        let Some((last, parents)) = path.split_last() else {
            warn!(id = %self.tab.id, "Empty metadata path");
            return false;
        };
        if path.len() > self.config.max_depth {
            debug!(
                id = %self.tab.id,
                depth = path.len(),
                max_depth = self.config.max_depth,
                "Metadata write below tracked depth"
            );
        }

        let mut metadata = self.tab.metadata.clone();
        let mut cursor = &mut metadata;
        for key in parents {
            let entry = cursor
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match entry.as_object_mut() {
                Some(next) => cursor = next,
                None => {
                    warn!(id = %self.tab.id, key = *key, "Metadata path crosses a non-object");
                    return false;
                }
            }
        }
        cursor.insert(last.to_string(), value);

        self.set(Field::Metadata, FieldValue::Object(metadata))
    }

    /// Read a computed value, recomputing it only if a dependency changed
    pub fn computed(&self, key: Computed) -> ComputedValue {
        if let Some(value) = self.cache.borrow().get(&key) {
            return *value;
        }
        let value = key.evaluate(&self.tab);
        self.evaluations.set(self.evaluations.get() + 1);
        self.cache.borrow_mut().insert(key, value);
        value
    }

    /// How many times computed values were actually evaluated
    pub fn computed_evaluations(&self) -> usize {
        self.evaluations.get()
    }

    /// Observe writes to one field. Callbacks receive `(new, old)`.
    pub fn watch<F>(&self, field: Field, callback: F) -> Unwatch
    where
        F: Fn(&FieldValue, &FieldValue) + Send + Sync + 'static,
    {
        let mut registry = lock_registry(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .watchers
            .entry(field)
            .or_default()
            .push((id, Arc::new(callback)));
        let count = registry.count();
        registry.sentinel.observe(count);

        Unwatch {
            registry: Arc::downgrade(&self.registry),
            field,
            id,
        }
    }

    pub fn watcher_count(&self) -> usize {
        lock_registry(&self.registry).count()
    }

    /// Drop every watcher and cached value. The entity rejects writes afterwards.
    pub fn destroy(&mut self) {
        {
            let mut registry = lock_registry(&self.registry);
            let open = registry.count();
            registry.sentinel.check_teardown(open);
            registry.watchers.clear();
        }
        self.cache.borrow_mut().clear();
        self.on_sync = None;
        self.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn after_write(&mut self, field: Field, new: FieldValue, old: FieldValue) {
        if field != Field::LastModified {
            self.tab.touch(now_ms());
        }

        self.cache
            .borrow_mut()
            .retain(|key, _| !key.dependencies().contains(&field));

        let watchers: Vec<WatchFn> = lock_registry(&self.registry)
            .watchers
            .get(&field)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for watcher in watchers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| watcher(&new, &old))) {
                warn!(
                    id = %self.tab.id,
                    field = field.key(),
                    error = %panic_message(&panic),
                    "Field watcher panicked"
                );
            }
        }

        if let Some(on_sync) = &self.on_sync {
            let id = self.tab.id.as_str();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| on_sync(id, field, &new))) {
                warn!(
                    id = %self.tab.id,
                    field = field.key(),
                    error = %panic_message(&panic),
                    "Sync callback panicked"
                );
            }
        }
    }
}
