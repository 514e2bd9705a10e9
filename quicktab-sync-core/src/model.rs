//! Data model shared by every component
//!
//! Geometry types are `Copy`, so handing a position or size to another
//! component never aliases the stored value.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EntityError;

/// Current wall-clock time in epoch milliseconds.
///
/// This is the clock behind `lastModified` and every operation timestamp.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Top-left corner of a Quick Tab, in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub left: f64,
    pub top: f64,
}

impl Position {
    pub fn new(left: f64, top: f64) -> Self {
        Self { left, top }
    }
}

/// Dimensions of a Quick Tab, in CSS pixels. Both sides are strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Visibility {
    pub minimized: bool,
}

/// A floating overlay window shared across every context.
///
/// `id` is the only key. Two values with the same id are never merged: the
/// later write replaces the earlier one as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickTab {
    pub id: String,
    pub url: String,
    /// User-facing label number, assigned once by the state store
    #[serde(default)]
    pub slot: u32,
    pub position: Position,
    pub size: Size,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub z_index: u64,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub pinned_to_url: Option<String>,
    #[serde(default)]
    pub soloed_on: Vec<u64>,
    #[serde(default)]
    pub muted_on: Vec<u64>,
    #[serde(default)]
    pub cookie_store_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub last_modified: u64,
}

impl QuickTab {
    /// Build a new Quick Tab from its required fields.
    ///
    /// Fails only when a required field is structurally unusable: an empty
    /// id or url, a non-finite position, or a size that is not positive.
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        position: Position,
        size: Size,
    ) -> Result<Self, EntityError> {
        let now = now_ms();
        let tab = Self {
            id: id.into(),
            url: url.into(),
            slot: 0,
            position,
            size,
            title: String::new(),
            z_index: 0,
            visibility: Visibility::default(),
            pinned_to_url: None,
            soloed_on: Vec::new(),
            muted_on: Vec::new(),
            cookie_store_id: None,
            metadata: Map::new(),
            created_at: now,
            last_modified: now,
        };
        tab.check_required()?;
        Ok(tab)
    }

    /// Decode a Quick Tab from its JSON form, checking required fields first.
    pub fn from_value(value: &Value) -> Result<Self, EntityError> {
        let object = value
            .as_object()
            .ok_or_else(|| EntityError::Malformed("expected an object".into()))?;

        for field in ["id", "url", "position", "size"] {
            match object.get(field) {
                None | Some(Value::Null) => {
                    return Err(EntityError::MissingField(required_name(field)))
                }
                Some(_) => {}
            }
        }

        let mut tab: QuickTab = serde_json::from_value(value.clone())
            .map_err(|e| EntityError::Malformed(e.to_string()))?;
        tab.check_required()?;

        if tab.created_at == 0 {
            tab.created_at = now_ms();
        }
        if tab.last_modified == 0 {
            tab.last_modified = tab.created_at;
        }
        Ok(tab)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_container(mut self, cookie_store_id: impl Into<String>) -> Self {
        self.cookie_store_id = Some(cookie_store_id.into());
        self
    }

    pub fn is_minimized(&self) -> bool {
        self.visibility.minimized
    }

    /// Whether `key` addresses this tab, either by id or by url.
    pub fn matches_key(&self, key: &str) -> bool {
        self.id == key || self.url == key
    }

    /// Bump `lastModified`, never moving it backwards.
    pub fn touch(&mut self, timestamp: u64) {
        self.last_modified = self.last_modified.max(timestamp);
    }

    fn check_required(&self) -> Result<(), EntityError> {
        if self.id.trim().is_empty() {
            return Err(EntityError::MissingField("id"));
        }
        if self.url.trim().is_empty() {
            return Err(EntityError::MissingField("url"));
        }
        if !self.position.left.is_finite() || !self.position.top.is_finite() {
            return Err(EntityError::InvalidField {
                field: "position",
                reason: "coordinates must be finite".into(),
            });
        }
        let Size { width, height } = self.size;
        if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
            return Err(EntityError::InvalidField {
                field: "size",
                reason: format!("expected positive dimensions, got {width}x{height}"),
            });
        }
        Ok(())
    }
}

fn required_name(field: &str) -> &'static str {
    match field {
        "id" => "id",
        "url" => "url",
        "position" => "position",
        _ => "size",
    }
}

/// The persisted state of one container: `{ tabs, timestamp }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    #[serde(default)]
    pub tabs: Vec<QuickTab>,
    #[serde(default)]
    pub timestamp: u64,
}

impl ContainerState {
    /// An empty bucket stamped with the current time
    pub fn empty() -> Self {
        Self {
            tabs: Vec::new(),
            timestamp: now_ms(),
        }
    }

    pub fn new(tabs: Vec<QuickTab>) -> Self {
        Self {
            tabs,
            timestamp: now_ms(),
        }
    }

    pub fn find(&self, key: &str) -> Option<&QuickTab> {
        self.tabs.iter().find(|tab| tab.matches_key(key))
    }

    pub fn find_mut(&mut self, key: &str) -> Option<&mut QuickTab> {
        self.tabs.iter_mut().find(|tab| tab.matches_key(key))
    }
}

/// Kind of mutation carried by a pending or batched operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Create,
    Update,
    Delete,
}

impl OpType {
    pub fn name(&self) -> &'static str {
        match self {
            OpType::Create => "create",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }
}

/// A mutation intent addressed to one Quick Tab.
///
/// Used both for the batcher's outbound queue and for the state store's
/// deferred updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub quick_tab_id: String,
    #[serde(rename = "type")]
    pub op_type: OpType,
    #[serde(default)]
    pub data: Value,
    pub timestamp: u64,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl PendingOperation {
    pub fn new(quick_tab_id: impl Into<String>, op_type: OpType, data: Value) -> Self {
        Self {
            quick_tab_id: quick_tab_id.into(),
            op_type,
            data,
            timestamp: now_ms(),
            correlation_id: None,
        }
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> QuickTab {
        QuickTab::new(
            "qt-1",
            "https://example.com",
            Position::new(10.0, 20.0),
            Size::new(400.0, 300.0),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_bad_required_fields() {
        let err = QuickTab::new("", "https://a", Position::default(), Size::new(1.0, 1.0));
        assert_eq!(err.unwrap_err(), EntityError::MissingField("id"));

        let err = QuickTab::new("qt", " ", Position::default(), Size::new(1.0, 1.0));
        assert_eq!(err.unwrap_err(), EntityError::MissingField("url"));

        let err = QuickTab::new("qt", "https://a", Position::default(), Size::new(0.0, 1.0));
        assert!(matches!(
            err.unwrap_err(),
            EntityError::InvalidField { field: "size", .. }
        ));
    }

    #[test]
    fn test_from_value_requires_fields() {
        let err = QuickTab::from_value(&json!({
            "id": "qt-1",
            "url": "https://example.com",
            "size": { "width": 10.0, "height": 10.0 }
        }));
        assert_eq!(err.unwrap_err(), EntityError::MissingField("position"));

        let err = QuickTab::from_value(&json!("nope"));
        assert!(matches!(err.unwrap_err(), EntityError::Malformed(_)));
    }

    #[test]
    fn test_from_value_fills_timestamps() {
        let tab = QuickTab::from_value(&json!({
            "id": "qt-1",
            "url": "https://example.com",
            "position": { "left": 1.0, "top": 2.0 },
            "size": { "width": 10.0, "height": 20.0 },
            "zIndex": 7
        }))
        .unwrap();
        assert_eq!(tab.z_index, 7);
        assert!(tab.created_at > 0);
        assert_eq!(tab.last_modified, tab.created_at);
    }

    #[test]
    fn test_serde_uses_camel_case() {
        let tab = sample();
        let value = serde_json::to_value(&tab).unwrap();
        assert!(value.get("zIndex").is_some());
        assert!(value.get("lastModified").is_some());
        assert_eq!(value["visibility"]["minimized"], json!(false));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut tab = sample();
        let before = tab.last_modified;
        tab.touch(before - 1);
        assert_eq!(tab.last_modified, before);
        tab.touch(before + 5);
        assert_eq!(tab.last_modified, before + 5);
    }

    #[test]
    fn test_pending_operation_wire_shape() {
        let op = PendingOperation::new("qt-1", OpType::Update, json!({ "left": 3 }))
            .at(42)
            .with_correlation("c-1");
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({
                "quickTabId": "qt-1",
                "type": "update",
                "data": { "left": 3 },
                "timestamp": 42,
                "correlationId": "c-1"
            })
        );
    }

    #[test]
    fn test_container_state_find_by_url() {
        let state = ContainerState::new(vec![sample()]);
        assert!(state.find("https://example.com").is_some());
        assert!(state.find("qt-1").is_some());
        assert!(state.find("other").is_none());
    }
}
