//! Event types for the pub/sub system

use std::fmt::Debug;
use std::hash::Hash;

use bitflags::bitflags;

use crate::model::{Position, QuickTab, Size};

/// An event that can travel over an [`EventBus`](crate::EventBus)
///
/// Events are grouped by a small `Copy` kind; listeners subscribe to a kind
/// and receive every event of that kind.
pub trait BusEvent: Clone + Debug + Send + 'static {
    /// The subscription key for this event family
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Get the kind of this event
    fn kind(&self) -> Self::Kind;
}

/// Event types emitted by the [`StateStore`](crate::StateStore)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEventType {
    /// A Quick Tab entered the store
    Added,
    /// A Quick Tab's content changed
    Updated,
    /// A Quick Tab left the store
    Deleted,
    /// Geometry or stacking of an existing Quick Tab changed during hydration
    QuickTabChanged,
    /// A hydration pass finished and changed something
    Hydrated,
}

impl StateEventType {
    /// All event types, in declaration order
    pub const ALL: [StateEventType; 5] = [
        StateEventType::Added,
        StateEventType::Updated,
        StateEventType::Deleted,
        StateEventType::QuickTabChanged,
        StateEventType::Hydrated,
    ];

    /// The wire name renderers subscribe to
    pub fn as_str(&self) -> &'static str {
        match self {
            StateEventType::Added => "state:added",
            StateEventType::Updated => "state:updated",
            StateEventType::Deleted => "state:deleted",
            StateEventType::QuickTabChanged => "state:quicktab:changed",
            StateEventType::Hydrated => "state:hydrated",
        }
    }
}

bitflags! {
    /// Which renderer-relevant properties differ between two versions of a tab
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChangedFields: u8 {
        const POSITION = 0b001;
        const SIZE = 0b010;
        const Z_INDEX = 0b100;
    }
}

/// An old/new pair for one property
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Change<T> {
    pub old: T,
    pub new: T,
}

/// Geometry and stacking differences between two versions of the same tab
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuickTabChanges {
    pub position: Option<Change<Position>>,
    pub size: Option<Change<Size>>,
    pub z_index: Option<Change<u64>>,
}

impl QuickTabChanges {
    /// Diff the renderer-relevant properties of two versions of a tab
    pub fn between(old: &QuickTab, new: &QuickTab) -> Self {
        let mut changes = Self::default();
        if old.position != new.position {
            changes.position = Some(Change {
                old: old.position,
                new: new.position,
            });
        }
        if old.size != new.size {
            changes.size = Some(Change {
                old: old.size,
                new: new.size,
            });
        }
        if old.z_index != new.z_index {
            changes.z_index = Some(Change {
                old: old.z_index,
                new: new.z_index,
            });
        }
        changes
    }

    pub fn fields(&self) -> ChangedFields {
        let mut fields = ChangedFields::empty();
        fields.set(ChangedFields::POSITION, self.position.is_some());
        fields.set(ChangedFields::SIZE, self.size.is_some());
        fields.set(ChangedFields::Z_INDEX, self.z_index.is_some());
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }
}

/// Events emitted by the state store
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    Added(QuickTab),
    Updated(QuickTab),
    Deleted {
        id: String,
    },
    QuickTabChanged {
        id: String,
        changes: QuickTabChanges,
    },
    Hydrated {
        added: usize,
        updated: usize,
        deleted: usize,
    },
}

impl StateEvent {
    /// Id of the tab this event concerns, if any
    pub fn quick_tab_id(&self) -> Option<&str> {
        match self {
            StateEvent::Added(tab) | StateEvent::Updated(tab) => Some(&tab.id),
            StateEvent::Deleted { id } | StateEvent::QuickTabChanged { id, .. } => Some(id),
            StateEvent::Hydrated { .. } => None,
        }
    }
}

impl BusEvent for StateEvent {
    type Kind = StateEventType;

    fn kind(&self) -> StateEventType {
        match self {
            StateEvent::Added(_) => StateEventType::Added,
            StateEvent::Updated(_) => StateEventType::Updated,
            StateEvent::Deleted { .. } => StateEventType::Deleted,
            StateEvent::QuickTabChanged { .. } => StateEventType::QuickTabChanged,
            StateEvent::Hydrated { .. } => StateEventType::Hydrated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab() -> QuickTab {
        QuickTab::new(
            "qt-1",
            "https://example.com",
            Position::new(0.0, 0.0),
            Size::new(100.0, 100.0),
        )
        .unwrap()
    }

    #[test]
    fn test_changes_between() {
        let old = tab();
        let mut new = old.clone();
        new.position = Position::new(5.0, 0.0);
        new.z_index = 9;

        let changes = QuickTabChanges::between(&old, &new);
        assert_eq!(
            changes.fields(),
            ChangedFields::POSITION | ChangedFields::Z_INDEX
        );
        assert_eq!(changes.z_index, Some(Change { old: 0, new: 9 }));
        assert!(changes.size.is_none());
    }

    #[test]
    fn test_no_changes() {
        let old = tab();
        let mut new = old.clone();
        new.title = "only the title".into();
        assert!(QuickTabChanges::between(&old, &new).is_empty());
    }

    #[test]
    fn test_event_kind_and_names() {
        let event = StateEvent::Deleted { id: "qt-1".into() };
        assert_eq!(event.kind(), StateEventType::Deleted);
        assert_eq!(event.kind().as_str(), "state:deleted");
        assert_eq!(event.quick_tab_id(), Some("qt-1"));
        assert_eq!(
            StateEventType::QuickTabChanged.as_str(),
            "state:quicktab:changed"
        );
    }
}
