//! Changes pushed by the service to subscribed sessions.

use crate::messages::{EntitySnapshot, ItemSnapshot};
use crate::types::{EntityId, ItemKey, Revision, SessionId, StreamMessage};
use serde::{Deserialize, Serialize};

/// A change to one entity, pushed to every subscribed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Entity that changed.
    pub entity: EntityId,
    /// Session whose request caused the change, if any.
    ///
    /// Changes made by the service itself (for example expiry) carry no
    /// origin.
    pub origin: Option<SessionId>,
    /// What changed.
    pub change: Change,
}

impl Notification {
    /// Creates a notification.
    pub fn new(entity: EntityId, origin: Option<SessionId>, change: Change) -> Self {
        Self {
            entity,
            origin,
            change,
        }
    }

    /// Returns true if the given session caused this change.
    pub fn is_from(&self, session: SessionId) -> bool {
        self.origin == Some(session)
    }
}

/// The kinds of pushed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    /// Document data or metadata changed.
    DocumentUpdated(EntitySnapshot),
    /// An item was created.
    ItemAdded(ItemSnapshot),
    /// An existing item was overwritten.
    ItemUpdated(ItemSnapshot),
    /// An item was removed.
    ItemRemoved {
        /// Address of the removed item.
        key: ItemKey,
        /// Revision assigned to the removal.
        revision: Revision,
    },
    /// The entity itself was removed or expired.
    EntityRemoved,
    /// A message was published on a stream.
    MessagePublished(StreamMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_check() {
        let session = SessionId::new();
        let note = Notification::new(EntityId::new(), Some(session), Change::EntityRemoved);
        assert!(note.is_from(session));
        assert!(!note.is_from(SessionId::new()));

        let expired = Notification::new(EntityId::new(), None, Change::EntityRemoved);
        assert!(!expired.is_from(session));
    }
}
