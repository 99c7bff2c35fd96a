//! Identifiers and value types shared by clients and the service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Opaque key-value payload carried by documents, items and messages.
pub type Data = serde_json::Map<String, serde_json::Value>;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from a UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Converts to a UUID.
            #[must_use]
            pub const fn to_uuid(&self) -> Uuid {
                self.0
            }

            /// Parses the textual form produced by `Display`.
            #[must_use]
            pub fn parse(text: &str) -> Option<Self> {
                Uuid::parse_str(text).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0.simple())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Server-assigned identifier of an entity.
    ///
    /// Identifiers are globally unique, immutable once assigned and never
    /// reused, even after the entity is removed.
    EntityId
);

uuid_id!(
    /// Identifier of one authenticated client session.
    SessionId
);

uuid_id!(
    /// Identifier of a published stream message.
    MessageId
);

/// The four kinds of synchronized entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A single JSON object.
    Document,
    /// An ordered collection addressed by index.
    List,
    /// A keyed collection.
    Map,
    /// An ephemeral publish/subscribe channel.
    Stream,
}

impl EntityKind {
    /// Returns true for kinds that hold items.
    pub fn is_collection(&self) -> bool {
        matches!(self, EntityKind::List | EntityKind::Map)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Document => "document",
            EntityKind::List => "list",
            EntityKind::Map => "map",
            EntityKind::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Server-tracked version token used for conditional writes.
///
/// Revisions are assigned from a single monotonically increasing counter, so
/// a higher revision always denotes a later committed write.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    /// The revision of something never written.
    pub const ZERO: Revision = Revision(0);

    /// Returns the revision following this one.
    #[must_use]
    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Minimum time an entity or item survives before it becomes eligible for
/// deletion.
///
/// The service may delete the object at any point after the lifetime
/// elapses, not necessarily immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lifetime {
    /// Never expires.
    #[default]
    Infinite,
    /// Survives at least this long from the moment it is applied.
    Finite(Duration),
}

impl Lifetime {
    /// Creates a finite lifetime in whole seconds.
    pub fn from_secs(secs: u64) -> Self {
        Lifetime::Finite(Duration::from_secs(secs))
    }

    /// Returns true if this lifetime never expires.
    pub fn is_infinite(&self) -> bool {
        matches!(self, Lifetime::Infinite)
    }

    /// Computes the expiry instant when applied at `now`.
    pub fn expires_at(&self, now: SystemTime) -> Option<SystemTime> {
        match self {
            Lifetime::Infinite => None,
            Lifetime::Finite(duration) => now.checked_add(*duration),
        }
    }
}

/// Address of an item inside a collection.
///
/// Lists address items by index, maps by key; one collection only ever holds
/// one of the two shapes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemKey {
    /// List index.
    Index(u64),
    /// Map key.
    Key(String),
}

impl ItemKey {
    /// Returns the list index, if this is one.
    pub fn as_index(&self) -> Option<u64> {
        match self {
            ItemKey::Index(index) => Some(*index),
            ItemKey::Key(_) => None,
        }
    }

    /// Returns the map key, if this is one.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            ItemKey::Index(_) => None,
            ItemKey::Key(key) => Some(key),
        }
    }

    /// Returns true if this key shape is valid for the given kind.
    pub fn fits(&self, kind: EntityKind) -> bool {
        matches!(
            (self, kind),
            (ItemKey::Index(_), EntityKind::List) | (ItemKey::Key(_), EntityKind::Map)
        )
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKey::Index(index) => write!(f, "#{index}"),
            ItemKey::Key(key) => write!(f, "{key:?}"),
        }
    }
}

impl From<u64> for ItemKey {
    fn from(index: u64) -> Self {
        ItemKey::Index(index)
    }
}

impl From<&str> for ItemKey {
    fn from(key: &str) -> Self {
        ItemKey::Key(key.to_string())
    }
}

impl From<String> for ItemKey {
    fn from(key: String) -> Self {
        ItemKey::Key(key)
    }
}

/// Direction of a collection query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueryOrder {
    /// From the lowest key upwards.
    #[default]
    Ascending,
    /// From the highest key downwards.
    Descending,
}

impl QueryOrder {
    /// Returns the opposite direction.
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            QueryOrder::Ascending => QueryOrder::Descending,
            QueryOrder::Descending => QueryOrder::Ascending,
        }
    }
}

/// How an open request treats existing and missing entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenMode {
    /// Create a new entity; fail if the unique name is taken.
    CreateOnly,
    /// Open the named entity, creating it if missing.
    #[default]
    CreateOrOpen,
    /// Open an existing entity; fail if it does not exist.
    OpenOnly,
}

/// How an entity is addressed when opening it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identifier {
    /// Server-assigned identifier.
    Id(EntityId),
    /// Application-chosen unique name.
    UniqueName(String),
}

/// Condition a write must satisfy to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precondition {
    /// Unconditional overwrite.
    #[default]
    None,
    /// The target must still be at this revision.
    Revision(Revision),
    /// The target must not exist yet.
    Absent,
}

/// A message published on a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Message identifier assigned by the service.
    pub id: MessageId,
    /// Message payload.
    pub data: Data,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_parse_back() {
        let a = EntityId::new();
        let b = EntityId::new();
        assert_ne!(a, b);
        assert_eq!(EntityId::parse(&a.to_string()), Some(a));
        assert_eq!(EntityId::parse("not-an-id"), None);
    }

    #[test]
    fn lifetime_defaults_to_infinite() {
        let lifetime = Lifetime::default();
        assert!(lifetime.is_infinite());
        assert_eq!(lifetime.expires_at(SystemTime::now()), None);
    }

    #[test]
    fn finite_lifetime_expiry() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let lifetime = Lifetime::from_secs(60);
        assert_eq!(
            lifetime.expires_at(now),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_060))
        );
    }

    #[test]
    fn item_key_shapes() {
        let index = ItemKey::from(3);
        let key = ItemKey::from("theme");

        assert_eq!(index.as_index(), Some(3));
        assert_eq!(key.as_key(), Some("theme"));
        assert!(index.fits(EntityKind::List));
        assert!(!index.fits(EntityKind::Map));
        assert!(key.fits(EntityKind::Map));
        assert!(!key.fits(EntityKind::Document));
    }

    #[test]
    fn index_keys_order_numerically() {
        assert!(ItemKey::Index(2) < ItemKey::Index(10));
        assert!(ItemKey::from("a") < ItemKey::from("b"));
    }

    #[test]
    fn revisions_advance() {
        assert_eq!(Revision::ZERO.next(), Revision(1));
        assert!(Revision(5) > Revision(4));
    }

    #[test]
    fn query_order_reverse() {
        assert_eq!(QueryOrder::Ascending.reverse(), QueryOrder::Descending);
        assert_eq!(QueryOrder::Descending.reverse(), QueryOrder::Ascending);
    }
}
