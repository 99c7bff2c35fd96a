//! Entity handles and the value types they expose.

mod collection;
mod document;
mod list;
mod map;
mod stream;

pub use document::Document;
pub use list::List;
pub use map::Map;
pub use stream::Stream;

use crate::client::ClientInner;
use crate::dispatcher::EventContext;
use crate::error::{SyncError, SyncResult};
use crate::registry::SharedEntity;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;
use weft_protocol::{
    Data, EntityId, EntityKind, EntityMetadata, Identifier, ItemKey, ItemSnapshot, Lifetime,
    OpenMode, OpenRequest, Request,
};

/// Read-only description of an open entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInfo {
    /// Service-assigned identifier.
    pub id: EntityId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Unique name, if the entity has one.
    pub unique_name: Option<String>,
    /// Last update time known to the client.
    pub date_updated: Option<SystemTime>,
    /// Earliest time the service may delete the entity.
    pub expires_at: Option<SystemTime>,
}

impl From<&EntityMetadata> for EntityInfo {
    fn from(metadata: &EntityMetadata) -> Self {
        Self {
            id: metadata.id,
            kind: metadata.kind,
            unique_name: metadata.unique_name.clone(),
            date_updated: metadata.date_updated,
            expires_at: metadata.expires_at,
        }
    }
}

/// A list or map item.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// List index or map key.
    pub key: ItemKey,
    /// Item data.
    pub data: Data,
    /// Last update time.
    pub date_updated: SystemTime,
    /// Earliest time the service may delete the item.
    pub expires_at: Option<SystemTime>,
}

impl Item {
    /// Returns the list index, for list items.
    pub fn index(&self) -> Option<u64> {
        self.key.as_index()
    }

    /// Returns the key, for map items.
    pub fn map_key(&self) -> Option<&str> {
        self.key.as_key()
    }
}

impl From<&ItemSnapshot> for Item {
    fn from(item: &ItemSnapshot) -> Self {
        Self {
            key: item.key.clone(),
            data: item.data.clone(),
            date_updated: item.date_updated,
            expires_at: item.expires_at,
        }
    }
}

/// When collection items are loaded into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStrategy {
    /// Items are fetched on first access.
    #[default]
    OnDemand,
    /// All items are fetched while opening.
    EagerPrefetch,
}

/// How to open an entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpenOptions {
    /// Create/open semantics.
    pub mode: OpenMode,
    /// Entity to open. Without one a new anonymous entity is created.
    pub identifier: Option<Identifier>,
    /// When collection items are loaded.
    pub strategy: SyncStrategy,
    /// Lifetime applied if the entity is created.
    pub lifetime: Lifetime,
}

impl OpenOptions {
    /// Creates options for a new anonymous entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new entity named `name`, failing if the name is taken.
    pub fn create_only(name: impl Into<String>) -> Self {
        Self::named(OpenMode::CreateOnly, name)
    }

    /// Opens the entity named `name`, creating it if missing.
    pub fn create_or_open(name: impl Into<String>) -> Self {
        Self::named(OpenMode::CreateOrOpen, name)
    }

    /// Opens the existing entity named `name`.
    pub fn open_only(name: impl Into<String>) -> Self {
        Self::named(OpenMode::OpenOnly, name)
    }

    /// Opens the existing entity with the given identifier.
    pub fn open_by_id(id: EntityId) -> Self {
        Self {
            mode: OpenMode::OpenOnly,
            identifier: Some(Identifier::Id(id)),
            ..Self::default()
        }
    }

    fn named(mode: OpenMode, name: impl Into<String>) -> Self {
        Self {
            mode,
            identifier: Some(Identifier::UniqueName(name.into())),
            ..Self::default()
        }
    }

    /// Sets the lifetime applied at creation.
    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Sets the item loading strategy.
    pub fn with_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the create/open mode.
    pub fn with_mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    pub(crate) fn validate(&self) -> SyncResult<()> {
        match (&self.identifier, self.mode) {
            (Some(Identifier::UniqueName(name)), _) if name.is_empty() => {
                Err(SyncError::invalid("unique name must not be empty"))
            }
            (None, OpenMode::OpenOnly) => {
                Err(SyncError::invalid("open-only requires a name or identifier"))
            }
            (Some(Identifier::Id(_)), OpenMode::CreateOnly) => Err(SyncError::invalid(
                "identifiers are assigned by the service; create by unique name",
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn to_request(&self, kind: EntityKind) -> OpenRequest {
        OpenRequest {
            kind,
            mode: self.mode,
            identifier: self.identifier.clone(),
            lifetime: self.lifetime,
        }
    }
}

/// State shared by every handle kind.
///
/// Dropping it releases the handle's hold on the cached entity.
pub(crate) struct HandleCore {
    pub(crate) inner: Arc<ClientInner>,
    pub(crate) id: EntityId,
    pub(crate) cache: SharedEntity,
    registration: u64,
}

impl HandleCore {
    pub(crate) fn new(
        inner: Arc<ClientInner>,
        id: EntityId,
        cache: SharedEntity,
        registration: u64,
    ) -> Self {
        Self {
            inner,
            id,
            cache,
            registration,
        }
    }

    pub(crate) fn info(&self) -> EntityInfo {
        EntityInfo::from(&self.cache.read().metadata)
    }

    /// Runs an operation with shutdown and error reporting.
    pub(crate) async fn run<T, F>(&self, op: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: Future<Output = SyncResult<T>>,
    {
        self.inner.run(Some(self.id), op).await
    }

    pub(crate) async fn set_lifetime(&self, key: Option<ItemKey>, lifetime: Lifetime) -> SyncResult<()> {
        let connection = &self.inner.connection;
        let registry = &self.inner.registry;
        let request = Request::SetLifetime {
            entity: self.id,
            key: key.clone(),
            lifetime,
        };
        connection.request(request).await?;

        // Lifetime changes carry no revision; read back the new expiry
        match key {
            None => {
                let snapshot = connection
                    .request(Request::Fetch { entity: self.id })
                    .await?
                    .into_snapshot()?;
                registry.apply_snapshot(self.id, &snapshot, EventContext::REMOTE);
            }
            Some(key) => {
                let cached = self.cache.read().items.contains_key(&key);
                if cached {
                    let item = connection
                        .request(Request::GetItem { entity: self.id, key })
                        .await?
                        .into_item()?;
                    registry.refresh_item(self.id, &item);
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn remove(&self) -> SyncResult<()> {
        let change = self
            .inner
            .connection
            .request(Request::RemoveEntity { entity: self.id })
            .await?
            .into_change()?;
        self.inner
            .registry
            .apply(self.id, &change, EventContext::LOCAL);
        Ok(())
    }
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        self.inner.registry.release(self.id, self.registration);
    }
}

/// Implements the accessors every handle shares.
macro_rules! entity_accessors {
    ($handle:ident) => {
        impl $handle {
            /// Returns the service-assigned identifier.
            pub fn id(&self) -> weft_protocol::EntityId {
                self.core.id
            }

            /// Returns the unique name, if any.
            pub fn unique_name(&self) -> Option<String> {
                self.core.cache.read().metadata.unique_name.clone()
            }

            /// Returns the last update time known to the client.
            pub fn date_updated(&self) -> Option<std::time::SystemTime> {
                self.core.cache.read().metadata.date_updated
            }

            /// Returns the earliest time the service may delete the entity.
            pub fn expires_at(&self) -> Option<std::time::SystemTime> {
                self.core.cache.read().metadata.expires_at
            }

            /// Returns a snapshot of the entity's description.
            pub fn info(&self) -> $crate::entity::EntityInfo {
                self.core.info()
            }

            /// Changes the entity's lifetime, counted from now.
            pub async fn set_lifetime(
                &self,
                lifetime: weft_protocol::Lifetime,
            ) -> $crate::error::SyncResult<()> {
                self.core.run(self.core.set_lifetime(None, lifetime)).await
            }

            /// Deletes the entity for every client.
            pub async fn remove(&self) -> $crate::error::SyncResult<()> {
                self.core.run(self.core.remove()).await
            }
        }

        impl std::fmt::Debug for $handle {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($handle))
                    .field("id", &self.core.id)
                    .finish_non_exhaustive()
            }
        }
    };
}

pub(crate) use entity_accessors;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_options_constructors() {
        let options = OpenOptions::create_or_open("prefs").with_lifetime(Lifetime::from_secs(60));
        assert_eq!(options.mode, OpenMode::CreateOrOpen);
        assert_eq!(options.identifier, Some(Identifier::UniqueName("prefs".into())));
        assert_eq!(options.strategy, SyncStrategy::OnDemand);
        assert!(options.validate().is_ok());

        let request = options.to_request(EntityKind::Map);
        assert_eq!(request.kind, EntityKind::Map);
        assert_eq!(request.lifetime, Lifetime::from_secs(60));
    }

    #[test]
    fn default_lifetime_is_infinite() {
        assert!(OpenOptions::new().lifetime.is_infinite());
        assert!(OpenOptions::create_only("x").lifetime.is_infinite());
    }

    #[test]
    fn invalid_open_options() {
        assert!(OpenOptions::create_only("").validate().is_err());
        assert!(OpenOptions::new()
            .with_mode(OpenMode::OpenOnly)
            .validate()
            .is_err());
        assert!(OpenOptions::open_by_id(EntityId::new())
            .with_mode(OpenMode::CreateOnly)
            .validate()
            .is_err());
        assert!(OpenOptions::open_by_id(EntityId::new()).validate().is_ok());
    }

    #[test]
    fn item_accessors() {
        let item = Item {
            key: ItemKey::Index(4),
            data: Data::new(),
            date_updated: SystemTime::now(),
            expires_at: None,
        };
        assert_eq!(item.index(), Some(4));
        assert_eq!(item.map_key(), None);
    }
}
