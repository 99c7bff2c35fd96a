//! Server-side entity storage.

use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::SystemTime;
use weft_protocol::{
    Change, Data, EntityId, EntityKind, EntityMetadata, EntitySnapshot, Identifier, ItemKey,
    ItemSnapshot, Lifetime, OpenMode, OpenRequest, Precondition, QueryOrder, QueryPage,
    QueryRequest, Revision,
};

/// Result of opening an entity.
#[derive(Debug, Clone)]
pub struct Opened {
    /// Snapshot after the open.
    pub snapshot: EntitySnapshot,
    /// Whether the entity was created by this open.
    pub created: bool,
}

/// Result of writing an item.
#[derive(Debug, Clone)]
pub struct ItemWrite {
    /// Item after the write.
    pub item: ItemSnapshot,
    /// Whether the write created the item.
    pub created: bool,
}

struct StoredEntity {
    metadata: EntityMetadata,
    data: Data,
    items: BTreeMap<ItemKey, ItemSnapshot>,
    next_index: u64,
}

impl StoredEntity {
    fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            metadata: self.metadata.clone(),
            data: self.data.clone(),
        }
    }

    fn item(&self, key: &ItemKey) -> ServerResult<&ItemSnapshot> {
        self.items.get(key).ok_or_else(|| ServerError::ItemNotFound {
            entity: self.metadata.id,
            key: key.clone(),
        })
    }

    fn check_key(&self, key: &ItemKey) -> ServerResult<()> {
        if key.fits(self.metadata.kind) {
            Ok(())
        } else {
            Err(ServerError::InvalidRequest(format!(
                "key {key} does not address an item of a {}",
                self.metadata.kind
            )))
        }
    }
}

#[derive(Default)]
struct StoreState {
    /// Last revision handed out.
    revision: u64,
    entities: HashMap<EntityId, StoredEntity>,
    names: HashMap<(EntityKind, String), EntityId>,
}

impl StoreState {
    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        Revision(self.revision)
    }

    fn entity(&self, id: EntityId) -> ServerResult<&StoredEntity> {
        self.entities.get(&id).ok_or_else(|| ServerError::EntityNotFound(id.to_string()))
    }

    fn entity_mut(&mut self, id: EntityId) -> ServerResult<&mut StoredEntity> {
        self.entities
            .get_mut(&id)
            .ok_or_else(|| ServerError::EntityNotFound(id.to_string()))
    }

    fn collection_mut(&mut self, id: EntityId) -> ServerResult<&mut StoredEntity> {
        let entity = self.entity_mut(id)?;
        if !entity.metadata.kind.is_collection() {
            return Err(ServerError::InvalidRequest(format!(
                "{} {id} has no items",
                entity.metadata.kind
            )));
        }
        Ok(entity)
    }

    fn lookup(&self, kind: EntityKind, identifier: &Identifier) -> Option<EntityId> {
        match identifier {
            Identifier::Id(id) => self
                .entities
                .get(id)
                .filter(|e| e.metadata.kind == kind)
                .map(|_| *id),
            Identifier::UniqueName(name) => self.names.get(&(kind, name.clone())).copied(),
        }
    }
}

/// In-memory store of every entity the service holds.
///
/// All revisions come from a single counter, so any write observed later
/// carries a strictly higher revision.
pub struct EntityStore {
    state: RwLock<StoreState>,
}

impl EntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Opens or creates an entity.
    pub fn open(&self, request: &OpenRequest, now: SystemTime) -> ServerResult<Opened> {
        let mut state = self.state.write();
        let existing = request
            .identifier
            .as_ref()
            .and_then(|identifier| state.lookup(request.kind, identifier));

        match (request.mode, existing) {
            (OpenMode::CreateOnly, Some(_)) => {
                let name = match &request.identifier {
                    Some(Identifier::UniqueName(name)) => name.clone(),
                    Some(Identifier::Id(id)) => id.to_string(),
                    None => String::new(),
                };
                Err(ServerError::NameTaken {
                    kind: request.kind,
                    name,
                })
            }
            (OpenMode::CreateOrOpen | OpenMode::OpenOnly, Some(id)) => Ok(Opened {
                snapshot: state.entity(id)?.snapshot(),
                created: false,
            }),
            (OpenMode::OpenOnly, None) => Err(ServerError::EntityNotFound(
                match &request.identifier {
                    Some(Identifier::UniqueName(name)) => format!("{} {name:?}", request.kind),
                    Some(Identifier::Id(id)) => format!("{} {id}", request.kind),
                    None => format!("unnamed {}", request.kind),
                },
            )),
            (OpenMode::CreateOnly | OpenMode::CreateOrOpen, None) => {
                let unique_name = match &request.identifier {
                    Some(Identifier::UniqueName(name)) => Some(name.clone()),
                    Some(Identifier::Id(id)) => {
                        return Err(ServerError::InvalidRequest(format!(
                            "cannot create an entity with a caller-chosen id {id}"
                        )))
                    }
                    None => None,
                };

                let id = EntityId::new();
                let revision = state.next_revision();
                let metadata = EntityMetadata {
                    id,
                    kind: request.kind,
                    unique_name: unique_name.clone(),
                    revision,
                    date_updated: Some(now),
                    expires_at: request.lifetime.expires_at(now),
                };
                if let Some(name) = unique_name {
                    state.names.insert((request.kind, name), id);
                }
                let entity = StoredEntity {
                    metadata,
                    data: Data::new(),
                    items: BTreeMap::new(),
                    next_index: 0,
                };
                let snapshot = entity.snapshot();
                state.entities.insert(id, entity);
                Ok(Opened {
                    snapshot,
                    created: true,
                })
            }
        }
    }

    /// Returns the current snapshot of an entity.
    pub fn snapshot(&self, id: EntityId) -> ServerResult<EntitySnapshot> {
        Ok(self.state.read().entity(id)?.snapshot())
    }

    /// Returns the kind of an entity.
    pub fn kind_of(&self, id: EntityId) -> ServerResult<EntityKind> {
        Ok(self.state.read().entity(id)?.metadata.kind)
    }

    /// Overwrites document data.
    pub fn update_document(
        &self,
        id: EntityId,
        data: Data,
        lifetime: Option<Lifetime>,
        precondition: Precondition,
        now: SystemTime,
    ) -> ServerResult<EntitySnapshot> {
        let mut state = self.state.write();
        let current = {
            let entity = state.entity(id)?;
            if entity.metadata.kind != EntityKind::Document {
                return Err(ServerError::InvalidRequest(format!(
                    "{} {id} is not a document",
                    entity.metadata.kind
                )));
            }
            entity.metadata.revision
        };
        match precondition {
            Precondition::None => {}
            Precondition::Revision(expected) if expected == current => {}
            Precondition::Revision(expected) => {
                return Err(ServerError::RevisionConflict {
                    expected: Some(expected),
                    current: Some(current),
                })
            }
            Precondition::Absent => {
                return Err(ServerError::InvalidRequest(
                    "documents always exist once opened".into(),
                ))
            }
        }

        let revision = state.next_revision();
        let entity = state.entity_mut(id)?;
        entity.data = data;
        entity.metadata.revision = revision;
        entity.metadata.date_updated = Some(now);
        if let Some(lifetime) = lifetime {
            entity.metadata.expires_at = lifetime.expires_at(now);
        }
        Ok(entity.snapshot())
    }

    /// Returns one item.
    pub fn get_item(&self, id: EntityId, key: &ItemKey) -> ServerResult<ItemSnapshot> {
        let state = self.state.read();
        let entity = state.entity(id)?;
        entity.check_key(key)?;
        entity.item(key).cloned()
    }

    /// Appends an item to a list, assigning the next index.
    pub fn add_item(
        &self,
        id: EntityId,
        data: Data,
        lifetime: Option<Lifetime>,
        now: SystemTime,
    ) -> ServerResult<ItemSnapshot> {
        let mut state = self.state.write();
        if state.entity(id)?.metadata.kind != EntityKind::List {
            return Err(ServerError::InvalidRequest(format!(
                "{id} is not a list; items are appended to lists only"
            )));
        }
        let revision = state.next_revision();
        let entity = state.collection_mut(id)?;

        // Indexes are never reused, even after removal
        let index = entity.next_index;
        entity.next_index += 1;

        let item = ItemSnapshot {
            key: ItemKey::Index(index),
            data,
            revision,
            date_updated: now,
            expires_at: lifetime.unwrap_or_default().expires_at(now),
        };
        entity.items.insert(item.key.clone(), item.clone());
        entity.metadata.date_updated = Some(now);
        Ok(item)
    }

    /// Writes an item, honoring the precondition.
    ///
    /// Map items are created on first write; list items must already exist.
    pub fn set_item(
        &self,
        id: EntityId,
        key: ItemKey,
        data: Data,
        lifetime: Option<Lifetime>,
        precondition: Precondition,
        now: SystemTime,
    ) -> ServerResult<ItemWrite> {
        let mut state = self.state.write();
        let (kind, current) = {
            let entity = state.entity(id)?;
            entity.check_key(&key)?;
            (
                entity.metadata.kind,
                entity.items.get(&key).map(|item| item.revision),
            )
        };

        match (precondition, current) {
            (_, None) if kind == EntityKind::List => {
                return Err(ServerError::ItemNotFound { entity: id, key })
            }
            (Precondition::None, _) => {}
            (Precondition::Revision(expected), Some(current)) if expected == current => {}
            (Precondition::Absent, None) => {}
            (Precondition::Revision(expected), current) => {
                return Err(ServerError::RevisionConflict {
                    expected: Some(expected),
                    current,
                })
            }
            (Precondition::Absent, current) => {
                return Err(ServerError::RevisionConflict {
                    expected: None,
                    current,
                })
            }
        }

        let revision = state.next_revision();
        let entity = state.collection_mut(id)?;
        let expires_at = match (lifetime, entity.items.get(&key)) {
            (Some(lifetime), _) => lifetime.expires_at(now),
            (None, Some(existing)) => existing.expires_at,
            (None, None) => None,
        };
        let item = ItemSnapshot {
            key: key.clone(),
            data,
            revision,
            date_updated: now,
            expires_at,
        };
        let created = entity.items.insert(key, item.clone()).is_none();
        entity.metadata.date_updated = Some(now);
        Ok(ItemWrite { item, created })
    }

    /// Removes an item and returns the revision assigned to the removal.
    pub fn remove_item(
        &self,
        id: EntityId,
        key: &ItemKey,
        now: SystemTime,
    ) -> ServerResult<Revision> {
        let mut state = self.state.write();
        {
            let entity = state.entity(id)?;
            entity.check_key(key)?;
            entity.item(key)?;
        }
        let revision = state.next_revision();
        let entity = state.collection_mut(id)?;
        entity.items.remove(key);
        entity.metadata.date_updated = Some(now);
        Ok(revision)
    }

    /// Returns one page of items.
    pub fn query(&self, request: &QueryRequest, max_page_size: u32) -> ServerResult<QueryPage> {
        if request.limit == 0 {
            return Err(ServerError::InvalidRequest("page size must be positive".into()));
        }
        let state = self.state.read();
        let entity = state.entity(request.entity)?;
        if !entity.metadata.kind.is_collection() {
            return Err(ServerError::InvalidRequest(format!(
                "{} {} cannot be queried",
                entity.metadata.kind, request.entity
            )));
        }
        if let Some(from) = &request.from {
            entity.check_key(from)?;
        }

        let limit = request.limit.min(max_page_size) as usize;
        let (after, before) = match &request.from {
            None => (Bound::Unbounded, Bound::Unbounded),
            Some(from) if request.inclusive => (Bound::Included(from), Bound::Excluded(from)),
            Some(from) => (Bound::Excluded(from), Bound::Included(from)),
        };

        let mut candidates: Box<dyn Iterator<Item = &ItemSnapshot>> = match request.order {
            QueryOrder::Ascending => {
                Box::new(entity.items.range((after, Bound::Unbounded)).map(|(_, item)| item))
            }
            QueryOrder::Descending => Box::new(
                entity
                    .items
                    .range((Bound::Unbounded, after))
                    .rev()
                    .map(|(_, item)| item),
            ),
        };
        let items: Vec<ItemSnapshot> = candidates.by_ref().take(limit).cloned().collect();
        let has_more = candidates.next().is_some();

        let has_before = match (&request.from, request.order) {
            (None, _) => false,
            (Some(_), QueryOrder::Ascending) => {
                entity.items.range((Bound::Unbounded, before)).next().is_some()
            }
            (Some(_), QueryOrder::Descending) => {
                entity.items.range((before, Bound::Unbounded)).next().is_some()
            }
        };

        Ok(QueryPage {
            items,
            has_more,
            has_before,
        })
    }

    /// Changes the lifetime of an entity or item, counted from `now`.
    pub fn set_lifetime(
        &self,
        id: EntityId,
        key: Option<&ItemKey>,
        lifetime: Lifetime,
        now: SystemTime,
    ) -> ServerResult<()> {
        let mut state = self.state.write();
        let entity = state.entity_mut(id)?;
        match key {
            None => entity.metadata.expires_at = lifetime.expires_at(now),
            Some(key) => {
                entity.check_key(key)?;
                let item = entity
                    .items
                    .get_mut(key)
                    .ok_or_else(|| ServerError::ItemNotFound {
                        entity: id,
                        key: key.clone(),
                    })?;
                item.expires_at = lifetime.expires_at(now);
            }
        }
        Ok(())
    }

    /// Deletes an entity, releasing its unique name.
    pub fn remove_entity(&self, id: EntityId) -> ServerResult<EntityMetadata> {
        let mut state = self.state.write();
        let entity = state
            .entities
            .remove(&id)
            .ok_or_else(|| ServerError::EntityNotFound(id.to_string()))?;
        if let Some(name) = &entity.metadata.unique_name {
            state.names.remove(&(entity.metadata.kind, name.clone()));
        }
        Ok(entity.metadata)
    }

    /// Deletes everything whose lifetime elapsed at or before `now`.
    ///
    /// Returns the resulting changes so subscribers can be told.
    pub fn purge_expired(&self, now: SystemTime) -> Vec<(EntityId, Change)> {
        let mut state = self.state.write();
        let expired = |at: Option<SystemTime>| at.is_some_and(|at| at <= now);

        let dead: Vec<EntityId> = state
            .entities
            .values()
            .filter(|e| expired(e.metadata.expires_at))
            .map(|e| e.metadata.id)
            .collect();

        let mut changes = Vec::new();
        for id in dead {
            if let Some(entity) = state.entities.remove(&id) {
                if let Some(name) = entity.metadata.unique_name {
                    state.names.remove(&(entity.metadata.kind, name));
                }
                changes.push((id, Change::EntityRemoved));
            }
        }

        let dead_items: Vec<(EntityId, ItemKey)> = state
            .entities
            .values()
            .flat_map(|e| {
                e.items
                    .values()
                    .filter(|item| expired(item.expires_at))
                    .map(|item| (e.metadata.id, item.key.clone()))
            })
            .collect();

        for (id, key) in dead_items {
            let revision = state.next_revision();
            if let Some(entity) = state.entities.get_mut(&id) {
                entity.items.remove(&key);
                changes.push((id, Change::ItemRemoved { key, revision }));
            }
        }
        changes
    }

    /// Returns the number of entities.
    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    /// Returns true if the store holds no entities.
    pub fn is_empty(&self) -> bool {
        self.state.read().entities.is_empty()
    }

    /// Returns the number of items in a collection.
    pub fn item_count(&self, id: EntityId) -> ServerResult<usize> {
        Ok(self.state.read().entity(id)?.items.len())
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn data(value: serde_json::Value) -> Data {
        value.as_object().cloned().unwrap_or_default()
    }

    fn open(store: &EntityStore, kind: EntityKind, mode: OpenMode, name: &str) -> ServerResult<Opened> {
        store.open(
            &OpenRequest {
                kind,
                mode,
                identifier: Some(Identifier::UniqueName(name.into())),
                lifetime: Lifetime::Infinite,
            },
            SystemTime::now(),
        )
    }

    fn query(store: &EntityStore, id: EntityId, from: Option<ItemKey>, order: QueryOrder, limit: u32) -> QueryPage {
        store
            .query(
                &QueryRequest {
                    entity: id,
                    from,
                    inclusive: true,
                    order,
                    limit,
                },
                100,
            )
            .unwrap()
    }

    #[test]
    fn open_modes() {
        let store = EntityStore::new();

        let created = open(&store, EntityKind::Map, OpenMode::CreateOnly, "prefs").unwrap();
        assert!(created.created);

        let again = open(&store, EntityKind::Map, OpenMode::CreateOrOpen, "prefs").unwrap();
        assert!(!again.created);
        assert_eq!(again.snapshot.metadata.id, created.snapshot.metadata.id);

        let dup = open(&store, EntityKind::Map, OpenMode::CreateOnly, "prefs");
        assert!(matches!(dup, Err(ServerError::NameTaken { .. })));

        let missing = open(&store, EntityKind::Map, OpenMode::OpenOnly, "nope");
        assert!(matches!(missing, Err(ServerError::EntityNotFound(_))));

        // Names are scoped per kind
        let doc = open(&store, EntityKind::Document, OpenMode::CreateOnly, "prefs").unwrap();
        assert!(doc.created);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn reopen_keeps_expiry() {
        let store = EntityStore::new();
        let now = SystemTime::now();
        let request = OpenRequest {
            kind: EntityKind::Document,
            mode: OpenMode::CreateOrOpen,
            identifier: Some(Identifier::UniqueName("session".into())),
            lifetime: Lifetime::from_secs(60),
        };
        let first = store.open(&request, now).unwrap();

        let reopen = OpenRequest {
            lifetime: Lifetime::from_secs(3600),
            ..request
        };
        let second = store.open(&reopen, now + Duration::from_secs(5)).unwrap();
        assert_eq!(
            first.snapshot.metadata.expires_at,
            second.snapshot.metadata.expires_at
        );
    }

    #[test]
    fn document_conditional_update() {
        let store = EntityStore::new();
        let doc = open(&store, EntityKind::Document, OpenMode::CreateOnly, "d").unwrap();
        let id = doc.snapshot.metadata.id;
        let rev = doc.snapshot.metadata.revision;
        let now = SystemTime::now();

        let updated = store
            .update_document(id, data(json!({"a": 1})), None, Precondition::Revision(rev), now)
            .unwrap();
        assert!(updated.metadata.revision > rev);

        // Stale revision loses
        let stale = store.update_document(id, data(json!({"a": 2})), None, Precondition::Revision(rev), now);
        assert!(matches!(stale, Err(ServerError::RevisionConflict { .. })));
        assert_eq!(store.snapshot(id).unwrap().data, data(json!({"a": 1})));
    }

    #[test]
    fn list_indexes_are_never_reused() {
        let store = EntityStore::new();
        let list = open(&store, EntityKind::List, OpenMode::CreateOnly, "l").unwrap();
        let id = list.snapshot.metadata.id;
        let now = SystemTime::now();

        let first = store.add_item(id, Data::new(), None, now).unwrap();
        let second = store.add_item(id, Data::new(), None, now).unwrap();
        store.remove_item(id, &second.key, now).unwrap();
        let third = store.add_item(id, Data::new(), None, now).unwrap();

        assert_eq!(first.key, ItemKey::Index(0));
        assert_eq!(second.key, ItemKey::Index(1));
        assert_eq!(third.key, ItemKey::Index(2));
        assert_eq!(store.item_count(id).unwrap(), 2);
    }

    #[test]
    fn map_item_preconditions() {
        let store = EntityStore::new();
        let map = open(&store, EntityKind::Map, OpenMode::CreateOnly, "m").unwrap();
        let id = map.snapshot.metadata.id;
        let now = SystemTime::now();
        let key = ItemKey::from("theme");

        let created = store
            .set_item(id, key.clone(), data(json!({"mode": "dark"})), None, Precondition::Absent, now)
            .unwrap();
        assert!(created.created);

        let again = store.set_item(id, key.clone(), Data::new(), None, Precondition::Absent, now);
        assert!(matches!(again, Err(ServerError::RevisionConflict { .. })));

        let updated = store
            .set_item(
                id,
                key.clone(),
                data(json!({"mode": "light"})),
                None,
                Precondition::Revision(created.item.revision),
                now,
            )
            .unwrap();
        assert!(!updated.created);

        // Wrong key shape for a map
        let wrong = store.get_item(id, &ItemKey::Index(0));
        assert!(matches!(wrong, Err(ServerError::InvalidRequest(_))));
    }

    #[test]
    fn list_set_requires_existing_item() {
        let store = EntityStore::new();
        let list = open(&store, EntityKind::List, OpenMode::CreateOnly, "l").unwrap();
        let id = list.snapshot.metadata.id;

        let result = store.set_item(
            id,
            ItemKey::Index(7),
            Data::new(),
            None,
            Precondition::None,
            SystemTime::now(),
        );
        assert!(matches!(result, Err(ServerError::ItemNotFound { .. })));
    }

    #[test]
    fn query_pages_and_boundaries() {
        let store = EntityStore::new();
        let list = open(&store, EntityKind::List, OpenMode::CreateOnly, "l").unwrap();
        let id = list.snapshot.metadata.id;
        let now = SystemTime::now();
        for _ in 0..5 {
            store.add_item(id, Data::new(), None, now).unwrap();
        }

        let page = query(&store, id, None, QueryOrder::Ascending, 2);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        assert!(!page.has_before);

        let page = query(&store, id, Some(ItemKey::Index(2)), QueryOrder::Ascending, 2);
        assert_eq!(page.items[0].key, ItemKey::Index(2));
        assert!(page.has_more);
        assert!(page.has_before);

        let page = query(&store, id, None, QueryOrder::Descending, 10);
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.items[0].key, ItemKey::Index(4));
        assert!(!page.has_more);
    }

    #[test]
    fn query_exclusive_bound() {
        let store = EntityStore::new();
        let list = open(&store, EntityKind::List, OpenMode::CreateOnly, "l").unwrap();
        let id = list.snapshot.metadata.id;
        let now = SystemTime::now();
        for _ in 0..3 {
            store.add_item(id, Data::new(), None, now).unwrap();
        }

        let page = store
            .query(
                &QueryRequest {
                    entity: id,
                    from: Some(ItemKey::Index(1)),
                    inclusive: false,
                    order: QueryOrder::Descending,
                    limit: 10,
                },
                100,
            )
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].key, ItemKey::Index(0));
        assert!(page.has_before);
        assert!(!page.has_more);
    }

    #[test]
    fn purge_removes_expired_entities_and_items() {
        let store = EntityStore::new();
        let now = SystemTime::now();
        let temp = store
            .open(
                &OpenRequest {
                    kind: EntityKind::Document,
                    mode: OpenMode::CreateOnly,
                    identifier: Some(Identifier::UniqueName("temp".into())),
                    lifetime: Lifetime::from_secs(10),
                },
                now,
            )
            .unwrap();
        let map = open(&store, EntityKind::Map, OpenMode::CreateOnly, "m").unwrap();
        let map_id = map.snapshot.metadata.id;
        store
            .set_item(map_id, "k".into(), Data::new(), Some(Lifetime::from_secs(5)), Precondition::None, now)
            .unwrap();

        assert!(store.purge_expired(now).is_empty());

        let changes = store.purge_expired(now + Duration::from_secs(11));
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&(temp.snapshot.metadata.id, Change::EntityRemoved)));
        assert!(store.snapshot(temp.snapshot.metadata.id).is_err());
        assert_eq!(store.item_count(map_id).unwrap(), 0);

        // The name is free again
        assert!(open(&store, EntityKind::Document, OpenMode::CreateOnly, "temp").is_ok());
    }
}
