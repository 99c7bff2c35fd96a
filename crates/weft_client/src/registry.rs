//! Cache of open entities and application of incoming changes.
//!
//! Every handle on the same entity shares one [`CachedEntity`]. Changes
//! arrive from two directions, the responses to this client's own writes
//! and the notifications pushed by the service, and both go through
//! [`EntityRegistry::apply`]. Revisions are totally ordered by the service,
//! so a change is applied (and its event emitted) only if it is newer than
//! what the cache holds. That makes duplicates and late arrivals harmless.

use crate::connection::ConnectionManager;
use crate::dispatcher::{EntityEvent, EntityObserver, EventContext, EventDispatcher};
use crate::entity::{EntityInfo, Item, OpenOptions, SyncStrategy};
use crate::error::{SyncError, SyncResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};
use weft_protocol::{
    Change, Data, EntityId, EntityKind, EntityMetadata, EntitySnapshot, ItemKey, ItemSnapshot,
    QueryOrder, QueryRequest, Request, Revision,
};

/// Client-side copy of one entity.
#[derive(Debug)]
pub(crate) struct CachedEntity {
    pub(crate) metadata: EntityMetadata,
    pub(crate) data: Data,
    pub(crate) items: BTreeMap<ItemKey, ItemSnapshot>,
    /// Revisions of removals, so a late add cannot resurrect an item.
    tombstones: HashMap<ItemKey, Revision>,
    /// True once every item of the collection is cached.
    pub(crate) complete: bool,
    pub(crate) removed: bool,
}

impl CachedEntity {
    fn new(snapshot: &EntitySnapshot) -> Self {
        Self {
            metadata: snapshot.metadata.clone(),
            data: snapshot.data.clone(),
            items: BTreeMap::new(),
            tombstones: HashMap::new(),
            complete: false,
            removed: false,
        }
    }

    /// Highest revision known for an item address.
    fn item_floor(&self, key: &ItemKey) -> Option<Revision> {
        let cached = self.items.get(key).map(|item| item.revision);
        let removed = self.tombstones.get(key).copied();
        cached.max(removed)
    }

    fn touch(&mut self, at: std::time::SystemTime) {
        if self.metadata.date_updated.map_or(true, |current| current < at) {
            self.metadata.date_updated = Some(at);
        }
    }
}

pub(crate) type SharedEntity = Arc<RwLock<CachedEntity>>;

struct Entry {
    cache: SharedEntity,
    handles: usize,
}

/// Tracks open entities for one client.
pub(crate) struct EntityRegistry {
    entries: Arc<Mutex<HashMap<EntityId, Entry>>>,
    /// Serializes subscribing opens with the unsubscribe of a released entity.
    subscriptions: Arc<AsyncMutex<()>>,
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<EventDispatcher>,
    page_size: u32,
}

impl EntityRegistry {
    pub(crate) fn new(
        connection: Arc<ConnectionManager>,
        dispatcher: Arc<EventDispatcher>,
        page_size: u32,
    ) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(AsyncMutex::new(())),
            connection,
            dispatcher,
            page_size: page_size.max(1),
        }
    }

    pub(crate) fn get(&self, entity: EntityId) -> Option<SharedEntity> {
        self.entries
            .lock()
            .get(&entity)
            .map(|entry| Arc::clone(&entry.cache))
    }

    /// Opens an entity and registers a handle on it.
    ///
    /// Returns the entity id, the shared cache and the handle's
    /// registration.
    pub(crate) async fn open(
        &self,
        kind: EntityKind,
        options: &OpenOptions,
        observer: Option<Weak<dyn EntityObserver>>,
    ) -> SyncResult<(EntityId, SharedEntity, u64)> {
        options.validate()?;
        let (snapshot, cache, existing) = {
            // Held until the entry exists, so an unsubscribe queued by an
            // earlier release either runs first or sees the entry and skips.
            let _subscribing = self.subscriptions.lock().await;
            let snapshot = self
                .connection
                .request(Request::Open(options.to_request(kind)))
                .await?
                .into_snapshot()?;
            if snapshot.metadata.kind != kind {
                return Err(SyncError::invalid(format!(
                    "entity {} is a {}, not a {kind}",
                    snapshot.metadata.id, snapshot.metadata.kind
                )));
            }
            let (cache, existing) = self.insert(&snapshot);
            (snapshot, cache, existing)
        };
        let id = snapshot.metadata.id;
        if existing {
            self.refresh(id, &cache, &snapshot, EventContext::REMOTE);
        }
        let registration = self.dispatcher.register(id, observer);

        let prefetch = kind.is_collection()
            && options.strategy == SyncStrategy::EagerPrefetch
            && !cache.read().complete;
        if prefetch {
            match self.fetch_all(id).await {
                Ok(items) => self.fill(id, &cache, items, true),
                Err(err) => {
                    self.release(id, registration);
                    return Err(err);
                }
            }
        }

        debug!(entity = %id, %kind, reused = existing, "entity opened");
        let info = EntityInfo::from(&cache.read().metadata);
        self.dispatcher
            .emit_to(id, registration, EntityEvent::Opened(info));
        Ok((id, cache, registration))
    }

    /// Drops one handle's hold on an entity.
    ///
    /// The last handle out evicts the cache and unsubscribes.
    pub(crate) fn release(&self, entity: EntityId, registration: u64) {
        self.dispatcher.unregister(entity, registration);
        let evicted = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&entity) {
                Some(entry) if entry.handles > 1 => {
                    entry.handles -= 1;
                    false
                }
                Some(_) => {
                    entries.remove(&entity);
                    true
                }
                None => false,
            }
        };
        if !evicted {
            return;
        }
        trace!(entity = %entity, "last handle released");
        if let Ok(runtime) = Handle::try_current() {
            let connection = Arc::clone(&self.connection);
            let entries = Arc::clone(&self.entries);
            let subscriptions = Arc::clone(&self.subscriptions);
            runtime.spawn(async move {
                let _subscribing = subscriptions.lock().await;
                // Reopened in the meantime; the open already resubscribed
                let reopened = entries.lock().contains_key(&entity);
                if reopened {
                    return;
                }
                let _ = connection
                    .try_request(Request::Unsubscribe { entity })
                    .await;
            });
        }
    }

    /// Adds a handle to the entry for `snapshot`, creating the entry if
    /// needed. Returns the cache and whether it already existed.
    fn insert(&self, snapshot: &EntitySnapshot) -> (SharedEntity, bool) {
        let mut entries = self.entries.lock();
        let existing = entries.contains_key(&snapshot.metadata.id);
        let entry = entries
            .entry(snapshot.metadata.id)
            .or_insert_with(|| Entry {
                cache: Arc::new(RwLock::new(CachedEntity::new(snapshot))),
                handles: 0,
            });
        entry.handles += 1;
        (Arc::clone(&entry.cache), existing)
    }

    /// Forgets every entity. Used at shutdown.
    pub(crate) fn release_all(&self) {
        self.entries.lock().clear();
    }

    /// Applies a change if it is newer than the cache.
    pub(crate) fn apply(&self, entity: EntityId, change: &Change, context: EventContext) {
        let Some(cache) = self.get(entity) else {
            trace!(entity = %entity, "change for entity not open; ignored");
            return;
        };
        // Events are emitted under the cache lock so concurrent appliers
        // cannot reorder them.
        let mut cached = cache.write();
        match change {
            Change::DocumentUpdated(snapshot) => {
                if snapshot.metadata.revision > cached.metadata.revision {
                    cached.metadata = snapshot.metadata.clone();
                    cached.data = snapshot.data.clone();
                    self.dispatcher.emit(
                        entity,
                        EntityEvent::DocumentUpdated {
                            data: snapshot.data.clone(),
                            context,
                        },
                    );
                }
            }
            Change::ItemAdded(item) | Change::ItemUpdated(item) => {
                if cached.item_floor(&item.key).is_some_and(|floor| item.revision <= floor) {
                    return;
                }
                cached.tombstones.remove(&item.key);
                cached.touch(item.date_updated);
                let previous = cached.items.insert(item.key.clone(), item.clone());
                let event = match change {
                    Change::ItemAdded(_) => EntityEvent::ItemAdded {
                        item: Item::from(item),
                        context,
                    },
                    _ => EntityEvent::ItemUpdated {
                        item: Item::from(item),
                        previous: previous.map(|p| p.data),
                        context,
                    },
                };
                self.dispatcher.emit(entity, event);
            }
            Change::ItemRemoved { key, revision } => {
                if cached.item_floor(key).is_some_and(|floor| *revision <= floor) {
                    return;
                }
                let previous = cached.items.remove(key);
                cached.tombstones.insert(key.clone(), *revision);
                self.dispatcher.emit(
                    entity,
                    EntityEvent::ItemRemoved {
                        key: key.clone(),
                        previous: previous.map(|p| p.data),
                        context,
                    },
                );
            }
            Change::EntityRemoved => {
                if cached.removed {
                    return;
                }
                cached.removed = true;
                cached.items.clear();
                self.dispatcher.emit(entity, EntityEvent::Removed(context));
            }
            Change::MessagePublished(message) => {
                self.dispatcher.emit(
                    entity,
                    EntityEvent::MessagePublished {
                        message: message.clone(),
                        context,
                    },
                );
            }
        }
    }

    /// Applies a fetched snapshot of the entity itself.
    pub(crate) fn apply_snapshot(&self, entity: EntityId, snapshot: &EntitySnapshot, context: EventContext) {
        if let Some(cache) = self.get(entity) {
            self.refresh(entity, &cache, snapshot, context);
        }
    }

    fn refresh(&self, entity: EntityId, cache: &SharedEntity, snapshot: &EntitySnapshot, context: EventContext) {
        let mut cached = cache.write();
        let revision = snapshot.metadata.revision;
        if revision < cached.metadata.revision {
            return;
        }
        let newer = revision > cached.metadata.revision;
        cached.metadata = snapshot.metadata.clone();
        if newer && cached.metadata.kind == EntityKind::Document {
            cached.data = snapshot.data.clone();
            self.dispatcher.emit(
                entity,
                EntityEvent::DocumentUpdated {
                    data: snapshot.data.clone(),
                    context,
                },
            );
        }
    }

    /// Refreshes a single fetched item.
    ///
    /// An item at the cached revision only updates its expiry.
    pub(crate) fn refresh_item(&self, entity: EntityId, item: &ItemSnapshot) {
        let Some(cache) = self.get(entity) else {
            return;
        };
        {
            let mut cached = cache.write();
            if let Some(current) = cached.items.get_mut(&item.key) {
                if current.revision == item.revision {
                    current.expires_at = item.expires_at;
                    return;
                }
            }
        }
        self.fill(entity, &cache, vec![item.clone()], false);
    }

    /// Merges fetched items into the cache.
    ///
    /// With `complete`, `items` is the whole collection: cached items the
    /// service no longer has are dropped and the cache is marked complete.
    pub(crate) fn fill_items(&self, entity: EntityId, items: Vec<ItemSnapshot>, complete: bool) {
        if let Some(cache) = self.get(entity) {
            self.fill(entity, &cache, items, complete);
        }
    }

    fn fill(&self, entity: EntityId, cache: &SharedEntity, items: Vec<ItemSnapshot>, complete: bool) {
        let context = EventContext::REMOTE;
        let mut cached = cache.write();
        let mut seen = HashSet::with_capacity(items.len());

        for item in items {
            seen.insert(item.key.clone());
            if let Some(current) = cached.items.get_mut(&item.key) {
                if item.revision == current.revision {
                    current.expires_at = item.expires_at;
                    continue;
                }
                if item.revision < current.revision {
                    continue;
                }
                let previous = std::mem::replace(current, item.clone());
                self.dispatcher.emit(
                    entity,
                    EntityEvent::ItemUpdated {
                        item: Item::from(&item),
                        previous: Some(previous.data),
                        context,
                    },
                );
                continue;
            }
            if cached
                .tombstones
                .get(&item.key)
                .is_some_and(|removed| item.revision <= *removed)
            {
                continue;
            }
            // Items first seen while paging a partial cache are not news
            if cached.complete {
                self.dispatcher.emit(
                    entity,
                    EntityEvent::ItemAdded {
                        item: Item::from(&item),
                        context,
                    },
                );
            }
            cached.items.insert(item.key.clone(), item);
        }

        if complete {
            let gone: Vec<ItemKey> = cached
                .items
                .keys()
                .filter(|key| !seen.contains(*key))
                .cloned()
                .collect();
            for key in gone {
                let previous = cached.items.remove(&key).map(|p| p.data);
                self.dispatcher.emit(
                    entity,
                    EntityEvent::ItemRemoved {
                        key,
                        previous,
                        context,
                    },
                );
            }
            cached.complete = true;
        }
    }

    /// Fetches every item of a collection, in key order.
    async fn fetch_all(&self, entity: EntityId) -> SyncResult<Vec<ItemSnapshot>> {
        let mut items: Vec<ItemSnapshot> = Vec::new();
        loop {
            let query = QueryRequest {
                entity,
                from: items.last().map(|item| item.key.clone()),
                inclusive: false,
                order: QueryOrder::Ascending,
                limit: self.page_size,
            };
            let page = self
                .connection
                .request(Request::Query(query))
                .await?
                .into_page()?;
            let more = page.has_more && !page.items.is_empty();
            items.extend(page.items);
            if !more {
                return Ok(items);
            }
        }
    }

    /// Brings every open entity up to date after a new session starts.
    pub(crate) async fn resync(&self) {
        let open: Vec<(EntityId, SharedEntity)> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(&entry.cache)))
            .collect();
        debug!(entities = open.len(), "resubscribing after reconnect");

        for (id, cache) in open {
            let removed = cache.read().removed;
            if removed {
                continue;
            }
            let snapshot = match self.connection.request(Request::Subscribe { entity: id }).await {
                Ok(response) => response.into_snapshot().map_err(SyncError::from),
                Err(err) => Err(err),
            };
            match snapshot {
                Ok(snapshot) => self.refresh(id, &cache, &snapshot, EventContext::REMOTE),
                Err(SyncError::NotFound(_)) => {
                    self.apply(id, &Change::EntityRemoved, EventContext::REMOTE);
                    continue;
                }
                Err(err) => {
                    warn!(entity = %id, error = %err, "resubscribe failed");
                    self.dispatcher.emit(id, EntityEvent::Errored(err));
                    continue;
                }
            }

            let (collection, complete) = {
                let cached = cache.read();
                (cached.metadata.kind.is_collection(), cached.complete)
            };
            if !collection {
                continue;
            }
            if complete {
                match self.fetch_all(id).await {
                    Ok(items) => self.fill(id, &cache, items, true),
                    Err(err) => {
                        warn!(entity = %id, error = %err, "refetch failed");
                        let mut cached = cache.write();
                        cached.items.clear();
                        cached.complete = false;
                    }
                }
            } else {
                // Changes missed while offline are picked up on next access
                cache.write().items.clear();
            }
        }
    }
}
