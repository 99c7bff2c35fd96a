//! Ordered delivery of entity and client events.
//!
//! Observers are held as [`Weak`] references: dropping the observer is
//! enough to stop receiving events, and events for dead or missing observers
//! are discarded rather than buffered. Every event, like every operation
//! completion, is queued on the client's [`ExecutionContext`], which gives a
//! single total order per client.

use crate::connection::ConnectionState;
use crate::entity::{EntityInfo, Item};
use crate::error::{SyncError, SyncResult};
use crate::executor::ExecutionContext;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use weft_protocol::{Data, EntityId, ItemKey, StreamMessage};

/// Provenance of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    /// True if this client's own request caused the change.
    pub is_local: bool,
}

impl EventContext {
    /// Context for changes made by this client.
    pub const LOCAL: EventContext = EventContext { is_local: true };
    /// Context for changes made by anyone else, including the service.
    pub const REMOTE: EventContext = EventContext { is_local: false };
}

/// Receives events for one entity.
///
/// Every method has a no-op default; implement the ones you need.
#[allow(unused_variables)]
pub trait EntityObserver: Send + Sync {
    /// The entity was opened by this observer's handle.
    fn on_opened(&self, info: &EntityInfo) {}

    /// Document data changed.
    fn on_document_updated(&self, entity: EntityId, data: &Data, context: EventContext) {}

    /// An item was created.
    fn on_item_added(&self, entity: EntityId, item: &Item, context: EventContext) {}

    /// An item was overwritten. `previous` is the cached data, if any.
    fn on_item_updated(
        &self,
        entity: EntityId,
        item: &Item,
        previous: Option<&Data>,
        context: EventContext,
    ) {
    }

    /// An item was removed. `previous` is the cached data, if any.
    fn on_item_removed(
        &self,
        entity: EntityId,
        key: &ItemKey,
        previous: Option<&Data>,
        context: EventContext,
    ) {
    }

    /// The entity itself was removed or expired.
    fn on_removed(&self, entity: EntityId, context: EventContext) {}

    /// A message was published on a stream.
    fn on_message_published(&self, entity: EntityId, message: &StreamMessage, context: EventContext) {}

    /// An operation on the entity failed.
    fn on_error(&self, entity: EntityId, error: &SyncError) {}
}

/// Receives client-wide events.
#[allow(unused_variables)]
pub trait ClientObserver: Send + Sync {
    /// The connection moved to a new state.
    fn on_connection_state_changed(&self, state: ConnectionState) {}

    /// The token will expire soon; renew it with `update_token`.
    fn on_token_about_to_expire(&self) {}

    /// The token expired and the connection is degraded until renewed.
    fn on_token_expired(&self) {}
}

/// An event bound for entity observers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EntityEvent {
    Opened(EntityInfo),
    DocumentUpdated {
        data: Data,
        context: EventContext,
    },
    ItemAdded {
        item: Item,
        context: EventContext,
    },
    ItemUpdated {
        item: Item,
        previous: Option<Data>,
        context: EventContext,
    },
    ItemRemoved {
        key: ItemKey,
        previous: Option<Data>,
        context: EventContext,
    },
    Removed(EventContext),
    MessagePublished {
        message: StreamMessage,
        context: EventContext,
    },
    Errored(SyncError),
}

impl EntityEvent {
    fn deliver(&self, entity: EntityId, observer: &dyn EntityObserver) {
        match self {
            EntityEvent::Opened(info) => observer.on_opened(info),
            EntityEvent::DocumentUpdated { data, context } => {
                observer.on_document_updated(entity, data, *context)
            }
            EntityEvent::ItemAdded { item, context } => observer.on_item_added(entity, item, *context),
            EntityEvent::ItemUpdated {
                item,
                previous,
                context,
            } => observer.on_item_updated(entity, item, previous.as_ref(), *context),
            EntityEvent::ItemRemoved {
                key,
                previous,
                context,
            } => observer.on_item_removed(entity, key, previous.as_ref(), *context),
            EntityEvent::Removed(context) => observer.on_removed(entity, *context),
            EntityEvent::MessagePublished { message, context } => {
                observer.on_message_published(entity, message, *context)
            }
            EntityEvent::Errored(error) => observer.on_error(entity, error),
        }
    }
}

/// An event bound for the client observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientEvent {
    StateChanged(ConnectionState),
    TokenAboutToExpire,
    TokenExpired,
}

type Registration = (u64, Weak<dyn EntityObserver>);

/// Queues events and completions on the client's execution context.
pub(crate) struct EventDispatcher {
    context: Arc<dyn ExecutionContext>,
    observers: RwLock<HashMap<EntityId, Vec<Registration>>>,
    client_observer: Option<Weak<dyn ClientObserver>>,
    next_registration: AtomicU64,
    stopped: Arc<AtomicBool>,
}

impl EventDispatcher {
    pub(crate) fn new(
        context: Arc<dyn ExecutionContext>,
        client_observer: Option<Weak<dyn ClientObserver>>,
    ) -> Self {
        Self {
            context,
            observers: RwLock::new(HashMap::new()),
            client_observer,
            next_registration: AtomicU64::new(1),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers an observer for an entity and returns the registration id.
    ///
    /// A handle without an observer still gets an id so it can be released
    /// the same way.
    pub(crate) fn register(&self, entity: EntityId, observer: Option<Weak<dyn EntityObserver>>) -> u64 {
        let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
        if let Some(observer) = observer {
            self.observers
                .write()
                .entry(entity)
                .or_default()
                .push((id, observer));
        }
        id
    }

    pub(crate) fn unregister(&self, entity: EntityId, registration: u64) {
        let mut observers = self.observers.write();
        if let Some(list) = observers.get_mut(&entity) {
            list.retain(|(id, _)| *id != registration);
            if list.is_empty() {
                observers.remove(&entity);
            }
        }
    }

    pub(crate) fn unregister_everything(&self) {
        self.observers.write().clear();
    }

    /// Queues an event for every observer of the entity.
    pub(crate) fn emit(&self, entity: EntityId, event: EntityEvent) {
        let targets: Vec<Weak<dyn EntityObserver>> = match self.observers.read().get(&entity) {
            Some(list) => list.iter().map(|(_, weak)| weak.clone()).collect(),
            None => return,
        };
        self.post(entity, event, targets);
    }

    /// Queues an event for a single registration.
    pub(crate) fn emit_to(&self, entity: EntityId, registration: u64, event: EntityEvent) {
        let target = self.observers.read().get(&entity).and_then(|list| {
            list.iter()
                .find(|(id, _)| *id == registration)
                .map(|(_, weak)| weak.clone())
        });
        if let Some(target) = target {
            self.post(entity, event, vec![target]);
        }
    }

    fn post(&self, entity: EntityId, event: EntityEvent, targets: Vec<Weak<dyn EntityObserver>>) {
        if self.is_stopped() {
            return;
        }
        let stopped = Arc::clone(&self.stopped);
        self.context.execute(Box::new(move || {
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            for observer in targets.iter().filter_map(Weak::upgrade) {
                event.deliver(entity, observer.as_ref());
            }
        }));
    }

    /// Queues an event for the client observer.
    pub(crate) fn client_event(&self, event: ClientEvent) {
        let Some(observer) = self.client_observer.clone() else {
            return;
        };
        if self.is_stopped() {
            return;
        }
        let stopped = Arc::clone(&self.stopped);
        self.context.execute(Box::new(move || {
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            let Some(observer) = observer.upgrade() else {
                return;
            };
            match event {
                ClientEvent::StateChanged(state) => observer.on_connection_state_changed(state),
                ClientEvent::TokenAboutToExpire => observer.on_token_about_to_expire(),
                ClientEvent::TokenExpired => observer.on_token_expired(),
            }
        }));
    }

    /// Hands an operation result back through the execution context.
    ///
    /// Events queued before the call are delivered before the result is.
    pub(crate) async fn complete<T: Send + 'static>(&self, result: SyncResult<T>) -> SyncResult<T> {
        if self.is_stopped() {
            return Err(SyncError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        self.context.execute(Box::new(move || {
            let _ = tx.send(result);
        }));
        rx.await.unwrap_or(Err(SyncError::ShuttingDown))
    }

    /// Stops all further delivery, including already queued events.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.unregister_everything();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self, entity: EntityId) -> usize {
        self.observers.read().get(&entity).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SerialQueue;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EntityObserver for Recorder {
        fn on_document_updated(&self, _entity: EntityId, data: &Data, context: EventContext) {
            self.seen
                .lock()
                .push(format!("doc {} local={}", data.len(), context.is_local));
        }

        fn on_removed(&self, _entity: EntityId, _context: EventContext) {
            self.seen.lock().push("removed".into());
        }

        fn on_error(&self, _entity: EntityId, error: &SyncError) {
            self.seen.lock().push(format!("error {error}"));
        }
    }

    fn dispatcher() -> EventDispatcher {
        EventDispatcher::new(Arc::new(SerialQueue::new().unwrap()), None)
    }

    #[tokio::test]
    async fn events_arrive_in_order_before_completion() {
        let dispatcher = dispatcher();
        let entity = EntityId::new();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn EntityObserver> = Arc::downgrade(&recorder) as Weak<dyn EntityObserver>;
        dispatcher.register(entity, Some(weak));

        dispatcher.emit(
            entity,
            EntityEvent::DocumentUpdated {
                data: Data::new(),
                context: EventContext::LOCAL,
            },
        );
        dispatcher.emit(entity, EntityEvent::Removed(EventContext::REMOTE));
        dispatcher.emit(entity, EntityEvent::Errored(SyncError::invalid("bad")));

        assert_eq!(dispatcher.complete(Ok(7)).await, Ok(7));
        assert_eq!(
            *recorder.seen.lock(),
            vec![
                "doc 0 local=true".to_string(),
                "removed".to_string(),
                "error invalid argument: bad".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn dropped_observer_gets_nothing() {
        let dispatcher = dispatcher();
        let entity = EntityId::new();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn EntityObserver> = Arc::downgrade(&recorder) as Weak<dyn EntityObserver>;
        dispatcher.register(entity, Some(weak.clone()));
        drop(recorder);

        dispatcher.emit(entity, EntityEvent::Removed(EventContext::REMOTE));
        assert_eq!(dispatcher.complete(Ok(())).await, Ok(()));
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn unregister_removes_only_that_registration() {
        let dispatcher = dispatcher();
        let entity = EntityId::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let first = dispatcher.register(entity, Some(Arc::downgrade(&a) as Weak<dyn EntityObserver>));
        dispatcher.register(entity, Some(Arc::downgrade(&b) as Weak<dyn EntityObserver>));
        assert_eq!(dispatcher.observer_count(entity), 2);

        dispatcher.unregister(entity, first);
        dispatcher.emit(entity, EntityEvent::Removed(EventContext::REMOTE));
        dispatcher.complete(Ok(())).await.unwrap();

        assert!(a.seen.lock().is_empty());
        assert_eq!(b.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn stopped_dispatcher_fails_completions() {
        let dispatcher = dispatcher();
        let entity = EntityId::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(entity, Some(Arc::downgrade(&recorder) as Weak<dyn EntityObserver>));

        dispatcher.stop();
        dispatcher.emit(entity, EntityEvent::Removed(EventContext::REMOTE));
        assert_eq!(dispatcher.complete(Ok(1)).await, Err(SyncError::ShuttingDown));
        assert!(recorder.seen.lock().is_empty());
        assert_eq!(dispatcher.observer_count(entity), 0);
    }
}
