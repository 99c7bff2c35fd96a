//! Conflict-aware read-modify-write.
//!
//! A mutator sees the latest known value and returns the value to write.
//! The write is conditional on the revision that was read; if another writer
//! got there first, the value is re-read and the mutator runs again. The
//! first attempt reads from the cache, later ones from the service.

use crate::client::ClientInner;
use crate::dispatcher::EventContext;
use crate::error::{SyncError, SyncResult};
use crate::registry::SharedEntity;
use tracing::debug;
use weft_protocol::{
    Change, Data, EntityId, EntityKind, ErrorCode, ItemKey, ItemSnapshot, Lifetime, Precondition,
    Request, Response, ServiceError,
};

/// What a mutator decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Write this value.
    Proceed(Data),
    /// Leave the value as it is.
    Abort,
}

impl From<Data> for Mutation {
    fn from(data: Data) -> Self {
        Mutation::Proceed(data)
    }
}

impl From<Option<Data>> for Mutation {
    fn from(data: Option<Data>) -> Self {
        data.map_or(Mutation::Abort, Mutation::Proceed)
    }
}

/// Outcome of one conditional write.
enum Attempt {
    Written(Change),
    Conflict,
}

fn conditional(result: Result<Response, ServiceError>) -> SyncResult<Attempt> {
    match result {
        Ok(response) => Ok(Attempt::Written(response.into_change()?)),
        Err(err) if err.code == ErrorCode::RevisionConflict => Ok(Attempt::Conflict),
        Err(err) => Err(err.into()),
    }
}

/// Mutates document data until the write lands or the attempts run out.
///
/// An aborted mutation returns the data it was shown.
pub(crate) async fn mutate_document<F>(
    inner: &ClientInner,
    entity: EntityId,
    cache: &SharedEntity,
    mut mutator: F,
    lifetime: Option<Lifetime>,
) -> SyncResult<Data>
where
    F: FnMut(&Data) -> Mutation + Send,
{
    let max_attempts = inner.config.max_mutation_attempts;
    for attempt in 1..=max_attempts {
        let (current, revision) = if attempt == 1 {
            let cached = cache.read();
            (cached.data.clone(), cached.metadata.revision)
        } else {
            let snapshot = inner
                .connection
                .request(Request::Fetch { entity })
                .await?
                .into_snapshot()?;
            inner
                .registry
                .apply_snapshot(entity, &snapshot, EventContext::REMOTE);
            (snapshot.data, snapshot.metadata.revision)
        };

        let data = match mutator(&current) {
            Mutation::Proceed(data) => data,
            Mutation::Abort => return Ok(current),
        };
        let request = Request::UpdateDocument {
            entity,
            data,
            lifetime,
            precondition: Precondition::Revision(revision),
        };
        match conditional(inner.connection.exchange(request).await?)? {
            Attempt::Written(change) => {
                inner.registry.apply(entity, &change, EventContext::LOCAL);
                return match change {
                    Change::DocumentUpdated(snapshot) => Ok(snapshot.data),
                    other => Err(unexpected(&other)),
                };
            }
            Attempt::Conflict => {
                debug!(entity = %entity, attempt, "document changed underneath mutation; retrying");
            }
        }
    }
    Err(SyncError::ConflictRetryExhausted {
        attempts: max_attempts,
    })
}

/// Mutates one collection item until the write lands or the attempts run
/// out.
///
/// A missing map item is presented to the mutator as empty data and written
/// only if it is still absent. A missing list item is an error.
pub(crate) async fn mutate_item<F>(
    inner: &ClientInner,
    entity: EntityId,
    kind: EntityKind,
    cache: &SharedEntity,
    key: ItemKey,
    mut mutator: F,
    lifetime: Option<Lifetime>,
) -> SyncResult<Data>
where
    F: FnMut(&Data) -> Mutation + Send,
{
    let max_attempts = inner.config.max_mutation_attempts;
    for attempt in 1..=max_attempts {
        let cached = if attempt == 1 {
            cache.read().items.get(&key).cloned()
        } else {
            None
        };
        let current = match cached {
            Some(item) => Some(item),
            None => fetch_item(inner, entity, kind, &key).await?,
        };

        let (base, precondition) = match &current {
            Some(item) => (item.data.clone(), Precondition::Revision(item.revision)),
            None => (Data::new(), Precondition::Absent),
        };
        let data = match mutator(&base) {
            Mutation::Proceed(data) => data,
            Mutation::Abort => return Ok(base),
        };
        let request = Request::SetItem {
            entity,
            key: key.clone(),
            data,
            lifetime,
            precondition,
        };
        match conditional(inner.connection.exchange(request).await?)? {
            Attempt::Written(change) => {
                inner.registry.apply(entity, &change, EventContext::LOCAL);
                return match change {
                    Change::ItemAdded(item) | Change::ItemUpdated(item) => Ok(item.data),
                    other => Err(unexpected(&other)),
                };
            }
            Attempt::Conflict => {
                debug!(entity = %entity, key = %key, attempt, "item changed underneath mutation; retrying");
            }
        }
    }
    Err(SyncError::ConflictRetryExhausted {
        attempts: max_attempts,
    })
}

/// Reads an item from the service into the cache.
async fn fetch_item(
    inner: &ClientInner,
    entity: EntityId,
    kind: EntityKind,
    key: &ItemKey,
) -> SyncResult<Option<ItemSnapshot>> {
    let request = Request::GetItem {
        entity,
        key: key.clone(),
    };
    match inner.connection.exchange(request).await? {
        Ok(response) => {
            let item = response.into_item()?;
            inner.registry.refresh_item(entity, &item);
            Ok(Some(item))
        }
        Err(err) if err.code == ErrorCode::NotFound && kind == EntityKind::Map => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn unexpected(change: &Change) -> SyncError {
    SyncError::Generic(format!("unexpected change in write response: {change:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_conversions() {
        let mut data = Data::new();
        data.insert("theme".into(), "dark".into());
        assert_eq!(Mutation::from(data.clone()), Mutation::Proceed(data));
        assert_eq!(Mutation::from(None), Mutation::Abort);
    }

    #[test]
    fn conflicts_are_told_apart_from_failures() {
        let conflict = ServiceError::new(ErrorCode::RevisionConflict, "stale");
        assert!(matches!(conditional(Err(conflict)), Ok(Attempt::Conflict)));

        let missing = ServiceError::not_found("gone");
        assert!(matches!(conditional(Err(missing)), Err(SyncError::NotFound(_))));

        // A write that answered with something other than a change
        assert!(conditional(Ok(Response::Ack)).is_err());
    }
}
