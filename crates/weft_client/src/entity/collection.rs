//! Item operations shared by lists and maps.

use super::{HandleCore, Item};
use crate::dispatcher::EventContext;
use crate::error::{SyncError, SyncResult};
use crate::mutation::{self, Mutation};
use crate::paginator::{Paginator, QueryOptions};
use std::sync::Arc;
use weft_protocol::{Change, Data, EntityKind, ItemKey, Lifetime, Precondition, Request};

impl HandleCore {
    fn kind(&self) -> EntityKind {
        self.cache.read().metadata.kind
    }

    /// Returns the cached item, or fetches it.
    pub(crate) async fn get_item(&self, key: ItemKey) -> SyncResult<Item> {
        let cached = self.cache.read().items.get(&key).map(Item::from);
        if let Some(item) = cached {
            return Ok(item);
        }
        let item = self
            .inner
            .connection
            .request(Request::GetItem { entity: self.id, key })
            .await?
            .into_item()?;
        self.inner.registry.refresh_item(self.id, &item);
        Ok(Item::from(&item))
    }

    pub(crate) async fn set_item(
        &self,
        key: ItemKey,
        data: Data,
        lifetime: Option<Lifetime>,
    ) -> SyncResult<Item> {
        let request = Request::SetItem {
            entity: self.id,
            key,
            data,
            lifetime,
            precondition: Precondition::None,
        };
        self.write_item(request).await
    }

    /// Sends an item write and applies the resulting change locally.
    pub(crate) async fn write_item(&self, request: Request) -> SyncResult<Item> {
        let change = self.inner.connection.request(request).await?.into_change()?;
        self.inner
            .registry
            .apply(self.id, &change, EventContext::LOCAL);
        match change {
            Change::ItemAdded(item) | Change::ItemUpdated(item) => Ok(Item::from(&item)),
            other => Err(SyncError::Generic(format!("unexpected change: {other:?}"))),
        }
    }

    pub(crate) async fn mutate_item<F>(
        &self,
        key: ItemKey,
        mutator: F,
        lifetime: Option<Lifetime>,
    ) -> SyncResult<Data>
    where
        F: FnMut(&Data) -> Mutation + Send,
    {
        let kind = self.kind();
        mutation::mutate_item(&self.inner, self.id, kind, &self.cache, key, mutator, lifetime).await
    }

    pub(crate) async fn remove_item(&self, key: ItemKey) -> SyncResult<()> {
        let change = self
            .inner
            .connection
            .request(Request::RemoveItem { entity: self.id, key })
            .await?
            .into_change()?;
        self.inner
            .registry
            .apply(self.id, &change, EventContext::LOCAL);
        Ok(())
    }

    pub(crate) async fn query(&self, options: QueryOptions) -> SyncResult<Paginator> {
        Paginator::first(Arc::clone(&self.inner), self.id, self.kind(), options).await
    }
}
