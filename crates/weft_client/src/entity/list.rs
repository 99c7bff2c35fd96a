use super::{entity_accessors, HandleCore, Item};
use crate::error::SyncResult;
use crate::mutation::Mutation;
use crate::paginator::{Paginator, QueryOptions};
use weft_protocol::{Data, ItemKey, Lifetime, Request};

/// An ordered collection of items addressed by service-assigned index.
///
/// Indexes only grow; a removed index is never handed out again.
pub struct List {
    pub(crate) core: HandleCore,
}

entity_accessors!(List);

impl List {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self { core }
    }

    /// Appends an item and returns it with its new index.
    pub async fn add_item(&self, data: Data, lifetime: Option<Lifetime>) -> SyncResult<Item> {
        let core = &self.core;
        let request = Request::AddItem {
            entity: core.id,
            data,
            lifetime,
        };
        core.run(core.write_item(request)).await
    }

    /// Returns the item at `index`.
    pub async fn get_item(&self, index: u64) -> SyncResult<Item> {
        self.core.run(self.core.get_item(ItemKey::Index(index))).await
    }

    /// Overwrites an existing item.
    pub async fn set_item(
        &self,
        index: u64,
        data: Data,
        lifetime: Option<Lifetime>,
    ) -> SyncResult<Item> {
        let core = &self.core;
        core.run(core.set_item(ItemKey::Index(index), data, lifetime))
            .await
    }

    /// Rewrites an existing item with `mutator`, retrying on concurrent
    /// changes.
    pub async fn mutate_item<F>(
        &self,
        index: u64,
        mutator: F,
        lifetime: Option<Lifetime>,
    ) -> SyncResult<Data>
    where
        F: FnMut(&Data) -> Mutation + Send,
    {
        let core = &self.core;
        core.run(core.mutate_item(ItemKey::Index(index), mutator, lifetime))
            .await
    }

    /// Removes the item at `index`.
    pub async fn remove_item(&self, index: u64) -> SyncResult<()> {
        self.core.run(self.core.remove_item(ItemKey::Index(index))).await
    }

    /// Changes one item's lifetime, counted from now.
    pub async fn set_item_lifetime(&self, index: u64, lifetime: Lifetime) -> SyncResult<()> {
        let core = &self.core;
        core.run(core.set_lifetime(Some(ItemKey::Index(index)), lifetime))
            .await
    }

    /// Queries items page by page.
    pub async fn query_items(&self, options: QueryOptions) -> SyncResult<Paginator> {
        self.core.run(self.core.query(options)).await
    }
}
