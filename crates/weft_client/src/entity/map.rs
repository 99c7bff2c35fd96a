use super::{entity_accessors, HandleCore, Item};
use crate::error::SyncResult;
use crate::mutation::Mutation;
use crate::paginator::{Paginator, QueryOptions};
use weft_protocol::{Data, ItemKey, Lifetime};

/// A collection of items addressed by caller-chosen string keys.
pub struct Map {
    pub(crate) core: HandleCore,
}

entity_accessors!(Map);

impl Map {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self { core }
    }

    /// Returns the item under `key`.
    pub async fn get_item(&self, key: &str) -> SyncResult<Item> {
        self.core.run(self.core.get_item(ItemKey::from(key))).await
    }

    /// Writes the item under `key`, creating it if missing.
    pub async fn set_item(
        &self,
        key: &str,
        data: Data,
        lifetime: Option<Lifetime>,
    ) -> SyncResult<Item> {
        let core = &self.core;
        core.run(core.set_item(ItemKey::from(key), data, lifetime))
            .await
    }

    /// Rewrites the item under `key` with `mutator`, retrying on concurrent
    /// changes.
    ///
    /// A missing item is shown to the mutator as empty data and created.
    pub async fn mutate_item<F>(
        &self,
        key: &str,
        mutator: F,
        lifetime: Option<Lifetime>,
    ) -> SyncResult<Data>
    where
        F: FnMut(&Data) -> Mutation + Send,
    {
        let core = &self.core;
        core.run(core.mutate_item(ItemKey::from(key), mutator, lifetime))
            .await
    }

    /// Removes the item under `key`.
    pub async fn remove_item(&self, key: &str) -> SyncResult<()> {
        self.core.run(self.core.remove_item(ItemKey::from(key))).await
    }

    /// Changes one item's lifetime, counted from now.
    pub async fn set_item_lifetime(&self, key: &str, lifetime: Lifetime) -> SyncResult<()> {
        let core = &self.core;
        core.run(core.set_lifetime(Some(ItemKey::from(key)), lifetime))
            .await
    }

    /// Queries items page by page, in key order.
    pub async fn query_items(&self, options: QueryOptions) -> SyncResult<Paginator> {
        self.core.run(self.core.query(options)).await
    }
}
