//! Paged traversal of list and map items.

use crate::client::ClientInner;
use crate::config::ClientConfig;
use crate::entity::Item;
use crate::error::{SyncError, SyncResult};
use std::sync::Arc;
use weft_protocol::{EntityId, EntityKind, ItemKey, QueryOrder, QueryPage, QueryRequest, Request};

/// Where and how a collection query starts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryOptions {
    /// First key of the first page, inclusive. `None` starts at the first
    /// item in `order`.
    pub start: Option<ItemKey>,
    /// Direction of traversal.
    pub order: QueryOrder,
    /// Items per page. `None` uses the client default.
    pub page_size: Option<u32>,
}

impl QueryOptions {
    /// Creates options for an ascending query from the first item.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the first page at `key`.
    pub fn with_start(mut self, key: impl Into<ItemKey>) -> Self {
        self.start = Some(key.into());
        self
    }

    /// Sets the direction.
    pub fn with_order(mut self, order: QueryOrder) -> Self {
        self.order = order;
        self
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Checks the options against the collection kind and returns the
    /// effective page size.
    pub(crate) fn validate(&self, kind: EntityKind, config: &ClientConfig) -> SyncResult<u32> {
        if let Some(start) = &self.start {
            if !start.fits(kind) {
                return Err(SyncError::invalid(format!("{start} is not a {kind} key")));
            }
        }
        match self.page_size {
            Some(0) => Err(SyncError::invalid("page size must be positive")),
            Some(size) => Ok(size.min(config.max_page_size)),
            None => Ok(config.default_page_size.clamp(1, config.max_page_size.max(1))),
        }
    }
}

/// One page of a collection query.
///
/// Each page can fetch its neighbours; pages are independent values, so
/// holding on to an old page and paging from it again is fine.
pub struct Paginator {
    inner: Arc<ClientInner>,
    entity: EntityId,
    order: QueryOrder,
    page_size: u32,
    items: Vec<Item>,
    has_next_page: bool,
    has_previous_page: bool,
}

impl Paginator {
    /// Fetches the first page.
    pub(crate) async fn first(
        inner: Arc<ClientInner>,
        entity: EntityId,
        kind: EntityKind,
        options: QueryOptions,
    ) -> SyncResult<Paginator> {
        let page_size = options.validate(kind, &inner.config)?;
        let query = QueryRequest {
            entity,
            from: options.start,
            inclusive: true,
            order: options.order,
            limit: page_size,
        };
        let page = fetch(&inner, query).await?;
        let (has_next_page, has_previous_page) = (page.has_more, page.has_before);
        Ok(Paginator {
            items: page.items.iter().map(Item::from).collect(),
            inner,
            entity,
            order: options.order,
            page_size,
            has_next_page,
            has_previous_page,
        })
    }

    /// Items on this page, in query order.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Returns true if items follow this page.
    pub fn has_next_page(&self) -> bool {
        self.has_next_page
    }

    /// Returns true if items precede this page.
    pub fn has_previous_page(&self) -> bool {
        self.has_previous_page
    }

    /// Fetches the page after this one.
    pub async fn next_page(&self) -> SyncResult<Paginator> {
        let op = async {
            let last = match (self.has_next_page, self.items.last()) {
                (true, Some(last)) => last.key.clone(),
                _ => return Err(SyncError::invalid("no next page")),
            };
            let query = QueryRequest {
                entity: self.entity,
                from: Some(last),
                inclusive: false,
                order: self.order,
                limit: self.page_size,
            };
            let page = fetch(&self.inner, query).await?;
            let items = page.items.iter().map(Item::from).collect();
            Ok(self.sibling(items, page.has_more, page.has_before))
        };
        self.inner.run(Some(self.entity), op).await
    }

    /// Fetches the page before this one.
    pub async fn previous_page(&self) -> SyncResult<Paginator> {
        let op = async {
            let first = match (self.has_previous_page, self.items.first()) {
                (true, Some(first)) => first.key.clone(),
                _ => return Err(SyncError::invalid("no previous page")),
            };
            // Walk backwards from the first item, then restore query order.
            // Boundary flags swap sides with the direction.
            let query = QueryRequest {
                entity: self.entity,
                from: Some(first),
                inclusive: false,
                order: self.order.reverse(),
                limit: self.page_size,
            };
            let page = fetch(&self.inner, query).await?;
            let items = page.items.iter().rev().map(Item::from).collect();
            Ok(self.sibling(items, page.has_before, page.has_more))
        };
        self.inner.run(Some(self.entity), op).await
    }

    fn sibling(&self, items: Vec<Item>, has_next_page: bool, has_previous_page: bool) -> Paginator {
        Paginator {
            inner: Arc::clone(&self.inner),
            entity: self.entity,
            order: self.order,
            page_size: self.page_size,
            items,
            has_next_page,
            has_previous_page,
        }
    }
}

impl std::fmt::Debug for Paginator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("entity", &self.entity)
            .field("order", &self.order)
            .field("items", &self.items.len())
            .field("has_next_page", &self.has_next_page)
            .field("has_previous_page", &self.has_previous_page)
            .finish()
    }
}

async fn fetch(inner: &ClientInner, query: QueryRequest) -> SyncResult<QueryPage> {
    let entity = query.entity;
    let page = inner
        .connection
        .request(Request::Query(query))
        .await?
        .into_page()?;
    inner.registry.fill_items(entity, page.items.clone(), false);
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_defaults_and_limits() {
        let config = ClientConfig::new()
            .with_default_page_size(20)
            .with_max_page_size(50);
        assert_eq!(QueryOptions::new().validate(EntityKind::List, &config), Ok(20));
        assert_eq!(
            QueryOptions::new()
                .with_page_size(500)
                .validate(EntityKind::List, &config),
            Ok(50)
        );
        assert!(QueryOptions::new()
            .with_page_size(0)
            .validate(EntityKind::List, &config)
            .is_err());
    }

    #[test]
    fn start_key_must_match_kind() {
        let config = ClientConfig::default();
        assert!(QueryOptions::new()
            .with_start("a")
            .validate(EntityKind::List, &config)
            .is_err());
        assert!(QueryOptions::new()
            .with_start(3u64)
            .validate(EntityKind::List, &config)
            .is_ok());
        assert!(QueryOptions::new()
            .with_start("a")
            .validate(EntityKind::Map, &config)
            .is_ok());
    }
}
