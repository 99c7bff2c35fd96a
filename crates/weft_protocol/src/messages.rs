//! Request and response messages exchanged with the service.

use crate::error::{ErrorCode, ServiceError};
use crate::notification::Change;
use crate::types::{
    Data, EntityId, EntityKind, Identifier, ItemKey, Lifetime, MessageId, OpenMode, Precondition,
    QueryOrder, Revision, SessionId,
};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum serialized size of a stream message payload, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 4096;

/// Handshake request opening a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Access token.
    pub token: String,
    /// Protocol version.
    pub protocol_version: u16,
}

impl HandshakeRequest {
    /// Creates a handshake request for the current protocol version.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Handshake response from the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Session assigned to this connection.
    pub session_id: SessionId,
    /// Service protocol version.
    pub protocol_version: u16,
    /// When the presented token stops being accepted, if known.
    pub token_expires_at: Option<SystemTime>,
}

/// Metadata common to every entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// Entity identifier.
    pub id: EntityId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Unique name, if one was given at creation.
    pub unique_name: Option<String>,
    /// Revision of the entity itself (document data and lifetime).
    pub revision: Revision,
    /// Last update time.
    pub date_updated: Option<SystemTime>,
    /// Earliest time the service may delete the entity; `None` if never.
    pub expires_at: Option<SystemTime>,
}

/// Entity metadata plus document data.
///
/// `data` is empty for lists, maps and streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Entity metadata.
    pub metadata: EntityMetadata,
    /// Document data.
    pub data: Data,
}

/// One list or map item as stored by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    /// Item index or key.
    pub key: ItemKey,
    /// Item data.
    pub data: Data,
    /// Item revision.
    pub revision: Revision,
    /// Last update time.
    pub date_updated: SystemTime,
    /// Earliest time the service may delete the item; `None` if never.
    pub expires_at: Option<SystemTime>,
}

/// Request to open or create an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Kind of entity.
    pub kind: EntityKind,
    /// Create/open semantics.
    pub mode: OpenMode,
    /// Entity to open; `None` creates an anonymous entity.
    pub identifier: Option<Identifier>,
    /// Lifetime applied only if the entity is created.
    pub lifetime: Lifetime,
}

/// Request for one page of collection items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Collection to query.
    pub entity: EntityId,
    /// Boundary key; `None` starts at the first item in `order`.
    pub from: Option<ItemKey>,
    /// Whether the item at `from` is included.
    pub inclusive: bool,
    /// Direction of traversal.
    pub order: QueryOrder,
    /// Maximum number of items to return.
    pub limit: u32,
}

/// One page of collection items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    /// Items on this page.
    pub items: Vec<ItemSnapshot>,
    /// Whether items exist past the last item of the page in query order.
    pub has_more: bool,
    /// Whether items exist before the page start in query order.
    pub has_before: bool,
}

/// A request sent to the service over an established session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Open or create an entity and subscribe to its changes.
    Open(OpenRequest),
    /// Re-subscribe to an entity after reconnecting.
    Subscribe {
        /// Entity to subscribe to.
        entity: EntityId,
    },
    /// Stop receiving changes for an entity.
    Unsubscribe {
        /// Entity to unsubscribe from.
        entity: EntityId,
    },
    /// Fetch the current entity snapshot.
    Fetch {
        /// Entity to fetch.
        entity: EntityId,
    },
    /// Overwrite document data.
    UpdateDocument {
        /// Document to update.
        entity: EntityId,
        /// New data.
        data: Data,
        /// New lifetime, if changing it.
        lifetime: Option<Lifetime>,
        /// Write condition.
        precondition: Precondition,
    },
    /// Fetch a single item.
    GetItem {
        /// Collection holding the item.
        entity: EntityId,
        /// Item address.
        key: ItemKey,
    },
    /// Append an item to a list.
    AddItem {
        /// List to append to.
        entity: EntityId,
        /// Item data.
        data: Data,
        /// Item lifetime.
        lifetime: Option<Lifetime>,
    },
    /// Write an item.
    SetItem {
        /// Collection holding the item.
        entity: EntityId,
        /// Item address.
        key: ItemKey,
        /// New data.
        data: Data,
        /// New lifetime, if changing it.
        lifetime: Option<Lifetime>,
        /// Write condition.
        precondition: Precondition,
    },
    /// Remove an item.
    RemoveItem {
        /// Collection holding the item.
        entity: EntityId,
        /// Item address.
        key: ItemKey,
    },
    /// Query a page of items.
    Query(QueryRequest),
    /// Change the lifetime of an entity or one of its items.
    SetLifetime {
        /// Target entity.
        entity: EntityId,
        /// Item within the entity, or `None` for the entity itself.
        key: Option<ItemKey>,
        /// New lifetime, counted from now.
        lifetime: Lifetime,
    },
    /// Delete an entity.
    RemoveEntity {
        /// Entity to delete.
        entity: EntityId,
    },
    /// Publish a message on a stream.
    Publish {
        /// Stream to publish on.
        entity: EntityId,
        /// Message payload.
        data: Data,
    },
}

impl Request {
    /// Returns the short name of the request, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Open(_) => "open",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::Fetch { .. } => "fetch",
            Request::UpdateDocument { .. } => "update_document",
            Request::GetItem { .. } => "get_item",
            Request::AddItem { .. } => "add_item",
            Request::SetItem { .. } => "set_item",
            Request::RemoveItem { .. } => "remove_item",
            Request::Query(_) => "query",
            Request::SetLifetime { .. } => "set_lifetime",
            Request::RemoveEntity { .. } => "remove_entity",
            Request::Publish { .. } => "publish",
        }
    }

    /// Returns the entity the request targets, if it targets an existing one.
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            Request::Open(req) => match &req.identifier {
                Some(Identifier::Id(id)) => Some(*id),
                _ => None,
            },
            Request::Query(req) => Some(req.entity),
            Request::Subscribe { entity }
            | Request::Unsubscribe { entity }
            | Request::Fetch { entity }
            | Request::UpdateDocument { entity, .. }
            | Request::GetItem { entity, .. }
            | Request::AddItem { entity, .. }
            | Request::SetItem { entity, .. }
            | Request::RemoveItem { entity, .. }
            | Request::SetLifetime { entity, .. }
            | Request::RemoveEntity { entity }
            | Request::Publish { entity, .. } => Some(*entity),
        }
    }
}

/// A response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Entity snapshot (open, subscribe, fetch).
    Snapshot(EntitySnapshot),
    /// Item snapshot (get item).
    Item(ItemSnapshot),
    /// Committed write, described the same way subscribers see it.
    Applied(Change),
    /// Query result page.
    Page(QueryPage),
    /// Identifier of a published message.
    Published(MessageId),
    /// Plain acknowledgement.
    Ack,
}

impl Response {
    /// Extracts an entity snapshot.
    pub fn into_snapshot(self) -> Result<EntitySnapshot, ServiceError> {
        match self {
            Response::Snapshot(snapshot) => Ok(snapshot),
            other => Err(other.unexpected("snapshot")),
        }
    }

    /// Extracts an item snapshot.
    pub fn into_item(self) -> Result<ItemSnapshot, ServiceError> {
        match self {
            Response::Item(item) => Ok(item),
            other => Err(other.unexpected("item")),
        }
    }

    /// Extracts the change a write committed.
    pub fn into_change(self) -> Result<Change, ServiceError> {
        match self {
            Response::Applied(change) => Ok(change),
            other => Err(other.unexpected("change")),
        }
    }

    /// Extracts a query page.
    pub fn into_page(self) -> Result<QueryPage, ServiceError> {
        match self {
            Response::Page(page) => Ok(page),
            other => Err(other.unexpected("page")),
        }
    }

    /// Extracts a published message identifier.
    pub fn into_message_id(self) -> Result<MessageId, ServiceError> {
        match self {
            Response::Published(id) => Ok(id),
            other => Err(other.unexpected("message id")),
        }
    }

    fn unexpected(&self, wanted: &str) -> ServiceError {
        ServiceError::new(
            ErrorCode::Internal,
            format!("expected {wanted} response, got {self:?}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(kind: EntityKind) -> EntityMetadata {
        EntityMetadata {
            id: EntityId::new(),
            kind,
            unique_name: Some("prefs".into()),
            revision: Revision(1),
            date_updated: None,
            expires_at: None,
        }
    }

    #[test]
    fn handshake_uses_current_version() {
        let request = HandshakeRequest::new("token");
        assert_eq!(request.protocol_version, PROTOCOL_VERSION);
        assert_eq!(request.token, "token");
    }

    #[test]
    fn request_entity_targets() {
        let id = EntityId::new();
        assert_eq!(Request::Fetch { entity: id }.entity(), Some(id));

        let open_by_name = Request::Open(OpenRequest {
            kind: EntityKind::Map,
            mode: OpenMode::CreateOrOpen,
            identifier: Some(Identifier::UniqueName("prefs".into())),
            lifetime: Lifetime::Infinite,
        });
        assert_eq!(open_by_name.entity(), None);
        assert_eq!(open_by_name.name(), "open");
    }

    #[test]
    fn response_extraction() {
        let snapshot = EntitySnapshot {
            metadata: metadata(EntityKind::Document),
            data: Data::new(),
        };
        let response = Response::Snapshot(snapshot.clone());
        assert_eq!(response.into_snapshot().unwrap(), snapshot);

        let change = Response::Applied(Change::EntityRemoved).into_change().unwrap();
        assert_eq!(change, Change::EntityRemoved);

        let err = Response::Ack.into_item().unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        assert!(err.message.contains("item"));
    }
}
