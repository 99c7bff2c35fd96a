//! # Weft Protocol
//!
//! Protocol types and transport contract for Weft.
//!
//! This crate provides:
//! - Identifiers, payloads, lifetimes and item addressing
//! - Request/response messages and entity/item snapshots
//! - Push notifications for subscribed entities
//! - Service and transport error types
//! - The [`Transport`] trait consumed by the client
//!
//! This is a pure protocol crate: wire encoding is left to transports.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod notification;
mod transport;
mod types;

pub use error::{ErrorCode, ServiceError, ServiceResult, TransportError};
pub use messages::{
    EntityMetadata, EntitySnapshot, HandshakeRequest, HandshakeResponse, ItemSnapshot,
    OpenRequest, QueryPage, QueryRequest, Request, Response, MAX_MESSAGE_BYTES, PROTOCOL_VERSION,
};
pub use notification::{Change, Notification};
pub use transport::{EventSink, Transport, TransportEvent};
pub use types::{
    Data, EntityId, EntityKind, Identifier, ItemKey, Lifetime, MessageId, OpenMode,
    Precondition, QueryOrder, Revision, SessionId, StreamMessage,
};
