//! # Weft Client
//!
//! Client engine for Weft synchronized data.
//!
//! This crate provides:
//! - Documents, lists, maps and message streams kept in sync with the service
//! - Conflict-aware mutation with automatic retry
//! - Paged queries over list and map items
//! - Connection state tracking, reconnection and token renewal
//! - Ordered delivery of change events to weakly held observers
//!
//! ## Architecture
//!
//! A [`SyncClient`] owns one session with the service through a
//! [`Transport`](weft_protocol::Transport). Opening an entity yields a
//! handle ([`Document`], [`List`], [`Map`] or [`Stream`]); all handles on
//! one entity share a cache that is updated by this client's writes and by
//! changes the service pushes.
//!
//! ## Key Invariants
//!
//! - A change is applied at most once, and only if it is newer than the cache
//! - Events and completions of one client are delivered in a single order
//! - An operation's completion follows every event it caused
//! - After shutdown no event is delivered and every operation fails

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod connection;
mod dispatcher;
mod entity;
mod error;
mod executor;
mod logging;
mod mutation;
mod paginator;
mod registry;

pub use client::{ClientBuilder, SyncClient};
pub use config::{ClientConfig, RetryConfig};
pub use connection::{ConnectionState, TokenProvider};
pub use dispatcher::{ClientObserver, EntityObserver, EventContext};
pub use entity::{Document, EntityInfo, Item, List, Map, OpenOptions, Stream, SyncStrategy};
pub use error::{ErrorInfo, SyncError, SyncResult, CLIENT_DOMAIN, SERVICE_DOMAIN};
pub use executor::{ExecutionContext, InlineContext, SerialQueue, Task};
pub use logging::{init_logging, LogLevel};
pub use mutation::Mutation;
pub use paginator::{Paginator, QueryOptions};

pub use weft_protocol::{
    Data, EntityId, EntityKind, ItemKey, Lifetime, MessageId, OpenMode, QueryOrder, StreamMessage,
};
