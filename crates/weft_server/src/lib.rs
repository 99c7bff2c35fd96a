//! # Weft Sync Server
//!
//! Reference in-memory sync service for Weft.
//!
//! This crate provides:
//! - Storage for documents, lists, maps and streams with revisions
//! - Conditional writes, paged queries and lazy lifetime expiry
//! - Per-session subscriptions and change fan-out
//! - Authentication (HMAC-SHA256 tokens) and read-only identities
//! - Stream publish rate limiting
//! - [`LoopbackTransport`], an in-process [`Transport`](weft_protocol::Transport)
//!
//! # Authentication
//!
//! Authentication is optional. Without it any non-empty token is accepted and
//! used as the session identity:
//!
//! ```rust
//! use weft_server::{ServerConfig, SyncServer};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let server = SyncServer::new(ServerConfig::default().with_auth(secret));
//!
//! // Issue tokens for clients
//! let token = server.create_token("alice").unwrap();
//! # let _ = token;
//! ```
//!
//! # Testing hooks
//!
//! [`SyncServer`] can act as a second client
//! ([`apply_as_remote`](SyncServer::apply_as_remote)), force token expiry
//! and move its clock forward, which makes conflict and expiry behavior
//! reproducible in tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod loopback;
mod server;
mod store;

pub use auth::{open_claims, AuthConfig, TokenClaims, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use loopback::LoopbackTransport;
pub use server::SyncServer;
pub use store::{EntityStore, ItemWrite, Opened};
