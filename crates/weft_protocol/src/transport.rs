//! Transport contract between a client and the service.

use crate::error::TransportError;
use crate::messages::{HandshakeRequest, HandshakeResponse, Request, Response};
use crate::notification::Notification;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Events a transport pushes to its client outside of request/response.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A subscribed entity changed.
    Notification(Notification),
    /// The connection dropped; the client should reconnect.
    ConnectionLost(String),
    /// The current token will expire soon.
    TokenAboutToExpire,
    /// The current token has expired and the session is no longer served.
    TokenExpired,
}

/// Channel on which a transport delivers [`TransportEvent`]s.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// A transport carries requests to the service and pushes back events.
///
/// Implementations must deliver requests and events reliably and in order.
/// This trait abstracts the network layer, allowing for different
/// implementations (WebSocket, in-process loopback for testing, etc.).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Installs the sink that receives pushed events.
    ///
    /// Called once by the client before the first handshake.
    fn set_event_sink(&self, sink: EventSink);

    /// Opens (or re-opens) a session.
    async fn handshake(&self, request: HandshakeRequest)
        -> Result<HandshakeResponse, TransportError>;

    /// Replaces the token of the current session.
    async fn update_token(&self, token: &str) -> Result<(), TransportError>;

    /// Sends a request and waits for its response.
    async fn send(&self, request: Request) -> Result<Response, TransportError>;

    /// Checks if the transport currently has a live connection.
    fn is_connected(&self) -> bool;

    /// Tears down the connection. Further calls fail with `Closed`.
    async fn close(&self);
}
