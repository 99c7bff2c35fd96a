//! In-process transport connected straight to a [`SyncServer`].

use crate::server::SyncServer;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use weft_protocol::{
    EventSink, HandshakeRequest, HandshakeResponse, Request, Response, ServiceError, SessionId,
    Transport, TransportError, TransportEvent,
};

/// A [`Transport`] that calls a [`SyncServer`] in the same process.
///
/// Used by tests and demos. The connection can be dropped and restored at
/// will to exercise reconnection.
pub struct LoopbackTransport {
    server: Arc<SyncServer>,
    session: RwLock<Option<SessionId>>,
    sink: Mutex<Option<EventSink>>,
    online: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackTransport {
    /// Creates a transport for the given service.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            session: RwLock::new(None),
            sink: Mutex::new(None),
            online: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the service this transport talks to.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// Returns the current session, if handshaken.
    pub fn session_id(&self) -> Option<SessionId> {
        *self.session.read()
    }

    /// Simulates a network failure.
    ///
    /// The session ends and the client is told the connection was lost.
    /// Requests fail with `Unavailable` until [`restore_connection`](Self::restore_connection).
    pub fn drop_connection(&self, reason: &str) {
        self.online.store(false, Ordering::SeqCst);
        if let Some(session) = self.session.write().take() {
            self.server.end_session(session);
        }
        debug!(reason, "loopback connection dropped");
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(TransportEvent::ConnectionLost(reason.to_string()));
        }
    }

    /// Makes the network reachable again. The client must handshake anew.
    pub fn restore_connection(&self) {
        self.online.store(true, Ordering::SeqCst);
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("network unreachable".into()));
        }
        Ok(())
    }

    fn current_session(&self) -> Result<SessionId, TransportError> {
        self.session_id()
            .ok_or_else(|| TransportError::Unavailable("no session".into()))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn handshake(
        &self,
        request: HandshakeRequest,
    ) -> Result<HandshakeResponse, TransportError> {
        tokio::task::yield_now().await;
        self.check_link()?;

        let sink = self.sink.lock().clone();
        let response = self
            .server
            .handle_handshake(&request, sink)
            .map_err(|e| TransportError::Service(ServiceError::from(e)))?;

        if let Some(previous) = self.session.write().replace(response.session_id) {
            self.server.end_session(previous);
        }
        Ok(response)
    }

    async fn update_token(&self, token: &str) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        self.check_link()?;
        let session = self.current_session()?;
        self.server
            .update_token(session, token)
            .map_err(|e| TransportError::Service(e.into()))
    }

    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        tokio::task::yield_now().await;
        self.check_link()?;
        let session = self.current_session()?;
        self.server
            .handle_request(session, request)
            .map_err(|e| TransportError::Service(e.into()))
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.online.load(Ordering::SeqCst)
            && self.session.read().is_some()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(session) = self.session.write().take() {
            self.server.end_session(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tokio::sync::mpsc;
    use weft_protocol::{EntityId, ErrorCode};

    fn transport() -> (LoopbackTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let server = Arc::new(SyncServer::new(ServerConfig::default()));
        let transport = LoopbackTransport::new(server);
        let (tx, rx) = mpsc::unbounded_channel();
        transport.set_event_sink(tx);
        (transport, rx)
    }

    #[tokio::test]
    async fn handshake_opens_session() {
        let (transport, _rx) = transport();
        assert!(!transport.is_connected());

        let response = transport.handshake(HandshakeRequest::new("alice")).await.unwrap();
        assert_eq!(transport.session_id(), Some(response.session_id));
        assert!(transport.is_connected());
        assert_eq!(transport.server().session_count(), 1);
    }

    #[tokio::test]
    async fn service_errors_pass_through() {
        let (transport, _rx) = transport();
        transport.handshake(HandshakeRequest::new("alice")).await.unwrap();

        let err = transport
            .send(Request::Fetch { entity: EntityId::new() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn dropped_connection_is_unavailable() {
        let (transport, mut rx) = transport();
        transport.handshake(HandshakeRequest::new("alice")).await.unwrap();

        transport.drop_connection("test");
        assert!(matches!(rx.recv().await, Some(TransportEvent::ConnectionLost(_))));
        assert!(!transport.is_connected());
        assert_eq!(transport.server().session_count(), 0);

        let err = transport.handshake(HandshakeRequest::new("alice")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));

        transport.restore_connection();
        assert!(transport.handshake(HandshakeRequest::new("alice")).await.is_ok());
    }

    #[tokio::test]
    async fn closed_transport_rejects_requests() {
        let (transport, _rx) = transport();
        transport.handshake(HandshakeRequest::new("alice")).await.unwrap();
        transport.close().await;

        let err = transport
            .send(Request::Fetch { entity: EntityId::new() })
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }
}
