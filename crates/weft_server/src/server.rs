//! Main sync service.

use crate::auth::TokenClaims;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::store::EntityStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;
use weft_protocol::{
    EntityId, EntityMetadata, EventSink, HandshakeRequest, HandshakeResponse, Notification,
    Request, Response, SessionId,
};

/// The reference sync service.
///
/// Holds every entity in memory, fans changes out to subscribed sessions
/// and enforces tokens, rate limits and lifetimes. Transports call
/// [`handle_handshake`](Self::handle_handshake) once per connection and then
/// [`handle_request`](Self::handle_request) per request.
///
/// # Example
///
/// ```
/// use weft_server::{SyncServer, ServerConfig};
/// use weft_protocol::HandshakeRequest;
///
/// let server = SyncServer::new(ServerConfig::default());
/// let session = server
///     .handle_handshake(&HandshakeRequest::new("alice"), None)
///     .unwrap()
///     .session_id;
/// # let _ = session;
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    /// Session used by [`apply_as_remote`](Self::apply_as_remote).
    remote: SessionId,
    clock_offset: Mutex<Duration>,
}

impl SyncServer {
    /// Creates a new sync service.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(EntityStore::new()))
    }

    /// Creates a sync service over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<EntityStore>) -> Self {
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));
        let remote = context.register_session(
            TokenClaims {
                identity: "remote".into(),
                expires_at: None,
            },
            None,
        );

        Self {
            handler,
            context,
            remote,
            clock_offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Returns the service's notion of the current time.
    pub fn now(&self) -> SystemTime {
        SystemTime::now() + *self.clock_offset.lock()
    }

    /// Handles a handshake; events for the new session go to `sink`.
    pub fn handle_handshake(
        &self,
        request: &HandshakeRequest,
        sink: Option<EventSink>,
    ) -> ServerResult<HandshakeResponse> {
        self.handler.handle_handshake(request, sink, self.now())
    }

    /// Handles a request and delivers the resulting notifications.
    pub fn handle_request(&self, session: SessionId, request: Request) -> ServerResult<Response> {
        let now = self.now();
        self.purge(now);
        let (response, notifications) = self.handler.handle(session, request, now)?;
        self.context.deliver(notifications);
        Ok(response)
    }

    /// Replaces the token of a live session.
    pub fn update_token(&self, session: SessionId, token: &str) -> ServerResult<()> {
        self.handler.handle_update_token(session, token, self.now())
    }

    /// Ends a session, dropping its subscriptions.
    pub fn end_session(&self, session: SessionId) -> bool {
        self.context.end_session(session)
    }

    /// Creates a signed token for `identity`.
    ///
    /// Fails unless authentication is enabled.
    pub fn create_token(&self, identity: &str) -> ServerResult<String> {
        self.context
            .validator()
            .ok_or_else(|| ServerError::InvalidRequest("authentication is disabled".into()))?
            .create_token(identity, self.now())
    }

    /// Applies a request as another, unconnected client would.
    ///
    /// Subscribers see the resulting changes as remote changes.
    pub fn apply_as_remote(&self, request: Request) -> ServerResult<Response> {
        self.handle_request(self.remote, request)
    }

    /// Marks a session's token expired and notifies its client.
    pub fn expire_token(&self, session: SessionId) {
        self.context.expire_token(session);
    }

    /// Warns a session that its token will expire soon.
    pub fn warn_token_expiry(&self, session: SessionId) {
        self.context.warn_token_expiry(session);
    }

    /// Moves the service clock forward.
    pub fn advance_clock(&self, by: Duration) {
        *self.clock_offset.lock() += by;
        let now = self.now();
        self.purge(now);
    }

    /// Returns an entity's current metadata.
    pub fn metadata(&self, entity: EntityId) -> ServerResult<EntityMetadata> {
        Ok(self.context.store.snapshot(entity)?.metadata)
    }

    /// Returns true if the session receives changes for the entity.
    pub fn is_subscribed(&self, session: SessionId, entity: EntityId) -> bool {
        self.context.is_subscribed(session, entity)
    }

    /// Returns the entity store.
    pub fn store(&self) -> &EntityStore {
        &self.context.store
    }

    /// Returns the number of client sessions.
    pub fn session_count(&self) -> usize {
        // The remote actor's session is internal
        self.context.session_count().saturating_sub(1)
    }

    fn purge(&self, now: SystemTime) {
        let expired = self.context.store.purge_expired(now);
        if expired.is_empty() {
            return;
        }
        debug!(count = expired.len(), "purged expired objects");
        let notifications = expired
            .into_iter()
            .map(|(entity, change)| Notification::new(entity, None, change))
            .collect();
        self.context.deliver(notifications);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use weft_protocol::{
        Change, Data, EntityKind, Identifier, Lifetime, OpenMode, OpenRequest, Precondition,
        TransportEvent,
    };

    fn open(kind: EntityKind, name: &str, lifetime: Lifetime) -> Request {
        Request::Open(OpenRequest {
            kind,
            mode: OpenMode::CreateOrOpen,
            identifier: Some(Identifier::UniqueName(name.into())),
            lifetime,
        })
    }

    fn connect(server: &SyncServer) -> (SessionId, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let response = server
            .handle_handshake(&HandshakeRequest::new("alice"), Some(tx))
            .unwrap();
        (response.session_id, rx)
    }

    #[test]
    fn server_lifecycle() {
        let server = SyncServer::new(ServerConfig::default());
        assert_eq!(server.session_count(), 0);
        assert!(server.store().is_empty());

        let (session, _rx) = connect(&server);
        assert_eq!(server.session_count(), 1);
        assert!(server.end_session(session));
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn remote_changes_reach_subscribers() {
        let server = SyncServer::new(ServerConfig::default());
        let (session, mut rx) = connect(&server);

        let snapshot = server
            .handle_request(session, open(EntityKind::Document, "doc", Lifetime::Infinite))
            .unwrap()
            .into_snapshot()
            .unwrap();
        let id = snapshot.metadata.id;

        server
            .apply_as_remote(Request::UpdateDocument {
                entity: id,
                data: Data::new(),
                lifetime: None,
                precondition: Precondition::None,
            })
            .unwrap();

        match rx.try_recv().unwrap() {
            TransportEvent::Notification(note) => {
                assert_eq!(note.entity, id);
                assert!(!note.is_from(session));
                assert!(matches!(note.change, Change::DocumentUpdated(_)));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn advancing_clock_purges_expired_entities() {
        let server = SyncServer::new(ServerConfig::default());
        let (session, mut rx) = connect(&server);
        let id = server
            .handle_request(session, open(EntityKind::Map, "temp", Lifetime::from_secs(30)))
            .unwrap()
            .into_snapshot()
            .unwrap()
            .metadata
            .id;

        server.advance_clock(Duration::from_secs(31));
        assert!(server.metadata(id).is_err());
        match rx.try_recv().unwrap() {
            TransportEvent::Notification(note) => {
                assert_eq!(note.change, Change::EntityRemoved);
                assert_eq!(note.origin, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn tokens_expire_on_the_service_clock() {
        let secret = b"server-secret".to_vec();
        let server = SyncServer::new(ServerConfig::new().with_auth(secret));
        let token = server.create_token("alice").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = server
            .handle_handshake(&HandshakeRequest::new(token), Some(tx))
            .unwrap()
            .session_id;

        // Default tokens last an hour; the warning comes three minutes early
        server.advance_clock(Duration::from_secs(3500));
        let request = open(EntityKind::Document, "d", Lifetime::Infinite);
        assert!(server.handle_request(session, request.clone()).is_ok());
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::TokenAboutToExpire);

        server.advance_clock(Duration::from_secs(200));
        assert_eq!(
            server.handle_request(session, request),
            Err(ServerError::TokenExpired)
        );
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::TokenExpired);
    }

    #[test]
    fn create_token_requires_auth() {
        let server = SyncServer::new(ServerConfig::default());
        assert!(server.create_token("alice").is_err());
    }
}
