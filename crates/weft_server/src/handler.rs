//! Request handlers for service operations.

use crate::auth::{open_claims, AuthConfig, TokenClaims, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::EntityStore;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use weft_protocol::{
    Change, Data, EntityId, EntityKind, EventSink, HandshakeRequest, HandshakeResponse, MessageId,
    Notification, OpenMode, OpenRequest, Request, Response, SessionId, StreamMessage,
    TransportEvent, MAX_MESSAGE_BYTES,
};

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Entity store (shared across all handlers).
    pub store: Arc<EntityStore>,
    validator: Option<TokenValidator>,
    sessions: RwLock<HashMap<SessionId, Session>>,
    publish_windows: Mutex<HashMap<EntityId, (SystemTime, u32)>>,
}

/// One authenticated client session.
struct Session {
    claims: TokenClaims,
    subscriptions: HashSet<EntityId>,
    sink: Option<EventSink>,
    token_expired: bool,
    warned: bool,
}

impl Session {
    fn push(&self, event: TransportEvent) {
        if let Some(sink) = &self.sink {
            // A closed receiver means the client went away
            let _ = sink.send(event);
        }
    }
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, store: Arc<EntityStore>) -> Self {
        let validator = match (&config.auth_secret, config.require_auth) {
            (Some(secret), true) => Some(TokenValidator::new(AuthConfig::new(secret.clone()))),
            _ => None,
        };
        Self {
            config,
            store,
            validator,
            sessions: RwLock::new(HashMap::new()),
            publish_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the token validator, if authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    fn authenticate(&self, token: &str, now: SystemTime) -> ServerResult<TokenClaims> {
        match &self.validator {
            Some(validator) => validator.validate_token(token, now),
            None if self.config.require_auth => Err(ServerError::Internal(
                "authentication required but no secret configured".into(),
            )),
            None => open_claims(token),
        }
    }

    /// Registers a session and returns its id.
    pub(crate) fn register_session(&self, claims: TokenClaims, sink: Option<EventSink>) -> SessionId {
        let id = SessionId::new();
        info!(session = %id, identity = %claims.identity, "session started");
        self.sessions.write().insert(
            id,
            Session {
                claims,
                subscriptions: HashSet::new(),
                sink,
                token_expired: false,
                warned: false,
            },
        );
        id
    }

    /// Removes a session.
    pub(crate) fn end_session(&self, session: SessionId) -> bool {
        let removed = self.sessions.write().remove(&session).is_some();
        if removed {
            info!(session = %session, "session ended");
        }
        removed
    }

    /// Returns the number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns true if the session is subscribed to the entity.
    pub fn is_subscribed(&self, session: SessionId, entity: EntityId) -> bool {
        self.sessions
            .read()
            .get(&session)
            .is_some_and(|s| s.subscriptions.contains(&entity))
    }

    /// Marks the session token expired and tells the client.
    pub(crate) fn expire_token(&self, session: SessionId) {
        if let Some(s) = self.sessions.write().get_mut(&session) {
            s.token_expired = true;
            s.push(TransportEvent::TokenExpired);
        }
    }

    /// Tells the client its token will expire soon.
    pub(crate) fn warn_token_expiry(&self, session: SessionId) {
        if let Some(s) = self.sessions.write().get_mut(&session) {
            s.warned = true;
            s.push(TransportEvent::TokenAboutToExpire);
        }
    }

    /// Pushes notifications to every subscribed session.
    ///
    /// Removed entities are dropped from all subscription sets afterwards.
    pub(crate) fn deliver(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write();
        for notification in notifications {
            let removed = matches!(notification.change, Change::EntityRemoved);
            for session in sessions.values_mut() {
                if !session.subscriptions.contains(&notification.entity) {
                    continue;
                }
                session.push(TransportEvent::Notification(notification.clone()));
                if removed {
                    session.subscriptions.remove(&notification.entity);
                }
            }
        }
    }

    /// Checks that the session may still issue requests.
    fn check_session(&self, session: SessionId, now: SystemTime) -> ServerResult<(String, bool)> {
        let mut sessions = self.sessions.write();
        let s = sessions.get_mut(&session).ok_or(ServerError::NoSession)?;

        let expires_at = s.claims.expires_at;
        if s.token_expired || expires_at.is_some_and(|at| now >= at) {
            if !s.token_expired {
                s.token_expired = true;
                s.push(TransportEvent::TokenExpired);
            }
            return Err(ServerError::TokenExpired);
        }
        if let Some(at) = expires_at {
            let warn_from = at.checked_sub(self.config.token_warning).unwrap_or(at);
            if !s.warned && now >= warn_from {
                s.warned = true;
                s.push(TransportEvent::TokenAboutToExpire);
            }
        }

        let read_only = self.config.read_only_identities.contains(&s.claims.identity);
        Ok((s.claims.identity.clone(), read_only))
    }

    fn subscribe(&self, session: SessionId, entity: EntityId) {
        if let Some(s) = self.sessions.write().get_mut(&session) {
            s.subscriptions.insert(entity);
        }
    }

    fn unsubscribe(&self, session: SessionId, entity: EntityId) {
        if let Some(s) = self.sessions.write().get_mut(&session) {
            s.subscriptions.remove(&entity);
        }
    }

    fn has_subscribers(&self, entity: EntityId) -> bool {
        self.sessions
            .read()
            .values()
            .any(|s| s.subscriptions.contains(&entity))
    }

    fn admit_publish(&self, stream: EntityId, now: SystemTime) -> ServerResult<()> {
        let Some(limit) = self.config.publish_rate_limit else {
            return Ok(());
        };
        let mut windows = self.publish_windows.lock();
        let window = windows.entry(stream).or_insert((now, 0));
        let elapsed = now.duration_since(window.0).unwrap_or_default();
        if elapsed >= RATE_WINDOW {
            *window = (now, 0);
        }
        if window.1 >= limit {
            return Err(ServerError::RateLimited(format!(
                "more than {limit} messages per second on stream {stream}"
            )));
        }
        window.1 += 1;
        Ok(())
    }
}

/// Handler for service requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a handshake request.
    pub fn handle_handshake(
        &self,
        request: &HandshakeRequest,
        sink: Option<EventSink>,
        now: SystemTime,
    ) -> ServerResult<HandshakeResponse> {
        let version = self.context.config.protocol_version;
        if request.protocol_version != version {
            return Err(ServerError::ProtocolMismatch(format!(
                "client speaks {}, service speaks {version}",
                request.protocol_version
            )));
        }

        let claims = self.context.authenticate(&request.token, now).inspect_err(|e| {
            warn!(error = %e, "handshake rejected");
        })?;
        let token_expires_at = claims.expires_at;
        let session_id = self.context.register_session(claims, sink);

        Ok(HandshakeResponse {
            session_id,
            protocol_version: version,
            token_expires_at,
        })
    }

    /// Replaces the token of a live session.
    pub fn handle_update_token(
        &self,
        session: SessionId,
        token: &str,
        now: SystemTime,
    ) -> ServerResult<()> {
        let claims = self.context.authenticate(token, now)?;
        let mut sessions = self.context.sessions.write();
        let s = sessions.get_mut(&session).ok_or(ServerError::NoSession)?;
        if s.claims.identity != claims.identity {
            return Err(ServerError::AuthenticationFailed(format!(
                "token issued to {}, session belongs to {}",
                claims.identity, s.claims.identity
            )));
        }
        s.claims = claims;
        s.token_expired = false;
        s.warned = false;
        debug!(session = %session, "token updated");
        Ok(())
    }

    /// Handles one request on behalf of a session.
    ///
    /// Returns the response along with the notifications the request caused;
    /// delivering them is up to the caller.
    pub fn handle(
        &self,
        session: SessionId,
        request: Request,
        now: SystemTime,
    ) -> ServerResult<(Response, Vec<Notification>)> {
        let (identity, read_only) = self.context.check_session(session, now)?;
        debug!(session = %session, request = request.name(), entity = ?request.entity(), "handling request");

        if read_only && is_write(&request) {
            return Err(ServerError::NotAuthorized(format!(
                "{identity} may not {}",
                request.name()
            )));
        }

        let store = &self.context.store;
        let origin = Some(session);

        match request {
            Request::Open(open) => {
                let restricted = read_only && open.mode != OpenMode::OpenOnly;
                let open = if read_only { restrict_to_existing(open)? } else { open };
                let opened = store.open(&open, now).map_err(|e| match e {
                    ServerError::EntityNotFound(what) if restricted => {
                        ServerError::NotAuthorized(format!("{identity} may not create {what}"))
                    }
                    other => other,
                })?;
                self.context
                    .subscribe(session, opened.snapshot.metadata.id);
                Ok((Response::Snapshot(opened.snapshot), Vec::new()))
            }
            Request::Subscribe { entity } => {
                let snapshot = store.snapshot(entity)?;
                self.context.subscribe(session, entity);
                Ok((Response::Snapshot(snapshot), Vec::new()))
            }
            Request::Unsubscribe { entity } => {
                self.context.unsubscribe(session, entity);
                Ok((Response::Ack, Vec::new()))
            }
            Request::Fetch { entity } => Ok((Response::Snapshot(store.snapshot(entity)?), Vec::new())),
            Request::UpdateDocument {
                entity,
                data,
                lifetime,
                precondition,
            } => {
                let snapshot = store.update_document(entity, data, lifetime, precondition, now)?;
                Ok(applied(entity, origin, Change::DocumentUpdated(snapshot)))
            }
            Request::GetItem { entity, key } => Ok((Response::Item(store.get_item(entity, &key)?), Vec::new())),
            Request::AddItem {
                entity,
                data,
                lifetime,
            } => {
                let item = store.add_item(entity, data, lifetime, now)?;
                Ok(applied(entity, origin, Change::ItemAdded(item)))
            }
            Request::SetItem {
                entity,
                key,
                data,
                lifetime,
                precondition,
            } => {
                let write = store.set_item(entity, key, data, lifetime, precondition, now)?;
                let change = if write.created {
                    Change::ItemAdded(write.item)
                } else {
                    Change::ItemUpdated(write.item)
                };
                Ok(applied(entity, origin, change))
            }
            Request::RemoveItem { entity, key } => {
                let revision = store.remove_item(entity, &key, now)?;
                Ok(applied(entity, origin, Change::ItemRemoved { key, revision }))
            }
            Request::Query(query) => {
                let page = store.query(&query, self.context.config.max_page_size)?;
                Ok((Response::Page(page), Vec::new()))
            }
            Request::SetLifetime {
                entity,
                key,
                lifetime,
            } => {
                store.set_lifetime(entity, key.as_ref(), lifetime, now)?;
                Ok((Response::Ack, Vec::new()))
            }
            Request::RemoveEntity { entity } => {
                store.remove_entity(entity)?;
                self.context.publish_windows.lock().remove(&entity);
                Ok(applied(entity, origin, Change::EntityRemoved))
            }
            Request::Publish { entity, data } => self.publish(entity, data, origin, now),
        }
    }

    fn publish(
        &self,
        entity: EntityId,
        data: Data,
        origin: Option<SessionId>,
        now: SystemTime,
    ) -> ServerResult<(Response, Vec<Notification>)> {
        if self.context.store.kind_of(entity)? != EntityKind::Stream {
            return Err(ServerError::InvalidRequest(format!("{entity} is not a stream")));
        }
        let size = serde_json::to_vec(&data)
            .map_err(|e| ServerError::InvalidRequest(e.to_string()))?
            .len();
        if size > MAX_MESSAGE_BYTES {
            return Err(ServerError::InvalidRequest(format!(
                "message of {size} bytes exceeds {MAX_MESSAGE_BYTES}"
            )));
        }
        self.context.admit_publish(entity, now)?;

        let id = MessageId::new();
        // Streams keep no history; unobserved messages are dropped
        let notes = if self.context.has_subscribers(entity) {
            let message = StreamMessage { id, data };
            vec![Notification::new(entity, origin, Change::MessagePublished(message))]
        } else {
            Vec::new()
        };
        Ok((Response::Published(id), notes))
    }
}

/// Answers a write with its change and tells subscribers the same.
fn applied(
    entity: EntityId,
    origin: Option<SessionId>,
    change: Change,
) -> (Response, Vec<Notification>) {
    let note = Notification::new(entity, origin, change.clone());
    (Response::Applied(change), vec![note])
}

fn is_write(request: &Request) -> bool {
    matches!(
        request,
        Request::UpdateDocument { .. }
            | Request::AddItem { .. }
            | Request::SetItem { .. }
            | Request::RemoveItem { .. }
            | Request::SetLifetime { .. }
            | Request::RemoveEntity { .. }
            | Request::Publish { .. }
    )
}

/// Read-only sessions may open existing entities but never create them.
fn restrict_to_existing(open: OpenRequest) -> ServerResult<OpenRequest> {
    match open.mode {
        OpenMode::CreateOnly => Err(ServerError::NotAuthorized(format!(
            "read-only sessions may not create a {}",
            open.kind
        ))),
        _ => Ok(OpenRequest {
            mode: OpenMode::OpenOnly,
            ..open
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use weft_protocol::{Identifier, ItemKey, Lifetime, Precondition};

    fn create_handler(config: ServerConfig) -> (RequestHandler, Arc<HandlerContext>) {
        let context = Arc::new(HandlerContext::new(config, Arc::new(EntityStore::new())));
        (RequestHandler::new(Arc::clone(&context)), context)
    }

    fn open_request(kind: EntityKind, name: &str) -> Request {
        Request::Open(OpenRequest {
            kind,
            mode: OpenMode::CreateOrOpen,
            identifier: Some(Identifier::UniqueName(name.into())),
            lifetime: Lifetime::Infinite,
        })
    }

    fn data(value: serde_json::Value) -> Data {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn handshake_success() {
        let (handler, context) = create_handler(ServerConfig::default());
        let response = handler
            .handle_handshake(&HandshakeRequest::new("alice"), None, SystemTime::now())
            .unwrap();
        assert_eq!(response.protocol_version, 1);
        assert!(response.token_expires_at.is_none());
        assert_eq!(context.session_count(), 1);
    }

    #[test]
    fn handshake_bad_version() {
        let (handler, _) = create_handler(ServerConfig::default());
        let request = HandshakeRequest {
            token: "alice".into(),
            protocol_version: 99,
        };
        let result = handler.handle_handshake(&request, None, SystemTime::now());
        assert!(matches!(result, Err(ServerError::ProtocolMismatch(_))));
    }

    #[test]
    fn handshake_requires_valid_token() {
        let secret = b"handler-secret".to_vec();
        let (handler, context) = create_handler(ServerConfig::new().with_auth(secret));
        let now = SystemTime::now();

        let bad = handler.handle_handshake(&HandshakeRequest::new("alice"), None, now);
        assert!(matches!(bad, Err(ServerError::AuthenticationFailed(_))));

        let token = context.validator().unwrap().create_token("alice", now).unwrap();
        let ok = handler
            .handle_handshake(&HandshakeRequest::new(token), None, now)
            .unwrap();
        assert!(ok.token_expires_at.is_some());
    }

    #[test]
    fn unknown_session_rejected() {
        let (handler, _) = create_handler(ServerConfig::default());
        let result = handler.handle(SessionId::new(), Request::Fetch { entity: EntityId::new() }, SystemTime::now());
        assert!(matches!(result, Err(ServerError::NoSession)));
    }

    #[test]
    fn open_subscribes_and_writes_notify() {
        let (handler, context) = create_handler(ServerConfig::default());
        let now = SystemTime::now();
        let session = context.register_session(open_claims("alice").unwrap(), None);

        let (response, notes) = handler.handle(session, open_request(EntityKind::Map, "prefs"), now).unwrap();
        assert!(notes.is_empty());
        let id = response.into_snapshot().unwrap().metadata.id;
        assert!(context.is_subscribed(session, id));

        let (_, notes) = handler
            .handle(
                session,
                Request::SetItem {
                    entity: id,
                    key: ItemKey::from("theme"),
                    data: data(json!({"mode": "dark"})),
                    lifetime: None,
                    precondition: Precondition::None,
                },
                now,
            )
            .unwrap();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].is_from(session));
        assert!(matches!(notes[0].change, Change::ItemAdded(_)));
    }

    #[test]
    fn read_only_identity_cannot_write() {
        let (handler, context) = create_handler(ServerConfig::new().with_read_only("viewer"));
        let now = SystemTime::now();
        let writer = context.register_session(open_claims("alice").unwrap(), None);
        let viewer = context.register_session(open_claims("viewer").unwrap(), None);

        let (response, _) = handler.handle(writer, open_request(EntityKind::Document, "doc"), now).unwrap();
        let id = response.into_snapshot().unwrap().metadata.id;

        // Opening an existing entity is fine
        assert!(handler.handle(viewer, open_request(EntityKind::Document, "doc"), now).is_ok());

        let missing = handler.handle(viewer, open_request(EntityKind::Document, "other"), now);
        assert!(matches!(missing, Err(ServerError::NotAuthorized(_))));

        let write = handler.handle(
            viewer,
            Request::UpdateDocument {
                entity: id,
                data: Data::new(),
                lifetime: None,
                precondition: Precondition::None,
            },
            now,
        );
        assert!(matches!(write, Err(ServerError::NotAuthorized(_))));
    }

    #[test]
    fn expired_session_token_rejected() {
        let (handler, context) = create_handler(ServerConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = context.register_session(open_claims("alice").unwrap(), Some(tx));

        context.expire_token(session);
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::TokenExpired);

        let result = handler.handle(session, open_request(EntityKind::Map, "m"), SystemTime::now());
        assert_eq!(result.unwrap_err(), ServerError::TokenExpired);

        handler
            .handle_update_token(session, "alice", SystemTime::now())
            .unwrap();
        assert!(handler.handle(session, open_request(EntityKind::Map, "m"), SystemTime::now()).is_ok());
    }

    #[test]
    fn publish_rate_limit() {
        let (handler, context) = create_handler(ServerConfig::new().with_publish_rate_limit(2));
        let now = SystemTime::now();
        let session = context.register_session(open_claims("alice").unwrap(), None);
        let (response, _) = handler.handle(session, open_request(EntityKind::Stream, "s"), now).unwrap();
        let id = response.into_snapshot().unwrap().metadata.id;

        let publish = || Request::Publish {
            entity: id,
            data: data(json!({"n": 1})),
        };
        assert!(handler.handle(session, publish(), now).is_ok());
        assert!(handler.handle(session, publish(), now).is_ok());
        assert!(matches!(
            handler.handle(session, publish(), now),
            Err(ServerError::RateLimited(_))
        ));

        // A new window admits again
        let later = now + Duration::from_secs(1);
        assert!(handler.handle(session, publish(), later).is_ok());
    }

    #[test]
    fn oversized_message_rejected() {
        let (handler, context) = create_handler(ServerConfig::default());
        let now = SystemTime::now();
        let session = context.register_session(open_claims("alice").unwrap(), None);
        let (response, _) = handler.handle(session, open_request(EntityKind::Stream, "s"), now).unwrap();
        let id = response.into_snapshot().unwrap().metadata.id;

        let big = data(json!({"blob": "x".repeat(MAX_MESSAGE_BYTES)}));
        let result = handler.handle(session, Request::Publish { entity: id, data: big }, now);
        assert!(matches!(result, Err(ServerError::InvalidRequest(_))));
    }

    #[test]
    fn removal_clears_subscriptions() {
        let (handler, context) = create_handler(ServerConfig::default());
        let now = SystemTime::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = context.register_session(open_claims("alice").unwrap(), Some(tx));
        let (response, _) = handler.handle(session, open_request(EntityKind::List, "l"), now).unwrap();
        let id = response.into_snapshot().unwrap().metadata.id;

        let (_, notes) = handler.handle(session, Request::RemoveEntity { entity: id }, now).unwrap();
        context.deliver(notes);

        match rx.try_recv().unwrap() {
            TransportEvent::Notification(note) => assert_eq!(note.change, Change::EntityRemoved),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!context.is_subscribed(session, id));
    }
}
