//! Connection state machine and token lifecycle.

use crate::config::ClientConfig;
use crate::dispatcher::{ClientEvent, EventDispatcher};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use weft_protocol::{
    ErrorCode, HandshakeRequest, Request, Response, ServiceError, SessionId, Transport,
    TransportError, TransportEvent,
};

/// State of the client's connection to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection attempt made yet.
    #[default]
    Unknown,
    /// The token expired; waiting for a new one.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session established.
    Connected,
    /// Credentials rejected. Only a new token recovers.
    Denied,
    /// Network failure; reconnection is in progress.
    Error,
    /// Unrecoverable failure such as a protocol mismatch.
    FatalError,
}

impl ConnectionState {
    /// Returns true for states the client never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Denied | ConnectionState::FatalError)
    }

    /// Returns true for states that a token update may repair.
    pub fn accepts_token_update(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Denied | ConnectionState::Error
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Supplies fresh tokens when the current one nears expiry.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a new token.
    async fn fetch_token(&self) -> SyncResult<String>;
}

/// Owns the transport session and its state.
pub(crate) struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    dispatcher: Arc<EventDispatcher>,
    token: Mutex<String>,
    session: RwLock<Option<SessionId>>,
    state: watch::Sender<ConnectionState>,
    /// Loops transport events back into the client's pump.
    events: mpsc::UnboundedSender<TransportEvent>,
    reconnecting: AtomicBool,
}

impl ConnectionManager {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        dispatcher: Arc<EventDispatcher>,
        token: String,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unknown);
        Self {
            transport,
            config,
            dispatcher,
            token: Mutex::new(token),
            session: RwLock::new(None),
            state,
            events,
            reconnecting: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn session_id(&self) -> Option<SessionId> {
        *self.session.read()
    }

    /// Moves to `next`, telling observers if it differs from the current state.
    pub(crate) fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(state = %next, "connection state changed");
            self.dispatcher.client_event(ClientEvent::StateChanged(next));
        }
    }

    /// Performs one handshake with the current token.
    pub(crate) async fn connect(&self) -> SyncResult<()> {
        self.set_state(ConnectionState::Connecting);
        let token = self.token.lock().clone();
        match self.handshake(token).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err((state, err)) => {
                self.set_state(state);
                Err(err)
            }
        }
    }

    /// Handshakes with `token`, returning the state to enter on failure.
    async fn handshake(&self, token: String) -> Result<(), (ConnectionState, SyncError)> {
        let mut request = HandshakeRequest::new(token);
        request.protocol_version = self.config.protocol_version;

        match self.transport.handshake(request).await {
            Ok(response) => {
                debug!(session = %response.session_id, "handshake complete");
                *self.session.write() = Some(response.session_id);
                Ok(())
            }
            Err(err) => {
                let state = match err.code() {
                    Some(code) if code.is_auth_failure() => ConnectionState::Denied,
                    Some(ErrorCode::PermissionDenied) => ConnectionState::Denied,
                    Some(ErrorCode::UnsupportedVersion) => ConnectionState::FatalError,
                    Some(_) => ConnectionState::Error,
                    None if err == TransportError::Closed => ConnectionState::FatalError,
                    None => ConnectionState::Error,
                };
                warn!(error = %err, state = %state, "handshake failed");
                Err((state, err.into()))
            }
        }
    }

    /// Reconnects with backoff until connected, a terminal state is reached
    /// or the attempts run out. Returns true once connected.
    pub(crate) async fn reconnect(&self) -> bool {
        let retry = &self.config.reconnect;
        let mut connected = false;
        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            }
            if self.dispatcher.is_stopped() || self.state().is_terminal() {
                break;
            }
            // A token update may have reconnected us meanwhile
            if self.state() == ConnectionState::Connected {
                connected = true;
                break;
            }
            debug!(attempt, "reconnecting");
            match self.connect().await {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(_) if self.state() == ConnectionState::Error => continue,
                Err(_) => break,
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        connected
    }

    /// Claims the right to run the reconnect loop.
    pub(crate) fn begin_reconnect(&self) -> bool {
        self.reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Records a dropped connection.
    pub(crate) fn connection_lost(&self) {
        *self.session.write() = None;
        if !self.state().is_terminal() {
            self.set_state(ConnectionState::Error);
        }
    }

    /// Records an expired token.
    pub(crate) fn token_expired(&self) {
        if !self.state().is_terminal() {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Replaces the token.
    ///
    /// On a live session the token is handed to the transport; on a degraded
    /// connection a new handshake is made. Returns true if a new session was
    /// established. On failure the connection state is left as it was.
    pub(crate) async fn update_token(&self, token: String) -> SyncResult<bool> {
        if token.is_empty() {
            return Err(SyncError::invalid("token must not be empty"));
        }
        let state = self.state();
        match state {
            ConnectionState::Connected => {
                self.transport.update_token(&token).await?;
                *self.token.lock() = token;
                debug!("token updated in place");
                Ok(false)
            }
            ConnectionState::FatalError => Err(SyncError::Generic(
                "connection failed permanently; create a new client".into(),
            )),
            _ if state.accepts_token_update() => match self.handshake(token.clone()).await {
                Ok(()) => {
                    *self.token.lock() = token;
                    self.set_state(ConnectionState::Connected);
                    Ok(true)
                }
                Err((_, err)) => Err(err),
            },
            // Unknown or Connecting: the token is used by the next handshake
            _ => {
                *self.token.lock() = token;
                Ok(false)
            }
        }
    }

    /// Sends a request once a session is available.
    ///
    /// Waits across outages; requests that never reached the service are
    /// resent after reconnection.
    pub(crate) async fn request(&self, request: Request) -> SyncResult<Response> {
        self.exchange(request).await?.map_err(SyncError::from)
    }

    /// Like [`request`](Self::request), but hands service rejections back
    /// unconverted so callers can branch on the code.
    pub(crate) async fn exchange(
        &self,
        request: Request,
    ) -> SyncResult<Result<Response, ServiceError>> {
        let mut state = self.subscribe_state();
        loop {
            state
                .wait_for(|s| *s == ConnectionState::Connected)
                .await
                .map_err(|_| SyncError::ShuttingDown)?;

            match self.transport.send(request.clone()).await {
                Err(TransportError::Unavailable(reason)) => {
                    debug!(request = request.name(), %reason, "request deferred until reconnected");
                    if self.state() == ConnectionState::Connected {
                        self.connection_lost();
                        let _ = self.events.send(TransportEvent::ConnectionLost(reason));
                    }
                }
                Err(TransportError::Service(err)) if err.code == ErrorCode::TokenExpired => {
                    if self.state() == ConnectionState::Connected {
                        self.token_expired();
                        let _ = self.events.send(TransportEvent::TokenExpired);
                    }
                }
                Err(TransportError::Service(err)) => return Ok(Err(err)),
                Ok(response) => return Ok(Ok(response)),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Sends a request only if a session is live right now.
    pub(crate) async fn try_request(&self, request: Request) -> Option<SyncResult<Response>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        Some(self.transport.send(request).await.map_err(SyncError::from))
    }

    pub(crate) async fn close(&self) {
        self.transport.close().await;
        *self.session.write() = None;
    }
}
