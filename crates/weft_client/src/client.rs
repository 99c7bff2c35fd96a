//! The client: construction, event pump, token renewal and shutdown.

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, TokenProvider};
use crate::dispatcher::{ClientEvent, ClientObserver, EntityEvent, EntityObserver, EventContext, EventDispatcher};
use crate::entity::{Document, HandleCore, List, Map, OpenOptions, Stream};
use crate::error::{SyncError, SyncResult};
use crate::executor::{ExecutionContext, SerialQueue};
use crate::logging::{init_logging, LogLevel};
use crate::registry::EntityRegistry;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use weft_protocol::{EntityId, EntityKind, SessionId, Transport, TransportEvent};

/// State shared between the client, its handles and background tasks.
pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) connection: Arc<ConnectionManager>,
    pub(crate) registry: EntityRegistry,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    shutdown: watch::Sender<bool>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl ClientInner {
    /// Runs an operation on behalf of the caller.
    ///
    /// Shutdown cancels the operation. Failures are reported to the entity's
    /// observers, and the result is handed back through the execution
    /// context after every event the operation caused.
    pub(crate) async fn run<T, F>(&self, entity: Option<EntityId>, op: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: Future<Output = SyncResult<T>>,
    {
        let mut shutdown = self.shutdown.subscribe();
        let result = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stopped| *stopped) => Err(SyncError::ShuttingDown),
            result = op => result,
        };
        if let (Err(err), Some(entity)) = (&result, entity) {
            if *err != SyncError::ShuttingDown {
                self.dispatcher
                    .emit(entity, EntityEvent::Errored(err.clone()));
            }
        }
        self.dispatcher.complete(result).await
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Flags shutdown and silences observers. Returns false if already done.
    fn begin_shutdown(&self) -> bool {
        let first = !self.shutdown.send_replace(true);
        self.dispatcher.stop();
        first
    }

    async fn apply_token(&self, token: String) -> SyncResult<()> {
        if self.connection.update_token(token).await? {
            self.registry.resync().await;
        }
        Ok(())
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Notification(notification) => {
                let is_local = self
                    .connection
                    .session_id()
                    .is_some_and(|session| notification.is_from(session));
                self.registry.apply(
                    notification.entity,
                    &notification.change,
                    EventContext { is_local },
                );
            }
            TransportEvent::ConnectionLost(reason) => {
                warn!(%reason, "connection lost");
                self.connection.connection_lost();
                if self.connection.begin_reconnect() {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        if inner.connection.reconnect().await {
                            inner.registry.resync().await;
                        }
                    });
                }
            }
            TransportEvent::TokenAboutToExpire => {
                info!("token about to expire");
                self.dispatcher.client_event(ClientEvent::TokenAboutToExpire);
                self.renew_token();
            }
            TransportEvent::TokenExpired => {
                warn!("token expired");
                self.connection.token_expired();
                self.dispatcher.client_event(ClientEvent::TokenExpired);
                self.renew_token();
            }
        }
    }

    /// Asks the token provider, if any, for a replacement token.
    fn renew_token(self: &Arc<Self>) {
        let Some(provider) = self.token_provider.clone() else {
            return;
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match provider.fetch_token().await {
                Ok(token) => {
                    if let Err(err) = inner.apply_token(token).await {
                        warn!(error = %err, "renewed token was rejected");
                    }
                }
                Err(err) => warn!(error = %err, "token provider failed"),
            }
        });
    }
}

/// Forwards transport events to the client until shutdown.
async fn pump(
    inner: Weak<ClientInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stopped| *stopped) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event);
    }
    debug!("event pump stopped");
}

/// Builds a [`SyncClient`].
///
/// # Example
///
/// ```rust,ignore
/// let client = SyncClient::builder()
///     .with_config(ClientConfig::new().with_log_level(LogLevel::Info))
///     .connect(transport, token)
///     .await?;
/// ```
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    observer: Option<Weak<dyn ClientObserver>>,
    context: Option<Arc<dyn ExecutionContext>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl ClientBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the observer for connection and token events.
    pub fn with_observer(mut self, observer: Weak<dyn ClientObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Sets the context that runs completions and events.
    ///
    /// Defaults to a [`SerialQueue`] on the current runtime.
    pub fn with_execution_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the source of replacement tokens.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Creates the client and makes the first connection attempt.
    ///
    /// A network failure does not fail construction: the client keeps
    /// reconnecting in the background and queues operations meanwhile.
    /// Rejected credentials leave the client in
    /// [`ConnectionState::Denied`] until a new token is supplied.
    pub async fn connect(
        self,
        transport: Arc<dyn Transport>,
        token: impl Into<String>,
    ) -> SyncResult<SyncClient> {
        let token = token.into();
        if token.is_empty() {
            return Err(SyncError::invalid("token must not be empty"));
        }
        if self.config.log_level != LogLevel::Silent {
            init_logging(self.config.log_level);
        }
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::Generic(format!("no Tokio runtime: {e}")))?;
        let context = match self.context {
            Some(context) => context,
            None => Arc::new(SerialQueue::on(&runtime)),
        };

        let dispatcher = Arc::new(EventDispatcher::new(context, self.observer));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        transport.set_event_sink(events_tx.clone());
        let connection = Arc::new(ConnectionManager::new(
            transport,
            self.config.clone(),
            Arc::clone(&dispatcher),
            token,
            events_tx.clone(),
        ));
        let registry = EntityRegistry::new(
            Arc::clone(&connection),
            Arc::clone(&dispatcher),
            self.config.max_page_size,
        );
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            config: self.config,
            connection,
            registry,
            dispatcher,
            shutdown,
            token_provider: self.token_provider,
        });
        runtime.spawn(pump(
            Arc::downgrade(&inner),
            events_rx,
            inner.shutdown.subscribe(),
        ));

        match inner.connection.connect().await {
            Ok(()) => info!("client connected"),
            Err(err) if inner.connection.state() == ConnectionState::Error => {
                warn!(error = %err, "initial connection failed; retrying in background");
                let _ = events_tx.send(TransportEvent::ConnectionLost(err.to_string()));
            }
            Err(err) => warn!(error = %err, state = %inner.connection.state(), "client not connected"),
        }
        Ok(SyncClient { inner })
    }
}

/// Client for synchronized documents, lists, maps and streams.
///
/// Dropping the client shuts it down. Entity handles keep shared state
/// alive but fail with [`SyncError::ShuttingDown`] afterwards.
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Returns a builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Creates a client with the default configuration.
    pub async fn connect(transport: Arc<dyn Transport>, token: impl Into<String>) -> SyncResult<Self> {
        ClientBuilder::new().connect(transport, token).await
    }

    async fn open<H>(
        &self,
        kind: EntityKind,
        options: OpenOptions,
        observer: Option<Weak<dyn EntityObserver>>,
        wrap: fn(HandleCore) -> H,
    ) -> SyncResult<H>
    where
        H: Send + 'static,
    {
        let op = async move {
            let (id, cache, registration) = self.inner.registry.open(kind, &options, observer).await?;
            Ok(wrap(HandleCore::new(
                Arc::clone(&self.inner),
                id,
                cache,
                registration,
            )))
        };
        self.inner.run(None, op).await
    }

    /// Opens or creates a document.
    pub async fn open_document(
        &self,
        options: OpenOptions,
        observer: Option<Weak<dyn EntityObserver>>,
    ) -> SyncResult<Document> {
        self.open(EntityKind::Document, options, observer, Document::new)
            .await
    }

    /// Opens or creates a list.
    pub async fn open_list(
        &self,
        options: OpenOptions,
        observer: Option<Weak<dyn EntityObserver>>,
    ) -> SyncResult<List> {
        self.open(EntityKind::List, options, observer, List::new).await
    }

    /// Opens or creates a map.
    pub async fn open_map(
        &self,
        options: OpenOptions,
        observer: Option<Weak<dyn EntityObserver>>,
    ) -> SyncResult<Map> {
        self.open(EntityKind::Map, options, observer, Map::new).await
    }

    /// Opens or creates a stream.
    pub async fn open_stream(
        &self,
        options: OpenOptions,
        observer: Option<Weak<dyn EntityObserver>>,
    ) -> SyncResult<Stream> {
        self.open(EntityKind::Stream, options, observer, Stream::new)
            .await
    }

    /// Replaces the access token.
    ///
    /// A client that lost its session to an expired or rejected token
    /// reconnects and resubscribes its open entities.
    pub async fn update_token(&self, token: impl Into<String>) -> SyncResult<()> {
        let token = token.into();
        self.inner.run(None, self.inner.apply_token(token)).await
    }

    /// Returns the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Returns a receiver that sees every connection state change.
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe_state()
    }

    /// Returns the current session, if connected.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.connection.session_id()
    }

    /// Shuts the client down.
    ///
    /// Pending operations fail with [`SyncError::ShuttingDown`], no further
    /// events are delivered and the transport is closed.
    pub async fn shutdown(&self) {
        if !self.inner.begin_shutdown() {
            return;
        }
        self.inner.registry.release_all();
        self.inner.connection.close().await;
        info!("client shut down");
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if !self.inner.begin_shutdown() {
            return;
        }
        self.inner.registry.release_all();
        if let Ok(runtime) = Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move { inner.connection.close().await });
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("state", &self.connection_state())
            .field("session", &self.session_id())
            .finish()
    }
}
