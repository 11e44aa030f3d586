//! Logical connections.
//!
//! A [`Connection`] owns at most one physical connection at a time. When the
//! physical connection breaks and the server acknowledged session recovery, the
//! next command transparently reconnects and replays the session state; every
//! command racing for the same broken connection awaits one shared reconnect
//! task.
//!
//! ## State machine
//!
//! ```text
//! Disconnected ─open─► Connecting ─► LoggingIn ─► LoggedIn
//!                          ▲             │            │
//!                          └── Routed ◄──┘            │ link breaks
//!                                                     ▼
//!                  LoggedIn ◄──success── Reconnecting ──failure──► Disconnected
//!
//! any ─close─► Disconnected        any ─fatal error─► Doomed
//! ```

mod lock;
pub(crate) mod login;
mod server_info;
mod session_data;
mod sessions;

pub use lock::{ConnectionLock, LockToken};
pub use server_info::{RoutingInfo, ServerInfo, TCP_PROTOCOL};
pub use session_data::{
    AliasCache, SESSION_STATE_COUNT, SessionData, SessionStateRecord, parse_recovery_ack,
};
pub use sessions::{SessionLease, SessionPool, SessionStats};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use mssql_auth::{CekCache, KeyStoreRegistry, TokenProvider};
use mssql_driver_pool::PoolGroup;
use parking_lot::Mutex;
use tds_rpc::RpcRequestPool;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::prepared::ConnectionCounters;
use crate::transport::{Connector, LoginAck, LoopbackExecutor, PhysicalConnection, ResponseItem};
use login::{Deadline, Established, LoginContext};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not open.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Performing the login handshake.
    LoggingIn,
    /// Redirected by the server; about to connect to the new destination.
    Routed,
    /// Ready for commands.
    LoggedIn,
    /// Replacing a broken physical connection.
    Reconnecting,
    /// Unusable after a fatal error.
    Doomed,
}

/// A shared, in-progress reconnection.
pub(crate) type ReconnectFuture = Shared<BoxFuture<'static, Result<()>>>;

struct ReconnectTask {
    future: ReconnectFuture,
    cancel: CancellationToken,
}

struct Link {
    physical: Option<Arc<dyn PhysicalConnection>>,
    server: Option<ServerInfo>,
    data_source: String,
    session_data: SessionData,
    recovery_acknowledged: bool,
    login_ack: Option<LoginAck>,
}

struct ConnectionInner {
    id: u64,
    config: Config,
    connector: Arc<dyn Connector>,
    pool_group: Arc<PoolGroup>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    loopback: Option<Arc<dyn LoopbackExecutor>>,
    key_stores: KeyStoreRegistry,
    cek_cache: Arc<CekCache>,
    rpc_pool: RpcRequestPool,
    lock: ConnectionLock,
    state: Mutex<ConnectionState>,
    link: Mutex<Link>,
    close_count: AtomicU64,
    reconnect_count: AtomicU64,
    sessions: SessionPool,
    reconnect: Mutex<Option<ReconnectTask>>,
    aliases: AliasCache,
}

impl ConnectionInner {
    fn login_context<'a>(&'a self, recovery: Option<&'a SessionData>) -> LoginContext<'a> {
        LoginContext {
            config: &self.config,
            connector: self.connector.as_ref(),
            pool_group: &self.pool_group,
            token_provider: self.token_provider.as_deref(),
            recovery,
            aliases: &self.aliases,
            state: &self.state,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Swap in a freshly logged-in physical connection.
    ///
    /// A reconnect bumps the reconnect count before the new link is visible,
    /// so no command can pair an old prepared handle with the new link.
    fn install(&self, established: Established, reconnected: bool) -> Option<Arc<dyn PhysicalConnection>> {
        let old = {
            let mut link = self.link.lock();
            if reconnected {
                self.reconnect_count.fetch_add(1, Ordering::AcqRel);
            }
            link.server = Some(established.server);
            link.data_source = established.data_source;
            link.session_data = established.session_data;
            link.recovery_acknowledged = established.recovery_acknowledged;
            link.login_ack = Some(established.ack);
            link.physical.replace(established.physical)
        };
        self.sessions.advance_generation();
        self.set_state(ConnectionState::LoggedIn);
        old
    }

    /// Give up on a broken link after recovery failed.
    ///
    /// The recovery snapshot is dropped and the connection is closed; only a
    /// fresh open can restore it.
    fn abandon_recovery(&self) -> Option<Arc<dyn PhysicalConnection>> {
        let old = {
            let mut link = self.link.lock();
            link.session_data = SessionData::new(self.aliases.clone());
            link.recovery_acknowledged = false;
            link.physical.take()
        };
        self.close_count.fetch_add(1, Ordering::AcqRel);
        self.sessions.advance_generation();
        self.set_state(ConnectionState::Disconnected);
        old
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect.lock().take() {
            task.cancel.cancel();
        }
    }
}

/// A logical connection to SQL Server.
///
/// Cloning is cheap; clones share the same physical connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Builder for a [`Connection`] with non-default collaborators.
pub struct ConnectionBuilder {
    config: Config,
    connector: Arc<dyn Connector>,
    pool_group: Option<Arc<PoolGroup>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    loopback: Option<Arc<dyn LoopbackExecutor>>,
    key_stores: KeyStoreRegistry,
    cek_cache: Option<Arc<CekCache>>,
}

impl ConnectionBuilder {
    /// Share failover and authentication state with other connections.
    #[must_use]
    pub fn pool_group(mut self, group: Arc<PoolGroup>) -> Self {
        self.pool_group = Some(group);
        self
    }

    /// Source of access tokens for federated credentials.
    #[must_use]
    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Run commands in-process instead of over the network.
    #[must_use]
    pub fn loopback(mut self, executor: Arc<dyn LoopbackExecutor>) -> Self {
        self.loopback = Some(executor);
        self
    }

    /// Key store providers for column encryption keys.
    #[must_use]
    pub fn key_stores(mut self, registry: KeyStoreRegistry) -> Self {
        self.key_stores = registry;
        self
    }

    /// Share a column encryption key cache.
    #[must_use]
    pub fn cek_cache(mut self, cache: Arc<CekCache>) -> Self {
        self.cek_cache = Some(cache);
        self
    }

    /// Log in and return the open connection.
    ///
    /// An open failing with a transient server error is retried up to
    /// `connect_retry_count` times, `connect_retry_interval` apart.
    pub async fn open(self) -> Result<Connection> {
        self.config.validate()?;
        let pool_group = self.pool_group.unwrap_or_default();
        pool_group.ensure_open()?;

        let aliases = AliasCache::default();
        let inner = Arc::new(ConnectionInner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            connector: self.connector,
            pool_group,
            token_provider: self.token_provider,
            loopback: self.loopback,
            key_stores: self.key_stores,
            cek_cache: self.cek_cache.unwrap_or_else(|| Arc::new(CekCache::new())),
            rpc_pool: RpcRequestPool::default(),
            lock: ConnectionLock::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            link: Mutex::new(Link {
                physical: None,
                server: None,
                data_source: String::new(),
                session_data: SessionData::new(aliases.clone()),
                recovery_acknowledged: false,
                login_ack: None,
            }),
            close_count: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            sessions: SessionPool::new(),
            reconnect: Mutex::new(None),
            aliases,
            config: self.config,
        });

        let connection = Connection { inner };
        connection.open_with_retry().await?;
        Ok(connection)
    }

    /// Blocking variant of [`open`](Self::open).
    pub fn open_blocking(self) -> Result<Connection> {
        crate::blocking::block_on(self.open())
    }
}

impl Connection {
    /// Start building a connection that opens through `connector`.
    pub fn builder(config: Config, connector: Arc<dyn Connector>) -> ConnectionBuilder {
        ConnectionBuilder {
            config,
            connector,
            pool_group: None,
            token_provider: None,
            loopback: None,
            key_stores: KeyStoreRegistry::new(),
            cek_cache: None,
        }
    }

    /// Open a connection with default collaborators.
    pub async fn open(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::builder(config, connector).open().await
    }

    async fn open_with_retry(&self) -> Result<()> {
        let config = &self.inner.config;
        let interval = config.connect_retry_interval;
        // One budget covers every attempt.
        let deadline = Deadline::after(config.connect_timeout);
        let mut attempt = 0u32;
        loop {
            let ctx = self.inner.login_context(None);
            match login::open_physical(&ctx, deadline).await {
                Ok(established) => {
                    tracing::info!(
                        connection = self.inner.id,
                        data_source = %established.data_source,
                        recovery = established.recovery_acknowledged,
                        "connection opened"
                    );
                    self.inner.install(established, false);
                    return Ok(());
                }
                Err(e) if attempt < config.connect_retry_count
                    && e.is_transient(&config.transient_errors)
                    && !deadline.is_expired()
                    && !deadline.remaining().is_some_and(|left| left < interval) =>
                {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        error = %e,
                        retry_in_ms = interval.as_millis() as u64,
                        "transient error opening connection, retrying"
                    );
                    tokio::time::sleep(interval).await;
                }
                Err(e) => {
                    self.inner.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        }
    }

    /// Unique id of this logical connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The configuration this connection was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Whether commands may run.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::LoggedIn | ConnectionState::Reconnecting
        )
    }

    /// Times this connection was closed.
    #[must_use]
    pub fn close_count(&self) -> u64 {
        self.inner.close_count.load(Ordering::Acquire)
    }

    /// Times the physical connection was replaced by session recovery.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnect_count.load(Ordering::Acquire)
    }

    /// Server the connection logged into, as configured or as the failover
    /// partner that accepted it.
    #[must_use]
    pub fn data_source(&self) -> String {
        self.inner.link.lock().data_source.clone()
    }

    /// Destination of the current physical connection.
    #[must_use]
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.link.lock().server.clone()
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> Option<String> {
        self.inner.link.lock().session_data.database.clone()
    }

    /// A copy of the resumable session state.
    #[must_use]
    pub fn session_data(&self) -> SessionData {
        self.inner.link.lock().session_data.clone()
    }

    /// Whether the server agreed to track session state for recovery.
    #[must_use]
    pub fn is_recovery_acknowledged(&self) -> bool {
        self.inner.link.lock().recovery_acknowledged
    }

    /// Session pool counters.
    #[must_use]
    pub fn session_stats(&self) -> SessionStats {
        self.inner.sessions.stats()
    }

    /// The lock serializing wire writes and teardown.
    #[must_use]
    pub fn lock(&self) -> &ConnectionLock {
        &self.inner.lock
    }

    /// The pool group shared with other connections.
    #[must_use]
    pub fn pool_group(&self) -> &Arc<PoolGroup> {
        &self.inner.pool_group
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<()> {
        self.close_with(None).await
    }

    /// Close the connection, reusing the caller's lock token if it has one.
    pub async fn close_with(&self, token: Option<&LockToken>) -> Result<()> {
        let _own = match token {
            Some(token) if self.inner.lock.is_held_by(token) => None,
            Some(_) => {
                return Err(Error::InvalidOperation(
                    "lock token belongs to another connection".into(),
                ));
            }
            None => Some(self.inner.lock.acquire().await),
        };

        self.inner.cancel_reconnect();
        let physical = self.inner.link.lock().physical.take();
        self.inner.close_count.fetch_add(1, Ordering::AcqRel);
        self.inner.sessions.advance_generation();
        self.inner.set_state(ConnectionState::Disconnected);
        if let Some(physical) = physical {
            physical.close().await;
        }
        tracing::debug!(connection = self.inner.id, "connection closed");
        Ok(())
    }

    /// Mark the connection unusable after a fatal error.
    pub(crate) fn doom(&self) {
        tracing::warn!(connection = self.inner.id, "connection doomed");
        self.inner.cancel_reconnect();
        self.inner.sessions.advance_generation();
        self.inner.set_state(ConnectionState::Doomed);
    }

    /// Close and doom the connection from inside a locked write.
    pub(crate) async fn doom_with(&self, token: Option<&LockToken>) {
        if let Err(e) = self.close_with(token).await {
            tracing::debug!(connection = self.inner.id, error = %e, "close during doom failed");
        }
        self.doom();
    }

    /// Identity and counters prepared handles are validated against.
    #[must_use]
    pub fn counters(&self) -> ConnectionCounters {
        ConnectionCounters {
            id: self.inner.id,
            close_count: self.close_count(),
            reconnect_count: self.reconnect_count(),
        }
    }

    pub(crate) fn rpc_pool(&self) -> &RpcRequestPool {
        &self.inner.rpc_pool
    }

    pub(crate) fn key_stores(&self) -> &KeyStoreRegistry {
        &self.inner.key_stores
    }

    pub(crate) fn cek_cache(&self) -> &CekCache {
        &self.inner.cek_cache
    }

    pub(crate) fn loopback(&self) -> Option<&Arc<dyn LoopbackExecutor>> {
        self.inner.loopback.as_ref()
    }

    /// Lease a session of the current physical connection.
    pub(crate) fn acquire_session(&self) -> Result<SessionLease> {
        let physical = self
            .inner
            .link
            .lock()
            .physical
            .clone()
            .ok_or(Error::ConnectionClosed)?;
        self.inner.sessions.acquire(&physical)
    }

    /// Record environment and session-state changes from a response.
    pub(crate) fn apply_response_state(&self, items: &[ResponseItem]) {
        let mut link = self.inner.link.lock();
        for item in items {
            match item {
                ResponseItem::EnvChange(change) => link.session_data.apply_env_change(change),
                ResponseItem::SessionState(state) => link.session_data.apply_session_state(state),
                _ => {}
            }
        }
    }

    /// Check the physical connection and start recovering it if it broke.
    ///
    /// Returns `None` when no reconnection is needed or possible, or the
    /// shared reconnection every caller should await.
    pub(crate) fn validate_and_reconnect(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<ReconnectFuture>> {
        if let Some(task) = self.inner.reconnect.lock().as_ref() {
            return Ok(Some(task.future.clone()));
        }
        if self.inner.config.connect_retry_count == 0 {
            return Ok(None);
        }

        let recovery = {
            let link = self.inner.link.lock();
            if !link.recovery_acknowledged {
                return Ok(None);
            }
            match &link.physical {
                Some(physical) if !physical.is_alive() => {}
                _ => return Ok(None),
            }
            if link.session_data.unrecoverable_count() > 0 {
                drop(link);
                tracing::warn!(connection = self.inner.id, "broken session holds unrecoverable state");
                self.doom();
                return Err(Error::UnrecoverableSession);
            }
            link.session_data.clone()
        };
        if self.inner.sessions.stats().outstanding() > 0 {
            tracing::warn!(connection = self.inner.id, "broken connection has sessions in use");
            self.doom();
            return Err(Error::UnrecoverableSession);
        }

        let mut slot = self.inner.reconnect.lock();
        if let Some(task) = slot.as_ref() {
            return Ok(Some(task.future.clone()));
        }
        tracing::info!(connection = self.inner.id, "connection broken, reconnecting");
        self.inner.set_state(ConnectionState::Reconnecting);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reconnect(
            Arc::clone(&self.inner),
            recovery,
            timeout,
            cancel.clone(),
        ));
        let future = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(Error::Fatal(format!("reconnect task failed: {e}"))))
        }
        .boxed()
        .shared();
        *slot = Some(ReconnectTask {
            future: future.clone(),
            cancel,
        });
        Ok(Some(future))
    }
}

async fn reconnect(
    inner: Arc<ConnectionInner>,
    recovery: SessionData,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) -> Result<()> {
    let result = reconnect_attempts(&inner, &recovery, timeout, &cancel).await;
    inner.reconnect.lock().take();
    match &result {
        Ok(()) => tracing::info!(connection = inner.id, "reconnected"),
        Err(Error::ConnectionClosed) => {}
        Err(e) => {
            tracing::warn!(connection = inner.id, error = %e, "reconnection failed, closing connection");
            if let Some(old) = inner.abandon_recovery() {
                old.close().await;
            }
        }
    }
    result
}

async fn reconnect_attempts(
    inner: &ConnectionInner,
    recovery: &SessionData,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<()> {
    let retry_count = inner.config.connect_retry_count;
    let interval = inner.config.connect_retry_interval;
    let deadline = Deadline::after(timeout);

    for attempt in 0..retry_count {
        if cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        tracing::debug!(connection = inner.id, attempt, "reconnection attempt");
        let ctx = inner.login_context(Some(recovery));
        match login::open_physical(&ctx, Deadline::after(inner.config.connect_timeout)).await {
            Ok(established) => {
                if cancel.is_cancelled() {
                    established.physical.close().await;
                    return Err(Error::ConnectionClosed);
                }
                if let Some(old) = inner.install(established, true) {
                    old.close().await;
                }
                return Ok(());
            }
            Err(e) => {
                if attempt + 1 == retry_count {
                    return Err(Error::ReconnectAllAttemptsFailed(Box::new(e)));
                }
                if !deadline.is_infinite() && deadline.remaining().is_some_and(|left| left < interval) {
                    return Err(Error::ReconnectWouldExceedTimeout(Box::new(e)));
                }
                tracing::debug!(attempt, error = %e, "reconnection attempt failed");
            }
        }
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = cancel.cancelled() => return Err(Error::ConnectionClosed),
        }
    }
    Err(Error::ConnectionClosed)
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("close_count", &self.close_count())
            .field("reconnect_count", &self.reconnect_count())
            .finish_non_exhaustive()
    }
}
