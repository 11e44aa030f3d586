//! In-memory mock SQL Server.
//!
//! The mock implements the client's transport traits directly, so tests drive
//! the real command pipeline, login, failover and recovery logic without a
//! socket. It understands the system procedures the client sends:
//!
//! - `sp_executesql` runs the statement in slot 0;
//! - `sp_prepexec` allocates a handle on the physical connection, returns it
//!   in slot 0, and runs the statement;
//! - `sp_execute` runs the statement behind a handle, failing with error
//!   8179 when the handle is unknown on this physical connection;
//! - `sp_unprepare` drops a handle.
//!
//! Anything else is a named procedure. Statement and procedure replies come
//! from [`MockResponse`]s registered by text or procedure name.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_testing::mock_server::{MockLogin, MockResponse, MockTdsServer};
//!
//! let server = MockTdsServer::builder()
//!     .with_host("primary", MockLogin::Accept)
//!     .with_response("UPDATE t SET a = 1", MockResponse::affected(3))
//!     .build();
//! let conn = Connection::open(fixtures::config("primary"), server.connector()).await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mssql_client::{
    Attention, Connector, DoneKind, Error, FeatureAck, LoginAck, LoginRequest, LoopbackExecutor,
    PhysicalConnection, Request, ResponseItem, Result, ResultSet, RoutingInfo, SecurityOptions,
    ServerInfo, ServerMessage, Session,
};
use parking_lot::Mutex;
use tds_rpc::{
    ParamValue, Parameter, ParameterDirection, ProcId, RpcOptionFlags, RpcRequest, RpcTarget,
    TdsVersion,
};
use tokio::sync::Notify;

/// Error number for an unknown prepared handle.
pub const UNKNOWN_HANDLE: i32 = 8179;

/// Name recorded for plain SQL batches.
pub const BATCH: &str = "<batch>";

/// What a host does when the client connects and logs in.
#[derive(Debug, Clone)]
pub enum MockLogin {
    /// Accept the login.
    Accept,
    /// Accept with exactly this acknowledgement.
    AcceptWith(LoginAck),
    /// Accept after the connect takes this long.
    AcceptAfter(Duration),
    /// Refuse the TCP connection.
    Unreachable,
    /// Never complete the connect; it fails once its budget runs out.
    Hang,
    /// Fail the login with a server error.
    Reject(ServerMessage),
    /// Redirect the client elsewhere.
    Route(RoutingInfo),
}

/// Canned reply to one statement or procedure call.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    items: Vec<ResponseItem>,
    rows_affected: Option<u64>,
    outputs: Vec<(String, ParamValue)>,
    return_status: Option<i32>,
    delay: Option<Duration>,
    truncated: bool,
}

impl MockResponse {
    /// Nothing but the closing done token.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A statement that affected `count` rows.
    pub fn affected(count: u64) -> Self {
        Self {
            rows_affected: Some(count),
            ..Self::default()
        }
    }

    /// A statement returning `set`.
    pub fn rows(set: ResultSet) -> Self {
        Self::empty().with_result_set(set)
    }

    /// A single-column, single-row integer result.
    pub fn scalar_int(value: i64) -> Self {
        Self::rows(ResultSet::new([""]).with_row(vec![ParamValue::Int(value)]))
    }

    /// A statement failing with a server error.
    pub fn error(number: i32, class: u8, message: impl Into<String>) -> Self {
        Self::empty().with_error(number, class, message)
    }

    /// Append a result set; its rows count as affected.
    #[must_use]
    pub fn with_result_set(mut self, set: ResultSet) -> Self {
        let count = set.rows.len() as u64;
        self.rows_affected = Some(self.rows_affected.unwrap_or(0) + count);
        self.items.push(ResponseItem::ResultSet(set));
        self
    }

    /// Append an error message.
    #[must_use]
    pub fn with_error(mut self, number: i32, class: u8, message: impl Into<String>) -> Self {
        self.items
            .push(ResponseItem::Error(ServerMessage::new(number, class, message)));
        self
    }

    /// Append an informational message.
    #[must_use]
    pub fn with_info(mut self, number: i32, message: impl Into<String>) -> Self {
        self.items
            .push(ResponseItem::Info(ServerMessage::new(number, 0, message)));
        self
    }

    /// Append any response item, such as an environment change.
    #[must_use]
    pub fn with_item(mut self, item: ResponseItem) -> Self {
        self.items.push(item);
        self
    }

    /// Value the server writes back to an output parameter.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.outputs.push((name.into(), value.into()));
        self
    }

    /// Procedure return status.
    #[must_use]
    pub fn with_return_status(mut self, status: i32) -> Self {
        self.return_status = Some(status);
        self
    }

    /// Hold the response back this long; an attention ends the wait.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Leave out the procedure's closing done token, as a server that cut
    /// the reply short would.
    #[must_use]
    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }

    fn statement_items(&self, in_proc: bool) -> Vec<ResponseItem> {
        let mut items = self.items.clone();
        if self.rows_affected.is_some() || !in_proc {
            items.push(ResponseItem::Done {
                kind: if in_proc { DoneKind::DoneInProc } else { DoneKind::Done },
                row_count: self.rows_affected,
                attention: false,
            });
        }
        items
    }

    fn output_for(&self, param: &Parameter) -> Option<ParamValue> {
        self.outputs
            .iter()
            .find(|(name, _)| param.matches_name(name))
            .map(|(_, value)| value.clone())
    }
}

/// One RPC or batch as the server received it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Procedure name, or [`BATCH`].
    pub name: String,
    /// Statement text the call ran, when there is one.
    pub statement: Option<String>,
    /// Handle argument of `sp_execute`, `sp_prepexec` and `sp_unprepare`.
    pub handle: Option<i32>,
    /// User parameters as sent.
    pub params: Vec<Parameter>,
    /// RPC option flags.
    pub options: RpcOptionFlags,
}

/// One request as the server received it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Physical connection id; `0` for the loopback executor.
    pub connection: u64,
    /// Host the physical connection went to.
    pub host: String,
    /// Calls in the request.
    pub calls: Vec<RecordedCall>,
}

/// One login as the server received it.
#[derive(Debug, Clone)]
pub struct RecordedLogin {
    /// Host logged into.
    pub host: String,
    /// Whether the login replayed session state.
    pub recovering: bool,
    /// Federated access token sent.
    pub access_token: Option<String>,
}

/// Configuration for the mock server.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    hosts: HashMap<String, MockLogin>,
    scripts: HashMap<String, VecDeque<MockLogin>>,
    responses: HashMap<String, MockResponse>,
    default_response: MockResponse,
    failover_partner: Option<String>,
    session_recovery: bool,
    database: String,
    tds_version: TdsVersion,
    close_delay: Option<Duration>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            hosts: HashMap::new(),
            scripts: HashMap::new(),
            responses: HashMap::new(),
            default_response: MockResponse::empty(),
            failover_partner: None,
            session_recovery: true,
            database: "master".to_string(),
            tds_version: TdsVersion::V7_4,
            close_delay: None,
        }
    }
}

/// Builder for [`MockTdsServer`].
#[derive(Debug, Default)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a builder with no hosts.
    pub fn new() -> Self {
        Self::default()
    }

    /// How `host` behaves once its script is exhausted.
    pub fn with_host(mut self, host: impl Into<String>, login: MockLogin) -> Self {
        self.config.hosts.insert(host.into(), login);
        self
    }

    /// Behaviors `host` plays through, one per connect, before its default.
    pub fn with_script(mut self, host: impl Into<String>, logins: impl IntoIterator<Item = MockLogin>) -> Self {
        self.config
            .scripts
            .entry(host.into())
            .or_default()
            .extend(logins);
        self
    }

    /// Reply for a statement text or procedure name.
    pub fn with_response(mut self, key: impl Into<String>, response: MockResponse) -> Self {
        self.config.responses.insert(key.into(), response);
        self
    }

    /// Reply for anything without a registered response.
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = response;
        self
    }

    /// Mirroring partner every host announces.
    pub fn with_failover_partner(mut self, partner: impl Into<String>) -> Self {
        self.config.failover_partner = Some(partner.into());
        self
    }

    /// Never acknowledge session recovery.
    pub fn without_session_recovery(mut self) -> Self {
        self.config.session_recovery = false;
        self
    }

    /// Database reported at login.
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.config.database = db.into();
        self
    }

    /// Protocol version acknowledged at login.
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.config.tds_version = version;
        self
    }

    /// Make closing a physical connection take this long.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.config.close_delay = Some(delay);
        self
    }

    /// Build the server.
    pub fn build(self) -> MockTdsServer {
        MockTdsServer::start(self.config)
    }
}

/// Whether the next write fails, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InjectedFailure {
    Io,
    Fatal,
}

struct ServerState {
    config: MockServerConfig,
    connections: Vec<Arc<PhysicalState>>,
    requests: Vec<RecordedRequest>,
    logins: Vec<RecordedLogin>,
    fail_next_send: Option<InjectedFailure>,
}

struct Shared {
    state: Mutex<ServerState>,
    loopback: Arc<PhysicalState>,
    next_handle: AtomicI32,
    next_connection: AtomicU64,
    attentions: AtomicUsize,
    sessions_opened: AtomicUsize,
}

/// Server side of one physical connection.
struct PhysicalState {
    id: u64,
    host: String,
    alive: AtomicBool,
    login: MockLogin,
    security: SecurityOptions,
    handles: Mutex<HashMap<i32, String>>,
}

/// A mock SQL Server shared by every connection a test opens.
///
/// Cloning shares the server.
#[derive(Clone)]
pub struct MockTdsServer {
    shared: Arc<Shared>,
}

impl MockTdsServer {
    /// Create a builder for the mock server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start a server from a configuration.
    pub fn start(config: MockServerConfig) -> Self {
        let loopback = Arc::new(PhysicalState {
            id: 0,
            host: "loopback".to_string(),
            alive: AtomicBool::new(true),
            login: MockLogin::Accept,
            security: SecurityOptions::default(),
            handles: Mutex::new(HashMap::new()),
        });
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState {
                    config,
                    connections: Vec::new(),
                    requests: Vec::new(),
                    logins: Vec::new(),
                    fail_next_send: None,
                }),
                loopback,
                next_handle: AtomicI32::new(1),
                next_connection: AtomicU64::new(1),
                attentions: AtomicUsize::new(0),
                sessions_opened: AtomicUsize::new(0),
            }),
        }
    }

    /// A connector opening physical connections to this server.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            shared: Arc::clone(&self.shared),
        })
    }

    /// An in-process executor backed by this server.
    pub fn loopback(&self) -> Arc<dyn LoopbackExecutor> {
        Arc::new(MockLoopback {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Queue a behavior for the next connect to `host`.
    pub fn push_login(&self, host: impl Into<String>, login: MockLogin) {
        self.shared
            .state
            .lock()
            .config
            .scripts
            .entry(host.into())
            .or_default()
            .push_back(login);
    }

    /// Change how `host` behaves once its script is exhausted.
    pub fn set_host(&self, host: impl Into<String>, login: MockLogin) {
        self.shared.state.lock().config.hosts.insert(host.into(), login);
    }

    /// Register or replace a reply.
    pub fn set_response(&self, key: impl Into<String>, response: MockResponse) {
        self.shared
            .state
            .lock()
            .config
            .responses
            .insert(key.into(), response);
    }

    /// Drop every physical connection, as a network outage would.
    pub fn break_connections(&self) {
        for conn in &self.shared.state.lock().connections {
            conn.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Drop every prepared handle, as a server-side cache flush would.
    pub fn forget_prepared_handles(&self) {
        for conn in &self.shared.state.lock().connections {
            conn.handles.lock().clear();
        }
    }

    /// Fail the next write with an IO error.
    pub fn fail_next_send(&self) {
        self.shared.state.lock().fail_next_send = Some(InjectedFailure::Io);
    }

    /// Fail the next write with an error that skips ordinary cleanup.
    pub fn fail_next_send_fatally(&self) {
        self.shared.state.lock().fail_next_send = Some(InjectedFailure::Fatal);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared.state.lock().requests.clone()
    }

    /// Every call received so far, flattened across requests.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.shared
            .state
            .lock()
            .requests
            .iter()
            .flat_map(|r| r.calls.iter().cloned())
            .collect()
    }

    /// Names of every call received so far.
    pub fn call_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.name).collect()
    }

    /// Every login received so far.
    pub fn logins(&self) -> Vec<RecordedLogin> {
        self.shared.state.lock().logins.clone()
    }

    /// Forget recorded requests and logins.
    pub fn clear_log(&self) {
        let mut state = self.shared.state.lock();
        state.requests.clear();
        state.logins.clear();
    }

    /// Attention signals received.
    pub fn attention_count(&self) -> usize {
        self.shared.attentions.load(Ordering::SeqCst)
    }

    /// Sessions opened across all physical connections.
    pub fn sessions_opened(&self) -> usize {
        self.shared.sessions_opened.load(Ordering::SeqCst)
    }

    /// Physical connections still open.
    pub fn live_connections(&self) -> usize {
        self.shared
            .state
            .lock()
            .connections
            .iter()
            .filter(|c| c.alive.load(Ordering::SeqCst))
            .count()
    }

    /// Physical connections ever accepted.
    pub fn connections_accepted(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    /// Prepared handles alive on open physical connections.
    pub fn prepared_handles(&self) -> usize {
        self.shared
            .state
            .lock()
            .connections
            .iter()
            .filter(|c| c.alive.load(Ordering::SeqCst))
            .map(|c| c.handles.lock().len())
            .sum()
    }
}

impl std::fmt::Debug for MockTdsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTdsServer")
            .field("connections", &self.connections_accepted())
            .field("attentions", &self.attention_count())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn next_login(&self, host: &str) -> MockLogin {
        let mut state = self.state.lock();
        if let Some(login) = state.config.scripts.get_mut(host).and_then(VecDeque::pop_front) {
            return login;
        }
        state
            .config
            .hosts
            .get(host)
            .cloned()
            .unwrap_or(MockLogin::Unreachable)
    }

    fn response(&self, key: &str) -> MockResponse {
        let state = self.state.lock();
        state
            .config
            .responses
            .get(key)
            .cloned()
            .unwrap_or_else(|| state.config.default_response.clone())
    }

    fn standard_ack(&self, request: &LoginRequest, security: SecurityOptions) -> LoginAck {
        let state = self.state.lock();
        let mut feature_acks = Vec::new();
        if request.request_session_recovery && state.config.session_recovery {
            feature_acks.push(FeatureAck::SessionRecovery(Bytes::new()));
        }
        if request.access_token.is_some() {
            feature_acks.push(FeatureAck::FederatedAuth);
        }
        if request.column_encryption {
            feature_acks.push(FeatureAck::ColumnEncryption(1));
        }
        LoginAck {
            tds_version: state.config.tds_version,
            routing: None,
            feature_acks,
            failover_partner: state.config.failover_partner.clone(),
            database: Some(
                request
                    .recovery
                    .as_ref()
                    .and_then(|r| r.database.clone())
                    .or_else(|| request.database.clone())
                    .unwrap_or_else(|| state.config.database.clone()),
            ),
            language: request.language.clone(),
            collation: None,
            encrypted: security.encrypt,
        }
    }

    /// Run a request against `conn`, returning the response and how long to hold it.
    fn execute(&self, conn: &PhysicalState, request: Request<'_>) -> (Vec<ResponseItem>, Option<Duration>) {
        let mut calls = Vec::new();
        let mut items = Vec::new();
        let mut delay = None;

        match request {
            Request::Batch(text) => {
                let response = self.response(text);
                delay = response.delay;
                items.extend(response.statement_items(false));
                calls.push(RecordedCall {
                    name: BATCH.to_string(),
                    statement: Some(text.to_string()),
                    handle: None,
                    params: Vec::new(),
                    options: RpcOptionFlags::empty(),
                });
            }
            Request::Rpc(rpcs) => {
                for rpc in rpcs {
                    let (call, call_items, call_delay) = self.execute_rpc(conn, rpc);
                    delay = delay.max(call_delay);
                    items.extend(call_items);
                    calls.push(call);
                }
            }
        }

        self.state.lock().requests.push(RecordedRequest {
            connection: conn.id,
            host: conn.host.clone(),
            calls,
        });
        (items, delay)
    }

    fn execute_rpc(
        &self,
        conn: &PhysicalState,
        rpc: &RpcRequest,
    ) -> (RecordedCall, Vec<ResponseItem>, Option<Duration>) {
        let text_at = |slot: usize| {
            rpc.param(slot)
                .and_then(|p| p.param.value.as_ref())
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let handle_at = |slot: usize| {
            rpc.param(slot)
                .and_then(|p| p.param.value.as_ref())
                .and_then(ParamValue::as_i64)
                .and_then(|h| i32::try_from(h).ok())
        };
        let mut call = RecordedCall {
            name: rpc.display_name().to_string(),
            statement: None,
            handle: None,
            params: rpc.user_params().map(|(_, p)| p.param.clone()).collect(),
            options: rpc.options(),
        };
        let mut items = Vec::new();
        let mut response = None;

        match rpc.target() {
            Some(RpcTarget::Id(ProcId::ExecuteSql)) => {
                call.statement = text_at(0);
                response = call.statement.as_deref().map(|t| self.response(t));
            }
            Some(RpcTarget::Id(ProcId::PrepExec)) => {
                call.handle = handle_at(0);
                call.statement = text_at(2);
                let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
                if let Some(previous) = call.handle {
                    conn.handles.lock().remove(&previous);
                }
                conn.handles
                    .lock()
                    .insert(handle, call.statement.clone().unwrap_or_default());
                items.push(ResponseItem::ReturnValue {
                    ordinal: 0,
                    name: String::new(),
                    value: ParamValue::Int(i64::from(handle)),
                });
                response = call.statement.as_deref().map(|t| self.response(t));
            }
            Some(RpcTarget::Id(ProcId::Execute)) => {
                call.handle = handle_at(0);
                call.statement = call.handle.and_then(|h| conn.handles.lock().get(&h).cloned());
                match &call.statement {
                    Some(text) => response = Some(self.response(text)),
                    None => items.push(ResponseItem::Error(ServerMessage::new(
                        UNKNOWN_HANDLE,
                        16,
                        "Could not find prepared statement with handle",
                    ))),
                }
            }
            Some(RpcTarget::Id(ProcId::Unprepare)) => {
                call.handle = handle_at(0);
                if let Some(handle) = call.handle {
                    conn.handles.lock().remove(&handle);
                }
            }
            Some(RpcTarget::Id(ProcId::Prepare)) | None => {}
            Some(RpcTarget::Name(name)) => {
                let reply = self.response(name);
                items.extend(reply.statement_items(true));
                items.push(ResponseItem::ReturnStatus(reply.return_status.unwrap_or(0)));
                push_outputs(rpc, &reply, &mut items);
                let delay = reply.delay;
                if !reply.truncated {
                    items.push(proc_done());
                }
                return (call, items, delay);
            }
        }

        let delay = response.as_ref().and_then(|r| r.delay);
        if let Some(reply) = response {
            items.extend(reply.statement_items(true));
            push_outputs(rpc, &reply, &mut items);
        }
        items.push(proc_done());
        (call, items, delay)
    }
}

fn proc_done() -> ResponseItem {
    ResponseItem::Done {
        kind: DoneKind::DoneProc,
        row_count: None,
        attention: false,
    }
}

/// Return values for every by-reference user parameter, by slot.
fn push_outputs(rpc: &RpcRequest, reply: &MockResponse, items: &mut Vec<ResponseItem>) {
    for (ordinal, (slot, _)) in rpc.params().enumerate() {
        if slot.source == tds_rpc::ParamSource::System
            || !slot.param.direction.is_by_ref()
            || slot.param.direction == ParameterDirection::ReturnValue
        {
            continue;
        }
        let value = reply
            .output_for(&slot.param)
            .or_else(|| slot.param.value.clone())
            .unwrap_or(ParamValue::Null);
        items.push(ResponseItem::ReturnValue {
            ordinal,
            name: slot.param.name.clone(),
            value,
        });
    }
}

struct MockConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        server: &ServerInfo,
        budget: Option<Duration>,
        security: SecurityOptions,
    ) -> Result<Arc<dyn PhysicalConnection>> {
        let host = server.host().to_string();
        let login = self.shared.next_login(&host);
        tracing::trace!(%host, ?login, "mock connect");
        match &login {
            MockLogin::Unreachable => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("{host} refused the connection"),
                )
                .into());
            }
            MockLogin::Hang => {
                match budget {
                    Some(budget) => tokio::time::sleep(budget).await,
                    None => std::future::pending::<()>().await,
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {host} timed out"),
                )
                .into());
            }
            MockLogin::AcceptAfter(delay) => tokio::time::sleep(*delay).await,
            _ => {}
        }

        let conn = Arc::new(PhysicalState {
            id: self.shared.next_connection.fetch_add(1, Ordering::SeqCst),
            host,
            alive: AtomicBool::new(true),
            login,
            security,
            handles: Mutex::new(HashMap::new()),
        });
        self.shared.state.lock().connections.push(Arc::clone(&conn));
        Ok(Arc::new(MockConnection {
            shared: Arc::clone(&self.shared),
            conn,
        }))
    }
}

struct MockConnection {
    shared: Arc<Shared>,
    conn: Arc<PhysicalState>,
}

#[async_trait]
impl PhysicalConnection for MockConnection {
    async fn login(&self, request: &LoginRequest) -> Result<LoginAck> {
        self.shared.state.lock().logins.push(RecordedLogin {
            host: self.conn.host.clone(),
            recovering: request.recovery.is_some(),
            access_token: request.access_token.clone(),
        });
        match &self.conn.login {
            MockLogin::Reject(msg) => Err(Error::from(msg)),
            MockLogin::Route(routing) => Ok(LoginAck {
                tds_version: self.shared.state.lock().config.tds_version,
                routing: Some(routing.clone()),
                ..LoginAck::default()
            }),
            MockLogin::AcceptWith(ack) => Ok(ack.clone()),
            _ => Ok(self.shared.standard_ack(request, self.conn.security)),
        }
    }

    fn open_session(&self) -> Result<Box<dyn Session>> {
        if !self.conn.alive.load(Ordering::SeqCst) {
            return Err(broken_pipe());
        }
        self.shared.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            shared: Arc::clone(&self.shared),
            conn: Arc::clone(&self.conn),
            attention: Arc::new(MockAttention {
                shared: Arc::clone(&self.shared),
                requested: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            pending: None,
        }))
    }

    fn is_alive(&self) -> bool {
        self.conn.alive.load(Ordering::SeqCst)
    }

    fn server_failover_partner(&self) -> Option<String> {
        self.shared.state.lock().config.failover_partner.clone()
    }

    async fn close(&self) {
        self.conn.alive.store(false, Ordering::SeqCst);
        let delay = self.shared.state.lock().config.close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn broken_pipe() -> Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection to mock server is gone").into()
}

struct MockAttention {
    shared: Arc<Shared>,
    requested: AtomicBool,
    notify: Notify,
}

impl MockAttention {
    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.requested.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl Attention for MockAttention {
    fn send_attention(&self) {
        self.shared.attentions.fetch_add(1, Ordering::SeqCst);
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

struct MockSession {
    shared: Arc<Shared>,
    conn: Arc<PhysicalState>,
    attention: Arc<MockAttention>,
    pending: Option<(Vec<ResponseItem>, Option<Duration>)>,
}

#[async_trait]
impl Session for MockSession {
    async fn send(&mut self, request: Request<'_>, _timeout: Option<Duration>) -> Result<()> {
        if !self.conn.alive.load(Ordering::SeqCst) {
            return Err(broken_pipe());
        }
        let injected = self.shared.state.lock().fail_next_send.take();
        match injected {
            Some(InjectedFailure::Io) => return Err(broken_pipe()),
            Some(InjectedFailure::Fatal) => {
                return Err(Error::Fatal("mock server dropped the write".into()));
            }
            None => {}
        }
        self.attention.requested.store(false, Ordering::SeqCst);
        self.pending = Some(self.shared.execute(&self.conn, request));
        Ok(())
    }

    async fn drain(&mut self) -> Result<Vec<ResponseItem>> {
        let Some((items, delay)) = self.pending.take() else {
            return Ok(Vec::new());
        };
        if let Some(delay) = delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.attention.wait() => {
                    return Ok(vec![ResponseItem::Done {
                        kind: DoneKind::Done,
                        row_count: None,
                        attention: true,
                    }]);
                }
            }
        }
        if !self.conn.alive.load(Ordering::SeqCst) {
            return Err(broken_pipe());
        }
        Ok(items)
    }

    fn attention(&self) -> Arc<dyn Attention> {
        Arc::clone(&self.attention) as Arc<dyn Attention>
    }
}

struct MockLoopback {
    shared: Arc<Shared>,
}

#[async_trait]
impl LoopbackExecutor for MockLoopback {
    async fn execute(&self, request: Request<'_>) -> Result<Vec<ResponseItem>> {
        let (items, delay) = self.shared.execute(&self.shared.loopback, request);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(items)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_items_close_batches() {
        let items = MockResponse::empty().statement_items(false);
        assert!(matches!(
            items.as_slice(),
            [ResponseItem::Done {
                kind: DoneKind::Done,
                row_count: None,
                ..
            }]
        ));
        assert!(MockResponse::empty().statement_items(true).is_empty());
    }

    #[test]
    fn test_rows_count_as_affected() {
        let response = MockResponse::rows(
            ResultSet::new(["a"])
                .with_row(vec![ParamValue::Int(1)])
                .with_row(vec![ParamValue::Int(2)]),
        );
        let items = response.statement_items(true);
        assert!(matches!(
            items.last(),
            Some(ResponseItem::Done {
                row_count: Some(2),
                ..
            })
        ));
    }

    #[test]
    fn test_scripts_run_before_default() {
        let server = MockTdsServer::builder()
            .with_host("a", MockLogin::Accept)
            .with_script("a", [MockLogin::Unreachable])
            .build();
        assert!(matches!(server.shared.next_login("a"), MockLogin::Unreachable));
        assert!(matches!(server.shared.next_login("a"), MockLogin::Accept));
        assert!(matches!(server.shared.next_login("b"), MockLogin::Unreachable));
    }
}
