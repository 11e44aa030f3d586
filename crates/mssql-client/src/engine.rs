//! The execution engine.
//!
//! One logical execute runs in this order:
//!
//! 1. validate the command and its connection;
//! 2. wait for a reconnection if the connection is broken and recoverable;
//! 3. open a channel: the in-process loopback executor when one is installed,
//!    otherwise a session leased from the connection;
//! 4. describe parameter encryption, when enabled and parameters exist;
//! 5. send the request, which is either a batch of RPCs, plain SQL text, or
//!    a single RPC shaped by the prepared-statement state;
//! 6. drain the response, write back output parameters, and return.
//!
//! The session lease lives in the channel and is returned when the channel is
//! dropped, on every path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tds_rpc::{
    ParamSource, ParamValue, ParameterCollection, ParameterDirection, ProcId, RpcError,
    RpcOptionFlags, RpcRequest, RpcTarget, required_slots,
};
use tokio::time::Instant;

use crate::cancel::CancelHandle;
use crate::command::Command;
use crate::config::{ColumnEncryptionSetting, CommandKind};
use crate::connection::{Connection, SessionLease};
use crate::encryption;
use crate::error::{Error, Result, ServerMessage};
use crate::prepared::{ExecShape, Signature};
use crate::results::{BatchItemResult, BatchResults, ExecuteResult, OutputParam, ResultSet};
use crate::transport::{Attention, DoneKind, LoopbackExecutor, Request, ResponseItem};

/// One call as the engine sends it: text or procedure name plus parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    pub kind: CommandKind,
    pub text: String,
    pub params: ParameterCollection,
}

impl Call {
    pub(crate) fn signature(&self) -> Signature {
        Signature {
            text: self.text.clone(),
            shape: self.params.shape_signature(),
        }
    }
}

/// What an execute works on, copied out of the command when it starts.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub call: Call,
    pub batch: Vec<Call>,
    pub column_encryption: ColumnEncryptionSetting,
    pub timeout: Option<Duration>,
}

/// Rows and outcome of a single execute.
#[derive(Debug, Default)]
pub(crate) struct Executed {
    pub result_sets: Vec<ResultSet>,
    pub result: ExecuteResult,
}

/// Where requests go.
pub(crate) enum Channel {
    /// In-process execution.
    Loopback(Arc<dyn LoopbackExecutor>),
    /// A leased network session.
    Session(SessionLease),
}

impl Channel {
    /// Send a request and read its whole response.
    ///
    /// The wire write happens under the connection lock; a fatal write error
    /// closes the connection while still holding it.
    pub(crate) async fn round_trip(
        &mut self,
        conn: &Connection,
        request: Request<'_>,
        timeout: Option<Duration>,
    ) -> Result<Vec<ResponseItem>> {
        let items = match self {
            Self::Loopback(executor) => executor.execute(request).await?,
            Self::Session(lease) => {
                lease.set_in_flight(true);
                {
                    let token = conn.lock().acquire().await;
                    let sent = lease.session()?.send(request, timeout).await;
                    if let Err(e) = &sent {
                        if !e.is_catchable() {
                            conn.doom_with(Some(&token)).await;
                        }
                    }
                    sent?;
                }
                let items = lease.session()?.drain().await?;
                lease.set_in_flight(false);
                items
            }
        };
        conn.apply_response_state(&items);
        Ok(items)
    }

    /// Whether requests leave the process.
    fn is_remote(&self) -> bool {
        matches!(self, Self::Session(_))
    }

    fn attention(&mut self) -> Result<Option<Arc<dyn Attention>>> {
        match self {
            Self::Loopback(_) => Ok(None),
            Self::Session(lease) => Ok(Some(lease.session()?.attention())),
        }
    }
}

/// Split server messages into errors and warnings.
pub(crate) fn collect_errors(items: &[ResponseItem]) -> (Vec<ServerMessage>, Vec<ServerMessage>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for item in items {
        match item {
            ResponseItem::Error(m) if m.is_error() => errors.push(m.clone()),
            ResponseItem::Error(m) | ResponseItem::Info(m) => warnings.push(m.clone()),
            _ => {}
        }
    }
    (errors, warnings)
}

/// A parameter or return value the server sent back, by call and slot.
#[derive(Debug, Clone, PartialEq)]
struct Returned {
    call: usize,
    ordinal: usize,
    name: String,
    value: ParamValue,
}

/// A drained response, folded.
#[derive(Debug, Default)]
struct Processed {
    result_sets: Vec<ResultSet>,
    errors: Vec<ServerMessage>,
    warnings: Vec<ServerMessage>,
    rows_affected: i64,
    return_status: Option<i32>,
    returned: Vec<Returned>,
    attention: bool,
}

/// Fold response items, recording per-call bookkeeping on `rpcs`.
///
/// Rows affected accumulate over every done token that carries a count,
/// starting from `-1` (nothing counted). Each procedure end closes the
/// current call: it records the running total and the call's own share,
/// plus the ranges of errors and warnings raised since the previous call.
fn process(items: Vec<ResponseItem>, rpcs: &mut [RpcRequest]) -> Processed {
    let mut out = Processed {
        rows_affected: -1,
        ..Processed::default()
    };
    let mut current = 0usize;
    let mut previous_total = -1i64;
    let mut error_start = 0usize;
    let mut warning_start = 0usize;

    for item in items {
        match item {
            ResponseItem::ResultSet(set) => out.result_sets.push(set),
            ResponseItem::Done {
                kind,
                row_count,
                attention,
            } => {
                out.attention |= attention;
                if let Some(count) = row_count {
                    let count = i64::try_from(count).unwrap_or(i64::MAX);
                    out.rows_affected = if out.rows_affected < 0 {
                        count
                    } else {
                        out.rows_affected.saturating_add(count)
                    };
                }
                if kind == DoneKind::DoneProc {
                    if let Some(rpc) = rpcs.get_mut(current) {
                        let total = out.rows_affected;
                        rpc.cumulative_records_affected = total;
                        rpc.records_affected = Some(if current > 0 && total >= 0 {
                            total - previous_total.max(0)
                        } else {
                            total
                        });
                        rpc.errors = error_start..out.errors.len();
                        rpc.warnings = warning_start..out.warnings.len();
                        previous_total = total;
                        error_start = out.errors.len();
                        warning_start = out.warnings.len();
                    }
                    current += 1;
                }
            }
            ResponseItem::ReturnValue {
                ordinal,
                name,
                value,
            } => out.returned.push(Returned {
                call: current,
                ordinal,
                name,
                value,
            }),
            ResponseItem::ReturnStatus(status) => out.return_status = Some(status),
            ResponseItem::Error(m) if m.is_error() => out.errors.push(m),
            ResponseItem::Error(m) | ResponseItem::Info(m) => out.warnings.push(m),
            ResponseItem::EnvChange(_) | ResponseItem::SessionState(_) => {}
        }
    }
    out
}

/// Acquire an RPC from the pool and fill it, returning it to the pool on failure.
fn pooled(
    conn: &Connection,
    target: &RpcTarget,
    call: &Call,
    build: impl FnOnce(&mut RpcRequest) -> std::result::Result<(), RpcError>,
) -> Result<RpcRequest> {
    let mut rpc = conn
        .rpc_pool()
        .acquire(required_slots(target, call.params.as_slice()));
    match build(&mut rpc) {
        Ok(()) => Ok(rpc),
        Err(e) => {
            conn.rpc_pool().release(rpc);
            Err(e.into())
        }
    }
}

/// Validate, rebind, and wait out any reconnection.
///
/// Returns the snapshot and the time left of the command timeout.
async fn prologue(command: &Command, conn: &Connection, batch: bool) -> Result<(Snapshot, Option<Duration>)> {
    let started = Instant::now();
    let snapshot = command.snapshot();

    if batch {
        if snapshot.batch.is_empty() {
            return Err(Error::InvalidOperation("the batch is empty".into()));
        }
        for call in &snapshot.batch {
            call.params
                .validate(call.kind == CommandKind::StoredProcedure)?;
        }
    } else {
        if snapshot.call.text.trim().is_empty() {
            return Err(Error::NoCommandText);
        }
        snapshot
            .call
            .params
            .validate(snapshot.call.kind == CommandKind::StoredProcedure)?;
    }
    if !conn.is_usable() {
        return Err(Error::ConnectionClosed);
    }

    if let Some((previous, handle)) = command.rebind(conn) {
        release_stale(previous, handle).await;
    }

    let timeout = snapshot.timeout.or(conn.config().command_timeout);
    wait_for_reconnect(conn, timeout, command.cancel_handle_ref()).await?;
    let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
    Ok((snapshot, remaining))
}

async fn wait_for_reconnect(
    conn: &Connection,
    timeout: Option<Duration>,
    cancel: &CancelHandle,
) -> Result<()> {
    let Some(reconnect) = conn.validate_and_reconnect(timeout)? else {
        return Ok(());
    };
    tracing::debug!(connection = conn.id(), "waiting for reconnection");
    let expiry = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        result = reconnect => result,
        () = cancel.cancelled() => Err(Error::OperationCancelled),
        () = expiry => Err(Error::ReconnectTimeout),
    }
}

/// Open the channel an execute runs on, honoring pending cancellation.
fn open_channel(command: &Command, conn: &Connection) -> Result<Channel> {
    let cancel = command.cancel_handle_ref();
    if cancel.is_cancel_requested() {
        return Err(Error::OperationCancelled);
    }
    if let Some(executor) = conn.loopback() {
        tracing::debug!(strategy = "loopback", "executing in process");
        return Ok(Channel::Loopback(Arc::clone(executor)));
    }
    let lease = conn.acquire_session()?;
    // A cancel may have landed between the check and the lease.
    if cancel.is_cancel_requested() {
        return Err(Error::OperationCancelled);
    }
    Ok(Channel::Session(lease))
}

/// Bound `work` by the command timeout, sending an attention when it expires.
async fn within<T>(
    timeout: Option<Duration>,
    attention: Option<&Arc<dyn Attention>>,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let Some(limit) = timeout else {
        return work.await;
    };
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => {
            if let Some(attention) = attention {
                attention.send_attention();
            }
            tracing::warn!(timeout_ms = limit.as_millis() as u64, "command timed out");
            Err(Error::CommandTimeout)
        }
    }
}

/// Doom the connection after an error that skips ordinary cleanup.
fn conclude<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if !e.is_catchable() {
            conn.doom();
        }
    }
    result
}

/// Run one command: strategies 1, 2, 4, and 5.
pub(crate) async fn execute(command: Command, conn: Connection, want_rows: bool) -> Result<Executed> {
    let (mut snapshot, timeout) = prologue(&command, &conn, false).await?;
    let mut channel = open_channel(&command, &conn)?;
    let attention = channel.attention()?;
    let _binding = attention
        .clone()
        .map(|a| command.cancel_handle_ref().bind(a));

    let result = within(
        timeout,
        attention.as_ref(),
        execute_on(&command, &conn, &mut channel, &mut snapshot, want_rows, timeout),
    )
    .await;
    command.finish_prepare(result.is_ok());
    conclude(&conn, result)
}

async fn execute_on(
    command: &Command,
    conn: &Connection,
    channel: &mut Channel,
    snapshot: &mut Snapshot,
    want_rows: bool,
    timeout: Option<Duration>,
) -> Result<Executed> {
    let call = &mut snapshot.call;
    call.params.clear_cipher_metadata();
    if !call.params.is_empty()
        && channel.is_remote()
        && snapshot
            .column_encryption
            .describes_parameters(conn.config().column_encryption)
    {
        encryption::describe_and_apply(conn, channel, std::slice::from_mut(call), timeout).await?;
    }
    let call = &snapshot.call;

    let mut rpcs = Vec::with_capacity(1);
    let request = if call.kind == CommandKind::Text && call.params.is_empty() {
        tracing::debug!(strategy = "sql-batch", "sending statement text");
        Request::Batch(&call.text)
    } else {
        rpcs.push(build_call(command, conn, call, want_rows)?);
        Request::Rpc(&rpcs)
    };

    let items = channel.round_trip(conn, request, timeout).await;
    let outcome = items.and_then(|items| {
        let processed = process(items, &mut rpcs);
        finish_single(command, call, &rpcs, processed)
    });
    conn.rpc_pool().release_all(rpcs);
    outcome
}

/// Build the RPC for a single call, consulting the prepared state for text.
fn build_call(command: &Command, conn: &Connection, call: &Call, want_rows: bool) -> Result<RpcRequest> {
    let params = call.params.as_slice();
    if call.kind == CommandKind::StoredProcedure {
        tracing::debug!(strategy = "rpc", procedure = %call.text, "calling stored procedure");
        let target = RpcTarget::Name(call.text.clone());
        return pooled(conn, &target, call, |rpc| rpc.build_named(&call.text, params));
    }

    match command.select_shape(call.signature(), conn.counters()) {
        ExecShape::ExecuteSql => {
            tracing::debug!(strategy = "rpc", shape = "executesql", "sending parameterized text");
            pooled(conn, &RpcTarget::Id(ProcId::ExecuteSql), call, |rpc| {
                rpc.build_execute_sql(&call.text, params)
            })
        }
        ExecShape::PrepExec { previous } => {
            tracing::debug!(strategy = "rpc", shape = "prepexec", previous, "preparing and executing");
            pooled(conn, &RpcTarget::Id(ProcId::PrepExec), call, |rpc| {
                rpc.build_prep_exec(previous, &call.text, params)
            })
        }
        ExecShape::Execute { handle } => {
            tracing::debug!(strategy = "rpc", shape = "execute", handle, "executing prepared statement");
            pooled(conn, &RpcTarget::Id(ProcId::Execute), call, |rpc| {
                rpc.build_execute(handle, params)?;
                if !want_rows {
                    rpc.set_options(RpcOptionFlags::NO_METADATA);
                }
                Ok(())
            })
        }
    }
}

/// Turn a processed single-call response into the caller's result.
fn finish_single(
    command: &Command,
    call: &Call,
    rpcs: &[RpcRequest],
    processed: Processed,
) -> Result<Executed> {
    if processed.attention {
        return Err(Error::OperationCancelled);
    }

    // The prep-exec handle comes back even when the statement itself failed.
    let mut outputs = Vec::new();
    for returned in &processed.returned {
        let source = rpcs
            .get(returned.call)
            .and_then(|rpc| rpc.param(returned.ordinal).map(|p| (rpc, p.source)));
        match source {
            Some((rpc, ParamSource::System)) => {
                if rpc.target() == Some(&RpcTarget::Id(ProcId::PrepExec)) && returned.ordinal == 0 {
                    if let Some(handle) = returned.value.as_i64().and_then(|h| i32::try_from(h).ok()) {
                        command.on_prepare_handle(handle);
                    }
                }
            }
            Some((_, ParamSource::User(index))) => outputs.push((index, returned.value.clone())),
            None => {
                if let Some(index) = call.params.position(&returned.name) {
                    outputs.push((index, returned.value.clone()));
                }
            }
        }
    }

    if let Some(first) = processed.errors.first() {
        let mut messages = processed.errors.clone();
        messages.extend(processed.warnings.iter().cloned());
        return Err(Error::server(first, messages));
    }

    if let Some(status) = processed.return_status {
        if let Some(index) = call
            .params
            .iter()
            .position(|p| p.direction == ParameterDirection::ReturnValue)
        {
            outputs.push((index, ParamValue::Int(i64::from(status))));
        }
    }
    command.write_outputs(&outputs);

    let output_params = outputs
        .iter()
        .filter_map(|(index, value)| {
            call.params.as_slice().get(*index).map(|p| OutputParam {
                name: p.name.clone(),
                value: value.clone(),
            })
        })
        .collect();

    Ok(Executed {
        result_sets: processed.result_sets,
        result: ExecuteResult {
            rows_affected: processed.rows_affected,
            output_params,
            return_status: processed.return_status,
            warnings: processed.warnings,
        },
    })
}

/// Run the queued batch as one request of RPCs.
pub(crate) async fn execute_batch(command: Command, conn: Connection) -> Result<BatchResults> {
    let (mut snapshot, timeout) = prologue(&command, &conn, true).await?;
    let mut channel = open_channel(&command, &conn)?;
    let attention = channel.attention()?;
    let _binding = attention
        .clone()
        .map(|a| command.cancel_handle_ref().bind(a));

    let result = within(
        timeout,
        attention.as_ref(),
        batch_on(&conn, &mut channel, &mut snapshot, timeout),
    )
    .await;
    conclude(&conn, result)
}

async fn batch_on(
    conn: &Connection,
    channel: &mut Channel,
    snapshot: &mut Snapshot,
    timeout: Option<Duration>,
) -> Result<BatchResults> {
    for call in &mut snapshot.batch {
        call.params.clear_cipher_metadata();
    }
    if channel.is_remote()
        && snapshot
            .column_encryption
            .describes_parameters(conn.config().column_encryption)
    {
        encryption::describe_and_apply(conn, channel, &mut snapshot.batch, timeout).await?;
    }

    tracing::debug!(strategy = "batch-rpc", items = snapshot.batch.len(), "sending batch");
    let mut rpcs = Vec::with_capacity(snapshot.batch.len());
    for call in &snapshot.batch {
        let params = call.params.as_slice();
        let built = match call.kind {
            CommandKind::Text => pooled(conn, &RpcTarget::Id(ProcId::ExecuteSql), call, |rpc| {
                rpc.build_execute_sql(&call.text, params)
            }),
            CommandKind::StoredProcedure => {
                let target = RpcTarget::Name(call.text.clone());
                pooled(conn, &target, call, |rpc| rpc.build_named(&call.text, params))
            }
        };
        match built {
            Ok(rpc) => rpcs.push(rpc),
            Err(e) => {
                conn.rpc_pool().release_all(rpcs);
                return Err(e);
            }
        }
    }

    let items = channel.round_trip(conn, Request::Rpc(&rpcs), timeout).await;
    let outcome = items.and_then(|items| {
        let processed = process(items, &mut rpcs);
        if processed.attention {
            return Err(Error::OperationCancelled);
        }
        let error_end = processed.errors.len();
        let warning_end = processed.warnings.len();
        let results = rpcs
            .iter()
            .map(|rpc| match rpc.records_affected {
                Some(records_affected) => BatchItemResult {
                    records_affected,
                    cumulative_records_affected: rpc.cumulative_records_affected,
                    errors: rpc.errors.clone(),
                    warnings: rpc.warnings.clone(),
                },
                None => BatchItemResult {
                    records_affected: -1,
                    cumulative_records_affected: -1,
                    errors: error_end..error_end,
                    warnings: warning_end..warning_end,
                },
            })
            .collect();
        Ok(BatchResults::new(results, processed.errors, processed.warnings))
    });
    conn.rpc_pool().release_all(rpcs);
    outcome
}

/// Release a prepared handle.
pub(crate) async fn unprepare(command: Command, conn: Connection) -> Result<()> {
    command.cancel_handle_ref().reset();
    if !conn.is_usable() {
        return Err(Error::ConnectionClosed);
    }
    let Some(handle) = command.releasable_handle(&conn) else {
        command.reset_prepare();
        return Ok(());
    };
    let timeout = command.timeout().or(conn.config().command_timeout);
    let result = send_unprepare(&conn, handle, timeout).await;
    command.reset_prepare();
    tracing::debug!(handle, ok = result.is_ok(), "statement unprepared");
    conclude(&conn, result)
}

/// Best-effort release of a handle on the connection a command moved away from.
pub(crate) async fn release_stale(previous: Connection, handle: i32) {
    if !previous.is_usable() {
        return;
    }
    if let Err(e) = send_unprepare(&previous, handle, None).await {
        tracing::debug!(handle, error = %e, "releasing handle on previous connection failed");
    }
}

async fn send_unprepare(conn: &Connection, handle: i32, timeout: Option<Duration>) -> Result<()> {
    let call = Call {
        kind: CommandKind::Text,
        text: String::new(),
        params: ParameterCollection::new(),
    };
    let rpc = pooled(conn, &RpcTarget::Id(ProcId::Unprepare), &call, |rpc| {
        rpc.build_unprepare(handle)
    })?;
    let result = async {
        let mut channel = match conn.loopback() {
            Some(executor) => Channel::Loopback(Arc::clone(executor)),
            None => Channel::Session(conn.acquire_session()?),
        };
        let attention = channel.attention()?;
        within(timeout, attention.as_ref(), async {
            let items = channel
                .round_trip(conn, Request::Rpc(std::slice::from_ref(&rpc)), timeout)
                .await?;
            let (errors, _) = collect_errors(&items);
            match errors.first() {
                Some(first) => Err(Error::server(first, errors.clone())),
                None => Ok(()),
            }
        })
        .await
    }
    .await;
    conn.rpc_pool().release(rpc);
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn done(kind: DoneKind, count: Option<u64>) -> ResponseItem {
        ResponseItem::Done {
            kind,
            row_count: count,
            attention: false,
        }
    }

    fn rpcs(n: usize) -> Vec<RpcRequest> {
        (0..n).map(|_| RpcRequest::with_capacity(2)).collect()
    }

    #[test]
    fn test_rows_affected_starts_unset() {
        let processed = process(vec![done(DoneKind::Done, None)], &mut []);
        assert_eq!(processed.rows_affected, -1);

        let processed = process(
            vec![done(DoneKind::DoneInProc, Some(2)), done(DoneKind::Done, Some(3))],
            &mut [],
        );
        assert_eq!(processed.rows_affected, 5);
    }

    #[test]
    fn test_batch_slices() {
        let mut calls = rpcs(3);
        let items = vec![
            done(DoneKind::DoneInProc, Some(4)),
            done(DoneKind::DoneProc, None),
            ResponseItem::Error(ServerMessage::new(547, 16, "constraint")),
            done(DoneKind::DoneProc, None),
            done(DoneKind::DoneInProc, Some(2)),
            ResponseItem::Info(ServerMessage::new(0, 0, "note")),
            done(DoneKind::DoneProc, None),
        ];
        let processed = process(items, &mut calls);

        assert_eq!(calls[0].records_affected, Some(4));
        assert_eq!(calls[1].records_affected, Some(0));
        assert_eq!(calls[2].records_affected, Some(2));
        assert_eq!(calls[2].cumulative_records_affected, 6);
        assert_eq!(calls[1].errors, 0..1);
        assert_eq!(calls[2].errors, 1..1);
        assert_eq!(calls[2].warnings, 0..1);
        assert_eq!(processed.errors.len(), 1);
    }

    #[test]
    fn test_return_values_are_tagged_with_their_call() {
        let items = vec![
            ResponseItem::ReturnValue {
                ordinal: 0,
                name: String::new(),
                value: ParamValue::Int(9),
            },
            done(DoneKind::DoneProc, None),
            ResponseItem::ReturnStatus(3),
        ];
        let processed = process(items, &mut rpcs(1));
        assert_eq!(processed.returned[0].call, 0);
        assert_eq!(processed.return_status, Some(3));
    }

    #[test]
    fn test_collect_errors_splits_by_class() {
        let items = vec![
            ResponseItem::Error(ServerMessage::new(1, 16, "bad")),
            ResponseItem::Error(ServerMessage::new(2, 10, "low")),
            ResponseItem::Info(ServerMessage::new(3, 0, "info")),
        ];
        let (errors, warnings) = collect_errors(&items);
        assert_eq!(errors.len(), 1);
        assert_eq!(warnings.len(), 2);
    }
}
