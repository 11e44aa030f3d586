//! Commands.
//!
//! A [`Command`] is a statement or stored procedure plus its parameters. It
//! is cheap to clone; clones share state, so a clone can be moved to another
//! task to cancel or inspect an execution.
//!
//! ```rust,ignore
//! let cmd = Command::new("UPDATE orders SET shipped = 1 WHERE id = @id")
//!     .with_param(Parameter::input("@id", SqlDbType::Int, 42));
//! cmd.prepare(&conn)?;
//! let result = cmd.execute_non_query(&conn).await?;
//! assert_eq!(result.rows_affected, 1);
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tds_rpc::{ParamValue, Parameter, ParameterCollection};
use tokio::task::JoinHandle;

use crate::blocking;
use crate::cancel::CancelHandle;
use crate::config::{ColumnEncryptionSetting, CommandKind};
use crate::connection::Connection;
use crate::engine::{self, Call, Snapshot};
use crate::error::{Error, Result};
use crate::prepared::{ConnectionCounters, ExecShape, PrepareState, PreparedStatement, Signature};
use crate::results::{BatchResults, ExecuteResult, RowStream};

/// The execution a command has in flight.
#[derive(Debug)]
struct PendingAsync {
    generation: u64,
    connection: Connection,
    close_count: u64,
}

impl PendingAsync {
    /// Still blocks new executions: the connection it ran on is alive and was
    /// not closed since.
    fn is_live(&self) -> bool {
        self.connection.is_usable() && self.connection.close_count() == self.close_count
    }
}

#[derive(Debug, Default)]
struct CommandState {
    text: String,
    kind: CommandKind,
    timeout: Option<Duration>,
    params: ParameterCollection,
    column_encryption: ColumnEncryptionSetting,
    prepared: PreparedStatement,
    bound: Option<Connection>,
    batch: Vec<Call>,
    pending: Option<PendingAsync>,
    generation: u64,
}

impl CommandState {
    fn signature(&self) -> Signature {
        Signature {
            text: self.text.clone(),
            shape: self.params.shape_signature(),
        }
    }
}

/// A SQL statement or stored procedure call.
#[derive(Clone, Default)]
pub struct Command {
    state: Arc<Mutex<CommandState>>,
    cancel: CancelHandle,
}

impl Command {
    /// A text command.
    pub fn new(text: impl Into<String>) -> Self {
        let command = Self::default();
        command.state.lock().text = text.into();
        command
    }

    /// A stored procedure call.
    pub fn procedure(name: impl Into<String>) -> Self {
        let command = Self::new(name);
        command.state.lock().kind = CommandKind::StoredProcedure;
        command
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(self, param: Parameter) -> Self {
        self.add_param(param);
        self
    }

    /// Replace the parameters.
    #[must_use]
    pub fn with_params(self, params: ParameterCollection) -> Self {
        self.set_params(params);
        self
    }

    /// Set the command timeout.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_timeout(Some(timeout));
        self
    }

    /// Set the column encryption override.
    #[must_use]
    pub fn with_column_encryption(self, setting: ColumnEncryptionSetting) -> Self {
        self.set_column_encryption(setting);
        self
    }

    /// Statement text or procedure name.
    #[must_use]
    pub fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    /// Replace the statement text. A prepared command becomes dirty.
    pub fn set_text(&self, text: impl Into<String>) {
        self.state.lock().text = text.into();
    }

    /// What the text is.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.state.lock().kind
    }

    /// Change what the text is.
    pub fn set_kind(&self, kind: CommandKind) {
        self.state.lock().kind = kind;
    }

    /// The command timeout; `None` falls back to the connection default.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.state.lock().timeout
    }

    /// Set the command timeout.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.state.lock().timeout = timeout;
    }

    /// A copy of the parameters, including written-back outputs.
    #[must_use]
    pub fn params(&self) -> ParameterCollection {
        self.state.lock().params.clone()
    }

    /// A copy of one parameter.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<Parameter> {
        self.state.lock().params.get(name).cloned()
    }

    /// Add a parameter.
    pub fn add_param(&self, param: Parameter) {
        self.state.lock().params.push(param);
    }

    /// Replace the parameters.
    pub fn set_params(&self, params: ParameterCollection) {
        self.state.lock().params = params;
    }

    /// Edit the parameters in place.
    pub fn update_params<R>(&self, edit: impl FnOnce(&mut ParameterCollection) -> R) -> R {
        edit(&mut self.state.lock().params)
    }

    /// The column encryption override.
    #[must_use]
    pub fn column_encryption(&self) -> ColumnEncryptionSetting {
        self.state.lock().column_encryption
    }

    /// Set the column encryption override.
    pub fn set_column_encryption(&self, setting: ColumnEncryptionSetting) {
        self.state.lock().column_encryption = setting;
    }

    /// Where the command is in its prepare cycle.
    #[must_use]
    pub fn prepare_state(&self) -> PrepareState {
        self.state.lock().prepared.state()
    }

    /// The server handle of the prepared statement.
    #[must_use]
    pub fn prepared_handle(&self) -> Option<i32> {
        self.state.lock().prepared.handle()
    }

    /// Whether the next execute on `conn` has to prepare again.
    #[must_use]
    pub fn is_dirty(&self, conn: &Connection) -> bool {
        let state = self.state.lock();
        state.prepared.is_dirty(&state.signature(), conn.counters())
    }

    /// A handle that cancels this command's executions.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancel the current execution.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Prepare on the next execute.
    ///
    /// Stored procedures and commands without parameters are never prepared;
    /// for them this only validates.
    pub fn prepare(&self, conn: &Connection) -> Result<()> {
        if !conn.is_usable() {
            return Err(Error::ConnectionClosed);
        }
        let stale = {
            let mut state = self.state.lock();
            if state.pending.as_ref().is_some_and(PendingAsync::is_live) {
                return Err(Error::PendingAsyncOperation);
            }
            if state.kind == CommandKind::Text && state.text.trim().is_empty() {
                return Err(Error::NoCommandText);
            }
            state
                .params
                .validate(state.kind == CommandKind::StoredProcedure)?;
            if state.kind == CommandKind::StoredProcedure || state.params.is_empty() {
                return Ok(());
            }
            let stale = Self::rebind_locked(&mut state, conn);
            let signature = state.signature();
            state.prepared.prepare(signature, conn.counters());
            stale
        };
        if let Some((previous, handle)) = stale {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(engine::release_stale(previous, handle));
                }
                Err(_) => {
                    tracing::debug!(handle, connection = previous.id(), "handle left behind on previous connection");
                }
            }
        }
        Ok(())
    }

    /// Release the prepared handle. A second call does nothing.
    pub async fn unprepare(&self, conn: &Connection) -> Result<()> {
        engine::unprepare(self.clone(), conn.clone()).await
    }

    /// Execute, returning rows affected and outputs.
    pub async fn execute_non_query(&self, conn: &Connection) -> Result<ExecuteResult> {
        self.begin_execute_non_query(conn)?.end().await
    }

    /// Execute, returning the result sets.
    pub async fn execute_query(&self, conn: &Connection) -> Result<RowStream> {
        self.begin_execute_query(conn)?.end().await
    }

    /// Start executing on the current runtime without waiting.
    ///
    /// Fails with [`Error::PendingAsyncOperation`] while another started
    /// execution of this command is unfinished.
    pub fn begin_execute_non_query(&self, conn: &Connection) -> Result<PendingExecution<ExecuteResult>> {
        self.begin(conn, |command, conn| async move {
            engine::execute(command, conn, false)
                .await
                .map(|executed| executed.result)
        })
    }

    /// Start a query on the current runtime without waiting.
    pub fn begin_execute_query(&self, conn: &Connection) -> Result<PendingExecution<RowStream>> {
        self.begin(conn, |command, conn| async move {
            engine::execute(command, conn, true)
                .await
                .map(|executed| RowStream::new(executed.result_sets, executed.result))
        })
    }

    /// Queue a text call for [`execute_batch`](Self::execute_batch).
    pub fn add_batch(&self, text: impl Into<String>, params: ParameterCollection) -> Result<()> {
        let setting = self.column_encryption();
        self.add_batch_call(text, CommandKind::Text, params, setting)
    }

    /// Queue a call of any kind. Its encryption setting must match the command's.
    pub fn add_batch_call(
        &self,
        text: impl Into<String>,
        kind: CommandKind,
        params: ParameterCollection,
        column_encryption: ColumnEncryptionSetting,
    ) -> Result<()> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(Error::NoCommandText);
        }
        params.validate(kind == CommandKind::StoredProcedure)?;
        let mut state = self.state.lock();
        if column_encryption != state.column_encryption {
            return Err(Error::InvalidOperation(
                "batched calls must share the command's column encryption setting".into(),
            ));
        }
        state.batch.push(Call { kind, text, params });
        Ok(())
    }

    /// Queued batch calls.
    #[must_use]
    pub fn batch_len(&self) -> usize {
        self.state.lock().batch.len()
    }

    /// Drop every queued batch call.
    pub fn clear_batch(&self) {
        self.state.lock().batch.clear();
    }

    /// Send every queued call in one request.
    ///
    /// Server errors do not fail the batch; they are reported per call in the
    /// returned [`BatchResults`].
    pub async fn execute_batch(&self, conn: &Connection) -> Result<BatchResults> {
        self.begin_execute_batch(conn)?.end().await
    }

    /// Start the batch on the current runtime without waiting.
    pub fn begin_execute_batch(&self, conn: &Connection) -> Result<PendingExecution<BatchResults>> {
        self.begin(conn, engine::execute_batch)
    }

    /// Blocking [`execute_non_query`](Self::execute_non_query).
    ///
    /// Fails with [`Error::BlockingInAsyncContext`] on a runtime thread.
    pub fn execute_non_query_blocking(&self, conn: &Connection) -> Result<ExecuteResult> {
        blocking::block_on(self.execute_non_query(conn))
    }

    /// Blocking [`execute_query`](Self::execute_query).
    pub fn execute_query_blocking(&self, conn: &Connection) -> Result<RowStream> {
        blocking::block_on(self.execute_query(conn))
    }

    /// Blocking [`execute_batch`](Self::execute_batch).
    pub fn execute_batch_blocking(&self, conn: &Connection) -> Result<BatchResults> {
        blocking::block_on(self.execute_batch(conn))
    }

    /// Blocking [`unprepare`](Self::unprepare).
    pub fn unprepare_blocking(&self, conn: &Connection) -> Result<()> {
        blocking::block_on(self.unprepare(conn))
    }

    fn begin<T, F, Fut>(&self, conn: &Connection, run: F) -> Result<PendingExecution<T>>
    where
        F: FnOnce(Command, Connection) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::InvalidOperation("asynchronous execution needs a tokio runtime".into())
        })?;
        let generation = {
            let mut state = self.state.lock();
            if let Some(pending) = &state.pending {
                if pending.is_live() {
                    return Err(Error::PendingAsyncOperation);
                }
                tracing::debug!(
                    generation = pending.generation,
                    "discarding state of an execution whose connection went away"
                );
            }
            // Clear stale cancels before the caller can issue a new one.
            self.cancel.reset();
            state.generation += 1;
            let generation = state.generation;
            state.pending = Some(PendingAsync {
                generation,
                connection: conn.clone(),
                close_count: conn.close_count(),
            });
            generation
        };
        let handle = runtime.spawn(run(self.clone(), conn.clone()));
        Ok(PendingExecution {
            handle: Some(handle),
            command: self.clone(),
            generation,
        })
    }

    fn clear_pending(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.pending.as_ref().is_some_and(|p| p.generation == generation) {
            state.pending = None;
        }
    }

    fn rebind_locked(state: &mut CommandState, conn: &Connection) -> Option<(Connection, i32)> {
        let previous = state.bound.replace(conn.clone());
        let (_, handle) = state.prepared.rebind(conn.counters())?;
        previous.map(|previous| (previous, handle))
    }

    pub(crate) fn cancel_handle_ref(&self) -> &CancelHandle {
        &self.cancel
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            call: Call {
                kind: state.kind,
                text: state.text.clone(),
                params: state.params.clone(),
            },
            batch: state.batch.clone(),
            column_encryption: state.column_encryption,
            timeout: state.timeout,
        }
    }

    /// Bind to `conn`, returning a handle left on the previously bound connection.
    pub(crate) fn rebind(&self, conn: &Connection) -> Option<(Connection, i32)> {
        Self::rebind_locked(&mut self.state.lock(), conn)
    }

    pub(crate) fn select_shape(&self, signature: Signature, counters: ConnectionCounters) -> ExecShape {
        self.state.lock().prepared.select_shape(signature, counters)
    }

    pub(crate) fn on_prepare_handle(&self, handle: i32) {
        self.state.lock().prepared.on_handle(handle);
    }

    pub(crate) fn finish_prepare(&self, succeeded: bool) {
        self.state.lock().prepared.finish(succeeded);
    }

    pub(crate) fn releasable_handle(&self, conn: &Connection) -> Option<i32> {
        self.state.lock().prepared.releasable_handle(conn.counters())
    }

    pub(crate) fn reset_prepare(&self) {
        self.state.lock().prepared.reset();
    }

    /// Store values the server sent back, by parameter index.
    pub(crate) fn write_outputs(&self, outputs: &[(usize, ParamValue)]) {
        let mut state = self.state.lock();
        let params = state.params.as_mut_slice();
        for (index, value) in outputs {
            if let Some(param) = params.get_mut(*index) {
                param.value = Some(value.clone());
            }
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Command")
            .field("text", &state.text)
            .field("kind", &state.kind)
            .field("params", &state.params.len())
            .field("prepare_state", &state.prepared.state())
            .field("batch", &state.batch.len())
            .finish()
    }
}

/// An execution started with one of the `begin_*` methods.
///
/// Dropping it without calling [`end`](Self::end) aborts the execution.
#[must_use = "dropping a pending execution aborts it"]
pub struct PendingExecution<T> {
    handle: Option<JoinHandle<Result<T>>>,
    command: Command,
    generation: u64,
}

impl<T> PendingExecution<T> {
    /// Whether the execution already finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the result.
    pub async fn end(mut self) -> Result<T> {
        let Some(handle) = self.handle.take() else {
            return Err(Error::InvalidOperation("execution already ended".into()));
        };
        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::OperationCancelled),
            Err(e) => Err(Error::Fatal(format!("execution task failed: {e}"))),
        };
        self.command.clear_pending(self.generation);
        result
    }
}

impl<T> Drop for PendingExecution<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.command.clear_pending(self.generation);
    }
}

impl<T> std::fmt::Debug for PendingExecution<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingExecution")
            .field("generation", &self.generation)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_rpc::SqlDbType;

    #[test]
    fn test_builders() {
        let cmd = Command::procedure("dbo.GetOrder")
            .with_param(Parameter::input("@id", SqlDbType::Int, 1))
            .with_timeout(Duration::from_secs(5));
        assert_eq!(cmd.kind(), CommandKind::StoredProcedure);
        assert_eq!(cmd.params().len(), 1);
        assert_eq!(cmd.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(cmd.prepare_state(), PrepareState::Unprepared);
    }

    #[test]
    fn test_clones_share_state() {
        let cmd = Command::new("SELECT 1");
        let other = cmd.clone();
        other.set_text("SELECT 2");
        assert_eq!(cmd.text(), "SELECT 2");
    }

    #[test]
    fn test_add_batch_rejects_mismatched_encryption() {
        let cmd = Command::new("").with_column_encryption(ColumnEncryptionSetting::Enabled);
        let err = cmd
            .add_batch_call(
                "UPDATE t SET a = 1",
                CommandKind::Text,
                ParameterCollection::new(),
                ColumnEncryptionSetting::Disabled,
            )
            .unwrap_err();
        assert!(err.is_usage_error());
        assert_eq!(cmd.batch_len(), 0);

        cmd.add_batch("UPDATE t SET a = 1", ParameterCollection::new())
            .unwrap();
        assert_eq!(cmd.batch_len(), 1);
        cmd.clear_batch();
        assert_eq!(cmd.batch_len(), 0);
    }

    #[test]
    fn test_add_batch_rejects_empty_text() {
        let cmd = Command::new("");
        assert!(matches!(
            cmd.add_batch("  ", ParameterCollection::new()),
            Err(Error::NoCommandText)
        ));
    }

    #[test]
    fn test_write_outputs_by_index() {
        let cmd = Command::new("q")
            .with_param(Parameter::input("@a", SqlDbType::Int, 1))
            .with_param(Parameter::input("@b", SqlDbType::Int, 2));
        cmd.write_outputs(&[(1, ParamValue::Int(9)), (5, ParamValue::Int(0))]);
        assert_eq!(cmd.param("@b").unwrap().value, Some(ParamValue::Int(9)));
    }
}
